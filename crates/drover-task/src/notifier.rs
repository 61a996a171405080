//! Status-change notifications.
//!
//! Notifications are fire-and-forget: the task manager logs a failed
//! delivery and carries on.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use drover_config::NotificationConfig;
use drover_types::TaskStatus;

use crate::error::{Result, TaskError};

/// What a notification says about a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSummary {
    pub tid: String,
    pub name: Option<String>,
    pub environment: Option<String>,
    pub task_dir: PathBuf,
    pub execution_dir: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, status: TaskStatus, summary: &TaskSummary) -> Result<()>;
}

/// Logs each transition and nothing else.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, status: TaskStatus, summary: &TaskSummary) -> Result<()> {
        info!(tid = %summary.tid, status = %status, "Task status changed");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mail
// ─────────────────────────────────────────────────────────────────────────────

/// Pipes an HTML email into the configured mail program (`sendmail -t`).
#[derive(Debug, Clone)]
pub struct MailNotifier {
    config: NotificationConfig,
}

impl MailNotifier {
    pub fn new(config: NotificationConfig) -> Self {
        Self { config }
    }

    /// The full message, headers included.
    pub fn render(&self, status: TaskStatus, summary: &TaskSummary) -> String {
        let recipients: Vec<&str> = self
            .config
            .email
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .collect();
        format!(
            "Content-Type: text/html\nTo: {}\nFrom: {}\nSubject: {} status to {}\n\n{}",
            recipients.join("; "),
            self.config.from_email,
            summary.tid,
            status,
            status_body(status, summary)
        )
    }
}

fn status_body(status: TaskStatus, summary: &TaskSummary) -> String {
    let name = summary.name.as_deref().unwrap_or("workflow");
    let mut items = vec![format!(
        "<li>Task directory: <code>{}</code></li>",
        summary.task_dir.display()
    )];
    if let Some(dir) = &summary.execution_dir {
        items.push(format!("<li>Execution directory: <code>{dir}</code></li>"));
    }
    if let Some(env) = &summary.environment {
        items.push(format!("<li>Environment: {env}</li>"));
    }
    if let Some(error) = &summary.error {
        items.push(format!("<li>Error: <pre>{error}</pre></li>"));
    }
    format!(
        "<h1>Status change: {status}</h1>\n\n<p>\n    The workflow '{name}' ({tid}) moved to the '{status}' status.\n</p>\n<ul>\n    {items}\n</ul>\n",
        tid = summary.tid,
        items = items.join("\n    "),
    )
}

#[async_trait]
impl Notifier for MailNotifier {
    async fn notify(&self, status: TaskStatus, summary: &TaskSummary) -> Result<()> {
        if !self.config.is_enabled() {
            debug!(tid = %summary.tid, "Skipping status email: no mail program or recipients");
            return Ok(());
        }
        let Some(program) = self.config.mail_program.as_deref() else {
            return Ok(());
        };

        let message = self.render(status, summary);
        debug!(tid = %summary.tid, program = %program, "Sending status email");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TaskError::Notification(format!("failed to spawn '{program}': {e}")))?;

        // Dropping stdin closes the pipe so the program sees EOF.
        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(message.as_bytes()).await
        {
            // The exit status below says more than a broken pipe does.
            debug!(tid = %summary.tid, error = %e, "Mail program stopped reading");
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(TaskError::Notification(format!(
                "'{program}' exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> TaskSummary {
        TaskSummary {
            tid: "abc123".into(),
            name: Some("hello".into()),
            environment: Some("local".into()),
            task_dir: PathBuf::from("/tasks/abc123"),
            execution_dir: None,
            error: None,
        }
    }

    fn config(program: Option<&str>, email: &[&str]) -> NotificationConfig {
        NotificationConfig {
            mail_program: program.map(String::from),
            email: email.iter().map(|e| e.to_string()).collect(),
            from_email: "drover@example.org".into(),
        }
    }

    #[test]
    fn test_render_headers_and_body() {
        let notifier = MailNotifier::new(config(Some("sendmail -t"), &["a@x.org", " ", "b@x.org"]));
        let mail = notifier.render(TaskStatus::Completed, &summary());

        assert!(mail.starts_with("Content-Type: text/html\nTo: a@x.org; b@x.org\n"));
        assert!(mail.contains("From: drover@example.org"));
        assert!(mail.contains("Subject: abc123 status to completed"));
        assert!(mail.contains("The workflow 'hello' (abc123) moved to the 'completed' status."));
        assert!(mail.contains("<code>/tasks/abc123</code>"));
    }

    #[tokio::test]
    async fn test_disabled_is_a_no_op() {
        let notifier = MailNotifier::new(config(None, &["a@x.org"]));
        notifier.notify(TaskStatus::Running, &summary()).await.unwrap();

        let notifier = MailNotifier::new(config(Some("false"), &[]));
        notifier.notify(TaskStatus::Running, &summary()).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mail_is_piped_to_program() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = dir.path().join("mail.txt");
        let program = format!("cat > '{}'", sink.display());
        let notifier = MailNotifier::new(config(Some(&program), &["a@x.org"]));

        notifier.notify(TaskStatus::Failed, &summary()).await.unwrap();
        let sent = std::fs::read_to_string(&sink).unwrap();
        assert!(sent.contains("Subject: abc123 status to failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_program_is_reported() {
        let notifier = MailNotifier::new(config(Some("exit 4"), &["a@x.org"]));
        let err = notifier
            .notify(TaskStatus::Failed, &summary())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Notification(_)));
    }
}
