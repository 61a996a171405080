//! Task status and its terminal subset.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle status of a task as observed from its engine.
///
/// `Completed`, `Failed` and `Aborted` are terminal: once one of them has been
/// persisted for a task, the store refuses any further status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Processing,
    Queued,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Processing,
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Aborted,
    ];

    /// The terminal subset.
    pub const TERMINAL: [TaskStatus; 3] =
        [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Aborted];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Aborted
        )
    }

    /// Terminal success; the only state in which outputs may be fetched.
    pub fn is_success(self) -> bool {
        self == TaskStatus::Completed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Processing => "processing",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_subset() {
        for status in TaskStatus::ALL {
            assert_eq!(
                status.is_terminal(),
                TaskStatus::TERMINAL.contains(&status),
                "{status}"
            );
        }
        assert!(TaskStatus::Completed.is_success());
        assert!(!TaskStatus::Failed.is_success());
    }

    #[test]
    fn test_parse_display_agree() {
        for status in TaskStatus::ALL {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!("RUNNING".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
        assert!(matches!(
            "suspended".parse::<TaskStatus>(),
            Err(Error::UnknownStatus(_))
        ));
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Aborted).unwrap();
        assert_eq!(json, "\"aborted\"");
    }
}
