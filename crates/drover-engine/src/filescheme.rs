//! Transports that bring output files from where the engine ran into the
//! task's `outputs/` directory.
//!
//! Every copy lands atomically: data is written to a hidden temporary path
//! next to the destination and renamed into place, so a failed copy never
//! leaves a partial file at the destination.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::FileSchemeError;

/// Result type for file scheme operations.
pub type Result<T> = std::result::Result<T, FileSchemeError>;

/// Extra options for a single copy.
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Arguments passed through to the transport command (e.g. `-P 2222`).
    pub extra_args: Vec<String>,
}

/// Copies one file or directory tree to a local destination.
#[async_trait]
pub trait FileScheme: Send + Sync {
    fn id(&self) -> &str;

    /// Copy `source` (engine-native location) to `dest`, replacing any
    /// existing file or directory there.
    async fn copy(&self, source: &str, dest: &Path, options: &CopyOptions) -> Result<()>;
}

/// Strip a `file://` scheme from an engine location.
pub fn local_path(location: &str) -> &str {
    location.strip_prefix("file://").unwrap_or(location)
}

/// A sibling path of `dest` that a copy writes before renaming.
fn staging_path(dest: &Path) -> Result<PathBuf> {
    let name = dest
        .file_name()
        .ok_or_else(|| FileSchemeError::InvalidLocation(dest.display().to_string()))?;
    let staging = format!(
        ".{}.partial-{}",
        name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    );
    Ok(dest.with_file_name(staging))
}

/// Move a fully written staging path over `dest`.
fn promote(staging: &Path, dest: &Path) -> Result<()> {
    if dest.is_dir() {
        std::fs::remove_dir_all(dest).map_err(|e| FileSchemeError::io(dest, e))?;
    }
    std::fs::rename(staging, dest).map_err(|e| FileSchemeError::io(dest, e))
}

fn discard(staging: &Path) {
    let _ = if staging.is_dir() {
        std::fs::remove_dir_all(staging)
    } else {
        std::fs::remove_file(staging)
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Local
// ─────────────────────────────────────────────────────────────────────────────

/// Same-filesystem copy.
#[derive(Debug, Clone, Default)]
pub struct LocalFileScheme;

impl LocalFileScheme {
    pub fn new() -> Self {
        Self
    }
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| FileSchemeError::InvalidLocation(entry.path().display().to_string()))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| FileSchemeError::io(&target, e))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| FileSchemeError::io(&target, e))?;
        }
    }
    Ok(())
}

fn copy_local(source: &Path, dest: &Path) -> Result<()> {
    let metadata = std::fs::metadata(source).map_err(|e| FileSchemeError::io(source, e))?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| FileSchemeError::io(parent, e))?;
    }

    let staging = staging_path(dest)?;
    let copied = if metadata.is_dir() {
        copy_tree(source, &staging)
    } else {
        std::fs::copy(source, &staging)
            .map(|_| ())
            .map_err(|e| FileSchemeError::io(source, e))
    };

    match copied.and_then(|()| promote(&staging, dest)) {
        Ok(()) => Ok(()),
        Err(e) => {
            discard(&staging);
            Err(e)
        }
    }
}

#[async_trait]
impl FileScheme for LocalFileScheme {
    fn id(&self) -> &str {
        "local"
    }

    async fn copy(&self, source: &str, dest: &Path, _options: &CopyOptions) -> Result<()> {
        let source = PathBuf::from(local_path(source));
        let dest = dest.to_path_buf();
        debug!(source = %source.display(), dest = %dest.display(), "Copying output");
        tokio::task::spawn_blocking(move || copy_local(&source, &dest))
            .await
            .map_err(|e| FileSchemeError::Transfer {
                source_location: "local copy".into(),
                message: e.to_string(),
            })?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SSH
// ─────────────────────────────────────────────────────────────────────────────

/// `scp` from a host alias configured in the user's SSH config.
#[derive(Debug, Clone)]
pub struct SshFileScheme {
    host: String,
    program: String,
}

impl SshFileScheme {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            program: "scp".to_string(),
        }
    }

    /// Use a different copy program with scp-compatible arguments.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn remote(&self, source: &str) -> String {
        format!("{}:{}", self.host, local_path(source))
    }
}

#[async_trait]
impl FileScheme for SshFileScheme {
    fn id(&self) -> &str {
        "ssh"
    }

    async fn copy(&self, source: &str, dest: &Path, options: &CopyOptions) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FileSchemeError::io(parent, e))?;
        }
        let staging = staging_path(dest)?;
        let remote = self.remote(source);
        debug!(source = %remote, dest = %dest.display(), "Copying output over ssh");

        let output = Command::new(&self.program)
            .arg("-r")
            .args(&options.extra_args)
            .arg(&remote)
            .arg(&staging)
            .output()
            .await
            .map_err(|e| FileSchemeError::Transfer {
                source_location: remote.clone(),
                message: format!("failed to run {}: {e}", self.program),
            })?;

        if !output.status.success() {
            discard(&staging);
            return Err(FileSchemeError::Transfer {
                source_location: remote,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        promote(&staging, dest).inspect_err(|_| discard(&staging))
    }
}
