//! Output copy policies built on [`FileScheme::copy`].
//!
//! An output named `bam` lands at `outputs/bam.<ext>`. Shards of an output
//! named `reads` land at `outputs/readsshard-<i>.<ext>`. Secondary files
//! reuse the primary's stem with their own extension, so `bam` with an
//! index lands as `bam.bam` plus `bam.bam.bai`.

use std::path::{Path, PathBuf};

use tracing::debug;

use drover_types::OutputValue;

use crate::error::FileSchemeError;
use crate::filescheme::{CopyOptions, FileScheme, Result};

/// Infix between an output's stem and its shard index.
pub const SHARD_INFIX: &str = "shard-";

/// Files produced by copying one output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopiedOutput {
    /// Where the output as a whole is recorded: the file for a single or
    /// primary output, the shared stem for a sharded one.
    pub primary: Option<PathBuf>,
    pub files: Vec<PathBuf>,
}

/// Extension of a location's file name: everything after the first dot.
///
/// `sample.bam.bai` gives `bam.bai`; a leading dot (hidden file) is not an
/// extension separator.
pub fn extension_of(location: &str) -> Option<&str> {
    let name = location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(location);
    let name = name.split(['?', '#']).next().unwrap_or(name);
    let body = name.strip_prefix('.').unwrap_or(name);
    body.split_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
}

/// `stem` plus the extension derived from `location`.
fn destination(stem: &Path, location: &str) -> PathBuf {
    match extension_of(location) {
        Some(ext) => {
            let mut name = stem.as_os_str().to_owned();
            name.push(".");
            name.push(ext);
            PathBuf::from(name)
        }
        None => stem.to_path_buf(),
    }
}

fn suffixed(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn shard_stem(stem: &Path, index: usize) -> PathBuf {
    suffixed(stem, &format!("{SHARD_INFIX}{index}"))
}

/// Remove files left by an earlier attempt with a different shard count.
fn remove_stale_shards(stem: &Path) -> Result<()> {
    let (Some(dir), Some(prefix)) = (stem.parent(), stem.file_name()) else {
        return Ok(());
    };
    let prefix = format!("{}{SHARD_INFIX}", prefix.to_string_lossy());
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(FileSchemeError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| FileSchemeError::io(dir, e))?;
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let path = entry.path();
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.map_err(|e| FileSchemeError::io(&path, e))?;
        debug!(path = %path.display(), "Removed stale shard");
    }
    Ok(())
}

/// Copy one named output into `outputs_dir`, dispatching on its shape.
///
/// Re-running overwrites the same destinations, so a retry after a partial
/// failure converges on the same files.
pub async fn copy_output(
    scheme: &dyn FileScheme,
    name: &str,
    value: &OutputValue,
    outputs_dir: &Path,
    options: &CopyOptions,
) -> Result<CopiedOutput> {
    let stem = outputs_dir.join(name);
    let mut copied = CopiedOutput::default();

    match value {
        OutputValue::Value(_) => {}
        OutputValue::Sharded(_) => {
            remove_stale_shards(&stem)?;
            copy_value(scheme, value, &stem, options, &mut copied.files).await?;
            copied.primary = Some(stem);
        }
        _ => {
            copy_value(scheme, value, &stem, options, &mut copied.files).await?;
            copied.primary = copied.files.first().cloned();
        }
    }
    Ok(copied)
}

async fn copy_value(
    scheme: &dyn FileScheme,
    value: &OutputValue,
    stem: &Path,
    options: &CopyOptions,
    files: &mut Vec<PathBuf>,
) -> Result<()> {
    // Nested shards are walked with an explicit stack so the future stays
    // non-recursive.
    let mut stack: Vec<(&OutputValue, PathBuf)> = vec![(value, stem.to_path_buf())];
    let mut pending = Vec::new();

    while let Some((value, stem)) = stack.pop() {
        match value {
            OutputValue::Single(location) => {
                pending.push((location.as_str(), destination(&stem, location)));
            }
            OutputValue::WithSecondaries {
                location,
                secondaries,
            } => {
                let primary = destination(&stem, location);
                pending.push((location.as_str(), primary.clone()));
                for (index, secondary) in secondaries.iter().enumerate() {
                    let mut dest = destination(&stem, secondary);
                    if dest == primary {
                        dest = destination(&suffixed(&stem, &format!("-{index}")), secondary);
                    }
                    pending.push((secondary.as_str(), dest));
                }
            }
            OutputValue::Sharded(shards) => {
                for (index, shard) in shards.iter().enumerate().rev() {
                    stack.push((shard, shard_stem(&stem, index)));
                }
            }
            OutputValue::Value(_) => {}
        }
    }

    for (location, dest) in pending {
        scheme.copy(location, &dest, options).await?;
        files.push(dest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filescheme::LocalFileScheme;
    use tempfile::TempDir;

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("/data/sample.bam"), Some("bam"));
        assert_eq!(extension_of("gs://bucket/x/sample.bam.bai"), Some("bam.bai"));
        assert_eq!(extension_of("file:///tmp/README"), None);
        assert_eq!(extension_of("/tmp/.hidden"), None);
        assert_eq!(extension_of("/tmp/.hidden.txt"), Some("txt"));
        assert_eq!(extension_of("/tmp/dir/"), None);
    }

    #[test]
    fn test_destination_names() {
        let stem = Path::new("/t/outputs/reads");
        assert_eq!(
            destination(&shard_stem(stem, 3), "/c/r.fastq.gz"),
            PathBuf::from("/t/outputs/readsshard-3.fastq.gz")
        );
        assert_eq!(
            destination(stem, "/c/noext"),
            PathBuf::from("/t/outputs/reads")
        );
    }

    fn write_sources(dir: &Path, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .map(|n| {
                let p = dir.join(n);
                std::fs::write(&p, format!("content of {n}")).unwrap();
                p.display().to_string()
            })
            .collect()
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_sharded_copy_is_idempotent_across_counts() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let scheme = LocalFileScheme::new();
        let sources = write_sources(src.path(), &["a.txt", "b.txt", "c.txt"]);

        let three = OutputValue::Sharded(
            sources.iter().cloned().map(OutputValue::Single).collect(),
        );
        copy_output(&scheme, "reads", &three, out.path(), &CopyOptions::default())
            .await
            .unwrap();

        let two = OutputValue::Sharded(
            sources[..2].iter().cloned().map(OutputValue::Single).collect(),
        );
        for _ in 0..2 {
            let copied = copy_output(&scheme, "reads", &two, out.path(), &CopyOptions::default())
                .await
                .unwrap();
            assert_eq!(copied.files.len(), 2);
            assert_eq!(copied.primary, Some(out.path().join("reads")));
        }

        assert_eq!(
            listing(out.path()),
            vec!["readsshard-0.txt", "readsshard-1.txt"]
        );
        assert_eq!(
            std::fs::read_to_string(out.path().join("readsshard-1.txt")).unwrap(),
            "content of b.txt"
        );
    }

    #[tokio::test]
    async fn test_secondaries_share_primary_stem() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let sources = write_sources(src.path(), &["s.bam", "s.bam.bai"]);

        let value = OutputValue::WithSecondaries {
            location: sources[0].clone(),
            secondaries: vec![sources[1].clone()],
        };
        let copied = copy_output(
            &LocalFileScheme::new(),
            "aligned",
            &value,
            out.path(),
            &CopyOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(copied.primary, Some(out.path().join("aligned.bam")));
        assert_eq!(listing(out.path()), vec!["aligned.bam", "aligned.bam.bai"]);
    }

    #[tokio::test]
    async fn test_plain_values_are_not_copied() {
        let out = TempDir::new().unwrap();
        let copied = copy_output(
            &LocalFileScheme::new(),
            "count",
            &OutputValue::Value(serde_json::json!(7)),
            out.path(),
            &CopyOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(copied, CopiedOutput::default());
        assert!(listing(out.path()).is_empty());
    }
}
