//! Engine-reported workflow outputs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Shape of one named output. Locations are engine-native and may be
/// remote URIs; they are only interpreted by a `FileScheme`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OutputValue {
    /// A single file location.
    Single(String),
    /// Ordered shards; the index is the shard number.
    Sharded(Vec<OutputValue>),
    /// A primary file plus its secondary files (e.g. an index).
    WithSecondaries {
        location: String,
        secondaries: Vec<String>,
    },
    /// A non-file value (number, boolean, null). Recorded, never copied.
    Value(Value),
}

impl OutputValue {
    /// Interpret an engine's JSON output value.
    ///
    /// Strings are locations, arrays are shards, and objects carrying a
    /// `location` (or `path`) are files with optional `secondaryFiles`.
    pub fn from_json(name: &str, value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(OutputValue::Single(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| OutputValue::from_json(name, item))
                .collect::<Result<Vec<_>>>()
                .map(OutputValue::Sharded),
            Value::Object(map) => {
                let location = map
                    .get("location")
                    .or_else(|| map.get("path"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::InvalidOutput {
                        name: name.to_string(),
                        reason: "object output has no 'location' or 'path'".to_string(),
                    })?;

                let secondaries = match map.get("secondaryFiles") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|item| secondary_location(name, item))
                        .collect::<Result<Vec<_>>>()?,
                    Some(other) => {
                        return Err(Error::InvalidOutput {
                            name: name.to_string(),
                            reason: format!("'secondaryFiles' must be a list, got {other}"),
                        });
                    }
                };

                if secondaries.is_empty() {
                    Ok(OutputValue::Single(location.to_string()))
                } else {
                    Ok(OutputValue::WithSecondaries {
                        location: location.to_string(),
                        secondaries,
                    })
                }
            }
            other => Ok(OutputValue::Value(other.clone())),
        }
    }

    /// Whether copying this value touches any file.
    pub fn has_files(&self) -> bool {
        match self {
            OutputValue::Single(_) | OutputValue::WithSecondaries { .. } => true,
            OutputValue::Sharded(shards) => shards.iter().any(OutputValue::has_files),
            OutputValue::Value(_) => false,
        }
    }
}

fn secondary_location(name: &str, item: &Value) -> Result<String> {
    match item {
        Value::String(s) => Ok(s.clone()),
        Value::Object(map) => map
            .get("location")
            .or_else(|| map.get("path"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidOutput {
                name: name.to_string(),
                reason: "secondary file has no 'location'".to_string(),
            }),
        other => Err(Error::InvalidOutput {
            name: name.to_string(),
            reason: format!("unsupported secondary file value {other}"),
        }),
    }
}

/// A persisted output: its engine value and where it was copied locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub name: String,
    pub value: OutputValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copied_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_is_single() {
        let v = OutputValue::from_json("out", &json!("/tmp/x.txt")).unwrap();
        assert_eq!(v, OutputValue::Single("/tmp/x.txt".into()));
    }

    #[test]
    fn test_array_is_sharded_in_order() {
        let v = OutputValue::from_json("out", &json!(["/a/0.bam", "/a/1.bam"])).unwrap();
        assert_eq!(
            v,
            OutputValue::Sharded(vec![
                OutputValue::Single("/a/0.bam".into()),
                OutputValue::Single("/a/1.bam".into()),
            ])
        );
    }

    #[test]
    fn test_file_object_with_secondaries() {
        let v = OutputValue::from_json(
            "bam",
            &json!({
                "class": "File",
                "location": "file:///w/out.bam",
                "secondaryFiles": [{"class": "File", "location": "file:///w/out.bam.bai"}]
            }),
        )
        .unwrap();
        assert_eq!(
            v,
            OutputValue::WithSecondaries {
                location: "file:///w/out.bam".into(),
                secondaries: vec!["file:///w/out.bam.bai".into()],
            }
        );
    }

    #[test]
    fn test_file_object_without_secondaries_is_single() {
        let v = OutputValue::from_json("f", &json!({"path": "/w/a.txt"})).unwrap();
        assert_eq!(v, OutputValue::Single("/w/a.txt".into()));
    }

    #[test]
    fn test_scalar_is_value() {
        let v = OutputValue::from_json("n", &json!(42)).unwrap();
        assert!(!v.has_files());
    }

    #[test]
    fn test_object_without_location_rejected() {
        let err = OutputValue::from_json("bad", &json!({"class": "File"})).unwrap_err();
        assert!(matches!(err, Error::InvalidOutput { name, .. } if name == "bad"));
    }
}
