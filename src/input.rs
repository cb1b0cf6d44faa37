use crate::SmrError;
use crate::config::S3Config;
use crate::task_queue::WorkItem;
use itertools::Itertools;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// `file://<path>`: a file, or a directory walked recursively.
    Local(PathBuf),
    /// `s3://bucket/prefix`: every object under the prefix.
    S3 { bucket: String, prefix: String },
    /// Anything else is already an item id.
    Literal(String),
}

impl InputSource {
    pub fn parse(uri: &str) -> Self {
        if let Some(path) = uri.strip_prefix("file://") {
            return InputSource::Local(PathBuf::from(path));
        }
        if let Some((bucket, prefix)) = parse_s3_uri(uri) {
            return InputSource::S3 { bucket, prefix };
        }
        InputSource::Literal(uri.to_string())
    }
}

/// Splits `s3://bucket/some/prefix` into bucket and prefix.
pub fn parse_s3_uri(uri: &str) -> Option<(String, String)> {
    let rest = uri.strip_prefix("s3://")?;
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return None;
    }
    Some((bucket.to_string(), prefix.to_string()))
}

/// Turns configured inputs into the job's item list, in order, without duplicates.
pub fn expand_inputs(inputs: &[String], s3: &S3Config) -> Result<Vec<WorkItem>, SmrError> {
    let sources: Vec<InputSource> = inputs.iter().map(|uri| InputSource::parse(uri)).collect();
    let mut ids = Vec::new();
    #[cfg(feature = "s3")]
    let mut lister: Option<crate::s3::S3Lister> = None;

    for source in sources {
        match source {
            InputSource::Local(path) => {
                let before = ids.len();
                walk_files(&path, &mut ids)?;
                info!(path = %path.display(), files = ids.len() - before, "expanded local input");
            }
            InputSource::S3 { bucket, prefix } => {
                #[cfg(feature = "s3")]
                {
                    if lister.is_none() {
                        lister = Some(crate::s3::S3Lister::new(s3)?);
                    }
                    if let Some(lister) = &lister {
                        let keys = lister.list_keys(&bucket, &prefix)?;
                        info!(bucket = %bucket, prefix = %prefix, objects = keys.len(), "expanded s3 input");
                        ids.extend(keys.into_iter().map(|key| format!("s3://{}/{}", bucket, key)));
                    }
                }
                #[cfg(not(feature = "s3"))]
                {
                    let _ = s3;
                    return Err(SmrError::Input(format!(
                        "s3://{}/{} needs a build with the `s3` feature",
                        bucket, prefix
                    )));
                }
            }
            InputSource::Literal(id) => ids.push(id),
        }
    }

    ids.into_iter()
        .unique()
        .map(WorkItem::new)
        .collect()
}

fn walk_files(path: &Path, out: &mut Vec<String>) -> Result<(), SmrError> {
    let meta = fs::metadata(path)
        .map_err(|e| SmrError::Input(format!("cannot read {}: {}", path.display(), e)))?;
    if meta.is_file() {
        out.push(path.to_string_lossy().to_string());
        return Ok(());
    }
    let entries: Vec<PathBuf> = fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .sorted()
        .collect();
    for entry in entries {
        if entry.is_dir() {
            walk_files(&entry, out)?;
        } else if entry.is_file() {
            out.push(entry.to_string_lossy().to_string());
        }
    }
    Ok(())
}
