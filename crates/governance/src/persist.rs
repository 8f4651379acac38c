//! Atomic JSON state persistence
//!
//! Shared by the quota tracker, response cache, and topic rotation state.
//! All writes go through temp-file + rename so a crash mid-write never
//! leaves a truncated state file behind.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use common::{Error, Result};

/// Read and parse a JSON state file.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&contents)?)
}

/// Write a JSON state file atomically.
///
/// Writes to a temp file in the same directory, then renames it over the
/// target. The temp name carries the process id so unrelated processes
/// sharing a directory don't collide.
pub(crate) async fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)?;

    let dir = path.parent().ok_or_else(|| {
        Error::Config(format!(
            "state path {} has no parent directory",
            path.display()
        ))
    })?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes()).await?;
    tokio::fs::rename(&tmp_path, path).await?;

    debug!(path = %path.display(), "persisted state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn roundtrip_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut data = HashMap::new();
        data.insert("alpha".to_string(), 1u32);
        data.insert("beta".to_string(), 2u32);

        write_json(&path, &data).await.unwrap();
        let back: HashMap<String, u32> = read_json(&path).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn write_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        write_json(&path, &vec![1, 2, 3]).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["state.json"]);
    }

    #[tokio::test]
    async fn read_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        let err = read_json::<Vec<u32>>(&path).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn read_garbage_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let err = read_json::<Vec<u32>>(&path).await.unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
