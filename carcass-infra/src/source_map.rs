//! Image provenance file.
//!
//! Records where each image of each pool was fetched from, in
//! `<dir>/image-sources.json`:
//!
//! ```json
//! { "default": { "debian11": "https://cloud.debian.org/..." } }
//! ```
//!
//! The file is advisory: stale or missing entries are expected. Every
//! update reads the whole file and rewrites it, the last writer wins.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::ProvenanceError;

/// Name of the provenance file inside the data directory.
pub const SOURCE_MAP_FILE: &str = "image-sources.json";

/// Image name to source location.
pub type PoolSources = BTreeMap<String, String>;

/// Pool name to the sources of its images.
pub type SourceMap = BTreeMap<String, PoolSources>;

/// Path of the provenance file inside `dir`.
pub fn source_map_path(dir: &Path) -> PathBuf {
    dir.join(SOURCE_MAP_FILE)
}

/// Read the provenance file. A missing file is an empty map.
pub async fn read_source_map(path: &Path) -> Result<SourceMap, ProvenanceError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SourceMap::new()),
        Err(source) => {
            return Err(ProvenanceError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&data).map_err(|source| ProvenanceError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Rewrite the provenance file, creating its directory when needed.
pub async fn write_source_map(path: &Path, map: &SourceMap) -> Result<(), ProvenanceError> {
    let data = serde_json::to_string_pretty(map).map_err(ProvenanceError::Encode)?;

    let write_err = |source| ProvenanceError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    tokio::fs::write(path, data).await.map_err(write_err)?;

    debug!(path = %path.display(), "Source map saved");
    Ok(())
}

/// Record the source of an image.
pub async fn add_provenance(
    dir: &Path,
    pool: &str,
    name: &str,
    source: &str,
) -> Result<(), ProvenanceError> {
    let path = source_map_path(dir);
    let mut map = read_source_map(&path).await?;

    map.entry(pool.to_string())
        .or_default()
        .insert(name.to_string(), source.to_string());

    write_source_map(&path, &map).await
}

/// Forget the source of an image. Other entries are left untouched and the
/// file is not rewritten when there is nothing to forget.
pub async fn remove_provenance(dir: &Path, pool: &str, name: &str) -> Result<(), ProvenanceError> {
    let path = source_map_path(dir);
    let mut map = read_source_map(&path).await?;

    let Some(sources) = map.get_mut(pool) else {
        return Ok(());
    };
    if sources.remove(name).is_none() {
        return Ok(());
    }
    if sources.is_empty() {
        map.remove(pool);
    }

    write_source_map(&path, &map).await
}

/// Sources recorded for a pool, for display. An unreadable file is logged
/// and treated as empty.
pub async fn pool_sources(dir: &Path, pool: &str) -> PoolSources {
    match read_source_map(&source_map_path(dir)).await {
        Ok(mut map) => map.remove(pool).unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable source map");
            PoolSources::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = read_source_map(&source_map_path(dir.path())).await.unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let dir = tempfile::tempdir().unwrap();

        add_provenance(dir.path(), "default", "debian11", "file:///tmp/d11.qcow2")
            .await
            .unwrap();
        add_provenance(dir.path(), "default", "rocky9", "https://example.org/r9.qcow2")
            .await
            .unwrap();
        add_provenance(dir.path(), "fast", "debian11", "/srv/d11.qcow2")
            .await
            .unwrap();

        remove_provenance(dir.path(), "default", "debian11").await.unwrap();

        let map = read_source_map(&source_map_path(dir.path())).await.unwrap();
        assert_eq!(map["default"].len(), 1);
        assert_eq!(map["default"]["rocky9"], "https://example.org/r9.qcow2");
        assert_eq!(map["fast"]["debian11"], "/srv/d11.qcow2");
    }

    #[tokio::test]
    async fn test_remove_from_missing_file_does_not_create_it() {
        let dir = tempfile::tempdir().unwrap();
        remove_provenance(dir.path(), "default", "debian11").await.unwrap();
        assert!(!source_map_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(source_map_path(dir.path()), b"{ not json").unwrap();

        let err = add_provenance(dir.path(), "default", "a", "b").await.unwrap_err();
        assert!(matches!(err, ProvenanceError::Decode { .. }));
        assert!(pool_sources(dir.path(), "default").await.is_empty());
    }

    #[tokio::test]
    async fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        add_provenance(dir.path(), "default", "debian11", "file:///tmp/d11.qcow2")
            .await
            .unwrap();

        let raw = std::fs::read_to_string(source_map_path(dir.path())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "default": { "debian11": "file:///tmp/d11.qcow2" } })
        );
    }
}
