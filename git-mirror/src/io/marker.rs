//! Marker file recording which catalog entry a local mirror belongs to.
//!
//! The marker lives inside the bare mirror directory. An update is refused when
//! it names a different source or push target than the catalog entry.
//! It is only written once the push url points at the target.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::entry::MirrorEntry;
use crate::error::MirrorError;

pub const MARKER_FILE: &str = "git-mirror.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorMarker {
    pub source: String,
    pub target: String,
}

impl MirrorMarker {
    pub fn for_entry(entry: &MirrorEntry) -> Self {
        Self {
            source: entry.source.clone(),
            target: entry.target.clone(),
        }
    }
}

/// Result of checking an existing mirror directory against its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerCheck {
    Matches,
    /// No marker yet (directory from an older run or created by hand).
    Missing,
}

pub fn marker_path(dir: &Path) -> PathBuf {
    dir.join(MARKER_FILE)
}

/// Read the marker in `dir`, or `None` if the directory has none.
pub fn read_marker(dir: &Path) -> Result<Option<MirrorMarker>, MirrorError> {
    let path = marker_path(dir);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(MirrorError::Marker { path, source }),
    };
    let marker = serde_json::from_str(&contents).map_err(|e| MirrorError::Marker {
        path: path.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    Ok(Some(marker))
}

/// Write the marker atomically (temp file + rename).
pub fn write_marker(dir: &Path, marker: &MirrorMarker) -> Result<(), MirrorError> {
    let path = marker_path(dir);
    let mut payload = serde_json::to_string_pretty(marker).map_err(|e| MirrorError::Marker {
        path: path.clone(),
        source: std::io::Error::other(e),
    })?;
    payload.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload)
        .and_then(|()| fs::rename(&tmp_path, &path))
        .map_err(|source| MirrorError::Marker {
            path: path.clone(),
            source,
        })?;
    debug!(path = %path.display(), "wrote mirror marker");
    Ok(())
}

/// Check that `dir` was created for `entry`.
pub fn check_marker(dir: &Path, entry: &MirrorEntry) -> Result<MarkerCheck, MirrorError> {
    let Some(marker) = read_marker(dir)? else {
        return Ok(MarkerCheck::Missing);
    };

    if marker.source != entry.source {
        return Err(MirrorError::MismatchedMirror {
            dir: dir.to_path_buf(),
            expected: format!("source {}", entry.source),
            found: format!("source {}", marker.source),
        });
    }
    if marker.target != entry.target {
        return Err(MirrorError::MismatchedMirror {
            dir: dir.to_path_buf(),
            expected: format!("push target {}", entry.target),
            found: format!("push target {}", marker.target),
        });
    }
    Ok(MarkerCheck::Matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_without_marker_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entry = MirrorEntry::new("A", "B");

        assert_eq!(check_marker(temp.path(), &entry).expect("check"), MarkerCheck::Missing);
        assert_eq!(read_marker(temp.path()).expect("read"), None);

        write_marker(temp.path(), &MirrorMarker::for_entry(&entry)).expect("write");
        assert_eq!(check_marker(temp.path(), &entry).expect("check"), MarkerCheck::Matches);
    }

    #[test]
    fn different_source_is_a_mismatch() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_marker(temp.path(), &MirrorMarker::for_entry(&MirrorEntry::new("https://one/app", "B")))
            .expect("write");

        let err = check_marker(temp.path(), &MirrorEntry::new("https://two/app", "B")).unwrap_err();
        match err {
            MirrorError::MismatchedMirror { expected, found, .. } => {
                assert_eq!(expected, "source https://two/app");
                assert_eq!(found, "source https://one/app");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn different_target_is_a_mismatch() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_marker(temp.path(), &MirrorMarker::for_entry(&MirrorEntry::new("A", "old"))).expect("write");

        let err = check_marker(temp.path(), &MirrorEntry::new("A", "new")).unwrap_err();
        assert!(err.to_string().contains("push target new"));
    }

    #[test]
    fn corrupt_marker_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(marker_path(temp.path()), "{ nope").expect("write");
        assert!(matches!(
            read_marker(temp.path()),
            Err(MirrorError::Marker { .. })
        ));
    }
}
