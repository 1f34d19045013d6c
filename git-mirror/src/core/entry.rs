//! Catalog entries and the local directory naming rule.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One (source, mirror) pair from the catalog.
///
/// Serialized with the keys `source` (alias `src`) and `mirror`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MirrorEntry {
    /// Repository to mirror from (URL or local path).
    #[serde(alias = "src")]
    pub source: String,
    /// Repository to push the mirror to.
    #[serde(rename = "mirror")]
    pub target: String,
}

impl MirrorEntry {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// Directory name of the local bare mirror, e.g. `project.git`.
    pub fn repo_name(&self) -> Option<String> {
        derive_repo_name(&self.source)
    }

    /// Local bare mirror path under `base_dir`.
    pub fn local_dir(&self, base_dir: &Path) -> Option<PathBuf> {
        self.repo_name().map(|name| base_dir.join(name))
    }
}

/// Derive the local mirror directory name from a source locator.
///
/// Takes the last path segment, strips one `.git` suffix and appends `.git`
/// again, so `https://host/group/project` and `https://host/group/project.git`
/// both map to `project.git`. In scp-style `host:path` sources only the path
/// part counts; a colon after the first separator is part of the name.
/// Returns `None` when no usable segment exists.
pub fn derive_repo_name(source: &str) -> Option<String> {
    let trimmed = source.trim().trim_end_matches(['/', '\\']);
    let path = match trimmed.split_once(':') {
        Some((host, rest)) if !host.contains(['/', '\\']) => rest,
        _ => trimmed,
    };
    let segment = path.rsplit(['/', '\\']).next()?;
    let stem = segment.strip_suffix(".git").unwrap_or(segment);
    if stem.is_empty() || stem == "." || stem == ".." {
        return None;
    }
    Some(format!("{stem}.git"))
}
