//! Per-package manifest: the sidecar record of everything the Extractor
//! wrote into a Store package entry, consumed by the Materializer.

use serde::{Deserialize, Serialize};

/// One entry in a package manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path relative to the package root.
    pub path: String,
    pub kind: EntryKind,
    /// File mode bits (0o644/0o755 for files, 0o755 for directories).
    pub mode: u32,
    /// Present only for `EntryKind::File`: the file-pool digest hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<String>,
    /// Present only for `EntryKind::Symlink`: the link target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
    /// Set when a symlink entry was degraded to a plain file because the
    /// target platform forbids symlinks.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded_symlink: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// The manifest for a single Store package entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PackageManifest {
    pub entries: Vec<ManifestEntry>,
}

impl PackageManifest {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Manifest entries in a stable, sorted traversal order so logs and
    /// reports are deterministic regardless of tar entry order.
    pub fn sorted_entries(&self) -> Vec<&ManifestEntry> {
        let mut v: Vec<&ManifestEntry> = self.entries.iter().collect();
        v.sort_by(|a, b| a.path.cmp(&b.path));
        v
    }
}
