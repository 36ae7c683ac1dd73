//! Lockfile document model and parsing.
//!
//! The lockfile is consumed by value: a top-level map of relative install
//! paths to entries. Parsing is pure — no I/O, no version resolution,
//! no network lookups. See `crate::plan` for the lockfile-to-plan step.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::LockfileError;

/// One `os`/`cpu` filter value from a lockfile entry.
pub type PlatformTag = String;

/// Raw shape of a single lockfile entry, as written by the resolver that
/// produced the lockfile.
#[derive(Debug, Clone, Deserialize)]
pub struct LockfileEntry {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub resolved: Option<String>,
    #[serde(default)]
    pub integrity: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub bin: BTreeMap<String, String>,
    #[serde(default)]
    pub os: Vec<PlatformTag>,
    #[serde(default)]
    pub cpu: Vec<PlatformTag>,
    #[serde(default)]
    pub link: bool,
}

/// Top-level lockfile document.
#[derive(Debug, Clone, Deserialize)]
pub struct LockfileDocument {
    pub paths: BTreeMap<String, LockfileEntry>,
    #[serde(default)]
    pub packages: BTreeMap<String, String>,
}

/// An algorithm-prefixed integrity digest, e.g. `sha512:base64...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integrity {
    pub algorithm: String,
    pub digest: String,
}

impl Integrity {
    pub fn parse(raw: &str) -> Option<Self> {
        let (algorithm, digest) = raw.split_once(':')?;
        if algorithm.is_empty() || digest.is_empty() {
            return None;
        }
        Some(Integrity {
            algorithm: algorithm.to_string(),
            digest: digest.to_string(),
        })
    }
}

/// A fully parsed package descriptor, independent of the lockfile's raw
/// JSON shape.
#[derive(Debug, Clone)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    pub resolved: Option<String>,
    pub integrity: Option<Integrity>,
    pub dependencies: BTreeMap<String, String>,
    pub bin: BTreeMap<String, String>,
    pub os: Vec<PlatformTag>,
    pub cpu: Vec<PlatformTag>,
}

impl PackageDescriptor {
    fn from_entry(entry: &LockfileEntry) -> Self {
        PackageDescriptor {
            name: entry.name.clone(),
            version: entry.version.clone(),
            resolved: entry.resolved.clone(),
            integrity: entry.integrity.as_deref().and_then(Integrity::parse),
            dependencies: entry.dependencies.clone(),
            bin: entry.bin.clone(),
            os: entry.os.clone(),
            cpu: entry.cpu.clone(),
        }
    }
}

/// A single parsed lockfile placement, with its raw install path and a
/// resolved `kind`.
#[derive(Debug, Clone)]
pub struct LockfileNode {
    pub install_path: String,
    pub descriptor: PackageDescriptor,
    pub link: bool,
    /// Only meaningful when `link` is true: the workspace source path the
    /// link should point at (carried in `resolved`).
    pub workspace_source: Option<String>,
}

/// Parse a lockfile document from JSON bytes. Duplicate install paths are
/// rejected here, independent of the physical JSON map (which already
/// cannot have duplicate keys): this guards against two entries that
/// normalize to the same path after trimming.
pub fn parse(bytes: &[u8], source_path: &std::path::Path) -> Result<Vec<LockfileNode>, LockfileError> {
    let doc: LockfileDocument =
        serde_json::from_slice(bytes).map_err(|source| LockfileError::Parse {
            path: source_path.to_path_buf(),
            source,
        })?;

    let mut seen = BTreeMap::new();
    let mut nodes = Vec::with_capacity(doc.paths.len());

    for (raw_path, entry) in doc.paths {
        let install_path = normalize_path(&raw_path);
        if let Some(existing) = seen.insert(install_path.clone(), entry.name.clone()) {
            return Err(LockfileError::Conflict {
                path: install_path,
                a: existing,
                b: entry.name.clone(),
            });
        }

        let descriptor = PackageDescriptor::from_entry(&entry);
        let workspace_source = if entry.link {
            entry.resolved.clone()
        } else {
            None
        };

        nodes.push(LockfileNode {
            install_path,
            descriptor,
            link: entry.link,
            workspace_source,
        });
    }

    Ok(nodes)
}

fn normalize_path(raw: &str) -> String {
    raw.trim_end_matches('/').replace('\\', "/")
}
