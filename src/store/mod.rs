//! # Content-addressed store
//!
//! Owns four subdirectories under a root: `pkgs/` (extracted package
//! trees plus `.manifest` sidecars), `files/` (the file pool, keyed by
//! content digest), `tmp/` (atomic-publish staging), and `meta/`
//! (last-access bookkeeping for an external, out-of-scope GC).
//!
//! Every publish — package or pooled file — goes through the same
//! staging-then-rename path so a reader always observes either a
//! complete entry or none at all.

pub mod layout;

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::manifest::PackageManifest;
pub use layout::StoreLayout;

/// Hash algorithm tag used for package-level digests (tarball integrity).
pub const PKG_ALGORITHM: &str = "sha512";
/// Hash algorithm tag used for file-pool entries.
pub const FILE_ALGORITHM: &str = "sha256";

/// A handle returned by `Store::open`, capable of materializing the
/// package subtree (see `crate::materialize`).
#[derive(Debug, Clone)]
pub struct PackageHandle {
    pub digest_hex: String,
    pub dir: PathBuf,
    pub manifest: PackageManifest,
}

#[derive(Debug, Clone)]
pub struct Store {
    layout: StoreLayout,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root.into());
        layout.ensure_dirs().map_err(|source| StoreError::Io {
            path: layout.root().clone(),
            source,
        })?;
        Ok(Store { layout })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// `has(pkg_digest) -> bool` — lookup by path existence.
    pub async fn has_package(&self, digest_hex: &str) -> bool {
        let dir = self.layout.package_path(PKG_ALGORITHM, digest_hex);
        tokio::fs::metadata(dir).await.is_ok()
    }

    /// `open(pkg_digest) -> handle`. Touches the last-access marker.
    pub async fn open_package(&self, digest_hex: &str) -> Result<PackageHandle, StoreError> {
        let dir = self.layout.package_path(PKG_ALGORITHM, digest_hex);
        if tokio::fs::metadata(&dir).await.is_err() {
            return Err(StoreError::NotFound(digest_hex.to_string()));
        }
        let manifest_path = self.layout.manifest_path(PKG_ALGORITHM, digest_hex);
        let bytes = tokio::fs::read(&manifest_path)
            .await
            .map_err(|source| StoreError::Io {
                path: manifest_path,
                source,
            })?;
        let manifest = PackageManifest::from_json(&bytes).map_err(|e| StoreError::Io {
            path: dir.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        self.touch_last_access(digest_hex).await;

        Ok(PackageHandle {
            digest_hex: digest_hex.to_string(),
            dir,
            manifest,
        })
    }

    /// Writes a last-access marker under `meta/`. Failure is non-fatal:
    /// GC bookkeeping never blocks a read.
    async fn touch_last_access(&self, digest_hex: &str) {
        let path = self.layout.last_access_path(PKG_ALGORITHM, digest_hex);
        if let Some(parent) = path.parent() {
            if tokio::fs::create_dir_all(parent).await.is_err() {
                return;
            }
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if let Err(e) = tokio::fs::write(&path, now.to_string()).await {
            warn!(path = %path.display(), error = %e, "failed to record last-access timestamp");
        }
    }

    /// `commit(pkg_digest, staging_dir, manifest)` — atomically renames
    /// the staging directory into place. If another writer already
    /// published this digest, discards `staging_dir` and keeps the
    /// winner (first writer wins, loser discards).
    pub async fn commit_package(
        &self,
        digest_hex: &str,
        staging_dir: &Path,
        manifest: &PackageManifest,
    ) -> Result<(), StoreError> {
        let target = self.layout.package_path(PKG_ALGORITHM, digest_hex);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        match tokio::fs::rename(staging_dir, &target).await {
            Ok(()) => {}
            Err(source) if target_already_exists(&source) => {
                debug!(digest = digest_hex, "package already published by another writer");
                remove_dir_best_effort(staging_dir).await;
                return Ok(());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: target,
                    source,
                })
            }
        }

        let manifest_path = self.layout.manifest_path(PKG_ALGORITHM, digest_hex);
        let bytes = manifest
            .to_json()
            .expect("manifest serialization is infallible for our own types");
        write_atomic(&self.layout, &manifest_path, &bytes).await?;

        Ok(())
    }

    /// `ingest_file(content_digest, bytes)` — publishes a pooled file if
    /// it doesn't already exist. Races resolve "first writer wins;
    /// losers discard" because the rename target is identical content.
    pub async fn ingest_file(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let digest_hex = hex_digest(bytes);
        let target = self.layout.file_path(FILE_ALGORITHM, &digest_hex);

        if tokio::fs::metadata(&target).await.is_ok() {
            return Ok(digest_hex);
        }

        write_atomic(&self.layout, &target, bytes).await?;
        Ok(digest_hex)
    }

    /// Streaming variant used by the Extractor: the caller already has a
    /// temp file with the content written and hashed; this just
    /// publishes it by rename, deduplicating against an existing entry.
    pub async fn ingest_file_from_path(
        &self,
        digest_hex: &str,
        staged_path: &Path,
    ) -> Result<(), StoreError> {
        let target = self.layout.file_path(FILE_ALGORITHM, digest_hex);
        if tokio::fs::metadata(&target).await.is_ok() {
            remove_file_best_effort(staged_path).await;
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        match tokio::fs::rename(staged_path, &target).await {
            Ok(()) => Ok(()),
            Err(source) if target_already_exists(&source) => {
                remove_file_best_effort(staged_path).await;
                Ok(())
            }
            Err(source) => Err(StoreError::Io {
                path: target,
                source,
            }),
        }
    }

    pub fn file_path(&self, digest_hex: &str) -> PathBuf {
        self.layout.file_path(FILE_ALGORITHM, digest_hex)
    }

    pub fn new_staging_dir(&self) -> PathBuf {
        self.layout.new_tmp_path()
    }

    /// A cheap, `Send`-able handle for use from blocking worker threads
    /// (the Extractor's sync tar-decode path), mirroring the plain
    /// filesystem ingestion the teacher's own sync `PackageIngestor`
    /// used alongside the async `Store`.
    pub fn clone_handle(&self) -> StoreHandle {
        StoreHandle {
            layout: self.layout.clone(),
        }
    }
}

/// Synchronous counterpart to `Store`, used from `spawn_blocking` workers
/// where an async runtime isn't readily available.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    layout: StoreLayout,
}

impl StoreHandle {
    pub fn file_path(&self, digest_hex: &str) -> PathBuf {
        self.layout.file_path(FILE_ALGORITHM, digest_hex)
    }

    /// Synchronous, blocking equivalent of `Store::ingest_file`.
    pub fn ingest_file_blocking(&self, digest_hex: &str, bytes: &[u8]) -> std::io::Result<()> {
        let target = self.layout.file_path(FILE_ALGORITHM, digest_hex);
        if target.exists() {
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staging = self.layout.new_tmp_path();
        std::fs::write(&staging, bytes)?;
        match std::fs::rename(&staging, &target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = std::fs::remove_file(&staging);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Aggregate counts surfaced by `corepm store stats`.
#[derive(Debug, Default, serde::Serialize)]
pub struct StoreStats {
    pub package_count: u64,
    pub file_count: u64,
}

/// Recursively counts bucketed leaf entries under `pkgs/` and `files/`.
/// Runs on a blocking thread since it walks the whole tree.
pub async fn layout_stats(layout: &StoreLayout) -> Result<StoreStats, StoreError> {
    let pkgs_dir = layout.pkgs_dir();
    let files_dir = layout.files_dir();
    tokio::task::spawn_blocking(move || StoreStats {
        package_count: count_leaves(&pkgs_dir),
        file_count: count_leaves(&files_dir),
    })
    .await
    .map_err(|e| StoreError::Io {
        path: PathBuf::new(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e),
    })
}

fn count_leaves(root: &Path) -> u64 {
    walkdir::WalkDir::new(root)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(Result::ok)
        .count() as u64
}

/// Recomputes every file entry's digest against the manifest and reports
/// whether the package entry still matches what the Store recorded.
pub async fn verify_package(handle: &PackageHandle) -> Result<bool, StoreError> {
    for entry in &handle.manifest.entries {
        if entry.kind != crate::manifest::EntryKind::File {
            continue;
        }
        let Some(expected) = &entry.content_digest else {
            continue;
        };
        let path = handle.dir.join(&entry.path);
        let bytes = tokio::fs::read(&path).await.map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        if &hex_digest(&bytes) != expected {
            warn!(path = %path.display(), "manifest digest mismatch");
            return Ok(false);
        }
    }
    Ok(true)
}

async fn write_atomic(layout: &StoreLayout, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let staging = layout.new_tmp_path();
    tokio::fs::write(&staging, bytes)
        .await
        .map_err(|source| StoreError::Io {
            path: staging.clone(),
            source,
        })?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    match tokio::fs::rename(&staging, target).await {
        Ok(()) => Ok(()),
        Err(source) if target_already_exists(&source) => {
            remove_file_best_effort(&staging).await;
            Ok(())
        }
        Err(source) => Err(StoreError::Io {
            path: target.to_path_buf(),
            source,
        }),
    }
}

fn target_already_exists(err: &std::io::Error) -> bool {
    // `rename` onto an existing, non-empty directory fails with
    // `AlreadyExists` on some platforms and `DirectoryNotEmpty`-shaped
    // raw errors on others; both mean "a winner is already there".
    matches!(err.kind(), std::io::ErrorKind::AlreadyExists) || err.raw_os_error() == Some(libc_enotempty())
}

#[cfg(unix)]
fn libc_enotempty() -> i32 {
    39 // ENOTEMPTY on Linux
}

#[cfg(not(unix))]
fn libc_enotempty() -> i32 {
    -1
}

async fn remove_dir_best_effort(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to clean up losing staging directory");
        }
    }
}

async fn remove_file_best_effort(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to clean up losing staged file");
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}
