//! Tiered tree materializer: clone → hardlink → copy, with per-run
//! capability caching and an atomic staging-then-rename swap.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::LinkStrategy;
use crate::error::MaterializeError;
use crate::manifest::EntryKind;
use crate::store::PackageHandle;

/// Which tier actually materialized a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Clone,
    Hardlink,
    Copy,
    /// Target already held this package's content; nothing was touched.
    Unchanged,
}

#[derive(Debug, Default, Clone)]
pub struct MaterializeStats {
    pub cloned: u64,
    pub linked: u64,
    pub copied: u64,
}

impl MaterializeStats {
    fn record(&mut self, tier: Tier, file_count: u64) {
        match tier {
            Tier::Clone => self.cloned += 1,
            Tier::Hardlink => self.linked += file_count,
            Tier::Copy => self.copied += file_count,
            Tier::Unchanged => {}
        }
    }
}

/// Caches, per run, whether clone/hardlink works between a given pair of
/// filesystems (identified by device id), so repeated packages don't
/// re-probe.
#[derive(Default)]
pub struct CapabilityTable {
    clone: DashMap<(u64, u64), bool>,
    hardlink: DashMap<(u64, u64), bool>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn probe_clone(&self, src_dev: u64, dst_dev: u64, src: &Path, dst_parent: &Path) -> bool {
        *self
            .clone
            .entry((src_dev, dst_dev))
            .or_insert_with(|| probe_clone_support(src, dst_parent))
    }

    fn probe_hardlink(&self, src_dev: u64, dst_dev: u64, src: &Path, dst_parent: &Path) -> bool {
        *self
            .hardlink
            .entry((src_dev, dst_dev))
            .or_insert_with(|| probe_hardlink_support(src, dst_parent))
    }
}

pub struct Materializer<'a> {
    strategy: LinkStrategy,
    capabilities: &'a CapabilityTable,
}

impl<'a> Materializer<'a> {
    pub fn new(strategy: LinkStrategy, capabilities: &'a CapabilityTable) -> Self {
        Materializer {
            strategy,
            capabilities,
        }
    }

    /// Materializes a single package's Store entry at `target`, using a
    /// sibling staging directory and an atomic rename-swap so the caller
    /// never observes a half-built tree.
    pub async fn materialize_package(
        &self,
        handle: &PackageHandle,
        target: &Path,
        stats: &tokio::sync::Mutex<MaterializeStats>,
    ) -> Result<Tier, MaterializeError> {
        if already_materialized(handle, target).await {
            debug!(package = %handle.digest_hex, target = %target.display(), "target already matches store content, skipping");
            return Ok(Tier::Unchanged);
        }

        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| MaterializeError::Io {
                path: parent.to_path_buf(),
                source,
            })?;

        let staging = parent.join(format!(
            ".staging-{}",
            target.file_name().and_then(|n| n.to_str()).unwrap_or("pkg")
        ));
        if staging.exists() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }

        let tier = self
            .build_staging(handle, &staging, parent)
            .await
            .map_err(|e| {
                // Best-effort cleanup before surfacing: no atomic swap
                // has happened yet, so the prior tree (if any) is
                // untouched.
                let staging = staging.clone();
                tokio::spawn(async move {
                    let _ = tokio::fs::remove_dir_all(&staging).await;
                });
                e
            })?;

        swap_into_place(&staging, target).await?;
        write_marker(handle, target).await;

        let file_count = handle
            .manifest
            .entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .count() as u64;

        {
            let mut s = stats.lock().await;
            s.record(tier, file_count.max(1));
        }

        Ok(tier)
    }

    async fn build_staging(
        &self,
        handle: &PackageHandle,
        staging: &Path,
        dst_parent: &Path,
    ) -> Result<Tier, MaterializeError> {
        match self.strategy {
            LinkStrategy::Clone => {
                if try_clone(&handle.dir, staging).await {
                    return Ok(Tier::Clone);
                }
                warn!(package = %handle.digest_hex, "pinned clone strategy failed, demoting to hardlink");
                self.hardlink_then_copy(handle, staging).await
            }
            LinkStrategy::Hardlink => self.hardlink_then_copy(handle, staging).await,
            LinkStrategy::Copy => {
                copy_tree(&handle.dir, staging).await?;
                Ok(Tier::Copy)
            }
            LinkStrategy::Auto => {
                let src_dev = device_id(&handle.dir);
                let dst_dev = device_id(dst_parent);

                if self.capabilities.probe_clone(src_dev, dst_dev, &handle.dir, dst_parent)
                    && try_clone(&handle.dir, staging).await
                {
                    return Ok(Tier::Clone);
                }

                if self
                    .capabilities
                    .probe_hardlink(src_dev, dst_dev, &handle.dir, dst_parent)
                {
                    if let Ok(tier) = self.hardlink_manifest(handle, staging).await {
                        return Ok(tier);
                    }
                }

                copy_tree(&handle.dir, staging).await?;
                Ok(Tier::Copy)
            }
        }
    }

    async fn hardlink_then_copy(
        &self,
        handle: &PackageHandle,
        staging: &Path,
    ) -> Result<Tier, MaterializeError> {
        match self.hardlink_manifest(handle, staging).await {
            Ok(tier) => Ok(tier),
            Err(_) => {
                if staging.exists() {
                    let _ = tokio::fs::remove_dir_all(staging).await;
                }
                copy_tree(&handle.dir, staging).await?;
                Ok(Tier::Copy)
            }
        }
    }

    /// Walks the package manifest (not the filesystem) so the created
    /// set matches the Store's recorded entries exactly, per the
    /// determinism requirement.
    async fn hardlink_manifest(
        &self,
        handle: &PackageHandle,
        staging: &Path,
    ) -> Result<Tier, MaterializeError> {
        for entry in handle.manifest.sorted_entries() {
            let dest = staging.join(&entry.path);
            match entry.kind {
                EntryKind::Directory => {
                    tokio::fs::create_dir_all(&dest)
                        .await
                        .map_err(|source| MaterializeError::Io {
                            path: dest.clone(),
                            source,
                        })?;
                }
                EntryKind::File => {
                    if let Some(parent) = dest.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|source| MaterializeError::Io {
                                path: parent.to_path_buf(),
                                source,
                            })?;
                    }
                    let src = handle.dir.join(&entry.path);
                    tokio::fs::hard_link(&src, &dest)
                        .await
                        .map_err(|source| MaterializeError::Io {
                            path: dest.clone(),
                            source,
                        })?;
                }
                EntryKind::Symlink => {
                    create_symlink_entry(entry, &dest)?;
                }
            }
        }
        Ok(Tier::Hardlink)
    }
}

/// Materializes a bare Store package directory at `dest`, reading its
/// `.manifest` sidecar directly rather than going through `Store::open`.
/// Backs the `corepm materialize --src --dest` CLI surface, which takes a
/// raw store-package path rather than a digest.
pub async fn run_standalone(
    src: &Path,
    dest: &Path,
    strategy: crate::config::LinkStrategy,
) -> Result<Tier, crate::error::CoreError> {
    let manifest_path = manifest_sibling(src);
    let bytes = tokio::fs::read(&manifest_path)
        .await
        .map_err(|source| MaterializeError::Io {
            path: manifest_path,
            source,
        })?;
    let manifest = crate::manifest::PackageManifest::from_json(&bytes).map_err(|e| {
        MaterializeError::Io {
            path: src.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        }
    })?;

    let handle = crate::store::PackageHandle {
        digest_hex: src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        dir: src.to_path_buf(),
        manifest,
    };

    let capabilities = CapabilityTable::new();
    let materializer = Materializer::new(strategy, &capabilities);
    let stats = tokio::sync::Mutex::new(MaterializeStats::default());
    let tier = materializer
        .materialize_package(&handle, dest, &stats)
        .await?;
    Ok(tier)
}

/// Sibling marker recording which Store digest a target directory was last
/// materialized from. The Store is content-addressed, so a matching digest
/// alone certifies the target's content without re-walking or re-hashing it.
fn marker_path(target: &Path) -> PathBuf {
    target.with_file_name(format!(
        ".materialized-{}",
        target.file_name().and_then(|n| n.to_str()).unwrap_or("pkg")
    ))
}

async fn already_materialized(handle: &PackageHandle, target: &Path) -> bool {
    if tokio::fs::metadata(target).await.is_err() {
        return false;
    }
    match tokio::fs::read_to_string(marker_path(target)).await {
        Ok(recorded) => recorded == handle.digest_hex,
        Err(_) => false,
    }
}

async fn write_marker(handle: &PackageHandle, target: &Path) {
    if let Err(source) = tokio::fs::write(marker_path(target), &handle.digest_hex).await {
        warn!(path = %marker_path(target).display(), %source, "failed to write materialize marker");
    }
}

fn manifest_sibling(package_dir: &Path) -> PathBuf {
    let mut p = package_dir.to_path_buf();
    let file_name = p
        .file_name()
        .map(|n| format!("{}.manifest", n.to_string_lossy()))
        .unwrap_or_else(|| "unknown.manifest".to_string());
    p.set_file_name(file_name);
    p
}

async fn copy_tree(src: &Path, dst: &Path) -> Result<(), MaterializeError> {
    tokio::fs::create_dir_all(dst)
        .await
        .map_err(|source| MaterializeError::Io {
            path: dst.to_path_buf(),
            source,
        })?;

    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((s, d)) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&s)
            .await
            .map_err(|source| MaterializeError::Io {
                path: s.clone(),
                source,
            })?;
        while let Some(entry) = entries.next_entry().await.map_err(|source| MaterializeError::Io {
            path: s.clone(),
            source,
        })? {
            let file_type = entry.file_type().await.map_err(|source| MaterializeError::Io {
                path: entry.path(),
                source,
            })?;
            let target = d.join(entry.file_name());
            if file_type.is_dir() {
                tokio::fs::create_dir_all(&target)
                    .await
                    .map_err(|source| MaterializeError::Io {
                        path: target.clone(),
                        source,
                    })?;
                stack.push((entry.path(), target));
            } else if file_type.is_symlink() {
                let link = tokio::fs::read_link(entry.path())
                    .await
                    .map_err(|source| MaterializeError::Io {
                        path: entry.path(),
                        source,
                    })?;
                let _ = create_symlink(&link.to_string_lossy(), &target);
            } else {
                tokio::fs::copy(entry.path(), &target)
                    .await
                    .map_err(|source| MaterializeError::Io {
                        path: target.clone(),
                        source,
                    })?;
            }
        }
    }
    Ok(())
}

async fn try_clone(src: &Path, dst: &Path) -> bool {
    match reflink_copy::reflink(src, dst) {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "directory clone unavailable");
            false
        }
    }
}

fn probe_clone_support(src: &Path, dst_parent: &Path) -> bool {
    let probe_src = src.join(".corepm-probe");
    let probe_dst = dst_parent.join(format!(".corepm-probe-{}", std::process::id()));
    let had_probe_src = probe_src.exists();
    if !had_probe_src {
        let _ = std::fs::write(&probe_src, b"probe");
    }
    let supported = reflink_copy::reflink(&probe_src, &probe_dst).is_ok();
    let _ = std::fs::remove_file(&probe_dst);
    if !had_probe_src {
        let _ = std::fs::remove_file(&probe_src);
    }
    supported
}

fn probe_hardlink_support(src: &Path, dst_parent: &Path) -> bool {
    let probe_src = src.join(".corepm-probe-hl");
    let probe_dst = dst_parent.join(format!(".corepm-probe-hl-{}", std::process::id()));
    let had_probe_src = probe_src.exists();
    if !had_probe_src {
        let _ = std::fs::write(&probe_src, b"probe");
    }
    let supported = std::fs::hard_link(&probe_src, &probe_dst).is_ok();
    let _ = std::fs::remove_file(&probe_dst);
    if !had_probe_src {
        let _ = std::fs::remove_file(&probe_src);
    }
    supported
}

#[cfg(unix)]
fn device_id(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).map(|m| m.dev()).unwrap_or(0)
}

#[cfg(not(unix))]
fn device_id(_path: &Path) -> u64 {
    0
}

fn create_symlink_entry(
    entry: &crate::manifest::ManifestEntry,
    dest: &Path,
) -> Result<(), MaterializeError> {
    if entry.degraded_symlink {
        if let Some(target) = &entry.symlink_target {
            std::fs::write(dest, target.as_bytes()).map_err(|source| MaterializeError::Io {
                path: dest.to_path_buf(),
                source,
            })?;
        }
        return Ok(());
    }
    if let Some(target) = &entry.symlink_target {
        create_symlink(target, dest).map_err(|source| MaterializeError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn create_symlink(target: &str, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

/// Renames `staging` into `target`'s place. Displaces any existing
/// directory first (to a throwaway sibling, removed asynchronously after
/// the swap succeeds) so the final rename is a simple move, never a
/// merge.
async fn swap_into_place(staging: &Path, target: &Path) -> Result<(), MaterializeError> {
    let displaced = target.with_file_name(format!(
        ".displaced-{}",
        target.file_name().and_then(|n| n.to_str()).unwrap_or("pkg")
    ));

    let had_existing = tokio::fs::metadata(target).await.is_ok();
    if had_existing {
        tokio::fs::rename(target, &displaced)
            .await
            .map_err(|source| MaterializeError::Io {
                path: target.to_path_buf(),
                source,
            })?;
    }

    match tokio::fs::rename(staging, target).await {
        Ok(()) => {
            if had_existing {
                let displaced = displaced.clone();
                tokio::spawn(async move {
                    let _ = tokio::fs::remove_dir_all(&displaced).await;
                });
            }
            Ok(())
        }
        Err(source) => {
            // Roll the displaced directory back so the prior state is
            // intact, per the atomicity invariant.
            if had_existing {
                let _ = tokio::fs::rename(&displaced, target).await;
            }
            Err(MaterializeError::Io {
                path: target.to_path_buf(),
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{EntryKind, ManifestEntry, PackageManifest};
    use crate::store::{PackageHandle, Store};

    async fn handle_for(store: &Store, files: &[(&str, &[u8])]) -> PackageHandle {
        let staging = store.new_staging_dir();
        tokio::fs::create_dir_all(&staging).await.unwrap();
        let mut manifest = PackageManifest::default();
        for (name, content) in files {
            tokio::fs::write(staging.join(name), content).await.unwrap();
            manifest.entries.push(ManifestEntry {
                path: name.to_string(),
                kind: EntryKind::File,
                mode: 0o644,
                content_digest: Some("x".into()),
                symlink_target: None,
                degraded_symlink: false,
            });
        }
        store
            .commit_package("pkg-a", &staging, &manifest)
            .await
            .unwrap();
        store.open_package("pkg-a").await.unwrap()
    }

    #[tokio::test]
    async fn copy_strategy_materializes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("store")).unwrap();
        let handle = handle_for(&store, &[("index.js", b"x"), ("package.json", b"{}")]).await;

        let caps = CapabilityTable::new();
        let materializer = Materializer::new(LinkStrategy::Copy, &caps);
        let stats = tokio::sync::Mutex::new(MaterializeStats::default());

        let target = dir.path().join("project/node_modules/a");
        let tier = materializer
            .materialize_package(&handle, &target, &stats)
            .await
            .unwrap();

        assert_eq!(tier, Tier::Copy);
        assert!(target.join("index.js").exists());
        assert!(target.join("package.json").exists());
    }

    #[tokio::test]
    async fn hardlink_strategy_shares_inode_with_pool_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("store")).unwrap();
        let handle = handle_for(&store, &[("index.js", b"x")]).await;

        let caps = CapabilityTable::new();
        let materializer = Materializer::new(LinkStrategy::Hardlink, &caps);
        let stats = tokio::sync::Mutex::new(MaterializeStats::default());

        let target = dir.path().join("project/node_modules/a");
        materializer
            .materialize_package(&handle, &target, &stats)
            .await
            .unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let src_meta = std::fs::metadata(handle.dir.join("index.js")).unwrap();
            let dst_meta = std::fs::metadata(target.join("index.js")).unwrap();
            assert_eq!(src_meta.ino(), dst_meta.ino());
        }
    }

    #[tokio::test]
    async fn rerun_on_existing_target_displaces_and_swaps_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("store")).unwrap();
        let handle = handle_for(&store, &[("index.js", b"x")]).await;

        let caps = CapabilityTable::new();
        let materializer = Materializer::new(LinkStrategy::Copy, &caps);
        let stats = tokio::sync::Mutex::new(MaterializeStats::default());
        let target = dir.path().join("project/node_modules/a");

        materializer.materialize_package(&handle, &target, &stats).await.unwrap();
        materializer.materialize_package(&handle, &target, &stats).await.unwrap();

        assert!(target.join("index.js").exists());
    }

    #[tokio::test]
    async fn swap_failure_restores_prior_target_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("project/node_modules/a");
        tokio::fs::create_dir_all(&target).await.unwrap();
        tokio::fs::write(target.join("index.js"), b"original").await.unwrap();

        // A staging directory that was never built: the final rename
        // fails, exercising the same rollback path a disk-full or
        // permission error would hit mid-swap.
        let staging = dir
            .path()
            .join("project/node_modules/.staging-a-never-built");

        let err = swap_into_place(&staging, &target).await.unwrap_err();
        assert!(matches!(err, MaterializeError::Io { .. }));
        assert!(!staging.exists());
        assert_eq!(
            tokio::fs::read_to_string(target.join("index.js")).await.unwrap(),
            "original"
        );
    }
}
