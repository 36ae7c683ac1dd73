//! Streaming tarball decoder. Ingests file contents into the Store's
//! file pool and builds the per-package manifest.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::EntryType;
use tracing::warn;

use crate::error::ExtractError;
use crate::manifest::{EntryKind, ManifestEntry, PackageManifest};
use crate::store::Store;

const DIR_MODE: u32 = 0o755;
const DEFAULT_FILE_MODE: u32 = 0o644;
const EXEC_FILE_MODE: u32 = 0o755;

pub struct ExtractedPackage {
    pub staging_dir: PathBuf,
    pub manifest: PackageManifest,
    pub files_ingested: usize,
}

/// Decodes `bytes` as a gzip- or zstd-wrapped tar stream (falling back to
/// a bare tar stream if neither magic matches) into a fresh staging
/// directory under the Store's `tmp/`, ingesting every regular file into
/// the file pool along the way.
pub async fn extract_tarball(
    store: &Store,
    bytes: &[u8],
) -> Result<ExtractedPackage, ExtractError> {
    let staging_dir = store.new_staging_dir();
    tokio::fs::create_dir_all(&staging_dir)
        .await
        .map_err(|source| ExtractError::Io {
            path: staging_dir.clone(),
            source,
        })?;

    let owned = bytes.to_vec();
    let store = store.clone_handle();
    let staging_for_blocking = staging_dir.clone();

    let (manifest, files_ingested) = tokio::task::spawn_blocking(move || {
        extract_sync(&owned, &staging_for_blocking, &store)
    })
    .await
    .expect("extract worker task panicked")?;

    Ok(ExtractedPackage {
        staging_dir,
        manifest,
        files_ingested,
    })
}

/// Synchronous core of extraction, run on a blocking thread pool thread
/// since `tar` and file-pool ingestion are CPU/disk-bound, not async.
fn extract_sync(
    bytes: &[u8],
    staging_dir: &Path,
    store: &crate::store::StoreHandle,
) -> Result<(PackageManifest, usize), ExtractError> {
    let decoded = decompress(bytes)?;
    let mut archive = tar::Archive::new(decoded.as_slice());

    let mut manifest = PackageManifest::default();
    let mut files_ingested = 0usize;

    for entry in archive.entries().map_err(|e| ExtractError::Malformed(e.to_string()))? {
        let mut entry = entry.map_err(|e| ExtractError::Malformed(e.to_string()))?;
        let raw_path = entry
            .path()
            .map_err(|e| ExtractError::Malformed(e.to_string()))?
            .into_owned();

        // Strip the tarball's implicit leading directory (`package/`).
        let relative: PathBuf = raw_path.components().skip(1).collect();
        if relative.as_os_str().is_empty() {
            continue;
        }

        let relative_str = relative.to_string_lossy().replace('\\', "/");
        let target = safe_join(staging_dir, &relative)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                std::fs::create_dir_all(&target).map_err(|source| ExtractError::Io {
                    path: target.clone(),
                    source,
                })?;
                set_mode(&target, DIR_MODE);
                manifest.entries.push(ManifestEntry {
                    path: relative_str,
                    kind: EntryKind::Directory,
                    mode: DIR_MODE,
                    content_digest: None,
                    symlink_target: None,
                    degraded_symlink: false,
                });
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|source| ExtractError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                let executable = entry.header().mode().map(|m| m & 0o111 != 0).unwrap_or(false);
                let mode = if executable { EXEC_FILE_MODE } else { DEFAULT_FILE_MODE };

                let mut contents = Vec::new();
                entry
                    .read_to_end(&mut contents)
                    .map_err(|source| ExtractError::Io {
                        path: target.clone(),
                        source,
                    })?;

                let digest_hex = hex_sha256(&contents);
                store
                    .ingest_file_blocking(&digest_hex, &contents)
                    .map_err(|source| ExtractError::Io {
                        path: target.clone(),
                        source,
                    })?;
                files_ingested += 1;

                link_or_copy(&store.file_path(&digest_hex), &target, mode)?;

                manifest.entries.push(ManifestEntry {
                    path: relative_str,
                    kind: EntryKind::File,
                    mode,
                    content_digest: Some(digest_hex),
                    symlink_target: None,
                    degraded_symlink: false,
                });
            }
            EntryType::Symlink => {
                let link_target = entry
                    .link_name()
                    .map_err(|e| ExtractError::Malformed(e.to_string()))?
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();

                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|source| ExtractError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }

                let degraded = !symlinks_supported();
                if degraded {
                    std::fs::write(&target, link_target.as_bytes()).map_err(|source| {
                        ExtractError::Io {
                            path: target.clone(),
                            source,
                        }
                    })?;
                } else {
                    create_symlink(&link_target, &target).map_err(|source| ExtractError::Io {
                        path: target.clone(),
                        source,
                    })?;
                }

                manifest.entries.push(ManifestEntry {
                    path: relative_str,
                    kind: EntryKind::Symlink,
                    mode: DEFAULT_FILE_MODE,
                    content_digest: None,
                    symlink_target: Some(link_target),
                    degraded_symlink: degraded,
                });
            }
            other => {
                warn!(path = %relative_str, kind = ?other, "skipping unsupported tar entry kind");
            }
        }
    }

    Ok((manifest, files_ingested))
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, ExtractError> {
    if bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b {
        let mut decoder = flate2::read::GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|source| ExtractError::Io {
                path: PathBuf::from("<gzip-stream>"),
                source,
            })?;
        return Ok(out);
    }
    if bytes.len() >= 4 && bytes[0..4] == [0x28, 0xb5, 0x2f, 0xfd] {
        return zstd::stream::decode_all(bytes).map_err(|source| ExtractError::Io {
            path: PathBuf::from("<zstd-stream>"),
            source,
        });
    }
    Ok(bytes.to_vec())
}

/// Joins `relative` onto `base`, rejecting any path that would escape it
/// (`..` components, absolute components) — the same zip-slip guard
/// tarball extractors universally need.
fn safe_join(base: &Path, relative: &Path) -> Result<PathBuf, ExtractError> {
    use std::path::Component;
    let mut out = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractError::PathTraversal {
                    path: relative.to_string_lossy().into_owned(),
                })
            }
        }
    }
    Ok(out)
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut s = String::with_capacity(digest.len() * 2);
    use std::fmt::Write;
    for b in digest {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Hardlinks the pool entry into the staging tree, falling back to copy
/// across devices (e.g. the Store and a tmpfs-backed staging root).
fn link_or_copy(pool_path: &Path, target: &Path, mode: u32) -> Result<(), ExtractError> {
    match std::fs::hard_link(pool_path, target) {
        Ok(()) => {}
        Err(_) => {
            std::fs::copy(pool_path, target).map_err(|source| ExtractError::Io {
                path: target.to_path_buf(),
                source,
            })?;
        }
    }
    set_mode(target, mode);
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(unix)]
fn symlinks_supported() -> bool {
    true
}

#[cfg(not(unix))]
fn symlinks_supported() -> bool {
    // Creating a real symlink on Windows needs a privilege most CI/dev
    // installs don't have; degrade by default there.
    false
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn create_symlink(target: &str, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_rejects_parent_dir_escape() {
        let base = Path::new("/store/tmp/.staging-1");
        let err = safe_join(base, Path::new("../../etc/passwd")).unwrap_err();
        assert!(matches!(err, ExtractError::PathTraversal { .. }));
    }

    #[test]
    fn safe_join_accepts_normal_relative_path() {
        let base = Path::new("/store/tmp/.staging-1");
        let joined = safe_join(base, Path::new("lib/index.js")).unwrap();
        assert_eq!(joined, Path::new("/store/tmp/.staging-1/lib/index.js"));
    }

    #[test]
    fn decompress_passes_through_uncompressed_tar() {
        let plain = b"not actually gzip or zstd magic".to_vec();
        let out = decompress(&plain).unwrap();
        assert_eq!(out, plain);
    }
}
