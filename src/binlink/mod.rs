//! Executable shim generation under each scope's `.bin` directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::ShimError;
use crate::plan::ShimEntry;

#[derive(Debug, Default, Clone)]
pub struct BinStats {
    pub created: u64,
    pub skipped_collisions: u64,
}

/// Creates every shim in `entries` under `project_root`, resolving each
/// target relative to its owning package's install path. Collisions
/// within a single `.bin` scope are first-writer-wins: later entries are
/// recorded and skipped, never overwritten.
pub async fn link_bins(
    project_root: &Path,
    entries: &[ShimEntry],
    stats: &tokio::sync::Mutex<BinStats>,
) -> Vec<ShimError> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut errors = Vec::new();

    for entry in entries {
        let key = (entry.scope.clone(), entry.name.clone());
        if !seen.insert(key) {
            let mut s = stats.lock().await;
            s.skipped_collisions += 1;
            warn!(scope = %entry.scope, name = %entry.name, "duplicate bin name in scope, first writer wins");
            continue;
        }

        match link_one(project_root, entry).await {
            Ok(()) => {
                let mut s = stats.lock().await;
                s.created += 1;
            }
            Err(e) => errors.push(e),
        }
    }

    errors
}

async fn link_one(project_root: &Path, entry: &ShimEntry) -> Result<(), ShimError> {
    let scope_dir = project_root.join(&entry.scope);
    tokio::fs::create_dir_all(&scope_dir)
        .await
        .map_err(|source| ShimError::Io {
            path: scope_dir.clone(),
            source,
        })?;

    let owner_dir = project_root.join(&entry.owner_install_path);
    let target_abs = owner_dir.join(&entry.target_relative);

    if tokio::fs::metadata(&target_abs).await.is_err() {
        return Err(ShimError::MissingTarget(entry.target_relative.clone()));
    }

    let target_relative_to_scope = relative_from(&scope_dir, &target_abs);

    if symlinks_supported() {
        let shim_path = scope_dir.join(&entry.name);
        remove_existing_shim(&shim_path).await?;
        create_symlink(&target_relative_to_scope, &shim_path).map_err(|source| ShimError::Io {
            path: shim_path,
            source,
        })?;
        set_executable(&target_abs);
    } else {
        for suffix in ["", ".cmd", ".ps1"] {
            remove_existing_shim(&scope_dir.join(format!("{}{suffix}", entry.name))).await?;
        }
        write_launcher_trio(&scope_dir, &entry.name, &target_relative_to_scope).await?;
    }

    Ok(())
}

/// Removes whatever a prior run left at `path` so recreating the shim
/// never trips `EEXIST` on a rerun, the same idempotence orogene's
/// `link_bins` gets by clearing its `.bin` scope before relinking.
async fn remove_existing_shim(path: &Path) -> Result<(), ShimError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => tokio::fs::remove_file(path)
            .await
            .map_err(|source| ShimError::Io {
                path: path.to_path_buf(),
                source,
            }),
        Err(_) => Ok(()),
    }
}

/// A naive relative-path computation good enough for sibling
/// `.bin -> ../pkg/...` shapes; project trees are shallow and
/// predictable so this never needs to walk shared ancestors beyond one
/// or two levels.
fn relative_from(from_dir: &Path, to: &Path) -> String {
    pathdiff::diff_paths(to, from_dir)
        .unwrap_or_else(|| to.to_path_buf())
        .to_string_lossy()
        .replace('\\', "/")
}

async fn write_launcher_trio(scope_dir: &Path, name: &str, target: &str) -> Result<(), ShimError> {
    let sh_path = scope_dir.join(name);
    let cmd_path = scope_dir.join(format!("{name}.cmd"));
    let ps1_path = scope_dir.join(format!("{name}.ps1"));

    let sh_body = format!(
        "#!/bin/sh\nbasedir=$(dirname \"$0\")\nexec node \"$basedir/{target}\" \"$@\"\n"
    );
    let cmd_body = format!(
        "@ECHO off\r\nnode \"%~dp0\\{target}\" %*\r\n"
    );
    let ps1_body = format!(
        "#!/usr/bin/env pwsh\n$basedir = Split-Path -Parent $MyInvocation.MyCommand.Definition\n& node \"$basedir/{target}\" $args\n"
    );

    tokio::fs::write(&sh_path, sh_body)
        .await
        .map_err(|source| ShimError::Io { path: sh_path.clone(), source })?;
    set_executable(&sh_path);
    tokio::fs::write(&cmd_path, cmd_body)
        .await
        .map_err(|source| ShimError::Io { path: cmd_path, source })?;
    tokio::fs::write(&ps1_path, ps1_body)
        .await
        .map_err(|source| ShimError::Io { path: ps1_path, source })?;

    Ok(())
}

#[cfg(unix)]
fn symlinks_supported() -> bool {
    true
}

#[cfg(not(unix))]
fn symlinks_supported() -> bool {
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

#[cfg(unix)]
fn set_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() | 0o111);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) {}
