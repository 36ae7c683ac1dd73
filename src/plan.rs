//! Pure lockfile-to-install-plan transformation. No I/O.

use std::collections::BTreeMap;

use crate::config::VerifyPolicy;
use crate::error::{CoreError, IntegrityError, LockfileError};
use crate::lockfile::{LockfileNode, PackageDescriptor};

/// What a placement is made of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementKind {
    /// A real package, materialized from a Store entry.
    Real,
    /// A symlink (or junction) to a workspace source path.
    WorkspaceLink { source: String },
}

/// A single resolved placement in the plan.
#[derive(Debug, Clone)]
pub struct Placement {
    pub install_path: String,
    pub kind: PlacementKind,
    pub descriptor: PackageDescriptor,
    /// Depth used for shallow-to-deep ordering (count of path separators).
    pub depth: usize,
}

/// A shim to create under a `.bin` scope once materialization completes.
#[derive(Debug, Clone)]
pub struct ShimEntry {
    /// The `.bin` scope this shim lives under, e.g. `node_modules/.bin`.
    pub scope: String,
    /// Executable name, e.g. `tool`.
    pub name: String,
    /// Path to the target script, relative to the package's install path.
    pub target_relative: String,
    /// Install path of the owning package (for resolving the absolute
    /// target once materialized).
    pub owner_install_path: String,
}

/// A placement that was excluded because its `os`/`cpu` filter does not
/// match the current platform.
#[derive(Debug, Clone)]
pub struct SkippedPlacement {
    pub install_path: String,
    pub name: String,
    pub version: String,
}

/// The full install plan: ordered placements, shims, and skips.
#[derive(Debug, Clone, Default)]
pub struct InstallPlan {
    pub placements: Vec<Placement>,
    pub shims: Vec<ShimEntry>,
    pub skipped: Vec<SkippedPlacement>,
}

impl InstallPlan {
    pub fn is_empty(&self) -> bool {
        self.placements.is_empty() && self.shims.is_empty()
    }
}

/// Host platform tags used to evaluate `os`/`cpu` filters. Exposed so
/// tests can inject a platform different from the host running them.
#[derive(Debug, Clone, Copy)]
pub struct HostPlatform {
    pub os: &'static str,
    pub cpu: &'static str,
}

impl HostPlatform {
    pub fn current() -> Self {
        HostPlatform {
            os: std::env::consts::OS,
            cpu: std::env::consts::ARCH,
        }
    }
}

fn matches_platform(tags: &[String], host_value: &str) -> bool {
    if tags.is_empty() {
        return true;
    }
    // A leading `!` negates the tag (excludes that platform); otherwise
    // the list is an allow-list.
    let (negated, positive): (Vec<&str>, Vec<&str>) =
        tags.iter().map(String::as_str).partition(|t| t.starts_with('!'));
    if negated.iter().any(|t| &t[1..] == host_value) {
        return false;
    }
    if positive.is_empty() {
        return true;
    }
    positive.iter().any(|t| *t == host_value)
}

fn depth_of(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

/// Build an install plan from parsed lockfile nodes.
///
/// Ordering: shallow-to-deep, then lexicographic within a depth, then
/// workspace links are stably moved after real placements that share
/// their exact scope depth (so a `.bin` scope sees every real package
/// before any workspace link lands in it).
pub fn build_plan(
    nodes: Vec<LockfileNode>,
    host: HostPlatform,
    verify_policy: VerifyPolicy,
) -> Result<InstallPlan, CoreError> {
    let mut real = Vec::new();
    let mut links = Vec::new();
    let mut skipped = Vec::new();
    let mut shims = Vec::new();

    for node in nodes {
        let platform_ok = matches_platform(&node.descriptor.os, host.os)
            && matches_platform(&node.descriptor.cpu, host.cpu);

        if !platform_ok {
            skipped.push(SkippedPlacement {
                install_path: node.install_path,
                name: node.descriptor.name,
                version: node.descriptor.version,
            });
            continue;
        }

        if !node.link && node.descriptor.integrity.is_none() && verify_policy == VerifyPolicy::Strict {
            return Err(CoreError::Integrity(IntegrityError::Missing {
                name: node.descriptor.name,
                version: node.descriptor.version,
            }));
        }

        let depth = depth_of(&node.install_path);

        if !node.descriptor.bin.is_empty() {
            if let Some(scope) = bin_scope_for(&node.install_path) {
                for (name, target_relative) in &node.descriptor.bin {
                    shims.push(ShimEntry {
                        scope: scope.clone(),
                        name: name.clone(),
                        target_relative: target_relative.clone(),
                        owner_install_path: node.install_path.clone(),
                    });
                }
            }
        }

        if node.link {
            let source = node
                .workspace_source
                .clone()
                .unwrap_or_else(|| node.install_path.clone());
            links.push(Placement {
                install_path: node.install_path,
                kind: PlacementKind::WorkspaceLink { source },
                descriptor: node.descriptor,
                depth,
            });
        } else {
            real.push(Placement {
                install_path: node.install_path,
                kind: PlacementKind::Real,
                descriptor: node.descriptor,
                depth,
            });
        }
    }

    sort_placements(&mut real);
    sort_placements(&mut links);

    check_no_path_collisions(&real, &links)?;

    let mut placements = real;
    placements.extend(links);

    shims.sort_by(|a, b| (&a.scope, &a.name).cmp(&(&b.scope, &b.name)));

    Ok(InstallPlan {
        placements,
        shims,
        skipped,
    })
}

fn sort_placements(placements: &mut [Placement]) {
    placements.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.install_path.cmp(&b.install_path)));
}

fn check_no_path_collisions(
    real: &[Placement],
    links: &[Placement],
) -> Result<(), LockfileError> {
    let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
    for p in real.iter().chain(links.iter()) {
        if let Some(existing) = seen.insert(&p.install_path, p.descriptor.name.as_str()) {
            return Err(LockfileError::Conflict {
                path: p.install_path.clone(),
                a: existing.to_string(),
                b: p.descriptor.name.clone(),
            });
        }
    }
    Ok(())
}

/// The `.bin` scope that encloses an install path: the parent's own
/// `.bin` directory, e.g. `node_modules/a` -> `node_modules/.bin`,
/// `node_modules/@scope/a` -> `node_modules/.bin`.
fn bin_scope_for(install_path: &str) -> Option<String> {
    let parts: Vec<&str> = install_path.split('/').collect();
    if parts.is_empty() {
        return None;
    }
    // Drop the package segment (and the scope segment if present).
    let mut end = parts.len() - 1;
    if end > 0 && parts[end].starts_with('@') {
        // shouldn't happen (scope is its own segment before the name) but
        // guards against a malformed single-segment scoped path.
        end -= 1;
    }
    if end > 0 && parts[end - 1].starts_with('@') {
        end -= 1;
    }
    if end == 0 {
        return None;
    }
    Some(format!("{}/.bin", parts[..end].join("/")))
}
