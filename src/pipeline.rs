//! Thin orchestrator: parse → plan → fetch → extract → materialize →
//! link → report.

use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};

use crate::binlink::{self, BinStats};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult, IntegrityError};
use crate::extract::{self, ExtractedPackage};
use crate::fetch::{FetchRequest, FetchStats, Fetcher};
use crate::lockfile;
use crate::materialize::{CapabilityTable, MaterializeStats, Materializer};
use crate::plan::{self, HostPlatform, InstallPlan, PlacementKind};
use crate::report::InstallReport;
use crate::store::Store;

/// Run-level cancellation flag, checked at every suspension point per
/// the concurrency model. A plain atomic is enough: the core has no
/// need for `tokio_util`'s richer `CancellationToken` since there is
/// exactly one cancellation signal per run, never a tree of them.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct InstallOptions {
    pub project_root: PathBuf,
    pub lockfile_path: PathBuf,
    pub config: CoreConfig,
    pub cancellation: CancellationToken,
}

/// Runs a full install: parse the lockfile, compute the plan, fetch and
/// extract everything missing from the Store, materialize the tree, and
/// link executables. Always returns a populated `InstallReport`, even on
/// failure — the `error` field carries the terminal error and the prior
/// project tree is left untouched, per the atomicity invariant. Callers
/// that need a hard failure signal (e.g. a process exit code) should
/// check `report.error.is_some()`.
pub async fn run_install(opts: InstallOptions) -> InstallReport {
    let run_id = generate_run_id();
    let started_at = now_rfc3339();
    let span = info_span!("install", run_id = %run_id);

    async move {
        let mut report = InstallReport::new(
            run_id.clone(),
            started_at.clone(),
            opts.project_root.to_string_lossy().into_owned(),
        );

        if let Err(e) = run_install_inner(&opts, &mut report).await {
            error!(error = %e, "install run failed");
            report = report.with_error(error_kind(&e), e.to_string());
        }
        report.ended_at = now_rfc3339();
        report
    }
    .instrument(span)
    .await
}

async fn run_install_inner(opts: &InstallOptions, report: &mut InstallReport) -> CoreResult<()> {
    let store = Store::new(opts.config.store_path.clone())?;

    let lockfile_bytes = tokio::fs::read(&opts.lockfile_path).await?;
    let nodes = lockfile::parse(&lockfile_bytes, &opts.lockfile_path)?;

    let install_plan = plan::build_plan(nodes, HostPlatform::current(), opts.config.verify_policy)?;
    report.apply_plan(&install_plan);

    if opts.cancellation.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    if install_plan.is_empty() {
        info!("empty plan, nothing to do");
        return Ok(());
    }

    let fetch_stats = tokio::sync::Mutex::new(FetchStats::default());
    let extracted = fetch_and_extract_missing(&store, &opts.config, &install_plan, opts.cancellation.clone(), &fetch_stats).await?;
    report.apply_fetch(&fetch_stats.lock().await.clone());
    report.apply_extract(&extracted);

    if opts.cancellation.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    let materialize_stats = tokio::sync::Mutex::new(MaterializeStats::default());
    materialize_plan(
        &store,
        &opts.project_root,
        &install_plan,
        opts.config.link_strategy,
        &materialize_stats,
    )
    .await?;
    report.apply_materialize(&materialize_stats.lock().await.clone());

    let bin_stats = tokio::sync::Mutex::new(BinStats::default());
    let shim_errors = binlink::link_bins(&opts.project_root, &install_plan.shims, &bin_stats).await;
    for e in &shim_errors {
        tracing::warn!(error = %e, "non-fatal shim error");
    }
    report.apply_bin(&bin_stats.lock().await.clone());

    Ok(())
}

/// Fetches and extracts every digest referenced by the plan that the
/// Store doesn't already have. Extraction for every referenced digest
/// happens-before materialization starts, enforced by simply awaiting
/// this function's completion before calling `materialize_plan`.
async fn fetch_and_extract_missing(
    store: &Store,
    cfg: &CoreConfig,
    install_plan: &InstallPlan,
    cancellation: CancellationToken,
    fetch_stats: &tokio::sync::Mutex<FetchStats>,
) -> CoreResult<Vec<ExtractedPackage>> {
    let fetcher = Arc::new(Fetcher::new(cfg)?);

    let mut requests = Vec::new();
    for placement in &install_plan.placements {
        if !matches!(placement.kind, PlacementKind::Real) {
            continue;
        }
        let Some(digest_hex) = placement_digest(placement) else {
            continue;
        };
        if store.has_package(&digest_hex).await {
            continue;
        }
        let Some(url) = placement.descriptor.resolved.clone() else {
            continue;
        };
        requests.push(FetchRequest {
            digest_hex,
            url,
            integrity: placement.descriptor.integrity.clone(),
            name: placement.descriptor.name.clone(),
            version: placement.descriptor.version.clone(),
        });
    }

    // Dedup by digest: several placements can reference the same
    // tarball (e.g. hoisted duplicates).
    requests.sort_by(|a, b| a.digest_hex.cmp(&b.digest_hex));
    requests.dedup_by(|a, b| a.digest_hex == b.digest_hex);

    let concurrency = cfg.fetch_concurrency.max(1);
    let results: Vec<CoreResult<ExtractedPackage>> = stream::iter(requests.into_iter())
        .map(|req| {
            let fetcher = fetcher.clone();
            let store = store.clone();
            let cancellation = cancellation.clone();
            async move {
                if cancellation.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                let bytes = fetcher.fetch_one(&req, fetch_stats).await?;
                let extracted = extract::extract_tarball(&store, &bytes).await?;
                store
                    .commit_package(&req.digest_hex, &extracted.staging_dir, &extracted.manifest)
                    .await?;
                Ok(extracted)
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut out = Vec::with_capacity(results.len());
    for r in results {
        out.push(r?);
    }
    Ok(out)
}

async fn materialize_plan(
    store: &Store,
    project_root: &Path,
    install_plan: &InstallPlan,
    strategy: crate::config::LinkStrategy,
    stats: &tokio::sync::Mutex<MaterializeStats>,
) -> CoreResult<()> {
    let capabilities = CapabilityTable::new();
    let materializer = Materializer::new(strategy, &capabilities);

    // Placements are already ordered shallow-to-deep with links after
    // real placements at equal depth, so a single sequential pass over
    // `install_plan.placements` already respects parent-before-child.
    for placement in &install_plan.placements {
        let target = project_root.join(&placement.install_path);
        match &placement.kind {
            PlacementKind::Real => {
                let Some(digest_hex) = placement_digest(placement) else {
                    continue;
                };
                let handle = store.open_package(&digest_hex).await?;
                materializer.materialize_package(&handle, &target, stats).await?;
            }
            PlacementKind::WorkspaceLink { source } => {
                link_workspace(project_root, &target, source).await?;
            }
        }
    }

    Ok(())
}

async fn link_workspace(project_root: &Path, target: &Path, source: &str) -> CoreResult<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let source_abs = project_root.join(source);
    let relative = pathdiff::diff_paths(&source_abs, target.parent().unwrap_or(project_root))
        .unwrap_or(source_abs);
    if tokio::fs::symlink_metadata(target).await.is_ok() {
        tokio::fs::remove_file(target).await.ok();
    }
    create_symlink(&relative.to_string_lossy(), target)?;
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn create_symlink(target: &str, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Store keys are path components, so an integrity digest (base64, which
/// may contain `/`) is hex-encoded before use rather than used raw.
fn placement_digest(placement: &crate::plan::Placement) -> Option<String> {
    let raw = placement
        .descriptor
        .integrity
        .as_ref()
        .map(|i| i.digest.clone())
        .unwrap_or_else(|| {
            // Best-effort policy with no integrity field: derive a
            // stable synthetic key so the Store can still dedup by
            // name+version within this run.
            format!("{}@{}", placement.descriptor.name, placement.descriptor.version)
        });
    Some(hex_encode_str(&raw))
}

fn hex_encode_str(s: &str) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(s.len() * 2);
    for b in s.as_bytes() {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn error_kind(e: &CoreError) -> &'static str {
    match e {
        CoreError::Lockfile(crate::error::LockfileError::Conflict { .. }) => "LockfileConflict",
        CoreError::Lockfile(_) => "LockfileParse",
        CoreError::Integrity(IntegrityError::Missing { .. }) => "IntegrityMissing",
        CoreError::Integrity(IntegrityError::Mismatch { .. }) => "IntegrityMismatch",
        CoreError::Fetch(_) => "FetchFailed",
        CoreError::Extract(_) => "ExtractFailed",
        CoreError::Store(_) => "StoreBusy",
        CoreError::Materialize(_) => "MaterializeFailed",
        CoreError::Shim(_) => "ShimFailed",
        CoreError::Cancelled => "Cancelled",
        CoreError::PlatformSkip { .. } => "PlatformSkip",
        _ => "Unknown",
    }
}

fn generate_run_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("run-{:x}-{}", nanos, std::process::id())
}

/// Minimal UTC RFC3339 timestamp with no date/time crate: civil-from-days
/// conversion (Howard Hinnant's algorithm), seconds resolution.
fn now_rfc3339() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0) as i64;
    let days = secs.div_euclid(86_400);
    let time_of_day = secs.rem_euclid(86_400);
    let (y, m, d) = civil_from_days(days);
    let hh = time_of_day / 3600;
    let mm = (time_of_day % 3600) / 60;
    let ss = time_of_day % 60;
    format!("{y:04}-{m:02}-{d:02}T{hh:02}:{mm:02}:{ss:02}Z")
}

fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as i64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}
