//! # corepm
//!
//! A fast, lockfile-driven dependency installer core: given a resolved
//! lockfile, it fetches tarballs into a content-addressed store,
//! verifies their integrity, and materializes a project's `node_modules`
//! tree via the cheapest filesystem operation the host supports
//! (reflink clone, then hardlink, then copy).
//!
//! ```text
//! lockfile -> plan -> fetch (dedup + verify) -> extract -> store
//!                                                    |
//!                                                    v
//!                                  materialize (clone/hardlink/copy) -> bin shims
//! ```
//!
//! No version resolution happens here: the lockfile is taken as the
//! final word on what gets placed where.

pub mod binlink;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod lockfile;
pub mod manifest;
pub mod materialize;
pub mod pipeline;
pub mod plan;
pub mod report;
pub mod store;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use pipeline::{run_install, CancellationToken, InstallOptions};
pub use report::InstallReport;
pub use store::Store;

/// Initializes the crate's tracing subscriber from `RUST_LOG`, defaulting
/// to `info` when unset. Call once from a binary's `main`.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}
