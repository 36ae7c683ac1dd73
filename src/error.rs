//! Closed error taxonomy for the installer core.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while parsing or planning a lockfile.
#[derive(Debug, Error)]
pub enum LockfileError {
    #[error("failed to parse lockfile {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("lockfile entry {a} and {b} both claim install path {path}")]
    Conflict {
        path: String,
        a: String,
        b: String,
    },
    #[error("unsupported lockfile version {0}")]
    UnsupportedVersion(u32),
}

/// Errors raised while verifying tarball or file integrity.
#[derive(Debug, Clone, Error)]
pub enum IntegrityError {
    #[error("package {name}@{version} has no integrity field and verification is required")]
    Missing { name: String, version: String },
    #[error("package {name}@{version} integrity mismatch: expected {expected}, got {actual}")]
    Mismatch {
        name: String,
        version: String,
        expected: String,
        actual: String,
    },
}

/// Errors raised while fetching a tarball.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("fetch of {url} failed after {attempts} attempts: {message}")]
    Failed {
        url: String,
        attempts: u32,
        message: String,
    },
    #[error("fetch of {url} returned status {status}")]
    BadStatus { url: String, status: u16 },
    #[error("fetch of {url} timed out")]
    Timeout { url: String },
}

/// Errors raised while extracting a tarball into the store.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("tar entry {path} escapes its package root")]
    PathTraversal { path: String },
    #[error("failed to extract {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed tar stream: {0}")]
    Malformed(String),
}

/// Errors raised by the content-addressed store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store entry {0} is locked by a concurrent writer")]
    Busy(String),
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store entry {0} not found")]
    NotFound(String),
}

/// Errors raised while materializing a project tree.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("failed to materialize {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no materialization tier succeeded for {path}")]
    AllTiersFailed { path: PathBuf },
}

/// Errors raised while linking executable shims.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("failed to create shim {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bin target {0} does not exist in the extracted package")]
    MissingTarget(String),
}

/// Top-level error type returned from the crate's public API.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Lockfile(#[from] LockfileError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error(transparent)]
    Shim(#[from] ShimError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("package {name}@{version} skipped: unsupported on this platform")]
    PlatformSkip { name: String, version: String },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Wraps the two outcomes a single fetch attempt can fail with, so the
/// in-flight dedup slot (which must hold a `Clone`-able result shared by
/// every concurrent waiter) can carry either without collapsing a digest
/// mismatch into a generic fetch failure.
#[derive(Debug, Clone, Error)]
pub enum FetchOutcomeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

impl From<FetchOutcomeError> for CoreError {
    fn from(e: FetchOutcomeError) -> Self {
        match e {
            FetchOutcomeError::Fetch(e) => CoreError::Fetch(e),
            FetchOutcomeError::Integrity(e) => CoreError::Integrity(e),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
