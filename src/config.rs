//! # Configuration
//!
//! `CoreConfig` is assembled from an optional TOML file, then overridden by
//! CLI flags and environment variables. Every field has a sane default so a
//! bare `CoreConfig::default()` is already usable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Env var pinning the store root, overriding the XDG/OS cache default.
pub const ENV_CORE_PATH: &str = "BETTER_CORE_PATH";
/// Env var disabling any compiled-in Rust acceleration binary the host
/// ecosystem might otherwise prefer to shell out to.
pub const ENV_NO_RUST_BINARY: &str = "BETTER_NO_RUST_BINARY";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML syntax in {path}: {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Materialization tier selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkStrategy {
    /// Probe filesystem capability and pick the fastest tier per package.
    Auto,
    /// Always attempt a reflink/clone, demoting on a real OS error only.
    Clone,
    /// Always attempt a hardlink, demoting on a real OS error only.
    Hardlink,
    /// Always copy.
    Copy,
}

impl Default for LinkStrategy {
    fn default() -> Self {
        LinkStrategy::Auto
    }
}

/// Integrity verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyPolicy {
    /// Every placed package must carry an integrity field; missing is fatal.
    Strict,
    /// Verify when present, warn and proceed when absent.
    BestEffort,
    /// Never require or check an integrity digest, even when present.
    Skip,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        VerifyPolicy::Strict
    }
}

/// Root configuration structure for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Root of the content-addressed store.
    pub store_path: PathBuf,

    /// Maximum concurrent in-flight network fetches.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Maximum concurrent filesystem write tasks (materialize/extract).
    #[serde(default = "default_fs_concurrency")]
    pub fs_concurrency: usize,

    /// Materialization strategy.
    pub link_strategy: LinkStrategy,

    /// Integrity verification policy.
    pub verify_policy: VerifyPolicy,

    /// Per-attempt connect timeout, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request total timeout, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum fetch retry attempts before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Whether to skip the installer's own compiled acceleration path
    /// (mirrors `BETTER_NO_RUST_BINARY`, kept for hosts that shell out to
    /// this binary from a JS wrapper and want a pure-script fallback path
    /// available for comparison).
    #[serde(default)]
    pub no_rust_binary: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            store_path: default_store_path(),
            fetch_concurrency: default_fetch_concurrency(),
            fs_concurrency: default_fs_concurrency(),
            link_strategy: LinkStrategy::default(),
            verify_policy: VerifyPolicy::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            no_rust_binary: false,
        }
    }
}

impl CoreConfig {
    /// Load a config file if present, then apply environment overrides.
    /// Missing files are not an error: the caller gets pure defaults plus
    /// env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text).map_err(|source| ConfigError::TomlParse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            Some(path) => {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                })
            }
            None => CoreConfig::default(),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ENV_CORE_PATH) {
            if !path.is_empty() {
                self.store_path = PathBuf::from(path);
            }
        }
        if let Ok(val) = std::env::var(ENV_NO_RUST_BINARY) {
            self.no_rust_binary = val == "1" || val.eq_ignore_ascii_case("true");
        }
    }
}

fn default_store_path() -> PathBuf {
    if let Ok(path) = std::env::var(ENV_CORE_PATH) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs_cache_root().join("corepm").join("store")
}

/// Minimal XDG/OS cache root resolution, no extra crate needed: the
/// teacher's own `config.rs` resolves paths by hand the same way.
fn dirs_cache_root() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".cache");
    }
    std::env::temp_dir()
}

fn default_fetch_concurrency() -> usize {
    16
}

fn default_fs_concurrency() -> usize {
    (num_cpus() * 2).max(2)
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_max_retries() -> u32 {
    5
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
