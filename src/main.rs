//! # corepm CLI
//!
//! Thin command-line wrapper around the installer core: argument parsing,
//! logging setup, and translating `CoreResult`/`InstallReport` into process
//! exit codes. No business logic lives here.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use corepm::config::{CoreConfig, LinkStrategy as CfgLinkStrategy, VerifyPolicy};
use corepm::error::CoreError;
use corepm::pipeline::{CancellationToken, InstallOptions};
use corepm::store::Store;

#[derive(Parser)]
#[command(
    name = "corepm",
    version = env!("CARGO_PKG_VERSION"),
    about = "Lockfile-driven dependency installer core"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a lockfile into a project tree: fetch, extract, materialize, link bins.
    Install {
        #[arg(long)]
        project_root: PathBuf,

        #[arg(long, default_value = "corepm.lock.json")]
        lockfile: PathBuf,

        #[arg(long)]
        cache_root: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "auto")]
        link_strategy: LinkStrategyArg,

        #[arg(long, value_enum, default_value = "required")]
        verify: VerifyArg,

        /// Accepted for CLI-surface compatibility; lifecycle scripts are
        /// an excluded peripheral concern of this core.
        #[arg(long, value_enum, default_value = "off")]
        scripts: ScriptsArg,

        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Materialize a single Store package entry at a destination path.
    Materialize {
        #[arg(long)]
        src: PathBuf,

        #[arg(long)]
        dest: PathBuf,

        #[arg(long, value_enum, default_value = "auto")]
        link_strategy: LinkStrategyArg,
    },

    /// Read-only recursive dependency scan. Not implemented by this core.
    Scan {
        #[arg(long)]
        root: PathBuf,
    },

    /// Dependency/license/vulnerability analysis. Not implemented by this core.
    Analyze {
        #[arg(long)]
        root: PathBuf,
    },

    #[command(subcommand)]
    Store(StoreCommands),
}

#[derive(Subcommand)]
enum StoreCommands {
    /// Show Store statistics (package/file counts).
    Stats {
        #[arg(long)]
        cache_root: Option<PathBuf>,
    },
    /// Verify a single Store package entry still matches its recorded manifest.
    Verify {
        #[arg(long)]
        cache_root: Option<PathBuf>,
        #[arg(long)]
        digest: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LinkStrategyArg {
    Auto,
    Clone,
    Hardlink,
    Copy,
}

impl From<LinkStrategyArg> for CfgLinkStrategy {
    fn from(v: LinkStrategyArg) -> Self {
        match v {
            LinkStrategyArg::Auto => CfgLinkStrategy::Auto,
            LinkStrategyArg::Clone => CfgLinkStrategy::Clone,
            LinkStrategyArg::Hardlink => CfgLinkStrategy::Hardlink,
            LinkStrategyArg::Copy => CfgLinkStrategy::Copy,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum VerifyArg {
    Required,
    IfPresent,
    Skip,
}

impl From<VerifyArg> for VerifyPolicy {
    fn from(v: VerifyArg) -> Self {
        match v {
            VerifyArg::Required => VerifyPolicy::Strict,
            VerifyArg::IfPresent => VerifyPolicy::BestEffort,
            VerifyArg::Skip => VerifyPolicy::Skip,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ScriptsArg {
    Off,
    Rebuild,
}

#[tokio::main]
async fn main() {
    corepm::init_logging();

    let cli = Cli::parse();
    let exit_code = match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("corepm: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(command: Commands) -> Result<i32, CoreError> {
    match command {
        Commands::Install {
            project_root,
            lockfile,
            cache_root,
            link_strategy,
            verify,
            scripts: _scripts,
            concurrency,
        } => {
            let mut config = CoreConfig::load(None).map_err(|e| CoreError::Config(e.to_string()))?;
            if let Some(root) = cache_root {
                config.store_path = root;
            }
            config.link_strategy = link_strategy.into();
            config.verify_policy = verify.into();
            if let Some(n) = concurrency {
                config.fetch_concurrency = n;
            }

            let opts = InstallOptions {
                project_root,
                lockfile_path: lockfile,
                config,
                cancellation: CancellationToken::new(),
            };

            let report = corepm::run_install(opts).await;
            let json = report
                .to_json()
                .map_err(|e| CoreError::Config(e.to_string()))?;
            println!("{json}");
            Ok(if report.error.is_some() { 1 } else { 0 })
        }

        Commands::Materialize {
            src,
            dest,
            link_strategy,
        } => {
            let strategy: CfgLinkStrategy = link_strategy.into();
            corepm::materialize::run_standalone(&src, &dest, strategy).await?;
            Ok(0)
        }

        Commands::Scan { root: _ } | Commands::Analyze { root: _ } => {
            Err(CoreError::Unsupported(
                "scan/analyze are part of the excluded peripheral CLI, not this core",
            ))
        }

        Commands::Store(cmd) => run_store_command(cmd).await,
    }
}

async fn run_store_command(cmd: StoreCommands) -> Result<i32, CoreError> {
    match cmd {
        StoreCommands::Stats { cache_root } => {
            let config = CoreConfig::load(None).map_err(|e| CoreError::Config(e.to_string()))?;
            let root = cache_root.unwrap_or(config.store_path);
            let store = Store::new(root)?;
            let stats = corepm::store::layout_stats(store.layout()).await?;
            println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_default());
            Ok(0)
        }
        StoreCommands::Verify { cache_root, digest } => {
            let config = CoreConfig::load(None).map_err(|e| CoreError::Config(e.to_string()))?;
            let root = cache_root.unwrap_or(config.store_path);
            let store = Store::new(root)?;
            let handle = store.open_package(&digest).await?;
            let ok = corepm::store::verify_package(&handle).await?;
            if ok {
                println!("ok");
                Ok(0)
            } else {
                println!("mismatch");
                Ok(1)
            }
        }
    }
}
