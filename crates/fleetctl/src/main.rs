//! fleetctl — declarative fleet controller.
//!
//! One-shot command mode drives a single operation and exits with a code
//! describing what failed (0 ok, 1 argument/config, 2 cloud operation,
//! 3 internal). Daemon mode (`serve`) runs the background control loop
//! and the HTTP/SSE status surface.
//!
//! # Usage
//!
//! ```text
//! fleetctl --config fleet.yaml scale 5
//! fleetctl --config fleet.yaml rolling-restart
//! fleetctl --config fleet.yaml status
//! fleetctl --config fleet.yaml serve --listen 127.0.0.1:8080 --reconcile-every 30
//! ```

mod serve;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fleetctl_cloud::{CloudError, CloudProvider, SimCloud};
use fleetctl_config::{AuthMethod, ConfigError, FleetConfig};
use fleetctl_engine::{Engine, EngineError};
use fleetctl_ledger::{Ledger, LedgerError};
use fleetctl_metrics::Registry;

/// Invalid command-line input (maps to exit code 1, like config errors).
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

#[derive(Parser)]
#[command(name = "fleetctl", version, about = "Declarative compute fleet controller")]
struct Cli {
    /// Path to the fleet configuration file.
    #[arg(long, global = true, default_value = "fleet.yaml")]
    config: PathBuf,

    /// Path to the state ledger. Defaults to `.<fleet>.state.json` next
    /// to the configuration file.
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// With no subcommand, prints a one-line config summary.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Scale the fleet to a desired total number of instances.
    Scale {
        /// Desired total instance count.
        desired: i64,
    },

    /// Replace every active instance, one at a time.
    RollingRestart,

    /// Print local vs remote fleet status.
    Status,

    /// Rebuild the local ledger by querying the cloud for tagged instances.
    SyncState,

    /// Validate cloud authentication with a lightweight call.
    AuthValidate,

    /// Print a one-line summary of the loaded configuration.
    Summary,

    /// Run the daemon: HTTP API, SSE stream, and the control loop.
    Serve {
        /// Listen address (host:port, or a bare port for all interfaces).
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,

        /// Background reconcile interval in seconds.
        #[arg(long, default_value = "30")]
        reconcile_every: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetctl=debug".parse().expect("static filter parses")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = FleetConfig::from_file(&cli.config)?;
    let fleet = cfg.metadata.name.clone();
    let ledger = Arc::new(Ledger::new(ledger_path(&cli.state, &cli.config, &fleet)));
    let metrics = Arc::new(Registry::new());

    match cli.command {
        None | Some(Command::Summary) => {
            println!("{}", cfg.summary());
            Ok(())
        }

        Some(Command::AuthValidate) => {
            let provider = build_provider(&cfg)?;
            let info = provider.validate_info().await?;
            println!("Auth validation succeeded");
            println!("  region: {}", info.region);
            if !info.tenancy.is_empty() {
                println!("  tenancy: {}", info.tenancy);
            }
            if info.user.is_empty() {
                println!("  user: (instance principal)");
            } else {
                println!("  user: {}", info.user);
            }
            println!("  regions_available: {}", info.regions_count);
            if !info.subscribed_regions.is_empty() {
                println!("  subscriptions: {}", info.subscribed_regions.join(","));
            }
            Ok(())
        }

        Some(Command::Scale { desired }) => {
            if desired < 0 {
                return Err(UsageError("desired must be >= 0".into()).into());
            }
            let engine = build_engine(cfg, ledger, metrics)?;
            engine.scale(desired as usize).await?;
            Ok(())
        }

        Some(Command::RollingRestart) => {
            let engine = build_engine(cfg, ledger, metrics)?;
            engine.rolling_restart().await?;
            Ok(())
        }

        Some(Command::Status) => {
            let engine = build_engine(cfg, ledger, metrics)?;
            println!("{}", engine.status_compare().await?);
            Ok(())
        }

        Some(Command::SyncState) => {
            let engine = build_engine(cfg, Arc::clone(&ledger), metrics)?;
            engine.sync_state().await?;
            println!("{}", ledger.summary(&fleet)?);
            Ok(())
        }

        Some(Command::Serve {
            listen,
            reconcile_every,
        }) => {
            let engine = build_engine(cfg, ledger, metrics)?;
            serve::serve(
                engine,
                cli.config.clone(),
                listen,
                Duration::from_secs(reconcile_every),
            )
            .await
        }
    }
}

/// Default ledger location: alongside the config, named after the fleet.
fn ledger_path(explicit: &Option<PathBuf>, config_path: &Path, fleet: &str) -> PathBuf {
    match explicit {
        Some(path) => path.clone(),
        None => config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(".{fleet}.state.json")),
    }
}

fn build_provider(cfg: &FleetConfig) -> Result<Arc<dyn CloudProvider>, CloudError> {
    match cfg.spec.auth.method {
        AuthMethod::Simulated => Ok(Arc::new(SimCloud::new())),
        AuthMethod::Instance | AuthMethod::User => Err(CloudError::Unsupported(format!(
            "auth method {:?} requires an SDK-backed provider; this build ships only the \
             simulated backend (spec.auth.method: simulated)",
            cfg.spec.auth.method
        ))),
    }
}

fn build_engine(
    cfg: FleetConfig,
    ledger: Arc<Ledger>,
    metrics: Arc<Registry>,
) -> anyhow::Result<Arc<Engine>> {
    let provider = build_provider(&cfg)?;
    Ok(Arc::new(Engine::new(cfg, provider, ledger, metrics)))
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<UsageError>().is_some() || err.downcast_ref::<ConfigError>().is_some() {
        return 1;
    }
    if let Some(engine_err) = err.downcast_ref::<EngineError>() {
        return if engine_err.is_cloud() { 2 } else { 3 };
    }
    if err.downcast_ref::<CloudError>().is_some() {
        return 2;
    }
    if err.downcast_ref::<LedgerError>().is_some() {
        return 3;
    }
    3
}
