//! CLI application: the explicit startup routine for the database layer.

use clap::{Parser, Subcommand};
use dbstrap_config::{parse_override, ConfigError, ConfigLoader, ConfigSource};
use dbstrap_db::{
    bootstrap, Backend, Bootstrapped, MigrationRunnerDescriptor, PoolDescriptor, StartupReport,
};
use dbstrap_telemetry::{append_audit_record, init_logging, LogFormat};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dbstrap")]
#[command(about = "Connection pool and schema migration bootstrap")]
struct Cli {
    /// Directory holding application.toml and its profile overlays
    #[arg(long, env = "DBSTRAP_CONFIG_DIR", default_value = "config", global = true)]
    config_dir: PathBuf,

    /// Activate an additional profile (repeatable)
    #[arg(long = "profile", global = true)]
    profiles: Vec<String>,

    /// Override a property (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_set, global = true)]
    overrides: Vec<(String, String)>,

    /// Log filter, e.g. "info" or "dbstrap_db=debug"
    #[arg(long, env = "DBSTRAP_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Log output format: json or pretty
    #[arg(long, default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the configuration and print it without connecting
    Check,
    /// Open the pool, apply pending change sets, then exit
    Migrate {
        /// Append a JSON startup record to this file
        #[arg(long)]
        audit_path: Option<PathBuf>,
    },
    /// Open the pool, apply pending change sets, and hold the pool until Ctrl-C
    Run {
        /// Append a JSON startup record to this file
        #[arg(long)]
        audit_path: Option<PathBuf>,
    },
}

fn parse_set(raw: &str) -> Result<(String, String), ConfigError> {
    parse_override(raw)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref(), cli.log_format)?;

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Check => check(&config)?,
        Commands::Migrate { audit_path } => {
            let bootstrapped = start(&config, audit_path.as_deref()).await?;
            bootstrapped.shutdown().await;
        }
        Commands::Run { audit_path } => {
            let bootstrapped = start(&config, audit_path.as_deref()).await?;
            hold_until_shutdown(bootstrapped, tokio::signal::ctrl_c()).await?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<ConfigSource> {
    let mut loader = ConfigLoader::new().config_dir(&cli.config_dir);
    for profile in &cli.profiles {
        loader = loader.profile(profile);
    }
    for (key, value) in &cli.overrides {
        loader = loader.override_property(key, value);
    }
    Ok(loader.load()?)
}

async fn start(config: &ConfigSource, audit_path: Option<&Path>) -> anyhow::Result<Bootstrapped> {
    info!(profiles = ?config.active_profiles(), "Starting database bootstrap");

    match bootstrap(config).await {
        Ok(bootstrapped) => {
            let audit = append_audit_record(
                audit_path,
                &StartupReport::succeeded(config, &bootstrapped),
            );
            if let Err(e) = audit {
                bootstrapped.shutdown().await;
                return Err(e);
            }
            info!(
                selected = bootstrapped.report.selected,
                applied = bootstrapped.report.applied,
                pool_size = bootstrapped.pool.size(),
                "Startup complete"
            );
            Ok(bootstrapped)
        }
        Err(e) => {
            if let Err(audit_error) =
                append_audit_record(audit_path, &StartupReport::aborted(config, &e))
            {
                error!(error = %audit_error, "Failed to write startup audit record");
            }
            Err(e.into())
        }
    }
}

/// Keep the pool open until `signal` resolves, then close it even when
/// listening for the signal failed.
async fn hold_until_shutdown<F>(bootstrapped: Bootstrapped, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    info!("Holding connection pool until shutdown is requested");
    let signal = signal.await;
    match &signal {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
    bootstrapped.shutdown().await;
    Ok(signal?)
}

#[derive(Serialize)]
struct ResolvedConfiguration<'a> {
    active_profiles: Vec<String>,
    backend: Backend,
    connection_properties: Vec<&'static str>,
    pool: &'a PoolDescriptor,
    migrations: &'a MigrationRunnerDescriptor,
}

fn check(config: &ConfigSource) -> anyhow::Result<()> {
    let pool = PoolDescriptor::from_config(config)?;
    let migrations = MigrationRunnerDescriptor::from_config(config);

    let resolved = ResolvedConfiguration {
        active_profiles: config.active_profiles(),
        backend: pool.backend()?,
        connection_properties: pool.data_source_properties().into_keys().collect(),
        pool: &pool,
        migrations: &migrations,
    };
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}
