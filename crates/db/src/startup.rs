//! Startup configurator: pool first, then the migration runner bound to it.

use crate::migrations::{
    build_migration_runner, MigrationError, MigrationReport, MigrationRunner,
    MigrationRunnerDescriptor,
};
use crate::pool::{build_connection_pool, ConnectionPool, PoolDescriptor, PoolError};
use dbstrap_config::ConfigSource;
use serde::Serialize;
use std::fmt;
use tracing::{error, info};

/// Progress of the startup sequence. `Aborted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupState {
    Unconfigured,
    PoolReady,
    MigrationRunnerReady,
    Aborted,
}

impl fmt::Display for StartupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StartupState::Unconfigured => "unconfigured",
            StartupState::PoolReady => "pool_ready",
            StartupState::MigrationRunnerReady => "migration_runner_ready",
            StartupState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Long-lived resources produced by [`configure`].
#[derive(Debug)]
pub struct StartupResources {
    pub pool: ConnectionPool,
    pub migration_runner: MigrationRunner,
}

/// Pool plus the outcome of the startup migration run.
#[derive(Debug)]
pub struct Bootstrapped {
    pub pool: ConnectionPool,
    pub migrations: MigrationRunnerDescriptor,
    pub report: MigrationReport,
}

impl Bootstrapped {
    /// Release the pool. Call once when the process stops.
    pub async fn shutdown(self) {
        self.pool.close().await;
    }
}

/// Build the connection pool and the migration runner bound to it.
///
/// The runner is only constructed once the pool is live.
pub async fn configure(config: &ConfigSource) -> Result<StartupResources, StartupError> {
    enter(StartupState::Unconfigured);

    let pool = match build_connection_pool(config).await {
        Ok(pool) => pool,
        Err(e) => {
            enter(StartupState::Aborted);
            return Err(e.into());
        }
    };
    enter(StartupState::PoolReady);

    let migration_runner = build_migration_runner(config, &pool);
    enter(StartupState::MigrationRunnerReady);

    Ok(StartupResources {
        pool,
        migration_runner,
    })
}

/// Configure, then apply pending migrations.
///
/// On migration failure the pool is closed before the error is returned.
pub async fn bootstrap(config: &ConfigSource) -> Result<Bootstrapped, StartupError> {
    let StartupResources {
        pool,
        migration_runner,
    } = configure(config).await?;
    let migrations = migration_runner.descriptor().clone();

    match migration_runner.run().await {
        Ok(report) => Ok(Bootstrapped {
            pool,
            migrations,
            report,
        }),
        Err(e) => {
            error!("Database migrations failed: {}", e);
            enter(StartupState::Aborted);
            pool.close().await;
            Err(e.into())
        }
    }
}

fn enter(state: StartupState) {
    info!(state = %state, "Startup state changed");
}

/// Serializable summary of one startup attempt.
#[derive(Debug, Serialize)]
pub struct StartupReport<'a> {
    pub state: StartupState,
    pub active_profiles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<&'a PoolDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrations: Option<&'a MigrationRunnerDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_report: Option<&'a MigrationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<'a> StartupReport<'a> {
    pub fn succeeded(config: &ConfigSource, bootstrapped: &'a Bootstrapped) -> Self {
        Self {
            state: StartupState::MigrationRunnerReady,
            active_profiles: config.active_profiles(),
            pool: Some(bootstrapped.pool.descriptor()),
            migrations: Some(&bootstrapped.migrations),
            migration_report: Some(&bootstrapped.report),
            error: None,
        }
    }

    pub fn aborted(config: &ConfigSource, error: &StartupError) -> Self {
        Self {
            state: StartupState::Aborted,
            active_profiles: config.active_profiles(),
            pool: None,
            migrations: None,
            migration_report: None,
            error: Some(error.to_string()),
        }
    }
}
