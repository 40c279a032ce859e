//! Schema migration runner bound to the connection pool.

use crate::changelog::{Changelog, ResolvedChangelog};
use crate::pool::ConnectionPool;
use dbstrap_config::ConfigSource;
use serde::Serialize;
use sqlx::migrate::{Migrate, MigrateError, Migrator};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::info;

/// Property prefix for every migration setting.
pub const LIQUIBASE_PREFIX: &str = "liquibase.";

/// Errors raised while loading or applying the changelog.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("no changelog configured, set liquibase.change-log")]
    MissingChangeLog,
    #[error("failed to read changelog {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid change set file name '{0}', expected <version>_<description>.sql")]
    InvalidFileName(String),
    #[error("duplicate change set version {0}")]
    DuplicateVersion(i64),
    #[error("failed to acquire migration connection: {0}")]
    Acquire(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Engine(#[from] MigrateError),
}

/// Settings read from `liquibase.*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRunnerDescriptor {
    pub enabled: bool,
    pub change_log: Option<PathBuf>,
    pub contexts: Vec<String>,
    pub parameters: BTreeMap<String, String>,
}

impl MigrationRunnerDescriptor {
    pub fn from_config(config: &ConfigSource) -> Self {
        let resolver = config.resolver(LIQUIBASE_PREFIX);

        let enabled = resolver
            .get_non_empty("enabled")
            .map(|value| {
                !matches!(
                    value.to_ascii_lowercase().as_str(),
                    "false" | "0" | "no" | "off"
                )
            })
            .unwrap_or(true);

        Self {
            enabled,
            change_log: resolver.get_non_empty("change-log").map(PathBuf::from),
            contexts: resolver.get_list("context"),
            parameters: resolver.sub_properties("parameters."),
        }
    }
}

/// Outcome of a migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub change_log: Option<PathBuf>,
    pub contexts: Vec<String>,
    /// Forward change sets selected for the active contexts.
    pub selected: usize,
    /// Change sets applied by this run.
    pub applied: usize,
    pub skipped: bool,
}

/// Applies the changelog against the pool's database. Consumed by
/// [`MigrationRunner::run`], so it runs at most once.
#[derive(Debug)]
pub struct MigrationRunner {
    descriptor: MigrationRunnerDescriptor,
    pool: ConnectionPool,
}

impl MigrationRunner {
    pub fn new(descriptor: MigrationRunnerDescriptor, pool: ConnectionPool) -> Self {
        Self { descriptor, pool }
    }

    pub fn descriptor(&self) -> &MigrationRunnerDescriptor {
        &self.descriptor
    }

    /// Apply every pending change set.
    ///
    /// Engine failures (checksum mismatch, bad SQL, dirty database) are
    /// returned unchanged.
    pub async fn run(self) -> Result<MigrationReport, MigrationError> {
        let descriptor = self.descriptor;
        if !descriptor.enabled {
            info!("Database migrations disabled, skipping");
            return Ok(MigrationReport {
                change_log: descriptor.change_log,
                contexts: descriptor.contexts,
                selected: 0,
                applied: 0,
                skipped: true,
            });
        }

        let path = descriptor
            .change_log
            .clone()
            .ok_or(MigrationError::MissingChangeLog)?;
        info!(
            contexts = ?descriptor.contexts,
            parameters = descriptor.parameters.len(),
            "Running database migrations from {}",
            path.display()
        );

        let changelog = Changelog::load(&path).await?;
        let resolved = changelog.resolve(&descriptor.contexts, &descriptor.parameters);
        let selected = resolved.forward_count();
        let applied = pending_count(&self.pool, &resolved).await?;

        let mut migrator = Migrator::new(resolved).await?;
        if !descriptor.contexts.is_empty() {
            // Change sets from other contexts may already be recorded.
            migrator.set_ignore_missing(true);
        }
        migrator.run(self.pool.pool()).await?;

        info!(selected, applied, "Database migrations completed");
        Ok(MigrationReport {
            change_log: Some(path),
            contexts: descriptor.contexts,
            selected,
            applied,
            skipped: false,
        })
    }
}

async fn pending_count(
    pool: &ConnectionPool,
    resolved: &ResolvedChangelog,
) -> Result<usize, MigrationError> {
    let mut conn = pool.pool().acquire().await?;
    conn.ensure_migrations_table().await?;
    let applied: HashSet<i64> = conn
        .list_applied_migrations()
        .await?
        .into_iter()
        .map(|migration| migration.version)
        .collect();

    Ok(resolved
        .migrations()
        .iter()
        .filter(|migration| !migration.migration_type.is_down_migration())
        .filter(|migration| !applied.contains(&migration.version))
        .count())
}

/// Bind a migration runner to an initialized pool.
pub fn build_migration_runner(config: &ConfigSource, pool: &ConnectionPool) -> MigrationRunner {
    MigrationRunner::new(MigrationRunnerDescriptor::from_config(config), pool.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_reads_liquibase_properties() {
        let config: ConfigSource = [
            ("liquibase.change-log", "db/changelog"),
            ("liquibase.context", "dev, test"),
            ("liquibase.parameters.schema", "public"),
            ("liquibase.parameters.owner", "app"),
            ("spring.datasource.url", "sqlite://app.db"),
        ]
        .into_iter()
        .collect();

        let descriptor = MigrationRunnerDescriptor::from_config(&config);
        assert!(descriptor.enabled);
        assert_eq!(descriptor.change_log, Some(PathBuf::from("db/changelog")));
        assert_eq!(descriptor.contexts, vec!["dev", "test"]);
        assert_eq!(
            descriptor.parameters,
            BTreeMap::from([
                ("owner".to_string(), "app".to_string()),
                ("schema".to_string(), "public".to_string()),
            ])
        );
    }

    #[test]
    fn descriptor_defaults_when_unset() {
        let descriptor = MigrationRunnerDescriptor::from_config(&ConfigSource::new());
        assert!(descriptor.enabled);
        assert_eq!(descriptor.change_log, None);
        assert!(descriptor.contexts.is_empty());
        assert!(descriptor.parameters.is_empty());
    }

    #[test]
    fn similar_parameter_names_stay_distinct() {
        let config: ConfigSource = [
            ("liquibase.parameters.table_name", "accounts"),
            ("liquibase.parameters.tablename", "users"),
            ("liquibase.parameters.Schema", "A"),
            ("liquibase.parameters.schema", "b"),
        ]
        .into_iter()
        .collect();

        let descriptor = MigrationRunnerDescriptor::from_config(&config);
        assert_eq!(
            descriptor.parameters,
            BTreeMap::from([
                ("Schema".to_string(), "A".to_string()),
                ("schema".to_string(), "b".to_string()),
                ("table_name".to_string(), "accounts".to_string()),
                ("tablename".to_string(), "users".to_string()),
            ])
        );
    }

    #[test]
    fn enabled_flag_accepts_common_false_values() {
        for value in ["false", "FALSE", "0", "off", "no"] {
            let config: ConfigSource = [("liquibase.enabled", value)].into_iter().collect();
            assert!(!MigrationRunnerDescriptor::from_config(&config).enabled, "{value}");
        }
        let config: ConfigSource = [("liquibase.enabled", "true")].into_iter().collect();
        assert!(MigrationRunnerDescriptor::from_config(&config).enabled);
    }
}
