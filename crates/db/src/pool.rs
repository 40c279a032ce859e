//! Database connection pool management.

use dbstrap_config::{ConfigSource, PropertyResolver};
use secrecy::{ExposeSecret, SecretString};
use serde::{Serialize, Serializer};
use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::AnyPool;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use url::Url;

/// Property prefix for every data source setting.
pub const DATASOURCE_PREFIX: &str = "spring.datasource.";

const JDBC_PREFIX: &str = "jdbc:";
const REDACTED: &str = "****";

/// Errors raised while describing or opening the connection pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Neither `url` nor `databaseName` was configured.
    #[error("Database connection pool is not configured correctly")]
    NotConfigured { active_profiles: Vec<String> },
    #[error("unsupported data source class '{0}'")]
    UnsupportedDataSource(String),
    #[error("cannot determine database backend from url '{0}'")]
    UnknownBackend(String),
    #[error("invalid port number '{0}'")]
    InvalidPort(String),
    #[error("invalid connection url: {0}")]
    InvalidUrl(String),
    #[error("failed to create database connection pool: {0}")]
    Connect(#[from] sqlx::Error),
}

/// Pool sizing and timeout settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolTuning {
    pub connection_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_lifetime_ms: u64,
    pub maximum_pool_size: u32,
    pub minimum_idle: u32,
}

impl PoolTuning {
    /// The only tuning the pool is ever built with.
    pub const FIXED: PoolTuning = PoolTuning {
        connection_timeout_ms: 30_000,
        idle_timeout_ms: 600_000,
        max_lifetime_ms: 1_800_000,
        maximum_pool_size: 100,
        minimum_idle: 10,
    };

    fn pool_options(&self) -> AnyPoolOptions {
        AnyPoolOptions::new()
            .acquire_timeout(Duration::from_millis(self.connection_timeout_ms))
            .idle_timeout(Duration::from_millis(self.idle_timeout_ms))
            .max_lifetime(Duration::from_millis(self.max_lifetime_ms))
            .max_connections(self.maximum_pool_size)
            .min_connections(self.minimum_idle)
    }
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self::FIXED
    }
}

/// Database engine behind the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    /// Select the backend from a `dataSourceClassName` value.
    ///
    /// Accepts both plain names (`postgres`, `sqlite`) and driver class names
    /// such as `org.postgresql.ds.PGSimpleDataSource`.
    pub fn from_class_name(class_name: &str) -> Result<Self, PoolError> {
        let lower = class_name.to_ascii_lowercase();
        if lower.contains("postgres") || lower.contains("pgsimple") {
            Ok(Backend::Postgres)
        } else if lower.contains("sqlite") {
            Ok(Backend::Sqlite)
        } else {
            Err(PoolError::UnsupportedDataSource(class_name.to_string()))
        }
    }

    /// Infer the backend from a connection URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let url = strip_jdbc(url);
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Backend::Postgres)
        } else if url.starts_with("sqlite:") {
            Some(Backend::Sqlite)
        } else {
            None
        }
    }
}

/// Where the pool connects to.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionTarget {
    DirectUrl {
        #[serde(serialize_with = "serialize_redacted_url")]
        url: String,
    },
    HostAndDatabase {
        server: Option<String>,
        port: Option<u16>,
        database: String,
    },
}

impl ConnectionTarget {
    /// Resolve the target from `spring.datasource.*`.
    ///
    /// A non-empty `url` wins; otherwise `databaseName` (with optional
    /// `serverName` and `portNumber`) is used. Returns `None` when neither is
    /// set.
    pub fn from_resolver(resolver: &PropertyResolver<'_>) -> Result<Option<Self>, PoolError> {
        if let Some(url) = resolver.get_non_empty("url") {
            return Ok(Some(ConnectionTarget::DirectUrl {
                url: url.to_string(),
            }));
        }

        let Some(database) = resolver.get_non_empty("databaseName") else {
            return Ok(None);
        };
        let port = resolver
            .get_non_empty("portNumber")
            .map(|raw| {
                raw.parse::<u16>()
                    .map_err(|_| PoolError::InvalidPort(raw.to_string()))
            })
            .transpose()?;

        Ok(Some(ConnectionTarget::HostAndDatabase {
            server: resolver.get_non_empty("serverName").map(str::to_string),
            port,
            database: database.to_string(),
        }))
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionTarget::DirectUrl { url } => f
                .debug_struct("DirectUrl")
                .field("url", &redact_url(url))
                .finish(),
            ConnectionTarget::HostAndDatabase {
                server,
                port,
                database,
            } => f
                .debug_struct("HostAndDatabase")
                .field("server", server)
                .field("port", port)
                .field("database", database)
                .finish(),
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionTarget::DirectUrl { url } => write!(f, "{}", redact_url(url)),
            ConnectionTarget::HostAndDatabase {
                server,
                port,
                database,
            } => {
                write!(f, "{}", server.as_deref().unwrap_or("localhost"))?;
                if let Some(port) = port {
                    write!(f, ":{port}")?;
                }
                write!(f, "/{database}")
            }
        }
    }
}

/// Everything needed to open the connection pool.
#[derive(Debug, Serialize)]
pub struct PoolDescriptor {
    pub data_source_class_name: Option<String>,
    pub target: ConnectionTarget,
    pub username: Option<String>,
    #[serde(serialize_with = "serialize_password_mask")]
    pub password: Option<SecretString>,
    pub tuning: PoolTuning,
}

impl PoolDescriptor {
    /// Build the descriptor from `spring.datasource.*` properties.
    ///
    /// Fails with [`PoolError::NotConfigured`] when neither `url` nor
    /// `databaseName` is present, logging the active profiles first.
    pub fn from_config(config: &ConfigSource) -> Result<Self, PoolError> {
        let resolver = config.resolver(DATASOURCE_PREFIX);

        let Some(target) = ConnectionTarget::from_resolver(&resolver)? else {
            let active_profiles = config.active_profiles();
            error!(
                profiles = ?active_profiles,
                "Your database connection pool configuration is incorrect! The application cannot start. Please check your profile, current profiles are: {:?}",
                active_profiles
            );
            return Err(PoolError::NotConfigured { active_profiles });
        };

        Ok(Self {
            data_source_class_name: resolver
                .get_non_empty("dataSourceClassName")
                .map(str::to_string),
            target,
            username: resolver.get("username").map(str::to_string),
            password: resolver
                .get("password")
                .map(|password| SecretString::from(password.to_string())),
            tuning: PoolTuning::FIXED,
        })
    }

    /// Backend selected by `dataSourceClassName`, the URL scheme, or
    /// PostgreSQL for host/database addressing.
    pub fn backend(&self) -> Result<Backend, PoolError> {
        if let Some(class_name) = &self.data_source_class_name {
            return Backend::from_class_name(class_name);
        }
        match &self.target {
            ConnectionTarget::DirectUrl { url } => {
                Backend::from_url(url).ok_or_else(|| PoolError::UnknownBackend(redact_url(url)))
            }
            ConnectionTarget::HostAndDatabase { .. } => Ok(Backend::Postgres),
        }
    }

    /// Data source properties handed to the driver, keyed by property name.
    pub fn data_source_properties(&self) -> BTreeMap<&'static str, String> {
        let mut properties = BTreeMap::new();
        match &self.target {
            ConnectionTarget::DirectUrl { url } => {
                properties.insert("url", url.clone());
            }
            ConnectionTarget::HostAndDatabase {
                server,
                port,
                database,
            } => {
                properties.insert("databaseName", database.clone());
                if let Some(server) = server {
                    properties.insert("serverName", server.clone());
                }
                if let Some(port) = port {
                    properties.insert("portNumber", port.to_string());
                }
            }
        }
        if let Some(username) = &self.username {
            properties.insert("username", username.clone());
        }
        if let Some(password) = &self.password {
            properties.insert("password", password.expose_secret().to_string());
        }
        properties
    }

    /// Connection URL with credentials applied.
    pub(crate) fn connection_url(&self) -> Result<String, PoolError> {
        let backend = self.backend()?;
        match (&self.target, backend) {
            (ConnectionTarget::DirectUrl { url }, Backend::Postgres) => {
                let mut url = Url::parse(strip_jdbc(url))
                    .map_err(|e| PoolError::InvalidUrl(e.to_string()))?;
                self.apply_credentials(&mut url)?;
                Ok(url.to_string())
            }
            (ConnectionTarget::DirectUrl { url }, Backend::Sqlite) => {
                Ok(sqlite_create_if_missing(strip_jdbc(url)))
            }
            (
                ConnectionTarget::HostAndDatabase {
                    server,
                    port,
                    database,
                },
                Backend::Postgres,
            ) => {
                let mut url = Url::parse("postgres://localhost")
                    .map_err(|e| PoolError::InvalidUrl(e.to_string()))?;
                if let Some(server) = server {
                    url.set_host(Some(server.as_str()))
                        .map_err(|e| PoolError::InvalidUrl(format!("server '{server}': {e}")))?;
                }
                url.set_port(*port)
                    .map_err(|_| PoolError::InvalidUrl("cannot set port".to_string()))?;
                url.set_path(&format!("/{}", database.trim_start_matches('/')));
                self.apply_credentials(&mut url)?;
                Ok(url.to_string())
            }
            (ConnectionTarget::HostAndDatabase { database, .. }, Backend::Sqlite) => {
                Ok(format!("sqlite://{database}?mode=rwc"))
            }
        }
    }

    /// Driver connect options for this descriptor.
    pub fn connect_options(&self) -> Result<AnyConnectOptions, PoolError> {
        sqlx::any::install_default_drivers();
        let url = self.connection_url()?;
        Ok(AnyConnectOptions::from_str(&url)?)
    }

    fn apply_credentials(&self, url: &mut Url) -> Result<(), PoolError> {
        if let Some(username) = &self.username {
            url.set_username(username)
                .map_err(|_| PoolError::InvalidUrl("cannot set username".to_string()))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password.expose_secret()))
                .map_err(|_| PoolError::InvalidUrl("cannot set password".to_string()))?;
        }
        Ok(())
    }
}

/// Live connection pool.
///
/// Clones share the same underlying pool. Call [`ConnectionPool::close`] on
/// shutdown.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    pool: AnyPool,
    backend: Backend,
    descriptor: Arc<PoolDescriptor>,
}

impl ConnectionPool {
    /// Open the pool described by `descriptor`.
    pub async fn connect(descriptor: PoolDescriptor) -> Result<Self, PoolError> {
        let backend = descriptor.backend()?;
        let options = descriptor.connect_options()?;
        let pool = descriptor.tuning.pool_options().connect_with(options).await?;

        info!(
            backend = ?backend,
            max_connections = descriptor.tuning.maximum_pool_size,
            min_idle = descriptor.tuning.minimum_idle,
            "Connected to database at {}",
            descriptor.target
        );

        Ok(Self {
            pool,
            backend,
            descriptor: Arc::new(descriptor),
        })
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn descriptor(&self) -> &PoolDescriptor {
        &self.descriptor
    }

    /// Connections currently held, idle or in use.
    pub fn size(&self) -> u32 {
        self.pool.size()
    }

    pub fn num_idle(&self) -> usize {
        self.pool.num_idle()
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close every connection and wait for checked-out ones to return.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }
}

/// Describe and open the connection pool from configuration.
pub async fn build_connection_pool(config: &ConfigSource) -> Result<ConnectionPool, PoolError> {
    let descriptor = PoolDescriptor::from_config(config)?;
    ConnectionPool::connect(descriptor).await
}

fn strip_jdbc(url: &str) -> &str {
    url.strip_prefix(JDBC_PREFIX).unwrap_or(url)
}

/// Add `mode=rwc` to a SQLite URL so a missing database file is created,
/// unless the URL already picks a mode or points at an in-memory database.
fn sqlite_create_if_missing(url: &str) -> String {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let in_memory = path.ends_with(":memory:");
    let has_mode = query.split('&').any(|pair| pair.starts_with("mode="));
    if in_memory || has_mode {
        url.to_string()
    } else if query.is_empty() {
        format!("{path}?mode=rwc")
    } else {
        format!("{url}&mode=rwc")
    }
}

/// Replace the password of a URL, if any, with a mask.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(strip_jdbc(raw)) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some(REDACTED)).is_err() {
                return REDACTED.to_string();
            }
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

fn serialize_redacted_url<S: Serializer>(url: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&redact_url(url))
}

fn serialize_password_mask<S: Serializer>(
    password: &Option<SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match password {
        Some(_) => serializer.serialize_some(REDACTED),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> ConfigSource {
        pairs.iter().copied().collect()
    }

    #[test]
    fn empty_config_is_not_configured() {
        let err = PoolDescriptor::from_config(&ConfigSource::new()).unwrap_err();
        assert!(matches!(err, PoolError::NotConfigured { .. }));
        assert_eq!(
            err.to_string(),
            "Database connection pool is not configured correctly"
        );
    }

    #[test]
    fn not_configured_carries_active_profiles() {
        let config = config(&[
            ("spring.profiles.active", "prod,eu"),
            ("spring.datasource.username", "u"),
        ]);

        match PoolDescriptor::from_config(&config) {
            Err(PoolError::NotConfigured { active_profiles }) => {
                assert_eq!(active_profiles, vec!["prod", "eu"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn url_branch_carries_url_and_credentials_only() {
        let config = config(&[
            ("spring.datasource.url", "jdbc:postgresql://db:5432/app"),
            ("spring.datasource.username", "u"),
            ("spring.datasource.password", "p"),
            ("spring.datasource.databaseName", "ignored"),
            ("spring.datasource.serverName", "ignored-host"),
        ]);

        let descriptor = PoolDescriptor::from_config(&config).unwrap();
        let properties = descriptor.data_source_properties();

        assert_eq!(
            properties.keys().copied().collect::<Vec<_>>(),
            vec!["password", "url", "username"]
        );
        assert_eq!(properties["url"], "jdbc:postgresql://db:5432/app");
        assert_eq!(descriptor.backend().unwrap(), Backend::Postgres);
        assert!(descriptor.connect_options().is_ok());
    }

    #[test]
    fn blank_url_falls_back_to_host_and_database() {
        let config = config(&[
            ("spring.datasource.url", ""),
            ("spring.datasource.databaseName", "app"),
            ("spring.datasource.serverName", "db"),
        ]);

        let descriptor = PoolDescriptor::from_config(&config).unwrap();
        let properties = descriptor.data_source_properties();

        assert_eq!(properties["databaseName"], "app");
        assert_eq!(properties["serverName"], "db");
        assert!(!properties.contains_key("url"));
        assert_eq!(
            descriptor.target,
            ConnectionTarget::HostAndDatabase {
                server: Some("db".to_string()),
                port: None,
                database: "app".to_string(),
            }
        );
    }

    #[test]
    fn tuning_is_fixed_regardless_of_input() {
        let config = config(&[
            ("spring.datasource.url", "sqlite://app.db"),
            ("spring.datasource.maximumPoolSize", "3"),
            ("spring.datasource.minimumIdle", "1"),
        ]);

        let descriptor = PoolDescriptor::from_config(&config).unwrap();
        assert_eq!(descriptor.tuning, PoolTuning::FIXED);
        assert_eq!(descriptor.tuning.connection_timeout_ms, 30_000);
        assert_eq!(descriptor.tuning.idle_timeout_ms, 600_000);
        assert_eq!(descriptor.tuning.max_lifetime_ms, 1_800_000);
        assert_eq!(descriptor.tuning.maximum_pool_size, 100);
        assert_eq!(descriptor.tuning.minimum_idle, 10);
    }

    #[test]
    fn credentials_are_applied_to_postgres_urls() {
        let direct = PoolDescriptor::from_config(&config(&[
            ("spring.datasource.url", "jdbc:postgresql://db:5432/app"),
            ("spring.datasource.username", "u"),
            ("spring.datasource.password", "p@ss"),
        ]))
        .unwrap();
        assert_eq!(
            direct.connection_url().unwrap(),
            "postgresql://u:p%40ss@db:5432/app"
        );

        let host = PoolDescriptor::from_config(&config(&[
            ("spring.datasource.databaseName", "app"),
            ("spring.datasource.serverName", "db"),
            ("spring.datasource.portNumber", "6543"),
            ("spring.datasource.username", "u"),
            ("spring.datasource.password", "p"),
        ]))
        .unwrap();
        assert_eq!(host.connection_url().unwrap(), "postgres://u:p@db:6543/app");
    }

    #[test]
    fn sqlite_database_name_becomes_file_url() {
        let descriptor = PoolDescriptor::from_config(&config(&[
            ("spring.datasource.databaseName", "data/app.db"),
            ("spring.datasource.dataSourceClassName", "org.sqlite.SQLiteDataSource"),
        ]))
        .unwrap();

        assert_eq!(descriptor.backend().unwrap(), Backend::Sqlite);
        assert_eq!(
            descriptor.connection_url().unwrap(),
            "sqlite://data/app.db?mode=rwc"
        );
    }

    #[test]
    fn class_name_selects_backend() {
        assert_eq!(
            Backend::from_class_name("org.postgresql.ds.PGSimpleDataSource").unwrap(),
            Backend::Postgres
        );
        assert_eq!(Backend::from_class_name("sqlite").unwrap(), Backend::Sqlite);
        assert!(matches!(
            Backend::from_class_name("com.mysql.cj.jdbc.MysqlDataSource"),
            Err(PoolError::UnsupportedDataSource(_))
        ));
    }

    #[test]
    fn unknown_url_scheme_is_rejected() {
        let descriptor = PoolDescriptor::from_config(&config(&[(
            "spring.datasource.url",
            "mysql://root:secret@db/app",
        )]))
        .unwrap();

        let err = descriptor.backend().unwrap_err();
        assert!(matches!(err, PoolError::UnknownBackend(_)));
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = PoolDescriptor::from_config(&config(&[
            ("spring.datasource.databaseName", "app"),
            ("spring.datasource.portNumber", "not-a-port"),
        ]))
        .unwrap_err();
        assert!(matches!(err, PoolError::InvalidPort(_)));
    }

    #[test]
    fn password_never_leaks_into_debug_or_display() {
        let descriptor = PoolDescriptor::from_config(&config(&[
            ("spring.datasource.url", "postgres://u:hunter2@db/app"),
            ("spring.datasource.password", "hunter2"),
        ]))
        .unwrap();

        assert!(!format!("{:?}", descriptor.password).contains("hunter2"));
        assert!(!format!("{:?}", descriptor).contains("hunter2"));
        assert!(!descriptor.target.to_string().contains("hunter2"));
        assert!(descriptor.target.to_string().contains("db/app"));
    }

    #[test]
    fn embedded_url_password_is_masked_in_debug() {
        let descriptor = PoolDescriptor::from_config(&config(&[(
            "spring.datasource.url",
            "postgres://u:hunter2@db/app",
        )]))
        .unwrap();

        let debug = format!("{descriptor:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("DirectUrl"));
        assert!(debug.contains("u:****@db/app"));
    }

    #[test]
    fn sqlite_urls_create_missing_files() {
        let descriptor = PoolDescriptor::from_config(&config(&[(
            "spring.datasource.url",
            "sqlite://app.db",
        )]))
        .unwrap();
        assert_eq!(descriptor.connection_url().unwrap(), "sqlite://app.db?mode=rwc");

        assert_eq!(
            sqlite_create_if_missing("sqlite://app.db?cache=shared"),
            "sqlite://app.db?cache=shared&mode=rwc"
        );
        assert_eq!(sqlite_create_if_missing("sqlite://app.db?mode=ro"), "sqlite://app.db?mode=ro");
        assert_eq!(sqlite_create_if_missing("sqlite::memory:"), "sqlite::memory:");
    }
}
