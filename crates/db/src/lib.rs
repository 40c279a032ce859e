//! Database bootstrap for dbstrap.
//!
//! Opens the pooled connection source described by `spring.datasource.*`
//! and binds a changelog migration runner (`liquibase.*`) to it.

pub mod changelog;
pub mod migrations;
pub mod pool;
pub mod startup;

pub use changelog::{ChangeSet, Changelog};
pub use migrations::{
    build_migration_runner, MigrationError, MigrationReport, MigrationRunner,
    MigrationRunnerDescriptor,
};
pub use pool::{
    build_connection_pool, Backend, ConnectionPool, ConnectionTarget, PoolDescriptor, PoolError,
    PoolTuning,
};
pub use startup::{
    bootstrap, configure, Bootstrapped, StartupError, StartupReport, StartupResources,
    StartupState,
};
