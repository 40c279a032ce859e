//! Configuration source for the dbstrap startup sequence.
//!
//! Properties are flat, dotted keys (`spring.datasource.url`) assembled from
//! TOML files, profile overlays, environment variables and command-line
//! overrides. Lookups are relaxed so `databaseName`, `database-name` and
//! `DATABASE_NAME` all address the same property.

pub mod loader;
pub mod source;

pub use loader::{parse_override, ConfigError, ConfigLoader};
pub use source::{ConfigSource, PropertyResolver, ACTIVE_PROFILES_KEY};
