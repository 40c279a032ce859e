//! Layered configuration loading.
//!
//! Layers, lowest precedence first:
//! 1. `application.toml` in the configuration directory
//! 2. `application-<profile>.toml` for each active profile
//! 3. `SPRING_*` / `LIQUIBASE_*` environment variables
//! 4. explicit overrides (command line)

use crate::source::{ConfigSource, ACTIVE_PROFILES_KEY};
use std::path::{Path, PathBuf};
use tracing::debug;

const BASE_FILE: &str = "application";
const ENV_PREFIXES: &[&str] = &["SPRING_", "LIQUIBASE_"];

/// Errors raised while assembling a [`ConfigSource`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid property override '{0}', expected key=value")]
    InvalidOverride(String),
}

/// Builder for the layered configuration source.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    config_dir: Option<PathBuf>,
    profiles: Vec<String>,
    overrides: Vec<(String, String)>,
    env_vars: Option<Vec<(String, String)>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory holding `application.toml` and its profile overlays.
    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Activate an additional profile on top of `spring.profiles.active`.
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profiles.push(profile.into());
        self
    }

    /// Set a property with the highest precedence.
    pub fn override_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Use the given variables instead of the process environment.
    pub fn env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars = Some(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    /// Assemble the configuration source from every layer.
    pub fn load(&self) -> Result<ConfigSource, ConfigError> {
        let base = match &self.config_dir {
            Some(dir) => read_optional(&dir.join(format!("{BASE_FILE}.toml")))?,
            None => ConfigSource::new(),
        };
        let env = match &self.env_vars {
            Some(vars) => env_properties(vars.iter().cloned()),
            None => env_properties(std::env::vars()),
        };
        let overrides = self.override_layer();

        // Profiles decide which overlay files exist, so resolve them first.
        let mut probe = base.clone();
        probe.merge(env.clone());
        probe.merge(overrides.clone());
        let profiles = probe.active_profiles();

        let mut config = base;
        if let Some(dir) = &self.config_dir {
            for profile in &profiles {
                config.merge(read_optional(&dir.join(format!("{BASE_FILE}-{profile}.toml")))?);
            }
        }
        config.merge(env);
        config.merge(overrides);

        debug!(
            properties = config.len(),
            profiles = ?profiles,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn override_layer(&self) -> ConfigSource {
        let mut layer: ConfigSource = self.overrides.iter().cloned().collect();
        if !self.profiles.is_empty() {
            let mut active = layer.active_profiles();
            active.extend(self.profiles.iter().cloned());
            layer.insert(ACTIVE_PROFILES_KEY, active.join(","));
        }
        layer
    }
}

/// Parse a `key=value` command-line override.
pub fn parse_override(raw: &str) -> Result<(String, String), ConfigError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(ConfigError::InvalidOverride(raw.to_string())),
    }
}

/// Parse TOML text, flattening nested tables into dotted keys.
pub fn parse_toml(content: &str) -> Result<ConfigSource, toml::de::Error> {
    let table: toml::Table = content.parse()?;
    let mut source = ConfigSource::new();
    for (key, value) in table {
        flatten(&key, value, &mut source);
    }
    Ok(source)
}

fn read_optional(path: &Path) -> Result<ConfigSource, ConfigError> {
    if !path.exists() {
        debug!("No configuration file at {}", path.display());
        return Ok(ConfigSource::new());
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let source = parse_toml(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(properties = source.len(), "Read configuration file {}", path.display());
    Ok(source)
}

fn flatten(key: &str, value: toml::Value, out: &mut ConfigSource) {
    match value {
        toml::Value::Table(table) => {
            for (child, value) in table {
                flatten(&format!("{key}.{child}"), value, out);
            }
        }
        toml::Value::Array(items) => {
            if items.iter().any(|item| item.is_table() || item.is_array()) {
                for (index, item) in items.into_iter().enumerate() {
                    flatten(&format!("{key}[{index}]"), item, out);
                }
            } else {
                let joined: Vec<String> = items.into_iter().filter_map(scalar).collect();
                out.insert(key, joined.join(","));
            }
        }
        other => {
            if let Some(value) = scalar(other) {
                out.insert(key, value);
            }
        }
    }
}

fn scalar(value: toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}

/// Map `SPRING_DATASOURCE_URL` style variables to `spring.datasource.url`.
fn env_properties<I>(vars: I) -> ConfigSource
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| {
            let upper = key.to_ascii_uppercase();
            ENV_PREFIXES.iter().any(|prefix| upper.starts_with(prefix))
        })
        .map(|(key, value)| (key.to_ascii_lowercase().replace('_', "."), value))
        .collect()
}
