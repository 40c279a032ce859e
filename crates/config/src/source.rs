//! In-memory property map and prefix-scoped resolvers.

use std::collections::BTreeMap;

/// Property holding the comma separated list of active deployment profiles.
pub const ACTIVE_PROFILES_KEY: &str = "spring.profiles.active";

/// Read-only mapping from dotted property names to string values.
///
/// Keys are stored as written. Lookups are relaxed, and when several keys share
/// a relaxed form the most recently inserted one wins, so a later layer's
/// `database_name` shadows an earlier `databaseName` without erasing it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSource {
    properties: BTreeMap<String, Property>,
    next_revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Property {
    value: String,
    revision: u64,
}

impl ConfigSource {
    /// Create an empty configuration source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property, replacing an entry with exactly the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let revision = self.next_revision;
        self.next_revision += 1;
        self.properties.insert(
            key.into(),
            Property {
                value: value.into(),
                revision,
            },
        );
    }

    /// Overlay every property of `other` on top of this source.
    pub fn merge(&mut self, other: ConfigSource) {
        for (key, value) in other.by_revision() {
            self.insert(key, value);
        }
    }

    /// Look up a property by its full dotted name.
    ///
    /// Every key with the same relaxed form matches; the latest insert wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        let relaxed = relaxed_key(key);
        self.properties
            .iter()
            .filter(|(existing, _)| relaxed_key(existing) == relaxed)
            .max_by_key(|(_, property)| property.revision)
            .map(|(_, property)| property.value.as_str())
    }

    /// Scope lookups to every property below `prefix` (e.g. `"liquibase."`).
    pub fn resolver(&self, prefix: &str) -> PropertyResolver<'_> {
        PropertyResolver {
            source: self,
            prefix: prefix.to_string(),
        }
    }

    /// Deployment profiles listed in `spring.profiles.active`.
    pub fn active_profiles(&self) -> Vec<String> {
        self.get(ACTIVE_PROFILES_KEY)
            .map(split_list)
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .map(|(key, property)| (key.as_str(), property.value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Entries in insertion order.
    fn by_revision(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<_> = self.properties.iter().collect();
        entries.sort_by_key(|(_, property)| property.revision);
        entries
            .into_iter()
            .map(|(key, property)| (key.as_str(), property.value.as_str()))
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for ConfigSource
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut source = ConfigSource::new();
        for (key, value) in iter {
            source.insert(key, value);
        }
        source
    }
}

/// Prefix-scoped view over a [`ConfigSource`].
#[derive(Debug, Clone)]
pub struct PropertyResolver<'a> {
    source: &'a ConfigSource,
    prefix: String,
}

impl<'a> PropertyResolver<'a> {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Raw value of `name` below the resolver prefix.
    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.source.get(&format!("{}{}", self.prefix, name))
    }

    /// Trimmed value of `name`, treating blank values as absent.
    pub fn get_non_empty(&self, name: &str) -> Option<&'a str> {
        self.get(name)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Comma separated list value of `name`.
    pub fn get_list(&self, name: &str) -> Vec<String> {
        self.get(name).map(split_list).unwrap_or_default()
    }

    /// Every property below `<prefix><sub_prefix>`, keyed by the remainder of
    /// its name.
    ///
    /// Prefix segments are matched on relaxed keys, so
    /// `liquibase.parameters.schema` and `LIQUIBASE.PARAMETERS.schema` both
    /// yield `schema`. The remainder is kept exactly as written.
    pub fn sub_properties(&self, sub_prefix: &str) -> BTreeMap<String, String> {
        let full_prefix = format!("{}{}", self.prefix, sub_prefix);
        let wanted: Vec<String> = full_prefix
            .split('.')
            .filter(|segment| !segment.is_empty())
            .map(relaxed_key)
            .collect();

        let mut properties = BTreeMap::new();
        for (key, value) in self.source.by_revision() {
            let segments: Vec<&str> = key.split('.').collect();
            if segments.len() <= wanted.len() {
                continue;
            }
            let matches = segments
                .iter()
                .zip(&wanted)
                .all(|(segment, expected)| relaxed_key(segment) == *expected);
            if matches {
                properties.insert(segments[wanted.len()..].join("."), value.to_string());
            }
        }
        properties
    }
}

/// Relaxed form of a key: case-insensitive, ignoring `.`, `-` and `_`.
fn relaxed_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '.' | '-' | '_'))
        .flat_map(char::to_lowercase)
        .collect()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
