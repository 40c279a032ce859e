//! Changelog loading.
//!
//! A changelog is a directory of `<version>_<description>.sql` files
//! (`.up.sql` / `.down.sql` for reversible change sets). Leading comment lines
//! of the form `-- context: dev, test` restrict a change set to those
//! contexts, and `${name}` placeholders are filled from changelog parameters
//! before the SQL reaches the migration engine.

use crate::migrations::MigrationError;
use futures::future::BoxFuture;
use sqlx::error::BoxDynError;
use sqlx::migrate::{Migration, MigrationSource, MigrationType};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A single versioned change set read from the changelog.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub version: i64,
    pub description: String,
    pub migration_type: MigrationType,
    /// Lowercased contexts this change set is restricted to. Empty means all.
    pub contexts: Vec<String>,
    pub sql: String,
}

impl ChangeSet {
    /// Parse a change set from its file name and content.
    ///
    /// Returns `Ok(None)` for files that are not `.sql`.
    pub fn parse(file_name: &str, sql: String) -> Result<Option<Self>, MigrationError> {
        let Some(stem) = file_name.strip_suffix(".sql") else {
            return Ok(None);
        };
        let (stem, migration_type) = if let Some(stem) = stem.strip_suffix(".up") {
            (stem, MigrationType::ReversibleUp)
        } else if let Some(stem) = stem.strip_suffix(".down") {
            (stem, MigrationType::ReversibleDown)
        } else {
            (stem, MigrationType::Simple)
        };

        let invalid = || MigrationError::InvalidFileName(file_name.to_string());
        let (version, description) = stem.split_once('_').ok_or_else(invalid)?;
        let version: i64 = version.parse().map_err(|_| invalid())?;

        Ok(Some(Self {
            version,
            description: description.replace('_', " "),
            migration_type,
            contexts: declared_contexts(&sql),
            sql,
        }))
    }

    /// Whether this change set runs under the given active contexts.
    pub fn applies_to(&self, active: &[String]) -> bool {
        if active.is_empty() || self.contexts.is_empty() {
            return true;
        }
        active
            .iter()
            .any(|context| self.contexts.contains(&context.to_lowercase()))
    }

    /// SQL with every known `${name}` placeholder replaced.
    ///
    /// Placeholders are resolved in one pass over the original SQL, so values
    /// that themselves contain `${...}` are inserted verbatim.
    pub fn render(&self, parameters: &BTreeMap<String, String>) -> String {
        let mut sql = String::with_capacity(self.sql.len());
        let mut rest = self.sql.as_str();
        let mut unresolved = 0usize;

        while let Some(start) = rest.find("${") {
            sql.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                sql.push_str(&rest[start..]);
                rest = "";
                unresolved += 1;
                break;
            };
            match parameters.get(&after[..end]) {
                Some(value) => sql.push_str(value),
                None => {
                    sql.push_str(&rest[start..start + 2 + end + 1]);
                    unresolved += 1;
                }
            }
            rest = &after[end + 1..];
        }
        sql.push_str(rest);

        if unresolved > 0 {
            debug!(
                version = self.version,
                unresolved, "Change set still contains unresolved parameters"
            );
        }
        sql
    }
}

fn declared_contexts(sql: &str) -> Vec<String> {
    sql.lines()
        .map(str::trim)
        .take_while(|line| line.is_empty() || line.starts_with("--"))
        .filter_map(|line| line.strip_prefix("--"))
        .filter_map(|comment| {
            let (key, value) = comment.split_once(':')?;
            key.trim().eq_ignore_ascii_case("context").then_some(value)
        })
        .flat_map(|value| value.split(','))
        .map(|context| context.trim().to_lowercase())
        .filter(|context| !context.is_empty())
        .collect()
}

/// Ordered set of change sets.
#[derive(Debug, Clone)]
pub struct Changelog {
    path: PathBuf,
    change_sets: Vec<ChangeSet>,
}

impl Changelog {
    /// Read every `.sql` file in the changelog directory.
    pub async fn load(path: &Path) -> Result<Self, MigrationError> {
        let read_error = |source| MigrationError::Read {
            path: path.to_path_buf(),
            source,
        };

        let mut entries = tokio::fs::read_dir(path).await.map_err(read_error)?;
        let mut change_sets = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
            let file_type = entry.file_type().await.map_err(read_error)?;
            if !file_type.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') || !file_name.ends_with(".sql") {
                continue;
            }
            let sql = tokio::fs::read_to_string(entry.path())
                .await
                .map_err(|source| MigrationError::Read {
                    path: entry.path(),
                    source,
                })?;
            if let Some(change_set) = ChangeSet::parse(&file_name, sql)? {
                change_sets.push(change_set);
            }
        }

        debug!(
            change_sets = change_sets.len(),
            "Loaded changelog {}",
            path.display()
        );
        Self::from_change_sets(path, change_sets)
    }

    /// Build a changelog from parsed change sets, ordering them by version.
    pub fn from_change_sets(
        path: impl Into<PathBuf>,
        mut change_sets: Vec<ChangeSet>,
    ) -> Result<Self, MigrationError> {
        change_sets.sort_by_key(|change_set| {
            (
                change_set.version,
                change_set.migration_type.is_down_migration(),
            )
        });

        let mut seen = HashSet::new();
        for change_set in &change_sets {
            let key = (
                change_set.version,
                change_set.migration_type.is_down_migration(),
            );
            if !seen.insert(key) {
                return Err(MigrationError::DuplicateVersion(change_set.version));
            }
        }

        Ok(Self {
            path: path.into(),
            change_sets,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn change_sets(&self) -> &[ChangeSet] {
        &self.change_sets
    }

    /// Select the change sets for `contexts` and render their parameters.
    pub fn resolve(
        &self,
        contexts: &[String],
        parameters: &BTreeMap<String, String>,
    ) -> ResolvedChangelog {
        let mut migrations = Vec::new();
        for change_set in &self.change_sets {
            if !change_set.applies_to(contexts) {
                debug!(
                    version = change_set.version,
                    contexts = ?change_set.contexts,
                    "Skipping change set outside active contexts"
                );
                continue;
            }
            migrations.push(Migration::new(
                change_set.version,
                Cow::Owned(change_set.description.clone()),
                change_set.migration_type,
                Cow::Owned(change_set.render(parameters)),
            ));
        }

        if migrations.is_empty() && !self.change_sets.is_empty() {
            warn!(contexts = ?contexts, "No change sets match the active contexts");
        }
        ResolvedChangelog { migrations }
    }
}

/// Change sets ready for the migration engine.
#[derive(Debug)]
pub struct ResolvedChangelog {
    migrations: Vec<Migration>,
}

impl ResolvedChangelog {
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Number of forward (non-down) change sets.
    pub fn forward_count(&self) -> usize {
        self.migrations
            .iter()
            .filter(|migration| !migration.migration_type.is_down_migration())
            .count()
    }
}

impl<'s> MigrationSource<'s> for ResolvedChangelog {
    fn resolve(self) -> BoxFuture<'s, Result<Vec<Migration>, BoxDynError>> {
        Box::pin(async move { Ok(self.migrations) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change_set(file_name: &str, sql: &str) -> ChangeSet {
        ChangeSet::parse(file_name, sql.to_string()).unwrap().unwrap()
    }

    #[test]
    fn parses_version_description_and_type() {
        let simple = change_set("20240101_create_users.sql", "CREATE TABLE users (id INTEGER);");
        assert_eq!(simple.version, 20240101);
        assert_eq!(simple.description, "create users");
        assert_eq!(simple.migration_type, MigrationType::Simple);

        let down = change_set("2_add_index.down.sql", "DROP INDEX idx;");
        assert_eq!(down.version, 2);
        assert_eq!(down.migration_type, MigrationType::ReversibleDown);
    }

    #[test]
    fn non_sql_files_are_ignored() {
        assert!(ChangeSet::parse("README.md", String::new()).unwrap().is_none());
    }

    #[test]
    fn bad_file_names_are_rejected() {
        assert!(matches!(
            ChangeSet::parse("create_users.sql", String::new()),
            Err(MigrationError::InvalidFileName(_))
        ));
        assert!(matches!(
            ChangeSet::parse("0001.sql", String::new()),
            Err(MigrationError::InvalidFileName(_))
        ));
    }

    #[test]
    fn contexts_come_from_leading_comments() {
        let scoped = change_set(
            "3_seed.sql",
            "-- seed data for local runs\n-- context: Dev, test\nINSERT INTO t VALUES (1);\n-- context: prod\n",
        );
        assert_eq!(scoped.contexts, vec!["dev", "test"]);

        assert!(scoped.applies_to(&[]));
        assert!(scoped.applies_to(&["DEV".to_string()]));
        assert!(!scoped.applies_to(&["prod".to_string()]));

        let unscoped = change_set("4_table.sql", "CREATE TABLE t (id INTEGER);");
        assert!(unscoped.applies_to(&["prod".to_string()]));
    }

    #[test]
    fn render_substitutes_known_parameters_only() {
        let cs = change_set(
            "5_grant.sql",
            "GRANT SELECT ON ${schema}.users TO ${role}; -- ${unknown}",
        );
        let parameters = BTreeMap::from([
            ("schema".to_string(), "app".to_string()),
            ("role".to_string(), "reader".to_string()),
        ]);

        assert_eq!(
            cs.render(&parameters),
            "GRANT SELECT ON app.users TO reader; -- ${unknown}"
        );
    }

    #[test]
    fn render_does_not_expand_placeholders_inside_values() {
        let cs = change_set("6_comment.sql", "COMMENT ON TABLE ${a} IS '${b}'; ${open");
        let parameters = BTreeMap::from([
            ("a".to_string(), "${b}".to_string()),
            ("b".to_string(), "${a}".to_string()),
        ]);

        assert_eq!(cs.render(&parameters), "COMMENT ON TABLE ${b} IS '${a}'; ${open");
    }

    #[test]
    fn duplicate_versions_are_rejected() {
        let result = Changelog::from_change_sets(
            "db",
            vec![
                change_set("1_a.sql", "SELECT 1;"),
                change_set("1_b.sql", "SELECT 2;"),
            ],
        );
        assert!(matches!(result, Err(MigrationError::DuplicateVersion(1))));

        let reversible = Changelog::from_change_sets(
            "db",
            vec![
                change_set("1_a.down.sql", "DROP TABLE a;"),
                change_set("1_a.up.sql", "CREATE TABLE a (id INTEGER);"),
            ],
        )
        .unwrap();
        assert_eq!(
            reversible.change_sets()[0].migration_type,
            MigrationType::ReversibleUp
        );
    }

    #[test]
    fn resolve_filters_by_context_in_version_order() {
        let changelog = Changelog::from_change_sets(
            "db",
            vec![
                change_set("3_prod.sql", "-- context: prod\nSELECT 3;"),
                change_set("1_base.sql", "SELECT 1;"),
                change_set("2_dev.sql", "-- context: dev\nSELECT 2;"),
            ],
        )
        .unwrap();

        let resolved = changelog.resolve(&["dev".to_string()], &BTreeMap::new());
        let versions: Vec<i64> = resolved.migrations().iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(resolved.forward_count(), 2);

        let everything = changelog.resolve(&[], &BTreeMap::new());
        assert_eq!(everything.forward_count(), 3);
    }

    #[tokio::test]
    async fn load_reads_sql_files_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("2_second.sql"), "SELECT 2;").unwrap();
        std::fs::write(dir.path().join("1_first.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a change set").unwrap();
        std::fs::create_dir(dir.path().join("archive")).unwrap();

        let changelog = Changelog::load(dir.path()).await.unwrap();
        let versions: Vec<i64> = changelog.change_sets().iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn load_reports_missing_directory() {
        let err = Changelog::load(Path::new("/nonexistent/changelog"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Read { .. }));
    }
}
