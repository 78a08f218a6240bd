//! Migration source tree.
//!
//! A migration directory holds one `<id>_<name>.sql` file per migration.
//! Files may declare dependencies in a leading comment:
//!
//! ```sql
//! -- depends: 0001, 0002
//! ALTER TABLE jobs ADD COLUMN user_id TEXT REFERENCES users(id);
//! ```
//!
//! The plan is a topological order of the dependency graph, ties broken by
//! ascending id, so zero-padded numeric ids with no headers apply in file order.

use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::errors::MigrationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub id: String,
    pub name: String,
    pub sql: String,
    /// Hex-encoded SHA-256 of `sql`
    pub checksum: String,
    pub depends_on: Vec<String>,
    pub path: Option<PathBuf>,
}

impl Migration {
    pub fn new(id: impl Into<String>, name: impl Into<String>, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        Self {
            id: id.into(),
            name: name.into(),
            checksum: checksum(&sql),
            depends_on: parse_depends(&sql),
            sql,
            path: None,
        }
    }

    /// Split a file stem into `(id, name)`: `0003_add_users` → `("0003", "add_users")`.
    pub fn split_stem(stem: &str) -> (String, String) {
        match stem.split_once('_') {
            Some((id, name)) if !id.is_empty() && !name.is_empty() => {
                (id.to_string(), name.to_string())
            }
            _ => (stem.to_string(), stem.to_string()),
        }
    }
}

pub fn checksum(sql: &str) -> String {
    format!("{:x}", Sha256::digest(sql.as_bytes()))
}

/// Read `-- depends:` lines from the leading comment block.
fn parse_depends(sql: &str) -> Vec<String> {
    let mut deps = Vec::new();
    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some(comment) = trimmed.strip_prefix("--") else {
            break;
        };
        let comment = comment.trim();
        let directive = comment
            .strip_prefix("depends:")
            .or_else(|| comment.strip_prefix("depends-on:"));
        if let Some(list) = directive {
            deps.extend(
                list.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string),
            );
        }
    }
    deps
}

/// Ordered, validated set of migrations.
#[derive(Debug, Clone, Default)]
pub struct MigrationSource {
    migrations: Vec<Migration>,
}

impl MigrationSource {
    /// Load every `*.sql` file in `dir`.
    pub fn load(dir: &Path) -> Result<Self, MigrationError> {
        if !dir.is_dir() {
            return Err(MigrationError::InvalidSource(format!(
                "migration directory {} does not exist",
                dir.display()
            )));
        }

        let entries = std::fs::read_dir(dir).map_err(|e| {
            MigrationError::InvalidSource(format!("cannot read {}: {}", dir.display(), e))
        })?;

        let mut migrations = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                MigrationError::InvalidSource(format!("cannot read {}: {}", dir.display(), e))
            })?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let sql = std::fs::read_to_string(&path).map_err(|e| {
                MigrationError::InvalidSource(format!("cannot read {}: {}", path.display(), e))
            })?;
            let (id, name) = Migration::split_stem(stem);
            let mut migration = Migration::new(id, name, sql);
            migration.path = Some(path);
            migrations.push(migration);
        }

        Self::from_migrations(migrations)
    }

    /// Validate ids and dependencies and put the migrations in application order.
    pub fn from_migrations(migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, m) in migrations.iter().enumerate() {
            if index.insert(m.id.as_str(), i).is_some() {
                return Err(MigrationError::InvalidSource(format!(
                    "duplicate migration id '{}'",
                    m.id
                )));
            }
        }

        let mut indegree = vec![0usize; migrations.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); migrations.len()];
        for (i, m) in migrations.iter().enumerate() {
            for dep in &m.depends_on {
                let &d = index.get(dep.as_str()).ok_or_else(|| {
                    MigrationError::InvalidSource(format!(
                        "migration '{}' depends on unknown migration '{}'",
                        m.id, dep
                    ))
                })?;
                if d == i {
                    return Err(MigrationError::InvalidSource(format!(
                        "migration '{}' depends on itself",
                        m.id
                    )));
                }
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        // Kahn's algorithm; the ready set is ordered by id.
        let mut ready: BTreeSet<(&str, usize)> = migrations
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] == 0)
            .map(|(i, m)| (m.id.as_str(), i))
            .collect();
        let mut order = Vec::with_capacity(migrations.len());
        while let Some(next) = ready.pop_first() {
            let (_, i) = next;
            order.push(i);
            for &dependent in &dependents[i] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.insert((migrations[dependent].id.as_str(), dependent));
                }
            }
        }

        if order.len() != migrations.len() {
            let mut stuck: Vec<&str> = migrations
                .iter()
                .enumerate()
                .filter(|(i, _)| indegree[*i] > 0)
                .map(|(_, m)| m.id.as_str())
                .collect();
            stuck.sort_unstable();
            return Err(MigrationError::InvalidSource(format!(
                "dependency cycle among migrations: {}",
                stuck.join(", ")
            )));
        }

        let mut slots: Vec<Option<Migration>> = migrations.into_iter().map(Some).collect();
        let migrations = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();
        Ok(Self { migrations })
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn head(&self) -> Option<&Migration> {
        self.migrations.last()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ids(source: &MigrationSource) -> Vec<&str> {
        source.migrations().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_split_stem() {
        assert_eq!(
            Migration::split_stem("0003_add_users"),
            ("0003".to_string(), "add_users".to_string())
        );
        assert_eq!(
            Migration::split_stem("baseline"),
            ("baseline".to_string(), "baseline".to_string())
        );
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        let sum = checksum("");
        assert_eq!(
            sum,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_parse_depends_header() {
        let m = Migration::new(
            "0004",
            "fk",
            "-- Add the foreign key\n-- depends: 0002, 0003\n\nALTER TABLE x ADD y;\n-- depends: 0009\n",
        );
        assert_eq!(m.depends_on, vec!["0002", "0003"]);
    }

    #[test]
    fn test_orders_by_id_without_headers() {
        let source = MigrationSource::from_migrations(vec![
            Migration::new("0002", "b", "SELECT 1;"),
            Migration::new("0003", "c", "SELECT 1;"),
            Migration::new("0001", "a", "SELECT 1;"),
        ])
        .unwrap();
        assert_eq!(ids(&source), vec!["0001", "0002", "0003"]);
        assert_eq!(source.head().unwrap().id, "0003");
    }

    #[test]
    fn test_dependencies_override_id_order() {
        let source = MigrationSource::from_migrations(vec![
            Migration::new("a_first", "x", "-- depends: c_base\nSELECT 1;"),
            Migration::new("b_second", "x", "SELECT 1;"),
            Migration::new("c_base", "x", "SELECT 1;"),
        ])
        .unwrap();
        assert_eq!(ids(&source), vec!["b_second", "c_base", "a_first"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = MigrationSource::from_migrations(vec![
            Migration::new("0001", "a", "SELECT 1;"),
            Migration::new("0001", "b", "SELECT 1;"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = MigrationSource::from_migrations(vec![Migration::new(
            "0002",
            "b",
            "-- depends: 0001\nSELECT 1;",
        )])
        .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidSource(_)));
        assert!(err.to_string().contains("unknown migration '0001'"));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = MigrationSource::from_migrations(vec![
            Migration::new("0001", "a", "-- depends: 0002\nSELECT 1;"),
            Migration::new("0002", "b", "-- depends: 0001\nSELECT 1;"),
            Migration::new("0003", "c", "SELECT 1;"),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"));
        assert!(msg.contains("0001, 0002"));
    }

    #[test]
    fn test_load_reads_sql_files_only() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("0002_users.sql"), "CREATE TABLE users (id INTEGER);").unwrap();
        std::fs::write(dir.path().join("0001_init.sql"), "CREATE TABLE meta (k TEXT);").unwrap();
        std::fs::write(dir.path().join("README.md"), "not a migration").unwrap();

        let source = MigrationSource::load(dir.path()).unwrap();
        assert_eq!(ids(&source), vec!["0001", "0002"]);
        assert_eq!(source.migrations()[1].name, "users");
        assert!(source.migrations()[0].path.is_some());
    }

    #[test]
    fn test_load_missing_directory() {
        let dir = tempdir().unwrap();
        let err = MigrationSource::load(&dir.path().join("nope")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_empty_directory_is_valid() {
        let dir = tempdir().unwrap();
        let source = MigrationSource::load(dir.path()).unwrap();
        assert!(source.is_empty());
        assert!(source.head().is_none());
    }
}
