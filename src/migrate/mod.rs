//! Migration phase: the `Migrator` seam and its implementations.
//!
//! - `SqliteMigrator` applies `*.sql` files from a directory and keeps its
//!   own ledger and lock in the database.
//! - `CommandMigrator` runs an external tool and treats it as an opaque
//!   success/failure signal; the tool owns the ledger.

pub mod command;
pub mod embedded;
pub mod ledger;
pub mod source;

pub use command::CommandMigrator;
pub use embedded::{LedgerStatus, SqliteMigrator};
pub use ledger::LockPolicy;
pub use source::{Migration, MigrationSource};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Serialize;

use crate::config::{DatabaseTarget, Settings};
use crate::errors::MigrationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub id: String,
    pub name: String,
}

/// Outcome of a successful upgrade.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    /// Migrations applied by this run, in order. Empty when already up to date.
    pub applied: Vec<AppliedMigration>,
    /// Ledger head after the run; `None` when unknown (external tool) or empty
    pub head: Option<String>,
}

/// Brings the database schema to the latest revision.
#[async_trait]
pub trait Migrator: Send + Sync {
    fn describe(&self) -> String;

    async fn upgrade(&self) -> Result<MigrationReport, MigrationError>;
}

/// Pick the migrator for these settings: the external command when one is
/// configured, the built-in SQLite migrator otherwise.
pub fn from_settings(settings: &Settings) -> Result<Box<dyn Migrator>> {
    if let Some(command) = &settings.migrations.command {
        let mut migrator = CommandMigrator::new(command.clone(), settings.migrations.timeout);
        if let Some(url) = &settings.database_url {
            migrator = migrator.env("DATABASE_URL", url.clone());
        }
        return Ok(Box::new(migrator));
    }

    Ok(Box::new(sqlite_from_settings(settings)?))
}

/// Built-in migrator for the configured SQLite database.
pub fn sqlite_from_settings(settings: &Settings) -> Result<SqliteMigrator> {
    let Some(url) = &settings.database_url else {
        bail!("DATABASE_URL is not configured");
    };
    let target = DatabaseTarget::parse(url)?;
    if let DatabaseTarget::External { scheme } = &target {
        bail!(
            "The built-in migrator only supports SQLite; set MIGRATE_COMMAND to migrate '{}' databases",
            scheme
        );
    }
    Ok(SqliteMigrator::new(
        url,
        target,
        settings.migrations.dir.clone(),
        LockPolicy {
            timeout: settings.migrations.lock_timeout,
            stale_after: settings.migrations.lock_stale_after,
            ..LockPolicy::default()
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::resolve(ConfigFile::default(), move |k| map.get(k).cloned()).unwrap()
    }

    #[test]
    fn test_command_takes_precedence() {
        let s = settings(&[
            ("MIGRATE_COMMAND", "alembic upgrade head"),
            ("DATABASE_URL", "postgresql://u:p@db/app"),
        ]);
        let migrator = from_settings(&s).unwrap();
        assert!(migrator.describe().contains("alembic upgrade head"));
    }

    #[test]
    fn test_sqlite_url_selects_builtin() {
        let s = settings(&[("DATABASE_URL", "sqlite://app.db")]);
        let migrator = from_settings(&s).unwrap();
        assert!(migrator.describe().contains("SQLite"));
    }

    #[test]
    fn test_external_database_without_command_is_rejected() {
        let s = settings(&[("DATABASE_URL", "postgresql://u:p@db/app")]);
        let err = from_settings(&s).err().unwrap();
        assert!(err.to_string().contains("MIGRATE_COMMAND"));
    }

    #[test]
    fn test_missing_database_url_is_rejected() {
        let err = from_settings(&settings(&[])).err().unwrap();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_lock_policy_from_settings() {
        let s = settings(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("MIGRATION_LOCK_TIMEOUT", "7"),
        ]);
        let migrator = sqlite_from_settings(&s).unwrap();
        assert_eq!(migrator.lock_policy().timeout, std::time::Duration::from_secs(7));
        assert_eq!(
            migrator.lock_policy().stale_after,
            std::time::Duration::from_secs(900)
        );
    }
}
