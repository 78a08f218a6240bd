//! Built-in migrator for SQLite databases.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;

use super::ledger::{LedgerDb, LedgerEntry, LockPolicy};
use super::source::{Migration, MigrationSource};
use super::{AppliedMigration, MigrationReport, Migrator};
use crate::config::{DatabaseTarget, redact_url};
use crate::errors::MigrationError;

/// Applies `*.sql` migrations from a directory to a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteMigrator {
    url: String,
    target: DatabaseTarget,
    dir: PathBuf,
    lock: LockPolicy,
}

/// Snapshot of the ledger against the migration source.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerStatus {
    pub applied: Vec<LedgerEntry>,
    pub pending: Vec<PendingMigration>,
    /// Latest applied migration id
    pub head: Option<String>,
    /// Latest migration id in the source
    pub source_head: Option<String>,
    /// Set when the ledger is not a prefix of the plan
    pub diverged: Option<String>,
    /// Instance currently holding the migration lock
    pub lock_holder: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingMigration {
    pub id: String,
    pub name: String,
}

impl LedgerStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty() && self.diverged.is_none()
    }
}

impl SqliteMigrator {
    pub fn new(url: &str, target: DatabaseTarget, dir: PathBuf, lock: LockPolicy) -> Self {
        Self {
            url: url.to_string(),
            target,
            dir,
            lock,
        }
    }

    pub fn lock_policy(&self) -> LockPolicy {
        self.lock
    }

    fn open(&self) -> Result<LedgerDb, MigrationError> {
        let shown = redact_url(&self.url);
        match &self.target {
            DatabaseTarget::SqliteFile(path) => LedgerDb::open(path, &shown),
            DatabaseTarget::SqliteMemory => LedgerDb::open_in_memory(),
            DatabaseTarget::External { scheme } => Err(MigrationError::Connection {
                target: shown,
                message: format!("'{}' databases are not supported by the built-in migrator", scheme),
            }),
        }
    }

    /// Bring the database up to the source head. Synchronous; call from a blocking thread.
    pub fn upgrade_blocking(&self) -> Result<MigrationReport, MigrationError> {
        let source = MigrationSource::load(&self.dir)?;
        tracing::info!(
            dir = %self.dir.display(),
            migrations = source.len(),
            "Loaded migration source"
        );

        let mut db = self.open()?;
        let holder = format!("{}:{}", std::process::id(), uuid::Uuid::new_v4());
        db.acquire_lock(&holder, &self.lock)?;

        let result = apply_pending(&mut db, &source);

        if let Err(e) = db.release_lock(&holder) {
            tracing::warn!(error = %e, "Failed to release migration lock");
        }
        result
    }

    /// Ledger vs. source, without taking the lock.
    pub fn status_blocking(&self) -> Result<LedgerStatus, MigrationError> {
        let source = MigrationSource::load(&self.dir)?;
        let db = self.open()?;
        let applied = db.entries()?;
        let lock_holder = db.lock_holder()?.map(|l| l.holder);

        let diverged = check_prefix(&applied, source.migrations()).err();
        let pending = if diverged.is_some() {
            Vec::new()
        } else {
            source.migrations()[applied.len()..]
                .iter()
                .map(|m| PendingMigration {
                    id: m.id.clone(),
                    name: m.name.clone(),
                })
                .collect()
        };

        Ok(LedgerStatus {
            head: applied.last().map(|e| e.id.clone()),
            source_head: source.head().map(|m| m.id.clone()),
            applied,
            pending,
            diverged: diverged.map(|e| e.to_string()),
            lock_holder,
        })
    }

    pub async fn status(&self) -> Result<LedgerStatus, MigrationError> {
        let migrator = self.clone();
        tokio::task::spawn_blocking(move || migrator.status_blocking())
            .await
            .map_err(join_error)?
    }
}

fn apply_pending(
    db: &mut LedgerDb,
    source: &MigrationSource,
) -> Result<MigrationReport, MigrationError> {
    let applied = db.entries()?;
    check_prefix(&applied, source.migrations())?;

    let pending = &source.migrations()[applied.len()..];
    if pending.is_empty() {
        tracing::info!(
            head = applied.last().map(|e| e.id.as_str()).unwrap_or("<empty>"),
            "Database schema is up to date"
        );
    }

    let mut report = MigrationReport {
        applied: Vec::with_capacity(pending.len()),
        head: applied.last().map(|e| e.id.clone()),
    };

    for (offset, migration) in pending.iter().enumerate() {
        let position = (applied.len() + offset + 1) as i64;
        tracing::info!(id = %migration.id, name = %migration.name, "Applying migration");
        db.apply(migration, position)?;
        report.applied.push(AppliedMigration {
            id: migration.id.clone(),
            name: migration.name.clone(),
        });
        report.head = Some(migration.id.clone());
    }

    if !report.applied.is_empty() {
        tracing::info!(
            applied = report.applied.len(),
            head = report.head.as_deref().unwrap_or_default(),
            "Migrations applied"
        );
    }
    Ok(report)
}

/// The ledger must match the start of the plan, id for id and checksum for checksum.
fn check_prefix(applied: &[LedgerEntry], plan: &[Migration]) -> Result<(), MigrationError> {
    if applied.len() > plan.len() {
        let unknown: Vec<&str> = applied[plan.len()..].iter().map(|e| e.id.as_str()).collect();
        return Err(MigrationError::Diverged(format!(
            "database has migrations not present in the source: {}",
            unknown.join(", ")
        )));
    }
    for (entry, migration) in applied.iter().zip(plan) {
        if entry.id != migration.id {
            return Err(MigrationError::Diverged(format!(
                "position {} is '{}' in the database but '{}' in the source",
                entry.position, entry.id, migration.id
            )));
        }
        if entry.checksum != migration.checksum {
            return Err(MigrationError::Diverged(format!(
                "migration '{}' was modified after it was applied",
                entry.id
            )));
        }
    }
    Ok(())
}

fn join_error(err: tokio::task::JoinError) -> MigrationError {
    MigrationError::Spawn(std::io::Error::other(format!(
        "migration task panicked: {}",
        err
    )))
}

#[async_trait]
impl Migrator for SqliteMigrator {
    fn describe(&self) -> String {
        format!("built-in SQLite migrator ({})", self.dir.display())
    }

    async fn upgrade(&self) -> Result<MigrationReport, MigrationError> {
        let migrator = self.clone();
        tokio::task::spawn_blocking(move || migrator.upgrade_blocking())
            .await
            .map_err(join_error)?
    }
}
