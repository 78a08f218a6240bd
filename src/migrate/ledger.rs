//! SQLite-resident migration ledger and migration lock.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};

use super::source::Migration;
use crate::errors::MigrationError;

pub const LEDGER_TABLE: &str = "schema_migrations";
pub const LOCK_TABLE: &str = "schema_migrations_lock";

/// One applied migration, as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: String,
    pub name: String,
    pub checksum: String,
    pub position: i64,
    pub applied_at: String,
}

/// Current holder of the migration lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub holder: String,
    pub acquired_at: String,
}

/// How long to wait for, and when to break, another instance's lock.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub timeout: Duration,
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            stale_after: Duration::from_secs(900),
            poll_interval: Duration::from_millis(250),
        }
    }
}

pub struct LedgerDb {
    conn: Connection,
    target: String,
}

impl LedgerDb {
    /// Open (or create) a SQLite database file and make sure the ledger tables exist.
    pub fn open(path: &Path, target: &str) -> Result<Self, MigrationError> {
        let conn = Connection::open(path).map_err(|e| connection_error(target, e))?;
        Self::init(conn, target)
    }

    pub fn open_in_memory() -> Result<Self, MigrationError> {
        let conn = Connection::open_in_memory().map_err(|e| connection_error(":memory:", e))?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, target: &str) -> Result<Self, MigrationError> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| connection_error(target, e))?;
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
                 id TEXT PRIMARY KEY,
                 name TEXT NOT NULL,
                 checksum TEXT NOT NULL,
                 position INTEGER NOT NULL UNIQUE,
                 applied_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS {LOCK_TABLE} (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 holder TEXT NOT NULL,
                 acquired_at TEXT NOT NULL
             );"
        ))
        .map_err(|e| connection_error(target, e))?;
        Ok(Self {
            conn,
            target: target.to_string(),
        })
    }

    /// Direct access to the underlying connection (status queries, tests).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Applied migrations in application order.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, MigrationError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id, name, checksum, position, applied_at FROM {LEDGER_TABLE} ORDER BY position"
            ))
            .map_err(|e| connection_error(&self.target, e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LedgerEntry {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    checksum: row.get(2)?,
                    position: row.get(3)?,
                    applied_at: row.get(4)?,
                })
            })
            .map_err(|e| connection_error(&self.target, e))?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(|e| connection_error(&self.target, e))?);
        }
        Ok(entries)
    }

    pub fn head(&self) -> Result<Option<LedgerEntry>, MigrationError> {
        Ok(self.entries()?.pop())
    }

    /// Apply one migration and append it to the ledger in a single transaction.
    ///
    /// On failure the transaction rolls back, so the ledger still ends at the
    /// previous migration.
    pub fn apply(&mut self, migration: &Migration, position: i64) -> Result<(), MigrationError> {
        let apply_error = |message: String| MigrationError::Apply {
            id: migration.id.clone(),
            name: migration.name.clone(),
            message,
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| apply_error(format!("cannot begin transaction: {}", e)))?;
        tx.execute_batch(&migration.sql)
            .map_err(|e| apply_error(e.to_string()))?;
        tx.execute(
            &format!(
                "INSERT INTO {LEDGER_TABLE} (id, name, checksum, position, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![
                migration.id,
                migration.name,
                migration.checksum,
                position,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| apply_error(format!("cannot record ledger entry: {}", e)))?;
        tx.commit()
            .map_err(|e| apply_error(format!("commit failed: {}", e)))?;
        Ok(())
    }

    pub fn lock_holder(&self) -> Result<Option<LockHolder>, MigrationError> {
        self.conn
            .query_row(
                &format!("SELECT holder, acquired_at FROM {LOCK_TABLE} WHERE id = 1"),
                [],
                |row| {
                    Ok(LockHolder {
                        holder: row.get(0)?,
                        acquired_at: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(|e| connection_error(&self.target, e))
    }

    /// Take the migration lock, waiting at most `policy.timeout` for another holder.
    ///
    /// A lock older than `policy.stale_after` belongs to an instance that died
    /// mid-migration and is broken.
    pub fn acquire_lock(&self, holder: &str, policy: &LockPolicy) -> Result<(), MigrationError> {
        let started = Instant::now();
        loop {
            let inserted = self.conn.execute(
                &format!("INSERT INTO {LOCK_TABLE} (id, holder, acquired_at) VALUES (1, ?1, ?2)"),
                params![holder, Utc::now().to_rfc3339()],
            );
            match inserted {
                Ok(_) => {
                    tracing::debug!(holder, "Acquired migration lock");
                    return Ok(());
                }
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation => {}
                Err(e) => return Err(connection_error(&self.target, e)),
            }

            let Some(current) = self.lock_holder()? else {
                continue;
            };

            if is_stale(&current.acquired_at, policy.stale_after) {
                tracing::warn!(
                    holder = %current.holder,
                    acquired_at = %current.acquired_at,
                    "Breaking stale migration lock"
                );
                self.conn
                    .execute(
                        &format!("DELETE FROM {LOCK_TABLE} WHERE id = 1 AND holder = ?1"),
                        params![current.holder],
                    )
                    .map_err(|e| connection_error(&self.target, e))?;
                continue;
            }

            let waited = started.elapsed();
            if waited >= policy.timeout {
                return Err(MigrationError::LockHeld {
                    holder: current.holder,
                    waited,
                });
            }
            tracing::info!(holder = %current.holder, "Waiting for migration lock");
            std::thread::sleep(policy.poll_interval.min(policy.timeout - waited));
        }
    }

    /// Release the lock if `holder` still owns it.
    pub fn release_lock(&self, holder: &str) -> Result<(), MigrationError> {
        self.conn
            .execute(
                &format!("DELETE FROM {LOCK_TABLE} WHERE id = 1 AND holder = ?1"),
                params![holder],
            )
            .map_err(|e| connection_error(&self.target, e))?;
        Ok(())
    }
}

fn is_stale(acquired_at: &str, stale_after: Duration) -> bool {
    let Ok(acquired) = DateTime::parse_from_rfc3339(acquired_at) else {
        // Unreadable timestamps cannot be trusted to ever expire.
        return true;
    };
    let age = Utc::now().signed_duration_since(acquired.with_timezone(&Utc));
    age.to_std().map(|age| age >= stale_after).unwrap_or(false)
}

fn connection_error(target: &str, err: rusqlite::Error) -> MigrationError {
    MigrationError::Connection {
        target: target.to_string(),
        message: err.to_string(),
    }
}
