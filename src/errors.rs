//! Typed error hierarchy for the startup sequence.
//!
//! Three top-level enums cover the two phases and the sequencer itself:
//! - `MigrationError`: anything that stops the migrate phase
//! - `ServerStartError`: failures bringing the server up after migrations
//! - `StartupError`: what `Sequencer::run` returns; owns the exit-code mapping

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::sequencer::StartupState;

/// Exit code used for every failure that does not carry its own code.
pub const EXIT_FAILURE: i32 = 1;

/// Coarse classification of migration failures.
///
/// | Class        | Meaning                                                        |
/// |--------------|----------------------------------------------------------------|
/// | `Connection` | the database could not be reached                              |
/// | `Conflict`   | another instance holds the lock or history diverged            |
/// | `Apply`      | a migration step (or the migration source itself) is broken    |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Connection,
    Conflict,
    Apply,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Connection => write!(f, "connection"),
            FailureClass::Conflict => write!(f, "conflict"),
            FailureClass::Apply => write!(f, "apply"),
        }
    }
}

/// Errors from the migrate phase. All of them are fatal to startup.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Cannot reach database {target}: {message}")]
    Connection { target: String, message: String },

    #[error("Migration lock held by {holder} (waited {}s)", .waited.as_secs())]
    LockHeld { holder: String, waited: Duration },

    #[error("Schema history diverges from migration source: {0}")]
    Diverged(String),

    #[error("Migration {id} ({name}) failed: {message}")]
    Apply {
        id: String,
        name: String,
        message: String,
    },

    #[error("Invalid migration source: {0}")]
    InvalidSource(String),

    #[error("Migration tool timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("Migration tool exited with code {code} ({class} failure): {detail}")]
    ToolFailed {
        code: i32,
        class: FailureClass,
        detail: String,
    },

    #[error("Failed to run migration tool: {0}")]
    Spawn(#[source] std::io::Error),
}

impl MigrationError {
    pub fn class(&self) -> FailureClass {
        match self {
            MigrationError::Connection { .. } => FailureClass::Connection,
            MigrationError::LockHeld { .. }
            | MigrationError::Diverged(_)
            | MigrationError::TimedOut(_) => FailureClass::Conflict,
            MigrationError::Apply { .. }
            | MigrationError::InvalidSource(_)
            | MigrationError::Spawn(_) => FailureClass::Apply,
            MigrationError::ToolFailed { class, .. } => *class,
        }
    }

    /// Process exit code for this failure. A failing external tool keeps its own code.
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrationError::ToolFailed { code, .. } if *code > 0 => *code,
            _ => EXIT_FAILURE,
        }
    }
}

/// Errors raised while starting the request-serving process.
#[derive(Debug, Error)]
pub enum ServerStartError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid server command: {0}")]
    InvalidCommand(String),

    #[error("Failed to spawn server process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Errors returned by the startup sequencer.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Migration phase failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("Server start failed: {0}")]
    ServerStart(#[from] ServerStartError),

    #[error("Illegal startup transition from {from} to {to}")]
    IllegalTransition {
        from: StartupState,
        to: StartupState,
    },
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Migration(err) => err.exit_code(),
            StartupError::ServerStart(_) | StartupError::IllegalTransition { .. } => EXIT_FAILURE,
        }
    }
}
