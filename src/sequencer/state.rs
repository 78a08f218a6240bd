//! Startup state machine.
//!
//! `Migrating` is the initial state. From there the process either reaches
//! `Serving` (migrations succeeded) or the absorbing `Failed` state. Nothing
//! leads back to `Migrating` within one process lifetime.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::errors::StartupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartupState {
    /// Applying pending schema migrations
    #[default]
    Migrating,
    /// Migrations done; the request-serving process has been started
    Serving,
    /// Migration phase failed; the server never starts
    Failed,
}

impl StartupState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }

    pub fn can_transition_to(&self, next: StartupState) -> bool {
        matches!(
            (self, next),
            (Self::Migrating, Self::Serving) | (Self::Migrating, Self::Failed)
        )
    }
}

impl fmt::Display for StartupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupState::Migrating => write!(f, "migrating"),
            StartupState::Serving => write!(f, "serving"),
            StartupState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: StartupState,
    pub to: StartupState,
    pub at: DateTime<Utc>,
}

/// Tracks the current state and every transition taken so far.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: StartupState,
    history: Vec<Transition>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StartupState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Move to `next`, rejecting anything outside `Migrating → {Serving, Failed}`.
    pub fn transition(&mut self, next: StartupState) -> Result<(), StartupError> {
        if !self.state.can_transition_to(next) {
            return Err(StartupError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::info!(from = %self.state, to = %next, "Startup state changed");
        self.history.push(Transition {
            from: self.state,
            to: next,
            at: Utc::now(),
        });
        self.state = next;
        Ok(())
    }
}
