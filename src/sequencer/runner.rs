//! Migrate-then-serve orchestration.

use crate::errors::StartupError;
use crate::migrate::Migrator;
use crate::server::{ServeOutcome, ServerLauncher, ServerOptions, ShutdownSignal};

use super::state::{StartupState, StateMachine};

/// Runs the migrate phase and starts the server only when it succeeds.
pub struct Sequencer {
    migrator: Box<dyn Migrator>,
    launcher: Box<dyn ServerLauncher>,
    options: ServerOptions,
    machine: StateMachine,
}

impl Sequencer {
    pub fn new(
        migrator: Box<dyn Migrator>,
        launcher: Box<dyn ServerLauncher>,
        options: ServerOptions,
    ) -> Self {
        Self {
            migrator,
            launcher,
            options,
            machine: StateMachine::new(),
        }
    }

    pub fn state(&self) -> StartupState {
        self.machine.state()
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Migrate, then serve until the server exits or `shutdown` fires.
    ///
    /// A migration failure moves the machine to `Failed` and the launcher is
    /// never called.
    pub async fn run(&mut self, shutdown: ShutdownSignal) -> Result<ServeOutcome, StartupError> {
        tracing::info!(migrator = %self.migrator.describe(), "Running database migrations");

        let report = match self.migrator.upgrade().await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(class = %err.class(), error = %err, "Migrations failed; server will not start");
                self.machine.transition(StartupState::Failed)?;
                return Err(err.into());
            }
        };

        tracing::info!(
            applied = report.applied.len(),
            head = report.head.as_deref().unwrap_or("-"),
            "Migrations completed successfully"
        );
        self.machine.transition(StartupState::Serving)?;

        tracing::info!(
            launcher = %self.launcher.describe(),
            bind = %self.options.bind_addr(),
            workers = self.options.workers,
            "Starting server"
        );
        let outcome = self
            .launcher
            .serve(&self.options, &report, shutdown)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Server failed"))?;
        Ok(outcome)
    }
}
