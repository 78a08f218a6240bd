//! The startup sequence: `startgate run`.

use anyhow::Result;

use startgate::config::Settings;
use startgate::sequencer::Sequencer;
use startgate::server::{self, ServerOptions, shutdown_signal};

/// Migrate, then serve. Returns the process exit code.
pub async fn cmd_run(settings: &Settings) -> Result<i32> {
    let migrator = startgate::migrate::from_settings(settings)?;
    let launcher = server::from_settings(settings)?;

    let database = settings.redacted_database_url().unwrap_or_default();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %database,
        port = settings.server.port,
        "Startup sequence beginning"
    );

    let mut sequencer = Sequencer::new(migrator, launcher, ServerOptions::from_settings(settings));
    match sequencer.run(Box::pin(shutdown_signal())).await {
        Ok(outcome) => {
            tracing::info!(
                exit_code = outcome.exit_code,
                shutdown_requested = outcome.shutdown_requested,
                "Startup sequence finished"
            );
            Ok(outcome.exit_code)
        }
        Err(e) => {
            let code = e.exit_code();
            tracing::error!(
                state = %sequencer.state(),
                exit_code = code,
                error = %e,
                "Startup aborted"
            );
            Ok(code)
        }
    }
}
