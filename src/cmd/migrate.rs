//! Migrations only: `startgate migrate`.

use anyhow::Result;

use startgate::config::Settings;
use startgate::migrate::Migrator;

pub async fn cmd_migrate(settings: &Settings) -> Result<i32> {
    let migrator = startgate::migrate::from_settings(settings)?;
    tracing::info!(migrator = %migrator.describe(), "Running database migrations");

    match migrator.upgrade().await {
        Ok(report) => {
            tracing::info!(
                applied = report.applied.len(),
                head = report.head.as_deref().unwrap_or("-"),
                "Migrations completed successfully"
            );
            Ok(0)
        }
        Err(e) => {
            tracing::error!(class = %e.class(), error = %e, "Migrations failed");
            Ok(e.exit_code())
        }
    }
}
