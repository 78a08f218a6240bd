//! Ledger inspection: `startgate status`.

use anyhow::{Result, bail};
use console::style;

use startgate::config::Settings;
use startgate::migrate::{LedgerStatus, sqlite_from_settings};
use startgate::ui::icons::{CHECK, CROSS, LOCK, PENDING};

pub async fn cmd_status(settings: &Settings, json: bool) -> Result<i32> {
    if settings.migrations.command.is_some() {
        bail!("`status` reads the built-in ledger; the configured MIGRATE_COMMAND owns its own history");
    }
    let migrator = sqlite_from_settings(settings)?;
    let status = migrator.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(settings, &status);
    }

    Ok(if status.diverged.is_some() { 1 } else { 0 })
}

fn print_status(settings: &Settings, status: &LedgerStatus) {
    println!();
    println!("{}", style("Migration Status").bold().cyan());
    println!("================");
    println!();
    println!(
        "Database:   {}",
        settings.redacted_database_url().unwrap_or_default()
    );
    println!("Directory:  {}", settings.migrations.dir.display());
    println!(
        "Head:       {} (source: {})",
        status.head.as_deref().unwrap_or("<none>"),
        status.source_head.as_deref().unwrap_or("<none>")
    );
    if let Some(holder) = &status.lock_holder {
        println!("{}Lock held by {}", LOCK, holder);
    }
    println!();

    for entry in &status.applied {
        println!(
            "  {}{:<8} {:<32} {}",
            CHECK,
            entry.id,
            entry.name,
            style(&entry.applied_at).dim()
        );
    }
    for pending in &status.pending {
        println!(
            "  {}{:<8} {:<32} {}",
            PENDING,
            pending.id,
            pending.name,
            style("pending").yellow()
        );
    }
    println!();

    if let Some(reason) = &status.diverged {
        println!("{}{} {}", CROSS, style("Diverged:").red().bold(), reason);
    } else if status.pending.is_empty() {
        println!("{}Up to date ({} applied)", CHECK, status.applied.len());
    } else {
        println!(
            "{}{} pending migration(s)",
            PENDING,
            status.pending.len()
        );
    }
    println!();
}
