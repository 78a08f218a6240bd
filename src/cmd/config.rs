//! Effective configuration: `startgate config`.

use anyhow::Result;

use startgate::config::Settings;

pub fn cmd_config(settings: &Settings) -> Result<i32> {
    println!();
    println!("startgate Configuration");
    println!("=======================");
    println!();

    match &settings.config_file {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: <none> (defaults + environment)"),
    }
    println!();

    println!("[database]");
    println!(
        "  url = {}",
        settings
            .redacted_database_url()
            .map(|u| format!("\"{}\"", u))
            .unwrap_or_else(|| "<unset>".to_string())
    );
    println!();

    let m = &settings.migrations;
    println!("[migrations]");
    println!("  dir = \"{}\"", m.dir.display());
    match &m.command {
        Some(cmd) => println!("  command = \"{}\"", cmd),
        None => println!("  command = <built-in SQLite migrator>"),
    }
    println!("  lock_timeout_secs = {}", m.lock_timeout.as_secs());
    println!("  lock_stale_secs = {}", m.lock_stale_after.as_secs());
    println!("  timeout_secs = {}", m.timeout.as_secs());
    println!();

    let s = &settings.server;
    println!("[server]");
    println!("  host = \"{}\"", s.host);
    println!("  port = {}", s.port);
    match &s.command {
        Some(cmd) => println!("  command = \"{}\"", cmd),
        None => println!("  command = <built-in health server>"),
    }
    println!("  workers = {}", s.workers);
    println!("  timeout_secs = {}", s.timeout.as_secs());
    println!("  keep_alive_secs = {}", s.keep_alive.as_secs());
    println!("  max_requests = {}", s.max_requests);
    println!("  max_requests_jitter = {}", s.max_requests_jitter);
    println!("  graceful_timeout_secs = {}", s.graceful_timeout.as_secs());
    println!();

    println!("[log]");
    println!("  format = \"{}\"", settings.log.format);
    println!("  level = \"{}\"", settings.log.level);
    println!();

    Ok(0)
}
