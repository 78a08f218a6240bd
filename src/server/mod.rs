//! Serving phase: the `ServerLauncher` seam and its implementations.

pub mod builtin;
pub mod command;

pub use builtin::BuiltinServer;
pub use command::{CommandServer, render_command};

use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::config::Settings;
use crate::errors::ServerStartError;
use crate::migrate::MigrationReport;

/// Resolves once the process has been asked to stop.
pub type ShutdownSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Everything the serving process is configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub timeout: Duration,
    pub keep_alive: Duration,
    pub max_requests: u32,
    pub max_requests_jitter: u32,
    pub graceful_timeout: Duration,
    pub database_url: Option<String>,
}

impl ServerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            workers: server.workers,
            timeout: server.timeout,
            keep_alive: server.keep_alive,
            max_requests: server.max_requests,
            max_requests_jitter: server.max_requests_jitter,
            graceful_timeout: server.graceful_timeout,
            database_url: settings.database_url.clone(),
        }
    }

    /// `host:port`, bracketing IPv6 hosts.
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// How the serving phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeOutcome {
    pub exit_code: i32,
    /// True when the server stopped because we were asked to shut down
    pub shutdown_requested: bool,
}

impl ServeOutcome {
    pub fn requested() -> Self {
        Self {
            exit_code: 0,
            shutdown_requested: true,
        }
    }
}

/// Starts the request-serving process and runs it until it exits or `shutdown` fires.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    fn describe(&self) -> String;

    async fn serve(
        &self,
        options: &ServerOptions,
        report: &MigrationReport,
        shutdown: ShutdownSignal,
    ) -> Result<ServeOutcome, ServerStartError>;
}

/// Pick the launcher for these settings. A configured command template is
/// validated here, before any migration runs.
pub fn from_settings(settings: &Settings) -> Result<Box<dyn ServerLauncher>> {
    match &settings.server.command {
        Some(template) => {
            render_command(template, &ServerOptions::from_settings(settings))?;
            Ok(Box::new(CommandServer::new(template.clone())))
        }
        None => Ok(Box::new(BuiltinServer::new())),
    }
}

/// Wait for SIGTERM or Ctrl+C.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
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
    fn test_options_from_settings() {
        let s = settings(&[
            ("PORT", "9001"),
            ("WEB_CONCURRENCY", "4"),
            ("DATABASE_URL", "sqlite://app.db"),
        ]);
        let options = ServerOptions::from_settings(&s);
        assert_eq!(options.port, 9001);
        assert_eq!(options.workers, 4);
        assert_eq!(options.timeout, Duration::from_secs(120));
        assert_eq!(options.database_url.as_deref(), Some("sqlite://app.db"));
        assert_eq!(options.bind_addr(), "0.0.0.0:9001");
    }

    #[test]
    fn test_bind_addr_brackets_ipv6() {
        let mut options = ServerOptions::from_settings(&settings(&[]));
        options.host = "::".into();
        assert_eq!(options.bind_addr(), "[::]:8000");
    }

    #[test]
    fn test_launcher_selection() {
        let builtin = from_settings(&settings(&[])).unwrap();
        assert!(builtin.describe().contains("built-in"));

        let command = from_settings(&settings(&[("SERVER_COMMAND", "uvicorn app:app --port {port}")]))
            .unwrap();
        assert!(command.describe().contains("uvicorn"));
    }

    #[test]
    fn test_bad_template_rejected_up_front() {
        let err = from_settings(&settings(&[("SERVER_COMMAND", "serve --port {prot}")]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("prot"));
    }
}
