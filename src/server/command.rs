//! Launcher for an external server process (gunicorn, uvicorn, a compiled binary, ...).
//!
//! The command template may reference these placeholders:
//!
//! | Placeholder             | Value                              |
//! |-------------------------|------------------------------------|
//! | `{host}`                | listen host                        |
//! | `{port}`                | listen port                        |
//! | `{bind}`                | `host:port`                        |
//! | `{workers}`             | worker count                       |
//! | `{timeout}`             | request timeout, seconds           |
//! | `{keep_alive}`          | keep-alive, seconds                |
//! | `{max_requests}`        | per-worker recycling threshold     |
//! | `{max_requests_jitter}` | recycling jitter                   |
//! | `{graceful_timeout}`    | shutdown grace period, seconds     |
//!
//! `{{` and `}}` produce literal braces.
//!
//! The rendered command runs under `sh -c` as the leader of its own process
//! group. Shutdown is forwarded to the whole group, and anything left in it
//! when the server returns is killed.

use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;

use super::{ServeOutcome, ServerLauncher, ServerOptions, ShutdownSignal};
use crate::errors::{EXIT_FAILURE, ServerStartError};
use crate::migrate::MigrationReport;
use crate::process::{self, ProcessGroup};

#[derive(Debug, Clone)]
pub struct CommandServer {
    template: String,
}

impl CommandServer {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

/// Substitute the server options into `template`.
pub fn render_command(template: &str, options: &ServerOptions) -> Result<String, ServerStartError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(ServerStartError::InvalidCommand(format!(
                        "unclosed placeholder '{{{}' in `{}`",
                        name, template
                    )));
                }
                out.push_str(&placeholder(&name, options).ok_or_else(|| {
                    ServerStartError::InvalidCommand(format!(
                        "unknown placeholder '{{{}}}' in `{}`",
                        name, template
                    ))
                })?);
            }
            '}' => {
                return Err(ServerStartError::InvalidCommand(format!(
                    "unmatched '}}' in `{}` (use '}}}}' for a literal brace)",
                    template
                )));
            }
            c => out.push(c),
        }
    }

    if out.trim().is_empty() {
        return Err(ServerStartError::InvalidCommand(
            "server command is empty".to_string(),
        ));
    }
    Ok(out)
}

fn placeholder(name: &str, options: &ServerOptions) -> Option<String> {
    let value = match name.trim() {
        "host" => options.host.clone(),
        "port" => options.port.to_string(),
        "bind" => options.bind_addr(),
        "workers" => options.workers.to_string(),
        "timeout" => options.timeout.as_secs().to_string(),
        "keep_alive" => options.keep_alive.as_secs().to_string(),
        "max_requests" => options.max_requests.to_string(),
        "max_requests_jitter" => options.max_requests_jitter.to_string(),
        "graceful_timeout" => options.graceful_timeout.as_secs().to_string(),
        _ => return None,
    };
    Some(value)
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    EXIT_FAILURE
}

#[async_trait]
impl ServerLauncher for CommandServer {
    fn describe(&self) -> String {
        format!("server command `{}`", self.template)
    }

    async fn serve(
        &self,
        options: &ServerOptions,
        _report: &MigrationReport,
        shutdown: ShutdownSignal,
    ) -> Result<ServeOutcome, ServerStartError> {
        let rendered = render_command(&self.template, options)?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&rendered)
            .env("PORT", options.port.to_string())
            .env("HOST", &options.host)
            .env("WEB_CONCURRENCY", options.workers.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(url) = &options.database_url {
            cmd.env("DATABASE_URL", url);
        }
        process::own_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(ServerStartError::Spawn)?;
        let mut group = ProcessGroup::of(&child);
        tracing::info!(
            command = %rendered,
            pid = child.id().unwrap_or_default(),
            bind = %options.bind_addr(),
            "Server process started"
        );

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(ServerStartError::Serve)?;
                let code = exit_code(status);
                if code == 0 {
                    tracing::info!("Server process exited");
                } else {
                    tracing::error!(exit_code = code, "Server process exited with failure");
                }
                Ok(ServeOutcome { exit_code: code, shutdown_requested: false })
            }
            _ = shutdown => {
                tracing::info!(
                    grace_secs = options.graceful_timeout.as_secs(),
                    "Forwarding shutdown to server process"
                );
                if !group.terminate()
                    && let Err(e) = child.start_kill()
                {
                    tracing::warn!(error = %e, "Failed to stop server process");
                }
                match tokio::time::timeout(options.graceful_timeout, child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::info!(exit_code = exit_code(status), "Server process stopped");
                        group.kill();
                    }
                    Ok(Err(e)) => return Err(ServerStartError::Serve(e)),
                    Err(_) => {
                        tracing::warn!("Server process ignored SIGTERM; killing it");
                        group.kill();
                        child.kill().await.map_err(ServerStartError::Serve)?;
                    }
                }
                Ok(ServeOutcome::requested())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn options() -> ServerOptions {
        ServerOptions {
            host: "0.0.0.0".into(),
            port: 8000,
            workers: 2,
            timeout: Duration::from_secs(120),
            keep_alive: Duration::from_secs(5),
            max_requests: 1000,
            max_requests_jitter: 50,
            graceful_timeout: Duration::from_secs(30),
            database_url: Some("sqlite://app.db".into()),
        }
    }

    fn never() -> ShutdownSignal {
        Box::pin(std::future::pending())
    }

    #[test]
    fn test_render_gunicorn_style_command() {
        let rendered = render_command(
            "gunicorn app.main:app -k uvicorn.workers.UvicornWorker --bind {bind} --workers {workers} \
             --timeout {timeout} --keep-alive {keep_alive} --max-requests {max_requests} \
             --max-requests-jitter {max_requests_jitter} --graceful-timeout {graceful_timeout}",
            &options(),
        )
        .unwrap();
        assert_eq!(
            rendered,
            "gunicorn app.main:app -k uvicorn.workers.UvicornWorker --bind 0.0.0.0:8000 --workers 2 \
             --timeout 120 --keep-alive 5 --max-requests 1000 \
             --max-requests-jitter 50 --graceful-timeout 30"
        );
    }

    #[test]
    fn test_render_host_and_port() {
        let mut opts = options();
        opts.port = 9123;
        assert_eq!(
            render_command("serve --host {host} --port {port}", &opts).unwrap(),
            "serve --host 0.0.0.0 --port 9123"
        );
    }

    #[test]
    fn test_render_escaped_braces() {
        assert_eq!(
            render_command("echo '{{\"port\": {port}}}'", &options()).unwrap(),
            "echo '{\"port\": 8000}'"
        );
    }

    #[test]
    fn test_render_rejects_unknown_placeholder() {
        let err = render_command("serve --port {prot}", &options()).unwrap_err();
        assert!(matches!(err, ServerStartError::InvalidCommand(_)));
        assert!(err.to_string().contains("{prot}"));
    }

    #[test]
    fn test_render_rejects_unclosed_and_stray_braces() {
        assert!(render_command("serve --port {port", &options()).is_err());
        assert!(render_command("serve }", &options()).is_err());
        assert!(render_command("   ", &options()).is_err());
    }

    #[tokio::test]
    async fn test_exit_code_is_propagated() {
        let server = CommandServer::new("sh -c 'exit 4'");
        let outcome = server
            .serve(&options(), &MigrationReport::default(), never())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 4);
        assert!(!outcome.shutdown_requested);
    }

    #[tokio::test]
    async fn test_compound_command_runs() {
        let outcome = CommandServer::new("cd . && true")
            .serve(&options(), &MigrationReport::default(), never())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn test_env_prefixed_command_runs() {
        let outcome = CommandServer::new("FOO=1 sh -c 'test \"$FOO\" = 1'")
            .serve(&options(), &MigrationReport::default(), never())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn test_environment_is_exported() {
        let mut opts = options();
        opts.port = 9123;
        let server = CommandServer::new(
            "sh -c 'test \"$PORT\" = 9123 && test \"$WEB_CONCURRENCY\" = 2 && test \"$DATABASE_URL\" = sqlite://app.db'",
        );
        let outcome = server
            .serve(&opts, &MigrationReport::default(), never())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_forwards_sigterm() {
        let server = CommandServer::new("sleep 30");
        let started = Instant::now();
        let outcome = server
            .serve(
                &options(),
                &MigrationReport::default(),
                Box::pin(tokio::time::sleep(Duration::from_millis(200))),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ServeOutcome::requested());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_kills_after_grace_period() {
        let mut opts = options();
        opts.graceful_timeout = Duration::from_millis(200);
        let server = CommandServer::new("sh -c 'trap \"\" TERM; sleep 30'");
        let started = Instant::now();
        let outcome = server
            .serve(
                &opts,
                &MigrationReport::default(),
                Box::pin(tokio::time::sleep(Duration::from_millis(100))),
            )
            .await
            .unwrap();
        assert!(outcome.shutdown_requested);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_reaches_workers_of_compound_command() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!(
            "cd {} && sh -c 'sleep 2; touch worker_survived' & wait",
            dir.path().display()
        );
        let outcome = CommandServer::new(template)
            .serve(
                &options(),
                &MigrationReport::default(),
                Box::pin(tokio::time::sleep(Duration::from_millis(200))),
            )
            .await
            .unwrap();
        assert!(outcome.shutdown_requested);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("worker_survived").exists());
    }
}
