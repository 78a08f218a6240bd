//! Migrator that shells out to an external migration tool (e.g. `alembic upgrade head`).

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{MigrationReport, Migrator};
use crate::errors::{FailureClass, MigrationError};
use crate::process::{self, ProcessGroup};

/// Lines of tool output kept for the failure message.
pub const OUTPUT_TAIL_LINES: usize = 20;

/// How long a timed-out tool gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(3);

const CONNECTION_MARKERS: &[&str] = &[
    "connection refused",
    "could not connect",
    "could not translate host name",
    "name or service not known",
    "no route to host",
    "connection timed out",
    "timeout expired",
    "password authentication failed",
    "unable to open database",
    "server closed the connection",
];

const CONFLICT_MARKERS: &[&str] = &[
    "could not obtain lock",
    "lock timeout",
    "deadlock detected",
    "database is locked",
    "multiple heads",
    "can't locate revision",
    "is not a head",
];

#[derive(Debug, Clone)]
pub struct CommandMigrator {
    command: String,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl CommandMigrator {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            env: Vec::new(),
            timeout,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Bounded buffer of the most recent output lines.
#[derive(Debug)]
struct OutputTail {
    lines: VecDeque<String>,
    cap: usize,
}

impl OutputTail {
    fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(cap),
            cap,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

fn relay<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((stream, line)).is_err() {
                break;
            }
        }
    });
}

/// Infer the failure class from the tool's output.
pub fn classify(output: &str) -> FailureClass {
    let lower = output.to_lowercase();
    if CONNECTION_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::Connection
    } else if CONFLICT_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::Conflict
    } else {
        FailureClass::Apply
    }
}

#[async_trait]
impl Migrator for CommandMigrator {
    fn describe(&self) -> String {
        format!("migration command `{}`", self.command)
    }

    async fn upgrade(&self) -> Result<MigrationReport, MigrationError> {
        tracing::info!(command = %self.command, "Running migration command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        process::own_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(MigrationError::Spawn)?;
        let mut group = ProcessGroup::of(&child);

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            relay(stdout, Stream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            relay(stderr, Stream::Stderr, tx.clone());
        }
        drop(tx);

        let collect = async move {
            let mut tail = OutputTail::new(OUTPUT_TAIL_LINES);
            while let Some((stream, line)) = rx.recv().await {
                match stream {
                    Stream::Stdout => tracing::info!(target: "startgate::migrate::tool", "{}", line),
                    Stream::Stderr => tracing::warn!(target: "startgate::migrate::tool", "{}", line),
                }
                tail.push(line);
            }
            tail
        };

        let finished = tokio::time::timeout(self.timeout, async {
            tokio::join!(child.wait(), collect)
        })
        .await;

        let (status, tail) = match finished {
            Ok((status, tail)) => {
                group.disarm();
                (status.map_err(MigrationError::Spawn)?, tail)
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "Migration command timed out, stopping it");
                if !group.terminate()
                    && let Err(e) = child.start_kill()
                {
                    tracing::warn!(error = %e, "Failed to stop timed-out migration command");
                }
                if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                    tracing::warn!("Migration command ignored SIGTERM, killing it");
                }
                // Anything the tool started that outlived it goes too.
                group.kill();
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "Migration command already exited");
                }
                return Err(MigrationError::TimedOut(self.timeout));
            }
        };

        if status.success() {
            tracing::info!("Migration command finished");
            return Ok(MigrationReport::default());
        }

        let detail = tail.joined();
        Err(MigrationError::ToolFailed {
            code: status.code().unwrap_or(-1),
            class: classify(&detail),
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrator(command: &str) -> CommandMigrator {
        CommandMigrator::new(command, Duration::from_secs(10))
    }

    #[test]
    fn test_classify_connection_output() {
        let out = "sqlalchemy.exc.OperationalError: connection to server at \"db\" failed: Connection refused";
        assert_eq!(classify(out), FailureClass::Connection);
    }

    #[test]
    fn test_classify_conflict_output() {
        assert_eq!(
            classify("ERROR [alembic.util.messaging] Multiple heads are present"),
            FailureClass::Conflict
        );
        assert_eq!(
            classify("Can't locate revision identified by 'abc123'"),
            FailureClass::Conflict
        );
    }

    #[test]
    fn test_classify_defaults_to_apply() {
        assert_eq!(
            classify("IntegrityError: duplicate key value violates unique constraint"),
            FailureClass::Apply
        );
    }

    #[test]
    fn test_output_tail_is_bounded() {
        let mut tail = OutputTail::new(3);
        for i in 1..=5 {
            tail.push(format!("line{}", i));
        }
        assert_eq!(tail.joined(), "line3\nline4\nline5");
    }

    #[tokio::test]
    async fn test_successful_command() {
        let report = migrator("echo upgraded").upgrade().await.unwrap();
        assert!(report.applied.is_empty());
        assert!(report.head.is_none());
    }

    #[tokio::test]
    async fn test_exit_code_is_kept() {
        let err = migrator("exit 3").upgrade().await.unwrap_err();
        match err {
            MigrationError::ToolFailed { code, class, .. } => {
                assert_eq!(code, 3);
                assert_eq!(class, FailureClass::Apply);
            }
            other => panic!("Expected ToolFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_failure_is_classified_from_stderr() {
        let err = migrator("echo 'could not connect to server: Connection refused' >&2; exit 1")
            .upgrade()
            .await
            .unwrap_err();
        assert_eq!(err.class(), FailureClass::Connection);
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("Connection refused"));
    }

    #[tokio::test]
    async fn test_failure_detail_keeps_last_lines() {
        let err = migrator("i=1; while [ $i -le 30 ]; do echo line$i; i=$((i+1)); done; exit 1")
            .upgrade()
            .await
            .unwrap_err();
        let MigrationError::ToolFailed { detail, .. } = err else {
            panic!("Expected ToolFailed");
        };
        let lines: Vec<&str> = detail.lines().collect();
        assert_eq!(lines.len(), OUTPUT_TAIL_LINES);
        assert_eq!(lines[0], "line11");
        assert_eq!(lines[19], "line30");
    }

    #[tokio::test]
    async fn test_database_url_is_exported() {
        let ok = migrator("test \"$DATABASE_URL\" = 'sqlite://app.db'")
            .env("DATABASE_URL", "sqlite://app.db")
            .upgrade()
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        migrator("test -f marker")
            .working_dir(dir.path())
            .upgrade()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_timeout_kills_tool() {
        let err = CommandMigrator::new("exec sleep 5", Duration::from_millis(100))
            .upgrade()
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::TimedOut(_)));
        assert_eq!(err.class(), FailureClass::Conflict);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_processes_started_by_tool() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandMigrator::new(
            "cd . && sh -c 'sleep 2; touch applied_after_timeout'",
            Duration::from_millis(200),
        )
        .working_dir(dir.path())
        .upgrade()
        .await
        .unwrap_err();
        assert!(matches!(err, MigrationError::TimedOut(_)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("applied_after_timeout").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_ignoring_sigterm_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = CommandMigrator::new(
            "trap '' TERM; sleep 10; touch survived",
            Duration::from_millis(200),
        )
        .working_dir(dir.path())
        .upgrade()
        .await
        .unwrap_err();
        assert!(matches!(err, MigrationError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(8));
        assert!(!dir.path().join("survived").exists());
    }
}
