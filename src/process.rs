//! Process-group handling for spawned tools and servers.
//!
//! Commands run through `sh -c`, so the pid we hold is the shell's. Each
//! child is started as the leader of its own process group and every signal
//! goes to the whole group, reaching whatever the shell started.

use tokio::process::{Child, Command};

/// Start `cmd` as the leader of a new process group.
pub fn own_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Handle on the process group of a spawned child.
///
/// Dropping an armed handle sends SIGKILL to the group, so a cancelled
/// caller leaves nothing running.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    /// Must be called right after spawning, before the child is reaped.
    pub fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    /// Stop tracking the group; dropping no longer signals it.
    pub fn disarm(&mut self) {
        self.pgid = None;
    }

    /// Send SIGTERM to every process in the group. Returns false if nothing was signalled.
    pub fn terminate(&self) -> bool {
        match self.pgid {
            Some(pgid) => send(pgid, Signal::Term),
            None => false,
        }
    }

    /// Send SIGKILL to every process in the group and disarm.
    pub fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            send(pgid, Signal::Kill);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send(pgid: i32, signal: Signal) -> bool {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: a negative pid addresses the process group created for our child.
    let rc = unsafe { libc::kill(-pgid, signo) };
    if rc != 0 {
        tracing::debug!(pgid, ?signal, "Process group already gone");
    }
    rc == 0
}

#[cfg(not(unix))]
fn send(_pgid: i32, _signal: Signal) -> bool {
    false
}
