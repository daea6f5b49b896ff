//! Child process spawning and exit notification.
//!
//! The exit wait object has the same shape as a pipe endpoint: a detached
//! waiter thread blocks in `wait()` and signals a completion event the
//! scheduler can poll. Forced termination goes through the pid so the
//! waiter keeps sole ownership of the process handle and still reaps it.

use std::ffi::{OsStr, OsString};
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::pipe::Event;

pub struct ChildProc {
    pid: Pid,
    exit_rx: mpsc::Receiver<i32>,
    event: Event,
}

/// Spawns `program` with the given argv (argv\[0\] included) and the three
/// pipe ends as its standard handles. The ends are consumed; the parent's
/// copies are closed once the child holds its own.
pub fn spawn(
    program: &Path,
    argv: &[OsString],
    workdir: Option<&OsStr>,
    stdin: OwnedFd,
    stdout: OwnedFd,
    stderr: OwnedFd,
) -> Result<ChildProc> {
    let mut cmd = Command::new(program);
    if let Some((arg0, rest)) = argv.split_first() {
        cmd.arg0(arg0);
        cmd.args(rest);
    }
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::from(stdin));
    cmd.stdout(Stdio::from(stdout));
    cmd.stderr(Stdio::from(stderr));
    // Detach from the daemon's process group so terminal signals never
    // reach remote children.
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("cannot execute {}", program.display()))?;
    let pid = Pid::from_raw(child.id() as i32);

    let (event, mut signal) = Event::pair()?;
    let (exit_tx, exit_rx) = mpsc::channel();
    thread::Builder::new()
        .name("child-wait".into())
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
                Err(_) => -1,
            };
            if exit_tx.send(code).is_ok() {
                signal.signal();
            }
        })?;

    Ok(ChildProc {
        pid,
        exit_rx,
        event,
    })
}

impl ChildProc {
    pub fn event_fd(&self) -> RawFd {
        self.event.fd()
    }

    /// The exit code, once the waiter has reaped the child.
    pub fn exit_code(&mut self) -> Option<i32> {
        match self.exit_rx.try_recv() {
            Ok(code) => {
                self.event.reset();
                Some(code)
            }
            Err(mpsc::TryRecvError::Empty) => None,
            // The waiter cannot die before reporting, but never spin on a
            // signalled event with no result behind it.
            Err(mpsc::TryRecvError::Disconnected) => Some(-1),
        }
    }

    /// Forced termination. Reaping still happens on the waiter thread.
    pub fn kill(&self) {
        let _ = kill(self.pid, Signal::SIGKILL);
    }

    pub fn id(&self) -> i32 {
        self.pid.as_raw()
    }
}
