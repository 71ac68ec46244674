//! Stdio plumbing for runsc processes.
//!
//! Non-terminal processes get anonymous pipes as stdio. The shim keeps the
//! other ends and copies between them and the fifos named in the request.
//! Terminal processes get a console instead, see [`crate::console`].

use crate::console::{self, Console, ConsolePlatform};
use crate::process::Stdio;
use gvshim_shared::errors::{ShimError, ShimResult};
use parking_lot::Mutex;
use std::os::unix::io::OwnedFd;
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;

/// Child side of the stdio pipes, handed to the runsc command.
pub(crate) struct ChildStdio {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Shim side of the stdio pipes, until copying starts.
struct ShimStdio {
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
}

/// Create pipes for every stream named in `stdio`, owned by `uid:gid` on the child side.
pub(crate) fn pipes(stdio: &Stdio, uid: u32, gid: u32) -> ShimResult<(ChildStdio, PendingIo)> {
    let mut child = ChildStdio {
        stdin: None,
        stdout: None,
        stderr: None,
    };
    let mut shim = ShimStdio {
        stdin: None,
        stdout: None,
        stderr: None,
    };

    if !stdio.stdin.is_empty() {
        let (read, write) = pipe_pair()?;
        chown(&read, uid, gid)?;
        child.stdin = Some(read);
        shim.stdin = Some(write);
    }
    if !stdio.stdout.is_empty() {
        let (read, write) = pipe_pair()?;
        chown(&write, uid, gid)?;
        child.stdout = Some(write);
        shim.stdout = Some(read);
    }
    if !stdio.stderr.is_empty() {
        let (read, write) = pipe_pair()?;
        chown(&write, uid, gid)?;
        child.stderr = Some(write);
        shim.stderr = Some(read);
    }

    Ok((child, PendingIo { shim }))
}

fn pipe_pair() -> ShimResult<(OwnedFd, OwnedFd)> {
    // The child side is dup'ed onto fds 0-2 by the command, which clears CLOEXEC there.
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
        .map_err(|e| ShimError::Internal(format!("pipe: {}", e)))
}

fn chown(fd: &OwnedFd, uid: u32, gid: u32) -> ShimResult<()> {
    std::os::unix::fs::fchown(fd, Some(uid), Some(gid))
        .map_err(|e| ShimError::Io(e).context("chown stdio pipe"))
}

/// Shim side of the pipes of a process that has not been created yet.
pub(crate) struct PendingIo {
    shim: ShimStdio,
}

/// Stdio copy state of a running process.
#[derive(Default)]
pub(crate) struct ProcessIo {
    /// Stops only the stdin copy. Dropping the pipe's write end delivers EOF.
    stdin: CancellationToken,
    /// Stops every copy of this process.
    all: CancellationToken,
    console: Mutex<Option<Console>>,
}

impl ProcessIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start copying between the fifos in `stdio` and the shim side of the pipes.
    pub fn copy_pipes(&self, pending: PendingIo, stdio: &Stdio) -> ShimResult<()> {
        let ShimStdio {
            stdin,
            stdout,
            stderr,
        } = pending.shim;

        if let Some(fd) = stdin {
            let fifo = console::open_fifo_reader(&stdio.stdin)?;
            let pipe = pipe::Sender::from_owned_fd(fd)?;
            let token = self.stdin.clone();
            let all = self.all.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = all.cancelled() => {}
                    _ = console::copy(fifo, pipe, "stdin") => {}
                }
            });
        }
        if let Some(fd) = stdout {
            let pipe = pipe::Receiver::from_owned_fd(fd)?;
            let fifo = console::open_fifo_writer(&stdio.stdout)?;
            console::spawn_copy(self.all.clone(), pipe, fifo, "stdout");
        }
        if let Some(fd) = stderr {
            let pipe = pipe::Receiver::from_owned_fd(fd)?;
            let fifo = console::open_fifo_writer(&stdio.stderr)?;
            console::spawn_copy(self.all.clone(), pipe, fifo, "stderr");
        }
        Ok(())
    }

    /// Attach a terminal console and start copying it.
    pub fn attach_console(
        &self,
        console: Console,
        stdio: &Stdio,
        platform: &ConsolePlatform,
    ) -> ShimResult<()> {
        platform.copy_console(&console, stdio, &self.stdin)?;
        *self.console.lock() = Some(console);
        Ok(())
    }

    pub fn resize(&self, size: crate::process::WinSize) -> ShimResult<()> {
        match self.console.lock().as_ref() {
            Some(console) => console.resize(size),
            None => Err(ShimError::FailedPrecondition(
                "process does not have a terminal".into(),
            )),
        }
    }

    /// Close stdin. Closing twice is a no-op.
    pub fn close_stdin(&self) {
        self.stdin.cancel();
    }

    /// Stop every copy and drop the console.
    pub fn close(&self) {
        self.all.cancel();
        self.console.lock().take();
    }
}
