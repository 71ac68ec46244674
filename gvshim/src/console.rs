//! Terminal consoles.
//!
//! runsc hands the pty master of a terminal process over a console socket
//! (`--console-socket`). The shim keeps the master to resize it and copies
//! it to and from the process's stdio fifos.

use crate::process::{Stdio, WinSize};
use gvshim_shared::errors::{ShimError, ShimResult};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use std::fs::File;
use std::io::IoSliceMut;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;

/// Console socket runsc connects to for sending the pty master.
pub struct ConsoleSocket {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl ConsoleSocket {
    /// Bind a console socket for process `id` under `dir`.
    pub fn new(dir: &Path, id: &str) -> ShimResult<Self> {
        let socket_path = dir.join(format!("console-{}.sock", id));

        // Remove stale socket if exists
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            ShimError::Internal(format!(
                "failed to create console socket {}: {}",
                socket_path.display(),
                e
            ))
        })?;

        tracing::debug!(socket_path = %socket_path.display(), "Created console socket");

        Ok(Self {
            listener,
            socket_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Receive the pty master. The runtime must already have connected or be about to.
    pub async fn receive(self) -> ShimResult<Console> {
        tokio::task::spawn_blocking(move || self.receive_pty_master())
            .await
            .map_err(|e| ShimError::Internal(format!("console receive task failed: {}", e)))?
            .map(|master| Console { master })
    }

    fn receive_pty_master(&self) -> ShimResult<OwnedFd> {
        let (stream, _) = self
            .listener
            .accept()
            .map_err(|e| ShimError::Internal(format!("console socket accept failed: {}", e)))?;

        let mut buf = [0u8; 4096];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);

        let msg = recvmsg::<UnixAddr>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(|e| ShimError::Internal(format!("failed to receive pty master: {}", e)))?;

        for cmsg in msg.cmsgs().into_iter().flatten() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&fd) = fds.first() {
                    tracing::debug!(fd, "Received pty master");
                    // SAFETY: SCM_RIGHTS hands us a fresh descriptor we now own.
                    return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }

        Err(ShimError::Internal("no pty master received".to_string()))
    }
}

impl Drop for ConsoleSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::warn!(
                socket_path = %self.socket_path.display(),
                error = %e,
                "Failed to cleanup console socket"
            );
        }
    }
}

/// Pty master of a terminal process.
pub struct Console {
    master: OwnedFd,
}

impl Console {
    pub fn resize(&self, size: WinSize) -> ShimResult<()> {
        use nix::pty::Winsize;

        let winsize = Winsize {
            ws_row: size.height,
            ws_col: size.width,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        unsafe {
            if nix::libc::ioctl(
                self.master.as_raw_fd(),
                nix::libc::TIOCSWINSZ,
                &winsize as *const _,
            ) == -1
            {
                let errno = std::io::Error::last_os_error();
                return Err(ShimError::Internal(format!(
                    "failed to resize console ({}x{}): {}",
                    size.width, size.height, errno
                )));
            }
        }
        Ok(())
    }

    fn file(&self) -> ShimResult<tokio::fs::File> {
        let fd = self.master.try_clone()?;
        Ok(tokio::fs::File::from_std(File::from(fd)))
    }
}

/// Console copy tasks of one container. Closing the platform stops them all.
#[derive(Default)]
pub struct ConsolePlatform {
    token: CancellationToken,
}

impl ConsolePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `stdio.stdin` into the console and the console into `stdio.stdout`.
    ///
    /// `stdin_token` stops only the stdin direction (CloseIO).
    pub fn copy_console(
        &self,
        console: &Console,
        stdio: &Stdio,
        stdin_token: &CancellationToken,
    ) -> ShimResult<()> {
        if !stdio.stdin.is_empty() {
            let fifo = open_fifo_reader(&stdio.stdin)?;
            let master = console.file()?;
            let token = stdin_token.clone();
            let platform = self.token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = platform.cancelled() => {}
                    _ = copy(fifo, master, "console stdin") => {}
                }
            });
        }

        if !stdio.stdout.is_empty() {
            let master = console.file()?;
            let fifo = open_fifo_writer(&stdio.stdout)?;
            spawn_copy(self.token.clone(), master, fifo, "console stdout");
        }
        Ok(())
    }

    /// Stop every console copy.
    pub fn close(&self) {
        self.token.cancel();
    }
}

/// Open a stdio fifo for reading without waiting for a writer.
pub(crate) fn open_fifo_reader(path: &str) -> ShimResult<pipe::Receiver> {
    pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)
        .map_err(|e| ShimError::Io(e).context(format!("open fifo {}", path)))
}

/// Open a stdio fifo for writing without waiting for a reader.
pub(crate) fn open_fifo_writer(path: &str) -> ShimResult<pipe::Sender> {
    pipe::OpenOptions::new()
        .read_write(true)
        .open_sender(path)
        .map_err(|e| ShimError::Io(e).context(format!("open fifo {}", path)))
}

pub(crate) async fn copy<R, W>(mut reader: R, mut writer: W, label: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => tracing::debug!(stream = label, bytes, "Stream copy finished"),
        Err(e) => tracing::debug!(stream = label, error = %e, "Stream copy ended"),
    }
}

/// Copy `reader` into `writer` until EOF or until `token` is cancelled.
pub(crate) fn spawn_copy<R, W>(token: CancellationToken, reader: R, writer: W, label: &'static str)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = copy(reader, writer, label) => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_console_socket_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ConsoleSocket::new(dir.path(), "exec-1").unwrap();

        assert!(socket.path().ends_with("console-exec-1.sock"));
        assert!(socket.path().exists());

        let path = socket.path().to_path_buf();
        drop(socket);

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_fifo_copy_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in");
        let dst = dir.path().join("out");
        nix::unistd::mkfifo(&src, Mode::S_IRWXU).unwrap();
        nix::unistd::mkfifo(&dst, Mode::S_IRWXU).unwrap();

        let reader = open_fifo_reader(src.to_str().unwrap()).unwrap();
        let writer = open_fifo_writer(dst.to_str().unwrap()).unwrap();
        let token = CancellationToken::new();
        spawn_copy(token.clone(), reader, writer, "test");

        let mut input = open_fifo_writer(src.to_str().unwrap()).unwrap();
        let mut output = open_fifo_reader(dst.to_str().unwrap()).unwrap();
        input.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        output.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        token.cancel();
    }
}
