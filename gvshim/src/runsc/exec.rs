//! Processes exec'd into a running container.

use super::init::ContainerContext;
use super::io::ProcessIo;
use super::{read_pid_file, ExecOpts};
use crate::process::{ExitCell, ExitRecord, Process, Stdio, WinSize};
use async_trait::async_trait;
use gvshim_shared::errors::{ShimError, ShimResult};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, info};

pub(crate) struct RunscExec {
    ctx: ContainerContext,
    id: String,
    stdio: Stdio,
    spec: serde_json::Value,
    started: AtomicBool,
    pid: AtomicU32,
    exit: ExitCell,
    io: ProcessIo,
}

impl RunscExec {
    pub fn new(ctx: ContainerContext, id: String, stdio: Stdio, spec: serde_json::Value) -> Self {
        Self {
            ctx,
            id,
            stdio,
            spec,
            started: AtomicBool::new(false),
            pid: AtomicU32::new(0),
            exit: ExitCell::new(),
            io: ProcessIo::new(),
        }
    }

    fn spec_path(&self) -> PathBuf {
        self.ctx.work_dir.join(format!("{}.json", self.id))
    }

    fn pid_file(&self) -> PathBuf {
        self.ctx.work_dir.join(format!("{}.pid", self.id))
    }

    async fn remove_state_files(&self) {
        for path in [self.spec_path(), self.pid_file()] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "Failed to remove exec state file");
                }
            }
        }
    }
}

#[async_trait]
impl Process for RunscExec {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    fn stdio(&self) -> Stdio {
        self.stdio.clone()
    }

    async fn status(&self) -> ShimResult<String> {
        let status = if self.exit.is_set() {
            "stopped"
        } else if self.pid() == 0 {
            "created"
        } else {
            "running"
        };
        Ok(status.to_string())
    }

    fn exit_record(&self) -> Option<ExitRecord> {
        self.exit.get()
    }

    fn set_exited(&self, status: i32) {
        self.exit.set(status);
    }

    async fn wait(&self) -> ExitRecord {
        self.exit.wait().await
    }

    async fn start(&self) -> ShimResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ShimError::FailedPrecondition(format!(
                "process {} already started",
                self.id
            )));
        }

        let spec_path = self.spec_path();
        tokio::fs::write(&spec_path, serde_json::to_vec(&self.spec)?)
            .await
            .map_err(|e| ShimError::Io(e).context("write exec process spec"))?;

        let (socket, child, pending) = self.ctx.prepare_io(&self.id, &self.stdio)?;
        let opts = ExecOpts {
            pid_file: self.pid_file(),
            console_socket: socket.as_ref().map(|s| s.path().to_path_buf()),
        };

        let started = async {
            self.ctx
                .runtime
                .exec(&self.ctx.id, &spec_path, &opts, child)
                .await?;
            self.ctx
                .attach_io(&self.io, &self.stdio, socket, pending)
                .await?;
            read_pid_file(&opts.pid_file).await
        };
        let pid = match started.await {
            Ok(pid) => pid,
            Err(e) => {
                self.io.close();
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.pid.store(pid, Ordering::SeqCst);
        self.ctx.monitor.watch(
            self.ctx.runtime.clone(),
            self.ctx.id.clone(),
            self.id.clone(),
            pid,
            Some(pid),
        );
        info!(container_id = %self.ctx.id, id = %self.id, pid, "Exec process started");
        Ok(())
    }

    async fn delete(&self) -> ShimResult<()> {
        if self.pid() != 0 && !self.exit.is_set() {
            return Err(ShimError::FailedPrecondition(
                "cannot delete a running process".into(),
            ));
        }
        self.io.close();
        self.remove_state_files().await;
        Ok(())
    }

    async fn kill(&self, signal: u32, _all: bool) -> ShimResult<()> {
        if self.exit.is_set() {
            return Err(ShimError::NotFound(format!(
                "process {} already finished",
                self.id
            )));
        }
        let pid = self.pid();
        if pid == 0 {
            return Err(ShimError::FailedPrecondition(format!(
                "process {} not started",
                self.id
            )));
        }
        self.ctx
            .runtime
            .kill(&self.ctx.id, signal, false, Some(pid))
            .await
    }

    async fn resize(&self, size: WinSize) -> ShimResult<()> {
        self.io.resize(size)
    }

    async fn close_stdin(&self) -> ShimResult<()> {
        self.io.close_stdin();
        Ok(())
    }
}
