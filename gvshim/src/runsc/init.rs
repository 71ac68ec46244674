//! The container's init process.

use super::exec::RunscExec;
use super::io::{self, ChildStdio, PendingIo, ProcessIo};
use super::{read_pid_file, CreateOpts, ExitMonitor, Runsc};
use crate::console::{ConsolePlatform, ConsoleSocket};
use crate::mount::Mounter;
use crate::process::{ExecConfig, ExitCell, ExitRecord, InitProcess, Process, Stdio, WinSize};
use async_trait::async_trait;
use gvshim_shared::constants::bundle::{INIT_PID_FILE, ROOTFS_DIR};
use gvshim_shared::errors::{ShimError, ShimResult};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// What exec'd processes share with the init process of their container.
#[derive(Clone)]
pub(crate) struct ContainerContext {
    pub id: String,
    pub work_dir: PathBuf,
    pub runtime: Arc<Runsc>,
    pub platform: Arc<ConsolePlatform>,
    pub monitor: ExitMonitor,
    pub io_uid: u32,
    pub io_gid: u32,
}

impl ContainerContext {
    /// Stdio for a process about to be created: a console socket for
    /// terminals, pipes otherwise.
    pub fn prepare_io(
        &self,
        id: &str,
        stdio: &Stdio,
    ) -> ShimResult<(Option<ConsoleSocket>, ChildStdio, Option<PendingIo>)> {
        if stdio.terminal {
            let socket = ConsoleSocket::new(&self.work_dir, id)?;
            return Ok((Some(socket), ChildStdio::none(), None));
        }
        if stdio.is_null() {
            return Ok((None, ChildStdio::none(), None));
        }
        let (child, pending) = io::pipes(stdio, self.io_uid, self.io_gid)?;
        Ok((None, child, Some(pending)))
    }

    /// Start copying stdio once the runtime has created the process.
    pub async fn attach_io(
        &self,
        process_io: &ProcessIo,
        stdio: &Stdio,
        socket: Option<ConsoleSocket>,
        pending: Option<PendingIo>,
    ) -> ShimResult<()> {
        if let Some(socket) = socket {
            let console = socket.receive().await?;
            process_io.attach_console(console, stdio, &self.platform)?;
        }
        if let Some(pending) = pending {
            process_io.copy_pipes(pending, stdio)?;
        }
        Ok(())
    }
}

/// Init process of a runsc container.
pub(crate) struct RunscInit {
    ctx: ContainerContext,
    bundle: PathBuf,
    stdio: Stdio,
    sandbox: bool,
    user_log: Option<String>,
    mounter: Arc<dyn Mounter>,
    pid: AtomicU32,
    exit: ExitCell,
    io: ProcessIo,
}

impl RunscInit {
    pub fn new(
        ctx: ContainerContext,
        bundle: PathBuf,
        stdio: Stdio,
        sandbox: bool,
        user_log: Option<String>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            ctx,
            bundle,
            stdio,
            sandbox,
            user_log,
            mounter,
            pid: AtomicU32::new(0),
            exit: ExitCell::new(),
            io: ProcessIo::new(),
        }
    }
}

#[async_trait]
impl Process for RunscInit {
    fn id(&self) -> &str {
        &self.ctx.id
    }

    fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    fn stdio(&self) -> Stdio {
        self.stdio.clone()
    }

    async fn status(&self) -> ShimResult<String> {
        if self.exit.is_set() {
            return Ok("stopped".to_string());
        }
        Ok(self.ctx.runtime.state(&self.ctx.id).await?.status)
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
        self.ctx.runtime.start(&self.ctx.id).await?;
        self.ctx.monitor.watch(
            self.ctx.runtime.clone(),
            self.ctx.id.clone(),
            self.ctx.id.clone(),
            self.pid(),
            None,
        );
        Ok(())
    }

    async fn delete(&self) -> ShimResult<()> {
        if !self.exit.is_set() && self.status().await? == "running" {
            return Err(ShimError::FailedPrecondition(
                "cannot delete a running process".into(),
            ));
        }

        self.ctx
            .runtime
            .delete(&self.ctx.id, !self.exit.is_set())
            .await?;
        self.io.close();

        self.mounter
            .unmount_all(&self.bundle.join(ROOTFS_DIR))
            .map_err(|e| e.context("failed rootfs umount"))
    }

    async fn kill(&self, signal: u32, all: bool) -> ShimResult<()> {
        self.ctx.runtime.kill(&self.ctx.id, signal, all, None).await
    }

    async fn resize(&self, size: WinSize) -> ShimResult<()> {
        self.io.resize(size)
    }

    async fn close_stdin(&self) -> ShimResult<()> {
        self.io.close_stdin();
        Ok(())
    }
}

#[async_trait]
impl InitProcess for RunscInit {
    async fn create(&self) -> ShimResult<()> {
        let (socket, child, pending) = self.ctx.prepare_io(&self.ctx.id, &self.stdio)?;
        let pid_file = self.bundle.join(INIT_PID_FILE);
        let opts = CreateOpts {
            pid_file: pid_file.clone(),
            console_socket: socket.as_ref().map(|s| s.path().to_path_buf()),
            user_log: self.user_log.clone(),
        };

        self.ctx
            .runtime
            .create(&self.ctx.id, &self.bundle, &opts, child)
            .await?;

        let created = async {
            self.ctx
                .attach_io(&self.io, &self.stdio, socket, pending)
                .await?;
            read_pid_file(&pid_file).await
        };
        let pid = match created.await {
            Ok(pid) => pid,
            Err(e) => {
                self.io.close();
                if let Err(cleanup) = self.ctx.runtime.delete(&self.ctx.id, true).await {
                    warn!(id = %self.ctx.id, error = %cleanup, "Failed to delete half-created container");
                }
                return Err(e);
            }
        };

        self.pid.store(pid, Ordering::SeqCst);
        info!(
            id = %self.ctx.id,
            pid,
            sandbox = self.sandbox,
            terminal = self.stdio.terminal,
            "runsc container created"
        );
        Ok(())
    }

    async fn exec(&self, config: ExecConfig) -> ShimResult<Arc<dyn Process>> {
        if self.exit.is_set() {
            return Err(ShimError::FailedPrecondition(
                "cannot exec in a stopped container".into(),
            ));
        }
        let spec = config
            .spec
            .ok_or_else(|| ShimError::InvalidArgument("exec process spec not provided".into()))?;
        serde_json::from_value::<oci_spec::runtime::Process>(spec.clone())
            .map_err(|e| ShimError::InvalidArgument(format!("invalid exec process spec: {}", e)))?;

        Ok(Arc::new(RunscExec::new(
            self.ctx.clone(),
            config.id,
            config.stdio,
            spec,
        )))
    }

    async fn kill_all(&self) -> ShimResult<()> {
        match self
            .ctx
            .runtime
            .kill(&self.ctx.id, Signal::SIGKILL as u32, true, None)
            .await
        {
            Err(ShimError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn pids(&self) -> ShimResult<Vec<u32>> {
        self.ctx.runtime.ps(&self.ctx.id).await
    }
}
