//! Task service.
//!
//! Maps task-control operations onto the container's processes:
//! - `registry`: the container id, bundle and tracked processes behind one lock
//! - `exits`: background loop reconciling exit notifications
//! - `events`: bounded outbound event queue and the loop forwarding it to the publisher

mod events;
mod exits;
mod registry;

use crate::config::Config;
use crate::mount::{self, Mounter, RollbackGuard};
use crate::process::{CreateConfig, Exit, ExecConfig, ProcessFactory, Stdio, TrackedProcess, WinSize};
use crate::publisher::Publisher;
use events::EventSender;
use gvshim_shared::api::*;
use gvshim_shared::constants::bundle::ROOTFS_DIR;
use gvshim_shared::errors::{ShimError, ShimResult};
use gvshim_shared::events::{TaskCreate, TaskDelete, TaskExecAdded, TaskExecStarted, TaskIo, TaskStart};
use gvshim_shared::TaskEvent;
use registry::ProcessRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Lifecycle coordinator for the one container owned by this shim.
pub struct TaskService {
    registry: Arc<ProcessRegistry>,
    events: EventSender,
    factory: Arc<dyn ProcessFactory>,
    mounter: Arc<dyn Mounter>,
}

impl TaskService {
    /// Build the service and spawn its exit reconciliation and event forwarding loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: &Config,
        publisher: Arc<dyn Publisher>,
        exits: mpsc::UnboundedReceiver<Exit>,
        factory: Arc<dyn ProcessFactory>,
        mounter: Arc<dyn Mounter>,
    ) -> ShimResult<Self> {
        config.validate()?;

        let registry = Arc::new(ProcessRegistry::new());
        let (events, queue) = EventSender::channel();

        tokio::spawn(exits::process_exits(exits, registry.clone(), events.clone()));
        tokio::spawn(events::forward(queue, publisher));

        info!(namespace = %config.namespace, "Task service ready");

        Ok(Self {
            registry,
            events,
            factory,
            mounter,
        })
    }

    /// Create the container and its (not yet started) init process.
    pub async fn create(&self, req: CreateTaskRequest) -> ShimResult<CreateTaskResponse> {
        if req.id.is_empty() {
            return Err(ShimError::InvalidArgument("id not provided".into()));
        }
        if req.bundle.is_empty() {
            return Err(ShimError::InvalidArgument("bundle not provided".into()));
        }

        let reservation = self.registry.reserve_create()?;

        let config = CreateConfig {
            id: req.id,
            bundle: PathBuf::from(req.bundle),
            runtime: req.runtime,
            rootfs: req.rootfs,
            stdio: Stdio {
                stdin: req.stdin,
                stdout: req.stdout,
                stderr: req.stderr,
                terminal: req.terminal,
            },
            options: req.options,
        };

        // Options and the bundle spec are decoded before anything is mounted.
        let init = self.factory.new_init(&config)?;

        let rootfs = config.bundle.join(ROOTFS_DIR);
        let guard = (!config.rootfs.is_empty())
            .then(|| RollbackGuard::new(self.mounter.as_ref(), &rootfs));
        mount::mount_all(self.mounter.as_ref(), &config.rootfs, &rootfs)?;

        init.create().await?;

        if let Some(guard) = guard {
            guard.disarm();
        }
        let pid = init.pid();
        reservation.commit(&config.id, &config.bundle, init);

        info!(id = %config.id, pid, bundle = %config.bundle.display(), "Container created");

        self.events
            .send(TaskEvent::TaskCreate(TaskCreate {
                container_id: config.id,
                bundle: config.bundle.display().to_string(),
                rootfs: config.rootfs,
                io: TaskIo {
                    stdin: config.stdio.stdin,
                    stdout: config.stdio.stdout,
                    stderr: config.stdio.stderr,
                    terminal: config.stdio.terminal,
                },
                pid,
            }))
            .await;

        Ok(CreateTaskResponse { pid })
    }

    /// Start the init process or a prepared exec process.
    ///
    /// Exits of the process reported while it is starting are reconciled
    /// only after its start event is queued.
    pub async fn start(&self, req: StartRequest) -> ShimResult<StartResponse> {
        let tracked = self.registry.get(&req.id)?;

        self.registry.begin_start(&req.id);
        let result = self.start_process(&tracked, req.id.clone()).await;
        for exit in self.registry.finish_start(&req.id) {
            exits::check_processes(&self.registry, &self.events, exit).await;
        }
        result
    }

    async fn start_process(&self, tracked: &TrackedProcess, id: String) -> ShimResult<StartResponse> {
        let process = tracked.process();
        process.start().await?;

        let pid = process.pid();
        let container_id = self.registry.container_id();
        info!(id = %id, pid, "Process started");

        let event = if tracked.is_init() {
            TaskEvent::TaskStart(TaskStart { container_id, pid })
        } else {
            TaskEvent::TaskExecStarted(TaskExecStarted {
                container_id,
                exec_id: id.clone(),
                pid,
            })
        };
        self.events.send(event).await;

        Ok(StartResponse { id, pid })
    }

    /// Delete the init process and release the container's platform resources.
    pub async fn delete(&self) -> ShimResult<DeleteResponse> {
        let init = self.registry.init()?;
        init.delete().await?;

        let id = init.id().to_string();
        self.registry.remove(&id);
        self.factory.close();

        let response = delete_response(init.pid(), init.exit_record());
        info!(id = %id, exit_status = response.exit_status, "Container deleted");
        self.send_delete(id, &response).await;
        Ok(response)
    }

    /// Delete an exec'd process.
    pub async fn delete_process(&self, req: DeleteProcessRequest) -> ShimResult<DeleteResponse> {
        if req.id == self.registry.container_id() {
            return Err(ShimError::InvalidArgument(
                "cannot delete init process with DeleteProcess".into(),
            ));
        }
        let tracked = self.registry.get(&req.id)?;
        let process = tracked.process();
        process.delete().await?;

        self.registry.remove(&req.id);

        let response = delete_response(process.pid(), process.exit_record());
        info!(id = %req.id, exit_status = response.exit_status, "Process deleted");
        self.send_delete(req.id, &response).await;
        Ok(response)
    }

    /// Prepare an additional process inside the container. It is not running
    /// until it is started.
    pub async fn exec(&self, req: ExecProcessRequest) -> ShimResult<()> {
        let init = self.registry.init_for_exec(&req.id)?;

        let process = init
            .exec(ExecConfig {
                id: req.id.clone(),
                stdio: Stdio {
                    stdin: req.stdin,
                    stdout: req.stdout,
                    stderr: req.stderr,
                    terminal: req.terminal,
                },
                spec: req.spec,
            })
            .await?;

        // The id may have been claimed while the exec ran unlocked.
        if let Err(e) = self.registry.insert_exec(process.clone()) {
            if let Err(cleanup) = process.delete().await {
                warn!(id = %req.id, error = %cleanup, "Failed to release duplicate exec process");
            }
            return Err(e);
        }

        self.events
            .send(TaskEvent::TaskExecAdded(TaskExecAdded {
                container_id: self.registry.container_id(),
                exec_id: req.id,
            }))
            .await;
        Ok(())
    }

    pub async fn resize_pty(&self, req: ResizePtyRequest) -> ShimResult<()> {
        if req.id.is_empty() {
            return Err(ShimError::InvalidArgument("id not provided".into()));
        }
        let size = WinSize {
            width: req.width as u16,
            height: req.height as u16,
        };
        self.registry.get(&req.id)?.process().resize(size).await
    }

    pub async fn state(&self, req: StateRequest) -> ShimResult<StateResponse> {
        let tracked = self.registry.get(&req.id)?;
        let process = tracked.process();
        let status = TaskStatus::from_runtime(&process.status().await?);
        let stdio = process.stdio();
        let exit = process.exit_record();

        Ok(StateResponse {
            id: process.id().to_string(),
            bundle: self.registry.bundle().display().to_string(),
            pid: process.pid(),
            status,
            stdin: stdio.stdin,
            stdout: stdio.stdout,
            stderr: stdio.stderr,
            terminal: stdio.terminal,
            exit_status: exit.map(|e| e.status as u32).unwrap_or_default(),
            exited_at: exit.map(|e| e.exited_at),
        })
    }

    pub async fn pause(&self) -> ShimResult<()> {
        Err(ShimError::NotImplemented)
    }

    pub async fn resume(&self) -> ShimResult<()> {
        Err(ShimError::NotImplemented)
    }

    /// Signal a process. An empty id targets the init process.
    pub async fn kill(&self, req: KillRequest) -> ShimResult<()> {
        if req.id.is_empty() {
            let init = self.registry.init()?;
            return init.kill(req.signal, req.all).await;
        }
        self.registry
            .get(&req.id)?
            .process()
            .kill(req.signal, req.all)
            .await
    }

    /// Live pids inside the container, annotated with the tracked process id
    /// owning each pid.
    pub async fn list_pids(&self, _req: ListPidsRequest) -> ShimResult<ListPidsResponse> {
        let init = self.registry.init()?;
        let pids = init.pids().await?;
        let ids = self.registry.ids_by_pid();

        let processes = pids
            .into_iter()
            .map(|pid| ProcessInfo {
                pid,
                info: ids.get(&pid).map(|id| ProcessDetails {
                    exec_id: id.clone(),
                }),
            })
            .collect();
        Ok(ListPidsResponse { processes })
    }

    /// Close a process's stdin.
    pub async fn close_io(&self, req: CloseIoRequest) -> ShimResult<()> {
        self.registry
            .get(&req.id)?
            .process()
            .close_stdin()
            .await
            .map_err(|e| e.context("close stdin"))
    }

    pub async fn checkpoint(&self, _req: CheckpointTaskRequest) -> ShimResult<()> {
        Err(ShimError::NotImplemented)
    }

    pub fn shim_info(&self) -> ShimInfoResponse {
        ShimInfoResponse {
            shim_pid: std::process::id(),
        }
    }

    pub async fn update(&self, _req: UpdateTaskRequest) -> ShimResult<()> {
        Err(ShimError::NotImplemented)
    }

    /// Wait for a process to exit.
    pub async fn wait(&self, req: WaitRequest) -> ShimResult<WaitResponse> {
        let tracked = self.registry.get(&req.id)?;
        let record = tracked.process().wait().await;
        Ok(WaitResponse {
            exit_status: record.status as u32,
            exited_at: Some(record.exited_at),
        })
    }

    /// True if `id` is currently tracked.
    pub fn is_tracked(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    /// True if `id` is tracked as the container's init process.
    pub fn is_init(&self, id: &str) -> bool {
        matches!(self.registry.get(id), Ok(TrackedProcess::Init(_)))
    }

    async fn send_delete(&self, id: String, response: &DeleteResponse) {
        self.events
            .send(TaskEvent::TaskDelete(TaskDelete {
                container_id: self.registry.container_id(),
                id,
                pid: response.pid,
                exit_status: response.exit_status,
                exited_at: response.exited_at,
            }))
            .await;
    }
}

fn delete_response(pid: u32, exit: Option<crate::process::ExitRecord>) -> DeleteResponse {
    DeleteResponse {
        pid,
        exit_status: exit.map(|e| e.status as u32).unwrap_or_default(),
        exited_at: exit.map(|e| e.exited_at),
    }
}
