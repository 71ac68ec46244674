//! Fake collaborators for driving `TaskService` without runsc or mounts.

#![allow(dead_code)]

use async_trait::async_trait;
use gvshim::process::{
    CreateConfig, ExecConfig, Exit, ExitCell, ExitRecord, InitProcess, Process, ProcessFactory,
    Stdio, WinSize,
};
use gvshim::{Config, Mounter, Publisher, TaskService};
use gvshim_shared::api::{CreateTaskRequest, Mount};
use gvshim_shared::errors::{ShimError, ShimResult};
use gvshim_shared::TaskEvent;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// FAKE HOST
// ============================================================================

/// What the fake sandbox runtime knows about the machine.
pub struct FakeHost {
    next_pid: AtomicU32,
    /// Pids reported by `pids()`
    pub live_pids: Mutex<Vec<u32>>,
    /// (process id, signal, all)
    pub kills: Mutex<Vec<(String, u32, bool)>>,
    pub kill_all_calls: AtomicUsize,
    /// Make the next init `create()` fail
    pub fail_create: AtomicBool,
    /// Report an exit with this status from inside `start()`, as a process
    /// that dies while runsc is still starting it
    pub exit_on_start: Mutex<Option<(mpsc::UnboundedSender<Exit>, i32)>>,
    /// The next `exec()` waits for this before returning
    pub exec_gate: Mutex<Option<oneshot::Receiver<()>>>,
    /// Ids of deleted processes
    pub deleted: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(100),
            live_pids: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            kill_all_calls: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            exit_on_start: Mutex::new(None),
            exec_gate: Mutex::new(None),
            deleted: Mutex::new(Vec::new()),
        })
    }

    fn allocate_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }
}

// ============================================================================
// FAKE PROCESSES
// ============================================================================

pub struct FakeProcess {
    id: String,
    stdio: Stdio,
    host: Arc<FakeHost>,
    pid: AtomicU32,
    started: AtomicBool,
    pub stdin_closed: AtomicBool,
    exit: ExitCell,
}

impl FakeProcess {
    fn new(id: &str, stdio: Stdio, host: Arc<FakeHost>) -> Self {
        Self {
            id: id.to_string(),
            stdio,
            host,
            pid: AtomicU32::new(0),
            started: AtomicBool::new(false),
            stdin_closed: AtomicBool::new(false),
            exit: ExitCell::new(),
        }
    }
}

#[async_trait]
impl Process for FakeProcess {
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
        } else if self.started.load(Ordering::SeqCst) {
            "running"
        } else {
            "created"
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
            return Err(ShimError::FailedPrecondition("already started".into()));
        }
        if self.pid() == 0 {
            self.pid.store(self.host.allocate_pid(), Ordering::SeqCst);
        }

        let exit_on_start = self.host.exit_on_start.lock().clone();
        if let Some((exits, status)) = exit_on_start {
            exits
                .send(Exit {
                    id: self.id.clone(),
                    pid: self.pid(),
                    status,
                })
                .expect("exit loop stopped");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    async fn delete(&self) -> ShimResult<()> {
        if self.started.load(Ordering::SeqCst) && !self.exit.is_set() {
            return Err(ShimError::FailedPrecondition(
                "cannot delete a running process".into(),
            ));
        }
        self.host.deleted.lock().push(self.id.clone());
        Ok(())
    }

    async fn kill(&self, signal: u32, all: bool) -> ShimResult<()> {
        if self.exit.is_set() {
            return Err(ShimError::NotFound("process already finished".into()));
        }
        self.host.kills.lock().push((self.id.clone(), signal, all));
        Ok(())
    }

    async fn resize(&self, _size: WinSize) -> ShimResult<()> {
        if !self.stdio.terminal {
            return Err(ShimError::FailedPrecondition(
                "process does not have a terminal".into(),
            ));
        }
        Ok(())
    }

    async fn close_stdin(&self) -> ShimResult<()> {
        self.stdin_closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Init process: a [`FakeProcess`] plus the container-wide capabilities.
pub struct FakeInit {
    inner: FakeProcess,
}

#[async_trait]
impl Process for FakeInit {
    fn id(&self) -> &str {
        self.inner.id()
    }
    fn pid(&self) -> u32 {
        self.inner.pid()
    }
    fn stdio(&self) -> Stdio {
        self.inner.stdio()
    }
    async fn status(&self) -> ShimResult<String> {
        self.inner.status().await
    }
    fn exit_record(&self) -> Option<ExitRecord> {
        self.inner.exit_record()
    }
    fn set_exited(&self, status: i32) {
        self.inner.set_exited(status)
    }
    async fn wait(&self) -> ExitRecord {
        self.inner.wait().await
    }
    async fn start(&self) -> ShimResult<()> {
        self.inner.start().await
    }
    async fn delete(&self) -> ShimResult<()> {
        self.inner.delete().await
    }
    async fn kill(&self, signal: u32, all: bool) -> ShimResult<()> {
        self.inner.kill(signal, all).await
    }
    async fn resize(&self, size: WinSize) -> ShimResult<()> {
        self.inner.resize(size).await
    }
    async fn close_stdin(&self) -> ShimResult<()> {
        self.inner.close_stdin().await
    }
}

#[async_trait]
impl InitProcess for FakeInit {
    async fn create(&self) -> ShimResult<()> {
        if self.inner.host.fail_create.load(Ordering::SeqCst) {
            return Err(ShimError::Runtime("runsc create failed (exit status: 1)".into()));
        }
        self.inner
            .pid
            .store(self.inner.host.allocate_pid(), Ordering::SeqCst);
        Ok(())
    }

    async fn exec(&self, config: ExecConfig) -> ShimResult<Arc<dyn Process>> {
        let gate = self.inner.host.exec_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(Arc::new(FakeProcess::new(
            &config.id,
            config.stdio,
            self.inner.host.clone(),
        )))
    }

    async fn kill_all(&self) -> ShimResult<()> {
        self.inner.host.kill_all_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pids(&self) -> ShimResult<Vec<u32>> {
        Ok(self.inner.host.live_pids.lock().clone())
    }
}

// ============================================================================
// FAKE FACTORY / MOUNTER / PUBLISHER
// ============================================================================

pub struct FakeFactory {
    host: Arc<FakeHost>,
    pub closed: AtomicBool,
}

impl FakeFactory {
    pub fn new(host: Arc<FakeHost>) -> Arc<Self> {
        Arc::new(Self {
            host,
            closed: AtomicBool::new(false),
        })
    }
}

impl ProcessFactory for FakeFactory {
    fn new_init(&self, config: &CreateConfig) -> ShimResult<Arc<dyn InitProcess>> {
        if let Some(options) = &config.options {
            if !options.is_object() {
                return Err(ShimError::InvalidArgument(
                    "failed to decode runtime options".into(),
                ));
            }
        }
        Ok(Arc::new(FakeInit {
            inner: FakeProcess::new(&config.id, config.stdio.clone(), self.host.clone()),
        }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Records mounts per target; fails mounts whose source is `fail_source`.
#[derive(Default)]
pub struct FakeMounter {
    pub mounted: Mutex<Vec<(PathBuf, String)>>,
    pub mount_calls: AtomicUsize,
    pub fail_source: Option<String>,
}

impl Mounter for FakeMounter {
    fn mount(&self, mount: &Mount, target: &Path) -> ShimResult<()> {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_source.as_deref() == Some(mount.source.as_str()) {
            return Err(ShimError::Mount(format!(
                "mount {} on {}: EPERM",
                mount.source,
                target.display()
            )));
        }
        self.mounted
            .lock()
            .push((target.to_path_buf(), mount.source.clone()));
        Ok(())
    }

    fn unmount_all(&self, target: &Path) -> ShimResult<()> {
        self.mounted.lock().retain(|(t, _)| t != target);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<(String, TaskEvent)>>,
}

impl RecordingPublisher {
    pub fn topics(&self) -> Vec<String> {
        self.events.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<TaskEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Wait until `count` events were published on `topic`.
    pub async fn wait_for(&self, topic: &str, count: usize) -> Vec<TaskEvent> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let events = self.on_topic(topic);
            if events.len() >= count {
                return events;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} event(s) on {}, got {:?}",
                count,
                topic,
                self.topics()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, event: &TaskEvent) -> ShimResult<()> {
        self.events.lock().push((topic.to_string(), event.clone()));
        Ok(())
    }
}

// ============================================================================
// TEST CONTEXT
// ============================================================================

/// Task service wired to fakes, with a scratch bundle directory.
pub struct TestContext {
    pub service: Arc<TaskService>,
    pub host: Arc<FakeHost>,
    pub factory: Arc<FakeFactory>,
    pub mounter: Arc<FakeMounter>,
    pub publisher: Arc<RecordingPublisher>,
    pub exits: mpsc::UnboundedSender<Exit>,
    pub bundle: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_mounter(FakeMounter::default())
    }

    pub fn with_mounter(mounter: FakeMounter) -> Self {
        let bundle = TempDir::new().expect("Failed to create bundle dir");
        let host = FakeHost::new();
        let factory = FakeFactory::new(host.clone());
        let mounter = Arc::new(mounter);
        let publisher = Arc::new(RecordingPublisher::default());
        let (exits, exit_rx) = mpsc::unbounded_channel();

        let service = TaskService::new(
            &test_config(),
            publisher.clone(),
            exit_rx,
            factory.clone(),
            mounter.clone(),
        )
        .expect("Failed to create task service");

        Self {
            service: Arc::new(service),
            host,
            factory,
            mounter,
            publisher,
            exits,
            bundle,
        }
    }

    pub fn bundle_path(&self) -> String {
        self.bundle.path().display().to_string()
    }

    pub fn rootfs(&self) -> PathBuf {
        self.bundle.path().join("rootfs")
    }

    pub fn create_request(&self, id: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            id: id.to_string(),
            bundle: self.bundle_path(),
            runtime: "runsc".to_string(),
            rootfs: vec![bind_mount("/src", "/dst")],
            stdin: format!("/run/{}/stdin", id),
            stdout: format!("/run/{}/stdout", id),
            stderr: format!("/run/{}/stderr", id),
            ..Default::default()
        }
    }

    /// Create container `id`, returning the init pid.
    pub async fn create(&self, id: &str) -> u32 {
        self.service
            .create(self.create_request(id))
            .await
            .expect("create failed")
            .pid
    }

    /// Deliver an exit notification as the reaper would.
    pub fn exit(&self, id: &str, pid: u32, status: i32) {
        self.exits
            .send(Exit {
                id: id.to_string(),
                pid,
                status,
            })
            .expect("exit loop stopped");
    }
}

pub fn test_config() -> Config {
    Config {
        namespace: "default".to_string(),
        ..Default::default()
    }
}

pub fn bind_mount(source: &str, target: &str) -> Mount {
    Mount {
        kind: "bind".to_string(),
        source: source.to_string(),
        target: target.to_string(),
        options: vec!["rbind".to_string(), "ro".to_string()],
    }
}
