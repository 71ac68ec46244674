//! Process abstraction consumed by the task service.
//!
//! A container has exactly one *init* process and any number of *exec*'d
//! processes. Both implement [`Process`]; only the init process implements
//! [`InitProcess`], which adds the container-wide capabilities (exec into
//! the container, kill every process in it, list its pids).
//!
//! The registry stores [`TrackedProcess`], a closed variant type, so the
//! coordinator reaches init-only behavior by matching rather than downcasting.

mod exit;

pub use exit::{Exit, ExitCell, ExitRecord};

use async_trait::async_trait;
use gvshim_shared::api::Mount;
use gvshim_shared::errors::ShimResult;
use std::path::PathBuf;
use std::sync::Arc;

/// Standard I/O of a process, as paths handed over by the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stdio {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

impl Stdio {
    /// True when no stream is attached.
    pub fn is_null(&self) -> bool {
        self.stdin.is_empty() && self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// Terminal window size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WinSize {
    pub width: u16,
    pub height: u16,
}

/// Everything needed to build the init process. Consumed by Create.
#[derive(Debug, Clone, Default)]
pub struct CreateConfig {
    pub id: String,
    pub bundle: PathBuf,
    pub runtime: String,
    pub rootfs: Vec<Mount>,
    pub stdio: Stdio,
    /// Runtime-specific options blob
    pub options: Option<serde_json::Value>,
}

/// Everything needed to exec an additional process into the container.
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    pub id: String,
    pub stdio: Stdio,
    /// OCI process spec
    pub spec: Option<serde_json::Value>,
}

/// A process tracked by the shim.
#[async_trait]
pub trait Process: Send + Sync {
    /// Process id, unique within the shim.
    fn id(&self) -> &str;

    /// OS pid, 0 until the process has been created.
    fn pid(&self) -> u32;

    fn stdio(&self) -> Stdio;

    /// Status in the sandbox runtime's vocabulary (`created`, `running`, `stopped`).
    async fn status(&self) -> ShimResult<String>;

    /// Exit record, `None` until the process has exited.
    fn exit_record(&self) -> Option<ExitRecord>;

    /// Record the exit status. Only the first call has an effect.
    fn set_exited(&self, status: i32);

    /// Wait until the process has exited.
    async fn wait(&self) -> ExitRecord;

    async fn start(&self) -> ShimResult<()>;

    /// Release the process. Fails for a process that is still running.
    async fn delete(&self) -> ShimResult<()>;

    async fn kill(&self, signal: u32, all: bool) -> ShimResult<()>;

    async fn resize(&self, size: WinSize) -> ShimResult<()>;

    /// Close stdin, if the process has one.
    async fn close_stdin(&self) -> ShimResult<()>;
}

/// Capabilities only the container's init process has.
#[async_trait]
pub trait InitProcess: Process {
    /// Create the container in the sandbox runtime (does not start it).
    async fn create(&self) -> ShimResult<()>;

    /// Prepare an additional process inside the container.
    ///
    /// The returned process is not running until it is started.
    async fn exec(&self, config: ExecConfig) -> ShimResult<Arc<dyn Process>>;

    /// Kill every remaining process in the container.
    async fn kill_all(&self) -> ShimResult<()>;

    /// Live pids inside the container, as reported by the sandbox runtime.
    async fn pids(&self) -> ShimResult<Vec<u32>>;
}

/// Builds the init process for a Create call.
pub trait ProcessFactory: Send + Sync {
    /// Decode options and read the bundle, producing an uncreated init process.
    ///
    /// Runs before any rootfs mount is applied.
    fn new_init(&self, config: &CreateConfig) -> ShimResult<Arc<dyn InitProcess>>;

    /// Release platform resources (consoles) held for the container.
    fn close(&self) {}
}

/// Registry entry.
#[derive(Clone)]
pub enum TrackedProcess {
    Init(Arc<dyn InitProcess>),
    Exec(Arc<dyn Process>),
}

impl TrackedProcess {
    pub fn process(&self) -> &dyn Process {
        match self {
            TrackedProcess::Init(p) => p.as_ref(),
            TrackedProcess::Exec(p) => p.as_ref(),
        }
    }

    pub fn is_init(&self) -> bool {
        matches!(self, TrackedProcess::Init(_))
    }
}

impl std::fmt::Debug for TrackedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_init() { "Init" } else { "Exec" };
        f.debug_struct(kind)
            .field("id", &self.process().id())
            .field("pid", &self.process().pid())
            .finish()
    }
}
