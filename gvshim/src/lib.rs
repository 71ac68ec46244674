//! gvshim: containerd v1 runtime shim for gVisor containers.
//!
//! One shim process owns one container. The [`TaskService`] coordinates the
//! container's processes; [`runsc`] drives the sandbox runtime; the
//! [`server`] exposes the task-control operations on a local socket.

#[cfg(not(target_os = "linux"))]
compile_error!("gvshim is Linux-only; build with a Linux target");

pub mod config;
pub mod console;
pub mod logging;
pub mod mount;
pub mod process;
pub mod publisher;
pub mod runsc;
pub mod server;
pub mod service;

pub use config::Config;
pub use mount::{Mounter, SystemMounter};
pub use process::{Exit, InitProcess, Process, ProcessFactory};
pub use publisher::{Publisher, RemotePublisher};
pub use server::ShimServer;
pub use service::TaskService;
