//! Process reaper.

use super::Runsc;
use crate::process::Exit;
use gvshim_shared::constants::exit::UNKNOWN_STATUS;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Turns `runsc wait` results into exit notifications.
#[derive(Clone)]
pub struct ExitMonitor {
    exits: mpsc::UnboundedSender<Exit>,
}

impl ExitMonitor {
    /// Create the monitor and the exit channel the task service consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Exit>) {
        let (exits, rx) = mpsc::unbounded_channel();
        (Self { exits }, rx)
    }

    /// Wait for process `id` (pid `pid`) of `container_id` in the background.
    ///
    /// `exec_pid` selects one process of the container; `None` waits for the
    /// container's init.
    pub(crate) fn watch(
        &self,
        runtime: Arc<Runsc>,
        container_id: String,
        id: String,
        pid: u32,
        exec_pid: Option<u32>,
    ) {
        let exits = self.exits.clone();
        tokio::spawn(async move {
            let status = match runtime.wait(&container_id, exec_pid).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!(id = %id, pid, error = %e, "Failed to wait for process");
                    UNKNOWN_STATUS
                }
            };
            tracing::debug!(id = %id, pid, exit_status = status, "Process reaped");
            if exits.send(Exit { id, pid, status }).is_err() {
                tracing::debug!("Exit channel closed, dropping exit");
            }
        });
    }
}
