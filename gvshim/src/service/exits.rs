//! Exit reconciliation loop.

use super::events::EventSender;
use super::registry::ProcessRegistry;
use crate::process::{Exit, TrackedProcess};
use gvshim_shared::events::TaskExit;
use gvshim_shared::TaskEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Reconcile exit notifications one at a time, in delivery order.
///
/// Returns once the exit channel is closed.
pub(crate) async fn process_exits(
    mut exits: mpsc::UnboundedReceiver<Exit>,
    registry: Arc<ProcessRegistry>,
    events: EventSender,
) {
    while let Some(exit) = exits.recv().await {
        // An exit racing its own Start is replayed once the start event is queued.
        let id = exit.id.clone();
        let Some(exit) = registry.hold_exit(exit) else {
            debug!(id = %id, "Exit held until start completes");
            continue;
        };
        check_processes(&registry, &events, exit).await;
    }
    debug!("Exit channel closed, reconciliation loop stopped");
}

/// Reconcile one exit: mark the process exited and emit its exit event.
pub(super) async fn check_processes(registry: &ProcessRegistry, events: &EventSender, exit: Exit) {
    let tracked = registry
        .snapshot()
        .into_iter()
        .find(|p| p.process().id() == exit.id);

    let Some(tracked) = tracked else {
        debug!(id = %exit.id, pid = exit.pid, "Exit for untracked process, ignoring");
        return;
    };

    if let TrackedProcess::Init(init) = &tracked {
        if let Err(e) = init.kill_all().await {
            error!(id = %exit.id, error = %e, "Failed to kill init's children");
        }
    }

    let process = tracked.process();
    process.set_exited(exit.status);
    let Some(record) = process.exit_record() else {
        error!(id = %exit.id, "Exit record missing after set_exited");
        return;
    };

    let pid = process.pid();
    info!(
        id = %exit.id,
        pid,
        exit_status = record.status,
        "Process exited"
    );

    events
        .send(TaskEvent::TaskExit(TaskExit {
            container_id: registry.container_id(),
            id: exit.id,
            pid,
            exit_status: record.status as u32,
            exited_at: record.exited_at,
        }))
        .await;
}
