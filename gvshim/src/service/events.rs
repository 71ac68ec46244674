//! Outbound event queue and the forwarding loop.

use crate::publisher::Publisher;
use gvshim_shared::constants::events::QUEUE_CAPACITY;
use gvshim_shared::TaskEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

/// Producer side of the outbound event queue.
///
/// The queue is bounded. A full queue blocks the producer until the
/// forwarding loop drains it.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<TaskEvent>,
}

impl EventSender {
    /// Create the queue. The receiver goes to [`forward`].
    pub fn channel() -> (Self, mpsc::Receiver<TaskEvent>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn send(&self, event: TaskEvent) {
        let event = match self.tx.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Closed(event)) => {
                error!(topic = event.topic(), "Event queue closed, dropping event");
                return;
            }
            Err(TrySendError::Full(event)) => {
                warn!(
                    topic = event.topic(),
                    capacity = QUEUE_CAPACITY,
                    "Event queue full, waiting for publisher"
                );
                event
            }
        };
        if let Err(e) = self.tx.send(event).await {
            error!(topic = e.0.topic(), "Event queue closed, dropping event");
        }
    }
}

/// Drain `events` in order and hand each one to `publisher`.
///
/// Returns once every [`EventSender`] is gone.
pub(crate) async fn forward(mut events: mpsc::Receiver<TaskEvent>, publisher: Arc<dyn Publisher>) {
    while let Some(event) = events.recv().await {
        let topic = event.topic();
        if matches!(event, TaskEvent::Unknown) {
            warn!(topic, "Publishing event of unknown kind");
        }
        match publisher.publish(topic, &event).await {
            Ok(()) => debug!(topic, container_id = ?event.container_id(), "Event published"),
            Err(e) => error!(topic, error = %e, "Failed to publish event"),
        }
    }
    debug!("Event queue closed, forwarding loop stopped");
}
