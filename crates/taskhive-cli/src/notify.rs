use std::sync::Arc;
use taskhive_channels::{Message, MessageRouter};
use taskhive_orchestrator::TaskEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sender name on forwarded task events.
pub const COORDINATOR_SENDER: &str = "coordinator";

/// Turn a task event into a notification, or `None` for events too chatty
/// to forward.
pub fn event_message(event: &TaskEvent, recipient: &str, verbose: bool) -> Option<Message> {
    let quiet = matches!(
        event,
        TaskEvent::Submitted { .. } | TaskEvent::Ready { .. } | TaskEvent::Started { .. }
    );
    if quiet && !verbose {
        return None;
    }
    let content = serde_json::to_string(event).ok()?;
    Some(
        Message::new(content, COORDINATOR_SENDER, recipient)
            .with_priority(event.priority())
            .with_metadata("task_id", event.task_id().to_string()),
    )
}

/// Forward coordinator events to the router until cancelled or the
/// coordinator is dropped.
///
/// On cancellation the events already buffered in the channel are still
/// forwarded, so cancelling right after the coordinator has shut down loses
/// nothing.
pub fn spawn_event_forwarder(
    mut events: broadcast::Receiver<TaskEvent>,
    router: Arc<MessageRouter>,
    recipient: String,
    verbose: bool,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event forwarder lagged, notifications dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            };
            forward(&event, &router, &recipient, verbose).await;
        }

        let mut drained = 0usize;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    forward(&event, &router, &recipient, verbose).await;
                    drained += 1;
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event forwarder lagged, notifications dropped");
                }
                Err(_) => break,
            }
        }
        debug!(drained, "Event forwarder stopped");
    })
}

async fn forward(event: &TaskEvent, router: &MessageRouter, recipient: &str, verbose: bool) {
    let Some(message) = event_message(event, recipient, verbose) else {
        return;
    };
    let outcome = router
        .send_message(message, router.config().send_timeout())
        .await;
    debug!(task_id = %event.task_id(), ?outcome, "Task event forwarded");
}
