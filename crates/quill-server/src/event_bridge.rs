use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quill_core::events::AgentEvent;
use quill_core::ids::RequestId;

use crate::hub::Hub;
use crate::status::{StatusUpdate, WORKER_STATUS_CHANNEL};

/// Forward worker status changes to the hub's `worker-status` channel until
/// the broadcast closes or `shutdown` fires.
pub fn relay_worker_status(
    hub: Arc<Hub>,
    mut rx: broadcast::Receiver<StatusUpdate>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => received,
            };
            match received {
                Ok(update) => {
                    hub.publish(WORKER_STATUS_CHANNEL, &update.to_message());
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "worker status relay lagged, dropped updates");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("worker status channel closed");
                    break;
                }
            }
        }
    })
}

/// Drain one run's events into the hub, tagged with `request_id`.
///
/// Delivery waits for the first subscriber so a client that subscribes right
/// after receiving the request id does not miss the opening events. The run
/// is never blocked for long: past the wait the events are drained anyway.
pub fn relay_run(
    hub: Arc<Hub>,
    request_id: RequestId,
    mut events: mpsc::Receiver<AgentEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let wait = hub.config().subscribe_wait;
        if !hub.wait_for_subscriber(request_id.as_str(), wait).await {
            debug!(request_id = %request_id, "no subscriber for run events");
        }
        while let Some(event) = events.recv().await {
            let terminal = event.is_terminal();
            hub.stream_to_request(&request_id, &event);
            if terminal {
                break;
            }
        }
    })
}
