use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use termaway_protocol::ServerFrame;

use crate::server::ServerState;

/// Periodic liveness sweep over all connections.
///
/// Each tick: a connection that has not answered the previous probe is
/// terminated immediately (no graceful close); everyone else gets its
/// liveness flag cleared and a fresh `ping`. This detects half-open peers
/// even when the transport does not.
pub async fn run_heartbeat(state: Arc<ServerState>, shutdown: CancellationToken) {
    let period = Duration::from_secs(state.config.heartbeat_interval_secs);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it so connections get
    // a full period before the first probe.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => sweep(&state).await,
            _ = shutdown.cancelled() => {
                debug!(event = "daemon.heartbeat.stopped");
                break;
            }
        }
    }
}

async fn sweep(state: &Arc<ServerState>) {
    let mut registry = state.registry.write().await;
    for id in registry.client_ids() {
        let Some(handle) = registry.get_mut(id) else {
            continue;
        };
        if !handle.alive {
            warn!(event = "daemon.heartbeat.peer_dead", client_id = id);
            handle.cancel.cancel();
        } else {
            handle.alive = false;
            let _ = handle.tx.send(ServerFrame::Ping);
        }
    }
}
