//! Background tracker: keeps configured contracts subscribed and recording
//! for the process lifetime, independent of client activity.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::TrackedContract;
use crate::stream::registry::{StreamEvent, StreamLimits, StreamOwner, StreamRegistry};
use crate::types::TickType;
use crate::upstream::{SessionState, UpstreamSession};

/// Spawn one pinning task per (tracked contract, tick type).
pub fn spawn(
    registry: Arc<StreamRegistry>,
    session: Arc<UpstreamSession>,
    contracts: Vec<TrackedContract>,
    reconnect_delay: Duration,
    shutdown: watch::Receiver<bool>,
) {
    for contract in contracts {
        for &tt in &contract.tick_types {
            let registry = registry.clone();
            let session = session.clone();
            let shutdown = shutdown.clone();
            let symbol = contract.symbol.clone();
            let cid = contract.cid;
            tokio::spawn(async move {
                pin_stream(registry, session, cid, symbol, tt, reconnect_delay, shutdown).await;
            });
        }
    }
}

/// Keep one (cid, tt) subscription alive: create it once the session is
/// connected, drain its events, and re-create it after errors.
async fn pin_stream(
    registry: Arc<StreamRegistry>,
    session: Arc<UpstreamSession>,
    cid: u32,
    symbol: String,
    tt: TickType,
    reconnect_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        if !wait_connected(&session, &mut shutdown).await {
            return;
        }

        let handle = match registry.create(cid, tt, StreamOwner::Tracker, StreamLimits::default()) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(cid, symbol = %symbol, tt = %tt, error = %e, "tracked subscription failed; retrying");
                if sleep_or_shutdown(reconnect_delay, &mut shutdown).await {
                    return;
                }
                continue;
            }
        };

        info!(cid, symbol = %symbol, tt = %tt, stream_id = %handle.stream_id, "tracked contract streaming");

        let stream_id = handle.stream_id.to_string();
        let mut rx = handle.rx;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    // Ticks are captured by the storage sinks; the tracker
                    // only watches for terminal transitions.
                    Some(StreamEvent::Error(e)) => {
                        warn!(cid, tt = %tt, error = %e, "tracked stream errored");
                        break;
                    }
                    Some(StreamEvent::Complete(data)) => {
                        info!(cid, tt = %tt, reason = data.reason.as_str(), "tracked stream completed");
                        break;
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = shutdown.changed() => {
                    registry.cancel(&stream_id, false);
                    return;
                }
            }
        }
        registry.finish(&stream_id);

        if sleep_or_shutdown(reconnect_delay, &mut shutdown).await {
            return;
        }
    }
}

/// Wait until the session reports connected. Returns false on shutdown or
/// terminal session failure.
async fn wait_connected(session: &UpstreamSession, shutdown: &mut watch::Receiver<bool>) -> bool {
    let mut state = session.watch_state();
    loop {
        match *state.borrow() {
            SessionState::Connected => return true,
            SessionState::Failed => return false,
            _ => {}
        }
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = shutdown.changed() => return false,
        }
    }
}

/// Sleep for `delay`; true means shutdown fired first.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
