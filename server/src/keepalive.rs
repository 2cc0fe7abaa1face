//! Periodic liveness check for logged-in sessions.
//!
//! Every interval the scheduler posts a [`ServerEvent::Keepalive`] to the
//! arrival queue. The dispatch loop answers it with [`sweep`]: sessions that
//! never answered the previous ping are closed, everyone else gets a new
//! ping. A session therefore has one full interval to reply.

use log::{debug, info, warn};
use shared::Message;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use crate::network::ServerEvent;
use crate::scheduler::Scheduler;
use crate::state::ServerState;

pub const TIMEOUT_REASON: &str = "Connection timed out.";

/// Arranges for a keepalive event to reach the dispatch loop after
/// `interval`. If the arrival queue is full at that moment the attempt is
/// pushed back by another interval.
pub fn schedule_keepalive(scheduler: &Scheduler, events: mpsc::Sender<ServerEvent>, interval: Duration) {
    let retry = scheduler.clone();
    let result = scheduler.schedule_in(interval, move || match events.try_send(ServerEvent::Keepalive) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!("Arrival queue full, delaying keepalive");
            schedule_keepalive(&retry, events, interval);
        }
        Err(TrySendError::Closed(_)) => debug!("Arrival queue closed, keepalive stopped"),
    });

    if let Err(e) = result {
        debug!("Keepalive not scheduled: {}", e);
    }
}

/// Pings every open, logged-in session and queues a close for those that
/// left the last ping unanswered.
pub fn sweep(state: &mut ServerState, now: Instant) {
    let mut timed_out = Vec::new();
    let mut pinged = Vec::new();

    for session in state.sessions.iter_mut() {
        if !session.is_open() || !session.is_logged_in() {
            continue;
        }
        if session.ping_overdue() {
            timed_out.push(session.id());
        } else {
            session.last_ping_sent = Some(now);
            pinged.push(session.id());
        }
    }

    for id in timed_out {
        info!("{} missed its keepalive", state.describe(Some(id)));
        state.request_close(id, TIMEOUT_REASON);
    }
    for id in pinged {
        state.send_to(id, Message::Ping { from_client: false });
    }
}
