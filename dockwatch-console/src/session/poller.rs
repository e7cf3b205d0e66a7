//! Stats polling task
//!
//! Issues one snapshot request immediately, then on a fixed cadence
//! until the task is cancelled. Requests run on their own tasks so a
//! slow tick never blocks the next one; every request carries the tick
//! sequence number the controller uses to discard stale results. The
//! nudge channel triggers an immediate out-of-band tick and resets the
//! interval, so a forced refresh also satisfies the next scheduled tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

use super::SessionEvent;
use crate::api::ApiClient;

#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    api: ApiClient,
    node: String,
    container_id: String,
    generation: u64,
    issued: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut nudge: mpsc::UnboundedReceiver<()>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    issue_tick(&api, &node, &container_id, generation, &issued, &events);
                }
                Some(()) = nudge.recv() => {
                    timer.reset();
                    issue_tick(&api, &node, &container_id, generation, &issued, &events);
                }
            }
        }
    })
}

fn issue_tick(
    api: &ApiClient,
    node: &str,
    container_id: &str,
    generation: u64,
    issued: &Arc<AtomicU64>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    let tick = issued.fetch_add(1, Ordering::SeqCst) + 1;
    trace!(tick, "issuing stats poll");

    let api = api.clone();
    let node = node.to_string();
    let container_id = container_id.to_string();
    let events = events.clone();
    tokio::spawn(async move {
        let result = api.container_stats(&node, &container_id).await;
        let _ = events.send(SessionEvent::Stats {
            generation,
            tick,
            result,
        });
    });
}
