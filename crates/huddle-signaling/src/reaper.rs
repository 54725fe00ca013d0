//! Periodic sweep for connections that will never finish.
//!
//! Failed and closed records are always collected. Records still negotiating
//! are collected once they have been idle longer than `stale_after`.
//! Connected records are left alone; their transport reports when they drop.
//! Candidate queues with no record behind them expire on the same window.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

use crate::dispatcher::{Inner, SignalingManager};
use crate::ids::ConnectionId;
use crate::registry::{ConnectionRecord, Registry};

pub fn is_reapable(record: &ConnectionRecord, now: Instant, stale_after: Duration) -> bool {
    let state = record.state();
    if state.is_terminal() {
        return true;
    }
    state.is_negotiating() && now.saturating_duration_since(record.last_activity()) > stale_after
}

pub fn sweep(registry: &Registry, now: Instant, stale_after: Duration) -> Vec<ConnectionId> {
    let mut ids: Vec<ConnectionId> = registry
        .iter()
        .filter(|record| is_reapable(record, now, stale_after))
        .map(|record| record.id().clone())
        .collect();
    ids.sort();
    ids
}

pub(crate) fn spawn(inner: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let reaped = SignalingManager::from_inner(inner).reap_stale().await;
            if !reaped.is_empty() {
                trace!(count = reaped.len(), "reaper pass finished");
            }
        }
    })
}
