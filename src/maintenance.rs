//! Background maintenance: periodic sweeps over the gate's approval queue,
//! the cost guard's cache and batch collector, and dispatcher history.

use crate::{
    constants::MAINTENANCE_INTERVAL_SECS, cost_guard::CostGuard, dispatcher::Dispatcher,
    gate::DecisionGate,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One sweep across every component. Returns counts for observability.
pub async fn tick(
    gate: &DecisionGate,
    cost_guard: &CostGuard,
    dispatcher: &Dispatcher,
) -> (usize, usize, usize) {
    let expired = gate.cleanup_expired().await;
    if expired > 0 {
        info!("Maintenance: expired {expired} stale decisions");
    }

    let evicted = cost_guard.evict_expired().await;
    if evicted > 0 {
        info!("Maintenance: evicted {evicted} stale cache entries");
    }

    match cost_guard.flush_batch_queue().await {
        Ok(Some(outcome)) => {
            info!(
                "Maintenance: flushed batch of {} requests (saved ${:.4})",
                outcome.requests_processed, outcome.savings
            );
        }
        Ok(None) => {}
        Err(e) => warn!("Maintenance: batch flush failed: {e}"),
    }

    let swept = dispatcher.sweep_history().await;
    if swept > 0 {
        debug!("Maintenance: dropped {swept} old workflow records");
    }

    (expired, evicted, swept)
}

/// Periodic loop; runs until the process shuts down.
pub async fn run(
    gate: Arc<DecisionGate>,
    cost_guard: Arc<CostGuard>,
    dispatcher: Arc<Dispatcher>,
) {
    info!("Maintenance loop started (interval {MAINTENANCE_INTERVAL_SECS}s)");
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
    interval.tick().await; // first tick fires immediately; skip it

    loop {
        interval.tick().await;
        tick(&gate, &cost_guard, &dispatcher).await;
    }
}
