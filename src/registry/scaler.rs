//! Elastic pool sizing driven by queue pressure.
//!
//! The scaler observes queue depth and resizes the pool strictly through the
//! registry's public API; it never mutates agent state directly.

use super::{AgentRegistry, AgentState};
use crate::models::{Capability, CapabilitySet};
use crate::constants::TASKS_PER_SPAWNED_AGENT;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Outcome of a single scaling pass.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ScaleOutcome {
    pub spawned: usize,
    pub terminated: usize,
    pub live_agents: usize,
}

pub struct AutoScaler {
    registry: Arc<AgentRegistry>,
    scale_up_threshold: usize,
    scale_down_threshold: usize,
}

impl AutoScaler {
    pub fn new(
        registry: Arc<AgentRegistry>,
        scale_up_threshold: usize,
        scale_down_threshold: usize,
    ) -> Self {
        Self {
            registry,
            scale_up_threshold,
            scale_down_threshold,
        }
    }

    /// React to the observed queue depth.
    ///
    /// Scale-up: one generic agent per ten queued tasks, capped at the
    /// registry's headroom. Scale-down: terminate surplus Idle agents with
    /// empty task lists, worst performance score first. After any pass the
    /// live count stays within [min_agents, max_agents].
    pub async fn scale(&self, queue_depth: usize) -> ScaleOutcome {
        self.registry.set_queue_depth(queue_depth).await;

        let mut outcome = ScaleOutcome::default();
        let live = self.registry.live_count().await;

        if queue_depth > self.scale_up_threshold {
            let headroom = self.registry.max_agents().saturating_sub(live);
            let wanted = queue_depth / TASKS_PER_SPAWNED_AGENT;
            let to_spawn = wanted.min(headroom);

            if to_spawn > 0 {
                info!("Scaling up: spawning {to_spawn} agents (queue depth {queue_depth})");
            }
            for _ in 0..to_spawn {
                let spawned = self
                    .registry
                    .spawn(
                        "generic",
                        CapabilitySet::of([
                            Capability::DataIngestion,
                            Capability::ContentGeneration,
                        ]),
                        1,
                    )
                    .await;
                if spawned.is_ok() {
                    outcome.spawned += 1;
                }
            }
        } else if queue_depth < self.scale_down_threshold && live > self.registry.min_agents() {
            // Only Idle agents with no bound tasks are candidates; Busy
            // agents are never considered.
            let mut idle: Vec<_> = self
                .registry
                .list()
                .await
                .into_iter()
                .filter(|a| a.status == AgentState::Idle && a.current_tasks.is_empty())
                .collect();

            idle.sort_by(|a, b| {
                a.performance_score
                    .partial_cmp(&b.performance_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let surplus = live - self.registry.min_agents();
            let to_terminate = idle.len().min(surplus);

            if to_terminate > 0 {
                info!("Scaling down: terminating {to_terminate} agents (queue depth {queue_depth})");
            }
            for agent in idle.into_iter().take(to_terminate) {
                if self.registry.terminate(&agent.id).await.is_ok() {
                    outcome.terminated += 1;
                }
            }
        }

        outcome.live_agents = self.registry.live_count().await;
        outcome
    }
}
