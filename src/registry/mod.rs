//! Agent registry: lifecycle, capability matching, performance tracking.
//!
//! The registry exclusively owns all [`Agent`] state. Callers receive
//! snapshots (clones); every mutation goes through the registry API under a
//! single registry-wide lock. Cross-component references to agents are by
//! opaque id only.

pub mod scaler;

use crate::{
    config::RegistryConfig,
    models::{Capability, CapabilitySet},
    FabricError, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Idle,
    Busy,
    Terminating,
    Terminated,
}

/// A single worker agent
///
/// Invariants: `current_tasks.len() <= max_concurrent_tasks`; Idle implies
/// `current_tasks` is empty; Terminated agents are removed from the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub agent_type: String,
    pub capabilities: CapabilitySet,
    pub status: AgentState,
    pub max_concurrent_tasks: usize,
    pub current_tasks: Vec<String>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_processing_time: f64,
    /// Smoothed success rate in [0, 1]; the dispatcher's sole ranking input.
    pub performance_score: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_active: chrono::DateTime<chrono::Utc>,
}

impl Agent {
    fn new(agent_type: String, capabilities: CapabilitySet, max_concurrent_tasks: usize) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            agent_type,
            capabilities,
            status: AgentState::Initializing,
            max_concurrent_tasks,
            current_tasks: Vec::new(),
            tasks_completed: 0,
            tasks_failed: 0,
            total_processing_time: 0.0,
            performance_score: 1.0,
            created_at: now,
            last_active: now,
        }
    }

    pub fn can_accept_task(&self) -> bool {
        self.status == AgentState::Idle && self.current_tasks.len() < self.max_concurrent_tasks
    }

    fn record_completion(&mut self, task_id: &str, success: bool, processing_time: f64) {
        self.current_tasks.retain(|t| t != task_id);

        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.total_processing_time += processing_time;
        self.last_active = chrono::Utc::now();

        let total = self.tasks_completed + self.tasks_failed;
        if total > 0 {
            let success_rate = self.tasks_completed as f64 / total as f64;
            self.performance_score = self.performance_score * 0.7 + success_rate * 0.3;
        }

        if self.current_tasks.is_empty() {
            self.status = AgentState::Idle;
        }
    }
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
    pub min_agents: usize,
    pub max_agents: usize,
    pub total_tasks_processed: u64,
    pub successful_tasks: u64,
    pub success_rate: f64,
    pub avg_performance_score: f64,
    pub queue_depth: usize,
}

/// Per-capability agent counts, reported by `/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityStats {
    pub total_agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
}

struct RegistryInner {
    agents: HashMap<String, Agent>,
    queue_depth: usize,
}

/// Central registry for the worker agent pool
///
/// Enforces `min_agents <= live <= max_agents` at construction and on every
/// spawn; termination races may transiently undershoot, which the scaler
/// corrects on its next pass.
pub struct AgentRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    config: RegistryConfig,
}

/// Seed distribution for the initial pool: one (type, capability) pairing
/// per slot, filled round-robin until min_agents is reached.
const SEED_DISTRIBUTION: [(&str, Capability); 4] = [
    ("learning", Capability::DataIngestion),
    ("tech_scout", Capability::TechScouting),
    ("cost_optimizer", Capability::CostOptimization),
    ("experimenter", Capability::Experimentation),
];

impl AgentRegistry {
    pub async fn new(config: RegistryConfig) -> Self {
        let registry = Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                agents: HashMap::new(),
                queue_depth: 0,
            })),
            config,
        };

        for i in 0..registry.config.min_agents {
            let (agent_type, capability) = SEED_DISTRIBUTION[i % SEED_DISTRIBUTION.len()];
            if let Err(e) = registry
                .spawn(agent_type, CapabilitySet::of([capability]), 1)
                .await
            {
                warn!("Failed to seed agent {agent_type}: {e}");
            }
        }

        let count = registry.live_count().await;
        info!("Initialized registry with {count} agents");
        registry
    }

    /// Spawn a new agent. Fails with CapacityExhausted at max_agents.
    pub async fn spawn(
        &self,
        agent_type: &str,
        capabilities: CapabilitySet,
        max_concurrent_tasks: usize,
    ) -> Result<Agent> {
        let mut inner = self.inner.write().await;

        if inner.agents.len() >= self.config.max_agents {
            return Err(FabricError::CapacityExhausted {
                message: format!("registry at max capacity ({})", self.config.max_agents),
            });
        }

        let mut agent = Agent::new(
            agent_type.to_string(),
            capabilities,
            max_concurrent_tasks.max(1),
        );
        agent.status = AgentState::Idle;
        let snapshot = agent.clone();

        info!("Spawned {} agent: {}", agent.agent_type, agent.id);
        inner.agents.insert(agent.id.clone(), agent);
        Ok(snapshot)
    }

    /// Terminate an agent. Fails with Busy if it still owns tasks.
    pub async fn terminate(&self, agent_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;

        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| FabricError::NotFound(format!("agent {agent_id}")))?;

        if !agent.current_tasks.is_empty() {
            warn!("Cannot terminate busy agent: {agent_id}");
            return Err(FabricError::Busy {
                agent_id: agent_id.to_string(),
            });
        }

        agent.status = AgentState::Terminated;
        inner.agents.remove(agent_id);

        info!("Terminated agent: {agent_id}");
        Ok(())
    }

    /// Best available agent for a capability: highest performance score,
    /// ties broken by lowest current load then lexicographic id.
    pub async fn find_available(&self, capability: Capability) -> Option<Agent> {
        let inner = self.inner.read().await;
        inner
            .agents
            .values()
            .filter(|a| a.capabilities.contains(capability) && a.can_accept_task())
            .min_by(|a, b| {
                b.performance_score
                    .partial_cmp(&a.performance_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.current_tasks.len().cmp(&b.current_tasks.len()))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }

    /// Bind a task to an agent: appends to its task list, marks it Busy.
    pub async fn assign(&self, task_id: &str, agent_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;

        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| FabricError::NotFound(format!("agent {agent_id}")))?;

        if agent.current_tasks.len() >= agent.max_concurrent_tasks {
            return Err(FabricError::Busy {
                agent_id: agent_id.to_string(),
            });
        }

        agent.current_tasks.push(task_id.to_string());
        agent.status = AgentState::Busy;
        agent.last_active = chrono::Utc::now();
        Ok(())
    }

    /// Find-or-spawn assignment used by the dispatcher: tries the best
    /// available agent, spawns a typed agent for the capability if none, and
    /// returns None when the registry is at capacity (caller queues the task).
    pub async fn assign_to_capability(
        &self,
        task_id: &str,
        capability: Capability,
    ) -> Result<Option<String>> {
        let candidate = match self.find_available(capability).await {
            Some(agent) => Some(agent),
            None => self.try_spawn_for_capability(capability).await?,
        };

        match candidate {
            Some(agent) => {
                self.assign(task_id, &agent.id).await?;
                info!("Assigned task {task_id} to agent {}", agent.id);
                Ok(Some(agent.id))
            }
            None => {
                warn!("No agent available for task {task_id}");
                Ok(None)
            }
        }
    }

    async fn try_spawn_for_capability(&self, capability: Capability) -> Result<Option<Agent>> {
        {
            let inner = self.inner.read().await;
            if inner.agents.len() >= self.config.max_agents {
                return Ok(None);
            }
        }
        let agent_type = capability.default_agent_type();
        match self.spawn(agent_type, CapabilitySet::of([capability]), 1).await {
            Ok(agent) => Ok(Some(agent)),
            Err(FabricError::CapacityExhausted { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Record task completion: updates counters, recomputes the smoothed
    /// performance score, returns the agent to Idle when drained.
    pub async fn complete(
        &self,
        agent_id: &str,
        task_id: &str,
        success: bool,
        processing_time: f64,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;

        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| FabricError::NotFound(format!("agent {agent_id}")))?;

        agent.record_completion(task_id, success, processing_time);
        info!("Task {task_id} completed by {agent_id} (success={success})");
        Ok(())
    }

    /// Snapshot of all agents holding a capability. Callers must tolerate
    /// the set changing underneath them.
    pub async fn agents_by_capability(&self, capability: Capability) -> Vec<Agent> {
        let inner = self.inner.read().await;
        inner
            .agents
            .values()
            .filter(|a| a.capabilities.contains(capability))
            .cloned()
            .collect()
    }

    pub async fn list(&self) -> Vec<Agent> {
        let inner = self.inner.read().await;
        let mut agents: Vec<Agent> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        let inner = self.inner.read().await;
        inner.agents.get(agent_id).cloned()
    }

    pub async fn live_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.agents.len()
    }

    pub async fn set_queue_depth(&self, depth: usize) {
        let mut inner = self.inner.write().await;
        inner.queue_depth = depth;
    }

    pub fn min_agents(&self) -> usize {
        self.config.min_agents
    }

    pub fn max_agents(&self) -> usize {
        self.config.max_agents
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        let agents: Vec<&Agent> = inner.agents.values().collect();

        let idle = agents
            .iter()
            .filter(|a| a.status == AgentState::Idle)
            .count();
        let busy = agents
            .iter()
            .filter(|a| a.status == AgentState::Busy)
            .count();
        let total_tasks: u64 = agents
            .iter()
            .map(|a| a.tasks_completed + a.tasks_failed)
            .sum();
        let successful: u64 = agents.iter().map(|a| a.tasks_completed).sum();
        let avg_score = if agents.is_empty() {
            0.0
        } else {
            agents.iter().map(|a| a.performance_score).sum::<f64>() / agents.len() as f64
        };

        RegistryStats {
            total_agents: agents.len(),
            idle_agents: idle,
            busy_agents: busy,
            min_agents: self.config.min_agents,
            max_agents: self.config.max_agents,
            total_tasks_processed: total_tasks,
            successful_tasks: successful,
            success_rate: if total_tasks > 0 {
                successful as f64 / total_tasks as f64
            } else {
                0.0
            },
            avg_performance_score: avg_score,
            queue_depth: inner.queue_depth,
        }
    }

    /// Per-capability breakdown for the detailed stats endpoint.
    pub async fn capability_breakdown(&self) -> HashMap<String, CapabilityStats> {
        let inner = self.inner.read().await;
        let mut breakdown = HashMap::new();
        for cap in Capability::ALL {
            let holders: Vec<&Agent> = inner
                .agents
                .values()
                .filter(|a| a.capabilities.contains(cap))
                .collect();
            breakdown.insert(
                cap.as_str().to_string(),
                CapabilityStats {
                    total_agents: holders.len(),
                    idle_agents: holders
                        .iter()
                        .filter(|a| a.status == AgentState::Idle)
                        .count(),
                    busy_agents: holders
                        .iter()
                        .filter(|a| a.status == AgentState::Busy)
                        .count(),
                },
            );
        }
        breakdown
    }
}
