//! Dispatcher: drives an approved task DAG to completion.
//!
//! The dispatcher is the single owner of each workflow's state machine.
//! Tasks run as soon as their dependencies complete, in parallel where the
//! DAG allows; a dependency edge u -> v guarantees Completed(u) happens
//! before Assigned(v). Worker failures feed the retry policy; deadline
//! overruns are terminal for the affected task.

use crate::{
    constants::{RETRY_BACKOFF_BASE_SECS, WORKFLOW_RETENTION_HOURS},
    cost_guard::{CostGuard, InferenceOutcome, InferenceRequest},
    models::{BackoffKind, RetryPolicy, Task, TaskState, WorkerOutput},
    registry::AgentRegistry,
    FabricError, Result,
};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

/// What a worker hands back for one task.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub payload: serde_json::Value,
    pub confidence: f64,
}

/// The worker contract. Domain-specific workers plug in here; the fabric
/// ships a deterministic in-process worker.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, task: &Task) -> anyhow::Result<WorkerResult>;
}

/// Deterministic in-process worker.
///
/// Honors two task parameters used for drills and tests: `fail` (bool)
/// makes the attempt fail, `delay_ms` (u64) stalls the attempt.
pub struct LocalWorker;

#[async_trait]
impl Worker for LocalWorker {
    async fn execute(&self, task: &Task) -> anyhow::Result<WorkerResult> {
        if let Some(delay) = task.parameters.get("delay_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if task
            .parameters
            .get("fail")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            anyhow::bail!("worker failure requested for task {}", task.id);
        }
        Ok(WorkerResult {
            payload: serde_json::json!({
                "task_id": task.id,
                "task_type": task.task_type,
                "summary": format!("completed {}", task.task_type),
            }),
            confidence: 0.8,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    CompletedWithFailures,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub task_type: String,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub deadline_exceeded: bool,
    pub tasks: Vec<TaskReport>,
    /// Worker outputs in task-id (emission) order, not completion order.
    pub outputs: Vec<WorkerOutput>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

/// Internal bookkeeping for one task while its workflow runs.
struct TaskSlot {
    task: Task,
    state: TaskState,
    agent_id: Option<String>,
    attempts: u32,
    error: Option<String>,
    output: Option<WorkerOutput>,
}

enum AttemptOutcome {
    Success(WorkerResult, u32),
    Failed(String, u32),
    TimedOut(u32),
}

pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    cost_guard: Arc<CostGuard>,
    worker: Arc<dyn Worker>,
    /// Completed workflow records, kept for status queries until swept.
    history: Mutex<Vec<WorkflowReport>>,
    /// Tasks that found no agent and no spawn headroom.
    overflow: Mutex<Vec<Task>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        cost_guard: Arc<CostGuard>,
        worker: Arc<dyn Worker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cost_guard,
            worker,
            history: Mutex::new(Vec::new()),
            overflow: Mutex::new(Vec::new()),
        })
    }

    fn is_inference_class(task_type: &str) -> bool {
        matches!(task_type, "llm_inference" | "inference")
    }

    fn validate_dag(tasks: &[Task]) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for task in tasks {
            if !seen.insert(&task.id) {
                return Err(FabricError::InvalidInput(format!(
                    "duplicate task id {}",
                    task.id
                )));
            }
            for dep in &task.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(FabricError::InvalidInput(format!(
                        "task {} depends on {dep}, which is not an earlier task",
                        task.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let base = RETRY_BACKOFF_BASE_SECS;
        let secs = match policy.backoff {
            BackoffKind::Exponential => base * 1.5f64.powi(attempt.saturating_sub(1) as i32),
            BackoffKind::Linear => base * attempt as f64,
        };
        let jitter_ms = rand::thread_rng().gen_range(0..100);
        Duration::from_secs_f64(secs) + Duration::from_millis(jitter_ms)
    }

    /// Run a task DAG to completion. `deadline_secs` bounds the whole
    /// workflow; when it passes, no new assignments are issued, in-flight
    /// work is abandoned, and the report carries `deadline_exceeded=true`
    /// with the partial results.
    pub async fn run_workflow(
        &self,
        tasks: Vec<Task>,
        deadline_secs: Option<u64>,
    ) -> Result<WorkflowReport> {
        Self::validate_dag(&tasks)?;

        let workflow_id = Uuid::new_v4().to_string();
        let workflow_deadline =
            deadline_secs.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
        info!("Workflow {workflow_id} started with {} tasks", tasks.len());

        let order: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let mut slots: HashMap<String, TaskSlot> = tasks
            .into_iter()
            .map(|task| {
                (
                    task.id.clone(),
                    TaskSlot {
                        state: TaskState::Pending,
                        agent_id: None,
                        attempts: 0,
                        error: None,
                        output: None,
                        task,
                    },
                )
            })
            .collect();

        let mut join_set: JoinSet<(String, AttemptOutcome)> = JoinSet::new();
        let mut deadline_exceeded = false;

        loop {
            if let Some(deadline) = workflow_deadline {
                if tokio::time::Instant::now() >= deadline {
                    deadline_exceeded = true;
                    break;
                }
            }

            // Launch every task whose dependencies have settled.
            let ready: Vec<String> = order
                .iter()
                .filter(|id| {
                    let slot = &slots[*id];
                    slot.state == TaskState::Pending
                        && slot.task.dependencies.iter().all(|dep| {
                            matches!(
                                slots[dep].state,
                                TaskState::Completed
                                    | TaskState::Failed
                                    | TaskState::TimedOut
                                    | TaskState::Cancelled
                                    | TaskState::Queued
                            )
                        })
                })
                .cloned()
                .collect();
            let made_progress = !ready.is_empty();

            for task_id in ready {
                let blocked_on: Vec<String> = {
                    let slot = &slots[&task_id];
                    slot.task
                        .dependencies
                        .iter()
                        .filter(|dep| slots[*dep].state != TaskState::Completed)
                        .cloned()
                        .collect()
                };
                if !blocked_on.is_empty() {
                    // Best-effort policy: prerequisites that did not complete
                    // make this task unrunnable; skip and annotate.
                    let failed_dep = blocked_on.iter().any(|dep| {
                        matches!(
                            slots[dep].state,
                            TaskState::Failed | TaskState::TimedOut | TaskState::Cancelled
                        )
                    });
                    let slot = slots.get_mut(&task_id).unwrap();
                    slot.state = TaskState::Cancelled;
                    slot.error = Some(format!(
                        "{}: {}",
                        if failed_dep {
                            "dependency failed"
                        } else {
                            "dependency still queued"
                        },
                        blocked_on.join(", ")
                    ));
                    warn!("Skipping task {task_id}: {}", slot.error.as_deref().unwrap());
                    continue;
                }

                // Inference-class tasks pass through the cost guard, which
                // may defer them to the batch collector.
                let deferred = {
                    let slot = &slots[&task_id];
                    if Self::is_inference_class(&slot.task.task_type) {
                        let prompt = slot
                            .task
                            .parameters
                            .get("prompt")
                            .and_then(|v| v.as_str())
                            .unwrap_or(&slot.task.task_type)
                            .to_string();
                        let outcome = self
                            .cost_guard
                            .infer(InferenceRequest {
                                prompt,
                                model: "auto".to_string(),
                                max_cost: f64::MAX,
                                priority: slot.task.priority,
                            })
                            .await?;
                        match outcome {
                            InferenceOutcome::QueuedForBatch { .. } => true,
                            InferenceOutcome::Served { .. } => false,
                        }
                    } else {
                        false
                    }
                };
                if deferred {
                    let slot = slots.get_mut(&task_id).unwrap();
                    slot.state = TaskState::Queued;
                    info!("Task {task_id} deferred to batch processing");
                    continue;
                }

                let capability = slots[&task_id].task.required_capability;
                match self.registry.assign_to_capability(&task_id, capability).await? {
                    Some(agent_id) => {
                        let slot = slots.get_mut(&task_id).unwrap();
                        slot.state = TaskState::Assigned;
                        slot.agent_id = Some(agent_id.clone());

                        let task = slot.task.clone();
                        let worker = self.worker.clone();
                        slot.state = TaskState::Running;
                        join_set.spawn(Self::attempt_loop(
                            worker,
                            task,
                            workflow_deadline,
                        ));
                    }
                    None => {
                        let slot = slots.get_mut(&task_id).unwrap();
                        slot.state = TaskState::Queued;
                        self.overflow.lock().await.push(slot.task.clone());
                        warn!("Task {task_id} placed on overflow queue");
                    }
                }
            }

            // Skipped or deferred tasks may have unblocked dependents; take
            // another pass before deciding the workflow has settled.
            if join_set.is_empty() {
                if made_progress {
                    continue;
                }
                break;
            }

            let joined = if let Some(deadline) = workflow_deadline {
                match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        deadline_exceeded = true;
                        break;
                    }
                }
            } else {
                join_set.join_next().await
            };

            match joined {
                Some(Ok((task_id, outcome))) => {
                    self.settle(&mut slots, &task_id, outcome).await;
                }
                Some(Err(e)) => {
                    warn!("Worker task panicked: {e}");
                }
                None => break,
            }
        }

        if deadline_exceeded {
            // Stop issuing work and abandon whatever is still in flight.
            join_set.abort_all();
            for (task_id, slot) in slots.iter_mut() {
                if matches!(slot.state, TaskState::Running | TaskState::Assigned) {
                    slot.state = TaskState::TimedOut;
                    slot.error = Some("workflow deadline exceeded".to_string());
                    if let Some(agent_id) = &slot.agent_id {
                        let _ = self
                            .registry
                            .complete(agent_id, task_id, false, 0.0)
                            .await;
                    }
                }
            }
        }

        let any_failure = slots.values().any(|s| {
            matches!(
                s.state,
                TaskState::Failed | TaskState::TimedOut | TaskState::Cancelled
            )
        });

        let report = WorkflowReport {
            workflow_id: workflow_id.clone(),
            status: if any_failure {
                WorkflowStatus::CompletedWithFailures
            } else {
                WorkflowStatus::Completed
            },
            deadline_exceeded,
            tasks: order
                .iter()
                .map(|id| {
                    let slot = &slots[id];
                    TaskReport {
                        task_id: id.clone(),
                        task_type: slot.task.task_type.clone(),
                        state: slot.state,
                        agent_id: slot.agent_id.clone(),
                        attempts: slot.attempts,
                        error: slot.error.clone(),
                    }
                })
                .collect(),
            outputs: order
                .iter()
                .filter_map(|id| slots[id].output.clone())
                .collect(),
            finished_at: chrono::Utc::now(),
        };

        info!(
            "Workflow {workflow_id} finished: {:?} (deadline_exceeded={deadline_exceeded})",
            report.status
        );
        self.history.lock().await.push(report.clone());
        Ok(report)
    }

    /// Run one task through its retry budget. Per-attempt timeouts are
    /// clipped to the workflow deadline; a timed-out attempt is terminal.
    async fn attempt_loop(
        worker: Arc<dyn Worker>,
        task: Task,
        workflow_deadline: Option<tokio::time::Instant>,
    ) -> (String, AttemptOutcome) {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut timeout = Duration::from_secs(task.retry.attempt_timeout_secs);
            if let Some(deadline) = workflow_deadline {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return (task.id.clone(), AttemptOutcome::TimedOut(attempt));
                }
                timeout = timeout.min(remaining);
            }

            match tokio::time::timeout(timeout, worker.execute(&task)).await {
                Ok(Ok(result)) => {
                    return (task.id.clone(), AttemptOutcome::Success(result, attempt))
                }
                Ok(Err(e)) => {
                    if attempt >= task.retry.max_attempts {
                        return (task.id.clone(), AttemptOutcome::Failed(e.to_string(), attempt));
                    }
                    let delay = Self::backoff_delay(&task.retry, attempt);
                    warn!(
                        "Task {} attempt {attempt} failed ({e}); retrying in {:.1}s",
                        task.id,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                // Deadline overruns are never retried.
                Err(_) => return (task.id.clone(), AttemptOutcome::TimedOut(attempt)),
            }
        }
    }

    async fn settle(
        &self,
        slots: &mut HashMap<String, TaskSlot>,
        task_id: &str,
        outcome: AttemptOutcome,
    ) {
        let slot = match slots.get_mut(task_id) {
            Some(slot) => slot,
            None => return,
        };
        let started = slot.task.updated_at;
        let elapsed = (chrono::Utc::now() - started)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();

        match outcome {
            AttemptOutcome::Success(result, attempts) => {
                slot.state = TaskState::Completed;
                slot.attempts = attempts;
                slot.output = Some(WorkerOutput {
                    agent_id: slot.agent_id.clone().unwrap_or_default(),
                    agent_type: slot.task.task_type.clone(),
                    payload: result.payload,
                    confidence: result.confidence,
                    processing_time: elapsed,
                    success: true,
                });
                if let Some(agent_id) = &slot.agent_id {
                    let _ = self.registry.complete(agent_id, task_id, true, elapsed).await;
                }
            }
            AttemptOutcome::Failed(error, attempts) => {
                slot.state = TaskState::Failed;
                slot.attempts = attempts;
                slot.error = Some(error);
                if let Some(agent_id) = &slot.agent_id {
                    let _ = self.registry.complete(agent_id, task_id, false, elapsed).await;
                }
            }
            AttemptOutcome::TimedOut(attempts) => {
                slot.state = TaskState::TimedOut;
                slot.attempts = attempts;
                slot.error = Some("task deadline exceeded".to_string());
                if let Some(agent_id) = &slot.agent_id {
                    let _ = self.registry.complete(agent_id, task_id, false, elapsed).await;
                }
            }
        }
    }

    pub async fn overflow_depth(&self) -> usize {
        self.overflow.lock().await.len()
    }

    pub async fn recent_workflows(&self) -> Vec<WorkflowReport> {
        self.history.lock().await.clone()
    }

    /// Maintenance sweep: drop completed workflow records past retention.
    pub async fn sweep_history(&self) -> usize {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(WORKFLOW_RETENTION_HOURS);
        let mut history = self.history.lock().await;
        let before = history.len();
        history.retain(|r| r.finished_at > cutoff);
        before - history.len()
    }
}

#[cfg(test)]
mod tests;
