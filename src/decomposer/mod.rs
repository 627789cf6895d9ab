//! Goal decomposition: a high-level goal becomes an ordered DAG of
//! micro-tasks.
//!
//! The decomposer is deterministic for identical input: task ids are derived
//! from a content hash of the goal, stage widths from the goal's word count.
//! Emitted plans always satisfy the scheduler contract: unique ids,
//! dependencies referencing earlier tasks only, no cycles.

use crate::{
    constants::MAX_DECOMPOSED_TASKS,
    models::{Capability, Priority, Task},
    FabricError, Result,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Summary statistics over an emitted plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStats {
    pub total_tasks: usize,
    pub by_type: HashMap<String, usize>,
    /// Tasks with no dependencies; these may all start immediately.
    pub parallelizable: usize,
}

/// Goal intent, recognized from keywords. Selects the pipeline template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Content,
    Scouting,
    Learning,
    Analysis,
    Optimization,
    Testing,
    General,
}

impl Intent {
    fn classify(goal: &str) -> Self {
        let lower = goal.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        if has(&["image", "picture", "photo", "video", "animation", "content"]) {
            Intent::Content
        } else if has(&["scan", "scout", "discover"]) {
            Intent::Scouting
        } else if has(&["learn", "study", "research"]) {
            Intent::Learning
        } else if has(&["analyze", "analysis", "data"]) {
            Intent::Analysis
        } else if has(&["optimize", "cost", "budget"]) {
            Intent::Optimization
        } else if has(&["test", "verify", "validate"]) {
            Intent::Testing
        } else {
            Intent::General
        }
    }

    /// Three-stage pipeline: wide ingest, narrower transform, single fan-in.
    fn stages(&self) -> [Capability; 3] {
        match self {
            Intent::Content => [
                Capability::DataIngestion,
                Capability::ContentGeneration,
                Capability::FeedbackAnalysis,
            ],
            Intent::Scouting => [
                Capability::TechScouting,
                Capability::BusinessAnalysis,
                Capability::StrategyEvolution,
            ],
            Intent::Learning => [
                Capability::DataIngestion,
                Capability::BusinessAnalysis,
                Capability::StrategyEvolution,
            ],
            Intent::Analysis => [
                Capability::DataIngestion,
                Capability::BusinessAnalysis,
                Capability::FeedbackAnalysis,
            ],
            Intent::Optimization => [
                Capability::CostOptimization,
                Capability::Experimentation,
                Capability::FeedbackAnalysis,
            ],
            Intent::Testing => [
                Capability::CodeAnalysis,
                Capability::IntegrationTesting,
                Capability::FeedbackAnalysis,
            ],
            Intent::General => [
                Capability::DataIngestion,
                Capability::BusinessAnalysis,
                Capability::ContentGeneration,
            ],
        }
    }
}

pub struct TaskDecomposer;

impl TaskDecomposer {
    pub fn new() -> Self {
        Self
    }

    /// Decompose a goal into a task DAG bounded by `max_tasks`.
    ///
    /// Stage n+1 tasks depend on every stage n task, so dependency edges
    /// always point at earlier-emitted ids.
    pub fn decompose(
        &self,
        goal: &str,
        context: &HashMap<String, serde_json::Value>,
        max_tasks: usize,
        priority: Priority,
    ) -> Result<Vec<Task>> {
        if goal.trim().is_empty() {
            return Err(FabricError::InvalidInput("goal cannot be empty".to_string()));
        }
        let max_tasks = max_tasks.clamp(1, MAX_DECOMPOSED_TASKS);

        let intent = Intent::classify(goal);
        let stages = intent.stages();

        let word_count = goal.split_whitespace().count();
        let widths = [
            (word_count / 6).clamp(1, 8),
            (word_count / 12).clamp(1, 4),
            1,
        ];

        let goal_tag = {
            let digest = Sha256::digest(goal.as_bytes());
            format!("{:x}", digest)[..8].to_string()
        };

        let mut tasks: Vec<Task> = Vec::new();
        let mut prev_stage_ids: Vec<String> = Vec::new();

        'stages: for (stage_idx, (&capability, &width)) in
            stages.iter().zip(widths.iter()).enumerate()
        {
            let mut stage_ids = Vec::new();
            for slot in 0..width {
                if tasks.len() >= max_tasks {
                    break 'stages;
                }

                let id = format!("{goal_tag}-{:03}", tasks.len());
                let mut task = Task::new(capability.as_str(), capability, priority)
                    .with_dependencies(prev_stage_ids.clone())
                    .with_parameter("goal", serde_json::Value::String(goal.to_string()))
                    .with_parameter("stage", serde_json::json!(stage_idx))
                    .with_parameter("slot", serde_json::json!(slot));
                task.id = id.clone();

                for (key, value) in context {
                    task.parameters
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }

                stage_ids.push(id);
                tasks.push(task);
            }
            prev_stage_ids = stage_ids;
        }

        Ok(tasks)
    }

    pub fn stats(&self, tasks: &[Task]) -> PlanStats {
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for task in tasks {
            *by_type.entry(task.task_type.clone()).or_insert(0) += 1;
        }
        PlanStats {
            total_tasks: tasks.len(),
            parallelizable: tasks.iter().filter(|t| t.dependencies.is_empty()).count(),
            by_type,
        }
    }
}

impl Default for TaskDecomposer {
    fn default() -> Self {
        Self::new()
    }
}
