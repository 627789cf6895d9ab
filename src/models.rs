use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, collections::HashMap, fmt, str::FromStr};
use uuid::Uuid;

/// What kinds of work an agent accepts
///
/// Capabilities are a closed set of tags. Agent selection is a filter over
/// this set plus an argmax over performance score; capabilities are never
/// modeled as agent subtypes.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    DataIngestion,
    TechScouting,
    CodeAnalysis,
    ContentGeneration,
    CostOptimization,
    BusinessAnalysis,
    Experimentation,
    FeedbackAnalysis,
    StrategyEvolution,
    IntegrationTesting,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::DataIngestion,
        Capability::TechScouting,
        Capability::CodeAnalysis,
        Capability::ContentGeneration,
        Capability::CostOptimization,
        Capability::BusinessAnalysis,
        Capability::Experimentation,
        Capability::FeedbackAnalysis,
        Capability::StrategyEvolution,
        Capability::IntegrationTesting,
    ];

    /// Agent type spawned on demand when no agent holds this capability.
    pub fn default_agent_type(&self) -> &'static str {
        match self {
            Capability::DataIngestion => "learning",
            Capability::TechScouting => "tech_scout",
            Capability::CostOptimization => "cost_optimizer",
            Capability::Experimentation => "experimenter",
            Capability::CodeAnalysis => "integration",
            Capability::ContentGeneration => "content",
            Capability::BusinessAnalysis => "business",
            Capability::FeedbackAnalysis => "feedback",
            Capability::StrategyEvolution => "evolution",
            Capability::IntegrationTesting => "generic",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::DataIngestion => "data_ingestion",
            Capability::TechScouting => "tech_scouting",
            Capability::CodeAnalysis => "code_analysis",
            Capability::ContentGeneration => "content_generation",
            Capability::CostOptimization => "cost_optimization",
            Capability::BusinessAnalysis => "business_analysis",
            Capability::Experimentation => "experimentation",
            Capability::FeedbackAnalysis => "feedback_analysis",
            Capability::StrategyEvolution => "strategy_evolution",
            Capability::IntegrationTesting => "integration_testing",
        }
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "data_ingestion" => Ok(Capability::DataIngestion),
            "tech_scouting" => Ok(Capability::TechScouting),
            "code_analysis" => Ok(Capability::CodeAnalysis),
            "content_generation" => Ok(Capability::ContentGeneration),
            "cost_optimization" => Ok(Capability::CostOptimization),
            "business_analysis" => Ok(Capability::BusinessAnalysis),
            "experimentation" => Ok(Capability::Experimentation),
            "feedback_analysis" => Ok(Capability::FeedbackAnalysis),
            "strategy_evolution" => Ok(Capability::StrategyEvolution),
            "integration_testing" => Ok(Capability::IntegrationTesting),
            _ => Err(format!("Unknown capability: {s}")),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An agent's capability set: either a concrete set of tags or the
/// `generic` wildcard that matches every requirement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapabilitySet {
    Generic,
    Of(BTreeSet<Capability>),
}

impl CapabilitySet {
    pub fn of(caps: impl IntoIterator<Item = Capability>) -> Self {
        CapabilitySet::Of(caps.into_iter().collect())
    }

    pub fn contains(&self, cap: Capability) -> bool {
        match self {
            CapabilitySet::Generic => true,
            CapabilitySet::Of(set) => set.contains(&cap),
        }
    }
}

/// Task priority levels, ordered highest-urgency first by [`Priority::rank`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl Priority {
    /// Rank 1 is most urgent. Requests at rank >= 3 are eligible for batch
    /// processing in the cost guard.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Normal => 3,
            Priority::Low => 4,
            Priority::Background => 5,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

/// Current state of a task in the dispatch pipeline
///
/// Transitions are monotonic except Failed -> Pending on retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

/// Backoff shape used between retry attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Linear,
}

/// Retry behavior for a task, resolved from its type tag at creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub attempt_timeout_secs: u64,
}

impl RetryPolicy {
    /// Per-type defaults: ingest/analysis tasks get an extra attempt,
    /// finance tasks back off linearly.
    pub fn for_task_type(task_type: &str) -> Self {
        let backoff = if task_type == "finance" {
            BackoffKind::Linear
        } else {
            BackoffKind::Exponential
        };
        let max_attempts = match task_type {
            "data_ingestion" | "data_analysis" | "code_analysis" => 3,
            _ => 2,
        };
        Self {
            max_attempts,
            backoff,
            attempt_timeout_secs: 60,
        }
    }
}

/// A unit of dispatchable work
///
/// Tasks are the fundamental unit of the fabric. Dependencies reference
/// earlier task ids and must form a DAG; a task becomes Queued only after
/// all of its dependencies are Completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub required_capability: Capability,
    pub parameters: HashMap<String, serde_json::Value>,
    pub priority: Priority,
    pub dependencies: Vec<String>,
    /// Absolute deadline; None means unbounded.
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub retry: RetryPolicy,
    pub state: TaskState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, capability: Capability, priority: Priority) -> Self {
        let task_type = task_type.into();
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            retry: RetryPolicy::for_task_type(&task_type),
            task_type,
            required_capability: capability,
            parameters: HashMap::new(),
            priority,
            dependencies: Vec::new(),
            deadline: None,
            state: TaskState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Closed set of action types a decision may propose
///
/// Criticality, cost, and duration are pure functions on this tag; there is
/// no string-keyed dispatch anywhere downstream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    DataDeletion,
    ExternalApiCall,
    CodeExecution,
    FileModification,
    DataQuery,
    CacheOperation,
    ApiCall,
    ImageGeneration,
    VideoGeneration,
    LlmInference,
    DataProcessing,
    #[serde(other)]
    Other,
}

impl ActionKind {
    /// Parse an action tag; anything outside the closed set is `Other`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "data_deletion" => ActionKind::DataDeletion,
            "external_api_call" => ActionKind::ExternalApiCall,
            "code_execution" => ActionKind::CodeExecution,
            "file_modification" => ActionKind::FileModification,
            "data_query" => ActionKind::DataQuery,
            "cache_operation" => ActionKind::CacheOperation,
            "api_call" => ActionKind::ApiCall,
            "image_generation" => ActionKind::ImageGeneration,
            "video_generation" => ActionKind::VideoGeneration,
            "llm_inference" => ActionKind::LlmInference,
            "data_processing" => ActionKind::DataProcessing,
            _ => ActionKind::Other,
        }
    }

    pub fn criticality(&self) -> Criticality {
        match self {
            ActionKind::DataDeletion => Criticality::Critical,
            ActionKind::ExternalApiCall | ActionKind::CodeExecution => Criticality::High,
            ActionKind::FileModification => Criticality::Medium,
            ActionKind::DataQuery | ActionKind::CacheOperation => Criticality::Low,
            _ => Criticality::Medium,
        }
    }

    /// Estimated cost in USD of performing one action of this kind.
    pub fn estimated_cost(&self) -> f64 {
        match self {
            ActionKind::ApiCall => 0.01,
            ActionKind::ImageGeneration => 0.04,
            ActionKind::VideoGeneration => 0.30,
            ActionKind::LlmInference => 0.002,
            ActionKind::DataProcessing => 0.001,
            _ => 0.0,
        }
    }

    /// Estimated duration in seconds of one action of this kind.
    pub fn estimated_duration_secs(&self) -> u64 {
        match self {
            ActionKind::ApiCall => 2,
            ActionKind::ImageGeneration => 5,
            ActionKind::VideoGeneration => 30,
            ActionKind::LlmInference => 1,
            ActionKind::DataProcessing => 3,
            _ => 1,
        }
    }
}

/// Four-level ordinal determining approval policy. Ordering is
/// Low < Medium < High < Critical, so `max()` over proposed actions yields
/// the decision criticality directly.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Low,
    Medium,
    High,
    Critical,
}

/// One worker's contribution to a composed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub agent_id: String,
    pub agent_type: String,
    pub payload: serde_json::Value,
    pub confidence: f64,
    pub processing_time: f64,
    #[serde(default = "default_true")]
    pub success: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criticality_ordering_supports_max() {
        assert!(Criticality::Critical > Criticality::High);
        assert!(Criticality::High > Criticality::Medium);
        assert!(Criticality::Medium > Criticality::Low);

        let kinds = [ActionKind::DataQuery, ActionKind::CodeExecution];
        let max = kinds
            .iter()
            .map(|k| k.criticality())
            .max()
            .unwrap();
        assert_eq!(max, Criticality::High);
    }

    #[test]
    fn generic_capability_set_matches_everything() {
        let generic = CapabilitySet::Generic;
        for cap in Capability::ALL {
            assert!(generic.contains(cap));
        }

        let narrow = CapabilitySet::of([Capability::DataIngestion]);
        assert!(narrow.contains(Capability::DataIngestion));
        assert!(!narrow.contains(Capability::TechScouting));
    }

    #[test]
    fn retry_policy_defaults_by_type() {
        let finance = RetryPolicy::for_task_type("finance");
        assert_eq!(finance.backoff, BackoffKind::Linear);
        assert_eq!(finance.max_attempts, 2);

        let ingest = RetryPolicy::for_task_type("data_ingestion");
        assert_eq!(ingest.backoff, BackoffKind::Exponential);
        assert_eq!(ingest.max_attempts, 3);
    }

    #[test]
    fn batch_eligibility_follows_priority_rank() {
        assert!(Priority::Critical.rank() < 3);
        assert!(Priority::High.rank() < 3);
        assert!(Priority::Normal.rank() >= 3);
        assert!(Priority::Background.rank() >= 3);
    }

    #[test]
    fn unknown_action_kind_is_medium_and_free() {
        assert_eq!(ActionKind::Other.criticality(), Criticality::Medium);
        assert_eq!(ActionKind::Other.estimated_cost(), 0.0);
        assert_eq!(ActionKind::Other.estimated_duration_secs(), 1);
    }
}
