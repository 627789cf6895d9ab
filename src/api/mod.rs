//! HTTP facade: the fabric's public surface.
//!
//! Stateless request router over the core components. Every response uses
//! the `{"success": bool, ...}` envelope with a `detail` string on errors;
//! statuses come from [`FabricError::status_code`]. Middleware order is
//! identity, then rate limiting, then tracing and CORS.

use crate::{
    auth::{identity_middleware, Identity},
    composer::{CompositionStrategy, OutputComposer},
    config::{ApiConfig, Config},
    cortex::{budget::BudgetSummary, memory::MemoryPartition, ProjectStore},
    cost_guard::{CostGuard, InferenceOutcome, InferenceRequest},
    decomposer::TaskDecomposer,
    dispatcher::Dispatcher,
    gate::{DecisionGate, DecisionStatus, ProposedAction},
    models::{ActionKind, Capability, CapabilitySet, Priority, Task, WorkerOutput},
    rate_limit::{rate_limit_middleware, EndpointRateLimiter},
    registry::{scaler::AutoScaler, AgentRegistry},
    validation::TextValidator,
    FabricError, Result,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Extension, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

const SERVICE_NAME: &str = "fabric-core";
const SERVICE_VERSION: &str = "0.1.0";

const ROUTE_HEALTH: &str = "/health";
const ROUTE_ROOT: &str = "/";
const ROUTE_CHAT: &str = "/chat";
const ROUTE_APPROVE: &str = "/approve";
const ROUTE_DECOMPOSE: &str = "/decompose";
const ROUTE_COMPOSE: &str = "/compose";
const ROUTE_DECISIONS: &str = "/decisions";
const ROUTE_TASK_ASSIGN: &str = "/task/assign";
const ROUTE_TASK_COMPLETE: &str = "/task/complete";
const ROUTE_AGENT_SPAWN: &str = "/agent/spawn";
const ROUTE_AGENT_BY_ID: &str = "/agent/{agent_id}";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_AGENTS_BY_CAPABILITY: &str = "/agents/capability/{capability}";
const ROUTE_SCALE: &str = "/scale";
const ROUTE_STATS: &str = "/stats";
const ROUTE_INFERENCE: &str = "/inference";
const ROUTE_BATCH: &str = "/batch";
const ROUTE_ROI: &str = "/roi/evaluate";
const ROUTE_CACHE_STATS: &str = "/cache/stats";
const ROUTE_CACHE_CLEAR: &str = "/cache/clear";
const ROUTE_COST_SUMMARY: &str = "/cost/summary";
const ROUTE_PROJECTS: &str = "/projects";
const ROUTE_PROJECT_BY_ID: &str = "/projects/{project_id}";
const ROUTE_PROJECT_SLEEP: &str = "/projects/{project_id}/sleep";
const ROUTE_PROJECT_WAKE: &str = "/projects/{project_id}/wake";
const ROUTE_PROJECT_AGENTS: &str = "/projects/{project_id}/agents";
const ROUTE_PROJECT_MEMORY: &str = "/projects/{project_id}/memory";
const ROUTE_PROJECT_MEMORY_KEY: &str = "/projects/{project_id}/memory/{partition}/{key}";
const ROUTE_PROJECT_MEMORY_CLEAR: &str = "/projects/{project_id}/memory/clear";
const ROUTE_PROJECT_BUDGET: &str = "/projects/{project_id}/budget";
const ROUTE_PROJECT_EXPENSE: &str = "/projects/{project_id}/budget/expense";
const ROUTE_PROJECT_RESERVE: &str = "/projects/{project_id}/budget/reserve";
const ROUTE_PROJECT_RELEASE: &str = "/projects/{project_id}/budget/release";
const ROUTE_PROJECT_BUDGET_ADD: &str = "/projects/{project_id}/budget/add";
const ROUTE_PROJECT_TRANSACTIONS: &str = "/projects/{project_id}/budget/transactions";

/// Keywords that turn a chat message into an action plan.
const ACTION_KEYWORDS: [&str; 11] = [
    "generate", "create", "build", "scan", "find", "search", "analyze", "process", "learn",
    "train", "optimize",
];

/// Error wrapper so handlers can use `?` and still produce the envelope.
pub struct ApiError(FabricError);

impl From<FabricError> for ApiError {
    fn from(err: FabricError) -> Self {
        ApiError(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError(FabricError::Serialization(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {}", self.0);
        }
        (
            status,
            Json(json!({"success": false, "detail": self.0.to_string()})),
        )
            .into_response()
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

fn ok(mut payload: Value) -> Json<Value> {
    if let Some(map) = payload.as_object_mut() {
        map.insert("success".to_string(), json!(true));
    }
    Json(payload)
}

/// Plans awaiting approval, keyed by decision action-id.
struct PendingPlan {
    tasks: Vec<Task>,
    deadline_secs: Option<u64>,
}

#[derive(Clone)]
pub struct AppState {
    registry: Arc<AgentRegistry>,
    scaler: Arc<AutoScaler>,
    decomposer: Arc<TaskDecomposer>,
    gate: Arc<DecisionGate>,
    store: Arc<ProjectStore>,
    cost_guard: Arc<CostGuard>,
    dispatcher: Arc<Dispatcher>,
    composer: Arc<OutputComposer>,
    validator: TextValidator,
    pending_plans: Arc<Mutex<HashMap<String, PendingPlan>>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        scaler: Arc<AutoScaler>,
        decomposer: Arc<TaskDecomposer>,
        gate: Arc<DecisionGate>,
        store: Arc<ProjectStore>,
        cost_guard: Arc<CostGuard>,
        dispatcher: Arc<Dispatcher>,
        composer: Arc<OutputComposer>,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            scaler,
            decomposer,
            gate,
            store,
            cost_guard,
            dispatcher,
            composer,
            validator: TextValidator::new()?,
            pending_plans: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Performance-score snapshot used to weight composed outputs.
    async fn agent_scores(&self) -> HashMap<String, f64> {
        self.registry
            .list()
            .await
            .into_iter()
            .map(|a| (a.id, a.performance_score))
            .collect()
    }

    /// Dispatch an approved plan and compose the worker outputs.
    async fn execute_plan(&self, plan: PendingPlan) -> Result<Value> {
        let report = self
            .dispatcher
            .run_workflow(plan.tasks, plan.deadline_secs)
            .await?;
        let scores = self.agent_scores().await;
        let composed =
            self.composer
                .compose(&report.outputs, CompositionStrategy::Comprehensive, &scores);
        Ok(json!({
            "workflow": report,
            "composed": composed,
        }))
    }
}

pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: &Config, state: AppState) -> Self {
        Self {
            config: config.api.clone(),
            state,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();

        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| FabricError::Internal(e.into()))?;

        info!(
            "API server listening on {}:{}",
            self.config.host, self.config.port
        );

        axum::serve(listener, app)
            .await
            .map_err(|e| FabricError::Internal(e.into()))?;

        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::DELETE,
            ])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderName::from_static("x-user-id"),
            ]);

        let rate_limiter = Arc::new(EndpointRateLimiter::new());

        Router::new()
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_ROOT, get(service_descriptor))
            .route(ROUTE_CHAT, post(chat))
            .route(ROUTE_APPROVE, post(approve))
            .route(ROUTE_DECOMPOSE, post(decompose))
            .route(ROUTE_COMPOSE, post(compose))
            .route(ROUTE_DECISIONS, get(pending_decisions))
            .route(ROUTE_TASK_ASSIGN, post(assign_task))
            .route(ROUTE_TASK_COMPLETE, post(complete_task))
            .route(ROUTE_AGENT_SPAWN, post(spawn_agent))
            .route(ROUTE_AGENT_BY_ID, delete(terminate_agent))
            .route(ROUTE_AGENTS, get(list_agents))
            .route(ROUTE_AGENTS_BY_CAPABILITY, get(agents_by_capability))
            .route(ROUTE_SCALE, post(trigger_scale))
            .route(ROUTE_STATS, get(stats))
            .route(ROUTE_INFERENCE, post(inference))
            .route(ROUTE_BATCH, post(batch))
            .route(ROUTE_ROI, post(evaluate_roi))
            .route(ROUTE_CACHE_STATS, get(cache_stats))
            .route(ROUTE_CACHE_CLEAR, post(clear_cache))
            .route(ROUTE_COST_SUMMARY, get(cost_summary))
            .route(ROUTE_PROJECTS, post(create_project).get(list_projects))
            .route(ROUTE_PROJECT_BY_ID, get(get_project))
            .route(ROUTE_PROJECT_SLEEP, post(sleep_project))
            .route(ROUTE_PROJECT_WAKE, post(wake_project))
            .route(ROUTE_PROJECT_AGENTS, post(assign_project_agent))
            .route(ROUTE_PROJECT_MEMORY, post(memory_put))
            .route(
                ROUTE_PROJECT_MEMORY_KEY,
                get(memory_get).delete(memory_delete),
            )
            .route(ROUTE_PROJECT_MEMORY_CLEAR, post(memory_clear_short_term))
            .route(ROUTE_PROJECT_BUDGET, post(create_budget).get(budget_summary))
            .route(ROUTE_PROJECT_EXPENSE, post(record_expense))
            .route(ROUTE_PROJECT_RESERVE, post(reserve_budget))
            .route(ROUTE_PROJECT_RELEASE, post(release_budget))
            .route(ROUTE_PROJECT_BUDGET_ADD, post(add_budget))
            .route(ROUTE_PROJECT_TRANSACTIONS, get(transaction_history))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn(identity_middleware))
                    .layer(middleware::from_fn_with_state(
                        rate_limiter,
                        rate_limit_middleware,
                    ))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.state.clone())
    }
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let registry_stats = state.registry.stats().await;
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "components": {
            "registry": {"agents": registry_stats.total_agents},
            "gate": "active",
            "cost_guard": "active",
            "dispatcher": "active",
        }
    }))
}

async fn service_descriptor() -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "description": "Distributed AI task-orchestration fabric",
        "endpoints": [
            "POST /chat - Submit a goal",
            "POST /approve - Approve or reject a decision",
            "POST /decompose - Preview a goal's task DAG",
            "POST /compose - Compose worker outputs",
            "GET /decisions - Pending decisions",
            "POST /task/assign - Direct task assignment",
            "POST /task/complete - Report task completion",
            "POST /agent/spawn - Spawn an agent",
            "DELETE /agent/{id} - Terminate an agent",
            "GET /agents - List agents",
            "POST /scale - Trigger scaling",
            "GET /stats - Fabric statistics",
            "POST /inference - Cost-guarded inference",
            "POST /batch - Batch inference",
            "POST /roi/evaluate - ROI gate",
        ]
    }))
}

// ---- chat / decisions ----

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    context: HashMap<String, Value>,
    deadline_secs: Option<u64>,
}

fn classify_intent(message: &str) -> (&'static str, bool) {
    let lower = message.to_lowercase();
    let requires_action = ACTION_KEYWORDS.iter().any(|k| lower.contains(k));

    let intent = if lower.contains("image") || lower.contains("video") {
        "media_generation"
    } else if lower.contains("scan") || lower.contains("scout") || lower.contains("discover") {
        "tech_scouting"
    } else if lower.contains("learn") || lower.contains("study") || lower.contains("research") {
        "learning"
    } else if lower.contains("analyze") || lower.contains("data") {
        "data_analysis"
    } else {
        "general"
    };
    (intent, requires_action)
}

fn simple_response(message: &str) -> String {
    let lower = message.to_lowercase();
    if lower.contains("hello") || lower.contains("hi ") || lower.starts_with("hi") {
        "Hello! Submit a goal and the fabric will plan and dispatch it.".to_string()
    } else if lower.contains("status") || lower.contains("health") {
        "All components operational: registry, gate, cost guard, dispatcher.".to_string()
    } else if lower.contains("help") || lower.contains("capabilities") {
        "I decompose goals into capability-matched micro-tasks, gate risky actions behind approvals, and compose worker outputs into one response.".to_string()
    } else {
        format!("I understood: {message}. Phrase an actionable goal (generate, analyze, research, ...) to start a workflow.")
    }
}

async fn chat(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<ChatRequest>,
) -> ApiResult {
    let message = state.validator.validate_text("message", &request.message)?;
    let (intent, requires_action) = classify_intent(&message);

    if !requires_action {
        return Ok(ok(json!({
            "response": simple_response(&message),
            "requires_approval": false,
        })));
    }

    let tasks = state
        .decomposer
        .decompose(&message, &request.context, 100, Priority::Normal)?;

    let proposed_actions: Vec<ProposedAction> = tasks
        .iter()
        .take(10)
        .map(|t| ProposedAction {
            kind: ActionKind::from_tag(&t.task_type),
            description: format!("{} ({})", t.task_type, t.id),
            parameters: HashMap::new(),
        })
        .collect();

    let decision = state.gate.analyze(&message, intent, proposed_actions).await?;
    info!(
        "Chat goal from {} produced decision {} ({:?})",
        identity.0, decision.action_id, decision.status
    );

    let plan = PendingPlan {
        tasks,
        deadline_secs: request.deadline_secs,
    };

    match decision.status {
        DecisionStatus::AutoApproved => {
            state.gate.execute(&decision.action_id).await?;
            let total_tasks = plan.tasks.len();
            let result = state.execute_plan(plan).await?;
            state.gate.complete(&decision.action_id).await?;
            Ok(ok(json!({
                "response": format!("Goal executed across {total_tasks} tasks."),
                "action_id": decision.action_id,
                "requires_approval": false,
                "estimated_cost": decision.estimated_cost,
                "estimated_duration_secs": decision.estimated_duration_secs,
                "execution": result,
            })))
        }
        DecisionStatus::Rejected => Ok(ok(json!({
            "response": "The proposed plan was rejected by policy.",
            "action_id": decision.action_id,
            "requires_approval": false,
            "rule_trace": decision.rule_trace,
        }))),
        _ => {
            let total_tasks = plan.tasks.len();
            state
                .pending_plans
                .lock()
                .await
                .insert(decision.action_id.clone(), plan);
            Ok(ok(json!({
                "response": format!(
                    "Planned {total_tasks} tasks (criticality {:?}). Approval required before execution.",
                    decision.criticality
                ),
                "action_id": decision.action_id,
                "requires_approval": true,
                "estimated_cost": decision.estimated_cost,
                "estimated_duration_secs": decision.estimated_duration_secs,
            })))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApprovalRequestBody {
    action_id: String,
    approved: bool,
}

async fn approve(State(state): State<AppState>, Json(request): Json<ApprovalRequestBody>) -> ApiResult {
    let status = state.gate.resolve(&request.action_id, request.approved).await?;

    match status {
        DecisionStatus::Approved => {
            state.gate.execute(&request.action_id).await?;
            let plan = state.pending_plans.lock().await.remove(&request.action_id);
            let execution = match plan {
                Some(plan) => Some(state.execute_plan(plan).await?),
                None => None,
            };
            state.gate.complete(&request.action_id).await?;
            Ok(ok(json!({
                "action_id": request.action_id,
                "status": "approved",
                "message": "Action approved and executed",
                "execution": execution,
            })))
        }
        DecisionStatus::Rejected => {
            state.pending_plans.lock().await.remove(&request.action_id);
            Ok(ok(json!({
                "action_id": request.action_id,
                "status": "rejected",
                "message": "Action rejected",
            })))
        }
        DecisionStatus::Expired => {
            state.pending_plans.lock().await.remove(&request.action_id);
            Ok(ok(json!({
                "action_id": request.action_id,
                "status": "expired",
                "message": "Approval window elapsed; the decision expired",
            })))
        }
        other => Ok(ok(json!({
            "action_id": request.action_id,
            "status": format!("{other:?}").to_lowercase(),
        }))),
    }
}

async fn pending_decisions(State(state): State<AppState>) -> ApiResult {
    let pending = state.gate.pending().await;
    Ok(ok(json!({
        "count": pending.len(),
        "decisions": pending,
    })))
}

// ---- decomposition / composition ----

#[derive(Debug, Deserialize)]
struct DecomposeRequest {
    goal: String,
    #[serde(default)]
    context: HashMap<String, Value>,
    #[serde(default = "default_max_tasks")]
    max_tasks: usize,
    priority: Option<String>,
}

fn default_max_tasks() -> usize {
    100
}

async fn decompose(State(state): State<AppState>, Json(request): Json<DecomposeRequest>) -> ApiResult {
    let goal = state.validator.validate_text("goal", &request.goal)?;
    let priority = match &request.priority {
        Some(tag) => TextValidator::parse_tag("priority", tag)?,
        None => Priority::Normal,
    };

    let tasks = state
        .decomposer
        .decompose(&goal, &request.context, request.max_tasks, priority)?;
    let stats = state.decomposer.stats(&tasks);

    Ok(ok(json!({
        "goal": goal,
        "total_tasks": tasks.len(),
        "stats": stats,
        "task_preview": tasks.iter().take(20).map(|t| json!({
            "id": t.id,
            "type": t.task_type,
            "capability": t.required_capability,
            "priority": t.priority,
            "dependencies": t.dependencies,
        })).collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
struct ComposeRequest {
    outputs: Vec<WorkerOutput>,
    #[serde(default = "default_strategy")]
    strategy: String,
}

fn default_strategy() -> String {
    "comprehensive".to_string()
}

async fn compose(State(state): State<AppState>, Json(request): Json<ComposeRequest>) -> ApiResult {
    TextValidator::validate_collection_size("outputs", request.outputs.len())?;
    let strategy: CompositionStrategy = TextValidator::parse_tag("strategy", &request.strategy)?;

    let scores = state.agent_scores().await;
    let composed = state.composer.compose(&request.outputs, strategy, &scores);

    Ok(ok(json!({ "composed": composed })))
}

// ---- tasks / agents / scaling ----

#[derive(Debug, Deserialize)]
struct AssignTaskRequest {
    task_type: String,
    capability: String,
    #[serde(default)]
    parameters: HashMap<String, Value>,
    #[serde(default = "default_priority_tag")]
    priority: String,
}

fn default_priority_tag() -> String {
    "normal".to_string()
}

async fn assign_task(State(state): State<AppState>, Json(request): Json<AssignTaskRequest>) -> ApiResult {
    let capability: Capability = TextValidator::parse_tag("capability", &request.capability)?;
    let priority: Priority = TextValidator::parse_tag("priority", &request.priority)?;

    let mut task = Task::new(request.task_type, capability, priority);
    task.parameters = request.parameters;
    let task_id = Uuid::new_v4().to_string();
    task.id = task_id.clone();

    match state.registry.assign_to_capability(&task_id, capability).await? {
        Some(agent_id) => Ok(ok(json!({
            "task_id": task_id,
            "agent_id": agent_id,
            "status": "assigned",
            "message": format!("Task assigned to agent {agent_id}"),
        }))),
        None => Ok(ok(json!({
            "task_id": task_id,
            "agent_id": Value::Null,
            "status": "queued",
            "message": "No agents available - task queued for processing",
        }))),
    }
}

#[derive(Debug, Deserialize)]
struct CompleteTaskRequest {
    task_id: String,
    agent_id: String,
    success: bool,
    processing_time: f64,
    result: Option<Value>,
}

async fn complete_task(
    State(state): State<AppState>,
    Json(request): Json<CompleteTaskRequest>,
) -> ApiResult {
    state
        .registry
        .complete(
            &request.agent_id,
            &request.task_id,
            request.success,
            request.processing_time,
        )
        .await?;

    // Completion is a scaling signal: re-evaluate the pool.
    let queue_depth = state.registry.stats().await.queue_depth;
    state.scaler.scale(queue_depth).await;

    Ok(ok(json!({
        "task_id": request.task_id,
        "message": "Task completion recorded",
        "result": request.result,
    })))
}

#[derive(Debug, Deserialize)]
struct SpawnAgentRequest {
    agent_type: String,
    capabilities: Vec<String>,
    #[serde(default = "default_concurrency")]
    max_concurrent_tasks: usize,
}

fn default_concurrency() -> usize {
    1
}

async fn spawn_agent(State(state): State<AppState>, Json(request): Json<SpawnAgentRequest>) -> ApiResult {
    TextValidator::validate_collection_size("capabilities", request.capabilities.len())?;
    if !(1..=10).contains(&request.max_concurrent_tasks) {
        return Err(FabricError::InvalidInput(
            "max_concurrent_tasks must be between 1 and 10".to_string(),
        )
        .into());
    }

    let capabilities = if request.capabilities.iter().any(|c| c == "generic") {
        CapabilitySet::Generic
    } else {
        let mut caps = Vec::new();
        for tag in &request.capabilities {
            caps.push(TextValidator::parse_tag::<Capability>("capability", tag)?);
        }
        if caps.is_empty() {
            return Err(
                FabricError::InvalidInput("capabilities cannot be empty".to_string()).into(),
            );
        }
        CapabilitySet::of(caps)
    };

    let agent = state
        .registry
        .spawn(&request.agent_type, capabilities, request.max_concurrent_tasks)
        .await?;

    Ok(ok(json!({
        "agent_id": agent.id,
        "agent_type": agent.agent_type,
        "capabilities": agent.capabilities,
        "message": format!("Agent {} spawned successfully", agent.id),
    })))
}

async fn terminate_agent(State(state): State<AppState>, Path(agent_id): Path<String>) -> ApiResult {
    state.registry.terminate(&agent_id).await?;
    Ok(ok(json!({
        "message": format!("Agent {agent_id} terminated successfully"),
    })))
}

async fn list_agents(State(state): State<AppState>) -> ApiResult {
    let agents = state.registry.list().await;
    Ok(ok(json!({
        "total_agents": agents.len(),
        "agents": agents,
    })))
}

async fn agents_by_capability(
    State(state): State<AppState>,
    Path(capability): Path<String>,
) -> ApiResult {
    let capability: Capability = TextValidator::parse_tag("capability", &capability)?;
    let agents = state.registry.agents_by_capability(capability).await;
    Ok(ok(json!({
        "capability": capability,
        "count": agents.len(),
        "agents": agents,
    })))
}

#[derive(Debug, Deserialize)]
struct ScaleRequest {
    #[serde(default)]
    queue_depth: usize,
}

async fn trigger_scale(State(state): State<AppState>, Json(request): Json<ScaleRequest>) -> ApiResult {
    let outcome = state.scaler.scale(request.queue_depth).await;
    let stats = state.registry.stats().await;
    Ok(ok(json!({
        "message": "Auto-scaling triggered",
        "outcome": outcome,
        "stats": stats,
    })))
}

async fn stats(State(state): State<AppState>) -> ApiResult {
    let registry_stats = state.registry.stats().await;
    let capabilities = state.registry.capability_breakdown().await;
    let decisions = state.gate.stats().await;

    Ok(ok(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "registry": registry_stats,
        "capabilities": capabilities,
        "decisions": decisions,
        "overflow_queue_depth": state.dispatcher.overflow_depth().await,
    })))
}

// ---- cost guard ----

#[derive(Debug, Deserialize)]
struct InferenceRequestBody {
    prompt: String,
    #[serde(default = "default_model_tag")]
    model: String,
    #[serde(default = "default_max_cost")]
    max_cost: f64,
    #[serde(default = "default_priority_tag")]
    priority: String,
}

fn default_model_tag() -> String {
    "auto".to_string()
}

fn default_max_cost() -> f64 {
    0.10
}

async fn inference(
    State(state): State<AppState>,
    Json(request): Json<InferenceRequestBody>,
) -> ApiResult {
    let prompt = state.validator.validate_text("prompt", &request.prompt)?;
    if !["auto", "local", "external"].contains(&request.model.as_str()) {
        return Err(FabricError::InvalidInput(format!(
            "model must be auto, local, or external (got {})",
            request.model
        ))
        .into());
    }
    let priority: Priority = TextValidator::parse_tag("priority", &request.priority)?;

    let outcome = state
        .cost_guard
        .infer(InferenceRequest {
            prompt,
            model: request.model,
            max_cost: request.max_cost,
            priority,
        })
        .await?;

    match outcome {
        InferenceOutcome::Served {
            result,
            source,
            cost,
            savings,
        } => Ok(ok(json!({
            "result": result,
            "source": source,
            "cost": cost,
            "savings": savings,
        }))),
        InferenceOutcome::QueuedForBatch {
            estimated_cost_savings,
        } => Ok(ok(json!({
            "status": "queued_for_batch",
            "message": "Request queued for batch processing",
            "estimated_cost_savings": estimated_cost_savings,
        }))),
    }
}

#[derive(Debug, Deserialize)]
struct BatchRequestBody {
    requests: Vec<InferenceRequestBody>,
    #[serde(default)]
    #[allow(dead_code)]
    max_wait_seconds: Option<u64>,
}

async fn batch(State(state): State<AppState>, Json(request): Json<BatchRequestBody>) -> ApiResult {
    TextValidator::validate_collection_size("requests", request.requests.len())?;

    let mut requests = Vec::with_capacity(request.requests.len());
    for body in request.requests {
        let prompt = state.validator.validate_text("prompt", &body.prompt)?;
        let priority: Priority = TextValidator::parse_tag("priority", &body.priority)?;
        requests.push(InferenceRequest {
            prompt,
            model: body.model,
            max_cost: body.max_cost,
            priority,
        });
    }

    let outcome = state.cost_guard.batch_process(requests).await?;
    Ok(ok(serde_json::to_value(outcome)?))
}

#[derive(Debug, Deserialize)]
struct RoiRequestBody {
    operation: String,
    estimated_cost: f64,
    expected_value: f64,
}

async fn evaluate_roi(Json(request): Json<RoiRequestBody>) -> ApiResult {
    if request.estimated_cost < 0.0 || request.expected_value < 0.0 {
        return Err(FabricError::InvalidInput(
            "estimated_cost and expected_value must be non-negative".to_string(),
        )
        .into());
    }
    let decision = CostGuard::evaluate_roi(
        &request.operation,
        request.estimated_cost,
        request.expected_value,
    );
    Ok(ok(json!({
        "decision": decision,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

async fn cache_stats(State(state): State<AppState>) -> ApiResult {
    let stats = state.cost_guard.cache_stats().await;
    Ok(ok(json!({ "cache_stats": stats })))
}

#[derive(Debug, Deserialize)]
struct ClearCacheRequest {
    older_than_seconds: Option<u64>,
}

async fn clear_cache(State(state): State<AppState>, Json(request): Json<ClearCacheRequest>) -> ApiResult {
    let cleared = state.cost_guard.clear_cache(request.older_than_seconds).await;
    Ok(ok(json!({
        "entries_cleared": cleared,
        "message": format!("Cleared {cleared} cache entries"),
    })))
}

#[derive(Debug, Deserialize)]
struct CostSummaryParams {
    #[serde(default = "default_period_hours")]
    period_hours: i64,
}

fn default_period_hours() -> i64 {
    24
}

async fn cost_summary(
    State(state): State<AppState>,
    Query(params): Query<CostSummaryParams>,
) -> ApiResult {
    if !(1..=24 * 365).contains(&params.period_hours) {
        return Err(
            FabricError::InvalidInput("period_hours must be between 1 and 8760".to_string()).into(),
        );
    }
    let summary = state.cost_guard.cost_summary(params.period_hours).await;
    Ok(ok(json!({ "cost_summary": summary })))
}

// ---- projects ----

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    name: String,
    total_budget: Option<f64>,
}

async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> ApiResult {
    let name = state.validator.validate_text("name", &request.name)?;
    let project = state.store.create(&name, request.total_budget).await?;
    Ok(ok(json!({ "project": project })))
}

async fn list_projects(State(state): State<AppState>) -> ApiResult {
    let projects = state.store.list().await;
    Ok(ok(json!({
        "count": projects.len(),
        "projects": projects,
    })))
}

async fn get_project(State(state): State<AppState>, Path(project_id): Path<String>) -> ApiResult {
    let project = state.store.get(&project_id).await?;
    Ok(ok(json!({ "project": project })))
}

async fn sleep_project(State(state): State<AppState>, Path(project_id): Path<String>) -> ApiResult {
    let project = state.store.sleep(&project_id).await?;
    Ok(ok(json!({ "project": project })))
}

async fn wake_project(State(state): State<AppState>, Path(project_id): Path<String>) -> ApiResult {
    let project = state.store.wake(&project_id).await?;
    Ok(ok(json!({ "project": project })))
}

#[derive(Debug, Deserialize)]
struct ProjectAgentRequest {
    agent_id: String,
    #[serde(default)]
    unassign: bool,
}

async fn assign_project_agent(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<ProjectAgentRequest>,
) -> ApiResult {
    if request.unassign {
        state.store.unassign_agent(&project_id, &request.agent_id).await?;
    } else {
        state.store.assign_agent(&project_id, &request.agent_id).await?;
    }
    let project = state.store.get(&project_id).await?;
    Ok(ok(json!({ "project": project })))
}

#[derive(Debug, Deserialize)]
struct MemoryPutRequest {
    partition: String,
    key: String,
    value: Value,
}

async fn memory_put(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<MemoryPutRequest>,
) -> ApiResult {
    let partition: MemoryPartition = TextValidator::parse_tag("partition", &request.partition)?;
    state
        .store
        .memory_put(&project_id, partition, &request.key, request.value)
        .await?;
    Ok(ok(json!({ "message": "stored" })))
}

async fn memory_get(
    State(state): State<AppState>,
    Path((project_id, partition, key)): Path<(String, String, String)>,
) -> ApiResult {
    let partition: MemoryPartition = TextValidator::parse_tag("partition", &partition)?;
    let value = state.store.memory_get(&project_id, partition, &key).await?;
    Ok(ok(json!({ "key": key, "value": value })))
}

async fn memory_delete(
    State(state): State<AppState>,
    Path((project_id, partition, key)): Path<(String, String, String)>,
) -> ApiResult {
    let partition: MemoryPartition = TextValidator::parse_tag("partition", &partition)?;
    let removed = state.store.memory_delete(&project_id, partition, &key).await?;
    Ok(ok(json!({ "removed": removed })))
}

async fn memory_clear_short_term(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult {
    let cleared = state.store.clear_short_term(&project_id).await?;
    Ok(ok(json!({ "entries_cleared": cleared })))
}

#[derive(Debug, Deserialize)]
struct CreateBudgetRequest {
    total: f64,
    #[serde(default = "default_currency")]
    currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

async fn create_budget(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<CreateBudgetRequest>,
) -> ApiResult {
    if request.total <= 0.0 {
        return Err(FabricError::InvalidInput("total must be positive".to_string()).into());
    }
    let summary = state
        .store
        .budget_create(&project_id, request.total, &request.currency)
        .await?;
    Ok(budget_envelope(summary))
}

fn budget_envelope(summary: BudgetSummary) -> Json<Value> {
    ok(json!({ "budget": summary }))
}

#[derive(Debug, Deserialize)]
struct ExpenseRequest {
    amount: f64,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    description: String,
}

fn default_category() -> String {
    "general".to_string()
}

async fn record_expense(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<ExpenseRequest>,
) -> ApiResult {
    if request.amount <= 0.0 {
        return Err(FabricError::InvalidInput("amount must be positive".to_string()).into());
    }
    let summary = state
        .store
        .record_expense(&project_id, request.amount, &request.category, &request.description)
        .await?;
    Ok(budget_envelope(summary))
}

#[derive(Debug, Deserialize)]
struct AmountRequest {
    amount: f64,
    #[serde(default)]
    description: String,
}

async fn reserve_budget(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<AmountRequest>,
) -> ApiResult {
    let summary = state.store.reserve(&project_id, request.amount).await?;
    Ok(budget_envelope(summary))
}

async fn release_budget(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<AmountRequest>,
) -> ApiResult {
    let summary = state.store.release(&project_id, request.amount).await?;
    Ok(budget_envelope(summary))
}

async fn add_budget(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<AmountRequest>,
) -> ApiResult {
    if request.amount <= 0.0 {
        return Err(FabricError::InvalidInput("amount must be positive".to_string()).into());
    }
    let summary = state
        .store
        .add_budget(&project_id, request.amount, &request.description)
        .await?;
    Ok(budget_envelope(summary))
}

async fn budget_summary(State(state): State<AppState>, Path(project_id): Path<String>) -> ApiResult {
    let summary = state.store.budget_summary(&project_id).await?;
    Ok(budget_envelope(summary))
}

#[derive(Debug, Deserialize)]
struct TransactionParams {
    limit: Option<usize>,
}

async fn transaction_history(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(params): Query<TransactionParams>,
) -> ApiResult {
    let transactions = state.store.transaction_history(&project_id, params.limit).await?;
    Ok(ok(json!({
        "count": transactions.len(),
        "transactions": transactions,
    })))
}

#[cfg(test)]
mod tests;
