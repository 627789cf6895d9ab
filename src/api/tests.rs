use super::*;
use crate::config::RegistryConfig;
use crate::cost_guard::SimulatedBackend;
use crate::dispatcher::LocalWorker;
use axum::body::Body;
use axum::http::Request;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

async fn test_router() -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    let config = Config::default();

    let registry = Arc::new(
        AgentRegistry::new(RegistryConfig {
            min_agents: 4,
            max_agents: 200,
            scale_up_threshold: 50,
            scale_down_threshold: 10,
        })
        .await,
    );
    let scaler = Arc::new(AutoScaler::new(registry.clone(), 50, 10));
    let gate = DecisionGate::new(24);
    let store = ProjectStore::new(dir.path());
    let cost_guard = CostGuard::with_backend(3600, Arc::new(SimulatedBackend));
    let dispatcher = Dispatcher::new(registry.clone(), cost_guard.clone(), Arc::new(LocalWorker));

    let state = AppState::new(
        registry,
        scaler,
        Arc::new(TaskDecomposer::new()),
        gate,
        store,
        cost_guard,
        dispatcher,
        Arc::new(OutputComposer::new()),
    )
    .unwrap();

    let server = ApiServer::new(&config, state);
    (dir, server.build_router())
}

async fn send(router: &Router, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-user-id", "test-user");
    let request = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            builder.body(Body::from(value.to_string())).unwrap()
        }
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_is_reachable_without_identity() {
    let (_dir, router) = test_router().await;
    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn endpoints_require_identity_header() {
    let (_dir, router) = test_router().await;
    let response = router
        .oneshot(Request::get("/agents").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn list_agents_returns_seeded_pool() {
    let (_dir, router) = test_router().await;
    let (status, body) = send(&router, "GET", "/agents", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["total_agents"], 4);
}

#[tokio::test]
async fn assign_task_matches_capability() {
    let (_dir, router) = test_router().await;
    let (status, body) = send(
        &router,
        "POST",
        "/task/assign",
        Some(json!({
            "task_type": "ingest",
            "capability": "data_ingestion",
            "priority": "high",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "assigned");
    assert!(body["agent_id"].is_string());
}

#[tokio::test]
async fn unknown_capability_is_bad_request() {
    let (_dir, router) = test_router().await;
    let (status, body) = send(
        &router,
        "POST",
        "/task/assign",
        Some(json!({
            "task_type": "ingest",
            "capability": "time_travel",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["detail"].as_str().unwrap().contains("capability"));
}

#[tokio::test]
async fn spawn_and_terminate_agent() {
    let (_dir, router) = test_router().await;
    let (status, body) = send(
        &router,
        "POST",
        "/agent/spawn",
        Some(json!({
            "agent_type": "content",
            "capabilities": ["content_generation"],
            "max_concurrent_tasks": 2,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let agent_id = body["agent_id"].as_str().unwrap().to_string();

    let (status, body) = send(&router, "DELETE", &format!("/agent/{agent_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, _) = send(&router, "DELETE", &format!("/agent/{agent_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scale_spawns_one_agent_per_ten_queued_tasks() {
    let (_dir, router) = test_router().await;
    let (status, body) = send(&router, "POST", "/scale", Some(json!({"queue_depth": 120}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"]["spawned"], 12);
    assert_eq!(body["stats"]["total_agents"], 16);
}

#[tokio::test]
async fn task_complete_records_and_rescales() {
    let (_dir, router) = test_router().await;
    let (_, assigned) = send(
        &router,
        "POST",
        "/task/assign",
        Some(json!({
            "task_type": "ingest",
            "capability": "data_ingestion",
        })),
    )
    .await;
    let task_id = assigned["task_id"].as_str().unwrap();
    let agent_id = assigned["agent_id"].as_str().unwrap();

    let (status, body) = send(
        &router,
        "POST",
        "/task/complete",
        Some(json!({
            "task_id": task_id,
            "agent_id": agent_id,
            "success": true,
            "processing_time": 1.0,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, stats) = send(&router, "GET", "/stats", None).await;
    assert_eq!(stats["registry"]["successful_tasks"], 1);
}

#[tokio::test]
async fn inference_serves_then_hits_cache() {
    let (_dir, router) = test_router().await;
    let request = json!({
        "prompt": "summarize the report",
        "model": "auto",
        "max_cost": 0.10,
        "priority": "critical",
    });

    let (status, body) = send(&router, "POST", "/inference", Some(request.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "local_inference");

    let (_, body) = send(&router, "POST", "/inference", Some(request)).await;
    assert_eq!(body["source"], "cache_hit");
    assert_eq!(body["cost"], 0.0);
}

#[tokio::test]
async fn inference_cost_cap_is_bad_request() {
    let (_dir, router) = test_router().await;
    let (status, body) = send(
        &router,
        "POST",
        "/inference",
        Some(json!({
            "prompt": "short",
            "model": "local",
            "max_cost": 0.000001,
            "priority": "critical",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn roi_endpoint_approves_and_rejects() {
    let (_dir, router) = test_router().await;
    let (status, body) = send(
        &router,
        "POST",
        "/roi/evaluate",
        Some(json!({
            "operation": "scrape",
            "estimated_cost": 0.1,
            "expected_value": 0.5,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"]["recommendation"], "approve");

    let (_, body) = send(
        &router,
        "POST",
        "/roi/evaluate",
        Some(json!({
            "operation": "scrape",
            "estimated_cost": 0.5,
            "expected_value": 0.1,
        })),
    )
    .await;
    assert_eq!(body["decision"]["recommendation"], "reject");
}

#[tokio::test]
async fn decompose_previews_plan() {
    let (_dir, router) = test_router().await;
    let (status, body) = send(
        &router,
        "POST",
        "/decompose",
        Some(json!({
            "goal": "research distributed schedulers and summarize the findings",
            "max_tasks": 50,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["total_tasks"].as_u64().unwrap() >= 1);
    assert!(body["stats"]["parallelizable"].as_u64().unwrap() >= 1);
    assert!(body["task_preview"].as_array().unwrap().len() <= 20);
}

#[tokio::test]
async fn chat_plans_then_approval_executes() {
    let (_dir, router) = test_router().await;
    let (status, body) = send(
        &router,
        "POST",
        "/chat",
        Some(json!({
            "message": "analyze our customer churn data and report the drivers",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requires_approval"], true);
    let action_id = body["action_id"].as_str().unwrap().to_string();

    // The decision shows up in the pending queue
    let (_, decisions) = send(&router, "GET", "/decisions", None).await;
    assert!(decisions["count"].as_u64().unwrap() >= 1);

    // Execution is blocked until approved; approving runs the plan
    let (status, body) = send(
        &router,
        "POST",
        "/approve",
        Some(json!({"action_id": action_id, "approved": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approved");
    assert_eq!(
        body["execution"]["workflow"]["status"], "completed",
        "workflow should complete: {body}"
    );
    assert_eq!(body["execution"]["composed"]["success"], true);
}

#[tokio::test]
async fn chat_rejection_discards_plan() {
    let (_dir, router) = test_router().await;
    let (_, body) = send(
        &router,
        "POST",
        "/chat",
        Some(json!({"message": "generate a launch image for the product"})),
    )
    .await;
    let action_id = body["action_id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        "POST",
        "/approve",
        Some(json!({"action_id": action_id, "approved": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "rejected");

    // Approving again is no longer possible
    let (status, _) = send(
        &router,
        "POST",
        "/approve",
        Some(json!({"action_id": action_id, "approved": true})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_small_talk_needs_no_approval() {
    let (_dir, router) = test_router().await;
    let (status, body) = send(
        &router,
        "POST",
        "/chat",
        Some(json!({"message": "hello there"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requires_approval"], false);
    assert!(body["response"].as_str().unwrap().contains("Hello"));
}

#[tokio::test]
async fn compose_endpoint_selects_best() {
    let (_dir, router) = test_router().await;
    let (status, body) = send(
        &router,
        "POST",
        "/compose",
        Some(json!({
            "strategy": "best",
            "outputs": [
                {"agent_id": "a", "agent_type": "w", "payload": "weak", "confidence": 0.3, "processing_time": 1.0},
                {"agent_id": "b", "agent_type": "w", "payload": "strong", "confidence": 0.9, "processing_time": 1.0},
            ],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["composed"]["outputs"][0]["agent_id"], "b");
}

#[tokio::test]
async fn project_budget_flow_over_http() {
    let (_dir, router) = test_router().await;
    let (_, body) = send(
        &router,
        "POST",
        "/projects",
        Some(json!({"name": "atlas", "total_budget": 10.0})),
    )
    .await;
    let project_id = body["project"]["id"].as_str().unwrap().to_string();

    let (_, body) = send(
        &router,
        "POST",
        &format!("/projects/{project_id}/budget/reserve"),
        Some(json!({"amount": 4.0})),
    )
    .await;
    assert_eq!(body["budget"]["remaining"], 6.0);

    let (status, body) = send(
        &router,
        "POST",
        &format!("/projects/{project_id}/budget/expense"),
        Some(json!({"amount": 7.0, "category": "compute"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);

    send(
        &router,
        "POST",
        &format!("/projects/{project_id}/budget/release"),
        Some(json!({"amount": 2.0})),
    )
    .await;

    let (status, body) = send(
        &router,
        "POST",
        &format!("/projects/{project_id}/budget/expense"),
        Some(json!({"amount": 7.0, "category": "compute"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["budget"]["spent"], 7.0);
    assert_eq!(body["budget"]["remaining"], 1.0);

    let (_, body) = send(
        &router,
        "GET",
        &format!("/projects/{project_id}/budget/transactions"),
        None,
    )
    .await;
    assert!(body["count"].as_u64().unwrap() >= 2);
}

#[tokio::test]
async fn project_memory_round_trip_over_http() {
    let (_dir, router) = test_router().await;
    let (_, body) = send(&router, "POST", "/projects", Some(json!({"name": "atlas"}))).await;
    let project_id = body["project"]["id"].as_str().unwrap().to_string();

    send(
        &router,
        "POST",
        &format!("/projects/{project_id}/memory"),
        Some(json!({"partition": "long_term", "key": "k", "value": {"n": 1}})),
    )
    .await;

    let (status, body) = send(
        &router,
        "GET",
        &format!("/projects/{project_id}/memory/long_term/k"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"]["n"], 1);

    // Sleep then wake preserves memory
    send(&router, "POST", &format!("/projects/{project_id}/sleep"), None).await;
    send(&router, "POST", &format!("/projects/{project_id}/wake"), None).await;
    let (_, body) = send(
        &router,
        "GET",
        &format!("/projects/{project_id}/memory/long_term/k"),
        None,
    )
    .await;
    assert_eq!(body["value"]["n"], 1);
}

#[tokio::test]
async fn cost_summary_and_cache_endpoints() {
    let (_dir, router) = test_router().await;
    send(
        &router,
        "POST",
        "/inference",
        Some(json!({"prompt": "short prompt", "model": "local", "priority": "critical"})),
    )
    .await;

    let (status, body) = send(&router, "GET", "/cost/summary?period_hours=24", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cost_summary"]["total_operations"], 1);

    let (_, body) = send(&router, "GET", "/cache/stats", None).await;
    assert_eq!(body["cache_stats"]["total_entries"], 1);

    let (_, body) = send(&router, "POST", "/cache/clear", Some(json!({}))).await;
    assert_eq!(body["entries_cleared"], 1);
}

#[tokio::test]
async fn oversized_message_is_rejected() {
    let (_dir, router) = test_router().await;
    let long = "x".repeat(crate::constants::MAX_TEXT_INPUT_LENGTH + 1);
    let (status, body) = send(&router, "POST", "/chat", Some(json!({"message": long}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}
