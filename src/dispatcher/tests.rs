use super::*;
use crate::config::RegistryConfig;
use crate::cost_guard::SimulatedBackend;
use crate::models::{Capability, Priority, RetryPolicy, BackoffKind};

async fn fixture(min: usize, max: usize) -> (Arc<AgentRegistry>, Arc<Dispatcher>) {
    let registry = Arc::new(
        AgentRegistry::new(RegistryConfig {
            min_agents: min,
            max_agents: max,
            scale_up_threshold: 50,
            scale_down_threshold: 10,
        })
        .await,
    );
    let cost_guard = CostGuard::with_backend(3600, Arc::new(SimulatedBackend));
    let dispatcher = Dispatcher::new(registry.clone(), cost_guard, Arc::new(LocalWorker));
    (registry, dispatcher)
}

fn task(id: &str, capability: Capability, deps: &[&str]) -> Task {
    let mut task = Task::new(capability.as_str(), capability, Priority::Normal)
        .with_dependencies(deps.iter().map(|s| s.to_string()).collect());
    task.id = id.to_string();
    task
}

fn failing(mut task: Task, max_attempts: u32) -> Task {
    task.parameters
        .insert("fail".to_string(), serde_json::json!(true));
    task.retry = RetryPolicy {
        max_attempts,
        backoff: BackoffKind::Exponential,
        attempt_timeout_secs: 5,
    };
    task
}

#[tokio::test]
async fn linear_dag_completes_in_order() {
    let (_registry, dispatcher) = fixture(4, 200).await;

    let tasks = vec![
        task("t1", Capability::DataIngestion, &[]),
        task("t2", Capability::BusinessAnalysis, &["t1"]),
        task("t3", Capability::ContentGeneration, &["t2"]),
    ];

    let report = dispatcher.run_workflow(tasks, None).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(!report.deadline_exceeded);
    assert_eq!(report.tasks.len(), 3);
    assert!(report.tasks.iter().all(|t| t.state == TaskState::Completed));
    // Outputs arrive in task-id order regardless of completion order
    let ids: Vec<String> = report
        .outputs
        .iter()
        .map(|o| o.payload["task_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["t1", "t2", "t3"]);
}

#[tokio::test]
async fn independent_tasks_run_in_parallel() {
    let (_registry, dispatcher) = fixture(4, 200).await;

    // Four 100ms tasks with no edges: parallel execution finishes well
    // under the 400ms a serial run would need.
    let tasks: Vec<Task> = (0..4)
        .map(|i| {
            let mut t = task(&format!("t{i}"), Capability::DataIngestion, &[]);
            t.parameters
                .insert("delay_ms".to_string(), serde_json::json!(100));
            t
        })
        .collect();

    let started = std::time::Instant::now();
    let report = dispatcher.run_workflow(tasks, None).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(
        elapsed < Duration::from_millis(350),
        "parallel tasks took {elapsed:?}"
    );
}

#[tokio::test]
async fn failed_root_skips_dependents() {
    let (_registry, dispatcher) = fixture(4, 200).await;

    // t1 -> t2, t1 -> t3; t1 exhausts its retries.
    let tasks = vec![
        failing(task("t1", Capability::DataIngestion, &[]), 2),
        task("t2", Capability::BusinessAnalysis, &["t1"]),
        task("t3", Capability::ContentGeneration, &["t1"]),
    ];

    let report = dispatcher.run_workflow(tasks, None).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::CompletedWithFailures);
    assert!(!report.deadline_exceeded);

    let by_id: HashMap<&str, &TaskReport> = report
        .tasks
        .iter()
        .map(|t| (t.task_id.as_str(), t))
        .collect();

    assert_eq!(by_id["t1"].state, TaskState::Failed);
    assert_eq!(by_id["t1"].attempts, 2);
    for dependent in ["t2", "t3"] {
        assert_eq!(by_id[dependent].state, TaskState::Cancelled);
        assert!(by_id[dependent]
            .error
            .as_deref()
            .unwrap()
            .contains("dependency failed"));
    }
    assert!(report.outputs.is_empty());
}

#[tokio::test]
async fn retry_recovers_agent_bookkeeping() {
    let (registry, dispatcher) = fixture(4, 200).await;

    let tasks = vec![failing(task("t1", Capability::DataIngestion, &[]), 1)];
    let report = dispatcher.run_workflow(tasks, None).await.unwrap();
    assert_eq!(report.tasks[0].state, TaskState::Failed);

    // The failing task released its agent and dented its score.
    let agent_id = report.tasks[0].agent_id.as_deref().unwrap();
    let agent = registry.get(agent_id).await.unwrap();
    assert!(agent.current_tasks.is_empty());
    assert_eq!(agent.tasks_failed, 1);
    assert!(agent.performance_score < 1.0);
}

#[tokio::test]
async fn workflow_deadline_reports_partial_results() {
    let (_registry, dispatcher) = fixture(4, 200).await;

    let mut slow = task("slow", Capability::DataIngestion, &[]);
    slow.parameters
        .insert("delay_ms".to_string(), serde_json::json!(5_000));
    let tasks = vec![slow, task("after", Capability::BusinessAnalysis, &["slow"])];

    let report = dispatcher.run_workflow(tasks, Some(1)).await.unwrap();
    assert!(report.deadline_exceeded);
    assert_eq!(report.status, WorkflowStatus::CompletedWithFailures);

    let by_id: HashMap<&str, &TaskReport> = report
        .tasks
        .iter()
        .map(|t| (t.task_id.as_str(), t))
        .collect();
    assert_eq!(by_id["slow"].state, TaskState::TimedOut);
    // No new assignments were issued after the deadline
    assert_eq!(by_id["after"].state, TaskState::Pending);
}

#[tokio::test]
async fn no_capacity_routes_to_overflow_queue() {
    // One agent slot total; the second capability cannot be served.
    let (_registry, dispatcher) = fixture(1, 1).await;

    let tasks = vec![task("t1", Capability::ContentGeneration, &[])];
    let report = dispatcher.run_workflow(tasks, None).await.unwrap();

    assert_eq!(report.tasks[0].state, TaskState::Queued);
    assert_eq!(dispatcher.overflow_depth().await, 1);
}

#[tokio::test]
async fn duplicate_and_forward_dependencies_are_rejected() {
    let (_registry, dispatcher) = fixture(4, 200).await;

    let dup = vec![
        task("t1", Capability::DataIngestion, &[]),
        task("t1", Capability::DataIngestion, &[]),
    ];
    assert!(dispatcher.run_workflow(dup, None).await.is_err());

    let forward = vec![
        task("t1", Capability::DataIngestion, &["t2"]),
        task("t2", Capability::DataIngestion, &[]),
    ];
    assert!(dispatcher.run_workflow(forward, None).await.is_err());
}

#[tokio::test]
async fn completion_precedes_dependent_assignment() {
    let (registry, dispatcher) = fixture(4, 200).await;

    let tasks = vec![
        task("u", Capability::DataIngestion, &[]),
        task("v", Capability::BusinessAnalysis, &["u"]),
    ];
    let report = dispatcher.run_workflow(tasks, None).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    // Both agents saw exactly one completion each.
    let u_agent = report.tasks[0].agent_id.as_deref().unwrap();
    let v_agent = report.tasks[1].agent_id.as_deref().unwrap();
    assert_eq!(registry.get(u_agent).await.unwrap().tasks_completed, 1);
    assert_eq!(registry.get(v_agent).await.unwrap().tasks_completed, 1);
}

#[tokio::test]
async fn history_sweep_respects_retention() {
    let (_registry, dispatcher) = fixture(4, 200).await;
    let tasks = vec![task("t1", Capability::DataIngestion, &[])];
    dispatcher.run_workflow(tasks, None).await.unwrap();

    assert_eq!(dispatcher.recent_workflows().await.len(), 1);
    // Fresh records survive the sweep
    assert_eq!(dispatcher.sweep_history().await, 0);
    assert_eq!(dispatcher.recent_workflows().await.len(), 1);
}
