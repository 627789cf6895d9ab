//! Project cortex: per-project isolated memory, goals, agent assignments,
//! and budget enforcement.
//!
//! The store owns all projects. Each project is guarded by its own lock;
//! the outer map lock is held only to resolve ids. No lock is ever held
//! across disk I/O: persisted state is cloned out first and written after
//! release, and a failed write is reported, not retried.

pub mod budget;
pub mod memory;

use crate::{FabricError, Result};
use budget::{Budget, BudgetAlert, BudgetSummary, Transaction};
use memory::{Importance, MemoryPartition, PersistedMemory, ProjectMemory};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Sleeping,
    Paused,
    Completed,
    Archived,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub memory: ProjectMemory,
    pub goals: BTreeSet<String>,
    pub agent_assignments: Vec<String>,
    pub budget: Option<Budget>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// External view of a project; memory and budget stay behind the store API.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub goals: Vec<String>,
    pub agent_assignments: Vec<String>,
    pub has_budget: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Project {
    fn summary(&self) -> ProjectSummary {
        ProjectSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            goals: self.goals.iter().cloned().collect(),
            agent_assignments: self.agent_assignments.clone(),
            has_budget: self.budget.is_some(),
            created_at: self.created_at,
        }
    }
}

/// Receives budget alerts as thresholds fire. The default sink logs them.
pub type AlertSink = Arc<dyn Fn(BudgetAlert) + Send + Sync>;

pub struct ProjectStore {
    projects: RwLock<HashMap<String, Arc<Mutex<Project>>>>,
    data_dir: PathBuf,
    alert_sink: AlertSink,
}

impl ProjectStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            projects: RwLock::new(HashMap::new()),
            data_dir: data_dir.into(),
            alert_sink: Arc::new(|alert: BudgetAlert| {
                warn!(
                    "Budget alert for project {}: {:.0}% threshold reached ({:.2}/{:.2})",
                    alert.project_id,
                    alert.threshold * 100.0,
                    alert.spent,
                    alert.total
                );
            }),
        })
    }

    pub fn with_alert_sink(data_dir: impl Into<PathBuf>, sink: AlertSink) -> Arc<Self> {
        Arc::new(Self {
            projects: RwLock::new(HashMap::new()),
            data_dir: data_dir.into(),
            alert_sink: sink,
        })
    }

    async fn resolve(&self, project_id: &str) -> Result<Arc<Mutex<Project>>> {
        let projects = self.projects.read().await;
        projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| FabricError::NotFound(format!("project {project_id}")))
    }

    pub async fn create(&self, name: &str, total_budget: Option<f64>) -> Result<ProjectSummary> {
        let id = Uuid::new_v4().to_string();
        let project = Project {
            id: id.clone(),
            name: name.to_string(),
            status: ProjectStatus::Active,
            memory: self.load_memory(&id).await,
            goals: BTreeSet::new(),
            agent_assignments: Vec::new(),
            budget: total_budget.map(|total| Budget::new(total, "USD")),
            created_at: chrono::Utc::now(),
        };
        let summary = project.summary();

        let mut projects = self.projects.write().await;
        projects.insert(id.clone(), Arc::new(Mutex::new(project)));
        info!("Created project {id} ({name})");
        Ok(summary)
    }

    pub async fn get(&self, project_id: &str) -> Result<ProjectSummary> {
        let handle = self.resolve(project_id).await?;
        let project = handle.lock().await;
        Ok(project.summary())
    }

    pub async fn list(&self) -> Vec<ProjectSummary> {
        let handles: Vec<Arc<Mutex<Project>>> = {
            let projects = self.projects.read().await;
            projects.values().cloned().collect()
        };
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.lock().await.summary());
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Active -> Sleeping. Memory and budget are preserved exactly.
    pub async fn sleep(&self, project_id: &str) -> Result<ProjectSummary> {
        self.transition(project_id, ProjectStatus::Active, ProjectStatus::Sleeping)
            .await
    }

    /// Sleeping -> Active.
    pub async fn wake(&self, project_id: &str) -> Result<ProjectSummary> {
        self.transition(project_id, ProjectStatus::Sleeping, ProjectStatus::Active)
            .await
    }

    async fn transition(
        &self,
        project_id: &str,
        from: ProjectStatus,
        to: ProjectStatus,
    ) -> Result<ProjectSummary> {
        let handle = self.resolve(project_id).await?;
        let mut project = handle.lock().await;
        if project.status != from {
            return Err(FabricError::InvalidInput(format!(
                "project {project_id} is {:?}, expected {from:?}",
                project.status
            )));
        }
        project.status = to;
        Ok(project.summary())
    }

    pub async fn update_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
    ) -> Result<ProjectSummary> {
        let handle = self.resolve(project_id).await?;
        let mut project = handle.lock().await;
        project.status = status;
        Ok(project.summary())
    }

    pub async fn add_goal(&self, project_id: &str, goal: &str) -> Result<()> {
        let handle = self.resolve(project_id).await?;
        let mut project = handle.lock().await;
        project.goals.insert(goal.to_string());
        Ok(())
    }

    /// Projects reference agents by id only; the registry stays the sole
    /// owner of agent state.
    pub async fn assign_agent(&self, project_id: &str, agent_id: &str) -> Result<()> {
        let handle = self.resolve(project_id).await?;
        let mut project = handle.lock().await;
        if !project.agent_assignments.iter().any(|a| a == agent_id) {
            project.agent_assignments.push(agent_id.to_string());
        }
        Ok(())
    }

    pub async fn unassign_agent(&self, project_id: &str, agent_id: &str) -> Result<()> {
        let handle = self.resolve(project_id).await?;
        let mut project = handle.lock().await;
        project.agent_assignments.retain(|a| a != agent_id);
        Ok(())
    }

    // ---- memory ----

    pub async fn memory_put(
        &self,
        project_id: &str,
        partition: MemoryPartition,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let handle = self.resolve(project_id).await?;
        let persisted = {
            let mut project = handle.lock().await;
            project.memory.put(partition, key, value);
            (partition == MemoryPartition::LongTerm).then(|| project.memory.to_persisted())
        };
        if let Some(persisted) = persisted {
            self.persist_memory(project_id, &persisted).await?;
        }
        Ok(())
    }

    pub async fn memory_get(
        &self,
        project_id: &str,
        partition: MemoryPartition,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let handle = self.resolve(project_id).await?;
        let mut project = handle.lock().await;
        Ok(project.memory.get(partition, key))
    }

    pub async fn memory_delete(
        &self,
        project_id: &str,
        partition: MemoryPartition,
        key: &str,
    ) -> Result<bool> {
        let handle = self.resolve(project_id).await?;
        let (removed, persisted) = {
            let mut project = handle.lock().await;
            let removed = project.memory.delete(partition, key);
            let persisted = (removed && partition == MemoryPartition::LongTerm)
                .then(|| project.memory.to_persisted());
            (removed, persisted)
        };
        if let Some(persisted) = persisted {
            self.persist_memory(project_id, &persisted).await?;
        }
        Ok(removed)
    }

    pub async fn clear_short_term(&self, project_id: &str) -> Result<usize> {
        let handle = self.resolve(project_id).await?;
        let mut project = handle.lock().await;
        Ok(project.memory.clear_short_term())
    }

    pub async fn add_history(
        &self,
        project_id: &str,
        event_type: &str,
        data: serde_json::Value,
        importance: Importance,
    ) -> Result<()> {
        let handle = self.resolve(project_id).await?;
        let persisted = {
            let mut project = handle.lock().await;
            project.memory.add_history(event_type, data, importance);
            project.memory.to_persisted()
        };
        self.persist_memory(project_id, &persisted).await
    }

    // ---- budget ----

    pub async fn budget_create(
        &self,
        project_id: &str,
        total: f64,
        currency: &str,
    ) -> Result<BudgetSummary> {
        let handle = self.resolve(project_id).await?;
        let (summary, budget) = {
            let mut project = handle.lock().await;
            let budget = Budget::new(total, currency);
            let summary = budget.summary();
            project.budget = Some(budget.clone());
            (summary, budget)
        };
        self.persist_budget(project_id, &budget).await?;
        Ok(summary)
    }

    pub async fn record_expense(
        &self,
        project_id: &str,
        amount: f64,
        category: &str,
        description: &str,
    ) -> Result<BudgetSummary> {
        let handle = self.resolve(project_id).await?;
        let (summary, fired, budget) = {
            let mut project = handle.lock().await;
            let budget = project
                .budget
                .as_mut()
                .ok_or_else(|| FabricError::NotFound(format!("budget for project {project_id}")))?;
            let fired = budget.record_expense(amount, category, description)?;
            (budget.summary(), fired, budget.clone())
        };

        for threshold in fired {
            (self.alert_sink)(BudgetAlert {
                project_id: project_id.to_string(),
                threshold,
                spent: summary.spent,
                total: summary.total,
            });
        }

        self.persist_budget(project_id, &budget).await?;
        Ok(summary)
    }

    pub async fn add_budget(
        &self,
        project_id: &str,
        amount: f64,
        description: &str,
    ) -> Result<BudgetSummary> {
        let handle = self.resolve(project_id).await?;
        let (summary, budget) = {
            let mut project = handle.lock().await;
            let budget = project
                .budget
                .as_mut()
                .ok_or_else(|| FabricError::NotFound(format!("budget for project {project_id}")))?;
            budget.add(amount, description);
            (budget.summary(), budget.clone())
        };
        self.persist_budget(project_id, &budget).await?;
        Ok(summary)
    }

    pub async fn reserve(&self, project_id: &str, amount: f64) -> Result<BudgetSummary> {
        let handle = self.resolve(project_id).await?;
        let (summary, budget) = {
            let mut project = handle.lock().await;
            let budget = project
                .budget
                .as_mut()
                .ok_or_else(|| FabricError::NotFound(format!("budget for project {project_id}")))?;
            budget.reserve(amount)?;
            (budget.summary(), budget.clone())
        };
        self.persist_budget(project_id, &budget).await?;
        Ok(summary)
    }

    pub async fn release(&self, project_id: &str, amount: f64) -> Result<BudgetSummary> {
        let handle = self.resolve(project_id).await?;
        let (summary, budget) = {
            let mut project = handle.lock().await;
            let budget = project
                .budget
                .as_mut()
                .ok_or_else(|| FabricError::NotFound(format!("budget for project {project_id}")))?;
            budget.release(amount)?;
            (budget.summary(), budget.clone())
        };
        self.persist_budget(project_id, &budget).await?;
        Ok(summary)
    }

    pub async fn budget_summary(&self, project_id: &str) -> Result<BudgetSummary> {
        let handle = self.resolve(project_id).await?;
        let project = handle.lock().await;
        project
            .budget
            .as_ref()
            .map(|b| b.summary())
            .ok_or_else(|| FabricError::NotFound(format!("budget for project {project_id}")))
    }

    pub async fn transaction_history(
        &self,
        project_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Transaction>> {
        let handle = self.resolve(project_id).await?;
        let project = handle.lock().await;
        project
            .budget
            .as_ref()
            .map(|b| b.history(limit).to_vec())
            .ok_or_else(|| FabricError::NotFound(format!("budget for project {project_id}")))
    }

    // ---- persistence ----

    fn project_dir(&self, project_id: &str) -> PathBuf {
        self.data_dir.join("projects").join(project_id)
    }

    async fn persist_memory(&self, project_id: &str, persisted: &PersistedMemory) -> Result<()> {
        let dir = self.project_dir(project_id);
        let payload = serde_json::to_vec_pretty(persisted)?;
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!("Failed to create project dir for {project_id}: {e}");
            return Err(FabricError::Internal(e.into()));
        }
        if let Err(e) = tokio::fs::write(dir.join("memory.json"), payload).await {
            error!("Failed to persist memory for {project_id}: {e}");
            return Err(FabricError::Internal(e.into()));
        }
        Ok(())
    }

    async fn persist_budget(&self, project_id: &str, budget: &Budget) -> Result<()> {
        let dir = self.project_dir(project_id);
        let payload = serde_json::to_vec_pretty(budget)?;
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!("Failed to create project dir for {project_id}: {e}");
            return Err(FabricError::Internal(e.into()));
        }
        if let Err(e) = tokio::fs::write(dir.join("budget.json"), payload).await {
            error!("Failed to persist budget for {project_id}: {e}");
            return Err(FabricError::Internal(e.into()));
        }
        Ok(())
    }

    async fn load_memory(&self, project_id: &str) -> ProjectMemory {
        let path = self.project_dir(project_id).join("memory.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<PersistedMemory>(&bytes) {
                Ok(persisted) => ProjectMemory::restore(persisted),
                Err(e) => {
                    warn!("Corrupt memory document for {project_id}: {e}");
                    ProjectMemory::new()
                }
            },
            Err(_) => ProjectMemory::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn store() -> (TempDir, Arc<ProjectStore>) {
        let dir = TempDir::new().unwrap();
        let store = ProjectStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn create_and_get_project() {
        let (_dir, store) = store();
        let created = store.create("atlas", None).await.unwrap();
        assert_eq!(created.status, ProjectStatus::Active);

        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(fetched.name, "atlas");

        let missing = store.get("nope").await;
        assert!(matches!(missing, Err(FabricError::NotFound(_))));
    }

    #[tokio::test]
    async fn sleep_wake_round_trip_preserves_state() {
        let (_dir, store) = store();
        let project = store.create("atlas", Some(10.0)).await.unwrap();
        store
            .memory_put(&project.id, MemoryPartition::LongTerm, "k", json!("v"))
            .await
            .unwrap();

        let slept = store.sleep(&project.id).await.unwrap();
        assert_eq!(slept.status, ProjectStatus::Sleeping);

        // Sleeping a sleeping project is invalid
        assert!(store.sleep(&project.id).await.is_err());

        let woken = store.wake(&project.id).await.unwrap();
        assert_eq!(woken.status, ProjectStatus::Active);

        // Memory and budget survive the round trip untouched
        let value = store
            .memory_get(&project.id, MemoryPartition::LongTerm, "k")
            .await
            .unwrap();
        assert_eq!(value, Some(json!("v")));
        let budget = store.budget_summary(&project.id).await.unwrap();
        assert_eq!(budget.total, 10.0);
        assert_eq!(budget.spent, 0.0);
    }

    #[tokio::test]
    async fn budget_scenario_reserve_release_expense() {
        let (_dir, store) = store();
        let project = store.create("atlas", Some(10.0)).await.unwrap();

        store.reserve(&project.id, 4.0).await.unwrap();
        let summary = store.budget_summary(&project.id).await.unwrap();
        assert_eq!(summary.reserved, 4.0);
        assert_eq!(summary.remaining, 6.0);

        let rejected = store.record_expense(&project.id, 7.0, "compute", "").await;
        assert!(matches!(
            rejected,
            Err(FabricError::InsufficientFunds { .. })
        ));

        store.release(&project.id, 2.0).await.unwrap();
        let summary = store.record_expense(&project.id, 7.0, "compute", "").await.unwrap();
        assert_eq!(summary.spent, 7.0);
        assert_eq!(summary.remaining, 1.0);
        assert_eq!(summary.reserved, 2.0);
    }

    #[tokio::test]
    async fn alerts_reach_the_sink_once() {
        let dir = TempDir::new().unwrap();
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let store = ProjectStore::with_alert_sink(
            dir.path(),
            Arc::new(|_alert| {
                FIRED.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let project = store.create("atlas", Some(10.0)).await.unwrap();
        store
            .record_expense(&project.id, 6.0, "general", "")
            .await
            .unwrap();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1); // 50%

        store
            .record_expense(&project.id, 1.0, "general", "")
            .await
            .unwrap();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1); // no new threshold
    }

    #[tokio::test]
    async fn memory_persists_to_project_document() {
        let dir = TempDir::new().unwrap();
        let store = ProjectStore::new(dir.path());
        let project = store.create("atlas", None).await.unwrap();

        store
            .memory_put(&project.id, MemoryPartition::LongTerm, "k", json!(42))
            .await
            .unwrap();

        let path = dir
            .path()
            .join("projects")
            .join(&project.id)
            .join("memory.json");
        let bytes = std::fs::read(path).unwrap();
        let persisted: PersistedMemory = serde_json::from_slice(&bytes).unwrap();
        assert!(persisted.long_term.contains_key("k"));
    }

    #[tokio::test]
    async fn short_term_memory_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let store = ProjectStore::new(dir.path());
        let project = store.create("atlas", None).await.unwrap();

        store
            .memory_put(&project.id, MemoryPartition::ShortTerm, "scratch", json!(1))
            .await
            .unwrap();

        let path = dir
            .path()
            .join("projects")
            .join(&project.id)
            .join("memory.json");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn agent_assignment_is_idempotent() {
        let (_dir, store) = store();
        let project = store.create("atlas", None).await.unwrap();

        store.assign_agent(&project.id, "agent-1").await.unwrap();
        store.assign_agent(&project.id, "agent-1").await.unwrap();
        let summary = store.get(&project.id).await.unwrap();
        assert_eq!(summary.agent_assignments.len(), 1);

        store.unassign_agent(&project.id, "agent-1").await.unwrap();
        let summary = store.get(&project.id).await.unwrap();
        assert!(summary.agent_assignments.is_empty());
    }

    #[tokio::test]
    async fn transaction_history_records_every_movement() {
        let (_dir, store) = store();
        let project = store.create("atlas", Some(10.0)).await.unwrap();
        store
            .record_expense(&project.id, 1.0, "api", "call")
            .await
            .unwrap();
        store.add_budget(&project.id, 5.0, "top up").await.unwrap();

        let history = store.transaction_history(&project.id, None).await.unwrap();
        // initial allocation + expense + allocation
        assert_eq!(history.len(), 3);

        let limited = store
            .transaction_history(&project.id, Some(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].description, "top up");
    }
}
