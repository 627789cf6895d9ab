//! Decision gate: criticality classification, rule-chain evaluation, and the
//! human approval queue with lazy expiry.

pub mod rules;

use crate::{
    constants::ACTION_ID_HEX_LEN,
    models::{ActionKind, Criticality},
    FabricError, Result,
};
use rules::{ChainVerdict, GateRule, RuleChain};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// Decision lifecycle status.
///
/// Low-criticality decisions are AutoApproved at creation. Critical
/// decisions never reach Executing without an explicit approve inside the
/// approval window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    PendingApproval,
    AutoApproved,
    Approved,
    Rejected,
    Executing,
    Completed,
    Expired,
}

/// One action a decision proposes to take.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub action_id: String,
    pub action_type: String,
    pub description: String,
    pub criticality: Criticality,
    pub proposed_actions: Vec<ProposedAction>,
    pub estimated_cost: f64,
    pub estimated_duration_secs: u64,
    pub status: DecisionStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub approved_at: Option<chrono::DateTime<chrono::Utc>>,
    pub executed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub rule_trace: Vec<rules::RuleTraceEntry>,
}

/// The subset of a decision shown to human reviewers.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalView {
    pub action_id: String,
    pub operation_type: String,
    pub risk_level: Criticality,
    pub reason: String,
    pub estimated_cost: f64,
    pub estimated_duration_secs: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub status: DecisionStatus,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DecisionStats {
    pub pending: usize,
    pub auto_approved: usize,
    pub approved: usize,
    pub rejected: usize,
    pub expired: usize,
    pub completed: usize,
}

/// Receipt returned when an approved decision begins executing.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReceipt {
    pub action_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub struct DecisionGate {
    decisions: Mutex<HashMap<String, Decision>>,
    rules: RwLock<RuleChain>,
    approval_timeout: chrono::Duration,
}

impl DecisionGate {
    pub fn new(approval_timeout_hours: i64) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(HashMap::new()),
            rules: RwLock::new(RuleChain::new()),
            approval_timeout: chrono::Duration::hours(approval_timeout_hours),
        })
    }

    pub async fn add_rule(&self, rule: GateRule) {
        self.rules.write().await.add(rule);
    }

    pub async fn remove_rule(&self, rule_id: &str) -> bool {
        self.rules.write().await.remove(rule_id)
    }

    pub async fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        self.rules.write().await.set_enabled(rule_id, enabled)
    }

    /// Classify a request into a decision.
    ///
    /// The rule chain runs at creation; a rejecting chain yields a Rejected
    /// decision with its trace attached. Otherwise Low criticality (including
    /// an empty action list) auto-approves and everything else awaits a
    /// human.
    pub async fn analyze(
        &self,
        user_input: &str,
        action_type: &str,
        proposed_actions: Vec<ProposedAction>,
    ) -> Result<Decision> {
        let criticality = proposed_actions
            .iter()
            .map(|a| a.kind.criticality())
            .max()
            .unwrap_or(Criticality::Low);

        let estimated_cost: f64 = proposed_actions.iter().map(|a| a.kind.estimated_cost()).sum();
        let estimated_duration_secs: u64 = proposed_actions
            .iter()
            .map(|a| a.kind.estimated_duration_secs())
            .sum();

        let created_at = chrono::Utc::now();
        let action_id = Self::action_id(user_input, &proposed_actions, created_at)?;

        let context = serde_json::json!({
            "user_input": user_input,
            "action_type": action_type,
            "criticality": criticality,
            "estimated_cost": estimated_cost,
            "estimated_duration_secs": estimated_duration_secs,
            "actions": &proposed_actions,
        });
        let verdict: ChainVerdict = self.rules.read().await.evaluate(&context);

        let status = if !verdict.approved {
            DecisionStatus::Rejected
        } else if criticality == Criticality::Low {
            DecisionStatus::AutoApproved
        } else {
            DecisionStatus::PendingApproval
        };

        let description = Self::describe(&proposed_actions);
        let decision = Decision {
            action_id: action_id.clone(),
            action_type: action_type.to_string(),
            description,
            criticality,
            proposed_actions,
            estimated_cost: (estimated_cost * 10_000.0).round() / 10_000.0,
            estimated_duration_secs,
            status,
            created_at,
            approved_at: if status == DecisionStatus::AutoApproved {
                Some(created_at)
            } else {
                None
            },
            executed_at: None,
            rule_trace: verdict.trace,
        };

        match status {
            DecisionStatus::AutoApproved => {
                info!("Auto-approved low criticality action: {action_id}")
            }
            DecisionStatus::Rejected => info!(
                "Rule chain rejected action {action_id} ({})",
                verdict.rejected_by.as_deref().unwrap_or("unknown rule")
            ),
            _ => info!("Action {action_id} awaiting approval ({criticality:?})"),
        }

        let mut decisions = self.decisions.lock().await;
        decisions.insert(action_id, decision.clone());
        Ok(decision)
    }

    /// Deterministic id: SHA-256 over input, serialized actions, and the
    /// creation timestamp, truncated to 16 hex chars.
    fn action_id(
        user_input: &str,
        actions: &[ProposedAction],
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(user_input.as_bytes());
        hasher.update(serde_json::to_vec(actions)?);
        hasher.update(created_at.to_rfc3339().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Ok(digest[..ACTION_ID_HEX_LEN].to_string())
    }

    fn describe(actions: &[ProposedAction]) -> String {
        actions
            .iter()
            .enumerate()
            .map(|(i, a)| {
                if a.description.is_empty() {
                    format!("{}. {:?}", i + 1, a.kind)
                } else {
                    format!("{}. {}", i + 1, a.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// A PendingApproval decision past the timeout flips to Expired the
    /// first time anyone looks at it.
    fn expire_if_stale(&self, decision: &mut Decision) {
        if decision.status == DecisionStatus::PendingApproval
            && chrono::Utc::now() > decision.created_at + self.approval_timeout
        {
            decision.status = DecisionStatus::Expired;
            info!("Decision expired: {}", decision.action_id);
        }
    }

    pub async fn get(&self, action_id: &str) -> Option<Decision> {
        let mut decisions = self.decisions.lock().await;
        let decision = decisions.get_mut(action_id)?;
        self.expire_if_stale(decision);
        Some(decision.clone())
    }

    /// Apply an explicit human verdict. Expired requests report their new
    /// state instead of erroring.
    pub async fn resolve(&self, action_id: &str, approved: bool) -> Result<DecisionStatus> {
        let mut decisions = self.decisions.lock().await;
        let decision = decisions
            .get_mut(action_id)
            .ok_or_else(|| FabricError::NotFound(format!("decision {action_id}")))?;

        self.expire_if_stale(decision);

        match decision.status {
            DecisionStatus::PendingApproval => {
                decision.status = if approved {
                    DecisionStatus::Approved
                } else {
                    DecisionStatus::Rejected
                };
                decision.approved_at = approved.then(chrono::Utc::now);
                info!(
                    "Decision {} {}",
                    action_id,
                    if approved { "approved" } else { "rejected" }
                );
                Ok(decision.status)
            }
            // Already expired (possibly just now): surface the state.
            DecisionStatus::Expired => Ok(DecisionStatus::Expired),
            status => Err(FabricError::InvalidInput(format!(
                "decision {action_id} is not awaiting approval (status {status:?})"
            ))),
        }
    }

    /// Begin executing a decision. Only AutoApproved and Approved decisions
    /// may execute; everything else is a policy rejection.
    pub async fn execute(&self, action_id: &str) -> Result<ExecutionReceipt> {
        let mut decisions = self.decisions.lock().await;
        let decision = decisions
            .get_mut(action_id)
            .ok_or_else(|| FabricError::NotFound(format!("decision {action_id}")))?;

        self.expire_if_stale(decision);

        match decision.status {
            DecisionStatus::AutoApproved | DecisionStatus::Approved => {
                let started_at = chrono::Utc::now();
                decision.status = DecisionStatus::Executing;
                decision.executed_at = Some(started_at);
                Ok(ExecutionReceipt {
                    action_id: action_id.to_string(),
                    started_at,
                })
            }
            status => Err(FabricError::Forbidden(format!(
                "decision {action_id} not approved for execution (status {status:?})"
            ))),
        }
    }

    /// Mark an executing decision finished.
    pub async fn complete(&self, action_id: &str) -> Result<()> {
        let mut decisions = self.decisions.lock().await;
        let decision = decisions
            .get_mut(action_id)
            .ok_or_else(|| FabricError::NotFound(format!("decision {action_id}")))?;

        if decision.status != DecisionStatus::Executing {
            return Err(FabricError::InvalidInput(format!(
                "decision {action_id} is not executing"
            )));
        }
        decision.status = DecisionStatus::Completed;
        Ok(())
    }

    /// All decisions still awaiting a human, oldest first.
    pub async fn pending(&self) -> Vec<ApprovalView> {
        let mut decisions = self.decisions.lock().await;
        let timeout = self.approval_timeout;
        let mut views: Vec<ApprovalView> = decisions
            .values_mut()
            .filter_map(|d| {
                self.expire_if_stale(d);
                (d.status == DecisionStatus::PendingApproval).then(|| ApprovalView {
                    action_id: d.action_id.clone(),
                    operation_type: d.action_type.clone(),
                    risk_level: d.criticality,
                    reason: d.description.clone(),
                    estimated_cost: d.estimated_cost,
                    estimated_duration_secs: d.estimated_duration_secs,
                    created_at: d.created_at,
                    expires_at: d.created_at + timeout,
                    status: d.status,
                })
            })
            .collect();
        views.sort_by_key(|v| v.created_at);
        views
    }

    /// Sweep every stale pending decision. Returns the number expired.
    pub async fn cleanup_expired(&self) -> usize {
        let mut decisions = self.decisions.lock().await;
        let mut expired = 0;
        for decision in decisions.values_mut() {
            if decision.status == DecisionStatus::PendingApproval {
                self.expire_if_stale(decision);
                if decision.status == DecisionStatus::Expired {
                    expired += 1;
                }
            }
        }
        expired
    }

    pub async fn stats(&self) -> DecisionStats {
        let decisions = self.decisions.lock().await;
        let mut stats = DecisionStats::default();
        for d in decisions.values() {
            match d.status {
                DecisionStatus::PendingApproval => stats.pending += 1,
                DecisionStatus::AutoApproved => stats.auto_approved += 1,
                DecisionStatus::Approved | DecisionStatus::Executing => stats.approved += 1,
                DecisionStatus::Rejected => stats.rejected += 1,
                DecisionStatus::Expired => stats.expired += 1,
                DecisionStatus::Completed => stats.completed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rules::RulePriority;

    fn action(kind: ActionKind) -> ProposedAction {
        ProposedAction {
            kind,
            description: String::new(),
            parameters: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn low_criticality_auto_approves() {
        let gate = DecisionGate::new(24);
        let decision = gate
            .analyze("look something up", "query", vec![action(ActionKind::DataQuery)])
            .await
            .unwrap();

        assert_eq!(decision.criticality, Criticality::Low);
        assert_eq!(decision.status, DecisionStatus::AutoApproved);
        assert!(decision.approved_at.is_some());

        // Executable without human input
        gate.execute(&decision.action_id).await.unwrap();
    }

    #[tokio::test]
    async fn zero_actions_is_low_and_auto_approved() {
        let gate = DecisionGate::new(24);
        let decision = gate.analyze("noop", "noop", vec![]).await.unwrap();
        assert_eq!(decision.criticality, Criticality::Low);
        assert_eq!(decision.status, DecisionStatus::AutoApproved);
    }

    #[tokio::test]
    async fn criticality_is_max_over_actions() {
        let gate = DecisionGate::new(24);
        let decision = gate
            .analyze(
                "wipe and refetch",
                "maintenance",
                vec![action(ActionKind::DataQuery), action(ActionKind::DataDeletion)],
            )
            .await
            .unwrap();

        assert_eq!(decision.criticality, Criticality::Critical);
        assert_eq!(decision.status, DecisionStatus::PendingApproval);
    }

    #[tokio::test]
    async fn execute_requires_approval() {
        let gate = DecisionGate::new(24);
        let decision = gate
            .analyze("delete the archive", "maintenance", vec![action(ActionKind::DataDeletion)])
            .await
            .unwrap();

        // Not yet approved
        let result = gate.execute(&decision.action_id).await;
        assert!(matches!(result, Err(FabricError::Forbidden(_))));

        // Approve, then execution is permitted
        let status = gate.resolve(&decision.action_id, true).await.unwrap();
        assert_eq!(status, DecisionStatus::Approved);
        gate.execute(&decision.action_id).await.unwrap();
        gate.complete(&decision.action_id).await.unwrap();

        let finished = gate.get(&decision.action_id).await.unwrap();
        assert_eq!(finished.status, DecisionStatus::Completed);
    }

    #[tokio::test]
    async fn rejection_blocks_execution() {
        let gate = DecisionGate::new(24);
        let decision = gate
            .analyze("run the script", "ops", vec![action(ActionKind::CodeExecution)])
            .await
            .unwrap();

        let status = gate.resolve(&decision.action_id, false).await.unwrap();
        assert_eq!(status, DecisionStatus::Rejected);

        let result = gate.execute(&decision.action_id).await;
        assert!(matches!(result, Err(FabricError::Forbidden(_))));
    }

    #[tokio::test]
    async fn stale_pending_decision_expires_on_access() {
        // Zero-hour window: pending decisions are immediately stale.
        let gate = DecisionGate::new(0);
        let decision = gate
            .analyze("call the api", "integration", vec![action(ActionKind::ExternalApiCall)])
            .await
            .unwrap();
        assert_eq!(decision.status, DecisionStatus::PendingApproval);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // Approval of an expired request reports Expired rather than erroring
        let status = gate.resolve(&decision.action_id, true).await.unwrap();
        assert_eq!(status, DecisionStatus::Expired);

        let result = gate.execute(&decision.action_id).await;
        assert!(matches!(result, Err(FabricError::Forbidden(_))));
    }

    #[tokio::test]
    async fn rule_chain_rejection_records_trace() {
        let gate = DecisionGate::new(24);
        gate.add_rule(GateRule::new("deny-expensive", RulePriority::Critical, |ctx| {
            Ok(ctx["estimated_cost"].as_f64().unwrap_or(0.0) < 0.10)
        }))
        .await;

        let decision = gate
            .analyze(
                "render a video",
                "media",
                vec![action(ActionKind::VideoGeneration)],
            )
            .await
            .unwrap();

        assert_eq!(decision.status, DecisionStatus::Rejected);
        assert_eq!(decision.rule_trace.len(), 1);
        assert_eq!(decision.rule_trace[0].result, "rejected");
    }

    #[tokio::test]
    async fn cost_and_duration_are_additive() {
        let gate = DecisionGate::new(24);
        let decision = gate
            .analyze(
                "make media",
                "media",
                vec![
                    action(ActionKind::ImageGeneration),
                    action(ActionKind::VideoGeneration),
                    action(ActionKind::LlmInference),
                ],
            )
            .await
            .unwrap();

        assert!((decision.estimated_cost - 0.342).abs() < 1e-9);
        assert_eq!(decision.estimated_duration_secs, 36);
    }

    #[tokio::test]
    async fn pending_view_is_oldest_first_with_expiry_stamp() {
        let gate = DecisionGate::new(24);
        let first = gate
            .analyze("a", "ops", vec![action(ActionKind::CodeExecution)])
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = gate
            .analyze("b", "ops", vec![action(ActionKind::CodeExecution)])
            .await
            .unwrap();

        let pending = gate.pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].action_id, first.action_id);
        assert_eq!(pending[1].action_id, second.action_id);
        assert_eq!(
            pending[0].expires_at,
            pending[0].created_at + chrono::Duration::hours(24)
        );
    }

    #[tokio::test]
    async fn cleanup_sweeps_stale_decisions() {
        let gate = DecisionGate::new(0);
        for input in ["x", "y", "z"] {
            gate.analyze(input, "ops", vec![action(ActionKind::CodeExecution)])
                .await
                .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert_eq!(gate.cleanup_expired().await, 3);
        assert_eq!(gate.stats().await.expired, 3);
        assert!(gate.pending().await.is_empty());
    }

    #[tokio::test]
    async fn action_ids_are_sixteen_hex_chars() {
        let gate = DecisionGate::new(24);
        let decision = gate
            .analyze("hash me", "query", vec![action(ActionKind::DataQuery)])
            .await
            .unwrap();
        assert_eq!(decision.action_id.len(), 16);
        assert!(decision.action_id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
