//! Modular rule chain for decision evaluation.
//!
//! Rules are evaluated in priority order (Critical first). A rejecting
//! Critical rule short-circuits the whole chain; otherwise the chain
//! approves iff every enabled rule approves. A predicate error counts as a
//! rejection (fail-closed).

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Rule evaluation priority. Critical rules run first and their rejections
/// are terminal.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RulePriority {
    Critical,
    High,
    Medium,
    Low,
}

type Predicate = Box<dyn Fn(&Value) -> anyhow::Result<bool> + Send + Sync>;

/// One approve/reject predicate over the action context.
pub struct GateRule {
    pub id: String,
    pub name: String,
    pub priority: RulePriority,
    pub enabled: bool,
    predicate: Predicate,
}

impl GateRule {
    pub fn new(
        name: impl Into<String>,
        priority: RulePriority,
        predicate: impl Fn(&Value) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            priority,
            enabled: true,
            predicate: Box::new(predicate),
        }
    }

    /// Disabled rules never block. A predicate error is a rejection.
    fn evaluate(&self, context: &Value) -> (bool, Option<String>) {
        if !self.enabled {
            return (true, None);
        }
        match (self.predicate)(context) {
            Ok(approved) => (approved, None),
            Err(e) => (false, Some(format!("rule error: {e}"))),
        }
    }
}

/// One line of the audit trail recorded per evaluated rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleTraceEntry {
    pub rule_id: String,
    pub rule_name: String,
    pub priority: RulePriority,
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of evaluating the full chain against a context.
#[derive(Debug, Clone, Serialize)]
pub struct ChainVerdict {
    pub approved: bool,
    pub trace: Vec<RuleTraceEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<String>,
}

#[derive(Default)]
pub struct RuleChain {
    rules: Vec<GateRule>,
}

impl RuleChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: GateRule) {
        self.rules.push(rule);
        self.rules.sort_by(|a, b| a.priority.cmp(&b.priority));
    }

    pub fn remove(&mut self, rule_id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != rule_id);
        self.rules.len() != before
    }

    pub fn set_enabled(&mut self, rule_id: &str, enabled: bool) -> bool {
        match self.rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, context: &Value) -> ChainVerdict {
        let mut trace = Vec::new();
        let mut all_approved = true;

        for rule in &self.rules {
            let (approved, detail) = rule.evaluate(context);
            trace.push(RuleTraceEntry {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                priority: rule.priority,
                result: if approved { "approved" } else { "rejected" },
                detail,
            });

            if !approved {
                all_approved = false;
                if rule.priority == RulePriority::Critical {
                    return ChainVerdict {
                        approved: false,
                        trace,
                        rejected_by: Some(rule.name.clone()),
                    };
                }
            }
        }

        ChainVerdict {
            approved: all_approved,
            rejected_by: if all_approved {
                None
            } else {
                trace
                    .iter()
                    .find(|t| t.result == "rejected")
                    .map(|t| t.rule_name.clone())
            },
            trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_chain_approves() {
        let chain = RuleChain::new();
        let verdict = chain.evaluate(&json!({}));
        assert!(verdict.approved);
        assert!(verdict.trace.is_empty());
    }

    #[test]
    fn critical_rejection_short_circuits() {
        let mut chain = RuleChain::new();
        chain.add(GateRule::new("always-approve", RulePriority::Low, |_| Ok(true)));
        chain.add(GateRule::new("block-all", RulePriority::Critical, |_| Ok(false)));

        let verdict = chain.evaluate(&json!({}));
        assert!(!verdict.approved);
        assert_eq!(verdict.rejected_by.as_deref(), Some("block-all"));
        // Critical runs first and terminates the chain
        assert_eq!(verdict.trace.len(), 1);
    }

    #[test]
    fn non_critical_rejection_evaluates_full_chain() {
        let mut chain = RuleChain::new();
        chain.add(GateRule::new("reject-medium", RulePriority::Medium, |_| Ok(false)));
        chain.add(GateRule::new("approve-low", RulePriority::Low, |_| Ok(true)));

        let verdict = chain.evaluate(&json!({}));
        assert!(!verdict.approved);
        assert_eq!(verdict.trace.len(), 2);
        assert_eq!(verdict.rejected_by.as_deref(), Some("reject-medium"));
    }

    #[test]
    fn disabled_rules_do_not_block() {
        let mut chain = RuleChain::new();
        chain.add(GateRule::new("blocker", RulePriority::Critical, |_| Ok(false)));
        let id = {
            let verdict = chain.evaluate(&json!({}));
            assert!(!verdict.approved);
            verdict.trace[0].rule_id.clone()
        };

        assert!(chain.set_enabled(&id, false));
        let verdict = chain.evaluate(&json!({}));
        assert!(verdict.approved);
    }

    #[test]
    fn predicate_error_fails_closed() {
        let mut chain = RuleChain::new();
        chain.add(GateRule::new("broken", RulePriority::Critical, |_| {
            anyhow::bail!("context missing required field")
        }));

        let verdict = chain.evaluate(&json!({}));
        assert!(!verdict.approved);
        assert!(verdict.trace[0].detail.as_deref().unwrap().contains("rule error"));
    }

    #[test]
    fn rules_evaluate_context() {
        let mut chain = RuleChain::new();
        chain.add(GateRule::new("cost-cap", RulePriority::High, |ctx| {
            Ok(ctx["estimated_cost"].as_f64().unwrap_or(0.0) < 1.0)
        }));

        assert!(chain.evaluate(&json!({"estimated_cost": 0.5})).approved);
        assert!(!chain.evaluate(&json!({"estimated_cost": 2.0})).approved);
    }
}
