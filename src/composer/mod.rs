//! Output composer: fan-in of worker outputs into a single user-visible
//! response.
//!
//! Aggregate confidence below the floor, or a panel of outputs that all
//! failed, yields a synthetic failure response carrying the concatenated
//! failure reasons instead of an error.

use crate::{constants::MIN_COMPOSED_CONFIDENCE, models::WorkerOutput};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompositionStrategy {
    Comprehensive,
    Best,
    Majority,
}

impl FromStr for CompositionStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "comprehensive" => Ok(CompositionStrategy::Comprehensive),
            "best" => Ok(CompositionStrategy::Best),
            "majority" => Ok(CompositionStrategy::Majority),
            _ => Err(format!("Unknown composition strategy: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedOutput {
    pub agent_id: String,
    pub agent_type: String,
    pub payload: serde_json::Value,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComposedOutput {
    pub success: bool,
    pub strategy: CompositionStrategy,
    /// The selected payload (best/majority) or all payloads (comprehensive).
    pub outputs: Vec<AnnotatedOutput>,
    pub confidence: f64,
    pub contributing_agents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

pub struct OutputComposer;

impl OutputComposer {
    pub fn new() -> Self {
        Self
    }

    /// Compose worker outputs under a strategy. `agent_scores` supplies the
    /// per-agent performance weights used by the comprehensive strategy;
    /// unknown agents weigh 1.0.
    pub fn compose(
        &self,
        outputs: &[WorkerOutput],
        strategy: CompositionStrategy,
        agent_scores: &HashMap<String, f64>,
    ) -> ComposedOutput {
        if outputs.is_empty() || outputs.iter().all(|o| !o.success) {
            return self.synthetic_failure(outputs, strategy);
        }

        let successful: Vec<&WorkerOutput> = outputs.iter().filter(|o| o.success).collect();

        let (selected, confidence) = match strategy {
            CompositionStrategy::Best => {
                let best = Self::pick_best(&successful);
                (vec![best], best.confidence)
            }
            CompositionStrategy::Majority => {
                let group = Self::pick_majority(&successful);
                let confidence =
                    group.iter().map(|o| o.confidence).sum::<f64>() / group.len() as f64;
                (group, confidence)
            }
            CompositionStrategy::Comprehensive => {
                let weighted: f64 = successful
                    .iter()
                    .map(|o| o.confidence * Self::weight(o, agent_scores))
                    .sum();
                let total_weight: f64 = successful
                    .iter()
                    .map(|o| Self::weight(o, agent_scores))
                    .sum();
                let confidence = if total_weight > 0.0 {
                    weighted / total_weight
                } else {
                    0.0
                };
                (successful.clone(), confidence)
            }
        };

        if confidence < MIN_COMPOSED_CONFIDENCE {
            return self.synthetic_failure(outputs, strategy);
        }

        ComposedOutput {
            success: true,
            strategy,
            outputs: selected
                .iter()
                .map(|o| AnnotatedOutput {
                    agent_id: o.agent_id.clone(),
                    agent_type: o.agent_type.clone(),
                    payload: o.payload.clone(),
                    confidence: o.confidence,
                })
                .collect(),
            confidence,
            contributing_agents: selected.len(),
            failure_reason: None,
        }
    }

    fn weight(output: &WorkerOutput, agent_scores: &HashMap<String, f64>) -> f64 {
        agent_scores.get(&output.agent_id).copied().unwrap_or(1.0)
    }

    /// Maximum confidence; ties broken by shortest processing time, then
    /// lexicographic agent id.
    fn pick_best<'a>(outputs: &[&'a WorkerOutput]) -> &'a WorkerOutput {
        outputs
            .iter()
            .min_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        a.processing_time
                            .partial_cmp(&b.processing_time)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.agent_id.cmp(&b.agent_id))
            })
            .expect("pick_best called with at least one output")
    }

    /// Group by structural payload equality (canonical JSON), return the
    /// group with the largest summed confidence.
    fn pick_majority<'a>(outputs: &[&'a WorkerOutput]) -> Vec<&'a WorkerOutput> {
        let mut groups: HashMap<String, Vec<&WorkerOutput>> = HashMap::new();
        for output in outputs {
            let key = serde_json::to_string(&output.payload).unwrap_or_default();
            groups.entry(key).or_default().push(output);
        }

        groups
            .into_values()
            .max_by(|a, b| {
                let conf_a: f64 = a.iter().map(|o| o.confidence).sum();
                let conf_b: f64 = b.iter().map(|o| o.confidence).sum();
                conf_a
                    .partial_cmp(&conf_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // deterministic tie-break on the smallest member id
                    .then_with(|| {
                        let id_a = a.iter().map(|o| &o.agent_id).min();
                        let id_b = b.iter().map(|o| &o.agent_id).min();
                        id_b.cmp(&id_a)
                    })
            })
            .unwrap_or_default()
    }

    fn synthetic_failure(
        &self,
        outputs: &[WorkerOutput],
        strategy: CompositionStrategy,
    ) -> ComposedOutput {
        let reasons: Vec<String> = outputs
            .iter()
            .filter(|o| !o.success)
            .map(|o| {
                format!(
                    "{}: {}",
                    o.agent_id,
                    o.payload
                        .get("error")
                        .and_then(|e| e.as_str())
                        .unwrap_or("failed")
                )
            })
            .collect();

        ComposedOutput {
            success: false,
            strategy,
            outputs: Vec::new(),
            confidence: 0.0,
            contributing_agents: 0,
            failure_reason: Some(if reasons.is_empty() {
                "no usable worker outputs".to_string()
            } else {
                reasons.join("; ")
            }),
        }
    }
}

impl Default for OutputComposer {
    fn default() -> Self {
        Self::new()
    }
}
