//! Cost guard: cache-first / local-first / batch / external routing with
//! ROI admission control.
//!
//! The cache is a single-writer map keyed by a SHA-256 fingerprint of
//! prompt+model; the cost log is an append-only ring buffer. Routing is
//! deterministic: explicit `local`/`external` models override the heuristic,
//! `auto` routes by word count and a stable hash split.

use crate::{
    config::CostGuardConfig,
    constants::{
        BATCH_MARGINAL_COST, COST_LOG_CAPACITY, EXTERNAL_INFERENCE_COST, LOCAL_INFERENCE_COST,
        LOCAL_ROUTE_HASH_PERCENT, LOCAL_ROUTE_WORD_LIMIT,
    },
    models::Priority,
    FabricError, Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_cost")]
    pub max_cost: f64,
    #[serde(default)]
    pub priority: Priority,
}

fn default_model() -> String {
    "auto".to_string()
}

fn default_max_cost() -> f64 {
    0.10
}

/// Where a response came from, recorded in the cost log.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    CacheHit,
    LocalInference,
    ExternalApi,
    BatchProcessing,
}

impl RouteSource {
    fn as_str(&self) -> &'static str {
        match self {
            RouteSource::CacheHit => "cache_hit",
            RouteSource::LocalInference => "local_inference",
            RouteSource::ExternalApi => "external_api",
            RouteSource::BatchProcessing => "batch_processing",
        }
    }
}

/// Outcome of an admission call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum InferenceOutcome {
    Served {
        result: String,
        source: RouteSource,
        cost: f64,
        savings: f64,
    },
    QueuedForBatch {
        estimated_cost_savings: f64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub requests_processed: usize,
    pub results: Vec<String>,
    pub total_cost: f64,
    pub savings: f64,
    pub savings_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoiDecision {
    pub operation: String,
    pub estimated_cost: f64,
    pub expected_value: f64,
    pub roi: f64,
    pub roi_percentage: f64,
    pub should_proceed: bool,
    pub recommendation: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_hits: u64,
    pub hit_rate: f64,
    pub estimated_savings: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceBreakdown {
    pub count: usize,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostSummary {
    pub period_hours: i64,
    pub total_operations: usize,
    pub total_cost: f64,
    pub baseline_cost: f64,
    pub savings: f64,
    pub savings_percentage: f64,
    pub by_source: HashMap<String, SourceBreakdown>,
    pub local_inference_rate: f64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: String,
    cached_at: chrono::DateTime<chrono::Utc>,
    last_accessed: chrono::DateTime<chrono::Utc>,
    hits: u64,
    ttl_secs: u64,
}

#[derive(Debug, Clone)]
struct CostLogEntry {
    operation: &'static str,
    cost: f64,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Seam for the inference collaborators. The fabric ships a deterministic
/// simulation; deployments point `EXTERNAL_INFERENCE_URL` at a real service.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn local(&self, prompt: &str) -> Result<String>;
    async fn external(&self, prompt: &str, model: &str) -> Result<String>;
}

/// Deterministic stand-in used when no external endpoint is configured.
pub struct SimulatedBackend;

#[async_trait]
impl InferenceBackend for SimulatedBackend {
    async fn local(&self, prompt: &str) -> Result<String> {
        let excerpt: String = prompt.chars().take(50).collect();
        Ok(format!("[local] Response to: {excerpt}"))
    }

    async fn external(&self, prompt: &str, _model: &str) -> Result<String> {
        let excerpt: String = prompt.chars().take(50).collect();
        Ok(format!("[external] Response to: {excerpt}"))
    }
}

/// Backend that forwards external-route requests to a remote service.
/// Local inference stays in-process.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[derive(Serialize)]
struct RemoteInferenceBody<'a> {
    prompt: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct RemoteInferenceReply {
    result: String,
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn local(&self, prompt: &str) -> Result<String> {
        SimulatedBackend.local(prompt).await
    }

    async fn external(&self, prompt: &str, model: &str) -> Result<String> {
        let reply: RemoteInferenceReply = self
            .client
            .post(format!("{}/inference", self.base_url))
            .json(&RemoteInferenceBody { prompt, model })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply.result)
    }
}

pub struct CostGuard {
    cache: RwLock<HashMap<String, CacheEntry>>,
    cost_log: Mutex<VecDeque<CostLogEntry>>,
    batch_queue: Mutex<Vec<InferenceRequest>>,
    backend: Arc<dyn InferenceBackend>,
    ttl_secs: u64,
}

impl CostGuard {
    pub fn new(config: &CostGuardConfig) -> Arc<Self> {
        let backend: Arc<dyn InferenceBackend> = match &config.external_inference_url {
            Some(url) => Arc::new(HttpBackend::new(url.clone())),
            None => Arc::new(SimulatedBackend),
        };
        Self::with_backend(config.cache_ttl_secs, backend)
    }

    pub fn with_backend(ttl_secs: u64, backend: Arc<dyn InferenceBackend>) -> Arc<Self> {
        Arc::new(Self {
            cache: RwLock::new(HashMap::new()),
            cost_log: Mutex::new(VecDeque::new()),
            batch_queue: Mutex::new(Vec::new()),
            backend,
            ttl_secs,
        })
    }

    /// SHA-256 over prompt+model; the cache key.
    pub fn fingerprint(prompt: &str, model: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        hasher.update(model.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Routing decision for a non-hit request. Explicit model choices win;
    /// `auto` goes local for short prompts or for the stable ~70% hash split.
    fn should_use_local(prompt: &str, model: &str) -> bool {
        match model {
            "local" => true,
            "external" => false,
            _ => {
                if prompt.split_whitespace().count() < LOCAL_ROUTE_WORD_LIMIT {
                    return true;
                }
                let digest = Sha256::digest(prompt.as_bytes());
                let hash_prefix = u64::from_str_radix(&format!("{:x}", digest)[..8], 16)
                    .unwrap_or(0);
                hash_prefix % 100 < LOCAL_ROUTE_HASH_PERCENT
            }
        }
    }

    /// Cost-optimized admission: cache, then local, then batch, then the
    /// external API, with the max-cost gate applied before any spend.
    pub async fn infer(&self, request: InferenceRequest) -> Result<InferenceOutcome> {
        let key = Self::fingerprint(&request.prompt, &request.model);

        {
            let mut cache = self.cache.write().await;
            if let Some(entry) = cache.get_mut(&key) {
                entry.hits += 1;
                entry.last_accessed = chrono::Utc::now();
                let result = entry.result.clone();
                drop(cache);

                debug!("Cache hit for inference request");
                self.log_cost(RouteSource::CacheHit, 0.0).await;
                return Ok(InferenceOutcome::Served {
                    result,
                    source: RouteSource::CacheHit,
                    cost: 0.0,
                    savings: EXTERNAL_INFERENCE_COST,
                });
            }
        }

        let use_local = Self::should_use_local(&request.prompt, &request.model);

        if !use_local && request.priority.rank() >= 3 {
            let mut queue = self.batch_queue.lock().await;
            queue.push(request);
            info!("Request queued for batch processing ({} pending)", queue.len());
            return Ok(InferenceOutcome::QueuedForBatch {
                estimated_cost_savings: EXTERNAL_INFERENCE_COST - BATCH_MARGINAL_COST,
            });
        }

        let (cost, source) = if use_local {
            (LOCAL_INFERENCE_COST, RouteSource::LocalInference)
        } else {
            (EXTERNAL_INFERENCE_COST, RouteSource::ExternalApi)
        };

        if cost > request.max_cost {
            return Err(FabricError::CostCapExceeded {
                cost,
                max_cost: request.max_cost,
            });
        }

        let result = if use_local {
            self.backend.local(&request.prompt).await?
        } else {
            self.backend.external(&request.prompt, &request.model).await?
        };

        self.insert_cache(key, result.clone()).await;
        self.log_cost(source, cost).await;

        Ok(InferenceOutcome::Served {
            result,
            source,
            cost,
            savings: if use_local {
                EXTERNAL_INFERENCE_COST - LOCAL_INFERENCE_COST
            } else {
                0.0
            },
        })
    }

    async fn insert_cache(&self, key: String, result: String) {
        let now = chrono::Utc::now();
        let mut cache = self.cache.write().await;
        cache.insert(
            key,
            CacheEntry {
                result,
                cached_at: now,
                last_accessed: now,
                hits: 0,
                ttl_secs: self.ttl_secs,
            },
        );
    }

    /// Process a set of requests as one bulk call. Per-request cost decays
    /// from the external base to the batch marginal rate.
    pub async fn batch_process(&self, requests: Vec<InferenceRequest>) -> Result<BatchOutcome> {
        if requests.is_empty() {
            return Err(FabricError::InvalidInput("batch cannot be empty".to_string()));
        }

        let batch_id = {
            let digest = Sha256::digest(
                format!("batch_{}", chrono::Utc::now().to_rfc3339()).as_bytes(),
            );
            format!("{:x}", digest)[..16].to_string()
        };

        let mut results = Vec::with_capacity(requests.len());
        for request in &requests {
            let result = self.backend.external(&request.prompt, &request.model).await?;
            let key = Self::fingerprint(&request.prompt, &request.model);
            self.insert_cache(key, result.clone()).await;
            results.push(result);
        }

        let individual_cost = requests.len() as f64 * EXTERNAL_INFERENCE_COST;
        let batch_cost =
            EXTERNAL_INFERENCE_COST + (requests.len() - 1) as f64 * BATCH_MARGINAL_COST;
        let savings = individual_cost - batch_cost;

        self.log_cost(RouteSource::BatchProcessing, batch_cost).await;
        info!("Batch {batch_id} processed {} requests", requests.len());

        Ok(BatchOutcome {
            batch_id,
            requests_processed: requests.len(),
            results,
            total_cost: batch_cost,
            savings,
            savings_percentage: if individual_cost > 0.0 {
                savings / individual_cost * 100.0
            } else {
                0.0
            },
        })
    }

    /// Drain the deferred-batch queue into one bulk call. Invoked by the
    /// maintenance loop. Returns None when there is nothing queued.
    pub async fn flush_batch_queue(&self) -> Result<Option<BatchOutcome>> {
        let pending: Vec<InferenceRequest> = {
            let mut queue = self.batch_queue.lock().await;
            std::mem::take(&mut *queue)
        };
        if pending.is_empty() {
            return Ok(None);
        }
        self.batch_process(pending).await.map(Some)
    }

    pub async fn batch_queue_depth(&self) -> usize {
        self.batch_queue.lock().await.len()
    }

    /// Proceed iff expected value exceeds estimated cost.
    pub fn evaluate_roi(operation: &str, estimated_cost: f64, expected_value: f64) -> RoiDecision {
        let roi = if estimated_cost > 0.0 {
            (expected_value - estimated_cost) / estimated_cost
        } else {
            0.0
        };
        let should_proceed = expected_value > estimated_cost;
        RoiDecision {
            operation: operation.to_string(),
            estimated_cost,
            expected_value,
            roi,
            roi_percentage: roi * 100.0,
            should_proceed,
            recommendation: if should_proceed { "approve" } else { "reject" },
        }
    }

    async fn log_cost(&self, source: RouteSource, cost: f64) {
        let mut log = self.cost_log.lock().await;
        log.push_back(CostLogEntry {
            operation: source.as_str(),
            cost,
            timestamp: chrono::Utc::now(),
        });
        while log.len() > COST_LOG_CAPACITY {
            log.pop_front();
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total_entries = cache.len();
        let total_hits: u64 = cache.values().map(|e| e.hits).sum();
        drop(cache);

        let log = self.cost_log.lock().await;
        let hit_ops = log.iter().filter(|e| e.operation == "cache_hit").count();
        let hit_rate = if log.is_empty() {
            0.0
        } else {
            hit_ops as f64 / log.len() as f64
        };

        CacheStats {
            total_entries,
            total_hits,
            hit_rate,
            estimated_savings: hit_ops as f64 * EXTERNAL_INFERENCE_COST,
        }
    }

    /// Spend aggregation over the trailing window, with savings measured
    /// against an all-external baseline.
    pub async fn cost_summary(&self, period_hours: i64) -> CostSummary {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(period_hours);
        let log = self.cost_log.lock().await;
        let recent: Vec<&CostLogEntry> = log.iter().filter(|e| e.timestamp > cutoff).collect();

        let total_cost: f64 = recent.iter().map(|e| e.cost).sum();
        let baseline_cost = recent.len() as f64 * EXTERNAL_INFERENCE_COST;
        let savings = baseline_cost - total_cost;

        let mut by_source: HashMap<String, SourceBreakdown> = HashMap::new();
        for entry in &recent {
            let bucket = by_source
                .entry(entry.operation.to_string())
                .or_insert(SourceBreakdown { count: 0, cost: 0.0 });
            bucket.count += 1;
            bucket.cost += entry.cost;
        }

        let local_ops = by_source
            .get("local_inference")
            .map(|b| b.count)
            .unwrap_or(0);

        CostSummary {
            period_hours,
            total_operations: recent.len(),
            total_cost: (total_cost * 10_000.0).round() / 10_000.0,
            baseline_cost: (baseline_cost * 10_000.0).round() / 10_000.0,
            savings: (savings * 10_000.0).round() / 10_000.0,
            savings_percentage: if baseline_cost > 0.0 {
                (savings / baseline_cost * 10_000.0).round() / 100.0
            } else {
                0.0
            },
            by_source,
            local_inference_rate: if recent.is_empty() {
                0.0
            } else {
                (local_ops as f64 / recent.len() as f64 * 10_000.0).round() / 100.0
            },
        }
    }

    /// Evict by age. `older_than_seconds=None` clears everything; otherwise
    /// entries whose `cached_at` predates the cutoff are removed. Hits never
    /// refresh `cached_at`, so a hot-but-old entry still ages out.
    pub async fn clear_cache(&self, older_than_seconds: Option<u64>) -> usize {
        let mut cache = self.cache.write().await;
        match older_than_seconds {
            None => {
                let cleared = cache.len();
                cache.clear();
                cleared
            }
            Some(secs) => {
                let cutoff = chrono::Utc::now() - chrono::Duration::seconds(secs as i64);
                let before = cache.len();
                cache.retain(|_, entry| entry.cached_at >= cutoff);
                before - cache.len()
            }
        }
    }

    /// Maintenance sweep: evict entries past their own TTL.
    pub async fn evict_expired(&self) -> usize {
        let now = chrono::Utc::now();
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| {
            now - entry.cached_at < chrono::Duration::seconds(entry.ttl_secs as i64)
        });
        before - cache.len()
    }
}
