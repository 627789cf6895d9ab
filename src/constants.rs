//! System-wide constants shared across components.
//!
//! Values that operators tune per deployment live in [`crate::config`];
//! the ones here are part of the fabric's contract and stay fixed.

/// Queue depth above which the auto-scaler spawns additional agents.
pub const SCALE_UP_THRESHOLD: usize = 50;

/// Queue depth below which the auto-scaler retires surplus idle agents.
pub const SCALE_DOWN_THRESHOLD: usize = 10;

/// One new agent per this many queued tasks during a scale-up.
pub const TASKS_PER_SPAWNED_AGENT: usize = 10;

/// Pending approvals older than this are observed as expired (lazily).
pub const DEFAULT_APPROVAL_TIMEOUT_HOURS: i64 = 24;

/// Cache entries older than their TTL are eligible for eviction.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// The cost log is ring-buffered to this many entries.
pub const COST_LOG_CAPACITY: usize = 10_000;

/// Estimated cost of one local-inference call, USD.
pub const LOCAL_INFERENCE_COST: f64 = 0.0001;

/// Estimated cost of one external API call, USD. Also the all-external
/// baseline used for savings calculations.
pub const EXTERNAL_INFERENCE_COST: f64 = 0.002;

/// Marginal cost per additional request in a batch, USD.
pub const BATCH_MARGINAL_COST: f64 = 0.0003;

/// Prompts shorter than this many words route to local inference under
/// `model=auto`.
pub const LOCAL_ROUTE_WORD_LIMIT: usize = 50;

/// Percentage of `auto` prompts (by content hash) routed locally.
pub const LOCAL_ROUTE_HASH_PERCENT: u64 = 70;

/// Base delay for exponential retry backoff.
pub const RETRY_BACKOFF_BASE_SECS: f64 = 1.5;

/// Budget alert thresholds as fractions of the total, fired once each.
pub const BUDGET_ALERT_THRESHOLDS: [f64; 4] = [0.5, 0.75, 0.9, 1.0];

/// Interval between background maintenance sweeps (expired approvals,
/// stale cache entries, old workflow records).
pub const MAINTENANCE_INTERVAL_SECS: u64 = 300;

/// Completed workflow records older than this are swept.
pub const WORKFLOW_RETENTION_HOURS: i64 = 24;

/// Hard cap on tasks emitted by a single decomposition.
pub const MAX_DECOMPOSED_TASKS: usize = 2000;

/// Upper bound on goal/prompt/message text accepted by the facade.
pub const MAX_TEXT_INPUT_LENGTH: usize = 10_000;

/// Upper bound on collection sizes accepted by the facade (outputs,
/// batch requests, proposed actions, capabilities).
pub const MAX_COLLECTION_SIZE: usize = 256;

/// Composed output below this aggregate confidence is rejected.
pub const MIN_COMPOSED_CONFIDENCE: f64 = 0.1;

/// Decision action-ids are the SHA-256 digest truncated to this many
/// hex characters.
pub const ACTION_ID_HEX_LEN: usize = 16;
