use axum::http::StatusCode;
use thiserror::Error;

/// Convenience type alias for Results with FabricError
pub type Result<T> = std::result::Result<T, FabricError>;

/// Main error type for the fabric
///
/// Every failure a component can surface maps onto exactly one of these
/// variants, and each variant maps onto exactly one HTTP status via
/// [`FabricError::status_code`]. Handlers never invent ad-hoc statuses.
#[derive(Error, Debug)]
pub enum FabricError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimited { message: String },

    #[error("Capacity exhausted: {message}")]
    CapacityExhausted { message: String },

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: f64, available: f64 },

    #[error("Cost ${cost} exceeds max ${max_cost}")]
    CostCapExceeded { cost: f64, max_cost: f64 },

    #[error("Deadline exceeded: {message}")]
    DeadlineExceeded { message: String },

    #[error("Agent busy: {agent_id}")]
    Busy { agent_id: String },

    #[error("Dependency failed for task {task_id}: {message}")]
    DependencyFailed { task_id: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("External inference error: {0}")]
    ExternalInference(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FabricError {
    /// HTTP status for the API envelope. DeadlineExceeded is deliberately a
    /// 200: the workflow report carries `deadline_exceeded=true` with partial
    /// results rather than failing the request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            FabricError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            FabricError::Unauthorized => StatusCode::UNAUTHORIZED,
            FabricError::Forbidden(_) => StatusCode::FORBIDDEN,
            FabricError::NotFound(_) => StatusCode::NOT_FOUND,
            FabricError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            FabricError::CapacityExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FabricError::InsufficientFunds { .. } => StatusCode::FORBIDDEN,
            FabricError::CostCapExceeded { .. } => StatusCode::BAD_REQUEST,
            FabricError::DeadlineExceeded { .. } => StatusCode::OK,
            FabricError::Busy { .. } => StatusCode::BAD_REQUEST,
            FabricError::DependencyFailed { .. } => StatusCode::OK,
            FabricError::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FabricError::ExternalInference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FabricError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FabricError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
