//! Per-client token-bucket rate limiting, one bucket set per endpoint
//! class. Buckets are keyed by the caller identity established by the
//! identity middleware.

use crate::auth::Identity;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use governor::{
    clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter,
};
use serde_json::json;
use std::{num::NonZeroU32, sync::Arc};
use tracing::warn;

/// Requests per minute per client for each endpoint class.
pub const STRATEGIZE_PER_MINUTE: u32 = 10;
pub const COORDINATE_PER_MINUTE: u32 = 20;
pub const DISPATCH_PER_MINUTE: u32 = 50;
pub const EXECUTE_PER_MINUTE: u32 = 30;
pub const DEFAULT_PER_MINUTE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// Goal-level planning: chat and decomposition.
    Strategize,
    /// Decision coordination: approvals, composition, decision listing.
    Coordinate,
    /// Pool operations: task and agent management, scaling, stats.
    Dispatch,
    /// Cost-guarded execution: inference, batches, ROI.
    Execute,
    Default,
}

impl EndpointClass {
    pub fn classify(path: &str) -> Self {
        if path == "/chat" || path == "/decompose" {
            EndpointClass::Strategize
        } else if path == "/approve" || path == "/compose" || path == "/decisions" {
            EndpointClass::Coordinate
        } else if path.starts_with("/task")
            || path.starts_with("/agent")
            || path.starts_with("/projects")
            || path == "/scale"
            || path == "/stats"
        {
            EndpointClass::Dispatch
        } else if path == "/inference"
            || path == "/batch"
            || path.starts_with("/roi")
            || path.starts_with("/cache")
            || path.starts_with("/cost")
        {
            EndpointClass::Execute
        } else {
            EndpointClass::Default
        }
    }
}

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

pub struct EndpointRateLimiter {
    strategize: KeyedLimiter,
    coordinate: KeyedLimiter,
    dispatch: KeyedLimiter,
    execute: KeyedLimiter,
    default: KeyedLimiter,
}

fn keyed(per_minute: u32) -> KeyedLimiter {
    RateLimiter::keyed(Quota::per_minute(
        NonZeroU32::new(per_minute).expect("rate quota must be non-zero"),
    ))
}

impl EndpointRateLimiter {
    pub fn new() -> Self {
        Self {
            strategize: keyed(STRATEGIZE_PER_MINUTE),
            coordinate: keyed(COORDINATE_PER_MINUTE),
            dispatch: keyed(DISPATCH_PER_MINUTE),
            execute: keyed(EXECUTE_PER_MINUTE),
            default: keyed(DEFAULT_PER_MINUTE),
        }
    }

    /// True when the client still has budget in the class bucket.
    pub fn check(&self, class: EndpointClass, client: &str) -> bool {
        let limiter = match class {
            EndpointClass::Strategize => &self.strategize,
            EndpointClass::Coordinate => &self.coordinate,
            EndpointClass::Dispatch => &self.dispatch,
            EndpointClass::Execute => &self.execute,
            EndpointClass::Default => &self.default,
        };
        limiter.check_key(&client.to_string()).is_ok()
    }
}

impl Default for EndpointRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<EndpointRateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let path = request.uri().path().to_string();

    // Open paths carry no identity and are not limited.
    let client = match request.extensions().get::<Identity>() {
        Some(identity) => identity.0.clone(),
        None => return Ok(next.run(request).await),
    };

    let class = EndpointClass::classify(&path);
    if !limiter.check(class, &client) {
        warn!("Rate limit exceeded for client {client} on {path}");
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "success": false,
                "detail": "Rate limit exceeded; retry later",
            })),
        )
            .into_response());
    }

    Ok(next.run(request).await)
}
