//! Identity propagation middleware.
//!
//! The fabric does not authenticate; it requires and propagates a caller
//! identity via the `X-User-ID` header. Handlers read the identity from
//! request extensions; the rate limiter keys its buckets on it.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::warn;

/// Caller identity, inserted into request extensions by the middleware.
#[derive(Debug, Clone)]
pub struct Identity(pub String);

const USER_ID_HEADER: &str = "x-user-id";
const MAX_USER_ID_LENGTH: usize = 128;

/// Paths reachable without an identity header.
const OPEN_PATHS: [&str; 2] = ["/health", "/"];

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"success": false, "detail": "Unauthorized"})),
    )
        .into_response()
}

pub async fn identity_middleware(mut request: Request, next: Next) -> Result<Response, Response> {
    let path = request.uri().path();
    if OPEN_PATHS.contains(&path) {
        return Ok(next.run(request).await);
    }

    let user_id = match request.headers().get(USER_ID_HEADER) {
        Some(value) => match value.to_str() {
            Ok(id) => id.trim().to_string(),
            Err(_) => {
                warn!("Malformed {USER_ID_HEADER} header for path: {path}");
                return Err(unauthorized());
            }
        },
        None => {
            warn!("Missing {USER_ID_HEADER} header for path: {path}");
            return Err(unauthorized());
        }
    };

    if user_id.is_empty()
        || user_id.len() > MAX_USER_ID_LENGTH
        || !user_id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '@')
    {
        warn!("Invalid {USER_ID_HEADER} value for path: {path}");
        return Err(unauthorized());
    }

    request.extensions_mut().insert(Identity(user_id));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, routing::get, Router};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/agents", get(|| async { "agents" }))
            .layer(axum::middleware::from_fn(identity_middleware))
    }

    #[tokio::test]
    async fn health_is_open() {
        let response = app()
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let response = app()
            .oneshot(HttpRequest::get("/agents").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_identity_passes() {
        let response = app()
            .oneshot(
                HttpRequest::get("/agents")
                    .header("x-user-id", "user-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_identity_is_unauthorized() {
        let oversized = "x".repeat(200);
        for bad in ["", "   ", "user id with spaces", oversized.as_str()] {
            let response = app()
                .oneshot(
                    HttpRequest::get("/agents")
                        .header("x-user-id", bad)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(
                response.status(),
                StatusCode::UNAUTHORIZED,
                "should reject {bad:?}"
            );
        }
    }
}
