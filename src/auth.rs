//! Pre-shared bearer token authentication.
//!
//! Every endpoint except `/api/health` requires the server token. Agents send
//! it as `Authorization: Bearer <token>`; clients that cannot set headers on a
//! WebSocket upgrade may pass `?token=<token>` instead.

use axum::{
    extract::{Query, Request},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

/// Extension type carrying the expected token, injected into the router
/// layer so [`require_token`] can read it without touching handler state.
#[derive(Clone)]
pub struct AuthToken(pub String);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Pull the presented credential from the request, header first.
fn presented_token(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string);
    if from_header.is_some() {
        return from_header;
    }
    Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.token)
}

/// Axum middleware that rejects requests without a valid token.
///
/// # Error responses
///
/// - `401 Unauthorized`: no credential presented
/// - `403 Forbidden`: credential present but wrong
/// - `500 Internal Server Error`: [`AuthToken`] extension not found
pub async fn require_token(request: Request, next: Next) -> Response {
    let Some(AuthToken(expected)) = request.extensions().get::<AuthToken>().cloned() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error"})),
        )
            .into_response();
    };

    let Some(provided) = presented_token(&request) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header"})),
        )
            .into_response();
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid token"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so response times do not reveal the token length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::get, Extension, Router};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/secret", get(|| async { "ok" }))
            .layer(middleware::from_fn(require_token))
            .layer(Extension(AuthToken("s3cret".into())))
    }

    async fn status_of(req: axum::http::Request<Body>) -> StatusCode {
        app().oneshot(req).await.unwrap().status()
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokex"));
        assert!(!constant_time_eq(b"token", b"tok"));
        assert!(!constant_time_eq(b"token", b"token-and-more"));
        assert!(!constant_time_eq(b"token", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let req = axum::http::Request::get("/secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(req).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wrong_token_is_403() {
        let req = axum::http::Request::get("/secret")
            .header("authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(req).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_bearer_header_accepted() {
        let req = axum::http::Request::get("/secret")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_query_token_accepted() {
        let req = axum::http::Request::get("/secret?key=a&token=s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_is_401() {
        let req = axum::http::Request::get("/secret")
            .header("authorization", "Basic czNjcmV0")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(req).await, StatusCode::UNAUTHORIZED);
    }
}
