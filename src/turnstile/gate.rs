//! Request gate applying the Turnstile verifier to authentication entry
//! points.
//!
//! Only sign-up and sign-in requests are gated; everything else passes
//! through without the body ever being touched. Clients see exactly three
//! outcomes: pass-through, 400 (token required), or 403 (verification
//! failed). No internal error detail leaks outward.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::{error, info, warn};

use super::TurnstileVerifier;

/// Well-known request-body field carrying the challenge token.
pub const TOKEN_FIELD: &str = "turnstileToken";

const GATED_PATH_PREFIXES: &[&str] = &["/api/auth/sign-up", "/api/auth/sign-in"];

/// Auth-entry bodies are small; anything larger is not a legitimate sign-in.
const MAX_BODY_BYTES: usize = 64 * 1024;

fn is_gated(path: &str) -> bool {
    GATED_PATH_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

/// Middleware deciding whether a request must present a valid Turnstile
/// token before reaching the authentication backend.
pub async fn turnstile_gate(
    State(verifier): State<Arc<TurnstileVerifier>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    // A disabled subsystem never touches the body; the request streams
    // through unbuffered.
    if !is_gated(&path) || !verifier.enabled() {
        return next.run(request).await;
    }

    // Buffer the body to peek at the token, then replay it downstream
    // unchanged. A body that cannot be read in full cannot carry a token we
    // trust, so read failures are rejected rather than forwarded truncated.
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(path, error = %err, "unable to read request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "Bad Request",
                    "message": "Turnstile verification required",
                })),
            )
                .into_response();
        }
    };

    let token = extract_token(&bytes);
    let request = Request::from_parts(parts, Body::from(bytes));

    let Some(token) = token else {
        warn!(path, "turnstile token missing");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Bad Request",
                "message": "Turnstile verification required",
            })),
        )
            .into_response();
    };

    let remote_ip = client_ip(&request);
    if verifier.verify(&token, remote_ip.as_deref()).await {
        info!(path, "turnstile verification passed");
        next.run(request).await
    } else {
        error!(path, "turnstile verification failed");
        (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "Forbidden",
                "message": "Turnstile verification failed",
            })),
        )
            .into_response()
    }
}

fn extract_token(body: &[u8]) -> Option<String> {
    let payload: serde_json::Value = serde_json::from_slice(body).ok()?;
    payload
        .get(TOKEN_FIELD)?
        .as_str()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Best-effort client address: proxy-supplied `X-Forwarded-For` first hop,
/// falling back to the transport peer address.
fn client_ip(request: &Request) -> Option<String> {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{config, spawn_siteverify, SiteverifyMode};
    use super::*;
    use crate::store::{KeyValueStore, MemoryStore};
    use crate::turnstile::{result_cache_key, TurnstileConfig, TURNSTILE_CACHE_PREFIX};
    use anyhow::Result;
    use axum::http::header::CONTENT_TYPE;
    use axum::{middleware, routing::get, routing::post, Router};
    use secrecy::SecretString;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(verifier: TurnstileVerifier) -> Router {
        Router::new()
            .route("/api/auth/sign-up/email", post(|| async { "ok" }))
            .route("/api/auth/sign-in/email", post(|| async { "ok" }))
            .route("/ping", get(|| async { "pong" }))
            .layer(middleware::from_fn_with_state(
                Arc::new(verifier),
                turnstile_gate,
            ))
    }

    fn build_verifier(cfg: TurnstileConfig, url: &str) -> (Arc<MemoryStore>, TurnstileVerifier) {
        let store = Arc::new(MemoryStore::new());
        let verifier =
            TurnstileVerifier::new(cfg, Arc::clone(&store) as Arc<dyn KeyValueStore>)
                .expect("build verifier")
                .with_verify_url(url);
        (store, verifier)
    }

    fn json_request(path: &str, body: Value) -> Request {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("build request")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("parse body")
    }

    const DEAD_URL: &str = "http://127.0.0.1:9/siteverify";

    #[test]
    fn gated_paths_are_auth_entry_points() {
        assert!(is_gated("/api/auth/sign-up/email"));
        assert!(is_gated("/api/auth/sign-in/email"));
        assert!(!is_gated("/api/auth/session"));
        assert!(!is_gated("/health"));
    }

    #[tokio::test]
    async fn non_gated_path_passes_without_a_token() -> Result<()> {
        let (_store, verifier) = build_verifier(config(true, Some("secret")), DEAD_URL);
        let request = Request::builder()
            .method("GET")
            .uri("/ping")
            .body(Body::empty())?;

        let response = app(verifier).oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_gate_allows_missing_token() -> Result<()> {
        let (_store, verifier) = build_verifier(config(false, None), DEAD_URL);
        let request = json_request("/api/auth/sign-up/email", serde_json::json!({}));

        let response = app(verifier).oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn missing_token_is_a_bad_request_when_enabled() -> Result<()> {
        let (_store, verifier) = build_verifier(config(true, Some("secret")), DEAD_URL);
        let request = json_request(
            "/api/auth/sign-up/email",
            serde_json::json!({"email": "user@example.com"}),
        );

        let response = app(verifier).oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({
                "error": "Bad Request",
                "message": "Turnstile verification required",
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn unparseable_body_counts_as_missing_token() -> Result<()> {
        let (_store, verifier) = build_verifier(config(true, Some("secret")), DEAD_URL);
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/sign-in/email")
            .body(Body::from("not json"))?;

        let response = app(verifier).oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_when_enabled() -> Result<()> {
        let (_store, verifier) = build_verifier(config(true, Some("secret")), DEAD_URL);
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/sign-up/email")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("x".repeat(MAX_BODY_BYTES + 1)))?;

        let response = app(verifier).oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_gate_streams_the_body_through_untouched() -> Result<()> {
        let (_store, verifier) = build_verifier(config(false, None), DEAD_URL);

        // The backend sees the full body, even one past the buffering cap:
        // a disabled gate never buffers.
        let echo = Router::new()
            .route(
                "/api/auth/sign-up/email",
                post(|body: axum::body::Bytes| async move { body.len().to_string() }),
            )
            .layer(middleware::from_fn_with_state(
                Arc::new(verifier),
                turnstile_gate,
            ));

        let payload = "x".repeat(MAX_BODY_BYTES + 1);
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/sign-up/email")
            .body(Body::from(payload.clone()))?;

        let response = echo.oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(bytes, payload.len().to_string());
        Ok(())
    }

    #[tokio::test]
    async fn failed_verification_is_forbidden() -> Result<()> {
        let (url, _calls) = spawn_siteverify(SiteverifyMode::Rejected).await;
        let (_store, verifier) = build_verifier(config(true, Some("secret")), &url);
        let request = json_request(
            "/api/auth/sign-in/email",
            serde_json::json!({TOKEN_FIELD: "bad-token"}),
        );

        let response = app(verifier).oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({
                "error": "Forbidden",
                "message": "Turnstile verification failed",
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn valid_token_reaches_the_backend() -> Result<()> {
        let (url, calls) = spawn_siteverify(SiteverifyMode::Success).await;
        let (_store, verifier) = build_verifier(config(true, Some("secret")), &url);
        let request = json_request(
            "/api/auth/sign-up/email",
            serde_json::json!({TOKEN_FIELD: "good-token", "email": "user@example.com"}),
        );

        let response = app(verifier).oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn verifier_receives_the_forwarded_client_ip() -> Result<()> {
        let (url, _calls) = spawn_siteverify(SiteverifyMode::Success).await;
        let (store, verifier) = build_verifier(config(true, Some("secret")), &url);

        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/sign-in/email")
            .header(CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::from(
                serde_json::json!({TOKEN_FIELD: "good-token"}).to_string(),
            ))?;

        let response = app(verifier).oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::OK);

        // The cached verdict is keyed by the first forwarded hop.
        let expected = format!(
            "{}{}",
            TURNSTILE_CACHE_PREFIX,
            result_cache_key("good-token", Some("203.0.113.7"))
        );
        assert!(store.get(&expected).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn bypass_token_passes_without_network() -> Result<()> {
        let mut cfg = config(true, Some("secret"));
        cfg.bypass_token = Some(SecretString::from("let-me-in".to_string()));
        let (_store, verifier) = build_verifier(cfg, DEAD_URL);

        let request = json_request(
            "/api/auth/sign-in/email",
            serde_json::json!({TOKEN_FIELD: "let-me-in"}),
        );
        let response = app(verifier).oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }
}
