//! HTTP server wiring.
//!
//! The gateway itself is thin: a health endpoint plus the Turnstile gate
//! layered in front of the mounted authentication backend. The backend is an
//! external collaborator injected as an [`axum::Router`]; the cache service
//! is handed to it as an extension so it can use the shared store for
//! session-style caching.

use crate::{
    cache::CacheService,
    cli::globals::GlobalArgs,
    store::{KeyValueStore, RedisStore},
    turnstile::{gate::turnstile_gate, TurnstileVerifier},
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    middleware,
    routing::get,
    Extension, Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span};
use ulid::Ulid;

pub mod handlers;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, globals: &GlobalArgs) -> Result<()> {
    // One long-lived store handle, shared by the cache service and the
    // verifier. Their key namespaces keep them from colliding.
    let store = RedisStore::connect(&globals.redis_url)
        .await
        .context("Failed to connect to the key-value store")?;
    let store: Arc<dyn KeyValueStore> = Arc::new(store);

    let cache = CacheService::new(Arc::clone(&store), globals.cache_prefix.clone());
    let verifier = Arc::new(TurnstileVerifier::new(globals.turnstile.clone(), store)?);

    let app = router(verifier, cache, handlers::auth::router());

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!(port, "gardisto listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Build the application router. `auth` is the authentication backend
/// mounted under `/api/auth`; the Turnstile gate sits in front of it.
#[must_use]
pub fn router(verifier: Arc<TurnstileVerifier>, cache: CacheService, auth: Router) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/auth", auth)
        .layer(middleware::from_fn_with_state(verifier, turnstile_gate))
        .layer(Extension(cache))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::overriding(
                    HeaderName::from_static("x-request-id"),
                    |_request: &Request<Body>| {
                        HeaderValue::from_str(&Ulid::new().to_string()).ok()
                    },
                ))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http().make_span_with(
                    |request: &Request<Body>| {
                        let path = request.extensions().get::<MatchedPath>().map_or_else(
                            || request.uri().path().to_owned(),
                            |matched| matched.as_str().to_owned(),
                        );
                        info_span!("http_request", method = %request.method(), path = %path)
                    },
                ))
                .layer(cors),
        )
}
