//! The HTTP surface.
//!
//! A thin, stateless facade over the engine: the router owns nothing but an
//! `Arc` of the daemon context. Authentication is a shared bearer token
//! compared in constant time, with the status probe left open; a global
//! token bucket throttles runaway clients.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::auth::AuthToken;
use crate::engine::AllocationEngine;

mod handlers;
mod ratelimit;
mod reply;

pub use ratelimit::RateLimiter;
pub use reply::{ApiError, ErrorBody, ErrorContext};

/// Shared context handed to every handler.
pub struct ServerState {
    /// The allocation engine.
    pub engine: Arc<AllocationEngine>,
    /// The bearer token requests must present.
    pub token: AuthToken,
    /// Global request-rate bucket.
    pub limiter: RateLimiter,
    /// Daemon start time, for the uptime field.
    pub started_at: Instant,
}

/// Alias for the router state.
pub type AppState = Arc<ServerState>;

/// Default rate-limit burst capacity.
pub const RATE_CAPACITY: u32 = 100;

/// Default rate-limit refill per second.
pub const RATE_REFILL_PER_SEC: u32 = 50;

impl ServerState {
    /// Build the shared state.
    #[must_use]
    pub fn new(engine: Arc<AllocationEngine>, token: AuthToken) -> Self {
        Self {
            engine,
            token,
            limiter: RateLimiter::new(RATE_CAPACITY, RATE_REFILL_PER_SEC),
            started_at: Instant::now(),
        }
    }
}

/// Build the full router.
#[must_use]
pub fn router(state: AppState) -> Router {
    let open = Router::new().route("/status", get(handlers::status));

    let protected = Router::new()
        .route("/allocate", post(handlers::allocate))
        .route("/allocate/{lock_id}", delete(handlers::release))
        .route("/check/{port}", get(handlers::check))
        .route("/scan", get(handlers::scan))
        .route("/cleanup", post(handlers::cleanup))
        .route("/allocations", get(handlers::allocations))
        .route("/config", get(handlers::config))
        .route("/health", get(handlers::health))
        .route("/instance/register", post(handlers::register_instance))
        .route("/instance/{id}/heartbeat", put(handlers::heartbeat))
        .route("/instance/list", get(handlers::instances))
        .route("/suggest/{service_type}", get(handlers::suggest))
        .route("/observe", post(handlers::observe))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_bearer,
        ));

    open.merge(protected)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            throttle,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bearer-token middleware.
async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented: Option<String> = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(ToString::to_string);

    match presented {
        None => ApiError(crate::error::Error::AuthRequired).into_response(),
        Some(token) if !state.token.verify(&token) => {
            ApiError(crate::error::Error::AuthInvalid).into_response()
        }
        Some(_) => next.run(request).await,
    }
}

/// Rate-limit middleware.
async fn throttle(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.limiter.try_acquire() {
        next.run(request).await
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "success": false,
                "error": "rate limit exceeded",
                "code": "RATE_LIMITED",
            })),
        )
            .into_response()
    }
}
