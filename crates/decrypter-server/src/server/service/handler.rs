//! HTTP handlers for password verification.
//!
//! This module defines the axum [`Router`] served by the binary:
//!
//! - `POST /decrypt` - verify `{"HashedPassword", "Password"}` and answer
//!   `{"match": bool}`.
//! - `GET /healthz` - 200 with pool counters while serving, 503 once the pool
//!   has begun shutting down.
//!
//! Handlers stay thin: parsing, a single pool submission, and mapping the
//! pool's errors onto status codes. All CPU work happens on the pool.

use crate::server::telemetry::Metrics;
use axum::{
    Json, Router,
    extract::{MatchedPath, Request, State, rejection::JsonRejection},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use core::time::Duration;
use decrypter::{Credentials, Error, VerifierPool};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Instant};
use tower_http::trace::TraceLayer;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pool: Arc<VerifierPool>,
    metrics: Arc<Metrics>,
    submit_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(
        pool: Arc<VerifierPool>,
        metrics: Arc<Metrics>,
        submit_timeout: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            metrics,
            submit_timeout,
        }
    }
}

/// Request body of `POST /decrypt`.
///
/// Field names follow the service's original wire format; snake_case aliases
/// are accepted as well.
#[derive(Debug, Deserialize)]
pub struct DecryptRequest {
    #[serde(rename = "HashedPassword", alias = "hashed_password")]
    pub hashed_password: String,
    #[serde(rename = "Password", alias = "password")]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecryptResponse {
    #[serde(rename = "match")]
    pub is_match: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub workers: usize,
    pub live_workers: usize,
    pub queued: usize,
    pub busy: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Errors a handler can answer with.
#[derive(Debug)]
pub enum ApiError {
    /// The body was not the expected JSON.
    BadRequest(String),
    /// The pool could not produce a verdict.
    Pool(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Pool(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(format!(
            "{}. Expected {{\"HashedPassword\": string, \"Password\": string}}",
            rejection.body_text()
        ))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Pool(err) => {
                let status = match err {
                    Error::PoolClosed | Error::Cancelled | Error::DeadlineExceeded(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    Error::InvalidWorkerCount(_)
                    | Error::InvalidConfig { .. }
                    | Error::NoRuntime
                    | Error::ChannelError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/decrypt", post(decrypt))
        .route("/healthz", get(healthz))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_latency))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Verifies one credential pair on the pool.
///
/// A malformed stored hash is answered with `{"match": false}`, not an error:
/// the caller asked whether the password matches, and it does not.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
async fn decrypt(
    State(state): State<AppState>,
    payload: Result<Json<DecryptRequest>, JsonRejection>,
) -> Result<Json<DecryptResponse>, ApiError> {
    let Json(req) = payload?;
    let creds = Credentials::new(req.hashed_password, req.password);

    let verdict = match state.submit_timeout {
        Some(deadline) => state.pool.check_timeout(creds, deadline).await,
        None => state.pool.check(creds).await,
    };

    let verdict = match verdict {
        Ok(verdict) => verdict,
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Verification failed: {e}");
            return Err(e.into());
        }
    };

    #[cfg(feature = "tracing")]
    if let decrypter::Verdict::Unverifiable(reason) = &verdict {
        tracing::debug!("Unverifiable credentials: {reason}");
    }

    Ok(Json(DecryptResponse {
        is_match: verdict.is_match(),
    }))
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let stats = state.pool.stats();
    let status = if state.pool.is_closed() || stats.live_workers < stats.workers {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(HealthResponse {
            workers: stats.workers,
            live_workers: stats.live_workers,
            queued: stats.queued,
            busy: stats.busy,
        }),
    )
}

async fn track_latency(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_owned(), |p| p.as_str().to_owned());

    let res = next.run(req).await;
    state
        .metrics
        .record_http_request(&path, res.status().as_u16(), start.elapsed());
    res
}
