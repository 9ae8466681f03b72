//! Gateway orchestration: the only surface the hosting server invokes.
//!
//! Per request: resolve the path (or fall through), ensure the shard
//! directory exists, authenticate against the current settings snapshot,
//! then hand off to the CGI runner.  Authorization is fully resolved before
//! any subprocess is spawned.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{debug, error, instrument};

use crate::gateway::auth;
use crate::gateway::cgi::{CgiContext, CgiRunner};
use crate::gateway::path;
use crate::metrics::MetricsRegistry;
use crate::settings::SettingsStore;

/// Challenge sent with 401 responses that should prompt for Basic auth.
const BASIC_CHALLENGE: &str = "Basic realm=\"Git Repository\"";

// ---------------------------------------------------------------------------
// Shared state + router
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
pub struct GatewayState {
    pub settings: Arc<SettingsStore>,
    pub cgi: Arc<dyn CgiRunner>,
    pub metrics: MetricsRegistry,
}

/// Build the axum [`Router`]: health, metrics, and the catch-all gateway.
pub fn create_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_git_request)
        .with_state(state)
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_metrics(State(state): State<Arc<GatewayState>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Outcome of running a request through the gateway.
#[derive(Debug)]
pub enum GatewayOutcome {
    /// The path is not ours; control belongs to the next handler.
    NotHandled,
    /// A response to relay, successful or otherwise.
    Handled(Response),
}

async fn handle_git_request(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    match gateway_response(&state, request).await {
        Ok(GatewayOutcome::Handled(response)) => response,
        Ok(GatewayOutcome::NotHandled) => {
            (StatusCode::NOT_FOUND, "Not found.").into_response()
        }
        Err(err) => err.into_response(),
    }
}

/// The request state machine.  Every rejection before authentication falls
/// through; everything after is terminal for the request.
#[instrument(skip(state, request), fields(path = %request.uri().path()))]
pub async fn gateway_response(
    state: &GatewayState,
    request: Request,
) -> Result<GatewayOutcome, GatewayError> {
    // One snapshot per request; never re-read mid-flight.
    let settings = state.settings.current();

    let raw_path = request.uri().path().to_string();
    let relative = match path::strip_base_path(&raw_path, &settings.base_path) {
        Some(relative) => relative,
        None => return Ok(GatewayOutcome::NotHandled),
    };

    let identity = match path::resolve(relative) {
        Ok(identity) => identity,
        Err(reason) => {
            debug!(?reason, "path not resolvable; passing through");
            state.metrics.path_rejections_total.inc();
            return Ok(GatewayOutcome::NotHandled);
        }
    };

    state.metrics.requests_total.inc();

    // The shard directory must exist before the backend runs; creation is
    // idempotent and safe under concurrent requests.
    let repository_root = Path::new(settings.repositories_directory.as_str());
    let project_root = identity.project_root(repository_root);
    tokio::fs::create_dir_all(&project_root)
        .await
        .map_err(|err| {
            GatewayError::Internal(anyhow::Error::new(err).context(format!(
                "failed to create shard directory: {}",
                project_root.display()
            )))
        })?;

    // Authentication, then authorization.  Neither spawns anything.
    let credentials = auth::extract_basic_credentials(request.headers()).map_err(|rejection| {
        state.metrics.auth_failures_total.inc();
        GatewayError::Unauthorized {
            message: rejection.message,
            challenge: rejection.include_challenge,
        }
    })?;

    if !auth::authorize(&settings, &identity.logical_path(), &credentials) {
        state.metrics.auth_failures_total.inc();
        // No challenge here: an authenticated-but-denied caller is told no
        // more than a caller with a bad password.
        return Err(GatewayError::Unauthorized {
            message: "Unauthorized: Invalid username or password for this repository.",
            challenge: false,
        });
    }

    // Bridge.
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();

    let (parts, body) = request.into_parts();
    let context = CgiContext {
        backend_path: settings.git_backend_file_path.clone().into(),
        project_root,
        method: parts.method.as_str().to_string(),
        query_string: parts.uri.query().unwrap_or_default().to_string(),
        content_type: parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        content_length: parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        path_info: identity.remaining_path_info.clone(),
        raw_path,
        remote_addr,
        server_protocol: format!("{:?}", parts.version),
    };

    state.metrics.cgi_spawns_total.inc();
    match state.cgi.execute(context, body).await {
        Ok(response) => Ok(GatewayOutcome::Handled(response)),
        Err(err) => {
            state.metrics.cgi_errors_total.inc();
            Err(GatewayError::Internal(err))
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Request-level failures that map directly to HTTP responses.
#[derive(Debug)]
pub enum GatewayError {
    /// 401, optionally inviting a Basic-auth retry.
    Unauthorized {
        message: &'static str,
        challenge: bool,
    },
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::Unauthorized { message, challenge } => {
                if challenge {
                    (
                        StatusCode::UNAUTHORIZED,
                        [(header::WWW_AUTHENTICATE, BASIC_CHALLENGE)],
                        message,
                    )
                        .into_response()
                } else {
                    (StatusCode::UNAUTHORIZED, message).into_response()
                }
            }
            GatewayError::Internal(err) => {
                error!(error = %err, "internal gateway error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.").into_response()
            }
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
