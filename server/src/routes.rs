//! HTTP route handlers for the TopPet hub.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /ws` - WebSocket endpoint for contest viewers
//! - `GET /api/contests/{contest_id}/chat/ws` - same, pre-subscribed to one contest
//! - `POST /events` - Signed event ingestion from the contest, vote and chat services
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration (including auth settings)
//! - The [`HubHandle`] every connection and publisher talks to
//! - The viewer [`Authenticator`] and the inbound [`ActionHandler`]
//! - The ingest rate limiter
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use toppet_server::config::Config;
//! use toppet_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config);
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket},
        DefaultBodyLimit, Path, Query, Request, State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, trace, warn, Span};

use crate::actions::ContestActions;
use crate::auth::{verify_signature, AuthError, Authenticator, StaticTokenAuthenticator};
use crate::chat::BroadcastingChatService;
use crate::config::Config;
use crate::connection::{ActionHandler, Session};
use crate::hub::HubHandle;
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::types::{ContestId, HubEvent, UserId};

// ============================================================================
// Constants
// ============================================================================

/// Header name for the publisher identifier.
const HEADER_SOURCE_ID: &str = "X-Source-ID";

/// Header name for the Ed25519 signature.
const HEADER_SIGNATURE: &str = "X-Signature";

/// Header name for rate limit retry delay.
const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Maximum body size for event ingestion (1 MB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// User id given to viewers in unsafe mode when none is supplied.
const ANONYMOUS_USER: UserId = UserId(0);

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Handle to the hub coordinator.
    pub hub: HubHandle,

    /// Resolves viewer access tokens.
    pub authenticator: Arc<dyn Authenticator>,

    /// Applies actions sent by viewers.
    pub actions: Arc<dyn ActionHandler>,

    /// Per-publisher rate limiter for `POST /events`.
    pub ingest_limiter: RateLimiter<String>,

    /// Per-user chat rate limiter, shared with the chat service.
    pub chat_limiter: RateLimiter<UserId>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Builds the state from configuration and starts the hub.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub = HubHandle::spawn(config.hub);
        let authenticator = Arc::new(StaticTokenAuthenticator::new(&config.user_tokens));
        Self::with_components(config, hub, authenticator)
    }

    /// Builds the state around an existing hub and authenticator.
    #[must_use]
    pub fn with_components(
        config: Config,
        hub: HubHandle,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let chat_limiter = RateLimiter::new(config.chat_rate, config.chat_burst);
        let chat = BroadcastingChatService::new(hub.clone(), chat_limiter.clone());
        let actions = ContestActions::new(hub.clone(), Arc::new(chat));

        Self {
            config: Arc::new(config),
            hub,
            authenticator,
            actions: Arc::new(actions),
            ingest_limiter: RateLimiter::default(),
            chat_limiter,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("hub", &self.hub)
            .field("ingest_limiter", &"<RateLimiter>")
            .field("chat_limiter", &"<RateLimiter>")
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/events", post(post_events))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .route("/ws", get(get_ws))
        .route("/api/contests/{contest_id}/chat/ws", get(get_contest_ws))
        .route("/health", get(get_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Span for one HTTP request.
///
/// Records the path only: viewers may pass their access token in the query
/// string, so the full URI must never reach the logs.
fn request_span(request: &Request) -> Span {
    info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        version = ?request.version(),
    )
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

fn error_response(status: StatusCode, message: &str, code: &str) -> Response {
    (status, Json(ErrorResponse::new(message).with_code(code))).into_response()
}

// ============================================================================
// GET /ws - Viewer WebSocket
// ============================================================================

/// Query parameters accepted on the WebSocket endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct WsQueryParams {
    /// Viewer access token. May also be sent as `Authorization: Bearer`.
    #[serde(rename = "accessToken")]
    pub access_token: Option<String>,

    /// Trusted user id, honoured only when `unsafe_no_auth` is enabled.
    pub user_id: Option<i64>,
}

/// GET /ws - WebSocket endpoint for contest viewers.
///
/// # Authentication
///
/// Unless `unsafe_no_auth` is enabled, an access token is required, either
/// as the `accessToken` query parameter or as an `Authorization: Bearer`
/// header.
///
/// # WebSocket Protocol
///
/// Clients send `subscribe`, `unsubscribe` and `message` frames (see
/// [`crate::protocol`]) and receive [`HubEvent`] JSON frames for the
/// contests they are subscribed to.
///
/// # Responses
///
/// - `101 Switching Protocols` - WebSocket upgrade successful
/// - `401 Unauthorized` - Missing or invalid token
async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let user_id = match admit(&state, &params, &headers).await {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    upgrade(state, ws, user_id, None)
}

/// GET /api/contests/{contest_id}/chat/ws - viewer WebSocket pre-subscribed
/// to `contest_id`.
async fn get_contest_ws(
    State(state): State<AppState>,
    Path(contest_id): Path<String>,
    Query(params): Query<WsQueryParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let user_id = match admit(&state, &params, &headers).await {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    let contest_id = ContestId::new(contest_id);
    if contest_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "missing contest id", "invalid_contest");
    }
    upgrade(state, ws, user_id, Some(contest_id))
}

/// Resolves the viewer's identity, or the 401 response to send instead.
async fn admit(state: &AppState, params: &WsQueryParams, headers: &HeaderMap) -> Result<UserId, Response> {
    if state.config.unsafe_no_auth {
        return Ok(params.user_id.map_or(ANONYMOUS_USER, UserId));
    }

    let token = params
        .access_token
        .as_deref()
        .filter(|token| !token.is_empty())
        .or_else(|| bearer_token(headers));

    let Some(token) = token else {
        debug!("Missing access token in WebSocket request");
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "access token is required",
            "missing_token",
        ));
    };

    state.authenticator.authenticate(token).await.map_err(|err| {
        debug!(error = %err, "Rejected WebSocket access token");
        match err {
            AuthError::MissingToken => error_response(
                StatusCode::UNAUTHORIZED,
                "access token is required",
                "missing_token",
            ),
            _ => error_response(StatusCode::UNAUTHORIZED, "invalid access token", "invalid_token"),
        }
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn upgrade(
    state: AppState,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    user_id: UserId,
    contest_id: Option<ContestId>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(error = %rejection, "Request is not a WebSocket upgrade");
            return rejection.into_response();
        }
    };

    info!(user_id = %user_id, contest_id = ?contest_id, "WebSocket client connecting");
    // Bounds what the transport buffers before the session ever sees a frame.
    let max_frame_bytes = state.config.session.max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| handle_websocket(socket, state, user_id, contest_id))
}

/// Registers the connection with the hub and runs its session to completion.
async fn handle_websocket(
    socket: WebSocket,
    state: AppState,
    user_id: UserId,
    contest_id: Option<ContestId>,
) {
    let registration = state.hub.register(user_id).await;
    if let Some(contest_id) = contest_id {
        state
            .hub
            .subscribe(registration.connection.id(), contest_id)
            .await;
    }

    let (sink, stream) = socket.split();
    Session::new(
        state.hub.clone(),
        registration,
        Arc::clone(&state.actions),
        state.config.session,
    )
    .run(sink, stream)
    .await;
}

// ============================================================================
// POST /events - Event Ingestion
// ============================================================================

/// One event to hand to the hub.
#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub event: HubEvent,

    /// Restricts delivery to this user's connections in the event's room.
    #[serde(default)]
    pub target_user_id: Option<UserId>,
}

/// Request body for event ingestion: a single request or an array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DispatchPayload {
    Single(DispatchRequest),
    Batch(Vec<DispatchRequest>),
}

impl DispatchPayload {
    fn into_requests(self) -> Vec<DispatchRequest> {
        match self {
            Self::Single(request) => vec![request],
            Self::Batch(requests) => requests,
        }
    }
}

/// POST /events - Ingest events from the TopPet services.
///
/// # Authentication
///
/// Unless `unsafe_no_auth` is enabled, requests must include:
/// - `X-Source-ID` header: publisher identifier
/// - `X-Signature` header: Ed25519 signature of the request body
///
/// # Rate Limiting
///
/// Requests are rate-limited per source. If the limit is exceeded,
/// returns 429 with a `Retry-After` header.
///
/// # Responses
///
/// - `202 Accepted` - Events handed to the hub
/// - `400 Bad Request` - Invalid payload or an event without a contest
/// - `401 Unauthorized` - Authentication failed
/// - `429 Too Many Requests` - Rate limit exceeded
async fn post_events(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let source_id = match headers.get(HEADER_SOURCE_ID).and_then(|v| v.to_str().ok()) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            debug!("Missing or empty X-Source-ID header");
            return error_response(
                StatusCode::UNAUTHORIZED,
                "missing X-Source-ID header",
                "missing_source",
            );
        }
    };

    if !state.config.unsafe_no_auth {
        let signature = match headers.get(HEADER_SIGNATURE).and_then(|v| v.to_str().ok()) {
            Some(sig) if !sig.is_empty() => sig,
            _ => {
                debug!(source = %source_id, "Missing or empty X-Signature header");
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "missing X-Signature header",
                    "missing_signature",
                );
            }
        };

        if let Err(err) = verify_signature(&source_id, signature, &body, &state.config.public_keys) {
            warn!(source = %source_id, error = %err, "Signature verification failed");
            let (message, code) = match err {
                AuthError::UnknownSource(_) => ("unknown source", "unknown_source"),
                AuthError::InvalidBase64(_) => ("invalid signature encoding", "invalid_encoding"),
                AuthError::InvalidPublicKey => ("server configuration error", "server_error"),
                AuthError::InvalidSignature | AuthError::MissingToken | AuthError::InvalidToken => {
                    ("invalid signature", "invalid_signature")
                }
            };
            return error_response(StatusCode::UNAUTHORIZED, message, code);
        }
    }

    if let RateLimitResult::Limited { retry_after_secs } =
        state.ingest_limiter.check(source_id.clone()).await
    {
        info!(source = %source_id, retry_after = retry_after_secs, "Rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(HEADER_RETRY_AFTER, retry_after_secs.to_string())],
            Json(ErrorResponse::new("rate limit exceeded").with_code("rate_limited")),
        )
            .into_response();
    }

    let requests = match serde_json::from_slice::<DispatchPayload>(&body) {
        Ok(payload) => payload.into_requests(),
        Err(err) => {
            debug!(source = %source_id, error = %err, "Failed to parse dispatch payload");
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid event format: {err}"),
                "invalid_format",
            );
        }
    };

    if requests.iter().any(|request| request.event.contest_id().is_empty()) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "event contest_id cannot be empty",
            "invalid_event",
        );
    }

    let count = requests.len();
    for DispatchRequest {
        event,
        target_user_id,
    } in requests
    {
        trace!(source = %source_id, kind = event.kind(), contest_id = %event.contest_id(), "Dispatching event");
        match target_user_id {
            Some(user_id) => state.hub.send_to_user(event.contest_id(), user_id, &event),
            None => state.hub.publish(&event),
        }
    }

    info!(source = %source_id, event_count = count, "Events accepted");
    StatusCode::ACCEPTED.into_response()
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of live viewer connections.
    pub connections: usize,

    /// Number of contest rooms with at least one viewer.
    pub rooms: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint. No authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.hub.stats().await;

    Json(HealthResponse {
        status: "ok".to_string(),
        connections: stats.connections,
        rooms: stats.rooms,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
