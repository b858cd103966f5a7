//! Factline HTTP REST API
//!
//! Axum server exposing the temporal store over HTTP, alongside the Unix
//! socket IPC server (port 8766 by default).
//!
//! Each endpoint is a thin axum handler around an inner function that builds
//! an IPC request and runs it through the router. The inner functions are
//! directly testable without axum dispatch.
//!
//! Endpoints:
//! - GET  /health, /version
//! - POST /facts                       append a fact
//! - GET  /facts/:id
//! - POST /facts/:id/supersede
//! - POST /entities/resolve
//! - GET  /entities/:id
//! - POST /entities/:id/merge          body: {"merge_id": ...}
//! - GET  /entities/:id/facts?as_of=
//! - GET  /entities/:id/current
//! - GET  /entities/:id/history
//! - GET  /entities/:id/as-of?at=
//! - GET  /entities/:id/changes?from=&to=
//! - POST /episodes
//! - GET  /episodes/:id
//! - POST /episodes/:id/facts
//! - POST /episodes/:id/supersede
//! - POST /episodes/:id/close
//! - POST /episodes/:id/retract
//! - GET  /events                      server-sent change events

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use factline_core::ipc::{FactlineRequest, FactlineResponse};
use factline_core::models::{EntityKind, FactInput};
use factline_core::{FactEvent, FactlineConfig, TemporalMemory};
use futures::Stream;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Header naming the calling agent; fills `recorded_by` when the body
/// leaves it empty.
pub const CALLER_HEADER: &str = "x-caller-id";

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub memory: TemporalMemory,
    pub config: FactlineConfig,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/facts", post(append_handler))
        .route("/facts/:id", get(get_fact_handler))
        .route("/facts/:id/supersede", post(supersede_handler))
        .route("/entities/resolve", post(resolve_handler))
        .route("/entities/:id", get(get_entity_handler))
        .route("/entities/:id/merge", post(merge_handler))
        .route("/entities/:id/facts", get(entity_facts_handler))
        .route("/entities/:id/current", get(current_handler))
        .route("/entities/:id/history", get(history_handler))
        .route("/entities/:id/as-of", get(as_of_handler))
        .route("/entities/:id/changes", get(changes_handler))
        .route("/episodes", post(begin_episode_handler))
        .route("/episodes/:id", get(get_episode_handler))
        .route("/episodes/:id/facts", post(record_fact_handler))
        .route("/episodes/:id/supersede", post(record_superseding_handler))
        .route("/episodes/:id/close", post(close_episode_handler))
        .route("/episodes/:id/retract", post(retract_episode_handler))
        .route("/events", get(events_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    memory: TemporalMemory,
    config: FactlineConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let state = Arc::new(HttpState { memory, config });

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Factline HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub name: Option<String>,
    #[serde(default)]
    pub kind: EntityKind,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub merge_id: Uuid,
}

#[derive(Debug, Deserialize, Default)]
pub struct FactsQuery {
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct AsOfQuery {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct BeginEpisodeRequest {
    pub source: String,
    pub occurred_at: Option<DateTime<Utc>>,
    pub recorded_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EpisodeSupersedeRequest {
    pub old_fact_id: Uuid,
    #[serde(flatten)]
    pub fact: FactInput,
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

/// Inner health check: asks the backend and returns (status_code, json_body).
pub async fn health_inner(memory: &TemporalMemory, socket_path: &str) -> (StatusCode, serde_json::Value) {
    let response = crate::router::handle_request(FactlineRequest::Health, memory).await;
    match response_to_http(response) {
        Ok(data) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "backend": data["backend"],
                "socket": socket_path,
            }),
        ),
        Err((_, body)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": body["error"],
            }),
        ),
    }
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "factline/1",
    })
}

/// Run one IPC request through the router and map the outcome to HTTP.
pub async fn dispatch(
    memory: &TemporalMemory,
    request: FactlineRequest,
    success: StatusCode,
) -> (StatusCode, serde_json::Value) {
    let response = crate::router::handle_request(request, memory).await;
    match response_to_http(response) {
        Ok(data) => (success, data),
        Err(failure) => failure,
    }
}

pub async fn append_inner(
    memory: &TemporalMemory,
    mut fact: FactInput,
    caller: Option<String>,
) -> (StatusCode, serde_json::Value) {
    fill_caller(&mut fact, caller);
    dispatch(memory, FactlineRequest::Append { fact }, StatusCode::CREATED).await
}

pub async fn get_fact_inner(memory: &TemporalMemory, id: Uuid) -> (StatusCode, serde_json::Value) {
    dispatch(memory, FactlineRequest::GetFact { id }, StatusCode::OK).await
}

pub async fn supersede_inner(
    memory: &TemporalMemory,
    old_fact_id: Uuid,
    mut fact: FactInput,
    caller: Option<String>,
) -> (StatusCode, serde_json::Value) {
    fill_caller(&mut fact, caller);
    dispatch(
        memory,
        FactlineRequest::Supersede { old_fact_id, fact },
        StatusCode::CREATED,
    )
    .await
}

pub async fn resolve_inner(memory: &TemporalMemory, req: ResolveRequest) -> (StatusCode, serde_json::Value) {
    let name = match req.name {
        Some(n) if !n.trim().is_empty() => n,
        _ => return error_body(StatusCode::BAD_REQUEST, "validation", "name field is required"),
    };
    dispatch(
        memory,
        FactlineRequest::Resolve { name, kind: req.kind },
        StatusCode::OK,
    )
    .await
}

pub async fn get_entity_inner(memory: &TemporalMemory, id: Uuid) -> (StatusCode, serde_json::Value) {
    dispatch(memory, FactlineRequest::GetEntity { id }, StatusCode::OK).await
}

pub async fn merge_inner(
    memory: &TemporalMemory,
    keep_id: Uuid,
    req: MergeRequest,
) -> (StatusCode, serde_json::Value) {
    dispatch(
        memory,
        FactlineRequest::Merge {
            keep_id,
            merge_id: req.merge_id,
        },
        StatusCode::OK,
    )
    .await
}

pub async fn entity_facts_inner(
    memory: &TemporalMemory,
    entity_id: Uuid,
    query: FactsQuery,
) -> (StatusCode, serde_json::Value) {
    dispatch(
        memory,
        FactlineRequest::FactsForEntity {
            entity_id,
            as_of: query.as_of,
        },
        StatusCode::OK,
    )
    .await
}

pub async fn current_inner(memory: &TemporalMemory, entity_id: Uuid) -> (StatusCode, serde_json::Value) {
    dispatch(memory, FactlineRequest::Current { entity_id }, StatusCode::OK).await
}

pub async fn history_inner(memory: &TemporalMemory, entity_id: Uuid) -> (StatusCode, serde_json::Value) {
    dispatch(memory, FactlineRequest::History { entity_id }, StatusCode::OK).await
}

pub async fn as_of_inner(
    memory: &TemporalMemory,
    entity_id: Uuid,
    query: AsOfQuery,
) -> (StatusCode, serde_json::Value) {
    dispatch(
        memory,
        FactlineRequest::AsOf {
            entity_id,
            at: query.at,
        },
        StatusCode::OK,
    )
    .await
}

pub async fn changes_inner(
    memory: &TemporalMemory,
    entity_id: Uuid,
    query: ChangesQuery,
) -> (StatusCode, serde_json::Value) {
    if query.from > query.to {
        return error_body(StatusCode::BAD_REQUEST, "validation", "from must not be after to");
    }
    dispatch(
        memory,
        FactlineRequest::Changes {
            entity_id,
            from: query.from,
            to: query.to,
        },
        StatusCode::OK,
    )
    .await
}

pub async fn begin_episode_inner(
    memory: &TemporalMemory,
    req: BeginEpisodeRequest,
    caller: Option<String>,
) -> (StatusCode, serde_json::Value) {
    dispatch(
        memory,
        FactlineRequest::BeginEpisode {
            source: req.source,
            occurred_at: req.occurred_at,
            recorded_by: req.recorded_by.or(caller),
        },
        StatusCode::CREATED,
    )
    .await
}

pub async fn get_episode_inner(memory: &TemporalMemory, episode_id: Uuid) -> (StatusCode, serde_json::Value) {
    dispatch(memory, FactlineRequest::GetEpisode { episode_id }, StatusCode::OK).await
}

pub async fn record_fact_inner(
    memory: &TemporalMemory,
    episode_id: Uuid,
    mut fact: FactInput,
    caller: Option<String>,
) -> (StatusCode, serde_json::Value) {
    fill_caller(&mut fact, caller);
    dispatch(
        memory,
        FactlineRequest::RecordFact { episode_id, fact },
        StatusCode::CREATED,
    )
    .await
}

pub async fn record_superseding_inner(
    memory: &TemporalMemory,
    episode_id: Uuid,
    req: EpisodeSupersedeRequest,
    caller: Option<String>,
) -> (StatusCode, serde_json::Value) {
    let mut fact = req.fact;
    fill_caller(&mut fact, caller);
    dispatch(
        memory,
        FactlineRequest::RecordSuperseding {
            episode_id,
            old_fact_id: req.old_fact_id,
            fact,
        },
        StatusCode::CREATED,
    )
    .await
}

pub async fn close_episode_inner(memory: &TemporalMemory, episode_id: Uuid) -> (StatusCode, serde_json::Value) {
    dispatch(memory, FactlineRequest::CloseEpisode { episode_id }, StatusCode::OK).await
}

pub async fn retract_episode_inner(memory: &TemporalMemory, episode_id: Uuid) -> (StatusCode, serde_json::Value) {
    dispatch(memory, FactlineRequest::RetractEpisode { episode_id }, StatusCode::OK).await
}

// ============================================================================
// Axum handler wrappers (thin, delegating to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.memory, &state.config.service.socket_path).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn append_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(fact): Json<FactInput>,
) -> impl IntoResponse {
    let (status, body) = append_inner(&state.memory, fact, caller_id(&headers)).await;
    (status, Json(body))
}

pub async fn get_fact_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = get_fact_inner(&state.memory, id).await;
    (status, Json(body))
}

pub async fn supersede_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(fact): Json<FactInput>,
) -> impl IntoResponse {
    let (status, body) = supersede_inner(&state.memory, id, fact, caller_id(&headers)).await;
    (status, Json(body))
}

pub async fn resolve_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<ResolveRequest>,
) -> impl IntoResponse {
    let (status, body) = resolve_inner(&state.memory, req).await;
    (status, Json(body))
}

pub async fn get_entity_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = get_entity_inner(&state.memory, id).await;
    (status, Json(body))
}

pub async fn merge_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<MergeRequest>,
) -> impl IntoResponse {
    let (status, body) = merge_inner(&state.memory, id, req).await;
    (status, Json(body))
}

pub async fn entity_facts_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<FactsQuery>,
) -> impl IntoResponse {
    let (status, body) = entity_facts_inner(&state.memory, id, query).await;
    (status, Json(body))
}

pub async fn current_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = current_inner(&state.memory, id).await;
    (status, Json(body))
}

pub async fn history_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = history_inner(&state.memory, id).await;
    (status, Json(body))
}

pub async fn as_of_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<AsOfQuery>,
) -> impl IntoResponse {
    let (status, body) = as_of_inner(&state.memory, id, query).await;
    (status, Json(body))
}

pub async fn changes_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ChangesQuery>,
) -> impl IntoResponse {
    let (status, body) = changes_inner(&state.memory, id, query).await;
    (status, Json(body))
}

pub async fn begin_episode_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(req): Json<BeginEpisodeRequest>,
) -> impl IntoResponse {
    let (status, body) = begin_episode_inner(&state.memory, req, caller_id(&headers)).await;
    (status, Json(body))
}

pub async fn get_episode_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = get_episode_inner(&state.memory, id).await;
    (status, Json(body))
}

pub async fn record_fact_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(fact): Json<FactInput>,
) -> impl IntoResponse {
    let (status, body) = record_fact_inner(&state.memory, id, fact, caller_id(&headers)).await;
    (status, Json(body))
}

pub async fn record_superseding_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<EpisodeSupersedeRequest>,
) -> impl IntoResponse {
    let (status, body) = record_superseding_inner(&state.memory, id, req, caller_id(&headers)).await;
    (status, Json(body))
}

pub async fn close_episode_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = close_episode_inner(&state.memory, id).await;
    (status, Json(body))
}

pub async fn retract_episode_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = retract_episode_inner(&state.memory, id).await;
    (status, Json(body))
}

/// Server-sent events, one per committed write. A subscriber that falls
/// behind the bus capacity skips what it missed and keeps streaming.
pub async fn events_handler(
    State(state): State<Arc<HttpState>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.memory.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((Ok::<_, Infallible>(sse_event(&event)), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============================================================================
// Helpers
// ============================================================================

pub fn sse_event(event: &FactEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

pub fn caller_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn fill_caller(fact: &mut FactInput, caller: Option<String>) {
    if fact.recorded_by.is_none() {
        fact.recorded_by = caller;
    }
}

/// HTTP status for a `FactlineError::kind()` tag.
pub fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "validation" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "conflict" | "closed_episode" => StatusCode::CONFLICT,
        "storage_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(status: StatusCode, kind: &str, msg: impl Into<String>) -> (StatusCode, serde_json::Value) {
    (
        status,
        serde_json::json!({
            "error": msg.into(),
            "kind": kind,
            "status": "error",
        }),
    )
}

/// Convert an IPC response into an HTTP body, or a status and error body.
pub fn response_to_http(
    response: FactlineResponse,
) -> std::result::Result<serde_json::Value, (StatusCode, serde_json::Value)> {
    if response.is_ok() {
        return Ok(response.data.unwrap_or(serde_json::json!({})));
    }
    let kind = response.error_kind.unwrap_or_else(|| "internal".to_string());
    let msg = response.error.unwrap_or_else(|| "unknown error".to_string());
    Err(error_body(status_for_kind(&kind), &kind, msg))
}

// ============================================================================
// Unit Tests (inner functions called directly)
// ============================================================================
