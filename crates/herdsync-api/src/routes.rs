use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::Utc;
use herdsync_core::{RecordId, ServerRecord, UpsertRequest, TRACE_ID_HEADER};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::records::{RecordTable, UpsertOutcome};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub records: Arc<RecordTable>,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            records: Arc::new(RecordTable::new()),
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/records/{id}", put(upsert_record).get(get_record))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    records: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        records: state.records.len().await,
    })
}

async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    if token != state.config.api_token {
        tracing::warn!(path = %request.uri().path(), "Rejected request with unknown token");
        return Err(AppError::unauthorized("Unknown bearer token"));
    }
    Ok(next.run(request).await)
}

async fn upsert_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpsertRequest>,
) -> Result<(StatusCode, Json<ServerRecord>), AppError> {
    let id = parse_record_id(&id)?;
    if let Some(header) = headers.get(TRACE_ID_HEADER).and_then(|value| value.to_str().ok()) {
        if header != request.trace_id.to_string() {
            return Err(AppError::bad_request(
                "X-Trace-Id header does not match traceId",
            ));
        }
    }

    let outcome = state.records.upsert(id, request).await?;
    let status = match &outcome {
        UpsertOutcome::Created(_) => StatusCode::CREATED,
        UpsertOutcome::Updated(_) | UpsertOutcome::Replayed(_) => StatusCode::OK,
    };
    let record = outcome.into_record();
    tracing::info!(
        endpoint = "upsert_record",
        record_id = %id,
        local_version = record.local_version,
        status = status.as_u16(),
        "Handled record upsert"
    );
    Ok((status, Json(record)))
}

async fn get_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerRecord>, AppError> {
    let id = parse_record_id(&id)?;
    state
        .records
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(id.to_string()))
}

fn parse_record_id(value: &str) -> Result<RecordId, AppError> {
    value
        .parse()
        .map_err(|_| AppError::bad_request("record id must be a UUID"))
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}
