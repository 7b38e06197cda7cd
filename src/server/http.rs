//! REST facade over the schedule store
//!
//! CRUD on `/schedules` plus `/health` (store ping) and `/metrics`
//! (Prometheus text format). The facade is deliberately dumb: it validates
//! nothing about schedule semantics; a schedule with an unparseable cron
//! expression is stored happily and rejected later by the reconciler.

use crate::model::Schedule;
use crate::server::metrics::SharedMetrics;
use crate::server::ShutdownSignal;
use crate::store::{ScheduleStore, StoreError};
use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// What the facade needs from the persistence layer
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn create(&self, schedule: &mut Schedule) -> Result<(), StoreError>;
    async fn find_all(&self) -> Result<Vec<Schedule>, StoreError>;
    async fn update(&self, schedule: &Schedule) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<Schedule, StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl ScheduleRepository for ScheduleStore {
    async fn create(&self, schedule: &mut Schedule) -> Result<(), StoreError> {
        ScheduleStore::create(self, schedule).await
    }

    async fn find_all(&self) -> Result<Vec<Schedule>, StoreError> {
        ScheduleStore::find_all(self).await
    }

    async fn update(&self, schedule: &Schedule) -> Result<(), StoreError> {
        ScheduleStore::update(self, schedule).await
    }

    async fn delete(&self, id: &str) -> Result<Schedule, StoreError> {
        ScheduleStore::delete(self, id).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        ScheduleStore::ping(self).await
    }
}

/// Shared state for the API handlers
#[derive(Clone)]
pub struct ApiState {
    repository: Arc<dyn ScheduleRepository>,
    metrics: SharedMetrics,
}

impl ApiState {
    pub fn new(repository: Arc<dyn ScheduleRepository>, metrics: SharedMetrics) -> Self {
        Self {
            repository,
            metrics,
        }
    }
}

/// API failure rendered as an HTTP status plus a plain-text message
enum ApiError {
    Store(StoreError),
    Malformed(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Malformed(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Malformed(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Store(e) => {
                let status = match e {
                    StoreError::NotFound => StatusCode::NOT_FOUND,
                    StoreError::AlreadyExists => StatusCode::CONFLICT,
                    StoreError::Timeout | StoreError::Backend(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
        };
        (status, message).into_response()
    }
}

/// Build the application router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/schedules/{id}",
            axum::routing::put(update_schedule).delete(delete_schedule),
        )
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the API until `shutdown` fires
pub async fn run_server(
    port: u16,
    state: ApiState,
    mut shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    // Log after successful bind - the server is actually listening
    info!(port = %port, "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

async fn list_schedules(State(state): State<ApiState>) -> Result<Json<Vec<Schedule>>, ApiError> {
    let schedules = state.repository.find_all().await?;
    Ok(Json(schedules))
}

async fn create_schedule(
    State(state): State<ApiState>,
    payload: Result<Json<Schedule>, JsonRejection>,
) -> Result<(StatusCode, Json<Schedule>), ApiError> {
    let Json(mut schedule) = payload?;
    state.repository.create(&mut schedule).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn update_schedule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<Schedule>, JsonRejection>,
) -> Result<Json<Schedule>, ApiError> {
    let Json(mut schedule) = payload?;
    // The path id is authoritative over whatever the body carries
    schedule.id = id;
    state.repository.update(&schedule).await?;
    Ok(Json(schedule))
}

async fn delete_schedule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Schedule>, ApiError> {
    let removed = state.repository.delete(&id).await?;
    Ok(Json(removed))
}

async fn health(State(state): State<ApiState>) -> Result<&'static str, ApiError> {
    state.repository.ping().await?;
    Ok("OK")
}

async fn metrics(State(state): State<ApiState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}
