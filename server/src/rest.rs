use crate::alerts;
use crate::db;
use crate::errors::Error;
use crate::model::{
    Alert, PowerAggregate, PowerReading, PowerStats, TemperatureAggregate, TemperatureReading,
    TemperatureStats,
};
use crate::ws::{ws_handler, Broadcaster};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub broadcaster: Arc<Broadcaster>,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    device_id: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct AggregateQuery {
    interval: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    device_id: Option<String>,
    acknowledged: Option<bool>,
    limit: Option<i64>,
}

pub fn create_router(pool: PgPool, broadcaster: Arc<Broadcaster>) -> Router {
    let state = AppState { pool, broadcaster };

    Router::new()
        .route("/api/v1/readings/temperature", get(readings_temperature))
        .route("/api/v1/readings/pzem004t", get(readings_pzem004t))
        .route("/api/v1/stats/temperature/:device_id", get(stats_temperature))
        .route("/api/v1/stats/pzem004t/:device_id", get(stats_pzem004t))
        .route(
            "/api/v1/aggregated/temperature/:device_id",
            get(aggregated_temperature),
        )
        .route(
            "/api/v1/aggregated/pzem004t/:device_id",
            get(aggregated_pzem004t),
        )
        .route("/api/v1/alerts", get(list_alerts))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn readings_temperature(
    State(state): State<AppState>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<Vec<TemperatureReading>>, AppError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let readings = db::temperature_readings(
        &state.pool,
        params.device_id.as_deref(),
        params.start_time,
        params.end_time,
        limit,
    )
    .await?;
    Ok(Json(readings))
}

async fn readings_pzem004t(
    State(state): State<AppState>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<Vec<PowerReading>>, AppError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let readings = db::power_readings(
        &state.pool,
        params.device_id.as_deref(),
        params.start_time,
        params.end_time,
        limit,
    )
    .await?;
    Ok(Json(readings))
}

async fn stats_temperature(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<WindowQuery>,
) -> Result<Json<TemperatureStats>, AppError> {
    let stats =
        db::temperature_stats(&state.pool, &device_id, params.start_time, params.end_time).await?;
    Ok(Json(stats))
}

async fn stats_pzem004t(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<WindowQuery>,
) -> Result<Json<PowerStats>, AppError> {
    let stats =
        db::power_stats(&state.pool, &device_id, params.start_time, params.end_time).await?;
    Ok(Json(stats))
}

async fn aggregated_temperature(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<AggregateQuery>,
) -> Result<Json<Vec<TemperatureAggregate>>, AppError> {
    let interval = params.interval.as_deref().unwrap_or("1 hour");
    let buckets = db::temperature_aggregate(
        &state.pool,
        &device_id,
        interval,
        params.start_time,
        params.end_time,
    )
    .await?;
    Ok(Json(buckets))
}

async fn aggregated_pzem004t(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<AggregateQuery>,
) -> Result<Json<Vec<PowerAggregate>>, AppError> {
    let interval = params.interval.as_deref().unwrap_or("1 hour");
    let buckets = db::power_aggregate(
        &state.pool,
        &device_id,
        interval,
        params.start_time,
        params.end_time,
    )
    .await?;
    Ok(Json(buckets))
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertsQuery>,
) -> Result<Json<Vec<Alert>>, AppError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let alerts = alerts::recent_alerts(
        &state.pool,
        params.device_id.as_deref(),
        params.acknowledged,
        limit,
    )
    .await?;
    Ok(Json(alerts))
}

pub struct AppError(StatusCode, anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.1);
        (self.0, format!("{}", self.1)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::InvalidInterval(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, err.into())
    }
}
