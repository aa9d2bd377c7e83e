//! Collector and state machine lifecycle endpoints

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::{ApiContext, ApiError};
use crate::collector::CollectorStatus;
use crate::machine::MachineStatus;
use crate::model::Reading;

/// One row of the system overview: what a setup is doing right now.
#[derive(Debug, Serialize)]
pub struct SetupOverview {
    pub setup_id: i64,
    pub name: String,
    pub collecting: bool,
    pub driving: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /status — per-setup runtime overview for dashboard polling.
pub async fn system_status(State(context): State<ApiContext>) -> Json<Vec<SetupOverview>> {
    let mut overview = Vec::new();
    for setup in context.catalog.setups().await {
        let collect = context.collector.status(setup.id).await;
        let machine = context.machine.status(setup.id).await;
        overview.push(SetupOverview {
            setup_id: setup.id,
            name: setup.name,
            collecting: collect.running,
            driving: machine.running,
            current_state_id: machine.current_state_id,
            last_success_ts: collect.last_success_ts,
            last_error: collect.last_error.or(machine.last_error),
        });
    }
    Json(overview)
}

/// POST /collect/{id}/start — idempotent.
pub async fn collect_start(
    State(context): State<ApiContext>,
    Path(id): Path<i64>,
) -> Result<Json<CollectorStatus>, ApiError> {
    Ok(Json(context.collector.start(id).await?))
}

/// POST /collect/{id}/stop — idempotent.
pub async fn collect_stop(
    State(context): State<ApiContext>,
    Path(id): Path<i64>,
) -> Result<Json<CollectorStatus>, ApiError> {
    Ok(Json(context.collector.stop(id).await?))
}

/// POST /collect/{id}/once — one synchronous sampling pass; returns the
/// produced sample.
pub async fn collect_once(
    State(context): State<ApiContext>,
    Path(id): Path<i64>,
) -> Result<Json<Reading>, ApiError> {
    Ok(Json(context.collector.collect_now(id).await?))
}

/// GET /collect/{id}/status
pub async fn collect_status(
    State(context): State<ApiContext>,
    Path(id): Path<i64>,
) -> Json<CollectorStatus> {
    Json(context.collector.status(id).await)
}

/// POST /sm/{id}/start — returns the session status.
pub async fn machine_start(
    State(context): State<ApiContext>,
    Path(id): Path<i64>,
) -> Result<Json<MachineStatus>, ApiError> {
    Ok(Json(context.machine.start(id).await?))
}

/// POST /sm/{id}/stop — idempotent.
pub async fn machine_stop(
    State(context): State<ApiContext>,
    Path(id): Path<i64>,
) -> Result<Json<MachineStatus>, ApiError> {
    Ok(Json(context.machine.stop(id).await?))
}

/// GET /sm/{id}/status
pub async fn machine_status(
    State(context): State<ApiContext>,
    Path(id): Path<i64>,
) -> Json<MachineStatus> {
    Json(context.machine.status(id).await)
}
