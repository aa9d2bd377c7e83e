//! Monitoring setup CRUD

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::info;

use crate::api::{ApiContext, ApiError};
use crate::model::MonitoringSetup;
use crate::store::{SetupDraft, SetupPatch};

/// GET /setups
pub async fn list_setups(State(context): State<ApiContext>) -> Json<Vec<MonitoringSetup>> {
    Json(context.catalog.setups().await)
}

/// POST /setups — 201 with the created record.
pub async fn create_setup(
    State(context): State<ApiContext>,
    Json(draft): Json<SetupDraft>,
) -> Result<(StatusCode, Json<MonitoringSetup>), ApiError> {
    let created = context.catalog.create_setup(draft).await?;
    info!(id = created.id, name = %created.name, "setup created");
    Ok((StatusCode::CREATED, Json(created)))
}

/// PUT /setups/{id} — partial update, absent fields untouched.
pub async fn update_setup(
    State(context): State<ApiContext>,
    Path(id): Path<i64>,
    Json(patch): Json<SetupPatch>,
) -> Result<Json<MonitoringSetup>, ApiError> {
    let updated = context.catalog.update_setup(id, patch).await?;
    Ok(Json(updated))
}

/// DELETE /setups/{id} — 204. A running collector or machine session
/// notices the missing setup on its next tick and stops itself.
pub async fn delete_setup(
    State(context): State<ApiContext>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    context.catalog.delete_setup(id).await?;
    info!(id, "setup deleted");
    Ok(StatusCode::NO_CONTENT)
}
