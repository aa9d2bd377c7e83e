//! Instrument CRUD and the direct-command passthrough

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{ApiContext, ApiError};
use crate::model::Instrument;
use crate::store::{InstrumentDraft, InstrumentPatch};
use crate::transport::InstrumentAddress;

/// GET /instruments
pub async fn list_instruments(
    State(context): State<ApiContext>,
) -> Json<Vec<Instrument>> {
    Json(context.catalog.instruments().await)
}

/// POST /instruments — 201 with the created record.
pub async fn create_instrument(
    State(context): State<ApiContext>,
    Json(draft): Json<InstrumentDraft>,
) -> Result<(StatusCode, Json<Instrument>), ApiError> {
    let created = context.catalog.create_instrument(draft).await?;
    info!(id = created.id, name = %created.name, "instrument created");
    Ok((StatusCode::CREATED, Json(created)))
}

/// PUT /instruments/{id} — partial update, absent fields untouched.
pub async fn update_instrument(
    State(context): State<ApiContext>,
    Path(id): Path<i64>,
    Json(patch): Json<InstrumentPatch>,
) -> Result<Json<Instrument>, ApiError> {
    let updated = context.catalog.update_instrument(id, patch).await?;
    Ok(Json(updated))
}

/// DELETE /instruments/{id} — 204; 409 while referenced by a setup.
pub async fn delete_instrument(
    State(context): State<ApiContext>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    context.catalog.delete_instrument(id).await?;
    info!(id, "instrument deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    /// Reply line for queries; null for bare writes.
    pub response: Option<String>,
}

/// POST /instruments/{id}/command — send one raw command over a fresh
/// session. Queries (`...?`) return the reply, writes return null.
pub async fn send_command(
    State(context): State<ApiContext>,
    Path(id): Path<i64>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let instrument = context.catalog.instrument(id).await?;
    let address = InstrumentAddress::parse(&instrument.address)
        .map_err(crate::error::EngineError::Transport)?;

    let mut session = context
        .transports
        .open(&address)
        .await
        .map_err(crate::error::EngineError::Transport)?;
    let result = session
        .send(&request.command)
        .await
        .map_err(crate::error::EngineError::Transport);
    session.close().await;

    Ok(Json(CommandResponse { response: result? }))
}
