//! Readings queries and CSV export

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::api::{ApiContext, ApiError};
use crate::error::EngineError;
use crate::model::Reading;

/// Default slice size when the query does not carry a limit.
const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    pub setup_id: Option<i64>,
    pub limit: Option<usize>,
    /// Restrict to readings at most this many seconds old.
    pub since_s: Option<f64>,
}

/// GET /readings?setup_id&limit&since_s — newest first.
pub async fn list_readings(
    State(context): State<ApiContext>,
    Query(query): Query<ReadingsQuery>,
) -> Json<Vec<Reading>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    match (query.setup_id, query.since_s) {
        (Some(setup_id), Some(since_s)) if since_s >= 0.0 => {
            let age = std::time::Duration::from_secs_f64(since_s);
            let mut slice = context.readings.since(setup_id, age).await;
            slice.truncate(limit);
            Json(slice)
        }
        _ => Json(context.readings.list(query.setup_id, limit).await),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub setup_id: Option<i64>,
}

/// GET /readings/export.csv?setup_id — one row per signal measurement,
/// oldest first (natural order for spreadsheet import).
pub async fn export_readings_csv(
    State(context): State<ApiContext>,
    Query(query): Query<ExportQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mut readings = context
        .readings
        .list(query.setup_id, context.readings.max_entries())
        .await;
    readings.reverse();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "timestamp",
            "setup_id",
            "setup_name",
            "instrument",
            "mode",
            "signal",
            "value",
            "raw_value",
            "unit",
            "raw_response",
            "error",
        ])
        .map_err(EngineError::internal)?;

    for reading in &readings {
        let timestamp = reading.timestamp.to_rfc3339();
        for target in &reading.targets {
            for (signal_name, signal) in &target.signals {
                let record: Vec<String> = vec![
                    timestamp.clone(),
                    reading.setup_id.to_string(),
                    reading.setup_name.clone(),
                    target.instrument_name.clone(),
                    target.mode_name.clone(),
                    signal_name.clone(),
                    signal.value.map(|v| v.to_string()).unwrap_or_default(),
                    signal.raw_value.map(|v| v.to_string()).unwrap_or_default(),
                    signal.unit.clone(),
                    signal.raw_response.clone(),
                    signal.error.clone().unwrap_or_default(),
                ];
                writer.write_record(&record).map_err(EngineError::internal)?;
            }
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| EngineError::internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"readings.csv\"",
            ),
        ],
        bytes,
    ))
}
