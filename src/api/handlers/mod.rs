//! Request handlers, grouped by resource

mod instruments;
mod readings;
mod runtime;
mod setups;

pub use instruments::{
    create_instrument, delete_instrument, list_instruments, send_command, update_instrument,
};
pub use readings::{export_readings_csv, list_readings};
pub use runtime::{
    collect_once, collect_start, collect_status, collect_stop, machine_start, machine_status,
    machine_stop, system_status,
};
pub use setups::{create_setup, delete_setup, list_setups, update_setup};

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::ApiContext;

/// GET /health — liveness, uptime, and collection counts.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_s: u64,
    pub instruments: usize,
    pub setups: usize,
    pub readings: usize,
}

pub async fn health(State(context): State<ApiContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_s: context.started_at.elapsed().as_secs(),
        instruments: context.catalog.instruments().await.len(),
        setups: context.catalog.setups().await.len(),
        readings: context.readings.len().await,
    })
}
