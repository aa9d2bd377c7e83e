//! Route definitions
//!
//! The endpoint set of the control surface, mounted at the root:
//! - /instruments            CRUD + direct command
//! - /setups                 CRUD
//! - /collect/{id}/*         collector lifecycle
//! - /sm/{id}/*              state machine lifecycle
//! - /readings               newest-first slice + CSV export
//! - /health, /status        liveness and per-setup overview

use axum::routing::{delete, get, post, put};
use axum::Router;

use super::handlers;
use super::ApiContext;

/// Create all routes for the control surface.
pub fn api_routes(context: ApiContext) -> Router {
    Router::new()
        // Instruments
        .route("/instruments", get(handlers::list_instruments))
        .route("/instruments", post(handlers::create_instrument))
        .route("/instruments/:id", put(handlers::update_instrument))
        .route("/instruments/:id", delete(handlers::delete_instrument))
        .route("/instruments/:id/command", post(handlers::send_command))
        // Setups
        .route("/setups", get(handlers::list_setups))
        .route("/setups", post(handlers::create_setup))
        .route("/setups/:id", put(handlers::update_setup))
        .route("/setups/:id", delete(handlers::delete_setup))
        // Collector
        .route("/collect/:id/start", post(handlers::collect_start))
        .route("/collect/:id/stop", post(handlers::collect_stop))
        .route("/collect/:id/once", post(handlers::collect_once))
        .route("/collect/:id/status", get(handlers::collect_status))
        // State machine
        .route("/sm/:id/start", post(handlers::machine_start))
        .route("/sm/:id/stop", post(handlers::machine_stop))
        .route("/sm/:id/status", get(handlers::machine_status))
        // Readings
        .route("/readings", get(handlers::list_readings))
        .route("/readings/export.csv", get(handlers::export_readings_csv))
        // Liveness + overview
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::system_status))
        .with_state(context)
}
