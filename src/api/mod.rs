//! HTTP/JSON control surface
//!
//! Thin axum layer over the injected services: catalog, readings log,
//! collector, and state machine engine. Handlers never hold engine state of
//! their own; everything flows through [`ApiContext`].

pub mod handlers;
mod routes;

pub use routes::api_routes;

use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::collector::Collector;
use crate::error::EngineError;
use crate::machine::MachineEngine;
use crate::store::{Catalog, ReadingsLog};
use crate::transport::{TransportError, TransportFactory};

/// Services injected into every handler.
#[derive(Clone)]
pub struct ApiContext {
    pub catalog: Arc<Catalog>,
    pub readings: Arc<ReadingsLog>,
    pub collector: Arc<Collector>,
    pub machine: Arc<MachineEngine>,
    pub transports: Arc<dyn TransportFactory>,
    pub started_at: Instant,
}

/// Create the complete application router.
pub fn create_app(context: ApiContext) -> Router {
    // CORS is permissive: the surface is meant for a trusted lab network.
    let cors = CorsLayer::permissive();

    api_routes(context)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// API error with a consistent `{ "error": { code, message } }` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: axum::http::StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        use axum::http::StatusCode;
        let (status, code) = match &err {
            EngineError::Validation { .. } => (StatusCode::BAD_REQUEST, "VALIDATION"),
            EngineError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            EngineError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            EngineError::ParameterMissing { .. } => {
                (StatusCode::BAD_REQUEST, "PARAMETER_MISSING")
            }
            EngineError::Transport(transport) => match transport {
                TransportError::Timeout { .. } => {
                    (StatusCode::GATEWAY_TIMEOUT, "TRANSPORT_TIMEOUT")
                }
                TransportError::BadAddress { .. } => (StatusCode::BAD_REQUEST, "VALIDATION"),
                _ => (StatusCode::BAD_GATEWAY, "TRANSPORT"),
            },
            EngineError::Corruption { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "CORRUPTION")
            }
            EngineError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        (self.status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_status_mapping() {
        let conflict: ApiError = EngineError::conflict("name taken").into();
        assert_eq!(conflict.status, StatusCode::CONFLICT);

        let missing: ApiError = EngineError::not_found("setup", 9).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let timeout: ApiError =
            EngineError::Transport(TransportError::Timeout { ms: 2000 }).into();
        assert_eq!(timeout.status, StatusCode::GATEWAY_TIMEOUT);

        let invalid: ApiError = EngineError::validation("frequency_hz", "positive").into();
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
    }
}
