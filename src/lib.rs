//! labmon: automated measurement workflows for laboratory instruments
//!
//! Instruments speak a text-command protocol at `host/device` addresses;
//! monitoring setups bind them to a sampling cadence and, optionally, a
//! state machine that reconfigures them as sensor values and timers evolve.
//!
//! ## Architecture
//!
//! - **Transport**: sessions over the wire protocol (LAN + mock)
//! - **Store**: instruments/setups/readings as atomic JSON documents
//! - **Collector**: per-setup periodic sampling with scaling and status
//! - **Machine**: per-setup state machine driving instrument modes
//! - **API**: HTTP/JSON control surface over the injected services

pub mod api;
pub mod collector;
pub mod config;
pub mod error;
pub mod machine;
pub mod model;
pub mod store;
pub mod transport;

// Re-export the handful of types nearly every consumer touches.
pub use config::AppConfig;
pub use error::{EngineError, EngineResult};
pub use model::{Instrument, MonitoringSetup, Reading};
