//! Instrument transport — sessions over a text-command protocol
//!
//! An instrument lives at `host[:port]/device`. A session accepts opaque
//! ASCII command strings: commands ending in `?` are queries and yield a
//! reply line, everything else is a bare write. The transport never retries
//! and never interprets command contents.
//!
//! Implementations:
//! - [`LanTransport`]: newline-delimited text over TCP, optional per-operation
//!   LOCK/UNLOCK dance, per-operation deadline.
//! - [`MockFactory`]: scripted in-memory double for tests and simulation.

mod lan;
mod mock;

pub use lan::{LanFactory, LanTransport};
pub use mock::{MockFactory, MockTransport, ScriptedInstrument};

use async_trait::async_trait;
use std::time::Duration;

/// Default per-operation deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(2);

/// Default TCP port when the address does not carry one.
pub const DEFAULT_PORT: u16 = 5025;

// ============================================================================
// Addressing
// ============================================================================

/// Parsed wire address of an instrument: `host[:port]/device`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstrumentAddress {
    pub host: String,
    pub port: u16,
    pub device: String,
}

impl InstrumentAddress {
    /// Parse `host[:port]/device`. The device part may be empty for
    /// single-endpoint hosts (`"10.0.0.7/"` or just `"10.0.0.7"`).
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TransportError::BadAddress {
                address: raw.to_string(),
                reason: "empty address".to_string(),
            });
        }

        let (endpoint, device) = match raw.split_once('/') {
            Some((e, d)) => (e, d),
            None => (raw, ""),
        };

        let (host, port) = match endpoint.rsplit_once(':') {
            Some((h, p)) => {
                let port = p.parse::<u16>().map_err(|_| TransportError::BadAddress {
                    address: raw.to_string(),
                    reason: format!("invalid port '{p}'"),
                })?;
                (h, port)
            }
            None => (endpoint, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(TransportError::BadAddress {
                address: raw.to_string(),
                reason: "empty host".to_string(),
            });
        }

        Ok(Self {
            host: host.to_string(),
            port,
            device: device.to_string(),
        })
    }

    /// Key identifying the underlying session: one session per (host, device).
    pub fn session_key(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.device)
    }
}

impl std::fmt::Display for InstrumentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.device)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Transport-level failures. Reported to the caller as-is; the transport
/// performs no retries.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The address string could not be parsed.
    #[error("bad address '{address}': {reason}")]
    BadAddress { address: String, reason: String },

    /// The session could not be opened.
    #[error("instrument unreachable at {address}: {reason}")]
    Unreachable { address: String, reason: String },

    /// No reply within the configured deadline.
    #[error("instrument did not reply within {ms} ms")]
    Timeout { ms: u64 },

    /// The peer replied with something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer refused to grant the device lock.
    #[error("device lock refused: {0}")]
    Locked(String),
}

impl TransportError {
    /// True for failures that a later sampling pass may recover from.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Locked(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

// ============================================================================
// Traits
// ============================================================================

/// One open session to a `(host, device)` endpoint.
///
/// Calls are serialized by the owner: a session never sees a second request
/// while one is in flight.
#[async_trait]
pub trait TransportSession: Send {
    /// Send a query command (ends with `?`) and return the reply line.
    async fn query(&mut self, command: &str) -> TransportResult<String>;

    /// Send a command that expects no reply.
    async fn write(&mut self, command: &str) -> TransportResult<()>;

    /// Release the session. Errors on close are not actionable.
    async fn close(&mut self);

    /// Dispatch on the `?` suffix: query for queries, write otherwise.
    /// Returns the reply for queries, `None` for writes.
    async fn send(&mut self, command: &str) -> TransportResult<Option<String>> {
        if command.trim_end().ends_with('?') {
            Ok(Some(self.query(command).await?))
        } else {
            self.write(command).await?;
            Ok(None)
        }
    }
}

/// Opens sessions. Injected into the collector and the state machine engine
/// so tests can substitute [`MockFactory`].
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        address: &InstrumentAddress,
    ) -> TransportResult<Box<dyn TransportSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_address() {
        let addr = InstrumentAddress::parse("lab-gw.local:9100/gpib0,12").unwrap();
        assert_eq!(addr.host, "lab-gw.local");
        assert_eq!(addr.port, 9100);
        assert_eq!(addr.device, "gpib0,12");
    }

    #[test]
    fn test_parse_defaults_port() {
        let addr = InstrumentAddress::parse("10.0.0.7/inst0").unwrap();
        assert_eq!(addr.port, DEFAULT_PORT);
        assert_eq!(addr.device, "inst0");
    }

    #[test]
    fn test_parse_host_only() {
        let addr = InstrumentAddress::parse("10.0.0.7").unwrap();
        assert_eq!(addr.host, "10.0.0.7");
        assert_eq!(addr.device, "");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(InstrumentAddress::parse("").is_err());
        assert!(InstrumentAddress::parse("/dev").is_err());
        assert!(InstrumentAddress::parse("host:notaport/dev").is_err());
    }

    #[test]
    fn test_session_key_distinguishes_devices() {
        let a = InstrumentAddress::parse("h/inst0").unwrap();
        let b = InstrumentAddress::parse("h/inst1").unwrap();
        assert_ne!(a.session_key(), b.session_key());
    }
}
