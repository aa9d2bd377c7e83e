//! LAN transport — newline-delimited text commands over TCP
//!
//! One TCP connection per `(host, device)` session. Commands are written
//! verbatim with a trailing `\n`; replies are single lines. When the gateway
//! requires exclusive access, the per-operation lock dance is performed
//! transparently: `LOCK <device>` → command → `UNLOCK <device>`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{
    InstrumentAddress, TransportError, TransportFactory, TransportResult, TransportSession,
};

/// Factory producing [`LanTransport`] sessions.
#[derive(Debug, Clone)]
pub struct LanFactory {
    /// Per-operation deadline.
    pub deadline: Duration,
    /// Perform the LOCK/UNLOCK dance around every operation.
    pub lock_per_operation: bool,
}

impl LanFactory {
    pub fn new(deadline: Duration, lock_per_operation: bool) -> Self {
        Self {
            deadline,
            lock_per_operation,
        }
    }
}

#[async_trait]
impl TransportFactory for LanFactory {
    async fn open(
        &self,
        address: &InstrumentAddress,
    ) -> TransportResult<Box<dyn TransportSession>> {
        let session = LanTransport::open(address, self.deadline, self.lock_per_operation).await?;
        Ok(Box::new(session))
    }
}

/// One open TCP session to an instrument gateway.
pub struct LanTransport {
    address: InstrumentAddress,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    deadline: Duration,
    lock_per_operation: bool,
}

impl LanTransport {
    /// Connect to `host:port`. Fails with `Unreachable` when the connection
    /// cannot be established within the deadline.
    pub async fn open(
        address: &InstrumentAddress,
        deadline: Duration,
        lock_per_operation: bool,
    ) -> TransportResult<Self> {
        let endpoint = format!("{}:{}", address.host, address.port);
        let stream = tokio::time::timeout(deadline, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| TransportError::Unreachable {
                address: address.to_string(),
                reason: format!("connect timed out after {} ms", deadline.as_millis()),
            })?
            .map_err(|e| TransportError::Unreachable {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(address = %address, "could not set TCP_NODELAY: {e}");
        }

        let (read_half, write_half) = stream.into_split();
        debug!(address = %address, "transport session opened");

        Ok(Self {
            address: address.clone(),
            reader: BufReader::new(read_half),
            writer: write_half,
            deadline,
            lock_per_operation,
        })
    }

    async fn send_line(&mut self, line: &str) -> TransportResult<()> {
        // Commands are opaque: sent byte-for-byte, only the terminator added.
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        tokio::time::timeout(self.deadline, self.writer.write_all(&bytes))
            .await
            .map_err(|_| TransportError::Timeout {
                ms: self.deadline.as_millis() as u64,
            })?
            .map_err(|e| TransportError::Protocol(format!("write failed: {e}")))
    }

    async fn read_line(&mut self) -> TransportResult<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(self.deadline, self.reader.read_line(&mut line))
            .await
            .map_err(|_| TransportError::Timeout {
                ms: self.deadline.as_millis() as u64,
            })?
            .map_err(|e| TransportError::Protocol(format!("read failed: {e}")))?;
        if n == 0 {
            return Err(TransportError::Protocol(
                "connection closed by peer".to_string(),
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// `LOCK <device>` → expect `ok`. A `locked`/`busy` reply maps to
    /// [`TransportError::Locked`], anything else to `Protocol`.
    async fn acquire_lock(&mut self) -> TransportResult<()> {
        let device = self.address.device.clone();
        self.send_line(&format!("LOCK {device}")).await?;
        let reply = self.read_line().await?;
        let lowered = reply.to_ascii_lowercase();
        if lowered.starts_with("ok") {
            Ok(())
        } else if lowered.contains("lock") || lowered.contains("busy") {
            Err(TransportError::Locked(reply))
        } else {
            Err(TransportError::Protocol(format!(
                "unexpected lock reply: {reply}"
            )))
        }
    }

    /// Best-effort `UNLOCK <device>`. The reply is drained but not checked;
    /// a failed unlock surfaces on the next lock attempt.
    async fn release_lock(&mut self) {
        let device = self.address.device.clone();
        if self.send_line(&format!("UNLOCK {device}")).await.is_ok() {
            let _ = self.read_line().await;
        }
    }
}

#[async_trait]
impl TransportSession for LanTransport {
    async fn query(&mut self, command: &str) -> TransportResult<String> {
        if self.lock_per_operation {
            self.acquire_lock().await?;
        }
        let result = async {
            self.send_line(command).await?;
            self.read_line().await
        }
        .await;
        if self.lock_per_operation {
            self.release_lock().await;
        }
        result
    }

    async fn write(&mut self, command: &str) -> TransportResult<()> {
        if self.lock_per_operation {
            self.acquire_lock().await?;
        }
        let result = self.send_line(command).await;
        if self.lock_per_operation {
            self.release_lock().await;
        }
        result
    }

    async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(address = %self.address, "shutdown on close: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
    use tokio::net::TcpListener;

    /// Minimal in-test gateway: answers `VAL?` with `4.2`, supports LOCK/UNLOCK.
    async fn spawn_gateway() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (r, mut w) = stream.into_split();
                    let mut lines = TokioBufReader::new(r).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply = if line.starts_with("LOCK") || line.starts_with("UNLOCK") {
                            Some("ok".to_string())
                        } else if line.ends_with('?') {
                            Some("4.2".to_string())
                        } else {
                            None
                        };
                        if let Some(reply) = reply {
                            if w.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let gw = spawn_gateway().await;
        let address =
            InstrumentAddress::parse(&format!("127.0.0.1:{}/inst0", gw.port())).unwrap();
        let mut session = LanTransport::open(&address, Duration::from_secs(1), false)
            .await
            .unwrap();
        let reply = session.query("VAL?").await.unwrap();
        assert_eq!(reply, "4.2");
        session.close().await;
    }

    #[tokio::test]
    async fn test_lock_dance_is_transparent() {
        let gw = spawn_gateway().await;
        let address =
            InstrumentAddress::parse(&format!("127.0.0.1:{}/inst0", gw.port())).unwrap();
        let mut session = LanTransport::open(&address, Duration::from_secs(1), true)
            .await
            .unwrap();
        assert_eq!(session.query("VAL?").await.unwrap(), "4.2");
        session.write("MODE A").await.unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn test_lock_refused_maps_to_locked() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (r, mut w) = stream.into_split();
                    let mut lines = TokioBufReader::new(r).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if line.starts_with("LOCK") {
                            let _ = w.write_all(b"locked by another host\n").await;
                        }
                    }
                });
            }
        });

        let address =
            InstrumentAddress::parse(&format!("127.0.0.1:{}/inst0", addr.port())).unwrap();
        let mut session = LanTransport::open(&address, Duration::from_secs(1), true)
            .await
            .unwrap();
        let err = session.query("VAL?").await.err().unwrap();
        assert!(matches!(err, TransportError::Locked(_)));
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        // Port 1 on localhost is virtually always closed.
        let address = InstrumentAddress::parse("127.0.0.1:1/inst0").unwrap();
        let err = LanTransport::open(&address, Duration::from_millis(500), false)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_send_dispatches_on_suffix() {
        let gw = spawn_gateway().await;
        let address =
            InstrumentAddress::parse(&format!("127.0.0.1:{}/inst0", gw.port())).unwrap();
        let mut session = LanTransport::open(&address, Duration::from_secs(1), false)
            .await
            .unwrap();
        assert_eq!(session.send("VAL?").await.unwrap(), Some("4.2".to_string()));
        assert_eq!(session.send("MODE A").await.unwrap(), None);
        session.close().await;
    }
}
