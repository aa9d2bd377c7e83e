//! Instrument gateway simulator
//!
//! A TCP server speaking the newline text protocol, for demos and manual
//! end-to-end runs without bench hardware. Queries get jittered numeric
//! replies; `*IDN?` identifies; LOCK/UNLOCK always succeed; everything
//! else is acknowledged silently, like a real gateway.
//!
//! ```bash
//! labmon-simulator --port 5025 --base 12.5 --noise 0.05
//! ```

use clap::Parser;
use rand::Rng;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "labmon-simulator")]
#[command(about = "Simulated instrument gateway for labmon")]
#[command(version)]
struct CliArgs {
    /// TCP port to listen on
    #[arg(short, long, default_value = "5025")]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Base value returned for measurement queries
    #[arg(long, default_value = "12.5")]
    base: f64,

    /// Relative noise amplitude applied to measurement replies
    #[arg(long, default_value = "0.02")]
    noise: f64,

    /// Drift added per second of uptime. Lets threshold transitions fire
    /// in demos: start below a sensor rule's threshold and ramp past it.
    #[arg(long, default_value = "0.0")]
    ramp: f64,
}

#[derive(Debug, Clone)]
struct SimConfig {
    base: f64,
    noise: f64,
    ramp: f64,
    started: std::time::Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        "simulator listening on {addr} (base {}, noise {}, ramp {}/s)",
        args.base, args.noise, args.ramp
    );

    let config = Arc::new(SimConfig {
        base: args.base,
        noise: args.noise,
        ramp: args.ramp,
        started: std::time::Instant::now(),
    });

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "session opened");
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            if let Err(e) = serve_session(stream, config).await {
                debug!(%peer, "session ended: {e}");
            }
            info!(%peer, "session closed");
        });
    }
}

async fn serve_session(stream: TcpStream, config: Arc<SimConfig>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if let Some(reply) = respond(command, &config) {
            write_half.write_all(reply.as_bytes()).await?;
            write_half.write_all(b"\n").await?;
        }
    }
    Ok(())
}

/// Reply for one command, `None` for silent acknowledgment.
fn respond(command: &str, config: &SimConfig) -> Option<String> {
    let upper = command.to_ascii_uppercase();

    if upper.starts_with("LOCK") || upper.starts_with("UNLOCK") {
        return Some("ok".to_string());
    }
    if upper == "*IDN?" {
        return Some("labmon,simulated-gateway,0,1.0".to_string());
    }
    if command.ends_with('?') {
        return Some(format!("{:.6e}", measurement(command, config)));
    }

    // Bare writes (mode enables, configuration) are acknowledged silently.
    if upper.contains("ERR") {
        warn!(command, "command looks like an error probe");
    }
    None
}

/// Deterministic per-command baseline plus optional ramp and uniform
/// jitter, so distinct signals on one gateway read as distinct series.
fn measurement(command: &str, config: &SimConfig) -> f64 {
    let salt = command
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    let offset = f64::from(salt % 100) / 100.0;
    let drift = config.ramp * config.started.elapsed().as_secs_f64();
    let jitter = rand::thread_rng().gen_range(-config.noise..=config.noise);
    (config.base + offset + drift) * (1.0 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimConfig {
        SimConfig {
            base: 12.5,
            noise: 0.0,
            ramp: 0.0,
            started: std::time::Instant::now(),
        }
    }

    #[test]
    fn test_lock_dance_replies_ok() {
        assert_eq!(respond("LOCK inst0", &config()).as_deref(), Some("ok"));
        assert_eq!(respond("UNLOCK inst0", &config()).as_deref(), Some("ok"));
    }

    #[test]
    fn test_queries_reply_writes_do_not() {
        assert!(respond("MEAS:VOLT?", &config()).is_some());
        assert!(respond("CONF:VOLT DC", &config()).is_none());
    }

    #[test]
    fn test_measurement_is_parseable_and_stable_per_command() {
        let c = config();
        let a: f64 = respond("MEAS:VOLT?", &c).unwrap().parse().unwrap();
        let b: f64 = respond("MEAS:VOLT?", &c).unwrap().parse().unwrap();
        assert_eq!(a, b); // zero noise → deterministic
        let other: f64 = respond("MEAS:CURR?", &c).unwrap().parse().unwrap();
        assert_ne!(a, other);
    }
}
