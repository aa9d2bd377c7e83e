//! Application configuration
//!
//! Loaded once at startup from a TOML file, with defaults for every field
//! so a bare `labmon` run works out of the box.
//!
//! ## Loading order
//!
//! 1. `LABMON_CONFIG` environment variable (path to a TOML file)
//! 2. `labmon.toml` in the current working directory
//! 3. Built-in defaults

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{EngineError, EngineResult};

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub data: DataConfig,
    pub readings: ReadingsConfig,
    pub machine: MachineConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP bind address.
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding instruments.json, setups.json, readings.json.
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadingsConfig {
    /// Global cap on retained readings; oldest entries drop on overflow.
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// State machine evaluation rate in ticks per second.
    pub tick_hz: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Default TCP port for addresses without an explicit one.
    pub port: u16,
    /// Per-operation deadline in milliseconds.
    pub timeout_ms: u64,
    /// Perform the LOCK/UNLOCK dance around every operation.
    pub lock_per_operation: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: "./data".to_string(),
        }
    }
}

impl Default for ReadingsConfig {
    fn default() -> Self {
        Self {
            max_entries: crate::store::ReadingsLog::DEFAULT_MAX_ENTRIES,
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self { tick_hz: 1.0 }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: crate::transport::DEFAULT_PORT,
            timeout_ms: 2000,
            lock_per_operation: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            data: DataConfig::default(),
            readings: ReadingsConfig::default(),
            machine: MachineConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load following the documented order. Missing files fall back to
    /// defaults; present but invalid files are errors.
    pub fn load() -> EngineResult<Self> {
        if let Ok(path) = std::env::var("LABMON_CONFIG") {
            info!(path = %path, "loading config from LABMON_CONFIG");
            return Self::from_file(Path::new(&path));
        }
        let default_path = Path::new("labmon.toml");
        if default_path.exists() {
            info!("loading config from ./labmon.toml");
            return Self::from_file(default_path);
        }
        info!("no config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        for warning in check_unknown_keys(&text) {
            tracing::warn!("config: {warning}");
        }
        let config: Self = toml::from_str(&text).map_err(|e| EngineError::Corruption {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks with field-level messages.
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.machine.tick_hz > 0.0 && self.machine.tick_hz.is_finite()) {
            return Err(EngineError::validation(
                "machine.tick_hz",
                "must be a positive number",
            ));
        }
        if self.transport.timeout_ms == 0 {
            return Err(EngineError::validation(
                "transport.timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.readings.max_entries == 0 {
            return Err(EngineError::validation(
                "readings.max_entries",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn transport_deadline(&self) -> Duration {
        Duration::from_millis(self.transport.timeout_ms)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.machine.tick_hz)
    }
}

// ============================================================================
// Unknown-key detection
// ============================================================================

/// A non-fatal config warning (typo, unknown key). Warnings never break an
/// existing config; serde ignores unknown keys, this just tells the
/// operator about them.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub key: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown key '{}'", self.key)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " — did you mean '{s}'?")?;
        }
        Ok(())
    }
}

/// Valid dotted key paths. Maintained manually to match the structs above;
/// a new field needs an entry here too.
fn known_config_keys() -> &'static [&'static str] {
    &[
        "server",
        "server.addr",
        "data",
        "data.dir",
        "readings",
        "readings.max_entries",
        "machine",
        "machine.tick_hz",
        "transport",
        "transport.port",
        "transport.timeout_ms",
        "transport.lock_per_operation",
    ]
}

/// Two-pass parse: deserialize into `toml::Value`, walk the key tree, and
/// compare every dotted path against the known set.
pub fn check_unknown_keys(text: &str) -> Vec<ValidationWarning> {
    let Ok(value) = toml::from_str::<toml::Value>(text) else {
        // A syntax error will surface from the real parse with a better
        // message; nothing to warn about here.
        return Vec::new();
    };
    let mut warnings = Vec::new();
    walk_keys(&value, "", &mut warnings);
    warnings
}

fn walk_keys(value: &toml::Value, prefix: &str, warnings: &mut Vec<ValidationWarning>) {
    let toml::Value::Table(table) = value else {
        return;
    };
    for (key, child) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if known_config_keys().contains(&path.as_str()) {
            walk_keys(child, &path, warnings);
        } else {
            warnings.push(ValidationWarning {
                suggestion: closest_key(&path),
                key: path,
            });
        }
    }
}

/// Closest known key by edit distance, if it is close enough to look like
/// a typo.
fn closest_key(key: &str) -> Option<String> {
    known_config_keys()
        .iter()
        .map(|candidate| (edit_distance(key, candidate), *candidate))
        .min()
        .filter(|(distance, _)| *distance <= 3)
        .map(|(_, candidate)| candidate.to_string())
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}
