//! Instrument records and capability descriptors
//!
//! The persisted instrument document keeps the capability as stringified
//! JSON in `description` for compatibility with existing files. A
//! description that is not JSON at all is treated as free text (the
//! instrument then has no capability and cannot participate in setups); a
//! JSON object that fails the capability schema is a hard error.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// A laboratory instrument reachable at `host[:port]/device`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instrument {
    pub id: i64,
    pub name: String,
    /// Wire address, `host[:port]/device`.
    pub address: String,
    /// Stringified capability JSON, or operator free text.
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl Instrument {
    /// Parse the capability out of `description`.
    ///
    /// Returns `Ok(None)` for free-text descriptions, `Err(Corruption)` for
    /// JSON that does not match the capability schema.
    pub fn capability(&self) -> EngineResult<Option<Capability>> {
        let trimmed = self.description.trim();
        if !trimmed.starts_with('{') {
            return Ok(None);
        }
        serde_json::from_str::<Capability>(trimmed)
            .map(Some)
            .map_err(|e| EngineError::Corruption {
                path: format!("instrument '{}' description", self.name),
                message: e.to_string(),
            })
    }

    /// Replace the capability, re-stringifying into `description`.
    pub fn set_capability(&mut self, capability: &Capability) -> EngineResult<()> {
        self.description =
            serde_json::to_string(capability).map_err(EngineError::internal)?;
        Ok(())
    }
}

// ============================================================================
// Capability descriptor
// ============================================================================

/// What an instrument can measure and how it is configured.
///
/// Field names are camelCase on the wire — the descriptor round-trips
/// byte-compatibly with files written by earlier tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    #[serde(default)]
    pub signals: Vec<Signal>,
    #[serde(default)]
    pub modes: Vec<Mode>,
    #[serde(default)]
    pub signal_mode_configs: Vec<SignalModeConfig>,
}

/// A measurable quantity with its query command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub id: String,
    pub name: String,
    /// Opaque query command, typically terminated by `?`.
    pub measure_command: String,
}

/// A named instrument configuration with enable/disable command scripts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enable_commands: Vec<String>,
    #[serde(default)]
    pub disable_commands: Vec<String>,
    /// Parameter names referenced as `{name}` in the command scripts.
    #[serde(default)]
    pub parameters: Vec<ModeParameter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModeParameter {
    pub name: String,
}

/// One cell of the signal×mode matrix: how a signal reads in a mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalModeConfig {
    pub mode_id: String,
    pub signal_id: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_scaling")]
    pub scaling_factor: f64,
}

fn default_scaling() -> f64 {
    1.0
}

impl Capability {
    pub fn signal(&self, id: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.id == id)
    }

    pub fn signal_by_name(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub fn mode(&self, id: &str) -> Option<&Mode> {
        self.modes.iter().find(|m| m.id == id)
    }

    /// Matrix lookup; absence means the signal is not measured in the mode.
    pub fn config_for(&self, mode_id: &str, signal_id: &str) -> Option<&SignalModeConfig> {
        self.signal_mode_configs
            .iter()
            .find(|c| c.mode_id == mode_id && c.signal_id == signal_id)
    }

    /// Signals measured in a mode, in the order signals are declared.
    pub fn signals_in_mode<'a>(
        &'a self,
        mode_id: &str,
    ) -> Vec<(&'a Signal, &'a SignalModeConfig)> {
        self.signals
            .iter()
            .filter_map(|s| self.config_for(mode_id, &s.id).map(|c| (s, c)))
            .collect()
    }

    /// Internal consistency: unique ids and names, matrix cells resolving.
    pub fn validate(&self) -> EngineResult<()> {
        let mut seen = std::collections::HashSet::new();
        for signal in &self.signals {
            if !seen.insert(&signal.id) {
                return Err(EngineError::validation(
                    "capability.signals",
                    format!("duplicate signal id '{}'", signal.id),
                ));
            }
        }
        seen.clear();
        for mode in &self.modes {
            if !seen.insert(&mode.id) {
                return Err(EngineError::validation(
                    "capability.modes",
                    format!("duplicate mode id '{}'", mode.id),
                ));
            }
        }
        for config in &self.signal_mode_configs {
            if self.mode(&config.mode_id).is_none() {
                return Err(EngineError::validation(
                    "capability.signalModeConfigs",
                    format!("unknown mode id '{}'", config.mode_id),
                ));
            }
            if self.signal(&config.signal_id).is_none() {
                return Err(EngineError::validation(
                    "capability.signalModeConfigs",
                    format!("unknown signal id '{}'", config.signal_id),
                ));
            }
        }
        Ok(())
    }
}
