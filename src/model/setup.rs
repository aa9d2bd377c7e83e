//! Monitoring setups — targets, cadence, and the optional state machine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance for sensor-rule equality comparisons.
pub const EQUALITY_EPSILON: f64 = 1e-9;

/// A named configuration binding instruments, a sampling cadence, and an
/// optional state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringSetup {
    pub id: i64,
    pub name: String,
    /// Readings produced per second. Must be positive.
    pub frequency_hz: f64,
    /// Participating instruments with per-setup parameters.
    #[serde(rename = "instruments")]
    pub targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<MachineState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    #[serde(
        rename = "initialStateID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub initial_state_id: Option<String>,
}

impl MonitoringSetup {
    /// Sampling period derived from the cadence.
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.frequency_hz)
    }

    /// True when the setup defines a state machine worth driving.
    pub fn has_machine(&self) -> bool {
        self.initial_state_id.is_some() && !self.states.is_empty()
    }

    pub fn state(&self, id: &str) -> Option<&MachineState> {
        self.states.iter().find(|s| s.id == id)
    }

    /// Outgoing transitions of a state, in the order they appear in the
    /// setup. That order is the deterministic tie-break for simultaneous
    /// matches.
    pub fn transitions_from<'a>(&'a self, state_id: &str) -> Vec<&'a Transition> {
        self.transitions
            .iter()
            .filter(|t| t.source_state_id == state_id)
            .collect()
    }
}

/// The pairing of an instrument with per-setup parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub instrument_id: i64,
    #[serde(default)]
    pub parameters: TargetParameters,
}

/// Per-target parameters: the standing mode selection plus free-form mode
/// parameters substituted into command templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TargetParameters {
    #[serde(rename = "modeId", default, skip_serializing_if = "Option::is_none")]
    pub mode_id: Option<String>,
    #[serde(flatten)]
    pub mode_params: BTreeMap<String, serde_json::Value>,
}

// ============================================================================
// State machine
// ============================================================================

/// One state: entry applies the instrument settings, entry into an end
/// state terminates the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineState {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_end_state: bool,
    /// instrument id → mode selection applied on entry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instrument_settings: BTreeMap<i64, ModeSelection>,
}

/// Mode plus substitution parameters for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModeSelection {
    pub mode_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mode_params: BTreeMap<String, serde_json::Value>,
}

/// An edge between states, gated by the conjunction of its rules.
/// A transition with zero rules never fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub id: String,
    pub source_state_id: String,
    pub target_state_id: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A predicate evaluated each tick. Exactly one variant per rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rule {
    /// Latest-sample signal value against a threshold. A signal that is
    /// missing from the sample (or failed to parse) makes the rule false,
    /// never an error.
    Sensor {
        signal_name: String,
        operator: CompareOp,
        threshold: f64,
    },
    /// Time spent in the current state reaches `seconds`.
    TimeInState { seconds: f64 },
    /// Total session time reaches `seconds`.
    TotalTime { seconds: f64 },
}

/// Comparison operator for sensor rules. Serializes as the symbol; the
/// Unicode forms are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=", alias = "≥")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=", alias = "≤")]
    Le,
    #[serde(rename = "=", alias = "==")]
    Eq,
    #[serde(rename = "!=", alias = "≠")]
    Ne,
}

impl CompareOp {
    /// Apply the operator. Equality uses `|a − b| ≤ ε` with ε = 1e-9.
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
            Self::Eq => (value - threshold).abs() <= EQUALITY_EPSILON,
            Self::Ne => (value - threshold).abs() > EQUALITY_EPSILON,
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "=",
            Self::Ne => "!=",
        };
        write!(f, "{symbol}")
    }
}

/// String form of a mode parameter value for `{name}` substitution.
/// Strings substitute without quotes; everything else uses its JSON form.
pub fn param_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
