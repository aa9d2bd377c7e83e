//! Reading records — one sample per setup per tick

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One produced sample for a setup at one instant.
///
/// Setup and instrument names are denormalized so readings stay
/// interpretable after their setup is edited or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    /// UTC, microsecond precision, strictly monotonic per setup.
    pub timestamp: DateTime<Utc>,
    pub setup_id: i64,
    pub setup_name: String,
    pub targets: Vec<TargetReading>,
}

/// Per-target block of a sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetReading {
    pub instrument_id: i64,
    pub instrument_name: String,
    /// Name of the mode the target was measured in; empty when no mode
    /// could be resolved.
    #[serde(default)]
    pub mode_name: String,
    pub signals: BTreeMap<String, SignalReading>,
    /// Target-level failure (no mode resolved, session lost).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One signal's measurement within a sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalReading {
    /// Scaled engineering value; null when the reply did not parse or the
    /// query failed.
    pub value: Option<f64>,
    /// Parsed value before scaling.
    pub raw_value: Option<f64>,
    pub unit: String,
    /// Verbatim instrument reply (empty on transport failure).
    pub raw_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reading {
    /// Value of the first signal with this name across the sample's
    /// targets. Used by sensor rules; `None` covers both "not measured"
    /// and "did not parse".
    pub fn signal_value(&self, signal_name: &str) -> Option<f64> {
        self.targets
            .iter()
            .find_map(|t| t.signals.get(signal_name))
            .and_then(|s| s.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Reading {
        let mut signals = BTreeMap::new();
        signals.insert(
            "v".to_string(),
            SignalReading {
                value: Some(12.5),
                raw_value: Some(0.0125),
                unit: "V".to_string(),
                raw_response: "1.25e-2".to_string(),
                error: None,
            },
        );
        signals.insert(
            "i".to_string(),
            SignalReading {
                value: None,
                raw_value: None,
                unit: "A".to_string(),
                raw_response: "OVLD".to_string(),
                error: Some("could not parse reply as a number".to_string()),
            },
        );
        Reading {
            timestamp: Utc::now(),
            setup_id: 1,
            setup_name: "bake".to_string(),
            targets: vec![TargetReading {
                instrument_id: 3,
                instrument_name: "dmm".to_string(),
                mode_name: "dc".to_string(),
                signals,
                error: None,
            }],
        }
    }

    #[test]
    fn test_signal_value_lookup() {
        let reading = sample();
        assert_eq!(reading.signal_value("v"), Some(12.5));
        assert_eq!(reading.signal_value("i"), None);
        assert_eq!(reading.signal_value("missing"), None);
    }

    #[test]
    fn test_reading_round_trip() {
        let reading = sample();
        let json = serde_json::to_string(&reading).unwrap();
        let back: Reading = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reading);
    }

    #[test]
    fn test_clean_signal_omits_error_key() {
        let reading = sample();
        let json = serde_json::to_value(&reading).unwrap();
        let signals = &json["targets"][0]["signals"];
        assert!(signals["v"].get("error").is_none());
        assert!(signals["i"].get("error").is_some());
    }
}
