//! Transition rule evaluation
//!
//! One `evaluate` function with an arm per rule kind; a transition holds
//! iff it has at least one rule and every rule holds. A sensor rule whose
//! signal is absent from the latest sample (not measured in the current
//! mode, or unparseable) is false, never an error.

use std::time::Duration;

use crate::model::{Reading, Rule, Transition};

/// Everything a tick knows when judging rules.
pub struct RuleContext<'a> {
    /// Latest sample for the setup, if any was produced yet.
    pub latest: Option<&'a Reading>,
    /// Time since the current state was entered.
    pub time_in_state: Duration,
    /// Time since the session started.
    pub total_time: Duration,
}

/// Evaluate a single rule against the tick context.
pub fn evaluate(rule: &Rule, ctx: &RuleContext<'_>) -> bool {
    match rule {
        Rule::Sensor {
            signal_name,
            operator,
            threshold,
        } => ctx
            .latest
            .and_then(|reading| reading.signal_value(signal_name))
            .is_some_and(|value| operator.holds(value, *threshold)),
        Rule::TimeInState { seconds } => ctx.time_in_state.as_secs_f64() >= *seconds,
        Rule::TotalTime { seconds } => ctx.total_time.as_secs_f64() >= *seconds,
    }
}

/// Conjunction over the transition's rules. A transition with zero rules
/// never fires — an accidental immediate transition is worse than a stuck
/// machine.
pub fn transition_holds(transition: &Transition, ctx: &RuleContext<'_>) -> bool {
    !transition.rules.is_empty() && transition.rules.iter().all(|rule| evaluate(rule, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompareOp, SignalReading, TargetReading};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn reading_with(signal: &str, value: Option<f64>) -> Reading {
        let mut signals = BTreeMap::new();
        signals.insert(
            signal.to_string(),
            SignalReading {
                value,
                raw_value: value,
                unit: "V".to_string(),
                raw_response: String::new(),
                error: None,
            },
        );
        Reading {
            timestamp: Utc::now(),
            setup_id: 1,
            setup_name: "s".to_string(),
            targets: vec![TargetReading {
                instrument_id: 1,
                instrument_name: "dmm".to_string(),
                mode_name: "dc".to_string(),
                signals,
                error: None,
            }],
        }
    }

    fn ctx<'a>(latest: Option<&'a Reading>, in_state: f64, total: f64) -> RuleContext<'a> {
        RuleContext {
            latest,
            time_in_state: Duration::from_secs_f64(in_state),
            total_time: Duration::from_secs_f64(total),
        }
    }

    fn sensor(op: CompareOp, threshold: f64) -> Rule {
        Rule::Sensor {
            signal_name: "v".to_string(),
            operator: op,
            threshold,
        }
    }

    #[test]
    fn test_sensor_rule_against_latest_sample() {
        let reading = reading_with("v", Some(12.5));
        assert!(evaluate(&sensor(CompareOp::Gt, 12.0), &ctx(Some(&reading), 0.0, 0.0)));
        assert!(!evaluate(&sensor(CompareOp::Gt, 13.0), &ctx(Some(&reading), 0.0, 0.0)));
    }

    #[test]
    fn test_sensor_rule_missing_signal_is_false() {
        let reading = reading_with("other", Some(1.0));
        assert!(!evaluate(&sensor(CompareOp::Gt, 0.0), &ctx(Some(&reading), 0.0, 0.0)));
        assert!(!evaluate(&sensor(CompareOp::Gt, 0.0), &ctx(None, 0.0, 0.0)));
    }

    #[test]
    fn test_sensor_rule_null_value_is_false() {
        let reading = reading_with("v", None);
        // Even `!=` cannot hold against a null value.
        assert!(!evaluate(&sensor(CompareOp::Ne, 99.0), &ctx(Some(&reading), 0.0, 0.0)));
    }

    #[test]
    fn test_time_rules() {
        let c = ctx(None, 5.0, 60.0);
        assert!(evaluate(&Rule::TimeInState { seconds: 5.0 }, &c));
        assert!(!evaluate(&Rule::TimeInState { seconds: 5.1 }, &c));
        assert!(evaluate(&Rule::TotalTime { seconds: 59.0 }, &c));
        assert!(!evaluate(&Rule::TotalTime { seconds: 61.0 }, &c));
    }

    #[test]
    fn test_transition_conjunction() {
        let reading = reading_with("v", Some(4.19));
        let transition = Transition {
            id: "t".to_string(),
            source_state_id: "a".to_string(),
            target_state_id: "b".to_string(),
            rules: vec![sensor(CompareOp::Ge, 4.19), Rule::TimeInState { seconds: 5.0 }],
        };
        // Sensor holds from the start, but the AND waits for the clock.
        assert!(!transition_holds(&transition, &ctx(Some(&reading), 1.0, 1.0)));
        assert!(transition_holds(&transition, &ctx(Some(&reading), 5.0, 5.0)));
    }

    #[test]
    fn test_zero_rules_never_fire() {
        let transition = Transition {
            id: "t".to_string(),
            source_state_id: "a".to_string(),
            target_state_id: "b".to_string(),
            rules: vec![],
        };
        assert!(!transition_holds(&transition, &ctx(None, 1e9, 1e9)));
    }
}
