//! Sampling pass — one sample for one setup
//!
//! Owns the per-run pass state: pooled transport sessions (one per
//! `(host, device)`) and the last mode applied per instrument. Mode
//! activation is edge-triggered against that record; command templates get
//! `{name}` substitution before hitting the wire.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::{
    param_to_string, Capability, Instrument, ModeSelection, MonitoringSetup, Reading,
    SignalReading, TargetReading,
};
use crate::transport::{
    InstrumentAddress, TransportError, TransportFactory, TransportSession,
};

/// The mode most recently activated on an instrument within this run.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMode {
    pub mode_id: String,
    pub params: BTreeMap<String, String>,
}

/// Pooled sessions and activation history for one running setup.
///
/// Locked for the duration of a pass, so concurrent `collect_now` calls and
/// the periodic task serialize per `(host, device)` session.
pub struct PassState {
    factory: Arc<dyn TransportFactory>,
    sessions: HashMap<String, Box<dyn TransportSession>>,
    last_modes: HashMap<i64, AppliedMode>,
}

impl PassState {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            sessions: HashMap::new(),
            last_modes: HashMap::new(),
        }
    }

    /// Open sessions for every distinct address in `instruments`.
    /// On any failure the already-opened sessions are closed again.
    pub async fn open_all(&mut self, instruments: &[Instrument]) -> EngineResult<()> {
        for instrument in instruments {
            let address = InstrumentAddress::parse(&instrument.address)
                .map_err(EngineError::Transport)?;
            let key = address.session_key();
            if self.sessions.contains_key(&key) {
                continue;
            }
            match self.factory.open(&address).await {
                Ok(session) => {
                    self.sessions.insert(key, session);
                }
                Err(e) => {
                    self.close_all().await;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    pub async fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.close().await;
        }
        self.last_modes.clear();
    }

    /// Get-or-reopen the session for an address. A session dropped after a
    /// failed operation is reopened on the next use.
    async fn session(
        &mut self,
        address: &InstrumentAddress,
    ) -> Result<&mut Box<dyn TransportSession>, TransportError> {
        let key = address.session_key();
        if !self.sessions.contains_key(&key) {
            let session = self.factory.open(address).await?;
            self.sessions.insert(key.clone(), session);
        }
        self.sessions
            .get_mut(&key)
            .ok_or_else(|| TransportError::Protocol("session pool inconsistent".to_string()))
    }

    fn drop_session(&mut self, address: &InstrumentAddress) {
        self.sessions.remove(&address.session_key());
    }

    /// Activate a mode on one instrument, edge-triggered: enable commands
    /// are sent only when `(mode_id, params)` differ from the last
    /// activation — unless `force` re-applies them (self-transitions).
    ///
    /// `ParameterMissing` is a configuration error and aborts the
    /// activation; transport errors bubble up for the caller to record.
    pub async fn activate(
        &mut self,
        instrument: &Instrument,
        capability: &Capability,
        selection: &ResolvedSelection,
        force: bool,
    ) -> EngineResult<bool> {
        let applied = AppliedMode {
            mode_id: selection.mode_id.clone(),
            params: selection.params.clone(),
        };
        if !force && self.last_modes.get(&instrument.id) == Some(&applied) {
            return Ok(false);
        }

        let mode = capability.mode(&selection.mode_id).ok_or_else(|| {
            EngineError::validation(
                "mode",
                format!(
                    "instrument '{}' has no mode '{}'",
                    instrument.name, selection.mode_id
                ),
            )
        })?;

        let address =
            InstrumentAddress::parse(&instrument.address).map_err(EngineError::Transport)?;
        for template in &mode.enable_commands {
            let command = substitute(template, &selection.params)?;
            let session = self.session(&address).await?;
            if let Err(e) = session.send(&command).await {
                self.drop_session(&address);
                return Err(e.into());
            }
        }

        debug!(
            instrument = %instrument.name,
            mode = %mode.name,
            "mode activated"
        );
        self.last_modes.insert(instrument.id, applied);
        Ok(true)
    }

    /// Send the disable commands for whatever mode each instrument is
    /// currently in. Best effort: failures are logged, never returned.
    /// Clears the activation record so a later run re-enables.
    pub async fn deactivate_all(&mut self, instruments: &[Instrument]) {
        let applied: Vec<(i64, AppliedMode)> =
            self.last_modes.drain().collect();
        for (instrument_id, mode) in applied {
            let Some(instrument) = instruments.iter().find(|i| i.id == instrument_id) else {
                continue;
            };
            let Ok(Some(capability)) = instrument.capability() else {
                continue;
            };
            let Some(mode_def) = capability.mode(&mode.mode_id) else {
                continue;
            };
            let Ok(address) = InstrumentAddress::parse(&instrument.address) else {
                continue;
            };
            for template in &mode_def.disable_commands {
                let command = match substitute(template, &mode.params) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(instrument = %instrument.name, "disable skipped: {e}");
                        continue;
                    }
                };
                let result = match self.session(&address).await {
                    Ok(session) => session.send(&command).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(instrument = %instrument.name, "disable failed: {e}");
                    self.drop_session(&address);
                    break;
                }
            }
        }
    }

    /// Mode an instrument is currently in, if any.
    pub fn applied_mode(&self, instrument_id: i64) -> Option<&AppliedMode> {
        self.last_modes.get(&instrument_id)
    }
}

/// A target's effective mode for one pass: the state machine override when
/// driving, the target's own parameters otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSelection {
    pub mode_id: String,
    pub params: BTreeMap<String, String>,
}

impl ResolvedSelection {
    pub fn from_selection(selection: &ModeSelection) -> Self {
        Self {
            mode_id: selection.mode_id.clone(),
            params: selection
                .mode_params
                .iter()
                .map(|(k, v)| (k.clone(), param_to_string(v)))
                .collect(),
        }
    }
}

/// Run one sampling pass: activate modes (edge-triggered), query every
/// signal of each target's current mode, scale, and assemble the sample.
///
/// Transient transport failures land in the affected signal/target blocks;
/// only configuration errors (`ParameterMissing`, unknown mode) abort.
pub async fn run_pass(
    pass: &mut PassState,
    setup: &MonitoringSetup,
    instruments: &[Instrument],
    overrides: &HashMap<i64, ModeSelection>,
) -> EngineResult<Reading> {
    let mut targets = Vec::with_capacity(setup.targets.len());

    for target in &setup.targets {
        let Some(instrument) = instruments.iter().find(|i| i.id == target.instrument_id) else {
            targets.push(TargetReading {
                instrument_id: target.instrument_id,
                instrument_name: String::new(),
                mode_name: String::new(),
                signals: BTreeMap::new(),
                error: Some("instrument no longer exists".to_string()),
            });
            continue;
        };

        let capability = instrument.capability()?.unwrap_or_default();

        // Mode: state machine override first, target parameters second.
        let selection = match overrides.get(&instrument.id) {
            Some(s) => Some(ResolvedSelection::from_selection(s)),
            None => target.parameters.mode_id.as_ref().map(|mode_id| {
                ResolvedSelection {
                    mode_id: mode_id.clone(),
                    params: target
                        .parameters
                        .mode_params
                        .iter()
                        .map(|(k, v)| (k.clone(), param_to_string(v)))
                        .collect(),
                }
            }),
        };

        let Some(selection) = selection else {
            targets.push(TargetReading {
                instrument_id: instrument.id,
                instrument_name: instrument.name.clone(),
                mode_name: String::new(),
                signals: BTreeMap::new(),
                error: Some("no mode selected".to_string()),
            });
            continue;
        };

        let mode_name = capability
            .mode(&selection.mode_id)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| selection.mode_id.clone());

        // Activation failures from the transport are transient: record and
        // move on. Configuration failures abort the pass.
        if let Err(e) = pass.activate(instrument, &capability, &selection, false).await {
            match e {
                EngineError::Transport(te) => {
                    targets.push(TargetReading {
                        instrument_id: instrument.id,
                        instrument_name: instrument.name.clone(),
                        mode_name,
                        signals: BTreeMap::new(),
                        error: Some(te.to_string()),
                    });
                    continue;
                }
                other => return Err(other),
            }
        }

        let mut signals = BTreeMap::new();
        let address =
            InstrumentAddress::parse(&instrument.address).map_err(EngineError::Transport)?;
        for (signal, config) in capability.signals_in_mode(&selection.mode_id) {
            let command = substitute(&signal.measure_command, &selection.params)?;
            let sent = match pass.session(&address).await {
                Ok(session) => session.send(&command).await,
                Err(e) => Err(e),
            };
            let reading = match sent {
                Ok(Some(reply)) => {
                    scale_reply(&reply, config.unit.clone(), config.scaling_factor)
                }
                Ok(None) => SignalReading {
                    value: None,
                    raw_value: None,
                    unit: config.unit.clone(),
                    raw_response: String::new(),
                    error: Some("measure command produced no reply".to_string()),
                },
                Err(e) => {
                    pass.drop_session(&address);
                    SignalReading {
                        value: None,
                        raw_value: None,
                        unit: config.unit.clone(),
                        raw_response: String::new(),
                        error: Some(e.to_string()),
                    }
                }
            };
            signals.insert(signal.name.clone(), reading);
        }

        targets.push(TargetReading {
            instrument_id: instrument.id,
            instrument_name: instrument.name.clone(),
            mode_name,
            signals,
            error: None,
        });
    }

    Ok(Reading {
        timestamp: Utc::now(),
        setup_id: setup.id,
        setup_name: setup.name.clone(),
        targets,
    })
}

fn scale_reply(reply: &str, unit: String, scaling_factor: f64) -> SignalReading {
    match parse_number(reply) {
        Some(raw) => SignalReading {
            value: Some(raw * scaling_factor),
            raw_value: Some(raw),
            unit,
            raw_response: reply.to_string(),
            error: None,
        },
        None => SignalReading {
            value: None,
            raw_value: None,
            unit,
            raw_response: reply.to_string(),
            error: Some("could not parse reply as a number".to_string()),
        },
    }
}

// ============================================================================
// Command templating and reply parsing
// ============================================================================

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("literal regex"))
}

/// Replace `{name}` placeholders with parameter values. Every placeholder
/// must resolve; an unknown one is `ParameterMissing`.
pub fn substitute(template: &str, params: &BTreeMap<String, String>) -> EngineResult<String> {
    for capture in placeholder_regex().captures_iter(template) {
        let name = &capture[1];
        if !params.contains_key(name) {
            return Err(EngineError::ParameterMissing {
                name: name.to_string(),
            });
        }
    }
    if !template.contains('{') {
        return Ok(template.to_string());
    }
    let vars: HashMap<String, String> =
        params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    strfmt::strfmt(template, &vars).map_err(|e| EngineError::internal(e))
}

fn number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    RE.get_or_init(|| {
        Regex::new(r"[-+]?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?").expect("literal regex")
    })
}

/// Best-effort numeric parse of an instrument reply: trimmed full-string
/// parse first (scientific notation allowed), then the first numeric token
/// in a free-form reply like `"+1.25E-02 V"`.
pub fn parse_number(reply: &str) -> Option<f64> {
    let trimmed = reply.trim();
    if let Ok(value) = trimmed.parse::<f64>() {
        return Some(value);
    }
    number_regex()
        .find(trimmed)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}
