//! Catalog — instrument and setup collections with integrity enforcement
//!
//! Create/update/delete enforce the model invariants: unique names, ids
//! assigned by the store, every reference resolving to an existing active
//! instrument, state machines internally consistent. Violations surface as
//! field-level `Validation` errors; name collisions and referenced deletes
//! as `Conflict`.

use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::Path;

use super::JsonCollection;
use crate::error::{EngineError, EngineResult};
use crate::model::{Instrument, MachineState, MonitoringSetup, Rule, Target, Transition};
use crate::transport::InstrumentAddress;

/// The two definition collections, `instruments.json` and `setups.json`.
pub struct Catalog {
    instruments: JsonCollection<Instrument>,
    setups: JsonCollection<MonitoringSetup>,
}

impl Catalog {
    /// Load both collections from the data directory. Fails with
    /// `Corruption` if either file exists but cannot be parsed.
    pub async fn open(data_dir: &Path) -> EngineResult<Self> {
        Ok(Self {
            instruments: JsonCollection::load(data_dir.join("instruments.json")).await?,
            setups: JsonCollection::load(data_dir.join("setups.json")).await?,
        })
    }

    // ------------------------------------------------------------------
    // Instruments
    // ------------------------------------------------------------------

    pub async fn instruments(&self) -> Vec<Instrument> {
        self.instruments.snapshot().await
    }

    pub async fn instrument(&self, id: i64) -> EngineResult<Instrument> {
        self.instruments
            .snapshot()
            .await
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| EngineError::not_found("instrument", id))
    }

    pub async fn create_instrument(&self, draft: InstrumentDraft) -> EngineResult<Instrument> {
        self.instruments
            .mutate(|items| {
                let id = next_id(items.iter().map(|i| i.id));
                let instrument = Instrument {
                    id,
                    name: draft.name,
                    address: draft.address,
                    description: draft.description.unwrap_or_default(),
                    is_active: draft.is_active.unwrap_or(true),
                };
                validate_instrument(&instrument, items)?;
                items.push(instrument.clone());
                Ok(instrument)
            })
            .await
    }

    /// Merge the patch over the stored record; absent fields keep their
    /// current values.
    pub async fn update_instrument(
        &self,
        id: i64,
        patch: InstrumentPatch,
    ) -> EngineResult<Instrument> {
        self.instruments
            .mutate(|items| {
                let index = items
                    .iter()
                    .position(|i| i.id == id)
                    .ok_or_else(|| EngineError::not_found("instrument", id))?;
                let mut updated = items[index].clone();
                if let Some(name) = patch.name {
                    updated.name = name;
                }
                if let Some(address) = patch.address {
                    updated.address = address;
                }
                if let Some(description) = patch.description {
                    updated.description = description;
                }
                if let Some(is_active) = patch.is_active {
                    updated.is_active = is_active;
                }
                validate_instrument(&updated, items)?;
                items[index] = updated.clone();
                Ok(updated)
            })
            .await
    }

    /// Delete an instrument. Refused with `Conflict` while any setup
    /// references it.
    pub async fn delete_instrument(&self, id: i64) -> EngineResult<()> {
        let setups = self.setups.snapshot().await;
        if let Some(setup) = setups.iter().find(|s| references_instrument(s, id)) {
            return Err(EngineError::conflict(format!(
                "instrument {id} is referenced by setup '{}'",
                setup.name
            )));
        }
        self.instruments
            .mutate(|items| {
                let before = items.len();
                items.retain(|i| i.id != id);
                if items.len() == before {
                    return Err(EngineError::not_found("instrument", id));
                }
                Ok(())
            })
            .await
    }

    // ------------------------------------------------------------------
    // Setups
    // ------------------------------------------------------------------

    pub async fn setups(&self) -> Vec<MonitoringSetup> {
        self.setups.snapshot().await
    }

    pub async fn setup(&self, id: i64) -> EngineResult<MonitoringSetup> {
        self.setups
            .snapshot()
            .await
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| EngineError::not_found("setup", id))
    }

    pub async fn create_setup(&self, draft: SetupDraft) -> EngineResult<MonitoringSetup> {
        let instruments = self.instruments.snapshot().await;
        self.setups
            .mutate(|items| {
                let id = next_id(items.iter().map(|s| s.id));
                let setup = MonitoringSetup {
                    id,
                    name: draft.name,
                    frequency_hz: draft.frequency_hz,
                    targets: draft.targets,
                    states: draft.states,
                    transitions: draft.transitions,
                    initial_state_id: draft.initial_state_id,
                };
                validate_setup(&setup, items, &instruments)?;
                items.push(setup.clone());
                Ok(setup)
            })
            .await
    }

    pub async fn update_setup(&self, id: i64, patch: SetupPatch) -> EngineResult<MonitoringSetup> {
        let instruments = self.instruments.snapshot().await;
        self.setups
            .mutate(|items| {
                let index = items
                    .iter()
                    .position(|s| s.id == id)
                    .ok_or_else(|| EngineError::not_found("setup", id))?;
                let mut updated = items[index].clone();
                if let Some(name) = patch.name {
                    updated.name = name;
                }
                if let Some(frequency_hz) = patch.frequency_hz {
                    updated.frequency_hz = frequency_hz;
                }
                if let Some(targets) = patch.targets {
                    updated.targets = targets;
                }
                if let Some(states) = patch.states {
                    updated.states = states;
                }
                if let Some(transitions) = patch.transitions {
                    updated.transitions = transitions;
                }
                if let Some(initial) = patch.initial_state_id {
                    updated.initial_state_id = initial;
                }
                validate_setup(&updated, items, &instruments)?;
                items[index] = updated.clone();
                Ok(updated)
            })
            .await
    }

    pub async fn delete_setup(&self, id: i64) -> EngineResult<()> {
        self.setups
            .mutate(|items| {
                let before = items.len();
                items.retain(|s| s.id != id);
                if items.len() == before {
                    return Err(EngineError::not_found("setup", id));
                }
                Ok(())
            })
            .await
    }
}

// ============================================================================
// Drafts and patches
// ============================================================================

/// Input for instrument creation; the store assigns the id.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentDraft {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Partial instrument update; absent fields are untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstrumentPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Input for setup creation.
#[derive(Debug, Clone, Deserialize)]
pub struct SetupDraft {
    pub name: String,
    pub frequency_hz: f64,
    #[serde(rename = "instruments")]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub states: Vec<MachineState>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(rename = "initialStateID", default)]
    pub initial_state_id: Option<String>,
}

/// Partial setup update. `initialStateID: null` clears the initial state;
/// an absent key keeps it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub frequency_hz: Option<f64>,
    #[serde(rename = "instruments", default)]
    pub targets: Option<Vec<Target>>,
    #[serde(default)]
    pub states: Option<Vec<MachineState>>,
    #[serde(default)]
    pub transitions: Option<Vec<Transition>>,
    #[serde(rename = "initialStateID", default, deserialize_with = "some_option")]
    pub initial_state_id: Option<Option<String>>,
}

/// Distinguishes an absent key (outer `None`) from an explicit `null`
/// (inner `None`).
fn some_option<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

// ============================================================================
// Validation
// ============================================================================

fn next_id(existing: impl Iterator<Item = i64>) -> i64 {
    existing.max().unwrap_or(0) + 1
}

fn references_instrument(setup: &MonitoringSetup, instrument_id: i64) -> bool {
    setup.targets.iter().any(|t| t.instrument_id == instrument_id)
        || setup
            .states
            .iter()
            .any(|s| s.instrument_settings.contains_key(&instrument_id))
}

fn validate_instrument(instrument: &Instrument, all: &[Instrument]) -> EngineResult<()> {
    if instrument.name.trim().is_empty() {
        return Err(EngineError::validation("name", "must not be empty"));
    }
    if all
        .iter()
        .any(|i| i.id != instrument.id && i.name == instrument.name)
    {
        return Err(EngineError::conflict(format!(
            "instrument name '{}' is already taken",
            instrument.name
        )));
    }
    InstrumentAddress::parse(&instrument.address)
        .map_err(|e| EngineError::validation("address", e.to_string()))?;
    // Parses the descriptor so broken capability JSON is rejected at the
    // door instead of at sampling time.
    if let Some(capability) = instrument
        .capability()
        .map_err(|e| EngineError::validation("description", e.to_string()))?
    {
        capability.validate()?;
    }
    Ok(())
}

fn validate_setup(
    setup: &MonitoringSetup,
    all: &[MonitoringSetup],
    instruments: &[Instrument],
) -> EngineResult<()> {
    if setup.name.trim().is_empty() {
        return Err(EngineError::validation("name", "must not be empty"));
    }
    if all.iter().any(|s| s.id != setup.id && s.name == setup.name) {
        return Err(EngineError::conflict(format!(
            "setup name '{}' is already taken",
            setup.name
        )));
    }
    if !(setup.frequency_hz > 0.0 && setup.frequency_hz.is_finite()) {
        return Err(EngineError::validation(
            "frequency_hz",
            "must be a positive number",
        ));
    }
    if setup.targets.is_empty() {
        return Err(EngineError::validation(
            "instruments",
            "a setup needs at least one instrument",
        ));
    }

    // Targets: instrument exists, is active, and the selected mode resolves.
    for (index, target) in setup.targets.iter().enumerate() {
        let field = format!("instruments[{index}]");
        let instrument = instruments
            .iter()
            .find(|i| i.id == target.instrument_id)
            .ok_or_else(|| {
                EngineError::validation(
                    field.clone(),
                    format!("unknown instrument id {}", target.instrument_id),
                )
            })?;
        if !instrument.is_active {
            return Err(EngineError::validation(
                field.clone(),
                format!("instrument '{}' is not active", instrument.name),
            ));
        }
        let capability = instrument
            .capability()
            .map_err(|e| EngineError::validation(field.clone(), e.to_string()))?
            .ok_or_else(|| {
                EngineError::validation(
                    field.clone(),
                    format!("instrument '{}' has no capability descriptor", instrument.name),
                )
            })?;
        if let Some(mode_id) = &target.parameters.mode_id {
            if capability.mode(mode_id).is_none() {
                return Err(EngineError::validation(
                    format!("{field}.parameters.modeId"),
                    format!("instrument '{}' has no mode '{mode_id}'", instrument.name),
                ));
            }
        }
    }

    validate_machine(setup, instruments)?;
    Ok(())
}

fn validate_machine(setup: &MonitoringSetup, instruments: &[Instrument]) -> EngineResult<()> {
    let mut state_ids = HashSet::new();
    for state in &setup.states {
        if !state_ids.insert(state.id.as_str()) {
            return Err(EngineError::validation(
                "states",
                format!("duplicate state id '{}'", state.id),
            ));
        }
    }

    let target_ids: HashSet<i64> = setup.targets.iter().map(|t| t.instrument_id).collect();

    for state in &setup.states {
        for (instrument_id, selection) in &state.instrument_settings {
            let field = format!("states['{}'].instrument_settings", state.id);
            if !target_ids.contains(instrument_id) {
                return Err(EngineError::validation(
                    field.clone(),
                    format!("instrument {instrument_id} is not a target of this setup"),
                ));
            }
            // Target validation already guaranteed existence + capability.
            let instrument = instruments
                .iter()
                .find(|i| i.id == *instrument_id)
                .ok_or_else(|| {
                    EngineError::validation(field.clone(), format!("unknown instrument {instrument_id}"))
                })?;
            let capability = instrument
                .capability()
                .map_err(|e| EngineError::validation(field.clone(), e.to_string()))?
                .unwrap_or_default();
            if capability.mode(&selection.mode_id).is_none() {
                return Err(EngineError::validation(
                    field.clone(),
                    format!(
                        "instrument '{}' has no mode '{}'",
                        instrument.name, selection.mode_id
                    ),
                ));
            }
        }
    }

    for transition in &setup.transitions {
        if !state_ids.contains(transition.source_state_id.as_str()) {
            return Err(EngineError::validation(
                format!("transitions['{}'].source_state_id", transition.id),
                format!("unknown state '{}'", transition.source_state_id),
            ));
        }
        if !state_ids.contains(transition.target_state_id.as_str()) {
            return Err(EngineError::validation(
                format!("transitions['{}'].target_state_id", transition.id),
                format!("unknown state '{}'", transition.target_state_id),
            ));
        }
        for rule in &transition.rules {
            if let Rule::Sensor { signal_name, .. } = rule {
                let known = setup.targets.iter().any(|t| {
                    instruments
                        .iter()
                        .find(|i| i.id == t.instrument_id)
                        .and_then(|i| i.capability().ok().flatten())
                        .is_some_and(|c| c.signal_by_name(signal_name).is_some())
                });
                if !known {
                    return Err(EngineError::validation(
                        format!("transitions['{}'].rules", transition.id),
                        format!("no target instrument measures signal '{signal_name}'"),
                    ));
                }
            }
        }
    }

    if let Some(initial) = &setup.initial_state_id {
        if !state_ids.contains(initial.as_str()) {
            return Err(EngineError::validation(
                "initialStateID",
                format!("unknown state '{initial}'"),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Capability, Mode, ModeParameter, Signal, SignalModeConfig};
    use std::collections::BTreeMap;

    fn capability_json() -> String {
        serde_json::to_string(&Capability {
            signals: vec![Signal {
                id: "sig-v".to_string(),
                name: "v".to_string(),
                measure_command: "MEAS:VOLT?".to_string(),
            }],
            modes: vec![Mode {
                id: "mode-dc".to_string(),
                name: "dc".to_string(),
                enable_commands: vec!["CONF:VOLT {range}".to_string()],
                disable_commands: vec!["ABOR".to_string()],
                parameters: vec![ModeParameter {
                    name: "range".to_string(),
                }],
            }],
            signal_mode_configs: vec![SignalModeConfig {
                mode_id: "mode-dc".to_string(),
                signal_id: "sig-v".to_string(),
                unit: "V".to_string(),
                scaling_factor: 1.0,
            }],
        })
        .unwrap()
    }

    async fn catalog_with_instrument() -> (tempfile::TempDir, Catalog, Instrument) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        let instrument = catalog
            .create_instrument(InstrumentDraft {
                name: "dmm".to_string(),
                address: "lab/inst0".to_string(),
                description: Some(capability_json()),
                is_active: None,
            })
            .await
            .unwrap();
        (dir, catalog, instrument)
    }

    fn basic_setup_draft(instrument_id: i64) -> SetupDraft {
        SetupDraft {
            name: "bake".to_string(),
            frequency_hz: 2.0,
            targets: vec![Target {
                instrument_id,
                parameters: crate::model::TargetParameters {
                    mode_id: Some("mode-dc".to_string()),
                    mode_params: BTreeMap::new(),
                },
            }],
            states: vec![],
            transitions: vec![],
            initial_state_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        let a = catalog
            .create_instrument(InstrumentDraft {
                name: "a".to_string(),
                address: "lab/inst0".to_string(),
                description: None,
                is_active: None,
            })
            .await
            .unwrap();
        let b = catalog
            .create_instrument(InstrumentDraft {
                name: "b".to_string(),
                address: "lab/inst1".to_string(),
                description: None,
                is_active: None,
            })
            .await
            .unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[tokio::test]
    async fn test_duplicate_instrument_name_conflicts() {
        let (_dir, catalog, _inst) = catalog_with_instrument().await;
        let err = catalog
            .create_instrument(InstrumentDraft {
                name: "dmm".to_string(),
                address: "lab/inst9".to_string(),
                description: None,
                is_active: None,
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_referenced_instrument_conflicts() {
        let (_dir, catalog, inst) = catalog_with_instrument().await;
        catalog
            .create_setup(basic_setup_draft(inst.id))
            .await
            .unwrap();
        let err = catalog.delete_instrument(inst.id).await.err().unwrap();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_setup_rejects_unknown_instrument() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        let err = catalog
            .create_setup(basic_setup_draft(99))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_setup_rejects_zero_frequency() {
        let (_dir, catalog, inst) = catalog_with_instrument().await;
        let mut draft = basic_setup_draft(inst.id);
        draft.frequency_hz = 0.0;
        let err = catalog.create_setup(draft).await.err().unwrap();
        assert!(matches!(
            err,
            EngineError::Validation { ref field, .. } if field == "frequency_hz"
        ));
    }

    #[tokio::test]
    async fn test_setup_rejects_unknown_mode() {
        let (_dir, catalog, inst) = catalog_with_instrument().await;
        let mut draft = basic_setup_draft(inst.id);
        draft.targets[0].parameters.mode_id = Some("ghost".to_string());
        assert!(catalog.create_setup(draft).await.is_err());
    }

    #[tokio::test]
    async fn test_machine_validation() {
        let (_dir, catalog, inst) = catalog_with_instrument().await;
        let mut draft = basic_setup_draft(inst.id);
        draft.states = vec![
            MachineState {
                id: "idle".to_string(),
                name: "idle".to_string(),
                is_end_state: false,
                instrument_settings: BTreeMap::new(),
            },
            MachineState {
                id: "done".to_string(),
                name: "done".to_string(),
                is_end_state: true,
                instrument_settings: BTreeMap::new(),
            },
        ];
        draft.transitions = vec![Transition {
            id: "t1".to_string(),
            source_state_id: "idle".to_string(),
            target_state_id: "nowhere".to_string(),
            rules: vec![],
        }];
        draft.initial_state_id = Some("idle".to_string());
        let err = catalog.create_setup(draft).await.err().unwrap();
        assert!(matches!(err, EngineError::Validation { ref field, .. }
            if field.contains("target_state_id")));
    }

    #[tokio::test]
    async fn test_setup_round_trips_through_file() {
        let (dir, catalog, inst) = catalog_with_instrument().await;
        let mut draft = basic_setup_draft(inst.id);
        draft.states = vec![MachineState {
            id: "idle".to_string(),
            name: "idle".to_string(),
            is_end_state: false,
            instrument_settings: BTreeMap::new(),
        }];
        draft.initial_state_id = Some("idle".to_string());
        let created = catalog.create_setup(draft).await.unwrap();

        let reopened = Catalog::open(dir.path()).await.unwrap();
        assert_eq!(reopened.setup(created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_patch_clears_initial_state_on_explicit_null() {
        let patch: SetupPatch =
            serde_json::from_str(r#"{"initialStateID": null}"#).unwrap();
        assert_eq!(patch.initial_state_id, Some(None));

        let untouched: SetupPatch = serde_json::from_str("{}").unwrap();
        assert_eq!(untouched.initial_state_id, None);
    }
}
