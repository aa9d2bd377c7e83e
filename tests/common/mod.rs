//! Shared test harness: services wired over the mock transport in a
//! temporary data directory.

// Each integration test binary compiles this module; not every binary uses
// every helper.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use labmon::api::{create_app, ApiContext};
use labmon::collector::Collector;
use labmon::machine::MachineEngine;
use labmon::model::{
    Capability, MachineState, Mode, ModeParameter, ModeSelection, Signal, SignalModeConfig,
    Target, TargetParameters, Transition,
};
use labmon::store::{Catalog, InstrumentDraft, ReadingsLog, SetupDraft};
use labmon::transport::MockFactory;

pub struct Harness {
    _dir: tempfile::TempDir,
    pub catalog: Arc<Catalog>,
    pub readings: Arc<ReadingsLog>,
    pub collector: Arc<Collector>,
    pub machine: Arc<MachineEngine>,
    pub factory: MockFactory,
}

impl Harness {
    pub async fn new(max_readings: usize, tick_period: Duration) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = Arc::new(Catalog::open(dir.path()).await.expect("catalog"));
        let readings = Arc::new(
            ReadingsLog::open(dir.path(), max_readings)
                .await
                .expect("readings log"),
        );
        let factory = MockFactory::new();
        let collector = Arc::new(Collector::new(
            Arc::clone(&catalog),
            Arc::clone(&readings),
            Arc::new(factory.clone()),
        ));
        let machine = Arc::new(MachineEngine::new(
            Arc::clone(&catalog),
            Arc::clone(&readings),
            Arc::clone(&collector),
            tick_period,
        ));
        Self {
            _dir: dir,
            catalog,
            readings,
            collector,
            machine,
            factory,
        }
    }

    pub fn app(&self) -> axum::Router {
        create_app(ApiContext {
            catalog: Arc::clone(&self.catalog),
            readings: Arc::clone(&self.readings),
            collector: Arc::clone(&self.collector),
            machine: Arc::clone(&self.machine),
            transports: Arc::new(self.factory.clone()),
            started_at: std::time::Instant::now(),
        })
    }

    /// Register a voltmeter-style instrument at `address` with one signal
    /// `v` (command `MEAS:VOLT?`) measurable in mode `run`, and create it
    /// in the catalog. Returns the instrument id.
    pub async fn add_voltmeter(&self, name: &str, address: &str) -> i64 {
        self.factory.register(address);
        let capability = voltmeter_capability();
        let draft = InstrumentDraft {
            name: name.to_string(),
            address: address.to_string(),
            description: Some(serde_json::to_string(&capability).expect("capability json")),
            is_active: None,
        };
        self.catalog
            .create_instrument(draft)
            .await
            .expect("create instrument")
            .id
    }

    /// Create a plain collecting setup over one instrument in mode `run`.
    pub async fn add_setup(&self, name: &str, instrument_id: i64, frequency_hz: f64) -> i64 {
        self.catalog
            .create_setup(collecting_setup(name, instrument_id, frequency_hz))
            .await
            .expect("create setup")
            .id
    }
}

pub fn voltmeter_capability() -> Capability {
    Capability {
        signals: vec![Signal {
            id: "sig-v".to_string(),
            name: "v".to_string(),
            measure_command: "MEAS:VOLT?".to_string(),
        }],
        modes: vec![
            Mode {
                id: "run".to_string(),
                name: "run".to_string(),
                enable_commands: vec!["CONF:VOLT {range}".to_string(), "INIT".to_string()],
                disable_commands: vec!["ABOR".to_string()],
                parameters: vec![ModeParameter {
                    name: "range".to_string(),
                }],
            },
            Mode {
                id: "hot".to_string(),
                name: "hot".to_string(),
                enable_commands: vec!["CONF:VOLT:HOT".to_string()],
                disable_commands: vec!["ABOR".to_string()],
                parameters: vec![],
            },
        ],
        signal_mode_configs: vec![
            SignalModeConfig {
                mode_id: "run".to_string(),
                signal_id: "sig-v".to_string(),
                unit: "V".to_string(),
                scaling_factor: 1.0,
            },
            SignalModeConfig {
                mode_id: "hot".to_string(),
                signal_id: "sig-v".to_string(),
                unit: "V".to_string(),
                scaling_factor: 1.0,
            },
        ],
    }
}

pub fn collecting_setup(name: &str, instrument_id: i64, frequency_hz: f64) -> SetupDraft {
    let mut mode_params = BTreeMap::new();
    mode_params.insert("range".to_string(), serde_json::json!("10V"));
    SetupDraft {
        name: name.to_string(),
        frequency_hz,
        targets: vec![Target {
            instrument_id,
            parameters: TargetParameters {
                mode_id: Some("run".to_string()),
                mode_params,
            },
        }],
        states: vec![],
        transitions: vec![],
        initial_state_id: None,
    }
}

pub fn state(id: &str, is_end: bool, settings: BTreeMap<i64, ModeSelection>) -> MachineState {
    MachineState {
        id: id.to_string(),
        name: id.to_string(),
        is_end_state: is_end,
        instrument_settings: settings,
    }
}

pub fn run_mode_selection() -> ModeSelection {
    let mut mode_params = BTreeMap::new();
    mode_params.insert("range".to_string(), serde_json::json!("10V"));
    ModeSelection {
        mode_id: "run".to_string(),
        mode_params,
    }
}

pub fn transition(id: &str, from: &str, to: &str, rules: Vec<labmon::model::Rule>) -> Transition {
    Transition {
        id: id.to_string(),
        source_state_id: from.to_string(),
        target_state_id: to.to_string(),
        rules,
    }
}

/// Poll `predicate` every 10 ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
