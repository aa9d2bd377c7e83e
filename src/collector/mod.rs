//! Data collector — per-setup periodic sampling
//!
//! One cancellable task per started setup produces a sample every `1/f`
//! seconds: resolve each target's current mode (state machine override
//! first), activate it edge-triggered, query the mode's signals, scale,
//! append to the readings log. Deadlines are drift-corrected
//! (`start + k·period`); an overrunning pass coalesces missed ticks into at
//! most one immediate pass and counts the rest.

mod sampler;

pub use sampler::{parse_number, substitute, AppliedMode, PassState, ResolvedSelection};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::{Instrument, ModeSelection, MonitoringSetup, Reading};
use crate::store::{Catalog, ReadingsLog};
use crate::transport::TransportFactory;

/// Collector status snapshot for one setup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectorStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub samples_collected: u64,
    pub ticks_coalesced: u64,
}

/// Shared run state of one started setup.
struct Run {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    status: Arc<RwLock<CollectorStatus>>,
    pass: Arc<Mutex<PassState>>,
    /// Mode overrides written by the state machine engine, read each pass.
    /// This cell is the only coupling between the two subsystems.
    overrides: Arc<RwLock<HashMap<i64, ModeSelection>>>,
}

/// The collector service. One instance per process, injected into the API
/// layer and the state machine engine.
pub struct Collector {
    catalog: Arc<Catalog>,
    readings: Arc<ReadingsLog>,
    transports: Arc<dyn TransportFactory>,
    runs: RwLock<HashMap<i64, Arc<Run>>>,
    /// Status snapshots outlive runs so `last_error` survives a stop.
    statuses: RwLock<HashMap<i64, Arc<RwLock<CollectorStatus>>>>,
    /// Per-setup mutex serializing start/stop.
    setup_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Collector {
    pub fn new(
        catalog: Arc<Catalog>,
        readings: Arc<ReadingsLog>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            catalog,
            readings,
            transports,
            runs: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            setup_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn setup_lock(&self, setup_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.setup_locks.lock().await;
        locks
            .entry(setup_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn status_cell(&self, setup_id: i64) -> Arc<RwLock<CollectorStatus>> {
        let mut statuses = self.statuses.write().await;
        statuses
            .entry(setup_id)
            .or_insert_with(|| Arc::new(RwLock::new(CollectorStatus::default())))
            .clone()
    }

    /// Start periodic collection for a setup. Idempotent: a live run is
    /// left untouched. Opens sessions for every distinct `(host, device)`
    /// up front; an unreachable instrument fails the start.
    pub async fn start(&self, setup_id: i64) -> EngineResult<CollectorStatus> {
        let lock = self.setup_lock(setup_id).await;
        let _guard = lock.lock().await;

        let existing = self.runs.read().await.get(&setup_id).cloned();
        if let Some(run) = existing {
            let status = run.status.read().await.clone();
            if status.running {
                return Ok(status);
            }
            // The task died (fatal error or panic); clear it and restart.
            self.teardown(setup_id, &run).await;
        }

        let setup = self.catalog.setup(setup_id).await?;
        let instruments = self.target_instruments(&setup).await?;

        let mut pass = PassState::new(Arc::clone(&self.transports));
        pass.open_all(&instruments).await?;

        let status = self.status_cell(setup_id).await;
        {
            let mut s = status.write().await;
            s.running = true;
            s.last_error = None;
        }

        let run = Arc::new(Run {
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            status: Arc::clone(&status),
            pass: Arc::new(Mutex::new(pass)),
            overrides: Arc::new(RwLock::new(HashMap::new())),
        });

        let task = tokio::spawn(run_collection(
            Arc::clone(&self.catalog),
            Arc::clone(&self.readings),
            Arc::clone(&run),
            setup_id,
        ));
        *run.task.lock().await = Some(task);

        self.runs.write().await.insert(setup_id, run);
        info!(setup_id, name = %setup.name, hz = setup.frequency_hz, "collector started");
        let snapshot = status.read().await.clone();
        Ok(snapshot)
    }

    /// Stop collection. Idempotent. After this returns, no further sample
    /// for the setup will appear in the readings log.
    pub async fn stop(&self, setup_id: i64) -> EngineResult<CollectorStatus> {
        let lock = self.setup_lock(setup_id).await;
        let _guard = lock.lock().await;

        let run = self.runs.write().await.remove(&setup_id);
        if let Some(run) = run {
            self.teardown(setup_id, &run).await;
            info!(setup_id, "collector stopped");
        }
        Ok(self.status_cell(setup_id).await.read().await.clone())
    }

    async fn teardown(&self, setup_id: i64, run: &Arc<Run>) {
        run.cancel.cancel();
        if let Some(task) = run.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(setup_id, "collector task join: {e}");
            }
        }
        run.pass.lock().await.close_all().await;
        run.overrides.write().await.clear();
        run.status.write().await.running = false;
        self.runs.write().await.remove(&setup_id);
    }

    /// One synchronous sampling pass, appended to the readings log.
    ///
    /// A live run shares its pass state (edge-triggering preserved);
    /// otherwise ephemeral sessions are opened and closed around the pass.
    pub async fn collect_now(&self, setup_id: i64) -> EngineResult<Reading> {
        let setup = self.catalog.setup(setup_id).await?;
        let instruments = self.target_instruments(&setup).await?;

        let run = self.runs.read().await.get(&setup_id).cloned();
        let reading = match run {
            Some(run) => {
                let overrides = run.overrides.read().await.clone();
                let mut pass = run.pass.lock().await;
                sampler::run_pass(&mut pass, &setup, &instruments, &overrides).await?
            }
            None => {
                let mut pass = PassState::new(Arc::clone(&self.transports));
                pass.open_all(&instruments).await?;
                let result =
                    sampler::run_pass(&mut pass, &setup, &instruments, &HashMap::new()).await;
                pass.close_all().await;
                result?
            }
        };

        let stored = self.readings.append(reading).await?;
        let status = self.status_cell(setup_id).await;
        let mut s = status.write().await;
        s.last_success_ts = Some(stored.timestamp);
        s.samples_collected += 1;
        Ok(stored)
    }

    pub async fn status(&self, setup_id: i64) -> CollectorStatus {
        self.status_cell(setup_id).await.read().await.clone()
    }

    pub async fn is_running(&self, setup_id: i64) -> bool {
        self.status(setup_id).await.running
    }

    /// Setup ids with a live run, for ordered shutdown.
    pub async fn running_setups(&self) -> Vec<i64> {
        let runs = self.runs.read().await;
        let mut ids = Vec::new();
        for (id, run) in runs.iter() {
            if run.status.read().await.running {
                ids.push(*id);
            }
        }
        ids
    }

    // ------------------------------------------------------------------
    // State machine coupling: the mode override cell
    // ------------------------------------------------------------------

    /// Replace the mode overrides for a driven setup. Requires a live run.
    pub async fn set_mode_overrides(
        &self,
        setup_id: i64,
        overrides: HashMap<i64, ModeSelection>,
    ) -> EngineResult<()> {
        let run = self.live_run(setup_id).await?;
        *run.overrides.write().await = overrides;
        Ok(())
    }

    /// Apply the current overrides immediately (state entry), instead of
    /// waiting for the next pass. `force` re-sends enables even when the
    /// mode is unchanged (self-transitions).
    ///
    /// Returns the instrument ids whose mode was (re-)activated.
    pub async fn apply_overrides_now(
        &self,
        setup_id: i64,
        force: bool,
    ) -> EngineResult<Vec<i64>> {
        let run = self.live_run(setup_id).await?;
        let setup = self.catalog.setup(setup_id).await?;
        let instruments = self.target_instruments(&setup).await?;
        let overrides = run.overrides.read().await.clone();

        let mut activated = Vec::new();
        let mut pass = run.pass.lock().await;
        for (instrument_id, selection) in &overrides {
            let Some(instrument) = instruments.iter().find(|i| i.id == *instrument_id) else {
                continue;
            };
            let capability = instrument.capability()?.unwrap_or_default();
            let resolved = ResolvedSelection::from_selection(selection);
            if pass
                .activate(instrument, &capability, &resolved, force)
                .await?
            {
                activated.push(*instrument_id);
            }
        }
        Ok(activated)
    }

    /// Send disable commands for whatever mode each instrument of the
    /// setup is currently in. Best effort; used on machine stop and on
    /// failed machine start.
    pub async fn deactivate_modes(&self, setup_id: i64) {
        let Some(run) = self.runs.read().await.get(&setup_id).cloned() else {
            return;
        };
        let Ok(setup) = self.catalog.setup(setup_id).await else {
            return;
        };
        let instruments = match self.target_instruments(&setup).await {
            Ok(i) => i,
            Err(_) => return,
        };
        run.pass.lock().await.deactivate_all(&instruments).await;
    }

    async fn live_run(&self, setup_id: i64) -> EngineResult<Arc<Run>> {
        self.runs
            .read()
            .await
            .get(&setup_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::validation("setup", format!("setup {setup_id} is not collecting"))
            })
    }

    async fn target_instruments(
        &self,
        setup: &MonitoringSetup,
    ) -> EngineResult<Vec<Instrument>> {
        let all = self.catalog.instruments().await;
        let mut out = Vec::with_capacity(setup.targets.len());
        for target in &setup.targets {
            let instrument = all
                .iter()
                .find(|i| i.id == target.instrument_id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("instrument", target.instrument_id))?;
            out.push(instrument);
        }
        Ok(out)
    }
}

/// The per-setup collection loop, panic-isolated at the task boundary.
async fn run_collection(
    catalog: Arc<Catalog>,
    readings: Arc<ReadingsLog>,
    run: Arc<Run>,
    setup_id: i64,
) {
    let loop_future = collection_loop(catalog, readings, Arc::clone(&run), setup_id);
    match AssertUnwindSafe(loop_future).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(setup_id, "collector stopped on fatal error: {e}");
            run.pass.lock().await.close_all().await;
            let mut status = run.status.write().await;
            status.running = false;
            status.last_error = Some(e.to_string());
        }
        Err(_) => {
            error!(setup_id, "collector task panicked");
            run.pass.lock().await.close_all().await;
            let mut status = run.status.write().await;
            status.running = false;
            status.last_error = Some("internal panic in collector task".to_string());
        }
    }
}

async fn collection_loop(
    catalog: Arc<Catalog>,
    readings: Arc<ReadingsLog>,
    run: Arc<Run>,
    setup_id: i64,
) -> EngineResult<()> {
    let started = tokio::time::Instant::now();
    let mut tick: u64 = 0;

    loop {
        if run.cancel.is_cancelled() {
            return Ok(());
        }

        // Setup and instruments are re-resolved every pass so edits take
        // effect live; a deleted setup is a fatal stop.
        let setup = catalog.setup(setup_id).await?;
        let period = setup.period();

        let pass_result = {
            let overrides = run.overrides.read().await.clone();
            let all = catalog.instruments().await;
            let instruments: Vec<Instrument> = setup
                .targets
                .iter()
                .filter_map(|t| all.iter().find(|i| i.id == t.instrument_id).cloned())
                .collect();

            let mut pass = run.pass.lock().await;
            tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return Ok(()),
                result = sampler::run_pass(&mut pass, &setup, &instruments, &overrides) => result,
            }
        };

        match pass_result {
            Ok(reading) => {
                let had_errors = reading
                    .targets
                    .iter()
                    .flat_map(|t| t.signals.values())
                    .any(|s| s.error.is_some())
                    || reading.targets.iter().any(|t| t.error.is_some());

                if run.cancel.is_cancelled() {
                    return Ok(());
                }
                let stored = readings.append(reading).await?;

                let mut status = run.status.write().await;
                status.last_success_ts = Some(stored.timestamp);
                status.samples_collected += 1;
                if !had_errors {
                    status.last_error = None;
                } else if let Some(message) = first_error(&stored) {
                    status.last_error = Some(message);
                }
            }
            Err(e) => return Err(e),
        }

        // Drift-corrected deadline: start + k·period. Overruns coalesce
        // into one immediate pass; further missed ticks are counted.
        tick += 1;
        let deadline = started + period.mul_f64(tick as f64);
        let now = tokio::time::Instant::now();
        if deadline <= now {
            let elapsed = now.duration_since(started).as_secs_f64();
            let due = (elapsed / period.as_secs_f64()).floor() as u64;
            if due > tick {
                run.status.write().await.ticks_coalesced += due - tick;
                tick = due;
            }
            continue;
        }

        tokio::select! {
            _ = run.cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}

fn first_error(reading: &Reading) -> Option<String> {
    for target in &reading.targets {
        if let Some(e) = &target.error {
            return Some(format!("{}: {e}", target.instrument_name));
        }
        for (name, signal) in &target.signals {
            if let Some(e) = &signal.error {
                return Some(format!("{}/{name}: {e}", target.instrument_name));
            }
        }
    }
    None
}
