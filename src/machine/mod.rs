//! State machine engine — per-setup automation sessions
//!
//! For a setup with a state machine, one session task ticks at a fixed
//! rate: on state entry the state's instrument settings go through the
//! collector's mode-activation path; on each tick the outgoing transitions
//! of the current state are judged against the latest sample and the time
//! counters, first match (in setup order) wins. Entering an end state
//! tears the session down. Driving implies collecting.

mod rules;

pub use rules::{evaluate, transition_holds, RuleContext};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::Collector;
use crate::error::{EngineError, EngineResult};
use crate::model::{MachineState, MonitoringSetup};
use crate::store::{Catalog, ReadingsLog};

/// Default tick rate: one evaluation per second.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(1);

/// Transition events kept per session for the status endpoint.
const TRANSITION_HISTORY_LIMIT: usize = 50;

/// One taken transition, for the session's recent history.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub at: DateTime<Utc>,
    pub transition_id: String,
    pub from_state_id: String,
    pub to_state_id: String,
}

/// Status snapshot of one automation session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MachineStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_entered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_in_current_state_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_session_time_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Ticks dropped because the previous handler overran.
    pub ticks_coalesced: u64,
    /// Most recent transitions, oldest first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionEvent>,
}

/// Mutable session state shared between the tick task and status queries.
struct SessionState {
    running: bool,
    current_state_id: Option<String>,
    session_started: Option<(Instant, DateTime<Utc>)>,
    state_entered: Option<(Instant, DateTime<Utc>)>,
    last_error: Option<String>,
    ticks_coalesced: u64,
    transitions: std::collections::VecDeque<TransitionEvent>,
}

impl SessionState {
    fn idle() -> Self {
        Self {
            running: false,
            current_state_id: None,
            session_started: None,
            state_entered: None,
            last_error: None,
            ticks_coalesced: 0,
            transitions: std::collections::VecDeque::new(),
        }
    }

    fn record_transition(&mut self, event: TransitionEvent) {
        if self.transitions.len() >= TRANSITION_HISTORY_LIMIT {
            self.transitions.pop_front();
        }
        self.transitions.push_back(event);
    }

    fn snapshot(&self) -> MachineStatus {
        let now = Instant::now();
        MachineStatus {
            running: self.running,
            current_state_id: self.current_state_id.clone(),
            session_started_at: self.session_started.map(|(_, wall)| wall),
            state_entered_at: self.state_entered.map(|(_, wall)| wall),
            time_in_current_state_s: self
                .running
                .then(|| self.state_entered.map(|(i, _)| (now - i).as_secs_f64()))
                .flatten(),
            total_session_time_s: self
                .running
                .then(|| self.session_started.map(|(i, _)| (now - i).as_secs_f64()))
                .flatten(),
            last_error: self.last_error.clone(),
            ticks_coalesced: self.ticks_coalesced,
            transitions: self.transitions.iter().cloned().collect(),
        }
    }
}

struct Session {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    state: Arc<RwLock<SessionState>>,
}

/// The state machine engine service. Holds no back-pointer from the
/// collector: modes flow through the collector's override cell, samples
/// flow back through the readings log.
pub struct MachineEngine {
    catalog: Arc<Catalog>,
    readings: Arc<ReadingsLog>,
    collector: Arc<Collector>,
    tick_period: Duration,
    sessions: RwLock<HashMap<i64, Arc<Session>>>,
    /// Session state outlives the session so status survives a stop.
    cells: RwLock<HashMap<i64, Arc<RwLock<SessionState>>>>,
    setup_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl MachineEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        readings: Arc<ReadingsLog>,
        collector: Arc<Collector>,
        tick_period: Duration,
    ) -> Self {
        Self {
            catalog,
            readings,
            collector,
            tick_period,
            sessions: RwLock::new(HashMap::new()),
            cells: RwLock::new(HashMap::new()),
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

    async fn cell(&self, setup_id: i64) -> Arc<RwLock<SessionState>> {
        let mut cells = self.cells.write().await;
        cells
            .entry(setup_id)
            .or_insert_with(|| Arc::new(RwLock::new(SessionState::idle())))
            .clone()
    }

    /// Start driving a setup's state machine. Idempotent for a live
    /// session. Preconditions: an initial state that exists and is not an
    /// end state, and reachable transports for every target. A failed
    /// start leaves everything stopped, with partial mode enables undone.
    pub async fn start(&self, setup_id: i64) -> EngineResult<MachineStatus> {
        let lock = self.setup_lock(setup_id).await;
        let _guard = lock.lock().await;

        let existing = self.sessions.read().await.get(&setup_id).cloned();
        if let Some(session) = existing {
            let status = session.state.read().await.snapshot();
            if status.running {
                return Ok(status);
            }
            self.teardown_session(setup_id, &session, false).await;
        }

        let setup = self.catalog.setup(setup_id).await?;
        let initial = validate_start(&setup)?;

        // Driving implies collecting; this also opens (and thereby probes)
        // every transport the setup needs.
        let collector_was_running = self.collector.is_running(setup_id).await;
        self.collector.start(setup_id).await?;

        // Enter the initial state. Any failure here unwinds: disables for
        // whatever was already enabled, collector back to stopped.
        let entry = self.apply_state_settings(setup_id, initial, false).await;
        if let Err(e) = entry {
            self.collector.deactivate_modes(setup_id).await;
            if !collector_was_running {
                if let Err(stop_err) = self.collector.stop(setup_id).await {
                    warn!(setup_id, "collector stop during unwind: {stop_err}");
                }
            }
            return Err(e);
        }

        let cell = self.cell(setup_id).await;
        let now_wall = Utc::now();
        let now = Instant::now();
        {
            let mut state = cell.write().await;
            *state = SessionState::idle();
            state.running = true;
            state.current_state_id = Some(initial.id.clone());
            state.session_started = Some((now, now_wall));
            state.state_entered = Some((now, now_wall));
        }

        let session = Arc::new(Session {
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            state: Arc::clone(&cell),
        });

        let task = tokio::spawn(run_session(
            Arc::clone(&self.catalog),
            Arc::clone(&self.readings),
            Arc::clone(&self.collector),
            Arc::clone(&session),
            setup_id,
            self.tick_period,
        ));
        *session.task.lock().await = Some(task);
        self.sessions.write().await.insert(setup_id, session);

        info!(setup_id, name = %setup.name, initial = %initial.id, "state machine started");
        let snapshot = cell.read().await.snapshot();
        Ok(snapshot)
    }

    /// Stop driving. Idempotent. Sends disable commands for the current
    /// modes (best effort) and stops collection for the setup.
    pub async fn stop(&self, setup_id: i64) -> EngineResult<MachineStatus> {
        let lock = self.setup_lock(setup_id).await;
        let _guard = lock.lock().await;

        let session = self.sessions.write().await.remove(&setup_id);
        if let Some(session) = session {
            self.teardown_session(setup_id, &session, true).await;
            info!(setup_id, "state machine stopped");
        }
        Ok(self.cell(setup_id).await.read().await.snapshot())
    }

    pub async fn status(&self, setup_id: i64) -> MachineStatus {
        self.cell(setup_id).await.read().await.snapshot()
    }

    /// Setup ids with a live session, for ordered shutdown.
    pub async fn running_setups(&self) -> Vec<i64> {
        let sessions = self.sessions.read().await;
        let mut ids = Vec::new();
        for (id, session) in sessions.iter() {
            if session.state.read().await.running {
                ids.push(*id);
            }
        }
        ids
    }

    async fn teardown_session(&self, setup_id: i64, session: &Arc<Session>, disable: bool) {
        session.cancel.cancel();
        if let Some(task) = session.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(setup_id, "machine task join: {e}");
            }
        }
        let was_running = {
            let state = session.state.read().await;
            state.running
        };
        if was_running {
            if disable {
                self.collector.deactivate_modes(setup_id).await;
            }
            if let Err(e) = self.collector.stop(setup_id).await {
                warn!(setup_id, "collector stop during machine teardown: {e}");
            }
            session.state.write().await.running = false;
        }
        self.sessions.write().await.remove(&setup_id);
    }

    /// Push a state's instrument settings through the collector: write the
    /// override cell, then activate immediately.
    async fn apply_state_settings(
        &self,
        setup_id: i64,
        state: &MachineState,
        force: bool,
    ) -> EngineResult<()> {
        let overrides: HashMap<i64, _> = state
            .instrument_settings
            .iter()
            .map(|(id, sel)| (*id, sel.clone()))
            .collect();
        self.collector.set_mode_overrides(setup_id, overrides).await?;
        self.collector.apply_overrides_now(setup_id, force).await?;
        Ok(())
    }
}

/// Start preconditions; returns the initial state.
fn validate_start(setup: &MonitoringSetup) -> EngineResult<&MachineState> {
    let initial_id = setup.initial_state_id.as_deref().ok_or_else(|| {
        EngineError::validation("initialStateID", "setup has no initial state")
    })?;
    let initial = setup.state(initial_id).ok_or_else(|| {
        EngineError::validation("initialStateID", format!("unknown state '{initial_id}'"))
    })?;
    if initial.is_end_state {
        return Err(EngineError::validation(
            "initialStateID",
            "initial state must not be an end state",
        ));
    }
    Ok(initial)
}

// ============================================================================
// Session task
// ============================================================================

/// The per-setup tick loop, panic-isolated at the task boundary.
async fn run_session(
    catalog: Arc<Catalog>,
    readings: Arc<ReadingsLog>,
    collector: Arc<Collector>,
    session: Arc<Session>,
    setup_id: i64,
    tick_period: Duration,
) {
    let loop_future = session_loop(
        Arc::clone(&catalog),
        Arc::clone(&readings),
        Arc::clone(&collector),
        Arc::clone(&session),
        setup_id,
        tick_period,
    );
    match AssertUnwindSafe(loop_future).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(setup_id, "state machine stopped on error: {e}");
            finish_session(&collector, &session, setup_id, Some(e.to_string())).await;
        }
        Err(_) => {
            error!(setup_id, "state machine task panicked");
            finish_session(
                &collector,
                &session,
                setup_id,
                Some("internal panic in state machine task".to_string()),
            )
            .await;
        }
    }
}

/// End-of-session teardown usable from inside the task itself: disables,
/// collector stop, final status. The engine's `stop` tolerates sessions
/// that already finished this way.
async fn finish_session(
    collector: &Arc<Collector>,
    session: &Arc<Session>,
    setup_id: i64,
    error_message: Option<String>,
) {
    collector.deactivate_modes(setup_id).await;
    if let Err(e) = collector.stop(setup_id).await {
        warn!(setup_id, "collector stop at session end: {e}");
    }
    let mut state = session.state.write().await;
    state.running = false;
    if error_message.is_some() {
        state.last_error = error_message;
    }
}

async fn session_loop(
    catalog: Arc<Catalog>,
    readings: Arc<ReadingsLog>,
    collector: Arc<Collector>,
    session: Arc<Session>,
    setup_id: i64,
    tick_period: Duration,
) -> EngineResult<()> {
    let mut tick: u64 = 0;
    let mut state_epoch = match session.state.read().await.state_entered {
        Some((instant, _)) => instant,
        None => Instant::now(),
    };

    loop {
        // Drift-corrected: deadline k counts from the current state's
        // entry. A slow tick coalesces; missed deadlines are dropped.
        tick += 1;
        let deadline = state_epoch + tick_period.mul_f64(tick as f64);
        let now = Instant::now();
        if deadline <= now {
            let due =
                ((now - state_epoch).as_secs_f64() / tick_period.as_secs_f64()).floor() as u64;
            if due > tick {
                session.state.write().await.ticks_coalesced += due - tick;
                tick = due;
            }
        } else {
            tokio::select! {
                _ = session.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
        if session.cancel.is_cancelled() {
            return Ok(());
        }

        // Re-resolve the setup so edits apply live; a deleted setup or a
        // dropped state machine ends the session.
        let setup = catalog.setup(setup_id).await?;
        let current_id = match session.state.read().await.current_state_id.clone() {
            Some(id) => id,
            None => return Ok(()),
        };
        if setup.state(&current_id).is_none() {
            return Err(EngineError::validation(
                "states",
                format!("current state '{current_id}' no longer exists"),
            ));
        }

        let (time_in_state, total_time) = {
            let state = session.state.read().await;
            let now = Instant::now();
            (
                state
                    .state_entered
                    .map(|(i, _)| now - i)
                    .unwrap_or_default(),
                state
                    .session_started
                    .map(|(i, _)| now - i)
                    .unwrap_or_default(),
            )
        };

        let latest = readings.latest(setup_id, 1).await;
        let ctx = RuleContext {
            latest: latest.first(),
            time_in_state,
            total_time,
        };

        let winner = setup
            .transitions_from(&current_id)
            .into_iter()
            .find(|t| transition_holds(t, &ctx))
            .cloned();

        let Some(transition) = winner else {
            continue;
        };

        let Some(target) = setup.state(&transition.target_state_id).cloned() else {
            return Err(EngineError::validation(
                "transitions",
                format!("target state '{}' no longer exists", transition.target_state_id),
            ));
        };

        info!(
            setup_id,
            from = %current_id,
            to = %target.id,
            transition = %transition.id,
            "state transition"
        );

        // Enter the target state.
        let now_wall = Utc::now();
        let now = Instant::now();
        {
            let mut state = session.state.write().await;
            state.current_state_id = Some(target.id.clone());
            state.state_entered = Some((now, now_wall));
            state.record_transition(TransitionEvent {
                at: now_wall,
                transition_id: transition.id.clone(),
                from_state_id: current_id.clone(),
                to_state_id: target.id.clone(),
            });
        }
        state_epoch = now;
        tick = 0;

        // Self-transitions re-apply settings even when the mode did not
        // change; ordinary entries stay edge-triggered.
        let force = target.id == current_id;
        let overrides: HashMap<i64, _> = target
            .instrument_settings
            .iter()
            .map(|(id, sel)| (*id, sel.clone()))
            .collect();
        collector.set_mode_overrides(setup_id, overrides).await?;
        match collector.apply_overrides_now(setup_id, force).await {
            Ok(_) => {
                session.state.write().await.last_error = None;
            }
            Err(EngineError::Transport(e)) => {
                // Transient: the collector's edge-trigger retries on its
                // next pass because the activation was not recorded.
                warn!(setup_id, state = %target.id, "state entry commands failed: {e}");
                session.state.write().await.last_error = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        if target.is_end_state {
            info!(setup_id, state = %target.id, "end state reached, session complete");
            finish_session(&collector, &session, setup_id, None).await;
            return Ok(());
        }
    }
}
