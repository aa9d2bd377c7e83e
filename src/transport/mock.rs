//! Scripted in-memory transport for tests and simulation
//!
//! A [`MockFactory`] holds one [`ScriptedInstrument`] per registered address.
//! Sessions opened through the factory share the instrument's script and
//! journal, so tests can assert on exactly which commands were sent and
//! reconfigure replies while a collector run is live.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{
    InstrumentAddress, TransportError, TransportFactory, TransportResult, TransportSession,
};

#[derive(Default)]
struct ScriptState {
    /// Exact-match command → reply.
    replies: HashMap<String, String>,
    /// Reply for unscripted queries.
    default_reply: String,
    /// When set, every operation fails with this error.
    fail_with: Option<TransportError>,
    /// Every command sent, in order.
    journal: Vec<String>,
    open_sessions: usize,
    total_opens: usize,
}

/// Shared script + journal for one mock instrument.
#[derive(Clone, Default)]
pub struct ScriptedInstrument {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedInstrument {
    pub fn new() -> Self {
        let inst = Self::default();
        inst.lock().default_reply = "0".to_string();
        inst
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        // A poisoned mutex means a test already panicked; propagating the
        // inner state is still the most useful behavior.
        match self.state.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    /// Script the reply for an exact command string.
    pub fn set_reply(&self, command: impl Into<String>, reply: impl Into<String>) {
        self.lock().replies.insert(command.into(), reply.into());
    }

    /// Reply used for queries with no scripted entry.
    pub fn set_default_reply(&self, reply: impl Into<String>) {
        self.lock().default_reply = reply.into();
    }

    /// Make every subsequent operation fail.
    pub fn fail_with(&self, error: TransportError) {
        self.lock().fail_with = Some(error);
    }

    /// Clear a previously injected failure.
    pub fn recover(&self) {
        self.lock().fail_with = None;
    }

    /// Every command sent so far, in order.
    pub fn sent_commands(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    /// How many times an exact command was sent.
    pub fn times_sent(&self, command: &str) -> usize {
        self.lock().journal.iter().filter(|c| *c == command).count()
    }

    /// Currently open session count (asserting release after stop).
    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    pub fn total_opens(&self) -> usize {
        self.lock().total_opens
    }

    fn record_and_reply(&self, command: &str, is_query: bool) -> TransportResult<String> {
        let mut state = self.lock();
        if let Some(err) = &state.fail_with {
            return Err(err.clone());
        }
        state.journal.push(command.to_string());
        if !is_query {
            return Ok(String::new());
        }
        let reply = state
            .replies
            .get(command)
            .cloned()
            .unwrap_or_else(|| state.default_reply.clone());
        Ok(reply)
    }
}

/// Factory over a registry of scripted instruments, keyed by session key.
#[derive(Clone, Default)]
pub struct MockFactory {
    instruments: Arc<Mutex<HashMap<String, ScriptedInstrument>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scripted instrument for `host[:port]/device` and return
    /// its handle for scripting and assertions. Idempotent: registering an
    /// address again returns the existing handle.
    pub fn register(&self, address: &str) -> ScriptedInstrument {
        let key = InstrumentAddress::parse(address)
            .map(|a| a.session_key())
            .unwrap_or_else(|_| address.to_string());
        let mut guard = match self.instruments.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        guard
            .entry(key)
            .or_insert_with(ScriptedInstrument::new)
            .clone()
    }

    fn find(&self, address: &InstrumentAddress) -> Option<ScriptedInstrument> {
        let guard = match self.instruments.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        guard.get(&address.session_key()).cloned()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(
        &self,
        address: &InstrumentAddress,
    ) -> TransportResult<Box<dyn TransportSession>> {
        let instrument = self.find(address).ok_or_else(|| TransportError::Unreachable {
            address: address.to_string(),
            reason: "no mock instrument registered".to_string(),
        })?;
        {
            let mut state = instrument.lock();
            if let Some(err) = &state.fail_with {
                return Err(err.clone());
            }
            state.open_sessions += 1;
            state.total_opens += 1;
        }
        Ok(Box::new(MockTransport { instrument }))
    }
}

/// One session onto a [`ScriptedInstrument`].
pub struct MockTransport {
    instrument: ScriptedInstrument,
}

#[async_trait]
impl TransportSession for MockTransport {
    async fn query(&mut self, command: &str) -> TransportResult<String> {
        self.instrument.record_and_reply(command, true)
    }

    async fn write(&mut self, command: &str) -> TransportResult<()> {
        self.instrument.record_and_reply(command, false).map(|_| ())
    }

    async fn close(&mut self) {
        let mut state = self.instrument.lock();
        state.open_sessions = state.open_sessions.saturating_sub(1);
    }
}
