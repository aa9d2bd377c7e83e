//! Data model — instruments, monitoring setups, readings
//!
//! Persisted shapes match the on-disk JSON layout exactly; the capability
//! descriptor travels as stringified JSON inside the instrument
//! `description` field and is parsed into a typed record at the core
//! boundary.

mod instrument;
mod reading;
mod setup;

pub use instrument::{Capability, Instrument, Mode, ModeParameter, Signal, SignalModeConfig};
pub use reading::{Reading, SignalReading, TargetReading};
pub use setup::{
    param_to_string, CompareOp, MachineState, ModeSelection, MonitoringSetup, Rule, Target,
    TargetParameters, Transition,
};
