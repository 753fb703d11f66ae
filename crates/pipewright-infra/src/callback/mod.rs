//! Inbound resumption signals.
//!
//! [`gate`] authenticates a signal and decides which [`Caller`] it speaks
//! for; [`endpoint`] parses it, checks it addresses a stage of the named
//! kind, and hands it to `Engine::resume`.
//!
//! [`Caller`]: pipewright_types::stage::Caller

pub mod endpoint;
pub mod gate;

pub use endpoint::{ResumptionSignal, SignalError, deliver_signal};
pub use gate::{CallbackGate, GateError};
