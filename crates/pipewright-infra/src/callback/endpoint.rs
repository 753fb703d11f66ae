//! Resumption endpoint: a signal addressed by stage kind and identity.
//!
//! The wire form is a JSON body
//! `{"kind": "...", "stage_id": "...", "payload": {...}}`; the gate
//! authenticates the raw body before it is parsed.

use pipewright_core::engine::{Engine, ResumeError, ResumeResult};
use pipewright_core::scheduler::Scheduler;
use pipewright_core::store::StageStore;
use pipewright_types::stage::StageId;
use serde_json::Value;

use super::gate::{CallbackGate, GateError};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResumptionSignal {
    pub kind: String,
    pub stage_id: StageId,
    #[serde(default)]
    pub payload: Value,
}

impl ResumptionSignal {
    pub fn new(kind: impl Into<String>, stage_id: StageId, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            stage_id,
            payload,
        }
    }

    pub fn to_body(&self) -> Result<Vec<u8>, SignalError> {
        serde_json::to_vec(self).map_err(|e| SignalError::Malformed(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("signal rejected: {0}")]
    Gate(#[from] GateError),

    #[error("malformed signal: {0}")]
    Malformed(String),

    #[error(transparent)]
    Resume(#[from] ResumeError),
}

/// Authenticate, parse and deliver one signal.
///
/// A signal whose `kind` does not match the addressed stage is treated as
/// addressing an unknown stage.
#[tracing::instrument(name = "deliver_signal", skip_all)]
pub async fn deliver_signal<S: StageStore, Q: Scheduler>(
    engine: &Engine<S, Q>,
    gate: &CallbackGate,
    body: &[u8],
    signature: Option<&str>,
    authorization: Option<&str>,
) -> Result<ResumeResult, SignalError> {
    let caller = gate.authenticate(body, signature, authorization)?;
    let signal: ResumptionSignal =
        serde_json::from_slice(body).map_err(|e| SignalError::Malformed(e.to_string()))?;

    let record = engine
        .get(signal.stage_id)
        .await
        .map_err(ResumeError::from)?;
    match record {
        Some(record) if record.kind == signal.kind => {}
        _ => {
            tracing::warn!(stage_id = %signal.stage_id, kind = %signal.kind, "signal for unknown stage");
            return Err(ResumeError::UnknownStage(signal.stage_id).into());
        }
    }

    tracing::debug!(stage_id = %signal.stage_id, caller = ?caller, "delivering resumption signal");
    Ok(engine.resume(signal.stage_id, signal.payload, caller).await?)
}
