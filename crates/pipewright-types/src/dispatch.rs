//! Dispatch tokens handed to the external scheduler.
//!
//! A token names one unit of work for one stage. Tokens are stable: the
//! same logical work always produces the same token, so the scheduler can
//! drop duplicates and the engine can recognise redelivery.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::StageId;

/// What a worker should do with a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Execute the stage logic for one attempt.
    Run,
    /// Advance a waiting continuation whose futures were resolved.
    Evaluate,
    /// Run the finalize hook.
    Finalize,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Run => "run",
            TaskKind::Evaluate => "evaluate",
            TaskKind::Finalize => "finalize",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of one unit of work.
///
/// `seq` is the attempt number for `Run`, the continuation step for
/// `Evaluate`, and zero for `Finalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchToken {
    pub stage_id: StageId,
    pub kind: TaskKind,
    pub seq: u32,
}

impl DispatchToken {
    pub fn run(stage_id: StageId, attempt: u32) -> Self {
        Self {
            stage_id,
            kind: TaskKind::Run,
            seq: attempt,
        }
    }

    pub fn evaluate(stage_id: StageId, step: u32) -> Self {
        Self {
            stage_id,
            kind: TaskKind::Evaluate,
            seq: step,
        }
    }

    pub fn finalize(stage_id: StageId) -> Self {
        Self {
            stage_id,
            kind: TaskKind::Finalize,
            seq: 0,
        }
    }
}

impl fmt::Display for DispatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.stage_id, self.seq)
    }
}

/// Failure to parse a serialized [`DispatchToken`].
#[derive(Debug, thiserror::Error)]
#[error("invalid dispatch token '{0}'")]
pub struct TokenParseError(pub String);

impl FromStr for DispatchToken {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TokenParseError(s.to_string());
        let mut parts = s.splitn(3, ':');
        let kind = match parts.next() {
            Some("run") => TaskKind::Run,
            Some("evaluate") => TaskKind::Evaluate,
            Some("finalize") => TaskKind::Finalize,
            _ => return Err(err()),
        };
        let stage_id = parts
            .next()
            .and_then(|p| p.parse::<StageId>().ok())
            .ok_or_else(err)?;
        let seq = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(err)?;
        Ok(Self {
            stage_id,
            kind,
            seq,
        })
    }
}

/// A token plus delivery constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub token: DispatchToken,
    /// Earliest delivery time; `None` means now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    pub queue: String,
}

/// Scheduler acknowledgement of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ack {
    Accepted,
    /// The token was already enqueued; nothing was added.
    Duplicate,
}
