//! Stage lifecycle events published on the engine's event bus.

use serde::{Deserialize, Serialize};

use crate::stage::StageId;

/// A lifecycle change of one stage.
///
/// Every variant carries the stage and its root so subscribers can filter a
/// single workflow tree without extra lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageEvent {
    /// A stage record was persisted.
    Created {
        stage_id: StageId,
        root_id: StageId,
        parent_id: Option<StageId>,
        kind: String,
    },

    /// The stage's inputs are resolved and a run was enqueued.
    Ready {
        stage_id: StageId,
        root_id: StageId,
        attempt: u32,
    },

    /// A worker claimed the stage.
    Running {
        stage_id: StageId,
        root_id: StageId,
        attempt: u32,
    },

    /// The stage is waiting for an external resumption signal.
    AsyncSuspended { stage_id: StageId, root_id: StageId },

    /// The stage's logic finished.
    Completed { stage_id: StageId, root_id: StageId },

    /// One output slot was written.
    OutputFilled {
        stage_id: StageId,
        root_id: StageId,
        name: String,
    },

    /// The finalize hook ran and the stage is done.
    Finalized { stage_id: StageId, root_id: StageId },

    /// A recoverable failure; the next attempt is scheduled.
    Retrying {
        stage_id: StageId,
        root_id: StageId,
        attempt: u32,
        error: String,
        delay_secs: u64,
    },

    /// The stage was aborted.
    Aborted {
        stage_id: StageId,
        root_id: StageId,
        reason: String,
    },

    /// A dispatch arrived for work that is already done or claimed.
    DuplicateDropped {
        stage_id: StageId,
        root_id: StageId,
        token: String,
    },
}

impl StageEvent {
    pub fn stage_id(&self) -> StageId {
        match self {
            StageEvent::Created { stage_id, .. }
            | StageEvent::Ready { stage_id, .. }
            | StageEvent::Running { stage_id, .. }
            | StageEvent::AsyncSuspended { stage_id, .. }
            | StageEvent::Completed { stage_id, .. }
            | StageEvent::OutputFilled { stage_id, .. }
            | StageEvent::Finalized { stage_id, .. }
            | StageEvent::Retrying { stage_id, .. }
            | StageEvent::Aborted { stage_id, .. }
            | StageEvent::DuplicateDropped { stage_id, .. } => *stage_id,
        }
    }

    pub fn root_id(&self) -> StageId {
        match self {
            StageEvent::Created { root_id, .. }
            | StageEvent::Ready { root_id, .. }
            | StageEvent::Running { root_id, .. }
            | StageEvent::AsyncSuspended { root_id, .. }
            | StageEvent::Completed { root_id, .. }
            | StageEvent::OutputFilled { root_id, .. }
            | StageEvent::Finalized { root_id, .. }
            | StageEvent::Retrying { root_id, .. }
            | StageEvent::Aborted { root_id, .. }
            | StageEvent::DuplicateDropped { root_id, .. } => *root_id,
        }
    }

    /// The stage reached a state it never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageEvent::Finalized { .. } | StageEvent::Aborted { .. }
        )
    }
}
