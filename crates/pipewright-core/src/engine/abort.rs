//! Abort propagation.
//!
//! Aborts run top-down over the whole workflow tree and are idempotent:
//! stages already `Finalized` or `Aborted` are left alone, and only the
//! caller whose write moves a stage to `Aborted` runs its abort hook.

use std::collections::{HashMap, VecDeque};

use pipewright_types::event::StageEvent;
use pipewright_types::stage::{StageId, StageState};

use super::{AbortResult, Engine, EngineError, Mutation};
use crate::context::FinalizeContext;
use crate::scheduler::Scheduler;
use crate::store::StageStore;

impl<S: StageStore, Q: Scheduler> Engine<S, Q> {
    /// Abort the workflow tree containing `stage_id`.
    #[tracing::instrument(name = "abort_workflow", skip_all, fields(stage_id = %stage_id))]
    pub async fn abort(&self, stage_id: StageId, reason: &str) -> Result<AbortResult, EngineError> {
        let record = self.load(stage_id).await?;
        self.abort_tree(record.root_id, reason).await
    }

    pub(super) async fn abort_tree(
        &self,
        root_id: StageId,
        reason: &str,
    ) -> Result<AbortResult, EngineError> {
        let records = self.store.list_tree(&root_id).await?;
        let mut children: HashMap<StageId, Vec<StageId>> = HashMap::new();
        for record in &records {
            if let Some(parent_id) = record.parent_id {
                children.entry(parent_id).or_default().push(record.id);
            }
        }

        let mut aborted = Vec::new();
        let mut queue = VecDeque::from([root_id]);
        while let Some(id) = queue.pop_front() {
            if self.abort_one(id, reason).await? {
                aborted.push(id);
            }
            if let Some(kids) = children.get(&id) {
                queue.extend(kids.iter().copied());
            }
        }

        if !aborted.is_empty() {
            tracing::info!(root_id = %root_id, aborted = aborted.len(), reason = %reason, "workflow aborted");
        }
        Ok(AbortResult { aborted })
    }

    /// Move one stage to `Aborted`. Returns `true` if this call did it.
    pub(super) async fn abort_one(&self, id: StageId, reason: &str) -> Result<bool, EngineError> {
        let (record, won) = self
            .mutate(id, |rec| {
                if rec.state.is_terminal() {
                    return Mutation::Skip(false);
                }
                rec.state = StageState::Aborted;
                rec.abort_reason = Some(reason.to_string());
                rec.claim = None;
                Mutation::Write(true)
            })
            .await?;
        if !won {
            return Ok(false);
        }

        self.events.publish(StageEvent::Aborted {
            stage_id: id,
            root_id: record.root_id,
            reason: reason.to_string(),
        });
        tracing::debug!(stage_id = %id, kind = %record.kind, "stage aborted");

        if let Ok(logic) = self.registry.get(&record.kind) {
            logic.aborted(&FinalizeContext::new(&record));
        }
        Ok(true)
    }
}
