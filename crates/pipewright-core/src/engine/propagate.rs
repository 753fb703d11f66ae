//! Output propagation.
//!
//! After any stage changes, walk from it to the root. At each stage:
//! inherit outputs from a delegate, create children whose barriers are now
//! satisfied, wake a continuation whose futures resolved, and schedule
//! finalization once every output and child is done. Then copy the stage's
//! filled slots into its parent's resolved table and move up. Every step is
//! idempotent, so walking twice is harmless.

use std::collections::BTreeSet;

use pipewright_types::dispatch::DispatchToken;
use pipewright_types::event::StageEvent;
use pipewright_types::stage::{StageId, StageRecord, StageState};

use super::{Engine, EngineError, Mutation};
use crate::builder;
use crate::scheduler::Scheduler;
use crate::slots;
use crate::store::StageStore;

impl<S: StageStore, Q: Scheduler> Engine<S, Q> {
    pub(super) async fn propagate(&self, from: StageId) -> Result<(), EngineError> {
        let mut current = Some(from);
        while let Some(id) = current.take() {
            let record = self.reconcile(id).await?;
            if let Some(parent_id) = record.parent_id {
                self.absorb(parent_id, &record).await?;
                current = Some(parent_id);
            }
        }
        Ok(())
    }

    async fn absorb(&self, parent_id: StageId, child: &StageRecord) -> Result<(), EngineError> {
        let (_, learned) = self
            .mutate(parent_id, |parent| {
                if slots::absorb_child(parent, child) {
                    Mutation::Write(true)
                } else {
                    Mutation::Skip(false)
                }
            })
            .await?;
        if learned {
            tracing::debug!(stage_id = %parent_id, child = %child.id, "child outputs resolved");
        }
        Ok(())
    }

    /// Settle one stage against what its children have produced.
    async fn reconcile(&self, id: StageId) -> Result<StageRecord, EngineError> {
        let (mut record, events) = self
            .mutate(id, |rec| {
                if rec.state == StageState::Aborted {
                    return Mutation::Skip(Vec::new());
                }
                let filled = slots::inherit_from_delegate(rec);
                if filled.is_empty() {
                    return Mutation::Skip(Vec::new());
                }
                let events = filled
                    .into_iter()
                    .map(|name| StageEvent::OutputFilled {
                        stage_id: rec.id,
                        root_id: rec.root_id,
                        name,
                    })
                    .collect();
                Mutation::Write(events)
            })
            .await?;
        self.publish_all(events);

        if record.state == StageState::Aborted {
            return Ok(record);
        }

        let ready: BTreeSet<StageId> = builder::ready_declarations(&record)
            .into_iter()
            .map(|decl| decl.id)
            .collect();
        if !ready.is_empty() {
            record = self.materialize_children(&record, &ready).await?;
        }

        if record.state == StageState::Running
            && record.claim.is_none()
            && !record.cursor.blocked_on.is_empty()
            && record.blocked_futures_resolved()
        {
            tracing::debug!(stage_id = %id, step = record.cursor.step, "futures resolved, waking continuation");
            self.enqueue(
                DispatchToken::evaluate(id, record.cursor.step),
                None,
                &record.queue,
            )
            .await?;
        }

        if self.ready_to_finalize(&record).await? {
            self.enqueue(DispatchToken::finalize(id), None, &record.queue)
                .await?;
        }

        Ok(record)
    }

    /// Create the records for ready declarations, then mark them
    /// materialized on the parent. A crash in between only causes a
    /// repeated insert, which the store rejects as already present.
    async fn materialize_children(
        &self,
        parent: &StageRecord,
        ready: &BTreeSet<StageId>,
    ) -> Result<StageRecord, EngineError> {
        let mut created = BTreeSet::new();
        for decl in parent.children.iter().filter(|d| ready.contains(&d.id)) {
            let Some(child) = builder::materialize(parent, decl, &self.config.retry) else {
                continue;
            };
            self.insert(child).await?;
            self.make_ready(decl.id).await?;
            created.insert(decl.id);
        }

        let (record, _) = self
            .mutate(parent.id, |rec| {
                let mut changed = false;
                for decl in rec.children.iter_mut() {
                    if created.contains(&decl.id) && !decl.materialized {
                        decl.materialized = true;
                        changed = true;
                    }
                }
                if changed {
                    Mutation::Write(())
                } else {
                    Mutation::Skip(())
                }
            })
            .await?;
        Ok(record)
    }

    /// Completed, every output filled, every child completed, and a
    /// delegate (if any) already finalized.
    pub(super) async fn ready_to_finalize(&self, record: &StageRecord) -> Result<bool, EngineError> {
        if record.state != StageState::Completed
            || !record.all_outputs_filled()
            || !record.children_completed()
        {
            return Ok(false);
        }
        match record.delegate {
            None => Ok(true),
            Some(delegate) => {
                let child = self.load(delegate).await?;
                Ok(child.state == StageState::Finalized)
            }
        }
    }
}
