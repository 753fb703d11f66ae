//! Finalize dispatches: `Completed -> Finalizing -> Finalized`, running the
//! finalize hook exactly once.

use chrono::Utc;
use pipewright_types::dispatch::DispatchToken;
use pipewright_types::event::StageEvent;
use pipewright_types::stage::{StageRecord, StageState};

use super::{Engine, EngineError, HandleOutcome, Mutation};
use crate::context::FinalizeContext;
use crate::scheduler::Scheduler;
use crate::store::StageStore;

impl<S: StageStore, Q: Scheduler> Engine<S, Q> {
    pub(super) async fn finalize(&self, token: DispatchToken) -> Result<HandleOutcome, EngineError> {
        let id = token.stage_id;
        let claim = token.to_string();

        let current = self.load(id).await?;
        // A redelivery after the `Finalizing` write finds its own claim. The
        // hook may already have run, so it is not run again.
        let redelivered = current.state == StageState::Finalizing
            && current.claim.as_deref() == Some(claim.as_str());

        let hook_error = if redelivered {
            tracing::warn!(stage_id = %id, token = %claim, "finalize redelivered, completing without hook");
            None
        } else {
            if !self.ready_to_finalize(&current).await? {
                return self.drop_finalize(&current, &claim).await;
            }

            let (record, won) = self
                .mutate(id, |rec| {
                    if rec.state == StageState::Completed
                        && rec.all_outputs_filled()
                        && rec.children_completed()
                    {
                        rec.state = StageState::Finalizing;
                        rec.claim = Some(claim.clone());
                        Mutation::Write(true)
                    } else {
                        Mutation::Skip(false)
                    }
                })
                .await?;
            if !won {
                return self.drop_finalize(&record, &claim).await;
            }

            // Only the writer of `Finalizing` gets here.
            let hook_error = match self.registry.get(&record.kind) {
                Ok(logic) => logic.finalize(&FinalizeContext::new(&record)).err(),
                Err(err) => Some(err),
            };
            if let Some(err) = &hook_error {
                tracing::warn!(stage_id = %id, kind = %record.kind, error = %err, "finalize hook failed");
            }
            hook_error
        };

        let (record, finalized) = self
            .mutate(id, |rec| {
                if rec.state != StageState::Finalizing || rec.claim.as_deref() != Some(claim.as_str()) {
                    return Mutation::Skip(false);
                }
                rec.state = StageState::Finalized;
                rec.claim = None;
                rec.finalized_at = Some(Utc::now());
                if let Some(err) = &hook_error {
                    rec.last_error = Some(format!("finalize: {err}"));
                }
                Mutation::Write(true)
            })
            .await?;
        if !finalized {
            // Aborted while the hook ran.
            return Ok(HandleOutcome::Applied(record.state));
        }

        self.events.publish(StageEvent::Finalized {
            stage_id: id,
            root_id: record.root_id,
        });
        if record.is_root() {
            tracing::info!(root_id = %id, kind = %record.kind, "workflow finalized");
        } else {
            tracing::debug!(stage_id = %id, kind = %record.kind, "stage finalized");
        }

        // A parent that delegated to this stage may now finalize.
        self.propagate(id).await?;
        Ok(HandleOutcome::Applied(StageState::Finalized))
    }

    async fn drop_finalize(
        &self,
        record: &StageRecord,
        token: &str,
    ) -> Result<HandleOutcome, EngineError> {
        tracing::warn!(stage_id = %record.id, token = %token, state = %record.state, "dropping duplicate dispatch");
        self.events.publish(StageEvent::DuplicateDropped {
            stage_id: record.id,
            root_id: record.root_id,
            token: token.to_string(),
        });
        // Propagation after the `Finalized` write may have been cut short.
        if record.state == StageState::Finalized {
            self.propagate(record.id).await?;
        }
        Ok(HandleOutcome::Duplicate)
    }
}
