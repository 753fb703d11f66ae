//! Callback resumption of asynchronous stages.

use pipewright_types::event::StageEvent;
use pipewright_types::stage::{Caller, StageId, StageState};
use serde_json::Value;

use super::{Engine, Mutation, ResumeError, ResumeResult};
use crate::builder::{self, Entry};
use crate::scheduler::Scheduler;
use crate::store::StageStore;

impl<S: StageStore, Q: Scheduler> Engine<S, Q> {
    /// Deliver an external signal to a suspended stage.
    ///
    /// The stage's callback runs with the arguments stored on its record;
    /// the payload is passed alongside them. A signal for a stage that has
    /// already completed is ignored. A signal may be repeated after an
    /// infrastructure error; the repeat finishes the interrupted one.
    #[tracing::instrument(name = "resume_stage", skip_all, fields(stage_id = %stage_id, caller = ?caller))]
    pub async fn resume(
        &self,
        stage_id: StageId,
        payload: Value,
        caller: Caller,
    ) -> Result<ResumeResult, ResumeError> {
        let record = self
            .store
            .get(&stage_id)
            .await?
            .ok_or(ResumeError::UnknownStage(stage_id))?;
        let logic = self
            .registry
            .get(&record.kind)
            .map_err(|_| ResumeError::UnknownStage(stage_id))?;

        if !logic.callback_access().permits(caller) {
            tracing::warn!(stage_id = %stage_id, kind = %record.kind, "resumption signal rejected");
            return Err(ResumeError::Forbidden(stage_id));
        }
        if record.state.has_completed() {
            tracing::debug!(stage_id = %stage_id, "stage already completed, ignoring signal");
            // The signal that completed it may have failed before propagating.
            self.propagate(stage_id).await?;
            return Ok(ResumeResult::AlreadyCompleted);
        }

        let claim = format!("resume:{stage_id}:{}", record.cursor.step);
        // A signal whose commit failed leaves its claim behind; a repeated
        // signal picks the callback up under that same claim.
        let unfinished = record.state == StageState::Running
            && record.claim.as_deref() == Some(claim.as_str());
        if !unfinished && record.state != StageState::AsyncSuspended {
            return Err(ResumeError::UnknownStage(stage_id));
        }

        let claimed = if unfinished {
            tracing::warn!(stage_id = %stage_id, claim = %claim, "retrying unfinished resumption");
            record
        } else {
            let (claimed, won) = self
                .mutate(stage_id, |rec| {
                    if rec.state == StageState::AsyncSuspended {
                        rec.state = StageState::Running;
                        rec.claim = Some(claim.clone());
                        Mutation::Write(true)
                    } else {
                        Mutation::Skip(false)
                    }
                })
                .await?;
            if !won {
                return match claimed.state {
                    state if state.has_completed() => Ok(ResumeResult::AlreadyCompleted),
                    StageState::Running => Err(ResumeError::InProgress(stage_id)),
                    _ => Err(ResumeError::UnknownStage(stage_id)),
                };
            }
            self.events.publish(StageEvent::Running {
                stage_id,
                root_id: claimed.root_id,
                attempt: claimed.attempt,
            });
            claimed
        };

        match builder::evaluate(&claimed, logic.as_ref(), &self.registry, Entry::Callback(&payload)) {
            Ok(commit) => {
                let state = self.commit(stage_id, &claim, &commit).await?;
                tracing::info!(stage_id = %stage_id, state = %state, "stage resumed");
                Ok(ResumeResult::Resumed(state))
            }
            Err(error) if !error.is_fatal() => {
                let message = error.to_string();
                let (_, reverted) = self
                    .mutate(stage_id, |rec| {
                        if rec.claim.as_deref() == Some(claim.as_str()) {
                            rec.state = StageState::AsyncSuspended;
                            rec.claim = None;
                            rec.last_error = Some(message.clone());
                            Mutation::Write(true)
                        } else {
                            Mutation::Skip(false)
                        }
                    })
                    .await?;
                if reverted {
                    self.events.publish(StageEvent::AsyncSuspended {
                        stage_id,
                        root_id: claimed.root_id,
                    });
                }
                tracing::warn!(stage_id = %stage_id, error = %error, "callback failed, stage stays suspended");
                Err(ResumeError::Callback { stage_id, error })
            }
            Err(error) => {
                self.fail(&claimed, &claim, error.clone()).await?;
                Err(ResumeError::Callback { stage_id, error })
            }
        }
    }
}
