//! Run and Evaluate dispatches: claim the stage, advance its continuation,
//! commit the result or route the failure to retry or abort.

use std::collections::BTreeSet;

use chrono::Utc;
use pipewright_types::dispatch::{DispatchToken, TaskKind};
use pipewright_types::event::StageEvent;
use pipewright_types::stage::{StageId, StageRecord, StageState};

use super::{Engine, EngineError, HandleOutcome, Mutation};
use crate::builder::{self, Entry, Next, StepCommit};
use crate::logic::StageError;
use crate::retry::RetryHandler;
use crate::scheduler::Scheduler;
use crate::slots::{self, FillResult};
use crate::store::StageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Fresh,
    /// Redelivery of the token that holds the claim (e.g. after a store
    /// hiccup during commit).
    Redelivered,
    Refused,
}

impl<S: StageStore, Q: Scheduler> Engine<S, Q> {
    pub(super) async fn execute(&self, token: DispatchToken) -> Result<HandleOutcome, EngineError> {
        let id = token.stage_id;
        let claim = token.to_string();

        let (record, outcome) = self
            .mutate(id, |rec| {
                let claimable = match token.kind {
                    TaskKind::Run => rec.state == StageState::Ready && rec.attempt == token.seq,
                    TaskKind::Evaluate => {
                        rec.state == StageState::Running
                            && rec.claim.is_none()
                            && rec.cursor.step == token.seq
                            && !rec.cursor.blocked_on.is_empty()
                            && rec.blocked_futures_resolved()
                    }
                    TaskKind::Finalize => false,
                };
                if claimable {
                    rec.state = StageState::Running;
                    rec.claim = Some(claim.clone());
                    Mutation::Write(Claim::Fresh)
                } else if rec.state == StageState::Running && rec.claim.as_deref() == Some(claim.as_str()) {
                    Mutation::Skip(Claim::Redelivered)
                } else {
                    Mutation::Skip(Claim::Refused)
                }
            })
            .await?;

        match outcome {
            Claim::Refused => return self.drop_duplicate(&record, token).await,
            Claim::Fresh if token.kind == TaskKind::Run => {
                self.events.publish(StageEvent::Running {
                    stage_id: id,
                    root_id: record.root_id,
                    attempt: record.attempt,
                });
                tracing::debug!(stage_id = %id, kind = %record.kind, attempt = record.attempt, "stage running");
            }
            _ => {
                tracing::debug!(stage_id = %id, step = record.cursor.step, "advancing continuation");
            }
        }

        let logic = match self.registry.get(&record.kind) {
            Ok(logic) => logic,
            Err(err) => return self.fail(&record, &claim, err).await,
        };

        match builder::evaluate(&record, logic.as_ref(), &self.registry, Entry::Run) {
            Ok(commit) => {
                let state = self.commit(id, &claim, &commit).await?;
                Ok(HandleOutcome::Applied(state))
            }
            Err(err) => self.fail(&record, &claim, err).await,
        }
    }

    /// Apply an evaluation's effects if `claim` still holds the stage.
    ///
    /// Returns the stage's state afterwards.
    pub(super) async fn commit(
        &self,
        id: StageId,
        claim: &str,
        commit: &StepCommit,
    ) -> Result<StageState, EngineError> {
        let (record, events) = self
            .mutate(id, |rec| {
                if rec.claim.as_deref() != Some(claim) || rec.cursor.step != commit.expected_step {
                    return Mutation::Skip(None);
                }
                let mut events = Vec::new();

                rec.cursor = commit.cursor.clone();
                rec.children.extend(commit.new_children.iter().cloned());
                for (name, value) in &commit.fills {
                    if slots::fill(rec, name, value.clone()) == FillResult::Filled {
                        events.push(StageEvent::OutputFilled {
                            stage_id: rec.id,
                            root_id: rec.root_id,
                            name: name.clone(),
                        });
                    }
                }
                rec.claim = None;

                match &commit.next {
                    Next::Blocked => {}
                    Next::Completed => {
                        rec.state = StageState::Completed;
                        events.push(StageEvent::Completed {
                            stage_id: rec.id,
                            root_id: rec.root_id,
                        });
                    }
                    Next::Suspended => {
                        rec.state = StageState::AsyncSuspended;
                        events.push(StageEvent::AsyncSuspended {
                            stage_id: rec.id,
                            root_id: rec.root_id,
                        });
                    }
                    Next::Delegated { child, inherited } => {
                        rec.state = StageState::Completed;
                        rec.delegate = Some(*child);
                        if let Some(decl) = rec.children.iter_mut().find(|d| d.id == *child) {
                            decl.inherited_outputs = inherited.clone();
                        }
                        events.push(StageEvent::Completed {
                            stage_id: rec.id,
                            root_id: rec.root_id,
                        });
                    }
                }
                Mutation::Write(Some(events))
            })
            .await?;

        let Some(events) = events else {
            tracing::debug!(stage_id = %id, "claim lost before commit, discarding evaluation");
            return Ok(record.state);
        };
        self.publish_all(events);

        match &commit.next {
            Next::Blocked => tracing::debug!(
                stage_id = %id,
                step = record.cursor.step,
                pending = builder::pending_futures(&record).len(),
                "stage waiting on futures"
            ),
            Next::Suspended => tracing::debug!(stage_id = %id, "stage suspended"),
            Next::Completed => tracing::debug!(stage_id = %id, "stage completed"),
            Next::Delegated { child, inherited } => {
                tracing::debug!(stage_id = %id, delegate = %child, "stage completed by delegation");
                self.flag_inherited(*child, inherited).await?;
            }
        }

        self.propagate(id).await?;
        Ok(record.state)
    }

    /// Mark `inherited` on a delegate created in an earlier step. A delegate
    /// declared in the delegating step gets the set when it is created.
    async fn flag_inherited(
        &self,
        child: StageId,
        inherited: &BTreeSet<String>,
    ) -> Result<(), EngineError> {
        if self.store.get(&child).await?.is_none() {
            return Ok(());
        }
        self.mutate(child, |rec| {
            if inherited.is_subset(&rec.inherited_outputs) {
                Mutation::Skip(())
            } else {
                rec.inherited_outputs.extend(inherited.iter().cloned());
                Mutation::Write(())
            }
        })
        .await?;
        Ok(())
    }

    /// Route a failed evaluation: retry recoverable errors while attempts
    /// remain, otherwise abort the whole tree.
    pub(super) async fn fail(
        &self,
        record: &StageRecord,
        claim: &str,
        err: StageError,
    ) -> Result<HandleOutcome, EngineError> {
        let id = record.id;

        if !err.is_fatal() && RetryHandler::should_retry(&record.retry, record.attempt) {
            self.schedule_retry(record, claim, &err).await?;
            return Ok(HandleOutcome::Applied(StageState::Ready));
        }

        let reason = if err.is_fatal() {
            err.to_string()
        } else {
            format!("giving up after {} attempts: {err}", record.attempt)
        };
        tracing::warn!(stage_id = %id, root_id = %record.root_id, kind = %record.kind, error = %reason, "stage failed");

        self.mutate(id, |rec| {
            if rec.claim.as_deref() == Some(claim) {
                rec.claim = None;
                rec.last_error = Some(reason.clone());
                Mutation::Write(())
            } else {
                Mutation::Skip(())
            }
        })
        .await?;

        self.abort_tree(record.root_id, &format!("stage {id} failed: {reason}"))
            .await?;
        Ok(HandleOutcome::Applied(StageState::Aborted))
    }

    async fn schedule_retry(
        &self,
        record: &StageRecord,
        claim: &str,
        err: &StageError,
    ) -> Result<(), EngineError> {
        let id = record.id;
        let next_attempt = record.attempt + 1;
        let delay = RetryHandler::backoff_delay(&record.retry, record.attempt);

        let (_, retrying) = self
            .mutate(id, |rec| {
                if rec.claim.as_deref() == Some(claim) {
                    rec.state = StageState::Retrying;
                    rec.attempt = next_attempt;
                    rec.claim = None;
                    rec.last_error = Some(err.to_string());
                    Mutation::Write(true)
                } else {
                    Mutation::Skip(false)
                }
            })
            .await?;
        if !retrying {
            return Ok(());
        }

        tracing::warn!(
            stage_id = %id,
            kind = %record.kind,
            attempt = next_attempt,
            delay_secs = delay.as_secs(),
            error = %err,
            "stage failed, retrying"
        );
        self.events.publish(StageEvent::Retrying {
            stage_id: id,
            root_id: record.root_id,
            attempt: next_attempt,
            error: err.to_string(),
            delay_secs: delay.as_secs(),
        });

        self.ready_retry(id, next_attempt, delay).await
    }

    /// `Retrying -> Ready` for `attempt`, then enqueue its run after `delay`.
    async fn ready_retry(
        &self,
        id: StageId,
        attempt: u32,
        delay: std::time::Duration,
    ) -> Result<(), EngineError> {
        let (ready, became_ready) = self
            .mutate(id, |rec| {
                if rec.state == StageState::Retrying && rec.attempt == attempt {
                    rec.state = StageState::Ready;
                    Mutation::Write(true)
                } else {
                    Mutation::Skip(false)
                }
            })
            .await?;
        if became_ready {
            self.events.publish(StageEvent::Ready {
                stage_id: id,
                root_id: ready.root_id,
                attempt,
            });
        }
        if ready.state != StageState::Ready || ready.attempt != attempt {
            return Ok(());
        }

        let not_before = (!delay.is_zero()).then(|| {
            Utc::now() + chrono::TimeDelta::from_std(delay).unwrap_or_else(|_| chrono::TimeDelta::zero())
        });
        self.enqueue(DispatchToken::run(id, attempt), not_before, &ready.queue)
            .await
    }

    async fn drop_duplicate(
        &self,
        record: &StageRecord,
        token: DispatchToken,
    ) -> Result<HandleOutcome, EngineError> {
        tracing::warn!(stage_id = %record.id, token = %token, state = %record.state, "dropping duplicate dispatch");
        self.events.publish(StageEvent::DuplicateDropped {
            stage_id: record.id,
            root_id: record.root_id,
            token: token.to_string(),
        });

        // The run that failed into a retry may have stopped before the next
        // attempt was made ready and enqueued.
        let retry_pending = matches!(record.state, StageState::Retrying | StageState::Ready);
        if token.kind == TaskKind::Run && retry_pending && record.attempt == token.seq + 1 {
            let delay = RetryHandler::backoff_delay(&record.retry, token.seq);
            self.ready_retry(record.id, record.attempt, delay).await?;
            return Ok(HandleOutcome::Duplicate);
        }

        // A crash between commit and propagation leaves children unmade or
        // parents uninformed; re-propagating is idempotent.
        if record.state != StageState::Aborted {
            self.propagate(record.id).await?;
        }
        Ok(HandleOutcome::Duplicate)
    }
}
