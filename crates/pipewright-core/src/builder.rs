//! Dependency graph builder.
//!
//! Runs a stage's continuation logic forward from its persisted cursor,
//! collecting the children it declares, the outputs it fills and the
//! futures it blocks on. Evaluation is pure: nothing is written until the
//! engine commits the returned [`StepCommit`], so a failed evaluation
//! leaves the stage exactly as it was and re-running it re-declares the
//! same children under the same identities.

use std::collections::{BTreeMap, BTreeSet};

use pipewright_types::stage::{
    Arg, ChildDeclaration, Cursor, DEFAULT_OUTPUT, NewStage, RetryPolicy, SlotRef, StageId,
    StageRecord,
};
use serde_json::Value;

use crate::context::StageContext;
use crate::logic::{Outcome, StageError, StageLogic, StageRegistry};

/// Upper bound on steps run in one evaluation without blocking.
pub const MAX_STEPS_PER_EVALUATION: u32 = 256;

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// How the first step of an evaluation is entered.
#[derive(Debug, Clone, Copy)]
pub enum Entry<'p> {
    Run,
    Callback(&'p Value),
}

/// Where the stage goes after the evaluation is committed.
#[derive(Debug, Clone, PartialEq)]
pub enum Next {
    /// Waiting on the cursor's `blocked_on` futures.
    Blocked,
    Completed,
    Suspended,
    /// Completed; the child fills the listed outputs on this stage's behalf.
    Delegated {
        child: StageId,
        inherited: BTreeSet<String>,
    },
}

/// The effects of one evaluation.
#[derive(Debug, Clone)]
pub struct StepCommit {
    /// Step the evaluation started from; the commit is void if the stored
    /// cursor has moved on.
    pub expected_step: u32,
    pub cursor: Cursor,
    pub new_children: Vec<ChildDeclaration>,
    pub fills: BTreeMap<String, Value>,
    pub next: Next,
}

/// Advance `record`'s continuation until it blocks, suspends or completes.
pub fn evaluate(
    record: &StageRecord,
    logic: &dyn StageLogic,
    registry: &StageRegistry,
    entry: Entry<'_>,
) -> Result<StepCommit, StageError> {
    let mut ctx = StageContext::new(record, registry);
    let mut step = record.cursor.step;
    let mut entry = Some(entry);
    let mut blocked_on = Vec::new();
    let mut taken = 0;

    let next = loop {
        if taken == MAX_STEPS_PER_EVALUATION {
            return Err(StageError::Abort(format!(
                "continuation ran {MAX_STEPS_PER_EVALUATION} steps without blocking"
            )));
        }
        taken += 1;
        ctx.set_step(step);

        let outcome = match entry.take() {
            Some(Entry::Callback(payload)) => logic.callback(&mut ctx, payload)?,
            _ => logic.run(&mut ctx)?,
        };

        match outcome {
            Outcome::Await(futures) => {
                if let Some(unknown) = futures.iter().find(|f| !ctx.knows_slot(f)) {
                    return Err(StageError::UnknownFuture(unknown.clone()));
                }
                step += 1;
                if futures.iter().all(|f| record.resolved.contains_key(f)) {
                    continue;
                }
                blocked_on = futures;
                break Next::Blocked;
            }
            Outcome::Complete(value) => {
                ctx.outputs().fill(DEFAULT_OUTPUT, value)?;
                ensure_all_filled(&mut ctx)?;
                break Next::Completed;
            }
            Outcome::Done => {
                if !ctx.outputs().is_filled(DEFAULT_OUTPUT) {
                    ctx.outputs().fill(DEFAULT_OUTPUT, Value::Null)?;
                }
                ensure_all_filled(&mut ctx)?;
                break Next::Completed;
            }
            Outcome::Suspend => break Next::Suspended,
            Outcome::Delegate(handle) => {
                let unfilled = ctx.outputs().unfilled();
                let decl = ctx.find_child(&handle.id()).ok_or_else(|| {
                    StageError::DelegationMismatch(format!(
                        "{} is not a child of this stage",
                        handle.id()
                    ))
                })?;
                if let Some(missing) = unfilled.iter().find(|name| !decl.declares_output(name)) {
                    return Err(StageError::DelegationMismatch(format!(
                        "child {} does not declare output '{missing}'",
                        decl.id
                    )));
                }
                break Next::Delegated {
                    child: decl.id,
                    inherited: unfilled.into_iter().collect(),
                };
            }
        }
    };

    let effects = ctx.into_effects();
    Ok(StepCommit {
        expected_step: record.cursor.step,
        cursor: Cursor {
            step,
            blocked_on,
            ordering: effects.ordering.into_frames(),
            locals: effects.locals,
        },
        new_children: effects.declared,
        fills: effects.fills,
        next,
    })
}

fn ensure_all_filled(ctx: &mut StageContext<'_>) -> Result<(), StageError> {
    let unfilled = ctx.outputs().unfilled();
    if unfilled.is_empty() {
        Ok(())
    } else {
        Err(StageError::OutputsNotFilled(unfilled))
    }
}

// ---------------------------------------------------------------------------
// Materialization
// ---------------------------------------------------------------------------

/// Declarations whose barrier is fully resolved but which have no record yet.
pub fn ready_declarations(parent: &StageRecord) -> Vec<&ChildDeclaration> {
    parent
        .children
        .iter()
        .filter(|decl| !decl.materialized)
        .filter(|decl| {
            decl.barrier()
                .iter()
                .all(|slot| parent.resolved.contains_key(slot))
        })
        .collect()
}

/// Build the child record for a ready declaration, substituting resolved
/// values for futures. Returns `None` if a consumed future is unresolved.
pub fn materialize(
    parent: &StageRecord,
    decl: &ChildDeclaration,
    default_retry: &RetryPolicy,
) -> Option<StageRecord> {
    let resolve = |arg: &Arg| match arg {
        Arg::Value(value) => Some(value.clone()),
        Arg::Future(slot) => parent.resolved.get(slot).cloned(),
    };
    let args = decl.args.iter().map(resolve).collect::<Option<Vec<_>>>()?;
    let kwargs = decl
        .kwargs
        .iter()
        .map(|(name, arg)| resolve(arg).map(|value| (name.clone(), value)))
        .collect::<Option<BTreeMap<_, _>>>()?;

    Some(StageRecord::new(NewStage {
        id: decl.id,
        root_id: parent.root_id,
        parent_id: Some(parent.id),
        kind: decl.kind.clone(),
        args,
        kwargs,
        output_names: decl.output_names.clone(),
        inherited_outputs: decl.inherited_outputs.clone(),
        retry: decl.retry.clone().unwrap_or_else(|| default_retry.clone()),
        queue: decl.queue.clone().unwrap_or_else(|| parent.queue.clone()),
    }))
}

/// The slots a stage is blocked on that are still unresolved.
pub fn pending_futures(record: &StageRecord) -> Vec<SlotRef> {
    record
        .cursor
        .blocked_on
        .iter()
        .filter(|slot| !record.resolved.contains_key(slot))
        .cloned()
        .collect()
}
