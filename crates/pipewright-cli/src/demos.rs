//! Demo pipelines bundled with `pw`.
//!
//! - `sum_lengths`: one `strlen` per word, a `sum` over their outputs, and
//!   tail delegation to the sum.
//! - `gcd`: Euclid's algorithm as a chain of tail delegations.
//! - `approval`: suspends until an external decision arrives.

use pipewright_core::context::{ChildSpec, FinalizeContext, StageContext};
use pipewright_core::logic::{Outcome, StageError, StageLogic, StageRegistry};
use pipewright_types::stage::CallbackAccess;
use serde_json::{Value, json};

struct StrLen;

impl StageLogic for StrLen {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        let word: String = ctx.arg_as(0)?;
        Ok(Outcome::Complete(json!(word.chars().count())))
    }
}

struct Sum;

impl StageLogic for Sum {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        let total: i64 = ctx.args().iter().filter_map(Value::as_i64).sum();
        Ok(Outcome::Complete(json!(total)))
    }
}

struct SumLengths;

impl StageLogic for SumLengths {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        let words: Vec<String> = ctx.arg_as(0)?;
        let lengths = words
            .iter()
            .map(|word| ctx.spawn("strlen", ChildSpec::new().arg(json!(word))))
            .collect::<Result<Vec<_>, _>>()?;
        let sum = ctx.spawn("sum", ChildSpec::new().args(&lengths))?;
        Ok(Outcome::Delegate(sum))
    }
}

struct Gcd;

impl StageLogic for Gcd {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        let a: u64 = ctx.arg_as(0)?;
        let b: u64 = ctx.arg_as(1)?;
        if b == 0 {
            return Ok(Outcome::Complete(json!(a)));
        }
        let next = ctx.spawn("gcd", ChildSpec::new().arg(json!(b)).arg(json!(a % b)))?;
        Ok(Outcome::Delegate(next))
    }

    fn finalize(&self, ctx: &FinalizeContext<'_>) -> Result<(), StageError> {
        tracing::debug!(stage_id = %ctx.id(), output = ?ctx.output("default"), "gcd step finalized");
        Ok(())
    }
}

struct Approval;

impl StageLogic for Approval {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        tracing::info!(stage_id = %ctx.id(), "waiting for approval");
        Ok(Outcome::Suspend)
    }

    fn callback(&self, ctx: &mut StageContext<'_>, payload: &Value) -> Result<Outcome, StageError> {
        let approved = payload
            .get("approved")
            .and_then(Value::as_bool)
            .ok_or_else(|| StageError::Failed("payload needs a boolean \"approved\"".to_string()))?;
        Ok(Outcome::Complete(json!({
            "request": ctx.arg(0).cloned().unwrap_or(Value::Null),
            "approved": approved,
            "note": payload.get("note").cloned().unwrap_or(Value::Null),
        })))
    }

    fn callback_access(&self) -> CallbackAccess {
        CallbackAccess::Privileged
    }
}

pub fn registry() -> StageRegistry {
    StageRegistry::new()
        .with("strlen", StrLen)
        .with("sum", Sum)
        .with("sum_lengths", SumLengths)
        .with("gcd", Gcd)
        .with("approval", Approval)
}
