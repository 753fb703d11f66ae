//! Output slot registry.
//!
//! Slots are write-once. Stage logic writes through [`OutputHandles`], which
//! stages values until the engine commits the step; the engine writes the
//! durable slots with [`fill`], which treats a second write as a no-op.

use std::collections::BTreeMap;

use chrono::Utc;
use pipewright_types::stage::{SlotRef, StageRecord};
use serde_json::Value;

use crate::logic::StageError;

// ---------------------------------------------------------------------------
// Write-only handles for running logic
// ---------------------------------------------------------------------------

/// Write-only access to the running stage's outputs.
///
/// Running logic can never read its own outputs back; finalize hooks get
/// read access through `FinalizeContext`.
#[derive(Debug)]
pub struct OutputHandles<'a> {
    record: &'a StageRecord,
    staged: BTreeMap<String, Value>,
}

impl<'a> OutputHandles<'a> {
    pub(crate) fn new(record: &'a StageRecord) -> Self {
        Self {
            record,
            staged: BTreeMap::new(),
        }
    }

    /// Fill a declared output. Fails fast on undeclared or already-filled
    /// slots.
    pub fn fill(&mut self, name: &str, value: impl Into<Value>) -> Result<(), StageError> {
        if !self.record.declares_output(name) {
            return Err(StageError::UndeclaredOutput(name.to_string()));
        }
        if self.is_filled(name) {
            return Err(StageError::SlotAlreadyFilled(name.to_string()));
        }
        self.staged.insert(name.to_string(), value.into());
        Ok(())
    }

    /// Whether `name` is filled, durably or in this step.
    pub fn is_filled(&self, name: &str) -> bool {
        self.staged.contains_key(name)
            || self.record.slots.get(name).is_some_and(|slot| slot.filled)
    }

    /// Declared outputs still empty after this step's writes.
    pub fn unfilled(&self) -> Vec<String> {
        self.record
            .output_names
            .iter()
            .filter(|name| !self.is_filled(name))
            .cloned()
            .collect()
    }

    pub(crate) fn into_staged(self) -> BTreeMap<String, Value> {
        self.staged
    }
}

// ---------------------------------------------------------------------------
// Durable slot writes
// ---------------------------------------------------------------------------

/// Result of writing a durable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillResult {
    Filled,
    AlreadyFilled,
    Undeclared,
}

/// Write a slot at most once.
pub fn fill(record: &mut StageRecord, name: &str, value: Value) -> FillResult {
    match record.slots.get_mut(name) {
        None => FillResult::Undeclared,
        Some(slot) if slot.filled => FillResult::AlreadyFilled,
        Some(slot) => {
            slot.filled = true;
            slot.value = value;
            slot.filled_at = Some(Utc::now());
            FillResult::Filled
        }
    }
}

/// Copy the delegate child's resolved outputs into this stage's still-empty
/// slots. Returns the names that were newly filled.
pub fn inherit_from_delegate(record: &mut StageRecord) -> Vec<String> {
    let Some(delegate) = record.delegate else {
        return Vec::new();
    };
    let inherited = record
        .child(&delegate)
        .map(|decl| decl.inherited_outputs.clone())
        .unwrap_or_default();

    let mut newly_filled = Vec::new();
    for name in inherited {
        let Some(value) = record.resolved.get(&SlotRef::named(delegate, name.clone())).cloned()
        else {
            continue;
        };
        if fill(record, &name, value) == FillResult::Filled {
            newly_filled.push(name);
        }
    }
    newly_filled
}

/// Record a child's filled slots in the parent's resolved table.
///
/// Returns `true` if the parent learned anything new.
pub fn absorb_child(parent: &mut StageRecord, child: &StageRecord) -> bool {
    if parent.child(&child.id).is_none() {
        return false;
    }
    let mut changed = false;
    for slot in child.slots.values().filter(|slot| slot.filled) {
        let key = SlotRef::named(child.id, slot.name.clone());
        if !parent.resolved.contains_key(&key) {
            parent.resolved.insert(key, slot.value.clone());
            changed = true;
        }
    }
    changed
}
