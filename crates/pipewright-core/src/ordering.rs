//! Ordering operator stack.
//!
//! Scoped ordering constructs layered over data dependencies. Entering a
//! scope pushes a frame; every child declared while frames are active gets
//! synthetic ordering edges to the siblings the frames require. The stack
//! is persisted in the stage's cursor, so a scope may span continuation
//! steps.

use std::collections::BTreeSet;

use pipewright_types::stage::{OrderingFrame, StageId};

use crate::logic::StageError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderingStack {
    frames: Vec<OrderingFrame>,
}

impl OrderingStack {
    pub fn from_frames(frames: Vec<OrderingFrame>) -> Self {
        Self { frames }
    }

    pub fn into_frames(self) -> Vec<OrderingFrame> {
        self.frames
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Children declared from now on wait for every stage in `deps`.
    /// Nested `after` scopes accumulate.
    pub fn push_after(&mut self, deps: impl IntoIterator<Item = StageId>) {
        self.frames.push(OrderingFrame::After {
            deps: deps.into_iter().collect(),
        });
    }

    /// Children declared from now on run one after another.
    pub fn push_in_order(&mut self) -> Result<(), StageError> {
        if self
            .frames
            .iter()
            .any(|frame| matches!(frame, OrderingFrame::InOrder { .. }))
        {
            return Err(StageError::NestedInOrder);
        }
        self.frames.push(OrderingFrame::InOrder { last: None });
        Ok(())
    }

    /// Leave the innermost scope.
    pub fn pop(&mut self) -> Result<OrderingFrame, StageError> {
        self.frames.pop().ok_or(StageError::OrderingUnderflow)
    }

    /// Synthetic edges for the next declaration.
    pub fn edges(&self) -> BTreeSet<StageId> {
        let mut edges = BTreeSet::new();
        for frame in &self.frames {
            match frame {
                OrderingFrame::After { deps } => edges.extend(deps.iter().copied()),
                OrderingFrame::InOrder { last: Some(last) } => {
                    edges.insert(*last);
                }
                OrderingFrame::InOrder { last: None } => {}
            }
        }
        edges
    }

    /// Note a declaration so the next one in an in-order block waits for it.
    pub fn record_declared(&mut self, id: StageId) {
        for frame in &mut self.frames {
            if let OrderingFrame::InOrder { last } = frame {
                *last = Some(id);
            }
        }
    }
}
