//! Shared domain types for Pipewright.
//!
//! Stage records, output slots, dispatch tokens, lifecycle events, engine
//! configuration and the error types shared across the workspace.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod stage;
