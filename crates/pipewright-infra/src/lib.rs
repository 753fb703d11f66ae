//! Infrastructure implementations for Pipewright.
//!
//! Adapters behind the `pipewright-core` ports: a SQLite [`StageStore`],
//! a tokio [`Scheduler`] with delayed delivery, the worker pool that feeds
//! dispatches to `Engine::handle`, the resumption gate and the config
//! loader.
//!
//! [`StageStore`]: pipewright_core::store::StageStore
//! [`Scheduler`]: pipewright_core::scheduler::Scheduler

pub mod callback;
pub mod config;
pub mod scheduler;
pub mod sqlite;
pub mod worker;
