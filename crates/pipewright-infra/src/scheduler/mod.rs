//! Scheduler adapters.

pub mod tokio_scheduler;

pub use tokio_scheduler::{DispatchReceiver, TokioScheduler};
