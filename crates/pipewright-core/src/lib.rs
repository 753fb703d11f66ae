//! The Pipewright stage orchestration engine.
//!
//! A workflow is a tree of stages. Each stage runs resumable continuation
//! logic that declares child stages, wires their outputs into one another
//! as futures, and waits for those futures without holding a worker. This
//! crate holds the engine and the ports it drives ([`store::StageStore`]
//! and [`scheduler::Scheduler`]). It depends only on `pipewright-types`,
//! never on `pipewright-infra` or any database/IO crate.

pub mod builder;
pub mod context;
pub mod engine;
pub mod event;
pub mod harness;
pub mod identity;
pub mod logic;
pub mod ordering;
pub mod retry;
pub mod scheduler;
pub mod slots;
pub mod store;

pub use context::{ChildHandle, ChildSpec, FinalizeContext, StageContext};
pub use engine::{AbortResult, Engine, EngineError, HandleOutcome, ResumeError, ResumeResult, StartOptions};
pub use logic::{Outcome, StageError, StageLogic, StageRegistry};
