//! # Canvasflow Runtime
//!
//! Executes compiled workflow schemas: a readiness-driven DAG scheduler
//! over the tokio pool, bounded streaming channels, per-node exception
//! policies (retry, combined timeout, default-data, exception branches),
//! checkpoint/resume, Loop/Batch composite runners and the ChatFlow
//! adapter.
//!
//! External systems — model providers, knowledge bases, plugins, user
//! databases, conversation storage, code sandboxes — are reached through
//! the ports in [`ports`]; the engine never talks to a vendor directly.

pub mod chatflow;
pub mod checkpoint;
pub mod composite;
pub mod context;
pub mod exception;
pub mod executor;
pub mod ports;
pub mod scheduler;
pub mod streaming;
pub mod testing;

pub use context::ExecutionContext;
pub use executor::ExecutorSet;
pub use scheduler::{ExecutionOutcome, WorkflowExecutor};
