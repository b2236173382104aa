//! # Canvasflow Core
//!
//! The compilation half of the workflow engine: the authored canvas model,
//! the canvas → schema compiler with its node adaptor registry, the compiled
//! schema with execution-equivalence, validation, cross-workflow reference
//! derivation and `vA.B.C` version ordering.
//!
//! The crate is IO-free except for two narrow async ports: the
//! [`compile::SubWorkflowLoader`] that fetches referenced canvases and the
//! [`validate::ResourceResolver`] that answers existence checks. Everything
//! else is pure data transformation, which keeps compilation cacheable and
//! the panics recoverable.
//!
//! ## Typical flow
//!
//! ```rust
//! use canvasflow_core::canvas::initial_canvas;
//! use canvasflow_core::compile::CanvasCompiler;
//! use canvasflow_core::validate::SchemaValidator;
//!
//! # tokio_test::block_on(async {
//! let canvas = initial_canvas();
//! let schema = CanvasCompiler::standalone().compile(&canvas).await.unwrap();
//! assert!(SchemaValidator::new(&schema).validate().is_empty());
//! # });
//! ```

pub mod adaptor;
pub mod canvas;
pub mod compile;
pub mod error;
pub mod mode;
pub mod node_type;
pub mod refs;
pub mod schema;
pub mod types;
pub mod validate;
pub mod version;

pub use error::WorkflowError;
pub use mode::WorkflowMode;
pub use node_type::NodeType;
pub use schema::{NodeSchema, WorkflowSchema};
