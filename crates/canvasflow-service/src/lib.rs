//! # Canvasflow Service
//!
//! The workflow domain service: draft/version lifecycle with test-run
//! inheritance, atomic publish with reference-edge replacement, connector
//! bindings, ChatFlow role configuration, cross-scope copy/duplicate/release
//! flows and the compiled-schema cache.
//!
//! Persistence is behind [`repository::WorkflowRepository`];
//! [`memory::MemoryRepository`] backs tests and single-process embeddings.

pub mod cache;
pub mod copy;
pub mod entities;
pub mod memory;
pub mod repository;
pub mod service;

pub use entities::{
    DeletePolicy, Draft, GetPolicy, GetSelector, MGetPolicy, PublishPolicy, Version, Workflow,
    WorkflowMeta,
};
pub use service::{CreateWorkflowRequest, WorkflowService};
