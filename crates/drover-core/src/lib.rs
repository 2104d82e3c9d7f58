//! # drover-core
//!
//! Core types for the Drover task orchestration engine.
//!
//! Drover coordinates a pool of independent worker agents against a dynamic
//! backlog of tasks. This crate holds the shared vocabulary:
//!
//! - Tasks carry hard dependencies (gate readiness) and soft "prefers"
//!   dependencies (adjust priority only)
//! - Workers declare open-vocabulary capability tags; matching is tag
//!   coverage, not role subclassing
//! - All components receive their dependencies at construction; there are
//!   no process-wide singletons

#![allow(dead_code)]

pub mod fail_open;

mod config;
mod error;
mod events;
mod types;

pub use config::{CircuitConfig, DroverConfig, RetryConfig, TimeoutConfig};
pub use error::{DroverError, Result};
pub use events::{EngineEvent, LifecycleEvent, TaskSnapshot, TaskTransition};
pub use types::*;
