//! # drover-workers
//!
//! Worker-side boundary for Drover orchestration:
//!
//! - [`WorkerRegistry`] tracks the fleet and enforces capacity
//! - [`WorkerEndpoint`] abstracts the agent-lifecycle collaborator that
//!   actually runs tasks out of process
//! - [`CircuitBreaker`], [`backoff`], and [`DeadLetterQueue`] form the
//!   resilience layer wrapped around every handoff

#![allow(dead_code)]

pub mod backoff;

mod circuit_breaker;
mod dead_letter;
mod endpoint;
mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use dead_letter::{DeadLetterQueue, DeadLetterRecord};
pub use endpoint::{MockWorkerEndpoint, WorkerEndpoint};
pub use registry::WorkerRegistry;
