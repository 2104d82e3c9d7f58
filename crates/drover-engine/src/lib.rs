//! # drover-engine
//!
//! Task orchestration engine for Drover.
//!
//! This crate provides:
//! - Task store with typed hard/soft dependency edges and cycle rejection
//! - Dependency resolver (readiness + soft-dependency priority adjustment)
//! - Ready queue with FIFO fairness inside priority tiers
//! - Task lifecycle state machine that fails loudly on illegal edges
//! - Capability matcher and the reactive assignment engine
//! - Message router with envelope validation
//! - Snapshot/restore for the persistence boundary

#![allow(dead_code)]

mod coordinator;
mod deps;
mod lifecycle;
mod matcher;
mod queue;
mod router;
mod snapshot;
mod store;

pub use coordinator::{Coordinator, COORDINATOR_ID};
pub use deps::{effective_priority, readiness, soft_adjustment, Readiness};
pub use lifecycle::{apply, is_legal};
pub use matcher::{pick_best, score, MatchScore};
pub use queue::ReadyQueue;
pub use router::{Envelope, EnvelopeKind, MessageRouter, Recipient};
pub use snapshot::EngineSnapshot;
pub use store::{RemovalCascade, TaskStore};
