//! Startup sequencing.
//!
//! Brings the services of a deployment up in dependency order, gated on
//! each dependency's condition rather than on fixed delays, and supervises
//! them until shutdown.

pub mod engine;
pub mod graph;
pub mod job;
pub mod readiness;

pub use engine::{
    DeploymentReport, Sequencer, SequencerConfig, SequencerError, ServiceFailure, ServiceOutcome,
};
pub use graph::{DependencyGraph, Edge};
pub use job::{backoff, JobRecord};
pub use readiness::{
    EventKind, ReadinessBoard, Satisfaction, SequenceEvent, ServiceState, WaitError,
};
