//! Workflow execution runtime
//!
//! This crate provides the execution engine that runs canvas graphs, the
//! capability provider seam, and the `FlowRuntime` facade hosts use to
//! validate and run graphs.

mod executor;
mod plan;
mod provider;
mod result;
mod runtime;
mod semantics;

pub use executor::ExecutionEngine;
pub use provider::{
    CapabilityError, CapabilityProvider, CapabilityRequest, CapabilityResponse, ProviderRegistry,
};
pub use result::{
    BranchOutcome, BranchStatus, ExecutionResult, NodeFailure, NodeReport, NodeStatus,
};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use tokio_util::sync::CancellationToken;
