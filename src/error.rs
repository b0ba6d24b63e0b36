//! Crate-wide error taxonomy.
//!
//! Each component gets its own error enum; [`GraphError`] folds them all
//! together the way `dozer_core::errors::ExecutionError` folds in
//! `IncompatibleSchemas`, `SinkError`, `JoinError`, etc. Nothing in this
//! crate panics on a recoverable condition — panics are reserved for the
//! handful of conditions the spec calls fatal (pure-virtual trap, debug
//! invariant violations).

use std::panic::Location;

use thiserror::Error;

use crate::port::{PortCategory, PortOrdinal};
use crate::topology::NodeHandle;

/// Errors raised by [`crate::handle::VersionedList::validate`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    #[error("handle does not match the version stored at its slot")]
    Invalid,
    #[error("handle belongs to a different arena")]
    Foreign,
    #[error("handle refers to a released slot")]
    Disposed,
}

/// Errors raised by [`crate::topology::TopologyStore`].
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("connecting node {source_node:?} to {dest_node:?} would create a cycle")]
    CycleCreated {
        source_node: NodeHandle,
        dest_node: NodeHandle,
    },
    #[error("port {port} on node {node:?} does not accept category {expected:?} (found {found:?})")]
    PortTypeMismatch {
        node: NodeHandle,
        port: PortOrdinal,
        expected: PortCategory,
        found: PortCategory,
    },
    #[error("data input port {port} on node {node:?} already has an incoming connection")]
    DuplicateDataInput { node: NodeHandle, port: PortOrdinal },
    #[error("node {node:?} has no port {port}")]
    UnknownPort { node: NodeHandle, port: PortOrdinal },
    #[error("no connection from ({source_node:?}, {source_port}) to ({dest_node:?}, {dest_port})")]
    NoSuchEdge {
        source_node: NodeHandle,
        source_port: PortOrdinal,
        dest_node: NodeHandle,
        dest_port: PortOrdinal,
    },
    #[error("topological order could not be completed, cycle detected at {0:?}")]
    CycleAt(NodeHandle),
    #[error(transparent)]
    Arena(#[from] ArenaError),
}

/// Errors raised while the node set drains mutations or dispatches messages.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("message dispatch recursion exceeded the configured depth of {0}")]
    MessageCycle(u32),
    #[error("port forwarding chain exceeded the configured depth of {0}")]
    ForwardingCycle(u32),
    #[error("node {0:?} kind does not install a handler for this call and trapped")]
    PureVirtualCalled(NodeHandle),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Errors raised by the scheduler (C7) while materializing jobs.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("no job scheduled yet for node {0:?}")]
    JobNotFound(NodeHandle),
}

/// Errors raised by input batches / graph values (C8).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch output dependency queried before the submitting tick has rendered")]
    PrematureBatchQuery,
}

/// Non-fatal graph-value read outcome: the target node no longer exists.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("graph value's target node was destroyed before read")]
pub struct Orphaned;

/// The crate-wide error type returned from fallible public operations.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("pure virtual function called for node {0:?}")]
    PureVirtualCalled(NodeHandle),
    #[error("internal invariant violated at {location}: {message}")]
    InternalInvariantViolated {
        message: String,
        location: &'static Location<'static>,
    },
}

/// Raises [`GraphError::InternalInvariantViolated`]: aborts in debug builds
/// (the spec calls this fatal), logs and returns the error in release.
#[track_caller]
pub(crate) fn invariant_violated(message: impl Into<String>) -> GraphError {
    let message = message.into();
    let location = Location::caller();
    tracing::error!(%location, %message, "internal invariant violated");
    debug_assert!(false, "internal invariant violated at {location}: {message}");
    GraphError::InternalInvariantViolated { message, location }
}
