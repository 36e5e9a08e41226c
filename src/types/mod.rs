#![forbid(unsafe_code)]

//! Identifiers and the error type shared by every stage of the offload pipeline.

use std::fmt;
use std::str::FromStr;

use crate::export::ExportedFile;

/// Identifier of a node in the graph store's id space.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);

/// Identifier of a relationship in the graph store's id space.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EdgeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

impl From<NodeId> for u64 {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<u64>().map(NodeId)
    }
}

/// A partition whose export could not be completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionFailure {
    /// Grouping node of the failed partition.
    pub partition: NodeId,
    /// Path the partition was being written to.
    pub path: String,
    /// Rendered cause of the failure.
    pub reason: String,
}

/// Errors raised by the offload pipeline.
#[derive(thiserror::Error, Debug)]
pub enum OffloadError {
    /// Underlying I/O failure (file store reads/writes).
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Message encoding or decoding failed.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The named entity does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// A transaction lost a write-write race on the given node.
    #[error("transaction conflict on node {0}")]
    Conflict(NodeId),
    /// A message or record violated the wire contract.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Publishing a message to the channel failed.
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    /// One or more partitions could not be exported.
    #[error("export incomplete: {} partition(s) failed", failures.len())]
    ExportIncomplete {
        /// Files that were fully written and published.
        completed: Vec<ExportedFile>,
        /// Partitions whose files were discarded.
        failures: Vec<PartitionFailure>,
    },
    /// The graph store rejected an operation.
    #[error("graph store: {0}")]
    Store(String),
}

impl OffloadError {
    /// Returns true when retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, OffloadError::Conflict(_))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, OffloadError>;
