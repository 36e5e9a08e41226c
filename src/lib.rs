//! Offloading whole-graph algorithms from a transactional graph store.
//!
//! The pipeline partitions the graph into bounded blocks, exports each
//! block's topology as an adjacency list to a file store, tells an external
//! compute engine what was exported, and later merges the engine's per-node
//! scores back into the graph:
//!
//! ```text
//! Partitioner → SubgraphExporter → message::encode → Dispatcher    (outbound)
//! ResultMerger                                                     (inbound)
//! ```
//!
//! [`analysis::PartitionedAnalysis`] drives the outbound half and guarantees
//! that a partition's message is published only after its file is committed.

#![warn(missing_docs)]

pub mod analysis;
pub mod config;
pub mod dispatch;
pub mod export;
pub mod merge;
pub mod message;
pub mod partition;
pub mod primitives;
pub mod storage;
pub mod types;

pub use analysis::{AnalysisOptions, AnalysisReport, PartitionedAnalysis};
pub use merge::{MergeOptions, MergeSummary, ResultMerger};
pub use types::{NodeId, OffloadError, Result};
