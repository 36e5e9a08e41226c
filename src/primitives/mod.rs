//! Low-level primitives the pipeline is built on.
//!
//! Includes the file-store abstraction the exporter writes adjacency lists
//! through and the merger reads result files from.

/// File-store abstractions and implementations.
///
/// Slash-addressed blob storage with create-then-commit writes and sequential reads.
pub mod io;
