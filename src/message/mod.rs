#![forbid(unsafe_code)]

//! Notification messages sent to the external compute engine.
//!
//! The wire representation is JSON with fixed field names:
//!
//! ```text
//! { "path": "...", "algorithm": "pagerank", "processorMode": "Partitioned",
//!   "partitionDescription": { "partitionId": 200, "label": "Category" } }
//! ```
//!
//! `partitionDescription` is omitted for full-graph messages.

use serde::{Deserialize, Serialize};

use crate::types::{OffloadError, Result};

/// Scope of an exported artifact.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProcessorMode {
    /// The artifact covers the whole graph.
    Full,
    /// The artifact covers one partition.
    Partitioned,
}

/// Identity of the partition an artifact was exported from.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDescription {
    /// Id of the partition's grouping node.
    pub partition_id: u64,
    /// Label of the grouping node.
    pub label: String,
}

/// Message describing an exported artifact and the algorithm to run on it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessorMessage {
    #[serde(rename = "path")]
    storage_path: String,
    algorithm: String,
    #[serde(rename = "processorMode")]
    mode: ProcessorMode,
    #[serde(
        rename = "partitionDescription",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    partition: Option<PartitionDescription>,
}

impl ProcessorMessage {
    /// Message for an artifact covering the whole graph.
    pub fn full(storage_path: impl Into<String>, algorithm: impl Into<String>) -> Self {
        Self {
            storage_path: storage_path.into(),
            algorithm: algorithm.into(),
            mode: ProcessorMode::Full,
            partition: None,
        }
    }

    /// Message for an artifact covering one partition.
    pub fn partitioned(
        storage_path: impl Into<String>,
        algorithm: impl Into<String>,
        partition: PartitionDescription,
    ) -> Self {
        Self {
            storage_path: storage_path.into(),
            algorithm: algorithm.into(),
            mode: ProcessorMode::Partitioned,
            partition: Some(partition),
        }
    }

    /// Path of the artifact in the file store.
    pub fn storage_path(&self) -> &str {
        &self.storage_path
    }

    /// Algorithm identifier understood by the compute engine.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Scope of the artifact.
    pub fn mode(&self) -> ProcessorMode {
        self.mode
    }

    /// Partition the artifact was exported from, for partitioned messages.
    pub fn partition(&self) -> Option<&PartitionDescription> {
        self.partition.as_ref()
    }

    fn validate(&self) -> Result<()> {
        if self.storage_path.is_empty() {
            return Err(OffloadError::Protocol("message path is empty".into()));
        }
        if self.algorithm.is_empty() {
            return Err(OffloadError::Protocol("message algorithm is empty".into()));
        }
        match (self.mode, &self.partition) {
            (ProcessorMode::Partitioned, None) => Err(OffloadError::Protocol(
                "partitioned message without partitionDescription".into(),
            )),
            (ProcessorMode::Full, Some(_)) => Err(OffloadError::Protocol(
                "full-graph message carries a partitionDescription".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Serializes a message to its transport representation.
pub fn encode(message: &ProcessorMessage) -> Result<Vec<u8>> {
    message.validate()?;
    Ok(serde_json::to_vec(message)?)
}

/// Parses and validates a message received from the transport.
pub fn decode(bytes: &[u8]) -> Result<ProcessorMessage> {
    let message: ProcessorMessage = serde_json::from_slice(bytes)
        .map_err(|err| OffloadError::Protocol(format!("malformed message: {err}")))?;
    message.validate()?;
    Ok(message)
}
