#![forbid(unsafe_code)]

//! Partition assignment.
//!
//! A partition is a bounded block of nodes grouped under a synthetic grouping
//! node. Members are linked from the grouping node by membership edges, in
//! traversal order, so the partition's member order can be read back from the
//! graph.

use tracing::{debug, info};

use crate::message::PartitionDescription;
use crate::storage::{read_txn, write_txn, Dir, GraphStore};
use crate::types::{NodeId, OffloadError, Result};

/// Default number of members per partition.
pub const DEFAULT_BLOCK_SIZE: usize = 50;
/// Default label carried by grouping nodes.
pub const DEFAULT_PARTITION_LABEL: &str = "Category";
/// Default relationship type linking a grouping node to its members.
pub const DEFAULT_MEMBERSHIP_TYPE: &str = "HAS_CATEGORY";

/// Options controlling partition assignment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionOptions {
    /// Label applied to grouping nodes.
    pub label: String,
    /// Relationship type from grouping node to member.
    pub membership_type: String,
    /// Members per partition; the final partition may hold fewer.
    pub block_size: usize,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            label: DEFAULT_PARTITION_LABEL.to_owned(),
            membership_type: DEFAULT_MEMBERSHIP_TYPE.to_owned(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Snapshot of one partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Grouping node identifying the partition.
    pub id: NodeId,
    /// Label of the grouping node.
    pub label: String,
    /// Member nodes in traversal order.
    pub members: Vec<NodeId>,
}

impl Partition {
    /// Descriptor carried by messages about this partition.
    pub fn description(&self) -> PartitionDescription {
        PartitionDescription {
            partition_id: self.id.0,
            label: self.label.clone(),
        }
    }
}

/// Assigns nodes to bounded-size partitions.
#[derive(Clone, Debug)]
pub struct Partitioner {
    opts: PartitionOptions,
}

impl Partitioner {
    /// Creates a partitioner, rejecting a zero block size.
    pub fn new(opts: PartitionOptions) -> Result<Self> {
        if opts.block_size == 0 {
            return Err(OffloadError::Invalid("partition block size must be positive"));
        }
        Ok(Self { opts })
    }

    /// Options this partitioner was built with.
    pub fn options(&self) -> &PartitionOptions {
        &self.opts
    }

    /// Splits `traversal` into consecutive blocks of `block_size` nodes.
    ///
    /// A short remainder forms its own final block.
    pub fn blocks(&self, traversal: impl IntoIterator<Item = NodeId>) -> Vec<Vec<NodeId>> {
        let mut blocks = Vec::new();
        let mut current = Vec::with_capacity(self.opts.block_size);
        for node in traversal {
            current.push(node);
            if current.len() == self.opts.block_size {
                blocks.push(std::mem::replace(
                    &mut current,
                    Vec::with_capacity(self.opts.block_size),
                ));
            }
        }
        if !current.is_empty() {
            blocks.push(current);
        }
        blocks
    }

    /// Computes partition boundaries over every node visible to `tx`, without writing.
    ///
    /// Nodes carrying the grouping label are not part of the traversal.
    pub fn plan<G: GraphStore + ?Sized>(&self, graph: &G, tx: &G::Txn) -> Result<Vec<Vec<NodeId>>> {
        let mut traversal = Vec::new();
        for node in graph.scan_nodes(tx)? {
            if !graph.has_label(tx, node, &self.opts.label)? {
                traversal.push(node);
            }
        }
        Ok(self.blocks(traversal))
    }

    /// Creates grouping nodes and membership edges for every planned block.
    ///
    /// All writes happen in a single transaction; a failure leaves the graph untouched.
    pub fn assign<G: GraphStore + ?Sized>(&self, graph: &G) -> Result<Vec<Partition>> {
        let partitions = write_txn(graph, |tx| {
            let blocks = self.plan(graph, tx)?;
            let mut partitions = Vec::with_capacity(blocks.len());
            for members in blocks {
                let id = graph.create_node(tx, &[self.opts.label.as_str()])?;
                for member in &members {
                    graph.create_edge(tx, id, *member, &self.opts.membership_type)?;
                }
                debug!(
                    partition = id.0,
                    members = members.len(),
                    "partition.assign.block"
                );
                partitions.push(Partition {
                    id,
                    label: self.opts.label.clone(),
                    members,
                });
            }
            Ok(partitions)
        })?;
        info!(
            partitions = partitions.len(),
            block_size = self.opts.block_size,
            label = %self.opts.label,
            "partition.assign.completed"
        );
        Ok(partitions)
    }

    /// Reads partitions already present in the graph, in grouping-node creation order.
    pub fn load_existing<G: GraphStore + ?Sized>(&self, graph: &G) -> Result<Vec<Partition>> {
        let partitions = read_txn(graph, |tx| {
            let mut partitions = Vec::new();
            for id in graph.nodes_with_label(tx, &self.opts.label)? {
                let members = graph
                    .neighbors(tx, id, &self.opts.membership_type, Dir::Out)?
                    .into_iter()
                    .map(|n| n.neighbor)
                    .collect();
                partitions.push(Partition {
                    id,
                    label: self.opts.label.clone(),
                    members,
                });
            }
            Ok(partitions)
        })?;
        info!(
            partitions = partitions.len(),
            label = %self.opts.label,
            "partition.load_existing.completed"
        );
        Ok(partitions)
    }
}
