//! Graph-store capability used by the offload pipeline.
//!
//! The pipeline never talks to a concrete engine. It reads topology and writes
//! grouping nodes, membership edges and result properties through
//! [`GraphStore`], whose transactions are short-lived and owned by the caller.
//! [`MemGraph`] is the in-process engine used by tests and embedders.

mod mem;

use crate::types::{EdgeId, NodeId, Result};

pub use mem::{MemGraph, MemGraphStats, MemTxn};

/// Direction for relationship reads.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dir {
    /// Relationships whose source is the node.
    Out,
    /// Relationships whose destination is the node.
    In,
    /// Outgoing relationships followed by incoming ones.
    Both,
}

/// Scalar property value stored on a node.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// UTF-8 string value.
    Str(String),
}

impl PropValue {
    /// Returns the value as `f64` when it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Float(v) => Some(*v),
            PropValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// One relationship as seen from the node it was read from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Neighbor {
    /// The node at the other end of the relationship.
    pub neighbor: NodeId,
    /// Identifier of the relationship itself.
    pub edge: EdgeId,
}

/// Transactional property-graph capability.
///
/// Every mutation happens inside a transaction obtained from [`GraphStore::begin`].
/// Reads through an open transaction observe the topology committed before it
/// began plus the transaction's own writes. A commit that loses a write-write
/// race on a node fails with [`crate::types::OffloadError::Conflict`] and may be
/// retried from a fresh transaction.
pub trait GraphStore: Send + Sync {
    /// Transaction handle.
    type Txn;

    /// Opens a transaction.
    fn begin(&self) -> Result<Self::Txn>;
    /// Applies the transaction's writes atomically.
    fn commit(&self, tx: Self::Txn) -> Result<()>;
    /// Discards the transaction's writes.
    fn rollback(&self, tx: Self::Txn);

    /// Creates a node carrying `labels`.
    fn create_node(&self, tx: &mut Self::Txn, labels: &[&str]) -> Result<NodeId>;
    /// Adds `label` to an existing node.
    fn add_label(&self, tx: &mut Self::Txn, node: NodeId, label: &str) -> Result<()>;
    /// Creates a relationship of type `ty` from `src` to `dst`.
    fn create_edge(&self, tx: &mut Self::Txn, src: NodeId, dst: NodeId, ty: &str)
        -> Result<EdgeId>;
    /// Sets property `key` on `node`.
    fn set_node_prop(
        &self,
        tx: &mut Self::Txn,
        node: NodeId,
        key: &str,
        value: PropValue,
    ) -> Result<()>;

    /// Lists relationships of type `ty` touching `node`, in creation order.
    fn neighbors(&self, tx: &Self::Txn, node: NodeId, ty: &str, dir: Dir)
        -> Result<Vec<Neighbor>>;
    /// Reads property `key` of `node`.
    fn node_prop(&self, tx: &Self::Txn, node: NodeId, key: &str) -> Result<Option<PropValue>>;
    /// Returns true if `node` is visible to the transaction.
    fn node_exists(&self, tx: &Self::Txn, node: NodeId) -> Result<bool>;
    /// Returns true if `node` carries `label`.
    fn has_label(&self, tx: &Self::Txn, node: NodeId, label: &str) -> Result<bool>;
    /// Lists every visible node in creation order.
    fn scan_nodes(&self, tx: &Self::Txn) -> Result<Vec<NodeId>>;
    /// Lists visible nodes carrying `label`, in creation order.
    fn nodes_with_label(&self, tx: &Self::Txn, label: &str) -> Result<Vec<NodeId>>;
}

/// Runs `f` inside a transaction that is always rolled back.
pub fn read_txn<G, T>(graph: &G, f: impl FnOnce(&G::Txn) -> Result<T>) -> Result<T>
where
    G: GraphStore + ?Sized,
{
    let tx = graph.begin()?;
    let out = f(&tx);
    graph.rollback(tx);
    out
}

/// Runs `f` inside a transaction, committing on success and rolling back on error.
pub fn write_txn<G, T>(graph: &G, f: impl FnOnce(&mut G::Txn) -> Result<T>) -> Result<T>
where
    G: GraphStore + ?Sized,
{
    let mut tx = graph.begin()?;
    match f(&mut tx) {
        Ok(out) => {
            graph.commit(tx)?;
            Ok(out)
        }
        Err(err) => {
            graph.rollback(tx);
            Err(err)
        }
    }
}
