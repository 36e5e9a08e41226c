use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::debug;

use super::{Dir, GraphStore, Neighbor, PropValue};
use crate::types::{EdgeId, NodeId, OffloadError, Result};

type Labels = SmallVec<[String; 2]>;

struct NodeRow {
    labels: Labels,
    props: BTreeMap<String, PropValue>,
    out: Vec<EdgeId>,
    inc: Vec<EdgeId>,
    created: u64,
    version: u64,
}

struct EdgeRow {
    src: NodeId,
    dst: NodeId,
    ty: String,
    created: u64,
}

#[derive(Default)]
struct State {
    nodes: FxHashMap<NodeId, NodeRow>,
    edges: FxHashMap<EdgeId, EdgeRow>,
    order: Vec<NodeId>,
    commit_seq: u64,
    injected_conflicts: u32,
}

enum WriteOp {
    CreateNode { id: NodeId, labels: Labels },
    AddLabel { node: NodeId, label: String },
    CreateEdge { id: EdgeId, src: NodeId, dst: NodeId, ty: String },
    SetProp { node: NodeId, key: String, value: PropValue },
}

/// Transaction handle for [`MemGraph`].
///
/// Writes are buffered here and applied when the transaction commits.
pub struct MemTxn {
    snapshot: u64,
    ops: Vec<WriteOp>,
    pending_nodes: FxHashMap<NodeId, Labels>,
    pending_order: Vec<NodeId>,
    pending_labels: FxHashMap<NodeId, Labels>,
    pending_props: FxHashMap<NodeId, BTreeMap<String, PropValue>>,
    pending_out: FxHashMap<NodeId, Vec<(EdgeId, NodeId, String)>>,
    pending_in: FxHashMap<NodeId, Vec<(EdgeId, NodeId, String)>>,
    written: FxHashSet<NodeId>,
}

impl MemTxn {
    fn new(snapshot: u64) -> Self {
        Self {
            snapshot,
            ops: Vec::new(),
            pending_nodes: FxHashMap::default(),
            pending_order: Vec::new(),
            pending_labels: FxHashMap::default(),
            pending_props: FxHashMap::default(),
            pending_out: FxHashMap::default(),
            pending_in: FxHashMap::default(),
            written: FxHashSet::default(),
        }
    }

    /// Commit sequence number this transaction reads from.
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    /// Returns true if the transaction buffered no writes.
    pub fn is_read_only(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Counters describing a [`MemGraph`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MemGraphStats {
    /// Committed nodes.
    pub nodes: u64,
    /// Committed relationships.
    pub edges: u64,
    /// Commits that applied at least one write.
    pub commits: u64,
}

/// In-memory transactional property graph.
///
/// Topology reads are snapshot-filtered by commit sequence; property reads
/// return the latest committed value. Commits are first-committer-wins on the
/// nodes a transaction labelled or wrote properties to. The state lock is held
/// only for the duration of a single read or commit, never across a
/// transaction, so concurrent transactions cannot deadlock.
pub struct MemGraph {
    state: RwLock<State>,
    next_node: AtomicU64,
    next_edge: AtomicU64,
}

impl Default for MemGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            next_node: AtomicU64::new(0),
            next_edge: AtomicU64::new(0),
        }
    }

    /// Makes the next `count` commits that modify existing nodes fail with a conflict.
    pub fn inject_commit_conflicts(&self, count: u32) {
        self.state.write().injected_conflicts = count;
    }

    /// Returns committed counters.
    pub fn stats(&self) -> MemGraphStats {
        let state = self.state.read();
        MemGraphStats {
            nodes: state.nodes.len() as u64,
            edges: state.edges.len() as u64,
            commits: state.commit_seq,
        }
    }

    fn visible(tx: &MemTxn, state: &State, node: NodeId) -> bool {
        tx.pending_nodes.contains_key(&node)
            || state
                .nodes
                .get(&node)
                .is_some_and(|row| row.created <= tx.snapshot)
    }

    fn check_conflicts(state: &State, tx: &MemTxn) -> Result<()> {
        for node in &tx.written {
            if let Some(row) = state.nodes.get(node) {
                if row.version > tx.snapshot {
                    return Err(OffloadError::Conflict(*node));
                }
            }
        }
        Ok(())
    }

    fn apply(state: &mut State, ops: Vec<WriteOp>, seq: u64) -> Result<()> {
        for op in ops {
            match op {
                WriteOp::CreateNode { id, labels } => {
                    state.nodes.insert(
                        id,
                        NodeRow {
                            labels,
                            props: BTreeMap::new(),
                            out: Vec::new(),
                            inc: Vec::new(),
                            created: seq,
                            version: seq,
                        },
                    );
                    state.order.push(id);
                }
                WriteOp::AddLabel { node, label } => {
                    let row = state
                        .nodes
                        .get_mut(&node)
                        .ok_or_else(|| OffloadError::NotFound(format!("node {node}")))?;
                    if !row.labels.contains(&label) {
                        row.labels.push(label);
                    }
                    row.version = seq;
                }
                WriteOp::CreateEdge { id, src, dst, ty } => {
                    state
                        .nodes
                        .get_mut(&src)
                        .ok_or_else(|| OffloadError::NotFound(format!("node {src}")))?
                        .out
                        .push(id);
                    state
                        .nodes
                        .get_mut(&dst)
                        .ok_or_else(|| OffloadError::NotFound(format!("node {dst}")))?
                        .inc
                        .push(id);
                    state.edges.insert(
                        id,
                        EdgeRow {
                            src,
                            dst,
                            ty,
                            created: seq,
                        },
                    );
                }
                WriteOp::SetProp { node, key, value } => {
                    let row = state
                        .nodes
                        .get_mut(&node)
                        .ok_or_else(|| OffloadError::NotFound(format!("node {node}")))?;
                    row.props.insert(key, value);
                    row.version = seq;
                }
            }
        }
        Ok(())
    }

    fn committed_neighbors(
        state: &State,
        tx: &MemTxn,
        node: NodeId,
        ty: &str,
        dir: Dir,
        out: &mut Vec<Neighbor>,
    ) {
        let Some(row) = state.nodes.get(&node) else {
            return;
        };
        if row.created > tx.snapshot {
            return;
        }
        let mut push = |edges: &[EdgeId], outgoing: bool| {
            for edge in edges {
                let Some(rec) = state.edges.get(edge) else {
                    continue;
                };
                if rec.created > tx.snapshot || rec.ty != ty {
                    continue;
                }
                out.push(Neighbor {
                    neighbor: if outgoing { rec.dst } else { rec.src },
                    edge: *edge,
                });
            }
        };
        match dir {
            Dir::Out => push(&row.out, true),
            Dir::In => push(&row.inc, false),
            Dir::Both => {
                push(&row.out, true);
                push(&row.inc, false);
            }
        }
    }
}

fn pending_neighbors(
    pending: &FxHashMap<NodeId, Vec<(EdgeId, NodeId, String)>>,
    node: NodeId,
    ty: &str,
    out: &mut Vec<Neighbor>,
) {
    if let Some(list) = pending.get(&node) {
        out.extend(
            list.iter()
                .filter(|(_, _, t)| t == ty)
                .map(|(edge, other, _)| Neighbor {
                    neighbor: *other,
                    edge: *edge,
                }),
        );
    }
}

impl GraphStore for MemGraph {
    type Txn = MemTxn;

    fn begin(&self) -> Result<MemTxn> {
        Ok(MemTxn::new(self.state.read().commit_seq))
    }

    fn commit(&self, tx: MemTxn) -> Result<()> {
        if tx.ops.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write();
        if !tx.written.is_empty() && state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            let node = tx.written.iter().min().copied().unwrap_or(NodeId(0));
            debug!(node = node.0, "mem_graph.commit.injected_conflict");
            return Err(OffloadError::Conflict(node));
        }
        Self::check_conflicts(&state, &tx)?;
        let seq = state.commit_seq + 1;
        let MemTxn { ops, .. } = tx;
        Self::apply(&mut state, ops, seq)?;
        state.commit_seq = seq;
        Ok(())
    }

    fn rollback(&self, tx: MemTxn) {
        drop(tx);
    }

    fn create_node(&self, tx: &mut MemTxn, labels: &[&str]) -> Result<NodeId> {
        let id = NodeId(self.next_node.fetch_add(1, Ordering::Relaxed));
        let labels: Labels = labels.iter().map(|l| (*l).to_owned()).collect();
        tx.pending_nodes.insert(id, labels.clone());
        tx.pending_order.push(id);
        tx.ops.push(WriteOp::CreateNode { id, labels });
        Ok(id)
    }

    fn add_label(&self, tx: &mut MemTxn, node: NodeId, label: &str) -> Result<()> {
        if let Some(labels) = tx.pending_nodes.get_mut(&node) {
            if !labels.iter().any(|l| l == label) {
                labels.push(label.to_owned());
            }
        } else {
            let state = self.state.read();
            if !Self::visible(tx, &state, node) {
                return Err(OffloadError::NotFound(format!("node {node}")));
            }
            tx.pending_labels
                .entry(node)
                .or_default()
                .push(label.to_owned());
            tx.written.insert(node);
        }
        tx.ops.push(WriteOp::AddLabel {
            node,
            label: label.to_owned(),
        });
        Ok(())
    }

    fn create_edge(&self, tx: &mut MemTxn, src: NodeId, dst: NodeId, ty: &str) -> Result<EdgeId> {
        {
            let state = self.state.read();
            for node in [src, dst] {
                if !Self::visible(tx, &state, node) {
                    return Err(OffloadError::NotFound(format!("node {node}")));
                }
            }
        }
        let id = EdgeId(self.next_edge.fetch_add(1, Ordering::Relaxed));
        tx.pending_out
            .entry(src)
            .or_default()
            .push((id, dst, ty.to_owned()));
        tx.pending_in
            .entry(dst)
            .or_default()
            .push((id, src, ty.to_owned()));
        tx.ops.push(WriteOp::CreateEdge {
            id,
            src,
            dst,
            ty: ty.to_owned(),
        });
        Ok(id)
    }

    fn set_node_prop(
        &self,
        tx: &mut MemTxn,
        node: NodeId,
        key: &str,
        value: PropValue,
    ) -> Result<()> {
        if !tx.pending_nodes.contains_key(&node) {
            let state = self.state.read();
            if !Self::visible(tx, &state, node) {
                return Err(OffloadError::NotFound(format!("node {node}")));
            }
            tx.written.insert(node);
        }
        tx.pending_props
            .entry(node)
            .or_default()
            .insert(key.to_owned(), value.clone());
        tx.ops.push(WriteOp::SetProp {
            node,
            key: key.to_owned(),
            value,
        });
        Ok(())
    }

    fn neighbors(&self, tx: &MemTxn, node: NodeId, ty: &str, dir: Dir) -> Result<Vec<Neighbor>> {
        let mut out = Vec::new();
        let state = self.state.read();
        if !Self::visible(tx, &state, node) {
            return Err(OffloadError::NotFound(format!("node {node}")));
        }
        match dir {
            Dir::Out => {
                Self::committed_neighbors(&state, tx, node, ty, Dir::Out, &mut out);
                pending_neighbors(&tx.pending_out, node, ty, &mut out);
            }
            Dir::In => {
                Self::committed_neighbors(&state, tx, node, ty, Dir::In, &mut out);
                pending_neighbors(&tx.pending_in, node, ty, &mut out);
            }
            Dir::Both => {
                Self::committed_neighbors(&state, tx, node, ty, Dir::Out, &mut out);
                pending_neighbors(&tx.pending_out, node, ty, &mut out);
                Self::committed_neighbors(&state, tx, node, ty, Dir::In, &mut out);
                pending_neighbors(&tx.pending_in, node, ty, &mut out);
            }
        }
        Ok(out)
    }

    fn node_prop(&self, tx: &MemTxn, node: NodeId, key: &str) -> Result<Option<PropValue>> {
        if let Some(value) = tx.pending_props.get(&node).and_then(|p| p.get(key)) {
            return Ok(Some(value.clone()));
        }
        let state = self.state.read();
        if !Self::visible(tx, &state, node) {
            return Err(OffloadError::NotFound(format!("node {node}")));
        }
        Ok(state
            .nodes
            .get(&node)
            .and_then(|row| row.props.get(key).cloned()))
    }

    fn node_exists(&self, tx: &MemTxn, node: NodeId) -> Result<bool> {
        let state = self.state.read();
        Ok(Self::visible(tx, &state, node))
    }

    fn has_label(&self, tx: &MemTxn, node: NodeId, label: &str) -> Result<bool> {
        if let Some(labels) = tx.pending_nodes.get(&node) {
            return Ok(labels.iter().any(|l| l == label));
        }
        if tx
            .pending_labels
            .get(&node)
            .is_some_and(|labels| labels.iter().any(|l| l == label))
        {
            return Ok(true);
        }
        let state = self.state.read();
        if !Self::visible(tx, &state, node) {
            return Ok(false);
        }
        Ok(state
            .nodes
            .get(&node)
            .is_some_and(|row| row.labels.iter().any(|l| l == label)))
    }

    fn scan_nodes(&self, tx: &MemTxn) -> Result<Vec<NodeId>> {
        let state = self.state.read();
        let mut out: Vec<NodeId> = state
            .order
            .iter()
            .copied()
            .filter(|id| {
                state
                    .nodes
                    .get(id)
                    .is_some_and(|row| row.created <= tx.snapshot)
            })
            .collect();
        out.extend(tx.pending_order.iter().copied());
        Ok(out)
    }

    fn nodes_with_label(&self, tx: &MemTxn, label: &str) -> Result<Vec<NodeId>> {
        let state = self.state.read();
        let mut out = Vec::new();
        for id in &state.order {
            let Some(row) = state.nodes.get(id) else {
                continue;
            };
            if row.created > tx.snapshot {
                continue;
            }
            let labelled = row.labels.iter().any(|l| l == label)
                || tx
                    .pending_labels
                    .get(id)
                    .is_some_and(|labels| labels.iter().any(|l| l == label));
            if labelled {
                out.push(*id);
            }
        }
        for id in &tx.pending_order {
            if tx
                .pending_nodes
                .get(id)
                .is_some_and(|labels| labels.iter().any(|l| l == label))
            {
                out.push(*id);
            }
        }
        Ok(out)
    }
}
