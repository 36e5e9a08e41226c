#![allow(dead_code)]

use std::sync::Once;

use sombra_offload::export::AdjacencyReader;
use sombra_offload::primitives::io::FileStore;
use sombra_offload::storage::{write_txn, GraphStore, MemGraph};
use sombra_offload::types::{NodeId, Result};
use tracing_subscriber::EnvFilter;

pub const TRACKED: &str = "CONNECTED_TO";

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_offload=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Builds a graph of `nodes` plain nodes and the given tracked edges between them.
pub fn build_graph(nodes: usize, edges: &[(usize, usize)]) -> Result<(MemGraph, Vec<NodeId>)> {
    let graph = MemGraph::new();
    let ids = write_txn(&graph, |tx| {
        let ids = (0..nodes)
            .map(|_| graph.create_node(tx, &["Node"]))
            .collect::<Result<Vec<_>>>()?;
        for (src, dst) in edges {
            graph.create_edge(tx, ids[*src], ids[*dst], TRACKED)?;
        }
        Ok(ids)
    })?;
    Ok((graph, ids))
}

/// Directed cycle over the first `len` nodes: `i -> (i + 1) % len`.
pub fn cycle(len: usize) -> Vec<(usize, usize)> {
    (0..len).map(|i| (i, (i + 1) % len)).collect()
}

/// Parses every `(source, neighbor)` pair out of the file at `path`, sorted.
pub fn read_pairs<F: FileStore + ?Sized>(store: &F, path: &str) -> Result<Vec<(NodeId, NodeId)>> {
    let mut pairs = Vec::new();
    for record in AdjacencyReader::new(store.open(path)?) {
        pairs.extend(record?.pairs());
    }
    pairs.sort();
    Ok(pairs)
}

pub fn sorted_pairs(ids: &[NodeId], edges: &[(usize, usize)]) -> Vec<(NodeId, NodeId)> {
    let mut pairs: Vec<_> = edges.iter().map(|(s, d)| (ids[*s], ids[*d])).collect();
    pairs.sort();
    pairs
}
