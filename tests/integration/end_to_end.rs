//! Whole pipeline on a 10,000 node graph: partition, export, notify, merge.

#![allow(missing_docs)]

mod common;

use std::fmt::Write as _;

use sombra_offload::analysis::{AnalysisOptions, PartitionSource, PartitionedAnalysis};
use sombra_offload::dispatch::MemoryChannel;
use sombra_offload::export::{ExportOptions, SubgraphExporter};
use sombra_offload::merge::{MergeOptions, ResultMerger};
use sombra_offload::message::{decode, ProcessorMessage};
use sombra_offload::partition::{PartitionOptions, Partitioner};
use sombra_offload::primitives::io::MemFileStore;
use sombra_offload::storage::{read_txn, GraphStore, PropValue};
use sombra_offload::types::Result;

use common::{build_graph, cycle, init_tracing, read_pairs, sorted_pairs};

const NODES: usize = 10_000;
const CYCLE_EDGES: usize = 4_998;

#[test]
fn ten_thousand_nodes_round_trip_through_the_pipeline() -> Result<()> {
    init_tracing();
    let edges = cycle(CYCLE_EDGES);
    let (graph, ids) = build_graph(NODES, &edges)?;

    let partitions = Partitioner::new(PartitionOptions::default())?.assign(&graph)?;
    assert_eq!(partitions.len(), 200);
    assert!(partitions.iter().all(|p| p.members.len() == 50));

    // Combined export of every partition parses back to exactly the cycle.
    let store = MemFileStore::new();
    let exporter = SubgraphExporter::new(&graph, &store, ExportOptions::default());
    let files = exporter.export_serial(&partitions)?;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].edges, CYCLE_EDGES as u64);
    let exported = read_pairs(&store, &files[0].path)?;
    assert_eq!(exported.len(), CYCLE_EDGES);
    assert_eq!(exported, sorted_pairs(&ids, &edges));

    // Per-partition analysis over the existing partitions.
    let channel = MemoryChannel::new();
    let opts = AnalysisOptions {
        source: PartitionSource::Existing,
        concurrency: 8,
        ..AnalysisOptions::default()
    };
    let analysis = PartitionedAnalysis::new(&graph, &store, &channel, opts)?;
    let report = analysis.analyze_partitions()?;
    assert!(report.is_complete());
    assert_eq!(report.outcomes.len(), 200);
    assert_eq!(channel.len(), 200);
    let exported_edges: u64 = report
        .outcomes
        .iter()
        .filter_map(|o| o.file.as_ref())
        .map(|f| f.edges)
        .sum();
    assert_eq!(exported_edges, CYCLE_EDGES as u64);

    // The engine answers for the first partition with 100 lines, 50 of them in scope.
    let first: ProcessorMessage = decode(&channel.published()[0])?;
    let partition = partitions
        .iter()
        .find(|p| p.id.0 == first.partition().unwrap().partition_id)
        .unwrap();
    let merger = ResultMerger::new(&graph, MergeOptions::default())?;
    let mut in_scope = String::from("# Node Property Value List\n");
    for (i, node) in partition.members.iter().enumerate() {
        writeln!(in_scope, "{node} {}", 0.5 + i as f64).unwrap();
    }
    let summary = merger.merge(&first, in_scope.as_bytes())?;
    assert_eq!(summary.applied, 50);

    // A full-graph result of 100 lines sets 100 fresh properties, and re-applying is a no-op.
    let full = ProcessorMessage::full("offload/closeness/graph.txt", "closeness");
    let mut results = String::new();
    for (i, node) in ids.iter().take(100).enumerate() {
        writeln!(results, "{node} {}", 1.0 / (i + 1) as f64).unwrap();
    }
    let applied = merger.merge(&full, results.as_bytes())?;
    assert!(applied.is_clean());
    assert_eq!(applied.lines, 100);
    assert_eq!(applied.applied, 100);
    assert_eq!(applied.unchanged, 0);

    let commits = graph.stats().commits;
    let again = merger.merge(&full, results.as_bytes())?;
    assert_eq!(again.applied, 0);
    assert_eq!(again.unchanged, 100);
    assert_eq!(graph.stats().commits, commits);

    read_txn(&graph, |tx| {
        for (i, node) in ids.iter().take(100).enumerate() {
            let value = graph.node_prop(tx, *node, "closeness")?;
            assert_eq!(value, Some(PropValue::Float(1.0 / (i + 1) as f64)));
        }
        Ok(())
    })
}
