//! Export fidelity: reading back every file of an export yields exactly the
//! multiset of tracked relationships among exported members.

#![allow(missing_docs)]

mod common;

use proptest::prelude::*;
use sombra_offload::export::{ExportLayout, ExportOptions, SubgraphExporter};
use sombra_offload::partition::{PartitionOptions, Partitioner};
use sombra_offload::primitives::io::MemFileStore;
use sombra_offload::storage::{write_txn, GraphStore};
use sombra_offload::types::NodeId;

use common::{build_graph, read_pairs, sorted_pairs};

fn arb_graph() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (1usize..40).prop_flat_map(|nodes| {
        (
            Just(nodes),
            prop::collection::vec((0..nodes, 0..nodes), 0..160),
        )
    })
}

fn arb_layout() -> impl Strategy<Value = ExportLayout> {
    prop_oneof![Just(ExportLayout::Combined), Just(ExportLayout::PerPartition)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn exported_pairs_match_graph(
        (nodes, edges) in arb_graph(),
        block_size in 1usize..12,
        layout in arb_layout(),
        concurrency in 1usize..6,
        parallel in any::<bool>(),
    ) {
        let (graph, ids) = build_graph(nodes, &edges).unwrap();
        // Untracked relationships must never show up in the export.
        write_txn(&graph, |tx| {
            for pair in ids.windows(2) {
                graph.create_edge(tx, pair[0], pair[1], "LIKES")?;
            }
            Ok(())
        })
        .unwrap();
        let partitions = Partitioner::new(PartitionOptions {
            block_size,
            ..PartitionOptions::default()
        })
        .unwrap()
        .assign(&graph)
        .unwrap();
        prop_assert_eq!(partitions.len(), nodes.div_ceil(block_size));

        let store = MemFileStore::new();
        let exporter = SubgraphExporter::new(
            &graph,
            &store,
            ExportOptions { layout, concurrency, ..ExportOptions::default() },
        );
        let files = if parallel {
            exporter.export_parallel(&partitions).unwrap()
        } else {
            exporter.export_serial(&partitions).unwrap()
        };

        let mut exported: Vec<(NodeId, NodeId)> = Vec::new();
        for file in &files {
            exported.extend(read_pairs(&store, &file.path).unwrap());
        }
        exported.sort();
        prop_assert_eq!(exported, sorted_pairs(&ids, &edges));

        let mut covered: Vec<NodeId> = files.iter().flat_map(|f| f.partitions.clone()).collect();
        covered.sort();
        let mut expected: Vec<NodeId> = partitions.iter().map(|p| p.id).collect();
        expected.sort();
        prop_assert_eq!(covered, expected);
    }
}
