//! Result merges: idempotence, scoping and safety under concurrent invocation.

#![allow(missing_docs)]

mod common;

use std::fmt::Write as _;
use std::io::Write;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use sombra_offload::merge::{FailureKind, MergeOptions, MergeSummary, ResultMerger};
use sombra_offload::message::ProcessorMessage;
use sombra_offload::partition::{PartitionOptions, Partitioner};
use sombra_offload::primitives::io::{FileStore, LocalFileStore, MemFileStore};
use sombra_offload::storage::{read_txn, GraphStore, MemGraph};
use sombra_offload::types::{NodeId, Result};

use common::{build_graph, init_tracing};

const THREADS: usize = 8;

fn results_for(nodes: &[NodeId], score: impl Fn(NodeId) -> f64) -> String {
    let mut out = String::from("# Node Property Value List\n");
    for node in nodes {
        let _ = writeln!(out, "{node} {}", score(*node));
    }
    out
}

fn scores(graph: &MemGraph, nodes: &[NodeId], key: &str) -> Result<Vec<Option<f64>>> {
    read_txn(graph, |tx| {
        nodes
            .iter()
            .map(|n| Ok(graph.node_prop(tx, *n, key)?.and_then(|v| v.as_f64())))
            .collect()
    })
}

#[test]
fn merging_twice_changes_nothing_the_second_time() -> Result<()> {
    init_tracing();
    let (graph, ids) = build_graph(50, &[])?;
    let merger = ResultMerger::new(&graph, MergeOptions::default())?;
    let message = ProcessorMessage::full("offload/pagerank/graph.txt", "pagerank");
    let input = results_for(&ids, |n| n.0 as f64 / 10.0);

    let first = merger.merge(&message, input.as_bytes())?;
    assert_eq!(first.applied, 50);
    let commits = graph.stats().commits;
    let values = scores(&graph, &ids, "pagerank")?;

    let second = merger.merge(&message, input.as_bytes())?;
    assert_eq!(second.applied, 0);
    assert_eq!(second.unchanged, 50);
    assert_eq!(graph.stats().commits, commits);
    assert_eq!(scores(&graph, &ids, "pagerank")?, values);
    Ok(())
}

#[test]
fn concurrent_identical_merges_write_each_node_once() -> Result<()> {
    init_tracing();
    let (graph, ids) = build_graph(200, &[])?;
    let merger = ResultMerger::new(&graph, MergeOptions::default())?;
    let message = ProcessorMessage::full("r", "pagerank");
    let input = results_for(&ids, |n| 1.0 + n.0 as f64);
    let barrier = Barrier::new(THREADS);

    let summaries: Vec<MergeSummary> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    merger.merge(&message, input.as_bytes())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Result<_>>()
    })?;

    assert!(summaries.iter().all(MergeSummary::is_clean));
    let applied: u64 = summaries.iter().map(|s| s.applied).sum();
    let unchanged: u64 = summaries.iter().map(|s| s.unchanged).sum();
    assert_eq!(applied, 200);
    assert_eq!(applied + unchanged, (THREADS * 200) as u64);
    let values = scores(&graph, &ids, "pagerank")?;
    for (node, value) in ids.iter().zip(values) {
        assert_eq!(value, Some(1.0 + node.0 as f64));
    }
    Ok(())
}

#[test]
fn concurrent_partition_merges_lose_no_updates() -> Result<()> {
    let (graph, _ids) = build_graph(400, &[])?;
    let partitions = Partitioner::new(PartitionOptions::default())?.assign(&graph)?;
    let merger = ResultMerger::new(&graph, MergeOptions::default())?;
    let barrier = Barrier::new(partitions.len());

    thread::scope(|scope| {
        for partition in &partitions {
            let merger = &merger;
            let barrier = &barrier;
            scope.spawn(move || {
                let message = ProcessorMessage::partitioned(
                    "r",
                    "strongly_connected_components",
                    partition.description(),
                );
                let input = results_for(&partition.members, |_| partition.id.0 as f64);
                barrier.wait();
                let summary = merger.merge(&message, input.as_bytes()).unwrap();
                assert!(summary.is_clean());
                assert_eq!(summary.applied, partition.members.len() as u64);
            });
        }
    });

    for partition in &partitions {
        let values = scores(&graph, &partition.members, "strongly_connected_components")?;
        assert!(values.iter().all(|v| *v == Some(partition.id.0 as f64)));
    }
    Ok(())
}

#[test]
fn records_outside_the_partition_are_rejected() -> Result<()> {
    let (graph, ids) = build_graph(100, &[])?;
    let partitions = Partitioner::new(PartitionOptions::default())?.assign(&graph)?;
    let merger = ResultMerger::new(&graph, MergeOptions::default())?;
    let message = ProcessorMessage::partitioned("r", "pagerank", partitions[0].description());

    let summary = merger.merge(&message, results_for(&ids, |_| 0.25).as_bytes())?;
    assert_eq!(summary.lines, 100);
    assert_eq!(summary.applied, 50);
    assert_eq!(summary.count(FailureKind::OutOfScope), 50);
    let outside = scores(&graph, &partitions[1].members, "pagerank")?;
    assert!(outside.iter().all(Option::is_none));
    Ok(())
}

#[test]
fn transient_conflicts_are_absorbed_by_retries() -> Result<()> {
    let (graph, ids) = build_graph(10, &[])?;
    let merger = ResultMerger::new(
        &graph,
        MergeOptions {
            max_attempts: 4,
            retry_backoff: Duration::from_micros(100),
            ..MergeOptions::default()
        },
    )?;
    let message = ProcessorMessage::full("r", "pagerank");
    graph.inject_commit_conflicts(3);
    let summary = merger.merge(&message, results_for(&ids, |_| 0.5).as_bytes())?;
    assert!(summary.is_clean());
    assert_eq!(summary.applied, 10);
    Ok(())
}

#[test]
fn malformed_lines_are_counted_and_skipped() -> Result<()> {
    let (graph, _ids) = build_graph(3, &[])?;
    let merger = ResultMerger::new(&graph, MergeOptions::default())?;
    let message = ProcessorMessage::full("r", "pagerank");
    let input = "0 0.1\n1\n1 abc\n\n# trailing comment\n2 0.3 extra\n2 0.3\n";
    let summary = merger.merge(&message, input.as_bytes())?;
    assert_eq!(summary.lines, 5);
    assert_eq!(summary.applied, 2);
    assert_eq!(summary.count(FailureKind::Parse), 3);
    let lines: Vec<_> = summary.failures.iter().map(|f| f.line_no).collect();
    assert_eq!(lines, vec![2, 3, 6]);
    Ok(())
}

#[test]
fn undecodable_lines_do_not_stop_the_merge() -> Result<()> {
    let (graph, ids) = build_graph(3, &[])?;
    let merger = ResultMerger::new(&graph, MergeOptions::default())?;
    let message = ProcessorMessage::full("r", "pagerank");
    let mut input = format!("{} 1.0\n\u{0}\n", ids[0]).into_bytes();
    input.extend_from_slice(b"\xff\xfe 2.0\n");
    input.extend_from_slice(format!("{} 3.0", ids[2]).as_bytes());

    let summary = merger.merge(&message, input.as_slice())?;
    assert_eq!(summary.applied, 2);
    assert_eq!(summary.count(FailureKind::Parse), 2);
    let lines: Vec<_> = summary.failures.iter().map(|f| f.line_no).collect();
    assert_eq!(lines, vec![2, 3]);
    let values = scores(&graph, &ids, "pagerank")?;
    assert_eq!(values, vec![Some(1.0), None, Some(3.0)]);
    Ok(())
}

#[test]
fn merge_from_store_reads_the_message_path() -> Result<()> {
    let (graph, ids) = build_graph(20, &[])?;
    let merger = ResultMerger::new(&graph, MergeOptions::default())?;
    let message = ProcessorMessage::full("results/pagerank.txt", "pagerank");

    let mem = MemFileStore::new();
    mem.put(message.storage_path(), results_for(&ids, |_| 2.0).as_bytes())?;
    assert_eq!(merger.merge_from_store(&mem, &message)?.applied, 20);

    let dir = tempfile::tempdir()?;
    let local = LocalFileStore::open(dir.path())?;
    let mut writer = local.create(message.storage_path())?;
    writer.write_all(results_for(&ids, |_| 3.0).as_bytes())?;
    writer.commit()?;
    let summary = merger.merge_from_store(&local, &message)?;
    assert_eq!(summary.applied, 20);
    assert!(scores(&graph, &ids, "pagerank")?.iter().all(|v| *v == Some(3.0)));
    Ok(())
}
