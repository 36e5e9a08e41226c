//! Coordinator behaviour: export-before-notify, failure isolation, retries and
//! full-graph requests.

#![allow(missing_docs)]

mod common;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sombra_offload::analysis::{
    AnalysisOptions, PartitionSource, PartitionState, PartitionedAnalysis, Stage,
};
use sombra_offload::dispatch::{Channel, MemoryChannel, SpoolChannel};
use sombra_offload::export::ExportPaths;
use sombra_offload::message::{decode, ProcessorMessage, ProcessorMode};
use sombra_offload::partition::{PartitionOptions, Partitioner};
use sombra_offload::primitives::io::{read_lines, FileStore, MemFileStore};
use sombra_offload::types::{OffloadError, Result};

use common::{build_graph, cycle, init_tracing, read_pairs};

/// Verifies, at publish time, that the file a message points to is already committed.
struct CommittedFileChannel {
    store: MemFileStore,
    received: Mutex<Vec<ProcessorMessage>>,
    violations: AtomicUsize,
}

impl CommittedFileChannel {
    fn new(store: MemFileStore) -> Self {
        Self {
            store,
            received: Mutex::new(Vec::new()),
            violations: AtomicUsize::new(0),
        }
    }
}

impl Channel for CommittedFileChannel {
    fn publish(&self, payload: &[u8]) -> Result<()> {
        let message = decode(payload)?;
        let readable = self
            .store
            .exists(message.storage_path())
            .unwrap_or(false)
            && read_pairs(&self.store, message.storage_path()).is_ok();
        if !readable {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.received.lock().push(message);
        Ok(())
    }
}

/// Fails the first `failures` publishes, then delegates.
struct FlakyChannel {
    remaining_failures: AtomicU32,
    inner: MemoryChannel,
}

impl Channel for FlakyChannel {
    fn publish(&self, payload: &[u8]) -> Result<()> {
        let left = self.remaining_failures.load(Ordering::SeqCst);
        if left > 0
            && self
                .remaining_failures
                .compare_exchange(left, left - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(OffloadError::Dispatch("broker timeout".into()));
        }
        self.inner.publish(payload)
    }
}

/// Panics while publishing messages for even partition ids.
struct PanickingChannel {
    inner: MemoryChannel,
}

impl Channel for PanickingChannel {
    fn publish(&self, payload: &[u8]) -> Result<()> {
        let message = decode(payload)?;
        let id = message.partition().map_or(0, |p| p.partition_id);
        if id % 2 == 0 {
            panic!("channel crashed on partition {id}");
        }
        self.inner.publish(payload)
    }
}

fn options(concurrency: usize) -> AnalysisOptions {
    AnalysisOptions {
        concurrency,
        ..AnalysisOptions::default()
    }
}

#[test]
fn every_message_points_at_a_committed_file() -> Result<()> {
    init_tracing();
    let (graph, _ids) = build_graph(1_000, &cycle(1_000))?;
    let store = MemFileStore::new();
    let channel = CommittedFileChannel::new(store.clone());
    let analysis = PartitionedAnalysis::new(&graph, &store, &channel, options(4))?;

    let report = analysis.analyze_partitions()?;
    assert_eq!(report.outcomes.len(), 20);
    assert!(report.is_complete());
    assert_eq!(channel.violations.load(Ordering::SeqCst), 0);

    let received = channel.received.lock();
    assert_eq!(received.len(), 20);
    let paths = ExportPaths::new("offload", "pagerank");
    for message in received.iter() {
        assert_eq!(message.mode(), ProcessorMode::Partitioned);
        let partition = message.partition().unwrap();
        assert_eq!(partition.label, "Category");
        assert_eq!(
            message.storage_path(),
            paths.partition(partition.partition_id.into())
        );
    }
    Ok(())
}

#[test]
fn failing_export_only_fails_that_partition() -> Result<()> {
    init_tracing();
    let (graph, _ids) = build_graph(200, &cycle(200))?;
    let partitions = Partitioner::new(PartitionOptions::default())?.assign(&graph)?;
    let store = MemFileStore::new();
    let bad = ExportPaths::new("offload", "pagerank").partition(partitions[2].id);
    store.fail_writes(&bad, 0);

    let channel = MemoryChannel::new();
    let opts = AnalysisOptions {
        source: PartitionSource::Existing,
        ..options(3)
    };
    let analysis = PartitionedAnalysis::new(&graph, &store, &channel, opts)?;
    let report = analysis.analyze_partitions()?;

    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.dispatched(), 3);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].partition.partition_id, partitions[2].id.0);
    assert!(matches!(
        failed[0].state,
        PartitionState::Failed { stage: Stage::Exporting, .. }
    ));
    assert!(failed[0].message.is_none());
    assert!(!store.exists(&bad)?);

    let published: Vec<_> = channel
        .published()
        .iter()
        .map(|p| decode(p))
        .collect::<Result<_>>()?;
    assert_eq!(published.len(), 3);
    assert!(published.iter().all(|m| m.storage_path() != bad));
    Ok(())
}

#[test]
fn dispatch_is_retried_up_to_the_configured_attempts() -> Result<()> {
    let (graph, _ids) = build_graph(100, &cycle(100))?;
    let store = MemFileStore::new();
    let channel = FlakyChannel {
        remaining_failures: AtomicU32::new(2),
        inner: MemoryChannel::new(),
    };
    let opts = AnalysisOptions {
        dispatch_attempts: 3,
        ..options(1)
    };
    let analysis = PartitionedAnalysis::new(&graph, &store, &channel, opts)?;
    let report = analysis.analyze_partitions()?;
    assert!(report.is_complete());
    assert_eq!(report.outcomes[0].dispatch_attempts, 3);
    assert_eq!(report.outcomes[1].dispatch_attempts, 1);
    assert_eq!(channel.inner.len(), 2);
    Ok(())
}

#[test]
fn unreachable_channel_fails_dispatch_but_keeps_files() -> Result<()> {
    let (graph, _ids) = build_graph(150, &cycle(150))?;
    let store = MemFileStore::new();
    let channel = FlakyChannel {
        remaining_failures: AtomicU32::new(u32::MAX),
        inner: MemoryChannel::new(),
    };
    let analysis = PartitionedAnalysis::new(&graph, &store, &channel, options(2))?;
    let report = analysis.analyze_partitions()?;
    assert_eq!(report.dispatched(), 0);
    for outcome in &report.outcomes {
        assert!(matches!(
            outcome.state,
            PartitionState::Failed { stage: Stage::Dispatching, .. }
        ));
        let file = outcome.file.as_ref().unwrap();
        assert!(store.exists(&file.path)?);
    }
    assert!(channel.inner.is_empty());
    Ok(())
}

#[test]
fn partitioning_failure_aborts_before_any_export() -> Result<()> {
    let (graph, _ids) = build_graph(10, &[])?;
    let store = MemFileStore::new();
    let channel = MemoryChannel::new();
    let opts = AnalysisOptions {
        partition: PartitionOptions {
            block_size: 0,
            ..PartitionOptions::default()
        },
        ..options(2)
    };
    let analysis = PartitionedAnalysis::new(&graph, &store, &channel, opts)?;
    assert!(matches!(
        analysis.analyze_partitions(),
        Err(OffloadError::Invalid(_))
    ));
    assert!(store.paths().is_empty());
    assert!(channel.is_empty());
    Ok(())
}

#[test]
fn full_analysis_spools_a_full_graph_message() -> Result<()> {
    let (graph, ids) = build_graph(80, &cycle(80))?;
    let store = MemFileStore::new();
    let spool = SpoolChannel::open(&store, "outbox")?;
    let analysis = PartitionedAnalysis::new(&graph, &store, &spool, options(2))?;

    let full = analysis.analyze_full()?;
    assert_eq!(full.file.path, "offload/pagerank/graph.txt");
    assert_eq!(full.file.edges, ids.len() as u64);

    let spooled = spool.spooled()?;
    assert_eq!(spooled.len(), 1);
    let payload = read_lines(&store, &spooled[0])?.join("\n");
    let message = decode(payload.as_bytes())?;
    assert_eq!(message, full.message);
    assert_eq!(message.mode(), ProcessorMode::Full);
    assert!(message.partition().is_none());
    assert_eq!(read_pairs(&store, message.storage_path())?.len(), 80);
    Ok(())
}

#[test]
fn panicking_channel_fails_only_its_partitions() -> Result<()> {
    init_tracing();
    for concurrency in [1, 2] {
        let (graph, _ids) = build_graph(200, &cycle(200))?;
        let store = MemFileStore::new();
        let channel = PanickingChannel {
            inner: MemoryChannel::new(),
        };
        let analysis = PartitionedAnalysis::new(&graph, &store, &channel, options(concurrency))?;
        let report = analysis.analyze_partitions()?;

        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.dispatched(), 2);
        assert_eq!(channel.inner.len(), 2);
        for outcome in &report.outcomes {
            let even = outcome.partition.partition_id % 2 == 0;
            match &outcome.state {
                PartitionState::Failed { stage, reason } => {
                    assert!(even);
                    assert_eq!(*stage, Stage::Dispatching);
                    assert!(reason.contains("channel crashed"));
                }
                PartitionState::Dispatched => assert!(!even),
                other => panic!("unexpected state {other:?}"),
            }
        }
    }
    Ok(())
}
