#![forbid(unsafe_code)]

//! Per-partition export → encode → dispatch orchestration.
//!
//! Each partition moves through
//!
//! ```text
//! Pending → Exporting → Encoding → Dispatching → Dispatched
//!              │           │            │
//!              └───────────┴────────────┴──→ Failed
//! ```
//!
//! A message is encoded only after the partition's file has been committed, so
//! the compute engine can never be pointed at a file that is still being
//! written. Failures are isolated per partition and every partition's terminal
//! state is reported.

use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::dispatch::{Channel, Dispatcher};
use crate::export::{
    default_concurrency, ExportLayout, ExportOptions, ExportedFile, SubgraphExporter,
    DEFAULT_EXPORT_ROOT, DEFAULT_TRACKED_TYPE,
};
use crate::message::{encode, PartitionDescription, ProcessorMessage};
use crate::partition::{Partition, PartitionOptions, Partitioner};
use crate::primitives::io::FileStore;
use crate::storage::GraphStore;
use crate::types::{OffloadError, Result};

/// Where the coordinator gets its partitions from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartitionSource {
    /// Create fresh grouping nodes for the current graph.
    Assign,
    /// Reuse grouping nodes already present in the graph.
    Existing,
}

/// Options for a partitioned analysis run.
#[derive(Clone, Debug)]
pub struct AnalysisOptions {
    /// Algorithm identifier sent to the compute engine.
    pub algorithm: String,
    /// Partition label, membership type and block size.
    pub partition: PartitionOptions,
    /// Relationship type whose topology is exported.
    pub tracked_type: String,
    /// Export root in the file store.
    pub root: String,
    /// Partitions processed at once; 1 runs them sequentially.
    pub concurrency: usize,
    /// Publish attempts per partition before it is marked failed.
    pub dispatch_attempts: u32,
    /// Partition source.
    pub source: PartitionSource,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            algorithm: "pagerank".to_owned(),
            partition: PartitionOptions::default(),
            tracked_type: DEFAULT_TRACKED_TYPE.to_owned(),
            root: DEFAULT_EXPORT_ROOT.to_owned(),
            concurrency: default_concurrency(),
            dispatch_attempts: 1,
            source: PartitionSource::Assign,
        }
    }
}

/// Pipeline step a partition is in or failed at.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Waiting for a worker.
    Pending,
    /// Writing the partition file.
    Exporting,
    /// Building and serializing the message.
    Encoding,
    /// Publishing the message.
    Dispatching,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Pending => "pending",
            Stage::Exporting => "exporting",
            Stage::Encoding => "encoding",
            Stage::Dispatching => "dispatching",
        };
        f.write_str(name)
    }
}

/// State of one partition's pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionState {
    /// Not started.
    Pending,
    /// File being written.
    Exporting,
    /// File committed; message being built.
    Encoding,
    /// Message being published.
    Dispatching,
    /// Message published. Terminal.
    Dispatched,
    /// Pipeline stopped. Terminal.
    Failed {
        /// Step that failed.
        stage: Stage,
        /// Rendered cause.
        reason: String,
    },
}

impl PartitionState {
    /// Returns true for `Dispatched` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PartitionState::Dispatched | PartitionState::Failed { .. })
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_advance_to(&self, next: &PartitionState) -> bool {
        use PartitionState::*;
        match (self, next) {
            (Pending, Exporting)
            | (Exporting, Encoding)
            | (Encoding, Dispatching)
            | (Dispatching, Dispatched) => true,
            (Pending, Failed { stage, .. }) => *stage == Stage::Pending,
            (Exporting, Failed { stage, .. }) => *stage == Stage::Exporting,
            (Encoding, Failed { stage, .. }) => *stage == Stage::Encoding,
            (Dispatching, Failed { stage, .. }) => *stage == Stage::Dispatching,
            _ => false,
        }
    }
}

/// Terminal result of one partition's pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionOutcome {
    /// Partition identity.
    pub partition: PartitionDescription,
    /// Terminal state.
    pub state: PartitionState,
    /// Exported file, when the export step succeeded.
    pub file: Option<ExportedFile>,
    /// Message built for the partition, when encoding succeeded.
    pub message: Option<ProcessorMessage>,
    /// Publish attempts made.
    pub dispatch_attempts: u32,
}

/// Summary of a partitioned analysis run.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisReport {
    /// Algorithm the run was for.
    pub algorithm: String,
    /// One outcome per partition, in partition order.
    pub outcomes: Vec<PartitionOutcome>,
}

impl AnalysisReport {
    /// Number of partitions whose message was published.
    pub fn dispatched(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == PartitionState::Dispatched)
            .count()
    }

    /// Outcomes that ended in `Failed`.
    pub fn failed(&self) -> impl Iterator<Item = &PartitionOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.state, PartitionState::Failed { .. }))
    }

    /// Returns true if every partition was dispatched.
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.state == PartitionState::Dispatched)
    }
}

/// Result of a full-graph analysis request.
#[derive(Clone, Debug, PartialEq)]
pub struct FullAnalysis {
    /// The exported graph file.
    pub file: ExportedFile,
    /// The published message.
    pub message: ProcessorMessage,
}

struct Tracker {
    partition: PartitionDescription,
    state: PartitionState,
}

impl Tracker {
    fn new(partition: PartitionDescription) -> Self {
        Self {
            partition,
            state: PartitionState::Pending,
        }
    }

    fn advance(&mut self, next: PartitionState) {
        debug_assert!(
            self.state.can_advance_to(&next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(
            partition = self.partition.partition_id,
            from = ?self.state,
            to = ?next,
            "analysis.partition.transition"
        );
        self.state = next;
    }

    fn fail(&mut self, stage: Stage, err: &OffloadError) {
        warn!(
            partition = self.partition.partition_id,
            stage = %stage,
            error = %err,
            "analysis.partition.failed"
        );
        self.advance(PartitionState::Failed {
            stage,
            reason: err.to_string(),
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

/// Coordinates partitioning, export and dispatch for one algorithm.
pub struct PartitionedAnalysis<'a, G: ?Sized, F: ?Sized, C> {
    graph: &'a G,
    store: &'a F,
    dispatcher: Dispatcher<C>,
    opts: AnalysisOptions,
}

impl<'a, G, F, C> PartitionedAnalysis<'a, G, F, C>
where
    G: GraphStore + ?Sized,
    F: FileStore + ?Sized,
    C: Channel,
{
    /// Creates a coordinator publishing on `channel`.
    pub fn new(graph: &'a G, store: &'a F, channel: C, opts: AnalysisOptions) -> Result<Self> {
        if opts.dispatch_attempts == 0 {
            return Err(OffloadError::Invalid("dispatch attempts must be at least 1"));
        }
        if opts.algorithm.is_empty() {
            return Err(OffloadError::Invalid("algorithm must not be empty"));
        }
        Ok(Self {
            graph,
            store,
            dispatcher: Dispatcher::new(channel),
            opts,
        })
    }

    /// Dispatcher used to publish messages.
    pub fn dispatcher(&self) -> &Dispatcher<C> {
        &self.dispatcher
    }

    fn exporter(&self) -> SubgraphExporter<'a, G, F> {
        SubgraphExporter::new(
            self.graph,
            self.store,
            ExportOptions {
                root: self.opts.root.clone(),
                algorithm: self.opts.algorithm.clone(),
                tracked_type: self.opts.tracked_type.clone(),
                layout: ExportLayout::PerPartition,
                concurrency: 1,
            },
        )
    }

    fn partitions(&self) -> Result<Vec<Partition>> {
        let partitioner = Partitioner::new(self.opts.partition.clone())?;
        match self.opts.source {
            PartitionSource::Assign => partitioner.assign(self.graph),
            PartitionSource::Existing => partitioner.load_existing(self.graph),
        }
    }

    fn publish_with_retry(
        &self,
        message: &ProcessorMessage,
        payload: &[u8],
        partition: Option<u64>,
    ) -> (u32, Result<()>) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.dispatcher.dispatch_encoded(message, payload) {
                Ok(()) => return (attempts, Ok(())),
                Err(err) if attempts < self.opts.dispatch_attempts => {
                    debug!(
                        partition,
                        attempt = attempts,
                        error = %err,
                        "analysis.dispatch.retry"
                    );
                }
                Err(err) => return (attempts, Err(err)),
            }
        }
    }

    /// Runs one partition, turning a panic in the store or channel into a
    /// failure at the stage the partition had reached.
    fn run_guarded(&self, exporter: &SubgraphExporter<'a, G, F>, partition: &Partition) -> PartitionOutcome {
        let stage = Cell::new(Stage::Pending);
        let run = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_partition(exporter, partition, &stage)
        }));
        run.unwrap_or_else(|payload| {
            let reason = format!("panicked: {}", panic_message(payload.as_ref()));
            warn!(
                partition = partition.id.0,
                stage = %stage.get(),
                %reason,
                "analysis.partition.panicked"
            );
            PartitionOutcome {
                partition: partition.description(),
                state: PartitionState::Failed {
                    stage: stage.get(),
                    reason,
                },
                file: None,
                message: None,
                dispatch_attempts: 0,
            }
        })
    }

    fn run_partition(
        &self,
        exporter: &SubgraphExporter<'a, G, F>,
        partition: &Partition,
        stage: &Cell<Stage>,
    ) -> PartitionOutcome {
        let mut tracker = Tracker::new(partition.description());
        let mut outcome_file = None;
        let mut outcome_message = None;
        let mut attempts = 0;

        tracker.advance(PartitionState::Exporting);
        stage.set(Stage::Exporting);
        match exporter.export_partition(partition) {
            Ok(file) => {
                tracker.advance(PartitionState::Encoding);
                stage.set(Stage::Encoding);
                let message = ProcessorMessage::partitioned(
                    file.path.clone(),
                    self.opts.algorithm.clone(),
                    partition.description(),
                );
                outcome_file = Some(file);
                match encode(&message) {
                    Ok(payload) => {
                        tracker.advance(PartitionState::Dispatching);
                        stage.set(Stage::Dispatching);
                        let (made, published) =
                            self.publish_with_retry(&message, &payload, Some(partition.id.0));
                        outcome_message = Some(message);
                        attempts = made;
                        match published {
                            Ok(()) => tracker.advance(PartitionState::Dispatched),
                            Err(err) => tracker.fail(Stage::Dispatching, &err),
                        }
                    }
                    Err(err) => tracker.fail(Stage::Encoding, &err),
                }
            }
            Err(err) => tracker.fail(Stage::Exporting, &err),
        }

        PartitionOutcome {
            partition: tracker.partition,
            state: tracker.state,
            file: outcome_file,
            message: outcome_message,
            dispatch_attempts: attempts,
        }
    }

    /// Partitions the graph and runs export → encode → dispatch for every partition.
    ///
    /// Returns an error only when the partitions themselves cannot be produced;
    /// per-partition failures are reported in the returned [`AnalysisReport`].
    pub fn analyze_partitions(&self) -> Result<AnalysisReport> {
        let partitions = self.partitions()?;
        let exporter = self.exporter();
        let workers = self.opts.concurrency.max(1).min(partitions.len().max(1));
        info!(
            algorithm = %self.opts.algorithm,
            partitions = partitions.len(),
            workers,
            "analysis.run.start"
        );

        let outcomes = if workers <= 1 {
            partitions
                .iter()
                .map(|p| self.run_guarded(&exporter, p))
                .collect()
        } else {
            self.run_pool(&exporter, &partitions, workers)
        };

        let report = AnalysisReport {
            algorithm: self.opts.algorithm.clone(),
            outcomes,
        };
        info!(
            algorithm = %report.algorithm,
            partitions = report.outcomes.len(),
            dispatched = report.dispatched(),
            failed = report.failed().count(),
            "analysis.run.completed"
        );
        Ok(report)
    }

    fn run_pool(
        &self,
        exporter: &SubgraphExporter<'a, G, F>,
        partitions: &[Partition],
        workers: usize,
    ) -> Vec<PartitionOutcome> {
        let queue: Mutex<VecDeque<(usize, &Partition)>> =
            Mutex::new(partitions.iter().enumerate().collect());
        let slots: Mutex<Vec<Option<PartitionOutcome>>> = Mutex::new(vec![None; partitions.len()]);

        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let queue = &queue;
                    let slots = &slots;
                    scope.spawn(move || loop {
                        let Some((idx, partition)) = queue.lock().pop_front() else {
                            debug!(worker, "analysis.worker.drained");
                            break;
                        };
                        let outcome = self.run_guarded(exporter, partition);
                        slots.lock()[idx] = Some(outcome);
                    })
                })
                .collect();
            for (worker, handle) in handles.into_iter().enumerate() {
                if handle.join().is_err() {
                    warn!(worker, "analysis.worker.panicked");
                }
            }
        });

        slots
            .into_inner()
            .into_iter()
            .zip(partitions)
            .map(|(slot, partition)| {
                slot.unwrap_or_else(|| PartitionOutcome {
                    partition: partition.description(),
                    state: PartitionState::Failed {
                        stage: Stage::Pending,
                        reason: "worker terminated before finishing the partition".into(),
                    },
                    file: None,
                    message: None,
                    dispatch_attempts: 0,
                })
            })
            .collect()
    }

    /// Exports the whole graph to one file and dispatches a full-graph message.
    pub fn analyze_full(&self) -> Result<FullAnalysis> {
        let file = self.exporter().export_graph()?;
        let message = ProcessorMessage::full(file.path.clone(), self.opts.algorithm.clone());
        let payload = encode(&message)?;
        let (attempts, published) = self.publish_with_retry(&message, &payload, None);
        published?;
        info!(
            algorithm = %self.opts.algorithm,
            path = %file.path,
            attempts,
            "analysis.full.dispatched"
        );
        Ok(FullAnalysis { file, message })
    }
}
