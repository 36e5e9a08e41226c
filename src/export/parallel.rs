use std::collections::VecDeque;
use std::io::Write;
use std::thread;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use super::{
    failures_for, finish, ExportLayout, ExportedFile, RecordStats, SubgraphExporter,
};
use crate::partition::Partition;
use crate::primitives::io::{normalize_path, BlobWriter, FileStore};
use crate::storage::GraphStore;
use crate::types::{OffloadError, PartitionFailure, Result};

/// Pull queue shared by export workers. Popping is the only synchronized step.
struct WorkQueue<'p> {
    pending: Mutex<VecDeque<(usize, &'p Partition)>>,
}

impl<'p> WorkQueue<'p> {
    fn new(partitions: &'p [Partition]) -> Self {
        Self {
            pending: Mutex::new(partitions.iter().enumerate().collect()),
        }
    }

    fn pop(&self) -> Option<(usize, &'p Partition)> {
        self.pending.lock().pop_front()
    }
}

#[derive(Default)]
struct WorkerOutcome {
    files: Vec<(usize, ExportedFile)>,
    /// Queue indices of every partition held by a committed file.
    exported: Vec<usize>,
    failures: Vec<(usize, PartitionFailure)>,
}

/// A worker's private shard in the combined layout.
struct Shard<'p> {
    path: String,
    writer: Box<dyn BlobWriter>,
    held: Vec<(usize, &'p Partition)>,
    stats: RecordStats,
}

impl<'a, G, F> SubgraphExporter<'a, G, F>
where
    G: GraphStore + ?Sized,
    F: FileStore + ?Sized,
{
    /// Exports partitions on a bounded pool of workers pulling from a shared queue.
    ///
    /// The pool size is the configured concurrency, capped at the number of
    /// partitions. Every worker writes only files it created itself. All workers
    /// finish before this returns; if any partition failed the call returns
    /// [`OffloadError::ExportIncomplete`] carrying the files that did complete.
    pub fn export_parallel(&self, partitions: &[Partition]) -> Result<Vec<ExportedFile>> {
        if partitions.is_empty() {
            return finish("parallel", Vec::new(), Vec::new());
        }
        let workers = self.opts.concurrency.max(1).min(partitions.len());
        let queue = WorkQueue::new(partitions);
        debug!(
            workers,
            partitions = partitions.len(),
            layout = ?self.opts.layout,
            "export.parallel.start"
        );

        let outcomes: Vec<Option<WorkerOutcome>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let queue = &queue;
                    scope.spawn(move || match self.opts.layout {
                        ExportLayout::Combined => self.run_shard_worker(worker, queue),
                        ExportLayout::PerPartition => self.run_partition_worker(worker, queue),
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(worker, handle)| match handle.join() {
                    Ok(outcome) => Some(outcome),
                    Err(_) => {
                        warn!(worker, "export.parallel.worker_panicked");
                        None
                    }
                })
                .collect()
        });

        let mut files = Vec::new();
        let mut failures = Vec::new();
        let mut seen: FxHashSet<usize> = FxHashSet::default();
        for outcome in outcomes.into_iter().flatten() {
            files.extend(outcome.files);
            seen.extend(outcome.exported);
            failures.extend(outcome.failures);
        }
        seen.extend(failures.iter().map(|(idx, _)| *idx));
        for (idx, partition) in partitions.iter().enumerate() {
            if !seen.contains(&idx) {
                failures.push((
                    idx,
                    PartitionFailure {
                        partition: partition.id,
                        path: String::new(),
                        reason: "partition was not exported: its worker stopped early".into(),
                    },
                ));
            }
        }

        if self.opts.layout == ExportLayout::Combined {
            self.remove_stale_shards(files.iter().map(|(_, file)| file.path.as_str()))?;
        }

        files.sort_by_key(|(idx, _)| *idx);
        failures.sort_by_key(|(idx, _)| *idx);
        finish(
            "parallel",
            files.into_iter().map(|(_, file)| file).collect(),
            failures.into_iter().map(|(_, failure)| failure).collect(),
        )
    }

    fn run_partition_worker(&self, worker: usize, queue: &WorkQueue<'_>) -> WorkerOutcome {
        let mut outcome = WorkerOutcome::default();
        while let Some((idx, partition)) = queue.pop() {
            let path = self.paths.partition(partition.id);
            match self.export_into(&path, &[partition]) {
                Ok(file) => {
                    outcome.exported.push(idx);
                    outcome.files.push((idx, file));
                }
                Err(err) => outcome.failures.extend(
                    failures_for(&[partition], &path, &err)
                        .into_iter()
                        .map(|f| (idx, f)),
                ),
            }
        }
        debug!(
            worker,
            files = outcome.files.len(),
            failures = outcome.failures.len(),
            "export.parallel.worker_done"
        );
        outcome
    }

    fn run_shard_worker(&self, worker: usize, queue: &WorkQueue<'_>) -> WorkerOutcome {
        let mut outcome = WorkerOutcome::default();
        let path = self.paths.shard(worker);
        let tx = match self.graph.begin() {
            Ok(tx) => tx,
            Err(err) => {
                warn!(worker, error = %err, "export.parallel.begin_failed");
                return outcome;
            }
        };
        let mut shard: Option<Shard<'_>> = None;
        let mut failed: Option<OffloadError> = None;
        while let Some((idx, partition)) = queue.pop() {
            if shard.is_none() {
                match self.store.create(&path) {
                    Ok(writer) => {
                        shard = Some(Shard {
                            path: path.clone(),
                            writer,
                            held: Vec::new(),
                            stats: RecordStats::default(),
                        })
                    }
                    Err(err) => {
                        outcome.failures.extend(
                            failures_for(&[partition], &path, &err)
                                .into_iter()
                                .map(|f| (idx, f)),
                        );
                        failed = Some(err);
                        break;
                    }
                }
            }
            let Some(current) = shard.as_mut() else {
                break;
            };
            current.held.push((idx, partition));
            let written = self.write_records(
                &tx,
                &partition.members,
                &mut current.writer as &mut dyn Write,
                &mut current.stats,
            );
            if let Err(err) = written {
                failed = Some(err);
                break;
            }
        }
        self.graph.rollback(tx);

        let Some(shard) = shard else {
            return outcome;
        };
        let Shard {
            path,
            writer,
            held,
            stats,
        } = shard;
        let partitions: Vec<&Partition> = held.iter().map(|(_, p)| *p).collect();
        let result = match failed {
            Some(err) => {
                drop(writer);
                Err(err)
            }
            None => writer.commit(),
        };
        match result {
            Ok(bytes) => {
                let first = held.first().map(|(idx, _)| *idx).unwrap_or(usize::MAX);
                let file = ExportedFile {
                    path,
                    partitions: partitions.iter().map(|p| p.id).collect(),
                    records: stats.records,
                    edges: stats.edges,
                    bytes,
                };
                debug!(
                    worker,
                    path = %file.path,
                    partitions = file.partitions.len(),
                    records = file.records,
                    "export.parallel.shard_committed"
                );
                outcome.exported.extend(held.iter().map(|(idx, _)| *idx));
                outcome.files.push((first, file));
            }
            Err(err) => {
                let failures = failures_for(&partitions, &path, &err);
                outcome.failures.extend(
                    held.iter()
                        .map(|(idx, _)| *idx)
                        .zip(failures),
                );
            }
        }
        outcome
    }

    /// Deletes shards in the shard directory that this run did not commit.
    ///
    /// Shard names follow worker slots, so a run with fewer active workers
    /// would otherwise leave an earlier run's shards beside its own.
    fn remove_stale_shards<'p>(&self, committed: impl Iterator<Item = &'p str>) -> Result<()> {
        let keep = committed
            .map(normalize_path)
            .collect::<Result<FxHashSet<String>>>()?;
        for path in self.store.list(&self.paths.shard_dir())? {
            if keep.contains(&path) {
                continue;
            }
            match self.store.remove(&path) {
                Ok(()) | Err(OffloadError::NotFound(_)) => {
                    debug!(path = %path, "export.parallel.stale_shard_removed")
                }
                Err(err) => {
                    warn!(path = %path, error = %err, "export.parallel.stale_shard_remove_failed");
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}
