#![forbid(unsafe_code)]

//! Merging compute-engine results back into the graph.
//!
//! A result file holds one `nodeId score` pair per line. Lines starting with
//! `#` and blank lines are ignored. Every record is applied in its own short
//! transaction, so merges running concurrently on the same graph never hold
//! more than one node's write at a time. Conflicting commits are retried from
//! a fresh transaction; anything that still fails is reported per record and
//! the merge moves on.

use std::io::BufRead;
use std::thread;
use std::time::Duration;

use rand::Rng;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::message::{ProcessorMessage, ProcessorMode};
use crate::partition::DEFAULT_MEMBERSHIP_TYPE;
use crate::primitives::io::FileStore;
use crate::storage::{read_txn, Dir, GraphStore, PropValue};
use crate::types::{NodeId, OffloadError, Result};

/// Default number of commit attempts per record.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default base delay between commit attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(2);

/// Options controlling result merges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOptions {
    /// Relationship type linking a grouping node to its members.
    pub membership_type: String,
    /// Commit attempts per record before it is reported as conflicting.
    pub max_attempts: u32,
    /// Base delay between attempts. Each retry waits `attempt * backoff` plus
    /// up to one `backoff` of random jitter.
    pub retry_backoff: Duration,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            membership_type: DEFAULT_MEMBERSHIP_TYPE.to_owned(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// One parsed result line.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ResultRecord {
    /// Node the score belongs to.
    pub node: NodeId,
    /// Finite score.
    pub score: f64,
}

impl ResultRecord {
    /// Parses a `nodeId score` line.
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let (Some(node), Some(score), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(OffloadError::Protocol(format!(
                "result line must have two fields: {line:?}"
            )));
        };
        let node: NodeId = node
            .parse()
            .map_err(|_| OffloadError::Protocol(format!("bad node id in {line:?}")))?;
        let score: f64 = score
            .parse()
            .map_err(|_| OffloadError::Protocol(format!("bad score in {line:?}")))?;
        if !score.is_finite() {
            return Err(OffloadError::Protocol(format!("non-finite score in {line:?}")));
        }
        Ok(Self { node, score })
    }
}

/// Why a record was not applied.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// The line could not be parsed.
    Parse,
    /// The node is not a member of the message's partition.
    OutOfScope,
    /// The node does not exist.
    MissingNode,
    /// Every commit attempt lost a write conflict.
    Conflict,
    /// The store rejected the write for another reason.
    Store,
}

/// A record that was not applied.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordFailure {
    /// 1-based line number in the result stream.
    pub line_no: u64,
    /// Node id, when the line parsed far enough to have one.
    pub node: Option<NodeId>,
    /// Failure class.
    pub kind: FailureKind,
    /// Rendered cause.
    pub detail: String,
}

/// Outcome of one merge.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeSummary {
    /// Result lines seen, excluding comments and blank lines.
    pub lines: u64,
    /// Records whose write was committed.
    pub applied: u64,
    /// Records whose stored value already matched.
    pub unchanged: u64,
    /// Records that were not applied.
    pub failures: Vec<RecordFailure>,
}

impl MergeSummary {
    /// Number of failures of `kind`.
    pub fn count(&self, kind: FailureKind) -> usize {
        self.failures.iter().filter(|f| f.kind == kind).count()
    }

    /// Returns true if every record was applied or already up to date.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

enum Scope {
    Graph,
    Partition(FxHashSet<NodeId>),
}

enum Applied {
    Written,
    Unchanged,
}

/// Applies result files to the graph.
pub struct ResultMerger<'a, G: ?Sized> {
    graph: &'a G,
    opts: MergeOptions,
}

impl<'a, G: GraphStore + ?Sized> ResultMerger<'a, G> {
    /// Creates a merger writing into `graph`.
    pub fn new(graph: &'a G, opts: MergeOptions) -> Result<Self> {
        if opts.max_attempts == 0 {
            return Err(OffloadError::Invalid("merge attempts must be at least 1"));
        }
        Ok(Self { graph, opts })
    }

    /// Options this merger was built with.
    pub fn options(&self) -> &MergeOptions {
        &self.opts
    }

    fn scope(&self, message: &ProcessorMessage) -> Result<Scope> {
        let partition = match (message.mode(), message.partition()) {
            (ProcessorMode::Full, _) => return Ok(Scope::Graph),
            (ProcessorMode::Partitioned, Some(partition)) => partition,
            (ProcessorMode::Partitioned, None) => {
                return Err(OffloadError::Protocol(
                    "partitioned message without partitionDescription".into(),
                ))
            }
        };
        let id = NodeId(partition.partition_id);
        read_txn(self.graph, |tx| {
            if !self.graph.node_exists(tx, id)? || !self.graph.has_label(tx, id, &partition.label)? {
                return Err(OffloadError::Protocol(format!(
                    "partition {id} with label {:?} does not exist",
                    partition.label
                )));
            }
            let members = self
                .graph
                .neighbors(tx, id, &self.opts.membership_type, Dir::Out)?
                .into_iter()
                .map(|n| n.neighbor)
                .collect();
            Ok(Scope::Partition(members))
        })
    }

    fn apply_once(&self, key: &str, record: ResultRecord) -> Result<Applied> {
        let mut tx = self.graph.begin()?;
        let value = PropValue::Float(record.score);
        let step = self
            .graph
            .node_prop(&tx, record.node, key)
            .and_then(|current| {
                if current.as_ref() == Some(&value) {
                    Ok(Applied::Unchanged)
                } else {
                    self.graph
                        .set_node_prop(&mut tx, record.node, key, value)
                        .map(|()| Applied::Written)
                }
            });
        match step {
            Ok(Applied::Written) => {
                self.graph.commit(tx)?;
                Ok(Applied::Written)
            }
            Ok(Applied::Unchanged) => {
                self.graph.rollback(tx);
                Ok(Applied::Unchanged)
            }
            Err(err) => {
                self.graph.rollback(tx);
                Err(err)
            }
        }
    }

    fn backoff(&self, attempt: u32) {
        let base = self.opts.retry_backoff;
        if base.is_zero() {
            return;
        }
        let jitter = rand::thread_rng().gen_range(0..=base.as_micros().min(u64::MAX as u128) as u64);
        thread::sleep(retry_delay(base, attempt, Duration::from_micros(jitter)));
    }

    fn apply(&self, key: &str, record: ResultRecord) -> std::result::Result<Applied, (FailureKind, String)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.apply_once(key, record) {
                Ok(applied) => return Ok(applied),
                Err(err) if err.is_transient() && attempt < self.opts.max_attempts => {
                    debug!(node = record.node.0, attempt, "merge.record.retry");
                    self.backoff(attempt);
                }
                Err(OffloadError::Conflict(_)) => {
                    return Err((
                        FailureKind::Conflict,
                        format!("write conflict persisted after {attempt} attempts"),
                    ))
                }
                Err(OffloadError::NotFound(detail)) => {
                    return Err((FailureKind::MissingNode, detail))
                }
                Err(err) => return Err((FailureKind::Store, err.to_string())),
            }
        }
    }

    /// Applies every record in `results` to the property named by the message's algorithm.
    ///
    /// Fails before touching the graph if the message names a partition that
    /// does not exist. Per-record problems are collected in the summary.
    pub fn merge(&self, message: &ProcessorMessage, mut results: impl BufRead) -> Result<MergeSummary> {
        let scope = self.scope(message)?;
        let key = message.algorithm();
        let mut summary = MergeSummary::default();
        let mut buf = Vec::new();
        let mut line_no = 0u64;

        loop {
            buf.clear();
            if results.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            line_no += 1;
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(err) => {
                    summary.lines += 1;
                    let detail = format!("line is not valid UTF-8: {err}");
                    reject(&mut summary, line_no, None, FailureKind::Parse, detail);
                    continue;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            summary.lines += 1;

            let record = match ResultRecord::parse(trimmed) {
                Ok(record) => record,
                Err(err) => {
                    reject(&mut summary, line_no, None, FailureKind::Parse, err.to_string());
                    continue;
                }
            };
            if let Scope::Partition(members) = &scope {
                if !members.contains(&record.node) {
                    let detail = format!(
                        "protocol violation: node {} is not a member of the partition",
                        record.node
                    );
                    reject(&mut summary, line_no, Some(record.node), FailureKind::OutOfScope, detail);
                    continue;
                }
            }
            match self.apply(key, record) {
                Ok(Applied::Written) => summary.applied += 1,
                Ok(Applied::Unchanged) => summary.unchanged += 1,
                Err((kind, detail)) => reject(&mut summary, line_no, Some(record.node), kind, detail),
            }
        }

        info!(
            path = message.storage_path(),
            algorithm = key,
            lines = summary.lines,
            applied = summary.applied,
            unchanged = summary.unchanged,
            failed = summary.failures.len(),
            "merge.completed"
        );
        Ok(summary)
    }

    /// Reads the result file named by the message from `store` and merges it.
    pub fn merge_from_store<F: FileStore + ?Sized>(
        &self,
        store: &F,
        message: &ProcessorMessage,
    ) -> Result<MergeSummary> {
        let reader = store.open(message.storage_path())?;
        self.merge(message, reader)
    }
}

fn retry_delay(base: Duration, attempt: u32, jitter: Duration) -> Duration {
    base.saturating_mul(attempt).saturating_add(jitter)
}

fn reject(
    summary: &mut MergeSummary,
    line_no: u64,
    node: Option<NodeId>,
    kind: FailureKind,
    detail: String,
) {
    warn!(line_no, node = node.map(|n| n.0), ?kind, %detail, "merge.record.rejected");
    summary.failures.push(RecordFailure {
        line_no,
        node,
        kind,
        detail,
    });
}
