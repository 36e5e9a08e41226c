#![forbid(unsafe_code)]

//! Subgraph export to adjacency-list files.
//!
//! Each line of an export file is one [`AdjacencyRecord`]:
//!
//! ```text
//! sourceNodeId neighbor1,neighbor2,...
//! ```
//!
//! Only nodes with at least one outgoing relationship of the tracked type get a
//! line. Neighbors appear in relationship creation order and parallel edges
//! repeat the neighbor. Files are published only after every record has been
//! written and flushed; a failed export never leaves a readable file behind.

use std::fmt;
use std::io::{BufRead, Lines, Write};

use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::partition::Partition;
use crate::primitives::io::{join_path, FileStore};
use crate::storage::{Dir, GraphStore};
use crate::types::{NodeId, OffloadError, PartitionFailure, Result};

mod parallel;

/// Default relationship type whose topology is exported.
pub const DEFAULT_TRACKED_TYPE: &str = "CONNECTED_TO";
/// Default root directory for exports in the file store.
pub const DEFAULT_EXPORT_ROOT: &str = "offload";

/// Number of workers used when none is configured.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// One node's outgoing neighbors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdjacencyRecord {
    /// Source node.
    pub source: NodeId,
    /// Neighbors in discovery order, duplicates preserved.
    pub neighbors: SmallVec<[NodeId; 8]>,
}

impl AdjacencyRecord {
    /// Parses one adjacency line.
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(neighbors), None) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(OffloadError::Protocol(format!(
                "adjacency line must have two fields: {line:?}"
            )));
        };
        let source = source
            .parse()
            .map_err(|_| OffloadError::Protocol(format!("bad source id in {line:?}")))?;
        let neighbors = neighbors
            .split(',')
            .map(|id| {
                id.parse()
                    .map_err(|_| OffloadError::Protocol(format!("bad neighbor id in {line:?}")))
            })
            .collect::<Result<SmallVec<_>>>()?;
        Ok(Self { source, neighbors })
    }

    /// Iterates `(source, neighbor)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.neighbors.iter().map(move |n| (self.source, *n))
    }
}

impl fmt::Display for AdjacencyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.source)?;
        for (i, neighbor) in self.neighbors.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{neighbor}")?;
        }
        Ok(())
    }
}

/// Iterator over the records of an adjacency file. Blank lines are skipped.
pub struct AdjacencyReader<R> {
    lines: Lines<R>,
}

impl<R: BufRead> AdjacencyReader<R> {
    /// Wraps a sequential reader.
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }
}

impl<R: BufRead> Iterator for AdjacencyReader<R> {
    type Item = Result<AdjacencyRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => return Some(Err(err.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(AdjacencyRecord::parse(&line));
        }
    }
}

/// How partitions map onto files.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExportLayout {
    /// One file for all partitions (one shard per worker when parallel).
    Combined,
    /// One file per partition.
    PerPartition,
}

/// Options controlling subgraph export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportOptions {
    /// Directory in the file store that exports are written under.
    pub root: String,
    /// Algorithm the export is for; namespaces the output paths.
    pub algorithm: String,
    /// Relationship type whose topology is exported.
    pub tracked_type: String,
    /// File layout.
    pub layout: ExportLayout,
    /// Worker count for parallel export.
    pub concurrency: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            root: DEFAULT_EXPORT_ROOT.to_owned(),
            algorithm: "pagerank".to_owned(),
            tracked_type: DEFAULT_TRACKED_TYPE.to_owned(),
            layout: ExportLayout::Combined,
            concurrency: default_concurrency(),
        }
    }
}

/// Output paths for one algorithm's exports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportPaths {
    base: String,
}

impl ExportPaths {
    /// Paths under `{root}/{algorithm}`.
    pub fn new(root: &str, algorithm: &str) -> Self {
        Self {
            base: join_path(root, algorithm),
        }
    }

    /// Single file holding every partition.
    pub fn combined(&self) -> String {
        join_path(&self.base, "edge-list.txt")
    }

    /// Directory holding the parallel shards of the combined layout.
    pub fn shard_dir(&self) -> String {
        join_path(&self.base, "edge-list")
    }

    /// Shard written by one parallel worker.
    pub fn shard(&self, worker: usize) -> String {
        join_path(&self.shard_dir(), &format!("part-{worker:05}.txt"))
    }

    /// File holding one partition.
    pub fn partition(&self, partition: NodeId) -> String {
        join_path(&self.base, &format!("partitions/{partition}.txt"))
    }

    /// File holding the whole graph.
    pub fn full_graph(&self) -> String {
        join_path(&self.base, "graph.txt")
    }
}

/// A fully written and published export file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportedFile {
    /// Path in the file store.
    pub path: String,
    /// Partitions whose records the file holds, in write order.
    pub partitions: Vec<NodeId>,
    /// Adjacency lines written.
    pub records: u64,
    /// `(source, neighbor)` pairs written.
    pub edges: u64,
    /// File length in bytes.
    pub bytes: u64,
}

#[derive(Default)]
struct RecordStats {
    records: u64,
    edges: u64,
}

/// Writes partition topology to adjacency-list files.
pub struct SubgraphExporter<'a, G: ?Sized, F: ?Sized> {
    graph: &'a G,
    store: &'a F,
    opts: ExportOptions,
    paths: ExportPaths,
}

impl<'a, G, F> SubgraphExporter<'a, G, F>
where
    G: GraphStore + ?Sized,
    F: FileStore + ?Sized,
{
    /// Creates an exporter reading from `graph` and writing to `store`.
    pub fn new(graph: &'a G, store: &'a F, opts: ExportOptions) -> Self {
        let paths = ExportPaths::new(&opts.root, &opts.algorithm);
        Self {
            graph,
            store,
            opts,
            paths,
        }
    }

    /// Options this exporter was built with.
    pub fn options(&self) -> &ExportOptions {
        &self.opts
    }

    /// Output paths used by this exporter.
    pub fn paths(&self) -> &ExportPaths {
        &self.paths
    }

    fn write_records(
        &self,
        tx: &G::Txn,
        members: &[NodeId],
        out: &mut dyn Write,
        stats: &mut RecordStats,
    ) -> Result<()> {
        use std::fmt::Write as _;

        let mut line = String::new();
        for member in members {
            let neighbors = self
                .graph
                .neighbors(tx, *member, &self.opts.tracked_type, Dir::Out)?;
            if neighbors.is_empty() {
                continue;
            }
            let record = AdjacencyRecord {
                source: *member,
                neighbors: neighbors.iter().map(|n| n.neighbor).collect(),
            };
            line.clear();
            // Writing into a String cannot fail.
            let _ = writeln!(line, "{record}");
            out.write_all(line.as_bytes())?;
            stats.records += 1;
            stats.edges += record.neighbors.len() as u64;
        }
        Ok(())
    }

    fn export_into(&self, path: &str, partitions: &[&Partition]) -> Result<ExportedFile> {
        let mut writer = self.store.create(path)?;
        let tx = self.graph.begin()?;
        let mut stats = RecordStats::default();
        let written = partitions.iter().try_for_each(|partition| {
            self.write_records(&tx, &partition.members, &mut writer, &mut stats)
        });
        self.graph.rollback(tx);
        written?;
        let bytes = writer.commit()?;
        let file = ExportedFile {
            path: path.to_owned(),
            partitions: partitions.iter().map(|p| p.id).collect(),
            records: stats.records,
            edges: stats.edges,
            bytes,
        };
        debug!(
            path = %file.path,
            partitions = file.partitions.len(),
            records = file.records,
            edges = file.edges,
            bytes = file.bytes,
            "export.file.committed"
        );
        Ok(file)
    }

    /// Writes one partition to its own file at the per-partition path.
    pub fn export_partition(&self, partition: &Partition) -> Result<ExportedFile> {
        self.export_into(&self.paths.partition(partition.id), &[partition])
    }

    /// Writes every node's tracked out-edges to the full-graph path.
    pub fn export_graph(&self) -> Result<ExportedFile> {
        let path = self.paths.full_graph();
        let mut writer = self.store.create(&path)?;
        let tx = self.graph.begin()?;
        let mut stats = RecordStats::default();
        let written = self
            .graph
            .scan_nodes(&tx)
            .and_then(|nodes| self.write_records(&tx, &nodes, &mut writer, &mut stats));
        self.graph.rollback(tx);
        written?;
        let bytes = writer.commit()?;
        info!(
            path = %path,
            records = stats.records,
            edges = stats.edges,
            bytes,
            "export.graph.completed"
        );
        Ok(ExportedFile {
            path,
            partitions: Vec::new(),
            records: stats.records,
            edges: stats.edges,
            bytes,
        })
    }

    /// Exports partitions in order on the calling thread.
    ///
    /// Returns [`OffloadError::ExportIncomplete`] if any partition could not be
    /// written; the error carries the files that did complete.
    pub fn export_serial(&self, partitions: &[Partition]) -> Result<Vec<ExportedFile>> {
        let mut completed = Vec::new();
        let mut failures = Vec::new();
        match self.opts.layout {
            ExportLayout::Combined => {
                let path = self.paths.combined();
                let all: Vec<&Partition> = partitions.iter().collect();
                match self.export_into(&path, &all) {
                    Ok(file) => completed.push(file),
                    Err(err) => failures.extend(failures_for(&all, &path, &err)),
                }
            }
            ExportLayout::PerPartition => {
                for partition in partitions {
                    let path = self.paths.partition(partition.id);
                    match self.export_into(&path, &[partition]) {
                        Ok(file) => completed.push(file),
                        Err(err) => failures.extend(failures_for(&[partition], &path, &err)),
                    }
                }
            }
        }
        finish("serial", completed, failures)
    }
}

fn failures_for(partitions: &[&Partition], path: &str, err: &OffloadError) -> Vec<PartitionFailure> {
    warn!(path = %path, error = %err, partitions = partitions.len(), "export.file.failed");
    partitions
        .iter()
        .map(|p| PartitionFailure {
            partition: p.id,
            path: path.to_owned(),
            reason: err.to_string(),
        })
        .collect()
}

fn finish(
    mode: &'static str,
    completed: Vec<ExportedFile>,
    failures: Vec<PartitionFailure>,
) -> Result<Vec<ExportedFile>> {
    let records: u64 = completed.iter().map(|f| f.records).sum();
    let edges: u64 = completed.iter().map(|f| f.edges).sum();
    if failures.is_empty() {
        info!(mode, files = completed.len(), records, edges, "export.completed");
        Ok(completed)
    } else {
        warn!(
            mode,
            files = completed.len(),
            failed_partitions = failures.len(),
            "export.incomplete"
        );
        Err(OffloadError::ExportIncomplete {
            completed,
            failures,
        })
    }
}
