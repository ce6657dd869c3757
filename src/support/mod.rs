//! Branch support of a reference tree against a stream of bootstrap trees.
//!
//! # Overview
//! [`compute_support`] drives a pool of workers pulling bootstrap trees from
//! a shared stream. Each worker hands a tree to a [`Supporter`], which
//! compares it to the reference and emits one value per reference edge
//! through a [`ResultSink`]. A single aggregator sums the values per edge
//! and, once the stream is drained, the supporter turns each mean into the
//! support written on the reference edge.
//!
//! ```text
//!  stream ──► worker 0 ─┐
//!         ──► worker 1 ─┼──► aggregator ──► mean per edge ──► Edge::support
//!         ──► worker n ─┘
//! ```
//!
//! Reference edges are numbered by their position in [`Tree::edges`]; that
//! index is also stored as the edge id on the reference tree.

pub mod booster;
pub mod classical;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Sender, channel};

use parking_lot::{Mutex, RwLock};
use rayon::ThreadPoolBuilder;
use tracing::{debug, info, warn};

use crate::error::{SupportError, TreeError};
use crate::tree::{Edge, EdgeId, Tree};

pub use booster::{BoosterConfig, BoosterSupporter, TransferReport};
pub use classical::ClassicalSupporter;

/// One element of a bootstrap stream: a parsed tree, or the reason the
/// replicate could not be read. Error items are logged and skipped.
#[derive(Debug)]
pub enum BootstrapItem {
    Tree { id: usize, tree: Tree },
    Error { id: usize, error: TreeError },
}

impl BootstrapItem {
    /// Position of the replicate in its source
    pub fn id(&self) -> usize {
        match self {
            BootstrapItem::Tree { id, .. } | BootstrapItem::Error { id, .. } => *id,
        }
    }
}

/// Processed-tree counter and cancellation flag shared by all workers.
#[derive(Debug, Default)]
pub struct Progress {
    processed: RwLock<usize>,
    stop: AtomicBool,
}

impl Progress {
    pub fn new() -> Self {
        Progress::default()
    }

    pub fn reset(&self) {
        *self.processed.write() = 0;
        self.stop.store(false, Ordering::Relaxed);
    }

    pub fn tree_done(&self) {
        *self.processed.write() += 1;
    }

    pub fn processed(&self) -> usize {
        *self.processed.read()
    }

    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn canceled(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Read-only view of the reference tree shared by the workers.
#[derive(Debug)]
pub struct Reference<'a> {
    tree: &'a Tree,
    edges: Vec<EdgeId>,
}

impl<'a> Reference<'a> {
    /// Capture the edge order of an indexed tree
    pub fn new(tree: &'a Tree) -> Result<Self, TreeError> {
        Self::check(tree)?;
        Ok(Reference { tree, edges: tree.edges() })
    }

    /// Can `tree` serve as a reference: tip index built, bitsets filled
    pub fn check(tree: &Tree) -> Result<(), TreeError> {
        if tree.tip_count() == 0 {
            return Err(TreeError::TipIndexNotInitialized);
        }
        if tree.edges().into_iter().any(|e| tree[e].bitset().is_none()) {
            return Err(TreeError::BitsetsNotInitialized);
        }
        Ok(())
    }

    pub fn tree(&self) -> &'a Tree {
        self.tree
    }

    /// Reference edges, indexed by reference edge index
    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }

    pub fn edge(&self, index: usize) -> &'a Edge {
        &self.tree[self.edges[index]]
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Is the reference edge at `index` a tip edge?
    pub fn is_tip_edge(&self, index: usize) -> bool {
        self.tree[self.edge(index).right()].is_tip()
    }
}

/// What a worker reports to the aggregator
#[derive(Debug)]
pub enum SupportMessage {
    /// Value of reference edge `edge` for one bootstrap tree
    Value { edge: usize, value: f64 },
    /// Per tip ordinal, fraction of close branches across which it moved
    MovedSpecies(Vec<f64>),
    /// Per reference edge, the tip ordinals moved across it
    TaxaTransferred(Vec<Vec<usize>>),
    TreeDone,
    Skipped,
    Failed(SupportError),
}

/// Sending half of the result channel, one per worker.
#[derive(Debug, Clone)]
pub struct ResultSink {
    sender: Sender<SupportMessage>,
}

impl ResultSink {
    pub fn new(sender: Sender<SupportMessage>) -> Self {
        ResultSink { sender }
    }

    // The receiver lives until every worker is done; a failed send means the
    // aggregator is gone and nothing is listening anymore.
    fn send(&self, message: SupportMessage) {
        let _ = self.sender.send(message);
    }

    pub fn value(&self, edge: usize, value: f64) {
        self.send(SupportMessage::Value { edge, value });
    }

    pub fn moved_species(&self, fractions: Vec<f64>) {
        self.send(SupportMessage::MovedSpecies(fractions));
    }

    pub fn taxa_transferred(&self, per_edge: Vec<Vec<usize>>) {
        self.send(SupportMessage::TaxaTransferred(per_edge));
    }

    fn tree_done(&self) {
        self.send(SupportMessage::TreeDone);
    }

    fn skipped(&self) {
        self.send(SupportMessage::Skipped);
    }

    fn failed(&self, error: SupportError) {
        self.send(SupportMessage::Failed(error));
    }
}

/// A branch support strategy plugged into [`compute_support`].
pub trait Supporter: Sync {
    /// Per worker buffers, reused from one bootstrap tree to the next
    type Scratch;

    /// Allocate the buffers of one worker
    fn new_scratch(&self, reference: &Reference) -> Result<Self::Scratch, SupportError>;

    /// Compare one bootstrap tree to the reference and emit one value per
    /// reference edge of interest.
    fn compute_value(
        &self,
        reference: &Reference,
        scratch: &mut Self::Scratch,
        bootstrap: &mut Tree,
        sink: &ResultSink,
    ) -> Result<(), SupportError>;

    /// Final support of an edge given its mean value over bootstrap trees
    fn finalize(&self, mean: f64, topo_depth: usize) -> Option<f64>;

    fn state(&self) -> &Progress;

    /// Which transferred-taxa report to assemble, if any
    fn transfer_report(&self) -> TransferReport {
        TransferReport::None
    }

    fn init(&self, _reference: &Reference) -> Result<(), SupportError> {
        self.state().reset();
        Ok(())
    }

    /// Number of bootstrap trees processed so far
    fn progress(&self) -> usize {
        self.state().processed()
    }

    /// Ask the workers to stop after their current tree
    fn cancel(&self) {
        self.state().cancel()
    }

    fn canceled(&self) -> bool {
        self.state().canceled()
    }
}

/// Taxa moved across one reference branch
#[derive(Debug, Clone, PartialEq)]
pub struct BranchTransfers {
    /// Reference edge index
    pub edge: usize,
    /// Tip name and fraction of bootstrap trees in which it moved
    pub taxa: Vec<(String, f64)>,
}

/// Summary of a support computation. Supports themselves are written on the
/// reference tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupportReport {
    pub trees_processed: usize,
    pub trees_skipped: usize,
    /// Per tip, mean fraction of close branches it moved across
    pub moved_species: Option<Vec<(String, f64)>>,
    pub taxa_per_branch: Option<Vec<BranchTransfers>>,
}

#[derive(Debug)]
struct Aggregate {
    sums: Vec<f64>,
    counts: Vec<usize>,
    species_sums: Vec<f64>,
    species_trees: usize,
    transfers: Vec<HashMap<usize, usize>>,
    transfer_trees: usize,
    processed: usize,
    skipped: usize,
    error: Option<SupportError>,
}

impl Aggregate {
    fn new(nedges: usize, ntips: usize) -> Self {
        Aggregate {
            sums: vec![0.0; nedges],
            counts: vec![0; nedges],
            species_sums: vec![0.0; ntips],
            species_trees: 0,
            transfers: vec![HashMap::new(); nedges],
            transfer_trees: 0,
            processed: 0,
            skipped: 0,
            error: None,
        }
    }

    fn add(&mut self, message: SupportMessage) {
        match message {
            SupportMessage::Value { edge, value } => {
                self.sums[edge] += value;
                self.counts[edge] += 1;
            }
            SupportMessage::MovedSpecies(fractions) => {
                for (sum, f) in self.species_sums.iter_mut().zip(fractions) {
                    *sum += f;
                }
                self.species_trees += 1;
            }
            SupportMessage::TaxaTransferred(per_edge) => {
                for (counts, taxa) in self.transfers.iter_mut().zip(per_edge) {
                    for taxon in taxa {
                        *counts.entry(taxon).or_insert(0) += 1;
                    }
                }
                self.transfer_trees += 1;
            }
            SupportMessage::TreeDone => self.processed += 1,
            SupportMessage::Skipped => self.skipped += 1,
            SupportMessage::Failed(e) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
        }
    }

    fn moved_species(&self, names: &[String]) -> Option<Vec<(String, f64)>> {
        if self.species_trees == 0 {
            return None;
        }
        let n = self.species_trees as f64;
        Some(
            names
                .iter()
                .cloned()
                .zip(self.species_sums.iter().map(|s| s / n))
                .collect(),
        )
    }

    fn taxa_per_branch(&self, names: &[String], mode: TransferReport) -> Option<Vec<BranchTransfers>> {
        if mode == TransferReport::None || self.transfer_trees == 0 {
            return None;
        }
        let n = self.transfer_trees as f64;
        let branches = self
            .transfers
            .iter()
            .enumerate()
            .map(|(edge, counts)| {
                let highest = counts.values().copied().max().unwrap_or(0);
                let mut taxa: Vec<(usize, usize)> = counts
                    .iter()
                    .map(|(&t, &c)| (t, c))
                    .filter(|&(_, c)| mode == TransferReport::All || c == highest)
                    .collect();
                taxa.sort_unstable();
                BranchTransfers {
                    edge,
                    taxa: taxa
                        .into_iter()
                        .map(|(t, c)| (names[t].clone(), c as f64 / n))
                        .collect(),
                }
            })
            .collect();
        Some(branches)
    }
}

/// Number of workers to use when the caller asks for 0
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Compute the support of every edge of `reference` from the bootstrap
/// trees of `bootstraps`, using `workers` worker threads (0: one per core).
///
/// The reference must be indexed (tip index and bitsets). Its edge ids are
/// set to their reference edge index and their supports are overwritten:
/// edges that received no value get no support.
///
/// # Errors
/// The first fatal error of any worker: a bootstrap tree over a different
/// tip set, or an inconsistency of the transfer computation. Unreadable
/// replicates ([`BootstrapItem::Error`]) are skipped, not fatal.
pub fn compute_support<S, I>(
    reference: &mut Tree,
    bootstraps: I,
    workers: usize,
    supporter: &S,
) -> Result<SupportReport, SupportError>
where
    S: Supporter,
    I: IntoIterator<Item = BootstrapItem>,
    I::IntoIter: Send,
{
    let workers = if workers == 0 { default_workers() } else { workers };
    Reference::check(reference)?;
    for (i, e) in reference.edges().into_iter().enumerate() {
        reference[e].set_id(i);
    }
    let names = reference.tip_names_by_index();

    let aggregate = {
        let view = Reference::new(reference)?;
        supporter.init(&view)?;
        info!(workers, edges = view.len(), tips = names.len(), "computing supports");

        let pool = ThreadPoolBuilder::new()
            .num_threads(workers + 1)
            .thread_name(|i| format!("support-{i}"))
            .build()
            .map_err(|e| SupportError::ThreadPool(e.to_string()))?;

        let stream = Mutex::new(bootstraps.into_iter());
        let (sender, receiver) = channel();
        let mut aggregate = Aggregate::new(view.len(), names.len());

        let view = &view;
        let stream = &stream;
        pool.scope(|scope| {
            for worker in 0..workers {
                let sink = ResultSink::new(sender.clone());
                scope.spawn(move |_| {
                    if let Err(e) = run_worker(worker, view, stream, supporter, &sink) {
                        supporter.cancel();
                        sink.failed(e);
                    }
                });
            }
            drop(sender);
            for message in receiver {
                aggregate.add(message);
            }
        });
        aggregate
    };

    if let Some(e) = aggregate.error {
        return Err(e);
    }

    let edges = reference.edges();
    for (i, &e) in edges.iter().enumerate() {
        let support = match aggregate.counts[i] {
            0 => None,
            n => supporter.finalize(aggregate.sums[i] / n as f64, reference[e].topo_depth()?),
        };
        reference[e].set_support(support);
    }

    info!(
        processed = aggregate.processed,
        skipped = aggregate.skipped,
        canceled = supporter.canceled(),
        "supports computed"
    );
    Ok(SupportReport {
        trees_processed: aggregate.processed,
        trees_skipped: aggregate.skipped,
        moved_species: aggregate.moved_species(&names),
        taxa_per_branch: aggregate.taxa_per_branch(&names, supporter.transfer_report()),
    })
}

fn run_worker<S, It>(
    worker: usize,
    reference: &Reference,
    stream: &Mutex<It>,
    supporter: &S,
    sink: &ResultSink,
) -> Result<(), SupportError>
where
    S: Supporter,
    It: Iterator<Item = BootstrapItem>,
{
    let mut scratch = supporter.new_scratch(reference)?;
    while !supporter.canceled() {
        let Some(item) = stream.lock().next() else {
            break;
        };
        match item {
            BootstrapItem::Error { id, error } => {
                warn!(worker, replicate = id, %error, "skipping unreadable bootstrap tree");
                sink.skipped();
            }
            BootstrapItem::Tree { id, mut tree } => {
                debug!(worker, replicate = id, "comparing bootstrap tree");
                supporter.compute_value(reference, &mut scratch, &mut tree, sink)?;
                supporter.state().tree_done();
                sink.tree_done();
            }
        }
    }
    Ok(())
}

/// Booster support (transfer bootstrap expectation) of every edge of
/// `reference`.
pub fn booster<I>(
    reference: &mut Tree,
    bootstraps: I,
    workers: usize,
    config: BoosterConfig,
) -> Result<SupportReport, SupportError>
where
    I: IntoIterator<Item = BootstrapItem>,
    I::IntoIter: Send,
{
    let supporter = BoosterSupporter::new(config);
    compute_support(reference, bootstraps, workers, &supporter)
}

/// Classical bootstrap support (fraction of exact matches) of every edge of
/// `reference`.
pub fn classical<I>(reference: &mut Tree, bootstraps: I, workers: usize) -> Result<SupportReport, SupportError>
where
    I: IntoIterator<Item = BootstrapItem>,
    I::IntoIter: Send,
{
    let supporter = ClassicalSupporter::new();
    compute_support(reference, bootstraps, workers, &supporter)
}
