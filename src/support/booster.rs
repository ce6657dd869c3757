//! Transfer bootstrap expectation (TBE), the "booster" support.
//!
//! # Overview
//! The transfer distance between a reference branch `b` and a bootstrap
//! branch `b*` is the number of tips to move to turn the bipartition of `b`
//! into the one of `b*`. The support of `b` for one bootstrap tree is the
//! minimum transfer distance over all branches of that tree. Averaged over
//! the bootstrap trees and normalised by the expected distance of a random
//! tree, `p - 1` for a branch of topological depth `p`, it gives
//!
//! ```text
//! TBE(b) = 1 - mean_distance(b) / (p - 1)
//! ```
//!
//! # Dynamic program
//! For every pair (reference edge `i`, bootstrap edge `j`), with `T_i` the
//! tips below `i` and `T*_j` the tips below `j`:
//! - `I[i][j] = |T_i ∩ T*_j|`
//! - `C[i][j] = |T*_j \ T_i|`
//!
//! A post-order walk of the reference fills the bootstrap tip columns, then a
//! post-order walk of the bootstrap tree sums the children columns into the
//! internal ones. The symmetric difference is then
//! `H = |T_i| + C[i][j] - I[i][j]` and the transfer distance
//! `min(H, n - H)`. Both matrices use 16 bit counters.

use std::collections::HashMap;

use tracing::error;

use super::{Progress, Reference, ResultSink, Supporter};
use crate::bitset::Bitset;
use crate::error::{SupportError, TreeError};
use crate::tree::{EdgeId, Tree};

/// Which transferred taxa to report per reference branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferReport {
    #[default]
    None,
    /// Every taxon that moved across the branch in some bootstrap tree
    All,
    /// Only the taxa that moved most often across the branch
    Highest,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoosterConfig {
    /// Report, per tip, how often it has to move across close branches
    pub moved_species: bool,
    pub transfer_per_branch: TransferReport,
    /// Normalised distance under which a branch is "close"
    pub moved_species_cutoff: f64,
    /// Output `1 - mean/(p - 1)` instead of the raw mean distance
    pub normalize_by_expected: bool,
}

impl Default for BoosterConfig {
    fn default() -> Self {
        BoosterConfig {
            moved_species: false,
            transfer_per_branch: TransferReport::None,
            moved_species_cutoff: 0.3,
            normalize_by_expected: true,
        }
    }
}

/// Row-major matrix of 16 bit counters, reused across bootstrap trees.
#[derive(Debug, Default)]
struct Matrix {
    data: Vec<u16>,
    cols: usize,
}

impl Matrix {
    fn reshape(&mut self, rows: usize, cols: usize) {
        self.cols = cols;
        if self.data.len() < rows * cols {
            self.data.resize(rows * cols, 0);
        }
    }

    #[inline]
    fn get(&self, i: usize, j: usize) -> u16 {
        self.data[i * self.cols + j]
    }

    #[inline]
    fn set(&mut self, i: usize, j: usize, value: u16) {
        self.data[i * self.cols + j] = value;
    }
}

/// Parent/child structure of an edge list in pre-order.
/// Iterating positions backward visits children before parents.
#[derive(Debug, Default)]
struct Layout {
    children: Vec<Vec<usize>>,
    /// Tip ordinal of the child node, for tip edges
    tip: Vec<Option<usize>>,
    tip_columns: Vec<usize>,
}

impl Layout {
    fn build(tree: &Tree, edges: &[EdgeId]) -> Result<Self, TreeError> {
        let position: HashMap<EdgeId, usize> = edges.iter().enumerate().map(|(i, &e)| (e, i)).collect();
        let mut layout = Layout {
            children: Vec::with_capacity(edges.len()),
            tip: Vec::with_capacity(edges.len()),
            tip_columns: Vec::new(),
        };
        for (i, &e) in edges.iter().enumerate() {
            let right = tree[e].right();
            if tree[right].is_tip() {
                layout.tip.push(Some(tree.tip_ordinal(right)?));
                layout.children.push(Vec::new());
                layout.tip_columns.push(i);
            } else {
                layout.tip.push(None);
                layout.children.push(
                    tree.child_edges(right)
                        .filter_map(|c| position.get(&c).copied())
                        .collect(),
                );
            }
        }
        Ok(layout)
    }
}

/// Per worker buffers of the booster dynamic program
#[derive(Debug, Default)]
pub struct BoosterScratch {
    reference: Layout,
    tips_right: Vec<u16>,
    i_matrix: Matrix,
    c_matrix: Matrix,
    min_dist: Vec<u16>,
    min_dist_edge: Vec<usize>,
    moved: Vec<u32>,
}

/// Tips to move to go from one bipartition to the other: the smaller of
/// the differing and the agreeing positions. Its size must be `distance`.
pub fn species_to_move(e: &Bitset, be: &Bitset, distance: usize) -> Result<Vec<usize>, SupportError> {
    let (diff, equal): (Vec<usize>, Vec<usize>) = (0..e.len()).partition(|&i| e.test(i) != be.test(i));
    let moved = if diff.len() < equal.len() { diff } else { equal };
    if moved.len() != distance {
        error!(moved = moved.len(), distance, "moved species do not match the transfer distance");
        return Err(SupportError::MovedSpeciesMismatch {
            moved: moved.len(),
            distance,
        });
    }
    Ok(moved)
}

#[derive(Debug, Default)]
pub struct BoosterSupporter {
    config: BoosterConfig,
    progress: Progress,
}

impl BoosterSupporter {
    /// A cutoff outside `[0, 1]` is replaced by 1.
    pub fn new(mut config: BoosterConfig) -> Self {
        if !(0.0..=1.0).contains(&config.moved_species_cutoff) {
            config.moved_species_cutoff = 1.0;
        }
        BoosterSupporter {
            config,
            progress: Progress::new(),
        }
    }

    pub fn config(&self) -> &BoosterConfig {
        &self.config
    }

    /// Expected transfer distance of a branch of depth `depth` against a
    /// random tree
    pub fn expected_rand_value(depth: usize) -> f64 {
        depth as f64 - 1.0
    }

    /// Smallest depth at which a single moved tip stays under the cutoff
    pub fn min_close_depth(&self) -> usize {
        (1.0 / self.config.moved_species_cutoff + 1.0).ceil() as usize
    }

    fn needs_moved_taxa(&self) -> bool {
        self.config.moved_species || self.config.transfer_per_branch != TransferReport::None
    }
}

impl Supporter for BoosterSupporter {
    type Scratch = BoosterScratch;

    fn new_scratch(&self, reference: &Reference) -> Result<BoosterScratch, SupportError> {
        let ntips = reference.tree().tip_count();
        if ntips > u16::MAX as usize {
            return Err(SupportError::TooManyTips(ntips));
        }
        let mut tips_right = Vec::with_capacity(reference.len());
        for i in 0..reference.len() {
            tips_right.push(reference.edge(i).num_tips_right()? as u16);
        }
        Ok(BoosterScratch {
            reference: Layout::build(reference.tree(), reference.edges())?,
            tips_right,
            moved: vec![0; ntips],
            ..BoosterScratch::default()
        })
    }

    fn compute_value(
        &self,
        reference: &Reference,
        scratch: &mut BoosterScratch,
        bootstrap: &mut Tree,
        sink: &ResultSink,
    ) -> Result<(), SupportError> {
        bootstrap.reinit_indexes()?;
        reference.tree().compare_tip_indexes(bootstrap)?;

        let ntips = reference.tree().tip_count() as u32;
        let boot_edges = bootstrap.edges();
        let boot = Layout::build(bootstrap, &boot_edges)?;
        let (nref, nboot) = (reference.len(), boot_edges.len());

        let BoosterScratch {
            reference: layout,
            tips_right,
            i_matrix,
            c_matrix,
            min_dist,
            min_dist_edge,
            moved,
        } = scratch;
        i_matrix.reshape(nref, nboot);
        c_matrix.reshape(nref, nboot);
        min_dist.clear();
        min_dist.resize(nref, ntips as u16);
        min_dist_edge.clear();
        min_dist_edge.resize(nref, 0);

        // Reference post-order, bootstrap tip columns only
        for i in (0..nref).rev() {
            match layout.tip[i] {
                Some(tip) => {
                    for &j in &boot.tip_columns {
                        let same = boot.tip[j] == Some(tip);
                        i_matrix.set(i, j, u16::from(same));
                        c_matrix.set(i, j, u16::from(!same));
                    }
                }
                None => {
                    for &j in &boot.tip_columns {
                        i_matrix.set(i, j, 0);
                        c_matrix.set(i, j, 1);
                    }
                    for &k in &layout.children[i] {
                        for &j in &boot.tip_columns {
                            i_matrix.set(i, j, i_matrix.get(i, j) | i_matrix.get(k, j));
                            c_matrix.set(i, j, c_matrix.get(i, j) & c_matrix.get(k, j));
                        }
                    }
                }
            }
        }

        // Bootstrap post-order: internal columns are sums of their children
        for j in (0..nboot).rev() {
            if boot.tip[j].is_none() {
                for i in 0..nref {
                    let (mut iv, mut cv) = (0u16, 0u16);
                    for &k in &boot.children[j] {
                        iv += i_matrix.get(i, k);
                        cv += c_matrix.get(i, k);
                    }
                    i_matrix.set(i, j, iv);
                    c_matrix.set(i, j, cv);
                }
            }
            for i in 0..nref {
                let h = u32::from(tips_right[i]) + u32::from(c_matrix.get(i, j)) - u32::from(i_matrix.get(i, j));
                let dist = h.min(ntips - h) as u16;
                if dist < min_dist[i] {
                    min_dist[i] = dist;
                    min_dist_edge[i] = j;
                }
            }
        }

        check_tip_edges(&layout.tip, &min_dist[..])?;

        let min_depth = self.min_close_depth();
        let mut close_branches = 0usize;
        moved.iter_mut().for_each(|m| *m = 0);
        let mut transfers = (self.config.transfer_per_branch != TransferReport::None).then(|| vec![Vec::new(); nref]);

        for i in 0..nref {
            if layout.tip[i].is_some() {
                continue;
            }
            let dist = usize::from(min_dist[i]);
            if self.needs_moved_taxa() {
                let edge = reference.edge(i);
                let depth = edge.topo_depth()?;
                let e = edge.bitset().ok_or(TreeError::BitsetsNotInitialized)?;
                let be = bootstrap[boot_edges[min_dist_edge[i]]]
                    .bitset()
                    .ok_or(TreeError::BitsetsNotInitialized)?;
                let species = species_to_move(e, be, dist)?;

                let norm = dist as f64 / (depth as f64 - 1.0);
                if self.config.moved_species && norm <= self.config.moved_species_cutoff && depth >= min_depth {
                    for &t in &species {
                        moved[t] += 1;
                    }
                    close_branches += 1;
                }
                if let Some(transfers) = transfers.as_mut() {
                    transfers[i] = species;
                }
            }
            sink.value(i, dist as f64);
        }

        if self.config.moved_species {
            let fractions = moved
                .iter()
                .map(|&m| {
                    if close_branches == 0 {
                        0.0
                    } else {
                        m as f64 / close_branches as f64
                    }
                })
                .collect();
            sink.moved_species(fractions);
        }
        if let Some(transfers) = transfers {
            sink.taxa_transferred(transfers);
        }
        Ok(())
    }

    fn finalize(&self, mean: f64, topo_depth: usize) -> Option<f64> {
        if !self.config.normalize_by_expected {
            return Some(mean);
        }
        if topo_depth <= 1 {
            return None;
        }
        Some(1.0 - mean / Self::expected_rand_value(topo_depth))
    }

    fn state(&self) -> &Progress {
        &self.progress
    }

    fn transfer_report(&self) -> TransferReport {
        self.config.transfer_per_branch
    }
}

/// Every tip edge of the reference has an exact counterpart in a bootstrap
/// tree over the same tips: a nonzero distance there means corrupt state.
fn check_tip_edges(tips: &[Option<usize>], min_dist: &[u16]) -> Result<(), SupportError> {
    for (i, (tip, &dist)) in tips.iter().zip(min_dist).enumerate() {
        if tip.is_some() && dist != 0 {
            error!(edge = i, distance = dist, "tip edge without exact match");
            return Err(SupportError::TipEdgeMismatch {
                edge: i,
                distance: usize::from(dist),
            });
        }
    }
    Ok(())
}

/// Write `"{edge index}|{mean distance}|{depth}"` as the child node name of
/// every edge having a support, then clear that support.
pub fn reformat_avg_distance(tree: &mut Tree) -> Result<(), TreeError> {
    for (i, e) in tree.edges().into_iter().enumerate() {
        if let Some(avg) = tree[e].support() {
            let depth = tree[e].topo_depth()?;
            let right = tree[e].right();
            tree[right].set_name(format!("{i}|{avg}|{depth}"));
            tree[e].set_support(None);
        }
    }
    Ok(())
}

/// Turn mean transfer distances stored as supports into similarities,
/// `1 - avg/(depth - 1)`. Edges of depth 1 lose their support.
pub fn normalize_transfer_distances_by_depth(tree: &mut Tree) -> Result<(), TreeError> {
    for e in tree.edges() {
        if let Some(avg) = tree[e].support() {
            let depth = tree[e].topo_depth()?;
            let similarity = (depth > 1).then(|| 1.0 - avg / BoosterSupporter::expected_rand_value(depth));
            tree[e].set_support(similarity);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::{BootstrapItem, BranchTransfers, SupportMessage, compute_support};
    use std::sync::mpsc::channel;

    fn items(newicks: &[&str]) -> Vec<BootstrapItem> {
        newicks
            .iter()
            .enumerate()
            .map(|(id, s)| BootstrapItem::Tree {
                id,
                tree: Tree::from_newick(s).unwrap(),
            })
            .collect()
    }

    /// Distances sent for one bootstrap tree, by reference edge index
    fn distances(reference: &Tree, bootstrap: &str) -> HashMap<usize, f64> {
        let view = Reference::new(reference).unwrap();
        let supporter = BoosterSupporter::new(BoosterConfig::default());
        let mut scratch = supporter.new_scratch(&view).unwrap();
        let (sender, receiver) = channel();
        let sink = ResultSink::new(sender);
        let mut boot = Tree::from_newick(bootstrap).unwrap();
        supporter.compute_value(&view, &mut scratch, &mut boot, &sink).unwrap();
        drop(sink);
        receiver
            .into_iter()
            .filter_map(|m| match m {
                SupportMessage::Value { edge, value } => Some((edge, value)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_identical_tree_has_zero_distance() {
        let reference = Tree::from_newick("((A,B),(C,D),(E,F));").unwrap();
        let values = distances(&reference, "((E,F),(A,B),(C,D));");
        assert_eq!(values.len(), 3);
        assert!(values.values().all(|&d| d == 0.0));
    }

    /// ```text
    /// reference  ((A,B),(C,D))      bootstrap  ((A,C),(B,D))
    /// ```
    /// {A,B} is one move away from {A} (or {B}), the quartet alternatives
    /// being two moves away.
    #[test]
    fn test_quartet_swap_distance() {
        let reference = Tree::from_newick("((A,B),(C,D));").unwrap();
        let values = distances(&reference, "((A,C),(B,D));");
        assert_eq!(values.len(), 2);
        assert!(values.values().all(|&d| d == 1.0));
    }

    #[test]
    fn test_star_bootstrap() {
        let reference = Tree::from_newick("(((A,B),C),(D,E),F);").unwrap();
        let values = distances(&reference, "(A,B,C,D,E,F);");
        let mut dists: Vec<f64> = values.values().copied().collect();
        dists.sort_by(f64::total_cmp);
        // {A,B} and {D,E}: one move; {A,B,C}: two moves
        assert_eq!(dists, vec![1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_different_tip_sets_are_fatal() {
        let reference = Tree::from_newick("((A,B),(C,D));").unwrap();
        let view = Reference::new(&reference).unwrap();
        let supporter = BoosterSupporter::new(BoosterConfig::default());
        let mut scratch = supporter.new_scratch(&view).unwrap();
        let (sender, _receiver) = channel();
        let mut boot = Tree::from_newick("((A,B),(C,E));").unwrap();
        let result = supporter.compute_value(&view, &mut scratch, &mut boot, &ResultSink::new(sender));
        assert_eq!(result, Err(SupportError::Tree(TreeError::DifferentTipSets)));
    }

    #[test]
    fn test_check_tip_edges() {
        let tips = [Some(0), None, Some(1), None];
        assert_eq!(check_tip_edges(&tips, &[0, 2, 0, 1]), Ok(()));
        assert_eq!(
            check_tip_edges(&tips, &[0, 2, 1, 1]),
            Err(SupportError::TipEdgeMismatch { edge: 2, distance: 1 })
        );
    }

    #[test]
    fn test_species_to_move() {
        let mut e = Bitset::zeros(6);
        e.set(0);
        e.set(1);
        let mut be = Bitset::zeros(6);
        be.set(0);
        be.set(2);
        assert_eq!(species_to_move(&e, &be, 2).unwrap(), vec![1, 2]);
        // complement of the bootstrap side: same split, nothing to move
        assert_eq!(species_to_move(&e, &e.complement(), 0).unwrap(), Vec::<usize>::new());
        assert_eq!(
            species_to_move(&e, &be, 1),
            Err(SupportError::MovedSpeciesMismatch { moved: 2, distance: 1 })
        );
    }

    #[test]
    fn test_cutoff_is_clamped() {
        let config = BoosterConfig {
            moved_species_cutoff: 3.0,
            ..BoosterConfig::default()
        };
        let supporter = BoosterSupporter::new(config);
        assert_eq!(supporter.config().moved_species_cutoff, 1.0);
        assert_eq!(supporter.min_close_depth(), 2);

        let supporter = BoosterSupporter::new(BoosterConfig::default());
        // ceil(1/0.3 + 1) = ceil(4.33)
        assert_eq!(supporter.min_close_depth(), 5);
    }

    #[test]
    fn test_finalize() {
        let supporter = BoosterSupporter::new(BoosterConfig::default());
        assert_eq!(supporter.finalize(0.0, 3), Some(1.0));
        assert_eq!(supporter.finalize(1.0, 3), Some(0.5));
        assert_eq!(supporter.finalize(0.0, 1), None);

        let raw = BoosterSupporter::new(BoosterConfig {
            normalize_by_expected: false,
            ..BoosterConfig::default()
        });
        assert_eq!(raw.finalize(1.5, 4), Some(1.5));
    }

    #[test]
    fn test_one_of_three_swapped() {
        let mut reference = Tree::from_newick("((A,B),(C,D));").unwrap();
        let boots = items(&["((A,B),(C,D));", "((A,B),(C,D));", "((A,C),(B,D));"]);
        let supporter = BoosterSupporter::new(BoosterConfig::default());
        let report = compute_support(&mut reference, boots, 2, &supporter).unwrap();
        assert_eq!(report.trees_processed, 3);
        assert_eq!(supporter.progress(), 3);
        for e in reference.internal_edges() {
            let support = reference[e].support().unwrap();
            assert!((support - 2.0 / 3.0).abs() < 1e-12, "support {support}");
        }
        for e in reference.tip_edges() {
            assert_eq!(reference[e].support(), None);
        }
    }

    #[test]
    fn test_moved_species_and_transfers() {
        let mut reference = Tree::from_newick("((A,B),C,(D,E));").unwrap();
        let config = BoosterConfig {
            moved_species: true,
            transfer_per_branch: TransferReport::All,
            moved_species_cutoff: 1.0,
            normalize_by_expected: true,
        };
        let supporter = BoosterSupporter::new(config);
        let report = compute_support(&mut reference, items(&["((A,C),B,(D,E));"]), 1, &supporter).unwrap();

        let moved = report.moved_species.unwrap();
        assert_eq!(moved.len(), 5);
        let total: f64 = moved.iter().map(|(_, f)| f).sum();
        assert!((total - 0.5).abs() < 1e-12);
        // a single tip moved, across one of the two close branches
        assert_eq!(moved.iter().filter(|(_, f)| *f == 0.5).count(), 1);

        let branches = report.taxa_per_branch.unwrap();
        let moving: Vec<&BranchTransfers> = branches.iter().filter(|b| !b.taxa.is_empty()).collect();
        assert_eq!(moving.len(), 1);
        assert_eq!(moving[0].taxa.len(), 1);
        assert_eq!(moving[0].taxa[0].1, 1.0);
    }

    #[test]
    fn test_reformat_and_normalize() {
        let mut tree = Tree::from_newick("((A,B),(C,(D,E)),F);").unwrap();
        let internal = tree.internal_edges();
        for &e in &internal {
            tree[e].set_support(Some(0.5));
        }
        let mut normalized = tree.clone();
        normalize_transfer_distances_by_depth(&mut normalized).unwrap();
        for e in normalized.internal_edges() {
            let depth = normalized[e].topo_depth().unwrap() as f64;
            assert_eq!(normalized[e].support(), Some(1.0 - 0.5 / (depth - 1.0)));
        }

        reformat_avg_distance(&mut tree).unwrap();
        let edges = tree.edges();
        for &e in &internal {
            assert_eq!(tree[e].support(), None);
            let i = edges.iter().position(|&x| x == e).unwrap();
            let depth = tree[e].topo_depth().unwrap();
            assert_eq!(tree[tree[e].right()].name(), format!("{i}|0.5|{depth}"));
        }
    }
}
