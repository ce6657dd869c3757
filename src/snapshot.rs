//! Hashed partition snapshots of indexed trees.
//!
//! # Overview
//! A TreeSnapshot captures all the bipartitions (splits) of a [`Tree`] in
//! hashed canonical form. Looking an edge up in a snapshot answers "does the
//! other tree have this split?" in O(1) average time, which the classical
//! bootstrap and the common edge count rely on.
//!
//! # What is a bipartition?
//! Each edge of a tree divides the tips into two groups.
//! For example:
//! ```text
//!      root
//!     /    \
//!   {A,B}  {C,D}  ← This branch creates partition {A,B} | {C,D}
//! ```
//!
//! We only store one side of each partition (see canonicalization below).
//!
//! # CRITICAL: bit positions come from tip NAMES
//! The bitsets are read from the edges, and the tree's tip index numbers tips
//! by sorted name. Two trees over the same taxa agree on every bit position,
//! so their snapshots can be compared directly.

use std::collections::HashSet;

use crate::bitset::Bitset;
use crate::error::TreeError;
use crate::tree::Tree;

/// An immutable snapshot of all partitions in a phylogenetic tree.
///
/// # Canonicalization
/// Each bipartition can be represented two ways: {A,B}|{C,D} or {C,D}|{A,B}.
/// We canonicalize by always storing the side that does NOT contain leaf with index 0.
/// This ensures identical partitions have identical bitset representations,
/// whatever the rooting of the tree.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    /// All partitions in the tree, canonicalized
    pub parts: HashSet<Bitset>,

    /// Total number of leaves (the length of every bitset)
    pub num_leaves: usize,
}

impl TreeSnapshot {
    /// Extract a snapshot from an indexed tree.
    ///
    /// # Parameters
    /// - `tree`: The tree to extract partitions from, with current bitsets
    /// - `include_trivial`: If true, also keeps the splits isolating a single
    ///   leaf. Those come from tip edges, and from the edges of a degree 2
    ///   root when one side holds a single leaf.
    ///
    /// # Errors
    /// Returns [`TreeError::BitsetsNotInitialized`] if an edge has no bitset.
    pub fn from_tree(tree: &Tree, include_trivial: bool) -> Result<Self, TreeError> {
        tree.require_root()?;
        let num_leaves = tree.tip_count();

        let mut parts = HashSet::new();
        for e in tree.edges() {
            let bitset = tree[e].bitset().ok_or(TreeError::BitsetsNotInitialized)?;
            if !include_trivial && Self::is_trivial(bitset, num_leaves) {
                continue;
            }
            parts.insert(Self::canonical(bitset));
        }

        Ok(TreeSnapshot { parts, num_leaves })
    }

    /// One side of the split holds at most one leaf
    fn is_trivial(bitset: &Bitset, num_leaves: usize) -> bool {
        let ones = bitset.count_ones();
        ones <= 1 || ones + 1 >= num_leaves
    }

    /// Canonical side of a partition.
    ///
    /// # Example
    /// Leaves: A=0, B=1, C=2, D=3
    /// Partition {A,B}: bitset 0b0011 (leaf 0 SET) → flip to {C,D}: 0b1100
    /// Partition {C,D}: bitset 0b1100 (leaf 0 NOT set) → keep as 0b1100
    pub fn canonical(bitset: &Bitset) -> Bitset {
        if bitset.test(0) {
            bitset.complement()
        } else {
            bitset.clone()
        }
    }

    /// Is the split described by `bitset` (either side) in this snapshot?
    pub fn contains(&self, bitset: &Bitset) -> bool {
        self.parts.contains(&Self::canonical(bitset))
    }

    /// Number of partitions stored
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tree with depth 3:
    ///
    /// ```text
    ///           root
    ///          /    \
    ///      node1     node2
    ///      /   \     /   \
    ///     A     B   C    node3
    ///                    /   \
    ///                   D     E
    /// ```
    ///
    /// After sorting leaves alphabetically: A=0, B=1, C=2, D=3, E=4
    ///
    /// | Edge to | Leaves Below | Has A? | Canonical  |
    /// |---------|--------------|--------|------------|
    /// | node1   | {A, B}       | YES    | {C, D, E}  |
    /// | node2   | {C, D, E}    | NO     | {C, D, E}  |
    /// | node3   | {D, E}       | NO     | {D, E}     |
    ///
    /// The two root edges are the same split seen from both sides, so they
    /// collapse to one canonical partition.
    #[test]
    fn test_depth3_tree_partitions() {
        let tree = Tree::from_newick("((A,B),(C,(D,E)));").unwrap();
        let snapshot = TreeSnapshot::from_tree(&tree, false).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.num_leaves, 5);

        let mut cde = Bitset::zeros(5);
        for i in [2, 3, 4] {
            cde.set(i);
        }
        let mut ab = Bitset::zeros(5);
        ab.set(0);
        ab.set(1);
        assert!(snapshot.parts.contains(&cde));
        assert!(snapshot.contains(&ab));
    }

    /// Asymmetric tree with distinct partitions
    ///
    /// ```text
    ///              root
    ///             /    \
    ///         node1     E
    ///         /   \
    ///     node2    D
    ///     /   \
    ///    A    node3
    ///         /   \
    ///        B     C
    /// ```
    ///
    /// | Edge to | Raw       | Canonical |
    /// |---------|-----------|-----------|
    /// | node3   | {B,C}     | {B,C}     |
    /// | node2   | {A,B,C}   | {D,E}     |
    /// | node1   | {A,B,C,D} | {E}       |
    ///
    /// node1 is trivial ({E} | rest) and only kept with `include_trivial`.
    #[test]
    fn test_asymmetric_tree() {
        let tree = Tree::from_newick("(((A,(B,C)),D),E);").unwrap();
        let snapshot = TreeSnapshot::from_tree(&tree, false).unwrap();
        assert_eq!(snapshot.len(), 2);
        let mut e = Bitset::zeros(5);
        e.set(4);
        assert!(!snapshot.contains(&e));

        let with_tips = TreeSnapshot::from_tree(&tree, true).unwrap();
        // {E} appears both as the node1 split and the tip edge of E
        assert_eq!(with_tips.len(), 7);
    }

    /// A degree 2 root over a single leaf carries the trivial split
    /// {A,B,C,D}|{E}; it must not survive in the rooted snapshot only.
    #[test]
    fn test_root_over_single_leaf() {
        let rooted = Tree::from_newick("(((A,B),(C,D)),E);").unwrap();
        let unrooted = Tree::from_newick("((A,B),(C,D),E);").unwrap();
        let s1 = TreeSnapshot::from_tree(&rooted, false).unwrap();
        let s2 = TreeSnapshot::from_tree(&unrooted, false).unwrap();
        assert_eq!(s1.len(), 2);
        assert_eq!(s1.parts, s2.parts);
    }

    /// Same topology, rooted differently: the canonical parts must match.
    #[test]
    fn test_rooting_does_not_change_parts() {
        let t1 = Tree::from_newick("((A,B),(C,(D,E)));").unwrap();
        let t2 = Tree::from_newick("(A,B,(C,(D,E)));").unwrap();
        let s1 = TreeSnapshot::from_tree(&t1, false).unwrap();
        let s2 = TreeSnapshot::from_tree(&t2, false).unwrap();
        assert_eq!(s1.parts, s2.parts);
    }

    #[test]
    fn test_bitsets_required() {
        let mut tree = Tree::new();
        let root = tree.new_node();
        let tip = tree.new_named_node("A");
        tree.connect_nodes(root, tip);
        tree.set_root(root);
        assert_eq!(
            TreeSnapshot::from_tree(&tree, true).unwrap_err(),
            TreeError::BitsetsNotInitialized
        );
    }
}
