//! Error types for tree manipulation and branch support computation.

use thiserror::Error;

use crate::tree::{EdgeId, NodeId};

/// Errors raised while reading, indexing or editing a [`Tree`](crate::tree::Tree).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    /// The tree has no root node
    #[error("The tree is empty.")]
    EmptyTree,
    /// The tip name index was never built, or the tree has no tips
    #[error("No tips in the index, tip name index is not initialized")]
    TipIndexNotInitialized,
    /// Two tips carry the same name, so bit positions would be ambiguous
    #[error("Tip name {0} is used by more than one tip")]
    DuplicateTipName(String),
    /// The requested tip name is not in the tip index
    #[error("No tip named {0} in the index")]
    TipNotFound(String),
    /// An operation expected a tip and got an internal node
    #[error("The node {0} is not a tip")]
    NotATip(NodeId),
    /// Bitsets have not been allocated with `clear_bitsets`
    #[error("Bitsets have not been initialized, call clear_bitsets first")]
    BitsetsNotInitialized,
    /// The node id does not refer to a live node of this tree
    #[error("The node {0} is not part of the tree")]
    NodeNotInTree(NodeId),
    /// The edge id does not refer to a live edge of this tree
    #[error("The edge {0} is not part of the tree")]
    EdgeNotInTree(EdgeId),
    /// The two trees do not share the same tip names
    #[error("Trees do not have the same tip names")]
    DifferentTipSets,
    /// Trees that must have disjoint tip sets share a tip name
    #[error("Trees should not have common tip names ({0})")]
    SharedTipNames(String),
    /// An operation only makes sense on a rooted tree
    #[error("The tree is not rooted")]
    NotRooted,
    /// A node was left with a degree that the edit cannot account for
    #[error("Node {node} has an unexpected degree {degree} after {operation}")]
    InvalidDegree {
        node: NodeId,
        degree: usize,
        operation: &'static str,
    },
    /// An edge does not point away from the current root
    #[error("Edge {0} is not oriented as it should be")]
    Orientation(EdgeId),
    /// Removing a tip would leave a tree of two tips and no internal node
    #[error("The tree after tip removal is only made of two tips")]
    TwoTipsLeft,
    /// No node of degree 3 exists to reroot on
    #[error("No nodes with 3 neighbors have been found for rerooting")]
    NoTrifurcation,
    /// A node name pattern is not a valid regular expression
    #[error("Invalid node name pattern: {0}")]
    InvalidPattern(String),
    /// The Newick text could not be parsed
    #[error("Could not parse newick tree: {0}")]
    Newick(String),
}

/// Errors raised by the branch support engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SupportError {
    /// A tree level precondition failed (index, bitsets, tip sets)
    #[error(transparent)]
    Tree(#[from] TreeError),
    /// A terminal edge of the reference tree found no exact match
    #[error("Any terminal edge should have an exact match in any bootstrap tree (edge {edge}, distance {distance})")]
    TipEdgeMismatch { edge: usize, distance: usize },
    /// The reconstructed moved taxa disagree with the minimum distance
    #[error("Length of moved species array ({moved}) is not equal to the minimum distance found ({distance})")]
    MovedSpeciesMismatch { moved: usize, distance: usize },
    /// The transfer matrices use 16 bit counters
    #[error("Too many tips ({0}) for 16 bit transfer counters")]
    TooManyTips(usize),
    /// The worker pool could not be started
    #[error("Could not start the worker pool: {0}")]
    ThreadPool(String),
}
