//! Arena representation of an oriented phylogenetic tree.
//!
//! # Overview
//! Nodes and edges live in two arenas owned by the [`Tree`] and refer to each
//! other through [`NodeId`] / [`EdgeId`] handles, so the node↔edge mutual
//! references never form ownership cycles. Each node keeps two parallel lists:
//! `neighbors[i]` is reached through `edges[i]`.
//!
//! Every edge is oriented: `left` is the endpoint closer to the current root,
//! `right` the endpoint away from it. All traversals rely on this, and so do
//! the bipartition bitsets: the bitset of an edge holds the tips below `right`.
//!
//! ```text
//!            root
//!           /    \
//!      e0  /      \ e3          e0: left=root, right=x, bits {A,B}
//!         x        C            e1: left=x,    right=A, bits {A}
//!    e1  / \  e2                e2: left=x,    right=B, bits {B}
//!       A   B                   e3: left=root, right=C, bits {C}
//! ```
//!
//! # CRITICAL: the tip index
//! Bit positions come from the tip index: tip names sorted alphabetically and
//! numbered in that order. Two trees over the same taxa therefore agree on
//! every bit position, whatever their node ids are. Any structural edit that
//! changes the tip set invalidates the index and the bitsets; rebuild them
//! with [`Tree::reinit_indexes`].

use std::collections::HashMap;
use std::fmt;
use std::ops::{Index, IndexMut};

use phylotree::tree::Tree as PhyloTree;

use crate::bitset::Bitset;
use crate::error::TreeError;

/// Handle to a node of a [`Tree`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Access the arena slot of this node
    pub fn id(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Handle to an edge of a [`Tree`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(usize);

impl EdgeId {
    /// Access the arena slot of this edge
    pub fn id(&self) -> usize {
        self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// A node of the tree. A node with exactly one neighbor is a tip.
#[derive(Clone, Debug, Default)]
pub struct Node {
    name: String,
    comments: Vec<String>,
    /// Distance in edges to the closest tip, `None` until computed
    depth: Option<usize>,
    neighbors: Vec<NodeId>,
    edges: Vec<EdgeId>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    pub fn add_comment(&mut self, comment: impl Into<String>) {
        self.comments.push(comment.into());
    }

    pub fn clear_comments(&mut self) {
        self.comments.clear();
    }

    /// Depth computed by [`Tree::compute_depths`]
    pub fn depth(&self) -> Option<usize> {
        self.depth
    }

    pub fn neighbors(&self) -> &[NodeId] {
        &self.neighbors
    }

    /// Incident edges, `edges()[i]` connects to `neighbors()[i]`
    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }

    pub fn degree(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_tip(&self) -> bool {
        self.neighbors.len() == 1
    }

    /// Position of `neighbor` in the neighbor list
    pub fn neighbor_index(&self, neighbor: NodeId) -> Option<usize> {
        self.neighbors.iter().position(|&n| n == neighbor)
    }

    /// Position of `edge` in the edge list
    pub fn edge_index(&self, edge: EdgeId) -> Option<usize> {
        self.edges.iter().position(|&e| e == edge)
    }

    fn add_neighbor(&mut self, neighbor: NodeId, edge: EdgeId) {
        self.neighbors.push(neighbor);
        self.edges.push(edge);
    }
}

/// An oriented edge from `left` (parent) to `right` (child).
#[derive(Clone, Debug)]
pub struct Edge {
    left: NodeId,
    right: NodeId,
    length: Option<f64>,
    support: Option<f64>,
    pvalue: Option<f64>,
    /// Position of the edge in some edge list, reassigned per use
    id: Option<usize>,
    bitset: Option<Bitset>,
}

impl Edge {
    fn new(left: NodeId, right: NodeId) -> Self {
        Edge {
            left,
            right,
            length: None,
            support: None,
            pvalue: None,
            id: None,
            bitset: None,
        }
    }

    pub fn left(&self) -> NodeId {
        self.left
    }

    pub fn right(&self) -> NodeId {
        self.right
    }

    /// The endpoint that is not `node`
    pub fn other(&self, node: NodeId) -> NodeId {
        if self.left == node { self.right } else { self.left }
    }

    pub fn length(&self) -> Option<f64> {
        self.length
    }

    pub fn set_length(&mut self, length: Option<f64>) {
        self.length = length;
    }

    pub fn support(&self) -> Option<f64> {
        self.support
    }

    pub fn set_support(&mut self, support: Option<f64>) {
        self.support = support;
    }

    pub fn pvalue(&self) -> Option<f64> {
        self.pvalue
    }

    pub fn set_pvalue(&mut self, pvalue: Option<f64>) {
        self.pvalue = pvalue;
    }

    pub fn id(&self) -> Option<usize> {
        self.id
    }

    pub fn set_id(&mut self, id: usize) {
        self.id = Some(id);
    }

    pub fn bitset(&self) -> Option<&Bitset> {
        self.bitset.as_ref()
    }

    /// Number of tips below this edge
    pub fn num_tips_right(&self) -> Result<usize, TreeError> {
        self.bitset
            .as_ref()
            .map(Bitset::count_ones)
            .ok_or(TreeError::BitsetsNotInitialized)
    }

    /// Number of tips on the lighter side of the bipartition
    pub fn topo_depth(&self) -> Result<usize, TreeError> {
        let bitset = self
            .bitset
            .as_ref()
            .ok_or(TreeError::BitsetsNotInitialized)?;
        let right = bitset.count_ones();
        Ok(right.min(bitset.len() - right))
    }

    /// True when `other` induces the same split of the tips
    pub fn same_bipartition(&self, other: &Edge) -> Result<bool, TreeError> {
        match (&self.bitset, &other.bitset) {
            (Some(a), Some(b)) => Ok(a.same_bipartition(b)),
            _ => Err(TreeError::BitsetsNotInitialized),
        }
    }
}

/// A phylogenetic tree: one root, the node and edge arenas, and the tip index.
///
/// If the tree is unrooted the root node is a trifurcation (degree 3), a rooted
/// tree has a root of degree 2.
#[derive(Debug, Default)]
pub struct Tree {
    nodes: Vec<Option<Node>>,
    edges: Vec<Option<Edge>>,
    root: Option<NodeId>,
    /// Tip name → bit position
    tip_index: HashMap<String, usize>,
}

/// Indexing by id panics if the node or edge was removed or belongs to
/// another tree; check with [`Tree::contains_node`] and
/// [`Tree::contains_edge`] when ids come from elsewhere.
impl Index<NodeId> for Tree {
    type Output = Node;
    fn index(&self, id: NodeId) -> &Node {
        match self.nodes.get(id.0) {
            Some(Some(node)) => node,
            _ => panic!("node {id} is not part of the tree"),
        }
    }
}

impl IndexMut<NodeId> for Tree {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id.0) {
            Some(Some(node)) => node,
            _ => panic!("node {id} is not part of the tree"),
        }
    }
}

impl Index<EdgeId> for Tree {
    type Output = Edge;
    fn index(&self, id: EdgeId) -> &Edge {
        match self.edges.get(id.0) {
            Some(Some(edge)) => edge,
            _ => panic!("edge {id} is not part of the tree"),
        }
    }
}

impl IndexMut<EdgeId> for Tree {
    fn index_mut(&mut self, id: EdgeId) -> &mut Edge {
        match self.edges.get_mut(id.0) {
            Some(Some(edge)) => edge,
            _ => panic!("edge {id} is not part of the tree"),
        }
    }
}

impl Tree {
    /// Create a new empty tree
    pub fn new() -> Self {
        Tree::default()
    }

    /// Parse a Newick string and return the indexed tree
    /// (tip index, bitsets and depths built).
    ///
    /// Labels of internal nodes that parse as numbers are read as the support
    /// of the edge above that node.
    ///
    /// # Errors
    /// Returns [`TreeError::Newick`] if the parser rejects the string.
    pub fn from_newick(newick: &str) -> Result<Self, TreeError> {
        let phylo =
            PhyloTree::from_newick(newick).map_err(|e| TreeError::Newick(e.to_string()))?;
        let mut tree = Tree::from_phylo(&phylo)?;
        tree.reinit_indexes()?;
        Ok(tree)
    }

    /// Build the arena structure from a tree produced by the `phylotree` parser.
    /// Indexes are not built.
    pub fn from_phylo(phylo: &PhyloTree) -> Result<Self, TreeError> {
        let parse_err = |e: phylotree::tree::TreeError| TreeError::Newick(e.to_string());
        let phylo_root = phylo.get_root().map_err(parse_err)?;

        let mut tree = Tree::new();
        let root = tree.new_node();
        tree[root].name = phylo
            .get(&phylo_root)
            .map_err(parse_err)?
            .name
            .clone()
            .unwrap_or_default();
        tree.root = Some(root);

        let mut stack = vec![(phylo_root, root)];
        while let Some((phylo_id, node)) = stack.pop() {
            let phylo_node = phylo.get(&phylo_id).map_err(parse_err)?;
            for child_id in &phylo_node.children {
                let child = phylo.get(child_id).map_err(parse_err)?;
                let copy = tree.new_node();
                let edge = tree.connect_nodes(node, copy);
                tree[edge].length = child.parent_edge;

                let name = child.name.clone().unwrap_or_default();
                match name.parse::<f64>() {
                    Ok(support) if !child.children.is_empty() => {
                        tree[edge].support = Some(support)
                    }
                    _ => tree[copy].name = name,
                }
                stack.push((*child_id, copy));
            }
        }
        Ok(tree)
    }

    /// The current root of the tree
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Root of the tree, or [`TreeError::EmptyTree`]
    pub fn require_root(&self) -> Result<NodeId, TreeError> {
        self.root.ok_or(TreeError::EmptyTree)
    }

    /// Set a root for the tree. This does not check that the node is part of the
    /// tree nor reorient edges, see [`Tree::reroot`].
    pub fn set_root(&mut self, root: NodeId) {
        self.root = Some(root);
    }

    /// True if the root node has exactly two neighbors
    pub fn rooted(&self) -> bool {
        self.root.is_some_and(|r| self[r].degree() == 2)
    }

    /// Does `id` refer to a live node?
    pub fn contains_node(&self, id: NodeId) -> bool {
        matches!(self.nodes.get(id.0), Some(Some(_)))
    }

    /// Does `id` refer to a live edge?
    pub fn contains_edge(&self, id: EdgeId) -> bool {
        matches!(self.edges.get(id.0), Some(Some(_)))
    }

    /// Number of live nodes
    pub fn node_count(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    /// Number of live edges
    pub fn edge_count(&self) -> usize {
        self.edges.iter().flatten().count()
    }

    /// Create a new unconnected node
    pub fn new_node(&mut self) -> NodeId {
        self.nodes.push(Some(Node::default()));
        NodeId(self.nodes.len() - 1)
    }

    /// Create a new named unconnected node
    pub fn new_named_node(&mut self, name: impl Into<String>) -> NodeId {
        let node = self.new_node();
        self[node].name = name.into();
        node
    }

    /// Connect `parent` to `child` with a new edge oriented parent → child
    pub fn connect_nodes(&mut self, parent: NodeId, child: NodeId) -> EdgeId {
        self.edges.push(Some(Edge::new(parent, child)));
        let edge = EdgeId(self.edges.len() - 1);
        self[parent].add_neighbor(child, edge);
        self[child].add_neighbor(parent, edge);
        edge
    }

    /// Remove the link between `a` and `b` from both nodes and detach the edge.
    /// Returns the detached edge so that callers can read its attributes.
    pub(crate) fn disconnect(&mut self, a: NodeId, b: NodeId) -> Result<Edge, TreeError> {
        let edge = self.del_neighbor(a, b)?;
        self.del_neighbor(b, a)?;
        self.edges[edge.0].take().ok_or(TreeError::EdgeNotInTree(edge))
    }

    /// Remove `neighbor` (and the parallel edge entry) from the lists of `node`
    pub(crate) fn del_neighbor(&mut self, node: NodeId, neighbor: NodeId) -> Result<EdgeId, TreeError> {
        let idx = self[node]
            .neighbor_index(neighbor)
            .ok_or(TreeError::NodeNotInTree(neighbor))?;
        self[node].neighbors.remove(idx);
        Ok(self[node].edges.remove(idx))
    }

    /// Replace the neighbor `old` of `node` by `new`, reached through `edge`
    pub(crate) fn replace_neighbor(
        &mut self,
        node: NodeId,
        old: NodeId,
        new: NodeId,
        edge: EdgeId,
    ) -> Result<(), TreeError> {
        let idx = self[node]
            .neighbor_index(old)
            .ok_or(TreeError::NodeNotInTree(old))?;
        self[node].neighbors[idx] = new;
        self[node].edges[idx] = edge;
        Ok(())
    }

    pub(crate) fn set_edge_left(&mut self, edge: EdgeId, left: NodeId) {
        self[edge].left = left;
    }

    pub(crate) fn set_edge_right(&mut self, edge: EdgeId, right: NodeId) {
        self[edge].right = right;
    }

    pub(crate) fn swap_edge_ends(&mut self, edge: EdgeId) {
        let e = &mut self[edge];
        std::mem::swap(&mut e.left, &mut e.right);
    }

    pub(crate) fn attach(&mut self, node: NodeId, neighbor: NodeId, edge: EdgeId) {
        self[node].add_neighbor(neighbor, edge);
    }

    /// Drop a node whose links have all been removed
    pub(crate) fn detach_node(&mut self, node: NodeId) -> Option<Node> {
        self.nodes.get_mut(node.0).and_then(Option::take)
    }

    /// Drop an edge, clearing it from both endpoints if still linked
    pub(crate) fn detach_edge(&mut self, edge: EdgeId) -> Option<Edge> {
        let removed = self.edges.get_mut(edge.0).and_then(Option::take)?;
        for end in [removed.left, removed.right] {
            if let Some(Some(node)) = self.nodes.get_mut(end.0) {
                if let Some(idx) = node.edge_index(edge) {
                    node.neighbors.remove(idx);
                    node.edges.remove(idx);
                }
            }
        }
        Some(removed)
    }

    /// Move every node and edge of `other` into this tree's arenas.
    /// Returns the new handle of `other`'s root; the tip index is not updated.
    pub(crate) fn absorb(&mut self, other: Tree) -> Option<NodeId> {
        let node_shift = self.nodes.len();
        let edge_shift = self.edges.len();
        let shift_node = |n: NodeId| NodeId(n.0 + node_shift);
        let shift_edge = |e: EdgeId| EdgeId(e.0 + edge_shift);

        self.nodes.extend(other.nodes.into_iter().map(|slot| {
            slot.map(|mut node| {
                node.neighbors.iter_mut().for_each(|n| *n = shift_node(*n));
                node.edges.iter_mut().for_each(|e| *e = shift_edge(*e));
                node
            })
        }));
        self.edges.extend(other.edges.into_iter().map(|slot| {
            slot.map(|mut edge| {
                edge.left = shift_node(edge.left);
                edge.right = shift_node(edge.right);
                edge
            })
        }));
        other.root.map(shift_node)
    }

    /* Traversals */

    /// All the edges of the tree, depth first from the root (pre-order)
    pub fn edges(&self) -> Vec<EdgeId> {
        let mut edges = Vec::with_capacity(self.edges.len());
        if let Some(root) = self.root {
            for &e in &self[root].edges {
                edges.push(e);
                self.edges_recur(e, &mut edges);
            }
        }
        edges
    }

    fn edges_recur(&self, edge: EdgeId, edges: &mut Vec<EdgeId>) {
        let right = self[edge].right;
        for &child in &self[right].edges {
            if self[child].left == right {
                edges.push(child);
                self.edges_recur(child, edges);
            }
        }
    }

    /// Edges whose child node is not a tip
    pub fn internal_edges(&self) -> Vec<EdgeId> {
        self.edges()
            .into_iter()
            .filter(|&e| !self[self[e].right].is_tip())
            .collect()
    }

    /// Edges leading to a tip
    pub fn tip_edges(&self) -> Vec<EdgeId> {
        self.edges()
            .into_iter()
            .filter(|&e| self[self[e].right].is_tip())
            .collect()
    }

    /// Edges going down from `node` (those having `node` as left end)
    pub fn child_edges(&self, node: NodeId) -> impl Iterator<Item = EdgeId> + '_ {
        self[node]
            .edges
            .iter()
            .copied()
            .filter(move |&e| self[e].left == node)
    }

    /// All the nodes of the tree, depth first from the root
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        if let Some(root) = self.root {
            self.nodes_recur(&mut nodes, root, None);
        }
        nodes
    }

    fn nodes_recur(&self, nodes: &mut Vec<NodeId>, cur: NodeId, prev: Option<NodeId>) {
        nodes.push(cur);
        for &n in &self[cur].neighbors {
            if Some(n) != prev {
                self.nodes_recur(nodes, n, Some(cur));
            }
        }
    }

    /// All the tips of the tree, depth first from the root
    pub fn tips(&self) -> Vec<NodeId> {
        self.nodes()
            .into_iter()
            .filter(|&n| self[n].is_tip())
            .collect()
    }

    /// Names of all the tips, in traversal order
    pub fn all_tip_names(&self) -> Vec<String> {
        self.tips()
            .into_iter()
            .map(|n| self[n].name.clone())
            .collect()
    }

    /// Tip names sorted by their position in the bitsets
    pub fn sorted_tips(&self) -> Vec<String> {
        let mut names = self.all_tip_names();
        names.sort();
        names
    }

    /* Tip index */

    /// Rebuild the tip name → bit position mapping.
    ///
    /// Positions follow the byte-wise sorted order of the tip names. A tree
    /// without tips ends up with an empty index.
    ///
    /// # Errors
    /// [`TreeError::DuplicateTipName`] if two tips share a name; the index is
    /// left empty.
    pub fn update_tip_index(&mut self) -> Result<(), TreeError> {
        let names = self.sorted_tips();
        self.tip_index.clear();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(TreeError::DuplicateTipName(pair[0].clone()));
        }
        for (i, name) in names.into_iter().enumerate() {
            self.tip_index.insert(name, i);
        }
        Ok(())
    }

    /// Bit position of the tip with the given name
    ///
    /// # Errors
    /// [`TreeError::TipIndexNotInitialized`] if the index is empty,
    /// [`TreeError::TipNotFound`] if the name is unknown.
    pub fn tip_index(&self, name: &str) -> Result<usize, TreeError> {
        if self.tip_index.is_empty() {
            return Err(TreeError::TipIndexNotInitialized);
        }
        self.tip_index
            .get(name)
            .copied()
            .ok_or_else(|| TreeError::TipNotFound(name.to_string()))
    }

    /// Bit position of a tip node
    pub fn tip_ordinal(&self, node: NodeId) -> Result<usize, TreeError> {
        if !self.contains_node(node) {
            return Err(TreeError::NodeNotInTree(node));
        }
        if !self[node].is_tip() {
            return Err(TreeError::NotATip(node));
        }
        self.tip_index(&self[node].name)
    }

    /// Does a tip with this name exist in the index?
    pub fn exists_tip(&self, name: &str) -> Result<bool, TreeError> {
        if self.tip_index.is_empty() {
            return Err(TreeError::TipIndexNotInitialized);
        }
        Ok(self.tip_index.contains_key(name))
    }

    /// Number of tips in the index (the length of every bitset)
    pub fn tip_count(&self) -> usize {
        self.tip_index.len()
    }

    /// Tip names ordered by bit position
    pub fn tip_names_by_index(&self) -> Vec<String> {
        let mut names = vec![String::new(); self.tip_index.len()];
        for (name, &i) in &self.tip_index {
            names[i] = name.clone();
        }
        names
    }

    /// Check that both trees index exactly the same tip names
    pub fn compare_tip_indexes(&self, other: &Tree) -> Result<(), TreeError> {
        if self.tip_index.is_empty() || other.tip_index.is_empty() {
            return Err(TreeError::TipIndexNotInitialized);
        }
        if self.tip_index.len() != other.tip_index.len()
            || self.tip_index.keys().any(|k| !other.tip_index.contains_key(k))
        {
            return Err(TreeError::DifferentTipSets);
        }
        Ok(())
    }

    /* Bitsets */

    /// Allocate a fresh zero bitset, sized to the tip index, on every edge
    pub fn clear_bitsets(&mut self) -> Result<(), TreeError> {
        let ntips = self.tip_index.len();
        if ntips == 0 {
            return Err(TreeError::TipIndexNotInitialized);
        }
        for e in self.edges() {
            self[e].bitset = Some(Bitset::zeros(ntips));
        }
        Ok(())
    }

    /// Fill the bitsets of all edges, assuming they were allocated by
    /// [`Tree::clear_bitsets`] and that the tip index is current.
    pub fn update_bitsets(&mut self) -> Result<(), TreeError> {
        let root = self.require_root()?;
        let mut open = Vec::with_capacity(64);
        for e in self[root].edges.clone() {
            open.clear();
            open.push(e);
            self.fill_right_bitset(e, &mut open)?;
        }
        Ok(())
    }

    /// Clear then refill the bitset of `edge` and of the edges below it.
    /// `open` holds the edges between the root and `edge` (included): a tip
    /// sets its bit in every one of them.
    fn fill_right_bitset(&mut self, edge: EdgeId, open: &mut Vec<EdgeId>) -> Result<(), TreeError> {
        self[edge]
            .bitset
            .as_mut()
            .ok_or(TreeError::BitsetsNotInitialized)?
            .clear_all();

        let right = self[edge].right;
        if self[right].is_tip() {
            let i = self.tip_ordinal(right)?;
            for &e in open.iter() {
                self[e]
                    .bitset
                    .as_mut()
                    .ok_or(TreeError::BitsetsNotInitialized)?
                    .set(i);
            }
        } else {
            let children: Vec<EdgeId> = self.child_edges(right).collect();
            for child in children {
                open.push(child);
                self.fill_right_bitset(child, open)?;
                open.pop();
            }
        }
        Ok(())
    }

    /// Rebuild tip index, bitsets and node depths
    pub fn reinit_indexes(&mut self) -> Result<(), TreeError> {
        self.update_tip_index()?;
        self.clear_bitsets()?;
        self.update_bitsets()?;
        self.compute_depths();
        Ok(())
    }

    /* Depths */

    /// Compute the depth of every node: number of edges to the closest tip.
    pub fn compute_depths(&mut self) {
        for node in self.nodes.iter_mut().flatten() {
            node.depth = None;
        }
        let Some(root) = self.root else { return };
        if self.rooted() {
            self.compute_depth_rooted(root, None);
        } else {
            self.compute_depth_unrooted();
        }
    }

    fn compute_depth_rooted(&mut self, node: NodeId, prev: Option<NodeId>) -> usize {
        if self[node].is_tip() {
            self[node].depth = Some(0);
            return 0;
        }
        let mut min_depth: Option<usize> = None;
        for next in self[node].neighbors.clone() {
            if Some(next) != prev {
                let depth = self.compute_depth_rooted(next, Some(node));
                min_depth = Some(min_depth.map_or(depth, |m| m.min(depth)));
            }
        }
        let depth = min_depth.map_or(0, |d| d + 1);
        self[node].depth = Some(depth);
        depth
    }

    /// Level by level from the tips
    fn compute_depth_unrooted(&mut self) {
        let mut level_nodes = self.tips();
        let mut level = 0;
        while !level_nodes.is_empty() {
            let mut next_nodes = Vec::new();
            for &n in &level_nodes {
                if self[n].depth.is_none() {
                    self[n].depth = Some(level);
                }
            }
            for &n in &level_nodes {
                for &next in &self[n].neighbors {
                    if self[next].depth.is_none() {
                        next_nodes.push(next);
                    }
                }
            }
            next_nodes.sort_unstable();
            next_nodes.dedup();
            level_nodes = next_nodes;
            level += 1;
        }
    }

    /* Copies */

    fn copy_node(&mut self, node: &Node) -> NodeId {
        let id = self.new_node();
        let copy = &mut self[id];
        copy.name = node.name.clone();
        copy.depth = node.depth;
        copy.comments = node.comments.clone();
        id
    }

    /// Copy the subtree hanging from `edge` (seen from `node`) below `copy_node`
    /// in `copy`.
    pub(crate) fn copy_tree_recur(
        &self,
        copy: &mut Tree,
        copy_node: NodeId,
        node: NodeId,
        edge: EdgeId,
    ) {
        let child = self[edge].other(node);
        let copy_child = copy.copy_node(&self[child]);
        let copy_edge = copy.connect_nodes(copy_node, copy_child);
        let source = &self[edge];
        let target = &mut copy[copy_edge];
        target.length = source.length;
        target.support = source.support;
        target.pvalue = source.pvalue;
        target.id = source.id;
        target.bitset = source.bitset.clone();
        for &e in &self[child].edges {
            if e != edge {
                self.copy_tree_recur(copy, copy_child, child, e);
            }
        }
    }

    /// Copy of the tree rooted at `node`, keeping only what lies below it
    /// with respect to the current root. The copy is re-indexed.
    pub fn subtree(&self, node: NodeId) -> Result<Tree, TreeError> {
        if !self.contains_node(node) {
            return Err(TreeError::NodeNotInTree(node));
        }
        let mut sub = Tree::new();
        let root = sub.copy_node(&self[node]);
        sub.root = Some(root);
        for e in self.child_edges(node) {
            self.copy_tree_recur(&mut sub, root, node, e);
        }
        sub.reinit_indexes()?;
        Ok(sub)
    }
}

/// Deep structural copy: fresh arenas holding only the live part of the tree,
/// scalar attributes copied and bitsets cloned.
impl Clone for Tree {
    fn clone(&self) -> Self {
        let mut copy = Tree::new();
        if let Some(root) = self.root {
            let copy_root = copy.copy_node(&self[root]);
            copy.root = Some(copy_root);
            for &e in &self[root].edges {
                self.copy_tree_recur(&mut copy, copy_root, root, e);
            }
        }
        copy.tip_index = self.tip_index.clone();
        copy
    }
}
