//! Structural edits of a [`Tree`]: rerooting, pruning, grafting, collapsing
//! and resolving multifurcations.
//!
//! Edits keep the arenas consistent (both endpoints of every edge list it,
//! every edge points away from the root) but they do not refresh the tip
//! index or the bitsets unless stated otherwise. Call
//! [`Tree::reinit_indexes`] once the tree has reached its final shape.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use regex::Regex;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::TreeError;
use crate::snapshot::TreeSnapshot;
use crate::tree::{Edge, EdgeId, NodeId, Tree};

/// Length of an edge made of two edges in a row; unset lengths count as 0
/// unless both are unset.
fn joined_length(l1: Option<f64>, l2: Option<f64>) -> Option<f64> {
    if l1.is_none() && l2.is_none() {
        return None;
    }
    Some(l1.unwrap_or(0.0).max(0.0) + l2.unwrap_or(0.0).max(0.0))
}

fn max_defined(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

impl Tree {
    /* Rooting */

    /// Reroot the tree on `node`, flipping every edge that would now point
    /// toward the root. Returns the flipped edges.
    ///
    /// Bitsets are stale afterwards.
    pub fn reroot(&mut self, node: NodeId) -> Result<Vec<EdgeId>, TreeError> {
        if !self.contains_node(node) {
            return Err(TreeError::NodeNotInTree(node));
        }
        let root = self.require_root()?;
        if !self.nodes().contains(&node) {
            return Err(TreeError::NodeNotInTree(node));
        }
        let mut reversed = Vec::new();
        if root != node {
            self.set_root(node);
            self.reorder_edges(node, None, &mut reversed);
        }
        Ok(reversed)
    }

    /// Orient every edge below `node` away from it, `prev` being the node we
    /// come from.
    fn reorder_edges(&mut self, node: NodeId, prev: Option<NodeId>, reversed: &mut Vec<EdgeId>) {
        for e in self[node].edges().to_vec() {
            let next = self[e].other(node);
            if Some(next) == prev {
                continue;
            }
            if self[e].right() == node {
                self.swap_edge_ends(e);
                reversed.push(e);
            }
            self.reorder_edges(next, Some(node), reversed);
        }
    }

    /// Reroot on the first node of degree 3 met in a depth first traversal
    pub fn reroot_first(&mut self) -> Result<(), TreeError> {
        let node = self
            .nodes()
            .into_iter()
            .find(|&n| self[n].degree() == 3)
            .ok_or(TreeError::NoTrifurcation)?;
        self.reroot(node)?;
        Ok(())
    }

    /// Remove the degree 2 root of a rooted tree and connect its two
    /// neighbors directly. The new root is the first non-tip neighbor.
    ///
    /// Does nothing on an unrooted tree.
    pub fn unroot(&mut self) -> Result<(), TreeError> {
        if !self.rooted() {
            return Ok(());
        }
        let root = self.require_root()?;
        let (n1, n2) = (self[root].neighbors()[0], self[root].neighbors()[1]);
        let n1_tip = self[n1].is_tip();
        let n2_tip = self[n2].is_tip();

        let e1 = self.disconnect(n1, root)?;
        let e2 = self.disconnect(n2, root)?;
        self.detach_node(root);

        let (parent, child) = if n1_tip { (n2, n1) } else { (n1, n2) };
        let joined = self.connect_nodes(parent, child);
        self.set_root(parent);
        self.join_attributes(joined, &e1, &e2, n1_tip || n2_tip);
        Ok(())
    }

    /// Attributes of the edge replacing `e1` and `e2`
    fn join_attributes(&mut self, joined: EdgeId, e1: &Edge, e2: &Edge, to_tip: bool) {
        self[joined].set_length(joined_length(e1.length(), e2.length()));
        if !to_tip {
            self[joined].set_support(max_defined(e1.support(), e2.support()));
        }
    }

    /* Pruning */

    /// Remove the tips with the given names. If `revert` is true, keep only
    /// those tips and remove all others.
    ///
    /// The tip index, bitsets and depths are rebuilt at the end.
    pub fn remove_tips<S: AsRef<str>>(&mut self, revert: bool, names: &[S]) -> Result<(), TreeError> {
        let names: HashSet<&str> = names.iter().map(AsRef::as_ref).collect();
        let to_remove: Vec<NodeId> = self
            .tips()
            .into_iter()
            .filter(|&t| names.contains(self[t].name()) != revert)
            .collect();
        debug!(count = to_remove.len(), revert, "removing tips");
        for tip in to_remove {
            self.remove_tip(tip)?;
        }
        self.reinit_indexes()
    }

    /// Remove one tip and splice out the node it hung from if that node is
    /// left with two neighbors. Indexes are not rebuilt.
    pub fn remove_tip(&mut self, tip: NodeId) -> Result<(), TreeError> {
        if !self.contains_node(tip) {
            return Err(TreeError::NodeNotInTree(tip));
        }
        if !self[tip].is_tip() {
            return Err(TreeError::NotATip(tip));
        }
        let internal = self[tip].neighbors()[0];
        if self.root() == Some(tip) {
            self.set_root(internal);
        }
        self.disconnect(internal, tip)?;
        self.detach_node(tip);

        match self[internal].degree() {
            0 => Err(TreeError::InvalidDegree {
                node: internal,
                degree: 0,
                operation: "tip removal",
            }),
            1 => {
                if self.root() != Some(internal) {
                    return Err(TreeError::InvalidDegree {
                        node: internal,
                        degree: 1,
                        operation: "tip removal",
                    });
                }
                let child = self[internal].neighbors()[0];
                self.disconnect(child, internal)?;
                self.detach_node(internal);
                self.set_root(child);
                Ok(())
            }
            2 => self.splice_out(internal),
            _ => Ok(()),
        }
    }

    /// Replace a degree 2 node and its two edges by a single edge.
    fn splice_out(&mut self, internal: NodeId) -> Result<(), TreeError> {
        let (n1, n2) = (self[internal].neighbors()[0], self[internal].neighbors()[1]);
        let (b1, b2) = (self[internal].edges()[0], self[internal].edges()[1]);
        let n1_tip = self[n1].is_tip();
        let n2_tip = self[n2].is_tip();

        // n1 --b1--> internal, internal --b2--> n2
        let from_n1 = self[b1].left() == n1;
        let to_n2 = self[b2].right() == n2;
        let (parent, child, new_root) = match (from_n1, to_n2) {
            (true, true) => (n1, n2, None),
            (false, false) => (n2, n1, None),
            (false, true) => {
                // both edges leave `internal`: only valid at the root
                if self.root() != Some(internal) {
                    return Err(TreeError::Orientation(b1));
                }
                match (n1_tip, n2_tip) {
                    (false, _) => (n1, n2, Some(n1)),
                    (true, false) => (n2, n1, Some(n2)),
                    (true, true) => return Err(TreeError::TwoTipsLeft),
                }
            }
            (true, false) => return Err(TreeError::Orientation(b2)),
        };

        let e1 = self.disconnect(n1, internal)?;
        let e2 = self.disconnect(n2, internal)?;
        self.detach_node(internal);
        let joined = self.connect_nodes(parent, child);
        if let Some(root) = new_root {
            self.set_root(root);
        }
        self.join_attributes(joined, &e1, &e2, n1_tip || n2_tip);
        Ok(())
    }

    /// Collapse the given internal edges: the children of the lower node are
    /// moved to the upper node and the lower node disappears.
    ///
    /// Tip edges, and edges with an end of degree 2, are skipped. Bitsets are
    /// stale afterwards.
    pub fn remove_edges(&mut self, edges: &[EdgeId]) -> Result<(), TreeError> {
        for &e in edges {
            if !self.contains_edge(e) {
                continue;
            }
            let (left, right) = (self[e].left(), self[e].right());
            if self[right].is_tip() || self[right].degree() == 2 || self[left].degree() == 2 {
                continue;
            }
            self.disconnect(left, right)?;
            let children: Vec<(NodeId, EdgeId)> = self[right]
                .neighbors()
                .iter()
                .copied()
                .zip(self[right].edges().iter().copied())
                .collect();
            for (child, ce) in children {
                if self[ce].left() != right {
                    return Err(TreeError::Orientation(ce));
                }
                self.replace_neighbor(child, right, left, ce)?;
                self.set_edge_left(ce, left);
                self.attach(left, child, ce);
            }
            self.detach_node(right);
        }
        Ok(())
    }

    /// Collapse internal edges whose length is defined and at most `length`
    pub fn collapse_short_branches(&mut self, length: f64) -> Result<(), TreeError> {
        let short: Vec<EdgeId> = self
            .internal_edges()
            .into_iter()
            .filter(|&e| self[e].length().is_some_and(|l| l <= length))
            .collect();
        self.remove_edges(&short)
    }

    /// Collapse internal edges whose support is defined and below `support`
    pub fn collapse_low_support(&mut self, support: f64) -> Result<(), TreeError> {
        let low: Vec<EdgeId> = self
            .internal_edges()
            .into_iter()
            .filter(|&e| self[e].support().is_some_and(|s| s < support))
            .collect();
        self.remove_edges(&low)
    }

    /// Collapse internal edges whose topological depth lies in
    /// `[min_depth, max_depth]`. Needs current bitsets.
    pub fn collapse_topo_depth(&mut self, min_depth: usize, max_depth: usize) -> Result<(), TreeError> {
        let mut selected = Vec::new();
        for e in self.internal_edges() {
            let depth = self[e].topo_depth()?;
            if (min_depth..=max_depth).contains(&depth) {
                selected.push(e);
            }
        }
        self.remove_edges(&selected)
    }

    /// Remove internal nodes of degree 2 (other than the root), merging the
    /// two edges around them. The kept edge is the lower one; its length
    /// receives the length of the removed upper edge.
    pub fn remove_single_nodes(&mut self) -> Result<(), TreeError> {
        let root = self.require_root()?;
        self.remove_single_nodes_recur(root, None)
    }

    fn remove_single_nodes_recur(&mut self, current: NodeId, previous: Option<NodeId>) -> Result<(), TreeError> {
        for next in self[current].neighbors().to_vec() {
            if Some(next) != previous {
                self.remove_single_nodes_recur(next, Some(current))?;
            }
        }
        let Some(previous) = previous else {
            return Ok(());
        };
        if self[current].degree() != 2 {
            return Ok(());
        }
        let upper = self.disconnect(previous, current)?;
        let child = self[current].neighbors()[0];
        let ce = self[current].edges()[0];
        if self[ce].left() != current {
            return Err(TreeError::Orientation(ce));
        }
        self.del_neighbor(current, child)?;
        self.replace_neighbor(child, current, previous, ce)?;
        self.set_edge_left(ce, previous);
        self.attach(previous, child, ce);
        if let (Some(l1), Some(l2)) = (upper.length(), self[ce].length()) {
            self[ce].set_length(Some(l1 + l2));
        }
        self.detach_node(current);
        Ok(())
    }

    /// Resolve multifurcations randomly: every node with more than 3
    /// neighbors has pairs of its children regrouped under new nodes, joined
    /// by zero-length unsupported edges, until it has exactly 3 neighbors.
    pub fn resolve<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(), TreeError> {
        let root = self.require_root()?;
        self.resolve_recur(root, None, rng)
    }

    fn resolve_recur<R: Rng + ?Sized>(
        &mut self,
        current: NodeId,
        previous: Option<NodeId>,
        rng: &mut R,
    ) -> Result<(), TreeError> {
        for next in self[current].neighbors().to_vec() {
            if Some(next) != previous {
                self.resolve_recur(next, Some(current), rng)?;
            }
        }
        if self[current].degree() <= 3 {
            return Ok(());
        }

        let mut to_group: Vec<NodeId> = self[current]
            .neighbors()
            .iter()
            .copied()
            .filter(|&n| Some(n) != previous)
            .collect();
        to_group.shuffle(rng);

        while self[current].degree() > 3 {
            let grouped = self.new_node();
            for _ in 0..2 {
                let child = to_group.pop().ok_or(TreeError::InvalidDegree {
                    node: current,
                    degree: self[current].degree(),
                    operation: "resolve",
                })?;
                let old = self.disconnect(current, child)?;
                let e = self.connect_nodes(grouped, child);
                self[e].set_length(old.length());
                self[e].set_support(old.support());
                self[e].set_pvalue(old.pvalue());
            }
            let e = self.connect_nodes(current, grouped);
            self[e].set_length(Some(0.0));
            to_group.push(grouped);
        }
        Ok(())
    }

    /* Grafting and merging */

    /// Graft a new tip named `name` in the middle of `edge`.
    ///
    /// ```text
    /// before:  l --edge--> r
    /// after:   l --edge--> m --lower--> r
    ///                      m --tip_edge--> name
    /// ```
    ///
    /// Both halves get half of the original length, the new tip edge gets a
    /// length of 1. Returns `(tip_edge, lower, m)`. Indexes are not rebuilt.
    pub fn graft_tip_on_edge(
        &mut self,
        name: &str,
        edge: EdgeId,
    ) -> Result<(EdgeId, EdgeId, NodeId), TreeError> {
        if !self.contains_edge(edge) {
            return Err(TreeError::EdgeNotInTree(edge));
        }
        let (l, r) = (self[edge].left(), self[edge].right());
        let half = self[edge].length().map(|len| len / 2.0);

        let middle = self.new_node();
        let lower = self.connect_nodes(middle, r);
        self.del_neighbor(r, l)?;
        self.replace_neighbor(l, r, middle, edge)?;
        self.set_edge_right(edge, middle);
        self.attach(middle, l, edge);
        self[edge].set_length(half);
        self[lower].set_length(half);

        let tip = self.new_named_node(name);
        let tip_edge = self.connect_nodes(middle, tip);
        self[tip_edge].set_length(Some(1.0));
        Ok((tip_edge, lower, middle))
    }

    /// Merge `other` into this tree under a new root. Both trees must be
    /// rooted, indexed, and share no tip name.
    ///
    /// ```text
    ///        new root
    ///        /      \
    ///     self     other
    /// ```
    pub fn merge(&mut self, other: Tree) -> Result<(), TreeError> {
        if !self.rooted() || !other.rooted() {
            return Err(TreeError::NotRooted);
        }
        if self.tip_count() == 0 || other.tip_count() == 0 {
            return Err(TreeError::TipIndexNotInitialized);
        }
        if let Some(shared) = self
            .tip_names_by_index()
            .into_iter()
            .find(|name| other.exists_tip(name).unwrap_or(false))
        {
            return Err(TreeError::SharedTipNames(shared));
        }

        let root = self.require_root()?;
        let other_root = self.absorb(other).ok_or(TreeError::EmptyTree)?;
        let new_root = self.new_node();
        for child in [root, other_root] {
            let e = self.connect_nodes(new_root, child);
            self[e].set_length(Some(1.0));
        }
        self.set_root(new_root);
        self.reinit_indexes()
    }

    /* Annotation */

    /// Lowest node having every named tip below it, on a rooted tree.
    /// Returns the node and whether the named tips are exactly the tips
    /// below it (monophyly).
    pub fn least_common_ancestor_rooted<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<(NodeId, bool), TreeError> {
        let root = self.require_root()?;
        let tips: HashMap<&str, NodeId> = self
            .tips()
            .into_iter()
            .map(|t| (self[t].name(), t))
            .collect();
        let mut targets = HashSet::new();
        for name in names {
            let name = name.as_ref();
            let tip = tips
                .get(name)
                .ok_or_else(|| TreeError::TipNotFound(name.to_string()))?;
            targets.insert(*tip);
        }
        if targets.is_empty() {
            return Err(TreeError::TipNotFound(String::new()));
        }

        // (targets below, tips below) for every node
        let mut counts = HashMap::new();
        self.count_below(root, None, &targets, &mut counts);

        let (mut current, mut prev) = (root, None);
        loop {
            let next = self[current]
                .neighbors()
                .iter()
                .copied()
                .filter(|&n| Some(n) != prev)
                .find(|n| counts.get(n).is_some_and(|&(found, _)| found == targets.len()));
            match next {
                Some(n) => {
                    prev = Some(current);
                    current = n;
                }
                None => break,
            }
        }
        let tips_below = counts.get(&current).map_or(0, |&(_, t)| t);
        Ok((current, tips_below == targets.len()))
    }

    fn count_below(
        &self,
        node: NodeId,
        prev: Option<NodeId>,
        targets: &HashSet<NodeId>,
        counts: &mut HashMap<NodeId, (usize, usize)>,
    ) -> (usize, usize) {
        let mut total = if self[node].is_tip() && prev.is_some() {
            (usize::from(targets.contains(&node)), 1)
        } else {
            (0, 0)
        };
        for &next in self[node].neighbors() {
            if Some(next) != prev {
                let (found, tips) = self.count_below(next, Some(node), targets, counts);
                total.0 += found;
                total.1 += tips;
            }
        }
        counts.insert(node, total);
        total
    }

    /// Name the least common ancestor of each tip group with the group's key
    pub fn annotate(&mut self, groups: &HashMap<String, Vec<String>>) -> Result<(), TreeError> {
        for (label, names) in groups {
            let (node, _) = self.least_common_ancestor_rooted(names)?;
            self[node].set_name(label.clone());
        }
        Ok(())
    }

    /// Rename nodes according to `names` (old → new). Names absent from the
    /// tree are ignored. The tip index and bitsets are rebuilt.
    pub fn rename(&mut self, names: &HashMap<String, String>) -> Result<(), TreeError> {
        for node in self.nodes() {
            if let Some(new) = names.get(self[node].name()) {
                self[node].set_name(new.clone());
            }
        }
        self.update_tip_index()?;
        self.clear_bitsets()?;
        self.update_bitsets()
    }

    /// Shuffle tip names among tips, keeping the topology. The tip index and
    /// bitsets are rebuilt.
    pub fn shuffle_tips<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(), TreeError> {
        let tips = self.tips();
        let mut names: Vec<String> = tips.iter().map(|&t| self[t].name().to_string()).collect();
        names.shuffle(rng);
        for (tip, name) in tips.into_iter().zip(names) {
            self[tip].set_name(name);
        }
        self.update_tip_index()?;
        self.clear_bitsets()?;
        self.update_bitsets()
    }

    /* Queries */

    /// Nodes, tips included, whose name matches the regular expression
    /// `pattern` anywhere, in pre-order.
    pub fn select_nodes(&self, pattern: &str) -> Result<Vec<NodeId>, TreeError> {
        let re = Regex::new(pattern).map_err(|e| TreeError::InvalidPattern(e.to_string()))?;
        Ok(self
            .nodes()
            .into_iter()
            .filter(|&n| re.is_match(self[n].name()))
            .collect())
    }

    /// The edge with the most tips on its lighter side, the tree being
    /// considered unrooted. Does not use bitsets.
    pub fn deepest_edge(&self) -> Option<EdgeId> {
        let root = self.root()?;
        let ntips = self.tips().len();
        self.deepest_edge_recur(root, None, None, ntips).0
    }

    fn deepest_edge_recur(
        &self,
        node: NodeId,
        prev: Option<NodeId>,
        edge: Option<EdgeId>,
        ntips: usize,
    ) -> (Option<EdgeId>, usize, usize) {
        if prev.is_some() && self[node].is_tip() {
            return (edge, 1, 1);
        }
        let (mut max_edge, mut max_depth, mut tips) = (None, 0, 0);
        for (&next, &e) in self[node].neighbors().iter().zip(self[node].edges()) {
            if Some(next) == prev {
                continue;
            }
            let (sub_edge, depth, sub_tips) = self.deepest_edge_recur(next, Some(node), Some(e), ntips);
            if depth > max_depth {
                max_depth = depth;
                max_edge = sub_edge;
            }
            tips += sub_tips;
        }
        let light = tips.min(ntips - tips);
        if edge.is_some() && light > max_depth {
            max_depth = light;
            max_edge = edge;
        }
        (max_edge, max_depth, tips)
    }

    /// Count the edges of this tree found in `other`. Tip edges are
    /// considered only if `tip_edges` is true.
    ///
    /// Returns `(specific to self, common)`.
    pub fn common_edges(&self, other: &Tree, tip_edges: bool) -> Result<(usize, usize), TreeError> {
        self.compare_tip_indexes(other)?;
        let snapshot = TreeSnapshot::from_tree(other, true)?;
        let (mut total, mut common) = (0, 0);
        for e in self.edges() {
            if !tip_edges && self[self[e].right()].is_tip() {
                continue;
            }
            let bitset = self[e].bitset().ok_or(TreeError::BitsetsNotInitialized)?;
            total += 1;
            if snapshot.contains(bitset) {
                common += 1;
            }
        }
        Ok((total - common, common))
    }

    /// Find among `candidates` (edges of `self`) one inducing the same split
    /// as `edge` of `other`.
    pub fn find_edge(
        &self,
        other: &Tree,
        edge: EdgeId,
        candidates: &[EdgeId],
    ) -> Result<Option<EdgeId>, TreeError> {
        if !other.contains_edge(edge) {
            return Err(TreeError::EdgeNotInTree(edge));
        }
        for &c in candidates {
            if !self.contains_edge(c) {
                return Err(TreeError::EdgeNotInTree(c));
            }
            if self[c].same_bipartition(&other[edge])? {
                return Ok(Some(c));
            }
        }
        Ok(None)
    }

    /* Clearing attributes */

    pub fn clear_supports(&mut self) {
        for e in self.edges() {
            self[e].set_support(None);
        }
    }

    pub fn clear_pvalues(&mut self) {
        for e in self.edges() {
            self[e].set_pvalue(None);
        }
    }

    pub fn clear_lengths(&mut self) {
        for e in self.edges() {
            self[e].set_length(None);
        }
    }

    pub fn clear_comments(&mut self) {
        for n in self.nodes() {
            self[n].clear_comments();
        }
    }
}
