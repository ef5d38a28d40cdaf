//! Graph algebra over any vertex type with an equality test.
//!
//! Everything here is pure: stars, connected components, spanning trees and the
//! incremental star-tree forest that groups drawn edges into transaction batches.
//! Neighbours are visited in edge-list order, so results are deterministic for a
//! given edge ordering. Callers must not rely on the edge order of a component.

use std::fmt;

/// An undirected connection between two vertices. `src`/`tgt` only record the
/// orientation the edge arrived with.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge<T> {
    pub src: T,
    pub tgt: T,
}

impl<T: PartialEq> Edge<T> {
    pub fn new(src: T, tgt: T) -> Self {
        Self { src, tgt }
    }

    pub fn vertices(&self) -> [&T; 2] {
        [&self.src, &self.tgt]
    }

    pub fn touches(&self, t: &T) -> bool {
        self.src == *t || self.tgt == *t
    }
}

/// Every edge incident to `src`.
#[derive(Debug, Clone, PartialEq)]
pub struct Star<T> {
    pub src: T,
    pub rays: Vec<Edge<T>>,
}

impl<T: PartialEq + Clone> Star<T> {
    /// Far endpoints of the rays.
    pub fn leaves(&self) -> Vec<T> {
        self.rays
            .iter()
            .flat_map(|r| r.vertices())
            .filter(|t| **t != self.src)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Graph<T> {
    pub edges: Vec<Edge<T>>,
}

impl<T> Default for Graph<T> {
    fn default() -> Self {
        Self { edges: Vec::new() }
    }
}

impl<T: PartialEq + Clone> Graph<T> {
    pub fn new(edges: Vec<Edge<T>>) -> Self {
        Self { edges }
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Distinct vertices in first-seen order.
    pub fn vertices(&self) -> Vec<T> {
        let mut out: Vec<T> = Vec::new();
        for v in self.edges.iter().flat_map(|e| e.vertices()) {
            if !out.contains(v) {
                out.push(v.clone());
            }
        }
        out
    }
}

pub fn star_in_graph<T: PartialEq + Clone>(g: &Graph<T>, src: &T) -> Star<T> {
    let rays = g.edges.iter().filter(|e| e.touches(src)).cloned().collect();
    Star { src: src.clone(), rays }
}

fn set_difference<T: PartialEq + Clone>(all: &[Edge<T>], used: &[Edge<T>]) -> Vec<Edge<T>> {
    all.iter().filter(|e| !used.contains(e)).cloned().collect()
}

/// The maximal connected subgraph of `g` containing `t`. Empty when `t` has no
/// incident edges.
pub fn component_for<T: PartialEq + Clone>(g: &Graph<T>, t: &T) -> Graph<T> {
    let star = star_in_graph(g, t);
    let leaves = star.leaves();
    if leaves.is_empty() {
        return Graph::default();
    }

    let mut acc = star.rays;
    for next in leaves {
        let remaining = Graph::new(set_difference(&g.edges, &acc));
        let mut edges = component_for(&remaining, &next).edges;
        edges.extend(acc);
        acc = edges;
    }
    Graph::new(acc)
}

/// Partition of all edges into maximal connected subgraphs.
pub fn connected_components<T: PartialEq + Clone>(g: &Graph<T>) -> Vec<Graph<T>> {
    let mut components = Vec::new();
    let mut remaining = g.edges.clone();
    while let Some(first) = remaining.first().cloned() {
        let mut component = component_for(&Graph::new(remaining.clone()), &first.src);
        if component.is_empty() {
            // degenerate self-loop: it is its own component
            component = Graph::new(vec![first]);
        }
        remaining = set_difference(&remaining, &component.edges);
        components.push(component);
    }
    components
}

/// Rooted tree of values. Within one tree no value appears twice; the forest
/// builder below maintains that.
#[derive(Debug, Clone, PartialEq)]
pub struct StarTree<T> {
    pub src: T,
    pub tree: Vec<StarTree<T>>,
}

impl<T: PartialEq + Clone> StarTree<T> {
    pub fn leaf(src: T) -> Self {
        Self { src, tree: Vec::new() }
    }

    pub fn is_leaf(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn find(&self, v: &T) -> Option<&StarTree<T>> {
        if self.src == *v {
            return Some(self);
        }
        self.tree.iter().find_map(|t| t.find(v))
    }

    pub fn find_mut(&mut self, v: &T) -> Option<&mut StarTree<T>> {
        if self.src == *v {
            return Some(self);
        }
        self.tree.iter_mut().find_map(|t| t.find_mut(v))
    }

    pub fn contains(&self, v: &T) -> bool {
        self.find(v).is_some()
    }

    /// Values in pre-order.
    pub fn values(&self) -> Vec<&T> {
        let mut out = vec![&self.src];
        for child in &self.tree {
            out.extend(child.values());
        }
        out
    }

    pub fn len(&self) -> usize {
        1 + self.tree.iter().map(StarTree::len).sum::<usize>()
    }

    fn path_to(&self, v: &T) -> Option<Vec<usize>> {
        if self.src == *v {
            return Some(Vec::new());
        }
        self.tree.iter().enumerate().find_map(|(i, child)| {
            child.path_to(v).map(|mut rest| {
                rest.insert(0, i);
                rest
            })
        })
    }

    /// Same vertex set and edges, rooted at `v`. Unchanged when `v` is absent.
    pub fn reroot(self, v: &T) -> StarTree<T> {
        let Some(path) = self.path_to(v) else { return self };
        let mut current = self;
        let mut above: Option<StarTree<T>> = None;
        for idx in path {
            let child = current.tree.remove(idx);
            if let Some(parent) = above.take() {
                current.tree.push(parent);
            }
            above = Some(current);
            current = child;
        }
        if let Some(parent) = above {
            current.tree.push(parent);
        }
        current
    }
}

impl<T: fmt::Display> StarTree<T> {
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        writeln!(f, "{}{}", "  ".repeat(depth), self.src)?;
        for child in &self.tree {
            child.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl<T: fmt::Display> fmt::Display for StarTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

/// Number of childless nodes; a single node counts as one.
pub fn count_leaves<T>(tree: &StarTree<T>) -> usize {
    if tree.tree.is_empty() {
        return 1;
    }
    tree.tree.iter().map(count_leaves).sum()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanningTree<T> {
    pub used_edges: Vec<Edge<T>>,
    pub tree: StarTree<T>,
}

/// Spanning tree of the component containing `root`. A disconnected graph only
/// yields the component of `root`; call once per component for full coverage.
/// Cycle-closing edges are consumed without repeating a vertex.
pub fn spanning_tree<T: PartialEq + Clone>(g: &Graph<T>, root: &T) -> SpanningTree<T> {
    let mut visited = vec![root.clone()];
    spanning_tree_worker(g, root, &mut visited)
}

fn spanning_tree_worker<T: PartialEq + Clone>(g: &Graph<T>, t: &T, visited: &mut Vec<T>) -> SpanningTree<T> {
    let star = star_in_graph(g, t);
    let leaves = star.leaves();
    if leaves.is_empty() {
        return SpanningTree { used_edges: Vec::new(), tree: StarTree::leaf(t.clone()) };
    }

    let mut used_edges = star.rays;
    let mut fresh = Vec::new();
    for v in leaves {
        if !visited.contains(&v) {
            visited.push(v.clone());
            fresh.push(v);
        }
    }

    let mut tree = Vec::with_capacity(fresh.len());
    for v in fresh {
        let remaining = Graph::new(set_difference(&g.edges, &used_edges));
        let sub = spanning_tree_worker(&remaining, &v, visited);
        used_edges.extend(sub.used_edges);
        tree.push(sub.tree);
    }
    SpanningTree { used_edges, tree: StarTree { src: t.clone(), tree } }
}

/// Outcome of offering one edge to one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    /// Attached as a new child; `new_tree_layer` when the parent was a leaf.
    Attached { new_tree_layer: bool },
    /// Both endpoints already belong to the tree; nothing changed.
    AlreadyPresent,
    /// The edge does not touch the tree.
    Detached,
}

impl Append {
    pub fn success(&self) -> bool {
        !matches!(self, Append::Detached)
    }
}

/// Attach `e` to `tree` by its source if present, else by its target.
pub fn append_to_tree<T: PartialEq + Clone>(tree: &mut StarTree<T>, e: &Edge<T>) -> Append {
    let has_src = tree.contains(&e.src);
    let has_tgt = tree.contains(&e.tgt);
    let (anchor, new_leaf) = match (has_src, has_tgt) {
        (true, true) => return Append::AlreadyPresent,
        (true, false) => (&e.src, &e.tgt),
        (false, true) => (&e.tgt, &e.src),
        (false, false) => return Append::Detached,
    };
    match tree.find_mut(anchor) {
        Some(node) => {
            let new_tree_layer = node.tree.is_empty();
            node.tree.push(StarTree::leaf(new_leaf.clone()));
            Append::Attached { new_tree_layer }
        }
        None => Append::Detached,
    }
}

/// What one edge did to the forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grouping {
    Extended { tree: usize },
    Merged { into: usize, absorbed: usize },
    Started { tree: usize },
    Unchanged { tree: usize },
}

/// Vertex-disjoint forest of star-trees grown one edge at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct StarForest<T> {
    trees: Vec<StarTree<T>>,
}

impl<T> Default for StarForest<T> {
    fn default() -> Self {
        Self { trees: Vec::new() }
    }
}

impl<T: PartialEq + Clone> StarForest<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trees(&self) -> &[StarTree<T>] {
        &self.trees
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Sum of leaves over all trees: one payment per sink.
    pub fn transaction_count(&self) -> usize {
        self.trees.iter().map(count_leaves).sum()
    }

    /// Fold one edge into the forest. The first tree in forest order touching
    /// either endpoint takes the edge. When the far endpoint already lives in a
    /// later tree, that tree is rerooted at the endpoint and grafted on.
    pub fn append(&mut self, e: &Edge<T>) -> Grouping {
        let src_home = self.trees.iter().position(|t| t.contains(&e.src));
        let tgt_home = self.trees.iter().position(|t| t.contains(&e.tgt));
        match (src_home, tgt_home) {
            (Some(i), Some(j)) if i == j => Grouping::Unchanged { tree: i },
            (Some(i), Some(j)) => {
                let (host, host_end, guest, guest_end) =
                    if i < j { (i, &e.src, j, &e.tgt) } else { (j, &e.tgt, i, &e.src) };
                let absorbed = self.trees.remove(guest).reroot(guest_end);
                if let Some(node) = self.trees[host].find_mut(host_end) {
                    node.tree.push(absorbed);
                }
                Grouping::Merged { into: host, absorbed: guest }
            }
            (Some(i), None) | (None, Some(i)) => match append_to_tree(&mut self.trees[i], e) {
                Append::Attached { .. } => Grouping::Extended { tree: i },
                _ => Grouping::Unchanged { tree: i },
            },
            (None, None) => {
                self.trees.push(StarTree { src: e.src.clone(), tree: vec![StarTree::leaf(e.tgt.clone())] });
                Grouping::Started { tree: self.trees.len() - 1 }
            }
        }
    }

    pub fn into_trees(self) -> Vec<StarTree<T>> {
        self.trees
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(a: u32, b: u32) -> Edge<u32> {
        Edge::new(a, b)
    }

    fn sorted(g: &Graph<u32>) -> Vec<(u32, u32)> {
        let mut v: Vec<_> = g.edges.iter().map(|e| (e.src, e.tgt)).collect();
        v.sort();
        v
    }

    #[test]
    fn star_collects_incident_edges_either_way() {
        let g = Graph::new(vec![e(1, 2), e(3, 1), e(2, 3)]);
        let star = star_in_graph(&g, &1);
        assert_eq!(star.rays, vec![e(1, 2), e(3, 1)]);
        assert_eq!(star.leaves(), vec![2, 3]);
    }

    #[test]
    fn components_partition_every_edge_once() {
        let g = Graph::new(vec![e(1, 2), e(5, 6), e(2, 3), e(7, 5), e(3, 1), e(9, 10)]);
        let comps = connected_components(&g);
        assert_eq!(comps.len(), 3);
        assert_eq!(comps.iter().map(Graph::len).sum::<usize>(), g.len());
        for edge in &g.edges {
            let holders = comps.iter().filter(|c| c.edges.contains(edge)).count();
            assert_eq!(holders, 1, "edge {:?} must sit in exactly one component", edge);
        }
    }

    #[test]
    fn edgeless_graph_has_no_components() {
        assert!(connected_components(&Graph::<u32>::default()).is_empty());
        assert!(component_for(&Graph::<u32>::default(), &4).is_empty());
    }

    #[test]
    fn component_is_idempotent() {
        let g = Graph::new(vec![e(1, 2), e(2, 3), e(3, 4), e(4, 2), e(8, 9)]);
        let once = component_for(&g, &3);
        let twice = component_for(&once, &3);
        assert_eq!(sorted(&once), sorted(&twice));
        assert_eq!(once.len(), 4);
    }

    #[test]
    fn spanning_tree_covers_component_without_repeats() {
        let g = Graph::new(vec![e(1, 2), e(2, 3), e(3, 1), e(3, 4), e(7, 8)]);
        let st = spanning_tree(&g, &1);
        let mut values: Vec<u32> = st.tree.values().into_iter().copied().collect();
        values.sort();
        assert_eq!(values, vec![1, 2, 3, 4]);
        assert_eq!(st.used_edges.len(), 4);
        assert!(!st.used_edges.contains(&e(7, 8)));
    }

    #[test]
    fn spanning_tree_of_isolated_root_is_single_node() {
        let g = Graph::new(vec![e(1, 2)]);
        let st = spanning_tree(&g, &5);
        assert_eq!(st.tree, StarTree::leaf(5));
        assert!(st.used_edges.is_empty());
    }

    #[test]
    fn append_attaches_by_either_endpoint() {
        let mut tree = StarTree { src: 1, tree: vec![StarTree::leaf(2)] };
        assert_eq!(append_to_tree(&mut tree, &e(2, 3)), Append::Attached { new_tree_layer: true });
        assert_eq!(append_to_tree(&mut tree, &e(4, 1)), Append::Attached { new_tree_layer: false });
        assert_eq!(append_to_tree(&mut tree, &e(8, 9)), Append::Detached);
        assert_eq!(tree.len(), 4);
        assert!(tree.find(&2).unwrap().tree.contains(&StarTree::leaf(3)));
    }

    #[test]
    fn append_never_duplicates_a_vertex() {
        let mut tree = StarTree { src: 1, tree: vec![StarTree::leaf(2)] };
        assert_eq!(append_to_tree(&mut tree, &e(1, 2)), Append::AlreadyPresent);
        append_to_tree(&mut tree, &e(2, 3));
        assert_eq!(append_to_tree(&mut tree, &e(3, 1)), Append::AlreadyPresent);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn chain_groups_into_single_tree() {
        let mut forest = StarForest::new();
        assert_eq!(forest.append(&e(0, 1)), Grouping::Started { tree: 0 });
        assert_eq!(forest.append(&e(1, 2)), Grouping::Extended { tree: 0 });
        assert_eq!(forest.len(), 1);
        let expected = StarTree { src: 0, tree: vec![StarTree { src: 1, tree: vec![StarTree::leaf(2)] }] };
        assert_eq!(forest.trees()[0], expected);
        assert_eq!(forest.transaction_count(), 1);
    }

    #[test]
    fn bridging_edge_merges_trees() {
        let mut forest = StarForest::new();
        forest.append(&e(1, 2));
        forest.append(&e(3, 4));
        assert_eq!(forest.len(), 2);
        assert_eq!(forest.append(&e(4, 2)), Grouping::Merged { into: 0, absorbed: 1 });
        assert_eq!(forest.len(), 1);
        let tree = &forest.trees()[0];
        assert_eq!(tree.len(), 4);
        // 2 hosts the rerooted {4 -> 3}
        let two = tree.find(&2).unwrap();
        assert_eq!(two.tree, vec![StarTree { src: 4, tree: vec![StarTree::leaf(3)] }]);
    }

    #[test]
    fn reroot_preserves_vertices() {
        let tree = StarTree { src: 1, tree: vec![StarTree { src: 2, tree: vec![StarTree::leaf(3)] }, StarTree::leaf(4)] };
        let re = tree.reroot(&3);
        assert_eq!(re.src, 3);
        let mut vals: Vec<u32> = re.values().into_iter().copied().collect();
        vals.sort();
        assert_eq!(vals, vec![1, 2, 3, 4]);
        assert_eq!(re.find(&1).unwrap().tree, vec![StarTree::leaf(4)]);
    }

    #[test]
    fn leaf_count_drives_transaction_count() {
        let tree = StarTree { src: 1, tree: vec![StarTree::leaf(2), StarTree { src: 3, tree: vec![StarTree::leaf(4), StarTree::leaf(5)] }] };
        assert_eq!(count_leaves(&tree), 3);
        assert_eq!(count_leaves(&StarTree::leaf(9)), 1);
    }
}
