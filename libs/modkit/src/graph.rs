//! Directed dependency graph keyed by string identifiers.
//!
//! Edges point from a dependent to its dependency (`a -> b` means "a needs b").
//! Traversal is deterministic: roots and neighbours are always visited in
//! lexicographic order, so two runs over the same input produce the same
//! order and report the same cycle.

use std::collections::{BTreeSet, HashMap, VecDeque};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White, // unvisited
    Gray,  // on the current DFS path
    Black, // finished
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    // adjacency lists kept sorted by the target's name
    edges: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node if it does not exist yet; returns its index.
    pub fn add_node(&mut self, id: impl Into<String>) -> usize {
        let id = id.into();
        if let Some(&i) = self.index.get(&id) {
            return i;
        }
        let i = self.nodes.len();
        self.index.insert(id.clone(), i);
        self.nodes.push(id);
        self.edges.push(Vec::new());
        i
    }

    /// Adds `from -> to`. Both nodes must already exist; returns `false` otherwise.
    pub fn add_edge(&mut self, from: &str, to: &str) -> bool {
        let (Some(&f), Some(&t)) = (self.index.get(from), self.index.get(to)) else {
            return false;
        };
        let nodes = &self.nodes;
        let adj = &mut self.edges[f];
        if let Err(pos) = adj.binary_search_by(|&n| nodes[n].as_str().cmp(to)) {
            adj.insert(pos, t);
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of `id`, in lexicographic order.
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| self.edges[i].iter().map(|&n| self.nodes[n].as_str()).collect())
            .unwrap_or_default()
    }

    /// Every node reachable from `id` (excluding `id` itself unless it sits on a cycle).
    pub fn dependency_closure(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return seen;
        };
        let mut stack = self.edges[start].clone();
        while let Some(n) = stack.pop() {
            if seen.insert(self.nodes[n].clone()) {
                stack.extend(self.edges[n].iter().copied());
            }
        }
        seen
    }

    /// Returns the first cycle found as a closed path (`a -> b -> a`), if any.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        self.topo_order().err()
    }

    /// Cycle relevant to `id`: the shortest one passing through it, otherwise
    /// the first one reachable from it. `None` when `id` is unknown or nothing
    /// it depends on is cyclic.
    pub fn cycle_from(&self, id: &str) -> Option<Vec<String>> {
        let &start = self.index.get(id)?;
        self.cycle_through(start).or_else(|| {
            let mut colors = vec![Color::White; self.nodes.len()];
            self.visit(start, &mut colors, &mut Vec::new(), &mut Vec::new()).err()
        })
    }

    // BFS back to `start`, so the reported path is the shortest closed one.
    fn cycle_through(&self, start: usize) -> Option<Vec<String>> {
        let mut parent: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut queue = VecDeque::from([start]);
        while let Some(n) = queue.pop_front() {
            for &next in &self.edges[n] {
                if next == start {
                    let mut path = vec![start];
                    let mut cur = n;
                    while cur != start {
                        path.push(cur);
                        cur = parent[cur]?;
                    }
                    path[1..].reverse();
                    path.push(start);
                    return Some(path.into_iter().map(|i| self.nodes[i].clone()).collect());
                }
                if parent[next].is_none() {
                    parent[next] = Some(n);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Dependency-first order (every node appears after all of its dependencies).
    ///
    /// On a cycle the complete closed path is returned as the error, e.g.
    /// `["a", "b", "c", "a"]`.
    pub fn topo_order(&self) -> Result<Vec<String>, Vec<String>> {
        let mut colors = vec![Color::White; self.nodes.len()];
        let mut path = Vec::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        for start in self.sorted_indices() {
            if colors[start] == Color::White {
                self.visit(start, &mut colors, &mut path, &mut order)?;
            }
        }

        Ok(order.into_iter().map(|i| self.nodes[i].clone()).collect())
    }

    fn visit(
        &self,
        node: usize,
        colors: &mut [Color],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), Vec<String>> {
        colors[node] = Color::Gray;
        path.push(node);

        for &next in &self.edges[node] {
            match colors[next] {
                Color::Gray => {
                    // back edge: the cycle is the path suffix starting at `next`
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|&i| self.nodes[i].clone()).collect();
                    cycle.push(self.nodes[next].clone());
                    return Err(cycle);
                }
                Color::White => self.visit(next, colors, path, order)?,
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        order.push(node);
        Ok(())
    }

    fn sorted_indices(&self) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.nodes.len()).collect();
        idx.sort_by(|&a, &b| self.nodes[a].cmp(&self.nodes[b]));
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for n in nodes {
            g.add_node(*n);
        }
        for (a, b) in edges {
            assert!(g.add_edge(a, b));
        }
        g
    }

    #[test]
    fn dependencies_come_first() {
        let g = graph(&["a", "b"], &[("a", "b")]);
        assert_eq!(g.topo_order().unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn independent_nodes_are_lexicographic() {
        let g = graph(&["zeta", "alpha", "mid"], &[]);
        assert_eq!(g.topo_order().unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn diamond_order_is_stable() {
        let g = graph(
            &["app", "left", "right", "base"],
            &[("app", "left"), ("app", "right"), ("left", "base"), ("right", "base")],
        );
        assert_eq!(g.topo_order().unwrap(), vec!["base", "left", "right", "app"]);
    }

    #[test]
    fn two_node_cycle_reports_both() {
        let g = graph(&["a", "b"], &[("a", "b"), ("b", "a")]);
        let cycle = g.topo_order().unwrap_err();
        assert_eq!(cycle, vec!["a", "b", "a"]);
    }

    #[test]
    fn long_cycle_reports_full_path() {
        let g = graph(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("b", "c"), ("c", "d"), ("d", "b")],
        );
        let cycle = g.find_cycle().expect("cycle");
        assert_eq!(cycle, vec!["b", "c", "d", "b"]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let g = graph(&["a"], &[("a", "a")]);
        assert_eq!(g.find_cycle(), Some(vec!["a".to_string(), "a".to_string()]));
    }

    #[test]
    fn cycle_from_reports_the_cycle_of_that_node() {
        let g = graph(
            &["a", "b", "x", "y", "z", "w"],
            &[("a", "b"), ("b", "a"), ("x", "y"), ("y", "z"), ("z", "x"), ("w", "y")],
        );
        assert_eq!(g.cycle_from("a").unwrap(), vec!["a", "b", "a"]);
        assert_eq!(g.cycle_from("y").unwrap(), vec!["y", "z", "x", "y"]);
        // not on a cycle itself: the one it depends on
        assert_eq!(g.cycle_from("w").unwrap(), vec!["y", "z", "x", "y"]);
        assert!(g.cycle_from("ghost").is_none());
    }

    #[test]
    fn cycle_from_acyclic_node_is_none() {
        let g = graph(&["a", "b"], &[("a", "b")]);
        assert!(g.cycle_from("a").is_none());
    }

    #[test]
    fn edge_to_unknown_node_is_rejected() {
        let mut g = graph(&["a"], &[]);
        assert!(!g.add_edge("a", "ghost"));
        assert!(g.dependencies_of("a").is_empty());
    }

    #[test]
    fn closure_is_transitive() {
        let g = graph(&["a", "b", "c", "d"], &[("a", "b"), ("b", "c")]);
        let closure: Vec<_> = g.dependency_closure("a").into_iter().collect();
        assert_eq!(closure, vec!["b", "c"]);
        assert!(g.dependency_closure("d").is_empty());
    }
}
