//! Directed acyclic transition graphs.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// A static transition table: each state maps to the states it may move to
/// in a single step.
#[derive(Debug, Clone)]
pub struct Dag<S> {
    edges: HashMap<S, Vec<S>>,
}

impl<S: Copy + Eq + Hash> Dag<S> {
    pub fn new(edges: Vec<(S, Vec<S>)>) -> Self {
        Self {
            edges: edges.into_iter().collect(),
        }
    }

    /// Whether `next` is an immediate successor of `current`.
    pub fn is_transition_valid(&self, current: S, next: S) -> bool {
        self.edges
            .get(&current)
            .map(|succ| succ.contains(&next))
            .unwrap_or(false)
    }

    /// All states reachable from `start`, including `start` itself.
    pub fn reachable_from(&self, start: S) -> HashSet<S> {
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(state) = stack.pop() {
            if !visited.insert(state) {
                continue;
            }
            if let Some(succ) = self.edges.get(&state) {
                stack.extend(succ.iter().copied().filter(|s| !visited.contains(s)));
            }
        }
        visited
    }

    /// Whether `to` can be reached from `from` through zero or more steps.
    pub fn is_reachable(&self, from: S, to: S) -> bool {
        self.reachable_from(from).contains(&to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dag<u8> {
        Dag::new(vec![
            (1, vec![2, 3, 5]),
            (2, vec![4, 7]),
            (3, vec![4, 7]),
            (4, vec![5, 6]),
            (7, vec![6]),
        ])
    }

    #[test]
    fn test_reachable_from_root() {
        let dag = sample();
        let got = dag.reachable_from(1);
        let want: HashSet<u8> = [1, 2, 3, 4, 5, 6, 7].into_iter().collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_reachable_from_middle() {
        let dag = sample();
        let want: HashSet<u8> = [3, 4, 5, 6, 7].into_iter().collect();
        assert_eq!(dag.reachable_from(3), want);
    }

    #[test]
    fn test_reachable_from_leaf() {
        let dag = sample();
        let want: HashSet<u8> = [5].into_iter().collect();
        assert_eq!(dag.reachable_from(5), want);
    }

    #[test]
    fn test_immediate_edges_only() {
        let dag = sample();
        assert!(dag.is_transition_valid(1, 2));
        assert!(!dag.is_transition_valid(1, 4));
        assert!(dag.is_reachable(1, 4));
        assert!(!dag.is_reachable(4, 1));
        assert!(!dag.is_transition_valid(6, 6));
    }
}
