//! Dependency Graph
//!
//! Maps each computed var to the set of upstream vars it reads, and each
//! var to the computed vars downstream of it. Built once during schema
//! construction and never mutated afterwards, so all sessions traverse it
//! concurrently with no synchronization.
//!
//! # Invalidation Algorithm
//!
//! When a dispatch pass finishes mutating plain vars, the engine asks
//! `affected_by` for the computed vars to refresh:
//!
//! 1. Walk the reverse edges from every changed var, collecting all
//!    transitively dependent computed vars.
//! 2. Topologically sort the collected set (Kahn's algorithm, restricted
//!    to in-set edges) so a computed var is never evaluated before a
//!    computed var it reads from.
//!
//! Vars with no ordering constraint between them may come out in any
//! order; compute functions are required to be side-effect-free with
//! respect to other vars, so ties are safe.

use std::collections::{HashMap, HashSet, VecDeque};

use smallvec::SmallVec;

use crate::error::SchemaError;
use crate::schema::var::VarId;

/// Immutable dependency edges over a schema's var table.
#[derive(Debug)]
pub struct DepGraph {
    /// Forward edges: var -> upstream vars it reads. Empty for plain vars.
    deps: Vec<SmallVec<[VarId; 4]>>,
    /// Reverse edges: var -> computed vars that read it.
    dependents: Vec<Vec<VarId>>,
}

impl DepGraph {
    /// An edge-less graph over `count` vars. The builder sizes the tables
    /// up front so computed vars may reference vars declared after them.
    pub(crate) fn with_capacity(count: usize) -> Self {
        Self {
            deps: vec![SmallVec::new(); count],
            dependents: vec![Vec::new(); count],
        }
    }

    /// Record the declared dependency edges of a computed var. The edges
    /// are checked for cycles *before* insertion via a reachability walk,
    /// so a failed registration leaves the graph untouched.
    ///
    /// `name` is only used to produce a readable error.
    pub(crate) fn register(
        &mut self,
        id: VarId,
        deps: &[VarId],
        name: &str,
    ) -> Result<(), SchemaError> {
        // A cycle forms iff some declared dependency already reaches `id`
        // through existing forward edges.
        for &dep in deps {
            if dep == id || self.reaches(dep, id) {
                return Err(SchemaError::CyclicDependency {
                    var: name.to_string(),
                });
            }
        }

        for &dep in deps {
            self.dependents[dep.index()].push(id);
        }
        self.deps[id.index()] = SmallVec::from_slice(deps);
        Ok(())
    }

    /// Whether `to` is reachable from `from` along forward (depends-on)
    /// edges.
    fn reaches(&self, from: VarId, to: VarId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(var) = stack.pop() {
            if var == to {
                return true;
            }
            if !seen.insert(var) {
                continue;
            }
            stack.extend(self.deps[var.index()].iter().copied());
        }
        false
    }

    /// Declared upstream vars of `id`.
    pub fn deps_of(&self, id: VarId) -> &[VarId] {
        &self.deps[id.index()]
    }

    /// Computed vars downstream of `id`.
    pub fn dependents_of(&self, id: VarId) -> &[VarId] {
        &self.dependents[id.index()]
    }

    /// Computed vars that must be recomputed after the given vars changed,
    /// in topological order (upstream computed vars first).
    pub fn affected_by(&self, changed: &HashSet<VarId>) -> Vec<VarId> {
        // Collect all transitively dependent computed vars. Only computed
        // vars declare dependencies, so every reverse edge lands on one.
        let mut affected = HashSet::new();
        let mut queue: VecDeque<VarId> = changed.iter().copied().collect();
        while let Some(var) = queue.pop_front() {
            for &dependent in &self.dependents[var.index()] {
                if affected.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }

        // Kahn's algorithm over the affected set, counting only in-set edges.
        let mut in_degree: HashMap<VarId, usize> = HashMap::with_capacity(affected.len());
        let mut ready = VecDeque::new();
        for &var in &affected {
            let degree = self.deps[var.index()]
                .iter()
                .filter(|d| affected.contains(d))
                .count();
            in_degree.insert(var, degree);
            if degree == 0 {
                ready.push_back(var);
            }
        }

        let mut ordered = Vec::with_capacity(affected.len());
        while let Some(var) = ready.pop_front() {
            ordered.push(var);
            for &dependent in &self.dependents[var.index()] {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        debug_assert_eq!(
            ordered.len(),
            affected.len(),
            "graph is acyclic by construction"
        );
        ordered
    }

    pub fn var_count(&self) -> usize {
        self.deps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> VarId {
        VarId(n)
    }

    /// Build a graph from dependency rows in id order.
    fn graph(rows: &[&[u32]]) -> DepGraph {
        let mut g = DepGraph::with_capacity(rows.len());
        for (i, deps) in rows.iter().enumerate() {
            let deps: Vec<VarId> = deps.iter().map(|&d| id(d)).collect();
            g.register(id(i as u32), &deps, &format!("v{i}")).unwrap();
        }
        g
    }

    #[test]
    fn self_edge_is_rejected() {
        let mut g = DepGraph::with_capacity(1);
        let err = g.register(id(0), &[id(0)], "selfish");
        assert!(matches!(err, Err(SchemaError::CyclicDependency { .. })));
    }

    #[test]
    fn two_var_cycle_is_rejected_at_closing_edge() {
        let mut g = DepGraph::with_capacity(2);
        g.register(id(0), &[id(1)], "a").unwrap();
        let err = g.register(id(1), &[id(0)], "b");
        assert!(matches!(err, Err(SchemaError::CyclicDependency { .. })));
        // The failed registration left no partial edges behind.
        assert!(g.deps_of(id(1)).is_empty());
        assert!(g.dependents_of(id(0)).is_empty());
    }

    #[test]
    fn affected_set_is_transitive() {
        // 0 plain -> 1 computed -> 2 computed
        let g = graph(&[&[], &[0], &[1]]);

        let changed = HashSet::from([id(0)]);
        let order = g.affected_by(&changed);
        assert_eq!(order, vec![id(1), id(2)]);
    }

    #[test]
    fn diamond_orders_dependencies_first() {
        // 0 plain; 1, 2 computed from 0; 3 computed from 1 and 2.
        let g = graph(&[&[], &[0], &[0], &[1, 2]]);

        let changed = HashSet::from([id(0)]);
        let order = g.affected_by(&changed);
        assert_eq!(order.len(), 3);
        let pos = |v: VarId| order.iter().position(|&x| x == v).unwrap();
        assert!(pos(id(1)) < pos(id(3)));
        assert!(pos(id(2)) < pos(id(3)));
    }

    #[test]
    fn unrelated_vars_are_untouched() {
        let g = graph(&[&[], &[], &[1]]);

        let changed = HashSet::from([id(0)]);
        assert!(g.affected_by(&changed).is_empty());
    }
}
