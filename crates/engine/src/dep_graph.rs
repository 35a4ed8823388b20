//! Per-layer dependency graph for setting derivations.
//!
//! Tracks which inputs (local setting values, global settings, helper
//! lookups) each derivation target (a setting's available-value set, or
//! a helper node) read on its most recent run.
//!
//! # Edge Direction
//!
//! ```text
//! A → B  means  "B depends on A"  (A is a precedent of B)
//! ```
//!
//! Edges are discovered dynamically: each run of a target's function
//! records its reads, and `replace_edges` swaps the target's precedent
//! set atomically. This makes "what re-runs if X changes?" trivial:
//! follow outgoing edges.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::setting::SettingKey;

/// Index of a registered helper dependency within one layer.
pub type HelperId = usize;

/// An input a derivation function can read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepNode {
    /// A local setting's effective value.
    LocalValue(SettingKey),
    /// A global setting on the root manager.
    Global(String),
    /// A memoized helper dependency's resolved value.
    Helper(HelperId),
}

/// A derivation target: something the engine recomputes when its
/// precedents change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GraphTarget {
    /// The available-value set of a local setting.
    Available(SettingKey),
    /// A helper dependency node.
    Helper(HelperId),
}

impl GraphTarget {
    /// The node a target feeds when its output changes.
    ///
    /// An available-set change can rewrite the setting's value through
    /// the fix-up policy, so it feeds `LocalValue`; a helper feeds its
    /// own `Helper` node.
    pub fn output_node(&self) -> DepNode {
        match self {
            GraphTarget::Available(key) => DepNode::LocalValue(*key),
            GraphTarget::Helper(id) => DepNode::Helper(*id),
        }
    }
}

/// Dependency graph over one layer's derivation targets.
///
/// Maintains bidirectional adjacency for O(1) lookups:
/// - `preds[T]` = nodes T read on its last run (precedents)
/// - `succs[N]` = targets whose last run read N (dependents)
///
/// # Invariants
///
/// 1. **Bidirectional consistency:** if N ∈ preds[T] then T ∈ succs[N],
///    and vice versa.
/// 2. **No dangling entries:** empty sets are removed, not stored.
/// 3. **Atomic updates:** `replace_edges` is the only mutator.
#[derive(Default, Debug, Clone)]
pub struct DepGraph {
    preds: FxHashMap<GraphTarget, FxHashSet<DepNode>>,
    succs: FxHashMap<DepNode, FxHashSet<GraphTarget>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes the target read on its last run.
    pub fn precedents(&self, target: GraphTarget) -> impl Iterator<Item = &DepNode> + '_ {
        self.preds.get(&target).into_iter().flat_map(|s| s.iter())
    }

    /// Targets that read this node on their last run, sorted for
    /// deterministic iteration.
    pub fn dependents(&self, node: &DepNode) -> Vec<GraphTarget> {
        let mut targets: Vec<GraphTarget> = self
            .succs
            .get(node)
            .into_iter()
            .flat_map(|s| s.iter().copied())
            .collect();
        targets.sort();
        targets
    }

    pub fn target_count(&self) -> usize {
        self.preds.len()
    }

    /// Replace all edges for a target atomically.
    ///
    /// Pass an empty set to clear the target's edges entirely.
    pub fn replace_edges(&mut self, target: GraphTarget, new_preds: FxHashSet<DepNode>) {
        if let Some(old_preds) = self.preds.remove(&target) {
            for pred in old_preds {
                if let Some(deps) = self.succs.get_mut(&pred) {
                    deps.remove(&target);
                    if deps.is_empty() {
                        self.succs.remove(&pred);
                    }
                }
            }
        }

        if new_preds.is_empty() {
            return;
        }

        for pred in &new_preds {
            self.succs.entry(pred.clone()).or_default().insert(target);
        }
        self.preds.insert(target, new_preds);
    }

    pub fn clear_target(&mut self, target: GraphTarget) {
        self.replace_edges(target, FxHashSet::default());
    }

    /// All targets transitively affected by the given changed nodes, in
    /// dependency order (precedents before dependents).
    ///
    /// Kahn's algorithm restricted to the affected subgraph, with
    /// sorted tie-breaking for determinism. Should a cycle exist among
    /// the affected targets (mutually derived settings), the cyclic
    /// remainder is appended in sorted order rather than dropped; the
    /// caller's bounded settle loop keeps that from diverging.
    pub fn affected_in_order(&self, changed: &[DepNode]) -> Vec<GraphTarget> {
        // Transitive closure over succs.
        let mut affected: FxHashSet<GraphTarget> = FxHashSet::default();
        let mut stack: Vec<DepNode> = changed.to_vec();
        while let Some(node) = stack.pop() {
            for target in self.dependents(&node) {
                if affected.insert(target) {
                    stack.push(target.output_node());
                }
            }
        }
        if affected.is_empty() {
            return Vec::new();
        }

        // In-degree counted only over edges internal to the affected set.
        let internal_preds = |t: GraphTarget| -> Vec<GraphTarget> {
            let mut preds: Vec<GraphTarget> = affected
                .iter()
                .copied()
                .filter(|p| {
                    *p != t
                        && self
                            .preds
                            .get(&t)
                            .is_some_and(|set| set.contains(&p.output_node()))
                })
                .collect();
            preds.sort();
            preds
        };

        let mut in_degree: FxHashMap<GraphTarget, usize> = FxHashMap::default();
        for &t in &affected {
            in_degree.insert(t, internal_preds(t).len());
        }

        let mut queue: Vec<GraphTarget> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&t, _)| t)
            .collect();
        // Descending sort so the smallest target is popped first.
        queue.sort_by(|a, b| b.cmp(a));

        let mut order = Vec::with_capacity(affected.len());
        while let Some(target) = queue.pop() {
            order.push(target);
            let out = target.output_node();
            if let Some(deps) = self.succs.get(&out) {
                let mut released: Vec<GraphTarget> = Vec::new();
                for dep in deps {
                    if affected.contains(dep) {
                        if let Some(deg) = in_degree.get_mut(dep) {
                            *deg = deg.saturating_sub(1);
                            if *deg == 0 {
                                released.push(*dep);
                            }
                        }
                    }
                }
                released.sort();
                for t in released.into_iter().rev() {
                    queue.push(t);
                }
            }
        }

        if order.len() < affected.len() {
            let mut rest: Vec<GraphTarget> = affected
                .into_iter()
                .filter(|t| !order.contains(t))
                .collect();
            rest.sort();
            order.extend(rest);
        }

        order
    }

    /// Check all invariants. Panics if any are violated.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        for (target, preds) in &self.preds {
            assert!(!preds.is_empty(), "empty preds set stored for {target:?}");
            for pred in preds {
                assert!(
                    self.succs.get(pred).is_some_and(|s| s.contains(target)),
                    "missing succ edge: {pred:?} should list {target:?}"
                );
            }
        }
        for (node, targets) in &self.succs {
            assert!(!targets.is_empty(), "empty succs set stored for {node:?}");
            for target in targets {
                assert!(
                    self.preds.get(target).is_some_and(|s| s.contains(node)),
                    "missing pred edge: {target:?} should list {node:?}"
                );
            }
        }
    }
}
