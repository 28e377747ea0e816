//! Reverse-dependency tracking and reachability-based invalidation.

use std::sync::Arc;

use crate::key::{ErasedKey, ErasedValue};
use crate::runtime::Rules;
use crate::storage::DepMap;
use crate::task::Task;
use crate::track::{track, unit_fingerprint};

type DependentSet = Arc<ahash::HashSet<ErasedKey>>;

/// Inverted dependency index: `key` is in `dependents(dep)` iff the last
/// recorded execution of `key` fetched `dep`.
///
/// Edges from superseded executions are left in place. Reachability is used
/// conservatively, so stale edges only widen the purge set.
pub struct ReverseDeps {
    edges: DepMap<DependentSet>,
}

impl Default for ReverseDeps {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverseDeps {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            edges: DepMap::new(),
        }
    }

    /// Union `key` into the dependent set of every dep in `deps`.
    pub fn record(&self, key: &ErasedKey, deps: impl IntoIterator<Item = ErasedKey>) {
        for dep in deps {
            self.edges.alter(dep, |current| {
                let mut set = current
                    .map(|set| ahash::HashSet::clone(set))
                    .unwrap_or_default();
                set.insert(key.clone());
                Some(Arc::new(set))
            });
        }
    }

    /// The keys whose last execution fetched `key`.
    pub fn dependents(&self, key: &ErasedKey) -> Vec<ErasedKey> {
        self.edges
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Keys that appear as an edge source.
    pub fn keys(&self) -> Vec<ErasedKey> {
        self.edges.keys()
    }

    /// Number of edge sources.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether no edges are recorded.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Depth-first closure of `root` through the index.
    ///
    /// Returns every key reachable from `root` (`root` included, in visit
    /// order) and removes each visited key as an edge source, so afterwards
    /// the index holds exactly the edges whose sources were not reached.
    /// The returned keys are the ones to purge from memo and trace storage
    /// after `root` changed.
    pub fn reachable(&self, root: &ErasedKey) -> Vec<ErasedKey> {
        let mut visited = ahash::HashSet::default();
        let mut order = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(key) = pending.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            if let Some(dependents) = self.edges.remove(&key) {
                pending.extend(dependents.iter().cloned());
            }
            order.push(key);
        }
        order
    }
}

/// Record reverse dependencies for every execution `rules` performs.
///
/// Each rule task runs under [`track`] with the unit fingerprint (only the
/// set of fetched keys matters) and the observed deps are folded into
/// `reverse`.
pub fn track_reverse_dependencies(
    reverse: Arc<ReverseDeps>,
    rules: Arc<dyn Rules>,
) -> TrackReverseDependencies {
    TrackReverseDependencies { reverse, rules }
}

/// See [`track_reverse_dependencies`].
pub struct TrackReverseDependencies {
    reverse: Arc<ReverseDeps>,
    rules: Arc<dyn Rules>,
}

impl Rules for TrackReverseDependencies {
    fn build(&self, key: &ErasedKey) -> Task<ErasedValue> {
        let reverse = self.reverse.clone();
        let key = key.clone();
        track(unit_fingerprint(), self.rules.build(&key)).map(move |(value, deps)| {
            reverse.record(&key, deps.into_keys());
            value
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{erased, Key};
    use crate::runtime::run_fetch;
    use crate::task::fetch;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct Node(&'static str);

    impl Key for Node {
        type Value = i64;
    }

    fn key(name: &'static str) -> ErasedKey {
        ErasedKey::new(Node(name))
    }

    fn sorted(mut keys: Vec<ErasedKey>) -> Vec<String> {
        let mut names: Vec<String> = keys.drain(..).map(|k| format!("{k:?}")).collect();
        names.sort();
        names
    }

    #[test]
    fn record_builds_the_inverted_view() {
        let rev = ReverseDeps::new();
        rev.record(&key("b"), [key("a")]);
        rev.record(&key("c"), [key("a"), key("b")]);

        assert_eq!(sorted(rev.dependents(&key("a"))), ["Node(\"b\")", "Node(\"c\")"]);
        assert_eq!(sorted(rev.dependents(&key("b"))), ["Node(\"c\")"]);
        assert!(rev.dependents(&key("c")).is_empty());
    }

    #[test]
    fn reachable_returns_the_closure_and_trims_the_index() {
        // a <- b <- c, and a <- c directly (diamond-ish).
        let rev = ReverseDeps::new();
        rev.record(&key("b"), [key("a")]);
        rev.record(&key("c"), [key("a"), key("b")]);
        rev.record(&key("e"), [key("d")]);

        let purged = rev.reachable(&key("a"));
        assert_eq!(
            sorted(purged),
            ["Node(\"a\")", "Node(\"b\")", "Node(\"c\")"]
        );

        // Only the untouched component remains as a source.
        assert_eq!(sorted(rev.keys()), ["Node(\"d\")"]);
        assert_eq!(sorted(rev.dependents(&key("d"))), ["Node(\"e\")"]);
    }

    #[test]
    fn reachable_handles_stale_cycles() {
        let rev = ReverseDeps::new();
        rev.record(&key("b"), [key("a")]);
        rev.record(&key("a"), [key("b")]);

        let purged = rev.reachable(&key("a"));
        assert_eq!(sorted(purged), ["Node(\"a\")", "Node(\"b\")"]);
        assert!(rev.is_empty());
    }

    struct Chain;

    impl Rules for Chain {
        fn build(&self, key: &ErasedKey) -> Task<ErasedValue> {
            let &Node(name) = key.downcast_ref::<Node>().unwrap();
            match name {
                "leaf" => Task::done(erased(1i64)),
                "mid" => fetch(Node("leaf")).map(|n| erased(*n + 1)),
                "top" => fetch(Node("mid")).map(|n| erased(*n + 1)),
                _ => unreachable!("no rule for {name}"),
            }
        }
    }

    #[test]
    fn transformer_records_each_executions_deps() {
        let rev = Arc::new(ReverseDeps::new());
        let rules: Arc<dyn Rules> =
            Arc::new(track_reverse_dependencies(rev.clone(), Arc::new(Chain)));

        assert_eq!(*run_fetch(&rules, Node("top")), 3);

        assert_eq!(sorted(rev.dependents(&key("leaf"))), ["Node(\"mid\")"]);
        assert_eq!(sorted(rev.dependents(&key("mid"))), ["Node(\"top\")"]);

        let purged = rev.reachable(&key("leaf"));
        assert_eq!(
            sorted(purged),
            ["Node(\"leaf\")", "Node(\"mid\")", "Node(\"top\")"]
        );
    }
}
