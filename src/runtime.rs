//! Rule sets, the task driver, and the assembled engine.

use std::sync::Arc;

use crate::invalidation::{track_reverse_dependencies, ReverseDeps};
use crate::key::{ErasedKey, ErasedValue, Key};
use crate::memo::memoise;
use crate::storage::{MemoSlots, TraceStore};
use crate::task::{fetch, fetch_erased, Step, SubRunner, Task};
use crate::tracer::{trace_fetch, Tracer};
use crate::track::MakeFingerprint;
use crate::verify::{verify_traces, RuleKind};

/// A rule set: for every key of the family, the task that computes its
/// value.
///
/// Transformers implement this trait by wrapping another rule set, so stacks
/// compose as plain values: `memoise(slots, verify_traces(…))`.
pub trait Rules: Send + Sync + 'static {
    /// The task computing `key`'s value.
    fn build(&self, key: &ErasedKey) -> Task<ErasedValue>;
}

/// Rules whose tasks also produce a side-channel annotation.
///
/// This is the reshaped-family form of [`Rules`]: the key family stays the
/// same but every result is paired with a `W`. Transformers use it to learn
/// something about an execution, such as its [`RuleKind`], without
/// widening the public key type; [`writer`](crate::writer) collapses it back
/// to plain [`Rules`].
pub trait AnnotatedRules<W>: Send + Sync + 'static {
    /// The task computing `key`'s value together with its annotation.
    fn build(&self, key: &ErasedKey) -> Task<(ErasedValue, W)>;
}

/// Drive a task to completion against `rules`.
///
/// A trampoline: `Done` returns; `Fetch` resolves the key by driving its
/// rule task through this same function; `Host` loans the routine a runner
/// bound to the same rules. The driver introduces no parallelism of its
/// own; concurrency enters through [`Task::lift`] routines.
pub fn run_task<A: Send + 'static>(rules: &Arc<dyn Rules>, task: Task<A>) -> A {
    let mut task = task;
    loop {
        match task.step() {
            Step::Done(value) => return value,
            Step::Fetch { key, resume } => {
                let value = run_task(rules, rules.build(&key));
                task = resume(value);
            }
            Step::Host { run, resume } => {
                let runner = RulesRunner {
                    rules: rules.clone(),
                };
                let value = run(&runner);
                task = resume(value);
            }
        }
    }
}

/// Resolve a single typed key through `rules`.
pub fn run_fetch<K: Key>(rules: &Arc<dyn Rules>, key: K) -> Arc<K::Value> {
    run_task(rules, fetch(key))
}

struct RulesRunner {
    rules: Arc<dyn Rules>,
}

impl SubRunner for RulesRunner {
    fn run_erased(&self, task: Task<ErasedValue>) -> ErasedValue {
        run_task(&self.rules, task)
    }
}

/// The capability of any carrier that can resolve a fetch.
pub trait Fetcher {
    /// Resolve an erased key to its value.
    fn fetch_erased(&self, key: ErasedKey) -> ErasedValue;

    /// Resolve a typed key.
    fn fetch<K: Key>(&self, key: K) -> Arc<K::Value>
    where
        Self: Sized,
    {
        match self.fetch_erased(ErasedKey::new(key)).downcast() {
            Ok(value) => value,
            Err(_) => unreachable!("fetched value does not match the key's value type"),
        }
    }
}

/// The standard transformer stack assembled over a host rule set.
///
/// Wiring, outermost first: optional tracing hooks, memoisation
/// (at-most-once per key), reverse-dependency recording, trace verification
/// over the annotated rules. Every store is visible through an accessor and
/// can be supplied up front through the [`EngineBuilder`] to share state
/// across engines (e.g. fresh memo slots per session over long-lived
/// traces).
pub struct Engine {
    rules: Arc<dyn Rules>,
    slots: Arc<MemoSlots>,
    traces: Arc<TraceStore>,
    reverse: Arc<ReverseDeps>,
}

impl Engine {
    /// Start building an engine over annotated rules.
    pub fn builder(
        rules: Arc<dyn AnnotatedRules<RuleKind>>,
        make_fingerprint: MakeFingerprint,
    ) -> EngineBuilder {
        EngineBuilder {
            rules,
            make_fingerprint,
            slots: None,
            traces: None,
            reverse: None,
            tracer: None,
        }
    }

    /// Resolve a typed key through the full stack.
    pub fn fetch<K: Key>(&self, key: K) -> Arc<K::Value> {
        run_fetch(&self.rules, key)
    }

    /// Drive an arbitrary task against the full stack.
    pub fn run<A: Send + 'static>(&self, task: Task<A>) -> A {
        run_task(&self.rules, task)
    }

    /// Purge everything reachable from `key` through the reverse-dependency
    /// index, returning the purged keys (`key` included).
    ///
    /// Call this after an input changed: the next fetch of each purged key
    /// re-executes (or re-verifies) instead of reusing its memo slot.
    pub fn invalidate(&self, key: &ErasedKey) -> Vec<ErasedKey> {
        let purged = self.reverse.reachable(key);
        for key in &purged {
            self.slots.remove(key);
            self.traces.remove(key);
        }
        purged
    }

    /// The composed rule stack, for driving tasks manually.
    pub fn rules(&self) -> Arc<dyn Rules> {
        self.rules.clone()
    }

    /// The memo table.
    pub fn slots(&self) -> &Arc<MemoSlots> {
        &self.slots
    }

    /// The trace store.
    pub fn traces(&self) -> &Arc<TraceStore> {
        &self.traces
    }

    /// The reverse-dependency index.
    pub fn reverse_dependencies(&self) -> &Arc<ReverseDeps> {
        &self.reverse
    }
}

impl Fetcher for Engine {
    fn fetch_erased(&self, key: ErasedKey) -> ErasedValue {
        run_task(&self.rules, fetch_erased(key))
    }
}

/// Builder for [`Engine`]; stores not supplied are freshly allocated.
pub struct EngineBuilder {
    rules: Arc<dyn AnnotatedRules<RuleKind>>,
    make_fingerprint: MakeFingerprint,
    slots: Option<Arc<MemoSlots>>,
    traces: Option<Arc<TraceStore>>,
    reverse: Option<Arc<ReverseDeps>>,
    tracer: Option<Arc<dyn Tracer>>,
}

impl EngineBuilder {
    /// Use an existing memo table.
    pub fn slots(mut self, slots: Arc<MemoSlots>) -> Self {
        self.slots = Some(slots);
        self
    }

    /// Use an existing trace store.
    pub fn traces(mut self, traces: Arc<TraceStore>) -> Self {
        self.traces = Some(traces);
        self
    }

    /// Use an existing reverse-dependency index.
    pub fn reverse_dependencies(mut self, reverse: Arc<ReverseDeps>) -> Self {
        self.reverse = Some(reverse);
        self
    }

    /// Install tracing hooks around every rule the driver resolves.
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Assemble the engine.
    pub fn build(self) -> Engine {
        let slots = self.slots.unwrap_or_default();
        let traces = self.traces.unwrap_or_default();
        let reverse = self.reverse.unwrap_or_default();

        let verified: Arc<dyn Rules> = Arc::new(verify_traces(
            traces.clone(),
            self.make_fingerprint,
            self.rules,
        ));
        let recorded: Arc<dyn Rules> =
            Arc::new(track_reverse_dependencies(reverse.clone(), verified));
        let memoised: Arc<dyn Rules> = Arc::new(memoise(slots.clone(), recorded));
        let rules = match self.tracer {
            Some(tracer) => Arc::new(trace_fetch(tracer, memoised)) as Arc<dyn Rules>,
            None => memoised,
        };

        Engine {
            rules,
            slots,
            traces,
            reverse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::erased;
    use crate::track::unit_fingerprint;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct Doubled(i64);

    impl Key for Doubled {
        type Value = i64;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct Quadrupled(i64);

    impl Key for Quadrupled {
        type Value = i64;
    }

    struct Arithmetic;

    impl Rules for Arithmetic {
        fn build(&self, key: &ErasedKey) -> Task<ErasedValue> {
            if let Some(&Doubled(n)) = key.downcast_ref::<Doubled>() {
                return Task::done(erased(n * 2));
            }
            if let Some(&Quadrupled(n)) = key.downcast_ref::<Quadrupled>() {
                return fetch(Doubled(n)).map(|d| erased(*d * 2));
            }
            unreachable!("no rule for {key:?}")
        }
    }

    impl AnnotatedRules<RuleKind> for Arithmetic {
        fn build(&self, key: &ErasedKey) -> Task<(ErasedValue, RuleKind)> {
            Rules::build(self, key).map(|value| (value, RuleKind::Derived))
        }
    }

    #[test]
    fn driver_resolves_nested_fetches() {
        let rules: Arc<dyn Rules> = Arc::new(Arithmetic);
        assert_eq!(*run_fetch(&rules, Quadrupled(3)), 12);
    }

    #[test]
    fn driver_loans_a_runner_to_host_routines() {
        let rules: Arc<dyn Rules> = Arc::new(Arithmetic);
        let task: Task<i64> = Task::lift(|runner| *runner.fetch(Doubled(5)) + 1);
        assert_eq!(run_task(&rules, task), 11);
    }

    #[test]
    fn engine_fetches_and_invalidates() {
        let engine = Engine::builder(Arc::new(Arithmetic), unit_fingerprint()).build();
        assert_eq!(*engine.fetch(Quadrupled(2)), 8);
        assert!(engine.slots().get(&ErasedKey::new(Doubled(2))).is_some());

        let purged = engine.invalidate(&ErasedKey::new(Doubled(2)));
        assert!(purged.contains(&ErasedKey::new(Doubled(2))));
        assert!(purged.contains(&ErasedKey::new(Quadrupled(2))));
        assert!(engine.slots().get(&ErasedKey::new(Quadrupled(2))).is_none());

        assert_eq!(*engine.fetch(Quadrupled(2)), 8);
    }

    #[test]
    fn engine_is_a_fetcher() {
        let engine = Engine::builder(Arc::new(Arithmetic), unit_fingerprint()).build();
        assert_eq!(*Fetcher::fetch(&engine, Doubled(4)), 8);
    }

    #[test]
    fn engine_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine>();
    }
}
