//! Observational hooks around rule invocation.

use std::sync::Arc;

use crate::key::{ErasedKey, ErasedValue};
use crate::runtime::Rules;
use crate::task::Task;

/// Hooks invoked around every rule the driver resolves.
///
/// All methods default to no-ops, so implementations override only the
/// events they care about. Implementations may be called from several
/// threads at once.
pub trait Tracer: Send + Sync + 'static {
    /// Called before a key's rule task is built and driven.
    #[inline]
    fn on_rule_start(&self, _key: &ErasedKey) {}

    /// Called with the resolved value once the rule task completed.
    #[inline]
    fn on_rule_end(&self, _key: &ErasedKey, _value: &ErasedValue) {}
}

/// Tracer that discards all events.
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Invoke `tracer`'s hooks around every rule `rules` resolves.
///
/// Purely observational: values and dependencies are untouched.
pub fn trace_fetch(tracer: Arc<dyn Tracer>, rules: Arc<dyn Rules>) -> TraceFetch {
    TraceFetch { tracer, rules }
}

/// See [`trace_fetch`].
pub struct TraceFetch {
    tracer: Arc<dyn Tracer>,
    rules: Arc<dyn Rules>,
}

impl Rules for TraceFetch {
    fn build(&self, key: &ErasedKey) -> Task<ErasedValue> {
        let tracer = self.tracer.clone();
        let rules = self.rules.clone();
        let key = key.clone();
        Task::new(move || {
            tracer.on_rule_start(&key);
            rules
                .build(&key)
                .map(move |value| {
                    tracer.on_rule_end(&key, &value);
                    value
                })
                .step()
        })
    }
}
