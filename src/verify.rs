//! Trace verification: reuse recorded results while their dependencies
//! still fingerprint the same.

use std::sync::Arc;

use crate::key::{ErasedKey, ErasedValue};
use crate::runtime::{AnnotatedRules, Rules};
use crate::storage::TraceStore;
use crate::task::{fetch_erased, Task};
use crate::track::{track, Fingerprint, MakeFingerprint};

/// Whether a rule's result is a pure function of its fetches or extrinsic
/// input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RuleKind {
    /// The result reflects external state. Never recorded: a fetch always
    /// re-invokes the rule (modulo memoisation above this transformer).
    Input,
    /// The result is determined by the values the rule fetched; safe to
    /// record and reuse.
    Derived,
}

/// Wrap annotated rules in trace verification.
///
/// A key with a recorded trace is *verified*: each recorded dependency is
/// fetched again, in recorded order, through the driving stack (so
/// memoisation layered above this transformer still applies) and its fresh
/// fingerprint compared against the recorded one. The first mismatch
/// abandons verification and re-executes the rule in full; if every
/// fingerprint matches, the stored value is returned without running the
/// rule. There is no partial reuse.
///
/// A fresh execution runs under [`track`] and its `(value, deps)` pair
/// replaces the trace atomically, unless the rule reports
/// [`RuleKind::Input`], which is never recorded.
pub fn verify_traces(
    traces: Arc<TraceStore>,
    make_fingerprint: MakeFingerprint,
    rules: Arc<dyn AnnotatedRules<RuleKind>>,
) -> VerifyTraces {
    VerifyTraces {
        traces,
        make_fingerprint,
        rules,
    }
}

/// See [`verify_traces`].
pub struct VerifyTraces {
    traces: Arc<TraceStore>,
    make_fingerprint: MakeFingerprint,
    rules: Arc<dyn AnnotatedRules<RuleKind>>,
}

impl Rules for VerifyTraces {
    fn build(&self, key: &ErasedKey) -> Task<ErasedValue> {
        let ctx = VerifyCtx {
            traces: self.traces.clone(),
            make_fingerprint: self.make_fingerprint.clone(),
            rules: self.rules.clone(),
            key: key.clone(),
        };
        Task::new(move || match ctx.traces.lookup(&ctx.key) {
            None => execute(ctx).step(),
            Some(trace) => {
                let deps: Vec<(ErasedKey, Fingerprint)> = trace
                    .deps
                    .iter()
                    .map(|(dep, fingerprint)| (dep.clone(), *fingerprint))
                    .collect();
                check(ctx, trace.value, deps.into_iter()).step()
            }
        })
    }
}

#[derive(Clone)]
struct VerifyCtx {
    traces: Arc<TraceStore>,
    make_fingerprint: MakeFingerprint,
    rules: Arc<dyn AnnotatedRules<RuleKind>>,
    key: ErasedKey,
}

/// Fetch the remaining recorded deps one by one; bail to [`execute`] on the
/// first fingerprint mismatch.
fn check(
    ctx: VerifyCtx,
    stored: ErasedValue,
    mut deps: std::vec::IntoIter<(ErasedKey, Fingerprint)>,
) -> Task<ErasedValue> {
    match deps.next() {
        None => Task::done(stored),
        Some((dep, recorded)) => fetch_erased(dep.clone()).and_then(move |value| {
            if (ctx.make_fingerprint)(&dep, &value) == recorded {
                check(ctx, stored, deps)
            } else {
                execute(ctx)
            }
        }),
    }
}

/// Run the rule under tracking and record the outcome if it is derivable.
fn execute(ctx: VerifyCtx) -> Task<ErasedValue> {
    let task = ctx.rules.build(&ctx.key);
    track(ctx.make_fingerprint.clone(), task).map(move |((value, kind), deps)| {
        if kind == RuleKind::Derived {
            ctx.traces.record(ctx.key, value.clone(), deps);
        }
        value
    })
}
