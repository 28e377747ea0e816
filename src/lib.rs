#![doc = include_str!("../README.md")]

mod invalidation;
mod key;
mod memo;
mod runtime;
mod storage;
mod task;
mod tracer;
mod track;
mod transform;
mod verify;

pub use invalidation::{track_reverse_dependencies, ReverseDeps, TrackReverseDependencies};
pub use key::{erased, ErasedKey, ErasedValue, Key};
pub use memo::{memoise, Memoise};
pub use runtime::{run_fetch, run_task, AnnotatedRules, Engine, EngineBuilder, Fetcher, Rules};
pub use storage::{
    DepFingerprints, DepMap, MemoSlots, Slot, SlotClaim, Trace, TraceStore, Version, VersionMap,
};
pub use task::{
    fetch, fetch_erased, trans_fetch, HostRoutine, Resume, Sequential, Step, SubRunner, Task,
};
pub use tracer::{trace_fetch, NoopTracer, TraceFetch, Tracer};
pub use track::{track, track_values, unit_fingerprint, Fingerprint, MakeFingerprint};
pub use transform::{versioned, writer, Versioned, WriteAnnotation, Writer};
pub use verify::{verify_traces, RuleKind, VerifyTraces};
