//! The suspendable computation core.
//!
//! A [`Task`] is a computation a driver steps: each step may perform
//! arbitrary work and then yields exactly one [`Step`]: completion, a
//! pending key fetch, or a host routine. Reifying the suspension reasons as
//! an enum (rather than compiler-generated async machinery) is what lets a
//! driver inspect *why* a task stopped and route pending keys through a
//! transformer stack.

use std::sync::Arc;

use crate::key::{erased, ErasedKey, ErasedValue, Key};

/// A suspendable computation producing an `A`.
///
/// Tasks compose with [`map`](Task::map), [`and_then`](Task::and_then) and
/// [`zip`](Task::zip); independent tasks can run concurrently with
/// [`par_zip`](Task::par_zip). A task never resolves its own fetches; that
/// is the driver's job (see [`run_task`](crate::run_task)).
#[must_use = "a task does nothing until a driver steps it"]
pub struct Task<A> {
    next: Box<dyn FnOnce() -> Step<A> + Send>,
}

/// Continuation resumed with the value the driver produced for a suspension.
pub type Resume<A> = Box<dyn FnOnce(ErasedValue) -> Task<A> + Send>;

/// A routine run inside the driver, loaned a [`SubRunner`] for executing
/// sibling tasks against the same rule set.
pub type HostRoutine = Box<dyn FnOnce(&dyn SubRunner) -> ErasedValue + Send>;

/// One step of a task: the reified reasons a computation suspends.
pub enum Step<A> {
    /// The task completed.
    Done(A),
    /// The task needs the value of `key` before it can continue.
    Fetch {
        /// The key whose value is demanded.
        key: ErasedKey,
        /// Continuation, fed the value the driver resolves `key` to.
        resume: Resume<A>,
    },
    /// The task hands a routine back to the driver. The routine receives a
    /// capability to run sub-tasks against the same rules, which is how host
    /// concurrency (spawning, joining) enters a computation.
    Host {
        /// The routine to run.
        run: HostRoutine,
        /// Continuation, fed the routine's result.
        resume: Resume<A>,
    },
}

/// Capability loaned to [`Step::Host`] routines: run a task to completion
/// against the rule set driving the current computation.
pub trait SubRunner: Sync {
    /// Run an erased task to completion.
    fn run_erased(&self, task: Task<ErasedValue>) -> ErasedValue;
}

impl<'r> dyn SubRunner + 'r {
    /// Run a typed task to completion.
    pub fn run<A: Send + Sync + 'static>(&self, task: Task<A>) -> A {
        let value = self.run_erased(task.map(|value| erased(value)));
        match value.downcast::<A>().map(Arc::try_unwrap) {
            Ok(Ok(value)) => value,
            _ => unreachable!("sub-task result lost its type"),
        }
    }

    /// Resolve a single typed key through the driving rules.
    pub fn fetch<K: Key>(&self, key: K) -> Arc<K::Value> {
        self.run(fetch(key))
    }
}

impl<A: Send + 'static> Task<A> {
    /// A completed task.
    pub fn done(value: A) -> Self {
        Self::new(move || Step::Done(value))
    }

    /// Defer work to the next step.
    ///
    /// The closure runs when a driver steps the task, not at construction.
    pub fn new(step: impl FnOnce() -> Step<A> + Send + 'static) -> Self {
        Self {
            next: Box::new(step),
        }
    }

    /// Evaluate this task up to its next suspension.
    pub fn step(self) -> Step<A> {
        (self.next)()
    }

    /// Run `self`, then feed its result to `next` and run that task.
    pub fn and_then<B: Send + 'static>(
        self,
        next: impl FnOnce(A) -> Task<B> + Send + 'static,
    ) -> Task<B> {
        Task::new(move || match self.step() {
            Step::Done(value) => next(value).step(),
            Step::Fetch { key, resume } => Step::Fetch {
                key,
                resume: Box::new(move |value| resume(value).and_then(next)),
            },
            Step::Host { run, resume } => Step::Host {
                run,
                resume: Box::new(move |value| resume(value).and_then(next)),
            },
        })
    }

    /// Map the task's result.
    pub fn map<B: Send + 'static>(self, map: impl FnOnce(A) -> B + Send + 'static) -> Task<B> {
        self.and_then(move |value| Task::done(map(value)))
    }

    /// Pair two tasks, resolving `self` completely before `other`.
    pub fn zip<B: Send + 'static>(self, other: Task<B>) -> Task<(A, B)> {
        self.and_then(move |left| other.map(move |right| (left, right)))
    }
}

impl<A: Send + Sync + 'static> Task<A> {
    /// Hand a routine to the driver.
    ///
    /// The routine runs inside the driver with a [`SubRunner`] bound to the
    /// rules driving this task; it may run sibling tasks, including from
    /// threads it spawns.
    pub fn lift(run: impl FnOnce(&dyn SubRunner) -> A + Send + 'static) -> Self {
        Task::new(move || Step::Host {
            run: Box::new(move |runner| erased(run(runner))),
            resume: Box::new(|value| match value.downcast::<A>().map(Arc::try_unwrap) {
                Ok(Ok(value)) => Task::done(value),
                _ => unreachable!("host routine result lost its type"),
            }),
        })
    }

    /// Pair two independent tasks, running them concurrently.
    ///
    /// Each side runs as its own sub-task on its own thread, against the
    /// rules driving the outer task; the results pair up at the join point.
    /// Produces the same values as [`zip`](Task::zip); only effect
    /// interleaving differs.
    pub fn par_zip<B: Send + Sync + 'static>(self, other: Task<B>) -> Task<(A, B)> {
        Task::lift(move |runner| {
            std::thread::scope(|scope| {
                let left = scope.spawn(move || runner.run(self));
                let right = runner.run(other);
                let left = match left.join() {
                    Ok(left) => left,
                    Err(panic) => std::panic::resume_unwind(panic),
                };
                (left, right)
            })
        })
    }
}

/// Suspend on a typed key.
///
/// The driver resolves the key through its rules and the task resumes with
/// the value. Fetching never executes the query itself.
pub fn fetch<K: Key>(key: K) -> Task<Arc<K::Value>> {
    fetch_erased(ErasedKey::new(key)).map(|value| match value.downcast::<K::Value>() {
        Ok(value) => value,
        Err(_) => unreachable!("fetched value does not match the key's value type"),
    })
}

/// Suspend on an erased key.
pub fn fetch_erased(key: ErasedKey) -> Task<ErasedValue> {
    Task::new(move || Step::Fetch {
        key,
        resume: Box::new(Task::done),
    })
}

/// Rewrite every fetch `task` performs through `interpose`.
///
/// Each `Fetch(key, resume)` becomes `interpose(key)` followed by the
/// original continuation; the interposing task's own fetches surface to the
/// driver as usual. Host routines are threaded through transparently: the
/// loaned runner is wrapped so sub-tasks are rewritten the same way.
pub fn trans_fetch<A: Send + 'static>(
    interpose: Arc<dyn Fn(ErasedKey) -> Task<ErasedValue> + Send + Sync>,
    task: Task<A>,
) -> Task<A> {
    Task::new(move || match task.step() {
        Step::Done(value) => Step::Done(value),
        Step::Fetch { key, resume } => {
            let rest = interpose.clone();
            interpose(key)
                .and_then(move |value| trans_fetch(rest, resume(value)))
                .step()
        }
        Step::Host { run, resume } => {
            let for_routine = interpose.clone();
            let rest = interpose;
            Step::Host {
                run: Box::new(move |runner| {
                    run(&InterposedRunner {
                        interpose: for_routine,
                        runner,
                    })
                }),
                resume: Box::new(move |value| trans_fetch(rest, resume(value))),
            }
        }
    })
}

/// Runner that keeps a fetch interposition alive inside host routines.
struct InterposedRunner<'r> {
    interpose: Arc<dyn Fn(ErasedKey) -> Task<ErasedValue> + Send + Sync>,
    runner: &'r dyn SubRunner,
}

impl SubRunner for InterposedRunner<'_> {
    fn run_erased(&self, task: Task<ErasedValue>) -> ErasedValue {
        self.runner
            .run_erased(trans_fetch(self.interpose.clone(), task))
    }
}

/// A task wrapper whose pairing always goes through [`and_then`](Task::and_then).
///
/// Use it in code generic over a pairing strategy to pin left-to-right
/// evaluation: wrapped tasks are never paired with
/// [`par_zip`](Task::par_zip).
#[must_use = "a task does nothing until a driver steps it"]
pub struct Sequential<A>(pub Task<A>);

impl<A: Send + 'static> Sequential<A> {
    /// A completed task.
    pub fn done(value: A) -> Self {
        Sequential(Task::done(value))
    }

    /// Sequence `self` before `next`.
    pub fn and_then<B: Send + 'static>(
        self,
        next: impl FnOnce(A) -> Sequential<B> + Send + 'static,
    ) -> Sequential<B> {
        Sequential(self.0.and_then(move |value| next(value).0))
    }

    /// Pair two tasks strictly left-to-right.
    pub fn zip<B: Send + 'static>(self, other: Sequential<B>) -> Sequential<(A, B)> {
        Sequential(self.0.zip(other.0))
    }

    /// Unwrap into the plain task.
    pub fn into_task(self) -> Task<A> {
        self.0
    }
}

impl<A: Send + 'static> From<Task<A>> for Sequential<A> {
    fn from(task: Task<A>) -> Self {
        Sequential(task)
    }
}
