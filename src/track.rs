//! Dependency tracking and fingerprints.

use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use siphasher::sip128::{Hasher128, SipHasher};

use crate::key::{ErasedKey, ErasedValue};
use crate::storage::DepFingerprints;
use crate::task::{fetch_erased, trans_fetch, Task};

/// A compact summary of a dependency's observed value.
///
/// Equal fingerprints must imply the values are interchangeable for caching;
/// [`Fingerprint::of`] derives one from a hash, which satisfies this up to
/// collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Fingerprint(pub u128);

impl Fingerprint {
    /// The fingerprint used when a dependency's value is irrelevant.
    pub const UNIT: Fingerprint = Fingerprint(0);

    /// Hash-derived fingerprint of a value.
    pub fn of<T: Hash + ?Sized>(value: &T) -> Self {
        let mut state = SipHasher::new();
        value.hash(&mut state);
        Fingerprint(state.finish128().as_u128())
    }
}

/// Computes the fingerprint recorded for one (key, value) observation.
///
/// Supplied by the host, which knows how to see through the erased value;
/// a typical implementation downcasts per key variant and calls
/// [`Fingerprint::of`].
pub type MakeFingerprint = Arc<dyn Fn(&ErasedKey, &ErasedValue) -> Fingerprint + Send + Sync>;

/// The fingerprint function that ignores its observation entirely.
///
/// Used where only the *set* of fetched keys matters, as in
/// [`track_reverse_dependencies`](crate::track_reverse_dependencies).
pub fn unit_fingerprint() -> MakeFingerprint {
    Arc::new(|_, _| Fingerprint::UNIT)
}

/// Record every fetch `task` performs.
///
/// Each fetched key still resolves through the driving rules; the observed
/// value is fingerprinted with `make_fingerprint` and merged into an
/// insertion-ordered accumulator, last write wins. The accumulator is shared
/// across parallel branches of the task, so concurrent fetches interleave
/// safely.
pub fn track<A: Send + 'static>(
    make_fingerprint: MakeFingerprint,
    task: Task<A>,
) -> Task<(A, DepFingerprints)> {
    let deps = Arc::new(Mutex::new(DepFingerprints::default()));
    let record = deps.clone();
    trans_fetch(
        Arc::new(move |key: ErasedKey| {
            let make_fingerprint = make_fingerprint.clone();
            let record = record.clone();
            fetch_erased(key.clone()).map(move |value| {
                let fingerprint = make_fingerprint(&key, &value);
                record.lock().insert(key, fingerprint);
                value
            })
        }),
        task,
    )
    .map(move |value| {
        let deps = deps.lock().clone();
        (value, deps)
    })
}

/// Record the raw (key, value) pairs `task` fetches, in observation order.
///
/// Unlike [`track`], repeated fetches of one key appear once per fetch.
pub fn track_values<A: Send + 'static>(task: Task<A>) -> Task<(A, Vec<(ErasedKey, ErasedValue)>)> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    trans_fetch(
        Arc::new(move |key: ErasedKey| {
            let record = record.clone();
            fetch_erased(key.clone()).map(move |value| {
                record.lock().push((key, value.clone()));
                value
            })
        }),
        task,
    )
    .map(move |value| {
        let seen = seen.lock().clone();
        (value, seen)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{erased, Key};
    use crate::task::{fetch, Step};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct Cell(&'static str);

    impl Key for Cell {
        type Value = i64;
    }

    fn drive<A: Send + 'static>(task: Task<A>) -> A {
        let mut task = task;
        loop {
            match task.step() {
                Step::Done(value) => return value,
                Step::Fetch { key, resume } => {
                    let cell = key.downcast_ref::<Cell>().unwrap();
                    task = resume(erased(cell.0.len() as i64));
                }
                Step::Host { .. } => panic!("unexpected host step"),
            }
        }
    }

    fn by_value() -> MakeFingerprint {
        Arc::new(|_, value| Fingerprint(*value.downcast_ref::<i64>().unwrap() as u128))
    }

    #[test]
    fn fingerprints_are_stable_per_value() {
        assert_eq!(Fingerprint::of(&42u32), Fingerprint::of(&42u32));
        assert_ne!(Fingerprint::of(&42u32), Fingerprint::of(&43u32));
    }

    #[test]
    fn records_fetches_in_order() {
        let task = fetch(Cell("a")).zip(fetch(Cell("bb"))).map(|(a, b)| *a + *b);
        let (value, deps) = drive(track(by_value(), task));
        assert_eq!(value, 3);
        let recorded: Vec<_> = deps.iter().map(|(k, f)| (k.clone(), *f)).collect();
        assert_eq!(
            recorded,
            vec![
                (ErasedKey::new(Cell("a")), Fingerprint(1)),
                (ErasedKey::new(Cell("bb")), Fingerprint(2)),
            ]
        );
    }

    #[test]
    fn repeated_fetches_merge_last_write_wins() {
        let task = fetch(Cell("a")).and_then(|_| fetch(Cell("a"))).map(|a| *a);
        let (value, deps) = drive(track(by_value(), task));
        assert_eq!(value, 1);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps.get(&ErasedKey::new(Cell("a"))), Some(&Fingerprint(1)));
    }

    #[test]
    fn untracked_result_is_unchanged() {
        let task = fetch(Cell("abc")).map(|n| *n * 2);
        let bare = drive(fetch(Cell("abc")).map(|n| *n * 2));
        let (tracked, _) = drive(track(by_value(), task));
        assert_eq!(bare, tracked);
    }

    #[test]
    fn value_tracking_keeps_duplicates() {
        let task = fetch(Cell("a")).and_then(|_| fetch(Cell("a"))).map(|a| *a);
        let (_, seen) = drive(track_values(task));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, ErasedKey::new(Cell("a")));
        assert_eq!(*seen[0].1.downcast_ref::<i64>().unwrap(), 1);
    }
}
