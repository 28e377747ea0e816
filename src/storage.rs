//! Concurrent storage keyed by erased queries.
//!
//! Everything long-lived in the engine lives in one of the maps here: memo
//! slots, recorded traces, version stamps. All of them share [`DepMap`], a
//! lock-free map from [`ErasedKey`] to a caller-chosen value family, with
//! atomic read-modify-write through [`DepMap::alter`]. Stores are allocated
//! by the host and handed to the transformers, which controls lifetime and
//! sharing; there are no hidden globals.

use std::sync::Arc;

use indexmap::IndexMap;
use papaya::{Compute, HashMap, Operation};
use parking_lot::{Condvar, Mutex};

use crate::key::{ErasedKey, ErasedValue, Key};
use crate::track::Fingerprint;

/// Map from erased keys to values of the family `V`.
///
/// Values are cloned out on read, so `V` should be cheap to clone (the
/// stores below all use `Arc`ed or `Copy` values). Iteration order is
/// unspecified.
pub struct DepMap<V> {
    entries: HashMap<ErasedKey, V, ahash::RandomState>,
}

impl<V> Default for DepMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> DepMap<V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }
}

impl<V: Clone + Send + Sync> DepMap<V> {
    /// Look up the value for `key`.
    pub fn get(&self, key: &ErasedKey) -> Option<V> {
        self.entries.pin().get(key).cloned()
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&self, key: ErasedKey, value: V) -> Option<V> {
        self.entries.pin().insert(key, value).cloned()
    }

    /// Remove the value for `key`, returning it.
    pub fn remove(&self, key: &ErasedKey) -> Option<V> {
        self.entries.pin().remove(key).cloned()
    }

    /// Atomically apply `update` to the entry for `key` and return the
    /// previous value.
    ///
    /// `update` receives the current value (if any) and returns the new one;
    /// `None` removes the entry. It may be retried under contention, so it
    /// must be free of side effects.
    pub fn alter<F>(&self, key: ErasedKey, update: F) -> Option<V>
    where
        F: Fn(Option<&V>) -> Option<V>,
    {
        let pinned = self.entries.pin();
        let result = pinned.compute(key, |entry| {
            let next = update(entry.map(|(_, value)| value));
            match (entry, next) {
                (_, Some(next)) => Operation::Insert(next),
                (Some(_), None) => Operation::Remove,
                (None, None) => Operation::Abort(()),
            }
        });
        match result {
            Compute::Inserted(_, _) => None,
            Compute::Updated { old: (_, old), .. } => Some(old.clone()),
            Compute::Removed(_, old) => Some(old.clone()),
            Compute::Aborted(()) => None,
        }
    }

    /// Insert `value` if `key` is vacant; returns the value now present and
    /// whether this call installed it.
    pub fn get_or_insert(&self, key: ErasedKey, value: V) -> (V, bool) {
        let pinned = self.entries.pin();
        let result = pinned.compute(key, |entry| match entry {
            None => Operation::Insert(value.clone()),
            Some((_, existing)) => Operation::Abort(existing.clone()),
        });
        match result {
            Compute::Inserted(_, inserted) => (inserted.clone(), true),
            Compute::Aborted(existing) => (existing, false),
            Compute::Updated { .. } | Compute::Removed(_, _) => unreachable!(),
        }
    }

    /// All keys currently present.
    pub fn keys(&self) -> Vec<ErasedKey> {
        self.entries.pin().keys().cloned().collect()
    }

    /// Snapshot of all entries, in unspecified order.
    pub fn to_list(&self) -> Vec<(ErasedKey, V)> {
        self.entries
            .pin()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.pin().is_empty()
    }
}

impl DepMap<ErasedValue> {
    /// Insert the typed value for `key`.
    pub fn insert_value<K: Key>(&self, key: K, value: K::Value) -> Option<ErasedValue> {
        self.insert(ErasedKey::new(key), Arc::new(value))
    }

    /// Look up the typed value for `key`.
    ///
    /// The downcast always succeeds for values inserted through
    /// [`insert_value`](Self::insert_value): equal erased keys carry the
    /// same value type.
    pub fn value<K: Key>(&self, key: &K) -> Option<Arc<K::Value>> {
        self.get(&ErasedKey::new(key.clone()))
            .and_then(|value| value.downcast().ok())
    }
}

/// One-shot cell guarding at-most-once execution of a rule.
///
/// The task that installs a slot fills it exactly once; every other reader
/// blocks until the fill. A slot abandoned by an unwinding rule is poisoned
/// instead, and readers re-raise.
pub struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

enum SlotState {
    Empty,
    Filled(ErasedValue),
    Poisoned,
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}

impl Slot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
            ready: Condvar::new(),
        }
    }

    /// Fill the slot and wake all readers. A slot is filled at most once.
    pub fn fill(&self, value: ErasedValue) {
        let mut state = self.state.lock();
        match &*state {
            SlotState::Empty => {
                *state = SlotState::Filled(value);
                self.ready.notify_all();
            }
            SlotState::Filled(_) => unreachable!("memo slot filled twice"),
            SlotState::Poisoned => unreachable!("memo slot filled after poisoning"),
        }
    }

    /// Mark an abandoned slot so readers fail instead of blocking forever.
    pub(crate) fn poison(&self) {
        let mut state = self.state.lock();
        if let SlotState::Empty = &*state {
            *state = SlotState::Poisoned;
            self.ready.notify_all();
        }
    }

    /// Read the slot's value, blocking until it is filled.
    ///
    /// # Panics
    ///
    /// Panics if the owning rule unwound before filling the slot.
    pub fn read(&self) -> ErasedValue {
        let mut state = self.state.lock();
        loop {
            match &*state {
                SlotState::Filled(value) => return value.clone(),
                SlotState::Poisoned => {
                    panic!("memo slot poisoned: the owning rule unwound before filling it")
                }
                SlotState::Empty => {}
            }
            self.ready.wait(&mut state);
        }
    }

    /// The value, if already filled.
    pub fn try_read(&self) -> Option<ErasedValue> {
        match &*self.state.lock() {
            SlotState::Filled(value) => Some(value.clone()),
            _ => None,
        }
    }
}

/// The memo table: at most one [`Slot`] per key.
pub struct MemoSlots {
    slots: DepMap<Arc<Slot>>,
}

/// Outcome of [`MemoSlots::claim`].
pub enum SlotClaim {
    /// The caller installed the slot and is responsible for filling it.
    Owner(Arc<Slot>),
    /// The slot already existed; read it (blocking) instead of executing.
    Waiter(Arc<Slot>),
}

impl Default for MemoSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoSlots {
    /// Create an empty memo table.
    pub fn new() -> Self {
        Self {
            slots: DepMap::new(),
        }
    }

    /// Install a fresh slot for `key`, or find the existing one.
    ///
    /// Exactly one concurrent caller per key becomes the owner for the
    /// lifetime of the slot.
    pub fn claim(&self, key: &ErasedKey) -> SlotClaim {
        let fresh = Arc::new(Slot::new());
        let (slot, installed) = self.slots.get_or_insert(key.clone(), fresh);
        if installed {
            SlotClaim::Owner(slot)
        } else {
            SlotClaim::Waiter(slot)
        }
    }

    /// The slot for `key`, if present.
    pub fn get(&self, key: &ErasedKey) -> Option<Arc<Slot>> {
        self.slots.get(key)
    }

    /// Drop the slot for `key`, so the next fetch re-executes.
    pub fn remove(&self, key: &ErasedKey) -> bool {
        self.slots.remove(key).is_some()
    }

    /// Keys with a slot installed.
    pub fn keys(&self) -> Vec<ErasedKey> {
        self.slots.keys()
    }

    /// Number of installed slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is installed.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Recorded dependencies of one execution, in recording order.
pub type DepFingerprints = IndexMap<ErasedKey, Fingerprint, ahash::RandomState>;

/// A recorded execution: the produced value plus the fingerprints of
/// everything it fetched.
#[derive(Clone)]
pub struct Trace {
    /// The value the execution produced.
    pub value: ErasedValue,
    /// Fingerprints of the dependencies it fetched, in fetch order.
    pub deps: Arc<DepFingerprints>,
}

/// Store of recorded executions, one [`Trace`] per key.
pub struct TraceStore {
    traces: DepMap<Trace>,
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            traces: DepMap::new(),
        }
    }

    /// The recorded trace for `key`.
    pub fn lookup(&self, key: &ErasedKey) -> Option<Trace> {
        self.traces.get(key)
    }

    /// Record an execution, replacing any previous trace for `key`.
    pub fn record(&self, key: ErasedKey, value: ErasedValue, deps: DepFingerprints) {
        self.traces.insert(
            key,
            Trace {
                value,
                deps: Arc::new(deps),
            },
        );
    }

    /// Drop the trace for `key`.
    pub fn remove(&self, key: &ErasedKey) -> Option<Trace> {
        self.traces.remove(key)
    }

    /// Keys with a recorded trace.
    pub fn keys(&self) -> Vec<ErasedKey> {
        self.traces.keys()
    }

    /// Number of recorded traces.
    pub fn len(&self) -> usize {
        self.traces.len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
}

/// Monotonically increasing stamp for "when was this key last executed".
///
/// The engine never interprets versions; callers compare them to detect
/// staleness across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Version(pub u64);

/// Map from key to the version of its last execution.
pub struct VersionMap {
    versions: DepMap<Version>,
}

impl Default for VersionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            versions: DepMap::new(),
        }
    }

    /// Stamp `key` with `version`.
    pub fn record(&self, key: ErasedKey, version: Version) {
        self.versions.insert(key, version);
    }

    /// The version `key` was last stamped with.
    pub fn get(&self, key: &ErasedKey) -> Option<Version> {
        self.versions.get(key)
    }

    /// Keys with a recorded version.
    pub fn keys(&self) -> Vec<ErasedKey> {
        self.versions.keys()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct Word(u32);

    impl Key for Word {
        type Value = String;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct Count(u32);

    impl Key for Count {
        type Value = usize;
    }

    #[test]
    fn typed_insert_and_lookup() {
        let map = DepMap::new();
        map.insert_value(Word(1), "one".to_string());
        map.insert_value(Count(1), 1usize);

        assert_eq!(map.value(&Word(1)).as_deref(), Some(&"one".to_string()));
        assert_eq!(map.value(&Count(1)).as_deref(), Some(&1));
        assert_eq!(map.value(&Word(2)), None);
        assert_eq!(map.len(), 2);

        let mut entries = map.to_list();
        entries.sort_by_key(|(key, _)| format!("{key:?}"));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, ErasedKey::new(Count(1)));
        assert_eq!(entries[1].0, ErasedKey::new(Word(1)));
    }

    #[test]
    fn alter_returns_previous_and_applies_update() {
        let map: DepMap<u32> = DepMap::new();
        let key = ErasedKey::new(Word(1));

        // Vacant: update sees None, inserts.
        let previous = map.alter(key.clone(), |current| Some(current.copied().unwrap_or(0) + 1));
        assert_eq!(previous, None);
        assert_eq!(map.get(&key), Some(1));

        // Occupied: update sees the value, previous is returned.
        let previous = map.alter(key.clone(), |current| Some(current.copied().unwrap_or(0) + 1));
        assert_eq!(previous, Some(1));
        assert_eq!(map.get(&key), Some(2));

        // Returning None removes.
        let previous = map.alter(key.clone(), |_| None);
        assert_eq!(previous, Some(2));
        assert_eq!(map.get(&key), None);
        assert!(map.is_empty());
    }

    #[test]
    fn get_or_insert_reports_ownership() {
        let map: DepMap<u32> = DepMap::new();
        let key = ErasedKey::new(Word(1));

        let (value, installed) = map.get_or_insert(key.clone(), 10);
        assert!(installed);
        assert_eq!(value, 10);

        let (value, installed) = map.get_or_insert(key, 20);
        assert!(!installed);
        assert_eq!(value, 10);
    }

    #[test]
    fn slot_read_blocks_until_fill() {
        let slot = Arc::new(Slot::new());
        let reader = {
            let slot = slot.clone();
            std::thread::spawn(move || *slot.read().downcast::<u32>().unwrap())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(slot.try_read().is_none());
        slot.fill(Arc::new(5u32));
        assert_eq!(reader.join().unwrap(), 5);
        assert!(slot.try_read().is_some());
    }

    #[test]
    fn poisoned_slot_panics_readers() {
        let slot = Arc::new(Slot::new());
        let reader = {
            let slot = slot.clone();
            std::thread::spawn(move || slot.read())
        };
        std::thread::sleep(Duration::from_millis(20));
        slot.poison();
        assert!(reader.join().is_err());
    }

    #[test]
    fn claim_has_one_owner() {
        let slots = MemoSlots::new();
        let key = ErasedKey::new(Word(1));
        let first = slots.claim(&key);
        let second = slots.claim(&key);
        assert!(matches!(first, SlotClaim::Owner(_)));
        assert!(matches!(second, SlotClaim::Waiter(_)));
        assert_eq!(slots.len(), 1);

        assert!(slots.remove(&key));
        assert!(matches!(slots.claim(&key), SlotClaim::Owner(_)));
    }

    #[test]
    fn trace_store_round_trip() {
        let traces = TraceStore::new();
        let key = ErasedKey::new(Word(1));
        let mut deps = DepFingerprints::default();
        deps.insert(ErasedKey::new(Count(1)), Fingerprint(9));
        traces.record(key.clone(), Arc::new("one".to_string()), deps);

        let trace = traces.lookup(&key).unwrap();
        assert_eq!(trace.value.downcast_ref::<String>().unwrap(), "one");
        assert_eq!(
            trace.deps.get(&ErasedKey::new(Count(1))),
            Some(&Fingerprint(9))
        );
        assert!(traces.remove(&key).is_some());
        assert!(traces.is_empty());
    }

    #[test]
    fn version_map_stamps() {
        let versions = VersionMap::new();
        let key = ErasedKey::new(Word(1));
        assert_eq!(versions.get(&key), None);
        versions.record(key.clone(), Version(3));
        versions.record(key.clone(), Version(4));
        assert_eq!(versions.get(&key), Some(Version(4)));
    }
}
