//! Small rule transformers: side channels and version stamping.

use std::sync::Arc;

use crate::key::{ErasedKey, ErasedValue};
use crate::runtime::{AnnotatedRules, Rules};
use crate::storage::{Version, VersionMap};
use crate::task::Task;

/// Receives the side-channel value a [`Writer`] observed for a key.
pub type WriteAnnotation<W> = Arc<dyn Fn(&ErasedKey, &W) + Send + Sync>;

/// Expose annotated rules as plain rules, feeding every annotation to
/// `write` after the rule produced it.
///
/// The annotation never widens the public key type; it exists only on the
/// inner rules and is consumed here.
pub fn writer<W: Send + 'static>(
    write: WriteAnnotation<W>,
    rules: Arc<dyn AnnotatedRules<W>>,
) -> Writer<W> {
    Writer { write, rules }
}

/// See [`writer`].
pub struct Writer<W> {
    write: WriteAnnotation<W>,
    rules: Arc<dyn AnnotatedRules<W>>,
}

impl<W: Send + 'static> Rules for Writer<W> {
    fn build(&self, key: &ErasedKey) -> Task<ErasedValue> {
        let write = self.write.clone();
        let key = key.clone();
        self.rules.build(&key).map(move |(value, annotation)| {
            write(&key, &annotation);
            value
        })
    }
}

/// Stamp every executed key with `version`.
///
/// Callers compare stamps across runs to detect staleness; the engine never
/// interprets them.
pub fn versioned(versions: Arc<VersionMap>, version: Version, rules: Arc<dyn Rules>) -> Versioned {
    Versioned {
        versions,
        version,
        rules,
    }
}

/// See [`versioned`].
pub struct Versioned {
    versions: Arc<VersionMap>,
    version: Version,
    rules: Arc<dyn Rules>,
}

impl Rules for Versioned {
    fn build(&self, key: &ErasedKey) -> Task<ErasedValue> {
        let versions = self.versions.clone();
        let version = self.version;
        let key = key.clone();
        self.rules.build(&key).map(move |value| {
            versions.record(key, version);
            value
        })
    }
}
