//! Typed query keys and their erased runtime form.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A query in the engine's open key family.
///
/// Each implementing type is one variant of the family. The key carries the
/// data identifying one unit of work, and `Value` is the result type that
/// unit produces. Keys are compared and hashed on their erased form; two
/// erased keys that compare equal are guaranteed to carry the same `Value`
/// type, which is what makes the typed lookups in
/// [`DepMap`](crate::DepMap) safe.
pub trait Key: Hash + Eq + Clone + Debug + Send + Sync + 'static {
    /// The result type produced for this key.
    type Value: Send + Sync + 'static;
}

/// A type-erased result value.
///
/// Cheap to clone; recovered with `downcast` using the key's type witness.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Erase a typed value for transport through the engine.
pub fn erased<T: Send + Sync + 'static>(value: T) -> ErasedValue {
    Arc::new(value)
}

/// Object-safe face of a [`Key`], used behind [`ErasedKey`].
trait DynKey: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
    fn eq_erased(&self, other: &dyn DynKey) -> bool;
    fn hash_erased(&self, state: &mut dyn Hasher);
    fn fmt_erased(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<K: Key> DynKey for K {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<K>()
    }

    fn eq_erased(&self, other: &dyn DynKey) -> bool {
        other
            .as_any()
            .downcast_ref::<K>()
            .is_some_and(|other| self == other)
    }

    fn hash_erased(&self, mut state: &mut dyn Hasher) {
        // The TypeId keeps keys of different variants with equal payloads
        // from colliding.
        TypeId::of::<K>().hash(&mut state);
        self.hash(&mut state);
    }

    fn fmt_erased(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// An erased key: the form the engine's stores and drivers work with.
///
/// Cheap to clone. Equality and hashing operate on the erased form, and
/// equal erased keys always carry the same value type; the original typed
/// key is recovered with [`downcast_ref`](ErasedKey::downcast_ref).
#[derive(Clone)]
pub struct ErasedKey(Arc<dyn DynKey>);

impl ErasedKey {
    /// Erase a typed key.
    pub fn new<K: Key>(key: K) -> Self {
        Self(Arc::new(key))
    }

    /// Borrow the original typed key, if `K` is its type.
    pub fn downcast_ref<K: Key>(&self) -> Option<&K> {
        self.0.as_any().downcast_ref()
    }

    /// Whether the underlying key is a `K`.
    pub fn is<K: Key>(&self) -> bool {
        self.downcast_ref::<K>().is_some()
    }

    /// Name of the underlying key type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }
}

impl PartialEq for ErasedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_erased(other.0.as_ref())
    }
}

impl Eq for ErasedKey {}

impl Hash for ErasedKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_erased(state);
    }
}

impl Debug for ErasedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_erased(f)
    }
}
