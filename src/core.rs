use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// A type-erased, thread-safe container for a created resource value.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// A process-unique identifier for a single resource definition.
///
/// Every definition receives its key the moment [`Batch::define`] is called,
/// before any dependencies are wired up. The key stays stable for the whole
/// lifetime of the definition, so two clones of one definition always refer
/// to the same task, and two parents sharing a dependency resolve to a
/// single creation attempt.
///
/// Keys have no meaning outside the current process. They serialize as plain
/// integers for audit reports.
///
/// [`Batch::define`]: crate::Batch::define
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Key(u64);

impl Key {
    pub(crate) fn next() -> Self {
        Key(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "k#{}", self.0)
    }
}

/// A created resource in type-erased form.
///
/// Resources surface through [`TaskOutcome::Created`], through the event
/// stream, and through the related-resource index of [`CreatedResources`],
/// where the concrete type is no longer statically known. Use
/// [`Resource::downcast_ref`] to get the value back out.
///
/// [`TaskOutcome::Created`]: crate::TaskOutcome::Created
/// [`CreatedResources`]: crate::CreatedResources
#[derive(Clone)]
pub struct Resource {
    pub(crate) key: Key,
    pub(crate) name: ArcStr,
    pub(crate) value: Dynamic,
}

impl Resource {
    /// Wraps an already created value. Manual drivers of a
    /// [`TaskGroup`](crate::TaskGroup) use this to record outcomes
    /// themselves.
    pub fn new(key: Key, name: impl Into<Arc<str>>, value: Dynamic) -> Self {
        Self {
            key,
            name: name.into(),
            value,
        }
    }

    /// The key of the definition this resource was created from.
    pub fn key(&self) -> Key {
        self.key
    }

    /// The human-readable name given at definition time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Borrows the inner value as `T`, or `None` on a type mismatch.
    pub fn downcast_ref<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Returns a shared handle to the inner value as `Arc<T>`, or `None` on
    /// a type mismatch.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("key", &self.key)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The context passed to every creation closure.
///
/// `CreateContext` gives the closure access to the caller's environment,
/// typically whatever client or connection handle the work needs, plus the
/// identity of the task being executed. It is immutable during execution.
///
/// # Type Parameters
///
/// * `E`: The type of the user-defined environment. Must be `Send + Sync`.
pub struct CreateContext<'a, E: Send + Sync = ()> {
    /// Access to the user-defined environment shared across the batch.
    pub env: &'a E,
    pub(crate) key: Key,
    pub(crate) name: &'a str,
}

impl<'a, E: Send + Sync> CreateContext<'a, E> {
    /// The key of the task currently executing.
    pub fn key(&self) -> Key {
        self.key
    }

    /// The name of the task currently executing.
    pub fn name(&self) -> &str {
        self.name
    }
}
