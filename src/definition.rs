use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::{ArcStr, CreateContext, Dynamic, Key};

/// The type-erased creation work stored in a graph node.
pub(crate) type Work<E> =
    Arc<dyn Fn(&CreateContext<'_, E>, &[Dynamic]) -> anyhow::Result<Dynamic> + Send + Sync>;

/// One node of the definition graph: identity, declared dependencies and
/// the creation work. Nodes are immutable once built and shared by `Arc`,
/// so a definition graph can never form a cycle.
pub(crate) struct Node<E: Send + Sync> {
    pub(crate) key: Key,
    pub(crate) name: ArcStr,
    pub(crate) requires: Vec<AnyDefinition<E>>,
    pub(crate) work: Work<E>,
}

/// A frozen recipe for one resource with typed output `T`.
///
/// A `Definition<T, E>` is a lightweight, cloneable token that represents a
/// future resource of type `T`. It is used to wire dependencies between
/// resources: when one definition requires another, the group guarantees the
/// required resource is created first and its value is injected into the
/// dependent's creation closure.
///
/// # Shared dependencies
///
/// Definitions dedup by [`Key`]. If resource C and resource B both require
/// resource A, and resource D requires both B and C, then A is created
/// *once* and its value is shared by every dependent.
///
/// # Immutability
///
/// Once [`create_with`] returns, the definition is frozen. Cloning it clones
/// a reference to the same underlying node, never a new task.
///
/// [`create_with`]: crate::DefinitionBuilder::create_with
pub struct Definition<T, E: Send + Sync = ()> {
    pub(crate) node: Arc<Node<E>>,
    _marker: PhantomData<T>,
}

impl<T, E: Send + Sync> Definition<T, E> {
    pub(crate) fn new(node: Arc<Node<E>>) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    /// The process-unique key of this definition.
    pub fn key(&self) -> Key {
        self.node.key
    }

    /// The name given at definition time.
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Drops the output type, keeping only the graph identity.
    pub fn erased(&self) -> AnyDefinition<E> {
        AnyDefinition {
            node: self.node.clone(),
        }
    }
}

impl<T, E> Definition<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync,
{
    /// Borrows a type-erased output back as `T`.
    ///
    /// # Panics
    /// Panics if the output cannot be downcast to `T`, which indicates a
    /// logic error in graph construction; the typed builder makes this
    /// unreachable from safe use.
    pub(crate) fn resolve_ref<'a>(&self, output: &'a Dynamic) -> &'a T {
        output
            .downcast_ref::<T>()
            .expect("Type mismatch in dependency resolution")
    }
}

impl<T, E: Send + Sync> Clone for Definition<T, E> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, E: Send + Sync> std::fmt::Debug for Definition<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Definition")
            .field("key", &self.node.key)
            .field("name", &self.node.name)
            .finish_non_exhaustive()
    }
}

/// A type-erased reference to a definition.
///
/// Used wherever the concrete output type does not matter, such as the
/// dependency lists reported by [`Requires`](crate::Requires).
pub struct AnyDefinition<E: Send + Sync = ()> {
    pub(crate) node: Arc<Node<E>>,
}

impl<E: Send + Sync> AnyDefinition<E> {
    /// The process-unique key of the underlying definition.
    pub fn key(&self) -> Key {
        self.node.key
    }

    /// The name given at definition time.
    pub fn name(&self) -> &str {
        &self.node.name
    }
}

impl<E: Send + Sync> Clone for AnyDefinition<E> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<E: Send + Sync> std::fmt::Debug for AnyDefinition<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyDefinition")
            .field("key", &self.node.key)
            .field("name", &self.node.name)
            .finish_non_exhaustive()
    }
}
