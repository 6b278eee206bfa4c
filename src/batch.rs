use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, channel};
use std::thread::JoinHandle;

use crate::core::{CreateContext, Dynamic, Key};
use crate::created::{CreatedEvent, CreatedResources};
use crate::definition::{AnyDefinition, Definition, Node, Work};
use crate::error::{BatchError, GraphError};
use crate::executor::{Diagnostics, run_group_parallel};
use crate::group::TaskGroup;
use crate::requires::Requires;

/// A registry of resource definitions and the entry point for creating them.
///
/// Definitions are wired up front with [`define`](Self::define), then any
/// subset of them is materialized with [`create`](Self::create),
/// [`create_all`](Self::create_all) or [`create_stream`](Self::create_stream).
/// Dependencies are created before their dependents, independent resources
/// are created in parallel, and a dependency shared by several definitions
/// is created exactly once per batch run.
///
/// The type parameter `E` is a caller-supplied environment handed to every
/// creation closure, typically an API client or credentials.
///
/// # Example
///
/// ```
/// use kumiki::Batch;
///
/// let mut batch = Batch::<()>::new();
///
/// let network = batch
///     .define("network")
///     .create_with(|_| Ok(String::from("vnet")));
/// let vm_a = batch
///     .define("vm-a")
///     .requires(network.clone())
///     .create_with(|_, net| Ok(format!("a@{net}")));
/// let vm_b = batch
///     .define("vm-b")
///     .requires(network.clone())
///     .create_with(|_, net| Ok(format!("b@{net}")));
///
/// let created = batch.create(&[vm_a.clone(), vm_b.clone()], ()).unwrap();
///
/// // The shared network was created once, before either VM.
/// assert_eq!(created.get(vm_a.key()).unwrap(), "a@vnet");
/// assert_eq!(created.get(vm_b.key()).unwrap(), "b@vnet");
/// assert!(created.created_related_resource(network.key()).is_some());
/// ```
pub struct Batch<E: Send + Sync = ()> {
    defined: Vec<AnyDefinition<E>>,
}

impl<E: Send + Sync> Batch<E> {
    pub fn new() -> Self {
        Self {
            defined: Vec::new(),
        }
    }

    /// Starts defining a named resource.
    ///
    /// The definition's [`Key`] is assigned here, before any wiring, so
    /// every clone of the returned handle refers to the same future task.
    /// A builder dropped without calling `create_with` defines nothing.
    pub fn define(&mut self, name: impl Into<Arc<str>>) -> DefinitionBuilder<'_, E> {
        DefinitionBuilder {
            batch: self,
            key: Key::next(),
            name: name.into(),
        }
    }

    /// Every definition registered so far, in definition order.
    pub fn defined(&self) -> &[AnyDefinition<E>] {
        &self.defined
    }

    pub fn len(&self) -> usize {
        self.defined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defined.is_empty()
    }

    /// Creates `roots` and everything they require, failing the whole call
    /// on the first failure.
    ///
    /// Tasks that already ran are not rolled back when a later one fails;
    /// the error only reports the first task whose work returned an error.
    /// Use [`create_all`](Self::create_all) to keep partial results instead.
    ///
    /// # Errors
    /// [`BatchError::Graph`] if the configuration is cyclic, or
    /// [`BatchError::Task`] for the first failed task in completion order.
    pub fn create<T>(
        &self,
        roots: &[Definition<T, E>],
        env: E,
    ) -> Result<CreatedResources<T>, BatchError>
    where
        T: Send + Sync + 'static,
    {
        let mut group = TaskGroup::build(roots)?;
        let diagnostics = run_group_parallel(&mut group, &env, None);
        let created = CreatedResources::collect(&mut group, diagnostics)?;

        if let Some(failure) = created.failures().first() {
            return Err(BatchError::Task {
                name: failure.name.as_ref().into(),
                key: failure.key,
                source: failure.error.clone(),
            });
        }

        Ok(created)
    }

    /// Creates `roots` best effort: a failed task only blocks its own
    /// dependents, every other branch still runs.
    ///
    /// The returned [`CreatedResources`] holds whatever succeeded next to
    /// the failures, skipped tasks and orphans.
    ///
    /// # Errors
    /// Only for a cyclic configuration; task failures are data here.
    pub fn create_all<T>(
        &self,
        roots: &[Definition<T, E>],
        env: E,
    ) -> Result<CreatedResources<T>, GraphError>
    where
        T: Send + Sync + 'static,
    {
        let mut group = TaskGroup::build(roots)?;
        let diagnostics = run_group_parallel(&mut group, &env, None);
        CreatedResources::collect(&mut group, diagnostics)
    }

    /// Creates `roots` best effort on a background thread, emitting a
    /// [`CreatedEvent`] for each resource as it is created.
    ///
    /// The returned stream yields events in completion order and ends when
    /// the run settles. Call [`CreatedStream::finish`] to join the run and
    /// obtain the final [`CreatedResources`].
    ///
    /// # Errors
    /// Only for a cyclic configuration, detected before anything runs.
    pub fn create_stream<T>(
        &self,
        roots: &[Definition<T, E>],
        env: E,
    ) -> Result<CreatedStream<T, E>, GraphError>
    where
        T: Send + Sync + 'static,
        E: 'static,
    {
        let mut group = TaskGroup::build(roots)?;
        let (sender, receiver) = channel();

        let handle = std::thread::spawn(move || {
            let diagnostics = run_group_parallel(&mut group, &env, Some(&sender));
            (group, diagnostics)
        });

        Ok(CreatedStream {
            receiver,
            handle,
            _marker: PhantomData,
        })
    }
}

impl<E: Send + Sync> Default for Batch<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + Sync> std::fmt::Debug for Batch<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("defined", &self.defined.len())
            .finish()
    }
}

/// First stage of [`Batch::define`]: a named definition without wiring yet.
pub struct DefinitionBuilder<'a, E: Send + Sync = ()> {
    batch: &'a mut Batch<E>,
    key: Key,
    name: Arc<str>,
}

impl<'a, E: Send + Sync> DefinitionBuilder<'a, E> {
    /// Declares what this resource requires before it can be created.
    ///
    /// Accepts a single [`Definition`], a tuple of definitions with mixed
    /// output types, or a `Vec` of definitions sharing one output type.
    pub fn requires<D>(self, requires: D) -> DefinitionBinder<'a, E, D>
    where
        D: Requires<E>,
    {
        DefinitionBinder {
            batch: self.batch,
            key: self.key,
            name: self.name,
            requires,
        }
    }

    /// Finishes a dependency-free definition with its creation closure.
    ///
    /// The closure runs on a worker thread during batch execution and
    /// receives the [`CreateContext`] carrying the environment.
    pub fn create_with<T, F>(self, work: F) -> Definition<T, E>
    where
        T: Send + Sync + 'static,
        F: Fn(&CreateContext<'_, E>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        finish(self.batch, self.key, self.name, Vec::new(), move |ctx, _| {
            work(ctx).map(|value| Arc::new(value) as Dynamic)
        })
    }
}

/// Second stage of [`Batch::define`]: wiring declared, awaiting the
/// creation closure.
pub struct DefinitionBinder<'a, E: Send + Sync, D: Requires<E>> {
    batch: &'a mut Batch<E>,
    key: Key,
    name: Arc<str>,
    requires: D,
}

impl<'a, E, D> DefinitionBinder<'a, E, D>
where
    E: Send + Sync,
    D: Requires<E> + Send + Sync + 'static,
{
    /// Finishes the definition with its creation closure.
    ///
    /// The closure receives the created outputs of the declared
    /// requirements, borrowed with their concrete types, in declaration
    /// shape: a single `&T`, a tuple of references, or a `Vec` of them.
    pub fn create_with<T, F>(self, work: F) -> Definition<T, E>
    where
        T: Send + Sync + 'static,
        F: for<'b> Fn(&CreateContext<'b, E>, D::Output<'b>) -> anyhow::Result<T>
            + Send
            + Sync
            + 'static,
    {
        let requires = self.requires;
        let dependencies = requires.definitions();

        finish(
            self.batch,
            self.key,
            self.name,
            dependencies,
            move |ctx, outputs| {
                work(ctx, requires.resolve(outputs)).map(|value| Arc::new(value) as Dynamic)
            },
        )
    }
}

fn finish<T, E, W>(
    batch: &mut Batch<E>,
    key: Key,
    name: Arc<str>,
    requires: Vec<AnyDefinition<E>>,
    work: W,
) -> Definition<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync,
    W: Fn(&CreateContext<'_, E>, &[Dynamic]) -> anyhow::Result<Dynamic> + Send + Sync + 'static,
{
    let node = Arc::new(Node {
        key,
        name,
        requires,
        work: Arc::new(work) as Work<E>,
    });

    let definition = Definition::new(node);
    batch.defined.push(definition.erased());
    definition
}

/// A live batch run emitting [`CreatedEvent`]s as resources come up.
///
/// Iterating yields each created resource in completion order and ends
/// when the run settles. Dropping the stream without iterating or calling
/// [`finish`](Self::finish) detaches the run; it still completes.
pub struct CreatedStream<T, E: Send + Sync = ()> {
    receiver: Receiver<CreatedEvent>,
    handle: JoinHandle<(TaskGroup<E>, Diagnostics)>,
    _marker: PhantomData<T>,
}

impl<T, E> CreatedStream<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync,
{
    /// Waits for the run to settle and assembles the final result.
    ///
    /// Undrained events are discarded; the result indexes every outcome
    /// regardless.
    pub fn finish(self) -> Result<CreatedResources<T>, GraphError> {
        let (mut group, diagnostics) = match self.handle.join() {
            Ok(settled) => settled,
            Err(panic) => std::panic::resume_unwind(panic),
        };

        CreatedResources::collect(&mut group, diagnostics)
    }
}

impl<T, E: Send + Sync> Iterator for CreatedStream<T, E> {
    type Item = CreatedEvent;

    fn next(&mut self) -> Option<CreatedEvent> {
        self.receiver.recv().ok()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::BatchError;

    #[test]
    fn test_shared_dependency_created_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut batch = Batch::<()>::new();

        let network = {
            let counter = counter.clone();
            batch.define("network").create_with(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(String::from("vnet-1"))
            })
        };
        let vm_a = batch
            .define("vm-a")
            .requires(network.clone())
            .create_with(|_, net| Ok(format!("a@{net}")));
        let vm_b = batch
            .define("vm-b")
            .requires(network.clone())
            .create_with(|_, net| Ok(format!("b@{net}")));

        let created = batch.create(&[vm_a.clone(), vm_b.clone()], ()).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(created.is_complete());
        assert_eq!(created.len(), 2);
        assert_eq!(created.get(vm_a.key()).unwrap(), "a@vnet-1");
        assert_eq!(created.get(vm_b.key()).unwrap(), "b@vnet-1");
        assert_eq!(
            created
                .created_related_resource(network.key())
                .unwrap()
                .downcast_ref::<String>()
                .unwrap(),
            "vnet-1"
        );
    }

    #[test]
    fn test_strict_create_fails_on_first_failure() {
        let mut batch = Batch::<()>::new();

        let good = batch.define("good").create_with(|_| Ok(1u32));
        let bad = batch
            .define("bad")
            .requires(good.clone())
            .create_with(|_, _| Err::<u32, _>(anyhow::anyhow!("quota exceeded")));

        let result = batch.create(&[bad], ());

        match result {
            Err(BatchError::Task { name, .. }) => assert_eq!(&*name, "bad"),
            other => panic!("Expected a task error, got {other:?}"),
        }
    }

    #[test]
    fn test_best_effort_keeps_unrelated_branches() {
        let mut batch = Batch::<()>::new();

        let broken_disk = batch
            .define("broken-disk")
            .create_with(|_| Err::<u32, _>(anyhow::anyhow!("no capacity")));
        let vm = batch
            .define("vm")
            .requires(broken_disk.clone())
            .create_with(|_, disk| Ok(*disk));
        let bucket = batch.define("bucket").create_with(|_| Ok(7u32));

        let created = batch.create_all(&[vm.clone(), bucket.clone()], ()).unwrap();

        assert!(!created.is_complete());
        assert_eq!(created.get(bucket.key()), Some(&7));
        assert_eq!(created.get(vm.key()), None);

        assert_eq!(created.failures().len(), 1);
        assert_eq!(created.failures()[0].key, broken_disk.key());

        assert_eq!(created.skipped().len(), 1);
        assert_eq!(created.skipped()[0].key, vm.key());
        assert_eq!(created.skipped()[0].blocked_on, broken_disk.key());
    }

    #[test]
    fn test_stream_emits_dependency_before_dependent() {
        let mut batch = Batch::<()>::new();

        let net = batch.define("net").create_with(|_| Ok(String::from("n")));
        let vm = batch
            .define("vm")
            .requires(net.clone())
            .create_with(|_, n| Ok(format!("vm@{n}")));

        let mut stream = batch.create_stream(&[vm.clone()], ()).unwrap();

        let order: Vec<(String, bool)> = stream
            .by_ref()
            .map(|event| (event.resource.name().to_string(), event.top_level))
            .collect();

        assert_eq!(
            order,
            vec![(String::from("net"), false), (String::from("vm"), true)]
        );

        let created = stream.finish().unwrap();
        assert!(created.is_complete());
        assert_eq!(created.get(vm.key()).unwrap(), "vm@n");
    }

    #[test]
    fn test_stream_omits_failed_and_skipped() {
        let mut batch = Batch::<()>::new();

        let bad = batch
            .define("bad")
            .create_with(|_| Err::<u32, _>(anyhow::anyhow!("down")));
        let child = batch
            .define("child")
            .requires(bad.clone())
            .create_with(|_, n| Ok(*n));
        let lone = batch.define("lone").create_with(|_| Ok(3u32));

        let stream = batch.create_stream(&[child, lone], ()).unwrap();

        let names: HashSet<String> = stream
            .map(|event| event.resource.name().to_string())
            .collect();

        assert_eq!(names, HashSet::from([String::from("lone")]));
    }

    #[test]
    fn test_tuple_requirements_resolve_typed() {
        let mut batch = Batch::<()>::new();

        let count = batch.define("count").create_with(|_| Ok(3usize));
        let label = batch
            .define("label")
            .create_with(|_| Ok(String::from("node")));
        let cluster = batch
            .define("cluster")
            .requires((count.clone(), label.clone()))
            .create_with(|_, (count, label)| {
                Ok((0..*count).map(|i| format!("{label}-{i}")).collect::<Vec<_>>())
            });

        let created = batch.create(&[cluster.clone()], ()).unwrap();

        assert_eq!(
            created.get(cluster.key()).unwrap(),
            &vec![
                String::from("node-0"),
                String::from("node-1"),
                String::from("node-2")
            ]
        );
    }

    #[test]
    fn test_environment_reaches_every_closure() {
        struct Env {
            region: &'static str,
        }

        let mut batch = Batch::<Env>::new();

        let net = batch
            .define("net")
            .create_with(|ctx| Ok(format!("{}/net", ctx.env.region)));
        let vm = batch
            .define("vm")
            .requires(net.clone())
            .create_with(|ctx, net| Ok(format!("{net}+vm/{}", ctx.env.region)));

        let created = batch
            .create(&[vm.clone()], Env { region: "eu-west" })
            .unwrap();

        assert_eq!(created.get(vm.key()).unwrap(), "eu-west/net+vm/eu-west");
    }

    #[test]
    fn test_context_exposes_identity() {
        let mut batch = Batch::<()>::new();

        let task = batch
            .define("identity")
            .create_with(|ctx| Ok(format!("{}:{}", ctx.name(), ctx.key())));

        let created = batch.create(&[task.clone()], ()).unwrap();

        assert_eq!(
            created.get(task.key()).unwrap(),
            &format!("identity:{}", task.key())
        );
    }

    #[test]
    fn test_empty_batch_settles_immediately() {
        let batch = Batch::<()>::new();
        let created = batch.create::<u32>(&[], ()).unwrap();

        assert!(created.is_empty());
        assert!(created.is_complete());
        assert!(created.diagnostics().is_empty());
    }

    #[test]
    fn test_duplicate_roots_collapse() {
        let mut batch = Batch::<()>::new();
        let one = batch.define("one").create_with(|_| Ok(1u32));

        let created = batch.create(&[one.clone(), one.clone()], ()).unwrap();

        assert_eq!(created.len(), 1);
        assert_eq!(created.get(one.key()), Some(&1));
    }

    #[test]
    fn test_duplicate_requirement_positions_share_one_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut batch = Batch::<()>::new();

        let base = {
            let counter = counter.clone();
            batch.define("base").create_with(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(3u32)
            })
        };
        // The same definition at two positions of one requirement set.
        let double = batch
            .define("double")
            .requires((base.clone(), base.clone()))
            .create_with(|_, (a, b)| Ok(*a + *b));

        let created = batch.create(&[double.clone()], ()).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(created.get(double.key()), Some(&6));
    }

    #[test]
    fn test_registry_lists_definitions_in_order() {
        let mut batch = Batch::<()>::new();
        assert!(batch.is_empty());

        let net = batch.define("net").create_with(|_| Ok(1u32));
        let vm = batch
            .define("vm")
            .requires(net.clone())
            .create_with(|_, n| Ok(n + 1));

        assert_eq!(batch.len(), 2);
        let names: Vec<_> = batch.defined().iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["net", "vm"]);
        assert_eq!(batch.defined()[1].key(), vm.key());
    }

    #[test]
    fn test_vec_requirements_resolve_in_order() {
        let mut batch = Batch::<()>::new();

        let shards: Vec<_> = (0..4)
            .map(|i| {
                batch
                    .define(format!("shard-{i}"))
                    .create_with(move |_| Ok(i))
            })
            .collect();
        let merged = batch
            .define("merged")
            .requires(shards.clone())
            .create_with(|_, shards| Ok(shards.into_iter().copied().collect::<Vec<i32>>()));

        let created = batch.create(&[merged.clone()], ()).unwrap();

        assert_eq!(created.get(merged.key()).unwrap(), &vec![0, 1, 2, 3]);
    }
}
