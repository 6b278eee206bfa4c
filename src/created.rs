use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::core::{ArcStr, Key, Resource};
use crate::diff;
use crate::error::{GraphError, TaskError};
use crate::executor::Diagnostics;
use crate::group::{TaskGroup, TaskOutcome};

/// One task whose work ran and failed.
#[derive(Debug, Clone)]
pub struct CreateFailure {
    pub key: Key,
    pub name: Arc<str>,
    pub error: TaskError,
}

/// One task whose work never ran because a prerequisite did not end up
/// created.
#[derive(Debug, Clone)]
pub struct SkippedTask {
    pub key: Key,
    pub name: Arc<str>,
    pub blocked_on: Key,
}

/// One resource creation observed on a [`CreatedStream`].
///
/// Top-level and incidental dependency resources alike are emitted, in the
/// order they finish.
///
/// [`CreatedStream`]: crate::CreatedStream
#[derive(Debug, Clone)]
pub struct CreatedEvent {
    pub resource: Resource,
    /// Whether the resource was requested top level, as opposed to created
    /// incidentally as a dependency of something else.
    pub top_level: bool,
}

/// The outcome of a batch creation request.
///
/// Maps each successfully created top-level key to its typed resource and
/// keeps a side index of everything else the batch touched: intermediate
/// resources created along the way, failures, skipped branches and orphans.
///
/// # Example
///
/// ```
/// use kumiki::Batch;
///
/// let mut batch = Batch::<()>::new();
/// let net = batch.define("net").create_with(|_| Ok(String::from("vnet-1")));
/// let vm = batch
///     .define("vm")
///     .requires(net.clone())
///     .create_with(|_, net| Ok(format!("vm on {net}")));
///
/// let created = batch.create(&[vm.clone()], ()).unwrap();
/// assert_eq!(created.get(vm.key()).unwrap(), "vm on vnet-1");
///
/// // The network was created incidentally; it is reachable by key.
/// let net_resource = created.created_related_resource(net.key()).unwrap();
/// assert_eq!(net_resource.downcast_ref::<String>().unwrap(), "vnet-1");
/// ```
pub struct CreatedResources<T> {
    resources: HashMap<Key, (ArcStr, Arc<T>)>,
    related: HashMap<Key, Resource>,
    failures: Vec<CreateFailure>,
    skipped: Vec<SkippedTask>,
    orphaned: HashMap<Key, Resource>,
    diagnostics: Diagnostics,
}

impl<T: Send + Sync + 'static> CreatedResources<T> {
    /// Assembles the result view over a settled group, running the orphan
    /// diffing pass.
    pub(crate) fn collect<E: Send + Sync>(
        group: &mut TaskGroup<E>,
        diagnostics: Diagnostics,
    ) -> Result<Self, GraphError> {
        let orphaned = diff::orphans(group)?;

        let mut resources = HashMap::new();
        let mut related = HashMap::new();
        let mut failures = Vec::new();
        let mut skipped = Vec::new();

        for &key in group.completion_order() {
            let Some(outcome) = group.outcome(key) else {
                continue;
            };
            let name: ArcStr = group.name_of(key).unwrap_or("").into();

            match outcome {
                TaskOutcome::Created(resource) => {
                    if group.is_root(key) {
                        let value = resource
                            .downcast::<T>()
                            .expect("Type mismatch in root resource");
                        resources.insert(key, (name, value));
                    } else {
                        related.insert(key, resource.clone());
                    }
                }
                TaskOutcome::Failed(error) => failures.push(CreateFailure {
                    key,
                    name,
                    error: error.clone(),
                }),
                TaskOutcome::Skipped { blocked_on } => skipped.push(SkippedTask {
                    key,
                    name,
                    blocked_on: *blocked_on,
                }),
            }
        }

        Ok(Self {
            resources,
            related,
            failures,
            skipped,
            orphaned,
            diagnostics,
        })
    }

    /// The created top-level resource for `key`, if that request succeeded.
    pub fn get(&self, key: Key) -> Option<&T> {
        self.resources.get(&key).map(|(_, value)| value.as_ref())
    }

    /// A shared handle to the created top-level resource for `key`.
    pub fn get_shared(&self, key: Key) -> Option<Arc<T>> {
        self.resources.get(&key).map(|(_, value)| value.clone())
    }

    /// A resource created incidentally as a dependency, by key.
    ///
    /// Top-level resources are not listed here; use [`get`](Self::get).
    pub fn created_related_resource(&self, key: Key) -> Option<&Resource> {
        self.related.get(&key)
    }

    /// Every incidentally created dependency resource.
    pub fn related(&self) -> impl Iterator<Item = &Resource> + '_ {
        self.related.values()
    }

    /// Iterates over the successfully created top-level resources.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &T)> + '_ {
        self.resources
            .iter()
            .map(|(key, (_, value))| (*key, value.as_ref()))
    }

    /// Keys of the successfully created top-level resources.
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.resources.keys().copied()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.resources.contains_key(&key)
    }

    /// Number of successfully created top-level resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Every task whose work ran and failed, in completion order. The
    /// first entry is the batch's first observed failure.
    pub fn failures(&self) -> &[CreateFailure] {
        &self.failures
    }

    /// Every task skipped because a prerequisite did not end up created.
    pub fn skipped(&self) -> &[SkippedTask] {
        &self.skipped
    }

    /// Resources created for a request that failed, and which no successful
    /// request uses. They exist on the caller's substrate; deleting them or
    /// keeping them is the caller's decision.
    pub fn orphaned(&self) -> impl Iterator<Item = &Resource> + '_ {
        self.orphaned.values()
    }

    pub fn is_orphaned(&self, key: Key) -> bool {
        self.orphaned.contains_key(&key)
    }

    /// Whether every task in the batch ended `Created`.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }

    /// The execution log of the run that produced this result.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// A serializable audit summary of the whole batch.
    pub fn report(&self) -> BatchReport {
        let mut created: Vec<ReportEntry> = self
            .resources
            .iter()
            .map(|(key, (name, _))| ReportEntry {
                key: *key,
                name: name.to_string(),
            })
            .collect();
        created.sort_by_key(|e| e.key);

        let mut related: Vec<ReportEntry> = self
            .related
            .values()
            .map(|r| ReportEntry {
                key: r.key(),
                name: r.name().to_string(),
            })
            .collect();
        related.sort_by_key(|e| e.key);

        let mut orphaned: Vec<ReportEntry> = self
            .orphaned
            .values()
            .map(|r| ReportEntry {
                key: r.key(),
                name: r.name().to_string(),
            })
            .collect();
        orphaned.sort_by_key(|e| e.key);

        BatchReport {
            created,
            related,
            failed: self
                .failures
                .iter()
                .map(|f| FailedEntry {
                    key: f.key,
                    name: f.name.to_string(),
                    error: f.error.to_string(),
                })
                .collect(),
            skipped: self
                .skipped
                .iter()
                .map(|s| SkippedEntry {
                    key: s.key,
                    name: s.name.to_string(),
                    blocked_on: s.blocked_on,
                })
                .collect(),
            orphaned,
        }
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for CreatedResources<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedResources")
            .field("created", &self.resources.len())
            .field("related", &self.related.len())
            .field("failed", &self.failures.len())
            .field("skipped", &self.skipped.len())
            .field("orphaned", &self.orphaned.len())
            .finish()
    }
}

/// A serializable summary of one batch run, for audit logs and external
/// cleanup tooling.
#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub created: Vec<ReportEntry>,
    pub related: Vec<ReportEntry>,
    pub failed: Vec<FailedEntry>,
    pub skipped: Vec<SkippedEntry>,
    pub orphaned: Vec<ReportEntry>,
}

#[derive(Debug, Serialize)]
pub struct ReportEntry {
    pub key: Key,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct FailedEntry {
    pub key: Key,
    pub name: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct SkippedEntry {
    pub key: Key,
    pub name: String,
    pub blocked_on: Key,
}

impl BatchReport {
    /// Serialize the report to a JSON string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
