use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use crate::core::{Key, Resource};
use crate::definition::{Definition, Node};
use crate::error::{GraphError, TaskError};

/// Per-pass scheduling state of one task.
///
/// The state advances `Pending -> Ready -> Running -> Completed -> Reported`
/// within a single pass and is reset by [`TaskGroup::prepare`] or
/// [`TaskGroup::prepare_for`]. The recorded [`TaskOutcome`] is independent
/// of this cycle: once written it survives any number of later passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting on at least one prerequisite in the current pass.
    Pending,
    /// All prerequisites reported; queued for [`TaskGroup::get_next`].
    Ready,
    /// Handed out by [`TaskGroup::get_next`], not yet completed.
    Running,
    /// Outcome recorded, completion not yet reported.
    Completed,
    /// Completion reported; dependents were unlocked.
    Reported,
}

/// The permanent record of what happened to one task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The work ran and produced a resource.
    Created(Resource),
    /// The work ran and failed.
    Failed(TaskError),
    /// The work never ran because the named prerequisite did not end up
    /// `Created`. The branch is incomplete, not cancelled.
    Skipped { blocked_on: Key },
}

impl TaskOutcome {
    /// Whether this outcome carries a created resource.
    pub fn is_created(&self) -> bool {
        matches!(self, TaskOutcome::Created(_))
    }

    /// The created resource, or `None` for failures and skips.
    pub fn created(&self) -> Option<&Resource> {
        match self {
            TaskOutcome::Created(resource) => Some(resource),
            _ => None,
        }
    }
}

pub(crate) struct TaskEntry<E: Send + Sync> {
    pub(crate) node: Arc<Node<E>>,
    state: TaskState,
    outcome: Option<TaskOutcome>,
    pending: usize,
    in_scope: bool,
}

impl<E: Send + Sync> TaskEntry<E> {
    fn new(node: Arc<Node<E>>) -> Self {
        Self {
            node,
            state: TaskState::Pending,
            outcome: None,
            pending: 0,
            in_scope: false,
        }
    }
}

/// The dependency graph for one batch of resource creations.
///
/// A `TaskGroup` is built once from the requested top-level definitions. It
/// flattens the definition closure into a directed graph, collapsing shared
/// dependencies by [`Key`] so each definition appears exactly once, and it
/// rejects cyclic configurations up front.
///
/// # The pull protocol
///
/// The group schedules but never executes. A driver walks it:
///
/// 1. [`prepare`](Self::prepare) (or [`prepare_for`](Self::prepare_for))
///    begins a pass and seeds the ready queue.
/// 2. [`get_next`](Self::get_next) hands out a ready task, or `None` if
///    nothing is ready until more completions are reported.
/// 3. The driver runs the work, then records it with
///    [`complete`](Self::complete).
/// 4. [`report_completion`](Self::report_completion) unlocks dependents,
///    which makes further `get_next` calls productive.
///
/// This split lets a caller drive the graph synchronously in a loop, or fan
/// ready tasks out to worker threads and funnel completions back, which is
/// what [`Batch`](crate::Batch) does.
///
/// Outcomes are frozen on first write. Re-walking a settled group hands out
/// every task again without disturbing any recorded outcome, which is how
/// the orphan diffing pass replays subtrees after the fact.
pub struct TaskGroup<E: Send + Sync = ()> {
    graph: Graph<TaskEntry<E>, ()>,
    index: HashMap<Key, NodeIndex>,
    roots: Vec<Key>,
    ready: VecDeque<NodeIndex>,
    scope_len: usize,
    reported: usize,
    completed: Vec<Key>,
}

impl<E: Send + Sync> TaskGroup<E> {
    /// Flattens the dependency closure of `roots` into a task graph.
    ///
    /// Shared dependencies collapse into a single task. Listing the same
    /// root twice yields one task and one result entry.
    ///
    /// # Errors
    /// Returns [`GraphError::Cycle`] for a cyclic configuration. This is
    /// checked here so a bad graph fails before any creation begins.
    pub fn build<T>(roots: &[Definition<T, E>]) -> Result<Self, GraphError>
    where
        T: Send + Sync + 'static,
    {
        let mut group = Self {
            graph: Graph::new(),
            index: HashMap::new(),
            roots: Vec::new(),
            ready: VecDeque::new(),
            scope_len: 0,
            reported: 0,
            completed: Vec::new(),
        };

        for root in roots {
            group.intern(&root.node);
            let key = root.key();
            if !group.roots.contains(&key) {
                group.roots.push(key);
            }
        }

        // Toposort is run purely to reject cyclic configurations before
        // execution. A definition closure cannot express a cycle on its
        // own, but ordering links added later can.
        group.ensure_acyclic()?;

        Ok(group)
    }

    fn intern(&mut self, node: &Arc<Node<E>>) -> NodeIndex {
        // Explicit worklist: dependency chains can be arbitrarily deep,
        // so the flattening must not recurse. A node is interned only
        // once every dependency is, which keeps edge insertion a lookup.
        let mut pending = vec![node.clone()];

        while let Some(current) = pending.last().cloned() {
            if self.index.contains_key(&current.key) {
                pending.pop();
                continue;
            }

            let missing: Vec<Arc<Node<E>>> = current
                .requires
                .iter()
                .filter(|dep| !self.index.contains_key(&dep.key()))
                .map(|dep| dep.node.clone())
                .collect();

            if !missing.is_empty() {
                pending.extend(missing);
                continue;
            }

            pending.pop();
            let index = self.graph.add_node(TaskEntry::new(current.clone()));
            self.index.insert(current.key, index);

            // Edges point from a dependency to its dependent. A dependency
            // listed twice contributes one edge; the duplicate still
            // resolves by position when inputs are assembled.
            for dep in &current.requires {
                self.graph.update_edge(self.index[&dep.key()], index, ());
            }
        }

        self.index[&node.key]
    }

    fn ensure_acyclic(&self) -> Result<(), GraphError> {
        match toposort(&self.graph, None) {
            Ok(_) => Ok(()),
            Err(cycle) => Err(GraphError::Cycle(
                self.graph[cycle.node_id()].node.name.as_ref().into(),
            )),
        }
    }

    /// Adds an ordering-only constraint: `before` must report completion
    /// before `after` becomes ready. No value flows along the edge.
    ///
    /// # Errors
    /// Rejects unknown keys, self references, and any link that would close
    /// a cycle. A rejected link leaves the graph unchanged.
    pub fn link(&mut self, before: Key, after: Key) -> Result<(), GraphError> {
        let a = self.idx(before)?;
        let b = self.idx(after)?;

        if a == b {
            return Err(GraphError::SelfLink(
                self.graph[a].node.name.as_ref().into(),
            ));
        }

        let edge = self.graph.update_edge(a, b, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(GraphError::Cycle(
                self.graph[b].node.name.as_ref().into(),
            ));
        }

        Ok(())
    }

    /// Begins a pass over the whole group.
    ///
    /// Per-pass state resets and every task with no prerequisites becomes
    /// ready. Frozen outcomes are untouched, so preparing a settled group
    /// sets up a pure replay.
    pub fn prepare(&mut self) {
        self.ready.clear();
        self.reported = 0;
        self.scope_len = self.graph.node_count();

        for index in self.graph.node_indices() {
            self.graph[index].in_scope = true;
        }

        self.seed();
    }

    /// Begins a pass over the dependency closure of `root` only: the root
    /// itself and everything it transitively requires.
    pub fn prepare_for(&mut self, root: Key) -> Result<(), GraphError> {
        let start = self.idx(root)?;

        let mut scope = HashSet::new();
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        while let Some(index) = dfs.next(reversed) {
            scope.insert(index);
        }

        self.ready.clear();
        self.reported = 0;
        self.scope_len = scope.len();

        for index in self.graph.node_indices() {
            self.graph[index].in_scope = scope.contains(&index);
        }

        self.seed();
        Ok(())
    }

    fn seed(&mut self) {
        for index in self.graph.node_indices() {
            if !self.graph[index].in_scope {
                continue;
            }

            let pending = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter(|dep| self.graph[*dep].in_scope)
                .count();

            let entry = &mut self.graph[index];
            entry.pending = pending;
            if pending == 0 {
                entry.state = TaskState::Ready;
                self.ready.push_back(index);
            } else {
                entry.state = TaskState::Pending;
            }
        }
    }

    /// Pulls the next ready task, marking it `Running`.
    ///
    /// `None` means no task can run until more completions are reported. If
    /// the group [`is_settled`](Self::is_settled), the pass is over.
    pub fn get_next(&mut self) -> Option<Key> {
        let index = self.ready.pop_front()?;
        let entry = &mut self.graph[index];
        entry.state = TaskState::Running;
        Some(entry.node.key)
    }

    /// Records the outcome of a task. First write wins.
    ///
    /// Returns `Ok(true)` when the outcome was recorded and `Ok(false)`
    /// when the task already had a frozen outcome, in which case nothing
    /// changes. This is what makes re-driving a settled group idempotent.
    pub fn complete(&mut self, key: Key, outcome: TaskOutcome) -> Result<bool, GraphError> {
        let index = self.idx(key)?;
        let entry = &mut self.graph[index];

        if entry.outcome.is_some() {
            return Ok(false);
        }

        entry.outcome = Some(outcome);
        entry.state = TaskState::Completed;
        self.completed.push(key);
        Ok(true)
    }

    /// Reports a completion, unlocking dependents whose prerequisites are
    /// now all reported.
    ///
    /// Requires a recorded outcome. Reporting the same task twice within a
    /// pass is a no-op, and a settled group can be prepared and re-reported
    /// any number of times.
    pub fn report_completion(&mut self, key: Key) -> Result<(), GraphError> {
        let index = self.idx(key)?;
        let entry = &mut self.graph[index];

        if entry.state == TaskState::Reported {
            return Ok(());
        }
        if entry.outcome.is_none() {
            return Err(GraphError::NotCompleted(entry.node.name.as_ref().into()));
        }

        entry.state = TaskState::Reported;
        self.reported += 1;

        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();

        for dependent in dependents {
            let entry = &mut self.graph[dependent];
            if !entry.in_scope {
                continue;
            }
            entry.pending -= 1;
            if entry.pending == 0 && entry.state == TaskState::Pending {
                entry.state = TaskState::Ready;
                self.ready.push_back(dependent);
            }
        }

        Ok(())
    }

    /// Whether every task in the current pass has reported completion.
    pub fn is_settled(&self) -> bool {
        self.reported == self.scope_len
    }

    /// The frozen outcome of a task, if one was recorded.
    pub fn outcome(&self, key: Key) -> Option<&TaskOutcome> {
        let index = *self.index.get(&key)?;
        self.graph[index].outcome.as_ref()
    }

    /// The per-pass scheduling state of a task.
    pub fn state(&self, key: Key) -> Option<TaskState> {
        let index = *self.index.get(&key)?;
        Some(self.graph[index].state)
    }

    /// The keys of every prerequisite of `key`: declared dependencies and
    /// ordering links alike. Drivers use this to decide whether a pulled
    /// task can run or must be skipped.
    pub fn prerequisites(&self, key: Key) -> Vec<Key> {
        let Some(&index) = self.index.get(&key) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|dep| self.graph[dep].node.key)
            .collect()
    }

    /// The requested top-level keys, in request order, deduped.
    pub fn root_keys(&self) -> &[Key] {
        &self.roots
    }

    pub fn is_root(&self, key: Key) -> bool {
        self.roots.contains(&key)
    }

    /// The name a task was defined with.
    pub fn name_of(&self, key: Key) -> Option<&str> {
        let index = *self.index.get(&key)?;
        Some(&self.graph[index].node.name)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.index.contains_key(&key)
    }

    /// Every key in the group, in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.graph.node_indices().map(|i| self.graph[i].node.key)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Keys in the order their outcomes were recorded.
    pub(crate) fn completion_order(&self) -> &[Key] {
        &self.completed
    }

    pub(crate) fn node_of(&self, key: Key) -> Option<&Arc<Node<E>>> {
        let index = *self.index.get(&key)?;
        Some(&self.graph[index].node)
    }

    fn idx(&self, key: Key) -> Result<NodeIndex, GraphError> {
        self.index
            .get(&key)
            .copied()
            .ok_or(GraphError::UnknownKey(key))
    }
}

impl<E: Send + Sync> std::fmt::Display for TaskGroup<E> {
    /// Renders the group as a Mermaid diagram, coloring tasks by outcome
    /// once outcomes exist.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let entry = &self.graph[index];
            let name = entry.node.name.replace('"', "\\\""); // Simple escape
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_indices() {
            let (source, target) = self.graph.edge_endpoints(edge).unwrap();
            writeln!(f, "    {:?} --> {:?}", source.index(), target.index())?;
        }

        for index in self.graph.node_indices() {
            let color = match self.graph[index].outcome {
                Some(TaskOutcome::Created(_)) => "#9f9",
                Some(TaskOutcome::Failed(_)) => "#f99",
                Some(TaskOutcome::Skipped { .. }) => "#ddd",
                None => continue,
            };
            writeln!(f, "    style {} fill:{}", index.index(), color)?;
        }

        Ok(())
    }
}
