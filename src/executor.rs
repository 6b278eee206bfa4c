mod diagnostics;

use std::collections::HashMap;
use std::sync::mpsc::{Sender, channel};
use std::time::{Duration, Instant};

use tracing::Level;

use crate::core::{ArcStr, CreateContext, Dynamic, Key, Resource};
use crate::created::CreatedEvent;
use crate::error::TaskError;
use crate::group::{TaskGroup, TaskOutcome};

pub use diagnostics::{Diagnostics, TaskExecution};

/// (key, name, work result, start, duration)
type Completion = (Key, ArcStr, anyhow::Result<Dynamic>, Instant, Duration);

/// Drives a task group to settlement on the Rayon pool.
///
/// The group's bookkeeping is owned by this single control flow. Ready tasks
/// fan out to worker threads; their completions funnel back through one
/// channel and are recorded here, which in turn unlocks and dispatches the
/// next wave. Tasks with a failed or skipped prerequisite are completed
/// inline as `Skipped` without dispatching their work.
///
/// Each `Created` outcome is mirrored to `events` when a sink is given.
pub(crate) fn run_group_parallel<E: Send + Sync>(
    group: &mut TaskGroup<E>,
    env: &E,
    events: Option<&Sender<CreatedEvent>>,
) -> Diagnostics {
    group.prepare();

    if group.is_settled() {
        return Diagnostics::default();
    }

    let mut execution_times = HashMap::new();

    // in_place_scope keeps this loop on the calling thread instead of
    // migrating it onto a pool worker, so a one-thread pool still has a
    // free worker for the spawned tasks.
    rayon::in_place_scope(|s| {
        let (result_sender, result_receiver) = channel::<Completion>();

        dispatch_ready(s, group, env, &result_sender, events);

        // An acyclic graph always has a ready task while any task is
        // unreported, so recv() only blocks while work is in flight.
        while !group.is_settled() {
            let (key, name, result, start, duration) = result_receiver.recv().unwrap();

            let outcome = match result {
                Ok(value) => TaskOutcome::Created(Resource::new(key, name, value)),
                Err(err) => TaskOutcome::Failed(TaskError::new(err)),
            };

            record(group, key, outcome, events);
            execution_times.insert(key, TaskExecution { start, duration });

            dispatch_ready(s, group, env, &result_sender, events);
        }
    });

    tracing::info!(tasks = execution_times.len(), "Batch settled");
    Diagnostics { execution_times }
}

/// Pulls every currently ready task and either dispatches its work, skips
/// it, or re-reports a frozen outcome. Inline completions can ready further
/// tasks, so this loops until the queue is drained.
fn dispatch_ready<'a, E: Send + Sync>(
    s: &rayon::Scope<'a>,
    group: &mut TaskGroup<E>,
    env: &'a E,
    results: &Sender<Completion>,
    events: Option<&Sender<CreatedEvent>>,
) {
    while let Some(key) = group.get_next() {
        // A frozen outcome from an earlier run: nothing left to execute.
        if group.outcome(key).is_some() {
            group.report_completion(key).unwrap();
            continue;
        }

        if let Some(blocked_on) = blocking_prerequisite(group, key) {
            tracing::debug!(task = %key, blocked_on = %blocked_on, "Skipping task");
            record(group, key, TaskOutcome::Skipped { blocked_on }, events);
            continue;
        }

        spawn_work(s, group, key, env, results);
    }
}

/// Records an outcome and reports the completion, mirroring created
/// resources to the event sink. The sink's receiver may already be gone;
/// a failed send only stops event delivery.
fn record<E: Send + Sync>(
    group: &mut TaskGroup<E>,
    key: Key,
    outcome: TaskOutcome,
    events: Option<&Sender<CreatedEvent>>,
) {
    if let TaskOutcome::Created(resource) = &outcome
        && let Some(sink) = events
    {
        let _ = sink.send(CreatedEvent {
            resource: resource.clone(),
            top_level: group.is_root(key),
        });
    }

    group.complete(key, outcome).unwrap();
    group.report_completion(key).unwrap();
}

/// The first prerequisite of `key` that did not end up `Created`, if any.
/// Declared dependencies are checked in declaration order, then ordering
/// links.
fn blocking_prerequisite<E: Send + Sync>(group: &TaskGroup<E>, key: Key) -> Option<Key> {
    let node = group.node_of(key)?;

    for dep in &node.requires {
        match group.outcome(dep.key()) {
            Some(outcome) if outcome.is_created() => {}
            _ => return Some(dep.key()),
        }
    }

    for dep in group.prerequisites(key) {
        match group.outcome(dep) {
            Some(outcome) if outcome.is_created() => {}
            _ => return Some(dep),
        }
    }

    None
}

fn spawn_work<'a, E: Send + Sync>(
    s: &rayon::Scope<'a>,
    group: &TaskGroup<E>,
    key: Key,
    env: &'a E,
    results: &Sender<Completion>,
) {
    let node = group.node_of(key).unwrap().clone();

    // Inputs resolve by declared position from the frozen outcomes.
    let inputs: Vec<Dynamic> = node
        .requires
        .iter()
        .map(|dep| {
            let outcome = group.outcome(dep.key()).and_then(TaskOutcome::created);
            outcome.unwrap().value.clone()
        })
        .collect();

    let sender = results.clone();

    s.spawn(move |_| {
        let span = tracing::span!(Level::INFO, "create", task = %node.name);
        let _enter = span.enter();

        let context = CreateContext {
            env,
            key,
            name: &node.name,
        };

        let start_time = Instant::now();

        // AssertUnwindSafe: a panicking task only ever touches its own
        // cloned inputs, never bookkeeping shared with other threads.
        let output = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            (node.work)(&context, &inputs)
        })) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Task panicked: {s}")
                } else {
                    String::from("Task panicked with unknown payload")
                };

                Err(anyhow::anyhow!(msg))
            }
        };

        let elapsed = start_time.elapsed();

        sender
            .send((key, node.name.clone(), output, start_time, elapsed))
            .unwrap();
    });
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;

    use super::*;
    use crate::Batch;

    #[test]
    fn test_chain_runs_in_dependency_order() {
        let mut batch = Batch::<()>::new();
        let c = batch.define("c").create_with(|_| Ok(1u32));
        let b = batch
            .define("b")
            .requires(c.clone())
            .create_with(|_, n| Ok(n + 1));
        let a = batch
            .define("a")
            .requires(b.clone())
            .create_with(|_, n| Ok(n + 1));

        let mut group = TaskGroup::build(&[a.clone()]).unwrap();
        let diagnostics = run_group_parallel(&mut group, &(), None);

        assert_eq!(diagnostics.len(), 3);
        assert_eq!(diagnostics.finished_before(c.key(), b.key()), Some(true));
        assert_eq!(diagnostics.finished_before(b.key(), a.key()), Some(true));

        let resource = group.outcome(a.key()).unwrap().created().unwrap();
        assert_eq!(resource.downcast_ref::<u32>(), Some(&3));
    }

    #[test]
    fn test_shared_dependency_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));

        let mut batch = Batch::<()>::new();
        let net = {
            let counter = counter.clone();
            batch.define("net").create_with(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(String::from("vnet"))
            })
        };
        let vm_a = batch
            .define("vm-a")
            .requires(net.clone())
            .create_with(|_, net| Ok(format!("a on {net}")));
        let vm_b = batch
            .define("vm-b")
            .requires(net.clone())
            .create_with(|_, net| Ok(format!("b on {net}")));

        let mut group = TaskGroup::build(&[vm_a, vm_b]).unwrap();
        run_group_parallel(&mut group, &(), None);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_skips_dependents_only() {
        let mut batch = Batch::<()>::new();
        let bad = batch
            .define("bad")
            .create_with(|_| Err::<u32, _>(anyhow::anyhow!("quota exceeded")));
        let below = batch
            .define("below")
            .requires(bad.clone())
            .create_with(|_, n| Ok(n + 1));
        let bottom = batch
            .define("bottom")
            .requires(below.clone())
            .create_with(|_, n| Ok(n + 1));
        let independent = batch.define("independent").create_with(|_| Ok(7u32));

        let mut group = TaskGroup::build(&[bottom.clone(), independent.clone()]).unwrap();
        run_group_parallel(&mut group, &(), None);

        assert!(matches!(
            group.outcome(bad.key()),
            Some(TaskOutcome::Failed(_))
        ));
        assert!(matches!(
            group.outcome(below.key()),
            Some(TaskOutcome::Skipped { blocked_on }) if *blocked_on == bad.key()
        ));
        assert!(matches!(
            group.outcome(bottom.key()),
            Some(TaskOutcome::Skipped { blocked_on }) if *blocked_on == below.key()
        ));
        assert!(group.outcome(independent.key()).unwrap().is_created());
    }

    #[test]
    fn test_panic_becomes_failed_outcome() {
        let mut batch = Batch::<()>::new();
        let boom = batch
            .define("boom")
            .create_with(|_| -> anyhow::Result<u32> { panic!("unexpected") });
        let calm = batch.define("calm").create_with(|_| Ok(1u32));

        let mut group = TaskGroup::build(&[boom.clone(), calm.clone()]).unwrap();
        run_group_parallel(&mut group, &(), None);

        match group.outcome(boom.key()) {
            Some(TaskOutcome::Failed(err)) => {
                assert!(err.to_string().contains("panicked"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(group.outcome(calm.key()).unwrap().is_created());
    }

    #[test]
    fn test_redriving_a_settled_group_does_not_rerun_work() {
        let counter = Arc::new(AtomicUsize::new(0));

        let mut batch = Batch::<()>::new();
        let once = {
            let counter = counter.clone();
            batch.define("once").create_with(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(1u32)
            })
        };

        let mut group = TaskGroup::build(&[once]).unwrap();
        run_group_parallel(&mut group, &(), None);
        let second = run_group_parallel(&mut group, &(), None);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // The replay executed nothing, so it logged nothing.
        assert!(second.is_empty());
    }

    #[test]
    fn test_created_events_are_mirrored() {
        let mut batch = Batch::<()>::new();
        let net = batch.define("net").create_with(|_| Ok(String::from("n")));
        let vm = batch
            .define("vm")
            .requires(net.clone())
            .create_with(|_, net| Ok(format!("vm on {net}")));

        let mut group = TaskGroup::build(&[vm.clone()]).unwrap();
        let (tx, rx) = channel();
        run_group_parallel(&mut group, &(), Some(&tx));
        drop(tx);

        let events: Vec<CreatedEvent> = rx.iter().collect();
        assert_eq!(events.len(), 2);

        let net_event = events.iter().find(|e| e.resource.key() == net.key()).unwrap();
        assert!(!net_event.top_level);
        let vm_event = events.iter().find(|e| e.resource.key() == vm.key()).unwrap();
        assert!(vm_event.top_level);
    }

    #[test]
    fn test_failed_link_predecessor_skips_dependent() {
        let ran = Arc::new(AtomicUsize::new(0));

        let mut batch = Batch::<()>::new();
        let gate = batch
            .define("gate")
            .create_with(|_| Err::<u32, _>(anyhow::anyhow!("gate down")));
        let follower = {
            let ran = ran.clone();
            batch.define("follower").create_with(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(1u32)
            })
        };

        let mut group = TaskGroup::build(&[gate.clone(), follower.clone()]).unwrap();
        // No data flows between the two; only the ordering edge does.
        group.link(gate.key(), follower.key()).unwrap();
        run_group_parallel(&mut group, &(), None);

        assert!(matches!(
            group.outcome(follower.key()),
            Some(TaskOutcome::Skipped { blocked_on }) if *blocked_on == gate.key()
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wide_fanout_settles() {
        let mut batch = Batch::<()>::new();
        let leaves: Vec<_> = (0..64)
            .map(|i| batch.define("leaf").create_with(move |_| Ok(i as u32)))
            .collect();
        let top = batch
            .define("top")
            .requires(leaves.clone())
            .create_with(|_, values| Ok(values.into_iter().sum::<u32>()));

        let mut group = TaskGroup::build(&[top.clone()]).unwrap();
        run_group_parallel(&mut group, &(), None);

        let resource = group.outcome(top.key()).unwrap().created().unwrap();
        assert_eq!(resource.downcast_ref::<u32>(), Some(&(0..64).sum::<u32>()));
    }
}
