use std::collections::HashMap;

use crate::core::{Key, Resource};
use crate::error::GraphError;
use crate::group::{TaskGroup, TaskOutcome};

/// Computes the orphan set of a settled group.
///
/// An orphan is a resource that was created on behalf of a top-level request
/// that did not itself end up created, and that no successful top-level
/// request reaches. Such resources exist and may bill, but nothing the
/// caller asked for uses them; the caller decides what to do about that.
///
/// Two replay passes over the frozen outcomes, run after the group settles:
/// first collect everything created under each non-created root, then
/// remove everything reachable from each created root. Both passes reuse
/// the pull protocol, which is safe because completion reporting is
/// replayable and outcomes are frozen.
pub(crate) fn orphans<E: Send + Sync>(
    group: &mut TaskGroup<E>,
) -> Result<HashMap<Key, Resource>, GraphError> {
    let roots = group.root_keys().to_vec();

    let mut may_be_unused = HashMap::new();

    for &root in &roots {
        if group.outcome(root).is_some_and(TaskOutcome::is_created) {
            continue;
        }
        walk(group, root, |key, outcome| {
            if let TaskOutcome::Created(resource) = outcome {
                may_be_unused.insert(key, resource);
            }
        })?;
    }

    if may_be_unused.is_empty() {
        return Ok(may_be_unused);
    }

    for &root in &roots {
        if !group.outcome(root).is_some_and(TaskOutcome::is_created) {
            continue;
        }
        walk(group, root, |key, _| {
            may_be_unused.remove(&key);
        })?;
    }

    Ok(may_be_unused)
}

/// Replays the dependency closure of `root`, visiting every frozen outcome.
fn walk<E, F>(group: &mut TaskGroup<E>, root: Key, mut visit: F) -> Result<(), GraphError>
where
    E: Send + Sync,
    F: FnMut(Key, TaskOutcome),
{
    group.prepare_for(root)?;

    while let Some(key) = group.get_next() {
        if let Some(outcome) = group.outcome(key).cloned() {
            visit(key, outcome);
        }
        group.report_completion(key)?;
    }

    Ok(())
}
