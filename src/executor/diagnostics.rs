use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::Key;

/// Wall-clock record of one task's work.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Execution log of one batch run, keyed by task [`Key`].
///
/// Only tasks whose work actually ran have an entry; skipped tasks and
/// replayed walks leave no trace here.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub execution_times: HashMap<Key, TaskExecution>,
}

impl Diagnostics {
    /// Whether `a`'s work had finished before `b`'s work started.
    /// `None` when either task never ran.
    pub fn finished_before(&self, a: Key, b: Key) -> Option<bool> {
        let a = self.execution_times.get(&a)?;
        let b = self.execution_times.get(&b)?;
        Some(a.start + a.duration <= b.start)
    }

    /// Wall time spanned by the run, from the first task starting to the
    /// last task finishing.
    pub fn total_duration(&self) -> Option<Duration> {
        let start = self.execution_times.values().map(|t| t.start).min()?;
        let end = self
            .execution_times
            .values()
            .map(|t| t.start + t.duration)
            .max()?;
        Some(end.duration_since(start))
    }

    pub fn len(&self) -> usize {
        self.execution_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.execution_times.is_empty()
    }
}
