#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod batch;
mod core;
mod created;
mod definition;
mod diff;
mod error;
mod executor;
mod group;
mod requires;
mod utils;

pub use crate::batch::{Batch, CreatedStream, DefinitionBinder, DefinitionBuilder};
pub use crate::core::{CreateContext, Dynamic, Key, Resource};
pub use crate::created::{
    BatchReport, CreateFailure, CreatedEvent, CreatedResources, FailedEntry, ReportEntry,
    SkippedEntry, SkippedTask,
};
pub use crate::definition::{AnyDefinition, Definition};
pub use crate::error::*;
pub use crate::executor::{Diagnostics, TaskExecution};
pub use crate::group::{TaskGroup, TaskOutcome, TaskState};
pub use crate::requires::Requires;
pub use crate::utils::init_logging;
