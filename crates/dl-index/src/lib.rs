//! Incrementally maintained filter layers and sorted projection over a
//! growing collection.

pub mod engine;
pub mod sorting;

pub use engine::{Predicate, SortedProjectionEngine, UpdateOutcome};
pub use sorting::Sorting;
