//! The node side of the grid: map, combine, shuffle and reduce.

pub mod core;
pub mod map;
pub mod reduce;
pub mod shuffle;

pub use crate::core::NodeWorker;
pub use shuffle::{AccumulatorStore, Appended};
