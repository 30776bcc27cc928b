//! Compute module - Structure generation, relaxation and comparison.

mod comparator;
mod evaluator;
mod generator;
mod relax;
mod store;

pub mod evolution;

pub use comparator::*;
pub use evaluator::*;
pub use generator::*;
pub use relax::*;
pub use store::*;
