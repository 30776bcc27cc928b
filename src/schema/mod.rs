//! Schema module - Configuration and data types for structure searches.

mod bounds;
mod candidate;
mod config;
mod elements;
mod evolution;
mod structure;

pub use bounds::*;
pub use candidate::*;
pub use config::*;
pub use elements::*;
pub use evolution::*;
pub use structure::*;
