//! Crystal GA - Evolutionary search for low-enthalpy crystal structures.
//!
//! Candidates for a fixed composition are generated at random, relaxed by
//! an external or built-in energy evaluator, and bred by cut-and-splice
//! pairing and mutations. Survivors are ranked by negated enthalpy and
//! structural duplicates are removed with a radial-distribution
//! fingerprint.
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: Configuration, structures, candidates and run results
//! - `compute`: Generation, relaxation, persistence, comparison and the
//!   evolutionary loop
//!
//! # Example
//!
//! ```rust,no_run
//! use crystal_ga::{EvolutionController, SearchConfig};
//!
//! let mut config = SearchConfig::default();
//! config.population.max_generations = 10;
//!
//! let mut controller = EvolutionController::from_config(config)?;
//! let result = controller.run()?;
//!
//! println!(
//!     "Best candidate {} with energy {:?} after {} generations",
//!     result.best.id, result.best.energy, result.stats.generations
//! );
//! # Ok::<(), crystal_ga::compute::evolution::SearchError>(())
//! ```

pub mod compute;
pub mod schema;

// Re-export commonly used types
pub use compute::evolution::{EvolutionController, SearchError};
pub use schema::{Candidate, SearchConfig, SearchResult, Structure};
