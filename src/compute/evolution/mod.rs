//! Evolutionary search over candidate crystal structures.
//!
//! # Overview
//!
//! The search system consists of:
//!
//! - **Population** (`population`): Survivor selection, duplicate removal and
//!   fitness-weighted parent sampling
//! - **Operators** (`operators`, `pairing`, `mutation`): Cut-and-splice
//!   pairing, soft-mode mutation and strain mutation
//! - **Search Loop** (`search`): Seeding, reproduction and stopping rules
//! - **Run Artifacts** (`archive`): Population snapshots, history and result
//!
//! # Example
//!
//! ```rust,no_run
//! use crystal_ga::schema::SearchConfig;
//! use crystal_ga::compute::evolution::EvolutionController;
//!
//! let config = SearchConfig::default();
//! let mut controller = EvolutionController::from_config(config)?;
//! let result = controller.run_with_callback(|progress| {
//!     println!("Generation {}: best raw score = {:.3}",
//!         progress.generation, progress.best_ever);
//! })?;
//!
//! println!("Best energy: {:?}", result.best.energy);
//! # Ok::<(), crystal_ga::compute::evolution::SearchError>(())
//! ```
//!
//! # Operators
//!
//! - `CutAndSplicePairing`: Two parents split by a random plane
//! - `SoftMutation`: Displacement along the softest unused harmonic mode
//! - `StrainMutation`: Random symmetric cell deformation

mod archive;
mod mutation;
mod operators;
mod pairing;
mod population;
mod search;

pub use archive::{PopulationExport, RunArtifacts, load_history, load_population};
pub use mutation::{SoftMutation, StrainMutation};
pub use operators::{
    Constraints, Offspring, Operator, OperatorError, OperatorSelector, top_mean_volume,
};
pub use pairing::CutAndSplicePairing;
pub use population::{Population, PopulationError, PopulationStats};
pub use search::{EvolutionController, ProgressCallback, SearchError};
