//! Progress, history and result types of a search run.

use serde::{Deserialize, Serialize};

use super::Candidate;

/// Per-generation summary, one line of the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    /// Generation index.
    pub generation: usize,
    /// Best raw score among the survivors.
    pub best: f64,
    /// Mean raw score of the survivors.
    pub mean: f64,
    /// Standard deviation of the survivors' raw scores.
    pub stdev: f64,
    /// Best raw score seen so far in the run.
    pub best_ever: f64,
    /// Generations since the best score last improved.
    pub stagnation: usize,
    /// Survivors after selection.
    pub population: usize,
    /// Offspring admitted to the population.
    pub admitted: usize,
    /// Offspring killed by relaxation failure or cell bounds.
    pub killed: usize,
    /// Offspring slots left empty after exhausting operator attempts.
    pub failed_slots: usize,
    /// Diversification candidates injected.
    pub injected: usize,
}

/// Evolution history for plotting.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SearchHistory {
    pub records: Vec<GenerationRecord>,
}

impl SearchHistory {
    /// Best-ever score after each recorded generation.
    pub fn best_ever(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.best_ever).collect()
    }
}

/// Current phase of the generation loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SearchPhase {
    /// Relaxing the seed population.
    #[default]
    Seeding,
    /// Snapshotting population statistics.
    GenerationStart,
    /// Injecting diversification candidates.
    Diversifying,
    /// Breeding and relaxing offspring.
    Reproducing,
    /// Adding relaxed offspring to the population.
    Admitting,
    /// Purging donors and selecting survivors.
    SelectingSurvivors,
    /// Evaluating the stop rule.
    CheckingStop,
    /// Search finished.
    Done,
}

/// Progress information for callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchProgress {
    pub generation: usize,
    pub max_generations: usize,
    pub phase: SearchPhase,
    pub best_ever: f64,
    pub mean: f64,
    pub stdev: f64,
    pub stagnation: usize,
    pub population: usize,
    pub best_candidate: Option<Candidate>,
}

/// Final result of a search run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Best candidate found.
    pub best: Candidate,
    /// Final survivor population, best first.
    pub population: Vec<Candidate>,
    pub stats: SearchStats,
    pub history: SearchHistory,
}

/// Statistics from a search run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchStats {
    /// Generations completed.
    pub generations: usize,
    /// Relaxations attempted, including the seed population.
    pub relaxations: u64,
    /// Candidates killed.
    pub killed: u64,
    /// Failed operator invocations.
    pub operator_failures: u64,
    /// Best raw score achieved.
    pub best_raw_score: f64,
    pub elapsed_seconds: f64,
    pub stop_reason: StopReason,
}

/// Reason the search stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// Reached the generation ceiling.
    MaxGenerations,
    /// Best score unchanged for too long.
    Stagnation,
    /// Cancelled through the handle.
    Cancelled,
}
