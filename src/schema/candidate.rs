//! Candidate structures tracked by the search.

use serde::{Deserialize, Serialize};

use super::Structure;

/// Lifecycle status of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateStatus {
    /// Created, waiting for relaxation.
    Unrelaxed,
    /// Relaxed with a valid raw score.
    Relaxed,
    /// Failed relaxation or validation; never selected again.
    Killed,
    /// Diversification donor with an assigned, unevaluated score.
    Synthetic,
}

/// One atomic configuration with its evaluation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Process-unique identifier.
    pub id: u64,
    /// Geometry.
    pub structure: Structure,
    /// Lifecycle status.
    pub status: CandidateStatus,
    /// Fitness: negated energy, higher is better.
    pub raw_score: Option<f64>,
    /// Final energy (eV) reported by the evaluator.
    pub energy: Option<f64>,
    /// Space group number after relaxation.
    pub spacegroup: Option<u16>,
    /// Generation in which the candidate was created.
    pub generation: usize,
    /// Parent IDs (empty for random candidates).
    pub parents: Vec<u64>,
    /// How the candidate was created.
    pub description: String,
}

impl Candidate {
    /// A fresh candidate awaiting relaxation.
    pub fn unrelaxed(
        id: u64,
        structure: Structure,
        generation: usize,
        parents: Vec<u64>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id,
            structure,
            status: CandidateStatus::Unrelaxed,
            raw_score: None,
            energy: None,
            spacegroup: None,
            generation,
            parents,
            description: description.into(),
        }
    }

    /// A diversification donor carrying an assigned score.
    pub fn synthetic(id: u64, structure: Structure, generation: usize, raw_score: f64) -> Self {
        Self {
            status: CandidateStatus::Synthetic,
            raw_score: Some(raw_score),
            ..Self::unrelaxed(id, structure, generation, Vec::new(), "diversification")
        }
    }

    /// Score used for ranking; unscored candidates rank last.
    pub fn score(&self) -> f64 {
        self.raw_score.unwrap_or(f64::NEG_INFINITY)
    }

    /// Whether the candidate is relaxed and carries a finite score.
    pub fn is_relaxed(&self) -> bool {
        self.status == CandidateStatus::Relaxed && self.raw_score.is_some_and(f64::is_finite)
    }

    /// Cell volume of the current geometry.
    pub fn volume(&self) -> f64 {
        self.structure.volume()
    }
}
