//! Relaxation pipeline: evaluate, tag, persist.

use crate::schema::{Candidate, CandidateStatus, CellBounds};

use super::evaluator::{EnergyEvaluator, EvaluationError};
use super::store::{CandidateStore, StoreError};

/// Space group assigned when the evaluator reports none (P1).
const DEFAULT_SPACEGROUP: u16 = 1;

/// Why a candidate was killed.
#[derive(Debug, Clone, PartialEq)]
pub enum KillReason {
    /// The evaluator failed.
    Evaluation(String),
    /// The relaxed cell left the admissible bounds.
    OutOfBounds,
}

/// Result of relaxing one candidate.
#[derive(Debug, Clone)]
pub enum RelaxOutcome {
    Relaxed(Candidate),
    Killed {
        candidate: Candidate,
        reason: KillReason,
    },
}

/// Counts from a batch relaxation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaxSummary {
    pub relaxed: usize,
    pub killed: usize,
}

/// Drives the energy evaluator and persists each outcome immediately.
pub struct Relaxer {
    evaluator: Box<dyn EnergyEvaluator>,
    pressure_gpa: f64,
    cell_bounds: Option<CellBounds>,
}

impl Relaxer {
    pub fn new(evaluator: Box<dyn EnergyEvaluator>, pressure_gpa: f64) -> Self {
        Self {
            evaluator,
            pressure_gpa,
            cell_bounds: None,
        }
    }

    /// Kill relaxed candidates whose cell leaves these bounds.
    pub fn with_cell_bounds(mut self, bounds: CellBounds) -> Self {
        self.cell_bounds = Some(bounds);
        self
    }

    /// Relax one candidate. Evaluation failures kill the candidate; only
    /// store failures are returned as errors.
    pub fn relax(
        &self,
        mut candidate: Candidate,
        store: &mut dyn CandidateStore,
    ) -> Result<RelaxOutcome, StoreError> {
        match self.evaluator.evaluate(&candidate.structure, self.pressure_gpa) {
            Ok(evaluation) => {
                if let Some(bounds) = &self.cell_bounds
                    && !bounds.is_within_bounds(&evaluation.structure)
                {
                    log::warn!(
                        "Candidate {} relaxed outside the cell bounds (lengths {:?}, angles {:?})",
                        candidate.id,
                        evaluation.structure.lengths(),
                        evaluation.structure.angles()
                    );
                    store.kill(candidate.id)?;
                    candidate.status = CandidateStatus::Killed;
                    return Ok(RelaxOutcome::Killed {
                        candidate,
                        reason: KillReason::OutOfBounds,
                    });
                }
                candidate.structure = evaluation.structure;
                candidate.energy = Some(evaluation.energy);
                candidate.raw_score = Some(-evaluation.energy);
                candidate.spacegroup = Some(evaluation.spacegroup.unwrap_or(DEFAULT_SPACEGROUP));
                candidate.status = CandidateStatus::Relaxed;
                store.add_relaxed(&candidate)?;
                log::debug!(
                    "Relaxed candidate {}: E = {:.4} eV, spacegroup {}",
                    candidate.id,
                    evaluation.energy,
                    candidate.spacegroup.unwrap_or(DEFAULT_SPACEGROUP)
                );
                Ok(RelaxOutcome::Relaxed(candidate))
            }
            Err(error) => self.kill(candidate, &error, store),
        }
    }

    fn kill(
        &self,
        mut candidate: Candidate,
        error: &EvaluationError,
        store: &mut dyn CandidateStore,
    ) -> Result<RelaxOutcome, StoreError> {
        log::warn!("Candidate {} not suitable for optimization: {}", candidate.id, error);
        store.kill(candidate.id)?;
        candidate.status = CandidateStatus::Killed;
        Ok(RelaxOutcome::Killed {
            candidate,
            reason: KillReason::Evaluation(error.to_string()),
        })
    }

    /// Relax every candidate pending in the store, one at a time.
    pub fn relax_generation(
        &self,
        store: &mut dyn CandidateStore,
    ) -> Result<RelaxSummary, StoreError> {
        let mut summary = RelaxSummary::default();
        while store.unrelaxed_count()? > 0 {
            let Some(candidate) = store.next_unrelaxed()? else {
                break;
            };
            log::info!("Relaxing starting candidate {}", candidate.id);
            match self.relax(candidate, store)? {
                RelaxOutcome::Relaxed(_) => summary.relaxed += 1,
                RelaxOutcome::Killed { .. } => summary.killed += 1,
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::evaluator::Evaluation;
    use crate::compute::store::MemoryStore;
    use crate::schema::Structure;
    use nalgebra::Matrix3;

    /// Fails for structures whose first atom sits at x > 0.5; x < 0.05
    /// stretches the cell to 100 Å.
    struct ThresholdEvaluator;

    impl EnergyEvaluator for ThresholdEvaluator {
        fn evaluate(
            &self,
            structure: &Structure,
            _pressure_gpa: f64,
        ) -> Result<Evaluation, EvaluationError> {
            let x = structure.positions[0][0];
            if x > 0.5 {
                return Err(EvaluationError::NotConverged(10));
            }
            let mut relaxed = structure.clone();
            if x < 0.05 {
                relaxed.set_cell_matrix(&(Matrix3::identity() * 100.0));
            }
            Ok(Evaluation {
                structure: relaxed,
                energy: -10.0 * x,
                spacegroup: None,
            })
        }
    }

    fn candidate(id: u64, x: f64) -> Candidate {
        let structure = Structure::new(
            vec!["O".to_string()],
            vec![[x, 0.0, 0.0]],
            Matrix3::identity() * 3.0,
        );
        Candidate::unrelaxed(id, structure, 0, Vec::new(), "random")
    }

    #[test]
    fn test_relax_success_tags_candidate() {
        let relaxer = Relaxer::new(Box::new(ThresholdEvaluator), 100.0);
        let mut store = MemoryStore::new();
        store.add_unrelaxed(&candidate(1, 0.3)).unwrap();

        let outcome = relaxer.relax(candidate(1, 0.3), &mut store).unwrap();
        let RelaxOutcome::Relaxed(c) = outcome else {
            panic!("expected relaxed candidate");
        };
        assert_eq!(c.status, CandidateStatus::Relaxed);
        assert!((c.raw_score.unwrap() - 3.0).abs() < 1e-12);
        assert_eq!(c.spacegroup, Some(1));
        assert_eq!(store.all_relaxed().unwrap().len(), 1);
    }

    #[test]
    fn test_relax_failure_kills_candidate() {
        let relaxer = Relaxer::new(Box::new(ThresholdEvaluator), 100.0);
        let mut store = MemoryStore::new();
        store.add_unrelaxed(&candidate(1, 0.9)).unwrap();

        let outcome = relaxer.relax(candidate(1, 0.9), &mut store).unwrap();
        assert!(matches!(
            outcome,
            RelaxOutcome::Killed {
                reason: KillReason::Evaluation(_),
                ..
            }
        ));
        assert_eq!(
            store.get(1).unwrap().unwrap().status,
            CandidateStatus::Killed
        );
    }

    #[test]
    fn test_relax_generation_drains_store() {
        let relaxer = Relaxer::new(Box::new(ThresholdEvaluator), 0.0);
        let mut store = MemoryStore::new();
        for (id, x) in [(1, 0.1), (2, 0.7), (3, 0.2), (4, 0.4)] {
            store.add_unrelaxed(&candidate(id, x)).unwrap();
        }

        let summary = relaxer.relax_generation(&mut store).unwrap();
        assert_eq!(summary, RelaxSummary { relaxed: 3, killed: 1 });
        assert_eq!(store.unrelaxed_count().unwrap(), 0);
    }

    #[test]
    fn test_out_of_bounds_cell_is_killed() {
        let relaxer = Relaxer::new(Box::new(ThresholdEvaluator), 0.0)
            .with_cell_bounds(CellBounds::relaxation_default());
        let mut store = MemoryStore::new();
        store.add_unrelaxed(&candidate(1, 0.01)).unwrap();

        let outcome = relaxer.relax(candidate(1, 0.01), &mut store).unwrap();
        assert!(matches!(
            outcome,
            RelaxOutcome::Killed {
                reason: KillReason::OutOfBounds,
                ..
            }
        ));
        assert!(store.all_relaxed().unwrap().is_empty());
    }

    #[test]
    fn test_store_failure_is_fatal() {
        let relaxer = Relaxer::new(Box::new(ThresholdEvaluator), 0.0);
        let mut store = MemoryStore::new();
        // Never added: killing it is a store error.
        assert!(matches!(
            relaxer.relax(candidate(5, 0.9), &mut store),
            Err(StoreError::UnknownCandidate(5))
        ));
    }
}
