//! Variation operators and weighted operator selection.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use crate::schema::{Candidate, CellBounds, ConfigError, MinDistances, OperatorConfig, Structure};

use super::mutation::{SoftMutation, StrainMutation};
use super::pairing::CutAndSplicePairing;

/// Operator failures. Each one costs the controller one attempt.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("Parents are incompatible: {0}")]
    IncompatibleParents(String),
    #[error("{operator} found no valid offspring in {attempts} attempts")]
    AttemptsExhausted {
        operator: &'static str,
        attempts: usize,
    },
    #[error("All soft modes of candidate {0} have been used")]
    ModesExhausted(u64),
    #[error("Offspring violates constraints: {0}")]
    Constraints(String),
}

/// A new structure with its provenance.
#[derive(Debug, Clone)]
pub struct Offspring {
    pub structure: Structure,
    pub parents: Vec<u64>,
    pub description: String,
}

/// Validity checks every offspring must pass.
#[derive(Debug, Clone)]
pub struct Constraints {
    pub blmin: MinDistances,
    pub cell_bounds: CellBounds,
}

impl Constraints {
    pub fn accepts(&self, structure: &Structure) -> bool {
        self.cell_bounds.is_within_bounds(structure) && !self.blmin.violated_by(structure)
    }
}

/// One variation operator with its adaptive state.
#[derive(Debug, Clone)]
pub enum Operator {
    Pairing(CutAndSplicePairing),
    SoftMutation(SoftMutation),
    StrainMutation(StrainMutation),
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Pairing(_) => "pairing",
            Operator::SoftMutation(_) => "soft mutation",
            Operator::StrainMutation(_) => "strain mutation",
        }
    }

    /// Number of parents consumed.
    pub fn arity(&self) -> usize {
        match self {
            Operator::Pairing(_) => 2,
            Operator::SoftMutation(_) | Operator::StrainMutation(_) => 1,
        }
    }

    /// Produce one offspring. One-parent operators use the first parent.
    pub fn produce(
        &mut self,
        parents: (&Candidate, &Candidate),
        rng: &mut StdRng,
    ) -> Result<Offspring, OperatorError> {
        match self {
            Operator::Pairing(op) => op.produce(parents.0, parents.1, rng),
            Operator::SoftMutation(op) => op.produce(parents.0, rng),
            Operator::StrainMutation(op) => op.produce(parents.0, rng),
        }
    }

    /// Target volume offspring are rescaled to, for operators that rescale.
    pub fn scaling_volume(&self) -> Option<f64> {
        match self {
            Operator::Pairing(op) => op.scaling_volume,
            Operator::StrainMutation(op) => op.scaling_volume,
            Operator::SoftMutation(_) => None,
        }
    }

    fn scaling_volume_mut(&mut self) -> Option<&mut Option<f64>> {
        match self {
            Operator::Pairing(op) => Some(&mut op.scaling_volume),
            Operator::StrainMutation(op) => Some(&mut op.scaling_volume),
            Operator::SoftMutation(_) => None,
        }
    }
}

/// Picks operators by integer weight and keeps their volume state current.
#[derive(Debug, Clone)]
pub struct OperatorSelector {
    operators: Vec<Operator>,
    distribution: WeightedIndex<u32>,
}

impl OperatorSelector {
    /// Build from `(weight, operator)` pairs; zero weights are dropped.
    pub fn new(weighted: Vec<(u32, Operator)>) -> Result<Self, ConfigError> {
        let (weights, operators): (Vec<u32>, Vec<Operator>) =
            weighted.into_iter().filter(|(w, _)| *w > 0).unzip();
        let distribution = WeightedIndex::new(&weights).map_err(|_| ConfigError::NoOperators)?;
        Ok(Self {
            operators,
            distribution,
        })
    }

    /// The standard pairing / soft / strain mix.
    pub fn from_config(
        config: &OperatorConfig,
        blmin: MinDistances,
        soft_blmin: MinDistances,
    ) -> Result<Self, ConfigError> {
        let constraints = Constraints {
            blmin,
            cell_bounds: config.cell_bounds,
        };
        Self::new(vec![
            (
                config.weights.pairing,
                Operator::Pairing(CutAndSplicePairing::new(
                    config.pairing.clone(),
                    constraints.clone(),
                )),
            ),
            (
                config.weights.soft_mutation,
                Operator::SoftMutation(SoftMutation::new(config.soft.clone(), soft_blmin)),
            ),
            (
                config.weights.strain_mutation,
                Operator::StrainMutation(StrainMutation::new(config.strain.clone(), constraints)),
            ),
        ])
    }

    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    /// Choose an operator and produce one offspring from the parent pair.
    pub fn produce_offspring(
        &mut self,
        parents: (&Candidate, &Candidate),
        rng: &mut StdRng,
    ) -> Result<Offspring, OperatorError> {
        let index = self.distribution.sample(rng);
        let operator = &mut self.operators[index];
        let result = operator.produce(parents, rng);
        if let Err(e) = &result {
            log::debug!("{} failed: {}", operator.name(), e);
        }
        result
    }

    /// Blend each rescaling operator's target volume toward the mean volume
    /// of the best `n_adapt` candidates (`0` means the top 20%).
    pub fn update_scaling_volume(&mut self, population: &[Candidate], w_adapt: f64, n_adapt: usize) {
        let Some(v_new) = top_mean_volume(population, n_adapt) else {
            return;
        };
        for operator in &mut self.operators {
            if let Some(volume) = operator.scaling_volume_mut() {
                *volume = Some(match *volume {
                    None => v_new,
                    Some(old) => w_adapt * old + (1.0 - w_adapt) * v_new,
                });
            }
        }
        log::debug!("Adapted scaling volume toward {:.2}", v_new);
    }
}

/// Mean cell volume of the first `n` candidates (`0` means `ceil(0.2·len)`).
pub fn top_mean_volume(population: &[Candidate], n: usize) -> Option<f64> {
    if population.is_empty() {
        return None;
    }
    let n = if n == 0 {
        (0.2 * population.len() as f64).ceil() as usize
    } else {
        n
    };
    let top = &population[..n.clamp(1, population.len())];
    Some(top.iter().map(Candidate::volume).sum::<f64>() / top.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CandidateStatus, PairingConfig, StrainConfig};
    use nalgebra::Matrix3;
    use rand::SeedableRng;

    fn cubic(id: u64, a: f64) -> Candidate {
        let structure = Structure::new(
            vec!["O".to_string()],
            vec![[0.0, 0.0, 0.0]],
            Matrix3::identity() * a,
        );
        let mut c = Candidate::unrelaxed(id, structure, 0, Vec::new(), "test");
        c.status = CandidateStatus::Relaxed;
        c.raw_score = Some(0.0);
        c
    }

    fn constraints() -> Constraints {
        Constraints {
            blmin: MinDistances::from_covalent_radii(&["O"], 0.5).unwrap(),
            cell_bounds: CellBounds::relaxation_default(),
        }
    }

    fn selector() -> OperatorSelector {
        OperatorSelector::new(vec![
            (
                3,
                Operator::Pairing(CutAndSplicePairing::new(
                    PairingConfig::default(),
                    constraints(),
                )),
            ),
            (
                1,
                Operator::StrainMutation(StrainMutation::new(
                    StrainConfig::default(),
                    constraints(),
                )),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_zero_weights_are_dropped() {
        let selector = OperatorSelector::new(vec![
            (
                0,
                Operator::Pairing(CutAndSplicePairing::new(
                    PairingConfig::default(),
                    constraints(),
                )),
            ),
            (
                2,
                Operator::StrainMutation(StrainMutation::new(
                    StrainConfig::default(),
                    constraints(),
                )),
            ),
        ])
        .unwrap();
        assert_eq!(selector.operators().len(), 1);
        assert_eq!(selector.operators()[0].arity(), 1);
    }

    #[test]
    fn test_all_zero_weights_rejected() {
        assert!(matches!(
            OperatorSelector::new(Vec::new()),
            Err(ConfigError::NoOperators)
        ));
    }

    #[test]
    fn test_scaling_volume_first_update_sets_value() {
        let mut selector = selector();
        let pop = vec![cubic(0, 4.0), cubic(1, 5.0), cubic(2, 6.0)];
        selector.update_scaling_volume(&pop, 0.5, 2);
        let expected = (64.0 + 125.0) / 2.0;
        for op in selector.operators() {
            assert!((op.scaling_volume().unwrap() - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_scaling_volume_blends() {
        let mut selector = selector();
        selector.update_scaling_volume(&[cubic(0, 4.0)], 0.5, 4);
        selector.update_scaling_volume(&[cubic(1, 6.0)], 0.5, 4);
        let expected = 0.5 * 64.0 + 0.5 * 216.0;
        for op in selector.operators() {
            assert!((op.scaling_volume().unwrap() - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_top_mean_volume_default_fraction() {
        let pop: Vec<Candidate> = (0..10).map(|i| cubic(i, 2.0 + i as f64)).collect();
        // ceil(0.2 * 10) = 2
        let v = top_mean_volume(&pop, 0).unwrap();
        assert!((v - (8.0 + 27.0) / 2.0).abs() < 1e-9);
        assert!(top_mean_volume(&[], 4).is_none());
    }

    /// Eight O atoms on a simple cubic grid.
    fn grid(id: u64, a: f64) -> Candidate {
        let mut positions = Vec::new();
        for i in 0..2 {
            for j in 0..2 {
                for k in 0..2 {
                    positions.push([0.5 * i as f64, 0.5 * j as f64, 0.5 * k as f64]);
                }
            }
        }
        let structure = Structure::new(vec!["O".to_string(); 8], positions, Matrix3::identity() * a);
        let mut c = Candidate::unrelaxed(id, structure, 0, Vec::new(), "test");
        c.status = CandidateStatus::Relaxed;
        c.raw_score = Some(0.0);
        c
    }

    #[test]
    fn test_selector_respects_arity() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut selector = selector();
        let a = grid(1, 6.0);
        let b = grid(2, 6.5);
        let mut produced = 0;
        for _ in 0..20 {
            if let Ok(child) = selector.produce_offspring((&a, &b), &mut rng) {
                assert_eq!(child.structure.len(), 8);
                assert!(matches!(child.parents.len(), 1 | 2));
                assert!(child.parents.contains(&1));
                produced += 1;
            }
        }
        assert!(produced > 0);
    }
}
