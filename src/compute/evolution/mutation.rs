//! Single-parent mutations.

use std::collections::{BTreeSet, HashMap};

use nalgebra::{DMatrix, DVector, Matrix3, SymmetricEigen, Vector3};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::compute::evaluator::lattice_shifts;
use crate::schema::{Candidate, MinDistances, SoftMutationConfig, StrainConfig, Structure};

use super::operators::{Constraints, Offspring, OperatorError};

// ============================================================================
// Strain
// ============================================================================

/// Deforms the cell by a random symmetric strain, keeping fractional
/// coordinates, then rescales to the target volume.
#[derive(Debug, Clone)]
pub struct StrainMutation {
    config: StrainConfig,
    constraints: Constraints,
    /// Target volume of offspring; the parent volume when unset.
    pub scaling_volume: Option<f64>,
}

impl StrainMutation {
    pub fn new(config: StrainConfig, constraints: Constraints) -> Self {
        Self {
            config,
            constraints,
            scaling_volume: None,
        }
    }

    pub fn produce(&self, parent: &Candidate, rng: &mut StdRng) -> Result<Offspring, OperatorError> {
        let normal = Normal::new(0.0, self.config.stddev)
            .map_err(|e| OperatorError::Constraints(format!("strain distribution: {e}")))?;
        let volume = self.scaling_volume.unwrap_or_else(|| parent.volume());

        for _ in 0..self.config.max_attempts {
            let mut strain = Matrix3::<f64>::identity();
            for i in 0..3 {
                for j in i..3 {
                    let e = normal.sample(rng);
                    strain[(i, j)] += e;
                    if i != j {
                        strain[(j, i)] += e;
                    }
                }
            }

            let cell = parent.structure.cell_matrix() * strain;
            if cell.determinant().abs() < 1e-6 {
                continue;
            }
            let mut child = parent.structure.clone();
            child.set_cell_matrix(&cell);
            child.scale_to_volume(volume);
            child.wrap();
            if self.constraints.accepts(&child) {
                return Ok(Offspring {
                    structure: child,
                    parents: vec![parent.id],
                    description: format!("strain: {}", parent.id),
                });
            }
        }
        Err(OperatorError::AttemptsExhausted {
            operator: "strain mutation",
            attempts: self.config.max_attempts,
        })
    }
}

// ============================================================================
// Soft mode
// ============================================================================

/// Displaces atoms along the softest unused vibrational mode of a
/// pairwise harmonic model.
///
/// Modes are ordered by eigenvalue; the three translations are skipped.
/// Each parent walks through its modes in order, so repeated selection of
/// the same parent explores progressively stiffer modes.
#[derive(Debug, Clone)]
pub struct SoftMutation {
    config: SoftMutationConfig,
    blmin: MinDistances,
    used_modes: HashMap<u64, BTreeSet<usize>>,
}

impl SoftMutation {
    pub fn new(config: SoftMutationConfig, blmin: MinDistances) -> Self {
        Self {
            config,
            blmin,
            used_modes: HashMap::new(),
        }
    }

    /// Modes already consumed for a parent.
    pub fn used_modes(&self, id: u64) -> usize {
        self.used_modes.get(&id).map_or(0, BTreeSet::len)
    }

    pub fn produce(
        &mut self,
        parent: &Candidate,
        rng: &mut StdRng,
    ) -> Result<Offspring, OperatorError> {
        let mut structure = parent.structure.clone();
        structure.wrap();
        let n = structure.len();
        if n < 2 {
            return Err(OperatorError::IncompatibleParents(format!(
                "candidate {} has fewer than two atoms",
                parent.id
            )));
        }

        let modes = self.soft_modes(&structure);
        let used = self.used_modes.entry(parent.id).or_default();
        let Some(index) = (0..modes.len()).find(|k| !used.contains(k)) else {
            return Err(OperatorError::ModesExhausted(parent.id));
        };
        used.insert(index);

        let mode = &modes[index];
        let displacements: Vec<Vector3<f64>> = (0..n)
            .map(|i| Vector3::new(mode[3 * i], mode[3 * i + 1], mode[3 * i + 2]))
            .collect();
        let largest = displacements.iter().map(|d| d.norm()).fold(0.0, f64::max);
        if largest < 1e-12 {
            return Err(OperatorError::Constraints(format!(
                "mode {index} of candidate {} has no displacement",
                parent.id
            )));
        }
        let sign = if rng.r#gen::<bool>() { 1.0 } else { -1.0 };
        let direction: Vec<Vector3<f64>> = displacements
            .iter()
            .map(|d| d * (sign / largest))
            .collect();

        let origin = structure.cartesian_positions();
        let (lower, upper) = self.config.bounds;
        let step = self.config.step.max(1e-3);

        let mut accepted = None;
        let mut amplitude = lower;
        while amplitude <= upper + 1e-12 {
            let moved: Vec<Vector3<f64>> = origin
                .iter()
                .zip(&direction)
                .map(|(r, d)| r + d * amplitude)
                .collect();
            let mut trial = structure.clone();
            if !trial.set_cartesian_positions(&moved) {
                break;
            }
            trial.wrap();
            if self.blmin.violated_by(&trial) {
                break;
            }
            accepted = Some(trial);
            amplitude += step;
        }

        let child = accepted.ok_or_else(|| {
            OperatorError::Constraints(format!(
                "displacing candidate {} by {lower} Å breaks minimal distances",
                parent.id
            ))
        })?;
        Ok(Offspring {
            structure: child,
            parents: vec![parent.id],
            description: format!("soft mutation: {}", parent.id),
        })
    }

    /// Eigenvectors of the harmonic Hessian, softest first, translations
    /// removed.
    fn soft_modes(&self, structure: &Structure) -> Vec<DVector<f64>> {
        let n = structure.len();
        let dim = 3 * n;
        let mut hessian = DMatrix::<f64>::zeros(dim, dim);
        let cart = structure.cartesian_positions();
        let shifts = lattice_shifts(
            &structure.cell_matrix(),
            structure.image_range(self.config.rcut),
        );
        let decay = self.config.decay.max(1e-6);

        for i in 0..n {
            for j in (i + 1)..n {
                for shift in &shifts {
                    let d = cart[j] + shift - cart[i];
                    let r = d.norm();
                    if r < 1e-8 || r > self.config.rcut {
                        continue;
                    }
                    let k = (-r / decay).exp();
                    let u = d / r;
                    let block = u * u.transpose() * k;
                    for a in 0..3 {
                        for b in 0..3 {
                            let v = block[(a, b)];
                            hessian[(3 * i + a, 3 * i + b)] += v;
                            hessian[(3 * j + a, 3 * j + b)] += v;
                            hessian[(3 * i + a, 3 * j + b)] -= v;
                            hessian[(3 * j + a, 3 * i + b)] -= v;
                        }
                    }
                }
            }
        }

        let eigen = SymmetricEigen::new(hessian);
        let mut order: Vec<usize> = (0..dim).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
        order
            .into_iter()
            .skip(3)
            .map(|k| eigen.eigenvectors.column(k).into_owned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CandidateStatus, CellBounds};
    use rand::SeedableRng;

    fn rocksalt(id: u64) -> Candidate {
        let mg = [[0.0, 0.0, 0.0], [0.5, 0.5, 0.0], [0.5, 0.0, 0.5], [0.0, 0.5, 0.5]];
        let o = [[0.5, 0.0, 0.0], [0.0, 0.5, 0.0], [0.0, 0.0, 0.5], [0.5, 0.5, 0.5]];
        let species = ["Mg"; 4]
            .iter()
            .chain(["O"; 4].iter())
            .map(|s| s.to_string())
            .collect();
        let positions = mg.into_iter().chain(o).collect();
        let structure = Structure::new(species, positions, Matrix3::identity() * 4.2);
        let mut c = Candidate::unrelaxed(id, structure, 0, Vec::new(), "test");
        c.status = CandidateStatus::Relaxed;
        c.raw_score = Some(-5.0);
        c
    }

    fn blmin(ratio: f64) -> MinDistances {
        MinDistances::from_covalent_radii(&["Mg", "O"], ratio).unwrap()
    }

    #[test]
    fn test_strain_rescales_to_parent_volume() {
        let mut rng = StdRng::seed_from_u64(21);
        let op = StrainMutation::new(
            StrainConfig::default(),
            Constraints {
                blmin: blmin(0.5),
                cell_bounds: CellBounds::relaxation_default(),
            },
        );
        let parent = rocksalt(3);
        let child = op.produce(&parent, &mut rng).unwrap();
        assert!((child.structure.volume() - parent.volume()).abs() < 1e-6);
        assert_eq!(child.structure.positions, parent.structure.positions);
        assert_ne!(child.structure.cell, parent.structure.cell);
        assert_eq!(child.parents, vec![3]);
    }

    #[test]
    fn test_strain_uses_scaling_volume() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut op = StrainMutation::new(
            StrainConfig::default(),
            Constraints {
                blmin: blmin(0.5),
                cell_bounds: CellBounds::relaxation_default(),
            },
        );
        op.scaling_volume = Some(90.0);
        let child = op.produce(&rocksalt(1), &mut rng).unwrap();
        assert!((child.structure.volume() - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_soft_modes_skip_translations() {
        let op = SoftMutation::new(SoftMutationConfig::default(), blmin(0.1));
        let modes = op.soft_modes(&rocksalt(1).structure);
        assert_eq!(modes.len(), 3 * 8 - 3);
        for mode in &modes {
            assert!((mode.norm() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_soft_mutation_displaces_atoms() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut op = SoftMutation::new(SoftMutationConfig::default(), blmin(0.0));
        let parent = rocksalt(4);

        let child = op.produce(&parent, &mut rng).unwrap();
        assert_eq!(child.structure.composition(), parent.structure.composition());
        assert_eq!(child.structure.cell, parent.structure.cell);
        assert_ne!(child.structure.positions, parent.structure.positions);
        assert_eq!(child.description, "soft mutation: 4");
        assert_eq!(op.used_modes(4), 1);
    }

    #[test]
    fn test_soft_mutation_fails_when_lower_bound_too_large() {
        let mut rng = StdRng::seed_from_u64(9);
        let config = SoftMutationConfig {
            bounds: (50.0, 60.0),
            ..Default::default()
        };
        // Minimal distances of tens of Å cannot hold in a 4.2 Å cell.
        let mut op = SoftMutation::new(config, blmin(40.0));
        assert!(matches!(
            op.produce(&rocksalt(4), &mut rng),
            Err(OperatorError::Constraints(_))
        ));
    }

    #[test]
    fn test_soft_mutation_exhausts_modes() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut op = SoftMutation::new(SoftMutationConfig::default(), blmin(0.0));
        let parent = rocksalt(7);
        for _ in 0..(3 * 8 - 3) {
            let _ = op.produce(&parent, &mut rng);
        }
        assert!(matches!(
            op.produce(&parent, &mut rng),
            Err(OperatorError::ModesExhausted(7))
        ));
    }
}
