//! Cut-and-splice pairing.

use std::collections::BTreeMap;

use rand::Rng;
use rand::rngs::StdRng;

use crate::schema::{Candidate, PairingConfig, Structure};

use super::operators::{Constraints, Offspring, OperatorError};

/// Combines two parents across a random plane parallel to a cell face.
///
/// The child cell is a random blend of the parent cells. Atoms below the
/// cut come from the first parent; the remaining atoms of each species come
/// from the top of the second parent, so the composition always matches.
#[derive(Debug, Clone)]
pub struct CutAndSplicePairing {
    config: PairingConfig,
    constraints: Constraints,
    /// Target volume of offspring; the blended cell volume when unset.
    pub scaling_volume: Option<f64>,
}

impl CutAndSplicePairing {
    pub fn new(config: PairingConfig, constraints: Constraints) -> Self {
        Self {
            config,
            constraints,
            scaling_volume: None,
        }
    }

    pub fn produce(
        &self,
        a: &Candidate,
        b: &Candidate,
        rng: &mut StdRng,
    ) -> Result<Offspring, OperatorError> {
        if a.id == b.id {
            return Err(OperatorError::IncompatibleParents(format!(
                "candidate {} paired with itself",
                a.id
            )));
        }
        let composition = a.structure.composition();
        if composition != b.structure.composition() {
            return Err(OperatorError::IncompatibleParents(format!(
                "compositions of {} and {} differ",
                a.id, b.id
            )));
        }
        if a.structure.is_empty() {
            return Err(OperatorError::IncompatibleParents(
                "parents have no atoms".to_string(),
            ));
        }

        for _ in 0..self.config.max_attempts {
            if let Some(structure) = self.attempt(&a.structure, &b.structure, &composition, rng) {
                return Ok(Offspring {
                    structure,
                    parents: vec![a.id, b.id],
                    description: format!("pairing: {} {}", a.id, b.id),
                });
            }
        }
        Err(OperatorError::AttemptsExhausted {
            operator: "pairing",
            attempts: self.config.max_attempts,
        })
    }

    fn attempt(
        &self,
        a: &Structure,
        b: &Structure,
        composition: &BTreeMap<String, usize>,
        rng: &mut StdRng,
    ) -> Option<Structure> {
        let w: f64 = rng.r#gen();
        let cell = a.cell_matrix() * w + b.cell_matrix() * (1.0 - w);
        let top = translated(a, self.config.p1, rng);
        let bottom = translated(b, self.config.p2, rng);

        let axis = rng.gen_range(0..3);
        let cut: f64 = rng.r#gen();

        let mut species = Vec::with_capacity(a.len());
        let mut positions = Vec::with_capacity(a.len());
        let mut from_first = 0;
        for (symbol, &count) in composition {
            let below: Vec<[f64; 3]> = of_species(&top, symbol)
                .filter(|p| p[axis] < cut)
                .take(count)
                .collect();
            from_first += below.len();

            let mut rest: Vec<[f64; 3]> = of_species(&bottom, symbol).collect();
            rest.sort_by(|p, q| q[axis].total_cmp(&p[axis]));
            rest.truncate(count - below.len());

            for p in below.into_iter().chain(rest) {
                species.push(symbol.clone());
                positions.push(p);
            }
        }

        let share = from_first as f64 / a.len() as f64;
        if share < self.config.minfrac || 1.0 - share < self.config.minfrac {
            return None;
        }

        let mut child = Structure::new(species, positions, cell);
        child.pbc = a.pbc;
        if let Some(volume) = self.scaling_volume {
            child.scale_to_volume(volume);
        }
        child.wrap();
        self.constraints.accepts(&child).then_some(child)
    }
}

/// Copy of the structure, randomly translated with probability `p`.
fn translated(structure: &Structure, p: f64, rng: &mut StdRng) -> Structure {
    let mut copy = structure.clone();
    if rng.r#gen::<f64>() < p {
        let offset: [f64; 3] = rng.r#gen();
        for position in &mut copy.positions {
            for axis in 0..3 {
                position[axis] += offset[axis];
            }
        }
    }
    copy.wrap();
    copy
}

fn of_species<'a>(
    structure: &'a Structure,
    symbol: &'a str,
) -> impl Iterator<Item = [f64; 3]> + 'a {
    structure
        .species
        .iter()
        .zip(&structure.positions)
        .filter(move |(s, _)| s.as_str() == symbol)
        .map(|(_, p)| *p)
}
