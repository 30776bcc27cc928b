//! Random structure generation.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::schema::{
    Block, CellBounds, MinDistances, SplitWeight, Structure, cell_from_parameters, expand_blocks,
};

/// Structure generation errors.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Composition is empty")]
    EmptyComposition,
    #[error("Invalid target volume: {0}")]
    InvalidVolume(f64),
    #[error("No valid structure after {0} attempts")]
    AttemptsExhausted(usize),
}

/// Produces new unrelaxed structures for a composition and target volume.
pub trait StructureGenerator {
    fn generate(
        &self,
        blocks: &[Block],
        volume: f64,
        rng: &mut StdRng,
    ) -> Result<Structure, GenerationError>;
}

/// Placement attempts per atom before restarting with a new cell.
const ATOM_PLACEMENT_TRIES: usize = 200;

/// Random cells within bounds, filled atom by atom under minimal distances.
///
/// Split factors impose translational symmetry: with factors `[2]` the atoms
/// of a half cell are repeated twice along a randomly chosen axis.
#[derive(Debug, Clone)]
pub struct RandomStructureGenerator {
    cell_bounds: CellBounds,
    splits: Vec<SplitWeight>,
    blmin: MinDistances,
    max_attempts: usize,
}

impl RandomStructureGenerator {
    pub fn new(
        cell_bounds: CellBounds,
        splits: Vec<SplitWeight>,
        blmin: MinDistances,
        max_attempts: usize,
    ) -> Self {
        Self {
            cell_bounds,
            splits,
            blmin,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Pick repetition counts per axis.
    fn choose_repeats(&self, counts: &[usize], rng: &mut StdRng) -> [u32; 3] {
        let mut repeats = [1u32; 3];
        let Ok(index) = WeightedIndex::new(self.splits.iter().map(|s| s.weight)) else {
            return repeats;
        };
        let factors = &self.splits[index.sample(rng)].factors;

        let mut axes = [0usize, 1, 2];
        axes.shuffle(rng);
        for (k, factor) in factors.iter().enumerate() {
            repeats[axes[k % 3]] *= *factor;
        }

        let total: u32 = repeats.iter().product();
        if counts.iter().any(|c| *c % total as usize != 0) {
            return [1; 3];
        }
        repeats
    }

    fn random_cell(&self, volume: f64, rng: &mut StdRng) -> Option<Structure> {
        let b = &self.cell_bounds;
        let mut uniform = |(lo, hi): (f64, f64)| if lo < hi { rng.gen_range(lo..hi) } else { lo };
        let lengths = [uniform(b.a), uniform(b.b), uniform(b.c)];
        let angles = [uniform(b.alpha), uniform(b.beta), uniform(b.gamma)];

        let cell = cell_from_parameters(lengths, angles)?;
        let mut structure = Structure::new(Vec::new(), Vec::new(), cell);
        structure.scale_to_volume(volume);
        self.cell_bounds
            .is_within_bounds(&structure)
            .then_some(structure)
    }

    fn fill(
        &self,
        mut structure: Structure,
        unit: &[String],
        repeats: [u32; 3],
        rng: &mut StdRng,
    ) -> Option<Structure> {
        for symbol in unit {
            let mut placed = false;
            for _ in 0..ATOM_PLACEMENT_TRIES {
                let base = [
                    rng.r#gen::<f64>() / repeats[0] as f64,
                    rng.r#gen::<f64>() / repeats[1] as f64,
                    rng.r#gen::<f64>() / repeats[2] as f64,
                ];
                let images = replicate(base, repeats);
                if self.fits(&structure, symbol, &images) {
                    for p in images {
                        structure.species.push(symbol.clone());
                        structure.positions.push(p);
                    }
                    placed = true;
                    break;
                }
            }
            if !placed {
                return None;
            }
        }
        Some(structure)
    }

    fn fits(&self, structure: &Structure, symbol: &str, images: &[[f64; 3]]) -> bool {
        let self_limit = self.blmin.get(symbol, symbol);
        for (k, p) in images.iter().enumerate() {
            for (other_symbol, q) in structure.species.iter().zip(&structure.positions) {
                if structure.min_image_distance(p, q) < self.blmin.get(symbol, other_symbol) {
                    return false;
                }
            }
            for q in &images[k + 1..] {
                if structure.min_image_distance(p, q) < self_limit {
                    return false;
                }
            }
        }
        true
    }
}

impl StructureGenerator for RandomStructureGenerator {
    fn generate(
        &self,
        blocks: &[Block],
        volume: f64,
        rng: &mut StdRng,
    ) -> Result<Structure, GenerationError> {
        if !(volume.is_finite() && volume > 0.0) {
            return Err(GenerationError::InvalidVolume(volume));
        }
        let counts: Vec<usize> = blocks.iter().map(|b| b.count).collect();
        if counts.iter().sum::<usize>() == 0 {
            return Err(GenerationError::EmptyComposition);
        }

        for _ in 0..self.max_attempts {
            let repeats = self.choose_repeats(&counts, rng);
            let total: u32 = repeats.iter().product();
            let unit_blocks: Vec<Block> = blocks
                .iter()
                .map(|b| Block::new(b.species.clone(), b.count / total as usize))
                .collect();
            let unit = expand_blocks(&unit_blocks);

            let Some(cell) = self.random_cell(volume, rng) else {
                continue;
            };
            if let Some(mut structure) = self.fill(cell, &unit, repeats, rng) {
                structure.wrap();
                if !self.blmin.violated_by(&structure) {
                    return Ok(structure);
                }
            }
        }

        log::debug!(
            "Random generation failed after {} attempts at volume {:.1}",
            self.max_attempts,
            volume
        );
        Err(GenerationError::AttemptsExhausted(self.max_attempts))
    }
}

/// All translated copies of a sub-cell point.
fn replicate(base: [f64; 3], repeats: [u32; 3]) -> Vec<[f64; 3]> {
    let mut images = Vec::with_capacity(repeats.iter().product::<u32>() as usize);
    for i in 0..repeats[0] {
        for j in 0..repeats[1] {
            for k in 0..repeats[2] {
                images.push([
                    base[0] + i as f64 / repeats[0] as f64,
                    base[1] + j as f64 / repeats[1] as f64,
                    base[2] + k as f64 / repeats[2] as f64,
                ]);
            }
        }
    }
    images
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn generator(splits: Vec<SplitWeight>) -> RandomStructureGenerator {
        let blmin = MinDistances::from_covalent_radii(&["Mg", "O"], 0.5).unwrap();
        RandomStructureGenerator::new(CellBounds::generation_default(), splits, blmin, 500)
    }

    fn blocks() -> Vec<Block> {
        vec![Block::new("Mg", 4), Block::new("O", 4)]
    }

    #[test]
    fn test_generate_respects_composition_and_volume() {
        let mut rng = StdRng::seed_from_u64(42);
        let generator = generator(vec![SplitWeight::new(vec![1], 1.0)]);

        let s = generator.generate(&blocks(), 120.0, &mut rng).unwrap();
        assert_eq!(s.len(), 8);
        assert_eq!(s.composition()["Mg"], 4);
        assert!((s.volume() - 120.0).abs() < 1e-6);
        assert!(CellBounds::generation_default().is_within_bounds(&s));
    }

    #[test]
    fn test_split_produces_translated_copies() {
        let mut rng = StdRng::seed_from_u64(7);
        let generator = generator(vec![SplitWeight::new(vec![2], 1.0)]);

        let s = generator.generate(&blocks(), 160.0, &mut rng).unwrap();
        // Atoms come in pairs separated by half a lattice vector.
        let shift: Vec<f64> = (0..3)
            .map(|axis| (s.positions[1][axis] - s.positions[0][axis]).rem_euclid(1.0))
            .collect();
        assert!(shift.iter().any(|d| (d - 0.5).abs() < 1e-9));
    }

    #[test]
    fn test_rejects_invalid_volume() {
        let mut rng = StdRng::seed_from_u64(1);
        let generator = generator(vec![SplitWeight::new(vec![1], 1.0)]);
        assert!(matches!(
            generator.generate(&blocks(), -1.0, &mut rng),
            Err(GenerationError::InvalidVolume(_))
        ));
    }

    #[test]
    fn test_indivisible_split_falls_back() {
        let mut rng = StdRng::seed_from_u64(3);
        let generator = generator(vec![SplitWeight::new(vec![3], 1.0)]);
        assert_eq!(generator.choose_repeats(&[4, 4], &mut rng), [1, 1, 1]);
    }
}
