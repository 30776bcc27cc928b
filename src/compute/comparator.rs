//! Duplicate detection between candidates.
//!
//! Structures are compared through per-species-pair radial fingerprints:
//! smeared pair-distance histograms normalised by the ideal-gas density, so
//! that an uncorrelated arrangement gives zero. Two candidates are duplicates
//! when their energies are close and the weighted cosine distance of their
//! fingerprints is below a threshold.

use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};

use rayon::prelude::*;

use crate::schema::{Candidate, ComparatorConfig, Structure};

use super::evaluator::lattice_shifts;

/// Decides whether two candidates represent the same structure.
pub trait Comparator {
    fn are_duplicates(&self, a: &Candidate, b: &Candidate) -> bool;

    /// Precompute whatever is needed to compare these candidates.
    fn prepare(&self, _candidates: &[Candidate]) {}
}

/// Radial fingerprint of one structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    /// Histogram per sorted species pair.
    pub pairs: BTreeMap<(String, String), Vec<f64>>,
    /// Pair weights `N_A·N_B / Σ N_A·N_B`.
    pub weights: BTreeMap<(String, String), f64>,
}

impl Fingerprint {
    /// Compute the fingerprint of a structure.
    pub fn compute(structure: &Structure, config: &ComparatorConfig) -> Self {
        let mut structure = structure.clone();
        structure.wrap();

        let composition = structure.composition();
        let volume = structure.volume();
        let nbins = (config.rcut / config.binwidth).ceil() as usize;
        let window = (config.nsigma as f64 * config.sigma / config.binwidth).ceil() as i64;
        let norm = 1.0 / (config.sigma * (2.0 * PI).sqrt());

        let symbols: Vec<&String> = composition.keys().collect();
        let mut pairs = BTreeMap::new();
        let mut weights = BTreeMap::new();
        let mut weight_sum = 0.0;
        for (i, a) in symbols.iter().enumerate() {
            for b in &symbols[i..] {
                let w = (composition[*a] * composition[*b]) as f64;
                weight_sum += w;
                weights.insert(((*a).clone(), (*b).clone()), w);
                pairs.insert(((*a).clone(), (*b).clone()), vec![0.0; nbins]);
            }
        }
        if weight_sum > 0.0 {
            for w in weights.values_mut() {
                *w /= weight_sum;
            }
        }

        if volume <= 0.0 || structure.is_empty() {
            return Self { pairs, weights };
        }

        let cart = structure.cartesian_positions();
        let shifts = lattice_shifts(&structure.cell_matrix(), structure.image_range(config.rcut));

        for i in 0..structure.len() {
            for j in 0..structure.len() {
                let key = sorted_pair(&structure.species[i], &structure.species[j]);
                let Some(histogram) = pairs.get_mut(&key) else {
                    continue;
                };
                let density = (composition[&key.0] * composition[&key.1]) as f64 / volume;
                // Unordered pairs of distinct species are visited in both
                // orders; halve their weight to count each once.
                let multiplicity = if key.0 == key.1 { 1.0 } else { 0.5 };

                for shift in &shifts {
                    let r = (cart[j] + shift - cart[i]).norm();
                    if r < 1e-8 || r > config.rcut {
                        continue;
                    }
                    let scale = multiplicity / (4.0 * PI * r * r * density);
                    let center = (r / config.binwidth) as i64;
                    for bin in (center - window).max(0)..=(center + window).min(nbins as i64 - 1) {
                        let rb = (bin as f64 + 0.5) * config.binwidth;
                        let x = (rb - r) / config.sigma;
                        histogram[bin as usize] += scale * norm * (-0.5 * x * x).exp();
                    }
                }
            }
        }

        for histogram in pairs.values_mut() {
            for value in histogram.iter_mut() {
                *value -= 1.0;
            }
        }

        Self { pairs, weights }
    }

    /// Weighted cosine distance in `[0, 1]`.
    pub fn cosine_distance(&self, other: &Fingerprint) -> f64 {
        let mut dot = 0.0;
        let mut norm_a = 0.0;
        let mut norm_b = 0.0;
        for (key, a) in &self.pairs {
            let Some(b) = other.pairs.get(key) else {
                continue;
            };
            let w = self.weights.get(key).copied().unwrap_or(0.0);
            for (x, y) in a.iter().zip(b) {
                dot += w * x * y;
                norm_a += w * x * x;
                norm_b += w * y * y;
            }
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return if norm_a == norm_b { 0.0 } else { 1.0 };
        }
        let cos = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
        0.5 * (1.0 - cos)
    }
}

fn sorted_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Energy threshold followed by fingerprint cosine distance.
///
/// Fingerprints of relaxed candidates are cached by ID; relaxed geometry
/// never changes after it is stored.
pub struct FingerprintComparator {
    config: ComparatorConfig,
    cache: Mutex<HashMap<u64, Arc<Fingerprint>>>,
}

impl FingerprintComparator {
    pub fn new(config: ComparatorConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fingerprint of a candidate, cached when the candidate is relaxed.
    pub fn fingerprint(&self, candidate: &Candidate) -> Arc<Fingerprint> {
        if !candidate.is_relaxed() {
            return Arc::new(Fingerprint::compute(&candidate.structure, &self.config));
        }
        if let Some(fp) = self.lock_cache().get(&candidate.id) {
            return Arc::clone(fp);
        }
        let fp = Arc::new(Fingerprint::compute(&candidate.structure, &self.config));
        self.lock_cache().insert(candidate.id, Arc::clone(&fp));
        fp
    }

    /// Number of cached fingerprints.
    pub fn cached(&self) -> usize {
        self.lock_cache().len()
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<u64, Arc<Fingerprint>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Comparator for FingerprintComparator {
    fn are_duplicates(&self, a: &Candidate, b: &Candidate) -> bool {
        if let (Some(sa), Some(sb)) = (a.raw_score, b.raw_score)
            && (sa - sb).abs() >= self.config.d_e
        {
            return false;
        }
        if a.structure.composition() != b.structure.composition() {
            return false;
        }
        let distance = self.fingerprint(a).cosine_distance(&self.fingerprint(b));
        distance < self.config.cos_dist_max
    }

    fn prepare(&self, candidates: &[Candidate]) {
        let missing: Vec<&Candidate> = {
            let cache = self.lock_cache();
            candidates
                .iter()
                .filter(|c| c.is_relaxed() && !cache.contains_key(&c.id))
                .collect()
        };
        if missing.is_empty() {
            return;
        }
        let computed: Vec<(u64, Arc<Fingerprint>)> = missing
            .par_iter()
            .map(|c| (c.id, Arc::new(Fingerprint::compute(&c.structure, &self.config))))
            .collect();
        log::debug!("Computed {} fingerprints", computed.len());
        self.lock_cache().extend(computed);
    }
}
