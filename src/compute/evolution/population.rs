//! Survivor population with fitness-biased parent selection.

use std::collections::{BTreeSet, HashMap};

use rand::Rng;
use rand::rngs::StdRng;

use crate::compute::comparator::Comparator;
use crate::schema::{Candidate, CandidateStatus};

/// Population errors.
#[derive(Debug, thiserror::Error)]
pub enum PopulationError {
    #[error("Need at least two candidates to select parents, have {0}")]
    TooFewCandidates(usize),
}

/// Summary statistics of the current population.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PopulationStats {
    pub best: f64,
    pub worst: f64,
    pub mean: f64,
    /// Population (not sample) standard deviation.
    pub stdev: f64,
    pub len: usize,
}

/// The working population: relaxed survivors plus, during reproduction,
/// synthetic diversification donors.
pub struct Population {
    size: usize,
    members: Vec<Candidate>,
    comparator: Box<dyn Comparator>,
    participation: HashMap<u64, usize>,
    extinct: BTreeSet<u64>,
}

impl Population {
    pub fn new(size: usize, comparator: Box<dyn Comparator>) -> Self {
        Self {
            size,
            members: Vec::new(),
            comparator,
            participation: HashMap::new(),
            extinct: BTreeSet::new(),
        }
    }

    /// Seed from a list of candidates (typically the store's relaxed ones).
    pub fn initialize(&mut self, candidates: Vec<Candidate>) {
        self.members = candidates;
        self.update();
    }

    /// Target number of survivors.
    pub fn target_size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Current members, best first after `update()`.
    pub fn get_current_population(&self) -> &[Candidate] {
        &self.members
    }

    /// Best relaxed member.
    pub fn best(&self) -> Option<&Candidate> {
        self.members
            .iter()
            .filter(|c| c.is_relaxed())
            .max_by(|a, b| a.score().total_cmp(&b.score()).then(b.id.cmp(&a.id)))
    }

    /// IDs removed as duplicates of a better candidate.
    pub fn extinct(&self) -> &BTreeSet<u64> {
        &self.extinct
    }

    /// How often a candidate has been chosen as a parent.
    pub fn participation(&self, id: u64) -> usize {
        self.participation.get(&id).copied().unwrap_or(0)
    }

    /// Add a relaxed offspring. Anything else is refused.
    pub fn admit(&mut self, candidate: Candidate) -> bool {
        if !candidate.is_relaxed() {
            log::debug!(
                "Refusing candidate {} with status {:?}",
                candidate.id,
                candidate.status
            );
            return false;
        }
        self.members.push(candidate);
        true
    }

    /// Add a diversification donor with an assigned score.
    pub fn add_synthetic(&mut self, candidate: Candidate) {
        debug_assert_eq!(candidate.status, CandidateStatus::Synthetic);
        self.members.push(candidate);
    }

    /// Purge all diversification donors.
    pub fn remove_synthetic(&mut self) -> usize {
        let before = self.members.len();
        self.members
            .retain(|c| c.status != CandidateStatus::Synthetic);
        before - self.members.len()
    }

    /// Number of diversification donors currently present.
    pub fn synthetic_count(&self) -> usize {
        self.members
            .iter()
            .filter(|c| c.status == CandidateStatus::Synthetic)
            .count()
    }

    /// Select survivors: relaxed only, best first, no duplicates, at most
    /// the target size. Calling it twice gives the same population.
    pub fn update(&mut self) {
        let mut pool: Vec<Candidate> = std::mem::take(&mut self.members)
            .into_iter()
            .filter(Candidate::is_relaxed)
            .collect();
        pool.sort_by(|a, b| b.score().total_cmp(&a.score()).then(a.id.cmp(&b.id)));
        pool.dedup_by_key(|c| c.id);
        self.comparator.prepare(&pool);

        let mut kept: Vec<Candidate> = Vec::with_capacity(self.size);
        for candidate in pool {
            if kept.len() >= self.size {
                break;
            }
            if kept
                .iter()
                .any(|k| self.comparator.are_duplicates(k, &candidate))
            {
                log::debug!("Candidate {} is a duplicate, marking extinct", candidate.id);
                self.extinct.insert(candidate.id);
                continue;
            }
            kept.push(candidate);
        }

        if kept.len() < self.size {
            log::warn!(
                "Population has {} distinct relaxed candidates, below target {}",
                kept.len(),
                self.size
            );
        }
        self.members = kept;
    }

    /// Normalised fitness of each member, damped by how often it was paired.
    fn fitness(&self) -> Vec<f64> {
        let scores: Vec<f64> = self.members.iter().map(Candidate::score).collect();
        let s_max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let s_min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let spread = s_min - s_max;

        self.members
            .iter()
            .zip(&scores)
            .map(|(candidate, &s)| {
                let f = if spread.abs() < f64::EPSILON {
                    1.0
                } else {
                    0.5 * (1.0 - (2.0 * (s - s_max) / spread - 1.0).tanh())
                };
                f / (1.0 + self.participation(candidate.id) as f64).sqrt()
            })
            .collect()
    }

    /// Draw two distinct parents by acceptance sampling on fitness.
    pub fn get_two_candidates(
        &mut self,
        rng: &mut StdRng,
    ) -> Result<(Candidate, Candidate), PopulationError> {
        let n = self.members.len();
        if n < 2 {
            return Err(PopulationError::TooFewCandidates(n));
        }
        let fitness = self.fitness();
        let f_max = fitness.iter().copied().fold(0.0, f64::max);

        let pick = |exclude: Option<usize>, rng: &mut StdRng| loop {
            let t = rng.gen_range(0..n);
            if Some(t) == exclude {
                continue;
            }
            if fitness[t] > rng.r#gen::<f64>() * f_max {
                return t;
            }
        };
        let first = pick(None, rng);
        let second = pick(Some(first), rng);

        let a = self.members[first].clone();
        let b = self.members[second].clone();
        *self.participation.entry(a.id).or_insert(0) += 1;
        *self.participation.entry(b.id).or_insert(0) += 1;
        Ok((a, b))
    }

    /// Statistics over the members' raw scores.
    pub fn stats(&self) -> PopulationStats {
        let scores: Vec<f64> = self
            .members
            .iter()
            .filter_map(|c| c.raw_score)
            .filter(|s| s.is_finite())
            .collect();
        if scores.is_empty() {
            return PopulationStats {
                best: f64::NEG_INFINITY,
                worst: f64::NEG_INFINITY,
                mean: 0.0,
                stdev: 0.0,
                len: self.members.len(),
            };
        }
        let n = scores.len() as f64;
        let mean = scores.iter().sum::<f64>() / n;
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        PopulationStats {
            best: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            worst: scores.iter().copied().fold(f64::INFINITY, f64::min),
            mean,
            stdev: variance.sqrt(),
            len: self.members.len(),
        }
    }
}
