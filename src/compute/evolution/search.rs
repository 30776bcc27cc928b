//! The generational search loop.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::compute::comparator::{Comparator, FingerprintComparator};
use crate::compute::evaluator::{EnergyEvaluator, evaluator_from_config};
use crate::compute::generator::{GenerationError, RandomStructureGenerator, StructureGenerator};
use crate::compute::relax::{RelaxOutcome, Relaxer};
use crate::compute::store::{CandidateStore, JsonStore, MemoryStore, StoreError};
use crate::schema::{
    Candidate, ConfigError, DiversityFitness, GenerationRecord, SearchConfig, SearchHistory,
    SearchPhase, SearchProgress, SearchResult, SearchStats, StopReason,
};

use super::archive::RunArtifacts;
use super::operators::{OperatorError, OperatorSelector, top_mean_volume};
use super::population::{Population, PopulationStats};

/// Errors that abort a search.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Seed generation failed: {0}")]
    Seeding(#[from] GenerationError),
    #[error("Only {0} relaxed candidates available, need at least 2")]
    EmptyPopulation(usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&SearchProgress) + Send + Sync>;

/// What became of one reproduction slot.
enum SlotOutcome {
    Admitted(Candidate),
    Killed,
    Failed,
}

/// Runs the generational loop over a candidate store.
pub struct EvolutionController {
    config: SearchConfig,
    rng: StdRng,
    generator: Box<dyn StructureGenerator>,
    diversifier: Box<dyn StructureGenerator>,
    relaxer: Relaxer,
    store: Box<dyn CandidateStore>,
    population: Population,
    operators: OperatorSelector,
    artifacts: Option<RunArtifacts>,
    history: SearchHistory,
    phase: SearchPhase,
    generation: usize,
    best_ever: f64,
    best_candidate: Option<Candidate>,
    stagnation_count: usize,
    relaxations: u64,
    killed: u64,
    operator_failures: u64,
    next_id: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
}

impl EvolutionController {
    /// Build a controller with the reference collaborators described by the
    /// configuration.
    pub fn new(config: SearchConfig, store: Box<dyn CandidateStore>) -> Result<Self, SearchError> {
        config.validate()?;

        let seed = config.random_seed.unwrap_or_else(rand::random);
        log::info!("Random seed: {}", seed);
        let rng = StdRng::seed_from_u64(seed);

        let blmin = config.min_distances(config.generator.min_distance_ratio)?;
        let generator = RandomStructureGenerator::new(
            config.generator.cell_bounds,
            config.generator.splits.clone(),
            blmin.clone(),
            config.generator.max_attempts,
        );
        let diversifier = RandomStructureGenerator::new(
            config.diversification.cell_bounds,
            config.diversification.splits.clone(),
            blmin,
            config.generator.max_attempts,
        );

        let operators = OperatorSelector::from_config(
            &config.operators,
            config.min_distances(config.operators.min_distance_ratio)?,
            config.min_distances(config.operators.soft.min_distance_ratio)?,
        )?;

        let work_dir = config.output_dir.as_ref().map(|dir| dir.join("relax"));
        let evaluator = evaluator_from_config(&config.evaluator, work_dir);
        let relaxer = Relaxer::new(evaluator, config.evaluator.pressure_gpa)
            .with_cell_bounds(config.cell_bounds);

        let population = Population::new(
            config.population.size,
            Box::new(FingerprintComparator::new(config.comparator.clone())),
        );
        let artifacts = config
            .output_dir
            .as_ref()
            .map(RunArtifacts::new)
            .transpose()?;

        Ok(Self {
            config,
            rng,
            generator: Box::new(generator),
            diversifier: Box::new(diversifier),
            relaxer,
            store,
            population,
            operators,
            artifacts,
            history: SearchHistory::default(),
            phase: SearchPhase::default(),
            generation: 0,
            best_ever: f64::NEG_INFINITY,
            best_candidate: None,
            stagnation_count: 0,
            relaxations: 0,
            killed: 0,
            operator_failures: 0,
            next_id: Arc::new(AtomicU64::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Build a controller whose store lives in the output directory, or in
    /// memory when none is configured.
    pub fn from_config(config: SearchConfig) -> Result<Self, SearchError> {
        let store: Box<dyn CandidateStore> = match &config.output_dir {
            Some(dir) => Box::new(JsonStore::open(dir)?),
            None => Box::new(MemoryStore::new()),
        };
        Self::new(config, store)
    }

    /// Replace the seed structure generator.
    pub fn with_generator(mut self, generator: Box<dyn StructureGenerator>) -> Self {
        self.generator = generator;
        self
    }

    /// Replace the diversification structure generator.
    pub fn with_diversifier(mut self, generator: Box<dyn StructureGenerator>) -> Self {
        self.diversifier = generator;
        self
    }

    /// Replace the energy evaluator.
    pub fn with_evaluator(mut self, evaluator: Box<dyn EnergyEvaluator>) -> Self {
        self.relaxer = Relaxer::new(evaluator, self.config.evaluator.pressure_gpa)
            .with_cell_bounds(self.config.cell_bounds);
        self
    }

    /// Replace the duplicate comparator.
    pub fn with_comparator(mut self, comparator: Box<dyn Comparator>) -> Self {
        self.population = Population::new(self.config.population.size, comparator);
        self
    }

    /// Replace the operator mix.
    pub fn with_operators(mut self, operators: OperatorSelector) -> Self {
        self.operators = operators;
        self
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn store(&self) -> &dyn CandidateStore {
        self.store.as_ref()
    }

    pub fn population(&self) -> &Population {
        &self.population
    }

    pub fn operators(&self) -> &OperatorSelector {
        &self.operators
    }

    pub fn history(&self) -> &SearchHistory {
        &self.history
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ========================================================================
    // Seeding
    // ========================================================================

    /// Generate (if the store is empty) and relax the starting candidates,
    /// then initialise the population from everything relaxed so far.
    pub fn seed(&mut self) -> Result<(), SearchError> {
        self.phase = SearchPhase::Seeding;
        let first_free = self.store.max_id()?.map_or(0, |id| id + 1);
        self.next_id.fetch_max(first_free, Ordering::Relaxed);

        let resuming = self.store.candidate_count()? > 0;
        if !resuming {
            log::info!(
                "Generating {} random seed candidates",
                self.config.population.seed_size
            );
            for _ in 0..self.config.population.seed_size {
                let structure = self.generator.generate(
                    &self.config.composition,
                    self.config.generator.volume,
                    &mut self.rng,
                )?;
                let candidate =
                    Candidate::unrelaxed(self.allocate_id(), structure, 0, Vec::new(), "random");
                self.store.add_unrelaxed(&candidate)?;
            }
        } else {
            log::info!(
                "Resuming from store with {} candidates",
                self.store.candidate_count()?
            );
        }

        let summary = self.relaxer.relax_generation(self.store.as_mut())?;
        self.relaxations += (summary.relaxed + summary.killed) as u64;
        self.killed += summary.killed as u64;

        let relaxed = self.store.all_relaxed()?;
        self.generation = relaxed.iter().map(|c| c.generation).max().unwrap_or(0);
        self.population.initialize(relaxed);
        if self.population.len() < 2 {
            return Err(SearchError::EmptyPopulation(self.population.len()));
        }
        self.improve_best();

        // A resumed run keeps the snapshot it already wrote.
        if let Some(artifacts) = &self.artifacts
            && !(resuming && artifacts.population_path(self.generation).exists())
        {
            artifacts.save_population(self.generation, self.population.get_current_population())?;
        }
        log::info!(
            "Seeded population with {} candidates, best raw score {:.4}",
            self.population.len(),
            self.best_ever
        );
        Ok(())
    }

    // ========================================================================
    // Generation
    // ========================================================================

    /// Run one generation and return its record.
    pub fn step(&mut self) -> Result<GenerationRecord, SearchError> {
        self.generation += 1;
        let generation = self.generation;

        self.phase = SearchPhase::GenerationStart;
        let snapshot = self.population.stats();

        self.phase = SearchPhase::Diversifying;
        let injected = self.diversify(&snapshot, generation);

        self.phase = SearchPhase::Reproducing;
        let mut offspring = Vec::new();
        let mut killed = 0;
        let mut failed_slots = 0;
        for _ in 0..self.config.population.size {
            if self.cancelled.load(Ordering::Relaxed) {
                break;
            }
            match self.reproduce(generation)? {
                SlotOutcome::Admitted(candidate) => offspring.push(candidate),
                SlotOutcome::Killed => killed += 1,
                SlotOutcome::Failed => failed_slots += 1,
            }
        }

        self.phase = SearchPhase::Admitting;
        let admitted = offspring
            .into_iter()
            .filter(|c| self.population.admit(c.clone()))
            .count();

        self.phase = SearchPhase::SelectingSurvivors;
        self.population.remove_synthetic();
        self.population.update();
        let adapt = &self.config.operators.adapt;
        self.operators.update_scaling_volume(
            self.population.get_current_population(),
            adapt.w_adapt,
            adapt.n_adapt,
        );

        self.phase = SearchPhase::CheckingStop;
        if self.improve_best() {
            self.stagnation_count = 0;
        } else {
            self.stagnation_count += 1;
        }

        let stats = self.population.stats();
        let record = GenerationRecord {
            generation,
            best: stats.best,
            mean: stats.mean,
            stdev: stats.stdev,
            best_ever: self.best_ever,
            stagnation: self.stagnation_count,
            population: stats.len,
            admitted,
            killed,
            failed_slots,
            injected,
        };
        self.history.records.push(record.clone());

        if let Some(artifacts) = &self.artifacts {
            artifacts.save_population(generation, self.population.get_current_population())?;
            artifacts.append_history(&record)?;
        }

        log::info!(
            "Generation {}: best = {:.4}, mean = {:.4}, std = {:.4}, admitted {}, killed {}, stagnation {}",
            generation,
            stats.best,
            stats.mean,
            stats.stdev,
            admitted,
            killed,
            self.stagnation_count
        );
        Ok(record)
    }

    /// Inject synthetic donors built around the best volumes.
    fn diversify(&mut self, snapshot: &PopulationStats, generation: usize) -> usize {
        let count = self.config.population.diversification_count();
        if count == 0 {
            return 0;
        }
        let members = self.population.get_current_population();
        let top = (self.config.diversification.top_fraction * members.len() as f64).ceil() as usize;
        let Some(volume) = top_mean_volume(members, top.max(1)) else {
            return 0;
        };
        // Identical scores leave nothing to sample; donors get the mean.
        let normal = Normal::new(snapshot.mean, snapshot.stdev)
            .ok()
            .filter(|_| snapshot.stdev > 0.0);

        let mut injected = 0;
        for _ in 0..count {
            let structure =
                match self
                    .diversifier
                    .generate(&self.config.composition, volume, &mut self.rng)
                {
                    Ok(structure) => structure,
                    Err(e) => {
                        log::warn!("Diversification candidate skipped: {}", e);
                        continue;
                    }
                };
            let score = match (self.config.diversification.fitness, &normal) {
                (DiversityFitness::SampledNormal, Some(normal)) => normal.sample(&mut self.rng),
                (DiversityFitness::SampledNormal, None) => snapshot.mean,
                (DiversityFitness::PopulationWorst, _) => snapshot.worst,
            };
            let candidate = Candidate::synthetic(self.allocate_id(), structure, generation, score);
            self.population.add_synthetic(candidate);
            injected += 1;
        }
        log::debug!(
            "Injected {} diversification candidates at volume {:.2}",
            injected,
            volume
        );
        injected
    }

    /// Fill one offspring slot, resampling parents on operator failure.
    fn reproduce(&mut self, generation: usize) -> Result<SlotOutcome, SearchError> {
        let attempts = self.config.population.max_operator_attempts;
        for _ in 0..attempts {
            let (a, b) = match self.population.get_two_candidates(&mut self.rng) {
                Ok(parents) => parents,
                Err(e) => {
                    log::warn!("Cannot select parents: {}", e);
                    return Ok(SlotOutcome::Failed);
                }
            };
            match self.operators.produce_offspring((&a, &b), &mut self.rng) {
                Ok(offspring) => {
                    let candidate = Candidate::unrelaxed(
                        self.allocate_id(),
                        offspring.structure,
                        generation,
                        offspring.parents,
                        offspring.description,
                    );
                    return self.evaluate(candidate);
                }
                Err(_) => self.operator_failures += 1,
            }
        }

        let error = OperatorError::AttemptsExhausted {
            operator: "reproduction",
            attempts,
        };
        log::warn!("Skipping offspring slot: {}", error);
        Ok(SlotOutcome::Failed)
    }

    fn evaluate(&mut self, candidate: Candidate) -> Result<SlotOutcome, SearchError> {
        self.store.add_unrelaxed(&candidate)?;
        log::debug!("Relaxing offspring {} ({})", candidate.id, candidate.description);
        self.relaxations += 1;
        match self.relaxer.relax(candidate, self.store.as_mut())? {
            RelaxOutcome::Relaxed(candidate) => Ok(SlotOutcome::Admitted(candidate)),
            RelaxOutcome::Killed { .. } => {
                self.killed += 1;
                Ok(SlotOutcome::Killed)
            }
        }
    }

    /// Record a new best-ever survivor. Returns whether it improved.
    fn improve_best(&mut self) -> bool {
        if let Some(best) = self.population.best()
            && best.score() > self.best_ever
        {
            self.best_ever = best.score();
            self.best_candidate = Some(best.clone());
            return true;
        }
        false
    }

    // ========================================================================
    // Driving
    // ========================================================================

    /// Check if the search should stop.
    fn should_stop(&self) -> Option<StopReason> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Some(StopReason::Cancelled);
        }
        if self.generation >= self.config.population.max_generations {
            return Some(StopReason::MaxGenerations);
        }
        if self.stagnation_count >= self.config.population.max_stagnation {
            return Some(StopReason::Stagnation);
        }
        None
    }

    /// Get current progress.
    pub fn progress(&self) -> SearchProgress {
        let stats = self.population.stats();
        SearchProgress {
            generation: self.generation,
            max_generations: self.config.population.max_generations,
            phase: self.phase,
            best_ever: self.best_ever,
            mean: stats.mean,
            stdev: stats.stdev,
            stagnation: self.stagnation_count,
            population: stats.len,
            best_candidate: self.best_candidate.clone(),
        }
    }

    /// Run the search with progress callback.
    pub fn run_with_callback<F>(&mut self, callback: F) -> Result<SearchResult, SearchError>
    where
        F: Fn(&SearchProgress),
    {
        let start_time = std::time::Instant::now();

        self.seed()?;
        let first_generation = self.generation;
        callback(&self.progress());

        let stop_reason = loop {
            if let Some(reason) = self.should_stop() {
                break reason;
            }
            self.step()?;
            callback(&self.progress());
        };
        self.phase = SearchPhase::Done;
        log::info!("Search stopped: {:?}", stop_reason);

        let best = self
            .best_candidate
            .clone()
            .ok_or(SearchError::EmptyPopulation(self.population.len()))?;
        let result = SearchResult {
            best,
            population: self.population.get_current_population().to_vec(),
            stats: SearchStats {
                generations: self.generation.saturating_sub(first_generation),
                relaxations: self.relaxations,
                killed: self.killed,
                operator_failures: self.operator_failures,
                best_raw_score: self.best_ever,
                elapsed_seconds: start_time.elapsed().as_secs_f64(),
                stop_reason,
            },
            history: self.history.clone(),
        };

        if let Some(artifacts) = &self.artifacts {
            artifacts.save_result(&result)?;
        }
        callback(&self.progress());
        Ok(result)
    }

    /// Run the search (blocking).
    pub fn run(&mut self) -> Result<SearchResult, SearchError> {
        self.run_with_callback(|_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::evaluator::{Evaluation, EvaluationError};
    use crate::schema::{Block, CandidateStatus, PopulationConfig, Structure, expand_blocks};
    use nalgebra::Matrix3;
    use rand::Rng;
    use std::collections::HashSet;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    /// Random positions in a cubic cell of the requested volume.
    struct CubicGenerator;

    impl StructureGenerator for CubicGenerator {
        fn generate(
            &self,
            blocks: &[Block],
            volume: f64,
            rng: &mut StdRng,
        ) -> Result<Structure, GenerationError> {
            let species = expand_blocks(blocks);
            let positions = species.iter().map(|_| rng.r#gen::<[f64; 3]>()).collect();
            Ok(Structure::new(
                species,
                positions,
                Matrix3::identity() * volume.cbrt(),
            ))
        }
    }

    /// Energy from a closure over the structure and the call index.
    struct FnEvaluator<F> {
        energy: F,
        calls: AtomicUsize,
    }

    impl<F> FnEvaluator<F>
    where
        F: Fn(&Structure, usize) -> Result<f64, EvaluationError>,
    {
        fn boxed(energy: F) -> Box<Self> {
            Box::new(Self {
                energy,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl<F> EnergyEvaluator for FnEvaluator<F>
    where
        F: Fn(&Structure, usize) -> Result<f64, EvaluationError>,
    {
        fn evaluate(
            &self,
            structure: &Structure,
            _pressure_gpa: f64,
        ) -> Result<Evaluation, EvaluationError> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(Evaluation {
                structure: structure.clone(),
                energy: (self.energy)(structure, call)?,
                spacegroup: None,
            })
        }
    }

    /// Duplicates share a raw score.
    struct ScoreComparator;

    impl Comparator for ScoreComparator {
        fn are_duplicates(&self, a: &Candidate, b: &Candidate) -> bool {
            (a.score() - b.score()).abs() < 1e-12
        }
    }

    fn config(size: usize, seed_size: usize) -> SearchConfig {
        SearchConfig {
            composition: vec![Block::new("O", 2)],
            population: PopulationConfig {
                size,
                seed_size,
                max_generations: 4,
                max_stagnation: 100,
                ..Default::default()
            },
            random_seed: Some(42),
            ..Default::default()
        }
    }

    /// Negative O–O distance, so larger separations score higher.
    fn separation(structure: &Structure, _call: usize) -> Result<f64, EvaluationError> {
        Ok(-structure.distance(0, 1))
    }

    fn controller(config: SearchConfig, evaluator: Box<dyn EnergyEvaluator>) -> EvolutionController {
        EvolutionController::new(config, Box::new(MemoryStore::new()))
            .unwrap()
            .with_generator(Box::new(CubicGenerator))
            .with_diversifier(Box::new(CubicGenerator))
            .with_evaluator(evaluator)
            .with_comparator(Box::new(ScoreComparator))
    }

    fn relaxed(id: u64, score: f64) -> Candidate {
        let structure = Structure::new(
            vec!["O".to_string(), "O".to_string()],
            vec![[0.0, 0.0, 0.0], [0.3 + 0.1 * id as f64, 0.4, 0.5]],
            Matrix3::identity() * 5.0,
        );
        let mut c = Candidate::unrelaxed(id, structure, 0, Vec::new(), "random");
        c.status = CandidateStatus::Relaxed;
        c.raw_score = Some(score);
        c.energy = Some(-score);
        c
    }

    #[test]
    fn test_generations_keep_population_invariants() {
        let mut controller = controller(config(6, 10), FnEvaluator::boxed(separation));
        controller.seed().unwrap();
        assert_eq!(controller.population().len(), 6);

        for _ in 0..4 {
            controller.step().unwrap();
            let population = controller.population().get_current_population();
            assert_eq!(population.len(), 6);
            assert!(population.iter().all(Candidate::is_relaxed));

            let ids: HashSet<u64> = population.iter().map(|c| c.id).collect();
            assert_eq!(ids.len(), population.len());
            for (i, a) in population.iter().enumerate() {
                for b in &population[i + 1..] {
                    assert!(!ScoreComparator.are_duplicates(a, b));
                }
            }
        }
    }

    #[test]
    fn test_best_ever_is_monotonic() {
        let mut controller = controller(config(6, 10), FnEvaluator::boxed(separation));
        let result = controller.run().unwrap();

        assert_eq!(result.stats.generations, 4);
        assert_eq!(result.stats.stop_reason, StopReason::MaxGenerations);
        assert_eq!(result.population.len(), 6);
        let best = result.history.best_ever();
        assert_eq!(best.len(), 4);
        assert!(best.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(result.stats.best_raw_score, *best.last().unwrap());
        assert_eq!(result.best.raw_score, Some(result.stats.best_raw_score));
    }

    #[test]
    fn test_generation_slots_and_diversification() {
        let mut controller = controller(config(20, 20), FnEvaluator::boxed(separation));
        controller.seed().unwrap();
        let record = controller.step().unwrap();

        assert_eq!(record.admitted + record.killed + record.failed_slots, 20);
        assert_eq!(record.injected, 4);
        assert_eq!(controller.population().synthetic_count(), 0);
        assert_eq!(controller.population().len(), 20);
    }

    fn donor_scores(controller: &EvolutionController) -> Vec<f64> {
        controller
            .population()
            .get_current_population()
            .iter()
            .filter(|c| c.status == CandidateStatus::Synthetic)
            .map(Candidate::score)
            .collect()
    }

    #[test]
    fn test_population_worst_scores_donors() {
        let mut cfg = config(10, 10);
        cfg.diversification.fitness = DiversityFitness::PopulationWorst;
        let mut controller = controller(cfg, FnEvaluator::boxed(separation));
        controller.seed().unwrap();

        let snapshot = controller.population().stats();
        let injected = controller.diversify(&snapshot, 1);

        assert_eq!(injected, 2);
        let scores = donor_scores(&controller);
        assert_eq!(scores.len(), 2);
        assert!(scores.iter().all(|&s| s == snapshot.worst));
    }

    #[test]
    fn test_sampled_donors_fall_back_to_mean() {
        let mut controller = controller(config(10, 10), FnEvaluator::boxed(separation));
        controller.seed().unwrap();

        let snapshot = PopulationStats {
            best: -2.0,
            worst: -2.0,
            mean: -2.0,
            stdev: 0.0,
            len: 10,
        };
        assert_eq!(controller.diversify(&snapshot, 1), 2);
        assert!(donor_scores(&controller).iter().all(|&s| s == -2.0));
    }

    #[test]
    fn test_killed_never_selected() {
        // Every other relaxation fails.
        let evaluator = FnEvaluator::boxed(|s: &Structure, call: usize| {
            if call % 2 == 1 {
                Err(EvaluationError::NotConverged(0))
            } else {
                Ok(-s.distance(0, 1))
            }
        });
        let mut controller = controller(config(6, 12), evaluator);
        let result = controller.run().unwrap();

        assert!(result.stats.killed > 0);
        for candidate in &result.population {
            let stored = controller.store().get(candidate.id).unwrap().unwrap();
            assert_eq!(stored.status, CandidateStatus::Relaxed);
        }
    }

    #[test]
    fn test_stagnation_stops_search() {
        // Seeds score 1..=8; every offspring is worse than all of them.
        let evaluator = FnEvaluator::boxed(|_: &Structure, call: usize| {
            if call < 8 {
                Ok(-(call as f64 + 1.0))
            } else {
                Ok(100.0 + call as f64)
            }
        });
        let mut cfg = config(4, 8);
        cfg.population.max_stagnation = 3;
        cfg.population.max_generations = 50;
        let mut controller = controller(cfg, evaluator);
        let result = controller.run().unwrap();

        assert_eq!(result.stats.stop_reason, StopReason::Stagnation);
        assert_eq!(result.stats.generations, 3);
        assert_eq!(result.stats.best_raw_score, 8.0);
    }

    #[test]
    fn test_failing_relaxations_keep_valid_seed() {
        let evaluator =
            FnEvaluator::boxed(|_: &Structure, _: usize| Err(EvaluationError::NotConverged(0)));
        let mut store = MemoryStore::new();
        store.add_relaxed(&relaxed(0, 1.0)).unwrap();
        store.add_relaxed(&relaxed(1, 2.0)).unwrap();

        let mut cfg = config(20, 0);
        cfg.population.max_generations = 2;
        let mut controller = EvolutionController::new(cfg, Box::new(store))
            .unwrap()
            .with_generator(Box::new(CubicGenerator))
            .with_diversifier(Box::new(CubicGenerator))
            .with_evaluator(evaluator)
            .with_comparator(Box::new(ScoreComparator));
        let result = controller.run().unwrap();

        let mut scores: Vec<f64> = result.population.iter().map(Candidate::score).collect();
        scores.sort_by(f64::total_cmp);
        assert_eq!(scores, vec![1.0, 2.0]);
        assert_eq!(result.stats.relaxations, result.stats.killed);
        assert_eq!(result.best.id, 1);
    }

    #[test]
    fn test_too_few_seeds_is_an_error() {
        let evaluator =
            FnEvaluator::boxed(|_: &Structure, _: usize| Err(EvaluationError::NotConverged(0)));
        let mut controller = controller(config(4, 5), evaluator);
        assert!(matches!(
            controller.run(),
            Err(SearchError::EmptyPopulation(0))
        ));
    }

    #[test]
    fn test_resume_allocates_fresh_ids() {
        let mut store = MemoryStore::new();
        store.add_relaxed(&relaxed(10, 1.0)).unwrap();
        store.add_relaxed(&relaxed(11, 2.0)).unwrap();

        let mut controller = EvolutionController::new(config(4, 0), Box::new(store))
            .unwrap()
            .with_evaluator(FnEvaluator::boxed(separation))
            .with_diversifier(Box::new(CubicGenerator))
            .with_comparator(Box::new(ScoreComparator));
        controller.seed().unwrap();
        controller.step().unwrap();

        assert!(controller.store().candidate_count().unwrap() > 2);
        for id in 0..10 {
            assert!(controller.store().get(id).unwrap().is_none());
        }
    }

    #[test]
    fn test_cancellation() {
        let mut controller = controller(config(4, 6), FnEvaluator::boxed(separation));
        controller.cancel_handle().store(true, Ordering::Relaxed);

        let result = controller.run().unwrap();
        assert_eq!(result.stats.stop_reason, StopReason::Cancelled);
        assert_eq!(result.stats.generations, 0);
    }

    #[test]
    fn test_artifacts_written() {
        let dir = tempdir().unwrap();
        let mut cfg = config(4, 6);
        cfg.population.max_generations = 2;
        cfg.output_dir = Some(dir.path().to_path_buf());

        let mut controller = EvolutionController::from_config(cfg)
            .unwrap()
            .with_generator(Box::new(CubicGenerator))
            .with_diversifier(Box::new(CubicGenerator))
            .with_evaluator(FnEvaluator::boxed(separation))
            .with_comparator(Box::new(ScoreComparator));
        controller.run().unwrap();

        assert!(dir.path().join("population_gen000.json").exists());
        assert!(dir.path().join("population_gen002.json").exists());
        assert!(dir.path().join(RunArtifacts::HISTORY_FILE).exists());
        assert!(dir.path().join(RunArtifacts::RESULT_FILE).exists());
        assert!(dir.path().join(JsonStore::FILE_NAME).exists());
    }

    #[test]
    fn test_resume_keeps_population_snapshot() {
        let dir = tempdir().unwrap();
        let mut cfg = config(4, 6);
        cfg.population.max_generations = 2;
        cfg.output_dir = Some(dir.path().to_path_buf());
        let build = |cfg: SearchConfig| {
            EvolutionController::from_config(cfg)
                .unwrap()
                .with_generator(Box::new(CubicGenerator))
                .with_diversifier(Box::new(CubicGenerator))
                .with_evaluator(FnEvaluator::boxed(separation))
                .with_comparator(Box::new(ScoreComparator))
        };
        build(cfg.clone()).run().unwrap();

        let snapshot = dir.path().join("population_gen002.json");
        fs::write(&snapshot, "[]").unwrap();

        let mut resumed = build(cfg);
        resumed.seed().unwrap();
        assert_eq!(resumed.generation(), 2);
        assert_eq!(fs::read_to_string(&snapshot).unwrap(), "[]");
    }
}
