//! Configuration types for an evolutionary structure search.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{CellBounds, MinDistances};

/// Top-level search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Building blocks of the cell, e.g. `Mg4 Al8 O16`.
    pub composition: Vec<Block>,
    /// Population and stopping settings.
    #[serde(default)]
    pub population: PopulationConfig,
    /// Variation operators and their adaptive settings.
    #[serde(default)]
    pub operators: OperatorConfig,
    /// Duplicate detection thresholds.
    #[serde(default)]
    pub comparator: ComparatorConfig,
    /// Relaxed cells outside these bounds are killed.
    #[serde(default)]
    pub cell_bounds: CellBounds,
    /// Random structure generation for the seed population.
    #[serde(default)]
    pub generator: GeneratorConfig,
    /// Diversification candidates injected every generation.
    #[serde(default)]
    pub diversification: DiversificationConfig,
    /// Energy evaluation backend.
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    /// Directory for the candidate store and run artifacts.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            composition: vec![Block::new("Mg", 4), Block::new("Al", 8), Block::new("O", 16)],
            population: PopulationConfig::default(),
            operators: OperatorConfig::default(),
            comparator: ComparatorConfig::default(),
            cell_bounds: CellBounds::relaxation_default(),
            generator: GeneratorConfig::default(),
            diversification: DiversificationConfig::default(),
            evaluator: EvaluatorConfig::default(),
            output_dir: None,
            random_seed: None,
        }
    }
}

/// A species and how many atoms of it the cell holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub species: String,
    pub count: usize,
}

impl Block {
    pub fn new(species: impl Into<String>, count: usize) -> Self {
        Self {
            species: species.into(),
            count,
        }
    }
}

/// Expand blocks into one symbol per atom.
pub fn expand_blocks(blocks: &[Block]) -> Vec<String> {
    blocks
        .iter()
        .flat_map(|b| std::iter::repeat_n(b.species.clone(), b.count))
        .collect()
}

/// Population and generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    /// Survivors kept per generation; also the number of offspring slots.
    #[serde(default = "default_population_size")]
    pub size: usize,
    /// Number of random candidates generated when the store is empty.
    #[serde(default = "default_seed_size")]
    pub seed_size: usize,
    /// Share of the population bred by operators; the remainder is
    /// injected as diversification candidates.
    #[serde(default = "default_operator_percent")]
    pub operator_percent: f64,
    /// Stop after this many generations without a new best score.
    #[serde(default = "default_max_stagnation")]
    pub max_stagnation: usize,
    /// Absolute generation ceiling.
    #[serde(default = "default_max_generations")]
    pub max_generations: usize,
    /// Parent resampling attempts per offspring slot.
    #[serde(default = "default_max_operator_attempts")]
    pub max_operator_attempts: usize,
}

impl PopulationConfig {
    /// Diversification candidates injected per generation.
    pub fn diversification_count(&self) -> usize {
        (self.size as f64 * (1.0 - self.operator_percent)).round() as usize
    }
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            size: default_population_size(),
            seed_size: default_seed_size(),
            operator_percent: default_operator_percent(),
            max_stagnation: default_max_stagnation(),
            max_generations: default_max_generations(),
            max_operator_attempts: default_max_operator_attempts(),
        }
    }
}

fn default_population_size() -> usize {
    20
}
fn default_seed_size() -> usize {
    40
}
fn default_operator_percent() -> f64 {
    0.8
}
fn default_max_stagnation() -> usize {
    30
}
fn default_max_generations() -> usize {
    60
}
fn default_max_operator_attempts() -> usize {
    100
}

/// Operator mix and per-operator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Relative selection weights.
    #[serde(default)]
    pub weights: OperatorWeights,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub strain: StrainConfig,
    #[serde(default)]
    pub soft: SoftMutationConfig,
    /// Volume adaptation applied after each generation.
    #[serde(default)]
    pub adapt: AdaptConfig,
    /// Ratio of covalent radii used for the minimal distances of offspring.
    #[serde(default = "default_min_distance_ratio")]
    pub min_distance_ratio: f64,
    /// Offspring cells outside these bounds are rejected.
    #[serde(default)]
    pub cell_bounds: CellBounds,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            weights: OperatorWeights::default(),
            pairing: PairingConfig::default(),
            strain: StrainConfig::default(),
            soft: SoftMutationConfig::default(),
            adapt: AdaptConfig::default(),
            min_distance_ratio: default_min_distance_ratio(),
            cell_bounds: CellBounds::relaxation_default(),
        }
    }
}

fn default_min_distance_ratio() -> f64 {
    0.5
}

/// Integer selection ratios, e.g. 3:2:1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OperatorWeights {
    pub pairing: u32,
    pub soft_mutation: u32,
    pub strain_mutation: u32,
}

impl Default for OperatorWeights {
    fn default() -> Self {
        Self {
            pairing: 3,
            soft_mutation: 2,
            strain_mutation: 1,
        }
    }
}

/// Cut-and-splice pairing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Probability that the first parent is randomly translated.
    #[serde(default = "default_p1")]
    pub p1: f64,
    /// Probability that the second parent is randomly translated.
    #[serde(default)]
    pub p2: f64,
    /// Minimal share of atoms each parent contributes.
    #[serde(default = "default_minfrac")]
    pub minfrac: f64,
    /// Cut attempts before giving up on a parent pair.
    #[serde(default = "default_operator_attempts")]
    pub max_attempts: usize,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            p1: default_p1(),
            p2: 0.0,
            minfrac: default_minfrac(),
            max_attempts: default_operator_attempts(),
        }
    }
}

fn default_p1() -> f64 {
    1.0
}
fn default_minfrac() -> f64 {
    0.15
}
fn default_operator_attempts() -> usize {
    100
}

/// Strain mutation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrainConfig {
    /// Standard deviation of the strain matrix elements.
    #[serde(default = "default_strain_stddev")]
    pub stddev: f64,
    #[serde(default = "default_operator_attempts")]
    pub max_attempts: usize,
}

impl Default for StrainConfig {
    fn default() -> Self {
        Self {
            stddev: default_strain_stddev(),
            max_attempts: default_operator_attempts(),
        }
    }
}

fn default_strain_stddev() -> f64 {
    0.7
}

/// Soft mutation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftMutationConfig {
    /// Admissible maximal single-atom displacement (Å).
    #[serde(default = "default_soft_bounds")]
    pub bounds: (f64, f64),
    /// Ratio of covalent radii for the (short) minimal distances that stop
    /// the displacement.
    #[serde(default = "default_soft_distance_ratio")]
    pub min_distance_ratio: f64,
    /// Cutoff of the harmonic pair model (Å).
    #[serde(default = "default_soft_rcut")]
    pub rcut: f64,
    /// Decay length of the spring constants (Å).
    #[serde(default = "default_soft_decay")]
    pub decay: f64,
    /// Amplitude increment when scanning along a mode (Å).
    #[serde(default = "default_soft_step")]
    pub step: f64,
}

impl Default for SoftMutationConfig {
    fn default() -> Self {
        Self {
            bounds: default_soft_bounds(),
            min_distance_ratio: default_soft_distance_ratio(),
            rcut: default_soft_rcut(),
            decay: default_soft_decay(),
            step: default_soft_step(),
        }
    }
}

fn default_soft_bounds() -> (f64, f64) {
    (2.0, 5.0)
}
fn default_soft_distance_ratio() -> f64 {
    0.1
}
fn default_soft_rcut() -> f64 {
    6.0
}
fn default_soft_decay() -> f64 {
    1.0
}
fn default_soft_step() -> f64 {
    0.1
}

/// Scaling-volume adaptation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptConfig {
    /// Weight of the previous scaling volume in the blend.
    #[serde(default = "default_w_adapt")]
    pub w_adapt: f64,
    /// Number of top candidates averaged (0 = top 20%).
    #[serde(default = "default_n_adapt")]
    pub n_adapt: usize,
}

impl Default for AdaptConfig {
    fn default() -> Self {
        Self {
            w_adapt: default_w_adapt(),
            n_adapt: default_n_adapt(),
        }
    }
}

fn default_w_adapt() -> f64 {
    0.5
}
fn default_n_adapt() -> usize {
    4
}

/// Fingerprint comparator thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparatorConfig {
    /// Energy difference (eV) above which structures always differ.
    #[serde(default = "default_d_e")]
    pub d_e: f64,
    /// Cosine distance below which structures are duplicates.
    #[serde(default = "default_cos_dist_max")]
    pub cos_dist_max: f64,
    /// Fingerprint cutoff radius (Å).
    #[serde(default = "default_rcut")]
    pub rcut: f64,
    /// Histogram bin width (Å).
    #[serde(default = "default_binwidth")]
    pub binwidth: f64,
    /// Gaussian smearing width (Å).
    #[serde(default = "default_sigma")]
    pub sigma: f64,
    /// Smearing window in units of sigma.
    #[serde(default = "default_nsigma")]
    pub nsigma: usize,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            d_e: default_d_e(),
            cos_dist_max: default_cos_dist_max(),
            rcut: default_rcut(),
            binwidth: default_binwidth(),
            sigma: default_sigma(),
            nsigma: default_nsigma(),
        }
    }
}

fn default_d_e() -> f64 {
    1.0
}
fn default_cos_dist_max() -> f64 {
    1e-3
}
fn default_rcut() -> f64 {
    10.0
}
fn default_binwidth() -> f64 {
    0.05
}
fn default_sigma() -> f64 {
    0.05
}
fn default_nsigma() -> usize {
    4
}

/// Repetition factors with a relative weight.
///
/// `factors = [2]` repeats a half-cell twice along one random axis;
/// `factors = [1]` applies no splitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitWeight {
    pub factors: Vec<u32>,
    pub weight: f64,
}

impl SplitWeight {
    pub fn new(factors: Vec<u32>, weight: f64) -> Self {
        Self { factors, weight }
    }
}

/// Random structure generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Target cell volume of seed candidates (Å³).
    #[serde(default = "default_volume")]
    pub volume: f64,
    #[serde(default = "CellBounds::generation_default")]
    pub cell_bounds: CellBounds,
    #[serde(default = "default_seed_splits")]
    pub splits: Vec<SplitWeight>,
    #[serde(default = "default_min_distance_ratio")]
    pub min_distance_ratio: f64,
    /// Placement attempts before giving up.
    #[serde(default = "default_generator_attempts")]
    pub max_attempts: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            cell_bounds: CellBounds::generation_default(),
            splits: default_seed_splits(),
            min_distance_ratio: default_min_distance_ratio(),
            max_attempts: default_generator_attempts(),
        }
    }
}

fn default_volume() -> f64 {
    240.0
}
fn default_seed_splits() -> Vec<SplitWeight> {
    vec![SplitWeight::new(vec![2], 1.0), SplitWeight::new(vec![1], 1.0)]
}
fn default_generator_attempts() -> usize {
    1000
}

/// How synthetic diversification candidates are scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiversityFitness {
    /// Draw from Normal(mean, stdev) of the current population scores.
    #[default]
    SampledNormal,
    /// Use the worst current population score.
    PopulationWorst,
}

/// Diversification injection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiversificationConfig {
    /// Scoring strategy for injected candidates.
    #[serde(default)]
    pub fitness: DiversityFitness,
    /// Share of the best candidates whose mean volume seeds the injection.
    #[serde(default = "default_top_fraction")]
    pub top_fraction: f64,
    #[serde(default = "default_diversity_splits")]
    pub splits: Vec<SplitWeight>,
    #[serde(default = "CellBounds::generation_default")]
    pub cell_bounds: CellBounds,
}

impl Default for DiversificationConfig {
    fn default() -> Self {
        Self {
            fitness: DiversityFitness::default(),
            top_fraction: default_top_fraction(),
            splits: default_diversity_splits(),
            cell_bounds: CellBounds::generation_default(),
        }
    }
}

fn default_top_fraction() -> f64 {
    0.2
}
fn default_diversity_splits() -> Vec<SplitWeight> {
    vec![SplitWeight::new(vec![2], 1.0), SplitWeight::new(vec![1], 0.0)]
}

/// Energy evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// External pressure (GPa).
    #[serde(default = "default_pressure")]
    pub pressure_gpa: f64,
    #[serde(default)]
    pub backend: EvaluatorBackend,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            pressure_gpa: default_pressure(),
            backend: EvaluatorBackend::default(),
        }
    }
}

fn default_pressure() -> f64 {
    100.0
}

/// Which evaluator relaxes candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EvaluatorBackend {
    /// External relaxation program, run once per stage.
    Command {
        stages: Vec<StageConfig>,
        /// Working directory for the program (defaults to the output dir).
        #[serde(default)]
        work_dir: Option<PathBuf>,
    },
    /// Built-in pair potentials.
    PairPotential(PairPotentialConfig),
}

impl Default for EvaluatorBackend {
    fn default() -> Self {
        Self::PairPotential(PairPotentialConfig::default())
    }
}

/// One stage of an external relaxation protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// File whose contents are forwarded as stage options.
    #[serde(default)]
    pub input_file: Option<PathBuf>,
}

/// Built-in pair-potential relaxation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairPotentialConfig {
    pub potentials: Vec<PairPotential>,
    /// Force convergence threshold (eV/Å).
    #[serde(default = "default_fmax")]
    pub fmax: f64,
    /// Enthalpy-per-atom convergence threshold for the volume (eV).
    #[serde(default = "default_stress_tol")]
    pub stress_tol: f64,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Maximal atomic step (Å).
    #[serde(default = "default_max_step")]
    pub max_step: f64,
    /// Also relax the volume isotropically.
    #[serde(default = "default_relax_volume")]
    pub relax_volume: bool,
}

impl Default for PairPotentialConfig {
    fn default() -> Self {
        let lj = |a: &str, b: &str| PairPotential {
            species: (a.to_string(), b.to_string()),
            form: PotentialForm::LennardJones { a: 1.5, c: 0.0 },
            cutoff: 6.0,
        };
        let buck = |a: &str, b: &str, big_a: f64, rho: f64| PairPotential {
            species: (a.to_string(), b.to_string()),
            form: PotentialForm::Buckingham {
                a: big_a,
                rho,
                c: 0.0,
            },
            cutoff: 10.0,
        };
        Self {
            potentials: vec![
                lj("O", "Mg"),
                lj("O", "Al"),
                lj("O", "O"),
                lj("Mg", "Mg"),
                lj("Mg", "Al"),
                lj("Al", "Al"),
                buck("O", "Mg", 1430.0, 0.295),
                buck("O", "Al", 1110.0, 0.312),
                buck("O", "O", 2020.0, 0.267),
            ],
            fmax: default_fmax(),
            stress_tol: default_stress_tol(),
            max_steps: default_max_steps(),
            max_step: default_max_step(),
            relax_volume: default_relax_volume(),
        }
    }
}

fn default_fmax() -> f64 {
    0.05
}
fn default_stress_tol() -> f64 {
    0.01
}
fn default_max_steps() -> usize {
    500
}
fn default_max_step() -> f64 {
    0.1
}
fn default_relax_volume() -> bool {
    true
}

/// A pair interaction between two species.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairPotential {
    pub species: (String, String),
    pub form: PotentialForm,
    /// Interaction cutoff (Å).
    pub cutoff: f64,
}

/// Functional form of a pair interaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PotentialForm {
    /// `A / r^12 - C / r^6`.
    LennardJones { a: f64, c: f64 },
    /// `A exp(-r / rho) - C / r^6`.
    Buckingham { a: f64, rho: f64, c: f64 },
}

// ============================================================================
// Validation
// ============================================================================

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Composition must contain at least one atom")]
    EmptyComposition,
    #[error("Unknown element: {0}")]
    UnknownElement(String),
    #[error("Population size must be at least 2")]
    PopulationTooSmall,
    #[error("Operator percent must be in (0, 1], got {0}")]
    InvalidOperatorPercent(f64),
    #[error("At least one operator needs a positive weight")]
    NoOperators,
    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Evaluator needs at least one stage")]
    NoStages,
}

impl SearchConfig {
    /// Species symbol of every atom in the cell.
    pub fn species(&self) -> Vec<String> {
        expand_blocks(&self.composition)
    }

    /// Distinct species in composition order.
    pub fn distinct_species(&self) -> Vec<String> {
        let mut species: Vec<String> = Vec::new();
        for block in &self.composition {
            if !species.contains(&block.species) {
                species.push(block.species.clone());
            }
        }
        species
    }

    /// Minimal distances for the composition at the given ratio.
    pub fn min_distances(&self, ratio: f64) -> Result<MinDistances, ConfigError> {
        MinDistances::from_covalent_radii(&self.distinct_species(), ratio)
    }

    /// Validate search configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.composition.iter().map(|b| b.count).sum::<usize>() == 0 {
            return Err(ConfigError::EmptyComposition);
        }
        self.min_distances(1.0)?;

        let population = &self.population;
        if population.size < 2 {
            return Err(ConfigError::PopulationTooSmall);
        }
        if !(population.operator_percent > 0.0 && population.operator_percent <= 1.0) {
            return Err(ConfigError::InvalidOperatorPercent(
                population.operator_percent,
            ));
        }
        for (name, value) in [
            ("max_operator_attempts", population.max_operator_attempts),
            ("max_generations", population.max_generations),
            ("max_stagnation", population.max_stagnation),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidParameter(format!(
                    "{} must be positive",
                    name
                )));
            }
        }

        let weights = &self.operators.weights;
        if weights.pairing + weights.soft_mutation + weights.strain_mutation == 0 {
            return Err(ConfigError::NoOperators);
        }

        let check_range = |bounds: (f64, f64), name: &str| {
            if bounds.0 > bounds.1 || bounds.0 < 0.0 {
                Err(ConfigError::InvalidBounds(format!(
                    "{} min ({}) > max ({})",
                    name, bounds.0, bounds.1
                )))
            } else {
                Ok(())
            }
        };
        check_range(self.operators.soft.bounds, "soft.bounds")?;

        let comparator = &self.comparator;
        let soft = &self.operators.soft;
        for (name, value) in [
            ("comparator.rcut", comparator.rcut),
            ("comparator.binwidth", comparator.binwidth),
            ("comparator.sigma", comparator.sigma),
            ("soft.rcut", soft.rcut),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidParameter(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        for (name, value) in [
            ("comparator.cos_dist_max", comparator.cos_dist_max),
            ("strain.stddev", self.operators.strain.stddev),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::InvalidParameter(format!(
                    "{} must be non-negative, got {}",
                    name, value
                )));
            }
        }

        let adapt = &self.operators.adapt;
        if !(0.0..=1.0).contains(&adapt.w_adapt) {
            return Err(ConfigError::InvalidParameter(format!(
                "w_adapt must be in [0, 1], got {}",
                adapt.w_adapt
            )));
        }
        if !(0.0..=1.0).contains(&self.diversification.top_fraction) {
            return Err(ConfigError::InvalidParameter(format!(
                "top_fraction must be in [0, 1], got {}",
                self.diversification.top_fraction
            )));
        }
        if self.generator.volume <= 0.0 {
            return Err(ConfigError::InvalidParameter(
                "generator volume must be positive".to_string(),
            ));
        }
        for splits in [&self.generator.splits, &self.diversification.splits] {
            if splits.iter().any(|s| s.weight < 0.0 || s.factors.contains(&0)) {
                return Err(ConfigError::InvalidParameter(
                    "split weights must be non-negative and factors positive".to_string(),
                ));
            }
        }

        self.cell_bounds.validate("cell_bounds")?;
        self.operators.cell_bounds.validate("operators.cell_bounds")?;
        self.generator.cell_bounds.validate("generator.cell_bounds")?;
        self.diversification
            .cell_bounds
            .validate("diversification.cell_bounds")?;

        if let EvaluatorBackend::Command { stages, .. } = &self.evaluator.backend
            && stages.is_empty()
        {
            return Err(ConfigError::NoStages);
        }

        Ok(())
    }
}
