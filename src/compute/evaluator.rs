//! Energy evaluators that relax a structure under external pressure.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::schema::{
    EvaluatorBackend, EvaluatorConfig, PairPotentialConfig, PotentialForm, StageConfig,
    Structure,
};

/// eV per GPa·Å³.
pub const EV_PER_GPA_A3: f64 = 0.006_241_509_074;

/// A locally relaxed structure and its energy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub structure: Structure,
    /// Final energy (enthalpy at the requested pressure), eV.
    pub energy: f64,
    /// Space group number, when the evaluator determines one.
    #[serde(default)]
    pub spacegroup: Option<u16>,
}

/// Evaluation errors. Each one kills the candidate, never the run.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("Relaxation did not converge within {0} steps")]
    NotConverged(usize),
    #[error("Malformed geometry: {0}")]
    MalformedGeometry(String),
    #[error("Stage {stage} exited with status {code:?}: {stderr}")]
    ProgramFailed {
        stage: usize,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Stage {stage} produced unreadable output: {message}")]
    InvalidOutput { stage: usize, message: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Relaxes structures and reports their energy.
pub trait EnergyEvaluator {
    fn evaluate(
        &self,
        structure: &Structure,
        pressure_gpa: f64,
    ) -> Result<Evaluation, EvaluationError>;
}

/// Build the evaluator described by the configuration.
pub fn evaluator_from_config(
    config: &EvaluatorConfig,
    default_work_dir: Option<PathBuf>,
) -> Box<dyn EnergyEvaluator> {
    match &config.backend {
        EvaluatorBackend::Command { stages, work_dir } => Box::new(CommandEvaluator::new(
            stages.clone(),
            work_dir.clone().or(default_work_dir),
        )),
        EvaluatorBackend::PairPotential(pair) => Box::new(PairPotentialEvaluator::new(pair.clone())),
    }
}

// ============================================================================
// External program
// ============================================================================

#[derive(Debug, Serialize)]
struct StageRequest<'a> {
    stage: usize,
    pressure_gpa: f64,
    structure: &'a Structure,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<String>,
}

/// Runs an external relaxation program once per stage.
///
/// Each stage receives a JSON request on stdin and must print an
/// [`Evaluation`] as JSON on stdout. The geometry returned by one stage is
/// the input of the next; the last stage's energy is reported.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    stages: Vec<StageConfig>,
    work_dir: Option<PathBuf>,
}

impl CommandEvaluator {
    pub fn new(stages: Vec<StageConfig>, work_dir: Option<PathBuf>) -> Self {
        Self { stages, work_dir }
    }

    fn run_stage(
        &self,
        index: usize,
        stage: &StageConfig,
        structure: &Structure,
        pressure_gpa: f64,
    ) -> Result<Evaluation, EvaluationError> {
        let options = match &stage.input_file {
            Some(path) => Some(fs::read_to_string(path)?.trim().to_string()),
            None => None,
        };
        let request = StageRequest {
            stage: index,
            pressure_gpa,
            structure,
            options,
        };
        let payload = serde_json::to_vec(&request).map_err(io::Error::other)?;

        let mut command = Command::new(&stage.program);
        command
            .args(&stage.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.work_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload)?;
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(EvaluationError::ProgramFailed {
                stage: index,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let evaluation: Evaluation = serde_json::from_slice(&output.stdout).map_err(|e| {
            EvaluationError::InvalidOutput {
                stage: index,
                message: e.to_string(),
            }
        })?;

        if !evaluation.energy.is_finite() {
            return Err(EvaluationError::InvalidOutput {
                stage: index,
                message: format!("non-finite energy {}", evaluation.energy),
            });
        }
        if evaluation.structure.species != structure.species {
            return Err(EvaluationError::MalformedGeometry(format!(
                "stage {index} changed the atom list"
            )));
        }
        Ok(evaluation)
    }
}

impl EnergyEvaluator for CommandEvaluator {
    fn evaluate(
        &self,
        structure: &Structure,
        pressure_gpa: f64,
    ) -> Result<Evaluation, EvaluationError> {
        let mut current = structure.clone();
        let mut last = None;

        for (index, stage) in self.stages.iter().enumerate() {
            log::debug!("Running stage {} ({})", index, stage.program.display());
            let evaluation = self.run_stage(index, stage, &current, pressure_gpa)?;
            current = evaluation.structure.clone();
            last = Some(evaluation);
        }

        last.ok_or_else(|| EvaluationError::MalformedGeometry("no stages configured".to_string()))
    }
}

// ============================================================================
// Built-in pair potentials
// ============================================================================

/// Relative cell strain used for the numerical volume derivative.
const VOLUME_PROBE: f64 = 1e-4;
/// Largest change of ln(V) per step.
const MAX_VOLUME_STEP: f64 = 0.02;

/// Steepest-descent relaxation with Lennard-Jones / Buckingham pair terms.
///
/// Atomic positions are relaxed and, optionally, the volume isotropically;
/// the reported energy is the enthalpy `E + P V`.
#[derive(Debug, Clone)]
pub struct PairPotentialEvaluator {
    config: PairPotentialConfig,
    terms: BTreeMap<(String, String), Vec<(PotentialForm, f64)>>,
    max_cutoff: f64,
}

impl PairPotentialEvaluator {
    pub fn new(config: PairPotentialConfig) -> Self {
        let mut terms: BTreeMap<(String, String), Vec<(PotentialForm, f64)>> = BTreeMap::new();
        let mut max_cutoff: f64 = 0.0;
        for p in &config.potentials {
            let key = ordered(&p.species.0, &p.species.1);
            terms.entry(key).or_default().push((p.form, p.cutoff));
            max_cutoff = max_cutoff.max(p.cutoff);
        }
        Self {
            config,
            terms,
            max_cutoff,
        }
    }

    /// Potential energy and Cartesian forces.
    pub fn energy_and_forces(&self, structure: &Structure) -> (f64, Vec<Vector3<f64>>) {
        let n = structure.len();
        let cell = structure.cell_matrix();
        let positions = structure.cartesian_positions();
        let shifts = lattice_shifts(&cell, structure.image_range(self.max_cutoff));
        let mut energy = 0.0;
        let mut forces = vec![Vector3::zeros(); n];

        for i in 0..n {
            for j in 0..n {
                let Some(terms) = self
                    .terms
                    .get(&ordered(&structure.species[i], &structure.species[j]))
                else {
                    continue;
                };
                for shift in &shifts {
                    let d = positions[j] + shift - positions[i];
                    let r = d.norm();
                    if r < 1e-10 {
                        continue;
                    }
                    for (form, cutoff) in terms {
                        if r > *cutoff {
                            continue;
                        }
                        let (v, dv) = pair_term(form, r);
                        energy += 0.5 * v;
                        forces[i] += d * (dv / r);
                    }
                }
            }
        }
        (energy, forces)
    }

    fn enthalpy(&self, structure: &Structure, pressure_gpa: f64) -> f64 {
        self.energy_and_forces(structure).0 + pressure_gpa * structure.volume() * EV_PER_GPA_A3
    }

    /// dH/d(ln V) under isotropic scaling.
    fn volume_gradient(&self, structure: &Structure, pressure_gpa: f64) -> f64 {
        let probe = |factor: f64| {
            let mut s = structure.clone();
            let cell = s.cell_matrix() * factor.cbrt();
            s.set_cell_matrix(&cell);
            self.enthalpy(&s, pressure_gpa)
        };
        (probe(1.0 + VOLUME_PROBE) - probe(1.0 - VOLUME_PROBE)) / (2.0 * VOLUME_PROBE)
    }
}

impl EnergyEvaluator for PairPotentialEvaluator {
    fn evaluate(
        &self,
        structure: &Structure,
        pressure_gpa: f64,
    ) -> Result<Evaluation, EvaluationError> {
        if structure.is_empty() {
            return Err(EvaluationError::MalformedGeometry("no atoms".to_string()));
        }
        if structure.volume() < 1e-6 || structure.cell_matrix().try_inverse().is_none() {
            return Err(EvaluationError::MalformedGeometry("singular cell".to_string()));
        }

        let n = structure.len() as f64;
        let pv = |s: &Structure| pressure_gpa * s.volume() * EV_PER_GPA_A3;
        let mut current = structure.clone();
        current.wrap();
        let (mut energy, mut forces) = self.energy_and_forces(&current);
        let mut enthalpy = energy + pv(&current);
        let mut step = self.config.max_step;

        for _ in 0..self.config.max_steps {
            let fmax = forces.iter().map(|f| f.norm()).fold(0.0, f64::max);
            let grad_v = if self.config.relax_volume {
                self.volume_gradient(&current, pressure_gpa)
            } else {
                0.0
            };
            if !enthalpy.is_finite() || !fmax.is_finite() {
                return Err(EvaluationError::MalformedGeometry(
                    "non-finite energy".to_string(),
                ));
            }
            if fmax < self.config.fmax && (grad_v / n).abs() < self.config.stress_tol {
                return Ok(Evaluation {
                    structure: current,
                    energy: enthalpy,
                    spacegroup: None,
                });
            }

            let mut trial = current.clone();
            if fmax > 0.0 {
                let scale = step / fmax;
                let moved: Vec<Vector3<f64>> = trial
                    .cartesian_positions()
                    .iter()
                    .zip(&forces)
                    .map(|(r, f)| r + f * scale)
                    .collect();
                trial.set_cartesian_positions(&moved);
                trial.wrap();
            }
            if grad_v != 0.0 {
                let dln_v = (-grad_v / n).clamp(-MAX_VOLUME_STEP, MAX_VOLUME_STEP) * step
                    / self.config.max_step;
                let cell: Matrix3<f64> = trial.cell_matrix() * (dln_v / 3.0).exp();
                trial.set_cell_matrix(&cell);
            }

            let (trial_energy, trial_forces) = self.energy_and_forces(&trial);
            let trial_enthalpy = trial_energy + pv(&trial);
            if trial_enthalpy <= enthalpy {
                current = trial;
                energy = trial_energy;
                forces = trial_forces;
                enthalpy = trial_enthalpy;
                step = (step * 1.2).min(self.config.max_step);
            } else {
                step *= 0.5;
                if step < 1e-8 {
                    break;
                }
            }
        }

        log::debug!(
            "Pair-potential relaxation stalled at E = {:.4} eV (H = {:.4} eV)",
            energy,
            enthalpy
        );
        Err(EvaluationError::NotConverged(self.config.max_steps))
    }
}

fn ordered(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Value and radial derivative of a pair term.
fn pair_term(form: &PotentialForm, r: f64) -> (f64, f64) {
    match *form {
        PotentialForm::LennardJones { a, c } => {
            let r6 = r.powi(6);
            let r12 = r6 * r6;
            (a / r12 - c / r6, -12.0 * a / (r12 * r) + 6.0 * c / (r6 * r))
        }
        PotentialForm::Buckingham { a, rho, c } => {
            let rep = if rho != 0.0 { a * (-r / rho).exp() } else { 0.0 };
            let drep = if rho != 0.0 { -rep / rho } else { 0.0 };
            let r6 = r.powi(6);
            (rep - c / r6, drep + 6.0 * c / (r6 * r))
        }
    }
}

/// Cartesian lattice translations within the given image range.
pub(crate) fn lattice_shifts(cell: &Matrix3<f64>, range: [i32; 3]) -> Vec<Vector3<f64>> {
    let cell_t = cell.transpose();
    let mut shifts = Vec::new();
    for a in -range[0]..=range[0] {
        for b in -range[1]..=range[1] {
            for c in -range[2]..=range[2] {
                shifts.push(cell_t * Vector3::new(a as f64, b as f64, c as f64));
            }
        }
    }
    shifts
}
