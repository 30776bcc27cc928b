//! Periodic atomic structures and cell geometry.

use std::collections::BTreeMap;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

fn default_pbc() -> [bool; 3] {
    [true, true, true]
}

/// An atomic configuration in a periodic cell.
///
/// Positions are fractional coordinates; the cell holds the three lattice
/// vectors as rows (Å).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    /// Chemical symbol per atom.
    pub species: Vec<String>,
    /// Fractional coordinates per atom.
    pub positions: Vec<[f64; 3]>,
    /// Lattice vectors as rows.
    pub cell: [[f64; 3]; 3],
    /// Periodic boundary flags per lattice direction.
    #[serde(default = "default_pbc")]
    pub pbc: [bool; 3],
}

impl Structure {
    /// Create a fully periodic structure.
    pub fn new(species: Vec<String>, positions: Vec<[f64; 3]>, cell: Matrix3<f64>) -> Self {
        let mut structure = Self {
            species,
            positions,
            cell: [[0.0; 3]; 3],
            pbc: default_pbc(),
        };
        structure.set_cell_matrix(&cell);
        structure
    }

    /// Number of atoms.
    pub fn len(&self) -> usize {
        self.species.len()
    }

    /// Whether the structure has no atoms.
    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }

    /// Cell as a matrix whose rows are the lattice vectors.
    pub fn cell_matrix(&self) -> Matrix3<f64> {
        let c = &self.cell;
        Matrix3::new(
            c[0][0], c[0][1], c[0][2], c[1][0], c[1][1], c[1][2], c[2][0], c[2][1], c[2][2],
        )
    }

    /// Replace the cell, keeping fractional coordinates.
    pub fn set_cell_matrix(&mut self, cell: &Matrix3<f64>) {
        for (i, row) in self.cell.iter_mut().enumerate() {
            for (j, value) in row.iter_mut().enumerate() {
                *value = cell[(i, j)];
            }
        }
    }

    /// Cell volume (Å³).
    pub fn volume(&self) -> f64 {
        self.cell_matrix().determinant().abs()
    }

    /// Lattice vector lengths `[a, b, c]`.
    pub fn lengths(&self) -> [f64; 3] {
        cell_parameters(&self.cell_matrix()).0
    }

    /// Cell angles `[alpha, beta, gamma]` in degrees.
    pub fn angles(&self) -> [f64; 3] {
        cell_parameters(&self.cell_matrix()).1
    }

    /// Cartesian position of atom `i`.
    pub fn cartesian(&self, i: usize) -> Vector3<f64> {
        self.cell_matrix().transpose() * Vector3::from(self.positions[i])
    }

    /// Cartesian positions of all atoms.
    pub fn cartesian_positions(&self) -> Vec<Vector3<f64>> {
        let cell_t = self.cell_matrix().transpose();
        self.positions
            .iter()
            .map(|p| cell_t * Vector3::from(*p))
            .collect()
    }

    /// Replace positions from Cartesian coordinates.
    ///
    /// Returns `false` and leaves the structure untouched if the cell is
    /// singular.
    pub fn set_cartesian_positions(&mut self, positions: &[Vector3<f64>]) -> bool {
        let Some(inv) = self.cell_matrix().transpose().try_inverse() else {
            return false;
        };
        self.positions = positions
            .iter()
            .map(|r| {
                let f = inv * r;
                [f.x, f.y, f.z]
            })
            .collect();
        true
    }

    /// Wrap fractional coordinates into `[0, 1)` along periodic directions.
    pub fn wrap(&mut self) {
        for p in &mut self.positions {
            for (axis, value) in p.iter_mut().enumerate() {
                if self.pbc[axis] {
                    *value = value.rem_euclid(1.0);
                    if *value >= 1.0 {
                        *value = 0.0;
                    }
                }
            }
        }
    }

    /// Isotropically rescale the cell to the given volume.
    pub fn scale_to_volume(&mut self, volume: f64) {
        let current = self.volume();
        if current <= 0.0 || volume <= 0.0 {
            return;
        }
        let factor = (volume / current).cbrt();
        let scaled = self.cell_matrix() * factor;
        self.set_cell_matrix(&scaled);
    }

    /// Species counts keyed by chemical symbol.
    pub fn composition(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for s in &self.species {
            *counts.entry(s.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Number of periodic images needed along each lattice direction so that
    /// every neighbor within `rcut` is visited, for positions inside the cell.
    pub fn image_range(&self, rcut: f64) -> [i32; 3] {
        let Some(inv) = self.cell_matrix().try_inverse() else {
            return [0; 3];
        };
        let mut range = [0; 3];
        for axis in 0..3 {
            if !self.pbc[axis] {
                continue;
            }
            let spacing = 1.0 / inv.column(axis).norm();
            range[axis] = (rcut / spacing).ceil() as i32 + 1;
        }
        range
    }

    /// Minimum-image distance between atoms `i` and `j`.
    pub fn distance(&self, i: usize, j: usize) -> f64 {
        self.min_image_distance(&self.positions[i], &self.positions[j])
    }

    /// Minimum-image distance between two fractional points in this cell.
    pub fn min_image_distance(&self, a: &[f64; 3], b: &[f64; 3]) -> f64 {
        let cell_t = self.cell_matrix().transpose();
        let mut df = Vector3::from(*b) - Vector3::from(*a);
        for axis in 0..3 {
            if self.pbc[axis] {
                df[axis] -= df[axis].round();
            }
        }

        let span = |axis: usize| if self.pbc[axis] { -1..=1 } else { 0..=0 };
        let mut best = f64::INFINITY;
        for na in span(0) {
            for nb in span(1) {
                for nc in span(2) {
                    let shifted = df + Vector3::new(na as f64, nb as f64, nc as f64);
                    best = best.min((cell_t * shifted).norm());
                }
            }
        }
        best
    }
}

/// Lattice lengths and angles (degrees) of a cell given as row vectors.
pub fn cell_parameters(cell: &Matrix3<f64>) -> ([f64; 3], [f64; 3]) {
    let a = cell.row(0).transpose();
    let b = cell.row(1).transpose();
    let c = cell.row(2).transpose();
    let lengths = [a.norm(), b.norm(), c.norm()];

    let angle = |u: &Vector3<f64>, v: &Vector3<f64>| {
        let denom = u.norm() * v.norm();
        if denom == 0.0 {
            return 0.0;
        }
        (u.dot(v) / denom).clamp(-1.0, 1.0).acos().to_degrees()
    };

    (lengths, [angle(&b, &c), angle(&a, &c), angle(&a, &b)])
}

/// Build a cell matrix from lengths and angles (degrees).
///
/// The first vector lies along x and the second in the xy plane. Returns
/// `None` if the angles do not describe a valid cell.
pub fn cell_from_parameters(lengths: [f64; 3], angles: [f64; 3]) -> Option<Matrix3<f64>> {
    let [a, b, c] = lengths;
    let [alpha, beta, gamma] = angles.map(f64::to_radians);

    let (cos_a, cos_b, cos_g) = (alpha.cos(), beta.cos(), gamma.cos());
    let sin_g = gamma.sin();
    if sin_g.abs() < 1e-8 {
        return None;
    }

    let cx = c * cos_b;
    let cy = c * (cos_a - cos_b * cos_g) / sin_g;
    let cz_sq = c * c - cx * cx - cy * cy;
    if cz_sq <= 0.0 {
        return None;
    }

    Some(Matrix3::new(
        a,
        0.0,
        0.0,
        b * cos_g,
        b * sin_g,
        0.0,
        cx,
        cy,
        cz_sq.sqrt(),
    ))
}
