//! Element data and minimal interatomic distances.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ConfigError, Structure};

/// Covalent radii (Å), Cordero et al. 2008.
const COVALENT_RADII: &[(&str, f64)] = &[
    ("H", 0.31),
    ("He", 0.28),
    ("Li", 1.28),
    ("Be", 0.96),
    ("B", 0.84),
    ("C", 0.76),
    ("N", 0.71),
    ("O", 0.66),
    ("F", 0.57),
    ("Ne", 0.58),
    ("Na", 1.66),
    ("Mg", 1.41),
    ("Al", 1.21),
    ("Si", 1.11),
    ("P", 1.07),
    ("S", 1.05),
    ("Cl", 1.02),
    ("Ar", 1.06),
    ("K", 2.03),
    ("Ca", 1.76),
    ("Sc", 1.70),
    ("Ti", 1.60),
    ("V", 1.53),
    ("Cr", 1.39),
    ("Mn", 1.39),
    ("Fe", 1.32),
    ("Co", 1.26),
    ("Ni", 1.24),
    ("Cu", 1.32),
    ("Zn", 1.22),
    ("Ga", 1.22),
    ("Ge", 1.20),
    ("As", 1.19),
    ("Se", 1.20),
    ("Br", 1.20),
    ("Kr", 1.16),
    ("Rb", 2.20),
    ("Sr", 1.95),
    ("Y", 1.90),
    ("Zr", 1.75),
    ("Nb", 1.64),
    ("Mo", 1.54),
    ("Tc", 1.47),
    ("Ru", 1.46),
    ("Rh", 1.42),
    ("Pd", 1.39),
    ("Ag", 1.45),
    ("Cd", 1.44),
    ("In", 1.42),
    ("Sn", 1.39),
    ("Sb", 1.39),
    ("Te", 1.38),
    ("I", 1.39),
    ("Xe", 1.40),
    ("Cs", 2.44),
    ("Ba", 2.15),
];

/// Covalent radius of an element, if tabulated.
pub fn covalent_radius(symbol: &str) -> Option<f64> {
    COVALENT_RADII
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, r)| *r)
}

/// Minimal allowed distances per unordered species pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MinDistances {
    table: BTreeMap<(String, String), f64>,
}

impl MinDistances {
    /// Build the table as `ratio * (r_a + r_b)` over covalent radii.
    pub fn from_covalent_radii<S: AsRef<str>>(
        species: &[S],
        ratio: f64,
    ) -> Result<Self, ConfigError> {
        let mut table = BTreeMap::new();
        for a in species {
            let a = a.as_ref();
            let ra = covalent_radius(a).ok_or_else(|| ConfigError::UnknownElement(a.to_string()))?;
            for b in species {
                let b = b.as_ref();
                let rb =
                    covalent_radius(b).ok_or_else(|| ConfigError::UnknownElement(b.to_string()))?;
                table.insert(pair_key(a, b), ratio * (ra + rb));
            }
        }
        Ok(Self { table })
    }

    /// Minimal distance for a species pair (0 when unknown).
    pub fn get(&self, a: &str, b: &str) -> f64 {
        self.table.get(&pair_key(a, b)).copied().unwrap_or(0.0)
    }

    /// Largest tabulated minimal distance.
    pub fn max(&self) -> f64 {
        self.table.values().copied().fold(0.0, f64::max)
    }

    /// Whether any atom pair, including an atom and its own periodic
    /// images, is closer than allowed.
    pub fn violated_by(&self, structure: &Structure) -> bool {
        let lengths = structure.lengths();
        for (i, s) in structure.species.iter().enumerate() {
            let self_limit = self.get(s, s);
            if (0..3).any(|axis| structure.pbc[axis] && lengths[axis] < self_limit) {
                return true;
            }
            for j in (i + 1)..structure.len() {
                if structure.distance(i, j) < self.get(s, &structure.species[j]) {
                    return true;
                }
            }
        }
        false
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    #[test]
    fn test_min_distances_symmetric() {
        let blmin = MinDistances::from_covalent_radii(&["Mg", "O"], 0.5).unwrap();
        assert!((blmin.get("Mg", "O") - 0.5 * (1.41 + 0.66)).abs() < 1e-12);
        assert_eq!(blmin.get("Mg", "O"), blmin.get("O", "Mg"));
    }

    #[test]
    fn test_unknown_element() {
        let err = MinDistances::from_covalent_radii(&["Xx"], 0.5).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownElement(s) if s == "Xx"));
    }

    #[test]
    fn test_violation_detected() {
        let blmin = MinDistances::from_covalent_radii(&["O"], 0.5).unwrap();
        let mut s = Structure::new(
            vec!["O".to_string(), "O".to_string()],
            vec![[0.0, 0.0, 0.0], [0.5, 0.5, 0.5]],
            Matrix3::identity() * 4.0,
        );
        assert!(!blmin.violated_by(&s));

        s.positions[1] = [0.05, 0.0, 0.0];
        assert!(blmin.violated_by(&s));
    }
}
