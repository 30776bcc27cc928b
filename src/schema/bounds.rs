//! Admissible ranges for periodic cell shapes.

use serde::{Deserialize, Serialize};

use super::{ConfigError, Structure};

/// Cell length (Å) and angle (degrees) ranges.
///
/// Angles follow the usual convention: `alpha` between b and c, `beta`
/// between a and c, `gamma` between a and b.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellBounds {
    pub a: (f64, f64),
    pub b: (f64, f64),
    pub c: (f64, f64),
    pub alpha: (f64, f64),
    pub beta: (f64, f64),
    pub gamma: (f64, f64),
}

impl CellBounds {
    /// Uniform bounds for all three lengths and all three angles.
    pub fn uniform(lengths: (f64, f64), angles: (f64, f64)) -> Self {
        Self {
            a: lengths,
            b: lengths,
            c: lengths,
            alpha: angles,
            beta: angles,
            gamma: angles,
        }
    }

    /// Bounds used to reject relaxed or mutated cells.
    pub fn relaxation_default() -> Self {
        Self::uniform((2.0, 60.0), (20.0, 160.0))
    }

    /// Tighter bounds used when generating random cells.
    pub fn generation_default() -> Self {
        Self::uniform((3.0, 50.0), (35.0, 145.0))
    }

    /// Whether the structure's cell lies inside every range.
    pub fn is_within_bounds(&self, structure: &Structure) -> bool {
        let lengths = structure.lengths();
        let angles = structure.angles();
        let inside = |v: f64, (lo, hi): (f64, f64)| v >= lo && v <= hi;

        inside(lengths[0], self.a)
            && inside(lengths[1], self.b)
            && inside(lengths[2], self.c)
            && inside(angles[0], self.alpha)
            && inside(angles[1], self.beta)
            && inside(angles[2], self.gamma)
    }

    /// Check that each range is ordered and physically meaningful.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        for (label, (lo, hi)) in [("a", self.a), ("b", self.b), ("c", self.c)] {
            if lo > hi || lo <= 0.0 {
                return Err(ConfigError::InvalidBounds(format!(
                    "{name}.{label}: [{lo}, {hi}]"
                )));
            }
        }
        for (label, (lo, hi)) in [
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("gamma", self.gamma),
        ] {
            if lo > hi || lo < 0.0 || hi > 180.0 {
                return Err(ConfigError::InvalidBounds(format!(
                    "{name}.{label}: [{lo}, {hi}]"
                )));
            }
        }
        Ok(())
    }
}

impl Default for CellBounds {
    fn default() -> Self {
        Self::relaxation_default()
    }
}
