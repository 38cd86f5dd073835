//! Piecewise cubic inlet concentration profile.

use crate::traits::Active;
use serde::{Deserialize, Serialize};

/// Coefficients of `a + b·τ + c·τ² + d·τ³` for every channel and component,
/// indexed `[degree][channel·n_comp + comp]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubicSection {
    pub coeffs: [Vec<f64>; 4],
}

impl CubicSection {
    pub fn constant(values: Vec<f64>) -> Self {
        let zeros = vec![0.0; values.len()];
        Self {
            coeffs: [values, zeros.clone(), zeros.clone(), zeros],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InletProfile {
    n_entries: usize,
    sections: Vec<CubicSection>,
}

impl InletProfile {
    pub fn zero(n_entries: usize) -> Self {
        Self {
            n_entries,
            sections: Vec::new(),
        }
    }

    pub fn new(n_entries: usize, sections: Vec<CubicSection>) -> Self {
        debug_assert!(sections
            .iter()
            .all(|s| s.coeffs.iter().all(|c| c.len() == n_entries)));
        Self { n_entries, sections }
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    pub fn num_entries(&self) -> usize {
        self.n_entries
    }

    /// Sections beyond the configured ones reuse the last configured section.
    fn section(&self, sec_idx: usize) -> Option<(usize, &CubicSection)> {
        let idx = sec_idx.min(self.sections.len().checked_sub(1)?);
        Some((idx, &self.sections[idx]))
    }

    pub fn coefficient_mut(&mut self, sec_idx: usize, degree: usize, entry: usize) -> Option<&mut f64> {
        self.sections
            .get_mut(sec_idx)
            .and_then(|s| s.coeffs[degree].get_mut(entry))
    }

    /// Evaluates the profile at section-local time `tau`. `lift` turns a
    /// coefficient `(section, degree, entry, value)` into the evaluation type.
    pub fn value<T, F>(&self, sec_idx: usize, entry: usize, tau: f64, lift: F) -> T
    where
        T: Active,
        F: Fn(usize, usize, usize, f64) -> T,
    {
        let Some((sec, s)) = self.section(sec_idx) else {
            return T::zero();
        };
        let tau = T::constant(tau);
        // Horner
        let mut acc = lift(sec, 3, entry, s.coeffs[3][entry]);
        for degree in (0..3).rev() {
            acc = acc * tau + lift(sec, degree, entry, s.coeffs[degree][entry]);
        }
        acc
    }

    /// Time derivative of [`InletProfile::value`].
    pub fn time_derivative<T, F>(&self, sec_idx: usize, entry: usize, tau: f64, lift: F) -> T
    where
        T: Active,
        F: Fn(usize, usize, usize, f64) -> T,
    {
        let Some((sec, s)) = self.section(sec_idx) else {
            return T::zero();
        };
        let tau = T::constant(tau);
        let b = lift(sec, 1, entry, s.coeffs[1][entry]);
        let c = lift(sec, 2, entry, s.coeffs[2][entry]);
        let d = lift(sec, 3, entry, s.coeffs[3][entry]);
        b + (T::constant(2.0) * c + T::constant(3.0) * d * tau) * tau
    }
}
