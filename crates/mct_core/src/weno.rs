//! Weighted essentially non-oscillatory (WENO) upwind reconstruction.
//!
//! Order `r` blends `r` candidate stencils of width `r` into a face value of
//! formal order `2r - 1`; order 1 is plain first-order upwinding. The window
//! passed to the reconstruction is centered on the upwind cell and holds
//! `2r - 1` values ordered along the flow direction.

use crate::traits::Active;
use anyhow::bail;
use serde::{Deserialize, Serialize};

pub const MAX_ORDER: usize = 3;
pub const MAX_WINDOW: usize = 2 * MAX_ORDER - 1;

/// Treatment of faces whose full stencil would leave the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryModel {
    /// Fall back to the highest order whose stencil fits.
    ReduceOrder,
}

impl BoundaryModel {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::ReduceOrder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WenoSettings {
    pub order: usize,
    pub eps: f64,
    pub boundary_model: BoundaryModel,
}

impl Default for WenoSettings {
    fn default() -> Self {
        Self {
            order: MAX_ORDER,
            eps: 1e-10,
            boundary_model: BoundaryModel::ReduceOrder,
        }
    }
}

impl WenoSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_ORDER).contains(&self.order) {
            bail!("WENO_ORDER must be between 1 and {MAX_ORDER}, got {}.", self.order);
        }
        if !(self.eps > 0.0) {
            bail!("WENO_EPS must be positive, got {}.", self.eps);
        }
        Ok(())
    }
}

/// Coefficients of one reconstruction order, padded to [`MAX_WINDOW`].
struct StencilTable {
    candidates: &'static [[f64; MAX_WINDOW]],
    ideal: &'static [f64],
    /// Smoothness indicator of candidate `k` is `Σ coef·(a·w)²` over its terms.
    smoothness: &'static [&'static [(f64, [f64; MAX_WINDOW])]],
}

const FIRST_ORDER: StencilTable = StencilTable {
    candidates: &[[1.0, 0.0, 0.0, 0.0, 0.0]],
    ideal: &[1.0],
    smoothness: &[&[]],
};

const THIRD_ORDER: StencilTable = StencilTable {
    candidates: &[[-0.5, 1.5, 0.0, 0.0, 0.0], [0.0, 0.5, 0.5, 0.0, 0.0]],
    ideal: &[1.0 / 3.0, 2.0 / 3.0],
    smoothness: &[
        &[(1.0, [-1.0, 1.0, 0.0, 0.0, 0.0])],
        &[(1.0, [0.0, -1.0, 1.0, 0.0, 0.0])],
    ],
};

const FIFTH_ORDER: StencilTable = StencilTable {
    candidates: &[
        [1.0 / 3.0, -7.0 / 6.0, 11.0 / 6.0, 0.0, 0.0],
        [0.0, -1.0 / 6.0, 5.0 / 6.0, 1.0 / 3.0, 0.0],
        [0.0, 0.0, 1.0 / 3.0, 5.0 / 6.0, -1.0 / 6.0],
    ],
    ideal: &[0.1, 0.6, 0.3],
    smoothness: &[
        &[
            (13.0 / 12.0, [1.0, -2.0, 1.0, 0.0, 0.0]),
            (0.25, [1.0, -4.0, 3.0, 0.0, 0.0]),
        ],
        &[
            (13.0 / 12.0, [0.0, 1.0, -2.0, 1.0, 0.0]),
            (0.25, [0.0, 1.0, 0.0, -1.0, 0.0]),
        ],
        &[
            (13.0 / 12.0, [0.0, 0.0, 1.0, -2.0, 1.0]),
            (0.25, [0.0, 0.0, 3.0, -4.0, 1.0]),
        ],
    ],
};

fn table(order: usize) -> &'static StencilTable {
    match order {
        1 => &FIRST_ORDER,
        2 => &THIRD_ORDER,
        _ => &FIFTH_ORDER,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weno {
    settings: WenoSettings,
}

impl Weno {
    pub fn new(settings: WenoSettings) -> Self {
        debug_assert!((1..=MAX_ORDER).contains(&settings.order));
        Self { settings }
    }

    pub fn order(&self) -> usize {
        self.settings.order
    }

    pub fn settings(&self) -> WenoSettings {
        self.settings
    }

    /// Order usable at the face downstream of `upwind_cell` (counted along the
    /// flow) in a column of `n_cells` cells.
    pub fn stencil_order(&self, upwind_cell: usize, n_cells: usize) -> usize {
        debug_assert!(upwind_cell < n_cells);
        match self.settings.boundary_model {
            BoundaryModel::ReduceOrder => self
                .settings
                .order
                .min(upwind_cell + 1)
                .min(n_cells - upwind_cell),
        }
    }

    /// Reconstructs the face value from `window` (`2·order - 1` entries).
    pub fn reconstruct<T: Active>(&self, order: usize, window: &[T]) -> T {
        debug_assert!(window.len() >= 2 * order - 1);
        if order == 1 {
            return window[0];
        }
        let tab = table(order);
        let width = 2 * order - 1;
        let eps = T::constant(self.settings.eps);

        let mut alpha_sum = T::zero();
        let mut blended = T::zero();
        for k in 0..order {
            let v_k = dot(&tab.candidates[k][..width], window);
            let mut beta = T::zero();
            for (coef, weights) in tab.smoothness[k] {
                let t = dot(&weights[..width], window);
                beta = beta + T::constant(*coef) * t * t;
            }
            let denom = eps + beta;
            let alpha = T::constant(tab.ideal[k]) / (denom * denom);
            alpha_sum = alpha_sum + alpha;
            blended = blended + alpha * v_k;
        }
        blended / alpha_sum
    }

    /// Plain-number reconstruction that also writes `∂v/∂window[j]` into `dv`.
    pub fn reconstruct_with_derivatives(&self, order: usize, window: &[f64], dv: &mut [f64]) -> f64 {
        let width = 2 * order - 1;
        debug_assert!(window.len() >= width && dv.len() >= width);
        if order == 1 {
            dv[0] = 1.0;
            return window[0];
        }
        let tab = table(order);

        let mut v = [0.0; MAX_ORDER];
        let mut alpha = [0.0; MAX_ORDER];
        let mut d_alpha = [[0.0; MAX_WINDOW]; MAX_ORDER];
        for k in 0..order {
            v[k] = dot(&tab.candidates[k][..width], &window[..width]);
            let mut beta = 0.0;
            let mut d_beta = [0.0; MAX_WINDOW];
            for (coef, weights) in tab.smoothness[k] {
                let t = dot(&weights[..width], &window[..width]);
                beta += coef * t * t;
                for j in 0..width {
                    d_beta[j] += 2.0 * coef * t * weights[j];
                }
            }
            let denom = self.settings.eps + beta;
            alpha[k] = tab.ideal[k] / (denom * denom);
            for j in 0..width {
                d_alpha[k][j] = -2.0 * alpha[k] / denom * d_beta[j];
            }
        }

        let alpha_sum: f64 = alpha[..order].iter().sum();
        let value = (0..order).map(|k| alpha[k] * v[k]).sum::<f64>() / alpha_sum;
        for j in 0..width {
            let mut acc = 0.0;
            for k in 0..order {
                acc += alpha[k] * tab.candidates[k][j] + (v[k] - value) * d_alpha[k][j];
            }
            dv[j] = acc / alpha_sum;
        }
        value
    }
}

fn dot<T: Active>(coefs: &[f64], values: &[T]) -> T {
    coefs
        .iter()
        .zip(values)
        .filter(|(c, _)| **c != 0.0)
        .fold(T::zero(), |acc, (c, v)| acc + T::constant(*c) * *v)
}
