//! Convection, axial dispersion, and inter-channel exchange on a cell-centered
//! finite volume grid.
//!
//! Per channel `k` and component `i`:
//!
//! ```text
//! ∂c/∂t = -u_k ∂c/∂z + D ∂²c/∂z² + Σ_{l≠k} e[l][k] c_l A_l / A_k - Σ_{l≠k} e[k][l] c_k
//! u_k c_in = u_k c(0) - D ∂c/∂z(0)        (Danckwerts inlet)
//! ∂c/∂z(L) = 0                            (outlet)
//! ```
//!
//! Cells are walked in flow coordinates: for a channel with reversed flow the
//! physical cell `n - 1 - k` plays the role of cell `k`, so the same formula
//! serves both directions. Directions are latched at section transitions and
//! never derived from evaluation values.

use crate::discretization::{Discretization, Indexer};
use crate::jacobian::SparseJacobian;
use crate::traits::Active;
use crate::weno::{Weno, WenoSettings, MAX_WINDOW};

/// Transport coefficients in the evaluation type, derived from the model
/// parameters for one residual evaluation.
#[derive(Debug, Clone)]
pub struct TransportCoefficients<T> {
    pub n_comp: usize,
    pub n_channel: usize,
    pub col_length: T,
    pub cross_sections: Vec<T>,
    /// Signed interstitial velocity `Q / A` per channel.
    pub velocity: Vec<T>,
    /// `[channel·n_comp + comp]`
    pub dispersion: Vec<T>,
    /// `[(from·n_channel + to)·n_comp + comp]`
    pub exchange: Vec<T>,
}

impl<T: Copy> TransportCoefficients<T> {
    #[inline]
    fn dispersion(&self, channel: usize, comp: usize) -> T {
        self.dispersion[channel * self.n_comp + comp]
    }

    #[inline]
    fn exchange(&self, from: usize, to: usize, comp: usize) -> T {
        self.exchange[(from * self.n_channel + to) * self.n_comp + comp]
    }
}

#[derive(Debug, Clone)]
pub struct MultiChannelConvectionDispersionOperator {
    disc: Discretization,
    weno: Weno,
    forward: Vec<bool>,
    velocity: Vec<f64>,
}

impl MultiChannelConvectionDispersionOperator {
    pub fn new(disc: Discretization, weno: WenoSettings) -> Self {
        Self {
            disc,
            weno: Weno::new(weno),
            forward: vec![true; disc.n_channel],
            velocity: vec![0.0; disc.n_channel],
        }
    }

    pub fn weno(&self) -> &Weno {
        &self.weno
    }

    /// Half bandwidth, in axial cells, of the Jacobian stencil.
    pub fn stencil_width(&self) -> usize {
        self.weno.order()
    }

    /// Latches the velocities of a new section. Zero velocity counts as forward.
    pub fn set_flow_state(&mut self, velocity: &[f64]) {
        debug_assert_eq!(velocity.len(), self.disc.n_channel);
        self.velocity.copy_from_slice(velocity);
        for (fwd, v) in self.forward.iter_mut().zip(velocity) {
            *fwd = *v >= 0.0;
        }
    }

    pub fn current_velocity(&self, channel: usize) -> f64 {
        self.velocity[channel]
    }

    pub fn is_forward(&self, channel: usize) -> bool {
        self.forward[channel]
    }

    pub fn flow_directions(&self) -> &[bool] {
        &self.forward
    }

    /// Physical axial cell fed by the inlet of `channel`.
    pub fn inflow_cell(&self, channel: usize) -> usize {
        self.physical_cell(channel, 0)
    }

    /// Physical axial cell drained by the outlet of `channel`.
    pub fn outflow_cell(&self, channel: usize) -> usize {
        self.physical_cell(channel, self.disc.n_col - 1)
    }

    #[inline]
    fn physical_cell(&self, channel: usize, k: usize) -> usize {
        if self.forward[channel] {
            k
        } else {
            self.disc.n_col - 1 - k
        }
    }

    /// Writes the bulk rows `ẏ + ∂(flux)/∂z - exchange` of the residual.
    ///
    /// `y` is a complete state vector; its inlet block supplies the inflow
    /// concentrations. Inlet rows of `res` are left untouched.
    pub fn residual<T: Active>(
        &self,
        coeffs: &TransportCoefficients<T>,
        y: &[T],
        y_dot: Option<&[f64]>,
        res: &mut [T],
    ) {
        let idx = self.disc.indexer();
        let n = self.disc.n_col;
        let h = coeffs.col_length / T::constant(n as f64);
        let mut window = [T::zero(); MAX_WINDOW];

        for ch in 0..self.disc.n_channel {
            let u = if self.forward[ch] {
                coeffs.velocity[ch]
            } else {
                -coeffs.velocity[ch]
            };
            for comp in 0..self.disc.n_comp {
                let d = coeffs.dispersion(ch, comp);
                let at = |k: usize| idx.c(self.physical_cell(ch, k), ch, comp);

                for k in 0..n {
                    let row = at(k);
                    res[row] = y_dot.map_or(T::zero(), |yd| T::constant(yd[row]));
                }

                let c_in = y[idx.inlet(ch, comp)];
                res[at(0)] = res[at(0)] - u * c_in / h;

                for i in 0..n - 1 {
                    let order = self.weno.stencil_order(i, n);
                    let width = 2 * order - 1;
                    for (w, slot) in window[..width].iter_mut().enumerate() {
                        *slot = y[at(i + w + 1 - order)];
                    }
                    let face = self.weno.reconstruct(order, &window[..width]);
                    let flux = (u * face - d * (y[at(i + 1)] - y[at(i)]) / h) / h;
                    res[at(i)] = res[at(i)] + flux;
                    res[at(i + 1)] = res[at(i + 1)] - flux;
                }

                let last = at(n - 1);
                res[last] = res[last] + u * y[last] / h;
            }
        }

        if self.disc.n_channel > 1 {
            self.exchange_residual(&idx, coeffs, y, res);
        }
    }

    fn exchange_residual<T: Active>(
        &self,
        idx: &Indexer,
        coeffs: &TransportCoefficients<T>,
        y: &[T],
        res: &mut [T],
    ) {
        let n_channel = self.disc.n_channel;
        for cell in 0..self.disc.n_col {
            for comp in 0..self.disc.n_comp {
                for k in 0..n_channel {
                    let own = y[idx.c(cell, k, comp)];
                    let mut ex = T::zero();
                    for l in (0..n_channel).filter(|&l| l != k) {
                        let inflow = coeffs.exchange(l, k, comp) * y[idx.c(cell, l, comp)]
                            * coeffs.cross_sections[l]
                            / coeffs.cross_sections[k];
                        ex = ex + inflow - coeffs.exchange(k, l, comp) * own;
                    }
                    let row = idx.c(cell, k, comp);
                    res[row] = res[row] - ex;
                }
            }
        }
    }

    /// Adds `∂(bulk residual)/∂y` to `jac` using hand-derived derivatives.
    pub fn assemble_jacobian(
        &self,
        coeffs: &TransportCoefficients<f64>,
        y: &[f64],
        jac: &mut SparseJacobian,
    ) {
        let idx = self.disc.indexer();
        let n = self.disc.n_col;
        let h = coeffs.col_length / n as f64;
        let mut window = [0.0; MAX_WINDOW];
        let mut dv = [0.0; MAX_WINDOW];

        for ch in 0..self.disc.n_channel {
            let u = if self.forward[ch] {
                coeffs.velocity[ch]
            } else {
                -coeffs.velocity[ch]
            };
            for comp in 0..self.disc.n_comp {
                let d = coeffs.dispersion(ch, comp);
                let at = |k: usize| idx.c(self.physical_cell(ch, k), ch, comp);

                jac.add(at(0), idx.inlet(ch, comp), -u / h);

                for i in 0..n - 1 {
                    let order = self.weno.stencil_order(i, n);
                    let width = 2 * order - 1;
                    for (w, slot) in window[..width].iter_mut().enumerate() {
                        *slot = y[at(i + w + 1 - order)];
                    }
                    self.weno
                        .reconstruct_with_derivatives(order, &window[..width], &mut dv[..width]);

                    let (up, down) = (at(i), at(i + 1));
                    for (w, dvw) in dv[..width].iter().enumerate() {
                        let col = at(i + w + 1 - order);
                        let val = u * dvw / h;
                        jac.add(up, col, val);
                        jac.add(down, col, -val);
                    }
                    let diff = d / (h * h);
                    jac.add(up, up, diff);
                    jac.add(up, down, -diff);
                    jac.add(down, up, -diff);
                    jac.add(down, down, diff);
                }

                let last = at(n - 1);
                jac.add(last, last, u / h);
            }
        }

        let n_channel = self.disc.n_channel;
        if n_channel == 1 {
            return;
        }
        for cell in 0..n {
            for comp in 0..self.disc.n_comp {
                for k in 0..n_channel {
                    let row = idx.c(cell, k, comp);
                    for l in (0..n_channel).filter(|&l| l != k) {
                        let ratio = coeffs.cross_sections[l] / coeffs.cross_sections[k];
                        jac.add(row, idx.c(cell, l, comp), -coeffs.exchange(l, k, comp) * ratio);
                        jac.add(row, row, coeffs.exchange(k, l, comp));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::ModelParameters;

    fn setup(n_col: usize, n_channel: usize, order: usize) -> (MultiChannelConvectionDispersionOperator, ModelParameters) {
        let disc = Discretization::new(1, n_col, n_channel).unwrap();
        let op = MultiChannelConvectionDispersionOperator::new(
            disc,
            WenoSettings {
                order,
                ..WenoSettings::default()
            },
        );
        let mut params = ModelParameters::new(1, n_channel);
        params.col_length = n_col as f64;
        params.flow_rates = vec![1.0; n_channel];
        (op, params)
    }

    #[test]
    fn uniform_state_with_matching_inlet_is_steady() {
        for order in 1..=3 {
            let (mut op, mut params) = setup(8, 2, order);
            params.dispersion = vec![0.3, 0.3];
            params.exchange = vec![0.0, 0.2, 0.2, 0.0];
            op.set_flow_state(&[1.0, -1.0]);
            let coeffs = params.coefficients::<f64>(None);
            let y = vec![0.7; 2 + 16];
            let mut res = vec![0.0; y.len()];
            op.residual(&coeffs, &y, None, &mut res);
            assert!(res[2..].iter().all(|r| r.abs() < 1e-12), "order {order}: {res:?}");
        }
    }

    #[test]
    fn pure_upwind_residual_matches_hand_computation() {
        let (mut op, params) = setup(3, 1, 1);
        op.set_flow_state(&[1.0]);
        let coeffs = params.coefficients::<f64>(None);
        // inlet 1, cells [0.5, 0.25, 0]
        let y = vec![1.0, 0.5, 0.25, 0.0];
        let mut res = vec![0.0; 4];
        op.residual(&coeffs, &y, None, &mut res);
        assert!((res[1] - (0.5 - 1.0)).abs() < 1e-15);
        assert!((res[2] - (0.25 - 0.5)).abs() < 1e-15);
        assert!((res[3] - (0.0 - 0.25)).abs() < 1e-15);
    }

    #[test]
    fn reversed_flow_enters_at_last_cell() {
        let (mut op, params) = setup(3, 1, 1);
        op.set_flow_state(&[-1.0]);
        assert_eq!(op.inflow_cell(0), 2);
        assert_eq!(op.outflow_cell(0), 0);
        let mut params = params;
        params.flow_rates = vec![-1.0];
        let coeffs = params.coefficients::<f64>(None);
        let y = vec![1.0, 0.0, 0.0, 0.0];
        let mut res = vec![0.0; 4];
        op.residual(&coeffs, &y, None, &mut res);
        assert!((res[3] + 1.0).abs() < 1e-15);
        assert_eq!(res[1], 0.0);
    }

    #[test]
    fn exchange_conserves_mass_across_channels() {
        let (mut op, mut params) = setup(2, 3, 1);
        params.flow_rates = vec![0.0; 3];
        params.cross_sections = vec![1.0, 2.0, 0.5];
        params.exchange = vec![0.0, 0.4, 0.1, 0.3, 0.0, 0.2, 0.05, 0.6, 0.0];
        op.set_flow_state(&[0.0; 3]);
        let coeffs = params.coefficients::<f64>(None);
        let y = vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 0.5, 0.1, 0.9];
        let mut res = vec![0.0; y.len()];
        op.residual(&coeffs, &y, None, &mut res);
        for cell in 0..2 {
            let mass: f64 = (0..3).map(|ch| res[3 + cell * 3 + ch] * params.cross_sections[ch]).sum();
            assert!(mass.abs() < 1e-14, "cell {cell}: {mass}");
        }
    }
}
