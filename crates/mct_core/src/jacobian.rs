//! Fixed-pattern sparse Jacobian, seed coloring for dual-number extraction,
//! and the cached factorization used by the linear solve.
//!
//! Row structure:
//! - inlet rows: identity,
//! - bulk row `(cell, channel, comp)`: same channel and component within
//!   `stencil_width` axial cells, all channels of the same cell and component
//!   (exchange block), and the inlet DOF of its channel if the cell sits at
//!   either end of the column (inflow end depends on the flow direction).
//!
//! The pattern depends only on the discretization and the scheme order; only
//! values change between evaluations.
//!
//! Inlet rows are diagonal, so the iteration matrix is solved by eliminating
//! the inlet block first and factorizing the bulk block as a band matrix of
//! half-width `stencil_width·n_channel·n_comp`.

use crate::autodiff::Dual;
use crate::banded::BandedLu;
use crate::discretization::{Discretization, Dof};
use crate::error::ModelError;
use log::trace;
use nalgebra::DMatrix;
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;

pub struct SparseJacobian {
    matrix: CsrMatrix<f64>,
    colors: Vec<usize>,
    n_colors: usize,
    /// Diagonal of `∂F/∂ẏ`: zero on inlet rows, one on bulk rows.
    derivative_diag: Vec<f64>,
    n_inlet: usize,
    /// Inverted diagonal of the inlet block of the last factorization.
    inlet_pivots: Vec<f64>,
    bulk_lu: BandedLu,
    factorized_alpha: f64,
    needs_factorization: bool,
}

impl std::fmt::Debug for SparseJacobian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseJacobian")
            .field("dofs", &self.matrix.nrows())
            .field("nnz", &self.matrix.nnz())
            .field("n_colors", &self.n_colors)
            .field("needs_factorization", &self.needs_factorization)
            .finish()
    }
}

fn row_columns(disc: &Discretization, stencil_width: usize, row: usize, cols: &mut Vec<usize>) {
    let idx = disc.indexer();
    cols.clear();
    match idx.decompose(row) {
        Dof::Inlet { .. } => cols.push(row),
        Dof::Bulk {
            cell,
            channel,
            comp,
        } => {
            if cell == 0 || cell == disc.n_col - 1 {
                cols.push(idx.inlet(channel, comp));
            }
            let lo = cell.saturating_sub(stencil_width);
            let hi = (cell + stencil_width).min(disc.n_col - 1);
            cols.extend((lo..=hi).map(|j| idx.c(j, channel, comp)));
            cols.extend((0..disc.n_channel).map(|l| idx.c(cell, l, comp)));
            cols.sort_unstable();
            cols.dedup();
        }
    }
}

/// Groups columns so that no row depends on two columns of the same group.
///
/// Bulk column `(cell, channel, comp)` gets color
/// `((cell mod w)·n_channel + channel)·n_comp + comp` with `w = 2·width + 1`;
/// all inlet columns share one extra color.
fn seed_colors(disc: &Discretization, stencil_width: usize) -> (Vec<usize>, usize) {
    let idx = disc.indexer();
    let period = (2 * stencil_width + 1).min(disc.n_col);
    let bulk_colors = period * disc.n_channel * disc.n_comp;
    let colors = (0..disc.num_dofs())
        .map(|col| match idx.decompose(col) {
            Dof::Inlet { .. } => bulk_colors,
            Dof::Bulk {
                cell,
                channel,
                comp,
            } => ((cell % period) * disc.n_channel + channel) * disc.n_comp + comp,
        })
        .collect();
    (colors, bulk_colors + 1)
}

impl SparseJacobian {
    pub fn new(disc: &Discretization, stencil_width: usize) -> Result<Self, ModelError> {
        let n = disc.num_dofs();
        let mut offsets = Vec::with_capacity(n + 1);
        let mut indices = Vec::new();
        let mut cols = Vec::new();
        offsets.push(0);
        for row in 0..n {
            row_columns(disc, stencil_width, row, &mut cols);
            indices.extend_from_slice(&cols);
            offsets.push(indices.len());
        }
        let nnz = indices.len();
        let pattern = SparsityPattern::try_from_offsets_and_indices(n, n, offsets, indices)
            .map_err(|e| ModelError::InvalidDiscretization(format!("Jacobian pattern: {e}")))?;
        let matrix = CsrMatrix::try_from_pattern_and_values(pattern, vec![0.0; nnz])
            .map_err(|e| ModelError::InvalidDiscretization(format!("Jacobian storage: {e}")))?;

        let (colors, n_colors) = seed_colors(disc, stencil_width);
        let inlet = disc.num_inlet_dofs();
        let derivative_diag = (0..n).map(|i| if i < inlet { 0.0 } else { 1.0 }).collect();
        let n_bulk = n - inlet;
        let half_width = (stencil_width * disc.n_channel * disc.n_comp).min(n_bulk.saturating_sub(1));

        trace!("Jacobian pattern: {n} DOFs, {nnz} nonzeros, {n_colors} seed colors");

        Ok(Self {
            matrix,
            colors,
            n_colors,
            derivative_diag,
            n_inlet: inlet,
            inlet_pivots: vec![0.0; inlet],
            bulk_lu: BandedLu::zeros(n_bulk, half_width, half_width),
            factorized_alpha: f64::NAN,
            needs_factorization: true,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn num_colors(&self) -> usize {
        self.n_colors
    }

    pub fn color(&self, col: usize) -> usize {
        self.colors[col]
    }

    pub fn reset(&mut self) {
        self.matrix.values_mut().iter_mut().for_each(|v| *v = 0.0);
        self.needs_factorization = true;
    }

    fn position(&self, row: usize, col: usize) -> Option<usize> {
        let offsets = self.matrix.row_offsets();
        let (start, end) = (offsets[row], offsets[row + 1]);
        self.matrix.col_indices()[start..end]
            .binary_search(&col)
            .ok()
            .map(|p| start + p)
    }

    /// Adds `value` to a structural entry.
    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        match self.position(row, col) {
            Some(p) => self.matrix.values_mut()[p] += value,
            None => debug_assert!(false, "({row}, {col}) is outside the Jacobian pattern"),
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.position(row, col)
            .map_or(0.0, |p| self.matrix.values()[p])
    }

    /// Sets inlet rows to the identity.
    pub fn set_identity_rows(&mut self, rows: std::ops::Range<usize>) {
        for row in rows {
            if let Some(p) = self.position(row, row) {
                self.matrix.values_mut()[p] = 1.0;
            }
        }
    }

    /// Copies directional derivatives of one seed color into the matrix.
    pub fn harvest(&mut self, color: usize, dual_res: &[Dual]) {
        let (offsets, indices, values) = self.matrix.csr_data_mut();
        for row in 0..offsets.len() - 1 {
            for p in offsets[row]..offsets[row + 1] {
                if self.colors[indices[p]] == color {
                    values[p] = dual_res[row].eps;
                }
            }
        }
        self.needs_factorization = true;
    }

    /// Columns seeded together for `color`.
    pub fn seed_vector(&self, color: usize, seeds: &mut [f64]) {
        for (s, c) in seeds.iter_mut().zip(&self.colors) {
            *s = if *c == color { 1.0 } else { 0.0 };
        }
    }

    /// Flags undefined derivatives rather than letting them reach the solver.
    pub fn check_finite(&self) -> Result<(), ModelError> {
        match self.matrix.triplet_iter().find(|(_, _, v)| !v.is_finite()) {
            Some((row, col, _)) => Err(ModelError::NonFiniteJacobian { row, col }),
            None => Ok(()),
        }
    }

    /// `out = alpha·J·x + beta·out`
    pub fn multiply(&self, x: &[f64], alpha: f64, beta: f64, out: &mut [f64]) {
        let (offsets, indices, values) = self.matrix.csr_data();
        for (row, o) in out.iter_mut().enumerate() {
            let mut acc = 0.0;
            for p in offsets[row]..offsets[row + 1] {
                acc += values[p] * x[indices[p]];
            }
            *o = alpha * acc + if beta == 0.0 { 0.0 } else { beta * *o };
        }
    }

    /// `out = ∂F/∂ẏ · x`
    pub fn multiply_derivative(&self, x: &[f64], out: &mut [f64]) {
        for ((o, d), v) in out.iter_mut().zip(&self.derivative_diag).zip(x) {
            *o = d * v;
        }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let n = self.matrix.nrows();
        let mut dense = DMatrix::zeros(n, n);
        for (i, j, v) in self.matrix.triplet_iter() {
            dense[(i, j)] = *v;
        }
        dense
    }

    /// Dense `J[rows, cols]`.
    pub fn submatrix(&self, rows: &[usize], cols: &[usize]) -> DMatrix<f64> {
        DMatrix::from_fn(rows.len(), cols.len(), |i, j| self.get(rows[i], cols[j]))
    }

    pub fn mark_stale(&mut self) {
        self.needs_factorization = true;
    }

    pub fn needs_factorization(&self) -> bool {
        self.needs_factorization
    }

    /// Factorizes `J + alpha·∂F/∂ẏ`.
    pub fn factorize(&mut self, alpha: f64) -> Result<(), ModelError> {
        self.needs_factorization = true;
        let n_inlet = self.n_inlet;
        for i in 0..n_inlet {
            let d = self.get(i, i) + alpha * self.derivative_diag[i];
            if d == 0.0 || !d.is_finite() {
                return Err(ModelError::SingularJacobian);
            }
            self.inlet_pivots[i] = 1.0 / d;
        }

        self.bulk_lu.clear();
        for (i, j, v) in self.matrix.triplet_iter() {
            if i >= n_inlet && j >= n_inlet {
                self.bulk_lu.add(i - n_inlet, j - n_inlet, *v);
            }
        }
        for (i, d) in self.derivative_diag.iter().enumerate().skip(n_inlet) {
            self.bulk_lu.add(i - n_inlet, i - n_inlet, alpha * d);
        }
        self.bulk_lu.factorize()?;

        trace!(
            "factorized {} inlet rows and {}-row band (alpha = {alpha:e})",
            n_inlet,
            self.bulk_lu.dim()
        );
        self.factorized_alpha = alpha;
        self.needs_factorization = false;
        Ok(())
    }

    /// Solves `(J + alpha·∂F/∂ẏ) x = rhs` in place, refactorizing only if the
    /// Jacobian or `alpha` changed since the last factorization.
    pub fn solve(&mut self, alpha: f64, rhs: &mut [f64]) -> Result<(), ModelError> {
        if self.needs_factorization || self.factorized_alpha != alpha {
            self.factorize(alpha)?;
        }
        let rhs = &mut rhs[..self.num_rows()];
        let n_inlet = self.n_inlet;
        for (x, p) in rhs[..n_inlet].iter_mut().zip(&self.inlet_pivots) {
            *x *= p;
        }
        let (offsets, indices, values) = self.matrix.csr_data();
        for row in n_inlet..rhs.len() {
            let mut coupling = 0.0;
            for p in offsets[row]..offsets[row + 1] {
                if indices[p] < n_inlet {
                    coupling += values[p] * rhs[indices[p]];
                }
            }
            rhs[row] -= coupling;
        }
        self.bulk_lu.solve(&mut rhs[n_inlet..])
    }

    /// Like [`SparseJacobian::solve`], followed by one refinement step if the
    /// weighted RMS norm of the linear residual exceeds `tol`.
    pub fn solve_refined(
        &mut self,
        alpha: f64,
        tol: f64,
        rhs: &mut [f64],
        weight: &[f64],
    ) -> Result<(), ModelError> {
        let rhs = &mut rhs[..self.num_rows()];
        let b = rhs.to_vec();
        self.solve(alpha, rhs)?;

        let mut r = vec![0.0; b.len()];
        self.apply_iteration_matrix(alpha, rhs, &mut r);
        for (ri, bi) in r.iter_mut().zip(&b) {
            *ri = bi - *ri;
        }
        if weighted_rms(&r, weight) > tol {
            trace!("refining linear solve");
            self.solve(alpha, &mut r)?;
            for (x, dx) in rhs.iter_mut().zip(&r) {
                *x += dx;
            }
        }
        Ok(())
    }

    /// `out = (J + alpha·∂F/∂ẏ)·x`
    fn apply_iteration_matrix(&self, alpha: f64, x: &[f64], out: &mut [f64]) {
        self.multiply(x, 1.0, 0.0, out);
        for ((o, d), v) in out.iter_mut().zip(&self.derivative_diag).zip(x) {
            *o += alpha * d * v;
        }
    }
}

pub fn weighted_rms(values: &[f64], weight: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let w = weight.get(i).copied().unwrap_or(1.0);
            (v * w) * (v * w)
        })
        .sum();
    (sum / values.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disc() -> Discretization {
        Discretization::new(2, 9, 3).unwrap()
    }

    #[test]
    fn pattern_contains_band_exchange_and_inlet_blocks() {
        let d = disc();
        let idx = d.indexer();
        let jac = SparseJacobian::new(&d, 2).unwrap();
        let row = idx.c(4, 1, 0);
        assert!(jac.position(row, idx.c(2, 1, 0)).is_some());
        assert!(jac.position(row, idx.c(6, 1, 0)).is_some());
        assert!(jac.position(row, idx.c(7, 1, 0)).is_none());
        assert!(jac.position(row, idx.c(4, 2, 0)).is_some());
        assert!(jac.position(row, idx.c(4, 1, 1)).is_none());
        assert!(jac.position(idx.c(0, 2, 1), idx.inlet(2, 1)).is_some());
        assert!(jac.position(idx.c(8, 2, 1), idx.inlet(2, 1)).is_some());
        assert!(jac.position(idx.c(4, 2, 1), idx.inlet(2, 1)).is_none());
    }

    #[test]
    fn no_row_sees_two_columns_of_one_color() {
        for width in 1..=3 {
            let d = disc();
            let jac = SparseJacobian::new(&d, width).unwrap();
            let (offsets, indices, _) = jac.matrix.csr_data();
            for row in 0..d.num_dofs() {
                let mut seen = vec![false; jac.num_colors()];
                for &col in &indices[offsets[row]..offsets[row + 1]] {
                    let c = jac.color(col);
                    assert!(!seen[c], "width {width}, row {row}: color {c} twice");
                    seen[c] = true;
                }
            }
        }
    }

    #[test]
    fn add_accumulates_and_multiply_uses_values() {
        let d = Discretization::new(1, 3, 1).unwrap();
        let mut jac = SparseJacobian::new(&d, 1).unwrap();
        jac.set_identity_rows(0..1);
        jac.add(1, 1, 2.0);
        jac.add(1, 1, 1.0);
        jac.add(2, 1, -1.0);
        assert_eq!(jac.get(1, 1), 3.0);
        let mut out = vec![1.0; 4];
        jac.multiply(&[1.0, 1.0, 0.0, 0.0], 2.0, 1.0, &mut out);
        assert_eq!(out, vec![3.0, 7.0, -1.0, 1.0]);
    }

    #[test]
    fn solve_reuses_factorization_until_stale() {
        let d = Discretization::new(1, 2, 1).unwrap();
        let mut jac = SparseJacobian::new(&d, 1).unwrap();
        jac.set_identity_rows(0..1);
        jac.add(1, 1, 1.0);
        jac.add(2, 2, 1.0);
        let mut rhs = vec![2.0, 4.0, 6.0];
        jac.solve(1.0, &mut rhs).expect("solve");
        assert_eq!(rhs, vec![2.0, 2.0, 3.0]);
        assert!(!jac.needs_factorization());
        jac.reset();
        assert!(jac.needs_factorization());
        let err = jac.solve(0.0, &mut rhs).expect_err("singular");
        assert!(matches!(err, ModelError::SingularJacobian));
        assert!(jac.needs_factorization());
    }

    #[test]
    fn block_band_solve_matches_dense_lu() {
        let d = Discretization::new(2, 6, 3).unwrap();
        let idx = d.indexer();
        let mut jac = SparseJacobian::new(&d, 2).unwrap();
        jac.set_identity_rows(0..d.num_inlet_dofs());
        for row in d.num_inlet_dofs()..d.num_dofs() {
            let (offsets, indices, _) = jac.matrix.csr_data();
            let cols: Vec<usize> = indices[offsets[row]..offsets[row + 1]].to_vec();
            for col in cols {
                let v = if col == row {
                    4.0
                } else {
                    ((row * 7 + col * 3) % 13) as f64 * 0.05 - 0.3
                };
                jac.add(row, col, v);
            }
        }
        assert!(jac.position(idx.c(5, 2, 1), idx.inlet(2, 1)).is_some());

        let alpha = 0.25;
        let mut dense = jac.to_dense();
        for (i, dd) in jac.derivative_diag.iter().enumerate() {
            dense[(i, i)] += alpha * dd;
        }
        let rhs: Vec<f64> = (0..d.num_dofs()).map(|i| (i as f64 * 0.37).cos()).collect();
        let expected = dense
            .lu()
            .solve(&nalgebra::DVector::from_column_slice(&rhs))
            .expect("dense solve");
        let mut x = rhs.clone();
        jac.solve(alpha, &mut x).expect("block band solve");
        for (a, b) in x.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-9 * (1.0 + b.abs()), "{a} vs {b}");
        }
    }

    #[test]
    fn non_finite_entries_are_flagged() {
        let d = Discretization::new(1, 2, 1).unwrap();
        let mut jac = SparseJacobian::new(&d, 1).unwrap();
        jac.add(2, 1, f64::NAN);
        match jac.check_finite() {
            Err(ModelError::NonFiniteJacobian { row, col }) => assert_eq!((row, col), (2, 1)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
