//! Banded LU factorization with partial pivoting.
//!
//! Row `i` stores columns `i - kl ..= i + ku + kl`; the extra `kl` upper
//! diagonals hold the fill-in produced by row interchanges. Multipliers stay
//! in the rows where they were computed, so the forward substitution applies
//! the interchanges step by step.

use crate::error::ModelError;

#[derive(Debug, Clone)]
pub struct BandedLu {
    n: usize,
    kl: usize,
    ku: usize,
    width: usize,
    data: Vec<f64>,
    pivots: Vec<usize>,
    factorized: bool,
}

impl BandedLu {
    /// Zero `n × n` matrix with `kl` sub- and `ku` super-diagonals.
    pub fn zeros(n: usize, kl: usize, ku: usize) -> Self {
        let width = 2 * kl + ku + 1;
        Self {
            n,
            kl,
            ku,
            width,
            data: vec![0.0; n * width],
            pivots: (0..n).collect(),
            factorized: false,
        }
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    /// Whether `(row, col)` lies inside the stored band of the unfactorized matrix.
    pub fn in_band(&self, row: usize, col: usize) -> bool {
        col + self.kl >= row && col <= row + self.ku
    }

    #[inline]
    fn slot(&self, row: usize, col: usize) -> usize {
        row * self.width + (col + self.kl - row)
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> f64 {
        self.data[self.slot(row, col)]
    }

    #[inline]
    fn at_mut(&mut self, row: usize, col: usize) -> &mut f64 {
        let s = self.slot(row, col);
        &mut self.data[s]
    }

    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0.0);
        self.factorized = false;
    }

    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        debug_assert!(self.in_band(row, col), "({row}, {col}) is outside the band");
        *self.at_mut(row, col) += value;
        self.factorized = false;
    }

    /// Factorizes in place. Fails on an exactly zero or non-finite pivot.
    pub fn factorize(&mut self) -> Result<(), ModelError> {
        let n = self.n;
        let reach = self.ku + self.kl;
        for k in 0..n {
            let last_row = (k + self.kl).min(n - 1);
            let mut p = k;
            let mut best = self.at(k, k).abs();
            for i in k + 1..=last_row {
                let v = self.at(i, k).abs();
                if v > best {
                    best = v;
                    p = i;
                }
            }
            if best == 0.0 || !best.is_finite() {
                return Err(ModelError::SingularJacobian);
            }
            self.pivots[k] = p;

            let last_col = (k + reach).min(n - 1);
            if p != k {
                for j in k..=last_col {
                    let (a, b) = (self.slot(k, j), self.slot(p, j));
                    self.data.swap(a, b);
                }
            }

            let pivot = self.at(k, k);
            for i in k + 1..=last_row {
                let l = self.at(i, k) / pivot;
                *self.at_mut(i, k) = l;
                if l == 0.0 {
                    continue;
                }
                for j in k + 1..=last_col {
                    let u = self.at(k, j);
                    *self.at_mut(i, j) -= l * u;
                }
            }
        }
        self.factorized = true;
        Ok(())
    }

    /// Solves `A x = b` in place with the stored factors.
    pub fn solve(&self, b: &mut [f64]) -> Result<(), ModelError> {
        if !self.factorized {
            return Err(ModelError::SingularJacobian);
        }
        let n = self.n;
        debug_assert_eq!(b.len(), n);
        for k in 0..n {
            b.swap(k, self.pivots[k]);
            let bk = b[k];
            if bk == 0.0 {
                continue;
            }
            for i in k + 1..=(k + self.kl).min(n - 1) {
                b[i] -= self.at(i, k) * bk;
            }
        }
        for i in (0..n).rev() {
            let mut s = b[i];
            for j in i + 1..=(i + self.ku + self.kl).min(n - 1) {
                s -= self.at(i, j) * b[j];
            }
            b[i] = s / self.at(i, i);
        }
        Ok(())
    }
}
