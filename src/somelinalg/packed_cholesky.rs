//! Packed lower-triangular matrices and the dense kernels the trust-region solver
//! runs on them: Cholesky factorization, forward/back substitution, explicit
//! inversion and an estimate of the smallest singular value.
//!
//! Storage is row-major over the lower triangle: entry `(i, j)`, `i >= j`, lives at
//! `i(i+1)/2 + j`, so a matrix of order `n` takes `n(n+1)/2` numbers.
use crate::somelinalg::vector_kernels::euclidean_norm;
use nalgebra::{DMatrix, DVector};
use std::fmt;

/// Number of stored entries of a packed triangle of order `n`.
#[inline]
pub fn packed_len(n: usize) -> usize {
    n * (n + 1) / 2
}

#[inline]
pub fn packed_index(i: usize, j: usize) -> usize {
    debug_assert!(j <= i);
    i * (i + 1) / 2 + j
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinalgError {
    /// exact zero on the diagonal of a triangular factor
    ZeroDiagonal(usize),
    DimensionMismatch { expected: usize, found: usize },
}

impl fmt::Display for LinalgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinalgError::ZeroDiagonal(i) => {
                write!(f, "zero diagonal element at row {} of triangular factor", i)
            }
            LinalgError::DimensionMismatch { expected, found } => {
                write!(f, "dimension mismatch: expected {}, found {}", expected, found)
            }
        }
    }
}

impl std::error::Error for LinalgError {}

fn check_len(expected: usize, found: usize) -> Result<(), LinalgError> {
    if expected != found {
        return Err(LinalgError::DimensionMismatch { expected, found });
    }
    Ok(())
}

/// Symmetric matrix stored as its packed lower triangle.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedSymmetric {
    n: usize,
    data: Vec<f64>,
}

impl PackedSymmetric {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; packed_len(n)],
        }
    }

    pub fn from_packed(n: usize, data: Vec<f64>) -> Result<Self, LinalgError> {
        check_len(packed_len(n), data.len())?;
        Ok(Self { n, data })
    }

    /// Takes the lower triangle of a square matrix.
    pub fn from_dense(a: &DMatrix<f64>) -> Self {
        let n = a.nrows().min(a.ncols());
        let mut data = Vec::with_capacity(packed_len(n));
        for i in 0..n {
            for j in 0..=i {
                data.push(a[(i, j)]);
            }
        }
        Self { n, data }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.n, self.n, |i, j| self.get(i, j))
    }

    pub fn order(&self) -> usize {
        self.n
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        if i >= j {
            self.data[packed_index(i, j)]
        } else {
            self.data[packed_index(j, i)]
        }
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        let k = if i >= j {
            packed_index(i, j)
        } else {
            packed_index(j, i)
        };
        self.data[k] = value;
    }

    pub fn diagonal(&self) -> DVector<f64> {
        DVector::from_fn(self.n, |i, _| self.data[packed_index(i, i)])
    }

    pub fn add_to_diagonal(&mut self, alpha: f64) {
        for i in 0..self.n {
            self.data[packed_index(i, i)] += alpha;
        }
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    /// Largest absolute entry.
    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
    }

    pub fn sum(&self, other: &PackedSymmetric) -> PackedSymmetric {
        debug_assert_eq!(self.n, other.n);
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        PackedSymmetric { n: self.n, data }
    }

    pub fn mul_vec(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut y = DVector::zeros(self.n);
        for i in 0..self.n {
            let row = packed_index(i, 0);
            for j in 0..i {
                let aij = self.data[row + j];
                y[i] += aij * x[j];
                y[j] += aij * x[i];
            }
            y[i] += self.data[row + i] * x[i];
        }
        y
    }

    /// `xᵀ A x`
    pub fn quadratic_form(&self, x: &DVector<f64>) -> f64 {
        x.dot(&self.mul_vec(x))
    }

    /// `D⁻¹ A D⁻¹` for a positive diagonal `d`.
    pub fn diagonally_scaled(&self, d: &DVector<f64>) -> PackedSymmetric {
        let mut out = self.clone();
        for i in 0..self.n {
            for j in 0..=i {
                out.data[packed_index(i, j)] /= d[i] * d[j];
            }
        }
        out
    }

    /// `A += coef (u vᵀ + v uᵀ)`
    pub fn symmetric_rank_two_update(&mut self, coef: f64, u: &DVector<f64>, v: &DVector<f64>) {
        for i in 0..self.n {
            for j in 0..=i {
                self.data[packed_index(i, j)] += coef * (u[i] * v[j] + v[i] * u[j]);
            }
        }
    }

    /// `Π A Πᵀ` where row `k` of `A` goes to row `permutation[k]`.
    pub fn permuted(&self, permutation: &[usize]) -> PackedSymmetric {
        let mut out = PackedSymmetric::zeros(self.n);
        for i in 0..self.n {
            for j in 0..=i {
                out.set(permutation[i], permutation[j], self.get(i, j));
            }
        }
        out
    }
}

/// Lower-triangular matrix in packed storage.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedLower {
    n: usize,
    data: Vec<f64>,
}

/// Result of a failed Cholesky factorization.
#[derive(Debug, Clone, PartialEq)]
pub struct NotPositiveDefinite {
    /// first row whose reduced diagonal was not positive
    pub index: usize,
    /// rows `0..=index` of the factor; entry `(index, index)` holds the
    /// non-positive reduced diagonal, later rows are zero
    pub partial: PackedLower,
}

impl NotPositiveDefinite {
    /// Direction of non-positive curvature of the leading block of order
    /// `index + 1`, together with its Rayleigh quotient `t/‖w‖² <= 0`.
    ///
    /// Solves `Lᵀw = e_index` with the failing diagonal replaced by one; then
    /// `wᵀAw` equals the reduced diagonal `t`.
    pub fn curvature_direction(&self) -> (DVector<f64>, f64) {
        let k = self.index;
        let n = self.partial.n;
        let t = self.partial.get(k, k);
        let mut w = DVector::zeros(n);
        w[k] = 1.0;
        for i in (0..k).rev() {
            let mut s = 0.0;
            for j in (i + 1)..=k {
                s += self.partial.get(j, i) * w[j];
            }
            w[i] = -s / self.partial.get(i, i);
        }
        let wn = euclidean_norm(w.as_slice());
        (w, t / (wn * wn))
    }
}

/// Outcome of the smallest singular value estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct SingularEstimate {
    /// estimate of the smallest singular value, zero for an exactly singular factor
    pub sigma: f64,
    /// normalized approximate left singular vector `x`
    pub left: DVector<f64>,
    /// unnormalized approximate right singular vector `y = L⁻¹x`
    pub right: DVector<f64>,
}

/// Cholesky factorization `A = L·Lᵀ` of a packed symmetric matrix.
pub fn cholesky_factor_packed(a: &PackedSymmetric) -> Result<PackedLower, NotPositiveDefinite> {
    let n = a.n;
    let mut l = vec![0.0; packed_len(n)];
    for i in 0..n {
        let i0 = packed_index(i, 0);
        for j in 0..i {
            let j0 = packed_index(j, 0);
            let mut t = a.data[i0 + j];
            for k in 0..j {
                t -= l[i0 + k] * l[j0 + k];
            }
            l[i0 + j] = t / l[j0 + j];
        }
        let mut t = a.data[i0 + i];
        for k in 0..i {
            t -= l[i0 + k] * l[i0 + k];
        }
        if t <= 0.0 {
            l[i0 + i] = t;
            return Err(NotPositiveDefinite {
                index: i,
                partial: PackedLower { n, data: l },
            });
        }
        l[i0 + i] = t.sqrt();
    }
    Ok(PackedLower { n, data: l })
}

impl PackedLower {
    pub fn identity(n: usize) -> Self {
        let mut data = vec![0.0; packed_len(n)];
        for i in 0..n {
            data[packed_index(i, i)] = 1.0;
        }
        Self { n, data }
    }

    pub fn from_packed(n: usize, data: Vec<f64>) -> Result<Self, LinalgError> {
        check_len(packed_len(n), data.len())?;
        Ok(Self { n, data })
    }

    /// Takes the lower triangle of a square matrix.
    pub fn from_dense(a: &DMatrix<f64>) -> Self {
        let sym = PackedSymmetric::from_dense(a);
        Self {
            n: sym.n,
            data: sym.data,
        }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.n, self.n, |i, j| self.get(i, j))
    }

    pub fn order(&self) -> usize {
        self.n
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        if j > i {
            0.0
        } else {
            self.data[packed_index(i, j)]
        }
    }

    /// Solves `L·x = y` by forward substitution.
    pub fn solve_lower(&self, y: &DVector<f64>) -> Result<DVector<f64>, LinalgError> {
        check_len(self.n, y.len())?;
        let mut x = y.clone();
        for i in 0..self.n {
            let i0 = packed_index(i, 0);
            let mut s = x[i];
            for j in 0..i {
                s -= self.data[i0 + j] * x[j];
            }
            let lii = self.data[i0 + i];
            if lii == 0.0 {
                return Err(LinalgError::ZeroDiagonal(i));
            }
            x[i] = s / lii;
        }
        Ok(x)
    }

    /// Solves `Lᵀ·x = y` by back substitution.
    pub fn solve_lower_transpose(&self, y: &DVector<f64>) -> Result<DVector<f64>, LinalgError> {
        check_len(self.n, y.len())?;
        let mut x = y.clone();
        for i in (0..self.n).rev() {
            let lii = self.data[packed_index(i, i)];
            if lii == 0.0 {
                return Err(LinalgError::ZeroDiagonal(i));
            }
            x[i] /= lii;
            let xi = x[i];
            let i0 = packed_index(i, 0);
            for j in 0..i {
                x[j] -= xi * self.data[i0 + j];
            }
        }
        Ok(x)
    }

    /// Explicit inverse, also lower triangular.
    pub fn invert(&self) -> Result<PackedLower, LinalgError> {
        let n = self.n;
        let mut inv = vec![0.0; packed_len(n)];
        for i in 0..n {
            let i0 = packed_index(i, 0);
            let lii = self.data[i0 + i];
            if lii == 0.0 {
                return Err(LinalgError::ZeroDiagonal(i));
            }
            inv[i0 + i] = 1.0 / lii;
            for j in 0..i {
                let mut s = 0.0;
                for k in j..i {
                    s += self.data[i0 + k] * inv[packed_index(k, j)];
                }
                inv[i0 + j] = -s / lii;
            }
        }
        Ok(PackedLower { n, data: inv })
    }

    /// `Lᵀ·L`
    pub fn transpose_times_self(&self) -> PackedSymmetric {
        let n = self.n;
        let mut out = PackedSymmetric::zeros(n);
        for i in 0..n {
            for j in 0..=i {
                let mut s = 0.0;
                for k in i..n {
                    s += self.get(k, i) * self.get(k, j);
                }
                out.data[packed_index(i, j)] = s;
            }
        }
        out
    }

    /// `L·Lᵀ`
    pub fn times_transpose(&self) -> PackedSymmetric {
        let n = self.n;
        let mut out = PackedSymmetric::zeros(n);
        for i in 0..n {
            for j in 0..=i {
                let i0 = packed_index(i, 0);
                let j0 = packed_index(j, 0);
                let mut s = 0.0;
                for k in 0..=j {
                    s += self.data[i0 + k] * self.data[j0 + k];
                }
                out.data[packed_index(i, j)] = s;
            }
        }
        out
    }

    pub fn mul_vec(&self, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(self.n, |i, _| {
            let i0 = packed_index(i, 0);
            (0..=i).map(|j| self.data[i0 + j] * x[j]).sum()
        })
    }

    pub fn transpose_mul_vec(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut y = DVector::zeros(self.n);
        for i in 0..self.n {
            let i0 = packed_index(i, 0);
            for j in 0..=i {
                y[j] += self.data[i0 + j] * x[i];
            }
        }
        y
    }

    /// Estimate of the smallest singular value (Cline, Moler, Stewart, Wilkinson).
    ///
    /// Solves `Lᵀx = b` with the signs of `b` chosen to make `x` large and the
    /// magnitudes of `b` drawn from a fixed congruential sequence in `(0.5, 1)`,
    /// normalizes `x`, solves `Ly = x` and returns `1/‖y‖`. Any exact zero on the
    /// diagonal gives zero.
    pub fn smallest_singular_value(&self) -> SingularEstimate {
        const MODULUS: u32 = 9973;
        const MULTIPLIER: u32 = 3432;
        let p = self.n;
        let mut x = DVector::zeros(p);
        let mut y = DVector::zeros(p);
        if p == 0 || (0..p).any(|i| self.data[packed_index(i, i)] == 0.0) {
            return SingularEstimate {
                sigma: 0.0,
                left: x,
                right: y,
            };
        }
        let mut ix: u32 = 2;
        let mut next_weight = || {
            ix = (MULTIPLIER * ix) % MODULUS;
            0.5 * (1.0 + ix as f64 / MODULUS as f64)
        };

        // x(i) holds the running partial sum of row i until x(i) itself is fixed
        let last = p - 1;
        let l0 = packed_index(last, 0);
        let xplus = next_weight() / self.data[l0 + last];
        x[last] = xplus;
        for i in 0..last {
            x[i] = xplus * self.data[l0 + i];
        }
        for j in (0..last).rev() {
            let b = next_weight();
            let j0 = packed_index(j, 0);
            let ljj = self.data[j0 + j];
            let mut xplus = b - x[j];
            let mut xminus = -b - x[j];
            let mut splus = xplus.abs();
            let mut sminus = xminus.abs();
            xplus /= ljj;
            xminus /= ljj;
            for i in 0..j {
                splus += (x[i] + self.data[j0 + i] * xplus).abs();
                sminus += (x[i] + self.data[j0 + i] * xminus).abs();
            }
            if sminus > splus {
                xplus = xminus;
            }
            x[j] = xplus;
            for i in 0..j {
                x[i] += self.data[j0 + i] * xplus;
            }
        }

        let t = 1.0 / euclidean_norm(x.as_slice());
        x *= t;

        for j in 0..p {
            let j0 = packed_index(j, 0);
            let mut psj = 0.0;
            for i in 0..j {
                psj += self.data[j0 + i] * y[i];
            }
            y[j] = (x[j] - psj) / self.data[j0 + j];
        }
        let sigma = 1.0 / euclidean_norm(y.as_slice());
        SingularEstimate {
            sigma,
            left: x,
            right: y,
        }
    }
}
