//! Householder QR factorization with column pivoting.
//!
//! Used to factor the Jacobian once per iteration (the Gauss-Newton Hessian is
//! assembled from `R`) and to form `(JᵀJ)⁻¹` for the covariance matrix.
use crate::somelinalg::packed_cholesky::{LinalgError, PackedLower, PackedSymmetric};
use crate::somelinalg::vector_kernels::{MachineConstants, enorm};
use nalgebra::{DMatrix, DVector};
use std::fmt::Display;

/// Numerical outcome of the factorization. Columns are 0-based here; `code()`
/// gives the signed 1-based convention `+k` / `-k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrStatus {
    FullRank,
    /// no pivot above `rktol·‖A‖` was left at this column
    RankDeficient { column: usize },
    /// the remaining sub-column norm at this column is below the underflow threshold
    Underflow { column: usize },
}

impl QrStatus {
    pub fn code(&self) -> i32 {
        match self {
            QrStatus::FullRank => 0,
            QrStatus::RankDeficient { column } => *column as i32 + 1,
            QrStatus::Underflow { column } => -(*column as i32 + 1),
        }
    }
}

/// Pivoted QR decomposition.
///
/// For an `n×p` matrix `A` this computes a permutation `Π`, an orthogonal `Q`
/// and an upper triangular `R` with `A·Π = Q·R`. The factorization stops at the
/// first column whose remaining norm is negligible; rows of `R` from there on
/// are zero.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotedQr {
    /// strictly upper part of `R` and the Householder vectors, combined in one matrix
    qr: DMatrix<f64>,
    /// diagonal entries of `R`
    r_diag: DVector<f64>,
    /// column `j` of `A·Π` is column `permutation[j]` of `A`
    permutation: Vec<usize>,
    status: QrStatus,
    rank: usize,
}

impl Display for PivotedQr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "PivotedQr {{ status: {:?}, rank: {}", self.status, self.rank)?;
        writeln!(f, "r_diag: {:?}", self.r_diag.as_slice())?;
        writeln!(f, "permutation: {:?} }}", self.permutation)
    }
}

impl PivotedQr {
    /// Factor `a`. The first `nopivk` columns keep their position; the rest are
    /// pivoted by largest remaining norm.
    pub fn new(mut a: DMatrix<f64>, nopivk: usize, mc: &MachineConstants) -> Self {
        let (m, n) = a.shape();
        let column_norms =
            DVector::from_iterator(n, a.column_iter().map(|c| enorm(&c)));
        let anorm = column_norms.iter().fold(0.0_f64, |acc, v| acc.max(*v));
        // squared remaining norms and the value they were last recomputed from
        let mut remaining: Vec<f64> = column_norms.iter().map(|c| c * c).collect();
        let mut reference = remaining.clone();
        let mut r_diag = DVector::zeros(n);
        let mut permutation: Vec<usize> = (0..n).collect();
        let mut status = QrStatus::FullRank;
        let steps = m.min(n);
        let mut rank = steps;

        for j in 0..steps {
            // pivot
            if j >= nopivk {
                let mut kmax = j;
                for k in (j + 1)..n {
                    if remaining[k] > remaining[kmax] {
                        kmax = k;
                    }
                }
                if kmax != j {
                    a.swap_columns(j, kmax);
                    permutation.swap(j, kmax);
                    remaining.swap(j, kmax);
                    reference.swap(j, kmax);
                }
            }

            // compute Householder reflection vector w_j to
            // reduce the j-th column
            let mut lower = a.rows_range_mut(j..);
            let (left, mut right) = lower.columns_range_pair_mut(j, j + 1..);
            let w_j = {
                let mut axis = left;
                let mut aj_norm = enorm(&axis);
                if aj_norm == 0.0 || aj_norm <= mc.rktol * anorm {
                    status = QrStatus::RankDeficient { column: j };
                    rank = j;
                    break;
                }
                if aj_norm < mc.sqrt_tiny {
                    status = QrStatus::Underflow { column: j };
                    rank = j;
                    break;
                }
                if axis[0] < 0.0 {
                    aj_norm = -aj_norm;
                }
                r_diag[j] = -aj_norm;
                axis /= aj_norm;
                axis[0] += 1.0;
                axis
            };

            // apply reflection to remaining columns
            for (k, mut col) in right.column_iter_mut().enumerate() {
                let k = k + j + 1;
                col.axpy(-(col.dot(&w_j) / w_j[0]), &w_j, 1.0);

                // downdate the remaining norm, recompute once more than
                // 99% of the last recomputed value has been removed
                remaining[k] -= col[0] * col[0];
                if remaining[k] <= 0.01 * reference[k] {
                    let rest = if col.nrows() > 1 {
                        enorm(&col.rows_range(1..))
                    } else {
                        0.0
                    };
                    remaining[k] = rest * rest;
                    reference[k] = remaining[k];
                }
            }
        }

        Self {
            qr: a,
            r_diag,
            permutation,
            status,
            rank,
        }
    }

    pub fn status(&self) -> QrStatus {
        self.status
    }

    /// Number of Householder steps actually taken.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    pub fn r_diag(&self) -> &DVector<f64> {
        &self.r_diag
    }

    /// The `p×p` upper triangular factor.
    pub fn r(&self) -> DMatrix<f64> {
        let n = self.qr.ncols();
        DMatrix::from_fn(n, n, |i, j| {
            if i >= self.rank || j < i {
                0.0
            } else if i == j {
                self.r_diag[i]
            } else {
                self.qr[(i, j)]
            }
        })
    }

    fn reflect(&self, j: usize, mut v: nalgebra::DVectorViewMut<f64>) {
        let w = self.qr.view_range(j.., j);
        let t = -v.dot(&w) / w[0];
        v.axpy(t, &w, 1.0);
    }

    /// `Qᵀ·b`
    pub fn qt_mul(&self, b: &DVector<f64>) -> DVector<f64> {
        let mut out = b.clone();
        for j in 0..self.rank {
            self.reflect(j, out.rows_range_mut(j..));
        }
        out
    }

    /// The full `n×n` orthogonal factor.
    pub fn q(&self) -> DMatrix<f64> {
        let m = self.qr.nrows();
        let mut q = DMatrix::identity(m, m);
        for j in (0..self.rank).rev() {
            for mut col in q.column_iter_mut() {
                self.reflect(j, col.rows_range_mut(j..));
            }
        }
        q
    }

    /// `Rᵀ` in packed storage.
    fn r_transpose_packed(&self) -> PackedLower {
        let r = self.r();
        PackedLower::from_dense(&r.transpose())
    }

    /// `AᵀA = Π·RᵀR·Πᵀ` in packed storage.
    pub fn gauss_newton_hessian(&self) -> PackedSymmetric {
        self.r_transpose_packed()
            .times_transpose()
            .permuted(&self.permutation)
    }

    /// `(AᵀA)⁻¹ = Π·R⁻¹R⁻ᵀ·Πᵀ`; fails when the factorization stopped early.
    pub fn normal_inverse(&self) -> Result<PackedSymmetric, LinalgError> {
        let n = self.qr.ncols();
        if self.rank < n {
            return Err(LinalgError::ZeroDiagonal(self.rank));
        }
        let rinv_t = self.r_transpose_packed().invert()?;
        Ok(rinv_t.transpose_times_self().permuted(&self.permutation))
    }
}

///////////////////////////////////////TESTS/////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dmatrix;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn q_is_orthogonal_and_reproduces_permuted_a() {
        let mc = MachineConstants::new();
        let mut rng = StdRng::seed_from_u64(5);
        let a = DMatrix::from_fn(7, 4, |_, _| rng.random_range(-1.0..1.0));
        let qr = PivotedQr::new(a.clone(), 0, &mc);
        assert_eq!(qr.status(), QrStatus::FullRank);
        let q = qr.q();
        assert_relative_eq!(q.transpose() * &q, DMatrix::identity(7, 7), epsilon = 1e-13);
        let r = qr.r();
        for i in 0..4 {
            for j in 0..i {
                assert_eq!(r[(i, j)], 0.0);
            }
        }
        let mut r_full = DMatrix::zeros(7, 4);
        r_full.view_mut((0, 0), (4, 4)).copy_from(&r);
        let ap = a.select_columns(qr.permutation());
        assert_relative_eq!(&q * r_full, ap, epsilon = 1e-13);
        // pivoting leaves |R_ii| non-increasing
        for i in 1..4 {
            assert!(qr.r_diag()[i].abs() <= qr.r_diag()[i - 1].abs() + 1e-12);
        }
    }

    #[test]
    fn normal_matrix_and_inverse() {
        let mc = MachineConstants::new();
        let a = dmatrix![1.0, 2.0;
                         3.0, 1.0;
                         0.5, -1.0];
        let qr = PivotedQr::new(a.clone(), 0, &mc);
        let ata = a.transpose() * &a;
        assert_relative_eq!(qr.gauss_newton_hessian().to_dense(), ata.clone(), epsilon = 1e-13);
        let inv = qr.normal_inverse().unwrap().to_dense();
        assert_relative_eq!(inv * ata, DMatrix::identity(2, 2), epsilon = 1e-12);
        let b = nalgebra::dvector![1.0, 0.0, 2.0];
        let qtb = qr.qt_mul(&b);
        assert_relative_eq!(qtb.norm(), b.norm(), epsilon = 1e-14);
    }

    #[test]
    fn duplicate_columns_are_rank_deficient() {
        let mc = MachineConstants::new();
        let a = dmatrix![1.0, 1.0, 0.3;
                         2.0, 2.0, -0.1;
                         3.0, 3.0, 0.7;
                         4.0, 4.0, 0.2];
        let qr = PivotedQr::new(a.clone(), 0, &mc);
        assert_eq!(qr.status(), QrStatus::RankDeficient { column: 2 });
        assert_eq!(qr.status().code(), 3);
        assert_eq!(qr.rank(), 2);
        assert!(qr.normal_inverse().is_err());
        // the truncated normal matrix still matches AᵀA to roundoff
        let ata = a.transpose() * &a;
        assert_relative_eq!(qr.gauss_newton_hessian().to_dense(), ata, epsilon = 1e-10);
    }

    #[test]
    fn zero_and_underflowing_columns() {
        let mc = MachineConstants::new();
        let qr = PivotedQr::new(DMatrix::zeros(3, 2), 0, &mc);
        assert_eq!(qr.status().code(), 1);
        let tiny = DMatrix::from_element(3, 2, 1e-170);
        let qr = PivotedQr::new(tiny, 0, &mc);
        assert_eq!(qr.status(), QrStatus::Underflow { column: 0 });
        assert_eq!(qr.status().code(), -1);
    }

    #[test]
    fn leading_columns_are_not_pivoted() {
        let mc = MachineConstants::new();
        let a = dmatrix![0.1, 5.0, 1.0;
                         0.2, 6.0, 0.0;
                         0.1, 7.0, 1.0];
        let qr = PivotedQr::new(a.clone(), 1, &mc);
        assert_eq!(qr.permutation()[0], 0);
        let free = PivotedQr::new(a, 0, &mc);
        assert_eq!(free.permutation()[0], 1);
    }
}
