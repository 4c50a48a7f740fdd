//! Scalar helpers shared by the least-squares kernels: machine constants,
//! an underflow-aware dot product and an overflow/underflow safe Euclidean norm.
#![allow(unexpected_cfgs)]

use nalgebra::{Dim, Vector, storage::Storage};

cfg_if::cfg_if! {
    if #[cfg(feature = "RUSTC_IS_NIGHTLY")] {
        pub use core::intrinsics::{likely, unlikely};
    } else {
        #[inline]
        pub fn likely(b: bool) -> bool {
            b
        }

        #[inline]
        pub fn unlikely(b: bool) -> bool {
            b
        }
    }
}

/// Machine dependent constants, computed once when a fit starts and passed by
/// reference to every kernel that needs them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineConstants {
    /// unit roundoff
    pub epsilon: f64,
    /// smallest positive normalized number
    pub tiny: f64,
    /// largest finite number
    pub huge: f64,
    /// products with both factors below this are dropped by `dot_product`
    pub sqrt_tiny: f64,
    /// near-singularity factor of the trust-region step: a Cholesky factor with
    /// `sigma_min^2 <= dgxfac * max|H_ij|` is treated as singular
    pub dgxfac: f64,
    /// relative rank tolerance of the pivoted QR factorization
    pub rktol: f64,
}

impl MachineConstants {
    pub fn new() -> Self {
        let epsilon = f64::EPSILON;
        let tiny = f64::MIN_POSITIVE;
        Self {
            epsilon,
            tiny,
            huge: f64::MAX,
            sqrt_tiny: tiny.sqrt(),
            dgxfac: 50.0 * epsilon,
            rktol: 0.01 * (0.999 * epsilon).sqrt(),
        }
    }
}

impl Default for MachineConstants {
    fn default() -> Self {
        Self::new()
    }
}

/// Dot product that skips the terms which would underflow.
///
/// Terms with both factors below one are examined first: if their product would
/// fall under `sqrt_tiny` it is dropped instead of being flushed to a denormal.
pub fn dot_product(x: &[f64], y: &[f64], mc: &MachineConstants) -> f64 {
    debug_assert_eq!(x.len(), y.len());
    let sqteta = mc.sqrt_tiny;
    let mut sum = 0.0;
    for (xi, yi) in x.iter().zip(y.iter()) {
        let t = xi.abs().max(yi.abs());
        if t > 1.0 {
            sum += xi * yi;
            continue;
        }
        if t < sqteta {
            continue;
        }
        let scaled = (xi / sqteta) * yi;
        if scaled.abs() < sqteta {
            continue;
        }
        sum += xi * yi;
    }
    sum
}

/// Euclidean norm with separate accumulators for large, intermediate and small
/// components, so no square is formed that could overflow or underflow.
pub fn euclidean_norm(v: &[f64]) -> f64 {
    scaled_norm(v.iter(), v.len())
}

/// `euclidean_norm` for any nalgebra vector or vector view.
#[inline]
pub fn enorm<N, S>(v: &Vector<f64, N, S>) -> f64
where
    N: Dim,
    S: Storage<f64, N>,
{
    scaled_norm(v.iter(), v.nrows())
}

fn scaled_norm<'a>(values: impl Iterator<Item = &'a f64>, len: usize) -> f64 {
    if len == 0 {
        return 0.0;
    }
    let mut s1 = 0.0_f64;
    let mut s2 = 0.0_f64;
    let mut s3 = 0.0_f64;
    let mut x1max = 0.0_f64;
    let mut x3max = 0.0_f64;
    let agiant = f64::MAX.sqrt() / len as f64;
    let rdwarf = f64::MIN_POSITIVE.sqrt();
    for xi in values {
        let xabs = xi.abs();
        if unlikely(xabs.is_nan()) {
            return xabs;
        }
        if unlikely(xabs >= agiant || xabs <= rdwarf) {
            if xabs > rdwarf {
                // large components
                if xabs > x1max {
                    s1 = 1.0 + s1 * (x1max / xabs).powi(2);
                    x1max = xabs;
                } else {
                    s1 += (xabs / x1max).powi(2);
                }
            } else if xabs > x3max {
                // small components
                s3 = 1.0 + s3 * (x3max / xabs).powi(2);
                x3max = xabs;
            } else if xabs != 0.0 {
                s3 += (xabs / x3max).powi(2);
            }
        } else {
            s2 += xabs * xabs;
        }
    }

    if unlikely(s1 != 0.0) {
        x1max * (s1 + (s2 / x1max) / x1max).sqrt()
    } else if likely(s2 != 0.0) {
        if likely(s2 >= x3max) {
            (s2 * (1.0 + (x3max / s2) * (x3max * s3))).sqrt()
        } else {
            (x3max * ((s2 / x3max) + (x3max * s3))).sqrt()
        }
    } else {
        x3max * s3.sqrt()
    }
}

/// Relative difference between `x` and `x0` in the scaled max-norm:
/// `max_i |d_i (x_i - x0_i)| / max_i d_i (|x_i| + |x0_i|)`.
/// Returns 0 when both points are zero.
pub fn relative_step(d: &[f64], x: &[f64], x0: &[f64]) -> f64 {
    let mut emax = 0.0_f64;
    let mut xmax = 0.0_f64;
    for ((di, xi), x0i) in d.iter().zip(x.iter()).zip(x0.iter()) {
        emax = emax.max((di * (xi - x0i)).abs());
        xmax = xmax.max(di * (xi.abs() + x0i.abs()));
    }
    if xmax > 0.0 { emax / xmax } else { 0.0 }
}
