//! Covariance matrix of the fitted parameters.
//!
//! With `scale = 2f/max(1, n−p)` the three request kinds give
//! `scale·H⁻¹(JᵀJ)H⁻¹`, `scale·H⁻¹` and `scale·(JᵀJ)⁻¹`, where `H` is a
//! finite-difference Hessian of `f = ½‖r‖²` at the solution.
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::numerical::nl2sol::config::{CovarianceKind, CovarianceRequest, HessianSource, Nl2solConfig};
use crate::numerical::nl2sol::problem::{EvalMode, ResidualProblem, evaluate_checked};
use crate::numerical::nl2sol::report::{CovarianceFailure, CovarianceStatus};
use crate::numerical::nl2sol::state::Counters;
use crate::somelinalg::packed_cholesky::{PackedSymmetric, cholesky_factor_packed};
use crate::somelinalg::pivoted_qr::PivotedQr;
use crate::somelinalg::vector_kernels::MachineConstants;

/// Solution data the covariance is built from.
pub struct SolutionPoint<'a> {
    pub x: &'a DVector<f64>,
    pub residuals: &'a DVector<f64>,
    pub jacobian: &'a DMatrix<f64>,
    pub scale: &'a DVector<f64>,
}

pub fn covariance<P: ResidualProblem + ?Sized>(
    problem: &mut P,
    at: &SolutionPoint,
    request: CovarianceRequest,
    config: &Nl2solConfig,
    mc: &MachineConstants,
    counters: &mut Counters,
) -> CovarianceStatus {
    let (n, p) = at.jacobian.shape();
    let f = 0.5 * at.residuals.norm_squared();
    let scale = 2.0 * f / (n.saturating_sub(p).max(1) as f64);
    let outcome = match request.kind {
        CovarianceKind::InverseNormal => {
            let qr = PivotedQr::new(at.jacobian.clone(), 0, mc);
            qr.normal_inverse()
                .map(|inv| inv.to_dense())
                .map_err(|_| CovarianceFailure::RankDeficientJacobian)
        }
        CovarianceKind::Sandwich | CovarianceKind::InverseHessian => {
            fd_hessian(problem, at, request.source, config, counters)
                .and_then(|h| inverse_spd(&h))
                .map(|hinv| match request.kind {
                    CovarianceKind::Sandwich => {
                        let jtj = at.jacobian.transpose() * at.jacobian;
                        &hinv * jtj * &hinv
                    }
                    _ => hinv,
                })
        }
    };
    match outcome {
        Ok(m) => {
            debug!("covariance {:?} computed, scale = {:e}", request.kind, scale);
            CovarianceStatus::Computed(m * scale)
        }
        Err(reason) => {
            warn!("covariance not computed: {}", reason);
            CovarianceStatus::NotComputed(reason)
        }
    }
}

/// Steps `h_i = factor·max(|x_i|, 1/d_i)`, as actually representable.
fn fd_steps(x: &DVector<f64>, d: &DVector<f64>, factor: f64) -> DVector<f64> {
    DVector::from_fn(x.len(), |i, _| {
        let h = factor * x[i].abs().max(1.0 / d[i]);
        (x[i] + h) - x[i]
    })
}

fn fd_hessian<P: ResidualProblem + ?Sized>(
    problem: &mut P,
    at: &SolutionPoint,
    source: HessianSource,
    config: &Nl2solConfig,
    counters: &mut Counters,
) -> Result<PackedSymmetric, CovarianceFailure> {
    match source {
        HessianSource::GradientDifferences => gradient_difference_hessian(problem, at, config, counters),
        HessianSource::FunctionDifferences => function_difference_hessian(problem, at, config, counters),
    }
}

/// Column `i` of `H` is `(g(x + h_i e_i) − g(x))/h_i`, then `H` is symmetrized.
fn gradient_difference_hessian<P: ResidualProblem + ?Sized>(
    problem: &mut P,
    at: &SolutionPoint,
    config: &Nl2solConfig,
    counters: &mut Counters,
) -> Result<PackedSymmetric, CovarianceFailure> {
    let (n, p) = at.jacobian.shape();
    let g = at.jacobian.tr_mul(at.residuals);
    let h = fd_steps(at.x, at.scale, config.fd_gradient_step);
    let mut columns = DMatrix::zeros(p, p);
    let mut xp = at.x.clone();
    for i in 0..p {
        xp[i] = at.x[i] + h[i];
        counters.gradient_evals += 1;
        let eval = evaluate_checked(problem, &xp, EvalMode::ResidualAndJacobian, n)
            .map_err(|_| CovarianceFailure::CallbackFailed)?;
        xp[i] = at.x[i];
        let jp = eval.jacobian.ok_or(CovarianceFailure::CallbackFailed)?;
        let gp = jp.tr_mul(&eval.residuals);
        columns.set_column(i, &((gp - &g) / h[i]));
    }
    let symmetric = (&columns + columns.transpose()) * 0.5;
    Ok(PackedSymmetric::from_dense(&symmetric))
}

/// `H_ij = (f(x + h_i e_i + h_j e_j) − f(x + h_i e_i) − f(x + h_j e_j) + f(x))/(h_i h_j)`,
/// reusing the `p` single-step values.
fn function_difference_hessian<P: ResidualProblem + ?Sized>(
    problem: &mut P,
    at: &SolutionPoint,
    config: &Nl2solConfig,
    counters: &mut Counters,
) -> Result<PackedSymmetric, CovarianceFailure> {
    let (n, p) = at.jacobian.shape();
    let f0 = 0.5 * at.residuals.norm_squared();
    let h = fd_steps(at.x, at.scale, config.fd_function_step);
    let mut objective = |x: &DVector<f64>, counters: &mut Counters| {
        counters.function_evals += 1;
        evaluate_checked(problem, x, EvalMode::ResidualOnly, n)
            .map(|e| 0.5 * e.residuals.norm_squared())
            .map_err(|_| CovarianceFailure::CallbackFailed)
    };
    let mut single = DVector::zeros(p);
    let mut xp = at.x.clone();
    for i in 0..p {
        xp[i] = at.x[i] + h[i];
        single[i] = objective(&xp, counters)?;
        xp[i] = at.x[i];
    }
    let mut hess = PackedSymmetric::zeros(p);
    for i in 0..p {
        for j in 0..=i {
            xp[i] += h[i];
            xp[j] += h[j];
            let fij = objective(&xp, counters)?;
            xp[i] = at.x[i];
            xp[j] = at.x[j];
            hess.set(i, j, (fij - single[i] - single[j] + f0) / (h[i] * h[j]));
        }
    }
    Ok(hess)
}

/// `H⁻¹ = L⁻ᵀL⁻¹` from the Cholesky factor.
fn inverse_spd(h: &PackedSymmetric) -> Result<DMatrix<f64>, CovarianceFailure> {
    let l = cholesky_factor_packed(h).map_err(|_| CovarianceFailure::HessianIndefinite)?;
    let linv = l.invert().map_err(|_| CovarianceFailure::HessianIndefinite)?;
    Ok(linv.transpose_times_self().to_dense())
}

///////////////////////////////////////TESTS/////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::nl2sol::problem::test_problems::Line;
    use crate::numerical::nl2sol::problem::{ClosureProblem, EvaluationFailure};
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    /// least squares line through noisy points, with its solution
    fn line_at_solution() -> (Line, DVector<f64>, DVector<f64>, DMatrix<f64>) {
        let t = dvector![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let y = dvector![1.1, 2.9, 5.2, 6.8, 9.1, 11.0];
        let j = DMatrix::from_fn(6, 2, |i, k| if k == 0 { 1.0 } else { t[i] });
        let x = (j.transpose() * &j)
            .try_inverse()
            .unwrap()
            * j.transpose()
            * &y;
        let r = &j * &x - &y;
        (Line { t, y }, x, r, j)
    }

    #[test]
    fn all_kinds_agree_for_a_linear_model() {
        let (mut line, x, r, j) = line_at_solution();
        let d = dvector![j.column(0).norm(), j.column(1).norm()];
        let at = SolutionPoint {
            x: &x,
            residuals: &r,
            jacobian: &j,
            scale: &d,
        };
        let config = Nl2solConfig::default();
        let mc = MachineConstants::new();
        let scale = r.norm_squared() / 4.0;
        let expected = (j.transpose() * &j).try_inverse().unwrap() * scale;
        for code in [1, 2, 3, -1, -2] {
            let mut counters = Counters::default();
            let request = CovarianceRequest::from_code(code).unwrap();
            let status = covariance(&mut line, &at, request, &config, &mc, &mut counters);
            let m = status.matrix().unwrap();
            // second differences of f lose about half the digits
            let tol = if code < 0 { 1e-2 } else { 1e-6 };
            assert_relative_eq!(m.clone(), expected.clone(), max_relative = tol);
            assert_relative_eq!(m.clone(), m.transpose());
            match code {
                1 | 2 => assert_eq!(counters.gradient_evals, 2),
                -1 | -2 => assert_eq!(counters.function_evals, 2 + 3),
                _ => assert_eq!(counters, Counters::default()),
            }
        }
    }

    #[test]
    fn failing_callback_is_reported() {
        let (_, x, r, j) = line_at_solution();
        let d = dvector![1.0, 1.0];
        let at = SolutionPoint {
            x: &x,
            residuals: &r,
            jacobian: &j,
            scale: &d,
        };
        let mut problem = ClosureProblem::new(
            |_: &DVector<f64>| Err(EvaluationFailure("disk unavailable".to_string())),
            |_: &DVector<f64>| Ok(DMatrix::zeros(6, 2)),
        );
        let status = covariance(
            &mut problem,
            &at,
            CovarianceRequest::from_code(1).unwrap(),
            &Nl2solConfig::default(),
            &MachineConstants::new(),
            &mut Counters::default(),
        );
        assert_eq!(status, CovarianceStatus::NotComputed(CovarianceFailure::CallbackFailed));
    }

    #[test]
    fn indefinite_hessian_is_reported() {
        // r = x² − 1 at x = 0: f'' = −2
        let mut problem = ClosureProblem::new(
            |x: &DVector<f64>| Ok(dvector![x[0] * x[0] - 1.0]),
            |x: &DVector<f64>| Ok(dmatrix![2.0 * x[0]]),
        );
        let x = dvector![0.0];
        let r = dvector![-1.0];
        let j = dmatrix![0.0];
        let d = dvector![1.0];
        let at = SolutionPoint {
            x: &x,
            residuals: &r,
            jacobian: &j,
            scale: &d,
        };
        for code in [2, -2] {
            let status = covariance(
                &mut problem,
                &at,
                CovarianceRequest::from_code(code).unwrap(),
                &Nl2solConfig::default(),
                &MachineConstants::new(),
                &mut Counters::default(),
            );
            assert_eq!(status, CovarianceStatus::NotComputed(CovarianceFailure::HessianIndefinite));
        }
        let status = covariance(
            &mut problem,
            &at,
            CovarianceRequest::from_code(3).unwrap(),
            &Nl2solConfig::default(),
            &MachineConstants::new(),
            &mut Counters::default(),
        );
        assert_eq!(
            status,
            CovarianceStatus::NotComputed(CovarianceFailure::RankDeficientJacobian)
        );
    }
}
