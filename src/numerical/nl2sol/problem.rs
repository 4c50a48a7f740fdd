use nalgebra::{DMatrix, DVector};
use std::fmt;

use crate::numerical::nl2sol::config::Nl2solConfig;

/// What the solver asks a [`ResidualProblem`] to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    ResidualOnly,
    ResidualAndJacobian,
}

/// Residuals `r(x)` (length n) and, when asked for, the `n×p` Jacobian.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub residuals: DVector<f64>,
    pub jacobian: Option<DMatrix<f64>>,
}

impl Evaluation {
    pub fn residuals_only(residuals: DVector<f64>) -> Self {
        Self {
            residuals,
            jacobian: None,
        }
    }

    pub fn with_jacobian(residuals: DVector<f64>, jacobian: DMatrix<f64>) -> Self {
        Self {
            residuals,
            jacobian: Some(jacobian),
        }
    }
}

/// The model cannot be evaluated at the requested parameters.
///
/// Inside an iteration the solver treats this like an oversized step and
/// retries with a smaller trust radius.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationFailure(pub String);

impl fmt::Display for EvaluationFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "evaluation failed: {}", self.0)
    }
}

impl std::error::Error for EvaluationFailure {}

/// A nonlinear least squares problem `min ½‖r(x)‖²`.
///
/// `evaluate` must be deterministic: the same parameters give the same
/// residuals.
pub trait ResidualProblem {
    fn evaluate(
        &mut self,
        params: &DVector<f64>,
        mode: EvalMode,
    ) -> Result<Evaluation, EvaluationFailure>;

    /// Polled after every accepted step; returning `true` ends the fit with
    /// `ConvergenceCode::UserStop`.
    fn stop_requested(&mut self, _iteration: usize, _params: &DVector<f64>) -> bool {
        false
    }
}

impl<T: ResidualProblem + ?Sized> ResidualProblem for &mut T {
    fn evaluate(
        &mut self,
        params: &DVector<f64>,
        mode: EvalMode,
    ) -> Result<Evaluation, EvaluationFailure> {
        (**self).evaluate(params, mode)
    }

    fn stop_requested(&mut self, iteration: usize, params: &DVector<f64>) -> bool {
        (**self).stop_requested(iteration, params)
    }
}

/// Problem given by two closures, one for the residuals and one for the Jacobian.
pub struct ClosureProblem<R, J>
where
    R: FnMut(&DVector<f64>) -> Result<DVector<f64>, EvaluationFailure>,
    J: FnMut(&DVector<f64>) -> Result<DMatrix<f64>, EvaluationFailure>,
{
    residual: R,
    jacobian: J,
}

impl<R, J> ClosureProblem<R, J>
where
    R: FnMut(&DVector<f64>) -> Result<DVector<f64>, EvaluationFailure>,
    J: FnMut(&DVector<f64>) -> Result<DMatrix<f64>, EvaluationFailure>,
{
    pub fn new(residual: R, jacobian: J) -> Self {
        Self { residual, jacobian }
    }
}

impl<R, J> ResidualProblem for ClosureProblem<R, J>
where
    R: FnMut(&DVector<f64>) -> Result<DVector<f64>, EvaluationFailure>,
    J: FnMut(&DVector<f64>) -> Result<DMatrix<f64>, EvaluationFailure>,
{
    fn evaluate(
        &mut self,
        params: &DVector<f64>,
        mode: EvalMode,
    ) -> Result<Evaluation, EvaluationFailure> {
        let residuals = (self.residual)(params)?;
        match mode {
            EvalMode::ResidualOnly => Ok(Evaluation::residuals_only(residuals)),
            EvalMode::ResidualAndJacobian => {
                let jacobian = (self.jacobian)(params)?;
                Ok(Evaluation::with_jacobian(residuals, jacobian))
            }
        }
    }
}

/// Problem with residuals only; the Jacobian comes from forward differences
/// with steps `h_j = step·max(|x_j|, 1)`.
pub struct FiniteDifferenceJacobian<R>
where
    R: FnMut(&DVector<f64>) -> Result<DVector<f64>, EvaluationFailure>,
{
    residual: R,
    step: f64,
}

impl<R> FiniteDifferenceJacobian<R>
where
    R: FnMut(&DVector<f64>) -> Result<DVector<f64>, EvaluationFailure>,
{
    pub fn new(residual: R) -> Self {
        Self {
            residual,
            step: f64::EPSILON.sqrt(),
        }
    }

    /// Relative step taken from `config.fd_jacobian_step`.
    pub fn from_config(residual: R, config: &Nl2solConfig) -> Self {
        Self::new(residual).with_step(config.fd_jacobian_step)
    }

    /// # Panics
    ///
    /// Panics if `step <= 0`.
    #[must_use]
    pub fn with_step(self, step: f64) -> Self {
        assert!(step > 0.0, "finite difference step must be > 0");
        Self { step, ..self }
    }
}

impl<R> ResidualProblem for FiniteDifferenceJacobian<R>
where
    R: FnMut(&DVector<f64>) -> Result<DVector<f64>, EvaluationFailure>,
{
    fn evaluate(
        &mut self,
        params: &DVector<f64>,
        mode: EvalMode,
    ) -> Result<Evaluation, EvaluationFailure> {
        let residuals = (self.residual)(params)?;
        if mode == EvalMode::ResidualOnly {
            return Ok(Evaluation::residuals_only(residuals));
        }
        let n = residuals.len();
        let p = params.len();
        let mut jacobian = DMatrix::zeros(n, p);
        let mut shifted = params.clone();
        for j in 0..p {
            let xj = params[j];
            shifted[j] = xj + self.step * xj.abs().max(1.0);
            // the step actually representable in floating point
            let h = shifted[j] - xj;
            let forward = (self.residual)(&shifted)?;
            shifted[j] = xj;
            if forward.len() != n {
                return Err(EvaluationFailure(format!(
                    "residual length changed from {} to {}",
                    n,
                    forward.len()
                )));
            }
            jacobian.set_column(j, &((forward - &residuals) / h));
        }
        Ok(Evaluation::with_jacobian(residuals, jacobian))
    }
}

/// Evaluate and check the answer: `n` finite residuals and, when asked for, an
/// `n×p` finite Jacobian. Anything else is reported as a failure.
pub(crate) fn evaluate_checked<P: ResidualProblem + ?Sized>(
    problem: &mut P,
    params: &DVector<f64>,
    mode: EvalMode,
    n: usize,
) -> Result<Evaluation, EvaluationFailure> {
    let eval = problem.evaluate(params, mode)?;
    if eval.residuals.len() != n {
        return Err(EvaluationFailure(format!(
            "expected {} residuals, got {}",
            n,
            eval.residuals.len()
        )));
    }
    if eval.residuals.iter().any(|r| !r.is_finite()) {
        return Err(EvaluationFailure("residuals are not finite".to_string()));
    }
    if mode == EvalMode::ResidualAndJacobian {
        let Some(j) = &eval.jacobian else {
            return Err(EvaluationFailure("no Jacobian returned".to_string()));
        };
        if j.shape() != (n, params.len()) {
            return Err(EvaluationFailure(format!(
                "expected a {}x{} Jacobian, got {}x{}",
                n,
                params.len(),
                j.nrows(),
                j.ncols()
            )));
        }
        if j.iter().any(|v| !v.is_finite()) {
            return Err(EvaluationFailure("Jacobian is not finite".to_string()));
        }
    }
    Ok(eval)
}

/// Models shared by the solver tests.
#[cfg(test)]
pub(crate) mod test_problems {
    use super::*;

    /// `y = a·exp(b·t)`
    pub struct ExponentialFit {
        pub t: DVector<f64>,
        pub y: DVector<f64>,
    }

    impl ExponentialFit {
        pub fn noiseless(a: f64, b: f64) -> Self {
            let t = DVector::from_fn(10, |i, _| i as f64 * 0.5);
            let y = t.map(|ti| a * (b * ti).exp());
            Self { t, y }
        }

        /// data with a fixed, sign-alternating perturbation
        pub fn perturbed(a: f64, b: f64) -> Self {
            let mut fit = Self::noiseless(a, b);
            for i in 0..fit.y.len() {
                let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                fit.y[i] += sign * 0.01 * (1.0 + 0.1 * i as f64);
            }
            fit
        }
    }

    impl ResidualProblem for ExponentialFit {
        fn evaluate(
            &mut self,
            params: &DVector<f64>,
            mode: EvalMode,
        ) -> Result<Evaluation, EvaluationFailure> {
            let (a, b) = (params[0], params[1]);
            let model = self.t.map(|ti| a * (b * ti).exp());
            let residuals = &model - &self.y;
            if mode == EvalMode::ResidualOnly {
                return Ok(Evaluation::residuals_only(residuals));
            }
            let mut j = DMatrix::zeros(self.t.len(), 2);
            for i in 0..self.t.len() {
                let e = (b * self.t[i]).exp();
                j[(i, 0)] = e;
                j[(i, 1)] = a * self.t[i] * e;
            }
            Ok(Evaluation::with_jacobian(residuals, j))
        }
    }

    /// `y = (a + b)·exp(c·t)`: columns for `a` and `b` coincide
    pub struct CorrelatedExponential {
        pub t: DVector<f64>,
        pub y: DVector<f64>,
    }

    impl CorrelatedExponential {
        pub fn new() -> Self {
            let t = DVector::from_fn(12, |i, _| i as f64 * 0.4);
            let mut y = t.map(|ti| 30.0 * (-0.7 * ti).exp());
            for i in 0..y.len() {
                y[i] += if i % 3 == 0 { 1.0 } else { -0.5 };
            }
            Self { t, y }
        }
    }

    impl ResidualProblem for CorrelatedExponential {
        fn evaluate(
            &mut self,
            params: &DVector<f64>,
            mode: EvalMode,
        ) -> Result<Evaluation, EvaluationFailure> {
            let (a, b, c) = (params[0], params[1], params[2]);
            let residuals = DVector::from_fn(self.t.len(), |i, _| {
                (a + b) * (c * self.t[i]).exp() - self.y[i]
            });
            if mode == EvalMode::ResidualOnly {
                return Ok(Evaluation::residuals_only(residuals));
            }
            let j = DMatrix::from_fn(self.t.len(), 3, |i, k| {
                let e = (c * self.t[i]).exp();
                match k {
                    0 | 1 => e,
                    _ => (a + b) * self.t[i] * e,
                }
            });
            Ok(Evaluation::with_jacobian(residuals, j))
        }
    }

    /// straight line `y = a + b·t`
    pub struct Line {
        pub t: DVector<f64>,
        pub y: DVector<f64>,
    }

    impl ResidualProblem for Line {
        fn evaluate(
            &mut self,
            params: &DVector<f64>,
            mode: EvalMode,
        ) -> Result<Evaluation, EvaluationFailure> {
            let residuals = DVector::from_fn(self.t.len(), |i, _| {
                params[0] + params[1] * self.t[i] - self.y[i]
            });
            if mode == EvalMode::ResidualOnly {
                return Ok(Evaluation::residuals_only(residuals));
            }
            let j = DMatrix::from_fn(self.t.len(), 2, |i, k| if k == 0 { 1.0 } else { self.t[i] });
            Ok(Evaluation::with_jacobian(residuals, j))
        }
    }

    /// Rosenbrock as residuals `10(x2 - x1²)`, `1 - x1`
    pub struct Rosenbrock;

    impl ResidualProblem for Rosenbrock {
        fn evaluate(
            &mut self,
            x: &DVector<f64>,
            mode: EvalMode,
        ) -> Result<Evaluation, EvaluationFailure> {
            let r = DVector::from_vec(vec![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]]);
            if mode == EvalMode::ResidualOnly {
                return Ok(Evaluation::residuals_only(r));
            }
            let j = DMatrix::from_row_slice(2, 2, &[-20.0 * x[0], 10.0, -1.0, 0.0]);
            Ok(Evaluation::with_jacobian(r, j))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_problems::ExponentialFit;
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    #[test]
    fn finite_difference_jacobian_matches_analytic() {
        let mut analytic = ExponentialFit::noiseless(2.0, -0.5);
        let t = analytic.t.clone();
        let y = analytic.y.clone();
        let mut fd = FiniteDifferenceJacobian::new(move |x: &DVector<f64>| {
            Ok(DVector::from_fn(t.len(), |i, _| x[0] * (x[1] * t[i]).exp() - y[i]))
        });
        let x = dvector![1.5, -0.3];
        let exact = analytic
            .evaluate(&x, EvalMode::ResidualAndJacobian)
            .unwrap()
            .jacobian
            .unwrap();
        let approx_j = fd
            .evaluate(&x, EvalMode::ResidualAndJacobian)
            .unwrap()
            .jacobian
            .unwrap();
        assert_relative_eq!(exact, approx_j, epsilon = 1e-6);
        let only = fd.evaluate(&x, EvalMode::ResidualOnly).unwrap();
        assert!(only.jacobian.is_none());
    }

    #[test]
    fn jacobian_step_follows_the_config() {
        let square =
            |x: &DVector<f64>| -> Result<DVector<f64>, EvaluationFailure> { Ok(dvector![x[0] * x[0]]) };
        let x = dvector![1.0];
        let jacobian_with = |config: &Nl2solConfig| {
            FiniteDifferenceJacobian::from_config(square, config)
                .evaluate(&x, EvalMode::ResidualAndJacobian)
                .unwrap()
                .jacobian
                .unwrap()[(0, 0)]
        };
        let default = Nl2solConfig::default();
        assert_relative_eq!(jacobian_with(&default), 2.0, epsilon = 1e-7);
        // forward difference of x² at 1 is 2 + h
        let mut coarse = Nl2solConfig::default();
        coarse.fd_jacobian_step = 1e-2;
        assert_relative_eq!(jacobian_with(&coarse), 2.01, epsilon = 1e-10);
    }

    #[test]
    fn closure_problem_propagates_failures() {
        let mut problem = ClosureProblem::new(
            |x: &DVector<f64>| {
                if x[0] > 1.0 {
                    Err(EvaluationFailure("overflow".to_string()))
                } else {
                    Ok(x.clone())
                }
            },
            |x: &DVector<f64>| Ok(DMatrix::identity(x.len(), x.len())),
        );
        assert!(problem.evaluate(&dvector![0.5], EvalMode::ResidualAndJacobian).is_ok());
        let err = problem.evaluate(&dvector![2.0], EvalMode::ResidualOnly).unwrap_err();
        assert_eq!(err.to_string(), "evaluation failed: overflow");
        assert!(!problem.stop_requested(1, &dvector![0.5]));
    }

    #[test]
    fn checked_evaluation_rejects_bad_answers() {
        let mut fit = ExponentialFit::noiseless(2.0, -0.5);
        let x = dvector![1.0, -1.0];
        assert!(evaluate_checked(&mut fit, &x, EvalMode::ResidualAndJacobian, 10).is_ok());
        assert!(evaluate_checked(&mut fit, &x, EvalMode::ResidualOnly, 9).is_err());
        let overflow = dvector![1.0, 1000.0];
        let err = evaluate_checked(&mut fit, &overflow, EvalMode::ResidualOnly, 10).unwrap_err();
        assert_eq!(err.0, "residuals are not finite");
        let mut no_jacobian = FiniteDifferenceJacobian::new(|x: &DVector<f64>| Ok(x.clone()));
        let eval = evaluate_checked(&mut no_jacobian, &x, EvalMode::ResidualAndJacobian, 2).unwrap();
        assert_eq!(eval.jacobian.map(|j| j.shape()), Some((2, 2)));
    }
}
