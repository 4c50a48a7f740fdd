//! Outcome of a fit: convergence codes, the report handed back to the caller and
//! the errors returned for unusable input.
use nalgebra::{DMatrix, DVector};
use std::fmt;
use strum_macros::{Display, EnumIter};

use crate::numerical::nl2sol::state::Model;

/// How a fit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum ConvergenceCode {
    /// relative change of x below `x_converge_tol` after a Newton step
    XConverged,
    /// predicted relative reduction of f below `rel_func_tol`
    RelFuncConverged,
    /// both x- and relative function convergence
    BothConverged,
    /// f below `abs_func_tol`
    AbsFuncConverged,
    /// no step of length up to the initial radius predicts a relative reduction
    /// above `singular_tol`: the Hessian is singular at the solution
    SingularConverged,
    /// x moved by less than `false_converge_tol` without decreasing f
    FalseConverged,
    FunctionEvalLimit,
    IterationLimit,
    UserStop,
    BadInput,
}

impl ConvergenceCode {
    /// Numeric code, 7-13 as returned by the step assessment, then the
    /// driver-level outcomes.
    pub fn code(&self) -> i32 {
        match self {
            ConvergenceCode::XConverged => 7,
            ConvergenceCode::RelFuncConverged => 8,
            ConvergenceCode::BothConverged => 9,
            ConvergenceCode::AbsFuncConverged => 10,
            ConvergenceCode::SingularConverged => 11,
            ConvergenceCode::FalseConverged => 12,
            ConvergenceCode::BadInput => 13,
            ConvergenceCode::FunctionEvalLimit => 14,
            ConvergenceCode::IterationLimit => 15,
            ConvergenceCode::UserStop => 16,
        }
    }

    /// Whether the parameters can be trusted as a (possibly singular) minimizer.
    pub fn was_successful(&self) -> bool {
        matches!(
            self,
            ConvergenceCode::XConverged
                | ConvergenceCode::RelFuncConverged
                | ConvergenceCode::BothConverged
                | ConvergenceCode::AbsFuncConverged
                | ConvergenceCode::SingularConverged
        )
    }

    /// Convergence codes after which a covariance matrix is meaningful.
    pub fn allows_covariance(&self) -> bool {
        self.was_successful() && *self != ConvergenceCode::SingularConverged
    }
}

/// Why the covariance matrix is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CovarianceFailure {
    /// the fit did not end with x, relative, both or absolute convergence
    NotConverged,
    /// a finite-difference evaluation failed or overflowed
    CallbackFailed,
    /// the finite-difference Hessian is not positive definite
    HessianIndefinite,
    /// the Jacobian is rank deficient
    RankDeficientJacobian,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CovarianceStatus {
    NotRequested,
    Computed(DMatrix<f64>),
    NotComputed(CovarianceFailure),
}

impl CovarianceStatus {
    pub fn matrix(&self) -> Option<&DMatrix<f64>> {
        match self {
            CovarianceStatus::Computed(m) => Some(m),
            _ => None,
        }
    }
}

/// Result of [`fit`](crate::numerical::nl2sol::driver::fit).
#[derive(Debug, Clone)]
pub struct FitReport {
    pub params: DVector<f64>,
    pub code: ConvergenceCode,
    pub iterations: usize,
    /// residual evaluations, the initial one included
    pub function_evals: usize,
    /// Jacobian evaluations
    pub gradient_evals: usize,
    /// `f = ½‖r‖²`
    pub objective: f64,
    /// `‖r‖²`
    pub chi_squared: f64,
    pub residuals: DVector<f64>,
    /// final scale vector
    pub scale: DVector<f64>,
    /// model in use when the fit ended
    pub model: Model,
    pub covariance: CovarianceStatus,
}

/// Input that makes a fit impossible; reported before any iteration runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Nl2solError {
    NoParameters,
    TooFewResiduals { n: usize, p: usize },
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    InvalidBounds { index: usize },
    NonFiniteStart { index: usize },
    InvalidConfig(String),
    InitialEvaluation(String),
}

impl fmt::Display for Nl2solError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Nl2solError::NoParameters => write!(f, "the parameter vector is empty"),
            Nl2solError::TooFewResiduals { n, p } => {
                write!(f, "{} residuals cannot determine {} parameters", n, p)
            }
            Nl2solError::DimensionMismatch {
                what,
                expected,
                found,
            } => write!(f, "{}: expected length {}, found {}", what, expected, found),
            Nl2solError::InvalidBounds { index } => {
                write!(f, "bounds of parameter {} are empty or not numbers", index)
            }
            Nl2solError::NonFiniteStart { index } => {
                write!(f, "initial value of parameter {} is not finite", index)
            }
            Nl2solError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Nl2solError::InitialEvaluation(msg) => {
                write!(f, "residuals cannot be evaluated at the initial point: {}", msg)
            }
        }
    }
}

impl std::error::Error for Nl2solError {}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn codes_are_distinct_and_ordered() {
        let codes: Vec<i32> = ConvergenceCode::iter().map(|c| c.code()).collect();
        let mut sorted = codes.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
        assert_eq!(ConvergenceCode::XConverged.code(), 7);
        assert_eq!(ConvergenceCode::FalseConverged.code(), 12);
        let successful = ConvergenceCode::iter().filter(|c| c.was_successful()).count();
        assert_eq!(successful, 5);
        assert!(!ConvergenceCode::SingularConverged.allows_covariance());
        assert_eq!(ConvergenceCode::BothConverged.to_string(), "BothConverged");
    }

    #[test]
    fn errors_display() {
        let e = Nl2solError::TooFewResiduals { n: 2, p: 3 };
        assert_eq!(e.to_string(), "2 residuals cannot determine 3 parameters");
    }
}
