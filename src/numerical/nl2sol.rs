//! NL2SOL: adaptive nonlinear least squares.
//!
//! Minimizes `f(x) = ½‖r(x)‖²` for `n >= p` residuals of `p` parameters with a
//! trust-region method that switches between the Gauss-Newton model `JᵀJ` and
//! the augmented model `JᵀJ + S`, where `S` is a secant approximation of the
//! second-order part of the Hessian.
//!
//! Example
//! ```
//! use nalgebra::{DMatrix, DVector, dvector};
//! use rusted_nl2sol::numerical::nl2sol::{ClosureProblem, Nl2solConfig, fit};
//!
//! // y = a·exp(b·t) through three points
//! let t = dvector![0.0, 1.0, 2.0];
//! let y = t.map(|ti: f64| 2.0 * (-0.5 * ti).exp());
//! let (tr, yr) = (t.clone(), y.clone());
//! let mut problem = ClosureProblem::new(
//!     move |x: &DVector<f64>| {
//!         Ok(DVector::from_fn(3, |i, _| x[0] * (x[1] * tr[i]).exp() - yr[i]))
//!     },
//!     move |x: &DVector<f64>| {
//!         Ok(DMatrix::from_fn(3, 2, |i, k| {
//!             let e = (x[1] * t[i]).exp();
//!             if k == 0 { e } else { x[0] * t[i] * e }
//!         }))
//!     },
//! );
//! let report = fit(&mut problem, &dvector![1.0, -1.0], None, None, &Nl2solConfig::default())
//!     .unwrap();
//! assert!(report.code.was_successful());
//! assert!((report.params[0] - 2.0).abs() < 1e-6);
//! ```
pub mod assess;
pub mod batch;
pub mod bounds;
pub mod config;
pub mod covariance;
pub mod driver;
pub mod gqtstp;
pub mod problem;
pub mod report;
pub mod scaling;
pub mod secant_update;
pub mod state;

pub use batch::{FitJob, fit_batch};
pub use config::{CovarianceKind, CovarianceRequest, HessianSource, Nl2solConfig, ScaleMode};
pub use driver::fit;
pub use problem::{
    ClosureProblem, EvalMode, Evaluation, EvaluationFailure, FiniteDifferenceJacobian,
    ResidualProblem,
};
pub use report::{ConvergenceCode, CovarianceFailure, CovarianceStatus, FitReport, Nl2solError};
pub use state::Model;
