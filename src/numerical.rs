/// adaptive nonlinear least squares: trust-region steps on a Gauss-Newton or
/// secant-augmented model, step assessment, covariance of the fit
pub mod nl2sol;
