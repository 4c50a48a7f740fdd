//! Tolerances, tuning constants and switches of the solver.
//!
//! The defaults are the NL2SOL tolerance table; the `with_*` setters follow the
//! builder style used by the Levenberg-Marquardt solver of this crate.
use crate::numerical::nl2sol::report::Nl2solError;
use nalgebra::DVector;

/// Which covariance matrix to assemble after convergence. `scale = 2f/max(1, n-p)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovarianceKind {
    /// `scale·H⁻¹·(JᵀJ)·H⁻¹`
    Sandwich,
    /// `scale·H⁻¹`
    InverseHessian,
    /// `scale·(JᵀJ)⁻¹`
    InverseNormal,
}

/// How the finite-difference Hessian `H` is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HessianSource {
    /// differences of analytic gradients `Jᵀr`
    GradientDifferences,
    /// second differences of `f`
    FunctionDifferences,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CovarianceRequest {
    pub kind: CovarianceKind,
    pub source: HessianSource,
}

impl CovarianceRequest {
    /// Signed request code: `|code|` in 1..=3 picks the kind, the sign picks
    /// gradient (`+`) or function-value (`-`) differences. 0 means no covariance.
    pub fn from_code(code: i32) -> Option<Self> {
        let kind = match code.abs() {
            1 => CovarianceKind::Sandwich,
            2 => CovarianceKind::InverseHessian,
            3 => CovarianceKind::InverseNormal,
            _ => return None,
        };
        let source = if code > 0 {
            HessianSource::GradientDifferences
        } else {
            HessianSource::FunctionDifferences
        };
        Some(Self { kind, source })
    }

    pub fn code(&self) -> i32 {
        let k = match self.kind {
            CovarianceKind::Sandwich => 1,
            CovarianceKind::InverseHessian => 2,
            CovarianceKind::InverseNormal => 3,
        };
        match self.source {
            HessianSource::GradientDifferences => k,
            HessianSource::FunctionDifferences => -k,
        }
    }
}

/// How the scale vector `D` evolves.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleMode {
    /// recomputed from the Jacobian column norms every iteration
    Adaptive,
    /// fixed at the given values (ones when `None`)
    Fixed(Option<DVector<f64>>),
}

/// Solver configuration.
///
/// Every field has the documented NL2SOL default, see [`Nl2solConfig::default`].
#[derive(Debug, Clone, PartialEq)]
pub struct Nl2solConfig {
    /// absolute function convergence: stop when `f < abs_func_tol`
    pub abs_func_tol: f64,
    /// relative function convergence: stop when the Newton step predicts a
    /// reduction of at most `rel_func_tol·|f|`
    pub rel_func_tol: f64,
    /// x-convergence tolerance on the relative step after a Newton step
    pub x_converge_tol: f64,
    /// false convergence tolerance
    pub false_converge_tol: f64,
    /// singular convergence tolerance
    pub singular_tol: f64,
    pub max_function_evals: usize,
    pub max_iterations: usize,
    /// first trust radius, also the radius used by the singular convergence test
    pub initial_trust_radius: f64,
    /// accepted band `[phi_min·Δ, phi_max·Δ]` around the radius for the step length
    pub phi_min: f64,
    pub phi_max: f64,
    /// relative accuracy asked from the special-case boundary step
    pub epsilon_step: f64,
    /// step quality thresholds, NL2SOL tuner1..tuner5
    pub tuner1: f64,
    pub tuner2: f64,
    pub tuner3: f64,
    pub tuner4: f64,
    pub tuner5: f64,
    pub decrease_factor: f64,
    pub increase_factor: f64,
    pub radfac_min: f64,
    pub radfac_max: f64,
    /// decay of the previous scale in the adaptive update
    pub scale_decay: f64,
    /// scale entries below this floor are reset
    pub scale_floor: f64,
    /// value a scale entry is reset to
    pub scale_reset: f64,
    /// secant update is skipped when `|sᵀy| <= cosine_min·‖s‖·‖y‖`
    pub cosine_min: f64,
    /// relative step of gradient differences in the covariance Hessian
    pub fd_gradient_step: f64,
    /// relative step of function differences in the covariance Hessian
    pub fd_function_step: f64,
    /// relative step of the forward-difference Jacobian
    pub fd_jacobian_step: f64,
    /// Hebden iterations allowed per step computation
    pub hebden_iteration_limit: usize,
    pub scale_mode: ScaleMode,
    pub covariance: Option<CovarianceRequest>,
    /// "debug", "info", "warn", "error", "off"/"none"; `None` leaves logging alone
    pub loglevel: Option<String>,
    /// also write the log to a timestamped file
    pub log_to_file: bool,
}

impl Default for Nl2solConfig {
    fn default() -> Self {
        let eps = f64::EPSILON;
        let rel_func_tol = 1e-10_f64.max(eps.powf(2.0 / 3.0));
        Self {
            abs_func_tol: eps * eps,
            rel_func_tol,
            x_converge_tol: eps.sqrt(),
            false_converge_tol: 100.0 * eps,
            singular_tol: rel_func_tol,
            max_function_evals: 200,
            max_iterations: 150,
            initial_trust_radius: 100.0,
            phi_min: -0.1,
            phi_max: 0.1,
            epsilon_step: 0.1,
            tuner1: 0.1,
            tuner2: 1e-4,
            tuner3: 0.75,
            tuner4: 0.5,
            tuner5: 0.75,
            decrease_factor: 0.5,
            increase_factor: 2.0,
            radfac_min: 0.1,
            radfac_max: 4.0,
            scale_decay: 0.6,
            scale_floor: 1e-6,
            scale_reset: 1.0,
            cosine_min: 1e-6_f64.max(100.0 * eps),
            fd_gradient_step: eps.sqrt(),
            fd_function_step: eps.powf(1.0 / 3.0),
            fd_jacobian_step: eps.sqrt(),
            hebden_iteration_limit: 50,
            scale_mode: ScaleMode::Adaptive,
            covariance: CovarianceRequest::from_code(1),
            loglevel: None,
            log_to_file: false,
        }
    }
}

impl Nl2solConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the absolute function tolerance.
    ///
    /// # Panics
    ///
    /// Panics if `tol < 0`.
    #[must_use]
    pub fn with_abs_func_tol(self, tol: f64) -> Self {
        assert!(!tol.is_sign_negative(), "abs_func_tol must be >= 0");
        Self {
            abs_func_tol: tol,
            ..self
        }
    }

    /// Set the relative function tolerance. The singular convergence tolerance
    /// follows it unless set afterwards.
    ///
    /// # Panics
    ///
    /// Panics if `tol < 0`.
    #[must_use]
    pub fn with_rel_func_tol(self, tol: f64) -> Self {
        assert!(!tol.is_sign_negative(), "rel_func_tol must be >= 0");
        Self {
            rel_func_tol: tol,
            singular_tol: tol,
            ..self
        }
    }

    #[must_use]
    pub fn with_x_converge_tol(self, tol: f64) -> Self {
        assert!(!tol.is_sign_negative(), "x_converge_tol must be >= 0");
        Self {
            x_converge_tol: tol,
            ..self
        }
    }

    #[must_use]
    pub fn with_false_converge_tol(self, tol: f64) -> Self {
        assert!(!tol.is_sign_negative(), "false_converge_tol must be >= 0");
        Self {
            false_converge_tol: tol,
            ..self
        }
    }

    #[must_use]
    pub fn with_singular_tol(self, tol: f64) -> Self {
        assert!(!tol.is_sign_negative(), "singular_tol must be >= 0");
        Self {
            singular_tol: tol,
            ..self
        }
    }

    /// # Panics
    ///
    /// Panics if `limit == 0`.
    #[must_use]
    pub fn with_max_function_evals(self, limit: usize) -> Self {
        assert!(limit > 0, "max_function_evals must be > 0");
        Self {
            max_function_evals: limit,
            ..self
        }
    }

    /// # Panics
    ///
    /// Panics if `limit == 0`.
    #[must_use]
    pub fn with_max_iterations(self, limit: usize) -> Self {
        assert!(limit > 0, "max_iterations must be > 0");
        Self {
            max_iterations: limit,
            ..self
        }
    }

    /// # Panics
    ///
    /// Panics if `radius <= 0`.
    #[must_use]
    pub fn with_initial_trust_radius(self, radius: f64) -> Self {
        assert!(radius > 0.0, "initial_trust_radius must be > 0");
        Self {
            initial_trust_radius: radius,
            ..self
        }
    }

    /// # Panics
    ///
    /// Panics unless `-1 < phi_min <= 0 <= phi_max`.
    #[must_use]
    pub fn with_phi_band(self, phi_min: f64, phi_max: f64) -> Self {
        assert!(
            phi_min > -1.0 && phi_min <= 0.0 && phi_max >= 0.0,
            "need -1 < phi_min <= 0 <= phi_max"
        );
        Self {
            phi_min,
            phi_max,
            ..self
        }
    }

    #[must_use]
    pub fn with_scale_mode(self, scale_mode: ScaleMode) -> Self {
        Self { scale_mode, ..self }
    }

    #[must_use]
    pub fn with_covariance(self, covariance: Option<CovarianceRequest>) -> Self {
        Self { covariance, ..self }
    }

    #[must_use]
    pub fn with_loglevel(self, loglevel: Option<&str>) -> Self {
        Self {
            loglevel: loglevel.map(str::to_string),
            ..self
        }
    }

    #[must_use]
    pub fn with_log_to_file(self, log_to_file: bool) -> Self {
        Self {
            log_to_file,
            ..self
        }
    }

    /// Checks a configuration that may have been assembled field by field.
    pub fn validate(&self, p: usize) -> Result<(), Nl2solError> {
        let nonnegative = [
            ("abs_func_tol", self.abs_func_tol),
            ("rel_func_tol", self.rel_func_tol),
            ("x_converge_tol", self.x_converge_tol),
            ("false_converge_tol", self.false_converge_tol),
            ("singular_tol", self.singular_tol),
            ("tuner1", self.tuner1),
            ("tuner2", self.tuner2),
            ("tuner3", self.tuner3),
            ("tuner4", self.tuner4),
            ("tuner5", self.tuner5),
            ("scale_decay", self.scale_decay),
            ("scale_floor", self.scale_floor),
            ("cosine_min", self.cosine_min),
        ];
        for (name, value) in nonnegative {
            if !(value >= 0.0) || !value.is_finite() {
                return Err(Nl2solError::InvalidConfig(format!(
                    "{} must be a finite non-negative number, got {}",
                    name, value
                )));
            }
        }
        let positive = [
            ("initial_trust_radius", self.initial_trust_radius),
            ("epsilon_step", self.epsilon_step),
            ("decrease_factor", self.decrease_factor),
            ("increase_factor", self.increase_factor),
            ("radfac_min", self.radfac_min),
            ("radfac_max", self.radfac_max),
            ("scale_reset", self.scale_reset),
            ("fd_gradient_step", self.fd_gradient_step),
            ("fd_function_step", self.fd_function_step),
            ("fd_jacobian_step", self.fd_jacobian_step),
        ];
        for (name, value) in positive {
            if !(value > 0.0) || !value.is_finite() {
                return Err(Nl2solError::InvalidConfig(format!(
                    "{} must be a finite positive number, got {}",
                    name, value
                )));
            }
        }
        if self.decrease_factor >= 1.0 {
            return Err(Nl2solError::InvalidConfig(
                "decrease_factor must be < 1".to_string(),
            ));
        }
        if !(self.phi_min > -1.0 && self.phi_min <= 0.0 && self.phi_max >= 0.0) {
            return Err(Nl2solError::InvalidConfig(format!(
                "phi band [{}, {}] is not valid",
                self.phi_min, self.phi_max
            )));
        }
        if self.max_function_evals == 0 || self.max_iterations == 0 {
            return Err(Nl2solError::InvalidConfig(
                "evaluation and iteration limits must be positive".to_string(),
            ));
        }
        if self.hebden_iteration_limit == 0 {
            return Err(Nl2solError::InvalidConfig(
                "hebden_iteration_limit must be positive".to_string(),
            ));
        }
        if let ScaleMode::Fixed(Some(d)) = &self.scale_mode {
            if d.len() != p {
                return Err(Nl2solError::DimensionMismatch {
                    what: "fixed scale vector",
                    expected: p,
                    found: d.len(),
                });
            }
            if let Some(i) = d.iter().position(|v| !(*v > 0.0) || !v.is_finite()) {
                return Err(Nl2solError::InvalidConfig(format!(
                    "scale entry {} must be positive",
                    i
                )));
            }
        }
        if let Some(level) = &self.loglevel {
            crate::Utils::logger::parse_level(level)?;
        }
        Ok(())
    }
}

///////////////////////////////////////TESTS/////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    #[test]
    fn defaults_follow_the_tolerance_table() {
        let c = Nl2solConfig::default();
        let eps = f64::EPSILON;
        assert_relative_eq!(c.abs_func_tol, eps * eps);
        assert_relative_eq!(c.rel_func_tol, 1e-10_f64.max(eps.powf(2.0 / 3.0)));
        assert_relative_eq!(c.singular_tol, c.rel_func_tol);
        assert_relative_eq!(c.x_converge_tol, eps.sqrt());
        assert_relative_eq!(c.false_converge_tol, 100.0 * eps);
        assert_eq!(c.max_function_evals, 200);
        assert_eq!(c.max_iterations, 150);
        assert_eq!(c.initial_trust_radius, 100.0);
        assert_eq!((c.phi_min, c.phi_max), (-0.1, 0.1));
        assert_eq!(c.covariance.map(|r| r.code()), Some(1));
        assert!(c.validate(3).is_ok());
    }

    #[test]
    fn covariance_codes_round_trip() {
        for code in [-3, -2, -1, 1, 2, 3] {
            assert_eq!(CovarianceRequest::from_code(code).map(|r| r.code()), Some(code));
        }
        assert!(CovarianceRequest::from_code(0).is_none());
        assert!(CovarianceRequest::from_code(4).is_none());
    }

    #[test]
    fn validate_rejects_nonsense() {
        let mut c = Nl2solConfig::default();
        c.rel_func_tol = -1.0;
        assert!(matches!(c.validate(2), Err(Nl2solError::InvalidConfig(_))));
        let c = Nl2solConfig::default().with_scale_mode(ScaleMode::Fixed(Some(dvector![1.0])));
        assert!(matches!(c.validate(2), Err(Nl2solError::DimensionMismatch { .. })));
        let c = Nl2solConfig::default().with_loglevel(Some("verbose"));
        assert!(c.validate(2).is_err());
    }

    #[test]
    #[should_panic(expected = "initial_trust_radius must be > 0")]
    fn builder_panics_on_zero_radius() {
        let _ = Nl2solConfig::default().with_initial_trust_radius(0.0);
    }
}
