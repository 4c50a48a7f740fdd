//! The NL2SOL iteration.
//!
//! Every outer iteration factors the Jacobian, builds the model Hessian, and
//! then alternates trust-region steps and their assessment until a step is
//! accepted or the assessment reports convergence:
//!
//! ```text
//! evaluate r, J at x0 -> QR(J), secant update of S, scale D, radius
//!     -> gqtstp -> (clamp to bounds) -> evaluate r at x0 + step -> assess
//!        1, 2: switch model      5: shrink radius      6: probe at max radius
//!        3, 4: accept, evaluate J, next iteration      7..13: stop
//! ```
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

use crate::Utils::logger::{fit_summary, init_logger, parse_level};
use crate::numerical::nl2sol::assess::{AssessCode, assess};
use crate::numerical::nl2sol::bounds::Bounds;
use crate::numerical::nl2sol::config::Nl2solConfig;
use crate::numerical::nl2sol::covariance::{SolutionPoint, covariance};
use crate::numerical::nl2sol::gqtstp::gqtstp;
use crate::numerical::nl2sol::problem::{
    EvalMode, EvaluationFailure, ResidualProblem, evaluate_checked,
};
use crate::numerical::nl2sol::report::{
    ConvergenceCode, CovarianceFailure, CovarianceStatus, FitReport, Nl2solError,
};
use crate::numerical::nl2sol::scaling::{initial_scale, update_scale};
use crate::numerical::nl2sol::secant_update::{dgw_update, gradient_misfit};
use crate::numerical::nl2sol::state::{Model, SolverState};
use crate::somelinalg::packed_cholesky::PackedSymmetric;
use crate::somelinalg::pivoted_qr::{PivotedQr, QrStatus};
use crate::somelinalg::vector_kernels::{MachineConstants, euclidean_norm};

/// Minimize `½‖r(x)‖²` starting from `initial`, optionally inside the box
/// `lower <= x <= upper`.
///
/// Input that makes a fit impossible is an `Err`; every other ending,
/// including the evaluation and iteration limits, is a [`FitReport`] whose
/// `code` says how the fit ended.
pub fn fit<P: ResidualProblem + ?Sized>(
    problem: &mut P,
    initial: &DVector<f64>,
    lower: Option<&DVector<f64>>,
    upper: Option<&DVector<f64>>,
    config: &Nl2solConfig,
) -> Result<FitReport, Nl2solError> {
    let p = initial.len();
    if p == 0 {
        return Err(Nl2solError::NoParameters);
    }
    config.validate(p)?;
    if let Some(index) = initial.iter().position(|v| !v.is_finite()) {
        return Err(Nl2solError::NonFiniteStart { index });
    }
    let bounds = Bounds::new(p, lower, upper)?;
    if let Some(level) = &config.loglevel {
        init_logger(parse_level(level)?, config.log_to_file);
    }
    let mc = MachineConstants::new();
    let mut x = initial.clone();
    if let Some(b) = &bounds {
        b.project(&mut x);
    }

    let first = problem
        .evaluate(&x, EvalMode::ResidualAndJacobian)
        .map_err(|e| Nl2solError::InitialEvaluation(e.0))?;
    let residuals = first.residuals;
    let n = residuals.len();
    if n < p {
        return Err(Nl2solError::TooFewResiduals { n, p });
    }
    let jacobian = first
        .jacobian
        .ok_or_else(|| Nl2solError::InitialEvaluation("no Jacobian returned".to_string()))?;
    if jacobian.nrows() != n {
        return Err(Nl2solError::DimensionMismatch {
            what: "Jacobian rows",
            expected: n,
            found: jacobian.nrows(),
        });
    }
    if jacobian.ncols() != p {
        return Err(Nl2solError::DimensionMismatch {
            what: "Jacobian columns",
            expected: p,
            found: jacobian.ncols(),
        });
    }
    let f = 0.5 * residuals.norm_squared();
    if !f.is_finite() || jacobian.iter().any(|v| !v.is_finite()) {
        return Err(Nl2solError::InitialEvaluation(
            "residuals or Jacobian are not finite".to_string(),
        ));
    }
    info!("nl2sol: {} residuals, {} parameters, f0 = {:e}", n, p, f);

    let d = initial_scale(p, &config.scale_mode);
    let at = x.clone();
    let best = BestPoint {
        x: x.clone(),
        r: residuals.clone(),
        f,
    };
    let mut state = SolverState::new(x, f, d, config.initial_trust_radius);
    state.counters.function_evals = 1;
    state.counters.gradient_evals = 1;
    let mut driver = Driver {
        problem,
        bounds,
        config,
        mc,
        n,
        st: state,
        at,
        r: residuals,
        j: jacobian,
        s_mat: PackedSymmetric::zeros(p),
        gqt_model: Model::GaussNewton,
        trials: Vec::new(),
        best,
        previous: None,
    };
    let code = driver.run();
    let report = driver.finish(code);
    info!("\n{}", fit_summary(&report));
    Ok(report)
}

/// What the last accepted step leaves for the next iteration.
struct Accepted {
    x: DVector<f64>,
    g: DVector<f64>,
    j: DMatrix<f64>,
    d: DVector<f64>,
    h_gn: PackedSymmetric,
    /// model Hessian the step was computed with
    h_model: PackedSymmetric,
    code: AssessCode,
    radfac: f64,
    dstnrm: f64,
}

/// Lowest `f` evaluated so far.
struct BestPoint {
    x: DVector<f64>,
    r: DVector<f64>,
    f: f64,
}

enum StepOutcome {
    Accepted,
    Finished(ConvergenceCode),
}

struct Driver<'a, P: ResidualProblem + ?Sized> {
    problem: &'a mut P,
    bounds: Option<Bounds>,
    config: &'a Nl2solConfig,
    mc: MachineConstants,
    n: usize,
    st: SolverState,
    /// last point the Jacobian was evaluated at, with residuals and Jacobian
    at: DVector<f64>,
    r: DVector<f64>,
    j: DMatrix<f64>,
    /// second-order term of the augmented model
    s_mat: PackedSymmetric,
    /// model the step solver memory belongs to
    gqt_model: Model,
    /// trial points of this iteration with their residuals
    trials: Vec<(DVector<f64>, DVector<f64>)>,
    best: BestPoint,
    previous: Option<Accepted>,
}

impl<P: ResidualProblem + ?Sized> Driver<'_, P> {
    fn run(&mut self) -> ConvergenceCode {
        loop {
            if self.st.counters.iterations >= self.config.max_iterations {
                return ConvergenceCode::IterationLimit;
            }
            self.st.counters.iterations += 1;
            let g = self.j.tr_mul(&self.r);
            let h_gn = self.gauss_newton_hessian();
            self.begin_iteration(&g);
            if let StepOutcome::Finished(code) = self.step_loop(&g, &h_gn) {
                return code;
            }
        }
    }

    /// `JᵀJ` from the pivoted QR factor of `J`.
    fn gauss_newton_hessian(&self) -> PackedSymmetric {
        let qr = PivotedQr::new(self.j.clone(), 0, &self.mc);
        match qr.status() {
            QrStatus::FullRank => {}
            QrStatus::RankDeficient { column } => {
                warn!(
                    "iteration {}: Jacobian is rank deficient at column {} (rank {})",
                    self.st.counters.iterations,
                    column,
                    qr.rank()
                );
            }
            QrStatus::Underflow { column } => {
                warn!(
                    "iteration {}: Jacobian column {} underflows",
                    self.st.counters.iterations, column
                );
            }
        }
        qr.gauss_newton_hessian()
    }

    fn model_hessian(&self, h_gn: &PackedSymmetric, model: Model) -> PackedSymmetric {
        match model {
            Model::GaussNewton => h_gn.clone(),
            Model::Augmented => h_gn.sum(&self.s_mat),
        }
    }

    /// Secant update, model choice, scale and radius for the new iteration.
    fn begin_iteration(&mut self, g: &DVector<f64>) {
        let cfg = self.config;
        let first = self.previous.is_none();
        if let Some(prev) = self.previous.take() {
            let step = &self.st.iterate.x - &prev.x;
            let y = g - &prev.g;
            let y_sharp = (&self.j - &prev.j).tr_mul(&self.r);
            let misfit = gradient_misfit(&prev.h_model, &step, &y, &prev.d);

            let mut radfac = prev.radfac;
            if prev.code == AssessCode::AcceptRadiusFromGradient {
                let gnorm = euclidean_norm(g.component_div(&prev.d).as_slice());
                radfac = if misfit <= cfg.tuner4 * gnorm {
                    cfg.increase_factor
                } else {
                    1.0
                };
            }

            let model = self.st.iterate.model;
            let other = match model.other() {
                Model::GaussNewton => prev.h_gn.clone(),
                Model::Augmented => prev.h_gn.sum(&self.s_mat),
            };
            if gradient_misfit(&other, &step, &y, &prev.d) < cfg.tuner5 * misfit {
                debug!("switching to the {} model", model.other());
                self.st.iterate.model = model.other();
            }
            let outcome = dgw_update(&mut self.s_mat, &step, &y, &y_sharp, cfg.cosine_min);
            debug!("secant update: {:?}", outcome);

            let radius = radfac * prev.dstnrm;
            if radius > 0.0 && radius.is_finite() {
                self.st.iterate.radius = radius;
            }
        }

        let second_order = match self.st.iterate.model {
            Model::Augmented => Some(&self.s_mat),
            Model::GaussNewton => None,
        };
        update_scale(&mut self.st.iterate.d, &self.j, second_order, first, cfg);

        self.st.iterate.stglim = if first { 1 } else { 2 };
        self.st.begin_iteration();
        self.st.assess.mlstgd = self.st.iterate.model;
        self.gqt_model = self.st.iterate.model;
        self.trials.clear();
        info!(
            "iteration {}: f = {:e}, radius = {:e}, model = {}",
            self.st.counters.iterations,
            self.st.iterate.f,
            self.st.iterate.radius,
            self.st.iterate.model
        );
    }

    /// Trial steps of one outer iteration.
    fn step_loop(&mut self, g: &DVector<f64>, h_gn: &PackedSymmetric) -> StepOutcome {
        let cfg = self.config;
        loop {
            let model = self.st.iterate.model;
            if model != self.gqt_model {
                self.st.gqt.reset();
                self.gqt_model = model;
            }
            let h = self.model_hessian(h_gn, model);
            self.compute_step(&h, g);

            if self.st.counters.function_evals >= cfg.max_function_evals {
                let it = &mut self.st.iterate;
                if self.best.f < it.f0 {
                    it.x.copy_from(&self.best.x);
                    it.f = self.best.f;
                } else {
                    it.x.copy_from(&it.x0);
                    it.f = it.f0;
                }
                return StepOutcome::Finished(ConvergenceCode::FunctionEvalLimit);
            }
            self.evaluate_trial();

            let mut irc = assess(&mut self.st, cfg);
            if irc == AssessCode::RecomputeAtMaxRadius {
                self.st.trial = gqtstp(
                    &h,
                    g,
                    &self.st.iterate.d,
                    cfg.initial_trust_radius,
                    &mut self.st.gqt,
                    cfg,
                    &self.mc,
                );
                irc = assess(&mut self.st, cfg);
            }

            match irc {
                AssessCode::NeedNewModelOrSmallerStep | AssessCode::NeedNewModelOrAccept => {
                    self.st.iterate.model = model.other();
                }
                AssessCode::RecomputeSameModel => {
                    let base = if self.st.trial.dstnrm > 0.0 {
                        self.st.trial.dstnrm
                    } else {
                        self.st.iterate.radius
                    };
                    self.st.iterate.radius = self.st.assess.radfac * base;
                }
                AssessCode::AcceptRadiusFromGradient | AssessCode::AcceptRadiusKnown => {
                    if let Some(outcome) = self.accept(irc, g, h_gn, h) {
                        return outcome;
                    }
                }
                AssessCode::RecomputeAtMaxRadius => {
                    return StepOutcome::Finished(ConvergenceCode::BadInput);
                }
                done => {
                    return StepOutcome::Finished(
                        done.convergence().unwrap_or(ConvergenceCode::BadInput),
                    );
                }
            }
        }
    }

    fn compute_step(&mut self, h: &PackedSymmetric, g: &DVector<f64>) {
        let st = &mut self.st;
        st.trial = gqtstp(
            h,
            g,
            &st.iterate.d,
            st.iterate.radius,
            &mut st.gqt,
            self.config,
            &self.mc,
        );
        if let Some(b) = &self.bounds {
            if b.constrain_trial(&st.iterate.x0, g, h, &st.iterate.d, &mut st.trial) {
                debug!("step clamped to bounds, ‖D·step‖ = {:e}", st.trial.dstnrm);
            }
        }
        st.place_trial();
        debug!(
            "trial step: ‖D·step‖ = {:e}, stppar = {:e}, preduc = {:e}",
            st.trial.dstnrm, st.trial.stppar, st.trial.preduc
        );
    }

    /// A trial that cannot be evaluated is an oversized step.
    fn evaluate_trial(&mut self) {
        self.st.counters.function_evals += 1;
        let x = self.st.iterate.x.clone();
        match evaluate_checked(&mut *self.problem, &x, EvalMode::ResidualOnly, self.n) {
            Ok(eval) => {
                let f = 0.5 * eval.residuals.norm_squared();
                if f.is_finite() {
                    self.st.iterate.f = f;
                    self.st.iterate.toobig = false;
                    if f < self.best.f {
                        self.best = BestPoint {
                            x: x.clone(),
                            r: eval.residuals.clone(),
                            f,
                        };
                    }
                    self.trials.push((x, eval.residuals));
                    return;
                }
                warn!("f overflows at the trial point, shrinking the step");
            }
            Err(e) => warn!("trial point rejected: {}", e),
        }
        self.st.iterate.f = f64::MAX;
        self.st.iterate.toobig = true;
    }

    /// Move to the accepted point. `None` means the Jacobian could not be
    /// evaluated there and a shorter step must be tried.
    fn accept(
        &mut self,
        irc: AssessCode,
        g: &DVector<f64>,
        h_gn: &PackedSymmetric,
        h_model: PackedSymmetric,
    ) -> Option<StepOutcome> {
        let x = self.st.iterate.x.clone();
        self.st.counters.gradient_evals += 1;
        let evaluated = evaluate_checked(&mut *self.problem, &x, EvalMode::ResidualAndJacobian, self.n)
            .and_then(|e| match e.jacobian {
                Some(j) => Ok((e.residuals, j)),
                None => Err(EvaluationFailure("no Jacobian returned".to_string())),
            });
        let (r, j) = match evaluated {
            Ok(rj) => rj,
            Err(e) => {
                warn!("Jacobian cannot be evaluated at the accepted point: {}", e);
                let base = if self.st.trial.dstnrm > 0.0 {
                    self.st.trial.dstnrm
                } else {
                    self.st.iterate.radius
                };
                let it = &mut self.st.iterate;
                it.x.copy_from(&it.x0);
                it.f = it.f0;
                it.radius = self.config.decrease_factor * base;
                self.st.irc = AssessCode::AcceptRadiusKnown;
                return None;
            }
        };
        let old_j = std::mem::replace(&mut self.j, j);
        self.r = r;
        self.at.copy_from(&x);
        self.previous = Some(Accepted {
            x: self.st.iterate.x0.clone(),
            g: g.clone(),
            j: old_j,
            d: self.st.iterate.d.clone(),
            h_gn: h_gn.clone(),
            h_model,
            code: irc,
            radfac: self.st.assess.radfac,
            dstnrm: self.st.trial.dstnrm,
        });
        debug!(
            "accepted: f = {:e}, reldx = {:e}, code = {}",
            self.st.iterate.f, self.st.assess.reldx, irc
        );
        let iteration = self.st.counters.iterations;
        if self.problem.stop_requested(iteration, &x) {
            info!("stop requested after iteration {}", iteration);
            return Some(StepOutcome::Finished(ConvergenceCode::UserStop));
        }
        Some(StepOutcome::Accepted)
    }

    /// Residuals at `x` if they are known already.
    fn known_residuals(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
        if *x == self.at {
            return Some(self.r.clone());
        }
        if *x == self.best.x {
            return Some(self.best.r.clone());
        }
        self.trials
            .iter()
            .rev()
            .find(|(xt, _)| xt == x)
            .map(|(_, r)| r.clone())
    }

    fn finish(mut self, code: ConvergenceCode) -> FitReport {
        let mut x = self.st.iterate.x.clone();
        let residuals = match self.known_residuals(&x) {
            Some(r) => r,
            None => {
                self.st.counters.function_evals += 1;
                match evaluate_checked(&mut *self.problem, &x, EvalMode::ResidualOnly, self.n) {
                    Ok(eval) => eval.residuals,
                    Err(e) => {
                        warn!("final point cannot be evaluated ({}), reporting x0", e);
                        x.copy_from(&self.at);
                        self.r.clone()
                    }
                }
            }
        };
        let objective = 0.5 * residuals.norm_squared();

        let covariance = match self.config.covariance {
            None => CovarianceStatus::NotRequested,
            Some(_) if !code.allows_covariance() => {
                CovarianceStatus::NotComputed(CovarianceFailure::NotConverged)
            }
            Some(request) => {
                let jacobian = if x == self.at {
                    Ok(self.j.clone())
                } else {
                    self.st.counters.gradient_evals += 1;
                    evaluate_checked(&mut *self.problem, &x, EvalMode::ResidualAndJacobian, self.n)
                        .map(|e| e.jacobian.unwrap_or_else(|| self.j.clone()))
                };
                match jacobian {
                    Ok(jacobian) => {
                        let at = SolutionPoint {
                            x: &x,
                            residuals: &residuals,
                            jacobian: &jacobian,
                            scale: &self.st.iterate.d,
                        };
                        covariance(
                            &mut *self.problem,
                            &at,
                            request,
                            self.config,
                            &self.mc,
                            &mut self.st.counters,
                        )
                    }
                    Err(e) => {
                        warn!("Jacobian at the solution cannot be evaluated: {}", e);
                        CovarianceStatus::NotComputed(CovarianceFailure::CallbackFailed)
                    }
                }
            }
        };

        info!(
            "nl2sol finished: {} after {} iterations, f = {:e}",
            code, self.st.counters.iterations, objective
        );
        FitReport {
            params: x,
            code,
            iterations: self.st.counters.iterations,
            function_evals: self.st.counters.function_evals,
            gradient_evals: self.st.counters.gradient_evals,
            objective,
            chi_squared: 2.0 * objective,
            residuals,
            scale: self.st.iterate.d.clone(),
            model: self.st.iterate.model,
            covariance,
        }
    }
}
