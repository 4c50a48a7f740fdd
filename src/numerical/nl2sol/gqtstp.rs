//! Trust-region step for a quadratic model with a possibly indefinite Hessian
//! (Moré-Hebden iteration with Gay's treatment of the hard case).
//!
//! Given the gradient `g`, the model Hessian `H` and the scale `D`, computes
//! `step` approximately minimizing `gᵀstep + ½ stepᵀH step` subject to
//! `‖D·step‖ <= radius`. All work is done on the scaled problem
//! `Ĥ = D⁻¹HD⁻¹`, `ĝ = D⁻¹g`, `s = D·step`, whose solution is
//! `s(α) = −(Ĥ + αI)⁻¹ĝ` for the Marquardt parameter `α`.
//!
//! The computation is a finite state machine over [`Phase`]. Everything that a
//! second call with another radius can reuse (Newton step, eigenvalue bounds,
//! the last factorization) is kept in [`GqtstpMemory`].
use log::debug;
use nalgebra::DVector;

use crate::numerical::nl2sol::config::Nl2solConfig;
use crate::numerical::nl2sol::state::TrialStep;
use crate::somelinalg::packed_cholesky::{
    LinalgError, PackedLower, PackedSymmetric, cholesky_factor_packed,
};
use crate::somelinalg::vector_kernels::{MachineConstants, dot_product, euclidean_norm, unlikely};

/// kappa of the hard-case acceptance test
const KAPPA: f64 = 2.0;
/// smallest fraction of the upper bound used as a safeguarded α
const P001: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    FreshStart,
    TryNewton,
    Bracket,
    Restart,
    Shift,
    Solve,
    CheckSpecial,
    Update,
    Done,
}

/// Last successful factorization `LLᵀ = Ĥ + αI` and its step.
#[derive(Debug, Clone, PartialEq)]
struct Factored {
    alpha: f64,
    l: PackedLower,
    s: DVector<f64>,
    dst: f64,
}

/// State carried between step computations.
///
/// `reset` marks the next call as a fresh start (new gradient or Hessian); a
/// call without reset is a restart with the same model and another radius.
#[derive(Debug, Clone, PartialEq)]
pub struct GqtstpMemory {
    /// Hebden iterations of the current model, negative before the first call
    ka: i32,
    /// last Marquardt parameter, negated after a hard-case step
    alpha: f64,
    /// radius of the last call
    rad0: f64,
    lk: f64,
    uk: f64,
    /// Gershgorin bounds on the eigenvalues of `Ĥ`
    gershgorin: Option<(f64, f64)>,
    /// `‖s0‖/‖L⁻¹s0‖²` of the Newton step
    phipin: f64,
    /// `‖s0‖` of the Newton step, or minus a lower bound on `α` when there is none
    dst0: f64,
    /// reduction predicted by the Newton step, 0 when there is none
    nreduc: f64,
    dgnorm: f64,
    newton: Option<DVector<f64>>,
    last: Option<Factored>,
}

impl GqtstpMemory {
    pub fn new() -> Self {
        Self {
            ka: -1,
            alpha: 0.0,
            rad0: 0.0,
            lk: 0.0,
            uk: 0.0,
            gershgorin: None,
            phipin: 0.0,
            dst0: 0.0,
            nreduc: 0.0,
            dgnorm: 0.0,
            newton: None,
            last: None,
        }
    }

    /// Forget everything tied to the current model. The last `α` and radius
    /// survive as the starting guess of the next fresh start.
    pub fn reset(&mut self) {
        self.ka = -1;
        self.gershgorin = None;
        self.newton = None;
        self.last = None;
        self.nreduc = 0.0;
        self.dst0 = 0.0;
        self.phipin = 0.0;
    }

    /// Hebden iterations since the last fresh start.
    pub fn iterations(&self) -> i32 {
        self.ka.max(0)
    }

    pub fn is_fresh(&self) -> bool {
        self.ka < 0
    }
}

impl Default for GqtstpMemory {
    fn default() -> Self {
        Self::new()
    }
}

struct StepSolver<'a> {
    h: PackedSymmetric,
    dig: DVector<f64>,
    d: &'a DVector<f64>,
    rad: f64,
    phimin: f64,
    phimax: f64,
    /// tolerance of the hard-case acceptance test
    psi_tol: f64,
    kalim: i32,
    dgxfac: f64,
    dggdmx: f64,
    mc: &'a MachineConstants,
    mem: &'a mut GqtstpMemory,
    /// current α
    alpha: f64,
    factor: Option<PackedLower>,
    s: DVector<f64>,
    q0norm2: f64,
    dst: f64,
    phi: f64,
    oldphi: f64,
    special: bool,
    stuck: bool,
}

impl<'a> StepSolver<'a> {
    fn new(
        h: &PackedSymmetric,
        g: &DVector<f64>,
        d: &'a DVector<f64>,
        radius: f64,
        mem: &'a mut GqtstpMemory,
        config: &Nl2solConfig,
        mc: &'a MachineConstants,
    ) -> Self {
        let p = g.len();
        let hs = h.diagonally_scaled(d);
        let dggdmx = hs.max_abs();
        let eps = config.epsilon_step;
        let psi_tol = 2.0 * eps
            / (3.0 * (4.0 * (1.0 + config.phi_min) * (KAPPA + 1.0) + KAPPA + 2.0));
        Self {
            h: hs,
            dig: g.component_div(d),
            d,
            rad: radius,
            phimin: config.phi_min * radius,
            phimax: config.phi_max * radius,
            psi_tol,
            kalim: config.hebden_iteration_limit as i32,
            dgxfac: mc.dgxfac,
            dggdmx,
            mc,
            mem,
            alpha: 0.0,
            factor: None,
            s: DVector::zeros(p),
            q0norm2: 0.0,
            dst: 0.0,
            phi: 0.0,
            oldphi: 0.0,
            special: false,
            stuck: false,
        }
    }
}

/// Compute the trust-region step for gradient `g`, Hessian `h` and scale `d`.
///
/// `mem` decides between a fresh start and a restart, see [`GqtstpMemory`].
pub fn gqtstp(
    h: &PackedSymmetric,
    g: &DVector<f64>,
    d: &DVector<f64>,
    radius: f64,
    mem: &mut GqtstpMemory,
    config: &Nl2solConfig,
    mc: &MachineConstants,
) -> TrialStep {
    let fresh = mem.is_fresh();
    let mut solver = StepSolver::new(h, g, d, radius, mem, config, mc);
    let mut phase = if fresh {
        Phase::FreshStart
    } else {
        Phase::Restart
    };
    while phase != Phase::Done {
        phase = solver.transition(phase);
    }
    solver.finish()
}

impl StepSolver<'_> {
    fn transition(&mut self, phase: Phase) -> Phase {
        match phase {
            Phase::FreshStart => {
                self.mem.ka = 0;
                self.mem.dgnorm = euclidean_norm(self.dig.as_slice());
                self.mem.lk = 0.0;
                self.mem.uk = 0.0;
                self.mem.nreduc = 0.0;
                self.mem.dst0 = 0.0;
                self.mem.phipin = 0.0;
                self.mem.gershgorin = None;
                self.mem.newton = None;
                self.mem.last = None;
                Phase::TryNewton
            }
            Phase::TryNewton => self.try_newton(),
            Phase::Bracket => {
                self.bracket();
                self.alpha = if self.mem.rad0 > 0.0 {
                    self.mem.alpha.abs() * self.mem.rad0 / self.rad
                } else {
                    0.0
                };
                Phase::Shift
            }
            Phase::Restart => self.restart(),
            Phase::Shift => self.shift(),
            Phase::Solve => self.solve(),
            Phase::CheckSpecial => self.check_special(),
            Phase::Update => self.update(),
            Phase::Done => Phase::Done,
        }
    }

    /// Unmodified Newton step, accepted if it lies inside the trust region.
    fn try_newton(&mut self) -> Phase {
        let l = match cholesky_factor_packed(&self.h) {
            Ok(l) => l,
            Err(npd) => {
                let (_, rq) = npd.curvature_direction();
                self.mem.lk = -rq;
                self.mem.dst0 = -self.mem.lk;
                debug!("gqtstp: Hessian not positive definite, alpha >= {:e}", self.mem.lk);
                return Phase::Bracket;
            }
        };
        let sigma = l.smallest_singular_value().sigma;
        if sigma * sigma <= self.dgxfac * self.dggdmx {
            // numerically singular: no Newton step
            self.mem.dst0 = -sigma * sigma;
            self.mem.nreduc = 0.0;
            debug!("gqtstp: Hessian nearly singular, sigma = {:e}", sigma);
            return Phase::Bracket;
        }
        let (q0, s) = match solve_shifted(&l, &self.dig) {
            Ok(v) => v,
            Err(_) => return Phase::Bracket,
        };
        let q0norm2 = q0.norm_squared();
        let dst = euclidean_norm(s.as_slice());
        self.mem.nreduc = 0.5 * q0norm2;
        self.mem.dst0 = dst;
        self.mem.newton = Some(s.clone());
        self.alpha = 0.0;
        self.dst = dst;
        self.phi = dst - self.rad;
        if self.phi <= self.phimax {
            self.s = s;
            self.q0norm2 = q0norm2;
            self.factor = Some(l);
            return Phase::Done;
        }
        let t1 = match l.solve_lower(&s) {
            Ok(t) => euclidean_norm(t.as_slice()),
            Err(_) => return Phase::Bracket,
        };
        self.mem.phipin = dst / (t1 * t1);
        self.mem.lk = self.mem.lk.max(self.phi * self.mem.phipin);
        self.mem.last = Some(Factored {
            alpha: 0.0,
            l,
            s,
            dst,
        });
        Phase::Bracket
    }

    /// Bounds on α from the Gershgorin circles of `Ĥ`.
    fn bracket(&mut self) {
        let (emin, emax) = match self.mem.gershgorin {
            Some(b) => b,
            None => {
                let b = gershgorin_bounds(&self.h);
                self.mem.gershgorin = Some(b);
                b
            }
        };
        let ratio = self.mem.dgnorm / self.rad;
        self.mem.uk = ratio - emin;
        if self.mem.uk <= 0.0 {
            self.mem.uk = P001;
        }
        self.mem.lk = self.mem.lk.max(ratio - emax).max(0.0);
        self.widen_upper_bound();
    }

    fn widen_upper_bound(&mut self) {
        if self.mem.uk <= self.mem.lk {
            self.mem.uk = 2.0 * self.mem.lk + P001;
        }
    }

    /// Same model, new radius: reuse the Newton step, the bounds and the last
    /// factorization.
    fn restart(&mut self) -> Phase {
        self.mem.ka = 0;
        if let Some(newton) = &self.mem.newton {
            if self.mem.dst0 > 0.0 && self.mem.dst0 - self.rad <= self.phimax {
                self.s = newton.clone();
                self.alpha = 0.0;
                self.dst = self.mem.dst0;
                self.q0norm2 = 2.0 * self.mem.nreduc;
                return Phase::Done;
            }
        }
        self.mem.lk = (-self.mem.dst0).max(0.0);
        if self.mem.dst0 > 0.0 {
            self.mem.lk = self.mem.lk.max((self.mem.dst0 - self.rad) * self.mem.phipin);
        }
        self.bracket();
        let previous = self.mem.alpha.abs();
        match self.mem.last.take() {
            Some(last) => {
                if previous > 0.0 && self.rad < last.dst {
                    self.mem.lk = self.mem.lk.max(previous);
                } else if previous > 0.0 && self.rad > last.dst {
                    self.mem.uk = self.mem.uk.min(previous);
                }
                self.widen_upper_bound();
                // one Hebden step from the stored factorization
                self.alpha = last.alpha;
                self.dst = last.dst;
                self.phi = last.dst - self.rad;
                self.s = last.s.clone();
                self.factor = Some(last.l.clone());
                self.mem.last = Some(last);
                self.hebden_step()
            }
            None => {
                self.alpha = if self.mem.rad0 > 0.0 {
                    previous * self.mem.rad0 / self.rad
                } else {
                    0.0
                };
                Phase::Shift
            }
        }
    }

    /// Pick a safe α inside the bracket and factor `Ĥ + αI`.
    fn shift(&mut self) -> Phase {
        self.mem.ka += 1;
        if unlikely(self.mem.ka > 2 * self.kalim) {
            debug!("gqtstp: no positive definite shift found");
            self.stuck = true;
            return Phase::Done;
        }
        if self.mem.ka > self.kalim {
            let emin = self.mem.gershgorin.map_or(0.0, |(emin, _)| emin);
            self.alpha = 2.0 * self.mem.lk.max(-emin).max(0.0)
                + self.dgxfac * self.dggdmx.max(1.0);
        } else if self.alpha < self.mem.lk
            || self.alpha >= self.mem.uk
            || -self.mem.dst0 >= self.alpha
        {
            let ratio = (self.mem.lk.max(0.0) / self.mem.uk).sqrt();
            self.alpha = self.mem.uk * P001.max(ratio);
        }
        let mut shifted = self.h.clone();
        shifted.add_to_diagonal(self.alpha);
        match cholesky_factor_packed(&shifted) {
            Ok(l) => {
                self.factor = Some(l);
                Phase::Solve
            }
            Err(npd) => {
                let (_, rq) = npd.curvature_direction();
                self.mem.lk = self.mem.lk.max(self.alpha - rq);
                self.mem.dst0 = -self.mem.lk;
                self.widen_upper_bound();
                Phase::Shift
            }
        }
    }

    fn solve(&mut self) -> Phase {
        let solved = match &self.factor {
            Some(l) => solve_shifted(l, &self.dig),
            None => return Phase::Shift,
        };
        let (q0, s) = match solved {
            Ok(v) => v,
            Err(_) => {
                self.mem.lk = self.mem.lk.max(self.alpha);
                self.widen_upper_bound();
                return Phase::Shift;
            }
        };
        self.q0norm2 = q0.norm_squared();
        self.dst = euclidean_norm(s.as_slice());
        self.s = s;
        self.phi = self.dst - self.rad;
        if let Some(l) = &self.factor {
            self.mem.last = Some(Factored {
                alpha: self.alpha,
                l: l.clone(),
                s: self.s.clone(),
                dst: self.dst,
            });
        }
        debug!(
            "gqtstp: ka = {}, alpha = {:e}, phi = {:e}",
            self.mem.ka, self.alpha, self.phi
        );
        if self.phi >= self.phimin && self.phi <= self.phimax {
            return Phase::Done;
        }
        if self.phi == self.oldphi {
            return Phase::Done;
        }
        self.oldphi = self.phi;
        if self.phi < 0.0 {
            Phase::CheckSpecial
        } else {
            Phase::Update
        }
    }

    /// Step too short: try to reach the boundary along an approximate null
    /// vector of `Ĥ + αI`.
    fn check_special(&mut self) -> Phase {
        let Some(l) = &self.factor else {
            return Phase::Update;
        };
        let estimate = l.smallest_singular_value();
        let w = match l.solve_lower_transpose(&estimate.right) {
            Ok(w) => w,
            Err(_) => return Phase::Update,
        };
        let wnorm = euclidean_norm(w.as_slice());
        if wnorm == 0.0 {
            return Phase::Update;
        }
        let z = w / wnorm;
        let sig = euclidean_norm(estimate.right.as_slice()) / wnorm;
        let sz = dot_product(self.s.as_slice(), z.as_slice(), self.mc);
        let gap = (self.rad - self.dst) * (self.rad + self.dst);
        let root = (sz * sz + gap).sqrt();
        let denom = if sz < 0.0 { sz - root } else { sz + root };
        let theta = gap / denom;
        let slack = self.psi_tol * (self.q0norm2 + self.alpha * self.rad * self.rad);
        if theta * theta * sig * sig <= slack {
            debug!("gqtstp: hard case, theta = {:e}, sigma = {:e}", theta, sig);
            self.s += z * theta;
            self.dst = euclidean_norm(self.s.as_slice());
            self.special = true;
            return Phase::Done;
        }
        self.mem.lk = self.mem.lk.max(self.alpha - sig * sig);
        Phase::Update
    }

    fn update(&mut self) -> Phase {
        if self.mem.ka >= self.kalim {
            debug!("gqtstp: iteration limit, phi = {:e}", self.phi);
            return Phase::Done;
        }
        if self.phi < 0.0 {
            self.mem.uk = self.mem.uk.min(self.alpha);
        }
        if self.mem.dgnorm == 0.0 {
            return Phase::Shift;
        }
        self.hebden_step()
    }

    /// Newton step on `1/‖s(α)‖ − 1/radius`; its result is a lower bound on α.
    fn hebden_step(&mut self) -> Phase {
        let Some(l) = &self.factor else {
            return Phase::Shift;
        };
        let t1 = match l.solve_lower(&self.s) {
            Ok(t) => euclidean_norm(t.as_slice()),
            Err(_) => return Phase::Shift,
        };
        if t1 > 0.0 {
            self.alpha += (self.phi / t1) * (self.dst / t1) * (self.dst / self.rad);
            self.mem.lk = self.mem.lk.max(self.alpha);
        }
        Phase::Shift
    }

    fn finish(mut self) -> TrialStep {
        let p = self.dig.len();
        if self.stuck {
            self.mem.alpha = 0.0;
            self.mem.rad0 = self.rad;
            return TrialStep {
                step: DVector::zeros(p),
                dstnrm: 0.0,
                gtstep: 0.0,
                preduc: 0.0,
                nreduc: self.mem.nreduc,
                stppar: self.alpha,
                dst0: self.mem.dst0,
            };
        }
        let gtstep = dot_product(self.dig.as_slice(), self.s.as_slice(), self.mc);
        let (stppar, preduc) = if self.special {
            let curvature = self.h.quadratic_form(&self.s);
            (-self.alpha, -(gtstep + 0.5 * curvature))
        } else {
            (
                self.alpha,
                0.5 * (self.q0norm2 + self.alpha * self.dst * self.dst),
            )
        };
        self.mem.alpha = stppar;
        self.mem.rad0 = self.rad;
        TrialStep {
            step: self.s.component_div(self.d),
            dstnrm: self.dst,
            gtstep,
            preduc,
            nreduc: self.mem.nreduc,
            stppar,
            dst0: self.mem.dst0,
        }
    }
}

/// `q0 = L⁻¹ĝ`, `s = −L⁻ᵀq0`
fn solve_shifted(
    l: &PackedLower,
    dig: &DVector<f64>,
) -> Result<(DVector<f64>, DVector<f64>), LinalgError> {
    let q0 = l.solve_lower(dig)?;
    let s = -l.solve_lower_transpose(&q0)?;
    Ok((q0, s))
}

/// Lower and upper Gershgorin bounds on the eigenvalues.
fn gershgorin_bounds(h: &PackedSymmetric) -> (f64, f64) {
    let n = h.order();
    let mut emin = f64::INFINITY;
    let mut emax = f64::NEG_INFINITY;
    for i in 0..n {
        let radius: f64 = (0..n).filter(|&j| j != i).map(|j| h.get(i, j).abs()).sum();
        let hii = h.get(i, i);
        emin = emin.min(hii - radius);
        emax = emax.max(hii + radius);
    }
    (emin, emax)
}
