//! Step assessment: after every trial evaluation decide whether to accept the
//! step, shrink or grow the trust region, try the other model, or stop.
//!
//! The decision procedure is a finite state machine. [`assess`] picks the entry
//! node from the incoming code and runs transitions until a code for the caller
//! has been produced. Transition order fixes the precedence between
//! convergence codes and must not change.
use log::debug;
use strum_macros::Display;

use crate::numerical::nl2sol::config::Nl2solConfig;
use crate::numerical::nl2sol::report::ConvergenceCode;
use crate::numerical::nl2sol::state::SolverState;
use crate::somelinalg::vector_kernels::relative_step;

/// Instruction returned to the driver, and the state the next call resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AssessCode {
    /// try the other model, or a smaller radius with the same model
    NeedNewModelOrSmallerStep,
    /// try the other model; the current step is acceptable
    NeedNewModelOrAccept,
    /// accept; next radius follows from the gradient test
    AcceptRadiusFromGradient,
    /// accept; next radius is `radfac·dstnrm`
    AcceptRadiusKnown,
    /// recompute the step with the same model and radius `radfac·radius`
    RecomputeSameModel,
    /// recompute the predicted reduction with radius `initial_trust_radius`
    /// for the singular convergence test, without evaluating f
    RecomputeAtMaxRadius,
    XConverged,
    RelFuncConverged,
    BothConverged,
    AbsFuncConverged,
    SingularConverged,
    FalseConverged,
    BadInput,
}

impl AssessCode {
    pub fn code(self) -> i32 {
        match self {
            AssessCode::NeedNewModelOrSmallerStep => 1,
            AssessCode::NeedNewModelOrAccept => 2,
            AssessCode::AcceptRadiusFromGradient => 3,
            AssessCode::AcceptRadiusKnown => 4,
            AssessCode::RecomputeSameModel => 5,
            AssessCode::RecomputeAtMaxRadius => 6,
            AssessCode::XConverged => 7,
            AssessCode::RelFuncConverged => 8,
            AssessCode::BothConverged => 9,
            AssessCode::AbsFuncConverged => 10,
            AssessCode::SingularConverged => 11,
            AssessCode::FalseConverged => 12,
            AssessCode::BadInput => 13,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let c = match code {
            1 => AssessCode::NeedNewModelOrSmallerStep,
            2 => AssessCode::NeedNewModelOrAccept,
            3 => AssessCode::AcceptRadiusFromGradient,
            4 => AssessCode::AcceptRadiusKnown,
            5 => AssessCode::RecomputeSameModel,
            6 => AssessCode::RecomputeAtMaxRadius,
            7 => AssessCode::XConverged,
            8 => AssessCode::RelFuncConverged,
            9 => AssessCode::BothConverged,
            10 => AssessCode::AbsFuncConverged,
            11 => AssessCode::SingularConverged,
            12 => AssessCode::FalseConverged,
            13 => AssessCode::BadInput,
            _ => return None,
        };
        Some(c)
    }

    /// Terminal outcome carried by this code, if any.
    pub fn convergence(self) -> Option<ConvergenceCode> {
        match self {
            AssessCode::XConverged => Some(ConvergenceCode::XConverged),
            AssessCode::RelFuncConverged => Some(ConvergenceCode::RelFuncConverged),
            AssessCode::BothConverged => Some(ConvergenceCode::BothConverged),
            AssessCode::AbsFuncConverged => Some(ConvergenceCode::AbsFuncConverged),
            AssessCode::SingularConverged => Some(ConvergenceCode::SingularConverged),
            AssessCode::FalseConverged => Some(ConvergenceCode::FalseConverged),
            AssessCode::BadInput => Some(ConvergenceCode::BadInput),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    BeginIteration,
    RetryDecision,
    NewModelTried,
    RecomputedStep,
    CheckOversize,
    Shrink,
    CompareWithBest,
    RestoreBest,
    MeasureStep,
    ClassifyDecrease,
    TrivialDecrease,
    NontrivialDecrease,
    FletcherRadius,
    FalseConvergenceTest,
    GoodDecrease,
    SaveBest,
    KeepRadius,
    ResumeAfterConvergence,
    RecordCode,
    ConvergenceTests,
    SingularScreen,
    SingularStepLength,
    RequestRecompute,
    RecomputedReduction,
    SingularTest,
    Done,
}

struct Assessment<'a> {
    st: &'a mut SolverState,
    cfg: &'a Nl2solConfig,
    entry: AssessCode,
    /// factor applied to the Fletcher radius when a step was restored
    rfac1: f64,
    /// the trial x is the accepted x
    goodx: bool,
    reldx1: f64,
    emaxs: f64,
}

/// Judge the trial step stored in `state` and return what the driver must do
/// next. The returned code is also left in `state.irc`.
pub fn assess(state: &mut SolverState, config: &Nl2solConfig) -> AssessCode {
    let entry = state.irc;
    state.assess.switched = false;
    state.assess.restored = false;
    let mut run = Assessment {
        st: state,
        cfg: config,
        entry,
        rfac1: 1.0,
        goodx: true,
        reldx1: 0.0,
        emaxs: 0.0,
    };
    let mut node = run.dispatch();
    while node != Node::Done {
        node = run.transition(node);
    }
    debug!(
        "assess: {} -> {} (f = {:e}, f0 = {:e}, preduc = {:e}, radfac = {})",
        entry, run.st.irc, run.st.iterate.f, run.st.iterate.f0, run.st.trial.preduc,
        run.st.assess.radfac
    );
    run.st.irc
}

impl Assessment<'_> {
    fn dispatch(&mut self) -> Node {
        use AssessCode::*;
        match self.entry {
            NeedNewModelOrSmallerStep => Node::RetryDecision,
            NeedNewModelOrAccept => Node::NewModelTried,
            AcceptRadiusFromGradient | AcceptRadiusKnown => Node::BeginIteration,
            RecomputeSameModel => Node::RecomputedStep,
            RecomputeAtMaxRadius => Node::RecomputedReduction,
            XConverged | RelFuncConverged | BothConverged | AbsFuncConverged
            | SingularConverged => Node::ResumeAfterConvergence,
            FalseConverged => Node::FalseConvergenceTest,
            BadInput => {
                self.st.irc = BadInput;
                Node::Done
            }
        }
    }

    fn transition(&mut self, node: Node) -> Node {
        let cfg = self.cfg;
        let st = &mut *self.st;
        let a = &mut st.assess;
        let it = &mut st.iterate;
        let tr = &mut st.trial;
        match node {
            Node::BeginIteration => {
                a.stage = 1;
                a.radinc = 0;
                a.flstgd = it.f0;
                if !it.toobig {
                    return Node::MeasureStep;
                }
                a.stage = -1;
                a.xirc = self.entry;
                Node::Shrink
            }
            Node::RetryDecision => {
                if it.model != a.mlstgd {
                    return Node::NewModelTried;
                }
                // old model kept with a smaller radius: no more new models this iteration
                a.stage = it.stglim;
                a.radinc = -1;
                Node::MeasureStep
            }
            Node::NewModelTried => {
                a.stage += 1;
                Node::RecomputedStep
            }
            Node::RecomputedStep => {
                if a.stage > 0 {
                    return Node::CheckOversize;
                }
                // step was recomputed because it was too big
                if it.toobig {
                    return Node::Shrink;
                }
                a.stage = -a.stage;
                match a.xirc {
                    AssessCode::NeedNewModelOrSmallerStep => Node::RetryDecision,
                    AssessCode::NeedNewModelOrAccept => Node::NewModelTried,
                    AssessCode::AcceptRadiusFromGradient | AssessCode::AcceptRadiusKnown => {
                        Node::MeasureStep
                    }
                    AssessCode::RecomputeSameModel => Node::CompareWithBest,
                    _ => {
                        st.irc = AssessCode::BadInput;
                        Node::Done
                    }
                }
            }
            Node::CheckOversize => {
                if !it.toobig {
                    return Node::CompareWithBest;
                }
                if a.radinc > 0 {
                    return Node::RestoreBest;
                }
                a.stage = -a.stage;
                a.xirc = st.irc;
                Node::Shrink
            }
            Node::Shrink => {
                a.radfac = cfg.decrease_factor;
                a.radinc -= 1;
                st.irc = AssessCode::RecomputeSameModel;
                Node::Done
            }
            Node::CompareWithBest => {
                if it.f < a.flstgd {
                    return Node::MeasureStep;
                }
                // the new step is a loser: restore the old model
                if it.model != a.mlstgd {
                    it.model = a.mlstgd;
                    a.switched = true;
                }
                Node::RestoreBest
            }
            Node::RestoreBest => {
                // only if a previous step decreased f
                if a.flstgd >= it.f0 {
                    return Node::MeasureStep;
                }
                a.restored = true;
                it.f = a.flstgd;
                tr.preduc = a.plstgd;
                tr.gtstep = a.gtslst;
                if !a.switched {
                    self.rfac1 = tr.dstnrm / a.dstsav;
                }
                tr.dstnrm = a.dstsav;
                self.goodx = false;
                Node::MeasureStep
            }
            Node::MeasureStep => {
                self.reldx1 = relative_step(it.d.as_slice(), it.x.as_slice(), it.x0.as_slice());
                if a.restored {
                    tr.step.copy_from(&a.stlstg);
                    it.x = &it.x0 + &tr.step;
                }
                Node::ClassifyDecrease
            }
            Node::ClassifyDecrease => {
                a.fdif = it.f0 - it.f;
                if a.fdif > cfg.tuner2 * tr.preduc {
                    Node::NontrivialDecrease
                } else {
                    Node::TrivialDecrease
                }
            }
            Node::TrivialDecrease => {
                a.reldx = self.reldx1;
                if it.f >= it.f0 {
                    a.mlstgd = it.model;
                    a.flstgd = it.f;
                    it.f = it.f0;
                    it.x.copy_from(&it.x0);
                    a.restored = true;
                }
                st.irc = AssessCode::NeedNewModelOrSmallerStep;
                if a.stage >= it.stglim {
                    st.irc = AssessCode::RecomputeSameModel;
                    a.radinc -= 1;
                }
                Node::FletcherRadius
            }
            Node::NontrivialDecrease => {
                self.rfac1 = 1.0;
                if self.goodx {
                    a.reldx = self.reldx1;
                }
                a.dstsav = tr.dstnrm;
                if a.fdif > tr.preduc * cfg.tuner1 {
                    return Node::GoodDecrease;
                }
                // decrease much less than predicted
                if a.stage < it.stglim {
                    st.irc = AssessCode::NeedNewModelOrAccept;
                    return Node::SaveBest;
                }
                st.irc = AssessCode::AcceptRadiusKnown;
                Node::FletcherRadius
            }
            Node::FletcherRadius => {
                a.xirc = st.irc;
                let emax = tr.gtstep + a.fdif;
                a.radfac = 0.5 * self.rfac1;
                if emax < tr.gtstep {
                    a.radfac = self.rfac1 * cfg.radfac_min.max(0.5 * tr.gtstep / emax);
                }
                Node::FalseConvergenceTest
            }
            Node::FalseConvergenceTest => {
                if a.reldx <= cfg.false_converge_tol {
                    st.irc = AssessCode::FalseConverged;
                    return Node::ConvergenceTests;
                }
                st.irc = a.xirc;
                if it.f < it.f0 {
                    Node::SaveBest
                } else {
                    Node::RecordCode
                }
            }
            Node::GoodDecrease => {
                if a.fdif < -cfg.tuner3 * tr.gtstep {
                    return Node::KeepRadius;
                }
                // a larger radius looks worthwhile unless the radius was just
                // decreased or the step restored
                if a.radinc < 0 || a.restored {
                    return Node::KeepRadius;
                }
                a.radfac = cfg.radfac_max;
                let gts = tr.gtstep;
                if a.fdif < (0.5 / a.radfac - 1.0) * gts {
                    a.radfac = cfg.increase_factor.max(0.5 * gts / (gts + a.fdif));
                }
                st.irc = AssessCode::AcceptRadiusKnown;
                if tr.stppar == 0.0 {
                    return Node::RecordCode;
                }
                // not a Newton step: recompute with a larger radius
                st.irc = AssessCode::RecomputeSameModel;
                a.radinc += 1;
                Node::SaveBest
            }
            Node::SaveBest => {
                a.flstgd = it.f;
                a.mlstgd = it.model;
                a.stlstg.copy_from(&tr.step);
                a.dstsav = tr.dstnrm;
                a.plstgd = tr.preduc;
                a.gtslst = tr.gtstep;
                Node::RecordCode
            }
            Node::KeepRadius => {
                a.radfac = 1.0;
                st.irc = AssessCode::AcceptRadiusFromGradient;
                Node::RecordCode
            }
            Node::ResumeAfterConvergence => {
                st.irc = a.xirc;
                if a.dstsav <= 0.0 {
                    st.irc = AssessCode::FalseConverged;
                }
                Node::ConvergenceTests
            }
            Node::RecordCode => {
                a.xirc = st.irc;
                Node::ConvergenceTests
            }
            Node::ConvergenceTests => {
                if it.f.abs() < cfg.abs_func_tol {
                    st.irc = AssessCode::AbsFuncConverged;
                }
                if 0.5 * a.fdif > tr.preduc {
                    return Node::Done;
                }
                let emax = cfg.rel_func_tol * it.f0.abs();
                self.emaxs = cfg.singular_tol * it.f0.abs();
                if tr.dstnrm > cfg.initial_trust_radius && tr.preduc <= self.emaxs {
                    st.irc = AssessCode::SingularConverged;
                }
                if tr.dst0 >= 0.0 {
                    let mut i = 0;
                    if tr.nreduc > 0.0 && tr.nreduc <= emax {
                        i = 2;
                    }
                    if tr.stppar == 0.0 && a.reldx <= cfg.x_converge_tol && self.goodx {
                        i += 1;
                    }
                    if i > 0 {
                        st.irc = AssessCode::from_code(i + 6).unwrap_or(AssessCode::BadInput);
                    }
                }
                Node::SingularScreen
            }
            Node::SingularScreen => {
                let code = st.irc.code();
                if code > 5 && st.irc != AssessCode::FalseConverged {
                    return Node::Done;
                }
                if tr.dstnrm > cfg.initial_trust_radius {
                    return Node::SingularStepLength;
                }
                if tr.preduc >= self.emaxs {
                    return Node::Done;
                }
                if tr.dst0 <= 0.0 {
                    return Node::SingularStepLength;
                }
                if 0.5 * tr.dst0 <= cfg.initial_trust_radius {
                    return Node::Done;
                }
                Node::SingularStepLength
            }
            Node::SingularStepLength => {
                if 0.5 * tr.dstnrm <= cfg.initial_trust_radius {
                    return Node::RequestRecompute;
                }
                let xmax = cfg.initial_trust_radius / tr.dstnrm;
                if xmax * (2.0 - xmax) * tr.preduc >= self.emaxs {
                    return Node::Done;
                }
                Node::RequestRecompute
            }
            Node::RequestRecompute => {
                if tr.nreduc < 0.0 {
                    return Node::SingularTest;
                }
                a.gtslst = tr.gtstep;
                a.dstsav = tr.dstnrm;
                if st.irc == AssessCode::FalseConverged {
                    a.dstsav = -a.dstsav;
                }
                a.plstgd = tr.preduc;
                st.irc = AssessCode::RecomputeAtMaxRadius;
                a.stlstg.copy_from(&tr.step);
                Node::Done
            }
            Node::RecomputedReduction => {
                tr.gtstep = a.gtslst;
                tr.dstnrm = a.dstsav.abs();
                tr.step.copy_from(&a.stlstg);
                st.irc = a.xirc;
                if a.dstsav <= 0.0 {
                    st.irc = AssessCode::FalseConverged;
                }
                tr.nreduc = -tr.preduc;
                tr.preduc = a.plstgd;
                Node::SingularTest
            }
            Node::SingularTest => {
                if -tr.nreduc <= cfg.singular_tol * it.f0.abs() {
                    st.irc = AssessCode::SingularConverged;
                }
                Node::Done
            }
            Node::Done => Node::Done,
        }
    }
}

///////////////////////////////////////TESTS/////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::nl2sol::state::Model;
    use approx::assert_relative_eq;
    use nalgebra::{DVector, dvector};

    /// state after a trial step `step` from `x0 = (1, 1)` with `f0 = 10`
    fn trial_state(step: DVector<f64>, f: f64, preduc: f64, gtstep: f64, stppar: f64) -> SolverState {
        let mut st = SolverState::new(dvector![1.0, 1.0], 10.0, dvector![1.0, 1.0], 1.0);
        st.iterate.stglim = 2;
        st.begin_iteration();
        st.trial.dstnrm = step.norm();
        st.trial.step = step;
        st.trial.preduc = preduc;
        st.trial.gtstep = gtstep;
        st.trial.stppar = stppar;
        st.trial.nreduc = 2.0 * preduc;
        st.trial.dst0 = 2.0 * st.trial.dstnrm;
        st.place_trial();
        st.iterate.f = f;
        st
    }

    #[test]
    fn codes_round_trip() {
        for c in 1..=13 {
            assert_eq!(AssessCode::from_code(c).map(|a| a.code()), Some(c));
        }
        assert!(AssessCode::from_code(0).is_none());
        assert_eq!(AssessCode::XConverged.convergence(), Some(ConvergenceCode::XConverged));
        assert_eq!(AssessCode::RecomputeSameModel.convergence(), None);
    }

    #[test]
    fn bad_incoming_code() {
        let mut st = trial_state(dvector![0.1, 0.0], 9.0, 1.0, -2.0, 0.5);
        st.irc = AssessCode::BadInput;
        assert_eq!(assess(&mut st, &Nl2solConfig::default()), AssessCode::BadInput);
    }

    #[test]
    fn repeated_acceptance_keeps_best_point() {
        let cfg = Nl2solConfig::default();
        let mut st = trial_state(dvector![0.3, -0.2], 5.0, 6.0, -8.0, 0.5);
        st.irc = AssessCode::AcceptRadiusKnown;
        let first = assess(&mut st, &cfg);
        // fdif = 5 < 0.75·8: accept, keep radius
        assert_eq!(first, AssessCode::AcceptRadiusFromGradient);
        assert_relative_eq!(st.iterate.x, dvector![1.3, 0.8], epsilon = 1e-15);
        assert_eq!(st.iterate.f, 5.0);
        let second = assess(&mut st, &cfg);
        assert_eq!(second, first);
        assert_relative_eq!(st.iterate.x, dvector![1.3, 0.8], epsilon = 1e-15);
        assert_eq!(st.iterate.f, 5.0);
        assert!(st.iterate.f <= st.iterate.f0);
    }

    #[test]
    fn worse_longer_step_restores_saved_step() {
        let cfg = Nl2solConfig::default();
        let step1 = dvector![0.3, -0.2];
        // fdif = 7 >= 0.75·8 and not a Newton step: try a larger radius
        let mut st = trial_state(step1.clone(), 3.0, 6.0, -8.0, 0.5);
        st.irc = AssessCode::AcceptRadiusKnown;
        assert_eq!(assess(&mut st, &cfg), AssessCode::RecomputeSameModel);
        assert!(st.assess.radfac > 1.0);
        assert_eq!(st.assess.stlstg, step1);
        assert_eq!(st.assess.flstgd, 3.0);

        // the longer step is worse than the saved one
        st.trial.step = dvector![0.9, -0.6];
        st.trial.dstnrm = st.trial.step.norm();
        st.trial.preduc = 9.0;
        st.trial.gtstep = -12.0;
        st.place_trial();
        st.iterate.f = 8.0;
        let code = assess(&mut st, &cfg);
        assert_eq!(code, AssessCode::AcceptRadiusFromGradient);
        assert!(st.assess.restored);
        assert_eq!(st.iterate.f, 3.0);
        assert_relative_eq!(st.iterate.x, dvector![1.3, 0.8], epsilon = 1e-15);
        assert_eq!(st.trial.step, step1);
        assert_eq!(st.trial.preduc, 6.0);
    }

    #[test]
    fn trivial_decrease_switches_model_or_shrinks() {
        let cfg = Nl2solConfig::default();
        let mut st = trial_state(dvector![0.5, 0.5], 12.0, 1.0, -2.0, 0.5);
        st.irc = AssessCode::AcceptRadiusKnown;
        assert_eq!(assess(&mut st, &cfg), AssessCode::NeedNewModelOrSmallerStep);
        // x is put back at x0
        assert_eq!(st.iterate.x, st.iterate.x0);
        assert_eq!(st.iterate.f, 10.0);
        // f increased: Fletcher's factor 0.5·gts/(gts+fdif) = 0.5·2/4
        assert_relative_eq!(st.assess.radfac, 0.25, epsilon = 1e-15);

        let mut st = trial_state(dvector![0.5, 0.5], 12.0, 1.0, -2.0, 0.5);
        st.iterate.stglim = 1;
        st.irc = AssessCode::AcceptRadiusKnown;
        assert_eq!(assess(&mut st, &cfg), AssessCode::RecomputeSameModel);
        assert_eq!(st.assess.radinc, -1);
    }

    #[test]
    fn losing_new_model_is_switched_back() {
        let cfg = Nl2solConfig::default();
        // decrease far below prediction: ask for the other model
        let mut st = trial_state(dvector![0.2, 0.2], 9.5, 10.0, -12.0, 0.5);
        st.irc = AssessCode::AcceptRadiusKnown;
        assert_eq!(assess(&mut st, &cfg), AssessCode::NeedNewModelOrAccept);
        assert_eq!(st.assess.flstgd, 9.5);
        // the augmented model does worse
        st.iterate.model = Model::Augmented;
        st.trial.step = dvector![0.4, 0.1];
        st.trial.dstnrm = st.trial.step.norm();
        st.place_trial();
        st.iterate.f = 9.9;
        let code = assess(&mut st, &cfg);
        assert!(st.assess.switched);
        assert_eq!(st.iterate.model, Model::GaussNewton);
        assert_eq!(st.iterate.f, 9.5);
        assert_relative_eq!(st.iterate.x, dvector![1.2, 1.2], epsilon = 1e-15);
        assert_eq!(code, AssessCode::AcceptRadiusKnown);
    }

    #[test]
    fn oversized_step_shrinks_radius() {
        let cfg = Nl2solConfig::default();
        let mut st = trial_state(dvector![5.0, 5.0], f64::MAX, 1.0, -2.0, 0.5);
        st.iterate.toobig = true;
        st.irc = AssessCode::AcceptRadiusKnown;
        assert_eq!(assess(&mut st, &cfg), AssessCode::RecomputeSameModel);
        assert_eq!(st.assess.radfac, cfg.decrease_factor);
        assert_eq!(st.assess.stage, -1);
        // the smaller step evaluates: pick up as a new iteration
        st.iterate.toobig = false;
        st.trial.step = dvector![0.1, 0.1];
        st.trial.dstnrm = st.trial.step.norm();
        st.place_trial();
        st.iterate.f = 9.0;
        let code = assess(&mut st, &cfg);
        assert_eq!(st.assess.stage, 1);
        assert!(matches!(
            code,
            AssessCode::AcceptRadiusFromGradient | AssessCode::AcceptRadiusKnown
        ));
    }

    #[test]
    fn newton_step_with_tiny_move_is_x_convergence() {
        let cfg = Nl2solConfig::default();
        let mut st = trial_state(dvector![1e-10, 0.0], 10.0 - 1e-9, 1e-9, -2e-9, 0.0);
        // Newton reduction too large for relative convergence
        st.trial.nreduc = 1e-6;
        st.irc = AssessCode::AcceptRadiusKnown;
        assert_eq!(assess(&mut st, &cfg), AssessCode::XConverged);
    }

    #[test]
    fn small_newton_reduction_is_relative_convergence() {
        let cfg = Nl2solConfig::default();
        let mut st = trial_state(dvector![1e-3, 0.0], 10.0 - 1e-12, 1e-12, -2e-12, 0.0);
        st.trial.nreduc = 1e-12;
        st.irc = AssessCode::AcceptRadiusKnown;
        assert_eq!(assess(&mut st, &cfg), AssessCode::RelFuncConverged);
    }

    #[test]
    fn singular_convergence_needs_recomputed_reduction() {
        let cfg = Nl2solConfig::default();
        // no Newton step, tiny predicted reduction
        let mut st = trial_state(dvector![1e-3, 1e-3], 10.0 - 2e-12, 2e-12, -4e-12, 0.5);
        st.trial.dst0 = 0.0;
        st.trial.nreduc = 0.0;
        st.irc = AssessCode::AcceptRadiusKnown;
        assert_eq!(assess(&mut st, &cfg), AssessCode::RecomputeAtMaxRadius);
        let saved_step = st.trial.step.clone();

        // reduction predicted by a step of length initial_trust_radius
        st.trial.step = dvector![70.0, 70.0];
        st.trial.preduc = 5e-11;
        assert_eq!(assess(&mut st, &cfg), AssessCode::SingularConverged);
        assert_eq!(st.trial.step, saved_step);
        assert_eq!(st.trial.preduc, 2e-12);

        // a large reduction at the long step is not singular convergence
        let mut st = trial_state(dvector![1e-3, 1e-3], 10.0 - 2e-12, 2e-12, -4e-12, 0.5);
        st.trial.dst0 = 0.0;
        st.trial.nreduc = 0.0;
        st.irc = AssessCode::AcceptRadiusKnown;
        assert_eq!(assess(&mut st, &cfg), AssessCode::RecomputeAtMaxRadius);
        st.trial.preduc = 1.0;
        let code = assess(&mut st, &cfg);
        assert_ne!(code, AssessCode::SingularConverged);
        assert!(code.code() <= 5);
    }

    #[test]
    fn zero_length_saved_step_is_false_convergence() {
        let cfg = Nl2solConfig::default();
        let mut st = trial_state(dvector![1e-3, 1e-3], 10.0 - 2e-12, 2e-12, -4e-12, 0.5);
        st.trial.dst0 = 0.0;
        st.trial.nreduc = 0.0;
        st.irc = AssessCode::AcceptRadiusKnown;
        assert_eq!(assess(&mut st, &cfg), AssessCode::RecomputeAtMaxRadius);
        // +0.0 counts as non-positive just like the negated length
        st.assess.dstsav = 0.0;
        st.trial.preduc = 1.0;
        assert_eq!(assess(&mut st, &cfg), AssessCode::FalseConverged);
        assert_eq!(st.trial.dstnrm, 0.0);
    }

    #[test]
    fn negligible_move_without_decrease_is_false_convergence() {
        let cfg = Nl2solConfig::default();
        let mut st = trial_state(dvector![1e-15, 0.0], 10.0, 1.0, -2.0, 0.5);
        st.iterate.stglim = 1;
        st.irc = AssessCode::AcceptRadiusKnown;
        assert_eq!(assess(&mut st, &cfg), AssessCode::FalseConverged);
    }

    #[test]
    fn absolute_convergence() {
        let cfg = Nl2solConfig::default();
        let mut st = trial_state(dvector![0.1, 0.0], 1e-40, 20.0, -30.0, 0.5);
        st.irc = AssessCode::AcceptRadiusKnown;
        assert_eq!(assess(&mut st, &cfg), AssessCode::AbsFuncConverged);
    }
}
