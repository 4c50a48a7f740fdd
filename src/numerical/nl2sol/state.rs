//! Working state of one fit, grouped by lifetime: counters and the iterate live
//! for the whole fit, the trial step is rewritten by every step computation and
//! the assessment memory spans one outer iteration.
use nalgebra::DVector;
use strum_macros::Display;

use crate::numerical::nl2sol::assess::AssessCode;
use crate::numerical::nl2sol::gqtstp::GqtstpMemory;

/// Quadratic model of `f` used to compute the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Model {
    /// `H = JᵀJ`
    GaussNewton,
    /// `H = JᵀJ + S`, `S` from the structured secant update
    Augmented,
}

impl Model {
    pub fn other(self) -> Model {
        match self {
            Model::GaussNewton => Model::Augmented,
            Model::Augmented => Model::GaussNewton,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Counters {
    pub iterations: usize,
    pub function_evals: usize,
    pub gradient_evals: usize,
}

/// Current point, the point the iteration started from and the trust region.
#[derive(Debug, Clone, PartialEq)]
pub struct Iterate {
    pub x: DVector<f64>,
    pub x0: DVector<f64>,
    pub f: f64,
    pub f0: f64,
    pub d: DVector<f64>,
    pub radius: f64,
    pub model: Model,
    /// number of models that may be tried per iteration
    pub stglim: i32,
    /// the last trial could not be evaluated or overflowed
    pub toobig: bool,
}

/// The trial step and the quadratic model's verdict on it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialStep {
    pub step: DVector<f64>,
    /// `‖D·step‖`
    pub dstnrm: f64,
    /// `gᵀstep`
    pub gtstep: f64,
    /// predicted reduction of f
    pub preduc: f64,
    /// reduction predicted by the full Newton step, 0 if there is none
    pub nreduc: f64,
    /// Marquardt parameter, 0 for a Newton step, negative after the special case
    pub stppar: f64,
    /// `‖D·newton step‖`, or minus a lower bound on the Marquardt parameter when
    /// the Hessian is not positive definite
    pub dst0: f64,
}

impl TrialStep {
    pub fn zeros(p: usize) -> Self {
        Self {
            step: DVector::zeros(p),
            dstnrm: 0.0,
            gtstep: 0.0,
            preduc: 0.0,
            nreduc: 0.0,
            stppar: 0.0,
            dst0: 0.0,
        }
    }
}

/// Memory of the step assessment within one outer iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessMemory {
    pub stage: i32,
    pub radinc: i32,
    /// the accepted point is not the last trial
    pub restored: bool,
    /// the model was switched back by the last assessment
    pub switched: bool,
    /// code to resume from
    pub xirc: AssessCode,
    /// model of the best step so far
    pub mlstgd: Model,
    /// f at the best step so far
    pub flstgd: f64,
    /// its predicted reduction
    pub plstgd: f64,
    /// its `gᵀstep`
    pub gtslst: f64,
    /// its scaled length, negative to flag a pending false convergence
    pub dstsav: f64,
    /// the best step so far
    pub stlstg: DVector<f64>,
    /// relative change of x of the accepted step
    pub reldx: f64,
    /// `f0 - f`
    pub fdif: f64,
    /// factor for the next trust radius
    pub radfac: f64,
}

impl AssessMemory {
    pub fn new(p: usize) -> Self {
        Self {
            stage: 0,
            radinc: 0,
            restored: false,
            switched: false,
            xirc: AssessCode::AcceptRadiusKnown,
            mlstgd: Model::GaussNewton,
            flstgd: 0.0,
            plstgd: 0.0,
            gtslst: 0.0,
            dstsav: 0.0,
            stlstg: DVector::zeros(p),
            reldx: 0.0,
            fdif: 0.0,
            radfac: 1.0,
        }
    }
}

/// Everything one fit mutates. Each fit owns its own instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverState {
    pub counters: Counters,
    pub iterate: Iterate,
    pub trial: TrialStep,
    pub assess: AssessMemory,
    pub gqt: GqtstpMemory,
    /// last assessment code, also the input of the next assessment
    pub irc: AssessCode,
}

impl SolverState {
    pub fn new(x: DVector<f64>, f: f64, d: DVector<f64>, radius: f64) -> Self {
        let p = x.len();
        Self {
            counters: Counters::default(),
            iterate: Iterate {
                x0: x.clone(),
                x,
                f,
                f0: f,
                d,
                radius,
                model: Model::GaussNewton,
                stglim: 1,
                toobig: false,
            },
            trial: TrialStep::zeros(p),
            assess: AssessMemory::new(p),
            gqt: GqtstpMemory::new(),
            irc: AssessCode::AcceptRadiusKnown,
        }
    }

    /// Start an outer iteration from the current point.
    pub fn begin_iteration(&mut self) {
        self.iterate.x0.copy_from(&self.iterate.x);
        self.iterate.f0 = self.iterate.f;
        self.iterate.toobig = false;
        self.gqt.reset();
    }

    /// Place the trial point `x0 + step`.
    pub fn place_trial(&mut self) {
        self.iterate.x = &self.iterate.x0 + &self.trial.step;
    }
}
