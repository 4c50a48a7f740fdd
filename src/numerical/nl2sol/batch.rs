//! Many independent fits at once, one rayon task per fit.
//!
//! Each fit owns its problem and its solver state, so nothing is shared
//! between tasks except the read-only configuration.
use nalgebra::DVector;
use rayon::prelude::*;

use crate::numerical::nl2sol::config::Nl2solConfig;
use crate::numerical::nl2sol::driver::fit;
use crate::numerical::nl2sol::problem::ResidualProblem;
use crate::numerical::nl2sol::report::{FitReport, Nl2solError};

/// One fit of a batch.
pub struct FitJob<P> {
    pub problem: P,
    pub initial: DVector<f64>,
    pub lower: Option<DVector<f64>>,
    pub upper: Option<DVector<f64>>,
}

impl<P> FitJob<P> {
    pub fn new(problem: P, initial: DVector<f64>) -> Self {
        Self {
            problem,
            initial,
            lower: None,
            upper: None,
        }
    }

    #[must_use]
    pub fn with_bounds(self, lower: Option<DVector<f64>>, upper: Option<DVector<f64>>) -> Self {
        Self {
            lower,
            upper,
            ..self
        }
    }
}

/// Run every job in parallel. Results are in job order.
pub fn fit_batch<P>(jobs: Vec<FitJob<P>>, config: &Nl2solConfig) -> Vec<Result<FitReport, Nl2solError>>
where
    P: ResidualProblem + Send,
{
    jobs.into_par_iter()
        .map(|mut job| {
            fit(
                &mut job.problem,
                &job.initial,
                job.lower.as_ref(),
                job.upper.as_ref(),
                config,
            )
        })
        .collect()
}
