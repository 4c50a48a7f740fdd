//! Box constraints `lower <= x <= upper`, enforced by projection.
use nalgebra::DVector;

use crate::numerical::nl2sol::report::Nl2solError;
use crate::numerical::nl2sol::state::TrialStep;
use crate::somelinalg::packed_cholesky::PackedSymmetric;
use crate::somelinalg::vector_kernels::euclidean_norm;

#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    lower: DVector<f64>,
    upper: DVector<f64>,
}

impl Bounds {
    /// `None` when neither side is given; a missing side is unbounded.
    pub fn new(
        p: usize,
        lower: Option<&DVector<f64>>,
        upper: Option<&DVector<f64>>,
    ) -> Result<Option<Self>, Nl2solError> {
        if lower.is_none() && upper.is_none() {
            return Ok(None);
        }
        let side = |v: Option<&DVector<f64>>, what: &'static str, fill: f64| match v {
            Some(v) if v.len() != p => Err(Nl2solError::DimensionMismatch {
                what,
                expected: p,
                found: v.len(),
            }),
            Some(v) => Ok(v.clone()),
            None => Ok(DVector::from_element(p, fill)),
        };
        let lower = side(lower, "lower bounds", f64::NEG_INFINITY)?;
        let upper = side(upper, "upper bounds", f64::INFINITY)?;
        for i in 0..p {
            if lower[i].is_nan() || upper[i].is_nan() || lower[i] > upper[i] {
                return Err(Nl2solError::InvalidBounds { index: i });
            }
        }
        Ok(Some(Self { lower, upper }))
    }

    pub fn project(&self, x: &mut DVector<f64>) {
        for i in 0..x.len() {
            x[i] = x[i].clamp(self.lower[i], self.upper[i]);
        }
    }

    /// Clamp `x0 + step` into the box and rewrite the trial quantities for the
    /// clamped step. Returns whether anything was clamped.
    ///
    /// A step that projects to zero is reported as a zero-length Newton step.
    pub fn constrain_trial(
        &self,
        x0: &DVector<f64>,
        g: &DVector<f64>,
        h: &PackedSymmetric,
        d: &DVector<f64>,
        trial: &mut TrialStep,
    ) -> bool {
        let mut x = x0 + &trial.step;
        self.project(&mut x);
        let step = x - x0;
        if step == trial.step {
            return false;
        }
        trial.dstnrm = euclidean_norm(step.component_mul(d).as_slice());
        trial.gtstep = g.dot(&step);
        trial.preduc = (-(trial.gtstep + 0.5 * h.quadratic_form(&step))).max(0.0);
        if trial.dstnrm == 0.0 {
            trial.stppar = 0.0;
            trial.nreduc = 0.0;
            trial.dst0 = 0.0;
            trial.preduc = 0.0;
        }
        trial.step = step;
        true
    }
}

///////////////////////////////////////TESTS/////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn validation() {
        assert_eq!(Bounds::new(2, None, None), Ok(None));
        let bad = Bounds::new(2, Some(&dvector![0.0, 2.0]), Some(&dvector![1.0, 1.0]));
        assert_eq!(bad, Err(Nl2solError::InvalidBounds { index: 1 }));
        let nan = Bounds::new(1, Some(&dvector![f64::NAN]), None);
        assert_eq!(nan, Err(Nl2solError::InvalidBounds { index: 0 }));
        let short = Bounds::new(2, None, Some(&dvector![1.0]));
        assert!(matches!(short, Err(Nl2solError::DimensionMismatch { .. })));
    }

    #[test]
    fn trial_is_clamped_and_rescored() {
        let b = Bounds::new(2, Some(&dvector![0.0, 0.0]), None).unwrap().unwrap();
        let x0 = dvector![0.5, 1.0];
        let g = dvector![1.0, 1.0];
        let h = PackedSymmetric::from_dense(&dmatrix![1.0, 0.0; 0.0, 1.0]);
        let d = dvector![1.0, 1.0];
        let mut trial = TrialStep::zeros(2);
        trial.step = dvector![-1.0, -0.5];
        trial.stppar = 0.3;
        assert!(b.constrain_trial(&x0, &g, &h, &d, &mut trial));
        assert_eq!(trial.step, dvector![-0.5, -0.5]);
        assert_relative_eq!(trial.dstnrm, 0.5_f64.sqrt());
        assert_relative_eq!(trial.gtstep, -1.0);
        // −(gᵀs + ½sᵀs) = 1 − 0.25
        assert_relative_eq!(trial.preduc, 0.75);
        assert_eq!(trial.stppar, 0.3);

        // nothing to clamp
        assert!(!b.constrain_trial(&x0, &g, &h, &d, &mut trial));
    }

    #[test]
    fn step_into_active_bound_becomes_newton_step() {
        let b = Bounds::new(1, Some(&dvector![1.0]), Some(&dvector![2.0])).unwrap().unwrap();
        let x0 = dvector![1.0];
        let mut trial = TrialStep::zeros(1);
        trial.step = dvector![-0.4];
        trial.stppar = 0.7;
        trial.nreduc = 0.2;
        trial.dst0 = -1.0;
        let h = PackedSymmetric::from_dense(&dmatrix![1.0]);
        assert!(b.constrain_trial(&x0, &dvector![1.0], &h, &dvector![1.0], &mut trial));
        assert_eq!(trial.step, dvector![0.0]);
        assert_eq!((trial.stppar, trial.preduc, trial.nreduc, trial.dst0), (0.0, 0.0, 0.0, 0.0));
    }
}
