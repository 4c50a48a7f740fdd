//! Structured secant update of the second-order part `S ≈ Σ rᵢ∇²rᵢ` of the
//! least-squares Hessian (Dennis, Gay and Welsch), used by the augmented model
//! `H = JᵀJ + S`.
use log::debug;
use nalgebra::DVector;

use crate::somelinalg::packed_cholesky::PackedSymmetric;
use crate::somelinalg::vector_kernels::euclidean_norm;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SecantOutcome {
    /// `S` was sized by `tau` and updated
    Updated { tau: f64 },
    /// `sᵀy` too small compared with `‖s‖·‖y‖`; `S` was only sized
    Skipped { tau: f64 },
}

/// Update `S` so that `S₊·step = y_sharp`.
///
/// `y = g₊ − g` is the change of the gradient and `y_sharp = (J₊ − J)ᵀr₊`.
/// `S` is first multiplied by `tau = min(1, |stepᵀy_sharp| / |stepᵀS step|)`.
pub fn dgw_update(
    s_mat: &mut PackedSymmetric,
    step: &DVector<f64>,
    y: &DVector<f64>,
    y_sharp: &DVector<f64>,
    cosine_min: f64,
) -> SecantOutcome {
    let s_step = s_mat.mul_vec(step);
    let sss = step.dot(&s_step);
    let tau = if sss == 0.0 {
        1.0
    } else {
        (step.dot(y_sharp).abs() / sss.abs()).min(1.0)
    };
    if tau < 1.0 {
        s_mat.scale(tau);
    }
    let sty = step.dot(y);
    if sty.abs() <= cosine_min * euclidean_norm(step.as_slice()) * euclidean_norm(y.as_slice()) {
        debug!("secant update skipped: sᵀy = {:e}", sty);
        return SecantOutcome::Skipped { tau };
    }
    let w = y_sharp - s_step * tau;
    let stw = step.dot(&w);
    s_mat.symmetric_rank_two_update(1.0 / sty, &w, y);
    s_mat.symmetric_rank_two_update(-0.5 * stw / (sty * sty), y, y);
    SecantOutcome::Updated { tau }
}

/// `‖D⁻¹(y − H·step)‖`: how badly a model Hessian predicted the gradient change.
pub fn gradient_misfit(
    h: &PackedSymmetric,
    step: &DVector<f64>,
    y: &DVector<f64>,
    d: &DVector<f64>,
) -> f64 {
    let misfit = (y - h.mul_vec(step)).component_div(d);
    euclidean_norm(misfit.as_slice())
}
