//! Scale vector `D` of the trust region `‖D·step‖ <= radius`.
use nalgebra::{DMatrix, DVector};

use crate::numerical::nl2sol::config::{Nl2solConfig, ScaleMode};
use crate::somelinalg::packed_cholesky::PackedSymmetric;
use crate::somelinalg::vector_kernels::enorm;

/// `D` before the first Jacobian is known.
pub fn initial_scale(p: usize, mode: &ScaleMode) -> DVector<f64> {
    match mode {
        ScaleMode::Fixed(Some(d)) => d.clone(),
        ScaleMode::Fixed(None) | ScaleMode::Adaptive => DVector::from_element(p, 1.0),
    }
}

/// Recompute `D` from the Jacobian column norms, once per outer iteration.
///
/// `d[i] = max(decay·d[i], sqrt(‖J[:,i]‖² + max(S_ii, 0)))`; an entry below
/// `scale_floor` is replaced by `max(scale_reset, scale_floor)`. On the first
/// iteration the decay term is dropped. Fixed scales are left alone.
pub fn update_scale(
    d: &mut DVector<f64>,
    jacobian: &DMatrix<f64>,
    second_order: Option<&PackedSymmetric>,
    first_iteration: bool,
    config: &Nl2solConfig,
) {
    if !matches!(config.scale_mode, ScaleMode::Adaptive) {
        return;
    }
    let decay = if first_iteration {
        0.0
    } else {
        config.scale_decay
    };
    for (i, column) in jacobian.column_iter().enumerate() {
        let jnorm = enorm(&column);
        let sii = second_order.map_or(0.0, |s| s.get(i, i).max(0.0));
        let mut t = (jnorm * jnorm + sii).sqrt().max(decay * d[i]);
        if t < config.scale_floor {
            t = config.scale_reset.max(config.scale_floor);
        }
        d[i] = t;
    }
}

///////////////////////////////////////TESTS/////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn adaptive_scale_tracks_column_norms() {
        let config = Nl2solConfig::default();
        let j = dmatrix![3.0, 0.0; 4.0, 0.0; 0.0, 1e-9];
        let mut d = initial_scale(2, &config.scale_mode);
        assert_eq!(d, dvector![1.0, 1.0]);
        update_scale(&mut d, &j, None, true, &config);
        // the second column is below the floor: reset to 1
        assert_relative_eq!(d, dvector![5.0, 1.0]);

        // shrinking columns decay geometrically
        let j2 = dmatrix![0.3, 0.0; 0.4, 0.0; 0.0, 2.0];
        update_scale(&mut d, &j2, None, false, &config);
        assert_relative_eq!(d, dvector![3.0, 2.0], epsilon = 1e-15);
    }

    #[test]
    fn second_order_term_enters_scale() {
        let config = Nl2solConfig::default();
        let j = dmatrix![3.0; 0.0];
        let s = PackedSymmetric::from_dense(&dmatrix![16.0]);
        let mut d = dvector![1.0];
        update_scale(&mut d, &j, Some(&s), true, &config);
        assert_relative_eq!(d[0], 5.0);
        // negative diagonal of S is ignored
        let s = PackedSymmetric::from_dense(&dmatrix![-16.0]);
        update_scale(&mut d, &j, Some(&s), true, &config);
        assert_relative_eq!(d[0], 3.0);
    }

    #[test]
    fn fixed_scale_is_kept() {
        let config = Nl2solConfig::default().with_scale_mode(ScaleMode::Fixed(Some(dvector![2.0, 3.0])));
        let mut d = initial_scale(2, &config.scale_mode);
        update_scale(&mut d, &dmatrix![1.0, 1.0], None, true, &config);
        assert_eq!(d, dvector![2.0, 3.0]);
    }
}
