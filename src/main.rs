#![allow(non_snake_case)]
use nalgebra::{DMatrix, DVector, dvector};
use rusted_nl2sol::Utils::logger::fit_summary;
use rusted_nl2sol::numerical::nl2sol::{
    ClosureProblem, ConvergenceCode, EvaluationFailure, FiniteDifferenceJacobian, FitJob,
    Nl2solConfig, fit, fit_batch,
};

/// decay curve y = a·exp(b·t) + c with a small deterministic wobble
fn decay_data(a: f64, b: f64, c: f64) -> (DVector<f64>, DVector<f64>) {
    let t = DVector::from_fn(40, |i, _| i as f64 * 0.25);
    let y = DVector::from_fn(40, |i, _| {
        a * (b * t[i]).exp() + c + 0.01 * (1.7 * i as f64).sin()
    });
    (t, y)
}

fn decay_residuals(
    t: DVector<f64>,
    y: DVector<f64>,
) -> impl Send + FnMut(&DVector<f64>) -> Result<DVector<f64>, EvaluationFailure> {
    move |x: &DVector<f64>| {
        Ok(DVector::from_fn(t.len(), |i, _| {
            x[0] * (x[1] * t[i]).exp() + x[2] - y[i]
        }))
    }
}

fn main() {
    let example = 0;
    match example {
        0 => {
            // analytic Jacobian, info-level log and a summary table
            let (t, y) = decay_data(3.0, -0.8, 0.5);
            let tj = t.clone();
            let mut problem = ClosureProblem::new(decay_residuals(t, y), move |x: &DVector<f64>| {
                Ok(DMatrix::from_fn(tj.len(), 3, |i, k| {
                    let e = (x[1] * tj[i]).exp();
                    match k {
                        0 => e,
                        1 => x[0] * tj[i] * e,
                        _ => 1.0,
                    }
                }))
            });
            let config = Nl2solConfig::default().with_loglevel(Some("info"));
            match fit(&mut problem, &dvector![1.0, -0.3, 0.0], None, None, &config) {
                Ok(report) => {
                    println!("params = {}", report.params);
                    if let Some(cov) = report.covariance.matrix() {
                        println!("covariance = {}", cov);
                    }
                }
                Err(e) => println!("fit failed: {}", e),
            }
        }
        1 => {
            // forward-difference Jacobian with the offset held in [0, 0.3]
            let (t, y) = decay_data(3.0, -0.8, 0.5);
            let config = Nl2solConfig::default();
            let mut problem = FiniteDifferenceJacobian::from_config(decay_residuals(t, y), &config);
            let lower = dvector![f64::NEG_INFINITY, f64::NEG_INFINITY, 0.0];
            let upper = dvector![f64::INFINITY, f64::INFINITY, 0.3];
            match fit(&mut problem, &dvector![1.0, -0.3, 0.0], Some(&lower), Some(&upper), &config) {
                Ok(report) => {
                    println!("{}", fit_summary(&report));
                    println!("params = {}", report.params);
                }
                Err(e) => println!("fit failed: {}", e),
            }
        }
        2 => {
            // a batch of curves fitted in parallel
            let jobs: Vec<_> = (1..=8)
                .map(|k| {
                    let (t, y) = decay_data(k as f64, -0.1 * k as f64, 0.2);
                    FitJob::new(
                        FiniteDifferenceJacobian::new(decay_residuals(t, y)),
                        dvector![1.0, -0.5, 0.0],
                    )
                })
                .collect();
            let config = Nl2solConfig::default().with_covariance(None);
            for (k, result) in fit_batch(jobs, &config).iter().enumerate() {
                match result {
                    Ok(report) if report.code != ConvergenceCode::FalseConverged => {
                        println!("curve {}: {} {}", k + 1, report.code, report.params.transpose())
                    }
                    Ok(report) => println!("curve {}: suspicious fit, {}", k + 1, report.code),
                    Err(e) => println!("curve {}: {}", k + 1, e),
                }
            }
        }
        _ => println!("no such example"),
    }
}
