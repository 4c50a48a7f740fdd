//! Logger set-up for the solvers and a pretty-printed summary of a fit.
use chrono::Local;
use simplelog::{
    ColorChoice, CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::fs::File;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::numerical::nl2sol::report::{CovarianceStatus, FitReport, Nl2solError};

/// Level names accepted in `Nl2solConfig::loglevel`.
pub fn parse_level(level: &str) -> Result<LevelFilter, Nl2solError> {
    match level {
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warn" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        "off" | "none" => Ok(LevelFilter::Off),
        other => Err(Nl2solError::InvalidConfig(format!(
            "loglevel must be debug, info, warn, error, off or none, got {:?}",
            other
        ))),
    }
}

/// Install a terminal logger, plus a `log_<date>.txt` file logger when
/// `to_file` is set. A logger installed earlier stays in place.
pub fn init_logger(level: LevelFilter, to_file: bool) {
    if level == LevelFilter::Off {
        return;
    }
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if to_file {
        let date_and_time = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let name = format!("log_{}.txt", date_and_time);
        match File::create(&name) {
            Ok(file) => loggers.push(WriteLogger::new(level, Config::default(), file)),
            Err(e) => eprintln!("cannot create log file {}: {}", name, e),
        }
    }
    let _ = CombinedLogger::init(loggers);
}

#[derive(Tabled)]
struct SummaryRow {
    key: &'static str,
    value: String,
}

/// Table of the counters and outcome of a fit.
pub fn fit_summary(report: &FitReport) -> String {
    let covariance = match &report.covariance {
        CovarianceStatus::NotRequested => "not requested".to_string(),
        CovarianceStatus::Computed(_) => "computed".to_string(),
        CovarianceStatus::NotComputed(reason) => format!("not computed ({})", reason),
    };
    let rows = vec![
        SummaryRow {
            key: "outcome",
            value: format!("{} ({})", report.code, report.code.code()),
        },
        SummaryRow {
            key: "iterations",
            value: report.iterations.to_string(),
        },
        SummaryRow {
            key: "function evaluations",
            value: report.function_evals.to_string(),
        },
        SummaryRow {
            key: "gradient evaluations",
            value: report.gradient_evals.to_string(),
        },
        SummaryRow {
            key: "f",
            value: format!("{:e}", report.objective),
        },
        SummaryRow {
            key: "chi squared",
            value: format!("{:e}", report.chi_squared),
        },
        SummaryRow {
            key: "model",
            value: report.model.to_string(),
        },
        SummaryRow {
            key: "covariance",
            value: covariance,
        },
    ];
    let mut table = Table::new(&rows);
    table.with(Style::modern_rounded());
    table.to_string()
}

///////////////////////////////////////TESTS/////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::nl2sol::report::{ConvergenceCode, CovarianceFailure};
    use crate::numerical::nl2sol::state::Model;
    use nalgebra::dvector;

    #[test]
    fn levels_are_parsed() {
        assert_eq!(parse_level("debug"), Ok(LevelFilter::Debug));
        assert_eq!(parse_level("warn"), Ok(LevelFilter::Warn));
        assert_eq!(parse_level("none"), Ok(LevelFilter::Off));
        assert!(matches!(parse_level("loud"), Err(Nl2solError::InvalidConfig(_))));
    }

    #[test]
    fn summary_lists_outcome_and_counters() {
        let report = FitReport {
            params: dvector![1.0, 2.0],
            code: ConvergenceCode::RelFuncConverged,
            iterations: 7,
            function_evals: 9,
            gradient_evals: 8,
            objective: 0.25,
            chi_squared: 0.5,
            residuals: dvector![0.5, -0.5],
            scale: dvector![1.0, 1.0],
            model: Model::Augmented,
            covariance: CovarianceStatus::NotComputed(CovarianceFailure::HessianIndefinite),
        };
        let table = fit_summary(&report);
        assert!(table.contains("RelFuncConverged (8)"));
        assert!(table.contains("function evaluations"));
        assert!(table.contains("Augmented"));
        assert!(table.contains("HessianIndefinite"));
    }
}
