// Copyright (c)  by Gleb E. Zaslavkiy
//MIT License
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
//! Adaptive nonlinear least squares (NL2SOL).
//!
//! * [`numerical::nl2sol`]: the solver, its configuration, problem trait and report
//! * [`somelinalg`]: packed Cholesky, pivoted QR and the vector kernels they share
//! * [`Utils`]: logger set-up and the fit summary table
pub mod Utils;
pub mod numerical;
pub mod somelinalg;
