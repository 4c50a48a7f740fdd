//! some linear algebra functions used by the least squares solver
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
/// Cholesky factorization, triangular solves and inversion in packed storage
pub mod packed_cholesky;
/// Householder QR with column pivoting and rank detection
pub mod pivoted_qr;
/// machine constants, safe dot product and Euclidean norm
pub mod vector_kernels;
