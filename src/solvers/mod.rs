//! Iterative linear solvers

pub mod cg;

pub use cg::cg_solve;
