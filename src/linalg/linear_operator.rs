//! Matrix-free operators and the summary every reduced-system solve reports.

use crate::error::LinAlgResult;
use crate::linalg::block_sparse::BlockSparseMatrix;
use std::fmt;

/// A linear map applied through products only.
///
/// Both products accumulate into `y`; callers zero `y` first when they want
/// the plain product.
pub trait LinearOperator {
    fn num_rows(&self) -> usize;
    fn num_cols(&self) -> usize;

    /// `y += A x`
    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()>;

    /// `y += Aᵗ x`
    fn left_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()>;
}

impl LinearOperator for BlockSparseMatrix {
    fn num_rows(&self) -> usize {
        BlockSparseMatrix::num_rows(self)
    }

    fn num_cols(&self) -> usize {
        BlockSparseMatrix::num_cols(self)
    }

    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        BlockSparseMatrix::right_multiply_and_accumulate(self, x, y)
    }

    fn left_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        BlockSparseMatrix::left_multiply_and_accumulate(self, x, y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverTermination {
    Success,
    /// Iteration budget exhausted or the operator turned out indefinite.
    NoConvergence,
    /// Numerical breakdown or a failed factorization.
    Failure,
}

impl fmt::Display for LinearSolverTermination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinearSolverTermination::Success => "SUCCESS",
            LinearSolverTermination::NoConvergence => "NO_CONVERGENCE",
            LinearSolverTermination::Failure => "FAILURE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearSolverSummary {
    pub termination: LinearSolverTermination,
    /// CG iterations; `1` for direct solves.
    pub num_iterations: usize,
    pub residual_norm: f64,
    pub message: String,
}

impl LinearSolverSummary {
    pub fn new(termination: LinearSolverTermination, message: impl Into<String>) -> Self {
        Self {
            termination,
            num_iterations: 0,
            residual_norm: 0.0,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.termination == LinearSolverTermination::Success
    }
}

impl fmt::Display for LinearSolverSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} iterations, |r| = {:.3e}: {}",
            self.termination, self.num_iterations, self.residual_norm, self.message
        )
    }
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}
