//! Preconditioners for conjugate gradients on the reduced system.
//!
//! Every preconditioner is a [`LinearOperator`] approximating `S⁻¹` and
//! accumulates into its output.

use crate::error::{LinAlgError, LinAlgResult};
use crate::linalg::block_diagonal::BlockDiagonalMatrix;
use crate::linalg::block_random_access::BlockRandomAccessDiagonalMatrix;
use crate::linalg::block_sparse::BlockSparseMatrix;
use crate::linalg::block_structure::CompressedRowBlockStructure;
use crate::linalg::implicit_schur::ImplicitSchurComplement;
use crate::linalg::linear_operator::{LinearOperator, norm};
use crate::linalg::schur_eliminator::{SchurEliminatorBase, create_schur_eliminator};
use crate::linalg::schur_solver::LinearSolverOptions;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PreconditionerType {
    Identity,
    /// Inverse of the block diagonal of FᵗF (plus `D_f²`).
    #[default]
    Jacobi,
    /// Inverse of the block diagonal of S, formed by explicit elimination.
    SchurJacobi,
    /// Truncated series `Σ_k ((FᵗF)⁻¹ FᵗE (EᵗE)⁻¹ EᵗF)^k (FᵗF)⁻¹`.
    SchurPowerSeriesExpansion,
}

#[derive(Debug, Clone, Copy)]
pub struct IdentityPreconditioner {
    num_rows: usize,
}

impl IdentityPreconditioner {
    pub fn new(num_rows: usize) -> Self {
        Self { num_rows }
    }
}

impl LinearOperator for IdentityPreconditioner {
    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn num_cols(&self) -> usize {
        self.num_rows
    }

    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        LinAlgError::check_len("x", self.num_rows, x.len())?;
        LinAlgError::check_len("y", self.num_rows, y.len())?;
        y.iter_mut().zip(x).for_each(|(y_i, x_i)| *y_i += x_i);
        Ok(())
    }

    fn left_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        self.right_multiply_and_accumulate(x, y)
    }
}

/// Applies an already inverted block diagonal.
#[derive(Debug, Clone, Copy)]
pub struct BlockJacobiPreconditioner<'m> {
    inverse: &'m BlockDiagonalMatrix,
}

impl<'m> BlockJacobiPreconditioner<'m> {
    pub fn new(inverse: &'m BlockDiagonalMatrix) -> Self {
        Self { inverse }
    }
}

impl LinearOperator for BlockJacobiPreconditioner<'_> {
    fn num_rows(&self) -> usize {
        self.inverse.num_rows()
    }

    fn num_cols(&self) -> usize {
        self.inverse.num_rows()
    }

    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        self.inverse.right_multiply_and_accumulate(x, y)
    }

    fn left_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        self.inverse.right_multiply_and_accumulate(x, y)
    }
}

/// Inverse of the block diagonal of the Schur complement.
///
/// The diagonal blocks are produced by an eliminator writing into a
/// [`BlockRandomAccessDiagonalMatrix`], so off-diagonal cells of S are never
/// formed.
#[derive(Debug)]
pub struct SchurJacobiPreconditioner {
    eliminator: Box<dyn SchurEliminatorBase>,
    m: BlockRandomAccessDiagonalMatrix,
    /// Unused reduced rhs; elimination runs without `b`.
    rhs: Vec<f64>,
}

impl SchurJacobiPreconditioner {
    pub fn new(options: &LinearSolverOptions, bs: &CompressedRowBlockStructure) -> LinAlgResult<Self> {
        let n = options.num_eliminate_blocks;
        if n > bs.cols.len() {
            return Err(LinAlgError::InvalidInput(format!(
                "{n} eliminate blocks requested, the matrix has {} column blocks",
                bs.cols.len()
            )));
        }
        let eliminator = create_schur_eliminator(&options.eliminator_options(), bs)?;
        let f_block_sizes: Vec<usize> = bs.cols[n..].iter().map(|c| c.size).collect();
        debug!(
            "Schur-Jacobi preconditioner over {} F-blocks",
            f_block_sizes.len()
        );
        Ok(Self {
            eliminator,
            rhs: vec![0.0; f_block_sizes.iter().sum()],
            m: BlockRandomAccessDiagonalMatrix::new(&f_block_sizes),
        })
    }

    /// Recompute the preconditioner for new values of `a` and `d`.
    pub fn update(&mut self, a: &BlockSparseMatrix, d: Option<&[f64]>) -> LinAlgResult<()> {
        self.eliminator
            .eliminate(a, None, d, &mut self.m, &mut self.rhs)?;
        self.m.invert(true);
        Ok(())
    }

    pub fn matrix(&self) -> &BlockRandomAccessDiagonalMatrix {
        &self.m
    }
}

impl LinearOperator for SchurJacobiPreconditioner {
    fn num_rows(&self) -> usize {
        self.rhs.len()
    }

    fn num_cols(&self) -> usize {
        self.rhs.len()
    }

    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        self.m.right_multiply_and_accumulate(x, y)
    }

    fn left_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        self.m.right_multiply_and_accumulate(x, y)
    }
}

/// Truncated power series of `S⁻¹` around the block diagonal of FᵗF.
///
/// With `M` the block diagonal of FᵗF (plus `D_f²`) and `N = FᵗE (EᵗE)⁻¹ EᵗF`,
/// `S = M - N` and `S⁻¹ = Σ_k (M⁻¹ N)^k M⁻¹`. Terms are added until one is
/// smaller than `spse_tolerance` times the first, after at least
/// `min_iterations` and at most `max_iterations` terms.
#[derive(Debug, Clone, Copy)]
pub struct PowerSeriesPreconditioner<'i, 'a> {
    isc: &'i ImplicitSchurComplement<'a>,
    spse_tolerance: f64,
    min_iterations: usize,
    max_iterations: usize,
}

impl<'i, 'a> PowerSeriesPreconditioner<'i, 'a> {
    pub fn new(
        isc: &'i ImplicitSchurComplement<'a>,
        spse_tolerance: f64,
        min_iterations: usize,
        max_iterations: usize,
    ) -> Self {
        Self {
            isc,
            spse_tolerance,
            min_iterations,
            max_iterations,
        }
    }
}

impl LinearOperator for PowerSeriesPreconditioner<'_, '_> {
    fn num_rows(&self) -> usize {
        self.isc.num_cols_f()
    }

    fn num_cols(&self) -> usize {
        self.isc.num_cols_f()
    }

    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        let n = self.num_rows();
        LinAlgError::check_len("x", n, x.len())?;
        LinAlgError::check_len("y", n, y.len())?;
        let ftf_inverse = self.isc.block_diagonal_ftf_inverse().ok_or_else(|| {
            LinAlgError::InvalidState(
                "power series preconditioner needs the FᵗF inverse".to_string(),
            )
        })?;

        let mut previous = vec![0.0; n];
        ftf_inverse.right_multiply_and_accumulate(x, &mut previous)?;
        y.iter_mut().zip(&previous).for_each(|(y_i, t)| *y_i += t);
        let threshold = self.spse_tolerance * norm(&previous);

        let mut term = vec![0.0; n];
        let mut num_terms = 1;
        while num_terms < self.max_iterations {
            term.fill(0.0);
            self.isc
                .inverse_power_series_operator_right_multiply_accumulate(&previous, &mut term)?;
            y.iter_mut().zip(&term).for_each(|(y_i, t)| *y_i += t);
            num_terms += 1;
            if num_terms > self.min_iterations && norm(&term) < threshold {
                break;
            }
            std::mem::swap(&mut previous, &mut term);
        }
        trace!("power series preconditioner used {} terms", num_terms);
        Ok(())
    }

    fn left_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        self.right_multiply_and_accumulate(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::synthetic::{SyntheticProblem, SyntheticProblemOptions, generate_problem};
    use crate::parallel::ParallelContext;
    use nalgebra::{DMatrix, DVector};

    fn problem() -> SyntheticProblem {
        let options = SyntheticProblemOptions::new()
            .with_points(10)
            .with_cameras(3)
            .with_observations_per_point(2)
            .with_camera_priors(2);
        generate_problem(&options).unwrap()
    }

    fn apply(op: &dyn LinearOperator, x: &[f64]) -> Vec<f64> {
        let mut y = vec![0.0; x.len()];
        op.right_multiply_and_accumulate(x, &mut y).unwrap();
        y
    }

    #[test]
    fn test_identity() {
        let op = IdentityPreconditioner::new(3);
        assert_eq!(apply(&op, &[1.0, 2.0, 3.0]), vec![1.0, 2.0, 3.0]);
        assert!(op.right_multiply_and_accumulate(&[1.0], &mut [0.0]).is_err());
    }

    #[test]
    fn test_schur_jacobi_inverts_diagonal_blocks_of_s() {
        let problem = problem();
        let d = Some(problem.d.as_slice());
        for threads in [1, 2] {
            let options = LinearSolverOptions::new(problem.num_eliminate_blocks)
                .with_context(ParallelContext::new(threads).unwrap());
            let mut preconditioner =
                SchurJacobiPreconditioner::new(&options, problem.matrix.block_structure()).unwrap();
            preconditioner.update(&problem.matrix, d).unwrap();

            let (s, _) = problem.dense_schur_complement(d).unwrap();
            let nf = s.nrows();
            let mut block_diagonal = DMatrix::zeros(nf, nf);
            for start in (0..nf).step_by(9) {
                block_diagonal
                    .view_mut((start, start), (9, 9))
                    .copy_from(&s.view((start, start), (9, 9)));
            }
            let expected = block_diagonal.try_inverse().unwrap();

            let x: Vec<f64> = (0..nf).map(|i| (i as f64).sin()).collect();
            let y = apply(&preconditioner, &x);
            let y_expected = expected * DVector::from_column_slice(&x);
            for (a, e) in y.iter().zip(y_expected.iter()) {
                assert!((a - e).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn test_power_series_sums_requested_terms() {
        let problem = problem();
        let d = Some(problem.d.as_slice());
        let options = LinearSolverOptions::new(problem.num_eliminate_blocks)
            .with_preconditioner(PreconditionerType::SchurPowerSeriesExpansion);
        let mut isc = ImplicitSchurComplement::new(&options);
        isc.init(&problem.matrix, d, &problem.b).unwrap();

        let (h, _) = problem.dense_normal_equations(d);
        let ne = problem.num_cols_e();
        let nf = h.ncols() - ne;
        let h_ee_inv = h.view((0, 0), (ne, ne)).into_owned().try_inverse().unwrap();
        let h_ef = h.view((0, ne), (ne, nf)).into_owned();
        let m_inv = isc.block_diagonal_ftf_inverse().unwrap().to_dense();
        let operator = &m_inv * h_ef.transpose() * h_ee_inv * &h_ef;

        let x = DVector::from_fn(nf, |i, _| 1.0 + i as f64 * 0.1);
        let first = &m_inv * &x;
        let second = &operator * &first;
        let third = &operator * &second;
        let expected = &first + &second + &third;

        // A zero tolerance never stops early, so exactly three terms are summed.
        let preconditioner = PowerSeriesPreconditioner::new(&isc, 0.0, 1, 3);
        let y = apply(&preconditioner, x.as_slice());
        for (a, e) in y.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-9);
        }
    }

    #[test]
    fn test_block_jacobi_uses_ftf_inverse() {
        let problem = problem();
        let mut isc = ImplicitSchurComplement::new(&LinearSolverOptions::new(
            problem.num_eliminate_blocks,
        ));
        isc.init(&problem.matrix, None, &problem.b).unwrap();
        let inverse = isc.block_diagonal_ftf_inverse().unwrap();
        let preconditioner = BlockJacobiPreconditioner::new(inverse);

        let x = vec![1.0; preconditioner.num_rows()];
        let y = apply(&preconditioner, &x);
        let expected = inverse.to_dense() * DVector::from_column_slice(&x);
        for (a, e) in y.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-12);
        }
    }
}
