//! Matrix-free Schur complement operator.
//!
//! Applies
//!
//! ```text
//! S x = Fᵗ (I - E (EᵗE)⁻¹ Eᵗ) F x + D_f² x
//! ```
//!
//! without ever forming S, using only products with E and F and the inverted
//! block diagonal of EᵗE (with `D_e²` added when a damping diagonal is given).
//! This is the operator conjugate gradients runs on in the iterative Schur
//! solver.
//!
//! # Example
//!
//! ```no_run
//! # use block_schur::linalg::*;
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let problem = generate_problem(&SyntheticProblemOptions::default())?;
//! let options = LinearSolverOptions::new(problem.num_eliminate_blocks);
//! let mut isc = ImplicitSchurComplement::new(&options);
//! isc.init(&problem.matrix, Some(&problem.d), &problem.b)?;
//!
//! let mut z = vec![0.0; isc.num_cols()];
//! ConjugateGradientsSolver::default().solve(&isc, None, isc.rhs(), &mut z)?;
//!
//! let mut x = vec![0.0; problem.matrix.num_cols()];
//! isc.back_substitute(&z, &mut x)?;
//! # Ok(())
//! # }
//! ```

use crate::error::{LinAlgError, LinAlgResult};
use crate::linalg::block_diagonal::BlockDiagonalMatrix;
use crate::linalg::block_random_access::lock;
use crate::linalg::block_sparse::BlockSparseMatrix;
use crate::linalg::block_structure::BlockSizes;
use crate::linalg::linear_operator::LinearOperator;
use crate::linalg::partitioned_view::{PartitionedMatrixViewBase, create_partitioned_view};
use crate::linalg::preconditioner::PreconditionerType;
use crate::linalg::schur_solver::LinearSolverOptions;
use crate::parallel::ParallelContext;
use std::sync::Mutex;
use tracing::debug;

/// Work vectors reused by every product.
#[derive(Debug, Default)]
struct Workspace {
    tmp_rows: Vec<f64>,
    tmp_e_cols: Vec<f64>,
    tmp_e_cols_2: Vec<f64>,
    tmp_f_cols: Vec<f64>,
}

impl Workspace {
    fn resize(&mut self, num_rows: usize, num_cols_e: usize, num_cols_f: usize) {
        self.tmp_rows = vec![0.0; num_rows];
        self.tmp_e_cols = vec![0.0; num_cols_e];
        self.tmp_e_cols_2 = vec![0.0; num_cols_e];
        self.tmp_f_cols = vec![0.0; num_cols_f];
    }
}

fn negate(v: &mut [f64]) {
    v.iter_mut().for_each(|x| *x = -*x);
}

/// `tmp_rows = (I - E (EᵗE)⁻¹ Eᵗ) tmp_rows`
fn project_out_e(
    view: &dyn PartitionedMatrixViewBase<'_>,
    ete_inverse: &BlockDiagonalMatrix,
    workspace: &mut Workspace,
) -> LinAlgResult<()> {
    let Workspace {
        tmp_rows,
        tmp_e_cols,
        tmp_e_cols_2,
        ..
    } = workspace;
    tmp_e_cols.fill(0.0);
    view.left_multiply_and_accumulate_e(tmp_rows, tmp_e_cols)?;
    tmp_e_cols_2.fill(0.0);
    ete_inverse.right_multiply_and_accumulate(tmp_e_cols, tmp_e_cols_2)?;
    negate(tmp_e_cols_2);
    view.right_multiply_and_accumulate_e(tmp_e_cols_2, tmp_rows)
}

#[derive(Debug)]
pub struct ImplicitSchurComplement<'a> {
    num_eliminate_blocks: usize,
    assume_full_rank_ete: bool,
    block_sizes: Option<BlockSizes>,
    compute_ftf_inverse: bool,
    context: ParallelContext,

    view: Option<Box<dyn PartitionedMatrixViewBase<'a> + 'a>>,
    b: Vec<f64>,
    d: Option<Vec<f64>>,
    block_diagonal_ete_inverse: BlockDiagonalMatrix,
    block_diagonal_ftf_inverse: Option<BlockDiagonalMatrix>,
    rhs: Vec<f64>,
    workspace: Mutex<Workspace>,
}

impl<'a> ImplicitSchurComplement<'a> {
    /// The inverse of the FᵗF block diagonal is only formed for the Jacobi and
    /// power series preconditioners, which need it.
    pub fn new(options: &LinearSolverOptions) -> Self {
        Self {
            num_eliminate_blocks: options.num_eliminate_blocks,
            assume_full_rank_ete: options.assume_full_rank_ete,
            block_sizes: options.block_sizes,
            compute_ftf_inverse: matches!(
                options.preconditioner,
                PreconditionerType::Jacobi | PreconditionerType::SchurPowerSeriesExpansion
            ),
            context: options.context.clone(),
            view: None,
            b: Vec::new(),
            d: None,
            block_diagonal_ete_inverse: BlockDiagonalMatrix::new(&[]),
            block_diagonal_ftf_inverse: None,
            rhs: Vec::new(),
            workspace: Mutex::new(Workspace::default()),
        }
    }

    /// Bind to `a`, `d` and `b`, invert the block diagonals and compute the
    /// reduced right-hand side.
    ///
    /// The partitioned view is kept when `a` has the same block structure as
    /// the previous matrix and rebuilt otherwise.
    pub fn init(
        &mut self,
        a: &'a BlockSparseMatrix,
        d: Option<&[f64]>,
        b: &[f64],
    ) -> LinAlgResult<()> {
        LinAlgError::check_len("b", a.num_rows(), b.len())?;
        if let Some(d) = d {
            LinAlgError::check_len("D", a.num_cols(), d.len())?;
        }

        let rebound = match self.view.as_mut() {
            Some(view) => view.rebind(a).is_ok(),
            None => false,
        };
        if !rebound {
            let view = create_partitioned_view(
                a,
                self.num_eliminate_blocks,
                self.block_sizes,
                &self.context,
            )?;
            debug!(
                "Implicit Schur complement over {} F columns ({} E columns)",
                view.num_cols_f(),
                view.num_cols_e()
            );
            self.block_diagonal_ete_inverse = view.create_block_diagonal_ete();
            self.block_diagonal_ftf_inverse = self
                .compute_ftf_inverse
                .then(|| view.create_block_diagonal_ftf());
            lock(&self.workspace).resize(view.num_rows(), view.num_cols_e(), view.num_cols_f());
            self.rhs = vec![0.0; view.num_cols_f()];
            self.view = Some(view);
        }

        self.b.clear();
        self.b.extend_from_slice(b);
        self.d = d.map(<[f64]>::to_vec);

        let view = self
            .view
            .as_deref()
            .ok_or_else(|| LinAlgError::InvalidState("partitioned view missing".to_string()))?;
        let ne = view.num_cols_e();

        let ete = &mut self.block_diagonal_ete_inverse;
        view.update_block_diagonal_ete(ete)?;
        if let Some(d) = d {
            ete.add_squared_diagonal(&d[..ne])?;
        }
        ete.invert_blocks(self.assume_full_rank_ete, &self.context);

        if let Some(ftf) = self.block_diagonal_ftf_inverse.as_mut() {
            view.update_block_diagonal_ftf(ftf)?;
            if let Some(d) = d {
                ftf.add_squared_diagonal(&d[ne..])?;
            }
            ftf.invert_blocks(true, &self.context);
        }

        // rhs = Fᵗ (I - E (EᵗE)⁻¹ Eᵗ) b
        let workspace = self
            .workspace
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        workspace.tmp_rows.copy_from_slice(b);
        project_out_e(view, &self.block_diagonal_ete_inverse, workspace)?;
        self.rhs.fill(0.0);
        view.left_multiply_and_accumulate_f(&workspace.tmp_rows, &mut self.rhs)
    }

    fn view(&self) -> LinAlgResult<&(dyn PartitionedMatrixViewBase<'a> + 'a)> {
        self.view.as_deref().ok_or_else(|| {
            LinAlgError::InvalidState("implicit Schur complement used before init".to_string())
        })
    }

    /// Reduced right-hand side `Fᵗ (I - E (EᵗE)⁻¹ Eᵗ) b`.
    pub fn rhs(&self) -> &[f64] {
        &self.rhs
    }

    pub fn num_cols_e(&self) -> usize {
        self.view.as_ref().map(|v| v.num_cols_e()).unwrap_or(0)
    }

    pub fn num_cols_f(&self) -> usize {
        self.rhs.len()
    }

    pub fn block_diagonal_ete_inverse(&self) -> &BlockDiagonalMatrix {
        &self.block_diagonal_ete_inverse
    }

    /// Present only when the configured preconditioner needs it.
    pub fn block_diagonal_ftf_inverse(&self) -> Option<&BlockDiagonalMatrix> {
        self.block_diagonal_ftf_inverse.as_ref()
    }

    /// Given the reduced solution `x`, write the full solution
    /// `y = [(EᵗE)⁻¹ Eᵗ (b - F x); x]`.
    pub fn back_substitute(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        let view = self.view()?;
        let ne = view.num_cols_e();
        LinAlgError::check_len("x", view.num_cols_f(), x.len())?;
        LinAlgError::check_len("y", view.num_cols(), y.len())?;

        let mut workspace = lock(&self.workspace);
        let Workspace {
            tmp_rows,
            tmp_e_cols,
            ..
        } = &mut *workspace;
        tmp_rows.fill(0.0);
        view.right_multiply_and_accumulate_f(x, tmp_rows)?;
        for (t, b) in tmp_rows.iter_mut().zip(&self.b) {
            *t = b - *t;
        }
        tmp_e_cols.fill(0.0);
        view.left_multiply_and_accumulate_e(tmp_rows, tmp_e_cols)?;

        let (y_e, y_f) = y.split_at_mut(ne);
        y_e.fill(0.0);
        self.block_diagonal_ete_inverse
            .right_multiply_and_accumulate(tmp_e_cols, y_e)?;
        y_f.copy_from_slice(x);
        Ok(())
    }

    /// `y += (FᵗF)⁻¹ FᵗE (EᵗE)⁻¹ EᵗF x`, the operator whose powers make up the
    /// series expansion of `S⁻¹`.
    pub fn inverse_power_series_operator_right_multiply_accumulate(
        &self,
        x: &[f64],
        y: &mut [f64],
    ) -> LinAlgResult<()> {
        let view = self.view()?;
        let ftf_inverse = self.block_diagonal_ftf_inverse.as_ref().ok_or_else(|| {
            LinAlgError::InvalidState(
                "FᵗF inverse was not computed for this preconditioner".to_string(),
            )
        })?;
        LinAlgError::check_len("x", view.num_cols_f(), x.len())?;
        LinAlgError::check_len("y", view.num_cols_f(), y.len())?;

        let mut workspace = lock(&self.workspace);
        let Workspace {
            tmp_rows,
            tmp_e_cols,
            tmp_e_cols_2,
            tmp_f_cols,
        } = &mut *workspace;
        tmp_rows.fill(0.0);
        view.right_multiply_and_accumulate_f(x, tmp_rows)?;
        tmp_e_cols.fill(0.0);
        view.left_multiply_and_accumulate_e(tmp_rows, tmp_e_cols)?;
        tmp_e_cols_2.fill(0.0);
        self.block_diagonal_ete_inverse
            .right_multiply_and_accumulate(tmp_e_cols, tmp_e_cols_2)?;
        tmp_rows.fill(0.0);
        view.right_multiply_and_accumulate_e(tmp_e_cols_2, tmp_rows)?;
        tmp_f_cols.fill(0.0);
        view.left_multiply_and_accumulate_f(tmp_rows, tmp_f_cols)?;
        ftf_inverse.right_multiply_and_accumulate(tmp_f_cols, y)
    }
}

impl LinearOperator for ImplicitSchurComplement<'_> {
    fn num_rows(&self) -> usize {
        self.num_cols_f()
    }

    fn num_cols(&self) -> usize {
        self.num_cols_f()
    }

    /// `y += S x`
    fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        let view = self.view()?;
        let nf = view.num_cols_f();
        LinAlgError::check_len("x", nf, x.len())?;
        LinAlgError::check_len("y", nf, y.len())?;

        let mut workspace = lock(&self.workspace);
        workspace.tmp_rows.fill(0.0);
        view.right_multiply_and_accumulate_f(x, &mut workspace.tmp_rows)?;
        project_out_e(view, &self.block_diagonal_ete_inverse, &mut workspace)?;
        view.left_multiply_and_accumulate_f(&workspace.tmp_rows, y)?;

        if let Some(d) = &self.d {
            let d_f = &d[view.num_cols_e()..];
            for ((y_i, x_i), d_i) in y.iter_mut().zip(x).zip(d_f) {
                *y_i += d_i * d_i * x_i;
            }
        }
        Ok(())
    }

    /// S is symmetric.
    fn left_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        self.right_multiply_and_accumulate(x, y)
    }
}
