//! Solvers for `A x = b` in the least-squares sense through the Schur
//! complement.
//!
//! Three variants share the [`SchurComplementSolver`] interface:
//!
//! - [`DenseSchurSolver`]: explicit elimination into a dense reduced matrix,
//!   factorized with nalgebra's Cholesky.
//! - [`SparseSchurSolver`]: explicit elimination into the exact sparsity
//!   pattern of S, factorized with faer's sparse LLT. The symbolic
//!   factorization is computed once per block structure.
//! - [`IterativeSchurSolver`]: the implicit operator with preconditioned
//!   conjugate gradients; S is never formed.
//!
//! All of them write the full solution `x = [y; z]`, with `y` over the E
//! columns recovered by back-substitution.

use crate::error::{LinAlgError, LinAlgResult};
use crate::linalg::block_random_access::{
    BlockRandomAccessDenseMatrix, BlockRandomAccessMatrix, BlockRandomAccessSparseMatrix,
    schur_cell_pairs,
};
use crate::linalg::block_sparse::BlockSparseMatrix;
use crate::linalg::block_structure::{BlockSizes, CompressedRowBlockStructure};
use crate::linalg::conjugate_gradients::{ConjugateGradientsOptions, ConjugateGradientsSolver};
use crate::linalg::implicit_schur::ImplicitSchurComplement;
use crate::linalg::linear_operator::{
    LinearOperator, LinearSolverSummary, LinearSolverTermination,
};
use crate::linalg::preconditioner::{
    BlockJacobiPreconditioner, IdentityPreconditioner, PowerSeriesPreconditioner,
    PreconditionerType, SchurJacobiPreconditioner,
};
use crate::linalg::schur_eliminator::{
    SchurEliminatorBase, SchurEliminatorOptions, create_schur_eliminator,
};
use crate::parallel::ParallelContext;
use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use faer::{Mat, Side};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Options shared by every reduced-system solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSolverOptions {
    pub num_eliminate_blocks: usize,
    pub assume_full_rank_ete: bool,
    pub block_sizes: Option<BlockSizes>,
    pub cache_ete_inverses: bool,
    pub use_single_f_block_fast_path: bool,
    pub preconditioner: PreconditionerType,
    pub max_cg_iterations: usize,
    pub min_cg_iterations: usize,
    pub cg_tolerance: f64,
    pub spse_tolerance: f64,
    pub min_spse_iterations: usize,
    pub max_spse_iterations: usize,
    #[serde(skip)]
    pub context: ParallelContext,
}

impl Default for LinearSolverOptions {
    fn default() -> Self {
        Self {
            num_eliminate_blocks: 0,
            assume_full_rank_ete: true,
            block_sizes: None,
            cache_ete_inverses: false,
            use_single_f_block_fast_path: true,
            preconditioner: PreconditionerType::default(),
            max_cg_iterations: 500,
            min_cg_iterations: 0,
            cg_tolerance: 1e-9,
            spse_tolerance: 0.1,
            min_spse_iterations: 1,
            max_spse_iterations: 10,
            context: ParallelContext::sequential(),
        }
    }
}

impl LinearSolverOptions {
    pub fn new(num_eliminate_blocks: usize) -> Self {
        Self {
            num_eliminate_blocks,
            ..Self::default()
        }
    }

    pub fn with_assume_full_rank_ete(mut self, assume_full_rank: bool) -> Self {
        self.assume_full_rank_ete = assume_full_rank;
        self
    }

    pub fn with_block_sizes(mut self, block_sizes: BlockSizes) -> Self {
        self.block_sizes = Some(block_sizes);
        self
    }

    pub fn with_cache_ete_inverses(mut self, cache: bool) -> Self {
        self.cache_ete_inverses = cache;
        self
    }

    pub fn with_single_f_block_fast_path(mut self, enabled: bool) -> Self {
        self.use_single_f_block_fast_path = enabled;
        self
    }

    pub fn with_preconditioner(mut self, preconditioner: PreconditionerType) -> Self {
        self.preconditioner = preconditioner;
        self
    }

    pub fn with_cg_params(mut self, max_iterations: usize, tolerance: f64) -> Self {
        self.max_cg_iterations = max_iterations;
        self.cg_tolerance = tolerance;
        self
    }

    pub fn with_power_series_params(
        mut self,
        tolerance: f64,
        min_iterations: usize,
        max_iterations: usize,
    ) -> Self {
        self.spse_tolerance = tolerance;
        self.min_spse_iterations = min_iterations;
        self.max_spse_iterations = max_iterations;
        self
    }

    pub fn with_context(mut self, context: ParallelContext) -> Self {
        self.context = context;
        self
    }

    pub fn eliminator_options(&self) -> SchurEliminatorOptions {
        SchurEliminatorOptions {
            block_sizes: self.block_sizes,
            ..SchurEliminatorOptions::new(self.num_eliminate_blocks)
                .with_assume_full_rank_ete(self.assume_full_rank_ete)
                .with_cache_ete_inverses(self.cache_ete_inverses)
                .with_single_f_block_fast_path(self.use_single_f_block_fast_path)
                .with_context(self.context.clone())
        }
    }

    pub fn cg_options(&self) -> ConjugateGradientsOptions {
        ConjugateGradientsOptions::default()
            .with_max_iterations(self.max_cg_iterations)
            .with_min_iterations(self.min_cg_iterations)
            .with_tolerance(self.cg_tolerance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchurVariant {
    Dense,
    Sparse,
    Iterative,
}

/// Solve the damped least-squares problem `min |A x - b|² + |D x|²` by
/// eliminating the E-blocks.
pub trait SchurComplementSolver: Send + Debug {
    /// `x` receives the full solution `[y; z]`. A solve that does not succeed
    /// leaves `x` untouched and reports why in the summary.
    fn solve(
        &mut self,
        a: &BlockSparseMatrix,
        b: &[f64],
        d: Option<&[f64]>,
        x: &mut [f64],
    ) -> LinAlgResult<LinearSolverSummary>;
}

fn check_solve_args(
    a: &BlockSparseMatrix,
    b: &[f64],
    d: Option<&[f64]>,
    x: &[f64],
) -> LinAlgResult<()> {
    LinAlgError::check_len("b", a.num_rows(), b.len())?;
    if let Some(d) = d {
        LinAlgError::check_len("D", a.num_cols(), d.len())?;
    }
    LinAlgError::check_len("x", a.num_cols(), x.len())
}

/// Eliminator and reduced-system storage for one block structure.
#[derive(Debug)]
struct ExplicitState<L> {
    structure: Arc<CompressedRowBlockStructure>,
    eliminator: Box<dyn SchurEliminatorBase>,
    lhs: L,
    rhs: Vec<f64>,
    z: Vec<f64>,
}

fn f_block_sizes(bs: &CompressedRowBlockStructure, num_eliminate_blocks: usize) -> Vec<usize> {
    bs.cols[num_eliminate_blocks.min(bs.cols.len())..]
        .iter()
        .map(|c| c.size)
        .collect()
}

/// Shared flow of the explicit solvers: (re)initialize on a structure change,
/// eliminate, solve the reduced system and back-substitute.
#[allow(clippy::too_many_arguments)]
fn solve_explicit<L, M, S>(
    options: &LinearSolverOptions,
    state: &mut Option<ExplicitState<L>>,
    make_lhs: M,
    solve_reduced: S,
    a: &BlockSparseMatrix,
    b: &[f64],
    d: Option<&[f64]>,
    x: &mut [f64],
) -> LinAlgResult<LinearSolverSummary>
where
    L: BlockRandomAccessMatrix,
    M: FnOnce(&CompressedRowBlockStructure) -> LinAlgResult<L>,
    S: FnOnce(&L, &[f64], &mut [f64], bool) -> LinAlgResult<LinearSolverSummary>,
{
    check_solve_args(a, b, d, x)?;
    let bs = a.block_structure();
    let structure_changed = match state.as_ref() {
        Some(state) => !a.shares_structure(&state.structure) && *state.structure != **bs,
        None => true,
    };
    if structure_changed {
        let eliminator = create_schur_eliminator(&options.eliminator_options(), bs)?;
        let lhs = make_lhs(bs)?;
        let num_cols_f = f_block_sizes(bs, options.num_eliminate_blocks).iter().sum();
        *state = Some(ExplicitState {
            structure: Arc::clone(bs),
            eliminator,
            lhs,
            rhs: vec![0.0; num_cols_f],
            z: vec![0.0; num_cols_f],
        });
    }
    let Some(state) = state.as_mut() else {
        return Err(LinAlgError::InvalidState(
            "reduced system storage missing".to_string(),
        ));
    };

    state
        .eliminator
        .eliminate(a, Some(b), d, &mut state.lhs, &mut state.rhs)?;
    trace!("reduced system formed, solving for {} unknowns", state.z.len());

    state.z.fill(0.0);
    let summary = solve_reduced(&state.lhs, &state.rhs, &mut state.z, structure_changed)?;
    if summary.is_success() {
        let (y, z) = x.split_at_mut(a.num_cols() - state.z.len());
        state.eliminator.back_substitute(a, b, d, &state.z, y)?;
        z.copy_from_slice(&state.z);
    }
    Ok(summary)
}

fn direct_summary() -> LinearSolverSummary {
    let mut summary = LinearSolverSummary::new(LinearSolverTermination::Success, "Success.");
    summary.num_iterations = 1;
    summary
}

/// Explicit Schur complement with a dense Cholesky of S.
#[derive(Debug)]
pub struct DenseSchurSolver {
    options: LinearSolverOptions,
    state: Option<ExplicitState<BlockRandomAccessDenseMatrix>>,
}

impl DenseSchurSolver {
    pub fn new(options: LinearSolverOptions) -> Self {
        Self {
            options,
            state: None,
        }
    }
}

impl SchurComplementSolver for DenseSchurSolver {
    fn solve(
        &mut self,
        a: &BlockSparseMatrix,
        b: &[f64],
        d: Option<&[f64]>,
        x: &mut [f64],
    ) -> LinAlgResult<LinearSolverSummary> {
        let n = self.options.num_eliminate_blocks;
        solve_explicit(
            &self.options,
            &mut self.state,
            |bs| Ok(BlockRandomAccessDenseMatrix::new(&f_block_sizes(bs, n))),
            |lhs, rhs, z, _| {
                if z.is_empty() {
                    return Ok(direct_summary());
                }
                let cholesky = lhs.to_dense().cholesky().ok_or_else(|| {
                    LinAlgError::FactorizationFailed(
                        "dense Cholesky of the reduced system failed".to_string(),
                    )
                })?;
                let solution = cholesky.solve(&DVector::from_column_slice(rhs));
                z.copy_from_slice(solution.as_slice());
                Ok(direct_summary())
            },
            a,
            b,
            d,
            x,
        )
    }
}

/// Explicit Schur complement stored in its exact block sparsity pattern and
/// factorized with a sparse LLT.
#[derive(Debug)]
pub struct SparseSchurSolver {
    options: LinearSolverOptions,
    state: Option<ExplicitState<BlockRandomAccessSparseMatrix>>,
    symbolic: Option<SymbolicLlt<usize>>,
}

impl SparseSchurSolver {
    pub fn new(options: LinearSolverOptions) -> Self {
        Self {
            options,
            state: None,
            symbolic: None,
        }
    }
}

impl SchurComplementSolver for SparseSchurSolver {
    fn solve(
        &mut self,
        a: &BlockSparseMatrix,
        b: &[f64],
        d: Option<&[f64]>,
        x: &mut [f64],
    ) -> LinAlgResult<LinearSolverSummary> {
        let n = self.options.num_eliminate_blocks;
        let symbolic = &mut self.symbolic;
        solve_explicit(
            &self.options,
            &mut self.state,
            |bs| {
                let pairs = schur_cell_pairs(bs, n)?;
                debug!("Sparse Schur complement with {} stored cells", pairs.len());
                BlockRandomAccessSparseMatrix::new(&f_block_sizes(bs, n), pairs)
            },
            |lhs, rhs, z, structure_changed| {
                if z.is_empty() {
                    return Ok(direct_summary());
                }
                let s = lhs.to_sparse_col_mat()?;
                if structure_changed {
                    *symbolic = None;
                }
                let sym = match symbolic.as_ref() {
                    Some(sym) => sym.clone(),
                    None => {
                        let sym = SymbolicLlt::try_new(s.symbolic(), Side::Lower).map_err(|e| {
                            LinAlgError::FactorizationFailed(format!(
                                "symbolic Cholesky of the reduced system failed: {:?}",
                                e
                            ))
                        })?;
                        *symbolic = Some(sym.clone());
                        sym
                    }
                };
                let llt = Llt::try_new_with_symbolic(sym, s.as_ref(), Side::Lower).map_err(|e| {
                    LinAlgError::FactorizationFailed(format!(
                        "sparse Cholesky of the reduced system failed: {:?}",
                        e
                    ))
                })?;
                let solution = llt.solve(&Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]));
                for (i, z_i) in z.iter_mut().enumerate() {
                    *z_i = solution[(i, 0)];
                }
                Ok(direct_summary())
            },
            a,
            b,
            d,
            x,
        )
    }
}

/// Implicit Schur complement solved with preconditioned conjugate gradients.
#[derive(Debug)]
pub struct IterativeSchurSolver {
    options: LinearSolverOptions,
    cg: ConjugateGradientsSolver,
    /// Rebuilt when the block structure changes.
    schur_jacobi: Option<(Arc<CompressedRowBlockStructure>, SchurJacobiPreconditioner)>,
}

impl IterativeSchurSolver {
    pub fn new(options: LinearSolverOptions) -> Self {
        Self {
            cg: ConjugateGradientsSolver::new(options.cg_options()),
            options,
            schur_jacobi: None,
        }
    }
}

fn update_schur_jacobi<'s>(
    cached: &'s mut Option<(Arc<CompressedRowBlockStructure>, SchurJacobiPreconditioner)>,
    options: &LinearSolverOptions,
    a: &BlockSparseMatrix,
    d: Option<&[f64]>,
) -> LinAlgResult<&'s SchurJacobiPreconditioner> {
    let bs = a.block_structure();
    let reusable = matches!(
        cached,
        Some((structure, _)) if a.shares_structure(structure) || **structure == **bs
    );
    if !reusable {
        let preconditioner = SchurJacobiPreconditioner::new(options, bs)?;
        *cached = Some((Arc::clone(bs), preconditioner));
    }
    let Some((_, preconditioner)) = cached.as_mut() else {
        return Err(LinAlgError::InvalidState(
            "Schur-Jacobi preconditioner missing".to_string(),
        ));
    };
    preconditioner.update(a, d)?;
    Ok(preconditioner)
}

impl SchurComplementSolver for IterativeSchurSolver {
    fn solve(
        &mut self,
        a: &BlockSparseMatrix,
        b: &[f64],
        d: Option<&[f64]>,
        x: &mut [f64],
    ) -> LinAlgResult<LinearSolverSummary> {
        check_solve_args(a, b, d, x)?;
        let mut isc = ImplicitSchurComplement::new(&self.options);
        isc.init(a, d, b)?;

        let nf = isc.num_cols_f();
        let mut z = vec![0.0; nf];
        if nf == 0 {
            isc.back_substitute(&z, x)?;
            return Ok(direct_summary());
        }

        let identity = IdentityPreconditioner::new(nf);
        let jacobi;
        let power_series;
        let preconditioner: &dyn LinearOperator = match self.options.preconditioner {
            PreconditionerType::Identity => &identity,
            PreconditionerType::Jacobi => {
                let inverse = isc.block_diagonal_ftf_inverse().ok_or_else(|| {
                    LinAlgError::InvalidState("FᵗF inverse missing".to_string())
                })?;
                jacobi = BlockJacobiPreconditioner::new(inverse);
                &jacobi
            }
            PreconditionerType::SchurJacobi => {
                update_schur_jacobi(&mut self.schur_jacobi, &self.options, a, d)?
            }
            PreconditionerType::SchurPowerSeriesExpansion => {
                power_series = PowerSeriesPreconditioner::new(
                    &isc,
                    self.options.spse_tolerance,
                    self.options.min_spse_iterations,
                    self.options.max_spse_iterations,
                );
                &power_series
            }
        };

        let summary = self.cg.solve(&isc, Some(preconditioner), isc.rhs(), &mut z)?;
        info!(
            "Iterative Schur solve ({:?}): {}",
            self.options.preconditioner, summary
        );
        // An unconverged CG iterate is still the best available estimate.
        if summary.termination != LinearSolverTermination::Failure {
            isc.back_substitute(&z, x)?;
        }
        Ok(summary)
    }
}

/// Build a solver of the given variant.
pub fn create_schur_solver(
    variant: SchurVariant,
    options: LinearSolverOptions,
) -> Box<dyn SchurComplementSolver> {
    debug!(
        "Creating {:?} Schur solver eliminating {} blocks",
        variant, options.num_eliminate_blocks
    );
    match variant {
        SchurVariant::Dense => Box::new(DenseSchurSolver::new(options)),
        SchurVariant::Sparse => Box::new(SparseSchurSolver::new(options)),
        SchurVariant::Iterative => Box::new(IterativeSchurSolver::new(options)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::synthetic::{SyntheticProblem, SyntheticProblemOptions, generate_problem};

    fn problem(priors: usize) -> SyntheticProblem {
        let options = SyntheticProblemOptions::new()
            .with_points(20)
            .with_cameras(5)
            .with_observations_per_point(3)
            .with_block_sizes(2, 3, 6)
            .with_camera_priors(priors);
        generate_problem(&options).unwrap()
    }

    fn reference_solution(problem: &SyntheticProblem, d: Option<&[f64]>) -> DVector<f64> {
        let (h, g) = problem.dense_normal_equations(d);
        h.cholesky().unwrap().solve(&g)
    }

    fn assert_solution(x: &[f64], expected: &DVector<f64>, tolerance: f64) {
        for (a, e) in x.iter().zip(expected.iter()) {
            assert!((a - e).abs() < tolerance, "{a} vs {e}");
        }
    }

    #[test]
    fn test_direct_solvers_match_dense_reference() {
        let problem = problem(3);
        let d = Some(problem.d.as_slice());
        let expected = reference_solution(&problem, d);
        for variant in [SchurVariant::Dense, SchurVariant::Sparse] {
            for threads in [1, 4] {
                let options = LinearSolverOptions::new(problem.num_eliminate_blocks)
                    .with_context(ParallelContext::new(threads).unwrap());
                let mut solver = create_schur_solver(variant, options);
                let mut x = vec![0.0; problem.matrix.num_cols()];
                let summary = solver.solve(&problem.matrix, &problem.b, d, &mut x).unwrap();
                assert!(summary.is_success());
                assert_solution(&x, &expected, 1e-8);
            }
        }
    }

    #[test]
    fn test_iterative_solver_preconditioners() {
        let problem = problem(2);
        let d = Some(problem.d.as_slice());
        let expected = reference_solution(&problem, d);
        for preconditioner in [
            PreconditionerType::Identity,
            PreconditionerType::Jacobi,
            PreconditionerType::SchurJacobi,
            PreconditionerType::SchurPowerSeriesExpansion,
        ] {
            let options = LinearSolverOptions::new(problem.num_eliminate_blocks)
                .with_preconditioner(preconditioner)
                .with_cg_params(200, 1e-12)
                .with_context(ParallelContext::new(2).unwrap());
            let mut solver = IterativeSchurSolver::new(options);
            let mut x = vec![0.0; problem.matrix.num_cols()];
            let summary = solver.solve(&problem.matrix, &problem.b, d, &mut x).unwrap();
            assert!(summary.is_success(), "{preconditioner:?}: {summary}");
            assert_solution(&x, &expected, 1e-6);
        }
    }

    #[test]
    fn test_reuses_state_for_same_structure() {
        let problem = problem(1);
        let mut scaled = problem.clone();
        scaled.matrix.values_mut().iter_mut().for_each(|v| *v *= 0.5);

        let mut solver = SparseSchurSolver::new(LinearSolverOptions::new(problem.num_eliminate_blocks));
        let mut x = vec![0.0; problem.matrix.num_cols()];
        for p in [&problem, &scaled] {
            let d = Some(p.d.as_slice());
            solver.solve(&p.matrix, &p.b, d, &mut x).unwrap();
            assert_solution(&x, &reference_solution(p, d), 1e-8);
        }
        assert!(solver.symbolic.is_some());
        let state = solver.state.as_ref().unwrap();
        assert!(Arc::ptr_eq(&state.structure, problem.matrix.block_structure()));
    }

    #[test]
    fn test_singular_reduced_system_fails_to_factorize() {
        // Two F columns that never appear in any row: S is zero.
        let bs = CompressedRowBlockStructure::from_layout(&[2, 2], &[(3, vec![0])]).unwrap();
        let a = BlockSparseMatrix::from_values(Arc::new(bs), (1..=6).map(f64::from).collect())
            .unwrap();
        let mut solver = DenseSchurSolver::new(LinearSolverOptions::new(1));
        let mut x = vec![0.0; 4];
        let result = solver.solve(&a, &[1.0, 0.0, 1.0], None, &mut x);
        assert!(matches!(result, Err(LinAlgError::FactorizationFailed(_))));
    }

    #[test]
    fn test_options_serde_round_trip() {
        let options = LinearSolverOptions::new(7)
            .with_preconditioner(PreconditionerType::SchurJacobi)
            .with_block_sizes(BlockSizes::new(2, 3, 9));
        let json = serde_json::to_string(&options).unwrap();
        let parsed: LinearSolverOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.num_eliminate_blocks, 7);
        assert_eq!(parsed.preconditioner, PreconditionerType::SchurJacobi);
        assert_eq!(parsed.block_sizes, Some(BlockSizes::new(2, 3, 9)));
        assert!(!parsed.context.is_parallel());
    }
}
