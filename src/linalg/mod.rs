//! Block-sparse Schur complement linear algebra.
//!
//! This module provides the pieces needed to reduce a block-sparse
//! least-squares system `A = [E F]` to the Schur complement over F:
//! - Small dense kernels specialized on compile-time block sizes
//! - Block structures, block-sparse and block-diagonal matrices
//! - A partitioned view of A as E and F
//! - Explicit elimination into a reduced system, and back-substitution
//! - A matrix-free implicit Schur operator with preconditioned CG
//! - Dense (nalgebra), sparse (faer) and iterative reduced-system solvers

/// Call `$make::<ROW, E, F>(args..)` with the closest available specialization
/// of a [`BlockSizes`](block_structure::BlockSizes) value.
macro_rules! dispatch_block_sizes {
    ($sizes:expr, $make:ident ( $($arg:expr),* $(,)? )) => {{
        use $crate::linalg::small_blas::DYNAMIC as D;
        let sizes: $crate::linalg::block_structure::BlockSizes = $sizes;
        match (sizes.row, sizes.e, sizes.f) {
            (2, 3, 6) => $make::<2, 3, 6>($($arg),*),
            (2, 3, 9) => $make::<2, 3, 9>($($arg),*),
            (3, 3, 3) => $make::<3, 3, 3>($($arg),*),
            (2, 3, _) => $make::<2, 3, { D }>($($arg),*),
            (2, 4, _) => $make::<2, 4, { D }>($($arg),*),
            (2, 2, _) => $make::<2, 2, { D }>($($arg),*),
            (2, _, _) => $make::<2, { D }, { D }>($($arg),*),
            (4, 4, _) => $make::<4, 4, { D }>($($arg),*),
            _ => $make::<{ D }, { D }, { D }>($($arg),*),
        }
    }};
}

pub mod block_diagonal;
pub mod block_random_access;
pub mod block_sparse;
pub mod block_structure;
pub mod conjugate_gradients;
pub mod implicit_schur;
pub mod invert_psd;
pub mod linear_operator;
pub mod partitioned_view;
pub mod preconditioner;
pub mod schur_eliminator;
pub mod schur_solver;
pub mod single_f_eliminator;
pub mod small_blas;
pub mod synthetic;

pub use block_diagonal::BlockDiagonalMatrix;
pub use block_random_access::{
    BlockRandomAccessDenseMatrix, BlockRandomAccessDiagonalMatrix, BlockRandomAccessMatrix,
    BlockRandomAccessSparseMatrix, CellInfo, schur_cell_pairs,
};
pub use block_sparse::BlockSparseMatrix;
pub use block_structure::{
    Block, BlockSizes, Cell, ChunkLayout, CompressedRow, CompressedRowBlockStructure, RowChunk,
    compute_chunks, detect_structure, validate_block_sizes,
};
pub use conjugate_gradients::{ConjugateGradientsOptions, ConjugateGradientsSolver};
pub use implicit_schur::ImplicitSchurComplement;
pub use invert_psd::{invert_psd_block, invert_psd_matrix};
pub use linear_operator::{LinearOperator, LinearSolverSummary, LinearSolverTermination};
pub use partitioned_view::{
    PartitionedMatrixView, PartitionedMatrixViewBase, create_partitioned_view,
};
pub use preconditioner::{
    BlockJacobiPreconditioner, IdentityPreconditioner, PowerSeriesPreconditioner,
    PreconditionerType, SchurJacobiPreconditioner,
};
pub use schur_eliminator::{
    LockingStrategy, SchurEliminator, SchurEliminatorBase, SchurEliminatorOptions,
    create_schur_eliminator,
};
pub use schur_solver::{
    DenseSchurSolver, IterativeSchurSolver, LinearSolverOptions, SchurComplementSolver,
    SchurVariant, SparseSchurSolver, create_schur_solver,
};
pub use single_f_eliminator::SchurEliminatorForOneFBlock;
pub use small_blas::{Accumulate, DYNAMIC};
pub use synthetic::{SyntheticProblem, SyntheticProblemOptions, generate_problem};
