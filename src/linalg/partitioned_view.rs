//! Column-partitioned view `A = [E F]` of a block-sparse matrix.
//!
//! E holds the first `num_eliminate_blocks` column blocks, F the rest. The
//! view never copies values; every product walks the block rows of the
//! underlying matrix. Products over rows that reference an E-block use the
//! compile-time block sizes `ROW`, `E` and `F`; rows touching only F-blocks
//! always go through the dynamic kernels.
//!
//! Parallel products split the output vector into disjoint blocks, so workers
//! never share a write target.

use crate::error::{LinAlgError, LinAlgResult};
use crate::linalg::block_diagonal::BlockDiagonalMatrix;
use crate::linalg::block_sparse::BlockSparseMatrix;
use crate::linalg::block_structure::{
    BlockSizes, ChunkLayout, CompressedRowBlockStructure, compute_chunks, detect_structure,
    validate_block_sizes,
};
use crate::linalg::small_blas::{
    Accumulate, DYNAMIC, MatMut, MatRef, matrix_transpose_matrix_multiply,
    matrix_transpose_vector_multiply, matrix_vector_multiply,
};
use crate::parallel::{ParallelContext, partition_mut};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Operations the eliminator and the implicit operator need from `[E F]`.
///
/// All products accumulate into `y`.
pub trait PartitionedMatrixViewBase<'a>: Send + Sync + Debug {
    fn matrix(&self) -> &'a BlockSparseMatrix;

    /// Point the view at another matrix with the same block structure.
    fn rebind(&mut self, matrix: &'a BlockSparseMatrix) -> LinAlgResult<()>;

    /// `y += E * x`
    fn right_multiply_and_accumulate_e(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()>;

    /// `y += F * x`
    fn right_multiply_and_accumulate_f(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()>;

    /// `y += Eᵗ * x`
    fn left_multiply_and_accumulate_e(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()>;

    /// `y += Fᵗ * x`
    fn left_multiply_and_accumulate_f(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()>;

    fn create_block_diagonal_ete(&self) -> BlockDiagonalMatrix;
    fn create_block_diagonal_ftf(&self) -> BlockDiagonalMatrix;

    /// Overwrite `target` with the block diagonal of EᵗE.
    fn update_block_diagonal_ete(&self, target: &mut BlockDiagonalMatrix) -> LinAlgResult<()>;

    /// Overwrite `target` with the block diagonal of FᵗF.
    fn update_block_diagonal_ftf(&self, target: &mut BlockDiagonalMatrix) -> LinAlgResult<()>;

    fn block_sizes(&self) -> BlockSizes;
    fn num_col_blocks_e(&self) -> usize;
    fn num_col_blocks_f(&self) -> usize;
    fn num_cols_e(&self) -> usize;
    fn num_cols_f(&self) -> usize;
    /// Row blocks that reference an E-block.
    fn num_row_blocks_e(&self) -> usize;

    fn num_rows(&self) -> usize {
        self.matrix().num_rows()
    }

    fn num_cols(&self) -> usize {
        self.matrix().num_cols()
    }
}

#[derive(Debug)]
pub struct PartitionedMatrixView<'a, const ROW: usize, const E: usize, const F: usize> {
    matrix: &'a BlockSparseMatrix,
    num_col_blocks_e: usize,
    num_cols_e: usize,
    num_cols_f: usize,
    layout: ChunkLayout,
    chunk_of_e_block: Vec<Option<usize>>,
    /// For every F-block, the `(row block, cell index)` pairs that touch it.
    f_transpose: Vec<Vec<(usize, usize)>>,
    context: ParallelContext,
}

impl<'a, const ROW: usize, const E: usize, const F: usize> PartitionedMatrixView<'a, ROW, E, F> {
    pub fn new(
        matrix: &'a BlockSparseMatrix,
        num_eliminate_blocks: usize,
        context: ParallelContext,
    ) -> LinAlgResult<Self> {
        let bs = matrix.block_structure();
        let layout = compute_chunks(bs, num_eliminate_blocks)?;
        validate_block_sizes(bs, num_eliminate_blocks, BlockSizes::new(ROW, E, F))?;

        let num_col_blocks_f = bs.cols.len() - num_eliminate_blocks;
        let mut f_transpose = vec![Vec::new(); num_col_blocks_f];
        for (r, row) in bs.rows.iter().enumerate() {
            let first_f = usize::from(r < layout.first_f_only_row);
            for (c, cell) in row.cells.iter().enumerate().skip(first_f) {
                f_transpose[cell.block_id - num_eliminate_blocks].push((r, c));
            }
        }

        let num_cols_e = bs.num_cols_e(num_eliminate_blocks);
        Ok(Self {
            matrix,
            num_col_blocks_e: num_eliminate_blocks,
            num_cols_e,
            num_cols_f: bs.num_cols() - num_cols_e,
            chunk_of_e_block: layout.chunk_of_e_block(num_eliminate_blocks),
            layout,
            f_transpose,
            context,
        })
    }

    fn structure(&self) -> &'a CompressedRowBlockStructure {
        self.matrix.block_structure()
    }

    fn is_e_row(&self, row_block: usize) -> bool {
        row_block < self.layout.first_f_only_row
    }

    fn e_block_sizes(&self) -> Vec<usize> {
        let bs = self.structure();
        bs.cols[..self.num_col_blocks_e].iter().map(|c| c.size).collect()
    }

    fn f_block_sizes(&self) -> Vec<usize> {
        let bs = self.structure();
        bs.cols[self.num_col_blocks_e..].iter().map(|c| c.size).collect()
    }

    fn check_diagonal_layout(target: &BlockDiagonalMatrix, sizes: &[usize]) -> LinAlgResult<()> {
        let matches = target.num_blocks() == sizes.len()
            && target.blocks().iter().zip(sizes).all(|(b, &s)| b.size == s);
        if matches {
            Ok(())
        } else {
            Err(LinAlgError::InvalidInput(
                "block diagonal matrix layout does not match the view".to_string(),
            ))
        }
    }
}

impl<'a, const ROW: usize, const E: usize, const F: usize> PartitionedMatrixViewBase<'a>
    for PartitionedMatrixView<'a, ROW, E, F>
{
    fn matrix(&self) -> &'a BlockSparseMatrix {
        self.matrix
    }

    fn rebind(&mut self, matrix: &'a BlockSparseMatrix) -> LinAlgResult<()> {
        let current = self.matrix.block_structure();
        let next = matrix.block_structure();
        if !Arc::ptr_eq(current, next) && **current != **next {
            return Err(LinAlgError::InvalidStructure(
                "cannot rebind a partitioned view to a matrix with a different structure"
                    .to_string(),
            ));
        }
        self.matrix = matrix;
        Ok(())
    }

    fn right_multiply_and_accumulate_e(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        LinAlgError::check_len("x", self.num_cols_e, x.len())?;
        LinAlgError::check_len("y", self.num_rows(), y.len())?;

        let bs = self.structure();
        let values = self.matrix.values();
        let e_rows = &bs.rows[..self.layout.first_f_only_row];
        let mut y_rows = partition_mut(y, e_rows.iter().map(|row| row.block.size));
        self.context.for_each_mut(&mut y_rows, |_, r, y_row| {
            let row = &e_rows[r];
            let cell = row.cells[0];
            let col = bs.cols[cell.block_id];
            matrix_vector_multiply::<ROW, E>(
                Accumulate::Add,
                MatRef::new(&values[cell.position..], row.block.size, col.size),
                &x[col.range()],
                y_row,
            );
        });
        Ok(())
    }

    fn right_multiply_and_accumulate_f(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        LinAlgError::check_len("x", self.num_cols_f, x.len())?;
        LinAlgError::check_len("y", self.num_rows(), y.len())?;

        let bs = self.structure();
        let values = self.matrix.values();
        let num_cols_e = self.num_cols_e;
        let mut y_rows = partition_mut(y, bs.rows.iter().map(|row| row.block.size));
        self.context.for_each_mut(&mut y_rows, |_, r, y_row| {
            let row = &bs.rows[r];
            let is_e_row = self.is_e_row(r);
            for cell in &row.cells[usize::from(is_e_row)..] {
                let col = bs.cols[cell.block_id];
                let a = MatRef::new(&values[cell.position..], row.block.size, col.size);
                let x_f = &x[col.position - num_cols_e..][..col.size];
                if is_e_row {
                    matrix_vector_multiply::<ROW, F>(Accumulate::Add, a, x_f, y_row);
                } else {
                    matrix_vector_multiply::<DYNAMIC, DYNAMIC>(Accumulate::Add, a, x_f, y_row);
                }
            }
        });
        Ok(())
    }

    fn left_multiply_and_accumulate_e(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        LinAlgError::check_len("x", self.num_rows(), x.len())?;
        LinAlgError::check_len("y", self.num_cols_e, y.len())?;

        let bs = self.structure();
        let values = self.matrix.values();
        let mut y_blocks = partition_mut(y, self.e_block_sizes());
        self.context.for_each_mut(&mut y_blocks, |_, e_block, y_e| {
            let Some(chunk_id) = self.chunk_of_e_block[e_block] else {
                return;
            };
            for row in &bs.rows[self.layout.chunks[chunk_id].rows()] {
                let cell = row.cells[0];
                matrix_transpose_vector_multiply::<ROW, E>(
                    Accumulate::Add,
                    MatRef::new(&values[cell.position..], row.block.size, bs.cols[e_block].size),
                    &x[row.block.range()],
                    y_e,
                );
            }
        });
        Ok(())
    }

    fn left_multiply_and_accumulate_f(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        LinAlgError::check_len("x", self.num_rows(), x.len())?;
        LinAlgError::check_len("y", self.num_cols_f, y.len())?;

        let bs = self.structure();
        let values = self.matrix.values();
        let mut y_blocks = partition_mut(y, self.f_block_sizes());
        self.context.for_each_mut(&mut y_blocks, |_, f_block, y_f| {
            let col_size = bs.cols[self.num_col_blocks_e + f_block].size;
            for &(r, c) in &self.f_transpose[f_block] {
                let row = &bs.rows[r];
                let a = MatRef::new(&values[row.cells[c].position..], row.block.size, col_size);
                let x_row = &x[row.block.range()];
                if self.is_e_row(r) {
                    matrix_transpose_vector_multiply::<ROW, F>(Accumulate::Add, a, x_row, y_f);
                } else {
                    matrix_transpose_vector_multiply::<DYNAMIC, DYNAMIC>(
                        Accumulate::Add,
                        a,
                        x_row,
                        y_f,
                    );
                }
            }
        });
        Ok(())
    }

    fn create_block_diagonal_ete(&self) -> BlockDiagonalMatrix {
        let mut m = BlockDiagonalMatrix::new(&self.e_block_sizes());
        self.fill_ete(&mut m);
        m
    }

    fn create_block_diagonal_ftf(&self) -> BlockDiagonalMatrix {
        let mut m = BlockDiagonalMatrix::new(&self.f_block_sizes());
        self.fill_ftf(&mut m);
        m
    }

    fn update_block_diagonal_ete(&self, target: &mut BlockDiagonalMatrix) -> LinAlgResult<()> {
        Self::check_diagonal_layout(target, &self.e_block_sizes())?;
        self.fill_ete(target);
        Ok(())
    }

    fn update_block_diagonal_ftf(&self, target: &mut BlockDiagonalMatrix) -> LinAlgResult<()> {
        Self::check_diagonal_layout(target, &self.f_block_sizes())?;
        self.fill_ftf(target);
        Ok(())
    }

    fn block_sizes(&self) -> BlockSizes {
        BlockSizes::new(ROW, E, F)
    }

    fn num_col_blocks_e(&self) -> usize {
        self.num_col_blocks_e
    }

    fn num_col_blocks_f(&self) -> usize {
        self.f_transpose.len()
    }

    fn num_cols_e(&self) -> usize {
        self.num_cols_e
    }

    fn num_cols_f(&self) -> usize {
        self.num_cols_f
    }

    fn num_row_blocks_e(&self) -> usize {
        self.layout.first_f_only_row
    }
}

impl<const ROW: usize, const E: usize, const F: usize> PartitionedMatrixView<'_, ROW, E, F> {
    fn fill_ete(&self, target: &mut BlockDiagonalMatrix) {
        let bs = self.structure();
        let values = self.matrix.values();
        let mut blocks = target.blocks_mut();
        self.context.for_each_mut(&mut blocks, |_, e_block, block| {
            block.fill(0.0);
            let Some(chunk_id) = self.chunk_of_e_block[e_block] else {
                return;
            };
            let e_size = bs.cols[e_block].size;
            for row in &bs.rows[self.layout.chunks[chunk_id].rows()] {
                let e = MatRef::new(&values[row.cells[0].position..], row.block.size, e_size);
                matrix_transpose_matrix_multiply::<ROW, E, ROW, E>(
                    Accumulate::Add,
                    e,
                    e,
                    &mut MatMut::new(block, e_size, e_size),
                );
            }
        });
    }

    fn fill_ftf(&self, target: &mut BlockDiagonalMatrix) {
        let bs = self.structure();
        let values = self.matrix.values();
        let mut blocks = target.blocks_mut();
        self.context.for_each_mut(&mut blocks, |_, f_block, block| {
            block.fill(0.0);
            let f_size = bs.cols[self.num_col_blocks_e + f_block].size;
            for &(r, c) in &self.f_transpose[f_block] {
                let row = &bs.rows[r];
                let f = MatRef::new(&values[row.cells[c].position..], row.block.size, f_size);
                let mut out = MatMut::new(block, f_size, f_size);
                if self.is_e_row(r) {
                    matrix_transpose_matrix_multiply::<ROW, F, ROW, F>(Accumulate::Add, f, f, &mut out);
                } else {
                    matrix_transpose_matrix_multiply::<DYNAMIC, DYNAMIC, DYNAMIC, DYNAMIC>(
                        Accumulate::Add,
                        f,
                        f,
                        &mut out,
                    );
                }
            }
        });
    }
}

fn boxed_view<'a, const ROW: usize, const E: usize, const F: usize>(
    matrix: &'a BlockSparseMatrix,
    num_eliminate_blocks: usize,
    context: &ParallelContext,
) -> LinAlgResult<Box<dyn PartitionedMatrixViewBase<'a> + 'a>> {
    Ok(Box::new(PartitionedMatrixView::<ROW, E, F>::new(
        matrix,
        num_eliminate_blocks,
        context.clone(),
    )?))
}

/// Build the view specialization matching `block_sizes`, detecting the sizes
/// from the matrix when none are given.
pub fn create_partitioned_view<'a>(
    matrix: &'a BlockSparseMatrix,
    num_eliminate_blocks: usize,
    block_sizes: Option<BlockSizes>,
    context: &ParallelContext,
) -> LinAlgResult<Box<dyn PartitionedMatrixViewBase<'a> + 'a>> {
    let sizes = block_sizes
        .unwrap_or_else(|| detect_structure(matrix.block_structure(), num_eliminate_blocks));
    debug!("Partitioned view with block sizes <{}>", sizes);
    dispatch_block_sizes!(sizes, boxed_view(matrix, num_eliminate_blocks, context))
}
