//! Block-sparse matrix with row-major cell values.

use crate::error::{LinAlgError, LinAlgResult};
use crate::linalg::block_structure::CompressedRowBlockStructure;
use crate::linalg::small_blas::{
    Accumulate, DYNAMIC, MatRef, matrix_transpose_vector_multiply, matrix_vector_multiply,
};
use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DMatrix;
use std::sync::Arc;

/// Matrix whose non-zeros are dense cells placed by a
/// [`CompressedRowBlockStructure`].
///
/// The structure is shared, so matrices with the same sparsity pattern can be
/// recognized with [`BlockSparseMatrix::shares_structure`].
#[derive(Debug, Clone)]
pub struct BlockSparseMatrix {
    structure: Arc<CompressedRowBlockStructure>,
    values: Vec<f64>,
}

impl BlockSparseMatrix {
    /// All-zero matrix with the given structure.
    pub fn new(structure: Arc<CompressedRowBlockStructure>) -> Self {
        let values = vec![0.0; structure.num_nonzeros()];
        Self { structure, values }
    }

    pub fn from_values(
        structure: Arc<CompressedRowBlockStructure>,
        values: Vec<f64>,
    ) -> LinAlgResult<Self> {
        LinAlgError::check_len("cell values", structure.num_nonzeros(), values.len())?;
        Ok(Self { structure, values })
    }

    pub fn block_structure(&self) -> &Arc<CompressedRowBlockStructure> {
        &self.structure
    }

    /// True when both matrices use the same structure object.
    pub fn shares_structure(&self, other: &CompressedRowBlockStructure) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.structure), other)
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn num_rows(&self) -> usize {
        self.structure.num_rows()
    }

    pub fn num_cols(&self) -> usize {
        self.structure.num_cols()
    }

    pub fn num_nonzeros(&self) -> usize {
        self.values.len()
    }

    /// Row-major values of cell `cell` in row block `row_block`.
    pub fn cell_values(&self, row_block: usize, cell: usize) -> &[f64] {
        let row = &self.structure.rows[row_block];
        let cell = row.cells[cell];
        let len = row.block.size * self.structure.cols[cell.block_id].size;
        &self.values[cell.position..cell.position + len]
    }

    pub fn cell_values_mut(&mut self, row_block: usize, cell: usize) -> &mut [f64] {
        let row = &self.structure.rows[row_block];
        let cell = row.cells[cell];
        let len = row.block.size * self.structure.cols[cell.block_id].size;
        &mut self.values[cell.position..cell.position + len]
    }

    pub fn set_zero(&mut self) {
        self.values.fill(0.0);
    }

    /// `y += A * x`
    pub fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        LinAlgError::check_len("x", self.num_cols(), x.len())?;
        LinAlgError::check_len("y", self.num_rows(), y.len())?;

        for row in &self.structure.rows {
            let y_row = &mut y[row.block.range()];
            for cell in &row.cells {
                let col = self.structure.cols[cell.block_id];
                let a = MatRef::new(&self.values[cell.position..], row.block.size, col.size);
                matrix_vector_multiply::<DYNAMIC, DYNAMIC>(
                    Accumulate::Add,
                    a,
                    &x[col.range()],
                    y_row,
                );
            }
        }
        Ok(())
    }

    /// `y += Aᵗ * x`
    pub fn left_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        LinAlgError::check_len("x", self.num_rows(), x.len())?;
        LinAlgError::check_len("y", self.num_cols(), y.len())?;

        for row in &self.structure.rows {
            let x_row = &x[row.block.range()];
            for cell in &row.cells {
                let col = self.structure.cols[cell.block_id];
                let a = MatRef::new(&self.values[cell.position..], row.block.size, col.size);
                matrix_transpose_vector_multiply::<DYNAMIC, DYNAMIC>(
                    Accumulate::Add,
                    a,
                    x_row,
                    &mut y[col.range()],
                );
            }
        }
        Ok(())
    }

    /// Dense copy, for tests and small reference solves.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.num_rows(), self.num_cols());
        self.for_each_entry(|r, c, v| dense[(r, c)] = v);
        dense
    }

    pub fn to_sparse_col_mat(&self) -> LinAlgResult<SparseColMat<usize, f64>> {
        let mut triplets = Vec::with_capacity(self.values.len());
        self.for_each_entry(|r, c, v| triplets.push(Triplet::new(r, c, v)));
        SparseColMat::try_new_from_triplets(self.num_rows(), self.num_cols(), &triplets)
            .map_err(|e| LinAlgError::SparseMatrixCreation(format!("A: {:?}", e)))
    }

    fn for_each_entry(&self, mut f: impl FnMut(usize, usize, f64)) {
        for row in &self.structure.rows {
            for cell in &row.cells {
                let col = self.structure.cols[cell.block_id];
                for r in 0..row.block.size {
                    for c in 0..col.size {
                        let value = self.values[cell.position + r * col.size + c];
                        f(row.block.position + r, col.position + c, value);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn sample_matrix() -> BlockSparseMatrix {
        let bs = CompressedRowBlockStructure::from_layout(
            &[2, 3],
            &[(2, vec![0, 1]), (1, vec![1])],
        )
        .unwrap();
        let n = bs.num_nonzeros();
        let values = (0..n).map(|i| i as f64 * 0.5 - 2.0).collect();
        BlockSparseMatrix::from_values(Arc::new(bs), values).unwrap()
    }

    #[test]
    fn test_dimensions() {
        let a = sample_matrix();
        assert_eq!(a.num_rows(), 3);
        assert_eq!(a.num_cols(), 5);
        assert_eq!(a.num_nonzeros(), 4 + 6 + 3);
    }

    #[test]
    fn test_from_values_length_checked() {
        let a = sample_matrix();
        let result = BlockSparseMatrix::from_values(a.block_structure().clone(), vec![0.0; 3]);
        assert!(matches!(
            result,
            Err(LinAlgError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_cell_values_row_major() {
        let a = sample_matrix();
        let dense = a.to_dense();
        let cell = a.cell_values(0, 1);
        assert_eq!(cell.len(), 6);
        assert_eq!(cell[4], dense[(1, 3)]);
        assert_eq!(dense[(2, 0)], 0.0);
    }

    #[test]
    fn test_multiply_matches_dense() {
        let a = sample_matrix();
        let dense = a.to_dense();

        let x = [1.0, -1.0, 0.5, 2.0, 3.0];
        let mut y = vec![1.0; 3];
        a.right_multiply_and_accumulate(&x, &mut y).unwrap();
        let expected = &dense * DVector::from_column_slice(&x);
        for i in 0..3 {
            assert!((y[i] - 1.0 - expected[i]).abs() < 1e-12);
        }

        let x = [0.3, -0.7, 1.1];
        let mut y = vec![0.0; 5];
        a.left_multiply_and_accumulate(&x, &mut y).unwrap();
        let expected = dense.transpose() * DVector::from_column_slice(&x);
        for i in 0..5 {
            assert!((y[i] - expected[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_multiply_rejects_wrong_lengths() {
        let a = sample_matrix();
        let mut y = vec![0.0; 3];
        assert!(a.right_multiply_and_accumulate(&[1.0; 4], &mut y).is_err());
    }

    #[test]
    fn test_to_sparse_col_mat() {
        let a = sample_matrix();
        let sparse = a.to_sparse_col_mat().unwrap();
        assert_eq!(sparse.nrows(), 3);
        assert_eq!(sparse.ncols(), 5);
        let nnz: usize = (0..sparse.ncols()).map(|c| sparse.val_of_col(c).len()).sum();
        assert_eq!(nnz, a.num_nonzeros());
    }

    #[test]
    fn test_shares_structure() {
        let a = sample_matrix();
        let b = BlockSparseMatrix::new(a.block_structure().clone());
        assert!(b.shares_structure(a.block_structure()));
        let copy = (**a.block_structure()).clone();
        assert!(!b.shares_structure(&copy));
    }
}
