//! Block-diagonal matrices: the diagonals of EᵗE and FᵗF and their inverses.

use crate::error::{LinAlgError, LinAlgResult};
use crate::linalg::block_structure::Block;
use crate::linalg::invert_psd::invert_psd_matrix;
use crate::linalg::small_blas::{Accumulate, DYNAMIC, MatRef, matrix_vector_multiply};
use crate::parallel::{ParallelContext, partition_mut};
use nalgebra::DMatrix;

/// Square dense blocks along the diagonal, each stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockDiagonalMatrix {
    blocks: Vec<Block>,
    offsets: Vec<usize>,
    values: Vec<f64>,
}

impl BlockDiagonalMatrix {
    /// Zero matrix with one block per entry of `sizes`.
    pub fn new(sizes: &[usize]) -> Self {
        let mut blocks = Vec::with_capacity(sizes.len());
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut position = 0;
        let mut offset = 0;
        for &size in sizes {
            blocks.push(Block::new(size, position));
            offsets.push(offset);
            position += size;
            offset += size * size;
        }
        Self {
            blocks,
            offsets,
            values: vec![0.0; offset],
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_rows(&self) -> usize {
        self.blocks.last().map(|b| b.position + b.size).unwrap_or(0)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, i: usize) -> &[f64] {
        let size = self.blocks[i].size;
        &self.values[self.offsets[i]..self.offsets[i] + size * size]
    }

    pub fn block_mut(&mut self, i: usize) -> &mut [f64] {
        let size = self.blocks[i].size;
        &mut self.values[self.offsets[i]..self.offsets[i] + size * size]
    }

    /// Every block's row-major values as a separate mutable slice.
    pub fn blocks_mut(&mut self) -> Vec<&mut [f64]> {
        partition_mut(&mut self.values, self.blocks.iter().map(|b| b.size * b.size))
    }

    pub fn set_zero(&mut self) {
        self.values.fill(0.0);
    }

    /// Add `d[i]²` to the i-th diagonal entry.
    pub fn add_squared_diagonal(&mut self, d: &[f64]) -> LinAlgResult<()> {
        LinAlgError::check_len("diagonal", self.num_rows(), d.len())?;
        for (i, block) in self.blocks.iter().enumerate() {
            let values = &mut self.values[self.offsets[i]..];
            for k in 0..block.size {
                let d_k = d[block.position + k];
                values[k * block.size + k] += d_k * d_k;
            }
        }
        Ok(())
    }

    /// Replace every block by its inverse (or pseudo-inverse).
    pub fn invert_blocks(&mut self, assume_full_rank: bool, context: &ParallelContext) {
        let sizes: Vec<usize> = self.blocks.iter().map(|b| b.size).collect();
        let mut blocks = self.blocks_mut();
        context.for_each_mut(&mut blocks, |_, i, values| {
            let size = sizes[i];
            let m = DMatrix::from_row_slice(size, size, values);
            let inverse = invert_psd_matrix(assume_full_rank, &m);
            for r in 0..size {
                for c in 0..size {
                    values[r * size + c] = inverse[(r, c)];
                }
            }
        });
    }

    /// `y += M * x`
    pub fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        LinAlgError::check_len("x", self.num_rows(), x.len())?;
        LinAlgError::check_len("y", self.num_rows(), y.len())?;
        for (i, block) in self.blocks.iter().enumerate() {
            matrix_vector_multiply::<DYNAMIC, DYNAMIC>(
                Accumulate::Add,
                MatRef::new(&self.values[self.offsets[i]..], block.size, block.size),
                &x[block.range()],
                &mut y[block.range()],
            );
        }
        Ok(())
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let n = self.num_rows();
        let mut dense = DMatrix::zeros(n, n);
        for (i, block) in self.blocks.iter().enumerate() {
            let values = self.block(i);
            for r in 0..block.size {
                for c in 0..block.size {
                    dense[(block.position + r, block.position + c)] = values[r * block.size + c];
                }
            }
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockDiagonalMatrix {
        let mut m = BlockDiagonalMatrix::new(&[2, 1]);
        m.block_mut(0).copy_from_slice(&[4.0, 1.0, 1.0, 3.0]);
        m.block_mut(1).copy_from_slice(&[2.0]);
        m
    }

    #[test]
    fn test_layout() {
        let m = sample();
        assert_eq!(m.num_blocks(), 2);
        assert_eq!(m.num_rows(), 3);
        assert_eq!(m.blocks()[1], Block::new(1, 2));
        let dense = m.to_dense();
        assert_eq!(dense[(0, 1)], 1.0);
        assert_eq!(dense[(2, 2)], 2.0);
        assert_eq!(dense[(0, 2)], 0.0);
    }

    #[test]
    fn test_add_squared_diagonal() {
        let mut m = sample();
        m.add_squared_diagonal(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(m.block(0), &[5.0, 1.0, 1.0, 7.0]);
        assert_eq!(m.block(1), &[11.0]);
        assert!(m.add_squared_diagonal(&[1.0]).is_err());
    }

    #[test]
    fn test_invert_blocks() {
        for threads in [1, 2] {
            let context = ParallelContext::new(threads).unwrap();
            let mut m = sample();
            let original = m.to_dense();
            m.invert_blocks(true, &context);
            let product = original * m.to_dense();
            assert!((product - DMatrix::identity(3, 3)).abs().max() < 1e-12);
        }
    }

    #[test]
    fn test_right_multiply_and_accumulate() {
        let m = sample();
        let mut y = vec![1.0, 1.0, 1.0];
        m.right_multiply_and_accumulate(&[1.0, 2.0, 3.0], &mut y).unwrap();
        assert_eq!(y, vec![7.0, 8.0, 7.0]);
    }
}
