//! Storage for the reduced (Schur complement) system.
//!
//! The eliminator writes into a [`BlockRandomAccessMatrix`] cell by cell.
//! Only the upper triangle (`row <= col`) is addressed, and only the cells an
//! implementation chooses to store are written: a dense matrix stores every
//! upper cell, a sparse matrix a caller-chosen pattern, and a diagonal matrix
//! only the diagonal cells.
//!
//! Each cell carries its own [`Mutex`] so several workers may accumulate into
//! the matrix through a shared reference. A single worker holding `&mut`
//! access goes through [`CellInfo::values_mut`] instead and never locks.

use crate::error::{LinAlgError, LinAlgResult};
use crate::linalg::block_structure::{CompressedRowBlockStructure, compute_chunks};
use crate::linalg::invert_psd::invert_psd_block;
use crate::linalg::small_blas::{Accumulate, DYNAMIC, MatRef, matrix_vector_multiply};
use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DMatrix;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if another worker panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One stored cell: a `rows x cols` row-major block behind a mutex.
#[derive(Debug)]
pub struct CellInfo {
    rows: usize,
    cols: usize,
    values: Mutex<Vec<f64>>,
}

impl CellInfo {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            values: Mutex::new(vec![0.0; rows * cols]),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<f64>> {
        lock(&self.values)
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        self.values
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_zero(&mut self) {
        self.values_mut().fill(0.0);
    }
}

/// Symmetric block matrix addressed by `(row_block, col_block)`, upper triangle only.
pub trait BlockRandomAccessMatrix: Send + Sync + Debug {
    /// Size of each row (and column) block.
    fn block_sizes(&self) -> &[usize];

    /// Stored cell at `(row, col)`, `None` when the cell is not stored or
    /// `row > col`.
    fn get_cell(&self, row: usize, col: usize) -> Option<&CellInfo>;

    fn get_cell_mut(&mut self, row: usize, col: usize) -> Option<&mut CellInfo>;

    /// Visit every stored cell as `(row, col, cell)`.
    fn for_each_cell(&self, f: &mut dyn FnMut(usize, usize, &CellInfo));

    fn set_zero(&mut self);

    fn num_rows(&self) -> usize {
        self.block_sizes().iter().sum()
    }

    /// Dense symmetric copy built from the stored upper-triangular cells.
    fn to_dense(&self) -> DMatrix<f64> {
        let offsets = block_offsets(self.block_sizes());
        let n = self.num_rows();
        let mut dense = DMatrix::zeros(n, n);
        self.for_each_cell(&mut |row, col, cell| {
            let values = cell.lock();
            for r in 0..cell.rows() {
                for c in 0..cell.cols() {
                    let value = values[r * cell.cols() + c];
                    dense[(offsets[row] + r, offsets[col] + c)] = value;
                    dense[(offsets[col] + c, offsets[row] + r)] = value;
                }
            }
        });
        dense
    }
}

fn block_offsets(sizes: &[usize]) -> Vec<usize> {
    sizes
        .iter()
        .scan(0, |offset, &size| {
            let start = *offset;
            *offset += size;
            Some(start)
        })
        .collect()
}

/// Every upper-triangular cell is stored.
#[derive(Debug)]
pub struct BlockRandomAccessDenseMatrix {
    block_sizes: Vec<usize>,
    cells: Vec<CellInfo>,
}

impl BlockRandomAccessDenseMatrix {
    pub fn new(block_sizes: &[usize]) -> Self {
        let n = block_sizes.len();
        let mut cells = Vec::with_capacity(n * (n + 1) / 2);
        for r in 0..n {
            for c in r..n {
                cells.push(CellInfo::new(block_sizes[r], block_sizes[c]));
            }
        }
        Self {
            block_sizes: block_sizes.to_vec(),
            cells,
        }
    }

    fn index(&self, row: usize, col: usize) -> Option<usize> {
        let n = self.block_sizes.len();
        if row > col || col >= n {
            return None;
        }
        // rows 0..row hold n + (n - 1) + ... + (n - row + 1) cells
        Some(row * (2 * n - row + 1) / 2 + (col - row))
    }
}

impl BlockRandomAccessMatrix for BlockRandomAccessDenseMatrix {
    fn block_sizes(&self) -> &[usize] {
        &self.block_sizes
    }

    fn get_cell(&self, row: usize, col: usize) -> Option<&CellInfo> {
        self.index(row, col).map(|i| &self.cells[i])
    }

    fn get_cell_mut(&mut self, row: usize, col: usize) -> Option<&mut CellInfo> {
        self.index(row, col).map(|i| &mut self.cells[i])
    }

    fn for_each_cell(&self, f: &mut dyn FnMut(usize, usize, &CellInfo)) {
        let n = self.block_sizes.len();
        let mut cells = self.cells.iter();
        for r in 0..n {
            for c in r..n {
                if let Some(cell) = cells.next() {
                    f(r, c, cell);
                }
            }
        }
    }

    fn set_zero(&mut self) {
        self.cells.iter_mut().for_each(CellInfo::set_zero);
    }
}

/// Only a caller-chosen set of cells is stored.
#[derive(Debug)]
pub struct BlockRandomAccessSparseMatrix {
    block_sizes: Vec<usize>,
    pairs: Vec<(usize, usize)>,
    index: HashMap<(usize, usize), usize>,
    cells: Vec<CellInfo>,
}

impl BlockRandomAccessSparseMatrix {
    /// Store the cells named in `pairs`. Pairs are normalized to `row <= col`
    /// and duplicates are dropped.
    pub fn new(
        block_sizes: &[usize],
        pairs: impl IntoIterator<Item = (usize, usize)>,
    ) -> LinAlgResult<Self> {
        let n = block_sizes.len();
        let mut sorted = BTreeSet::new();
        for (a, b) in pairs {
            if a >= n || b >= n {
                return Err(LinAlgError::InvalidInput(format!(
                    "cell ({a}, {b}) is outside a {n}x{n} block matrix"
                )));
            }
            sorted.insert((a.min(b), a.max(b)));
        }

        let pairs: Vec<(usize, usize)> = sorted.into_iter().collect();
        let index = pairs.iter().enumerate().map(|(i, &pair)| (pair, i)).collect();
        let cells = pairs
            .iter()
            .map(|&(r, c)| CellInfo::new(block_sizes[r], block_sizes[c]))
            .collect();
        Ok(Self {
            block_sizes: block_sizes.to_vec(),
            pairs,
            index,
            cells,
        })
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Full symmetric matrix in faer's compressed column format.
    pub fn to_sparse_col_mat(&self) -> LinAlgResult<SparseColMat<usize, f64>> {
        let offsets = block_offsets(&self.block_sizes);
        let mut triplets = Vec::new();
        for (&(row, col), cell) in self.pairs.iter().zip(&self.cells) {
            let values = cell.lock();
            for r in 0..cell.rows() {
                for c in 0..cell.cols() {
                    let value = values[r * cell.cols() + c];
                    let (i, j) = (offsets[row] + r, offsets[col] + c);
                    triplets.push(Triplet::new(i, j, value));
                    if row != col {
                        triplets.push(Triplet::new(j, i, value));
                    }
                }
            }
        }
        let n = self.num_rows();
        SparseColMat::try_new_from_triplets(n, n, &triplets)
            .map_err(|e| LinAlgError::SparseMatrixCreation(format!("reduced system: {:?}", e)))
    }
}

impl BlockRandomAccessMatrix for BlockRandomAccessSparseMatrix {
    fn block_sizes(&self) -> &[usize] {
        &self.block_sizes
    }

    fn get_cell(&self, row: usize, col: usize) -> Option<&CellInfo> {
        self.index.get(&(row, col)).map(|&i| &self.cells[i])
    }

    fn get_cell_mut(&mut self, row: usize, col: usize) -> Option<&mut CellInfo> {
        self.index.get(&(row, col)).map(|&i| &mut self.cells[i])
    }

    fn for_each_cell(&self, f: &mut dyn FnMut(usize, usize, &CellInfo)) {
        for (&(row, col), cell) in self.pairs.iter().zip(&self.cells) {
            f(row, col, cell);
        }
    }

    fn set_zero(&mut self) {
        self.cells.iter_mut().for_each(CellInfo::set_zero);
    }
}

/// Only the diagonal cells are stored.
#[derive(Debug)]
pub struct BlockRandomAccessDiagonalMatrix {
    block_sizes: Vec<usize>,
    offsets: Vec<usize>,
    cells: Vec<CellInfo>,
}

impl BlockRandomAccessDiagonalMatrix {
    pub fn new(block_sizes: &[usize]) -> Self {
        Self {
            block_sizes: block_sizes.to_vec(),
            offsets: block_offsets(block_sizes),
            cells: block_sizes
                .iter()
                .map(|&size| CellInfo::new(size, size))
                .collect(),
        }
    }

    /// Replace every diagonal cell by its inverse (or pseudo-inverse).
    pub fn invert(&mut self, assume_full_rank: bool) {
        let mut inverse = Vec::new();
        for cell in &mut self.cells {
            let size = cell.rows();
            inverse.resize(size * size, 0.0);
            let values = cell.values_mut();
            invert_psd_block(assume_full_rank, values, size, &mut inverse);
            values.copy_from_slice(&inverse);
        }
    }

    /// `y += M * x`
    pub fn right_multiply_and_accumulate(&self, x: &[f64], y: &mut [f64]) -> LinAlgResult<()> {
        let n = self.num_rows();
        LinAlgError::check_len("x", n, x.len())?;
        LinAlgError::check_len("y", n, y.len())?;
        for (cell, &offset) in self.cells.iter().zip(&self.offsets) {
            let size = cell.rows();
            let values = cell.lock();
            matrix_vector_multiply::<DYNAMIC, DYNAMIC>(
                Accumulate::Add,
                MatRef::new(&values, size, size),
                &x[offset..offset + size],
                &mut y[offset..offset + size],
            );
        }
        Ok(())
    }
}

impl BlockRandomAccessMatrix for BlockRandomAccessDiagonalMatrix {
    fn block_sizes(&self) -> &[usize] {
        &self.block_sizes
    }

    fn get_cell(&self, row: usize, col: usize) -> Option<&CellInfo> {
        if row == col { self.cells.get(row) } else { None }
    }

    fn get_cell_mut(&mut self, row: usize, col: usize) -> Option<&mut CellInfo> {
        if row == col {
            self.cells.get_mut(row)
        } else {
            None
        }
    }

    fn for_each_cell(&self, f: &mut dyn FnMut(usize, usize, &CellInfo)) {
        for (i, cell) in self.cells.iter().enumerate() {
            f(i, i, cell);
        }
    }

    fn set_zero(&mut self) {
        self.cells.iter_mut().for_each(CellInfo::set_zero);
    }
}

/// Upper-triangular cell pairs (in F-block indices) that are non-zero in the
/// Schur complement: every diagonal cell, every pair of F-blocks sharing a
/// chunk, and every pair of F-blocks sharing an F-only row.
pub fn schur_cell_pairs(
    bs: &CompressedRowBlockStructure,
    num_eliminate_blocks: usize,
) -> LinAlgResult<Vec<(usize, usize)>> {
    let layout = compute_chunks(bs, num_eliminate_blocks)?;
    let num_f_blocks = bs.cols.len() - num_eliminate_blocks;
    let mut pairs: BTreeSet<(usize, usize)> = (0..num_f_blocks).map(|i| (i, i)).collect();

    let mut add_all = |f_blocks: &BTreeSet<usize>| {
        for &a in f_blocks {
            for &b in f_blocks.range(a..) {
                pairs.insert((a, b));
            }
        }
    };

    for chunk in &layout.chunks {
        let f_blocks: BTreeSet<usize> = bs.rows[chunk.rows()]
            .iter()
            .flat_map(|row| row.cells[1..].iter())
            .map(|cell| cell.block_id - num_eliminate_blocks)
            .collect();
        add_all(&f_blocks);
    }
    for row in &bs.rows[layout.first_f_only_row..] {
        let f_blocks: BTreeSet<usize> = row
            .cells
            .iter()
            .map(|cell| cell.block_id - num_eliminate_blocks)
            .collect();
        add_all(&f_blocks);
    }

    Ok(pairs.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_cells_cover_upper_triangle() {
        let m = BlockRandomAccessDenseMatrix::new(&[2, 3, 1]);
        assert_eq!(m.num_rows(), 6);
        let mut count = 0;
        m.for_each_cell(&mut |r, c, cell| {
            assert!(r <= c);
            assert_eq!(cell.rows(), m.block_sizes()[r]);
            assert_eq!(cell.cols(), m.block_sizes()[c]);
            count += 1;
        });
        assert_eq!(count, 6);
        assert!(m.get_cell(1, 0).is_none());
        assert!(m.get_cell(2, 3).is_none());
        assert_eq!(m.get_cell(1, 2).map(|c| (c.rows(), c.cols())), Some((3, 1)));
    }

    #[test]
    fn test_dense_to_dense_symmetrizes() {
        let mut m = BlockRandomAccessDenseMatrix::new(&[1, 2]);
        if let Some(cell) = m.get_cell_mut(0, 1) {
            cell.values_mut().copy_from_slice(&[5.0, 6.0]);
        }
        if let Some(cell) = m.get_cell(1, 1) {
            cell.lock().copy_from_slice(&[1.0, 2.0, 2.0, 3.0]);
        }
        let dense = m.to_dense();
        assert_eq!(dense[(0, 1)], 5.0);
        assert_eq!(dense[(1, 0)], 5.0);
        assert_eq!(dense[(2, 0)], 6.0);
        assert_eq!(dense[(2, 1)], 2.0);

        m.set_zero();
        assert_eq!(m.to_dense().abs().max(), 0.0);
    }

    #[test]
    fn test_sparse_normalizes_pairs() {
        let m = BlockRandomAccessSparseMatrix::new(&[1, 1, 1], [(1, 0), (0, 1), (2, 2)]).unwrap();
        assert_eq!(m.num_cells(), 2);
        assert!(m.get_cell(0, 1).is_some());
        assert!(m.get_cell(1, 1).is_none());
        assert!(BlockRandomAccessSparseMatrix::new(&[1], [(0, 1)]).is_err());
    }

    #[test]
    fn test_sparse_to_sparse_col_mat_is_symmetric() {
        let mut m = BlockRandomAccessSparseMatrix::new(&[1, 2], [(0, 0), (0, 1)]).unwrap();
        if let Some(cell) = m.get_cell_mut(0, 1) {
            cell.values_mut().copy_from_slice(&[3.0, 4.0]);
        }
        let sparse = m.to_sparse_col_mat().unwrap();
        assert_eq!(sparse.nrows(), 3);
        let col0: f64 = sparse.val_of_col(0).iter().sum();
        assert_eq!(col0, 7.0);
    }

    #[test]
    fn test_diagonal_invert_and_multiply() {
        let mut m = BlockRandomAccessDiagonalMatrix::new(&[2, 1]);
        assert!(m.get_cell(0, 1).is_none());
        if let Some(cell) = m.get_cell_mut(0, 0) {
            cell.values_mut().copy_from_slice(&[2.0, 0.0, 0.0, 4.0]);
        }
        if let Some(cell) = m.get_cell_mut(1, 1) {
            cell.values_mut()[0] = 5.0;
        }
        m.invert(true);
        let mut y = vec![0.0; 3];
        m.right_multiply_and_accumulate(&[2.0, 4.0, 5.0], &mut y).unwrap();
        for value in y {
            assert!((value - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_schur_cell_pairs() {
        // E0 sees F0, F1; E1 sees F2; one F-only row couples F1 and F2.
        let bs = CompressedRowBlockStructure::from_layout(
            &[3, 3, 6, 6, 6],
            &[
                (2, vec![0, 2]),
                (2, vec![0, 3]),
                (2, vec![1, 4]),
                (1, vec![3, 4]),
            ],
        )
        .unwrap();
        let pairs = schur_cell_pairs(&bs, 2).unwrap();
        assert_eq!(pairs, vec![(0, 0), (0, 1), (1, 1), (1, 2), (2, 2)]);
    }
}
