//! Explicit Schur complement elimination.
//!
//! Given `A = [E F]`, `b` and an optional damping diagonal `D`, the
//! eliminator forms the reduced system over the F-blocks
//!
//! ```text
//! S = FᵗF - FᵗE (EᵗE)⁻¹ EᵗF
//! r = Fᵗb - FᵗE (EᵗE)⁻¹ Eᵗb
//! ```
//!
//! where EᵗE and FᵗF include `D²` on their diagonals. Only the cells the
//! output [`BlockRandomAccessMatrix`] stores are written, so the same code
//! produces the full reduced matrix, a sparse pattern of it, or only its block
//! diagonal (Schur-Jacobi preconditioning).
//!
//! EᵗE is block diagonal, one block per E-block, so elimination runs chunk by
//! chunk: a chunk is the run of rows sharing an E-block and is the unit of
//! parallel work. Rows touching only F-blocks are added in a final sequential
//! pass.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──init──> ready ──eliminate──> ready (inverses cached if enabled)
//!                 │  ^                  │
//!                 │  └─back_substitute──┘
//!                 └──init again when the block structure changes
//! ```

use crate::error::{LinAlgError, LinAlgResult};
use crate::linalg::block_random_access::{BlockRandomAccessMatrix, lock};
use crate::linalg::block_sparse::BlockSparseMatrix;
use crate::linalg::block_structure::{
    Block, BlockSizes, CompressedRow, CompressedRowBlockStructure, compute_chunks,
    detect_structure, validate_block_sizes,
};
use crate::linalg::invert_psd::invert_psd_block;
use crate::linalg::single_f_eliminator::SchurEliminatorForOneFBlock;
use crate::linalg::small_blas::{
    Accumulate, DYNAMIC, MatMut, MatRef, matrix_matrix_multiply,
    matrix_transpose_matrix_multiply, matrix_transpose_vector_multiply, matrix_vector_multiply,
};
use crate::parallel::{ParallelContext, partition_mut};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace};

/// How concurrent writes into the reduced system are synchronized.
///
/// Chosen once in `init` from the thread count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingStrategy {
    /// Single worker with direct `&mut` access. Nothing is locked.
    Exclusive,
    /// Several workers. Every lhs cell and every rhs F-block is guarded by its
    /// own mutex.
    PerTarget,
}

impl LockingStrategy {
    pub fn for_context(context: &ParallelContext) -> Self {
        if context.is_parallel() {
            LockingStrategy::PerTarget
        } else {
            LockingStrategy::Exclusive
        }
    }
}

/// Configuration for [`create_schur_eliminator`].
#[derive(Debug, Clone)]
pub struct SchurEliminatorOptions {
    pub num_eliminate_blocks: usize,
    /// Invert EᵗE blocks exactly instead of pseudo-inverting them.
    pub assume_full_rank_ete: bool,
    /// Specialization to use; detected from the structure when `None`.
    pub block_sizes: Option<BlockSizes>,
    /// Keep the inverted EᵗE blocks of `eliminate` for `back_substitute`.
    pub cache_ete_inverses: bool,
    pub use_single_f_block_fast_path: bool,
    pub context: ParallelContext,
}

impl Default for SchurEliminatorOptions {
    fn default() -> Self {
        Self {
            num_eliminate_blocks: 0,
            assume_full_rank_ete: true,
            block_sizes: None,
            cache_ete_inverses: false,
            use_single_f_block_fast_path: true,
            context: ParallelContext::sequential(),
        }
    }
}

impl SchurEliminatorOptions {
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

    pub fn with_context(mut self, context: ParallelContext) -> Self {
        self.context = context;
        self
    }
}

/// Explicit elimination of the E-blocks.
pub trait SchurEliminatorBase: Send + Sync + Debug {
    /// Analyze `bs` and size the scratch storage. Must be called again
    /// whenever the block structure changes.
    fn init(
        &mut self,
        num_eliminate_blocks: usize,
        assume_full_rank_ete: bool,
        bs: &CompressedRowBlockStructure,
    ) -> LinAlgResult<()>;

    /// Zero `lhs` and `rhs` and fill them with the reduced system. Without `b`
    /// only `lhs` is formed and `rhs` is left zero.
    fn eliminate(
        &mut self,
        a: &BlockSparseMatrix,
        b: Option<&[f64]>,
        d: Option<&[f64]>,
        lhs: &mut dyn BlockRandomAccessMatrix,
        rhs: &mut [f64],
    ) -> LinAlgResult<()>;

    /// Given the reduced solution `z`, write `y = (EᵗE)⁻¹ (Eᵗb - EᵗF z)` over
    /// the E columns.
    fn back_substitute(
        &self,
        a: &BlockSparseMatrix,
        b: &[f64],
        d: Option<&[f64]>,
        z: &[f64],
        y: &mut [f64],
    ) -> LinAlgResult<()>;

    fn block_sizes(&self) -> BlockSizes;
}

/// Inverted EᵗE blocks from the last `eliminate`, one slot per chunk.
#[derive(Debug, Default)]
pub(crate) struct InverseCache {
    offsets: Vec<usize>,
    values: Vec<f64>,
    valid: bool,
}

impl InverseCache {
    pub(crate) fn reset(&mut self, e_block_sizes: impl IntoIterator<Item = usize>) {
        self.offsets.clear();
        self.offsets.push(0);
        let mut total = 0;
        for size in e_block_sizes {
            total += size * size;
            self.offsets.push(total);
        }
        self.values = vec![0.0; total];
        self.valid = false;
    }

    pub(crate) fn slots_mut(&mut self) -> Vec<&mut [f64]> {
        let lengths: Vec<usize> = self.offsets.windows(2).map(|w| w[1] - w[0]).collect();
        partition_mut(&mut self.values, lengths)
    }

    pub(crate) fn get(&self, chunk_id: usize) -> Option<&[f64]> {
        if !self.valid {
            return None;
        }
        Some(&self.values[self.offsets[chunk_id]..self.offsets[chunk_id + 1]])
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }
}

/// Chunk of E-rows with the offsets of its EᵗF blocks in the scratch buffer.
#[derive(Debug, Clone)]
struct Chunk {
    e_block: usize,
    start: usize,
    num_rows: usize,
    /// F column block id -> offset of its EᵗF block.
    buffer_layout: BTreeMap<usize, usize>,
    buffer_size: usize,
}

impl Chunk {
    fn rows(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.num_rows
    }
}

#[derive(Debug)]
struct EliminationPlan {
    num_eliminate_blocks: usize,
    assume_full_rank_ete: bool,
    chunks: Vec<Chunk>,
    chunk_of_e_block: Vec<Option<usize>>,
    first_f_only_row: usize,
    /// Position and size of every F-block inside the reduced system.
    lhs_row_layout: Vec<Block>,
    num_cols_e: usize,
    /// Copy of the structure passed to `init`.
    structure: CompressedRowBlockStructure,
    locking: LockingStrategy,
}

impl EliminationPlan {
    fn num_cols_f(&self) -> usize {
        self.lhs_row_layout
            .last()
            .map(|b| b.position + b.size)
            .unwrap_or(0)
    }

    fn check_matrix(&self, a: &BlockSparseMatrix) -> LinAlgResult<()> {
        check_same_structure(&self.structure, a)
    }

    fn check_lhs(&self, lhs: &dyn BlockRandomAccessMatrix) -> LinAlgResult<()> {
        let sizes = lhs.block_sizes();
        let matches = sizes.len() == self.lhs_row_layout.len()
            && sizes.iter().zip(&self.lhs_row_layout).all(|(&s, b)| s == b.size);
        if matches {
            Ok(())
        } else {
            Err(LinAlgError::InvalidInput(
                "lhs block layout does not match the F-blocks".to_string(),
            ))
        }
    }
}

/// Per-thread scratch, sized once in `init`.
#[derive(Debug, Default)]
struct ThreadScratch {
    ete: Vec<f64>,
    inverse_ete: Vec<f64>,
    g: Vec<f64>,
    inverse_ete_g: Vec<f64>,
    /// EᵗF of the current chunk, one block per F-block.
    buffer: Vec<f64>,
    /// (EᵗF_i)ᵗ (EᵗE)⁻¹ for the F-block being processed.
    outer: Vec<f64>,
    sj: Vec<f64>,
}

impl ThreadScratch {
    fn new(max_e: usize, max_f: usize, max_row: usize, buffer_size: usize) -> Self {
        Self {
            ete: vec![0.0; max_e * max_e],
            inverse_ete: vec![0.0; max_e * max_e],
            g: vec![0.0; max_e],
            inverse_ete_g: vec![0.0; max_e],
            buffer: vec![0.0; buffer_size],
            outer: vec![0.0; max_f * max_e],
            sj: vec![0.0; max_row],
        }
    }
}

/// Write access to the reduced lhs.
trait LhsWriter {
    /// Run `f` on the values of cell `(row, col)` if the lhs stores it.
    fn update_cell(&mut self, row: usize, col: usize, f: impl FnOnce(&mut [f64]));
}

/// Write access to the reduced rhs.
trait RhsWriter {
    fn update_block(&mut self, f_block: usize, f: impl FnOnce(&mut [f64]));
}

struct ExclusiveLhs<'a> {
    lhs: &'a mut dyn BlockRandomAccessMatrix,
}

impl LhsWriter for ExclusiveLhs<'_> {
    fn update_cell(&mut self, row: usize, col: usize, f: impl FnOnce(&mut [f64])) {
        if let Some(cell) = self.lhs.get_cell_mut(row, col) {
            f(cell.values_mut());
        }
    }
}

#[derive(Clone, Copy)]
struct LockingLhs<'a> {
    lhs: &'a dyn BlockRandomAccessMatrix,
}

impl LhsWriter for LockingLhs<'_> {
    fn update_cell(&mut self, row: usize, col: usize, f: impl FnOnce(&mut [f64])) {
        if let Some(cell) = self.lhs.get_cell(row, col) {
            f(&mut cell.lock());
        }
    }
}

struct ExclusiveRhs<'a> {
    rhs: &'a mut [f64],
    layout: &'a [Block],
}

impl RhsWriter for ExclusiveRhs<'_> {
    fn update_block(&mut self, f_block: usize, f: impl FnOnce(&mut [f64])) {
        f(&mut self.rhs[self.layout[f_block].range()]);
    }
}

#[derive(Clone, Copy)]
struct LockingRhs<'a, 'r> {
    blocks: &'a [Mutex<&'r mut [f64]>],
}

impl RhsWriter for LockingRhs<'_, '_> {
    fn update_block(&mut self, f_block: usize, f: impl FnOnce(&mut [f64])) {
        let mut guard = lock(&self.blocks[f_block]);
        f(&mut **guard);
    }
}

/// `lhs += F_iᵗ F_j` for every pair of F cells `i <= j` of one row, starting
/// at cell `first_f_cell`.
fn row_outer_product<const R: usize, const C: usize>(
    bs: &CompressedRowBlockStructure,
    values: &[f64],
    row: &CompressedRow,
    first_f_cell: usize,
    num_eliminate_blocks: usize,
    lhs: &mut impl LhsWriter,
) {
    let f_cells = &row.cells[first_f_cell..];
    for (i, cell1) in f_cells.iter().enumerate() {
        let block1 = cell1.block_id - num_eliminate_blocks;
        let size1 = bs.cols[cell1.block_id].size;
        let f1 = MatRef::new(&values[cell1.position..], row.block.size, size1);
        for cell2 in &f_cells[i..] {
            let block2 = cell2.block_id - num_eliminate_blocks;
            let size2 = bs.cols[cell2.block_id].size;
            let f2 = MatRef::new(&values[cell2.position..], row.block.size, size2);
            lhs.update_cell(block1, block2, |cell| {
                matrix_transpose_matrix_multiply::<R, C, R, C>(
                    Accumulate::Add,
                    f1,
                    f2,
                    &mut MatMut::new(cell, size1, size2),
                );
            });
        }
    }
}

/// Add `D²` of an F-block to its diagonal cell.
fn add_f_block_diagonal(
    bs: &CompressedRowBlockStructure,
    d: &[f64],
    num_eliminate_blocks: usize,
    f_block: usize,
    lhs: &mut impl LhsWriter,
) {
    let col = bs.cols[num_eliminate_blocks + f_block];
    lhs.update_cell(f_block, f_block, |cell| {
        for k in 0..col.size {
            let d_k = d[col.position + k];
            cell[k * col.size + k] += d_k * d_k;
        }
    });
}

/// Rows that reference no E-block: `lhs += FᵗF`, `rhs += Fᵗb`.
pub(crate) fn no_e_block_rows_update(
    bs: &CompressedRowBlockStructure,
    values: &[f64],
    b: Option<&[f64]>,
    first_f_only_row: usize,
    num_eliminate_blocks: usize,
    lhs: &mut dyn BlockRandomAccessMatrix,
    rhs: &mut [f64],
    rhs_layout: &[Block],
) {
    let mut lhs = ExclusiveLhs { lhs };
    let mut rhs = ExclusiveRhs {
        rhs,
        layout: rhs_layout,
    };
    for row in &bs.rows[first_f_only_row..] {
        if let Some(b) = b {
            let b_row = &b[row.block.range()];
            for cell in &row.cells {
                let f_size = bs.cols[cell.block_id].size;
                let f = MatRef::new(&values[cell.position..], row.block.size, f_size);
                rhs.update_block(cell.block_id - num_eliminate_blocks, |rhs_f| {
                    matrix_transpose_vector_multiply::<DYNAMIC, DYNAMIC>(
                        Accumulate::Add,
                        f,
                        b_row,
                        rhs_f,
                    );
                });
            }
        }
        row_outer_product::<DYNAMIC, DYNAMIC>(bs, values, row, 0, num_eliminate_blocks, &mut lhs);
    }
}

/// `a` must have the block structure the eliminator was initialized with.
pub(crate) fn check_same_structure(
    expected: &CompressedRowBlockStructure,
    a: &BlockSparseMatrix,
) -> LinAlgResult<()> {
    if a.shares_structure(expected) || **a.block_structure() == *expected {
        return Ok(());
    }
    let bs = a.block_structure();
    Err(LinAlgError::InvalidStructure(format!(
        "matrix with {}x{} blocks differs from the structure passed to init ({}x{})",
        bs.rows.len(),
        bs.cols.len(),
        expected.rows.len(),
        expected.cols.len()
    )))
}

/// Validate the arguments shared by every `eliminate` implementation.
pub(crate) fn check_eliminate_args(
    a: &BlockSparseMatrix,
    b: Option<&[f64]>,
    d: Option<&[f64]>,
    num_cols_f: usize,
    rhs: &[f64],
) -> LinAlgResult<()> {
    if let Some(b) = b {
        LinAlgError::check_len("b", a.num_rows(), b.len())?;
    }
    if let Some(d) = d {
        LinAlgError::check_len("D", a.num_cols(), d.len())?;
    }
    LinAlgError::check_len("rhs", num_cols_f, rhs.len())
}

/// Read-only state shared by the workers of one `eliminate` or
/// `back_substitute` call.
struct ChunkKernel<'k, const ROW: usize, const E: usize, const F: usize> {
    plan: &'k EliminationPlan,
    bs: &'k CompressedRowBlockStructure,
    values: &'k [f64],
    b: Option<&'k [f64]>,
    d: Option<&'k [f64]>,
}

impl<const ROW: usize, const E: usize, const F: usize> ChunkKernel<'_, ROW, E, F> {
    fn e_cell(&self, row: &CompressedRow, e_size: usize) -> MatRef<'_> {
        MatRef::new(&self.values[row.cells[0].position..], row.block.size, e_size)
    }

    fn seed_ete(&self, e_block: usize, ete: &mut [f64]) {
        ete.fill(0.0);
        if let Some(d) = self.d {
            let col = self.bs.cols[e_block];
            for k in 0..col.size {
                let d_k = d[col.position + k];
                ete[k * col.size + k] = d_k * d_k;
            }
        }
    }

    fn eliminate_chunk(
        &self,
        chunk_id: usize,
        scratch: &mut ThreadScratch,
        cached_inverse: Option<&mut [f64]>,
        lhs: &mut impl LhsWriter,
        rhs: &mut impl RhsWriter,
    ) {
        let chunk = &self.plan.chunks[chunk_id];
        let e_size = self.bs.cols[chunk.e_block].size;
        let ThreadScratch {
            ete,
            inverse_ete,
            g,
            inverse_ete_g,
            buffer,
            outer,
            sj,
        } = scratch;
        let ete = &mut ete[..e_size * e_size];
        let inverse_ete = &mut inverse_ete[..e_size * e_size];
        let g = &mut g[..e_size];
        let buffer = &mut buffer[..chunk.buffer_size];

        self.chunk_diagonal_block_and_gradient(chunk, e_size, ete, g, buffer, lhs);

        invert_psd_block(self.plan.assume_full_rank_ete, ete, e_size, inverse_ete);
        if let Some(slot) = cached_inverse {
            slot.copy_from_slice(inverse_ete);
        }

        if let Some(b) = self.b {
            let inverse_ete_g = &mut inverse_ete_g[..e_size];
            matrix_vector_multiply::<E, E>(
                Accumulate::Assign,
                MatRef::new(inverse_ete, e_size, e_size),
                g,
                inverse_ete_g,
            );
            self.update_rhs(chunk, e_size, b, inverse_ete_g, sj, rhs);
        }

        self.chunk_outer_product(chunk, e_size, inverse_ete, buffer, outer, lhs);
    }

    /// EᵗE (seeded with `D²`), `g = Eᵗb`, `buffer = EᵗF`, and the FᵗF
    /// contribution of every row straight into `lhs`.
    fn chunk_diagonal_block_and_gradient(
        &self,
        chunk: &Chunk,
        e_size: usize,
        ete: &mut [f64],
        g: &mut [f64],
        buffer: &mut [f64],
        lhs: &mut impl LhsWriter,
    ) {
        self.seed_ete(chunk.e_block, ete);
        g.fill(0.0);
        buffer.fill(0.0);

        let n = self.plan.num_eliminate_blocks;
        for row in &self.bs.rows[chunk.rows()] {
            let e = self.e_cell(row, e_size);
            matrix_transpose_matrix_multiply::<ROW, E, ROW, E>(
                Accumulate::Add,
                e,
                e,
                &mut MatMut::new(ete, e_size, e_size),
            );
            if let Some(b) = self.b {
                matrix_transpose_vector_multiply::<ROW, E>(
                    Accumulate::Add,
                    e,
                    &b[row.block.range()],
                    g,
                );
            }

            for cell in &row.cells[1..] {
                let f_size = self.bs.cols[cell.block_id].size;
                let f = MatRef::new(&self.values[cell.position..], row.block.size, f_size);
                let offset = chunk.buffer_layout[&cell.block_id];
                matrix_transpose_matrix_multiply::<ROW, E, ROW, F>(
                    Accumulate::Add,
                    e,
                    f,
                    &mut MatMut::new(&mut buffer[offset..], e_size, f_size),
                );
            }

            row_outer_product::<ROW, F>(self.bs, self.values, row, 1, n, lhs);
        }
    }

    /// `rhs_f += F_jᵗ (b_j - E_j (EᵗE)⁻¹ g)` for every row `j` of the chunk.
    fn update_rhs(
        &self,
        chunk: &Chunk,
        e_size: usize,
        b: &[f64],
        inverse_ete_g: &[f64],
        sj: &mut [f64],
        rhs: &mut impl RhsWriter,
    ) {
        let n = self.plan.num_eliminate_blocks;
        for row in &self.bs.rows[chunk.rows()] {
            let sj = &mut sj[..row.block.size];
            sj.copy_from_slice(&b[row.block.range()]);
            matrix_vector_multiply::<ROW, E>(
                Accumulate::Subtract,
                self.e_cell(row, e_size),
                inverse_ete_g,
                sj,
            );

            for cell in &row.cells[1..] {
                let f_size = self.bs.cols[cell.block_id].size;
                let f = MatRef::new(&self.values[cell.position..], row.block.size, f_size);
                rhs.update_block(cell.block_id - n, |rhs_f| {
                    matrix_transpose_vector_multiply::<ROW, F>(Accumulate::Add, f, sj, rhs_f);
                });
            }
        }
    }

    /// `S_ij -= (EᵗF_i)ᵗ (EᵗE)⁻¹ EᵗF_j` for every pair of F-blocks in the chunk.
    fn chunk_outer_product(
        &self,
        chunk: &Chunk,
        e_size: usize,
        inverse_ete: &[f64],
        buffer: &[f64],
        outer: &mut [f64],
        lhs: &mut impl LhsWriter,
    ) {
        let n = self.plan.num_eliminate_blocks;
        let inverse = MatRef::new(inverse_ete, e_size, e_size);
        for (&f1, &offset1) in &chunk.buffer_layout {
            let size1 = self.bs.cols[f1].size;
            let b1 = MatRef::new(&buffer[offset1..], e_size, size1);
            matrix_transpose_matrix_multiply::<E, F, E, E>(
                Accumulate::Assign,
                b1,
                inverse,
                &mut MatMut::new(outer, size1, e_size),
            );
            let b1_inverse = MatRef::new(outer, size1, e_size);

            for (&f2, &offset2) in chunk.buffer_layout.range(f1..) {
                let size2 = self.bs.cols[f2].size;
                let b2 = MatRef::new(&buffer[offset2..], e_size, size2);
                lhs.update_cell(f1 - n, f2 - n, |cell| {
                    matrix_matrix_multiply::<F, E, E, F>(
                        Accumulate::Subtract,
                        b1_inverse,
                        b2,
                        &mut MatMut::new(cell, size1, size2),
                    );
                });
            }
        }
    }

    /// `y_e = (EᵗE)⁻¹ Eᵗ(b - F z)` for one chunk.
    fn back_substitute_chunk(
        &self,
        chunk_id: usize,
        b: &[f64],
        z: &[f64],
        cached_inverse: Option<&[f64]>,
        scratch: &mut ThreadScratch,
        y_e: &mut [f64],
    ) {
        let chunk = &self.plan.chunks[chunk_id];
        let e_size = self.bs.cols[chunk.e_block].size;
        let n = self.plan.num_eliminate_blocks;
        let ThreadScratch {
            ete,
            inverse_ete,
            g,
            sj,
            ..
        } = scratch;
        let ete = &mut ete[..e_size * e_size];
        let g = &mut g[..e_size];
        g.fill(0.0);
        if cached_inverse.is_none() {
            self.seed_ete(chunk.e_block, ete);
        }

        for row in &self.bs.rows[chunk.rows()] {
            let sj = &mut sj[..row.block.size];
            sj.copy_from_slice(&b[row.block.range()]);
            for cell in &row.cells[1..] {
                let f_size = self.bs.cols[cell.block_id].size;
                let f = MatRef::new(&self.values[cell.position..], row.block.size, f_size);
                let z_f = &z[self.plan.lhs_row_layout[cell.block_id - n].range()];
                matrix_vector_multiply::<ROW, F>(Accumulate::Subtract, f, z_f, sj);
            }

            let e = self.e_cell(row, e_size);
            matrix_transpose_vector_multiply::<ROW, E>(Accumulate::Add, e, sj, g);
            if cached_inverse.is_none() {
                matrix_transpose_matrix_multiply::<ROW, E, ROW, E>(
                    Accumulate::Add,
                    e,
                    e,
                    &mut MatMut::new(ete, e_size, e_size),
                );
            }
        }

        let inverse: &[f64] = match cached_inverse {
            Some(inverse) => inverse,
            None => {
                invert_psd_block(self.plan.assume_full_rank_ete, ete, e_size, inverse_ete);
                &inverse_ete[..e_size * e_size]
            }
        };
        matrix_vector_multiply::<E, E>(
            Accumulate::Assign,
            MatRef::new(inverse, e_size, e_size),
            g,
            y_e,
        );
    }
}

/// Generic eliminator, specialized on the row, E and F block sizes of the
/// E-rows ([`DYNAMIC`] for sizes that vary).
#[derive(Debug)]
pub struct SchurEliminator<const ROW: usize, const E: usize, const F: usize> {
    context: ParallelContext,
    cache_ete_inverses: bool,
    plan: Option<EliminationPlan>,
    scratch: Vec<Mutex<ThreadScratch>>,
    inverse_cache: InverseCache,
}

impl<const ROW: usize, const E: usize, const F: usize> SchurEliminator<ROW, E, F> {
    pub fn new(options: &SchurEliminatorOptions) -> Self {
        Self {
            context: options.context.clone(),
            cache_ete_inverses: options.cache_ete_inverses,
            plan: None,
            scratch: Vec::new(),
            inverse_cache: InverseCache::default(),
        }
    }

    pub fn locking_strategy(&self) -> Option<LockingStrategy> {
        self.plan.as_ref().map(|plan| plan.locking)
    }

    fn plan(&self) -> LinAlgResult<&EliminationPlan> {
        self.plan.as_ref().ok_or_else(|| {
            LinAlgError::InvalidState("Schur eliminator used before init".to_string())
        })
    }
}

impl<const ROW: usize, const E: usize, const F: usize> SchurEliminatorBase
    for SchurEliminator<ROW, E, F>
{
    fn init(
        &mut self,
        num_eliminate_blocks: usize,
        assume_full_rank_ete: bool,
        bs: &CompressedRowBlockStructure,
    ) -> LinAlgResult<()> {
        self.plan = None;
        let layout = compute_chunks(bs, num_eliminate_blocks)?;
        validate_block_sizes(bs, num_eliminate_blocks, BlockSizes::new(ROW, E, F))?;

        let num_cols_e = bs.num_cols_e(num_eliminate_blocks);
        let lhs_row_layout: Vec<Block> = bs.cols[num_eliminate_blocks..]
            .iter()
            .map(|col| Block::new(col.size, col.position - num_cols_e))
            .collect();

        let mut chunks = Vec::with_capacity(layout.chunks.len());
        let (mut max_e, mut max_row, mut max_buffer) = (0, 0, 0);
        for row_chunk in &layout.chunks {
            let e_size = bs.cols[row_chunk.e_block].size;
            let mut buffer_layout = BTreeMap::new();
            let mut buffer_size = 0;
            for row in &bs.rows[row_chunk.rows()] {
                max_row = max_row.max(row.block.size);
                for cell in &row.cells[1..] {
                    buffer_layout.entry(cell.block_id).or_insert_with(|| {
                        let offset = buffer_size;
                        buffer_size += e_size * bs.cols[cell.block_id].size;
                        offset
                    });
                }
            }
            max_e = max_e.max(e_size);
            max_buffer = max_buffer.max(buffer_size);
            chunks.push(Chunk {
                e_block: row_chunk.e_block,
                start: row_chunk.start,
                num_rows: row_chunk.num_rows,
                buffer_layout,
                buffer_size,
            });
        }
        let max_f = lhs_row_layout.iter().map(|b| b.size).max().unwrap_or(0);

        let num_threads = self.context.num_threads();
        self.scratch = (0..num_threads)
            .map(|_| Mutex::new(ThreadScratch::new(max_e, max_f, max_row, max_buffer)))
            .collect();
        if self.cache_ete_inverses {
            self.inverse_cache
                .reset(chunks.iter().map(|c| bs.cols[c.e_block].size));
        } else {
            self.inverse_cache.reset(std::iter::empty());
        }

        let locking = LockingStrategy::for_context(&self.context);
        debug!(
            "Schur eliminator <{}>: {} chunks, {} F-only rows, buffer {} per thread, {} threads, {:?}",
            BlockSizes::new(ROW, E, F),
            chunks.len(),
            bs.rows.len() - layout.first_f_only_row,
            max_buffer,
            num_threads,
            locking
        );

        self.plan = Some(EliminationPlan {
            num_eliminate_blocks,
            assume_full_rank_ete,
            chunk_of_e_block: layout.chunk_of_e_block(num_eliminate_blocks),
            chunks,
            first_f_only_row: layout.first_f_only_row,
            lhs_row_layout,
            num_cols_e,
            structure: bs.clone(),
            locking,
        });
        Ok(())
    }

    fn eliminate(
        &mut self,
        a: &BlockSparseMatrix,
        b: Option<&[f64]>,
        d: Option<&[f64]>,
        lhs: &mut dyn BlockRandomAccessMatrix,
        rhs: &mut [f64],
    ) -> LinAlgResult<()> {
        let plan = self.plan.as_ref().ok_or_else(|| {
            LinAlgError::InvalidState("Schur eliminator used before init".to_string())
        })?;
        plan.check_matrix(a)?;
        plan.check_lhs(lhs)?;
        check_eliminate_args(a, b, d, plan.num_cols_f(), rhs)?;
        trace!("eliminating {} chunks", plan.chunks.len());

        lhs.set_zero();
        rhs.fill(0.0);
        self.inverse_cache.set_valid(false);

        let bs = a.block_structure();
        let n = plan.num_eliminate_blocks;
        let kernel = ChunkKernel::<ROW, E, F> {
            plan,
            bs,
            values: a.values(),
            b,
            d,
        };
        let mut cache_slots: Vec<Option<&mut [f64]>> = if self.cache_ete_inverses {
            self.inverse_cache.slots_mut().into_iter().map(Some).collect()
        } else {
            plan.chunks.iter().map(|_| None).collect()
        };

        match plan.locking {
            LockingStrategy::Exclusive => {
                let scratch = self.scratch[0]
                    .get_mut()
                    .unwrap_or_else(PoisonError::into_inner);
                let mut lhs_writer = ExclusiveLhs { lhs: &mut *lhs };
                let mut rhs_writer = ExclusiveRhs {
                    rhs: &mut *rhs,
                    layout: &plan.lhs_row_layout,
                };
                if let Some(d) = d {
                    for f_block in 0..plan.lhs_row_layout.len() {
                        add_f_block_diagonal(bs, d, n, f_block, &mut lhs_writer);
                    }
                }
                for (chunk_id, slot) in cache_slots.iter_mut().enumerate() {
                    kernel.eliminate_chunk(
                        chunk_id,
                        scratch,
                        slot.as_deref_mut(),
                        &mut lhs_writer,
                        &mut rhs_writer,
                    );
                }
            }
            LockingStrategy::PerTarget => {
                let shared_lhs = LockingLhs { lhs: &*lhs };
                if let Some(d) = d {
                    self.context.for_each(0..plan.lhs_row_layout.len(), |f_block| {
                        add_f_block_diagonal(bs, d, n, f_block, &mut { shared_lhs });
                    });
                }

                let rhs_blocks: Vec<Mutex<&mut [f64]>> =
                    partition_mut(rhs, plan.lhs_row_layout.iter().map(|b| b.size))
                        .into_iter()
                        .map(Mutex::new)
                        .collect();
                let shared_rhs = LockingRhs {
                    blocks: &rhs_blocks,
                };
                let scratch = &self.scratch;
                self.context
                    .for_each_mut(&mut cache_slots, |thread_id, chunk_id, slot| {
                        let mut scratch = lock(&scratch[thread_id]);
                        kernel.eliminate_chunk(
                            chunk_id,
                            &mut scratch,
                            slot.as_deref_mut(),
                            &mut { shared_lhs },
                            &mut { shared_rhs },
                        );
                    });
            }
        }
        drop(cache_slots);

        no_e_block_rows_update(
            bs,
            a.values(),
            b,
            plan.first_f_only_row,
            n,
            lhs,
            rhs,
            &plan.lhs_row_layout,
        );
        self.inverse_cache.set_valid(self.cache_ete_inverses);
        Ok(())
    }

    fn back_substitute(
        &self,
        a: &BlockSparseMatrix,
        b: &[f64],
        d: Option<&[f64]>,
        z: &[f64],
        y: &mut [f64],
    ) -> LinAlgResult<()> {
        let plan = self.plan()?;
        plan.check_matrix(a)?;
        LinAlgError::check_len("b", a.num_rows(), b.len())?;
        if let Some(d) = d {
            LinAlgError::check_len("D", a.num_cols(), d.len())?;
        }
        LinAlgError::check_len("z", plan.num_cols_f(), z.len())?;
        LinAlgError::check_len("y", plan.num_cols_e, y.len())?;

        let bs = a.block_structure();
        let kernel = ChunkKernel::<ROW, E, F> {
            plan,
            bs,
            values: a.values(),
            b: Some(b),
            d,
        };
        let cache = (self.cache_ete_inverses && self.inverse_cache.is_valid())
            .then_some(&self.inverse_cache);
        trace!(
            "back substitution over {} chunks, cached inverses: {}",
            plan.chunks.len(),
            cache.is_some()
        );

        let mut y_blocks = partition_mut(
            y,
            bs.cols[..plan.num_eliminate_blocks].iter().map(|c| c.size),
        );
        let scratch = &self.scratch;
        self.context
            .for_each_mut(&mut y_blocks, |thread_id, e_block, y_e| {
                let Some(chunk_id) = plan.chunk_of_e_block[e_block] else {
                    // no row references this E-block
                    y_e.fill(0.0);
                    return;
                };
                let mut scratch = lock(&scratch[thread_id]);
                kernel.back_substitute_chunk(
                    chunk_id,
                    b,
                    z,
                    cache.and_then(|c| c.get(chunk_id)),
                    &mut scratch,
                    y_e,
                );
            });
        Ok(())
    }

    fn block_sizes(&self) -> BlockSizes {
        BlockSizes::new(ROW, E, F)
    }
}

fn boxed_eliminator<const ROW: usize, const E: usize, const F: usize>(
    options: &SchurEliminatorOptions,
) -> Box<dyn SchurEliminatorBase> {
    Box::new(SchurEliminator::<ROW, E, F>::new(options))
}

/// Pick the eliminator specialization for `bs` and initialize it.
///
/// The single F-block path is used when it is enabled, the structure has
/// exactly one F-block and the block sizes are `(2, 3, 6)` or `(2, 3, 9)`.
pub fn create_schur_eliminator(
    options: &SchurEliminatorOptions,
    bs: &CompressedRowBlockStructure,
) -> LinAlgResult<Box<dyn SchurEliminatorBase>> {
    let n = options.num_eliminate_blocks;
    let sizes = options
        .block_sizes
        .unwrap_or_else(|| detect_structure(bs, n));
    let num_f_blocks = bs.cols.len().saturating_sub(n);

    let mut eliminator: Box<dyn SchurEliminatorBase> =
        match (options.use_single_f_block_fast_path && num_f_blocks == 1, sizes) {
            (true, BlockSizes { row: 2, e: 3, f: 6 }) => {
                Box::new(SchurEliminatorForOneFBlock::<2, 3, 6>::new())
            }
            (true, BlockSizes { row: 2, e: 3, f: 9 }) => {
                Box::new(SchurEliminatorForOneFBlock::<2, 3, 9>::new())
            }
            _ => dispatch_block_sizes!(sizes, boxed_eliminator(options)),
        };
    debug!("Selected Schur eliminator {:?}", eliminator);

    eliminator.init(n, options.assume_full_rank_ete, bs)?;
    Ok(eliminator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::block_random_access::{
        BlockRandomAccessDenseMatrix, BlockRandomAccessDiagonalMatrix,
    };
    use crate::linalg::synthetic::{SyntheticProblem, SyntheticProblemOptions, generate_problem};
    use nalgebra::{DMatrix, DVector};

    fn problem(priors: usize) -> SyntheticProblem {
        let options = SyntheticProblemOptions::new()
            .with_points(10)
            .with_cameras(4)
            .with_observations_per_point(3)
            .with_block_sizes(2, 3, 6)
            .with_camera_priors(priors);
        generate_problem(&options).unwrap()
    }

    fn f_block_sizes(problem: &SyntheticProblem) -> Vec<usize> {
        problem.matrix.block_structure().cols[problem.num_eliminate_blocks..]
            .iter()
            .map(|c| c.size)
            .collect()
    }

    fn eliminate_dense(
        eliminator: &mut dyn SchurEliminatorBase,
        problem: &SyntheticProblem,
        d: Option<&[f64]>,
    ) -> (DMatrix<f64>, Vec<f64>) {
        let sizes = f_block_sizes(problem);
        let mut lhs = BlockRandomAccessDenseMatrix::new(&sizes);
        let mut rhs = vec![0.0; sizes.iter().sum()];
        eliminator
            .eliminate(&problem.matrix, Some(&problem.b), d, &mut lhs, &mut rhs)
            .unwrap();
        (lhs.to_dense(), rhs)
    }

    #[test]
    fn test_eliminate_matches_dense_reference() {
        let problem = problem(2);
        for threads in [1, 4] {
            for d in [None, Some(problem.d.as_slice())] {
                let options = SchurEliminatorOptions::new(problem.num_eliminate_blocks)
                    .with_context(ParallelContext::new(threads).unwrap());
                let mut eliminator =
                    create_schur_eliminator(&options, problem.matrix.block_structure()).unwrap();
                let (lhs, rhs) = eliminate_dense(eliminator.as_mut(), &problem, d);
                let (s, r) = problem.dense_schur_complement(d).unwrap();
                assert!((lhs - s).abs().max() < 1e-8);
                for (a, e) in rhs.iter().zip(r.iter()) {
                    assert!((a - e).abs() < 1e-8);
                }
            }
        }
    }

    #[test]
    fn test_locking_strategy_follows_thread_count() {
        let problem = problem(0);
        let bs = problem.matrix.block_structure();
        for (threads, expected) in [(1, LockingStrategy::Exclusive), (2, LockingStrategy::PerTarget)] {
            let options = SchurEliminatorOptions::new(problem.num_eliminate_blocks)
                .with_context(ParallelContext::new(threads).unwrap());
            let mut eliminator = SchurEliminator::<2, 3, 6>::new(&options);
            assert_eq!(eliminator.locking_strategy(), None);
            eliminator.init(problem.num_eliminate_blocks, true, bs).unwrap();
            assert_eq!(eliminator.locking_strategy(), Some(expected));
        }
    }

    #[test]
    fn test_eliminate_before_init_fails() {
        let problem = problem(0);
        let mut eliminator =
            SchurEliminator::<DYNAMIC, DYNAMIC, DYNAMIC>::new(&SchurEliminatorOptions::default());
        let sizes = f_block_sizes(&problem);
        let mut lhs = BlockRandomAccessDenseMatrix::new(&sizes);
        let mut rhs = vec![0.0; sizes.iter().sum()];
        let result = eliminator.eliminate(&problem.matrix, Some(&problem.b), None, &mut lhs, &mut rhs);
        assert!(matches!(result, Err(LinAlgError::InvalidState(_))));
    }

    #[test]
    fn test_eliminate_rejects_bad_lengths() {
        let problem = problem(0);
        let options = SchurEliminatorOptions::new(problem.num_eliminate_blocks);
        let mut eliminator =
            create_schur_eliminator(&options, problem.matrix.block_structure()).unwrap();
        let sizes = f_block_sizes(&problem);
        let mut lhs = BlockRandomAccessDenseMatrix::new(&sizes);
        let mut rhs = vec![0.0; 3];
        assert!(
            eliminator
                .eliminate(&problem.matrix, Some(&problem.b), None, &mut lhs, &mut rhs)
                .is_err()
        );

        let mut wrong_lhs = BlockRandomAccessDenseMatrix::new(&[1, 1]);
        let mut rhs = vec![0.0; sizes.iter().sum()];
        assert!(
            eliminator
                .eliminate(&problem.matrix, Some(&problem.b), None, &mut wrong_lhs, &mut rhs)
                .is_err()
        );
    }

    #[test]
    fn test_init_rejects_zero_eliminate_blocks() {
        let problem = problem(0);
        let options = SchurEliminatorOptions::new(0);
        assert!(create_schur_eliminator(&options, problem.matrix.block_structure()).is_err());
    }

    #[test]
    fn test_init_rejects_wrong_static_sizes() {
        let problem = problem(0);
        let options = SchurEliminatorOptions::new(problem.num_eliminate_blocks)
            .with_block_sizes(BlockSizes::new(2, 3, 9));
        let result = create_schur_eliminator(&options, problem.matrix.block_structure());
        assert!(matches!(result, Err(LinAlgError::InvalidStructure(_))));
    }

    #[test]
    fn test_diagonal_lhs_gets_only_diagonal_cells() {
        let problem = problem(2);
        let options = SchurEliminatorOptions::new(problem.num_eliminate_blocks)
            .with_context(ParallelContext::new(3).unwrap());
        let mut eliminator =
            create_schur_eliminator(&options, problem.matrix.block_structure()).unwrap();
        let sizes = f_block_sizes(&problem);
        let mut lhs = BlockRandomAccessDiagonalMatrix::new(&sizes);
        let mut rhs = vec![0.0; sizes.iter().sum()];
        eliminator
            .eliminate(&problem.matrix, None, Some(&problem.d), &mut lhs, &mut rhs)
            .unwrap();

        assert!(rhs.iter().all(|&v| v == 0.0));
        let (s, _) = problem.dense_schur_complement(Some(&problem.d)).unwrap();
        let dense = lhs.to_dense();
        let mut offset = 0;
        for size in sizes {
            for r in offset..offset + size {
                for c in 0..dense.ncols() {
                    if (offset..offset + size).contains(&c) {
                        assert!((dense[(r, c)] - s[(r, c)]).abs() < 1e-8);
                    } else {
                        assert_eq!(dense[(r, c)], 0.0);
                    }
                }
            }
            offset += size;
        }
    }

    #[test]
    fn test_back_substitute_with_and_without_cache() {
        let problem = problem(1);
        let d = Some(problem.d.as_slice());
        let ne = problem.matrix.block_structure().num_cols_e(problem.num_eliminate_blocks);
        let z: Vec<f64> = (0..problem.matrix.num_cols() - ne).map(|i| (i as f64).sin()).collect();

        let mut results = Vec::new();
        for cache in [false, true] {
            let options = SchurEliminatorOptions::new(problem.num_eliminate_blocks)
                .with_cache_ete_inverses(cache)
                .with_context(ParallelContext::new(2).unwrap());
            let mut eliminator =
                create_schur_eliminator(&options, problem.matrix.block_structure()).unwrap();
            eliminate_dense(eliminator.as_mut(), &problem, d);
            let mut y = vec![0.0; ne];
            eliminator
                .back_substitute(&problem.matrix, &problem.b, d, &z, &mut y)
                .unwrap();
            results.push(y);
        }

        // y = H_ee⁻¹ (g_e - H_ef z)
        let (h, g) = problem.dense_normal_equations(d);
        let nf = z.len();
        let h_ee = h.view((0, 0), (ne, ne)).into_owned();
        let h_ef = h.view((0, ne), (ne, nf)).into_owned();
        let expected = h_ee.try_inverse().unwrap()
            * (g.rows(0, ne) - h_ef * DVector::from_column_slice(&z));

        for y in results {
            for (a, e) in y.iter().zip(expected.iter()) {
                assert!((a - e).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn test_inverse_cache_slots() {
        let mut cache = InverseCache::default();
        cache.reset([2, 3]);
        assert!(cache.get(0).is_none());
        {
            let mut slots = cache.slots_mut();
            assert_eq!(slots.len(), 2);
            assert_eq!(slots[1].len(), 9);
            slots[1][0] = 4.0;
        }
        cache.set_valid(true);
        assert_eq!(cache.get(1).map(|s| s[0]), Some(4.0));
        cache.reset([2]);
        assert!(!cache.is_valid());
    }

    fn two_observation_matrix(e_blocks: [usize; 2]) -> BlockSparseMatrix {
        let rows = [(2, vec![e_blocks[0], 2]), (2, vec![e_blocks[1], 2])];
        let bs = CompressedRowBlockStructure::from_layout(&[3, 3, 6], &rows).unwrap();
        let values = (0..bs.num_nonzeros())
            .map(|i| ((i * 5 + 1) % 7) as f64 - 2.5)
            .collect();
        BlockSparseMatrix::from_values(std::sync::Arc::new(bs), values).unwrap()
    }

    #[test]
    fn test_eliminate_rejects_matrix_with_other_cell_pattern() {
        // Same block counts, but both rows now hit E-block 0.
        let initialized = two_observation_matrix([0, 1]);
        let other = two_observation_matrix([0, 0]);
        let b = [1.0, -1.0, 0.5, 2.0];
        let d = [1.0; 12];

        for fast_path in [true, false] {
            let options = SchurEliminatorOptions::new(2).with_single_f_block_fast_path(fast_path);
            let mut eliminator =
                create_schur_eliminator(&options, initialized.block_structure()).unwrap();
            let mut lhs = BlockRandomAccessDenseMatrix::new(&[6]);
            let mut rhs = vec![0.0; 6];

            let result = eliminator.eliminate(&other, Some(&b[..]), Some(&d[..]), &mut lhs, &mut rhs);
            assert!(
                matches!(result, Err(LinAlgError::InvalidStructure(_))),
                "fast path {fast_path}: {result:?}"
            );

            eliminator
                .eliminate(&initialized, Some(&b[..]), Some(&d[..]), &mut lhs, &mut rhs)
                .unwrap();
            let mut y = vec![0.0; 6];
            let result = eliminator.back_substitute(&other, &b, Some(&d[..]), &rhs, &mut y);
            assert!(matches!(result, Err(LinAlgError::InvalidStructure(_))));
        }
    }

    #[test]
    fn test_eliminate_accepts_equal_structure_copy() {
        let initialized = two_observation_matrix([0, 1]);
        let copy = two_observation_matrix([0, 1]);
        assert!(!std::sync::Arc::ptr_eq(initialized.block_structure(), copy.block_structure()));

        let options = SchurEliminatorOptions::new(2).with_single_f_block_fast_path(false);
        let mut eliminator =
            create_schur_eliminator(&options, initialized.block_structure()).unwrap();
        let mut lhs = BlockRandomAccessDenseMatrix::new(&[6]);
        let mut rhs = vec![0.0; 6];
        let d = [1.0; 12];
        eliminator
            .eliminate(&copy, Some(&[1.0, 0.0, 0.0, 1.0][..]), Some(&d[..]), &mut lhs, &mut rhs)
            .unwrap();
    }
}
