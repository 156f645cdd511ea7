//! Block-sparse layout shared by the matrix, the partitioned view and the
//! eliminators.
//!
//! A [`CompressedRowBlockStructure`] lists the column blocks and, for every
//! row block, the non-zero cells it contains. The first `num_eliminate_blocks`
//! column blocks form the E partition, the rest the F partition.
//!
//! Rows that touch an E-block must
//! - reference exactly one E-block, as their first cell
//! - be stored contiguously with every other row touching the same E-block
//! - precede all rows that touch only F-blocks
//!
//! [`compute_chunks`] checks these rules and groups the E-rows into chunks.

use crate::error::{LinAlgError, LinAlgResult};
use crate::linalg::small_blas::DYNAMIC;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A contiguous run of scalar rows or columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Block {
    pub size: usize,
    pub position: usize,
}

impl Block {
    pub fn new(size: usize, position: usize) -> Self {
        Self { size, position }
    }

    /// Scalar range covered by this block.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.position..self.position + self.size
    }
}

/// One non-zero block of a row: the column block it belongs to and the offset
/// of its row-major values in the matrix value buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub block_id: usize,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompressedRow {
    pub block: Block,
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompressedRowBlockStructure {
    pub cols: Vec<Block>,
    pub rows: Vec<CompressedRow>,
}

impl CompressedRowBlockStructure {
    /// Build a structure from column block sizes and, per row block, its size
    /// and the column blocks it touches (strictly increasing). Cell values are
    /// laid out row block after row block.
    pub fn from_layout(col_sizes: &[usize], rows: &[(usize, Vec<usize>)]) -> LinAlgResult<Self> {
        let mut cols = Vec::with_capacity(col_sizes.len());
        let mut position = 0;
        for (id, &size) in col_sizes.iter().enumerate() {
            if size == 0 {
                return Err(LinAlgError::InvalidStructure(format!(
                    "column block {id} has size 0"
                )));
            }
            cols.push(Block::new(size, position));
            position += size;
        }

        let mut compressed_rows = Vec::with_capacity(rows.len());
        let mut row_position = 0;
        let mut value_position = 0;
        for (row_id, (row_size, col_ids)) in rows.iter().enumerate() {
            if *row_size == 0 {
                return Err(LinAlgError::InvalidStructure(format!(
                    "row block {row_id} has size 0"
                )));
            }
            let mut cells = Vec::with_capacity(col_ids.len());
            for &block_id in col_ids {
                let col = cols.get(block_id).ok_or_else(|| {
                    LinAlgError::InvalidStructure(format!(
                        "row block {row_id} references column block {block_id}, only {} exist",
                        col_sizes.len()
                    ))
                })?;
                cells.push(Cell {
                    block_id,
                    position: value_position,
                });
                value_position += row_size * col.size;
            }
            compressed_rows.push(CompressedRow {
                block: Block::new(*row_size, row_position),
                cells,
            });
            row_position += row_size;
        }

        let structure = Self {
            cols,
            rows: compressed_rows,
        };
        structure.validate()?;
        Ok(structure)
    }

    pub fn num_rows(&self) -> usize {
        self.rows
            .last()
            .map(|row| row.block.position + row.block.size)
            .unwrap_or(0)
    }

    pub fn num_cols(&self) -> usize {
        self.cols
            .last()
            .map(|col| col.position + col.size)
            .unwrap_or(0)
    }

    pub fn num_row_blocks(&self) -> usize {
        self.rows.len()
    }

    pub fn num_col_blocks(&self) -> usize {
        self.cols.len()
    }

    /// Number of stored scalar values.
    pub fn num_nonzeros(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| {
                row.cells
                    .iter()
                    .map(move |cell| row.block.size * self.cols[cell.block_id].size)
            })
            .sum()
    }

    /// Scalar columns covered by the first `num_eliminate_blocks` column blocks.
    pub fn num_cols_e(&self, num_eliminate_blocks: usize) -> usize {
        match self.cols.get(num_eliminate_blocks) {
            Some(col) => col.position,
            None => self.num_cols(),
        }
    }

    /// Check positions, sizes and cell ordering for internal consistency.
    pub fn validate(&self) -> LinAlgResult<()> {
        let mut expected = 0;
        for (id, col) in self.cols.iter().enumerate() {
            if col.size == 0 || col.position != expected {
                return Err(LinAlgError::InvalidStructure(format!(
                    "column block {id} is empty or not contiguous"
                )));
            }
            expected += col.size;
        }

        let mut expected = 0;
        for (id, row) in self.rows.iter().enumerate() {
            if row.block.size == 0 || row.block.position != expected {
                return Err(LinAlgError::InvalidStructure(format!(
                    "row block {id} is empty or not contiguous"
                )));
            }
            expected += row.block.size;

            for pair in row.cells.windows(2) {
                if pair[0].block_id >= pair[1].block_id {
                    return Err(LinAlgError::InvalidStructure(format!(
                        "cells of row block {id} are not strictly increasing"
                    )));
                }
            }
            if let Some(cell) = row.cells.iter().find(|c| c.block_id >= self.cols.len()) {
                return Err(LinAlgError::InvalidStructure(format!(
                    "row block {id} references missing column block {}",
                    cell.block_id
                )));
            }
        }
        Ok(())
    }
}

/// A maximal run of rows sharing the same leading E-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowChunk {
    pub e_block: usize,
    pub start: usize,
    pub num_rows: usize,
}

impl RowChunk {
    pub fn rows(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.num_rows
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkLayout {
    pub chunks: Vec<RowChunk>,
    /// Index of the first row block that touches no E-block.
    pub first_f_only_row: usize,
}

impl ChunkLayout {
    /// Chunk index for every E-block, `None` for E-blocks no row references.
    pub fn chunk_of_e_block(&self, num_eliminate_blocks: usize) -> Vec<Option<usize>> {
        let mut index = vec![None; num_eliminate_blocks];
        for (chunk_id, chunk) in self.chunks.iter().enumerate() {
            index[chunk.e_block] = Some(chunk_id);
        }
        index
    }
}

/// Group the E-rows of `bs` into chunks, checking the partition rules.
pub fn compute_chunks(
    bs: &CompressedRowBlockStructure,
    num_eliminate_blocks: usize,
) -> LinAlgResult<ChunkLayout> {
    if num_eliminate_blocks == 0 {
        return Err(LinAlgError::InvalidInput(
            "num_eliminate_blocks must be positive".to_string(),
        ));
    }
    if num_eliminate_blocks > bs.cols.len() {
        return Err(LinAlgError::InvalidInput(format!(
            "num_eliminate_blocks = {} exceeds the {} column blocks",
            num_eliminate_blocks,
            bs.cols.len()
        )));
    }

    let mut chunks: Vec<RowChunk> = Vec::new();
    let mut seen = vec![false; num_eliminate_blocks];
    let mut first_f_only_row = None;

    for (r, row) in bs.rows.iter().enumerate() {
        let Some(first) = row.cells.first() else {
            return Err(LinAlgError::InvalidStructure(format!(
                "row block {r} has no cells"
            )));
        };
        if let Some(cell) = row.cells[1..]
            .iter()
            .find(|cell| cell.block_id < num_eliminate_blocks)
        {
            return Err(LinAlgError::InvalidStructure(format!(
                "row block {r} references E-block {} after its first cell",
                cell.block_id
            )));
        }

        if first.block_id >= num_eliminate_blocks {
            first_f_only_row.get_or_insert(r);
            continue;
        }
        if let Some(f_row) = first_f_only_row {
            return Err(LinAlgError::InvalidStructure(format!(
                "row block {r} references an E-block but follows F-only row block {f_row}"
            )));
        }

        match chunks.last_mut() {
            Some(chunk) if chunk.e_block == first.block_id => chunk.num_rows += 1,
            _ => {
                if seen[first.block_id] {
                    return Err(LinAlgError::InvalidStructure(format!(
                        "rows of E-block {} are not contiguous (row block {r})",
                        first.block_id
                    )));
                }
                seen[first.block_id] = true;
                chunks.push(RowChunk {
                    e_block: first.block_id,
                    start: r,
                    num_rows: 1,
                });
            }
        }
    }

    Ok(ChunkLayout {
        chunks,
        first_f_only_row: first_f_only_row.unwrap_or(bs.rows.len()),
    })
}

/// Row, E and F block sizes used to pick a specialization. A size that is not
/// uniform across the E-rows is [`DYNAMIC`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSizes {
    pub row: usize,
    pub e: usize,
    pub f: usize,
}

impl BlockSizes {
    pub const fn new(row: usize, e: usize, f: usize) -> Self {
        Self { row, e, f }
    }

    pub const fn dynamic() -> Self {
        Self::new(DYNAMIC, DYNAMIC, DYNAMIC)
    }

    pub fn is_fully_static(&self) -> bool {
        self.row != DYNAMIC && self.e != DYNAMIC && self.f != DYNAMIC
    }
}

impl Default for BlockSizes {
    fn default() -> Self {
        Self::dynamic()
    }
}

impl fmt::Display for BlockSizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |size: usize| {
            if size == DYNAMIC {
                "d".to_string()
            } else {
                size.to_string()
            }
        };
        write!(f, "{},{},{}", show(self.row), show(self.e), show(self.f))
    }
}

fn merge(current: &mut Option<usize>, size: usize) {
    *current = match *current {
        None => Some(size),
        Some(prev) if prev == size => Some(prev),
        Some(_) => Some(DYNAMIC),
    };
}

/// Find the common row, E and F block sizes over the rows that reference an
/// E-block. F-only rows do not take part.
pub fn detect_structure(bs: &CompressedRowBlockStructure, num_eliminate_blocks: usize) -> BlockSizes {
    let mut row = None;
    let mut e = None;
    let mut f = None;

    for compressed_row in &bs.rows {
        let Some(first) = compressed_row.cells.first() else {
            continue;
        };
        if first.block_id >= num_eliminate_blocks {
            break;
        }
        merge(&mut row, compressed_row.block.size);
        merge(&mut e, bs.cols[first.block_id].size);
        for cell in &compressed_row.cells[1..] {
            merge(&mut f, bs.cols[cell.block_id].size);
        }
    }

    BlockSizes::new(
        row.unwrap_or(DYNAMIC),
        e.unwrap_or(DYNAMIC),
        f.unwrap_or(DYNAMIC),
    )
}

/// Check that every static size in `sizes` agrees with the E-rows of `bs`.
pub fn validate_block_sizes(
    bs: &CompressedRowBlockStructure,
    num_eliminate_blocks: usize,
    sizes: BlockSizes,
) -> LinAlgResult<()> {
    let mismatch = |what: &str, r: usize, expected: usize, actual: usize| -> LinAlgResult<()> {
        Err(LinAlgError::InvalidStructure(format!(
            "{what} size {actual} in row block {r} does not match the specialization ({expected})"
        )))
    };

    for (r, row) in bs.rows.iter().enumerate() {
        let Some(first) = row.cells.first() else {
            continue;
        };
        if first.block_id >= num_eliminate_blocks {
            break;
        }
        if sizes.row != DYNAMIC && row.block.size != sizes.row {
            return mismatch("row block", r, sizes.row, row.block.size);
        }
        let e_size = bs.cols[first.block_id].size;
        if sizes.e != DYNAMIC && e_size != sizes.e {
            return mismatch("E-block", r, sizes.e, e_size);
        }
        if sizes.f != DYNAMIC {
            for cell in &row.cells[1..] {
                let f_size = bs.cols[cell.block_id].size;
                if f_size != sizes.f {
                    return mismatch("F-block", r, sizes.f, f_size);
                }
            }
        }
    }
    Ok(())
}
