//! Eliminator for problems with exactly one F-block.
//!
//! With a single F-block the reduced system is one dense `F x F` cell, so
//! there is nothing to parallelize over and nothing to lock. Each chunk keeps
//! its EᵗF product and its EᵗE inverse in place and applies the rank update
//! directly:
//!
//! ```text
//! S -= (EᵗF)ᵗ (EᵗE)⁻¹ EᵗF
//! r -= (EᵗF)ᵗ (EᵗE)⁻¹ Eᵗb
//! ```
//!
//! The EᵗE inverses are always kept, and `back_substitute` requires a prior
//! `eliminate`.

use crate::error::{LinAlgError, LinAlgResult};
use crate::linalg::block_random_access::BlockRandomAccessMatrix;
use crate::linalg::block_sparse::BlockSparseMatrix;
use crate::linalg::block_structure::{
    BlockSizes, CompressedRowBlockStructure, RowChunk, compute_chunks, validate_block_sizes,
};
use crate::linalg::invert_psd::invert_psd_block;
use crate::linalg::schur_eliminator::{
    InverseCache, SchurEliminatorBase, check_eliminate_args, check_same_structure,
};
use crate::linalg::small_blas::{
    Accumulate, DYNAMIC, MatMut, MatRef, matrix_matrix_multiply,
    matrix_transpose_matrix_multiply, matrix_transpose_vector_multiply, matrix_vector_multiply,
};
use tracing::debug;

#[derive(Debug)]
struct OneFPlan {
    assume_full_rank_ete: bool,
    chunks: Vec<RowChunk>,
    chunk_of_e_block: Vec<Option<usize>>,
    first_f_only_row: usize,
    num_cols_e: usize,
    structure: CompressedRowBlockStructure,
}

#[derive(Debug, Default)]
struct OneFScratch {
    ete: Vec<f64>,
    etf: Vec<f64>,
    g: Vec<f64>,
    /// (EᵗF)ᵗ (EᵗE)⁻¹
    tmp: Vec<f64>,
}

#[derive(Debug)]
pub struct SchurEliminatorForOneFBlock<const ROW: usize, const E: usize, const F: usize> {
    plan: Option<OneFPlan>,
    scratch: OneFScratch,
    inverse_cache: InverseCache,
}

impl<const ROW: usize, const E: usize, const F: usize> Default
    for SchurEliminatorForOneFBlock<ROW, E, F>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const ROW: usize, const E: usize, const F: usize> SchurEliminatorForOneFBlock<ROW, E, F> {
    pub fn new() -> Self {
        Self {
            plan: None,
            scratch: OneFScratch::default(),
            inverse_cache: InverseCache::default(),
        }
    }

    fn check_matrix(plan: &OneFPlan, a: &BlockSparseMatrix) -> LinAlgResult<()> {
        check_same_structure(&plan.structure, a)
    }
}

impl<const ROW: usize, const E: usize, const F: usize> SchurEliminatorBase
    for SchurEliminatorForOneFBlock<ROW, E, F>
{
    fn init(
        &mut self,
        num_eliminate_blocks: usize,
        assume_full_rank_ete: bool,
        bs: &CompressedRowBlockStructure,
    ) -> LinAlgResult<()> {
        self.plan = None;
        let sizes = BlockSizes::new(ROW, E, F);
        if !sizes.is_fully_static() {
            return Err(LinAlgError::InvalidInput(format!(
                "single F-block elimination needs static block sizes, got <{sizes}>"
            )));
        }
        let layout = compute_chunks(bs, num_eliminate_blocks)?;
        if bs.cols.len() != num_eliminate_blocks + 1 {
            return Err(LinAlgError::InvalidStructure(format!(
                "expected exactly one F-block, found {}",
                bs.cols.len() - num_eliminate_blocks
            )));
        }
        validate_block_sizes(bs, num_eliminate_blocks, sizes)?;
        for (r, row) in bs.rows.iter().enumerate() {
            let max_cells = if r < layout.first_f_only_row { 2 } else { 1 };
            if row.cells.len() > max_cells {
                return Err(LinAlgError::InvalidStructure(format!(
                    "row block {r} has {} cells, at most {max_cells} allowed with one F-block",
                    row.cells.len()
                )));
            }
        }

        self.scratch = OneFScratch {
            ete: vec![0.0; E * E],
            etf: vec![0.0; E * F],
            g: vec![0.0; E],
            tmp: vec![0.0; F * E],
        };
        self.inverse_cache
            .reset(layout.chunks.iter().map(|_| E));
        debug!(
            "Single F-block eliminator <{}>: {} chunks, {} F-only rows",
            sizes,
            layout.chunks.len(),
            bs.rows.len() - layout.first_f_only_row
        );

        self.plan = Some(OneFPlan {
            assume_full_rank_ete,
            chunk_of_e_block: layout.chunk_of_e_block(num_eliminate_blocks),
            chunks: layout.chunks,
            first_f_only_row: layout.first_f_only_row,
            num_cols_e: bs.num_cols_e(num_eliminate_blocks),
            structure: bs.clone(),
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
        Self::check_matrix(plan, a)?;
        check_eliminate_args(a, b, d, F, rhs)?;
        if lhs.block_sizes() != [F] {
            return Err(LinAlgError::InvalidInput(format!(
                "lhs must be a single {F}x{F} block"
            )));
        }

        self.inverse_cache.set_valid(false);
        lhs.set_zero();
        rhs.fill(0.0);
        let lhs = lhs
            .get_cell_mut(0, 0)
            .ok_or_else(|| LinAlgError::InvalidInput("lhs does not store cell (0, 0)".to_string()))?
            .values_mut();

        let bs = a.block_structure();
        let values = a.values();
        if let Some(d) = d {
            for k in 0..F {
                let d_k = d[plan.num_cols_e + k];
                lhs[k * F + k] += d_k * d_k;
            }
        }

        let OneFScratch { ete, etf, g, tmp } = &mut self.scratch;
        let mut slots = self.inverse_cache.slots_mut();
        for (chunk, inverse) in plan.chunks.iter().zip(slots.iter_mut()) {
            ete.fill(0.0);
            etf.fill(0.0);
            g.fill(0.0);
            if let Some(d) = d {
                let position = bs.cols[chunk.e_block].position;
                for k in 0..E {
                    ete[k * E + k] = d[position + k] * d[position + k];
                }
            }

            for row in &bs.rows[chunk.rows()] {
                let e = MatRef::new(&values[row.cells[0].position..], ROW, E);
                matrix_transpose_matrix_multiply::<ROW, E, ROW, E>(
                    Accumulate::Add,
                    e,
                    e,
                    &mut MatMut::new(ete, E, E),
                );
                if let Some(b) = b {
                    matrix_transpose_vector_multiply::<ROW, E>(
                        Accumulate::Add,
                        e,
                        &b[row.block.range()],
                        g,
                    );
                }

                let Some(f_cell) = row.cells.get(1) else {
                    continue;
                };
                let f = MatRef::new(&values[f_cell.position..], ROW, F);
                matrix_transpose_matrix_multiply::<ROW, E, ROW, F>(
                    Accumulate::Add,
                    e,
                    f,
                    &mut MatMut::new(etf, E, F),
                );
                matrix_transpose_matrix_multiply::<ROW, F, ROW, F>(
                    Accumulate::Add,
                    f,
                    f,
                    &mut MatMut::new(lhs, F, F),
                );
                if let Some(b) = b {
                    matrix_transpose_vector_multiply::<ROW, F>(
                        Accumulate::Add,
                        f,
                        &b[row.block.range()],
                        rhs,
                    );
                }
            }

            invert_psd_block(plan.assume_full_rank_ete, ete, E, inverse);
            matrix_transpose_matrix_multiply::<E, F, E, E>(
                Accumulate::Assign,
                MatRef::new(etf, E, F),
                MatRef::new(inverse, E, E),
                &mut MatMut::new(tmp, F, E),
            );
            matrix_matrix_multiply::<F, E, E, F>(
                Accumulate::Subtract,
                MatRef::new(tmp, F, E),
                MatRef::new(etf, E, F),
                &mut MatMut::new(lhs, F, F),
            );
            if b.is_some() {
                matrix_vector_multiply::<F, E>(
                    Accumulate::Subtract,
                    MatRef::new(tmp, F, E),
                    g,
                    rhs,
                );
            }
        }
        drop(slots);

        for row in &bs.rows[plan.first_f_only_row..] {
            let f_cell = row.cells[0];
            let f = MatRef::new(&values[f_cell.position..], row.block.size, F);
            matrix_transpose_matrix_multiply::<DYNAMIC, F, DYNAMIC, F>(
                Accumulate::Add,
                f,
                f,
                &mut MatMut::new(lhs, F, F),
            );
            if let Some(b) = b {
                matrix_transpose_vector_multiply::<DYNAMIC, F>(
                    Accumulate::Add,
                    f,
                    &b[row.block.range()],
                    rhs,
                );
            }
        }

        self.inverse_cache.set_valid(true);
        Ok(())
    }

    /// `d` is not read: the EᵗE inverses kept by `eliminate` already include
    /// it.
    fn back_substitute(
        &self,
        a: &BlockSparseMatrix,
        b: &[f64],
        d: Option<&[f64]>,
        z: &[f64],
        y: &mut [f64],
    ) -> LinAlgResult<()> {
        let plan = self.plan.as_ref().ok_or_else(|| {
            LinAlgError::InvalidState("Schur eliminator used before init".to_string())
        })?;
        if !self.inverse_cache.is_valid() {
            return Err(LinAlgError::InvalidState(
                "back_substitute needs a preceding eliminate".to_string(),
            ));
        }
        Self::check_matrix(plan, a)?;
        LinAlgError::check_len("b", a.num_rows(), b.len())?;
        if let Some(d) = d {
            LinAlgError::check_len("D", a.num_cols(), d.len())?;
        }
        LinAlgError::check_len("z", F, z.len())?;
        LinAlgError::check_len("y", plan.num_cols_e, y.len())?;

        let bs = a.block_structure();
        let values = a.values();
        let mut sj = [0.0; ROW];
        let mut g = [0.0; E];
        for (e_block, &chunk_id) in plan.chunk_of_e_block.iter().enumerate() {
            let y_e = &mut y[bs.cols[e_block].range()];
            let chunk = chunk_id.and_then(|c| self.inverse_cache.get(c).map(|inverse| (c, inverse)));
            let Some((chunk_id, inverse)) = chunk else {
                y_e.fill(0.0);
                continue;
            };

            g.fill(0.0);
            for row in &bs.rows[plan.chunks[chunk_id].rows()] {
                sj.copy_from_slice(&b[row.block.range()]);
                if let Some(f_cell) = row.cells.get(1) {
                    matrix_vector_multiply::<ROW, F>(
                        Accumulate::Subtract,
                        MatRef::new(&values[f_cell.position..], ROW, F),
                        z,
                        &mut sj,
                    );
                }
                matrix_transpose_vector_multiply::<ROW, E>(
                    Accumulate::Add,
                    MatRef::new(&values[row.cells[0].position..], ROW, E),
                    &sj,
                    &mut g,
                );
            }
            matrix_vector_multiply::<E, E>(Accumulate::Assign, MatRef::new(inverse, E, E), &g, y_e);
        }
        Ok(())
    }

    fn block_sizes(&self) -> BlockSizes {
        BlockSizes::new(ROW, E, F)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::block_random_access::BlockRandomAccessDenseMatrix;
    use crate::linalg::schur_eliminator::{SchurEliminator, SchurEliminatorOptions, create_schur_eliminator};
    use crate::linalg::synthetic::{SyntheticProblem, SyntheticProblemOptions, generate_problem};

    fn one_camera_problem(camera_size: usize, priors: usize) -> SyntheticProblem {
        let options = SyntheticProblemOptions::new()
            .with_points(12)
            .with_cameras(1)
            .with_observations_per_point(1)
            .with_block_sizes(2, 3, camera_size)
            .with_camera_priors(priors)
            .with_seed(3);
        generate_problem(&options).unwrap()
    }

    fn reduce(
        eliminator: &mut dyn SchurEliminatorBase,
        problem: &SyntheticProblem,
        size: usize,
    ) -> (Vec<f64>, Vec<f64>) {
        let mut lhs = BlockRandomAccessDenseMatrix::new(&[size]);
        let mut rhs = vec![0.0; size];
        eliminator
            .eliminate(&problem.matrix, Some(&problem.b), Some(&problem.d), &mut lhs, &mut rhs)
            .unwrap();
        (lhs.to_dense().as_slice().to_vec(), rhs)
    }

    #[test]
    fn test_matches_generic_eliminator() {
        let problem = one_camera_problem(6, 2);
        let bs = problem.matrix.block_structure();
        let n = problem.num_eliminate_blocks;

        let mut fast = SchurEliminatorForOneFBlock::<2, 3, 6>::new();
        fast.init(n, true, bs).unwrap();
        let mut generic = SchurEliminator::<2, 3, 6>::new(&SchurEliminatorOptions::new(n));
        generic.init(n, true, bs).unwrap();

        let (lhs_fast, rhs_fast) = reduce(&mut fast, &problem, 6);
        let (lhs_generic, rhs_generic) = reduce(&mut generic, &problem, 6);
        for (a, b) in lhs_fast.iter().zip(&lhs_generic) {
            assert!((a - b).abs() < 1e-10);
        }
        for (a, b) in rhs_fast.iter().zip(&rhs_generic) {
            assert!((a - b).abs() < 1e-10);
        }

        let z: Vec<f64> = (0..6).map(|i| 0.1 * i as f64).collect();
        let ne = bs.num_cols_e(n);
        let mut y_fast = vec![0.0; ne];
        let mut y_generic = vec![0.0; ne];
        fast.back_substitute(&problem.matrix, &problem.b, Some(&problem.d), &z, &mut y_fast)
            .unwrap();
        generic
            .back_substitute(&problem.matrix, &problem.b, Some(&problem.d), &z, &mut y_generic)
            .unwrap();
        for (a, b) in y_fast.iter().zip(&y_generic) {
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn test_back_substitute_requires_eliminate() {
        let problem = one_camera_problem(9, 0);
        let mut fast = SchurEliminatorForOneFBlock::<2, 3, 9>::new();
        fast.init(problem.num_eliminate_blocks, true, problem.matrix.block_structure())
            .unwrap();
        let mut y = vec![0.0; problem.num_eliminate_blocks * 3];
        let result = fast.back_substitute(&problem.matrix, &problem.b, None, &[0.0; 9], &mut y);
        assert!(matches!(result, Err(LinAlgError::InvalidState(_))));
    }

    #[test]
    fn test_init_rejects_two_f_blocks() {
        let options = SyntheticProblemOptions::new()
            .with_points(4)
            .with_cameras(2)
            .with_block_sizes(2, 3, 6);
        let problem = generate_problem(&options).unwrap();
        let mut fast = SchurEliminatorForOneFBlock::<2, 3, 6>::new();
        let result = fast.init(problem.num_eliminate_blocks, true, problem.matrix.block_structure());
        assert!(matches!(result, Err(LinAlgError::InvalidStructure(_))));
    }

    #[test]
    fn test_factory_selects_fast_path() {
        let problem = one_camera_problem(9, 1);
        let bs = problem.matrix.block_structure();
        let options = SchurEliminatorOptions::new(problem.num_eliminate_blocks);

        let eliminator = create_schur_eliminator(&options, bs).unwrap();
        assert!(format!("{eliminator:?}").starts_with("SchurEliminatorForOneFBlock"));
        assert_eq!(eliminator.block_sizes(), BlockSizes::new(2, 3, 9));

        let options = options.with_single_f_block_fast_path(false);
        let eliminator = create_schur_eliminator(&options, bs).unwrap();
        assert!(format!("{eliminator:?}").starts_with("SchurEliminator {"));
    }
}
