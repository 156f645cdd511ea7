//! Seeded generator of bundle-adjustment-shaped block-sparse systems.
//!
//! Points are the E-blocks, cameras the F-blocks. Every observation is a row
//! block coupling one point with one camera. Optional camera priors add rows
//! that touch only cameras (two neighbouring cameras each, so they also couple
//! F-blocks outside the chunks).

use crate::error::{LinAlgError, LinAlgResult};
use crate::linalg::block_sparse::BlockSparseMatrix;
use crate::linalg::block_structure::CompressedRowBlockStructure;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticProblemOptions {
    pub num_points: usize,
    pub num_cameras: usize,
    /// Cameras observing each point, capped at `num_cameras`.
    pub observations_per_point: usize,
    pub point_block_size: usize,
    pub camera_block_size: usize,
    pub residual_size: usize,
    /// Rows that touch only cameras.
    pub num_camera_priors: usize,
    pub seed: u64,
}

impl Default for SyntheticProblemOptions {
    fn default() -> Self {
        Self {
            num_points: 100,
            num_cameras: 10,
            observations_per_point: 4,
            point_block_size: 3,
            camera_block_size: 9,
            residual_size: 2,
            num_camera_priors: 0,
            seed: 42,
        }
    }
}

impl SyntheticProblemOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_points(mut self, num_points: usize) -> Self {
        self.num_points = num_points;
        self
    }

    pub fn with_cameras(mut self, num_cameras: usize) -> Self {
        self.num_cameras = num_cameras;
        self
    }

    pub fn with_observations_per_point(mut self, observations: usize) -> Self {
        self.observations_per_point = observations;
        self
    }

    pub fn with_block_sizes(mut self, residual: usize, point: usize, camera: usize) -> Self {
        self.residual_size = residual;
        self.point_block_size = point;
        self.camera_block_size = camera;
        self
    }

    pub fn with_camera_priors(mut self, num_priors: usize) -> Self {
        self.num_camera_priors = num_priors;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// A generated system `A`, right-hand side `b` and damping `D`.
#[derive(Debug, Clone)]
pub struct SyntheticProblem {
    pub matrix: BlockSparseMatrix,
    pub b: Vec<f64>,
    pub d: Vec<f64>,
    pub num_eliminate_blocks: usize,
}

impl SyntheticProblem {
    pub fn num_cols_e(&self) -> usize {
        self.matrix.block_structure().num_cols_e(self.num_eliminate_blocks)
    }

    /// Dense `H = AᵗA + diag(D²)` and `g = Aᵗb`.
    pub fn dense_normal_equations(&self, d: Option<&[f64]>) -> (DMatrix<f64>, DVector<f64>) {
        let a = self.matrix.to_dense();
        let mut h = a.transpose() * &a;
        if let Some(d) = d {
            for (i, d_i) in d.iter().enumerate() {
                h[(i, i)] += d_i * d_i;
            }
        }
        let g = a.transpose() * DVector::from_column_slice(&self.b);
        (h, g)
    }

    /// Dense reduced system `S = H_ff - H_fe H_ee⁻¹ H_ef`,
    /// `r = g_f - H_fe H_ee⁻¹ g_e`. `None` when `H_ee` is singular.
    pub fn dense_schur_complement(
        &self,
        d: Option<&[f64]>,
    ) -> Option<(DMatrix<f64>, DVector<f64>)> {
        let (h, g) = self.dense_normal_equations(d);
        let ne = self.num_cols_e();
        let nf = h.ncols() - ne;
        let h_ee_inv = h.view((0, 0), (ne, ne)).into_owned().try_inverse()?;
        let h_ef = h.view((0, ne), (ne, nf)).into_owned();
        let h_fe_h_ee_inv = h_ef.transpose() * h_ee_inv;
        let s = h.view((ne, ne), (nf, nf)) - &h_fe_h_ee_inv * &h_ef;
        let r = g.rows(ne, nf) - h_fe_h_ee_inv * g.rows(0, ne);
        Some((s, r))
    }
}

pub fn generate_problem(options: &SyntheticProblemOptions) -> LinAlgResult<SyntheticProblem> {
    if options.num_points == 0 || options.num_cameras == 0 {
        return Err(LinAlgError::InvalidInput(
            "a synthetic problem needs at least one point and one camera".to_string(),
        ));
    }
    if options.observations_per_point == 0 {
        return Err(LinAlgError::InvalidInput(
            "observations_per_point must be positive".to_string(),
        ));
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let num_points = options.num_points;
    let num_cameras = options.num_cameras;

    let mut col_sizes = vec![options.point_block_size; num_points];
    col_sizes.extend(std::iter::repeat_n(options.camera_block_size, num_cameras));

    let observations = options.observations_per_point.min(num_cameras);
    let mut rows = Vec::with_capacity(num_points * observations + options.num_camera_priors);
    for point in 0..num_points {
        let mut cameras = sample(&mut rng, num_cameras, observations).into_vec();
        cameras.sort_unstable();
        for camera in cameras {
            rows.push((options.residual_size, vec![point, num_points + camera]));
        }
    }
    for prior in 0..options.num_camera_priors {
        let first = prior % num_cameras;
        let second = (prior + 1) % num_cameras;
        let mut cols = vec![num_points + first.min(second), num_points + first.max(second)];
        cols.dedup();
        rows.push((options.residual_size, cols));
    }

    let structure = CompressedRowBlockStructure::from_layout(&col_sizes, &rows)?;
    let values = (0..structure.num_nonzeros())
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    let b = (0..structure.num_rows())
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    let d = (0..structure.num_cols())
        .map(|_| rng.gen_range(0.1..1.0))
        .collect();

    debug!(
        "Synthetic problem: {} points, {} cameras, {} row blocks, {} non-zeros",
        num_points,
        num_cameras,
        structure.num_row_blocks(),
        structure.num_nonzeros()
    );

    Ok(SyntheticProblem {
        matrix: BlockSparseMatrix::from_values(Arc::new(structure), values)?,
        b,
        d,
        num_eliminate_blocks: num_points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::block_structure::{BlockSizes, compute_chunks, detect_structure};

    #[test]
    fn test_generated_structure_is_chunked() {
        let options = SyntheticProblemOptions::new()
            .with_points(20)
            .with_cameras(5)
            .with_observations_per_point(3)
            .with_camera_priors(4);
        let problem = generate_problem(&options).unwrap();
        let bs = problem.matrix.block_structure();

        let layout = compute_chunks(bs, problem.num_eliminate_blocks).unwrap();
        assert_eq!(layout.chunks.len(), 20);
        assert_eq!(layout.first_f_only_row, 60);
        assert_eq!(bs.num_row_blocks(), 64);
        assert_eq!(
            detect_structure(bs, problem.num_eliminate_blocks),
            BlockSizes::new(2, 3, 9)
        );
        assert_eq!(problem.b.len(), bs.num_rows());
        assert_eq!(problem.d.len(), bs.num_cols());
    }

    #[test]
    fn test_same_seed_same_problem() {
        let options = SyntheticProblemOptions::new().with_points(5).with_cameras(3);
        let a = generate_problem(&options).unwrap();
        let b = generate_problem(&options).unwrap();
        assert_eq!(a.matrix.values(), b.matrix.values());
        assert_eq!(a.b, b.b);

        let c = generate_problem(&options.clone().with_seed(7)).unwrap();
        assert_ne!(a.matrix.values(), c.matrix.values());
    }

    #[test]
    fn test_single_camera_prior_has_one_cell() {
        let options = SyntheticProblemOptions::new()
            .with_points(2)
            .with_cameras(1)
            .with_camera_priors(1);
        let problem = generate_problem(&options).unwrap();
        let bs = problem.matrix.block_structure();
        assert_eq!(bs.rows.last().map(|row| row.cells.len()), Some(1));
    }

    #[test]
    fn test_dense_schur_complement_solves_normal_equations() {
        let options = SyntheticProblemOptions::new().with_points(6).with_cameras(2);
        let problem = generate_problem(&options).unwrap();
        let d = Some(problem.d.as_slice());
        let (h, g) = problem.dense_normal_equations(d);
        let (s, r) = problem.dense_schur_complement(d).unwrap();

        let x = h.clone().cholesky().unwrap().solve(&g);
        let ne = problem.num_cols_e();
        let z = s.cholesky().unwrap().solve(&r);
        assert!((z - x.rows(ne, x.len() - ne)).abs().max() < 1e-8);
    }

    #[test]
    fn test_rejects_empty_problem() {
        let options = SyntheticProblemOptions::new().with_points(0);
        assert!(generate_problem(&options).is_err());
    }
}
