//! Inverse and pseudo-inverse of small symmetric positive semi-definite blocks.
//!
//! Whether a block is inverted exactly or pseudo-inverted is decided by the
//! caller up front through `assume_full_rank`. It is a numerical policy, not
//! an error path:
//!
//! - full rank, size <= 4: closed-form inverse
//! - full rank, larger: Cholesky factorization solved against the identity
//! - otherwise: Moore-Penrose pseudo-inverse from an SVD, dropping singular
//!   values below `eps * n * sigma_max`
//!
//! If a block declared full rank turns out not to be positive definite, the
//! pseudo-inverse is used instead and a warning is logged.

use nalgebra::DMatrix;
use tracing::{trace, warn};

/// Largest size for which the closed-form inverse is used.
const CLOSED_FORM_MAX_SIZE: usize = 4;

/// Invert a symmetric PSD matrix according to the rank policy.
pub fn invert_psd_matrix(assume_full_rank: bool, m: &DMatrix<f64>) -> DMatrix<f64> {
    let n = m.nrows();
    assert_eq!(n, m.ncols(), "cannot invert a non-square block");
    if n == 0 {
        return DMatrix::zeros(0, 0);
    }

    if assume_full_rank {
        let inverse = if n <= CLOSED_FORM_MAX_SIZE {
            m.clone().try_inverse()
        } else {
            m.clone().cholesky().map(|chol| chol.inverse())
        };
        if let Some(inverse) = inverse {
            return inverse;
        }
        warn!(
            "{}x{} block assumed full rank is not positive definite, using pseudo-inverse",
            n, n
        );
    }

    pseudo_inverse(m)
}

fn pseudo_inverse(m: &DMatrix<f64>) -> DMatrix<f64> {
    let n = m.nrows();
    let svd = m.clone().svd(true, true);
    let tolerance = f64::EPSILON * n as f64 * svd.singular_values.max();
    trace!(
        "pseudo-inverse of {}x{} block, rank {}",
        n,
        n,
        svd.rank(tolerance)
    );
    // U and V are always requested above and the tolerance is non-negative.
    svd.pseudo_inverse(tolerance)
        .unwrap_or_else(|_| DMatrix::zeros(n, n))
}

/// Invert a row-major `size x size` block from `block` into `out`.
pub fn invert_psd_block(assume_full_rank: bool, block: &[f64], size: usize, out: &mut [f64]) {
    let m = DMatrix::from_row_slice(size, size, &block[..size * size]);
    let inverse = invert_psd_matrix(assume_full_rank, &m);
    for (row, out_row) in out[..size * size].chunks_exact_mut(size).enumerate() {
        for (col, value) in out_row.iter_mut().enumerate() {
            *value = inverse[(row, col)];
        }
    }
}
