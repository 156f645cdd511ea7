//! Preconditioned conjugate gradients over a [`LinearOperator`].
//!
//! The operator must be symmetric positive semi-definite. Termination is
//! checked on the residual norm relative to `|b|`, and optionally on the
//! relative decrease of the quadratic model `Q(x) = ½ xᵗAx - xᵗb`, which is
//! the better criterion when the solve is an inner step of a nonlinear
//! optimizer.

use crate::error::{LinAlgError, LinAlgResult};
use crate::linalg::linear_operator::{
    LinearOperator, LinearSolverSummary, LinearSolverTermination, dot, norm,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConjugateGradientsOptions {
    pub max_iterations: usize,
    /// Convergence is not declared before this many iterations.
    pub min_iterations: usize,
    /// Stop when `|r| <= tolerance * |b|`.
    pub tolerance: f64,
    /// Stop when `i * (Q_i - Q_{i-1}) / Q_i` drops below this value.
    pub q_tolerance: Option<f64>,
    /// Recompute `r = b - Ax` from scratch every this many iterations to limit
    /// drift in the recursive update.
    pub residual_reset_period: usize,
}

impl Default for ConjugateGradientsOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            min_iterations: 0,
            tolerance: 1e-9,
            q_tolerance: None,
            residual_reset_period: 10,
        }
    }
}

impl ConjugateGradientsOptions {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_min_iterations(mut self, min_iterations: usize) -> Self {
        self.min_iterations = min_iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_q_tolerance(mut self, q_tolerance: f64) -> Self {
        self.q_tolerance = Some(q_tolerance);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConjugateGradientsSolver {
    options: ConjugateGradientsOptions,
}

fn is_zero_or_infinite(x: f64) -> bool {
    x == 0.0 || !x.is_finite()
}

impl ConjugateGradientsSolver {
    pub fn new(options: ConjugateGradientsOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ConjugateGradientsOptions {
        &self.options
    }

    /// Solve `A x = b` starting from the contents of `x`.
    ///
    /// `preconditioner` approximates `A⁻¹`. Numerical breakdown is reported
    /// through the summary, not as an error; errors are reserved for
    /// mismatched dimensions.
    pub fn solve(
        &self,
        a: &dyn LinearOperator,
        preconditioner: Option<&dyn LinearOperator>,
        b: &[f64],
        x: &mut [f64],
    ) -> LinAlgResult<LinearSolverSummary> {
        let n = a.num_rows();
        if a.num_cols() != n {
            return Err(LinAlgError::InvalidInput(format!(
                "conjugate gradients needs a square operator, got {}x{}",
                n,
                a.num_cols()
            )));
        }
        LinAlgError::check_len("b", n, b.len())?;
        LinAlgError::check_len("x", n, x.len())?;
        if let Some(m) = preconditioner {
            LinAlgError::check_len("preconditioner", n, m.num_rows())?;
        }

        let options = &self.options;
        let mut summary = LinearSolverSummary::new(
            LinearSolverTermination::NoConvergence,
            "Maximum number of iterations reached.",
        );

        let norm_b = norm(b);
        if norm_b == 0.0 {
            x.fill(0.0);
            summary.termination = LinearSolverTermination::Success;
            summary.message = "Convergence. |b| = 0.".to_string();
            return Ok(summary);
        }
        let tol_r = options.tolerance * norm_b;

        let mut r = vec![0.0; n];
        let mut z = vec![0.0; n];
        let mut p = vec![0.0; n];
        let mut q = vec![0.0; n];

        residual(a, b, x, &mut r)?;
        let mut norm_r = norm(&r);
        summary.residual_norm = norm_r;
        if options.min_iterations == 0 && norm_r <= tol_r {
            summary.termination = LinearSolverTermination::Success;
            summary.message = format!("Convergence. |r| = {norm_r:e}");
            return Ok(summary);
        }

        let mut rho = 1.0;
        // Q(x) = -½ xᵗ(b + r)
        let mut q0 = -0.5 * quadratic_model(x, b, &r);

        for iteration in 1..=options.max_iterations {
            summary.num_iterations = iteration;

            match preconditioner {
                Some(m) => {
                    z.fill(0.0);
                    m.right_multiply_and_accumulate(&r, &mut z)?;
                }
                None => z.copy_from_slice(&r),
            }

            let last_rho = rho;
            rho = dot(&r, &z);
            if is_zero_or_infinite(rho) {
                summary.termination = LinearSolverTermination::Failure;
                summary.message = format!("Numerical failure. rho = r'z = {rho:e}.");
                break;
            }

            if iteration == 1 {
                p.copy_from_slice(&z);
            } else {
                let beta = rho / last_rho;
                if is_zero_or_infinite(beta) {
                    summary.termination = LinearSolverTermination::Failure;
                    summary.message = format!(
                        "Numerical failure. beta = rho_n / rho_{{n-1}} = {beta:e}, \
                         rho_n = {rho:e}, rho_{{n-1}} = {last_rho:e}"
                    );
                    break;
                }
                for (p_i, z_i) in p.iter_mut().zip(&z) {
                    *p_i = z_i + beta * *p_i;
                }
            }

            q.fill(0.0);
            a.right_multiply_and_accumulate(&p, &mut q)?;
            let pq = dot(&p, &q);
            if pq <= 0.0 || !pq.is_finite() {
                summary.termination = LinearSolverTermination::NoConvergence;
                summary.message = format!(
                    "Matrix is indefinite, no more progress can be made. p'q = {pq:e}. |p| = {:e}.",
                    norm(&p)
                );
                break;
            }

            let alpha = rho / pq;
            if !alpha.is_finite() {
                summary.termination = LinearSolverTermination::Failure;
                summary.message =
                    format!("Numerical failure. alpha = rho / pq = {alpha:e}, rho = {rho:e}, pq = {pq:e}.");
                break;
            }

            for (x_i, p_i) in x.iter_mut().zip(&p) {
                *x_i += alpha * p_i;
            }

            if options.residual_reset_period > 0 && iteration % options.residual_reset_period == 0 {
                residual(a, b, x, &mut r)?;
            } else {
                for (r_i, q_i) in r.iter_mut().zip(&q) {
                    *r_i -= alpha * q_i;
                }
            }

            norm_r = norm(&r);
            summary.residual_norm = norm_r;
            let converging = iteration >= options.min_iterations;

            let q1 = -0.5 * quadratic_model(x, b, &r);
            if let Some(q_tolerance) = options.q_tolerance {
                let zeta = iteration as f64 * (q1 - q0) / q1;
                if converging && zeta < q_tolerance {
                    summary.termination = LinearSolverTermination::Success;
                    summary.message = format!(
                        "Iteration: {iteration} Convergence: zeta = {zeta:e} < {q_tolerance:e}. |r| = {norm_r:e}"
                    );
                    break;
                }
            }
            q0 = q1;

            if converging && norm_r <= tol_r {
                summary.termination = LinearSolverTermination::Success;
                summary.message = format!(
                    "Iteration: {iteration} Convergence. |r_i| = {norm_r:e} <= {tol_r:e} = r_tolerance."
                );
                break;
            }
        }

        debug!(
            "CG finished: {} in {} iterations, |r| = {:.3e}",
            summary.termination, summary.num_iterations, summary.residual_norm
        );
        Ok(summary)
    }
}

/// `r = b - A x`
fn residual(a: &dyn LinearOperator, b: &[f64], x: &[f64], r: &mut [f64]) -> LinAlgResult<()> {
    r.fill(0.0);
    a.right_multiply_and_accumulate(x, r)?;
    for (r_i, b_i) in r.iter_mut().zip(b) {
        *r_i = b_i - *r_i;
    }
    Ok(())
}

/// `xᵗ(b + r)`
fn quadratic_model(x: &[f64], b: &[f64], r: &[f64]) -> f64 {
    x.iter()
        .zip(b.iter().zip(r))
        .map(|(x_i, (b_i, r_i))| x_i * (b_i + r_i))
        .sum()
}
