//! Schur Complement Demo Binary
//!
//! Generates a synthetic bundle-adjustment shaped least-squares problem,
//! solves it with one of the reduced-system solvers and reports timings and
//! the normal-equation residual of the result.
//!
//! # Usage
//! ```bash
//! cargo run --release --bin schur_demo -- --points 20000 --cameras 50
//!
//! # Iterative solver with the Schur-Jacobi preconditioner on 8 threads:
//! cargo run --release --bin schur_demo -- --solver iterative --preconditioner schur-jacobi -t 8
//! ```

use block_schur::linalg::{
    BlockSparseMatrix, LinearSolverOptions, PreconditionerType, SchurVariant, SyntheticProblemOptions,
    create_schur_solver, generate_problem,
};
use block_schur::{ParallelContext, init_logger, init_logger_with_level};
use clap::{Parser, ValueEnum};
use std::error::Error;
use std::time::Instant;
use tracing::{Level, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SolverArg {
    Dense,
    Sparse,
    Iterative,
}

impl From<SolverArg> for SchurVariant {
    fn from(arg: SolverArg) -> Self {
        match arg {
            SolverArg::Dense => SchurVariant::Dense,
            SolverArg::Sparse => SchurVariant::Sparse,
            SolverArg::Iterative => SchurVariant::Iterative,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PreconditionerArg {
    Identity,
    Jacobi,
    SchurJacobi,
    PowerSeries,
}

impl From<PreconditionerArg> for PreconditionerType {
    fn from(arg: PreconditionerArg) -> Self {
        match arg {
            PreconditionerArg::Identity => PreconditionerType::Identity,
            PreconditionerArg::Jacobi => PreconditionerType::Jacobi,
            PreconditionerArg::SchurJacobi => PreconditionerType::SchurJacobi,
            PreconditionerArg::PowerSeries => PreconditionerType::SchurPowerSeriesExpansion,
        }
    }
}

/// Schur complement elimination on a synthetic problem
#[derive(Parser)]
#[command(name = "schur_demo")]
#[command(about = "Solve a synthetic bipartite least-squares problem through its Schur complement")]
struct Args {
    /// Number of eliminated (point) blocks
    #[arg(long, default_value_t = 2000)]
    points: usize,

    /// Number of kept (camera) blocks
    #[arg(long, default_value_t = 20)]
    cameras: usize,

    /// Cameras observing each point
    #[arg(long, default_value_t = 4)]
    observations: usize,

    /// Columns per camera block
    #[arg(long, default_value_t = 9)]
    camera_size: usize,

    /// Camera-camera prior rows (F-only rows)
    #[arg(long, default_value_t = 0)]
    priors: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Worker threads
    #[arg(short, long, default_value_t = 1)]
    threads: usize,

    #[arg(long, value_enum, default_value_t = SolverArg::Sparse)]
    solver: SolverArg,

    /// Preconditioner for the iterative solver
    #[arg(long, value_enum, default_value_t = PreconditionerArg::SchurJacobi)]
    preconditioner: PreconditionerArg,

    /// Keep EᵗE inverses from elimination for back-substitution
    #[arg(long)]
    cache_inverses: bool,

    /// Skip the damping diagonal
    #[arg(long)]
    undamped: bool,

    /// Number of repeated solves, for timing
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// `|Aᵗ(A x - b) + D² x|`, the gradient of the damped objective at `x`.
fn normal_equation_residual(
    a: &BlockSparseMatrix,
    b: &[f64],
    d: Option<&[f64]>,
    x: &[f64],
) -> Result<f64, Box<dyn Error>> {
    let mut ax = b.iter().map(|v| -v).collect::<Vec<_>>();
    a.right_multiply_and_accumulate(x, &mut ax)?;
    let mut gradient = vec![0.0; x.len()];
    a.left_multiply_and_accumulate(&ax, &mut gradient)?;
    if let Some(d) = d {
        for ((g, d), x) in gradient.iter_mut().zip(d).zip(x) {
            *g += d * d * x;
        }
    }
    Ok(gradient.iter().map(|g| g * g).sum::<f64>().sqrt())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    if args.verbose {
        init_logger_with_level(Level::DEBUG);
    } else {
        init_logger();
    }

    info!("BLOCK-SCHUR DEMO");
    info!("");

    let problem_options = SyntheticProblemOptions::new()
        .with_points(args.points)
        .with_cameras(args.cameras)
        .with_observations_per_point(args.observations)
        .with_block_sizes(2, 3, args.camera_size)
        .with_camera_priors(args.priors)
        .with_seed(args.seed);

    let start_generate = Instant::now();
    let problem = generate_problem(&problem_options)?;
    let bs = problem.matrix.block_structure();
    info!("Problem statistics:");
    info!("  Points (E-blocks): {}", problem.num_eliminate_blocks);
    info!("  Cameras (F-blocks): {}", args.cameras);
    info!("  Rows: {}", problem.matrix.num_rows());
    info!("  Columns: {}", problem.matrix.num_cols());
    info!("  Non-zeros: {}", bs.num_nonzeros());
    info!("  Generation time: {:?}", start_generate.elapsed());
    info!("");

    let options = LinearSolverOptions::new(problem.num_eliminate_blocks)
        .with_preconditioner(args.preconditioner.into())
        .with_cache_ete_inverses(args.cache_inverses)
        .with_context(ParallelContext::new(args.threads)?);
    let variant = SchurVariant::from(args.solver);
    info!("Solver: {:?}", variant);
    if matches!(variant, SchurVariant::Iterative) {
        info!("  Preconditioner: {:?}", options.preconditioner);
    }
    info!("  Threads: {}", args.threads);

    let d = (!args.undamped).then_some(problem.d.as_slice());
    let mut solver = create_schur_solver(variant, options);
    let mut x = vec![0.0; problem.matrix.num_cols()];

    let mut timings = Vec::with_capacity(args.repeat.max(1));
    let mut summary = None;
    for _ in 0..args.repeat.max(1) {
        let start = Instant::now();
        summary = Some(solver.solve(&problem.matrix, &problem.b, d, &mut x)?);
        timings.push(start.elapsed());
    }
    let Some(summary) = summary else {
        return Err("no solve was run".into());
    };

    info!("");
    info!("Result: {}", summary);
    if let (Some(first), Some(best)) = (timings.first(), timings.iter().min()) {
        info!("  First solve: {:?}", first);
        info!("  Best solve: {:?}", best);
    }

    let residual = normal_equation_residual(&problem.matrix, &problem.b, d, &x)?;
    info!("  Normal equation residual: {:.3e}", residual);
    if !summary.is_success() {
        warn!("Solver did not converge: {}", summary.message);
    }

    Ok(())
}
