//! End-to-end checks of the public API against dense nalgebra references.

use block_schur::linalg::{
    BlockRandomAccessDenseMatrix, BlockRandomAccessDiagonalMatrix, BlockRandomAccessMatrix,
    BlockSizes, ConjugateGradientsOptions, ConjugateGradientsSolver, ImplicitSchurComplement,
    LinearSolverOptions, PreconditionerType, SchurEliminatorOptions, SchurVariant,
    SyntheticProblem, SyntheticProblemOptions, create_schur_eliminator, create_schur_solver,
    generate_problem,
};
use block_schur::{LinAlgError, ParallelContext};
use nalgebra::DVector;

fn problem(seed: u64) -> SyntheticProblem {
    let options = SyntheticProblemOptions::new()
        .with_points(30)
        .with_cameras(6)
        .with_observations_per_point(3)
        .with_block_sizes(2, 3, 9)
        .with_camera_priors(3)
        .with_seed(seed);
    generate_problem(&options).unwrap()
}

fn f_sizes(problem: &SyntheticProblem) -> Vec<usize> {
    problem.matrix.block_structure().cols[problem.num_eliminate_blocks..]
        .iter()
        .map(|c| c.size)
        .collect()
}

#[test]
fn test_eliminate_then_back_substitute_solves_damped_least_squares() {
    for seed in [1, 2, 3] {
        let problem = problem(seed);
        let d = Some(problem.d.as_slice());
        let options = SchurEliminatorOptions::new(problem.num_eliminate_blocks)
            .with_context(ParallelContext::new(3).unwrap());
        let mut eliminator =
            create_schur_eliminator(&options, problem.matrix.block_structure()).unwrap();

        let sizes = f_sizes(&problem);
        let mut lhs = BlockRandomAccessDenseMatrix::new(&sizes);
        let mut rhs = vec![0.0; sizes.iter().sum()];
        eliminator
            .eliminate(&problem.matrix, Some(&problem.b), d, &mut lhs, &mut rhs)
            .unwrap();
        let z = lhs
            .to_dense()
            .cholesky()
            .unwrap()
            .solve(&DVector::from_vec(rhs));

        let ne = problem.num_cols_e();
        let mut y = vec![0.0; ne];
        eliminator
            .back_substitute(&problem.matrix, &problem.b, d, z.as_slice(), &mut y)
            .unwrap();

        let (h, g) = problem.dense_normal_equations(d);
        let expected = h.cholesky().unwrap().solve(&g);
        for (i, value) in y.iter().chain(z.iter()).enumerate() {
            assert!(
                (value - expected[i]).abs() < 1e-8,
                "seed {seed}, entry {i}: {value} vs {}",
                expected[i]
            );
        }
    }
}

#[test]
fn test_diagonal_lhs_holds_block_diagonal_of_schur_complement() {
    let problem = problem(4);
    let d = Some(problem.d.as_slice());
    let options = SchurEliminatorOptions::new(problem.num_eliminate_blocks)
        .with_block_sizes(BlockSizes::new(2, 3, 9));
    let mut eliminator =
        create_schur_eliminator(&options, problem.matrix.block_structure()).unwrap();

    let sizes = f_sizes(&problem);
    let mut diagonal = BlockRandomAccessDiagonalMatrix::new(&sizes);
    let mut rhs = vec![0.0; sizes.iter().sum()];
    eliminator
        .eliminate(&problem.matrix, None, d, &mut diagonal, &mut rhs)
        .unwrap();
    assert!(rhs.iter().all(|v| *v == 0.0));

    let (s, _) = problem.dense_schur_complement(d).unwrap();
    let dense = diagonal.to_dense();
    let mut offset = 0;
    for size in sizes {
        let expected = s.view((offset, offset), (size, size));
        let actual = dense.view((offset, offset), (size, size));
        assert!((actual.clone_owned() - expected).abs().max() < 1e-8);
        offset += size;
    }
}

#[test]
fn test_implicit_operator_solves_reduced_system_with_cg() {
    let problem = problem(5);
    let d = Some(problem.d.as_slice());
    let options = LinearSolverOptions::new(problem.num_eliminate_blocks)
        .with_preconditioner(PreconditionerType::Jacobi);
    let mut isc = ImplicitSchurComplement::new(&options);
    isc.init(&problem.matrix, d, &problem.b).unwrap();

    let cg = ConjugateGradientsSolver::new(
        ConjugateGradientsOptions::default()
            .with_max_iterations(200)
            .with_tolerance(1e-12),
    );
    let mut z = vec![0.0; isc.num_cols_f()];
    let summary = cg.solve(&isc, None, isc.rhs(), &mut z).unwrap();
    assert!(summary.is_success(), "{summary}");

    let (s, r) = problem.dense_schur_complement(d).unwrap();
    let expected = s.cholesky().unwrap().solve(&r);
    for (a, e) in z.iter().zip(expected.iter()) {
        assert!((a - e).abs() < 1e-7);
    }
}

#[test]
fn test_solvers_agree_across_thread_counts() {
    let problem = problem(6);
    let d = Some(problem.d.as_slice());
    let mut solutions = Vec::new();
    for variant in [SchurVariant::Dense, SchurVariant::Sparse] {
        for threads in [1, 2, 6] {
            let options = LinearSolverOptions::new(problem.num_eliminate_blocks)
                .with_cache_ete_inverses(threads % 2 == 0)
                .with_context(ParallelContext::new(threads).unwrap());
            let mut solver = create_schur_solver(variant, options);
            let mut x = vec![0.0; problem.matrix.num_cols()];
            solver.solve(&problem.matrix, &problem.b, d, &mut x).unwrap();
            solutions.push((variant, threads, x));
        }
    }
    let (_, _, reference) = &solutions[0];
    for (variant, threads, x) in &solutions[1..] {
        for (a, e) in x.iter().zip(reference) {
            assert!((a - e).abs() < 1e-9, "{variant:?}/{threads}: {a} vs {e}");
        }
    }
}

#[test]
fn test_structural_errors_are_reported() {
    let problem = problem(7);
    let bs = problem.matrix.block_structure();

    // Camera blocks are 9 wide; a 6-wide specialization does not fit.
    let options = SchurEliminatorOptions::new(problem.num_eliminate_blocks)
        .with_block_sizes(BlockSizes::new(2, 3, 6));
    assert!(matches!(
        create_schur_eliminator(&options, bs),
        Err(LinAlgError::InvalidStructure(_))
    ));

    let options = SchurEliminatorOptions::new(0);
    assert!(create_schur_eliminator(&options, bs).is_err());

    let mut solver = create_schur_solver(
        SchurVariant::Dense,
        LinearSolverOptions::new(problem.num_eliminate_blocks),
    );
    let mut x = vec![0.0; problem.matrix.num_cols() - 1];
    assert!(solver.solve(&problem.matrix, &problem.b, None, &mut x).is_err());
}
