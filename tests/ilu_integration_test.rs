//! Integration tests for the incomplete LU engine and iterative refinement.

mod support;

use std::sync::{Arc, Mutex};

use approx::assert_abs_diff_eq;
use sparsefac::error::ErrorKind;
use sparsefac::solver::ilu::MIN_DSHIFT;
use sparsefac::{
    refine, reverse_cuthill_mckee, CancelToken, CsrMatrix, IluOptions, IluParams, RefineParams,
    SolverError, SparseIlu, SparseLu,
};

use support::{convection_diffusion, grid_laplacian, init_tracing, relative_residual};

fn ilu_solve(ilu: &SparseIlu, b: &[f64]) -> Vec<f64> {
    let mut x = vec![0.0; b.len()];
    ilu.solve(&mut x, b).expect("solve failed");
    x
}

// ── Fill control ────────────────────────────────────────────────

#[test]
fn test_fill_shrinks_as_drop_tol_grows() {
    init_tracing();
    let a = grid_laplacian(5);
    let mut counts = Vec::new();
    for tol in [1e-6, 1e-2, 0.5] {
        let mut ilu = SparseIlu::with_params(IluParams {
            drop_tol: tol,
            max_fill: 10.0,
            ..Default::default()
        })
        .unwrap();
        ilu.factor(&a).unwrap();
        assert_eq!(ilu.applied_drop_tol(), tol);
        counts.push(ilu.non_zero_count());
    }
    assert!(counts[0] >= counts[1], "{counts:?}");
    assert!(counts[1] >= counts[2], "{counts:?}");
    // The diagonal is always kept.
    assert!(counts[2] >= 25);
}

#[test]
fn test_fill_budget_is_respected() {
    let a = grid_laplacian(12);
    let mut ilu = SparseIlu::new();
    ilu.set_max_fill(0.5).unwrap();
    ilu.set_quality(0.0).unwrap();
    ilu.factor(&a).unwrap();

    let stats = ilu.last_stats();
    assert!(stats.lower_nnz + stats.upper_nnz <= (1.5 * a.nnz() as f64) as usize);
    assert_eq!(stats.attempts, 1);
    assert!(stats.fill_ratio() > 0.0);
}

// ── Preconditioning ─────────────────────────────────────────────

#[test]
fn test_refinement_with_incomplete_factor() {
    let a = grid_laplacian(10);
    let n = a.nrows;
    let b: Vec<f64> = (0..n).map(|i| 1.0 + (i % 3) as f64).collect();

    let mut ilu = SparseIlu::new();
    ilu.factor(&a).unwrap();
    assert!(!ilu.is_exact());

    let params = RefineParams {
        precision: 1e-6,
        max_iterations: 200,
        lenient: false,
    };
    let mut x = vec![0.0; n];
    let report = refine(&a, &ilu, &mut x, &b, &params).unwrap();
    // Incomplete, so more than one step, but a useful preconditioner.
    assert!(report.iterations > 1);
    assert!(report.iterations < 200);
    assert!(report.residual <= 1e-6);
    // Max-norm ratio is at most sqrt(n) times the 2-norm ratio.
    assert!(relative_residual(&a, &x, &b) <= 1e-5);
}

#[test]
fn test_ordered_convection_diffusion() {
    let a = convection_diffusion(10, 2.0);
    let n = a.nrows;
    let p = reverse_cuthill_mckee(&a).unwrap();
    let b = vec![1.0; n];

    let mut ilu = SparseIlu::new();
    ilu.set_max_fill(4.0).unwrap();
    ilu.factor_permuted(&a, &vec![true; n], p.as_slice()).unwrap();

    let params = RefineParams {
        precision: 1e-8,
        max_iterations: 100,
        lenient: true,
    };
    let mut x = vec![0.0; n];
    let report = refine(&a, &ilu, &mut x, &b, &params).unwrap();
    assert!(report.residual <= 1.0);
}

#[test]
fn test_refactor_is_idempotent() {
    let a = convection_diffusion(8, 1.0);
    let b = vec![1.0; a.nrows];
    let mut ilu = SparseIlu::new();

    ilu.factor(&a).unwrap();
    let lower = ilu.lower().clone();
    let upper = ilu.upper().clone();
    let x1 = ilu_solve(&ilu, &b);

    ilu.factor(&a).unwrap();
    assert_eq!(ilu.lower(), &lower);
    assert_eq!(ilu.upper(), &upper);
    assert_eq!(ilu_solve(&ilu, &b), x1);
}

#[test]
fn test_symmetric_solve_matches_general_solve() {
    let a = grid_laplacian(5);
    let mut ilu = SparseIlu::new();
    ilu.set_max_fill(10.0).unwrap();
    ilu.factor(&a).unwrap();

    let b: Vec<f64> = (0..25).map(|i| (i as f64 * 0.3).cos()).collect();
    let x = ilu_solve(&ilu, &b);
    let mut y = vec![0.0; 25];
    ilu.symsolve(&mut y, &b).unwrap();
    for (xi, yi) in x.iter().zip(&y) {
        assert_abs_diff_eq!(*xi, *yi, epsilon = 1e-10);
    }
}

// ── Small matrices ──────────────────────────────────────────────

#[test]
fn test_min_size_matches_exact_lu() {
    let a = convection_diffusion(4, 1.0);
    let n = a.nrows;
    let b: Vec<f64> = (0..n).map(|i| i as f64 - 3.0).collect();

    let mut ilu = SparseIlu::new();
    ilu.set_min_size(100);
    ilu.factor(&a).unwrap();
    assert!(ilu.is_exact());
    assert_eq!(ilu.applied_drop_tol(), 0.0);

    let mut lu = SparseLu::new();
    lu.factor(&a).unwrap();
    let mut expected = vec![0.0; n];
    lu.solve(&mut expected, &b).unwrap();

    let x = ilu_solve(&ilu, &b);
    for (xi, ei) in x.iter().zip(&expected) {
        assert_abs_diff_eq!(*xi, *ei, epsilon = 1e-12);
    }
    assert!(relative_residual(&a, &x, &b) < 1e-13);
}

// ── Pivot recovery ──────────────────────────────────────────────

#[test]
fn test_indefinite_block_needs_shift() {
    // Each 2x2 block has a tiny leading diagonal; without a shift the
    // second pivot of the block blows up.
    let blocks = 4;
    let mut t = Vec::new();
    for k in 0..blocks {
        let i = 2 * k;
        t.extend([
            (i, i, 1e-12),
            (i, i + 1, 1.0),
            (i + 1, i, 1.0),
            (i + 1, i + 1, 1.0),
        ]);
    }
    let a = CsrMatrix::from_triplets(2 * blocks, 2 * blocks, &t);

    let mut ilu = SparseIlu::new();
    ilu.factor(&a).unwrap();
    assert!(ilu.last_stats().attempts > 1);
    assert!(ilu.applied_diag_shift() >= MIN_DSHIFT);
    // The configured shift is untouched.
    assert_eq!(ilu.diag_shift(), 0.0);

    // A second factorization starts from scratch again.
    ilu.factor(&a).unwrap();
    assert_eq!(ilu.applied_diag_shift(), MIN_DSHIFT);
}

#[test]
fn test_failure_reports_shift() {
    let mut ilu = SparseIlu::new();
    ilu.set_zero_threshold(1e12).unwrap();
    match ilu.factor(&grid_laplacian(3)) {
        Err(SolverError::ZeroPivot { diag_shift, .. }) => assert!(diag_shift > MIN_DSHIFT),
        other => panic!("expected a zero pivot, got {other:?}"),
    }
    assert!(!ilu.is_factored());
}

// ── Cancellation and progress ───────────────────────────────────

#[test]
fn test_cancelled_token_stops_factorization() {
    let a = grid_laplacian(60);
    let token = CancelToken::new();
    token.cancel();

    let mut ilu = SparseIlu::new();
    ilu.set_max_fill(20.0).unwrap();
    let err = ilu
        .factor_with(
            &a,
            &IluOptions {
                cancel: Some(&token),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(!ilu.is_factored());
    assert_eq!(ilu.non_zero_count(), 0);
}

#[test]
fn test_progress_events() {
    let a = grid_laplacian(60);
    let mut ilu = SparseIlu::new();
    ilu.set_max_fill(20.0).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    ilu.progress_event.connect(move |step| s.lock().unwrap().push(step));

    ilu.factor(&a).unwrap();
    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

// ── Input validation ────────────────────────────────────────────

#[test]
fn test_structural_errors_keep_factors() {
    let a = grid_laplacian(3);
    let mut ilu = SparseIlu::new();
    ilu.factor(&a).unwrap();

    let dup = CsrMatrix {
        nrows: 2,
        ncols: 2,
        values: vec![1.0, 2.0, 1.0],
        col_indices: vec![0, 0, 1],
        row_pointers: vec![0, 2, 3],
    };
    let err = ilu.factor(&dup).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Structural);
    assert!(matches!(
        ilu.factor_permuted(&a, &[true; 9], &[0, 1, 2, 3, 4, 5, 6, 7, 7]),
        Err(SolverError::InvalidPermutation(_))
    ));
    assert!(matches!(
        ilu.factor_masked(&a, &[true; 4]),
        Err(SolverError::SizeMismatch { .. })
    ));

    // Nothing above touched the factorization.
    assert!(ilu.is_factored());
    assert_eq!(ilu.size(), 9);
}

#[test]
fn test_parameter_validation() {
    assert!(SparseIlu::with_params(IluParams {
        quality: -0.1,
        ..Default::default()
    })
    .is_err());
    assert!(SparseIlu::with_params(IluParams {
        max_fill: f64::INFINITY,
        ..Default::default()
    })
    .is_err());

    let ilu = SparseIlu::with_params(IluParams {
        drop_tol: 0.0,
        diag_shift: 1e-9,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(ilu.drop_tol(), sparsefac::solver::ilu::MIN_DROPTOL);
    assert_eq!(ilu.diag_shift(), MIN_DSHIFT);

    let err = SparseIlu::with_params(IluParams {
        diag_shift: f64::NAN,
        ..Default::default()
    })
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parameter);
}
