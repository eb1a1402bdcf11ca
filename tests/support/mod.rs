//! Helpers shared by the integration tests.
#![allow(dead_code)]

use faer::prelude::*;
use faer::sparse::{SparseColMat, Triplet};
pub use num_complex::Complex64;
use serde_derive::Deserialize;
use sparsefac::{CsrMatrix, Scalar};

/// Install a subscriber once, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Fixture manifest ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct Manifest {
    #[serde(rename = "case")]
    pub cases: Vec<Case>,
}

#[derive(Debug, Deserialize)]
pub struct Case {
    pub name: String,
    pub size: usize,
    pub entries: Vec<(usize, usize, f64)>,
    pub rhs: Vec<f64>,
    pub solution: Vec<f64>,
    pub pivot_threshold: Option<f64>,
    pub max_zero_pivots: Option<usize>,
}

impl Case {
    pub fn matrix(&self) -> CsrMatrix<f64> {
        CsrMatrix::from_triplets(self.size, self.size, &self.entries)
    }
}

pub fn load_cases() -> Vec<Case> {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/cases.toml");
    let content = std::fs::read_to_string(path).expect("failed to read tests/fixtures/cases.toml");
    let manifest: Manifest = toml::from_str(&content).expect("failed to parse cases.toml");
    manifest.cases
}

// ── Matrix builders ─────────────────────────────────────────────

/// Five-point Laplacian on an m x m grid, natural ordering.
pub fn grid_laplacian(m: usize) -> CsrMatrix<f64> {
    convection_diffusion(m, 0.0)
}

/// Five-point diffusion plus upwinded convection in x. `peclet = 0` gives
/// the symmetric Laplacian.
pub fn convection_diffusion(m: usize, peclet: f64) -> CsrMatrix<f64> {
    let idx = |i: usize, j: usize| i * m + j;
    let mut t = Vec::new();
    for i in 0..m {
        for j in 0..m {
            let k = idx(i, j);
            t.push((k, k, 4.0 + peclet));
            if j > 0 {
                t.push((k, idx(i, j - 1), -1.0 - peclet));
            }
            if j + 1 < m {
                t.push((k, idx(i, j + 1), -1.0));
            }
            if i > 0 {
                t.push((k, idx(i - 1, j), -1.0));
            }
            if i + 1 < m {
                t.push((k, idx(i + 1, j), -1.0));
            }
        }
    }
    CsrMatrix::from_triplets(m * m, m * m, &t)
}

/// Deterministic pseudo-random permutation of `0..n`.
pub fn shuffled(n: usize, seed: u64) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..n).collect();
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    for i in (1..n).rev() {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let j = (state >> 33) as usize % (i + 1);
        perm.swap(i, j);
    }
    perm
}

pub fn complex_of(a: &CsrMatrix<f64>, shift: Complex64) -> CsrMatrix<Complex64> {
    let mut t = Vec::with_capacity(a.nnz() + a.nrows);
    for row in 0..a.nrows {
        let (cols, vals) = a.row(row);
        for (&c, &v) in cols.iter().zip(vals) {
            t.push((row, c, Complex64::new(v, 0.0)));
        }
        t.push((row, row, shift));
    }
    CsrMatrix::from_triplets(a.nrows, a.ncols, &t)
}

// ── Checks ──────────────────────────────────────────────────────

/// `‖A x - b‖∞ / ‖b‖∞`.
pub fn relative_residual<T: Scalar>(a: &CsrMatrix<T>, x: &[T], b: &[T]) -> f64 {
    let ax = a.spmv(x);
    let num = ax
        .iter()
        .zip(b)
        .map(|(&l, &r)| (l - r).abs_val())
        .fold(0.0, f64::max);
    let den = b.iter().map(|v| v.abs_val()).fold(0.0, f64::max);
    if den == 0.0 {
        num
    } else {
        num / den
    }
}

/// Reference solution from faer's sparse LU.
pub fn faer_solve(a: &CsrMatrix<f64>, b: &[f64]) -> Vec<f64> {
    let n = a.nrows;
    let mut triplets = Vec::with_capacity(a.nnz());
    for row in 0..n {
        let (cols, vals) = a.row(row);
        for (&c, &v) in cols.iter().zip(vals) {
            triplets.push(Triplet::new(row, c, v));
        }
    }
    let a_sp = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
        .expect("sparse matrix build failed");
    let lu = a_sp.sp_lu().expect("faer sparse LU failed");
    let rhs = faer::Mat::<f64>::from_fn(n, 1, |i, _| b[i]);
    let x = lu.solve(rhs);
    (0..n).map(|i| x[(i, 0)]).collect()
}
