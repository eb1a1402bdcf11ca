//! Iterative refinement on top of any factorization.
//!
//! Repeats `du = F⁻¹ r; u += du; r = f - A·u` until the relative residual
//! `‖r‖ / ‖f‖` reaches the requested precision. With an exact LU this
//! recovers the digits lost to pivoting compromises; with an incomplete
//! factorization it turns the preconditioner into a (slow) stationary
//! solver.

use crate::error::{Result, SolverError};
use crate::scalar::{is_tiny, Scalar};
use crate::sparse::{CsrMatrix, SparseSource};

use super::{check_solve_sizes, Factorization};

/// Stop early once the relative residual grows beyond this.
const DIVERGED: f64 = 1.0e5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineParams {
    /// Target relative residual.
    pub precision: f64,
    pub max_iterations: usize,
    /// Accept a final residual above `precision` as long as it stays at or
    /// below 1.
    pub lenient: bool,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            precision: 1.0e-8,
            max_iterations: 10,
            lenient: false,
        }
    }
}

impl RefineParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.precision.is_finite() && self.precision >= 0.0) {
            return Err(SolverError::invalid_parameter(
                "precision",
                format!("{} is not a non-negative number", self.precision),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineReport {
    pub iterations: usize,
    /// Relative residual after the last iteration.
    pub residual: f64,
}

fn norm2<T: Scalar>(x: &[T]) -> f64 {
    x.iter().map(|v| v.abs_sqr()).sum::<f64>().sqrt()
}

/// Refine `lhs` towards the solution of `A·x = rhs`.
///
/// `lhs` is used as the starting guess. `factor` must hold a factorization
/// of (an approximation of) `matrix`.
pub fn refine<T, F, M>(
    matrix: &M,
    factor: &F,
    lhs: &mut [T],
    rhs: &[T],
    params: &RefineParams,
) -> Result<RefineReport>
where
    T: Scalar,
    F: Factorization<T> + ?Sized,
    M: SparseSource<T> + ?Sized,
{
    params.validate()?;
    if !factor.is_factored() {
        return Err(SolverError::NotFactored);
    }
    let a = CsrMatrix::from_source(matrix);
    let n = factor.size();
    if a.nrows != n || a.ncols != n {
        return Err(SolverError::size_mismatch("matrix", n, a.nrows));
    }
    check_solve_sizes(n, lhs.len(), rhs.len())?;

    let rscale = norm2(rhs);
    if rscale.is_nan() {
        return Err(SolverError::NonFinite("right-hand side norm"));
    }
    if is_tiny(rscale) {
        lhs.fill(T::zero());
        return Ok(RefineReport {
            iterations: 0,
            residual: 0.0,
        });
    }
    let rscale = 1.0 / rscale;

    let mut r = vec![T::zero(); n];
    let mut du = vec![T::zero(); n];
    let residual = |u: &[T], r: &mut [T]| {
        a.spmv_into(u, r);
        for (ri, &fi) in r.iter_mut().zip(rhs) {
            *ri = fi - *ri;
        }
    };

    residual(lhs, &mut r);
    let mut iterations = 0;
    let mut error = 0.0;

    while iterations < params.max_iterations {
        factor.solve(&mut du, &r)?;
        for (ui, &d) in lhs.iter_mut().zip(&du) {
            *ui += d;
        }
        residual(lhs, &mut r);

        iterations += 1;
        error = rscale * norm2(&r);
        tracing::debug!(iteration = iterations, residual = error, "refinement step");

        if error.is_nan() {
            return Err(SolverError::NonFinite("residual norm"));
        }
        if error <= params.precision || error > DIVERGED {
            break;
        }
    }

    if error > params.precision.max(1.0) || (error > params.precision && !params.lenient) {
        return Err(SolverError::ResidualTooLarge(error));
    }
    Ok(RefineReport {
        iterations,
        residual: error,
    })
}
