//! Sparse factorization engines.

pub mod colstore;
pub mod ilu;
pub mod lu;
pub mod refine;

pub use colstore::ColumnStore;
pub use ilu::{IluOptions, IluParams, SparseIlu};
pub use lu::{DSparseLu, FactorOptions, LuParams, SparseLu, ZSparseLu};
pub use refine::{refine, RefineParams, RefineReport};

use crate::error::{Result, SolverError};
use crate::scalar::Scalar;

/// Lifecycle of an engine. `clear` returns to `Empty` from any state, and a
/// failed `factor` rolls back to `Empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FactorState {
    #[default]
    Empty,
    Factored,
}

/// Solve access to a completed factorization.
pub trait Factorization<T: Scalar> {
    /// Dimension of the factored matrix, 0 when empty.
    fn size(&self) -> usize;

    /// Entries stored in the factors.
    fn non_zero_count(&self) -> usize;

    /// Approximate bytes held by the factors.
    fn mem_usage(&self) -> usize;

    fn is_factored(&self) -> bool;

    /// Solve `A x = rhs` into `lhs`.
    fn solve(&self, lhs: &mut [T], rhs: &[T]) -> Result<()>;

    /// Solve with the right-hand side taken from, and the solution written
    /// back to, the same buffer.
    fn solve_in_place(&self, x: &mut [T]) -> Result<()> {
        let rhs = x.to_vec();
        self.solve(x, &rhs)
    }
}

pub(crate) fn check_solve_sizes(n: usize, lhs: usize, rhs: usize) -> Result<()> {
    if lhs != n {
        return Err(SolverError::size_mismatch("lhs vector", n, lhs));
    }
    if rhs != n {
        return Err(SolverError::size_mismatch("rhs vector", n, rhs));
    }
    Ok(())
}
