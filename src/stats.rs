//! Diagnostics recorded by the most recent `factor` call.

use std::fmt;
use std::time::Duration;

/// Counters and timings for one factorization.
///
/// Purely informational: nothing in the engines reads these back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactorStats {
    pub size: usize,
    pub input_nnz: usize,
    pub lower_nnz: usize,
    pub upper_nnz: usize,
    pub zero_pivots: usize,
    /// Flop-equivalents spent in elimination.
    pub flops: u64,
    /// Number of factorization attempts (ILU retries with a larger shift).
    pub attempts: usize,
    /// Diagonal shift actually applied (ILU only).
    pub diag_shift: f64,
    /// Drop tolerance in effect at the end (ILU only).
    pub drop_tol: f64,
    pub elapsed: Duration,
}

impl FactorStats {
    pub fn factor_nnz(&self) -> usize {
        self.lower_nnz + self.upper_nnz
    }

    /// Ratio of factor non-zeros to input non-zeros.
    pub fn fill_ratio(&self) -> f64 {
        if self.input_nnz == 0 {
            0.0
        } else {
            self.factor_nnz() as f64 / self.input_nnz as f64
        }
    }
}

impl fmt::Display for FactorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Factorization Stats ===")?;
        writeln!(f, "  Size:                   {}", self.size)?;
        writeln!(f, "  Input non-zeros:        {}", self.input_nnz)?;
        writeln!(
            f,
            "  Factor non-zeros:       {} (L {} / U {}, fill {:.2})",
            self.factor_nnz(),
            self.lower_nnz,
            self.upper_nnz,
            self.fill_ratio()
        )?;
        writeln!(f, "  Zero pivots:            {}", self.zero_pivots)?;
        writeln!(f, "  Flops:                  {}", self.flops)?;
        if self.attempts > 1 || self.diag_shift > 0.0 {
            writeln!(
                f,
                "  Attempts:               {}  shift={:e}",
                self.attempts, self.diag_shift
            )?;
        }
        if self.drop_tol > 0.0 {
            writeln!(f, "  Drop tolerance:         {:e}", self.drop_tol)?;
        }
        writeln!(f, "  ─────────────────────────────────")?;
        write!(f, "  Elapsed:                {:>8.3}s", self.elapsed.as_secs_f64())
    }
}
