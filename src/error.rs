use thiserror::Error;

/// Broad classification of a [`SolverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad shapes, permutations or matrix structure. Detected before any
    /// numeric work; engine state is untouched.
    Structural,
    /// Singular or numerically unusable input. Engine state is rolled back.
    Numeric,
    /// The work budget was exhausted or the caller cancelled.
    Cancelled,
    /// An operation was called in the wrong state.
    Misuse,
    /// A tuning parameter was rejected at set-time.
    Parameter,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("matrix is not square: {nrows}x{ncols}")]
    NotSquare { nrows: usize, ncols: usize },

    #[error("size mismatch for {what}: expected {expected}, got {actual}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid permutation: {0}")]
    InvalidPermutation(String),

    #[error("invalid matrix structure: {0}")]
    InvalidStructure(String),

    #[error("invalid matrix; element ({row},{col}) appears twice")]
    DuplicateEntry { row: usize, col: usize },

    #[error("singular matrix: {zero_pivots} zero pivots exceed the maximum of {max_zero_pivots}")]
    Singular {
        zero_pivots: usize,
        max_zero_pivots: usize,
    },

    #[error("zero pivot in row {row}; maximum diagonal shift {diag_shift:e} has been applied")]
    ZeroPivot { row: usize, diag_shift: f64 },

    #[error("non-finite {0}")]
    NonFinite(&'static str),

    #[error("residual norm too large: {0:e}")]
    ResidualTooLarge(f64),

    #[error("factorization cancelled after {columns_done} columns")]
    Cancelled { columns_done: usize },

    #[error("no valid factorization available; factor a matrix first")]
    NotFactored,

    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

impl SolverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SolverError::NotSquare { .. }
            | SolverError::SizeMismatch { .. }
            | SolverError::InvalidPermutation(_)
            | SolverError::InvalidStructure(_)
            | SolverError::DuplicateEntry { .. } => ErrorKind::Structural,
            SolverError::Singular { .. }
            | SolverError::ZeroPivot { .. }
            | SolverError::NonFinite(_)
            | SolverError::ResidualTooLarge(_) => ErrorKind::Numeric,
            SolverError::Cancelled { .. } => ErrorKind::Cancelled,
            SolverError::NotFactored => ErrorKind::Misuse,
            SolverError::InvalidParameter { .. } => ErrorKind::Parameter,
        }
    }

    pub(crate) fn size_mismatch(what: &'static str, expected: usize, actual: usize) -> Self {
        SolverError::SizeMismatch {
            what,
            expected,
            actual,
        }
    }

    pub(crate) fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        SolverError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SolverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            SolverError::NotSquare { nrows: 2, ncols: 3 }.kind(),
            ErrorKind::Structural
        );
        assert_eq!(
            SolverError::Singular {
                zero_pivots: 1,
                max_zero_pivots: 0
            }
            .kind(),
            ErrorKind::Numeric
        );
        assert_eq!(
            SolverError::Cancelled { columns_done: 7 }.kind(),
            ErrorKind::Cancelled
        );
        assert_eq!(SolverError::NotFactored.kind(), ErrorKind::Misuse);
    }

    #[test]
    fn test_duplicate_message() {
        let err = SolverError::DuplicateEntry { row: 3, col: 1 };
        assert_eq!(err.to_string(), "invalid matrix; element (3,1) appears twice");
    }
}
