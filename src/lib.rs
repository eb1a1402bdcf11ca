//! Sparse direct solvers: a left-looking LU with threshold partial pivoting
//! for real and complex matrices, and a Crout incomplete LU for
//! preconditioning.
//!
//! ```no_run
//! use sparsefac::{CsrMatrix, SparseLu};
//!
//! let a = CsrMatrix::from_triplets(2, 2, &[(0, 0, 2.0), (0, 1, 1.0), (1, 1, 3.0)]);
//! let mut lu = SparseLu::new();
//! lu.factor(&a)?;
//! let mut x = vec![0.0; 2];
//! lu.solve(&mut x, &[3.0, 3.0])?;
//! # Ok::<(), sparsefac::SolverError>(())
//! ```

pub mod cancel;
pub mod error;
pub mod event;
pub mod ordering;
pub mod scalar;
pub mod solver;
pub mod sparse;
pub mod stats;

pub use cancel::CancelToken;
pub use error::{ErrorKind, Result, SolverError};
pub use event::{Event, SubscriberId};
pub use ordering::{reverse_cuthill_mckee, Permutation};
pub use scalar::Scalar;
pub use solver::{
    refine, DSparseLu, FactorOptions, FactorState, Factorization, IluOptions, IluParams,
    LuParams, RefineParams, RefineReport, SparseIlu, SparseLu, ZSparseLu,
};
pub use sparse::{CsrMatrix, SparseSource};
pub use stats::FactorStats;
