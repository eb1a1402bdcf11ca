//! Incomplete LU factorization with threshold dropping.
//!
//! `SparseIlu` computes `A ≈ L·D·U` by Crout elimination: at step k the
//! k-th column of L and the k-th row of U are formed together from the
//! already computed factors. There is no pivoting. Stability comes from a
//! symmetric diagonal scaling and, when a pivot turns out unusable, from
//! restarting with a larger diagonal shift.
//!
//! The amount of fill is controlled three ways:
//!
//! * entries whose magnitude falls below the drop tolerance are discarded,
//! * each new column and row keeps at most its original length plus half of
//!   the per-step fill allowance, largest magnitudes first,
//! * when the total would exceed `(max_fill + 1) · nnz(A)`, the drop
//!   tolerance is raised for the rest of the call and the stored factors
//!   are pruned against it.
//!
//! The factors are meant for preconditioning. Matrices smaller than
//! `min_size` are handed to an exact [`SparseLu`] instead.

use std::borrow::Cow;
use std::time::Instant;

use crate::cancel::{CancelToken, Checkpoint, WorkMeter};
use crate::error::{Result, SolverError};
use crate::event::Event;
use crate::ordering::Permutation;
use crate::scalar::is_tiny;
use crate::sparse::{CsrMatrix, SparseSource};
use crate::stats::FactorStats;

use super::lu::{FactorOptions, SparseLu};
use super::{check_solve_sizes, ColumnStore, FactorState, Factorization};

/// Smallest non-zero diagonal shift.
pub const MIN_DSHIFT: f64 = 1.0e-5;
/// Smallest drop tolerance.
pub const MIN_DROPTOL: f64 = 1.0e-6;

const MAX_ATTEMPTS: usize = 20;
/// Pivots beyond this magnitude are rejected.
const MAX_PIVOT: f64 = 1.0e8;
const NONE: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IluParams {
    /// Relative magnitude below which computed entries are discarded.
    pub drop_tol: f64,
    /// Added to the scaled diagonal, with the sign of the diagonal, before
    /// elimination. 0 disables the shift.
    pub diag_shift: f64,
    /// Fill allowance as a multiple of the input non-zero count.
    pub max_fill: f64,
    /// Extra per-column fill allowance in [0, 1].
    pub quality: f64,
    /// Matrices with fewer rows are factored exactly.
    pub min_size: usize,
    /// A pivot at or below this fraction of its original diagonal is
    /// rejected.
    pub zero_threshold: f64,
}

impl Default for IluParams {
    fn default() -> Self {
        Self {
            drop_tol: MIN_DROPTOL,
            diag_shift: 0.0,
            max_fill: 1.0,
            quality: 1.0,
            min_size: 0,
            zero_threshold: 1.0e-6,
        }
    }
}

impl IluParams {
    /// Check the parameters and return them with the drop tolerance and
    /// diagonal shift raised to their minimum values where needed.
    pub fn validate(&self) -> Result<Self> {
        let mut params = *self;
        if self.drop_tol.is_nan() {
            return Err(SolverError::invalid_parameter("drop tolerance", "NaN"));
        }
        params.drop_tol = self.drop_tol.max(MIN_DROPTOL);

        if self.diag_shift.is_nan() || self.diag_shift < 0.0 {
            return Err(SolverError::invalid_parameter(
                "diagonal shift",
                format!("{} is negative or NaN", self.diag_shift),
            ));
        }
        if self.diag_shift > 0.0 {
            params.diag_shift = self.diag_shift.max(MIN_DSHIFT);
        }

        if !(self.max_fill.is_finite() && self.max_fill >= 0.0) {
            return Err(SolverError::invalid_parameter(
                "maximum fill",
                format!("{} is not a non-negative number", self.max_fill),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality) {
            return Err(SolverError::invalid_parameter(
                "quality",
                format!("{} is outside [0, 1]", self.quality),
            ));
        }
        if !(self.zero_threshold.is_finite() && self.zero_threshold > 0.0) {
            return Err(SolverError::invalid_parameter(
                "zero threshold",
                format!("{} is not a positive number", self.zero_threshold),
            ));
        }
        Ok(params)
    }
}

/// Optional inputs to [`SparseIlu::factor_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct IluOptions<'a> {
    /// `false` marks a row (and the matching column) as eliminated.
    pub mask: Option<&'a [bool]>,
    /// Symmetric permutation: `perm[k]` is the original row and column
    /// eliminated at step k.
    pub perm: Option<&'a [usize]>,
    pub cancel: Option<&'a CancelToken>,
}

/// Incomplete LU engine for real matrices.
pub struct SparseIlu {
    params: IluParams,
    state: FactorState,
    size: usize,
    /// Original index -> elimination step.
    perm_inv: Vec<usize>,
    /// Symmetric scaling, by original index.
    scales: Vec<f64>,
    /// Inverted pivots, by step. Zero for masked rows.
    pivots: Vec<f64>,
    /// Strict lower factor, one column per step.
    lower: ColumnStore<f64>,
    /// Strict upper factor, one row per step.
    upper: ColumnStore<f64>,
    exact: Option<Box<SparseLu<f64>>>,
    applied_diag_shift: f64,
    applied_drop_tol: f64,
    stats: FactorStats,
    /// Fired with the last finished step, at most once per
    /// [`CHECK_INTERVAL`](crate::cancel::CHECK_INTERVAL) flops.
    pub progress_event: Event<usize>,
}

impl Default for SparseIlu {
    fn default() -> Self {
        Self {
            params: IluParams::default(),
            state: FactorState::Empty,
            size: 0,
            perm_inv: Vec::new(),
            scales: Vec::new(),
            pivots: Vec::new(),
            lower: ColumnStore::new(),
            upper: ColumnStore::new(),
            exact: None,
            applied_diag_shift: 0.0,
            applied_drop_tol: 0.0,
            stats: FactorStats::default(),
            progress_event: Event::new(),
        }
    }
}

impl std::fmt::Debug for SparseIlu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseIlu")
            .field("params", &self.params)
            .field("state", &self.state)
            .field("size", &self.size)
            .field("exact", &self.exact.is_some())
            .finish()
    }
}

impl SparseIlu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: IluParams) -> Result<Self> {
        Ok(Self {
            params: params.validate()?,
            ..Self::default()
        })
    }

    pub fn params(&self) -> &IluParams {
        &self.params
    }

    fn update(&mut self, params: IluParams) -> Result<()> {
        self.params = params.validate()?;
        Ok(())
    }

    pub fn drop_tol(&self) -> f64 {
        self.params.drop_tol
    }

    /// Values below [`MIN_DROPTOL`] are raised to it.
    pub fn set_drop_tol(&mut self, tol: f64) -> Result<()> {
        self.update(IluParams {
            drop_tol: tol,
            ..self.params
        })
    }

    pub fn diag_shift(&self) -> f64 {
        self.params.diag_shift
    }

    /// 0 disables the shift; positive values below [`MIN_DSHIFT`] are
    /// raised to it.
    pub fn set_diag_shift(&mut self, dshift: f64) -> Result<()> {
        self.update(IluParams {
            diag_shift: dshift,
            ..self.params
        })
    }

    pub fn max_fill(&self) -> f64 {
        self.params.max_fill
    }

    pub fn set_max_fill(&mut self, mfill: f64) -> Result<()> {
        self.update(IluParams {
            max_fill: mfill,
            ..self.params
        })
    }

    pub fn quality(&self) -> f64 {
        self.params.quality
    }

    pub fn set_quality(&mut self, quality: f64) -> Result<()> {
        self.update(IluParams {
            quality,
            ..self.params
        })
    }

    pub fn min_size(&self) -> usize {
        self.params.min_size
    }

    pub fn set_min_size(&mut self, msize: usize) {
        self.params.min_size = msize;
    }

    pub fn zero_threshold(&self) -> f64 {
        self.params.zero_threshold
    }

    pub fn set_zero_threshold(&mut self, eps: f64) -> Result<()> {
        self.update(IluParams {
            zero_threshold: eps,
            ..self.params
        })
    }

    /// Diagonal shift used by the last successful factorization.
    pub fn applied_diag_shift(&self) -> f64 {
        self.applied_diag_shift
    }

    /// Drop tolerance in effect at the end of the last successful
    /// factorization.
    pub fn applied_drop_tol(&self) -> f64 {
        self.applied_drop_tol
    }

    pub fn last_stats(&self) -> &FactorStats {
        &self.stats
    }

    pub fn state(&self) -> FactorState {
        self.state
    }

    pub fn is_factored(&self) -> bool {
        self.state == FactorState::Factored
    }

    /// True when the last factorization went through the exact engine.
    pub fn is_exact(&self) -> bool {
        self.exact.is_some()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn lower(&self) -> &ColumnStore<f64> {
        &self.lower
    }

    /// Rows of the strict upper factor.
    pub fn upper(&self) -> &ColumnStore<f64> {
        &self.upper
    }

    /// Stored factor entries, pivots included.
    pub fn non_zero_count(&self) -> usize {
        match &self.exact {
            Some(lu) => lu.non_zero_count(),
            None if self.is_factored() => self.lower.nnz() + self.upper.nnz() + self.size,
            None => 0,
        }
    }

    pub fn mem_usage(&self) -> usize {
        let word = std::mem::size_of::<usize>();
        let real = std::mem::size_of::<f64>();
        let own = self.lower.mem_usage()
            + self.upper.mem_usage()
            + self.perm_inv.len() * word
            + (self.scales.len() + self.pivots.len()) * real;
        own + self.exact.as_ref().map_or(0, |lu| lu.mem_usage())
    }

    pub fn clear(&mut self) {
        self.lower.clear();
        self.upper.clear();
        self.perm_inv = Vec::new();
        self.scales = Vec::new();
        self.pivots = Vec::new();
        self.exact = None;
        self.size = 0;
        self.state = FactorState::Empty;
    }

    pub fn factor<M>(&mut self, matrix: &M) -> Result<()>
    where
        M: SparseSource<f64> + ?Sized,
    {
        self.factor_with(matrix, &IluOptions::default())
    }

    pub fn factor_masked<M>(&mut self, matrix: &M, mask: &[bool]) -> Result<()>
    where
        M: SparseSource<f64> + ?Sized,
    {
        self.factor_with(
            matrix,
            &IluOptions {
                mask: Some(mask),
                ..Default::default()
            },
        )
    }

    pub fn factor_permuted<M>(&mut self, matrix: &M, mask: &[bool], perm: &[usize]) -> Result<()>
    where
        M: SparseSource<f64> + ?Sized,
    {
        self.factor_with(
            matrix,
            &IluOptions {
                mask: Some(mask),
                perm: Some(perm),
                cancel: None,
            },
        )
    }

    /// Factor with any combination of mask, permutation and cancellation.
    ///
    /// A rejected pivot restarts the elimination with a larger diagonal
    /// shift, up to 20 attempts in total.
    pub fn factor_with<M>(&mut self, matrix: &M, options: &IluOptions<'_>) -> Result<()>
    where
        M: SparseSource<f64> + ?Sized,
    {
        let start = Instant::now();
        let a = CsrMatrix::from_source(matrix);
        let n = a.nrows;
        if a.ncols != n {
            return Err(SolverError::NotSquare {
                nrows: a.nrows,
                ncols: a.ncols,
            });
        }
        a.check_structure()?;
        let mask: Cow<'_, [bool]> = match options.mask {
            Some(mask) if mask.len() != n => {
                return Err(SolverError::size_mismatch("mask", n, mask.len()))
            }
            Some(mask) => Cow::Borrowed(mask),
            None => Cow::Owned(vec![true; n]),
        };
        let perm = match options.perm {
            Some(p) if p.len() != n => {
                return Err(SolverError::size_mismatch("permutation", n, p.len()))
            }
            Some(p) => Permutation::from_slice(p)?,
            None => Permutation::identity(n),
        };

        let _span = tracing::debug_span!("sparse_ilu_factor", n, nnz = a.nnz()).entered();

        self.clear();
        let result = if n < self.params.min_size {
            self.factor_exact(&a, &mask, &perm, options.cancel)
        } else {
            self.factor_incomplete(&a, &mask, &perm, options.cancel)
        };

        match result {
            Ok(()) => {
                self.stats.elapsed = start.elapsed();
                tracing::debug!(
                    lower_nnz = self.stats.lower_nnz,
                    upper_nnz = self.stats.upper_nnz,
                    attempts = self.stats.attempts,
                    diag_shift = self.applied_diag_shift,
                    drop_tol = self.applied_drop_tol,
                    elapsed_ms = self.stats.elapsed.as_secs_f64() * 1e3,
                    "incomplete LU factorization complete"
                );
                Ok(())
            }
            Err(err) => {
                self.clear();
                Err(err)
            }
        }
    }

    fn factor_exact(
        &mut self,
        a: &CsrMatrix<f64>,
        mask: &[bool],
        perm: &Permutation,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        tracing::debug!(
            n = a.nrows,
            min_size = self.params.min_size,
            "matrix below minimum size; using exact LU"
        );
        let mut lu = SparseLu::new();
        lu.factor_with(
            a,
            &FactorOptions {
                mask: Some(mask),
                row_perm: Some(perm.as_slice()),
                col_perm: Some(perm.as_slice()),
                cancel,
            },
        )?;
        self.stats = lu.last_stats().clone();
        self.applied_diag_shift = 0.0;
        self.applied_drop_tol = 0.0;
        self.size = a.nrows;
        self.exact = Some(Box::new(lu));
        self.state = FactorState::Factored;
        Ok(())
    }

    fn factor_incomplete(
        &mut self,
        a: &CsrMatrix<f64>,
        mask: &[bool],
        perm: &Permutation,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let setup = Setup::new(a, mask, perm, &self.params);
        let mut meter = WorkMeter::new(cancel);
        let mut shift = self.params.diag_shift;
        let mut drop_tol = self.params.drop_tol;
        let mut rejected = 0;

        for attempt in 1..=MAX_ATTEMPTS {
            let mut crout = Crout::new(&setup, shift, drop_tol);
            let outcome = crout.eliminate(&mut meter, &mut self.progress_event)?;
            drop_tol = crout.drop_tol;

            match outcome {
                None => {
                    crout.lower.shrink(1.1);
                    crout.upper.shrink(1.1);
                    self.stats = FactorStats {
                        size: setup.n,
                        input_nnz: a.nnz(),
                        lower_nnz: crout.lower.nnz(),
                        upper_nnz: crout.upper.nnz(),
                        zero_pivots: 0,
                        flops: meter.total(),
                        attempts: attempt,
                        diag_shift: shift,
                        drop_tol,
                        ..Default::default()
                    };
                    self.lower = crout.lower;
                    self.upper = crout.upper;
                    self.pivots = crout.pivots;
                    self.scales = setup.scales;
                    self.perm_inv = perm.inverse_slice().to_vec();
                    self.applied_diag_shift = shift;
                    self.applied_drop_tol = drop_tol;
                    self.size = setup.n;
                    self.state = FactorState::Factored;
                    return Ok(());
                }
                Some(row) => {
                    rejected = row;
                    if attempt == MAX_ATTEMPTS {
                        break;
                    }
                    shift = if shift < MIN_DSHIFT {
                        MIN_DSHIFT
                    } else {
                        shift * 10.0
                    };
                    tracing::info!(
                        row,
                        attempt,
                        shift,
                        "ILU pivot rejected; increasing diagonal shift"
                    );
                }
            }
        }

        tracing::warn!(
            row = rejected,
            diag_shift = shift,
            "incomplete LU factorization failed after {MAX_ATTEMPTS} attempts"
        );
        Err(SolverError::ZeroPivot {
            row: rejected,
            diag_shift: shift,
        })
    }

    fn ensure_factored(&self) -> Result<()> {
        if self.is_factored() {
            Ok(())
        } else {
            Err(SolverError::NotFactored)
        }
    }

    fn scatter(&self, rhs: &[f64]) -> Vec<f64> {
        let mut x = vec![0.0; self.size];
        for (i, &b) in rhs.iter().enumerate() {
            x[self.perm_inv[i]] = self.scales[i] * b;
        }
        x
    }

    fn gather(&self, x: &[f64], lhs: &mut [f64]) {
        for (i, out) in lhs.iter_mut().enumerate() {
            *out = self.scales[i] * x[self.perm_inv[i]];
        }
    }

    fn forward(&self, x: &mut [f64]) {
        for k in 0..self.size {
            let t = x[k];
            let (idx, val) = self.lower.column(k);
            for (&r, &v) in idx.iter().zip(val) {
                x[r] -= t * v;
            }
        }
    }

    /// Backward sweep with the rows of `upper` as the strict upper factor.
    fn backward(&self, upper: &ColumnStore<f64>, x: &mut [f64]) {
        for k in (0..self.size).rev() {
            let mut t = x[k] * self.pivots[k];
            let (idx, val) = upper.column(k);
            for (&c, &v) in idx.iter().zip(val) {
                t -= x[c] * v;
            }
            x[k] = t;
        }
    }

    /// Apply the preconditioner: `lhs ≈ A⁻¹ rhs`.
    pub fn solve(&self, lhs: &mut [f64], rhs: &[f64]) -> Result<()> {
        self.ensure_factored()?;
        check_solve_sizes(self.size, lhs.len(), rhs.len())?;
        if let Some(lu) = &self.exact {
            return lu.solve(lhs, rhs);
        }
        let mut x = self.scatter(rhs);
        self.forward(&mut x);
        self.backward(&self.upper, &mut x);
        self.gather(&x, lhs);
        Ok(())
    }

    /// Solve with `L·D·Lᵗ`, ignoring the upper factor. Only meaningful for
    /// symmetric matrices.
    pub fn symsolve(&self, lhs: &mut [f64], rhs: &[f64]) -> Result<()> {
        self.ensure_factored()?;
        check_solve_sizes(self.size, lhs.len(), rhs.len())?;
        if let Some(lu) = &self.exact {
            return lu.solve(lhs, rhs);
        }
        let mut x = self.scatter(rhs);
        self.forward(&mut x);
        self.backward(&self.lower, &mut x);
        self.gather(&x, lhs);
        Ok(())
    }
}

impl Factorization<f64> for SparseIlu {
    fn size(&self) -> usize {
        self.size
    }

    fn non_zero_count(&self) -> usize {
        SparseIlu::non_zero_count(self)
    }

    fn mem_usage(&self) -> usize {
        SparseIlu::mem_usage(self)
    }

    fn is_factored(&self) -> bool {
        SparseIlu::is_factored(self)
    }

    fn solve(&self, lhs: &mut [f64], rhs: &[f64]) -> Result<()> {
        SparseIlu::solve(self, lhs, rhs)
    }
}

/// Everything an elimination attempt needs that does not depend on the
/// diagonal shift.
struct Setup<'a> {
    n: usize,
    a: &'a CsrMatrix<f64>,
    /// Row k holds the strict lower part of permuted column k: entries
    /// `(i, A[perm[i]][perm[k]])` with `i > k`.
    lower_input: CsrMatrix<f64>,
    mask: &'a [bool],
    perm: &'a [usize],
    perm_inv: &'a [usize],
    scales: Vec<f64>,
    /// Scaled diagonal by step.
    diag: Vec<f64>,
    zero_threshold: f64,
    max_nnz: usize,
    /// Fill allowance per step.
    nfill: usize,
}

impl<'a> Setup<'a> {
    fn new(
        a: &'a CsrMatrix<f64>,
        mask: &'a [bool],
        perm: &'a Permutation,
        params: &IluParams,
    ) -> Self {
        let n = a.nrows;
        let nnz = a.nnz();
        let scales = diagonal_scales(a, mask);

        let perm_inv = perm.inverse_slice();
        let mut diag = vec![0.0; n];
        for (i, &d) in a.diagonal().iter().enumerate() {
            diag[perm_inv[i]] = d * scales[i] * scales[i];
        }

        // Float-to-int casts saturate, so a huge fill factor cannot wrap.
        let max_nnz = (((params.max_fill + 1.0) * nnz as f64) as usize).max(nnz);
        let nfill = if n == 0 {
            0
        } else {
            (max_nnz - nnz) / n + (params.quality * nnz as f64 / n as f64) as usize
        };

        Self {
            n,
            a,
            lower_input: lower_columns(a, perm),
            mask,
            perm: perm.as_slice(),
            perm_inv,
            scales,
            diag,
            zero_threshold: params.zero_threshold,
            max_nnz,
            nfill,
        }
    }
}

/// `1/sqrt(d)` per row, where d is the diagonal magnitude when it is not
/// negligible next to the largest unmasked entry of the row, and that
/// largest entry otherwise.
fn diagonal_scales(a: &CsrMatrix<f64>, mask: &[bool]) -> Vec<f64> {
    (0..a.nrows)
        .map(|row| {
            if !mask[row] {
                return 1.0;
            }
            let (cols, vals) = a.row(row);
            let mut s: f64 = 0.0;
            let mut d = -1.0;
            for (&c, &v) in cols.iter().zip(vals) {
                if !mask[c] {
                    continue;
                }
                s = s.max(v.abs());
                if c == row {
                    d = v.abs();
                }
            }
            if d > 1.0e-3 * s {
                s = d;
            }
            if is_tiny(s) {
                1.0
            } else {
                1.0 / s.sqrt()
            }
        })
        .collect()
}

fn lower_columns(a: &CsrMatrix<f64>, perm: &Permutation) -> CsrMatrix<f64> {
    let n = a.nrows;
    let perm_inv = perm.inverse_slice();
    let mut offsets = vec![0usize; n + 1];
    for (i, &row) in perm.as_slice().iter().enumerate() {
        for &c in a.row(row).0 {
            let k = perm_inv[c];
            if k < i {
                offsets[k + 1] += 1;
            }
        }
    }
    for k in 1..=n {
        offsets[k] += offsets[k - 1];
    }

    let nnz = offsets[n];
    let mut next = offsets.clone();
    let mut indices = vec![0usize; nnz];
    let mut values = vec![0.0; nnz];
    for (i, &row) in perm.as_slice().iter().enumerate() {
        let (cols, vals) = a.row(row);
        for (&c, &v) in cols.iter().zip(vals) {
            let k = perm_inv[c];
            if k < i {
                indices[next[k]] = i;
                values[next[k]] = v;
                next[k] += 1;
            }
        }
    }

    CsrMatrix {
        nrows: n,
        ncols: n,
        values,
        col_indices: indices,
        row_pointers: offsets,
    }
}

/// Link from a stored entry to the next stored entry with the same index.
#[derive(Debug, Clone, Copy)]
struct Node {
    /// Column of L (or row of U) holding the entry.
    line: usize,
    next: usize,
}

/// One elimination attempt with a fixed diagonal shift.
///
/// Besides the two factors, the attempt keeps for every index a linked
/// list through the stored entries with that index (the rows of L and the
/// columns of U), and for every stored line a cursor just past its last
/// entry with index at or before the current step.
struct Crout<'s, 'a> {
    setup: &'s Setup<'a>,
    drop_tol: f64,
    /// Pivots by step, not yet inverted.
    pivots: Vec<f64>,
    lower: ColumnStore<f64>,
    upper: ColumnStore<f64>,
    lo_nodes: Vec<Node>,
    up_nodes: Vec<Node>,
    /// Head of the list through L entries in each row.
    row_heads: Vec<usize>,
    /// Head of the list through U entries in each column.
    col_heads: Vec<usize>,
    lo_cursor: Vec<usize>,
    up_cursor: Vec<usize>,
    lo_accu: Vec<f64>,
    up_accu: Vec<f64>,
    lo_tag: Vec<usize>,
    up_tag: Vec<usize>,
    irows: Vec<usize>,
    jcols: Vec<usize>,
}

impl<'s, 'a> Crout<'s, 'a> {
    fn new(setup: &'s Setup<'a>, shift: f64, drop_tol: f64) -> Self {
        let n = setup.n;
        let pivots = setup
            .diag
            .iter()
            .map(|&d| if d >= 0.0 { d + shift } else { d - shift })
            .collect();
        let reserve = setup.max_nnz / 2;
        let mut lower = ColumnStore::new();
        let mut upper = ColumnStore::new();
        lower.reserve(n, reserve);
        upper.reserve(n, reserve);

        Self {
            setup,
            drop_tol,
            pivots,
            lower,
            upper,
            lo_nodes: Vec::with_capacity(reserve),
            up_nodes: Vec::with_capacity(reserve),
            row_heads: vec![NONE; n],
            col_heads: vec![NONE; n],
            lo_cursor: vec![0; n],
            up_cursor: vec![0; n],
            lo_accu: vec![0.0; n],
            up_accu: vec![0.0; n],
            lo_tag: vec![NONE; n],
            up_tag: vec![NONE; n],
            irows: Vec::new(),
            jcols: Vec::new(),
        }
    }

    /// Run the elimination. Returns the original row of a rejected pivot,
    /// or `None` when every step succeeded.
    fn eliminate(
        &mut self,
        meter: &mut WorkMeter<'_>,
        progress: &mut Event<usize>,
    ) -> Result<Option<usize>> {
        let setup = self.setup;
        let n = setup.n;

        for ipiv in 0..n {
            self.advance_cursors(ipiv);
            self.lo_cursor[ipiv] = self.lower.nnz();
            self.up_cursor[ipiv] = self.upper.nnz();

            let jpiv = setup.perm[ipiv];
            if !setup.mask[jpiv] {
                self.lower.close_column();
                self.upper.close_column();
                continue;
            }

            let diagv = self.gather(ipiv, jpiv);
            let col_len = self.irows.len();
            let row_len = self.jcols.len();

            let pivot = self.pivots[ipiv];
            if pivot.abs() > MAX_PIVOT || pivot.abs() <= setup.zero_threshold * diagv.abs() {
                return Ok(Some(jpiv));
            }

            meter.add(self.update(ipiv));

            let inv = 1.0 / pivot;
            for &r in &self.irows {
                self.lo_accu[r] *= inv;
            }
            for &c in &self.jcols {
                self.up_accu[c] *= inv;
            }

            self.drop_small(ipiv);

            let keep = setup.nfill / 2;
            keep_largest(&mut self.irows, &self.lo_accu, col_len + keep);
            keep_largest(&mut self.jcols, &self.up_accu, row_len + keep);

            let mut round = 1;
            while self.over_budget() {
                if self.drop_tol < MIN_DROPTOL {
                    self.drop_tol = MIN_DROPTOL;
                } else {
                    let growth = round as f64 * (n - ipiv) as f64 / (0.5 * n as f64);
                    self.drop_tol += self.drop_tol * growth.max(0.1);
                }
                meter.add(self.lower.nnz() + self.upper.nnz());
                self.prune(ipiv);
                round += 1;
            }

            self.store(ipiv);

            for &r in &self.irows {
                if self.up_tag[r] == ipiv {
                    self.pivots[r] -= pivot * self.lo_accu[r] * self.up_accu[r];
                }
            }

            match meter.checkpoint() {
                Checkpoint::Idle => {}
                Checkpoint::Report => progress.emit(ipiv),
                Checkpoint::Cancel => {
                    return Err(SolverError::Cancelled {
                        columns_done: ipiv + 1,
                    })
                }
            }
        }

        for (k, p) in self.pivots.iter_mut().enumerate() {
            *p = if setup.mask[setup.perm[k]] { 1.0 / *p } else { 0.0 };
        }
        Ok(None)
    }

    /// Move the cursor of every line with an entry at index `ipiv` past
    /// that entry.
    fn advance_cursors(&mut self, ipiv: usize) {
        let mut node = self.row_heads[ipiv];
        while node != NONE {
            let Node { line, next } = self.lo_nodes[node];
            self.lo_cursor[line] = node + 1;
            node = next;
        }
        let mut node = self.col_heads[ipiv];
        while node != NONE {
            let Node { line, next } = self.up_nodes[node];
            self.up_cursor[line] = node + 1;
            node = next;
        }
    }

    /// Load the scaled column of L and row of U for step `ipiv` from the
    /// input. Returns the scaled diagonal entry.
    fn gather(&mut self, ipiv: usize, jpiv: usize) -> f64 {
        let setup = self.setup;
        let sp = setup.scales[jpiv];
        self.irows.clear();
        self.jcols.clear();

        let (rows, vals) = setup.lower_input.row(ipiv);
        for (&irow, &v) in rows.iter().zip(vals) {
            let jrow = setup.perm[irow];
            if !setup.mask[jrow] {
                continue;
            }
            self.lo_tag[irow] = ipiv;
            self.lo_accu[irow] = v * sp * setup.scales[jrow];
            self.irows.push(irow);
        }

        let mut diagv = 0.0;
        let (cols, vals) = setup.a.row(jpiv);
        for (&icol, &v) in cols.iter().zip(vals) {
            if !setup.mask[icol] {
                continue;
            }
            let jcol = setup.perm_inv[icol];
            if jcol < ipiv {
                continue;
            }
            let value = v * sp * setup.scales[icol];
            if jcol == ipiv {
                diagv = value;
            } else {
                self.up_tag[jcol] = ipiv;
                self.up_accu[jcol] = value;
                self.jcols.push(jcol);
            }
        }
        diagv
    }

    /// Subtract the contributions of all earlier steps. Returns the flop
    /// count.
    fn update(&mut self, ipiv: usize) -> usize {
        let mut flops = 0;

        let mut node = self.col_heads[ipiv];
        while node != NONE {
            let Node { line: k, next } = self.up_nodes[node];
            let mult = self.upper.values()[node] * self.pivots[k];
            let end = self.lower.column_end(k);
            flops += end - self.lo_cursor[k];
            for p in self.lo_cursor[k]..end {
                let r = self.lower.indices()[p];
                let v = self.lower.values()[p] * mult;
                if self.lo_tag[r] != ipiv {
                    self.lo_tag[r] = ipiv;
                    self.lo_accu[r] = -v;
                    self.irows.push(r);
                } else {
                    self.lo_accu[r] -= v;
                }
            }
            node = next;
        }

        let mut node = self.row_heads[ipiv];
        while node != NONE {
            let Node { line: k, next } = self.lo_nodes[node];
            let mult = self.lower.values()[node] * self.pivots[k];
            let end = self.upper.column_end(k);
            flops += end - self.up_cursor[k];
            for p in self.up_cursor[k]..end {
                let c = self.upper.indices()[p];
                let v = self.upper.values()[p] * mult;
                if self.up_tag[c] != ipiv {
                    self.up_tag[c] = ipiv;
                    self.up_accu[c] = -v;
                    self.jcols.push(c);
                } else {
                    self.up_accu[c] -= v;
                }
            }
            node = next;
        }

        flops
    }

    fn drop_small(&mut self, ipiv: usize) {
        let half = 0.5 * self.drop_tol;
        let tiny = half * half;
        let lo_accu = &self.lo_accu;
        self.irows.retain(|&r| lo_accu[r] * lo_accu[r] > tiny);
        let up_accu = &self.up_accu;
        self.jcols.retain(|&c| up_accu[c] * up_accu[c] > tiny);

        // Stored entries in row/column ipiv that are small relative to the
        // pivots they connect.
        let tiny = self.drop_tol * self.drop_tol;
        let bar = (self.pivots[ipiv] * tiny).abs();
        let mut node = self.row_heads[ipiv];
        while node != NONE {
            let Node { line, next } = self.lo_nodes[node];
            let v = self.lower.values()[node];
            if (self.pivots[line] * v * v).abs() <= bar {
                self.lower.values_mut()[node] = 0.0;
            }
            node = next;
        }
        let mut node = self.col_heads[ipiv];
        while node != NONE {
            let Node { line, next } = self.up_nodes[node];
            let v = self.upper.values()[node];
            if (self.pivots[line] * v * v).abs() <= bar {
                self.upper.values_mut()[node] = 0.0;
            }
            node = next;
        }
    }

    fn over_budget(&self) -> bool {
        let stored = self.lower.nnz() + self.upper.nnz();
        stored > 0
            && self.drop_tol.is_finite()
            && stored + self.irows.len() + self.jcols.len() > self.setup.max_nnz
    }

    /// Drop stored entries below the current tolerance and rebuild the
    /// lists and cursors.
    fn prune(&mut self, ipiv: usize) {
        let tiny = self.drop_tol * self.drop_tol;
        let pivots = &self.pivots;
        let keep = |line: usize, index: usize, v: f64| {
            v * v > tiny
                && (index >= ipiv || (pivots[line] * v * v).abs() > (pivots[index] * tiny).abs())
        };
        self.lower.retain(keep);
        self.upper.retain(keep);

        relink(
            &self.lower,
            &mut self.lo_nodes,
            &mut self.row_heads,
            &mut self.lo_cursor,
            ipiv,
        );
        relink(
            &self.upper,
            &mut self.up_nodes,
            &mut self.col_heads,
            &mut self.up_cursor,
            ipiv,
        );
    }

    fn store(&mut self, ipiv: usize) {
        for &r in &self.irows {
            let pos = self.lower.nnz();
            self.lower.push(r, self.lo_accu[r]);
            self.lo_nodes.push(Node {
                line: ipiv,
                next: self.row_heads[r],
            });
            self.row_heads[r] = pos;
        }
        self.lower.close_column();

        for &c in &self.jcols {
            let pos = self.upper.nnz();
            self.upper.push(c, self.up_accu[c]);
            self.up_nodes.push(Node {
                line: ipiv,
                next: self.col_heads[c],
            });
            self.col_heads[c] = pos;
        }
        self.upper.close_column();
    }
}

/// Keep the `limit` largest entries by magnitude, then restore index order.
fn keep_largest(list: &mut Vec<usize>, accu: &[f64], limit: usize) {
    if limit < list.len() {
        list.sort_unstable_by(|&a, &b| accu[b].abs().total_cmp(&accu[a].abs()));
        list.truncate(limit);
    }
    list.sort_unstable();
}

fn relink(
    store: &ColumnStore<f64>,
    nodes: &mut Vec<Node>,
    heads: &mut [usize],
    cursor: &mut [usize],
    ipiv: usize,
) {
    heads.fill(NONE);
    nodes.clear();
    for line in 0..store.column_count() {
        let start = store.column_start(line);
        cursor[line] = start;
        for (k, &index) in store.column(line).0.iter().enumerate() {
            let pos = start + k;
            nodes.push(Node {
                line,
                next: heads[index],
            });
            heads[index] = pos;
            if index <= ipiv {
                cursor[line] = pos + 1;
            }
        }
    }
}
