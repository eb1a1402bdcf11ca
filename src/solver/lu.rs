//! Left-looking sparse LU factorization with threshold partial pivoting.
//!
//! Computes `P·A·Q = L·U` column by column. For every column the engine
//! finds the structure of the new column by a depth-first search through
//! the already computed columns of L, applies their updates, picks a pivot,
//! prunes the L structure the search has to walk next time, and appends the
//! result to the column stores.
//!
//! Pivots are ranked on row-scaled magnitudes. The largest scaled candidate
//! wins unless a candidate closer to the diagonal reaches
//! `pivot_threshold` times its magnitude. A pivot whose scaled magnitude is
//! not above `zero_threshold` is a zero pivot; it is replaced by a small
//! non-zero value so that elimination can continue, and counted against
//! `max_zero_pivots`.
//!
//! Masked rows are folded in as identity rows and columns, so `x[i] = b[i]`
//! for every masked `i` after a solve.

use std::borrow::Cow;
use std::time::Instant;

use num_complex::Complex64;
use rayon::prelude::*;

use crate::cancel::{CancelToken, Checkpoint, WorkMeter};
use crate::error::{Result, SolverError};
use crate::event::Event;
use crate::ordering::Permutation;
use crate::scalar::{is_tiny, Scalar};
use crate::sparse::{CsrMatrix, SparseSource};
use crate::stats::FactorStats;

use super::{check_solve_sizes, ColumnStore, FactorState, Factorization};

/// Marks a work row that has not been chosen as a pivot yet.
const UNPIVOTED: usize = usize::MAX;

/// Tuning parameters for [`SparseLu`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LuParams {
    /// Relative magnitude, in [0, 1], a candidate closer to the diagonal
    /// needs to beat the largest candidate. 0 keeps the diagonal whenever
    /// it is stored; 1 is strict partial pivoting.
    pub pivot_threshold: f64,
    /// Scaled pivot magnitudes at or below this are zero pivots.
    pub zero_threshold: f64,
    /// Zero pivots tolerated before the factorization fails.
    pub max_zero_pivots: usize,
}

impl Default for LuParams {
    fn default() -> Self {
        Self {
            pivot_threshold: 0.1,
            zero_threshold: 1.0e-6,
            max_zero_pivots: 0,
        }
    }
}

impl LuParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.pivot_threshold) {
            return Err(SolverError::invalid_parameter(
                "pivot threshold",
                format!("{} is outside [0, 1]", self.pivot_threshold),
            ));
        }
        if !(self.zero_threshold.is_finite() && self.zero_threshold > 0.0) {
            return Err(SolverError::invalid_parameter(
                "zero threshold",
                format!("{} is not a positive number", self.zero_threshold),
            ));
        }
        Ok(())
    }
}

/// Optional inputs to [`SparseLu::factor_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FactorOptions<'a> {
    /// `false` marks a row (and the matching column) as eliminated.
    pub mask: Option<&'a [bool]>,
    /// `row_perm[i]` is the original row placed at position i.
    pub row_perm: Option<&'a [usize]>,
    /// `col_perm[j]` is the original column eliminated at step j.
    pub col_perm: Option<&'a [usize]>,
    pub cancel: Option<&'a CancelToken>,
}

/// Sparse LU engine, generic over real and complex entries.
pub struct SparseLu<T: Scalar> {
    params: LuParams,
    state: FactorState,
    size: usize,
    lower: ColumnStore<T>,
    upper: ColumnStore<T>,
    /// Original row -> elimination step.
    row_map: Vec<usize>,
    /// Elimination step -> original column.
    col_perm: Vec<usize>,
    stats: FactorStats,
    /// Fired with the number of the last finished column, at most once
    /// per [`CHECK_INTERVAL`](crate::cancel::CHECK_INTERVAL) flops.
    pub progress_event: Event<usize>,
    /// Fired once per column with (original pivot row, pivot magnitude).
    pub pivot_event: Event<(usize, f64)>,
    /// Fired for each zero pivot with (original pivot row, scaled magnitude).
    pub zero_pivot_event: Event<(usize, f64)>,
}

pub type DSparseLu = SparseLu<f64>;
pub type ZSparseLu = SparseLu<Complex64>;

impl<T: Scalar> Default for SparseLu<T> {
    fn default() -> Self {
        Self {
            params: LuParams::default(),
            state: FactorState::Empty,
            size: 0,
            lower: ColumnStore::new(),
            upper: ColumnStore::new(),
            row_map: Vec::new(),
            col_perm: Vec::new(),
            stats: FactorStats::default(),
            progress_event: Event::new(),
            pivot_event: Event::new(),
            zero_pivot_event: Event::new(),
        }
    }
}

impl<T: Scalar> std::fmt::Debug for SparseLu<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseLu")
            .field("params", &self.params)
            .field("state", &self.state)
            .field("size", &self.size)
            .field("nnz", &self.non_zero_count())
            .finish()
    }
}

impl<T: Scalar> SparseLu<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: LuParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            ..Self::default()
        })
    }

    pub fn params(&self) -> &LuParams {
        &self.params
    }

    pub fn pivot_threshold(&self) -> f64 {
        self.params.pivot_threshold
    }

    pub fn set_pivot_threshold(&mut self, alpha: f64) -> Result<()> {
        LuParams {
            pivot_threshold: alpha,
            ..self.params
        }
        .validate()?;
        self.params.pivot_threshold = alpha;
        Ok(())
    }

    pub fn zero_threshold(&self) -> f64 {
        self.params.zero_threshold
    }

    pub fn set_zero_threshold(&mut self, eps: f64) -> Result<()> {
        LuParams {
            zero_threshold: eps,
            ..self.params
        }
        .validate()?;
        self.params.zero_threshold = eps;
        Ok(())
    }

    pub fn max_zero_pivots(&self) -> usize {
        self.params.max_zero_pivots
    }

    pub fn set_max_zero_pivots(&mut self, max: usize) {
        self.params.max_zero_pivots = max;
    }

    pub fn state(&self) -> FactorState {
        self.state
    }

    pub fn is_factored(&self) -> bool {
        self.state == FactorState::Factored
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn non_zero_count(&self) -> usize {
        self.lower.nnz() + self.upper.nnz()
    }

    pub fn mem_usage(&self) -> usize {
        self.lower.mem_usage()
            + self.upper.mem_usage()
            + (self.row_map.len() + self.col_perm.len()) * std::mem::size_of::<usize>()
    }

    /// Statistics of the last successful factorization.
    pub fn last_stats(&self) -> &FactorStats {
        &self.stats
    }

    /// Unit lower factor, by column, indexed by elimination step. The unit
    /// diagonal is implicit.
    pub fn lower(&self) -> &ColumnStore<T> {
        &self.lower
    }

    /// Upper factor, by column. The last entry of each column is the
    /// inverted pivot.
    pub fn upper(&self) -> &ColumnStore<T> {
        &self.upper
    }

    /// Original row -> elimination step.
    pub fn row_map(&self) -> &[usize] {
        &self.row_map
    }

    /// Elimination step -> original column.
    pub fn col_perm(&self) -> &[usize] {
        &self.col_perm
    }

    pub fn clear(&mut self) {
        self.lower.clear();
        self.upper.clear();
        self.row_map = Vec::new();
        self.col_perm = Vec::new();
        self.size = 0;
        self.state = FactorState::Empty;
    }

    /// Factor `matrix`. Returns the number of zero pivots.
    pub fn factor<M>(&mut self, matrix: &M) -> Result<usize>
    where
        M: SparseSource<T> + ?Sized,
    {
        self.factor_with(matrix, &FactorOptions::default())
    }

    pub fn factor_masked<M>(&mut self, matrix: &M, mask: &[bool]) -> Result<usize>
    where
        M: SparseSource<T> + ?Sized,
    {
        self.factor_with(
            matrix,
            &FactorOptions {
                mask: Some(mask),
                ..Default::default()
            },
        )
    }

    pub fn factor_permuted<M>(
        &mut self,
        matrix: &M,
        mask: &[bool],
        row_perm: &[usize],
        col_perm: &[usize],
    ) -> Result<usize>
    where
        M: SparseSource<T> + ?Sized,
    {
        self.factor_with(
            matrix,
            &FactorOptions {
                mask: Some(mask),
                row_perm: Some(row_perm),
                col_perm: Some(col_perm),
                cancel: None,
            },
        )
    }

    /// Factor with any combination of mask, permutations and cancellation.
    ///
    /// Structural problems are reported before the current factors are
    /// touched. Any later failure leaves the engine empty.
    pub fn factor_with<M>(&mut self, matrix: &M, options: &FactorOptions<'_>) -> Result<usize>
    where
        M: SparseSource<T> + ?Sized,
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
        let row_perm = resolve_perm(options.row_perm, n, "row permutation")?;
        let col_perm = resolve_perm(options.col_perm, n, "column permutation")?;

        let _span = tracing::debug_span!("sparse_lu_factor", n, nnz = a.nnz()).entered();

        self.clear();
        match self.eliminate(&a, &mask, &row_perm, col_perm, options.cancel) {
            Ok(zero_pivots) => {
                self.stats.elapsed = start.elapsed();
                tracing::debug!(
                    zero_pivots,
                    lower_nnz = self.lower.nnz(),
                    upper_nnz = self.upper.nnz(),
                    elapsed_ms = self.stats.elapsed.as_secs_f64() * 1e3,
                    "sparse LU factorization complete"
                );
                Ok(zero_pivots)
            }
            Err(err) => {
                self.clear();
                tracing::debug!(%err, "sparse LU factorization failed");
                Err(err)
            }
        }
    }

    fn eliminate(
        &mut self,
        a: &CsrMatrix<T>,
        mask: &[bool],
        row_perm: &Permutation,
        col_perm: Permutation,
        cancel: Option<&CancelToken>,
    ) -> Result<usize> {
        let n = a.nrows;
        let max_zero = self.params.max_zero_pivots;
        let mut work = Work::new(n, &self.params, row_perm);

        work.init_scales(a, mask);
        if work.zero_count > max_zero {
            return Err(SolverError::Singular {
                zero_pivots: work.zero_count,
                max_zero_pivots: max_zero,
            });
        }
        work.zero_count = 0;

        let trans = masked_transpose(a, mask);
        self.lower.reserve(n, 2 * a.nnz());
        self.upper.reserve(n, 2 * a.nnz());

        let mut step_of = vec![UNPIVOTED; n];
        let mut meter = WorkMeter::new(cancel);

        for jcol in 0..n {
            let (rows, vals) = trans.row(col_perm.as_slice()[jcol]);

            work.column_structure(&self.lower, &step_of, rows);
            work.load_column(rows, vals);
            meter.add(work.factor_column(&self.lower, &step_of));
            work.pivot_column(
                &mut step_of,
                jcol,
                &mut self.pivot_event,
                &mut self.zero_pivot_event,
            );
            if !work.scratch[0].is_finite() {
                return Err(SolverError::NonFinite("pivot"));
            }
            work.prune_column(&mut self.lower, &step_of, jcol);
            work.store_column(&mut self.upper, &mut self.lower, &step_of, jcol);

            if work.zero_count > max_zero {
                return Err(SolverError::Singular {
                    zero_pivots: work.zero_count,
                    max_zero_pivots: max_zero,
                });
            }

            match meter.checkpoint() {
                Checkpoint::Idle => {}
                Checkpoint::Report => self.progress_event.emit(jcol),
                Checkpoint::Cancel => {
                    return Err(SolverError::Cancelled {
                        columns_done: jcol + 1,
                    })
                }
            }
        }

        // L was built with work-row indices; switch to elimination steps.
        if step_of.contains(&UNPIVOTED) {
            return Err(SolverError::InvalidStructure(
                "invalid row pivot sequence".into(),
            ));
        }
        self.lower.remap_indices(|irow| step_of[irow]);
        self.lower.sort_columns();
        self.upper.sort_columns();

        let mut row_map = vec![0; n];
        for (irow, &step) in step_of.iter().enumerate() {
            row_map[row_perm.as_slice()[irow]] = step;
        }

        self.row_map = row_map;
        self.col_perm = col_perm.into_vec();
        self.size = n;
        self.state = FactorState::Factored;
        self.stats = FactorStats {
            size: n,
            input_nnz: a.nnz(),
            lower_nnz: self.lower.nnz(),
            upper_nnz: self.upper.nnz(),
            zero_pivots: work.zero_count,
            flops: meter.total(),
            attempts: 1,
            ..Default::default()
        };
        Ok(work.zero_count)
    }

    fn ensure_factored(&self) -> Result<()> {
        if self.state == FactorState::Factored {
            Ok(())
        } else {
            Err(SolverError::NotFactored)
        }
    }

    /// Forward substitution with L, then backward substitution with U, on
    /// a vector already in elimination order.
    fn substitute(&self, x: &mut [T]) {
        for j in 0..self.size {
            let t = -x[j];
            let (idx, val) = self.lower.column(j);
            for (&r, &v) in idx.iter().zip(val) {
                x[r] += t * v;
            }
        }
        for j in (0..self.size).rev() {
            let (idx, val) = self.upper.column(j);
            let last = idx.len() - 1;
            let t = -x[j] * val[last];
            for (&r, &v) in idx[..last].iter().zip(&val[..last]) {
                x[r] += t * v;
            }
            x[j] = -t;
        }
    }

    /// Solve `A x = rhs`. `lhs` and `rhs` must have length `size()`.
    pub fn solve(&self, lhs: &mut [T], rhs: &[T]) -> Result<()> {
        self.ensure_factored()?;
        check_solve_sizes(self.size, lhs.len(), rhs.len())?;
        let mut x = vec![T::zero(); self.size];
        for (&step, &b) in self.row_map.iter().zip(rhs) {
            x[step] = b;
        }
        self.substitute(&mut x);
        for (&col, &xk) in self.col_perm.iter().zip(&x) {
            lhs[col] = xk;
        }
        Ok(())
    }

    /// Solve against several right-hand sides in parallel.
    pub fn solve_many(&self, rhs: &[Vec<T>]) -> Result<Vec<Vec<T>>> {
        self.ensure_factored()?;
        rhs.par_iter()
            .map(|b| {
                let mut x = vec![T::zero(); self.size];
                self.solve(&mut x, b)?;
                Ok(x)
            })
            .collect()
    }
}

impl SparseLu<f64> {
    /// Solve a complex right-hand side with a real factorization, one
    /// component at a time.
    pub fn solve_complex(&self, lhs: &mut [Complex64], rhs: &[Complex64]) -> Result<()> {
        self.ensure_factored()?;
        check_solve_sizes(self.size, lhs.len(), rhs.len())?;
        let re: Vec<f64> = rhs.iter().map(|z| z.re).collect();
        let im: Vec<f64> = rhs.iter().map(|z| z.im).collect();
        let mut x_re = vec![0.0; self.size];
        let mut x_im = vec![0.0; self.size];
        self.solve(&mut x_re, &re)?;
        self.solve(&mut x_im, &im)?;
        for (z, (r, i)) in lhs.iter_mut().zip(x_re.into_iter().zip(x_im)) {
            *z = Complex64::new(r, i);
        }
        Ok(())
    }
}

impl SparseLu<Complex64> {
    /// Solve a real right-hand side with a complex factorization and keep
    /// the real part of the solution.
    pub fn solve_real(&self, lhs: &mut [f64], rhs: &[f64]) -> Result<()> {
        self.ensure_factored()?;
        check_solve_sizes(self.size, lhs.len(), rhs.len())?;
        let b: Vec<Complex64> = rhs.iter().map(|&r| Complex64::new(r, 0.0)).collect();
        let mut x = vec![Complex64::new(0.0, 0.0); self.size];
        self.solve(&mut x, &b)?;
        for (out, z) in lhs.iter_mut().zip(x) {
            *out = z.re;
        }
        Ok(())
    }
}

impl<T: Scalar> Factorization<T> for SparseLu<T> {
    fn size(&self) -> usize {
        self.size
    }

    fn non_zero_count(&self) -> usize {
        SparseLu::non_zero_count(self)
    }

    fn mem_usage(&self) -> usize {
        SparseLu::mem_usage(self)
    }

    fn is_factored(&self) -> bool {
        SparseLu::is_factored(self)
    }

    fn solve(&self, lhs: &mut [T], rhs: &[T]) -> Result<()> {
        SparseLu::solve(self, lhs, rhs)
    }
}

fn resolve_perm(perm: Option<&[usize]>, n: usize, what: &'static str) -> Result<Permutation> {
    match perm {
        Some(p) if p.len() != n => Err(SolverError::size_mismatch(what, n, p.len())),
        Some(p) => Permutation::from_slice(p),
        None => Ok(Permutation::identity(n)),
    }
}

/// Columns of `a` as rows, with masked rows and columns replaced by the
/// identity.
fn masked_transpose<T: Scalar>(a: &CsrMatrix<T>, mask: &[bool]) -> CsrMatrix<T> {
    let n = a.nrows;
    let mut offsets = vec![0usize; n + 1];
    for row in 0..n {
        if !mask[row] {
            offsets[row + 1] += 1;
            continue;
        }
        for &col in a.row(row).0 {
            if mask[col] {
                offsets[col + 1] += 1;
            }
        }
    }
    for i in 1..=n {
        offsets[i] += offsets[i - 1];
    }

    let nnz = offsets[n];
    let mut next = offsets.clone();
    let mut indices = vec![0usize; nnz];
    let mut values = vec![T::zero(); nnz];
    for row in 0..n {
        if !mask[row] {
            indices[next[row]] = row;
            values[next[row]] = T::one();
            next[row] += 1;
            continue;
        }
        let (cols, vals) = a.row(row);
        for (&col, &v) in cols.iter().zip(vals) {
            if mask[col] {
                indices[next[col]] = row;
                values[next[col]] = v;
                next[col] += 1;
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

/// Per-factorization scratch state.
///
/// Rows are addressed by work row: position in the user row permutation.
/// `row_indices[..last_lower]` holds the unpivoted rows of the current
/// column (pivot candidates) and `row_indices[first_upper..]` the pivoted
/// rows in topological order.
struct Work<'a, T> {
    n: usize,
    zero_threshold: f64,
    pivot_threshold: f64,
    /// Original row for each work row.
    orig_row: &'a [usize],
    /// Work row for each original row.
    work_row: &'a [usize],
    marked: Vec<bool>,
    scales: Vec<f64>,
    accu: Vec<T>,
    scratch: Vec<T>,
    /// End of the part of each L column the structure search walks.
    end_points: Vec<usize>,
    row_indices: Vec<usize>,
    stack: Vec<(usize, usize)>,
    last_lower: usize,
    first_upper: usize,
    zero_count: usize,
}

impl<'a, T: Scalar> Work<'a, T> {
    fn new(n: usize, params: &LuParams, row_perm: &'a Permutation) -> Self {
        Self {
            n,
            zero_threshold: params.zero_threshold,
            pivot_threshold: params.pivot_threshold,
            orig_row: row_perm.as_slice(),
            work_row: row_perm.inverse_slice(),
            marked: vec![false; n],
            scales: vec![1.0; n],
            accu: vec![T::zero(); n],
            scratch: vec![T::zero(); n],
            end_points: vec![0; n],
            row_indices: vec![0; n],
            stack: Vec::new(),
            last_lower: 0,
            first_upper: n,
            zero_count: 0,
        }
    }

    /// Inverse of the largest unmasked magnitude of every row. Rows without
    /// one count as zero pivots.
    fn init_scales(&mut self, a: &CsrMatrix<T>, mask: &[bool]) {
        for irow in 0..self.n {
            let jrow = self.orig_row[irow];
            if !mask[jrow] {
                self.scales[irow] = 1.0;
                continue;
            }
            let (cols, vals) = a.row(jrow);
            let scale = cols
                .iter()
                .zip(vals)
                .filter(|(&c, _)| mask[c])
                .map(|(_, v)| v.abs_val())
                .fold(0.0, f64::max);
            if is_tiny(scale) {
                self.scales[irow] = 1.0;
                self.zero_count += 1;
            } else {
                self.scales[irow] = 1.0 / scale;
            }
        }
    }

    /// Reach of the new column through the graph of L.
    fn column_structure(&mut self, lower: &ColumnStore<T>, step_of: &[usize], rows: &[usize]) {
        let mut ifirst = self.n;
        let mut ilast = 0;

        for &r in rows {
            let irow = self.work_row[r];
            if self.marked[irow] {
                continue;
            }
            self.marked[irow] = true;
            if step_of[irow] == UNPIVOTED {
                self.row_indices[ilast] = irow;
                ilast += 1;
                continue;
            }

            let mut node = irow;
            let mut pos = lower.column_start(step_of[node]);
            loop {
                let end = self.end_points[step_of[node]];
                let mut descend = None;
                while pos < end {
                    let jrow = lower.indices()[pos];
                    pos += 1;
                    if self.marked[jrow] {
                        continue;
                    }
                    self.marked[jrow] = true;
                    if step_of[jrow] == UNPIVOTED {
                        self.row_indices[ilast] = jrow;
                        ilast += 1;
                    } else {
                        descend = Some(jrow);
                        break;
                    }
                }
                if let Some(jrow) = descend {
                    self.stack.push((node, pos));
                    node = jrow;
                    pos = lower.column_start(step_of[jrow]);
                    continue;
                }

                ifirst -= 1;
                self.row_indices[ifirst] = node;
                match self.stack.pop() {
                    Some((parent, resume)) => {
                        node = parent;
                        pos = resume;
                    }
                    None => break,
                }
            }
        }

        for &r in &self.row_indices[..ilast] {
            self.marked[r] = false;
        }
        for &r in &self.row_indices[ifirst..] {
            self.marked[r] = false;
        }

        if ilast == 0 {
            // Structurally empty below the diagonal: take any free row so
            // the column still gets a (zero) pivot.
            if let Some(free) = step_of.iter().position(|&s| s == UNPIVOTED) {
                self.row_indices[0] = free;
                ilast = 1;
            }
        }

        self.last_lower = ilast;
        self.first_upper = ifirst;
    }

    fn load_column(&mut self, rows: &[usize], vals: &[T]) {
        for &r in &self.row_indices[..self.last_lower] {
            self.accu[r] = T::zero();
        }
        for &r in &self.row_indices[self.first_upper..] {
            self.accu[r] = T::zero();
        }
        for (&r, &v) in rows.iter().zip(vals) {
            self.accu[self.work_row[r]] = v;
        }
    }

    /// Apply the updates of all earlier columns and gather the result into
    /// `scratch`, in `row_indices` order. Returns the flop count.
    fn factor_column(&mut self, lower: &ColumnStore<T>, step_of: &[usize]) -> usize {
        let mut flops = 0;
        for i in self.first_upper..self.n {
            let irow = self.row_indices[i];
            let t = -self.accu[irow];
            let (idx, val) = lower.column(step_of[irow]);
            flops += idx.len();
            for (&r, &v) in idx.iter().zip(val) {
                self.accu[r] += t * v;
            }
        }

        for i in (0..self.last_lower).chain(self.first_upper..self.n) {
            let irow = self.row_indices[i];
            self.scratch[i] = self.accu[irow];
            self.accu[irow] = T::zero();
        }
        flops
    }

    #[inline]
    fn scaled(&self, i: usize) -> f64 {
        self.scales[self.row_indices[i]] * self.scratch[i].abs_val()
    }

    fn pivot_column(
        &mut self,
        step_of: &mut [usize],
        jcol: usize,
        pivot_event: &mut Event<(usize, f64)>,
        zero_pivot_event: &mut Event<(usize, f64)>,
    ) {
        let ilast = self.last_lower;

        let mut ipiv = 0;
        let mut xpiv = self.scaled(0);
        for i in 1..ilast {
            let x = self.scaled(i);
            if x > xpiv {
                xpiv = x;
                ipiv = i;
            }
        }

        // Prefer the candidate nearest the diagonal that is still within
        // the threshold of the largest one.
        let mut dist = jcol.abs_diff(self.row_indices[ipiv]);
        if dist > 0 {
            let bar = if xpiv <= self.zero_threshold {
                -1.0
            } else {
                xpiv * self.pivot_threshold
            };
            for i in 0..ilast {
                let d = jcol.abs_diff(self.row_indices[i]);
                if d < dist && self.scaled(i) >= bar {
                    dist = d;
                    ipiv = i;
                }
            }
            xpiv = self.scaled(ipiv);
        }

        let irow = self.row_indices[ipiv];
        step_of[irow] = jcol;
        self.row_indices.swap(0, ipiv);
        self.scratch.swap(0, ipiv);

        let orig = self.orig_row[irow];
        if xpiv <= self.zero_threshold {
            self.zero_count += 1;
            let factor = if is_tiny(xpiv) {
                self.scratch[0] = T::one();
                self.zero_threshold.sqrt() / self.scales[irow]
            } else {
                self.zero_threshold.sqrt() / xpiv
            };
            self.scratch[0] = self.scratch[0].scale(factor);
            zero_pivot_event.emit((orig, xpiv));
        }
        pivot_event.emit((orig, self.scratch[0].abs_val()));

        let inv = self.scratch[0].recip();
        self.scratch[0] = inv;
        for v in &mut self.scratch[1..ilast] {
            *v *= inv;
        }
    }

    /// Symmetric pruning: an L column that holds the new pivot row only
    /// needs its pivoted rows for future structure searches.
    fn prune_column(&mut self, lower: &mut ColumnStore<T>, step_of: &[usize], jcol: usize) {
        for i in self.first_upper..self.n {
            let icol = step_of[self.row_indices[i]];
            let start = lower.column_start(icol);
            if lower.column_end(icol) != self.end_points[icol] {
                continue;
            }
            let (idx, val) = lower.column_mut(icol);
            if !idx.iter().any(|&r| step_of[r] == jcol) {
                continue;
            }
            let mut k = 0;
            let mut m = idx.len();
            while k < m {
                if step_of[idx[k]] == UNPIVOTED {
                    m -= 1;
                    idx.swap(k, m);
                    val.swap(k, m);
                } else {
                    k += 1;
                }
            }
            self.end_points[icol] = start + m;
        }
    }

    fn store_column(
        &mut self,
        upper: &mut ColumnStore<T>,
        lower: &mut ColumnStore<T>,
        step_of: &[usize],
        jcol: usize,
    ) {
        let ilast = self.last_lower;
        lower.extend_column(&self.row_indices[1..ilast], &self.scratch[1..ilast]);
        lower.close_column();
        self.end_points[jcol] = lower.nnz();

        for i in self.first_upper..self.n {
            upper.push(step_of[self.row_indices[i]], self.scratch[i]);
        }
        upper.push(jcol, self.scratch[0]);
        upper.close_column();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::sync::{Arc, Mutex};

    fn tridiag4() -> CsrMatrix<f64> {
        let mut t = Vec::new();
        for i in 0..4 {
            t.push((i, i, 4.0));
            if i + 1 < 4 {
                t.push((i, i + 1, 1.0));
                t.push((i + 1, i, 1.0));
            }
        }
        CsrMatrix::from_triplets(4, 4, &t)
    }

    /// Explicitly stored zero on the (0, 0) diagonal.
    fn zero_diag3() -> CsrMatrix<f64> {
        CsrMatrix::from_triplets(
            3,
            3,
            &[
                (0, 0, 0.0),
                (0, 1, 1.0),
                (1, 0, 1.0),
                (1, 1, 2.0),
                (1, 2, 1.0),
                (2, 1, 1.0),
                (2, 2, 3.0),
            ],
        )
    }

    fn residual<T: Scalar>(a: &CsrMatrix<T>, x: &[T], b: &[T]) -> f64 {
        a.spmv(x)
            .iter()
            .zip(b)
            .map(|(&ax, &bi)| (ax - bi).abs_val())
            .fold(0.0, f64::max)
    }

    #[test]
    fn test_tridiagonal_closed_form() {
        let a = tridiag4();
        let mut lu = SparseLu::new();
        assert_eq!(lu.factor(&a).unwrap(), 0);
        assert!(lu.is_factored());
        assert_eq!(lu.size(), 4);

        let mut x = vec![0.0; 4];
        lu.solve(&mut x, &[1.0; 4]).unwrap();
        let expected = [4.0 / 19.0, 3.0 / 19.0, 3.0 / 19.0, 4.0 / 19.0];
        for (xi, ei) in x.iter().zip(expected) {
            assert_abs_diff_eq!(*xi, ei, epsilon = 1e-10 * ei);
        }
    }

    #[test]
    fn test_diagonal_pivot_on_dominant_matrix() {
        let a = tridiag4();
        let mut lu = SparseLu::new();
        lu.factor(&a).unwrap();
        assert_eq!(lu.row_map(), &[0, 1, 2, 3]);
        // No fill for a tridiagonal matrix.
        assert_eq!(lu.lower().nnz(), 3);
        assert_eq!(lu.upper().nnz(), 7);
    }

    #[test]
    fn test_zero_diagonal_needs_pivoting() {
        let a = zero_diag3();

        let mut lu = SparseLu::new();
        lu.set_pivot_threshold(0.0).unwrap();
        let err = lu.factor(&a).unwrap_err();
        assert_eq!(
            err,
            SolverError::Singular {
                zero_pivots: 1,
                max_zero_pivots: 0
            }
        );
        assert!(!lu.is_factored());

        lu.set_max_zero_pivots(1);
        assert_eq!(lu.factor(&a).unwrap(), 1);

        lu.set_pivot_threshold(0.1).unwrap();
        assert_eq!(lu.factor(&a).unwrap(), 0);
        let b = [1.0, 2.0, 3.0];
        let mut x = vec![0.0; 3];
        lu.solve(&mut x, &b).unwrap();
        assert!(residual(&a, &x, &b) < 1e-12);
    }

    #[test]
    fn test_pivot_events_once_per_column() {
        let a = zero_diag3();
        let mut lu = SparseLu::new();
        lu.set_pivot_threshold(0.0).unwrap();
        lu.set_max_zero_pivots(1);

        let pivots = Arc::new(Mutex::new(Vec::new()));
        let zeros = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&pivots);
        lu.pivot_event.connect(move |(row, mag)| p.lock().unwrap().push((row, mag)));
        let z = Arc::clone(&zeros);
        lu.zero_pivot_event.connect(move |(row, _)| z.lock().unwrap().push(row));

        lu.factor(&a).unwrap();
        assert_eq!(pivots.lock().unwrap().len(), 3);
        assert_eq!(*zeros.lock().unwrap(), vec![0]);
        assert!(pivots.lock().unwrap().iter().all(|&(_, mag)| mag > 0.0));
    }

    #[test]
    fn test_masked_rows_are_identity() {
        let a = tridiag4();
        let mask = [true, false, true, true];
        let mut lu = SparseLu::new();
        lu.factor_masked(&a, &mask).unwrap();

        let b = [1.0, 7.0, 2.0, 3.0];
        let mut x = vec![0.0; 4];
        lu.solve(&mut x, &b).unwrap();
        assert_abs_diff_eq!(x[1], 7.0, epsilon = 1e-14);
        // Row 0 decouples: 4 x0 = 1.
        assert_abs_diff_eq!(x[0], 0.25, epsilon = 1e-14);
        // Rows 2-3: [[4, 1], [1, 4]] x = [2, 3].
        assert_abs_diff_eq!(x[2], 5.0 / 15.0, epsilon = 1e-14);
        assert_abs_diff_eq!(x[3], 10.0 / 15.0, epsilon = 1e-14);
    }

    #[test]
    fn test_structural_error_keeps_factors() {
        let a = tridiag4();
        let mut lu = SparseLu::new();
        lu.factor(&a).unwrap();

        let err = lu.factor_masked(&a, &[true; 3]).unwrap_err();
        assert!(matches!(err, SolverError::SizeMismatch { what: "mask", .. }));
        assert!(lu.is_factored());

        let err = lu
            .factor_permuted(&a, &[true; 4], &[0, 1, 1, 3], &[0, 1, 2, 3])
            .unwrap_err();
        assert!(matches!(err, SolverError::InvalidPermutation(_)));

        let rect: CsrMatrix<f64> = CsrMatrix::new(3, 4);
        assert!(matches!(
            lu.factor(&rect),
            Err(SolverError::NotSquare { nrows: 3, ncols: 4 })
        ));

        let mut x = vec![0.0; 4];
        lu.solve(&mut x, &[1.0; 4]).unwrap();
        assert_abs_diff_eq!(x[0], 4.0 / 19.0, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_requires_factor() {
        let lu: SparseLu<f64> = SparseLu::new();
        let mut x = vec![0.0; 2];
        assert_eq!(lu.solve(&mut x, &[1.0, 2.0]), Err(SolverError::NotFactored));
        assert_eq!(lu.size(), 0);
        assert_eq!(lu.non_zero_count(), 0);
    }

    #[test]
    fn test_solve_size_mismatch() {
        let mut lu = SparseLu::new();
        lu.factor(&tridiag4()).unwrap();
        let mut x = vec![0.0; 3];
        assert!(matches!(
            lu.solve(&mut x, &[1.0; 4]),
            Err(SolverError::SizeMismatch { what: "lhs vector", .. })
        ));
    }

    #[test]
    fn test_singular_rolls_back() {
        // Second row is empty.
        let a = CsrMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (0, 1, 1.0)]);
        let mut lu = SparseLu::new();
        lu.factor(&tridiag4()).unwrap();
        let err = lu.factor(&a).unwrap_err();
        assert!(matches!(err, SolverError::Singular { .. }));
        assert_eq!(lu.state(), FactorState::Empty);
        assert_eq!(lu.non_zero_count(), 0);
    }

    #[test]
    fn test_nan_pivot_rejected() {
        let a = CsrMatrix::from_triplets(
            2,
            2,
            &[(0, 0, f64::NAN), (0, 1, 1.0), (1, 0, 1.0), (1, 1, 2.0)],
        );
        let mut lu = SparseLu::new();
        lu.factor(&tridiag4()).unwrap();
        let err = lu.factor(&a).unwrap_err();
        assert_eq!(err, SolverError::NonFinite("pivot"));
        assert_eq!(err.kind(), crate::error::ErrorKind::Numeric);
        assert_eq!(lu.state(), FactorState::Empty);
    }

    #[test]
    fn test_parameter_validation() {
        let mut lu: SparseLu<f64> = SparseLu::new();
        assert!(lu.set_pivot_threshold(1.5).is_err());
        assert!(lu.set_pivot_threshold(-0.1).is_err());
        assert!(lu.set_zero_threshold(0.0).is_err());
        assert!(lu.set_zero_threshold(f64::NAN).is_err());
        assert_eq!(lu.pivot_threshold(), 0.1);
        lu.set_pivot_threshold(1.0).unwrap();
        assert_eq!(lu.pivot_threshold(), 1.0);
        assert!(SparseLu::<f64>::with_params(LuParams {
            pivot_threshold: 2.0,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_fill_in_arrow_matrix() {
        // Dense first row and column: eliminating column 0 first fills
        // everything.
        let n = 5;
        let mut t = vec![(0, 0, 10.0)];
        for i in 1..n {
            t.push((0, i, 1.0));
            t.push((i, 0, 1.0));
            t.push((i, i, 4.0));
        }
        let a = CsrMatrix::from_triplets(n, n, &t);
        let mut lu = SparseLu::new();
        lu.factor(&a).unwrap();
        let b: Vec<f64> = (0..n).map(|i| i as f64 + 1.0).collect();
        let mut x = vec![0.0; n];
        lu.solve(&mut x, &b).unwrap();
        assert!(residual(&a, &x, &b) < 1e-12);
        assert!(lu.non_zero_count() >= a.nnz());
    }

    #[test]
    fn test_complex_factor() {
        let j = Complex64::new(0.0, 1.0);
        let one = Complex64::new(1.0, 0.0);
        let a = CsrMatrix::from_triplets(
            3,
            3,
            &[
                (0, 0, 2.0 * one + j),
                (0, 1, -one),
                (1, 0, -one),
                (1, 1, 2.0 * one + j),
                (1, 2, -one),
                (2, 1, -one),
                (2, 2, 2.0 * one + j),
            ],
        );
        let mut lu = ZSparseLu::new();
        assert_eq!(lu.factor(&a).unwrap(), 0);
        let b = vec![one, j, one + j];
        let mut x = vec![Complex64::new(0.0, 0.0); 3];
        lu.solve(&mut x, &b).unwrap();
        assert!(residual(&a, &x, &b) < 1e-12);

        let mut xr = vec![0.0; 3];
        lu.solve_real(&mut xr, &[1.0, 0.0, 0.0]).unwrap();
        let mut xc = vec![Complex64::new(0.0, 0.0); 3];
        lu.solve(&mut xc, &[one, 0.0 * one, 0.0 * one]).unwrap();
        for (r, c) in xr.iter().zip(&xc) {
            assert_abs_diff_eq!(*r, c.re, epsilon = 1e-15);
        }
    }

    #[test]
    fn test_real_factor_complex_rhs() {
        let a = tridiag4();
        let mut lu = SparseLu::new();
        lu.factor(&a).unwrap();
        let b: Vec<Complex64> = (0..4)
            .map(|i| Complex64::new(1.0, i as f64))
            .collect();
        let mut x = vec![Complex64::new(0.0, 0.0); 4];
        lu.solve_complex(&mut x, &b).unwrap();
        let ac = CsrMatrix::from_triplets(
            4,
            4,
            &a.to_dense()
                .iter()
                .enumerate()
                .flat_map(|(i, row)| {
                    row.iter()
                        .enumerate()
                        .filter(|(_, v)| **v != 0.0)
                        .map(move |(j, &v)| (i, j, Complex64::new(v, 0.0)))
                })
                .collect::<Vec<_>>(),
        );
        assert!(residual(&ac, &x, &b) < 1e-12);
    }

    #[test]
    fn test_solve_many_matches_solve() {
        let a = tridiag4();
        let mut lu = SparseLu::new();
        lu.factor(&a).unwrap();
        let rhs: Vec<Vec<f64>> = (0..6).map(|k| vec![k as f64, 1.0, -1.0, 2.0]).collect();
        let many = lu.solve_many(&rhs).unwrap();
        for (b, x) in rhs.iter().zip(&many) {
            let mut single = vec![0.0; 4];
            lu.solve(&mut single, b).unwrap();
            assert_eq!(&single, x);
        }
    }

    #[test]
    fn test_solve_in_place() {
        let a = tridiag4();
        let mut lu = SparseLu::new();
        lu.factor(&a).unwrap();
        let mut x = vec![1.0; 4];
        Factorization::solve_in_place(&lu, &mut x).unwrap();
        assert_abs_diff_eq!(x[1], 3.0 / 19.0, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_matrix() {
        let a: CsrMatrix<f64> = CsrMatrix::new(0, 0);
        let mut lu = SparseLu::new();
        assert_eq!(lu.factor(&a).unwrap(), 0);
        let mut x: Vec<f64> = Vec::new();
        lu.solve(&mut x, &[]).unwrap();
    }

    #[test]
    fn test_duplicate_entries_rejected() {
        let a = CsrMatrix {
            nrows: 2,
            ncols: 2,
            values: vec![1.0, 2.0, 3.0],
            col_indices: vec![0, 0, 1],
            row_pointers: vec![0, 2, 3],
        };
        let mut lu = SparseLu::new();
        assert_eq!(
            lu.factor(&a),
            Err(SolverError::DuplicateEntry { row: 0, col: 0 })
        );
    }
}
