//! Compressed Sparse Row (CSR) matrix.
//!
//! This is the data contract between callers and the factorization engines.
//! Generic over value type to support both f64 and Complex64. The engines
//! never write into a caller's matrix; they build transposed or permuted
//! working copies where needed.

use std::borrow::Cow;
use std::ops::AddAssign;

use crate::error::{Result, SolverError};
use crate::ordering::Permutation;
use crate::scalar::Scalar;

/// Sparse matrix in Compressed Sparse Row format.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    pub nrows: usize,
    pub ncols: usize,
    /// Non-zero values, stored row by row.
    pub values: Vec<T>,
    /// Column index for each non-zero value.
    pub col_indices: Vec<usize>,
    /// `row_pointers[i]` is the index into values/col_indices where row i starts.
    /// `row_pointers[nrows]` = total number of non-zeros.
    pub row_pointers: Vec<usize>,
}

/// Read access to a sparse matrix, row by row.
///
/// `row_entries` is the index-based accessor path every source must
/// provide. Sources backed by contiguous CSR arrays also return them from
/// `as_csr`, which lets the engines skip the gather step. Both paths yield
/// identical factors.
pub trait SparseSource<T> {
    fn nrows(&self) -> usize;
    fn ncols(&self) -> usize;
    fn nnz(&self) -> usize;

    /// Append the `(column, value)` pairs of `row` to `out`.
    fn row_entries(&self, row: usize, out: &mut Vec<(usize, T)>);

    fn as_csr(&self) -> Option<&CsrMatrix<T>> {
        None
    }
}

impl<T: Copy + Default + AddAssign> CsrMatrix<T> {
    /// Create an empty matrix with no non-zero entries.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            values: Vec::new(),
            col_indices: Vec::new(),
            row_pointers: vec![0; nrows + 1],
        }
    }

    /// Wrap raw CSR arrays, checking offsets, index ranges and duplicates.
    pub fn try_from_raw(
        nrows: usize,
        ncols: usize,
        row_pointers: Vec<usize>,
        col_indices: Vec<usize>,
        values: Vec<T>,
    ) -> Result<Self> {
        let m = Self {
            nrows,
            ncols,
            values,
            col_indices,
            row_pointers,
        };
        m.check_structure()?;
        Ok(m)
    }

    /// Number of non-zero entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn is_square(&self) -> bool {
        self.nrows == self.ncols
    }

    /// Column indices and values of one row.
    pub fn row(&self, i: usize) -> (&[usize], &[T]) {
        let range = self.row_pointers[i]..self.row_pointers[i + 1];
        (&self.col_indices[range.clone()], &self.values[range])
    }

    /// Build CSR matrix from (row, col, value) triplets.
    /// Duplicate entries at the same (row, col) are summed.
    pub fn from_triplets(nrows: usize, ncols: usize, triplets: &[(usize, usize, T)]) -> Self {
        if triplets.is_empty() {
            return Self::new(nrows, ncols);
        }

        // Sort indices by (row, col) without requiring T: Ord
        let mut indices: Vec<usize> = (0..triplets.len()).collect();
        indices.sort_by_key(|&i| (triplets[i].0, triplets[i].1));

        let mut values = Vec::with_capacity(triplets.len());
        let mut col_indices = Vec::with_capacity(triplets.len());
        let mut row_pointers = vec![0usize; nrows + 1];

        let first = indices[0];
        let mut cur_row = triplets[first].0;
        let mut cur_col = triplets[first].1;
        let mut cur_val = triplets[first].2;

        for &idx in &indices[1..] {
            let (row, col, val) = triplets[idx];
            if row == cur_row && col == cur_col {
                cur_val += val;
            } else {
                values.push(cur_val);
                col_indices.push(cur_col);
                row_pointers[cur_row + 1] += 1;
                cur_row = row;
                cur_col = col;
                cur_val = val;
            }
        }
        values.push(cur_val);
        col_indices.push(cur_col);
        row_pointers[cur_row + 1] += 1;

        // Convert per-row counts to cumulative offsets
        for i in 1..=nrows {
            row_pointers[i] += row_pointers[i - 1];
        }

        Self {
            nrows,
            ncols,
            values,
            col_indices,
            row_pointers,
        }
    }

    /// Verify the CSR invariants: offset length and monotonicity, column
    /// indices in range, and at most one entry per (row, col).
    pub fn check_structure(&self) -> Result<()> {
        if self.row_pointers.len() != self.nrows + 1 {
            return Err(SolverError::size_mismatch(
                "row offsets",
                self.nrows + 1,
                self.row_pointers.len(),
            ));
        }
        if self.row_pointers[0] != 0 {
            return Err(SolverError::InvalidStructure(
                "first row offset must be zero".into(),
            ));
        }
        if self.col_indices.len() != self.values.len() {
            return Err(SolverError::size_mismatch(
                "values",
                self.col_indices.len(),
                self.values.len(),
            ));
        }
        if self.row_pointers[self.nrows] != self.col_indices.len() {
            return Err(SolverError::size_mismatch(
                "column indices",
                self.row_pointers[self.nrows],
                self.col_indices.len(),
            ));
        }

        if let Some(row) = self.row_pointers.windows(2).position(|w| w[1] < w[0]) {
            return Err(SolverError::InvalidStructure(format!(
                "row offsets decrease at row {row}"
            )));
        }

        // Marker per column holds the last row that touched it.
        let mut seen = vec![usize::MAX; self.ncols];
        for row in 0..self.nrows {
            let (start, end) = (self.row_pointers[row], self.row_pointers[row + 1]);
            for &col in &self.col_indices[start..end] {
                if col >= self.ncols {
                    return Err(SolverError::InvalidStructure(format!(
                        "column index {col} out of range in row {row}"
                    )));
                }
                if seen[col] == row {
                    return Err(SolverError::DuplicateEntry { row, col });
                }
                seen[col] = row;
            }
        }
        Ok(())
    }

    /// Transposed copy. Row indices within each column come out sorted.
    pub fn transpose(&self) -> Self {
        let mut counts = vec![0usize; self.ncols + 1];
        for &c in &self.col_indices {
            counts[c + 1] += 1;
        }
        for i in 1..=self.ncols {
            counts[i] += counts[i - 1];
        }
        let row_pointers = counts.clone();
        let mut next = counts;
        let mut col_indices = vec![0usize; self.nnz()];
        let mut values = vec![T::default(); self.nnz()];
        for row in 0..self.nrows {
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                let c = self.col_indices[idx];
                let k = next[c];
                next[c] += 1;
                col_indices[k] = row;
                values[k] = self.values[idx];
            }
        }
        Self {
            nrows: self.ncols,
            ncols: self.nrows,
            values,
            col_indices,
            row_pointers,
        }
    }

    /// Permuted copy `B` with `B[i][j] = A[row_perm[i]][col_perm[j]]`.
    pub fn permute(&self, row_perm: &Permutation, col_perm: &Permutation) -> Result<Self> {
        if row_perm.len() != self.nrows {
            return Err(SolverError::size_mismatch(
                "row permutation",
                self.nrows,
                row_perm.len(),
            ));
        }
        if col_perm.len() != self.ncols {
            return Err(SolverError::size_mismatch(
                "column permutation",
                self.ncols,
                col_perm.len(),
            ));
        }
        let col_inv = col_perm.inverse_slice();
        let mut row_pointers = Vec::with_capacity(self.nrows + 1);
        let mut col_indices = Vec::with_capacity(self.nnz());
        let mut values = Vec::with_capacity(self.nnz());
        row_pointers.push(0);
        for &old_row in row_perm.as_slice() {
            let (cols, vals) = self.row(old_row);
            for (&c, &v) in cols.iter().zip(vals) {
                col_indices.push(col_inv[c]);
                values.push(v);
            }
            row_pointers.push(col_indices.len());
        }
        Ok(Self {
            nrows: self.nrows,
            ncols: self.ncols,
            values,
            col_indices,
            row_pointers,
        })
    }

    /// Diagonal entries; missing entries read as `T::default()`.
    pub fn diagonal(&self) -> Vec<T> {
        let n = self.nrows.min(self.ncols);
        let mut diag = vec![T::default(); n];
        for (row, d) in diag.iter_mut().enumerate() {
            let (cols, vals) = self.row(row);
            if let Some(pos) = cols.iter().position(|&c| c == row) {
                *d = vals[pos];
            }
        }
        diag
    }

    /// Convert to dense matrix (row-major). For testing and small matrices only.
    pub fn to_dense(&self) -> Vec<Vec<T>> {
        let mut dense = vec![vec![T::default(); self.ncols]; self.nrows];
        for row in 0..self.nrows {
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                dense[row][self.col_indices[idx]] = self.values[idx];
            }
        }
        dense
    }

    /// Gather any source into CSR form, borrowing when it is already CSR.
    pub fn from_source<M>(source: &M) -> Cow<'_, CsrMatrix<T>>
    where
        M: SparseSource<T> + ?Sized,
        T: Clone,
    {
        if let Some(csr) = source.as_csr() {
            return Cow::Borrowed(csr);
        }
        let nrows = source.nrows();
        let mut row_pointers = Vec::with_capacity(nrows + 1);
        let mut col_indices = Vec::with_capacity(source.nnz());
        let mut values = Vec::with_capacity(source.nnz());
        let mut buf = Vec::new();
        row_pointers.push(0);
        for row in 0..nrows {
            buf.clear();
            source.row_entries(row, &mut buf);
            for &(c, v) in &buf {
                col_indices.push(c);
                values.push(v);
            }
            row_pointers.push(col_indices.len());
        }
        Cow::Owned(CsrMatrix {
            nrows,
            ncols: source.ncols(),
            values,
            col_indices,
            row_pointers,
        })
    }
}

impl<T: Copy> SparseSource<T> for CsrMatrix<T> {
    fn nrows(&self) -> usize {
        self.nrows
    }

    fn ncols(&self) -> usize {
        self.ncols
    }

    fn nnz(&self) -> usize {
        self.values.len()
    }

    fn row_entries(&self, row: usize, out: &mut Vec<(usize, T)>) {
        let range = self.row_pointers[row]..self.row_pointers[row + 1];
        out.extend(
            self.col_indices[range.clone()]
                .iter()
                .copied()
                .zip(self.values[range].iter().copied()),
        );
    }

    fn as_csr(&self) -> Option<&CsrMatrix<T>> {
        Some(self)
    }
}

impl<T: Scalar> CsrMatrix<T> {
    /// Sparse matrix-vector multiply: y = A * x
    pub fn spmv(&self, x: &[T]) -> Vec<T> {
        let mut y = vec![T::zero(); self.nrows];
        self.spmv_into(x, &mut y);
        y
    }

    /// Sparse matrix-vector multiply into a caller-provided buffer.
    pub fn spmv_into(&self, x: &[T], y: &mut [T]) {
        assert_eq!(x.len(), self.ncols, "spmv dimension mismatch");
        assert_eq!(y.len(), self.nrows, "spmv dimension mismatch");
        for (row, yi) in y.iter_mut().enumerate() {
            let mut sum = T::zero();
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                sum += self.values[idx] * x[self.col_indices[idx]];
            }
            *yi = sum;
        }
    }

    /// Largest row sum of magnitudes (infinity norm).
    pub fn norm_inf(&self) -> f64 {
        (0..self.nrows)
            .map(|row| self.row(row).1.iter().map(|v| v.abs_val()).sum::<f64>())
            .fold(0.0, f64::max)
    }
}
