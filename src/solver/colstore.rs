//! Growable compressed-column storage for factors.
//!
//! Columns are appended one at a time during a factorization sweep. Each
//! column is filled with [`ColumnStore::push`] or
//! [`ColumnStore::extend_column`] and then sealed with
//! [`ColumnStore::close_column`]; a sealed column keeps its bounds until the
//! store is cleared. Entries inside a sealed column may still be reordered
//! or rescaled in place.

use std::mem::size_of;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStore<T> {
    /// `offsets[j]..offsets[j + 1]` is the range of column j.
    offsets: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<T>,
}

impl<T> Default for ColumnStore<T> {
    fn default() -> Self {
        Self {
            offsets: vec![0],
            indices: Vec::new(),
            values: Vec::new(),
        }
    }
}

impl<T: Copy> ColumnStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all columns and release the flexible storage.
    pub fn clear(&mut self) {
        self.offsets = vec![0];
        self.indices = Vec::new();
        self.values = Vec::new();
    }

    /// Pre-size for `columns` columns and `nnz` entries.
    pub fn reserve(&mut self, columns: usize, nnz: usize) {
        self.offsets.reserve(columns);
        self.indices.reserve(nnz);
        self.values.reserve(nnz);
    }

    /// Number of sealed columns.
    pub fn column_count(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// Entries pushed since the last sealed column.
    pub fn open_len(&self) -> usize {
        self.indices.len() - self.offsets[self.offsets.len() - 1]
    }

    #[inline]
    pub fn push(&mut self, index: usize, value: T) {
        self.indices.push(index);
        self.values.push(value);
    }

    /// Append a batch to the open column, growing storage once up front.
    pub fn extend_column(&mut self, indices: &[usize], values: &[T]) {
        debug_assert_eq!(indices.len(), values.len());
        self.indices.extend_from_slice(indices);
        self.values.extend_from_slice(values);
    }

    /// Seal the open column and return its index.
    pub fn close_column(&mut self) -> usize {
        self.offsets.push(self.indices.len());
        self.offsets.len() - 2
    }

    #[inline]
    pub fn column_start(&self, j: usize) -> usize {
        self.offsets[j]
    }

    #[inline]
    pub fn column_end(&self, j: usize) -> usize {
        self.offsets[j + 1]
    }

    #[inline]
    pub fn column(&self, j: usize) -> (&[usize], &[T]) {
        let range = self.offsets[j]..self.offsets[j + 1];
        (&self.indices[range.clone()], &self.values[range])
    }

    #[inline]
    pub fn column_mut(&mut self, j: usize) -> (&mut [usize], &mut [T]) {
        let range = self.offsets[j]..self.offsets[j + 1];
        (&mut self.indices[range.clone()], &mut self.values[range])
    }

    /// Flat index array across all columns.
    #[inline]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    #[inline]
    pub fn values(&self) -> &[T] {
        &self.values
    }

    #[inline]
    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    /// Rewrite every stored index through `map`.
    pub fn remap_indices(&mut self, mut map: impl FnMut(usize) -> usize) {
        for idx in self.indices.iter_mut() {
            *idx = map(*idx);
        }
    }

    /// Sort the entries of every sealed column by index.
    pub fn sort_columns(&mut self) {
        let mut buf: Vec<(usize, T)> = Vec::new();
        for j in 0..self.column_count() {
            let (idx, val) = self.column_mut(j);
            if idx.windows(2).all(|w| w[0] <= w[1]) {
                continue;
            }
            buf.clear();
            buf.extend(idx.iter().copied().zip(val.iter().copied()));
            buf.sort_unstable_by_key(|&(i, _)| i);
            for (k, &(i, v)) in buf.iter().enumerate() {
                idx[k] = i;
                val[k] = v;
            }
        }
    }

    /// Compact the sealed columns, keeping entries for which
    /// `keep(column, index, value)` holds. Column count is unchanged.
    pub fn retain(&mut self, mut keep: impl FnMut(usize, usize, T) -> bool) {
        let mut nnz = 0;
        for j in 0..self.column_count() {
            let (start, end) = (self.offsets[j], self.offsets[j + 1]);
            self.offsets[j] = nnz;
            for k in start..end {
                let (i, v) = (self.indices[k], self.values[k]);
                if keep(j, i, v) {
                    self.indices[nnz] = i;
                    self.values[nnz] = v;
                    nnz += 1;
                }
            }
        }
        let last = self.offsets.len() - 1;
        self.offsets[last] = nnz;
        self.indices.truncate(nnz);
        self.values.truncate(nnz);
    }

    /// Release excess capacity when it exceeds the used size by `margin`.
    pub fn shrink(&mut self, margin: f64) {
        if self.indices.capacity() as f64 > margin * self.indices.len() as f64 {
            self.indices.shrink_to_fit();
        }
        if self.values.capacity() as f64 > margin * self.values.len() as f64 {
            self.values.shrink_to_fit();
        }
    }

    /// Approximate bytes held, counting used length rather than capacity.
    pub fn mem_usage(&self) -> usize {
        self.offsets.len() * size_of::<usize>()
            + self.indices.len() * size_of::<usize>()
            + self.values.len() * size_of::<T>()
    }
}
