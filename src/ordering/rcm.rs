//! Reverse Cuthill-McKee ordering.
//!
//! Works on the symmetrized structure of a square matrix. Each connected
//! component is numbered breadth-first from a pseudo-peripheral start node,
//! neighbours in order of increasing degree, and the whole sequence is then
//! reversed. The result narrows the band of the permuted matrix, which
//! bounds the fill of a factorization without pivoting.

use std::collections::VecDeque;

use crate::error::{Result, SolverError};
use crate::sparse::CsrMatrix;

use super::Permutation;

/// Undirected adjacency lists without self loops.
struct Graph {
    xadj: Vec<usize>,
    adjncy: Vec<usize>,
}

impl Graph {
    fn from_matrix<T: Copy>(matrix: &CsrMatrix<T>) -> Self {
        let n = matrix.nrows;
        let mut edges: Vec<(usize, usize)> = Vec::with_capacity(2 * matrix.col_indices.len());
        for row in 0..n {
            for &col in &matrix.col_indices[matrix.row_pointers[row]..matrix.row_pointers[row + 1]]
            {
                if col != row {
                    edges.push((row, col));
                    edges.push((col, row));
                }
            }
        }
        edges.sort_unstable();
        edges.dedup();

        let mut xadj = vec![0usize; n + 1];
        for &(a, _) in &edges {
            xadj[a + 1] += 1;
        }
        for i in 1..=n {
            xadj[i] += xadj[i - 1];
        }
        let adjncy = edges.into_iter().map(|(_, b)| b).collect();
        Self { xadj, adjncy }
    }

    fn neighbours(&self, node: usize) -> &[usize] {
        &self.adjncy[self.xadj[node]..self.xadj[node + 1]]
    }

    fn degree(&self, node: usize) -> usize {
        self.xadj[node + 1] - self.xadj[node]
    }

    /// Breadth-first level structure rooted at `root`, restricted to nodes
    /// not yet numbered. Returns the levels.
    fn levels(
        &self,
        root: usize,
        numbered: &[bool],
        mark: &mut [usize],
        stamp: usize,
    ) -> Vec<Vec<usize>> {
        let mut levels = vec![vec![root]];
        mark[root] = stamp;
        loop {
            let mut next = Vec::new();
            if let Some(last) = levels.last() {
                for &node in last {
                    for &nb in self.neighbours(node) {
                        if !numbered[nb] && mark[nb] != stamp {
                            mark[nb] = stamp;
                            next.push(nb);
                        }
                    }
                }
            }
            if next.is_empty() {
                return levels;
            }
            levels.push(next);
        }
    }
}

/// Compute a reverse Cuthill-McKee permutation for a square matrix.
pub fn reverse_cuthill_mckee<T: Copy>(matrix: &CsrMatrix<T>) -> Result<Permutation> {
    if matrix.nrows != matrix.ncols {
        return Err(SolverError::NotSquare {
            nrows: matrix.nrows,
            ncols: matrix.ncols,
        });
    }
    let n = matrix.nrows;
    let graph = Graph::from_matrix(matrix);
    let mut numbered = vec![false; n];
    let mut mark = vec![usize::MAX; n];
    let mut order = Vec::with_capacity(n);
    let mut stamp = 0;

    for seed in 0..n {
        if numbered[seed] {
            continue;
        }
        let root = pseudo_peripheral(&graph, seed, &numbered, &mut mark, &mut stamp);

        let mut queue = VecDeque::new();
        queue.push_back(root);
        numbered[root] = true;
        while let Some(node) = queue.pop_front() {
            order.push(node);
            let mut fresh: Vec<usize> = graph
                .neighbours(node)
                .iter()
                .copied()
                .filter(|&nb| !numbered[nb])
                .collect();
            fresh.sort_by_key(|&nb| (graph.degree(nb), nb));
            for nb in fresh {
                numbered[nb] = true;
                queue.push_back(nb);
            }
        }
    }

    order.reverse();
    tracing::debug!(n, "reverse Cuthill-McKee ordering computed");
    Permutation::from_vec(order)
}

/// George-Liu search: repeatedly restart from a minimum-degree node of the
/// last level until the eccentricity stops growing.
fn pseudo_peripheral(
    graph: &Graph,
    seed: usize,
    numbered: &[bool],
    mark: &mut [usize],
    stamp: &mut usize,
) -> usize {
    let mut root = seed;
    *stamp += 1;
    let mut levels = graph.levels(root, numbered, mark, *stamp);
    loop {
        let candidate = levels
            .last()
            .and_then(|last| last.iter().copied().min_by_key(|&v| (graph.degree(v), v)));
        let Some(candidate) = candidate else {
            return root;
        };
        *stamp += 1;
        let trial = graph.levels(candidate, numbered, mark, *stamp);
        if trial.len() > levels.len() {
            root = candidate;
            levels = trial;
        } else {
            return root;
        }
    }
}

/// Half-bandwidth: the largest `|i - j|` over stored entries.
pub fn bandwidth<T>(matrix: &CsrMatrix<T>) -> usize {
    let mut bw = 0;
    for row in 0..matrix.nrows {
        for &col in &matrix.col_indices[matrix.row_pointers[row]..matrix.row_pointers[row + 1]] {
            bw = bw.max(row.abs_diff(col));
        }
    }
    bw
}
