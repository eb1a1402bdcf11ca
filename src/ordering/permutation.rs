//! Row/column permutations.
//!
//! `perm[i]` is the original index placed at position `i`; the inverse maps
//! an original index back to its position.

use crate::error::{Result, SolverError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    perm: Vec<usize>,
    inverse: Vec<usize>,
}

/// Check that `perm` holds every index of `0..perm.len()` exactly once.
pub fn is_valid_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &p in perm {
        if p >= perm.len() || seen[p] {
            return false;
        }
        seen[p] = true;
    }
    true
}

impl Permutation {
    pub fn identity(n: usize) -> Self {
        let perm: Vec<usize> = (0..n).collect();
        Self {
            inverse: perm.clone(),
            perm,
        }
    }

    pub fn from_vec(perm: Vec<usize>) -> Result<Self> {
        let n = perm.len();
        let mut inverse = vec![usize::MAX; n];
        for (i, &p) in perm.iter().enumerate() {
            if p >= n {
                return Err(SolverError::InvalidPermutation(format!(
                    "index {p} out of range 0..{n}"
                )));
            }
            if inverse[p] != usize::MAX {
                return Err(SolverError::InvalidPermutation(format!(
                    "index {p} appears twice"
                )));
            }
            inverse[p] = i;
        }
        Ok(Self { perm, inverse })
    }

    pub fn from_slice(perm: &[usize]) -> Result<Self> {
        Self::from_vec(perm.to_vec())
    }

    pub fn len(&self) -> usize {
        self.perm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }

    pub fn is_identity(&self) -> bool {
        self.perm.iter().enumerate().all(|(i, &p)| i == p)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.perm
    }

    pub fn inverse_slice(&self) -> &[usize] {
        &self.inverse
    }

    pub fn inverse(&self) -> Permutation {
        Permutation {
            perm: self.inverse.clone(),
            inverse: self.perm.clone(),
        }
    }

    pub fn into_vec(self) -> Vec<usize> {
        self.perm
    }

    /// Gather: `out[i] = x[perm[i]]`.
    pub fn apply<T: Copy>(&self, x: &[T]) -> Vec<T> {
        assert_eq!(x.len(), self.len(), "permutation length mismatch");
        self.perm.iter().map(|&p| x[p]).collect()
    }

    /// Scatter: `out[perm[i]] = x[i]`. Undoes [`apply`](Self::apply).
    pub fn apply_inverse<T: Copy>(&self, x: &[T]) -> Vec<T> {
        assert_eq!(x.len(), self.len(), "permutation length mismatch");
        self.inverse.iter().map(|&i| x[i]).collect()
    }

    /// Composition `self ∘ other`: position `i` holds `other[self[i]]`.
    pub fn then(&self, other: &Permutation) -> Result<Permutation> {
        if self.len() != other.len() {
            return Err(SolverError::size_mismatch(
                "permutation",
                self.len(),
                other.len(),
            ));
        }
        Permutation::from_vec(self.perm.iter().map(|&p| other.perm[p]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_builds_inverse() {
        let p = Permutation::from_vec(vec![2, 0, 1]).unwrap();
        assert_eq!(p.inverse_slice(), &[1, 2, 0]);
        for i in 0..3 {
            assert_eq!(p.inverse_slice()[p.as_slice()[i]], i);
        }
        assert!(!p.is_identity());
        assert!(Permutation::identity(4).is_identity());
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            Permutation::from_vec(vec![0, 0, 1]),
            Err(SolverError::InvalidPermutation(_))
        ));
        assert!(Permutation::from_vec(vec![0, 3]).is_err());
        assert!(!is_valid_permutation(&[1, 1]));
        assert!(is_valid_permutation(&[1, 0]));
    }

    #[test]
    fn test_apply_roundtrip() {
        let p = Permutation::from_vec(vec![3, 1, 0, 2]).unwrap();
        let x = [10, 11, 12, 13];
        let y = p.apply(&x);
        assert_eq!(y, vec![13, 11, 10, 12]);
        assert_eq!(p.apply_inverse(&y), x.to_vec());
        assert_eq!(p.inverse().apply(&y), x.to_vec());
    }

    #[test]
    fn test_then() {
        let p = Permutation::from_vec(vec![1, 2, 0]).unwrap();
        let q = p.then(&p.inverse()).unwrap();
        assert!(q.is_identity());
    }
}
