//! Permutations and fill-reducing reorderings.

pub mod permutation;
pub mod rcm;

pub use permutation::{is_valid_permutation, Permutation};
pub use rcm::{bandwidth, reverse_cuthill_mckee};
