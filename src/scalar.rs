//! Numeric trait shared by the real and complex factorization paths.

use num_complex::Complex64;
use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

/// Magnitudes below this are treated as exact zeros.
pub const TINY: f64 = 1.0e-30;

#[inline]
pub fn is_tiny(x: f64) -> bool {
    x.abs() < TINY
}

/// Trait bounds needed by the elimination and substitution kernels.
///
/// Pivot selection only ever compares magnitudes, so every operation that
/// differs between real and complex entries goes through `abs_val` or
/// `abs_sqr`.
pub trait Scalar:
    Copy
    + Default
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + PartialEq
    + Debug
    + 'static
{
    fn zero() -> Self;
    fn one() -> Self;
    /// Modulus.
    fn abs_val(self) -> f64;
    /// Squared modulus.
    fn abs_sqr(self) -> f64;
    /// Multiply by a real factor.
    fn scale(self, s: f64) -> Self;
    fn is_finite(self) -> bool;

    fn recip(self) -> Self {
        Self::one() / self
    }
}

impl Scalar for f64 {
    #[inline]
    fn zero() -> Self {
        0.0
    }
    #[inline]
    fn one() -> Self {
        1.0
    }
    #[inline]
    fn abs_val(self) -> f64 {
        self.abs()
    }
    #[inline]
    fn abs_sqr(self) -> f64 {
        self * self
    }
    #[inline]
    fn scale(self, s: f64) -> Self {
        self * s
    }
    #[inline]
    fn is_finite(self) -> bool {
        f64::is_finite(self)
    }
}

impl Scalar for Complex64 {
    #[inline]
    fn zero() -> Self {
        Complex64::new(0.0, 0.0)
    }
    #[inline]
    fn one() -> Self {
        Complex64::new(1.0, 0.0)
    }
    #[inline]
    fn abs_val(self) -> f64 {
        self.norm()
    }
    #[inline]
    fn abs_sqr(self) -> f64 {
        self.norm_sqr()
    }
    #[inline]
    fn scale(self, s: f64) -> Self {
        Complex64::new(self.re * s, self.im * s)
    }
    #[inline]
    fn is_finite(self) -> bool {
        self.re.is_finite() && self.im.is_finite()
    }

    fn recip(self) -> Self {
        let d = self.norm_sqr();
        Complex64::new(self.re / d, -self.im / d)
    }
}
