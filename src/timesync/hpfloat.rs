//! Extended-Precision Timestamp Value
//!
//! `HpFloat` is an unevaluated double-double: the value is `hi + lo` where
//! `|lo| <= ulp(hi) / 2`. That gives ~106 bits of significand, enough to
//! carry a device counter of order 10^17 through a multiply by 10^9 and a
//! divide by the tick frequency without dropping nanoseconds.
//!
//! # Rounding rules
//!
//! - Integers with magnitude below 2^106 convert exactly.
//! - `+`, `-`, `*` are the classic Dekker/Knuth error-free constructions
//!   followed by a renormalization; the result is within a few ulps of the
//!   double-double format (relative error ~2^-104).
//! - `/` uses three rounds of long division, same error bound.
//! - `round_to_i128` rounds half away from zero. Nothing else in the crate
//!   discards sub-nanosecond precision.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Double-double precision value.
#[derive(Debug, Clone, Copy, Default)]
pub struct HpFloat {
    hi: f64,
    lo: f64,
}

// =============================================================================
// ERROR-FREE TRANSFORMS
// =============================================================================

/// `a + b` as `(s, e)` with `s = fl(a + b)` and `a + b = s + e` exactly.
#[inline]
fn two_sum(a: f64, b: f64) -> (f64, f64) {
    let s = a + b;
    let bb = s - a;
    let e = (a - (s - bb)) + (b - bb);
    (s, e)
}

/// Same as `two_sum` but requires `|a| >= |b|`.
#[inline]
fn quick_two_sum(a: f64, b: f64) -> (f64, f64) {
    let s = a + b;
    let e = b - (s - a);
    (s, e)
}

/// `a * b` as `(p, e)` with `a * b = p + e` exactly (FMA based).
#[inline]
fn two_prod(a: f64, b: f64) -> (f64, f64) {
    let p = a * b;
    let e = a.mul_add(b, -p);
    (p, e)
}

impl HpFloat {
    pub const ZERO: HpFloat = HpFloat { hi: 0.0, lo: 0.0 };
    pub const ONE: HpFloat = HpFloat { hi: 1.0, lo: 0.0 };

    /// Build from an already-normalized pair.
    #[inline]
    fn from_parts(hi: f64, lo: f64) -> Self {
        let (hi, lo) = quick_two_sum(hi, lo);
        Self { hi, lo }
    }

    #[inline]
    pub fn from_f64(value: f64) -> Self {
        Self { hi: value, lo: 0.0 }
    }

    /// Exact for `|value| < 2^106`.
    pub fn from_i128(value: i128) -> Self {
        let hi = value as f64;
        // `hi` is an integer-valued f64 so the cast back is exact.
        let rest = value - hi as i128;
        Self::from_parts(hi, rest as f64)
    }

    #[inline]
    pub fn from_u64(value: u64) -> Self {
        Self::from_i128(value as i128)
    }

    #[inline]
    pub fn from_i64(value: i64) -> Self {
        Self::from_i128(value as i128)
    }

    /// High component (nearest f64 to the value).
    #[inline]
    pub fn hi(&self) -> f64 {
        self.hi
    }

    /// Nearest f64; loses the low component.
    #[inline]
    pub fn to_f64(&self) -> f64 {
        self.hi + self.lo
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.hi.is_finite() && self.lo.is_finite()
    }

    #[inline]
    pub fn is_sign_negative(&self) -> bool {
        self.hi < 0.0 || (self.hi == 0.0 && self.lo < 0.0)
    }

    /// Largest integer not greater than the value.
    pub fn floor(&self) -> Self {
        let fh = self.hi.floor();
        if fh == self.hi {
            // hi already integral: the fractional part lives in lo.
            Self::from_parts(fh, self.lo.floor())
        } else {
            Self { hi: fh, lo: 0.0 }
        }
    }

    /// Round half away from zero, returned as an exact integer.
    ///
    /// Returns `None` for non-finite values or values outside `i128`.
    pub fn round_to_i128(&self) -> Option<i128> {
        if !self.is_finite() {
            return None;
        }
        let half = HpFloat::from_f64(0.5);
        let rounded = if self.is_sign_negative() {
            -((-*self) + half).floor()
        } else {
            (*self + half).floor()
        };
        // Both parts are integral after floor; i128 holds 2^106 easily.
        if rounded.hi.abs() >= 1.0e38 {
            return None;
        }
        Some(rounded.hi as i128 + rounded.lo as i128)
    }
}

// =============================================================================
// ARITHMETIC
// =============================================================================

impl Add for HpFloat {
    type Output = HpFloat;

    fn add(self, rhs: HpFloat) -> HpFloat {
        let (s, e) = two_sum(self.hi, rhs.hi);
        let (t, f) = two_sum(self.lo, rhs.lo);
        let (s, e) = quick_two_sum(s, e + t);
        HpFloat::from_parts(s, e + f)
    }
}

impl Neg for HpFloat {
    type Output = HpFloat;

    #[inline]
    fn neg(self) -> HpFloat {
        HpFloat {
            hi: -self.hi,
            lo: -self.lo,
        }
    }
}

impl Sub for HpFloat {
    type Output = HpFloat;

    #[inline]
    fn sub(self, rhs: HpFloat) -> HpFloat {
        self + (-rhs)
    }
}

impl Mul for HpFloat {
    type Output = HpFloat;

    fn mul(self, rhs: HpFloat) -> HpFloat {
        let (p, e) = two_prod(self.hi, rhs.hi);
        let e = e + (self.hi * rhs.lo + self.lo * rhs.hi);
        HpFloat::from_parts(p, e)
    }
}

impl Div for HpFloat {
    type Output = HpFloat;

    fn div(self, rhs: HpFloat) -> HpFloat {
        let q1 = self.hi / rhs.hi;
        let r = self - rhs * HpFloat::from_f64(q1);
        let q2 = r.hi / rhs.hi;
        let r = r - rhs * HpFloat::from_f64(q2);
        let q3 = r.hi / rhs.hi;
        HpFloat::from_parts(q1, q2) + HpFloat::from_f64(q3)
    }
}

impl From<u64> for HpFloat {
    fn from(value: u64) -> Self {
        HpFloat::from_u64(value)
    }
}

impl From<i64> for HpFloat {
    fn from(value: i64) -> Self {
        HpFloat::from_i64(value)
    }
}

impl From<f64> for HpFloat {
    fn from(value: f64) -> Self {
        HpFloat::from_f64(value)
    }
}

// =============================================================================
// ORDERING
// =============================================================================

impl PartialEq for HpFloat {
    fn eq(&self, other: &Self) -> bool {
        self.hi == other.hi && self.lo == other.lo
    }
}

impl PartialOrd for HpFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.hi.partial_cmp(&other.hi)? {
            Ordering::Equal => self.lo.partial_cmp(&other.lo),
            ord => Some(ord),
        }
    }
}

impl fmt::Display for HpFloat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.round_to_i128() {
            Some(whole) => {
                let frac = (*self - HpFloat::from_i128(whole)).to_f64();
                write!(f, "{}{:+.3e}", whole, frac)
            }
            None => write!(f, "{}", self.to_f64()),
        }
    }
}
