//! Fixed-point token amounts
//!
//! A [`TokenAmount`] is an arbitrary-precision count of sub-units, with
//! 10^18 sub-units per whole unit, plus a distinguished NaN state. Malformed
//! input parses to NaN and NaN propagates through arithmetic, so ingestion
//! never halts on a pathological amount.
//!
//! Unlike IEEE floats, `NaN == NaN` holds.

use crate::error::{Error, Result};
use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Number of fractional decimal digits
pub const DECIMAL_PRECISION: usize = 18;

/// Total decimal digits the store can hold for an amount
pub const MAX_STORAGE_PRECISION: usize = 1000;

/// `floor((MAX_STORAGE_PRECISION - 1) * log256(10))`: the largest two's-complement
/// byte length guaranteed to fit in [`MAX_STORAGE_PRECISION`] digits
pub const MAX_SAFE_BYTE_LENGTH: usize = 414;

/// Literal used for NaN in every string form
pub const NAN_TOKEN: &str = "NaN";

const SUB_UNITS_PER_UNIT: u64 = 1_000_000_000_000_000_000;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Repr {
    Finite(BigInt),
    NaN,
}

/// Signed fixed-point amount with 18 fractional digits
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TokenAmount(Repr);

fn divisor() -> BigInt {
    BigInt::from(SUB_UNITS_PER_UNIT)
}

/// Parses a non-empty run of ASCII digits. Signs, whitespace and separators are rejected.
fn parse_digits(digits: &str) -> Option<BigInt> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    BigInt::parse_bytes(digits.as_bytes(), 10)
}

impl TokenAmount {
    /// Zero
    pub fn zero() -> Self {
        Self(Repr::Finite(BigInt::zero()))
    }

    /// The NaN amount
    pub fn nan() -> Self {
        Self(Repr::NaN)
    }

    /// Exactly one whole unit
    pub fn one_full_unit() -> Self {
        Self(Repr::Finite(divisor()))
    }

    /// Wraps a raw sub-unit count
    pub fn from_sub_units(sub_units: impl Into<BigInt>) -> Self {
        Self(Repr::Finite(sub_units.into()))
    }

    /// Whole units, scaled up to sub-units
    pub fn from_whole_units(whole_units: impl Into<BigInt>) -> Self {
        Self(Repr::Finite(whole_units.into() * divisor()))
    }

    /// Parses a signed integer count of sub-units, NaN if malformed
    pub fn from_sub_units_str(s: &str) -> Self {
        let (is_negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        match parse_digits(digits) {
            Some(value) if is_negative => Self(Repr::Finite(-value)),
            Some(value) => Self(Repr::Finite(value)),
            None => Self::nan(),
        }
    }

    /// Builds an amount from unsigned whole and fractional digit strings.
    ///
    /// The sign is carried by `is_negative`; a signed or non-numeric part gives NaN.
    /// Fractional digits beyond the 18th are truncated, never rounded.
    pub fn from_string_parts(is_negative: bool, whole: &str, fractional: &str) -> Self {
        let whole = if whole.is_empty() { "0" } else { whole };
        let fractional = if fractional.is_empty() {
            "0".repeat(DECIMAL_PRECISION)
        } else {
            let truncated: String = fractional.chars().take(DECIMAL_PRECISION).collect();
            format!("{:0<width$}", truncated, width = DECIMAL_PRECISION)
        };

        let (Some(whole_units), Some(sub_units)) = (parse_digits(whole), parse_digits(&fractional))
        else {
            return Self::nan();
        };

        let value = whole_units * divisor() + sub_units;
        Self(Repr::Finite(if is_negative { -value } else { value }))
    }

    /// Parses `[-]digits[.digits]` or the literal `NaN`.
    ///
    /// Anything else, including `Infinity`, parses to NaN.
    pub fn from_decimal_str(s: &str) -> Self {
        if s.is_empty() || s == NAN_TOKEN {
            return Self::nan();
        }

        let (is_negative, unsigned) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let mut parts = unsigned.split('.');
        let whole = parts.next().unwrap_or_default();
        let fractional = parts.next().unwrap_or_default();
        if parts.next().is_some() {
            return Self::nan();
        }

        Self::from_string_parts(is_negative, whole, fractional)
    }

    /// True for the NaN amount
    pub fn is_nan(&self) -> bool {
        matches!(self.0, Repr::NaN)
    }

    /// False for NaN
    pub fn is_zero(&self) -> bool {
        matches!(&self.0, Repr::Finite(v) if v.is_zero())
    }

    /// False for NaN
    pub fn is_positive(&self) -> bool {
        matches!(&self.0, Repr::Finite(v) if v.is_positive())
    }

    /// False for NaN
    pub fn is_negative(&self) -> bool {
        matches!(&self.0, Repr::Finite(v) if v.is_negative())
    }

    /// Whether the value fits the store's maximum precision. NaN is never safe.
    pub fn is_storage_safe(&self) -> bool {
        match &self.0 {
            Repr::Finite(v) => v.to_signed_bytes_le().len() <= MAX_SAFE_BYTE_LENGTH,
            Repr::NaN => false,
        }
    }

    /// Raw sub-units; errors on NaN
    pub fn sub_units(&self) -> Result<&BigInt> {
        match &self.0 {
            Repr::Finite(v) => Ok(v),
            Repr::NaN => Err(Error::Arithmetic(
                "cannot extract sub-units from NaN".to_string(),
            )),
        }
    }

    /// Raw sub-units; errors on NaN and on values the store cannot hold
    pub fn storage_safe_sub_units(&self) -> Result<&BigInt> {
        let sub_units = self.sub_units()?;
        if !self.is_storage_safe() {
            return Err(Error::Arithmetic(format!(
                "amount exceeds storage precision of {} digits",
                MAX_STORAGE_PRECISION
            )));
        }
        Ok(sub_units)
    }

    /// The smaller of two amounts; NaN if either is NaN
    pub fn min(&self, other: &Self) -> Self {
        combine(self, other, |a, b| a.min(b).clone())
    }

    /// The larger of two amounts; NaN if either is NaN
    pub fn max(&self, other: &Self) -> Self {
        combine(self, other, |a, b| a.max(b).clone())
    }

    /// Always emits all 18 fractional digits
    pub fn to_full_precision_string(&self) -> String {
        match self.split() {
            Some((negative, whole, fraction)) => format!(
                "{}{}.{:0>width$}",
                if negative { "-" } else { "" },
                whole,
                fraction,
                width = DECIMAL_PRECISION
            ),
            None => NAN_TOKEN.to_string(),
        }
    }

    /// `NaN` for NaN or storage-unsafe values, otherwise the shortest form
    pub fn to_storage_safe_string(&self) -> String {
        if self.is_storage_safe() {
            self.to_string()
        } else {
            NAN_TOKEN.to_string()
        }
    }

    /// Sign, absolute whole part and absolute fractional sub-units
    fn split(&self) -> Option<(bool, BigInt, BigInt)> {
        let Repr::Finite(value) = &self.0 else {
            return None;
        };
        let divisor = divisor();
        let whole = value / &divisor;
        let fraction = value % &divisor;
        let negative = whole.is_negative() || fraction.is_negative();
        Some((negative, whole.abs(), fraction.abs()))
    }
}

impl Default for TokenAmount {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((negative, whole, fraction)) = self.split() else {
            return f.write_str(NAN_TOKEN);
        };
        let sign = if negative { "-" } else { "" };
        if fraction.is_zero() {
            return write!(f, "{}{}", sign, whole);
        }
        let padded = format!("{:0>width$}", fraction, width = DECIMAL_PRECISION);
        write!(f, "{}{}.{}", sign, whole, padded.trim_end_matches('0'))
    }
}

// NaN orders equal to itself and is unordered against finite values.
impl PartialOrd for TokenAmount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (&self.0, &other.0) {
            (Repr::Finite(a), Repr::Finite(b)) => Some(a.cmp(b)),
            (Repr::NaN, Repr::NaN) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

fn combine(
    lhs: &TokenAmount,
    rhs: &TokenAmount,
    op: impl FnOnce(&BigInt, &BigInt) -> BigInt,
) -> TokenAmount {
    match (&lhs.0, &rhs.0) {
        (Repr::Finite(a), Repr::Finite(b)) => TokenAmount(Repr::Finite(op(a, b))),
        _ => TokenAmount::nan(),
    }
}

impl Add<&TokenAmount> for &TokenAmount {
    type Output = TokenAmount;

    fn add(self, rhs: &TokenAmount) -> TokenAmount {
        combine(self, rhs, |a, b| a + b)
    }
}

impl Add for TokenAmount {
    type Output = TokenAmount;

    fn add(self, rhs: TokenAmount) -> TokenAmount {
        &self + &rhs
    }
}

impl Sub<&TokenAmount> for &TokenAmount {
    type Output = TokenAmount;

    fn sub(self, rhs: &TokenAmount) -> TokenAmount {
        combine(self, rhs, |a, b| a - b)
    }
}

impl Sub for TokenAmount {
    type Output = TokenAmount;

    fn sub(self, rhs: TokenAmount) -> TokenAmount {
        &self - &rhs
    }
}

// Fixed-point product, truncated toward zero at the 18th fractional digit.
impl Mul<&TokenAmount> for &TokenAmount {
    type Output = TokenAmount;

    fn mul(self, rhs: &TokenAmount) -> TokenAmount {
        combine(self, rhs, |a, b| (a * b) / divisor())
    }
}

impl Mul for TokenAmount {
    type Output = TokenAmount;

    fn mul(self, rhs: TokenAmount) -> TokenAmount {
        &self * &rhs
    }
}

// Fixed-point quotient, truncated toward zero. Division by zero gives NaN.
impl Div<&TokenAmount> for &TokenAmount {
    type Output = TokenAmount;

    fn div(self, rhs: &TokenAmount) -> TokenAmount {
        if rhs.is_zero() {
            return TokenAmount::nan();
        }
        combine(self, rhs, |a, b| (a * divisor()) / b)
    }
}

impl Div for TokenAmount {
    type Output = TokenAmount;

    fn div(self, rhs: TokenAmount) -> TokenAmount {
        &self / &rhs
    }
}

impl AddAssign<&TokenAmount> for TokenAmount {
    fn add_assign(&mut self, rhs: &TokenAmount) {
        *self = &*self + rhs;
    }
}

impl SubAssign<&TokenAmount> for TokenAmount {
    fn sub_assign(&mut self, rhs: &TokenAmount) {
        *self = &*self - rhs;
    }
}

impl Neg for &TokenAmount {
    type Output = TokenAmount;

    fn neg(self) -> TokenAmount {
        match &self.0 {
            Repr::Finite(v) => TokenAmount(Repr::Finite(-v)),
            Repr::NaN => TokenAmount::nan(),
        }
    }
}

impl Neg for TokenAmount {
    type Output = TokenAmount;

    fn neg(self) -> TokenAmount {
        -&self
    }
}

// Persisted in full. Readers that need the storage bound apply
// `to_storage_safe_string` themselves, so substate contents round-trip exactly.
impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_decimal_str(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_string_parts() {
        let cases = [
            (false, "123", "", "123"),
            (false, "", "12", "0.12"),
            (false, "000", "13444", "0.13444"),
            (false, "0", "0", "0"),
            (false, "11", "000000000000000009", "11.000000000000000009"),
            (false, "11", "0000000000000000009", "11"),
            (false, "123.34", "", "NaN"),
            (false, "ab", "cd", "NaN"),
            (true, "1", "0", "-1"),
            (true, "-1", "0", "NaN"),
            (false, "12", "-3", "NaN"),
        ];

        for (negative, whole, fractional, expected) in cases {
            assert_eq!(
                TokenAmount::from_string_parts(negative, whole, fractional).to_string(),
                expected,
                "parts ({}, {:?}, {:?})",
                negative,
                whole,
                fractional
            );
        }
    }

    #[test]
    fn test_from_decimal_str() {
        let cases = [
            ("000.13444", "0.13444"),
            ("0.0", "0"),
            ("11.0000000000000000019", "11.000000000000000001"),
            ("Infinity", "NaN"),
            ("-Infinity", "NaN"),
            ("NaN", "NaN"),
            ("", "NaN"),
            ("1.2.3", "NaN"),
            ("-0.0000000000000000019", "-0.000000000000000001"),
            ("-0.0000000000000000007", "0"),
        ];

        for (input, expected) in cases {
            assert_eq!(TokenAmount::from_decimal_str(input).to_string(), expected, "input {:?}", input);
        }
    }

    #[test]
    fn test_full_precision_string() {
        let cases = [
            ("0", "0.000000000000000000"),
            ("12345678900123456789", "12.345678900123456789"),
            ("-123", "-0.000000000000000123"),
            ("-1234567890012345678", "-1.234567890012345678"),
        ];

        for (sub_units, expected) in cases {
            assert_eq!(TokenAmount::from_sub_units_str(sub_units).to_full_precision_string(), expected);
        }
    }

    #[test]
    fn test_nan_semantics() {
        let nan = TokenAmount::nan();
        let one = TokenAmount::one_full_unit();

        assert_eq!(nan, TokenAmount::nan());
        assert_ne!(nan, one);
        assert!((&nan + &one).is_nan());
        assert!((&one - &nan).is_nan());
        assert!((-&nan).is_nan());
        assert!(nan.sub_units().is_err());
        assert!(!nan.is_zero() && !nan.is_positive() && !nan.is_negative());
        assert_eq!(nan.partial_cmp(&one), None);
    }

    #[test]
    fn test_arithmetic_is_exact() {
        let a = TokenAmount::from_decimal_str("0.1");
        let b = TokenAmount::from_decimal_str("0.2");
        assert_eq!((&a + &b).to_string(), "0.3");
        assert_eq!((&a - &b).to_string(), "-0.1");
        assert!((&a - &b).is_negative());
        assert!(a < b);
    }

    #[test]
    fn test_storage_safety_bound() {
        let inside = TokenAmount::from_sub_units(num_traits::pow(BigInt::from(10), 995));
        assert!(inside.is_storage_safe());
        assert_eq!(inside.to_storage_safe_string(), format!("1{}", "0".repeat(977)));
        assert!(inside.storage_safe_sub_units().is_ok());

        let outside = TokenAmount::from_sub_units(num_traits::pow(BigInt::from(10), 1000));
        assert!(!outside.is_storage_safe());
        assert_eq!(outside.to_storage_safe_string(), "NaN");
        assert!(outside.sub_units().is_ok());
        assert!(outside.storage_safe_sub_units().is_err());
    }

    #[test]
    fn test_serde_uses_decimal_string() {
        let amount = TokenAmount::from_decimal_str("-42.5");
        let bytes = bincode::serialize(&amount).unwrap();
        let decoded: TokenAmount = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, amount);

        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"-42.5\"");
        assert_eq!(serde_json::to_string(&TokenAmount::nan()).unwrap(), "\"NaN\"");
        let parsed: TokenAmount = serde_json::from_str("\"0.000000000000000001\"").unwrap();
        assert_eq!(parsed, TokenAmount::from_sub_units(1));
    }

    #[test]
    fn test_serde_keeps_storage_unsafe_amounts() {
        let huge = TokenAmount::from_sub_units(num_traits::pow(BigInt::from(10), 1000));
        assert!(!huge.is_storage_safe());

        let bytes = bincode::serialize(&huge).unwrap();
        let decoded: TokenAmount = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, huge);
        assert!(!decoded.is_nan());
        assert_eq!(decoded.to_storage_safe_string(), "NaN");
    }

    #[test]
    fn test_multiply_and_divide() {
        let a = TokenAmount::from_decimal_str("1.5");
        let b = TokenAmount::from_decimal_str("-0.2");
        assert_eq!((&a * &b).to_string(), "-0.3");
        assert_eq!((&a / &b).to_string(), "-7.5");

        let tiny = TokenAmount::from_sub_units(3);
        let half = TokenAmount::from_decimal_str("0.5");
        assert_eq!((&tiny * &half).to_string(), "0.000000000000000001");
        let third = TokenAmount::one_full_unit() / TokenAmount::from_whole_units(3);
        assert_eq!(third.to_string(), "0.333333333333333333");

        assert!((&a / &TokenAmount::zero()).is_nan());
        assert!((&a * &TokenAmount::nan()).is_nan());
        assert!((TokenAmount::nan() / a).is_nan());
    }

    #[test]
    fn test_min_max() {
        let low = TokenAmount::from_decimal_str("-1");
        let high = TokenAmount::from_decimal_str("2.5");
        assert_eq!(low.min(&high), low);
        assert_eq!(high.min(&low), low);
        assert_eq!(low.max(&high), high);
        assert!(low.max(&TokenAmount::nan()).is_nan());
        assert!(TokenAmount::nan().min(&high).is_nan());
    }
}
