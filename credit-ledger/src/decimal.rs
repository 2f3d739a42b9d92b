//! Fixed-precision decimal arithmetic
//!
//! [`Dec`] wraps `rust_decimal::Decimal` (96-bit mantissa, scale 0..=28) and
//! only exposes operations that are exact. Anything that would need rounding
//! fails instead, except the explicit truncation helpers used when an integral
//! token amount or a credit-precision amount has to be extracted.

use crate::{Error, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest scale a [`Dec`] can carry
pub const MAX_SCALE: u32 = 28;

/// Exact signed decimal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dec(Decimal);

impl Dec {
    /// Zero
    pub const ZERO: Dec = Dec(Decimal::ZERO);

    /// Integer value
    pub fn from_integer(value: u128) -> Result<Self> {
        let value = i128::try_from(value)
            .map_err(|_| Error::Overflow(format!("{} does not fit a decimal", value)))?;
        Decimal::try_from_i128_with_scale(value, 0)
            .map(Dec)
            .map_err(|_| Error::Overflow(format!("{} does not fit a decimal", value)))
    }

    /// `mantissa * 10^-scale`
    pub fn from_scaled(mantissa: u128, scale: u32) -> Result<Self> {
        if scale > MAX_SCALE {
            return Err(Error::PrecisionExceeded {
                value: format!("{}e-{}", mantissa, scale),
                precision: MAX_SCALE,
            });
        }
        let mantissa = i128::try_from(mantissa)
            .map_err(|_| Error::Overflow(format!("{}e-{} does not fit a decimal", mantissa, scale)))?;
        Decimal::try_from_i128_with_scale(mantissa, scale)
            .map(Dec)
            .map_err(|_| Error::Overflow(format!("{}e-{} does not fit a decimal", mantissa, scale)))
    }

    /// `10^exponent`
    pub fn pow10(exponent: u32) -> Result<Self> {
        10u128
            .checked_pow(exponent)
            .ok_or_else(|| Error::Overflow(format!("10^{} does not fit a decimal", exponent)))
            .and_then(Dec::from_integer)
    }

    /// Exact addition
    pub fn add(&self, other: &Dec) -> Result<Dec> {
        self.0
            .checked_add(other.0)
            .map(Dec)
            .ok_or_else(|| Error::Overflow(format!("{} + {}", self, other)))
    }

    /// Exact subtraction
    pub fn sub(&self, other: &Dec) -> Result<Dec> {
        self.0
            .checked_sub(other.0)
            .map(Dec)
            .ok_or_else(|| Error::Overflow(format!("{} - {}", self, other)))
    }

    /// Exact multiplication
    ///
    /// `rust_decimal` silently rounds a product whose mantissa does not fit 96
    /// bits; that case is reported as an overflow here.
    pub fn mul_exact(&self, other: &Dec) -> Result<Dec> {
        let lhs = self.0.normalize();
        let rhs = other.0.normalize();
        let scale = lhs.scale() + rhs.scale();
        if scale > MAX_SCALE {
            return Err(Error::PrecisionExceeded {
                value: format!("{} * {}", self, other),
                precision: MAX_SCALE,
            });
        }

        let product = lhs
            .checked_mul(rhs)
            .ok_or_else(|| Error::Overflow(format!("{} * {}", self, other)))?;
        if product.scale() != scale {
            return Err(Error::Overflow(format!(
                "{} * {} is not exactly representable",
                self, other
            )));
        }
        Ok(Dec(product))
    }

    /// Fractional digits, ignoring trailing zeros
    pub fn num_decimal_places(&self) -> u32 {
        self.0.normalize().scale()
    }

    /// Truncate toward zero to `places` fractional digits
    pub fn trunc_to_places(&self, places: u32) -> Dec {
        Dec(self.0.round_dp_with_strategy(places, RoundingStrategy::ToZero))
    }

    /// Integer part, truncated toward zero
    pub fn trunc_to_u128(&self) -> Result<u128> {
        if self.is_negative() {
            return Err(Error::Negative(self.to_string()));
        }
        let integral = self.0.trunc();
        let mut mantissa = integral.mantissa();
        for _ in 0..integral.scale() {
            mantissa /= 10;
        }
        u128::try_from(mantissa).map_err(|_| Error::Overflow(self.to_string()))
    }

    /// True for values strictly below zero
    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// True for zero
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Underlying `rust_decimal` value
    pub fn inner(&self) -> Decimal {
        self.0
    }
}

impl From<Decimal> for Dec {
    fn from(value: Decimal) -> Self {
        Dec(value)
    }
}

impl FromStr for Dec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::Parse("empty decimal string".to_string()));
        }
        // rust_decimal tolerates digit separators; amounts on the wire never carry them
        if s.trim() != s || s.contains('_') {
            return Err(Error::Parse(format!("invalid decimal: {:?}", s)));
        }

        Decimal::from_str_exact(s).map(Dec).map_err(|err| match err {
            rust_decimal::Error::Underflow | rust_decimal::Error::ScaleExceedsMaximumPrecision(_) => {
                Error::PrecisionExceeded {
                    value: s.to_string(),
                    precision: MAX_SCALE,
                }
            }
            rust_decimal::Error::ExceedsMaximumPossibleValue
            | rust_decimal::Error::LessThanMinimumPossibleValue => Error::Overflow(s.to_string()),
            other => {
                let msg = other.to_string();
                if msg.contains("overflow") {
                    Error::Overflow(s.to_string())
                } else {
                    Error::Parse(format!("invalid decimal {:?}: {}", s, msg))
                }
            }
        })
    }
}

impl TryFrom<String> for Dec {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Dec> for String {
    fn from(value: Dec) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Dec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Dec {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_rejects_empty_and_garbage() {
        assert!(matches!("".parse::<Dec>(), Err(Error::Parse(_))));
        assert!(matches!("abc".parse::<Dec>(), Err(Error::Parse(_))));
        assert!(matches!("1e5".parse::<Dec>(), Err(Error::Parse(_))));
        assert!(matches!(" 1".parse::<Dec>(), Err(Error::Parse(_))));
        assert!(matches!("1_000".parse::<Dec>(), Err(Error::Parse(_))));
    }

    #[test]
    fn test_parse_too_many_fractional_digits() {
        let s = format!("0.{}", "1".repeat(29));
        assert!(matches!(s.parse::<Dec>(), Err(Error::PrecisionExceeded { .. })));
    }

    #[test]
    fn test_parse_overflow() {
        let s = "9".repeat(40);
        assert!(matches!(s.parse::<Dec>(), Err(Error::Overflow(_))));
    }

    #[test]
    fn test_display_keeps_scale() {
        assert_eq!(dec("70.000000").to_string(), "70.000000");
        assert_eq!(dec("0").to_string(), "0");
        assert_eq!(dec("-1.5").to_string(), "-1.5");
    }

    #[test]
    fn test_add_sub_exact() {
        assert_eq!(dec("100.000000").sub(&dec("30.000000")).unwrap().to_string(), "70.000000");
        assert_eq!(dec("0").add(&dec("30.000000")).unwrap().to_string(), "30.000000");
        assert_eq!(dec("0.1").add(&dec("0.2")).unwrap(), dec("0.3"));
        assert!(dec("1").sub(&dec("2")).unwrap().is_negative());
    }

    #[test]
    fn test_add_overflow() {
        let max = Dec::from(Decimal::MAX);
        assert!(matches!(max.add(&dec("1")), Err(Error::Overflow(_))));
    }

    #[test]
    fn test_mul_exact() {
        assert_eq!(dec("1.5").mul_exact(&dec("2")).unwrap(), dec("3"));
        assert_eq!(dec("0.000001").mul_exact(&Dec::pow10(6).unwrap()).unwrap(), dec("1"));
        assert!(dec("1.5").mul_exact(&Dec::from(Decimal::MAX)).is_err());

        let tiny = dec("0.000000000000001");
        assert!(matches!(tiny.mul_exact(&tiny), Err(Error::PrecisionExceeded { .. })));
    }

    #[test]
    fn test_truncation() {
        assert_eq!(dec("12.999").trunc_to_u128().unwrap(), 12);
        assert_eq!(dec("0.5").trunc_to_u128().unwrap(), 0);
        assert!(dec("-1").trunc_to_u128().is_err());
        assert_eq!(dec("1.23456789").trunc_to_places(6), dec("1.234567"));
        assert_eq!(dec("1.2").trunc_to_places(6), dec("1.2"));
    }

    #[test]
    fn test_num_decimal_places_ignores_trailing_zeros() {
        assert_eq!(dec("1.500").num_decimal_places(), 1);
        assert_eq!(dec("10").num_decimal_places(), 0);
        assert_eq!(dec("0.000001").num_decimal_places(), 6);
    }

    #[test]
    fn test_scaled_construction() {
        assert_eq!(Dec::from_scaled(1_234_567, 6).unwrap(), dec("1.234567"));
        assert!(Dec::from_scaled(1, 29).is_err());
        assert!(Dec::pow10(29).is_err());
        assert_eq!(Dec::pow10(0).unwrap(), dec("1"));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&dec("12.50")).unwrap();
        assert_eq!(json, "\"12.50\"");
        let back: Dec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dec("12.5"));
        assert!(serde_json::from_str::<Dec>("\"x\"").is_err());
    }
}
