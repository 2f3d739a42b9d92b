//! Non-negative credit amounts
//!
//! A [`CreditAmount`] is a [`Dec`] that is never negative and never carries
//! more fractional digits than the precision of its credit type. Every
//! constructor and every arithmetic result is checked; nothing is clamped.

use crate::{decimal::Dec, Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// Non-negative decimal tagged with a credit-type precision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditAmount {
    value: Dec,
    precision: u32,
}

impl CreditAmount {
    /// Zero at the given precision
    pub fn zero(precision: u32) -> Self {
        Self {
            value: Dec::ZERO,
            precision,
        }
    }

    /// Parse a decimal string, checking sign and precision
    pub fn parse(s: &str, precision: u32) -> Result<Self> {
        let value: Dec = s.parse()?;
        Self::from_dec(value, precision)
    }

    /// Wrap an already parsed decimal, checking sign and precision
    pub fn from_dec(value: Dec, precision: u32) -> Result<Self> {
        if value.is_negative() {
            return Err(Error::Negative(value.to_string()));
        }
        if value.num_decimal_places() > precision {
            return Err(Error::PrecisionExceeded {
                value: value.to_string(),
                precision,
            });
        }
        Ok(Self { value, precision })
    }

    /// Checked addition
    pub fn add(&self, other: &CreditAmount) -> Result<CreditAmount> {
        let sum = self.value.add(&other.value)?;
        Self::from_dec(sum, self.precision)
    }

    /// Checked subtraction; fails instead of going below zero
    pub fn sub(&self, other: &CreditAmount) -> Result<CreditAmount> {
        if other.value > self.value {
            return Err(Error::NegativeResult {
                lhs: self.to_string(),
                rhs: other.to_string(),
            });
        }
        let diff = self.value.sub(&other.value)?;
        Self::from_dec(diff, self.precision)
    }

    /// Decimal value
    pub fn value(&self) -> Dec {
        self.value
    }

    /// Maximum fractional digits
    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// True for zero
    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// True for anything above zero
    pub fn is_positive(&self) -> bool {
        !self.value.is_zero()
    }

    /// Compare values, ignoring precision
    pub fn cmp_value(&self, other: &CreditAmount) -> Ordering {
        self.value.cmp(&other.value)
    }

    /// Smaller of two amounts
    pub fn min(self, other: CreditAmount) -> CreditAmount {
        match self.cmp_value(&other) {
            Ordering::Greater => other,
            _ => self,
        }
    }
}

impl fmt::Display for CreditAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}
