//! Batch supply bookkeeping
//!
//! The supply mirrors the sum of all balances of a batch. It is only ever
//! changed through [`Supply::apply`], in lockstep with the balance change
//! that caused the delta. Escrow is an allocation inside a balance and never
//! shows up here.

use crate::{amount::CreditAmount, types::BatchSupply, Result};

/// Change to a batch supply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplyDelta {
    /// Newly issued credits
    Issue {
        /// Issued as tradable
        tradable: CreditAmount,
        /// Issued already retired
        retired: CreditAmount,
    },
    /// Tradable credits retired
    Retire(CreditAmount),
    /// Tradable credits cancelled
    Cancel(CreditAmount),
}

/// Parsed batch supply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Supply {
    /// Total tradable credits
    pub tradable: CreditAmount,
    /// Total retired credits
    pub retired: CreditAmount,
    /// Total cancelled credits
    pub cancelled: CreditAmount,
}

impl Supply {
    /// Empty supply
    pub fn zero(precision: u32) -> Self {
        Self {
            tradable: CreditAmount::zero(precision),
            retired: CreditAmount::zero(precision),
            cancelled: CreditAmount::zero(precision),
        }
    }

    /// Parse a stored record
    pub fn from_record(record: &BatchSupply, precision: u32) -> Result<Self> {
        Ok(Self {
            tradable: CreditAmount::parse(&record.tradable_amount, precision)?,
            retired: CreditAmount::parse(&record.retired_amount, precision)?,
            cancelled: CreditAmount::parse(&record.cancelled_amount, precision)?,
        })
    }

    /// Format into a record for storage
    pub fn to_record(&self, batch_denom: &str) -> BatchSupply {
        BatchSupply {
            batch_denom: batch_denom.to_string(),
            tradable_amount: self.tradable.to_string(),
            retired_amount: self.retired.to_string(),
            cancelled_amount: self.cancelled.to_string(),
        }
    }

    /// Apply a delta, returning the new supply
    ///
    /// A supply that would go negative means the balances and the supply
    /// disagree; the subtraction fails with `NegativeResult`.
    pub fn apply(&self, delta: SupplyDelta) -> Result<Self> {
        match delta {
            SupplyDelta::Issue { tradable, retired } => Ok(Self {
                tradable: self.tradable.add(&tradable)?,
                retired: self.retired.add(&retired)?,
                ..*self
            }),
            SupplyDelta::Retire(amount) => Ok(Self {
                tradable: self.tradable.sub(&amount)?,
                retired: self.retired.add(&amount)?,
                ..*self
            }),
            SupplyDelta::Cancel(amount) => Ok(Self {
                tradable: self.tradable.sub(&amount)?,
                cancelled: self.cancelled.add(&amount)?,
                ..*self
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn amt(s: &str) -> CreditAmount {
        CreditAmount::parse(s, 6).unwrap()
    }

    #[test]
    fn test_issue_then_retire() {
        let supply = Supply::zero(6)
            .apply(SupplyDelta::Issue {
                tradable: amt("100.000000"),
                retired: amt("5"),
            })
            .unwrap()
            .apply(SupplyDelta::Retire(amt("30.000000")))
            .unwrap();

        let record = supply.to_record("C01-001");
        assert_eq!(record.tradable_amount, "70.000000");
        assert_eq!(record.retired_amount, "35.000000");
        assert_eq!(record.cancelled_amount, "0");
    }

    #[test]
    fn test_cancel() {
        let supply = Supply {
            tradable: amt("10"),
            retired: amt("0"),
            cancelled: amt("1"),
        };
        let after = supply.apply(SupplyDelta::Cancel(amt("4"))).unwrap();
        assert_eq!(after.tradable.to_string(), "6");
        assert_eq!(after.cancelled.to_string(), "5");
        assert_eq!(after.retired, supply.retired);
    }

    #[test]
    fn test_supply_never_negative() {
        let supply = Supply::zero(6);
        assert!(matches!(
            supply.apply(SupplyDelta::Retire(amt("1"))),
            Err(Error::NegativeResult { .. })
        ));
        assert!(matches!(
            supply.apply(SupplyDelta::Cancel(amt("1"))),
            Err(Error::NegativeResult { .. })
        ));
    }
}
