//! Balance transitions
//!
//! A [`Balance`] is the parsed form of a [`BatchBalance`] record. All
//! transitions are pure: they take the current value and return the
//! replacement, so a failed item leaves nothing half-applied.
//!
//! # Invariants
//!
//! - `tradable`, `retired` and `escrowed` are never negative, not even as
//!   intermediate values
//! - Retirement is permanent: nothing moves credits out of `retired`

use crate::{
    amount::CreditAmount,
    types::{AccountId, BatchBalance},
    Error, Result,
};

/// Tradable / retired / escrowed credits of one owner for one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    /// Credits available to send, retire, cancel or escrow
    pub tradable: CreditAmount,
    /// Retired credits
    pub retired: CreditAmount,
    /// Credits locked in escrow
    pub escrowed: CreditAmount,
}

impl Balance {
    /// Empty balance
    pub fn zero(precision: u32) -> Self {
        Self {
            tradable: CreditAmount::zero(precision),
            retired: CreditAmount::zero(precision),
            escrowed: CreditAmount::zero(precision),
        }
    }

    /// Parse a stored record
    pub fn from_record(record: &BatchBalance, precision: u32) -> Result<Self> {
        Ok(Self {
            tradable: CreditAmount::parse(&record.tradable_amount, precision)?,
            retired: CreditAmount::parse(&record.retired_amount, precision)?,
            escrowed: CreditAmount::parse(&record.escrowed_amount, precision)?,
        })
    }

    /// Format into a record for storage
    pub fn to_record(&self, address: &AccountId, batch_denom: &str) -> BatchBalance {
        BatchBalance {
            address: address.clone(),
            batch_denom: batch_denom.to_string(),
            tradable_amount: self.tradable.to_string(),
            retired_amount: self.retired.to_string(),
            escrowed_amount: self.escrowed.to_string(),
        }
    }

    /// Remove tradable credits
    pub fn debit_tradable(&self, amount: &CreditAmount) -> Result<Self> {
        let tradable = sub_available(&self.tradable, amount, "tradable")?;
        Ok(Self { tradable, ..*self })
    }

    /// Add tradable credits
    pub fn credit_tradable(&self, amount: &CreditAmount) -> Result<Self> {
        Ok(Self {
            tradable: self.tradable.add(amount)?,
            ..*self
        })
    }

    /// Add retired credits
    pub fn credit_retired(&self, amount: &CreditAmount) -> Result<Self> {
        Ok(Self {
            retired: self.retired.add(amount)?,
            ..*self
        })
    }

    /// Move credits from tradable to retired
    ///
    /// WARNING: retirement is permanent, there is no inverse operation.
    pub fn retire(&self, amount: &CreditAmount) -> Result<Self> {
        self.debit_tradable(amount)?.credit_retired(amount)
    }

    /// Remove tradable credits from circulation (balance side of a cancel)
    pub fn cancel(&self, amount: &CreditAmount) -> Result<Self> {
        self.debit_tradable(amount)
    }

    /// Lock tradable credits in escrow
    pub fn escrow(&self, amount: &CreditAmount) -> Result<Self> {
        let tradable = sub_available(&self.tradable, amount, "tradable")?;
        let escrowed = self.escrowed.add(amount)?;
        Ok(Self {
            tradable,
            escrowed,
            ..*self
        })
    }

    /// Return escrowed credits to tradable
    pub fn release_escrow(&self, amount: &CreditAmount) -> Result<Self> {
        let escrowed = sub_available(&self.escrowed, amount, "escrowed")?;
        let tradable = self.tradable.add(amount)?;
        Ok(Self {
            tradable,
            escrowed,
            ..*self
        })
    }

    /// Move tradable credits between two owners
    ///
    /// Supply is untouched: the batch total does not change.
    pub fn transfer(from: &Balance, to: &Balance, amount: &CreditAmount) -> Result<(Balance, Balance)> {
        let from = from.debit_tradable(amount)?;
        let to = to.credit_tradable(amount)?;
        Ok((from, to))
    }
}

/// Domain-level subtraction: a shortfall is reported with both amounts
fn sub_available(available: &CreditAmount, requested: &CreditAmount, field: &'static str) -> Result<CreditAmount> {
    if requested.cmp_value(available).is_gt() {
        return Err(Error::InsufficientBalance {
            field,
            requested: requested.to_string(),
            available: available.to_string(),
        });
    }
    available.sub(requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> CreditAmount {
        CreditAmount::parse(s, 6).unwrap()
    }

    fn balance(tradable: &str, retired: &str, escrowed: &str) -> Balance {
        Balance {
            tradable: amt(tradable),
            retired: amt(retired),
            escrowed: amt(escrowed),
        }
    }

    #[test]
    fn test_retire_moves_tradable_to_retired() {
        let before = balance("100.000000", "0", "0");
        let after = before.retire(&amt("30.000000")).unwrap();

        let record = after.to_record(&AccountId::new("regen1owner"), "C01-001");
        assert_eq!(record.tradable_amount, "70.000000");
        assert_eq!(record.retired_amount, "30.000000");
        assert_eq!(record.escrowed_amount, "0");
    }

    #[test]
    fn test_retire_more_than_tradable() {
        let before = balance("70.000000", "30.000000", "0");
        match before.retire(&amt("80.000000")) {
            Err(Error::InsufficientBalance { field, requested, available }) => {
                assert_eq!(field, "tradable");
                assert_eq!(requested, "80.000000");
                assert_eq!(available, "70.000000");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_escrowed_credits_are_not_retirable() {
        let before = balance("10", "0", "90");
        assert!(before.retire(&amt("11")).is_err());
        assert!(before.cancel(&amt("11")).is_err());
    }

    #[test]
    fn test_escrow_and_release() {
        let before = balance("10", "0", "0");
        let locked = before.escrow(&amt("4")).unwrap();
        assert_eq!(locked, balance("6", "0", "4"));

        let released = locked.release_escrow(&amt("4")).unwrap();
        assert!(released.tradable.cmp_value(&amt("10")).is_eq());
        assert!(released.escrowed.is_zero());

        assert!(matches!(
            locked.release_escrow(&amt("5")),
            Err(Error::InsufficientBalance { field: "escrowed", .. })
        ));
        assert!(matches!(
            locked.escrow(&amt("7")),
            Err(Error::InsufficientBalance { field: "tradable", .. })
        ));
    }

    #[test]
    fn test_transfer_conserves_total() {
        let from = balance("10.5", "1", "0");
        let to = Balance::zero(6);

        let (from, to) = Balance::transfer(&from, &to, &amt("4.25")).unwrap();
        assert_eq!(from.tradable.to_string(), "6.25");
        assert_eq!(to.tradable.to_string(), "4.25");
        assert_eq!(from.retired.to_string(), "1");

        let total = from.tradable.add(&to.tradable).unwrap();
        assert!(total.cmp_value(&amt("10.5")).is_eq());
    }

    #[test]
    fn test_record_round_trip() {
        let record = BatchBalance {
            address: AccountId::new("regen1owner"),
            batch_denom: "C01-001".to_string(),
            tradable_amount: "1.5".to_string(),
            retired_amount: "2".to_string(),
            escrowed_amount: "0.000001".to_string(),
        };
        let parsed = Balance::from_record(&record, 6).unwrap();
        assert_eq!(parsed.to_record(&record.address, "C01-001"), record);
    }

    #[test]
    fn test_corrupt_record_is_rejected() {
        let record = BatchBalance {
            address: AccountId::new("regen1owner"),
            batch_denom: "C01-001".to_string(),
            tradable_amount: "-1".to_string(),
            retired_amount: "0".to_string(),
            escrowed_amount: "0".to_string(),
        };
        assert!(Balance::from_record(&record, 6).is_err());
    }
}
