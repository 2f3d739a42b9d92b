//! Core records for the credit ledger
//!
//! Records are what the storage collaborator persists. Amount fields stay
//! decimal strings on the record; the ledger parses them once when an item
//! is processed and formats them once when it stages the replacement.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of the pseudo-accounts that hold basket deposits
const BASKET_ACCOUNT_PREFIX: &str = "basket:";

/// Account identifier (bech32 address or any opaque owner id)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Pseudo-account owning the credits deposited in a basket
    pub fn basket(basket_denom: &str) -> Self {
        Self(format!("{}{}", BASKET_ACCOUNT_PREFIX, basket_denom))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for basket pseudo-accounts
    pub fn is_basket(&self) -> bool {
        self.0.starts_with(BASKET_ACCOUNT_PREFIX)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Credit type (carbon, biodiversity, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditType {
    /// Short code used in class and batch denoms ("C")
    pub abbreviation: String,
    /// Human readable name ("carbon")
    pub name: String,
    /// Measurement unit ("metric ton CO2 equivalent")
    pub unit: String,
    /// Maximum fractional digits for amounts of this type
    pub precision: u32,
}

/// Credit batch metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Batch denom ("C01-001-20200101-20210101-001")
    pub denom: String,
    /// Credit type of every credit in the batch
    pub credit_type_abbrev: String,
    /// Issuer account
    pub issuer: AccountId,
    /// Start of the monitoring period
    pub start_date: NaiveDate,
    /// End of the monitoring period
    pub end_date: NaiveDate,
    /// Opaque metadata reference
    #[serde(default)]
    pub metadata: String,
}

/// Per (account, batch) balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchBalance {
    /// Owner
    pub address: AccountId,
    /// Batch
    pub batch_denom: String,
    /// Credits that can be sent, retired or escrowed
    pub tradable_amount: String,
    /// Credits permanently retired by this owner
    pub retired_amount: String,
    /// Credits locked in escrow (sell orders)
    pub escrowed_amount: String,
}

/// Per batch aggregate supply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSupply {
    /// Batch
    pub batch_denom: String,
    /// Sum of tradable balances (escrow included)
    pub tradable_amount: String,
    /// Sum of retired balances
    pub retired_amount: String,
    /// Credits removed from circulation
    pub cancelled_amount: String,
}

/// Basket pooling credits of one credit type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Basket {
    /// Denom of the pooled token ("eco.uC.NCT")
    pub basket_denom: String,
    /// Display name ("NCT")
    pub name: String,
    /// Credit type accepted by the basket
    pub credit_type_abbrev: String,
    /// Pooled tokens minted per whole credit, as a power of ten
    pub exponent: u32,
    /// When false, credits taken out of the basket are always retired
    pub disable_auto_retire: bool,
    /// Basket curator
    pub curator: AccountId,
}

/// Integral pooled-token balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    /// Owner
    pub address: AccountId,
    /// Token denom
    pub denom: String,
    /// Smallest token units held
    pub amount: u128,
}

/// One credit item of a multi-item request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credits {
    /// Batch
    pub batch_denom: String,
    /// Decimal amount string
    pub amount: String,
}

impl Credits {
    /// Create a credit item
    pub fn new(batch_denom: impl Into<String>, amount: impl Into<String>) -> Self {
        Self {
            batch_denom: batch_denom.into(),
            amount: amount.into(),
        }
    }
}

/// One item of a send request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCredits {
    /// Batch
    pub batch_denom: String,
    /// Amount credited to the recipient's tradable balance
    pub tradable_amount: String,
    /// Amount retired on behalf of the recipient
    pub retired_amount: String,
    /// Jurisdiction recorded for the retired part
    #[serde(default)]
    pub retirement_jurisdiction: String,
}

/// Issuance to one recipient when a batch is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchIssuance {
    /// Recipient
    pub recipient: AccountId,
    /// Tradable credits issued
    pub tradable_amount: String,
    /// Credits issued already retired
    pub retired_amount: String,
    /// Jurisdiction for the retired part
    #[serde(default)]
    pub retirement_jurisdiction: String,
}

/// Request to create a batch and issue its credits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBatch {
    /// Batch denom
    pub denom: String,
    /// Credit type abbreviation
    pub credit_type_abbrev: String,
    /// Issuer account
    pub issuer: AccountId,
    /// Start of the monitoring period
    pub start_date: NaiveDate,
    /// End of the monitoring period
    pub end_date: NaiveDate,
    /// Opaque metadata reference
    #[serde(default)]
    pub metadata: String,
    /// Credits issued per recipient
    pub issuance: Vec<BatchIssuance>,
}

impl NewBatch {
    /// Batch record for this request
    pub fn to_batch(&self) -> Batch {
        Batch {
            denom: self.denom.clone(),
            credit_type_abbrev: self.credit_type_abbrev.clone(),
            issuer: self.issuer.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            metadata: self.metadata.clone(),
        }
    }
}

/// Credits handed out by a basket withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasketCredit {
    /// Batch
    pub batch_denom: String,
    /// Amount withdrawn
    pub amount: String,
}
