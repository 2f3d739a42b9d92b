//! Basket conversion
//!
//! Depositing `a` credits mints `a × 10^exponent` pooled tokens, rounded down
//! to a whole token. Redeeming `t` tokens yields `t / 10^exponent` credits,
//! rounded down to the credit precision. Both directions round toward zero,
//! so a deposit followed by a redemption never returns more than was put in.

use crate::{amount::CreditAmount, decimal::Dec, Result};

/// Pooled tokens minted for a credit deposit
pub fn credits_to_tokens(amount: &CreditAmount, exponent: u32) -> Result<u128> {
    let multiplier = Dec::pow10(exponent)?;
    let tokens = amount.value().mul_exact(&multiplier)?;
    tokens.trunc_to_u128()
}

/// Credits released for burning `tokens` pooled tokens
pub fn tokens_to_credits(tokens: u128, exponent: u32, precision: u32) -> Result<CreditAmount> {
    let credits = Dec::from_scaled(tokens, exponent)?;
    CreditAmount::from_dec(credits.trunc_to_places(precision), precision)
}
