//! Transaction handler
//!
//! [`Ledger`] runs every request against a `Tx` overlay: reads go to the
//! staged records first and then to the store, writes only touch the
//! overlay. When the last item succeeded the overlay becomes one
//! [`ChangeSet`] and is committed in a single call, so a failure on any item
//! leaves the store exactly as it was.
//!
//! Per item the order is fixed: resolve batch and credit type, parse the
//! amount, compute the replacement balance and supply, stage them, emit the
//! event, charge gas. Events of a failed request may already sit in the
//! caller's sink; the caller discards them together with the request.
//!
//! # Example
//!
//! ```
//! use credit_ledger::{
//!     AccountId, BatchIssuance, CreditType, Credits, EventBuffer, ExecContext,
//!     InfiniteGasMeter, Ledger, MemoryStore, NewBatch,
//! };
//! use chrono::NaiveDate;
//!
//! # fn main() -> credit_ledger::Result<()> {
//! let ledger = Ledger::new(MemoryStore::new());
//! let mut events = EventBuffer::new();
//! let mut gas = InfiniteGasMeter::new();
//! let mut ctx = ExecContext::new(&mut events, &mut gas);
//!
//! ledger.create_credit_type(&mut ctx, CreditType {
//!     abbreviation: "C".into(),
//!     name: "carbon".into(),
//!     unit: "metric ton CO2 equivalent".into(),
//!     precision: 6,
//! })?;
//!
//! let owner = AccountId::new("regen1owner");
//! ledger.create_batch(&mut ctx, NewBatch {
//!     denom: "C01-001".into(),
//!     credit_type_abbrev: "C".into(),
//!     issuer: AccountId::new("regen1issuer"),
//!     start_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
//!     end_date: NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
//!     metadata: String::new(),
//!     issuance: vec![BatchIssuance {
//!         recipient: owner.clone(),
//!         tradable_amount: "100.000000".into(),
//!         retired_amount: String::new(),
//!         retirement_jurisdiction: String::new(),
//!     }],
//! })?;
//!
//! ledger.retire(&mut ctx, &owner, &[Credits::new("C01-001", "30.000000")], "US-WA")?;
//! assert_eq!(ledger.balance(&owner, "C01-001")?.tradable_amount, "70.000000");
//! # Ok(())
//! # }
//! ```

use crate::{
    amount::CreditAmount,
    balance::Balance,
    basket::{credits_to_tokens, tokens_to_credits},
    decimal::MAX_SCALE,
    events::{Event, ExecContext},
    storage::{ChangeSet, Store},
    supply::{Supply, SupplyDelta},
    types::{
        AccountId, Basket, BasketCredit, Batch, BatchBalance, BatchIssuance, BatchSupply, CreditType, Credits,
        NewBatch, SendCredits, TokenBalance,
    },
    Error, Result,
};
use std::collections::BTreeMap;

/// Gas charged per processed item when nothing else is configured
pub const DEFAULT_GAS_COST_PER_ITEM: u64 = 10;

/// Credit ledger over a store
#[derive(Debug)]
pub struct Ledger<S: Store> {
    store: S,
    gas_cost_per_item: u64,
}

impl<S: Store> Ledger<S> {
    /// Create new ledger
    pub fn new(store: S) -> Self {
        Self::with_gas_cost(store, DEFAULT_GAS_COST_PER_ITEM)
    }

    /// Create new ledger with a per-item gas cost
    pub fn with_gas_cost(store: S, gas_cost_per_item: u64) -> Self {
        Self {
            store,
            gas_cost_per_item,
        }
    }

    /// Underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Gas charged per item
    pub fn gas_cost_per_item(&self) -> u64 {
        self.gas_cost_per_item
    }

    fn execute<T>(&self, operation: &'static str, f: impl FnOnce(&mut Tx<'_, S>) -> Result<T>) -> Result<T> {
        let mut tx = Tx::new(&self.store);
        let output = f(&mut tx)?;

        let changes = tx.into_changes();
        let records = changes.len();
        self.store.commit(changes)?;

        tracing::info!(operation, records, "Request committed");
        Ok(output)
    }

    fn charge(&self, ctx: &mut ExecContext<'_>, descriptor: &str) -> Result<()> {
        ctx.consume_gas(self.gas_cost_per_item, descriptor)
    }

    // ===== Registration =====

    /// Register a credit type
    pub fn create_credit_type(&self, ctx: &mut ExecContext<'_>, credit_type: CreditType) -> Result<()> {
        validate_abbreviation(&credit_type.abbreviation)?;
        if credit_type.name.trim().is_empty() {
            return Err(Error::InvalidRequest("credit type name must not be empty".to_string()));
        }
        if credit_type.precision > MAX_SCALE {
            return Err(Error::InvalidRequest(format!(
                "credit type precision {} exceeds {}",
                credit_type.precision, MAX_SCALE
            )));
        }

        self.execute("create_credit_type", |tx| {
            if tx.credit_type(&credit_type.abbreviation)?.is_some() {
                return Err(Error::AlreadyExists(format!("credit type {}", credit_type.abbreviation)));
            }

            ctx.emit(Event::CreateCreditType {
                abbreviation: credit_type.abbreviation.clone(),
            })?;
            self.charge(ctx, "create credit type")?;

            tx.credit_types.insert(credit_type.abbreviation.clone(), credit_type);
            Ok(())
        })
    }

    /// Create a batch and issue its credits
    ///
    /// Each issuance credits the recipient's tradable balance and, for the
    /// retired part, retires directly into the recipient. The batch supply
    /// starts at the sum of all issuances.
    pub fn create_batch(&self, ctx: &mut ExecContext<'_>, request: NewBatch) -> Result<()> {
        if request.denom.trim().is_empty() {
            return Err(Error::InvalidRequest("batch denom must not be empty".to_string()));
        }
        if request.start_date > request.end_date {
            return Err(Error::InvalidRequest(format!(
                "batch start date {} is after end date {}",
                request.start_date, request.end_date
            )));
        }

        self.execute("create_batch", |tx| {
            let credit_type = tx
                .credit_type(&request.credit_type_abbrev)?
                .ok_or_else(|| Error::NotFound(format!("credit type {}", request.credit_type_abbrev)))?;
            if tx.batch(&request.denom)?.is_some() {
                return Err(Error::AlreadyExists(format!("batch {}", request.denom)));
            }

            let batch = request.to_batch();
            tx.batches.insert(batch.denom.clone(), batch);
            tx.put_supply(&request.denom, &Supply::zero(credit_type.precision));

            ctx.emit(Event::CreateBatch {
                batch_denom: request.denom.clone(),
                issuer: request.issuer.clone(),
            })?;

            for (index, issuance) in request.issuance.iter().enumerate() {
                self.issue_item(tx, ctx, &request.denom, credit_type.precision, issuance)
                    .map_err(|e| e.at_item(index, &request.denom))?;
            }

            Ok(())
        })
    }

    fn issue_item(
        &self,
        tx: &mut Tx<'_, S>,
        ctx: &mut ExecContext<'_>,
        batch_denom: &str,
        precision: u32,
        issuance: &BatchIssuance,
    ) -> Result<()> {
        let tradable = parse_optional(&issuance.tradable_amount, precision)?;
        let retired = parse_optional(&issuance.retired_amount, precision)?;
        if retired.is_positive() {
            validate_jurisdiction(&issuance.retirement_jurisdiction)?;
        }

        let balance = tx
            .balance(&issuance.recipient, batch_denom, precision)?
            .credit_tradable(&tradable)?
            .credit_retired(&retired)?;
        let supply = tx
            .supply(batch_denom, precision)?
            .apply(SupplyDelta::Issue { tradable, retired })?;

        tx.put_balance(&issuance.recipient, batch_denom, &balance);
        tx.put_supply(batch_denom, &supply);

        tracing::debug!(
            batch = batch_denom,
            recipient = %issuance.recipient,
            tradable = %tradable,
            retired = %retired,
            "Credits issued"
        );

        ctx.emit(Event::Mint {
            batch_denom: batch_denom.to_string(),
            recipient: issuance.recipient.clone(),
            tradable_amount: tradable.to_string(),
            retired_amount: retired.to_string(),
        })?;
        if retired.is_positive() {
            ctx.emit(Event::Retire {
                owner: issuance.recipient.clone(),
                batch_denom: batch_denom.to_string(),
                amount: retired.to_string(),
                jurisdiction: issuance.retirement_jurisdiction.clone(),
            })?;
        }
        self.charge(ctx, "issue credits")
    }

    // ===== Balance transitions =====

    /// Retire tradable credits of `owner`
    ///
    /// WARNING: retirement is permanent. There is no operation that moves
    /// credits back out of a retired balance.
    pub fn retire(
        &self,
        ctx: &mut ExecContext<'_>,
        owner: &AccountId,
        credits: &[Credits],
        jurisdiction: &str,
    ) -> Result<()> {
        require_items(credits.len())?;
        require_holder(owner)?;
        validate_jurisdiction(jurisdiction)?;

        self.execute("retire", |tx| {
            for (index, item) in credits.iter().enumerate() {
                self.retire_item(tx, ctx, owner, item, jurisdiction)
                    .map_err(|e| e.at_item(index, &item.batch_denom))?;
            }
            Ok(())
        })
    }

    fn retire_item(
        &self,
        tx: &mut Tx<'_, S>,
        ctx: &mut ExecContext<'_>,
        owner: &AccountId,
        item: &Credits,
        jurisdiction: &str,
    ) -> Result<()> {
        let (_, precision) = tx.batch_with_precision(&item.batch_denom)?;
        let amount = parse_positive(&item.amount, precision)?;

        let balance = tx.balance(owner, &item.batch_denom, precision)?.retire(&amount)?;
        let supply = tx
            .supply(&item.batch_denom, precision)?
            .apply(SupplyDelta::Retire(amount))?;

        tx.put_balance(owner, &item.batch_denom, &balance);
        tx.put_supply(&item.batch_denom, &supply);

        tracing::debug!(batch = %item.batch_denom, owner = %owner, amount = %amount, "Credits retired");

        ctx.emit(Event::Retire {
            owner: owner.clone(),
            batch_denom: item.batch_denom.clone(),
            amount: amount.to_string(),
            jurisdiction: jurisdiction.to_string(),
        })?;
        self.charge(ctx, "retire")
    }

    /// Send credits from `sender` to `recipient`
    ///
    /// The sender is debited the tradable and retired parts together. The
    /// recipient receives the tradable part as tradable credits; the retired
    /// part is retired on the recipient's behalf.
    pub fn send(
        &self,
        ctx: &mut ExecContext<'_>,
        sender: &AccountId,
        recipient: &AccountId,
        credits: &[SendCredits],
    ) -> Result<()> {
        require_items(credits.len())?;
        require_holder(sender)?;
        if sender == recipient {
            return Err(Error::InvalidRequest(format!("sender and recipient are both {}", sender)));
        }

        self.execute("send", |tx| {
            for (index, item) in credits.iter().enumerate() {
                self.send_item(tx, ctx, sender, recipient, item)
                    .map_err(|e| e.at_item(index, &item.batch_denom))?;
            }
            Ok(())
        })
    }

    fn send_item(
        &self,
        tx: &mut Tx<'_, S>,
        ctx: &mut ExecContext<'_>,
        sender: &AccountId,
        recipient: &AccountId,
        item: &SendCredits,
    ) -> Result<()> {
        let (_, precision) = tx.batch_with_precision(&item.batch_denom)?;
        let tradable = parse_optional(&item.tradable_amount, precision)?;
        let retired = parse_optional(&item.retired_amount, precision)?;
        let total = tradable.add(&retired)?;
        if total.is_zero() {
            return Err(Error::InvalidRequest("send amount must be positive".to_string()));
        }
        if retired.is_positive() {
            validate_jurisdiction(&item.retirement_jurisdiction)?;
        }

        let from = tx.balance(sender, &item.batch_denom, precision)?.debit_tradable(&total)?;
        tx.put_balance(sender, &item.batch_denom, &from);

        let to = tx
            .balance(recipient, &item.batch_denom, precision)?
            .credit_tradable(&tradable)?
            .credit_retired(&retired)?;
        tx.put_balance(recipient, &item.batch_denom, &to);

        if retired.is_positive() {
            let supply = tx
                .supply(&item.batch_denom, precision)?
                .apply(SupplyDelta::Retire(retired))?;
            tx.put_supply(&item.batch_denom, &supply);
        }

        tracing::debug!(
            batch = %item.batch_denom,
            sender = %sender,
            recipient = %recipient,
            tradable = %tradable,
            retired = %retired,
            "Credits sent"
        );

        ctx.emit(Event::Transfer {
            sender: sender.clone(),
            recipient: recipient.clone(),
            batch_denom: item.batch_denom.clone(),
            tradable_amount: tradable.to_string(),
            retired_amount: retired.to_string(),
        })?;
        if retired.is_positive() {
            ctx.emit(Event::Retire {
                owner: recipient.clone(),
                batch_denom: item.batch_denom.clone(),
                amount: retired.to_string(),
                jurisdiction: item.retirement_jurisdiction.clone(),
            })?;
        }
        self.charge(ctx, "send")
    }

    /// Lock tradable credits in escrow
    pub fn escrow(&self, ctx: &mut ExecContext<'_>, owner: &AccountId, batch_denom: &str, amount: &str) -> Result<()> {
        require_holder(owner)?;

        self.execute("escrow", |tx| {
            let (_, precision) = tx.batch_with_precision(batch_denom)?;
            let amount = parse_positive(amount, precision)?;

            let balance = tx.balance(owner, batch_denom, precision)?.escrow(&amount)?;
            tx.put_balance(owner, batch_denom, &balance);

            tracing::debug!(batch = batch_denom, owner = %owner, amount = %amount, "Credits escrowed");

            ctx.emit(Event::Escrow {
                owner: owner.clone(),
                batch_denom: batch_denom.to_string(),
                amount: amount.to_string(),
            })?;
            self.charge(ctx, "escrow")
        })
    }

    /// Return escrowed credits to the tradable balance
    pub fn release_escrow(
        &self,
        ctx: &mut ExecContext<'_>,
        owner: &AccountId,
        batch_denom: &str,
        amount: &str,
    ) -> Result<()> {
        require_holder(owner)?;

        self.execute("release_escrow", |tx| {
            let (_, precision) = tx.batch_with_precision(batch_denom)?;
            let amount = parse_positive(amount, precision)?;

            let balance = tx.balance(owner, batch_denom, precision)?.release_escrow(&amount)?;
            tx.put_balance(owner, batch_denom, &balance);

            tracing::debug!(batch = batch_denom, owner = %owner, amount = %amount, "Escrow released");

            ctx.emit(Event::ReleaseEscrow {
                owner: owner.clone(),
                batch_denom: batch_denom.to_string(),
                amount: amount.to_string(),
            })?;
            self.charge(ctx, "release escrow")
        })
    }

    /// Remove tradable credits from circulation
    pub fn cancel(&self, ctx: &mut ExecContext<'_>, owner: &AccountId, credits: &[Credits], reason: &str) -> Result<()> {
        require_items(credits.len())?;
        require_holder(owner)?;

        self.execute("cancel", |tx| {
            for (index, item) in credits.iter().enumerate() {
                self.cancel_item(tx, ctx, owner, item, reason)
                    .map_err(|e| e.at_item(index, &item.batch_denom))?;
            }
            Ok(())
        })
    }

    fn cancel_item(
        &self,
        tx: &mut Tx<'_, S>,
        ctx: &mut ExecContext<'_>,
        owner: &AccountId,
        item: &Credits,
        reason: &str,
    ) -> Result<()> {
        let (_, precision) = tx.batch_with_precision(&item.batch_denom)?;
        let amount = parse_positive(&item.amount, precision)?;

        let balance = tx.balance(owner, &item.batch_denom, precision)?.cancel(&amount)?;
        let supply = tx
            .supply(&item.batch_denom, precision)?
            .apply(SupplyDelta::Cancel(amount))?;

        tx.put_balance(owner, &item.batch_denom, &balance);
        tx.put_supply(&item.batch_denom, &supply);

        tracing::debug!(batch = %item.batch_denom, owner = %owner, amount = %amount, "Credits cancelled");

        ctx.emit(Event::Cancel {
            owner: owner.clone(),
            batch_denom: item.batch_denom.clone(),
            amount: amount.to_string(),
            reason: reason.to_string(),
        })?;
        self.charge(ctx, "cancel")
    }

    // ===== Baskets =====

    /// Create a basket
    ///
    /// The exponent must be at least the credit type precision so that the
    /// smallest credit unit mints a whole number of tokens.
    pub fn create_basket(&self, ctx: &mut ExecContext<'_>, basket: Basket) -> Result<()> {
        if basket.basket_denom.trim().is_empty() {
            return Err(Error::InvalidRequest("basket denom must not be empty".to_string()));
        }
        if basket.exponent > MAX_SCALE {
            return Err(Error::InvalidRequest(format!(
                "basket exponent {} exceeds {}",
                basket.exponent, MAX_SCALE
            )));
        }

        self.execute("create_basket", |tx| {
            let credit_type = tx
                .credit_type(&basket.credit_type_abbrev)?
                .ok_or_else(|| Error::NotFound(format!("credit type {}", basket.credit_type_abbrev)))?;
            if basket.exponent < credit_type.precision {
                return Err(Error::InvalidRequest(format!(
                    "basket exponent {} is below credit type precision {}",
                    basket.exponent, credit_type.precision
                )));
            }
            if tx.basket(&basket.basket_denom)?.is_some() {
                return Err(Error::AlreadyExists(format!("basket {}", basket.basket_denom)));
            }

            ctx.emit(Event::CreateBasket {
                basket_denom: basket.basket_denom.clone(),
                curator: basket.curator.clone(),
            })?;
            self.charge(ctx, "create basket")?;

            tx.baskets.insert(basket.basket_denom.clone(), basket);
            Ok(())
        })
    }

    /// Deposit credits into a basket, returning the pooled tokens minted
    ///
    /// Credits move to the basket's pseudo-account. Each item mints
    /// `amount × 10^exponent` tokens rounded down; the request fails when the
    /// deposit would mint nothing.
    pub fn put_in_basket(
        &self,
        ctx: &mut ExecContext<'_>,
        owner: &AccountId,
        basket_denom: &str,
        credits: &[Credits],
    ) -> Result<u128> {
        require_items(credits.len())?;
        require_holder(owner)?;

        self.execute("put_in_basket", |tx| {
            let basket = tx
                .basket(basket_denom)?
                .ok_or_else(|| Error::NotFound(format!("basket {}", basket_denom)))?;
            let basket_account = AccountId::basket(basket_denom);

            let mut minted: u128 = 0;
            for (index, item) in credits.iter().enumerate() {
                let tokens = self
                    .put_item(tx, ctx, owner, &basket, &basket_account, item)
                    .map_err(|e| e.at_item(index, &item.batch_denom))?;
                minted = minted
                    .checked_add(tokens)
                    .ok_or_else(|| Error::Overflow(format!("pooled tokens minted by {}", basket_denom)))?;
            }

            if minted == 0 {
                return Err(Error::InvalidRequest(format!(
                    "deposit into {} mints no pooled tokens",
                    basket_denom
                )));
            }

            let held = tx.token_balance(owner, basket_denom)?;
            let held = held
                .checked_add(minted)
                .ok_or_else(|| Error::Overflow(format!("{} balance of {}", basket_denom, owner)))?;
            tx.put_token_balance(owner, basket_denom, held);

            Ok(minted)
        })
    }

    fn put_item(
        &self,
        tx: &mut Tx<'_, S>,
        ctx: &mut ExecContext<'_>,
        owner: &AccountId,
        basket: &Basket,
        basket_account: &AccountId,
        item: &Credits,
    ) -> Result<u128> {
        let (batch, precision) = tx.batch_with_precision(&item.batch_denom)?;
        if batch.credit_type_abbrev != basket.credit_type_abbrev {
            return Err(Error::InvalidRequest(format!(
                "basket {} only accepts credit type {}, batch is {}",
                basket.basket_denom, basket.credit_type_abbrev, batch.credit_type_abbrev
            )));
        }
        let amount = parse_positive(&item.amount, precision)?;

        let from = tx.balance(owner, &item.batch_denom, precision)?;
        let to = tx.balance(basket_account, &item.batch_denom, precision)?;
        let (from, to) = Balance::transfer(&from, &to, &amount)?;
        let tokens = credits_to_tokens(&amount, basket.exponent)?;

        tx.put_balance(owner, &item.batch_denom, &from);
        tx.put_balance(basket_account, &item.batch_denom, &to);

        tracing::debug!(
            basket = %basket.basket_denom,
            batch = %item.batch_denom,
            owner = %owner,
            amount = %amount,
            tokens,
            "Credits deposited"
        );

        ctx.emit(Event::BasketPut {
            owner: owner.clone(),
            basket_denom: basket.basket_denom.clone(),
            batch_denom: item.batch_denom.clone(),
            amount: amount.to_string(),
            tokens,
        })?;
        self.charge(ctx, "basket put")?;

        Ok(tokens)
    }

    /// Burn pooled tokens for credits held by the basket
    ///
    /// Credits are drawn from the oldest batches first (start date, then
    /// denom). A basket that does not disable auto-retire always retires the
    /// credits it hands out, whatever `retire_on_take` says.
    ///
    /// Only the tokens backing the released credits are burned. When the
    /// basket exponent exceeds the credit precision, the remainder below one
    /// credit unit stays with the owner.
    pub fn take_from_basket(
        &self,
        ctx: &mut ExecContext<'_>,
        owner: &AccountId,
        basket_denom: &str,
        tokens: u128,
        retire_on_take: bool,
        jurisdiction: &str,
    ) -> Result<Vec<BasketCredit>> {
        if tokens == 0 {
            return Err(Error::InvalidRequest("token amount must be positive".to_string()));
        }
        require_holder(owner)?;

        self.execute("take_from_basket", |tx| {
            let basket = tx
                .basket(basket_denom)?
                .ok_or_else(|| Error::NotFound(format!("basket {}", basket_denom)))?;
            let retire = retire_on_take || !basket.disable_auto_retire;
            if retire {
                validate_jurisdiction(jurisdiction)?;
            }

            let held = tx.token_balance(owner, basket_denom)?;
            if tokens > held {
                return Err(Error::InsufficientBalance {
                    field: "tokens",
                    requested: tokens.to_string(),
                    available: held.to_string(),
                });
            }

            let precision = tx
                .credit_type(&basket.credit_type_abbrev)?
                .ok_or_else(|| Error::NotFound(format!("credit type {}", basket.credit_type_abbrev)))?
                .precision;
            let requested = tokens_to_credits(tokens, basket.exponent, precision)?;
            if requested.is_zero() {
                return Err(Error::InvalidRequest(format!(
                    "{} tokens of {} redeem no credits",
                    tokens, basket_denom
                )));
            }
            let burned = credits_to_tokens(&requested, basket.exponent)?;

            let basket_account = AccountId::basket(basket_denom);
            let mut holdings = Vec::new();
            for record in tx.holdings(&basket_account)? {
                let balance = Balance::from_record(&record, precision)?;
                if balance.tradable.is_positive() {
                    let (batch, _) = tx.batch_with_precision(&record.batch_denom)?;
                    holdings.push((batch, balance));
                }
            }
            holdings.sort_by(|(a, _), (b, _)| a.start_date.cmp(&b.start_date).then_with(|| a.denom.cmp(&b.denom)));

            let mut remaining = requested;
            let mut taken = Vec::new();
            for (index, (batch, holding)) in holdings.into_iter().enumerate() {
                if remaining.is_zero() {
                    break;
                }
                let amount = remaining.min(holding.tradable);
                self.take_item(tx, ctx, owner, &basket_account, &batch.denom, holding, amount, retire, jurisdiction)
                    .map_err(|e| e.at_item(index, &batch.denom))?;
                remaining = remaining.sub(&amount)?;
                taken.push(BasketCredit {
                    batch_denom: batch.denom,
                    amount: amount.to_string(),
                });
            }

            if remaining.is_positive() {
                let available = requested.sub(&remaining)?;
                return Err(Error::InsufficientBalance {
                    field: "basket",
                    requested: requested.to_string(),
                    available: available.to_string(),
                });
            }

            tx.put_token_balance(owner, basket_denom, held - burned);

            ctx.emit(Event::BasketTake {
                owner: owner.clone(),
                basket_denom: basket_denom.to_string(),
                tokens: burned,
                credits: taken.clone(),
                retired: retire,
            })?;

            Ok(taken)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn take_item(
        &self,
        tx: &mut Tx<'_, S>,
        ctx: &mut ExecContext<'_>,
        owner: &AccountId,
        basket_account: &AccountId,
        batch_denom: &str,
        holding: Balance,
        amount: CreditAmount,
        retire: bool,
        jurisdiction: &str,
    ) -> Result<()> {
        let precision = amount.precision();
        let from = holding.debit_tradable(&amount)?;
        let to = tx.balance(owner, batch_denom, precision)?;
        let to = if retire {
            to.credit_retired(&amount)?
        } else {
            to.credit_tradable(&amount)?
        };

        tx.put_balance(basket_account, batch_denom, &from);
        tx.put_balance(owner, batch_denom, &to);

        if retire {
            let supply = tx.supply(batch_denom, precision)?.apply(SupplyDelta::Retire(amount))?;
            tx.put_supply(batch_denom, &supply);
        }

        tracing::debug!(batch = batch_denom, owner = %owner, amount = %amount, retire, "Credits taken from basket");

        if retire {
            ctx.emit(Event::Retire {
                owner: owner.clone(),
                batch_denom: batch_denom.to_string(),
                amount: amount.to_string(),
                jurisdiction: jurisdiction.to_string(),
            })?;
        }
        self.charge(ctx, "basket take")
    }

    // ===== Queries =====

    /// Credit type by abbreviation
    pub fn credit_type(&self, abbreviation: &str) -> Result<CreditType> {
        self.store
            .get_credit_type(abbreviation)?
            .ok_or_else(|| Error::NotFound(format!("credit type {}", abbreviation)))
    }

    /// Batch by denom
    pub fn batch(&self, denom: &str) -> Result<Batch> {
        self.store
            .get_batch(denom)?
            .ok_or_else(|| Error::NotFound(format!("batch {}", denom)))
    }

    /// Balance of one owner for one batch
    ///
    /// An owner that never held the batch is `NotFound`, which is distinct
    /// from a balance that went back to zero.
    pub fn balance(&self, address: &AccountId, batch_denom: &str) -> Result<BatchBalance> {
        self.store
            .get_balance(address, batch_denom)?
            .ok_or_else(|| Error::NotFound(format!("balance of {} for {}", address, batch_denom)))
    }

    /// All balances of a batch
    pub fn balances_by_batch(&self, batch_denom: &str) -> Result<Vec<BatchBalance>> {
        self.store.list_balances_by_batch(batch_denom)
    }

    /// All balances of an owner
    pub fn balances_by_account(&self, address: &AccountId) -> Result<Vec<BatchBalance>> {
        self.store.list_balances_by_account(address)
    }

    /// Supply of a batch
    pub fn supply(&self, batch_denom: &str) -> Result<BatchSupply> {
        self.store
            .get_supply(batch_denom)?
            .ok_or_else(|| Error::NotFound(format!("supply of {}", batch_denom)))
    }

    /// Basket by denom
    pub fn basket(&self, basket_denom: &str) -> Result<Basket> {
        self.store
            .get_basket(basket_denom)?
            .ok_or_else(|| Error::NotFound(format!("basket {}", basket_denom)))
    }

    /// Credits held by a basket, per batch
    pub fn basket_balances(&self, basket_denom: &str) -> Result<Vec<BasketCredit>> {
        self.basket(basket_denom)?;
        let holdings = self
            .store
            .list_balances_by_account(&AccountId::basket(basket_denom))?
            .into_iter()
            .map(|record| BasketCredit {
                batch_denom: record.batch_denom,
                amount: record.tradable_amount,
            })
            .collect();
        Ok(holdings)
    }

    /// Pooled-token balance, zero when the owner never held any
    pub fn token_balance(&self, address: &AccountId, denom: &str) -> Result<u128> {
        Ok(self
            .store
            .get_token_balance(address, denom)?
            .map(|t| t.amount)
            .unwrap_or(0))
    }

    /// Check that the stored supply of a batch matches its balances
    ///
    /// Tradable supply covers tradable and escrowed balances; retired supply
    /// covers retired balances.
    pub fn audit_supply(&self, batch_denom: &str) -> Result<()> {
        let batch = self.batch(batch_denom)?;
        let precision = self.credit_type(&batch.credit_type_abbrev)?.precision;
        let supply = Supply::from_record(&self.supply(batch_denom)?, precision)?;

        let mut tradable = CreditAmount::zero(precision);
        let mut retired = CreditAmount::zero(precision);
        for record in self.store.list_balances_by_batch(batch_denom)? {
            let balance = Balance::from_record(&record, precision)?;
            tradable = tradable.add(&balance.tradable)?.add(&balance.escrowed)?;
            retired = retired.add(&balance.retired)?;
        }

        if supply.tradable.cmp_value(&tradable).is_ne() {
            return Err(Error::Invariant {
                batch_denom: batch_denom.to_string(),
                detail: format!("tradable supply {} but balances hold {}", supply.tradable, tradable),
            });
        }
        if supply.retired.cmp_value(&retired).is_ne() {
            return Err(Error::Invariant {
                batch_denom: batch_denom.to_string(),
                detail: format!("retired supply {} but balances hold {}", supply.retired, retired),
            });
        }
        Ok(())
    }
}

/// Read-your-writes overlay for one request
struct Tx<'a, S: Store> {
    store: &'a S,
    credit_types: BTreeMap<String, CreditType>,
    batches: BTreeMap<String, Batch>,
    balances: BTreeMap<(AccountId, String), BatchBalance>,
    supplies: BTreeMap<String, BatchSupply>,
    baskets: BTreeMap<String, Basket>,
    tokens: BTreeMap<(AccountId, String), TokenBalance>,
}

impl<'a, S: Store> Tx<'a, S> {
    fn new(store: &'a S) -> Self {
        Self {
            store,
            credit_types: BTreeMap::new(),
            batches: BTreeMap::new(),
            balances: BTreeMap::new(),
            supplies: BTreeMap::new(),
            baskets: BTreeMap::new(),
            tokens: BTreeMap::new(),
        }
    }

    fn credit_type(&self, abbreviation: &str) -> Result<Option<CreditType>> {
        match self.credit_types.get(abbreviation) {
            Some(staged) => Ok(Some(staged.clone())),
            None => self.store.get_credit_type(abbreviation),
        }
    }

    fn batch(&self, denom: &str) -> Result<Option<Batch>> {
        match self.batches.get(denom) {
            Some(staged) => Ok(Some(staged.clone())),
            None => self.store.get_batch(denom),
        }
    }

    /// Batch and the precision of its credit type
    fn batch_with_precision(&self, denom: &str) -> Result<(Batch, u32)> {
        let batch = self
            .batch(denom)?
            .ok_or_else(|| Error::NotFound(format!("batch {}", denom)))?;
        let credit_type = self
            .credit_type(&batch.credit_type_abbrev)?
            .ok_or_else(|| Error::NotFound(format!("credit type {}", batch.credit_type_abbrev)))?;
        Ok((batch, credit_type.precision))
    }

    fn basket(&self, denom: &str) -> Result<Option<Basket>> {
        match self.baskets.get(denom) {
            Some(staged) => Ok(Some(staged.clone())),
            None => self.store.get_basket(denom),
        }
    }

    /// Current balance, zero when the owner never held the batch
    fn balance(&self, address: &AccountId, batch_denom: &str, precision: u32) -> Result<Balance> {
        let key = (address.clone(), batch_denom.to_string());
        if let Some(staged) = self.balances.get(&key) {
            return Balance::from_record(staged, precision);
        }
        match self.store.get_balance(address, batch_denom)? {
            Some(record) => Balance::from_record(&record, precision),
            None => Ok(Balance::zero(precision)),
        }
    }

    fn put_balance(&mut self, address: &AccountId, batch_denom: &str, balance: &Balance) {
        let key = (address.clone(), batch_denom.to_string());
        self.balances.insert(key, balance.to_record(address, batch_denom));
    }

    /// Balances of an owner with staged records applied
    fn holdings(&self, address: &AccountId) -> Result<Vec<BatchBalance>> {
        let mut merged: BTreeMap<String, BatchBalance> = self
            .store
            .list_balances_by_account(address)?
            .into_iter()
            .map(|record| (record.batch_denom.clone(), record))
            .collect();
        for ((owner, denom), staged) in &self.balances {
            if owner == address {
                merged.insert(denom.clone(), staged.clone());
            }
        }
        Ok(merged.into_values().collect())
    }

    fn supply(&self, batch_denom: &str, precision: u32) -> Result<Supply> {
        if let Some(staged) = self.supplies.get(batch_denom) {
            return Supply::from_record(staged, precision);
        }
        match self.store.get_supply(batch_denom)? {
            Some(record) => Supply::from_record(&record, precision),
            None => Err(Error::NotFound(format!("supply of {}", batch_denom))),
        }
    }

    fn put_supply(&mut self, batch_denom: &str, supply: &Supply) {
        self.supplies
            .insert(batch_denom.to_string(), supply.to_record(batch_denom));
    }

    fn token_balance(&self, address: &AccountId, denom: &str) -> Result<u128> {
        let key = (address.clone(), denom.to_string());
        if let Some(staged) = self.tokens.get(&key) {
            return Ok(staged.amount);
        }
        Ok(self
            .store
            .get_token_balance(address, denom)?
            .map(|t| t.amount)
            .unwrap_or(0))
    }

    fn put_token_balance(&mut self, address: &AccountId, denom: &str, amount: u128) {
        let key = (address.clone(), denom.to_string());
        self.tokens.insert(
            key,
            TokenBalance {
                address: address.clone(),
                denom: denom.to_string(),
                amount,
            },
        );
    }

    fn into_changes(self) -> ChangeSet {
        ChangeSet {
            credit_types: self.credit_types.into_values().collect(),
            batches: self.batches.into_values().collect(),
            balances: self.balances.into_values().collect(),
            supplies: self.supplies.into_values().collect(),
            baskets: self.baskets.into_values().collect(),
            token_balances: self.tokens.into_values().collect(),
        }
    }
}

// Request validation

fn require_items(count: usize) -> Result<()> {
    if count == 0 {
        return Err(Error::InvalidRequest("request has no credit items".to_string()));
    }
    Ok(())
}

/// Basket pseudo-accounts only move credits through deposits and withdrawals
fn require_holder(account: &AccountId) -> Result<()> {
    if account.is_basket() {
        return Err(Error::InvalidRequest(format!("{} is a basket account", account)));
    }
    Ok(())
}

/// Parse an amount that must be above zero
fn parse_positive(s: &str, precision: u32) -> Result<CreditAmount> {
    let amount = CreditAmount::parse(s, precision)?;
    if amount.is_zero() {
        return Err(Error::InvalidRequest(format!("amount must be positive, got {}", s)));
    }
    Ok(amount)
}

/// Parse an amount where an empty string means zero
fn parse_optional(s: &str, precision: u32) -> Result<CreditAmount> {
    if s.is_empty() {
        return Ok(CreditAmount::zero(precision));
    }
    CreditAmount::parse(s, precision)
}

/// One to three upper-case ASCII letters
fn validate_abbreviation(abbreviation: &str) -> Result<()> {
    let valid = (1..=3).contains(&abbreviation.len()) && abbreviation.bytes().all(|b| b.is_ascii_uppercase());
    if !valid {
        return Err(Error::InvalidRequest(format!(
            "credit type abbreviation must be 1-3 upper-case letters, got {:?}",
            abbreviation
        )));
    }
    Ok(())
}

/// ISO 3166 jurisdiction: `CC`, `CC-SUB` or `CC-SUB postal code`
fn validate_jurisdiction(jurisdiction: &str) -> Result<()> {
    let invalid = || Error::InvalidRequest(format!("invalid retirement jurisdiction {:?}", jurisdiction));

    let (region, postal) = match jurisdiction.split_once(' ') {
        Some((region, postal)) => (region, Some(postal)),
        None => (jurisdiction, None),
    };
    let (country, subdivision) = match region.split_once('-') {
        Some((country, subdivision)) => (country, Some(subdivision)),
        None => (region, None),
    };

    if country.len() != 2 || !country.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(invalid());
    }
    if let Some(subdivision) = subdivision {
        let ok = (1..=3).contains(&subdivision.len())
            && subdivision
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        if !ok {
            return Err(invalid());
        }
    }
    if let Some(postal) = postal {
        let ok = subdivision.is_some()
            && (1..=64).contains(&postal.len())
            && postal
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b' ' || b == b'-');
        if !ok {
            return Err(invalid());
        }
    }
    Ok(())
}
