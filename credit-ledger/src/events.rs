//! Side-effect sinks: events and gas metering
//!
//! The ledger never reaches for ambient state. Each request is handed an
//! [`ExecContext`] carrying the event sink and the gas meter; both are called
//! once per successful item, after that item's arithmetic.

use crate::{types::AccountId, Error, Result};
use serde::{Deserialize, Serialize};

/// Notification for one applied transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Credit type registered
    CreateCreditType {
        /// Abbreviation
        abbreviation: String,
    },
    /// Batch created
    CreateBatch {
        /// Batch
        batch_denom: String,
        /// Issuer
        issuer: AccountId,
    },
    /// Credits issued to a recipient
    Mint {
        /// Batch
        batch_denom: String,
        /// Recipient
        recipient: AccountId,
        /// Tradable part
        tradable_amount: String,
        /// Retired part
        retired_amount: String,
    },
    /// Credits moved between owners
    Transfer {
        /// Sender
        sender: AccountId,
        /// Recipient
        recipient: AccountId,
        /// Batch
        batch_denom: String,
        /// Tradable part
        tradable_amount: String,
        /// Retired part
        retired_amount: String,
    },
    /// Credits retired
    Retire {
        /// Owner the retirement is attributed to
        owner: AccountId,
        /// Batch
        batch_denom: String,
        /// Amount
        amount: String,
        /// Retirement jurisdiction
        jurisdiction: String,
    },
    /// Credits cancelled
    Cancel {
        /// Owner
        owner: AccountId,
        /// Batch
        batch_denom: String,
        /// Amount
        amount: String,
        /// Free-form reason
        reason: String,
    },
    /// Credits locked in escrow
    Escrow {
        /// Owner
        owner: AccountId,
        /// Batch
        batch_denom: String,
        /// Amount
        amount: String,
    },
    /// Escrowed credits returned to tradable
    ReleaseEscrow {
        /// Owner
        owner: AccountId,
        /// Batch
        batch_denom: String,
        /// Amount
        amount: String,
    },
    /// Basket created
    CreateBasket {
        /// Basket denom
        basket_denom: String,
        /// Curator
        curator: AccountId,
    },
    /// Credits deposited into a basket
    BasketPut {
        /// Depositor
        owner: AccountId,
        /// Basket
        basket_denom: String,
        /// Batch
        batch_denom: String,
        /// Credits deposited
        amount: String,
        /// Pooled tokens minted for this deposit
        tokens: u128,
    },
    /// Pooled tokens burned for credits
    BasketTake {
        /// Owner
        owner: AccountId,
        /// Basket
        basket_denom: String,
        /// Pooled tokens burned
        tokens: u128,
        /// Credits received, retired when `retired` is set
        credits: Vec<crate::types::BasketCredit>,
        /// Whether the credits were retired on receipt
        retired: bool,
    },
}

impl Event {
    /// Short label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Event::CreateCreditType { .. } => "create_credit_type",
            Event::CreateBatch { .. } => "create_batch",
            Event::Mint { .. } => "mint",
            Event::Transfer { .. } => "transfer",
            Event::Retire { .. } => "retire",
            Event::Cancel { .. } => "cancel",
            Event::Escrow { .. } => "escrow",
            Event::ReleaseEscrow { .. } => "release_escrow",
            Event::CreateBasket { .. } => "create_basket",
            Event::BasketPut { .. } => "basket_put",
            Event::BasketTake { .. } => "basket_take",
        }
    }
}

/// Receives one event per applied transition, in application order
pub trait EventSink {
    /// Accept an event; an error aborts the enclosing request
    fn emit(&mut self, event: Event) -> Result<()>;
}

/// Event sink that keeps everything in memory
///
/// The request owner discards the buffer when the request fails and
/// publishes it once the store commit succeeded.
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Vec<Event>,
}

impl EventBuffer {
    /// Create empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Events emitted so far
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Take the buffered events
    pub fn drain(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

impl EventSink for EventBuffer {
    fn emit(&mut self, event: Event) -> Result<()> {
        tracing::trace!(kind = event.kind(), "Event buffered");
        self.events.push(event);
        Ok(())
    }
}

/// Per-item cost accounting
pub trait GasMeter {
    /// Charge `amount`; an error aborts the enclosing request
    fn consume(&mut self, amount: u64, descriptor: &str) -> Result<()>;

    /// Gas consumed so far
    fn consumed(&self) -> u64;
}

/// Gas meter with a hard limit
#[derive(Debug, Clone)]
pub struct LimitedGasMeter {
    limit: u64,
    consumed: u64,
}

impl LimitedGasMeter {
    /// Create meter with limit
    pub fn new(limit: u64) -> Self {
        Self { limit, consumed: 0 }
    }

    /// Gas left before the limit
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.consumed)
    }
}

impl GasMeter for LimitedGasMeter {
    fn consume(&mut self, amount: u64, descriptor: &str) -> Result<()> {
        let consumed = self.consumed.saturating_add(amount);
        if consumed > self.limit {
            return Err(Error::OutOfGas {
                limit: self.limit,
                consumed,
                descriptor: descriptor.to_string(),
            });
        }
        self.consumed = consumed;
        Ok(())
    }

    fn consumed(&self) -> u64 {
        self.consumed
    }
}

/// Gas meter that only counts
#[derive(Debug, Clone, Default)]
pub struct InfiniteGasMeter {
    consumed: u64,
}

impl InfiniteGasMeter {
    /// Create meter
    pub fn new() -> Self {
        Self::default()
    }
}

impl GasMeter for InfiniteGasMeter {
    fn consume(&mut self, amount: u64, _descriptor: &str) -> Result<()> {
        self.consumed = self.consumed.saturating_add(amount);
        Ok(())
    }

    fn consumed(&self) -> u64 {
        self.consumed
    }
}

/// Side-effect channels for one request
pub struct ExecContext<'a> {
    /// Event sink
    pub events: &'a mut dyn EventSink,
    /// Gas meter
    pub gas: &'a mut dyn GasMeter,
}

impl<'a> ExecContext<'a> {
    /// Bundle a sink and a meter
    pub fn new(events: &'a mut dyn EventSink, gas: &'a mut dyn GasMeter) -> Self {
        Self { events, gas }
    }

    /// Emit an event
    pub fn emit(&mut self, event: Event) -> Result<()> {
        self.events.emit(event)
    }

    /// Charge gas
    pub fn consume_gas(&mut self, amount: u64, descriptor: &str) -> Result<()> {
        self.gas.consume(amount, descriptor)
    }
}

impl std::fmt::Debug for ExecContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("gas_consumed", &self.gas.consumed())
            .finish()
    }
}
