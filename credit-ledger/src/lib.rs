//! Ecological Credit Ledger Core
//!
//! Balance and supply bookkeeping for ecological credits: fixed-precision
//! decimal arithmetic, per-owner tradable / retired / escrowed balances,
//! per-batch supply, and basket pooling with integral pooled tokens.
//!
//! # Architecture
//!
//! - **Pure transitions**: balance and supply changes are computed on values
//!   and never touch storage
//! - **One commit per request**: a multi-item request either commits every
//!   item or nothing
//! - **Explicit side effects**: events and gas go through sinks handed to
//!   each operation
//! - **Single Writer**: the actor serializes requests over one store
//!
//! # Invariants
//!
//! - No balance or supply field is ever negative
//! - Supply tradable = Σ(tradable + escrowed), supply retired = Σ(retired)
//! - Retirement is irreversible
//! - Amounts never carry more fractional digits than their credit type allows

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod amount;
pub mod balance;
pub mod basket;
pub mod config;
pub mod decimal;
pub mod error;
pub mod events;
pub mod ledger;
pub mod metrics;
pub mod storage;
pub mod supply;
pub mod types;

// Re-exports
pub use actor::{spawn_ledger_actor, EventEnvelope, LedgerHandle};
pub use amount::CreditAmount;
pub use config::Config;
pub use decimal::Dec;
pub use error::{Error, Result};
pub use events::{Event, EventBuffer, EventSink, ExecContext, GasMeter, InfiniteGasMeter, LimitedGasMeter};
pub use ledger::Ledger;
pub use metrics::Metrics;
pub use storage::{ChangeSet, MemoryStore, RocksStore, Store};
pub use types::{
    AccountId, Basket, BasketCredit, Batch, BatchBalance, BatchIssuance, BatchSupply, CreditType, Credits,
    NewBatch, SendCredits, TokenBalance,
};
