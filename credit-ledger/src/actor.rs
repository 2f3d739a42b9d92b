//! Single-writer request actor
//!
//! The ledger core is synchronous and assumes exclusive access to the
//! records a request touches. The actor provides that: one Tokio task owns
//! the [`Ledger`], requests arrive through a bounded mailbox and are applied
//! one at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerHandle (Clone)                   │
//! │        Sends requests to actor mailbox               │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (single task)               │
//! │  per request: EventBuffer + LimitedGasMeter          │
//! │  Ledger::<op>() -> Store::commit(ChangeSet)          │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ broadcast (after commit only)
//!                       ▼
//!                 EventEnvelope subscribers
//! ```

use crate::{
    config::Config,
    events::{Event, EventBuffer, ExecContext, GasMeter, LimitedGasMeter},
    ledger::Ledger,
    metrics::Metrics,
    storage::Store,
    types::{AccountId, Basket, BasketCredit, BatchBalance, BatchSupply, CreditType, Credits, NewBatch, SendCredits},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

/// Event published once its request committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Request that produced the event
    pub request_id: Uuid,
    /// Position in the actor's event stream, starting at 1
    pub sequence: u64,
    /// The event
    pub event: Event,
}

type Responder<T> = oneshot::Sender<Result<T>>;

/// Request sent to the ledger actor
#[derive(Debug)]
pub enum Request {
    /// Register a credit type
    CreateCreditType {
        credit_type: CreditType,
        response: Responder<()>,
    },

    /// Create a batch and issue credits
    CreateBatch { batch: NewBatch, response: Responder<()> },

    /// Retire credits
    Retire {
        owner: AccountId,
        credits: Vec<Credits>,
        jurisdiction: String,
        response: Responder<()>,
    },

    /// Send credits
    Send {
        sender: AccountId,
        recipient: AccountId,
        credits: Vec<SendCredits>,
        response: Responder<()>,
    },

    /// Lock credits in escrow
    Escrow {
        owner: AccountId,
        batch_denom: String,
        amount: String,
        response: Responder<()>,
    },

    /// Release escrowed credits
    ReleaseEscrow {
        owner: AccountId,
        batch_denom: String,
        amount: String,
        response: Responder<()>,
    },

    /// Cancel credits
    Cancel {
        owner: AccountId,
        credits: Vec<Credits>,
        reason: String,
        response: Responder<()>,
    },

    /// Create a basket
    CreateBasket { basket: Basket, response: Responder<()> },

    /// Deposit credits into a basket
    PutInBasket {
        owner: AccountId,
        basket_denom: String,
        credits: Vec<Credits>,
        response: Responder<u128>,
    },

    /// Redeem pooled tokens for credits
    TakeFromBasket {
        owner: AccountId,
        basket_denom: String,
        tokens: u128,
        retire_on_take: bool,
        jurisdiction: String,
        response: Responder<Vec<BasketCredit>>,
    },

    /// Balance query
    Balance {
        address: AccountId,
        batch_denom: String,
        response: Responder<BatchBalance>,
    },

    /// Supply query
    Supply {
        batch_denom: String,
        response: Responder<BatchSupply>,
    },

    /// Pooled-token balance query
    TokenBalance {
        address: AccountId,
        denom: String,
        response: Responder<u128>,
    },

    /// Basket holdings query
    BasketBalances {
        basket_denom: String,
        response: Responder<Vec<BasketCredit>>,
    },

    /// Supply consistency check
    AuditSupply {
        batch_denom: String,
        response: Responder<()>,
    },

    /// Stop after the requests already queued
    Shutdown { response: oneshot::Sender<()> },
}

/// Actor that applies ledger requests
#[derive(Debug)]
pub struct LedgerActor<S: Store> {
    ledger: Ledger<S>,
    mailbox: mpsc::Receiver<Request>,
    events: broadcast::Sender<EventEnvelope>,
    metrics: Metrics,
    gas_limit: u64,
    sequence: u64,
}

impl<S: Store> LedgerActor<S> {
    /// Create new actor
    pub fn new(
        ledger: Ledger<S>,
        mailbox: mpsc::Receiver<Request>,
        events: broadcast::Sender<EventEnvelope>,
        metrics: Metrics,
        gas_limit: u64,
    ) -> Self {
        Self {
            ledger,
            mailbox,
            events,
            metrics,
            gas_limit,
            sequence: 0,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut shutdown_ack = None;

        while let Some(request) = self.mailbox.recv().await {
            if let Request::Shutdown { response } = request {
                self.mailbox.close();
                shutdown_ack = Some(response);
                break;
            }
            self.handle_request(request);
        }

        tracing::info!(events_published = self.sequence, "Ledger actor stopped");
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::CreateCreditType { credit_type, response } => {
                let result = self.apply("create_credit_type", |ledger, ctx| {
                    ledger.create_credit_type(ctx, credit_type)
                });
                let _ = response.send(result);
            }

            Request::CreateBatch { batch, response } => {
                let result = self.apply("create_batch", |ledger, ctx| ledger.create_batch(ctx, batch));
                let _ = response.send(result);
            }

            Request::Retire {
                owner,
                credits,
                jurisdiction,
                response,
            } => {
                let result = self.apply("retire", |ledger, ctx| {
                    ledger.retire(ctx, &owner, &credits, &jurisdiction)
                });
                let _ = response.send(result);
            }

            Request::Send {
                sender,
                recipient,
                credits,
                response,
            } => {
                let result = self.apply("send", |ledger, ctx| ledger.send(ctx, &sender, &recipient, &credits));
                let _ = response.send(result);
            }

            Request::Escrow {
                owner,
                batch_denom,
                amount,
                response,
            } => {
                let result = self.apply("escrow", |ledger, ctx| {
                    ledger.escrow(ctx, &owner, &batch_denom, &amount)
                });
                let _ = response.send(result);
            }

            Request::ReleaseEscrow {
                owner,
                batch_denom,
                amount,
                response,
            } => {
                let result = self.apply("release_escrow", |ledger, ctx| {
                    ledger.release_escrow(ctx, &owner, &batch_denom, &amount)
                });
                let _ = response.send(result);
            }

            Request::Cancel {
                owner,
                credits,
                reason,
                response,
            } => {
                let result = self.apply("cancel", |ledger, ctx| ledger.cancel(ctx, &owner, &credits, &reason));
                let _ = response.send(result);
            }

            Request::CreateBasket { basket, response } => {
                let result = self.apply("create_basket", |ledger, ctx| ledger.create_basket(ctx, basket));
                let _ = response.send(result);
            }

            Request::PutInBasket {
                owner,
                basket_denom,
                credits,
                response,
            } => {
                let result = self.apply("put_in_basket", |ledger, ctx| {
                    ledger.put_in_basket(ctx, &owner, &basket_denom, &credits)
                });
                let _ = response.send(result);
            }

            Request::TakeFromBasket {
                owner,
                basket_denom,
                tokens,
                retire_on_take,
                jurisdiction,
                response,
            } => {
                let result = self.apply("take_from_basket", |ledger, ctx| {
                    ledger.take_from_basket(ctx, &owner, &basket_denom, tokens, retire_on_take, &jurisdiction)
                });
                let _ = response.send(result);
            }

            Request::Balance {
                address,
                batch_denom,
                response,
            } => {
                let _ = response.send(self.ledger.balance(&address, &batch_denom));
            }

            Request::Supply { batch_denom, response } => {
                let _ = response.send(self.ledger.supply(&batch_denom));
            }

            Request::TokenBalance {
                address,
                denom,
                response,
            } => {
                let _ = response.send(self.ledger.token_balance(&address, &denom));
            }

            Request::BasketBalances { basket_denom, response } => {
                let _ = response.send(self.ledger.basket_balances(&basket_denom));
            }

            Request::AuditSupply { batch_denom, response } => {
                let _ = response.send(self.ledger.audit_supply(&batch_denom));
            }

            Request::Shutdown { .. } => {
                // Handled in run loop
            }
        }
    }

    /// Run one state-changing request with fresh side-effect sinks
    fn apply<T>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&Ledger<S>, &mut ExecContext<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut buffer = EventBuffer::new();
        let mut gas = LimitedGasMeter::new(self.gas_limit);
        let result = {
            let mut ctx = ExecContext::new(&mut buffer, &mut gas);
            f(&self.ledger, &mut ctx)
        };

        match result {
            Ok(output) => {
                self.metrics.record_success(operation, gas.consumed());
                self.publish(buffer.drain());
                Ok(output)
            }
            Err(e) => {
                // Buffered events belong to the rolled back request
                self.metrics.record_failure(operation);
                tracing::warn!(operation, error = %e, "Request rejected");
                Err(e)
            }
        }
    }

    fn publish(&mut self, events: Vec<Event>) {
        let request_id = Uuid::now_v7();
        for event in events {
            self.sequence += 1;
            self.metrics.record_event(event.kind());
            // No subscribers is not an error
            let _ = self.events.send(EventEnvelope {
                request_id,
                sequence: self.sequence,
                event,
            });
        }
    }
}

/// Handle for sending requests to the actor
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<Request>,
    events: broadcast::Sender<EventEnvelope>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<Request>, events: broadcast::Sender<EventEnvelope>) -> Self {
        Self { sender, events }
    }

    /// Receive every event committed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(Responder<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Register a credit type
    pub async fn create_credit_type(&self, credit_type: CreditType) -> Result<()> {
        self.request(|response| Request::CreateCreditType { credit_type, response })
            .await
    }

    /// Create a batch and issue credits
    pub async fn create_batch(&self, batch: NewBatch) -> Result<()> {
        self.request(|response| Request::CreateBatch { batch, response }).await
    }

    /// Retire credits (permanent)
    pub async fn retire(&self, owner: AccountId, credits: Vec<Credits>, jurisdiction: impl Into<String>) -> Result<()> {
        let jurisdiction = jurisdiction.into();
        self.request(|response| Request::Retire {
            owner,
            credits,
            jurisdiction,
            response,
        })
        .await
    }

    /// Send credits
    pub async fn send(&self, sender: AccountId, recipient: AccountId, credits: Vec<SendCredits>) -> Result<()> {
        self.request(|response| Request::Send {
            sender,
            recipient,
            credits,
            response,
        })
        .await
    }

    /// Lock credits in escrow
    pub async fn escrow(&self, owner: AccountId, batch_denom: impl Into<String>, amount: impl Into<String>) -> Result<()> {
        let (batch_denom, amount) = (batch_denom.into(), amount.into());
        self.request(|response| Request::Escrow {
            owner,
            batch_denom,
            amount,
            response,
        })
        .await
    }

    /// Release escrowed credits
    pub async fn release_escrow(
        &self,
        owner: AccountId,
        batch_denom: impl Into<String>,
        amount: impl Into<String>,
    ) -> Result<()> {
        let (batch_denom, amount) = (batch_denom.into(), amount.into());
        self.request(|response| Request::ReleaseEscrow {
            owner,
            batch_denom,
            amount,
            response,
        })
        .await
    }

    /// Cancel credits
    pub async fn cancel(&self, owner: AccountId, credits: Vec<Credits>, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.request(|response| Request::Cancel {
            owner,
            credits,
            reason,
            response,
        })
        .await
    }

    /// Create a basket
    pub async fn create_basket(&self, basket: Basket) -> Result<()> {
        self.request(|response| Request::CreateBasket { basket, response }).await
    }

    /// Deposit credits into a basket, returning the tokens minted
    pub async fn put_in_basket(
        &self,
        owner: AccountId,
        basket_denom: impl Into<String>,
        credits: Vec<Credits>,
    ) -> Result<u128> {
        let basket_denom = basket_denom.into();
        self.request(|response| Request::PutInBasket {
            owner,
            basket_denom,
            credits,
            response,
        })
        .await
    }

    /// Redeem pooled tokens for credits
    pub async fn take_from_basket(
        &self,
        owner: AccountId,
        basket_denom: impl Into<String>,
        tokens: u128,
        retire_on_take: bool,
        jurisdiction: impl Into<String>,
    ) -> Result<Vec<BasketCredit>> {
        let (basket_denom, jurisdiction) = (basket_denom.into(), jurisdiction.into());
        self.request(|response| Request::TakeFromBasket {
            owner,
            basket_denom,
            tokens,
            retire_on_take,
            jurisdiction,
            response,
        })
        .await
    }

    /// Balance of one owner for one batch
    pub async fn balance(&self, address: AccountId, batch_denom: impl Into<String>) -> Result<BatchBalance> {
        let batch_denom = batch_denom.into();
        self.request(|response| Request::Balance {
            address,
            batch_denom,
            response,
        })
        .await
    }

    /// Supply of a batch
    pub async fn supply(&self, batch_denom: impl Into<String>) -> Result<BatchSupply> {
        let batch_denom = batch_denom.into();
        self.request(|response| Request::Supply { batch_denom, response })
            .await
    }

    /// Pooled-token balance
    pub async fn token_balance(&self, address: AccountId, denom: impl Into<String>) -> Result<u128> {
        let denom = denom.into();
        self.request(|response| Request::TokenBalance {
            address,
            denom,
            response,
        })
        .await
    }

    /// Credits held by a basket
    pub async fn basket_balances(&self, basket_denom: impl Into<String>) -> Result<Vec<BasketCredit>> {
        let basket_denom = basket_denom.into();
        self.request(|response| Request::BasketBalances { basket_denom, response })
            .await
    }

    /// Check supply against balances
    pub async fn audit_supply(&self, batch_denom: impl Into<String>) -> Result<()> {
        let batch_denom = batch_denom.into();
        self.request(|response| Request::AuditSupply { batch_denom, response })
            .await
    }

    /// Shutdown actor, waiting for queued requests to finish
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Request::Shutdown { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        rx.await
            .map_err(|_| Error::Concurrency("Actor stopped without acknowledging shutdown".to_string()))
    }
}

/// Spawn the ledger actor over `store`
pub fn spawn_ledger_actor<S>(store: S, config: &Config, metrics: Metrics) -> LedgerHandle
where
    S: Store + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.actor.mailbox_capacity); // Bounded channel for backpressure
    let (events_tx, _) = broadcast::channel(config.actor.event_channel_capacity);

    let ledger = Ledger::with_gas_cost(store, config.gas.cost_per_item);
    let actor = LedgerActor::new(ledger, rx, events_tx.clone(), metrics, config.gas.request_limit);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx, events_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, RocksStore};
    use crate::types::BatchIssuance;
    use chrono::NaiveDate;

    const BATCH: &str = "C01-001-20200101-20210101-001";

    fn owner() -> AccountId {
        AccountId::new("regen1owner")
    }

    async fn seed(handle: &LedgerHandle) {
        handle
            .create_credit_type(CreditType {
                abbreviation: "C".to_string(),
                name: "carbon".to_string(),
                unit: "metric ton CO2 equivalent".to_string(),
                precision: 6,
            })
            .await
            .unwrap();
        handle
            .create_batch(NewBatch {
                denom: BATCH.to_string(),
                credit_type_abbrev: "C".to_string(),
                issuer: AccountId::new("regen1issuer"),
                start_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
                metadata: String::new(),
                issuance: vec![BatchIssuance {
                    recipient: owner(),
                    tradable_amount: "100.000000".to_string(),
                    retired_amount: String::new(),
                    retirement_jurisdiction: String::new(),
                }],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let handle = spawn_ledger_actor(MemoryStore::new(), &Config::default(), Metrics::new().unwrap());
        handle.shutdown().await.unwrap();

        let result = handle.supply(BATCH).await;
        assert!(matches!(result, Err(Error::Concurrency(_))));
    }

    #[tokio::test]
    async fn test_events_published_after_commit() {
        let metrics = Metrics::new().unwrap();
        let handle = spawn_ledger_actor(MemoryStore::new(), &Config::default(), metrics.clone());
        seed(&handle).await;

        let mut events = handle.subscribe();
        handle
            .retire(owner(), vec![Credits::new(BATCH, "30.000000")], "US-WA")
            .await
            .unwrap();

        let envelope = events.recv().await.unwrap();
        assert!(matches!(envelope.event, Event::Retire { ref amount, .. } if amount == "30.000000"));

        // Failed request publishes nothing
        let err = handle
            .retire(owner(), vec![Credits::new(BATCH, "80.000000")], "US-WA")
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::InsufficientBalance { .. }));
        assert!(matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));

        let balance = handle.balance(owner(), BATCH).await.unwrap();
        assert_eq!(balance.tradable_amount, "70.000000");
        assert_eq!(balance.retired_amount, "30.000000");

        assert_eq!(metrics.requests_total.with_label_values(&["retire"]).get(), 1);
        assert_eq!(metrics.request_failures_total.with_label_values(&["retire"]).get(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequence_spans_requests() {
        let handle = spawn_ledger_actor(MemoryStore::new(), &Config::default(), Metrics::new().unwrap());
        let mut events = handle.subscribe();
        seed(&handle).await;

        // create_credit_type, create_batch, mint
        let sequences: Vec<u64> = [
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.sequence)
        .collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_gas_limit() {
        let mut config = Config::default();
        config.gas.request_limit = 25;
        let handle = spawn_ledger_actor(MemoryStore::new(), &config, Metrics::new().unwrap());
        seed(&handle).await;

        let items = vec![
            Credits::new(BATCH, "1"),
            Credits::new(BATCH, "1"),
            Credits::new(BATCH, "1"),
        ];
        let err = handle.retire(owner(), items, "US").await.unwrap_err();
        assert!(matches!(err.root(), Error::OutOfGas { limit: 25, .. }));

        let supply = handle.supply(BATCH).await.unwrap();
        assert_eq!(supply.retired_amount, "0");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_actor_over_rocksdb() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(temp_dir.path(), &Default::default()).unwrap();
        let handle = spawn_ledger_actor(store, &Config::default(), Metrics::new().unwrap());
        seed(&handle).await;

        handle.escrow(owner(), BATCH, "40").await.unwrap();
        handle
            .cancel(owner(), vec![Credits::new(BATCH, "10")], "issuer error")
            .await
            .unwrap();
        handle.audit_supply(BATCH).await.unwrap();

        let balance = handle.balance(owner(), BATCH).await.unwrap();
        assert_eq!(balance.tradable_amount, "50.000000");
        assert_eq!(balance.escrowed_amount, "40");

        handle.shutdown().await.unwrap();
    }
}
