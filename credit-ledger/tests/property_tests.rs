//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Conservation: supply always equals the sum of balances
//! - Non-negativity: no balance or supply field ever goes below zero
//! - Atomicity: a rejected request leaves every record untouched
//! - Decimal round trip: format then parse is lossless
//! - Basket conversion never hands back more credits than were deposited
//! - Every pooled token is backed by credits held in the basket

use chrono::NaiveDate;
use credit_ledger::{
    basket::{credits_to_tokens, tokens_to_credits},
    AccountId, Basket, BatchBalance, BatchIssuance, BatchSupply, CreditAmount, CreditType, Credits, Dec,
    EventBuffer, ExecContext, InfiniteGasMeter, Ledger, MemoryStore, NewBatch, SendCredits,
};
use proptest::prelude::*;
use rust_decimal::Decimal;

const PRECISION: u32 = 6;
const BATCHES: [&str; 2] = ["C01-001-20190101-20200101-001", "C01-001-20200101-20210101-002"];
const OWNERS: [&str; 3] = ["regen1alice", "regen1bob", "regen1carol"];
const BASKET: &str = "eco.uC.NCT";

/// Owners plus the basket pseudo-account, which must never be able to act
const ACCOUNTS: usize = OWNERS.len() + 1;

fn account(index: usize) -> AccountId {
    match OWNERS.get(index) {
        Some(owner) => AccountId::new(*owner),
        None => AccountId::basket(BASKET),
    }
}

/// A micro-credit count rendered at precision 6
fn micros(value: u64) -> String {
    format!("{}.{:06}", value / 1_000_000, value % 1_000_000)
}

#[derive(Debug, Clone)]
enum Op {
    Retire { owner: usize, batch: usize, amount: u64 },
    RetirePair { owner: usize, first: u64, second: u64 },
    Send { from: usize, to: usize, batch: usize, tradable: u64, retired: u64 },
    Escrow { owner: usize, batch: usize, amount: u64 },
    Release { owner: usize, batch: usize, amount: u64 },
    Cancel { owner: usize, batch: usize, amount: u64 },
    Put { owner: usize, batch: usize, amount: u64 },
    Take { owner: usize, tokens: u64, retire: bool },
}

/// Strategy for generating amounts, zero and overdrafts included
fn amount_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![
        Just(0u64),
        1u64..1_000_000u64,
        1_000_000u64..120_000_000u64,
    ]
}

/// Strategy for generating ledger operations
fn op_strategy() -> impl Strategy<Value = Op> {
    let owner = 0..ACCOUNTS;
    let batch = 0..BATCHES.len();
    prop_oneof![
        (owner.clone(), batch.clone(), amount_strategy())
            .prop_map(|(owner, batch, amount)| Op::Retire { owner, batch, amount }),
        (owner.clone(), amount_strategy(), amount_strategy())
            .prop_map(|(owner, first, second)| Op::RetirePair { owner, first, second }),
        (owner.clone(), owner.clone(), batch.clone(), amount_strategy(), amount_strategy()).prop_map(
            |(from, to, batch, tradable, retired)| Op::Send { from, to, batch, tradable, retired }
        ),
        (owner.clone(), batch.clone(), amount_strategy())
            .prop_map(|(owner, batch, amount)| Op::Escrow { owner, batch, amount }),
        (owner.clone(), batch.clone(), amount_strategy())
            .prop_map(|(owner, batch, amount)| Op::Release { owner, batch, amount }),
        (owner.clone(), batch.clone(), amount_strategy())
            .prop_map(|(owner, batch, amount)| Op::Cancel { owner, batch, amount }),
        (owner.clone(), batch, amount_strategy()).prop_map(|(owner, batch, amount)| Op::Put { owner, batch, amount }),
        (owner, amount_strategy(), any::<bool>()).prop_map(|(owner, tokens, retire)| Op::Take { owner, tokens, retire }),
    ]
}

/// Ledger with two batches and one basket, every owner holding 100 credits of each
fn create_test_ledger() -> Ledger<MemoryStore> {
    let ledger = Ledger::new(MemoryStore::new());
    let mut events = EventBuffer::new();
    let mut gas = InfiniteGasMeter::new();
    let mut ctx = ExecContext::new(&mut events, &mut gas);

    ledger
        .create_credit_type(
            &mut ctx,
            CreditType {
                abbreviation: "C".to_string(),
                name: "carbon".to_string(),
                unit: "metric ton CO2 equivalent".to_string(),
                precision: PRECISION,
            },
        )
        .unwrap();

    for (year, denom) in [2019, 2020].into_iter().zip(BATCHES) {
        let issuance = OWNERS
            .iter()
            .map(|owner| BatchIssuance {
                recipient: AccountId::new(*owner),
                tradable_amount: "100".to_string(),
                retired_amount: String::new(),
                retirement_jurisdiction: String::new(),
            })
            .collect();
        ledger
            .create_batch(
                &mut ctx,
                NewBatch {
                    denom: denom.to_string(),
                    credit_type_abbrev: "C".to_string(),
                    issuer: AccountId::new("regen1issuer"),
                    start_date: NaiveDate::from_ymd_opt(year, 1, 1).unwrap(),
                    end_date: NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap(),
                    metadata: String::new(),
                    issuance,
                },
            )
            .unwrap();
    }

    ledger
        .create_basket(
            &mut ctx,
            Basket {
                basket_denom: BASKET.to_string(),
                name: "NCT".to_string(),
                credit_type_abbrev: "C".to_string(),
                exponent: PRECISION,
                disable_auto_retire: true,
                curator: AccountId::new("regen1curator"),
            },
        )
        .unwrap();
    ledger
}

fn apply(ledger: &Ledger<MemoryStore>, op: &Op) -> credit_ledger::Result<()> {
    let mut events = EventBuffer::new();
    let mut gas = InfiniteGasMeter::new();
    let mut ctx = ExecContext::new(&mut events, &mut gas);

    match *op {
        Op::Retire { owner, batch, amount } => {
            ledger.retire(&mut ctx, &account(owner), &[Credits::new(BATCHES[batch], micros(amount))], "US")
        }
        Op::RetirePair { owner, first, second } => {
            let items = [
                Credits::new(BATCHES[0], micros(first)),
                Credits::new(BATCHES[1], micros(second)),
            ];
            ledger.retire(&mut ctx, &account(owner), &items, "US")
        }
        Op::Send { from, to, batch, tradable, retired } => {
            let item = SendCredits {
                batch_denom: BATCHES[batch].to_string(),
                tradable_amount: micros(tradable),
                retired_amount: micros(retired),
                retirement_jurisdiction: "US-WA".to_string(),
            };
            ledger.send(&mut ctx, &account(from), &account(to), &[item])
        }
        Op::Escrow { owner, batch, amount } => ledger.escrow(&mut ctx, &account(owner), BATCHES[batch], &micros(amount)),
        Op::Release { owner, batch, amount } => {
            ledger.release_escrow(&mut ctx, &account(owner), BATCHES[batch], &micros(amount))
        }
        Op::Cancel { owner, batch, amount } => {
            ledger.cancel(&mut ctx, &account(owner), &[Credits::new(BATCHES[batch], micros(amount))], "test")
        }
        Op::Put { owner, batch, amount } => ledger
            .put_in_basket(&mut ctx, &account(owner), BASKET, &[Credits::new(BATCHES[batch], micros(amount))])
            .map(|_| ()),
        Op::Take { owner, tokens, retire } => ledger
            .take_from_basket(&mut ctx, &account(owner), BASKET, u128::from(tokens), retire, "US")
            .map(|_| ()),
    }
}

type Snapshot = (Vec<(Vec<BatchBalance>, BatchSupply)>, Vec<u128>);

fn snapshot(ledger: &Ledger<MemoryStore>) -> Snapshot {
    let batches = BATCHES
        .iter()
        .map(|denom| {
            (
                ledger.balances_by_batch(denom).unwrap(),
                ledger.supply(denom).unwrap(),
            )
        })
        .collect();
    let tokens = (0..ACCOUNTS)
        .map(|i| ledger.token_balance(&account(i), BASKET).unwrap())
        .collect();
    (batches, tokens)
}

/// Pooled tokens outstanding and the tokens the basket's holdings back
fn token_backing(ledger: &Ledger<MemoryStore>) -> (u128, u128) {
    let outstanding = (0..ACCOUNTS)
        .map(|i| ledger.token_balance(&account(i), BASKET).unwrap())
        .sum();
    let backed = ledger
        .basket_balances(BASKET)
        .unwrap()
        .iter()
        .map(|held| credits_to_tokens(&parse(&held.amount), PRECISION).unwrap())
        .sum();
    (outstanding, backed)
}

fn parse(s: &str) -> CreditAmount {
    CreditAmount::parse(s, PRECISION).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: supply matches balances and nothing goes negative after every step
    #[test]
    fn prop_conservation_and_non_negativity(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let ledger = create_test_ledger();
        let issued = parse("300");

        for op in &ops {
            let _ = apply(&ledger, op);

            for denom in BATCHES {
                prop_assert!(ledger.audit_supply(denom).is_ok(), "audit failed after {:?}", op);

                for record in ledger.balances_by_batch(denom).unwrap() {
                    prop_assert!(CreditAmount::parse(&record.tradable_amount, PRECISION).is_ok());
                    prop_assert!(CreditAmount::parse(&record.retired_amount, PRECISION).is_ok());
                    prop_assert!(CreditAmount::parse(&record.escrowed_amount, PRECISION).is_ok());
                }

                let supply = ledger.supply(denom).unwrap();
                let total = parse(&supply.tradable_amount)
                    .add(&parse(&supply.retired_amount))
                    .unwrap()
                    .add(&parse(&supply.cancelled_amount))
                    .unwrap();
                prop_assert!(total.cmp_value(&issued).is_eq());
            }

            let (outstanding, backed) = token_backing(&ledger);
            prop_assert!(outstanding <= backed, "{} tokens backed by {} after {:?}", outstanding, backed, op);
        }
    }

    /// Property: a rejected request changes no record
    #[test]
    fn prop_rejected_requests_change_nothing(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let ledger = create_test_ledger();

        for op in &ops {
            let before = snapshot(&ledger);
            if apply(&ledger, op).is_err() {
                prop_assert_eq!(snapshot(&ledger), before);
            }
        }
    }

    /// Property: retired balances never decrease
    #[test]
    fn prop_retired_is_monotonic(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let ledger = create_test_ledger();
        let owner = AccountId::new(OWNERS[0]);

        let mut last = parse("0");
        for op in &ops {
            let _ = apply(&ledger, op);
            let retired = parse(&ledger.balance(&owner, BATCHES[0]).unwrap().retired_amount);
            prop_assert!(retired.cmp_value(&last).is_ge());
            last = retired;
        }
    }

    /// Property: decimal formatting round-trips exactly
    #[test]
    fn prop_decimal_round_trip(mantissa in any::<i64>(), scale in 0u32..=18) {
        let value = Dec::from(Decimal::new(mantissa, scale));
        let formatted = value.to_string();
        let parsed: Dec = formatted.parse().unwrap();

        prop_assert_eq!(parsed, value);
        prop_assert_eq!(parsed.to_string(), formatted);
    }

    /// Property: subtraction fails exactly when the result would be negative
    #[test]
    fn prop_sub_never_negative(a in 0u64..1_000_000_000u64, b in 0u64..1_000_000_000u64) {
        let (lhs, rhs) = (parse(&micros(a)), parse(&micros(b)));
        let result = lhs.sub(&rhs);

        if b > a {
            prop_assert!(result.is_err());
        } else {
            let diff = result.unwrap();
            prop_assert!(diff.cmp_value(&parse(&micros(a - b))).is_eq());
        }
    }

    /// Property: deposit then redeem never gains, and loses less than one token
    #[test]
    fn prop_basket_round_trip_bound(amount in 0u64..1_000_000_000_000u64, exponent in 0u32..=12) {
        let deposit = parse(&micros(amount));
        let tokens = credits_to_tokens(&deposit, exponent).unwrap();
        let back = tokens_to_credits(tokens, exponent, PRECISION).unwrap();

        prop_assert!(back.cmp_value(&deposit).is_le());

        let loss = deposit.value().sub(&back.value()).unwrap();
        prop_assert!(loss < Dec::from_scaled(1, exponent).unwrap());

        if exponent >= PRECISION {
            prop_assert!(back.cmp_value(&deposit).is_eq());
        }
    }
}
