//! Storage collaborator
//!
//! The ledger reads typed records through [`Store`] and hands back every
//! replacement record of a request in one [`ChangeSet`], which the store
//! applies atomically. Two implementations:
//!
//! - [`MemoryStore`] - `BTreeMap`s behind a lock, for tests and embedding
//! - [`RocksStore`] - RocksDB column families, bincode values
//!
//! # Column Families
//!
//! - `credit_types` - key: abbreviation
//! - `batches` - key: batch denom
//! - `balances` - key: address || 0x00 || batch denom
//! - `balances_by_batch` - index, key: batch denom || 0x00 || address
//! - `supplies` - key: batch denom
//! - `baskets` - key: basket denom
//! - `tokens` - pooled-token balances, key: address || 0x00 || denom

use crate::{
    config::StorageConfig,
    error::{Error, Result},
    types::{AccountId, Basket, Batch, BatchBalance, BatchSupply, CreditType, TokenBalance},
};
use parking_lot::RwLock;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Column family names
const CF_CREDIT_TYPES: &str = "credit_types";
const CF_BATCHES: &str = "batches";
const CF_BALANCES: &str = "balances";
const CF_BALANCES_BY_BATCH: &str = "balances_by_batch";
const CF_SUPPLIES: &str = "supplies";
const CF_BASKETS: &str = "baskets";
const CF_TOKENS: &str = "tokens";

const KEY_SEPARATOR: u8 = 0x00;

/// Replacement records produced by one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Credit types to insert or replace
    pub credit_types: Vec<CreditType>,
    /// Batches to insert or replace
    pub batches: Vec<Batch>,
    /// Balances to insert or replace
    pub balances: Vec<BatchBalance>,
    /// Supplies to insert or replace
    pub supplies: Vec<BatchSupply>,
    /// Baskets to insert or replace
    pub baskets: Vec<Basket>,
    /// Pooled-token balances to insert or replace
    pub token_balances: Vec<TokenBalance>,
}

impl ChangeSet {
    /// True when nothing would be written
    pub fn is_empty(&self) -> bool {
        self.credit_types.is_empty()
            && self.batches.is_empty()
            && self.balances.is_empty()
            && self.supplies.is_empty()
            && self.baskets.is_empty()
            && self.token_balances.is_empty()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.credit_types.len()
            + self.batches.len()
            + self.balances.len()
            + self.supplies.len()
            + self.baskets.len()
            + self.token_balances.len()
    }
}

/// Keyed record access used by the ledger
///
/// `Ok(None)` means the record does not exist, which is distinct from a
/// record holding zero.
pub trait Store {
    /// Credit type by abbreviation
    fn get_credit_type(&self, abbreviation: &str) -> Result<Option<CreditType>>;

    /// Batch by denom
    fn get_batch(&self, denom: &str) -> Result<Option<Batch>>;

    /// Balance of one owner for one batch
    fn get_balance(&self, address: &AccountId, batch_denom: &str) -> Result<Option<BatchBalance>>;

    /// Supply of one batch
    fn get_supply(&self, batch_denom: &str) -> Result<Option<BatchSupply>>;

    /// Basket by denom
    fn get_basket(&self, basket_denom: &str) -> Result<Option<Basket>>;

    /// Pooled-token balance
    fn get_token_balance(&self, address: &AccountId, denom: &str) -> Result<Option<TokenBalance>>;

    /// All balances of a batch, ordered by address
    fn list_balances_by_batch(&self, batch_denom: &str) -> Result<Vec<BatchBalance>>;

    /// All balances of an owner, ordered by batch denom
    fn list_balances_by_account(&self, address: &AccountId) -> Result<Vec<BatchBalance>>;

    /// Apply every record of the change set, or none
    fn commit(&self, changes: ChangeSet) -> Result<()>;
}

// In-memory store

#[derive(Debug, Default)]
struct Tables {
    credit_types: BTreeMap<String, CreditType>,
    batches: BTreeMap<String, Batch>,
    balances: BTreeMap<(AccountId, String), BatchBalance>,
    supplies: BTreeMap<String, BatchSupply>,
    baskets: BTreeMap<String, Basket>,
    tokens: BTreeMap<(AccountId, String), TokenBalance>,
}

/// Store backed by in-memory maps
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get_credit_type(&self, abbreviation: &str) -> Result<Option<CreditType>> {
        Ok(self.tables.read().credit_types.get(abbreviation).cloned())
    }

    fn get_batch(&self, denom: &str) -> Result<Option<Batch>> {
        Ok(self.tables.read().batches.get(denom).cloned())
    }

    fn get_balance(&self, address: &AccountId, batch_denom: &str) -> Result<Option<BatchBalance>> {
        let key = (address.clone(), batch_denom.to_string());
        Ok(self.tables.read().balances.get(&key).cloned())
    }

    fn get_supply(&self, batch_denom: &str) -> Result<Option<BatchSupply>> {
        Ok(self.tables.read().supplies.get(batch_denom).cloned())
    }

    fn get_basket(&self, basket_denom: &str) -> Result<Option<Basket>> {
        Ok(self.tables.read().baskets.get(basket_denom).cloned())
    }

    fn get_token_balance(&self, address: &AccountId, denom: &str) -> Result<Option<TokenBalance>> {
        let key = (address.clone(), denom.to_string());
        Ok(self.tables.read().tokens.get(&key).cloned())
    }

    fn list_balances_by_batch(&self, batch_denom: &str) -> Result<Vec<BatchBalance>> {
        Ok(self
            .tables
            .read()
            .balances
            .values()
            .filter(|b| b.batch_denom == batch_denom)
            .cloned()
            .collect())
    }

    fn list_balances_by_account(&self, address: &AccountId) -> Result<Vec<BatchBalance>> {
        Ok(self
            .tables
            .read()
            .balances
            .values()
            .filter(|b| &b.address == address)
            .cloned()
            .collect())
    }

    fn commit(&self, changes: ChangeSet) -> Result<()> {
        let mut tables = self.tables.write();

        for credit_type in changes.credit_types {
            tables.credit_types.insert(credit_type.abbreviation.clone(), credit_type);
        }
        for batch in changes.batches {
            tables.batches.insert(batch.denom.clone(), batch);
        }
        for balance in changes.balances {
            let key = (balance.address.clone(), balance.batch_denom.clone());
            tables.balances.insert(key, balance);
        }
        for supply in changes.supplies {
            tables.supplies.insert(supply.batch_denom.clone(), supply);
        }
        for basket in changes.baskets {
            tables.baskets.insert(basket.basket_denom.clone(), basket);
        }
        for token in changes.token_balances {
            let key = (token.address.clone(), token.denom.clone());
            tables.tokens.insert(key, token);
        }

        Ok(())
    }
}

// RocksDB store

/// Store backed by RocksDB
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create database
    pub fn open(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.max_background_jobs);
        if config.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_CREDIT_TYPES, Self::cf_options_metadata()),
            ColumnFamilyDescriptor::new(CF_BATCHES, Self::cf_options_metadata()),
            ColumnFamilyDescriptor::new(CF_BALANCES, Self::cf_options_balances()),
            ColumnFamilyDescriptor::new(CF_BALANCES_BY_BATCH, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_SUPPLIES, Self::cf_options_balances()),
            ColumnFamilyDescriptor::new(CF_BASKETS, Self::cf_options_metadata()),
            ColumnFamilyDescriptor::new(CF_TOKENS, Self::cf_options_balances()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB credit store");

        Ok(Self { db })
    }

    // Column family options

    fn cf_options_metadata() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_balances() -> Options {
        let mut opts = Options::default();
        // Hot records, favour decompression speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_record<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn put_record<T: Serialize>(&self, batch: &mut WriteBatch, cf: &str, key: &[u8], record: &T) -> Result<()> {
        let cf = self.cf_handle(cf)?;
        batch.put_cf(cf, key, bincode::serialize(record)?);
        Ok(())
    }

    /// Keys of a column family starting with `prefix`, in order
    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf_handle(cf)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    // Key helpers

    fn pair_key(first: &str, second: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(first.len() + second.len() + 1);
        key.extend_from_slice(first.as_bytes());
        key.push(KEY_SEPARATOR);
        key.extend_from_slice(second.as_bytes());
        key
    }

    fn prefix_key(first: &str) -> Vec<u8> {
        let mut key = first.as_bytes().to_vec();
        key.push(KEY_SEPARATOR);
        key
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

impl Store for RocksStore {
    fn get_credit_type(&self, abbreviation: &str) -> Result<Option<CreditType>> {
        self.get_record(CF_CREDIT_TYPES, abbreviation.as_bytes())
    }

    fn get_batch(&self, denom: &str) -> Result<Option<Batch>> {
        self.get_record(CF_BATCHES, denom.as_bytes())
    }

    fn get_balance(&self, address: &AccountId, batch_denom: &str) -> Result<Option<BatchBalance>> {
        self.get_record(CF_BALANCES, &Self::pair_key(address.as_str(), batch_denom))
    }

    fn get_supply(&self, batch_denom: &str) -> Result<Option<BatchSupply>> {
        self.get_record(CF_SUPPLIES, batch_denom.as_bytes())
    }

    fn get_basket(&self, basket_denom: &str) -> Result<Option<Basket>> {
        self.get_record(CF_BASKETS, basket_denom.as_bytes())
    }

    fn get_token_balance(&self, address: &AccountId, denom: &str) -> Result<Option<TokenBalance>> {
        self.get_record(CF_TOKENS, &Self::pair_key(address.as_str(), denom))
    }

    fn list_balances_by_batch(&self, batch_denom: &str) -> Result<Vec<BatchBalance>> {
        let prefix = Self::prefix_key(batch_denom);
        let mut balances = Vec::new();
        for (key, _) in self.scan_prefix(CF_BALANCES_BY_BATCH, &prefix)? {
            let address = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| Error::Storage(format!("Corrupt balance index key: {}", e)))?;
            let balance = self
                .get_balance(&AccountId::new(address), batch_denom)?
                .ok_or_else(|| {
                    Error::Storage(format!("Index points at missing balance {}/{}", address, batch_denom))
                })?;
            balances.push(balance);
        }
        Ok(balances)
    }

    fn list_balances_by_account(&self, address: &AccountId) -> Result<Vec<BatchBalance>> {
        let prefix = Self::prefix_key(address.as_str());
        self.scan_prefix(CF_BALANCES, &prefix)?
            .into_iter()
            .map(|(_, value)| bincode::deserialize(&value).map_err(Error::from))
            .collect()
    }

    fn commit(&self, changes: ChangeSet) -> Result<()> {
        let mut batch = WriteBatch::default();
        let records = changes.len();

        for credit_type in &changes.credit_types {
            self.put_record(&mut batch, CF_CREDIT_TYPES, credit_type.abbreviation.as_bytes(), credit_type)?;
        }
        for record in &changes.batches {
            self.put_record(&mut batch, CF_BATCHES, record.denom.as_bytes(), record)?;
        }
        for balance in &changes.balances {
            let key = Self::pair_key(balance.address.as_str(), &balance.batch_denom);
            self.put_record(&mut batch, CF_BALANCES, &key, balance)?;

            // Index: batch denom || address -> empty
            let index_key = Self::pair_key(&balance.batch_denom, balance.address.as_str());
            batch.put_cf(self.cf_handle(CF_BALANCES_BY_BATCH)?, index_key, b"");
        }
        for supply in &changes.supplies {
            self.put_record(&mut batch, CF_SUPPLIES, supply.batch_denom.as_bytes(), supply)?;
        }
        for basket in &changes.baskets {
            self.put_record(&mut batch, CF_BASKETS, basket.basket_denom.as_bytes(), basket)?;
        }
        for token in &changes.token_balances {
            let key = Self::pair_key(token.address.as_str(), &token.denom);
            self.put_record(&mut batch, CF_TOKENS, &key, token)?;
        }

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(records, "Change set committed");
        Ok(())
    }
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.db.path())
            .finish()
    }
}
