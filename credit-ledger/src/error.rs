//! Error types for the credit ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed decimal string
    #[error("Parse error: {0}")]
    Parse(String),

    /// Too many fractional digits for the declared precision
    #[error("Precision exceeded: {value} has more than {precision} decimal places")]
    PrecisionExceeded {
        /// Offending value as given
        value: String,
        /// Maximum fractional digits allowed
        precision: u32,
    },

    /// Magnitude outside the representable range
    #[error("Overflow: {0}")]
    Overflow(String),

    /// A non-negative amount was constructed from a negative value
    #[error("Expected a non-negative amount, got {0}")]
    Negative(String),

    /// Subtraction would have produced a negative value
    #[error("Negative result: {lhs} - {rhs} < 0")]
    NegativeResult {
        /// Minuend
        lhs: String,
        /// Subtrahend
        rhs: String,
    },

    /// Requested amount exceeds what the account holds
    #[error("Insufficient {field} balance: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Balance field that was short (tradable, escrowed, tokens)
        field: &'static str,
        /// Requested amount
        requested: String,
        /// Available amount
        available: String,
    },

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Request rejected before touching any balance
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Failure of one item of a multi-item request
    #[error("Item {index} ({batch_denom}): {source}")]
    Item {
        /// Position of the item in the request
        index: usize,
        /// Batch the item refers to
        batch_denom: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Stored supply disagrees with the sum of balances
    #[error("Supply invariant violated for {batch_denom}: {detail}")]
    Invariant {
        /// Batch
        batch_denom: String,
        /// Which total disagreed and by how much
        detail: String,
    },

    /// Gas limit reached
    #[error("Out of gas: limit {limit}, consumed {consumed} ({descriptor})")]
    OutOfGas {
        /// Gas limit of the request
        limit: u64,
        /// Gas consumed when the limit was hit
        consumed: u64,
        /// What was being charged
        descriptor: String,
    },

    /// Event sink rejected an event
    #[error("Event sink error: {0}")]
    EventSink(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Attach the position and batch of a multi-item request to an error
    pub fn at_item(self, index: usize, batch_denom: impl Into<String>) -> Self {
        Error::Item {
            index,
            batch_denom: batch_denom.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping item wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Item { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_error_names_the_item() {
        let err = Error::InsufficientBalance {
            field: "tradable",
            requested: "80".to_string(),
            available: "70".to_string(),
        }
        .at_item(1, "C01-001-20200101-20210101-001");

        let msg = err.to_string();
        assert!(msg.starts_with("Item 1 (C01-001-20200101-20210101-001)"));
        assert!(msg.contains("requested 80, available 70"));
        assert!(matches!(err.root(), Error::InsufficientBalance { .. }));
    }
}
