//! Checkpoint — the totally-ordered position in chain history that clocks
//! every store write.
//!
//! A checkpoint pins an event to
//! `(block_timestamp, chain_id, block_number, transaction_index, log_index)`.
//! The encoded form is a fixed-width decimal string whose byte order equals
//! the tuple order, so the database compares validity intervals with plain
//! string comparison. The sentinel [`CHECKPOINT_LATEST`] begins with a
//! non-digit and therefore sorts strictly after every encoded checkpoint.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel marking an open validity interval. Sorts after every encoded
/// checkpoint because `'l' > '9'` and encoded values always lead with a digit.
pub const CHECKPOINT_LATEST: &str = "latest";

/// Width of an encoded checkpoint in characters.
pub const ENCODED_CHECKPOINT_LEN: usize = 58;

const TIMESTAMP_DIGITS: usize = 10;
const CHAIN_ID_DIGITS: usize = 16;
const BLOCK_NUMBER_DIGITS: usize = 16;
const TRANSACTION_INDEX_DIGITS: usize = 8;
const LOG_INDEX_DIGITS: usize = 8;

/// Errors produced when decoding an encoded checkpoint string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("encoded checkpoint must be {ENCODED_CHECKPOINT_LEN} characters, got {0}")]
    Length(usize),

    #[error("encoded checkpoint contains a non-digit at offset {0}")]
    NonDigit(usize),
}

/// A position in the combined history of all indexed chains.
///
/// Ordering is lexicographic over the fields in declaration order, which is
/// exactly the tuple order the encoding preserves. There is one checkpoint
/// per processed event; checkpoints are immutable values.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Checkpoint {
    pub block_timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl Checkpoint {
    /// The smallest checkpoint. Every encoded value sorts at or after it.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Checkpoint of the first event slot in a block.
    ///
    /// Used for block-level positions such as reorg-safe checkpoints, where
    /// the transaction and log coordinates are not meaningful.
    pub fn at_block(block_timestamp: u64, chain_id: u64, block_number: u64) -> Self {
        Self {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index: 0,
            log_index: 0,
        }
    }

    /// Encode to the fixed-width, lex-sortable string form.
    ///
    /// Field ranges are bounded by their digit budgets (10 digits for the
    /// timestamp, 16 for chain id and block number, 8 for the transaction
    /// and log indices); values beyond those ranges have no valid encoding.
    pub fn encode(&self) -> String {
        debug_assert!(self.block_timestamp < 10u64.pow(TIMESTAMP_DIGITS as u32));
        debug_assert!(self.chain_id < 10u64.pow(CHAIN_ID_DIGITS as u32));
        debug_assert!(self.block_number < 10u64.pow(BLOCK_NUMBER_DIGITS as u32));
        debug_assert!(self.transaction_index < 10u64.pow(TRANSACTION_INDEX_DIGITS as u32));
        debug_assert!(self.log_index < 10u64.pow(LOG_INDEX_DIGITS as u32));

        format!(
            "{:0>t$}{:0>c$}{:0>b$}{:0>x$}{:0>l$}",
            self.block_timestamp,
            self.chain_id,
            self.block_number,
            self.transaction_index,
            self.log_index,
            t = TIMESTAMP_DIGITS,
            c = CHAIN_ID_DIGITS,
            b = BLOCK_NUMBER_DIGITS,
            x = TRANSACTION_INDEX_DIGITS,
            l = LOG_INDEX_DIGITS,
        )
    }

    /// Decode an encoded checkpoint string. Inverse of [`Checkpoint::encode`].
    pub fn decode(encoded: &str) -> Result<Self, CheckpointError> {
        if encoded.len() != ENCODED_CHECKPOINT_LEN {
            return Err(CheckpointError::Length(encoded.len()));
        }
        if let Some(offset) = encoded.bytes().position(|b| !b.is_ascii_digit()) {
            return Err(CheckpointError::NonDigit(offset));
        }

        let mut cursor = 0usize;
        let mut field = |digits: usize| {
            let slice = &encoded[cursor..cursor + digits];
            cursor += digits;
            // Every byte is an ASCII digit and the widest field is 16 digits,
            // so the parse cannot fail or overflow.
            slice.parse::<u64>().unwrap_or_default()
        };

        Ok(Self {
            block_timestamp: field(TIMESTAMP_DIGITS),
            chain_id: field(CHAIN_ID_DIGITS),
            block_number: field(BLOCK_NUMBER_DIGITS),
            transaction_index: field(TRANSACTION_INDEX_DIGITS),
            log_index: field(LOG_INDEX_DIGITS),
        })
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Returns `true` if `encoded` is the open-interval sentinel.
pub fn is_latest(encoded: &str) -> bool {
    encoded == CHECKPOINT_LATEST
}
