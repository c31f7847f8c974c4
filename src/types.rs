//! Core type definitions for the ledger.
//!
//! Accounts, transactions and blocks as they are stored in the master and
//! local stores and exchanged on the wire. All stored values are JSON so
//! that a full store snapshot can be shipped to a peer as one document.

use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Reserved store key holding the complete, ordered account list.
pub const USER_KEY: &str = "USER";

/// Number of seed transactions in the genesis block.
pub const GENESIS_SEED_COUNT: usize = 5;

/// Amount issued by each genesis seed transaction.
pub const GENESIS_SEED_AMOUNT: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

/// Reserved sender of the genesis seed transactions.
pub const NETWORK_SENDER: &str = "0";

/// Recipient credited by the genesis seed transactions. It is not a
/// registered account; the supply is handed to a freshly generated
/// account when the master store is first initialized.
pub const BOOTSTRAP_ADDRESS: &str = "GENESIS";

/// Format a 32-byte digest as a lowercase hexadecimal string.
pub fn format_hex(bytes: &[u8; 32]) -> String {
    hex::encode(bytes)
}

/// Canonical text of an amount: no trailing fractional zeros, so `100`
/// and `100.00` hash and print the same.
pub fn format_amount(amount: Decimal) -> String {
    amount.normalize().to_string()
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Store key of the block at `index`.
pub fn block_key(index: i64) -> String {
    index.to_string()
}

/// An account entry of the `USER` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Address derived from the account's public key.
    pub address: String,
    /// Hex-encoded public key, empty for accounts created without one.
    #[serde(default)]
    pub public_key: String,
    /// Spendable balance, never negative.
    pub balance: Decimal,
}

impl Account {
    pub fn new(address: impl Into<String>, public_key: impl Into<String>, balance: impl Into<Decimal>) -> Self {
        Account {
            address: address.into(),
            public_key: public_key.into(),
            balance: balance.into(),
        }
    }
}

/// A transfer of `amount` from `sender` to `recipient`.
///
/// `signature` carries whatever the client supplied. Today that is the
/// sender's raw secret; nothing here verifies it (see
/// [`crate::identity::SignatureVerifier`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Position inside the enclosing block. Informational only.
    #[serde(default)]
    pub index: i64,
    pub sender: String,
    pub recipient: String,
    pub amount: Decimal,
    #[serde(default)]
    pub signature: String,
    /// Unix timestamp in seconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Content hash. Never trusted from the wire; see [`Transaction::rehash`].
    #[serde(default)]
    pub hash: String,
}

impl Transaction {
    /// Build a transaction stamped with the current time and its content hash.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: impl Into<Decimal>,
        signature: impl Into<String>,
    ) -> Self {
        let mut tx = Transaction {
            index: 0,
            sender: sender.into(),
            recipient: recipient.into(),
            amount: amount.into(),
            signature: signature.into(),
            timestamp: unix_now(),
            hash: String::new(),
        };
        tx.hash = tx.calculate_hash();
        tx
    }

    /// SHA-256 over sender, recipient, amount, signature and timestamp.
    ///
    /// The index and any stored hash are excluded, so the value only depends
    /// on what the sender asked for.
    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sender.as_bytes());
        hasher.update(self.recipient.as_bytes());
        hasher.update(format_amount(self.amount).as_bytes());
        hasher.update(self.signature.as_bytes());
        hasher.update(self.timestamp.to_string().as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        format_hex(&digest)
    }

    /// Replace the carried hash with the recomputed one.
    pub fn rehash(mut self) -> Self {
        self.hash = self.calculate_hash();
        self
    }
}

/// A block of transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Dense, contiguous index starting at 0 (genesis).
    pub index: i64,
    /// Hash of the previous block; empty for genesis.
    pub prev_hash: String,
    pub hash: String,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Carried for storage compatibility. Never searched against a target.
    pub nonce: i64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a block stamped with the current time and its hash.
    pub fn new(index: i64, prev_hash: impl Into<String>, transactions: Vec<Transaction>, nonce: i64) -> Self {
        let mut block = Block {
            index,
            prev_hash: prev_hash.into(),
            hash: String::new(),
            timestamp: unix_now(),
            nonce,
            transactions,
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Build block 0 and return it together with the total amount it issues.
    ///
    /// The seed transactions are identical in content, so they share one
    /// content hash and a lookup by that hash always yields the first seed.
    pub fn genesis() -> (Block, Decimal) {
        let timestamp = unix_now();
        let transactions: Vec<Transaction> = (0..GENESIS_SEED_COUNT)
            .map(|i| {
                Transaction {
                    index: i as i64,
                    sender: NETWORK_SENDER.to_string(),
                    recipient: BOOTSTRAP_ADDRESS.to_string(),
                    amount: GENESIS_SEED_AMOUNT,
                    signature: BOOTSTRAP_ADDRESS.to_string(),
                    timestamp,
                    hash: String::new(),
                }
                .rehash()
            })
            .collect();
        let total = transactions.iter().map(|tx| tx.amount).sum();

        let mut block = Block {
            index: 0,
            prev_hash: String::new(),
            hash: String::new(),
            timestamp,
            nonce: 0,
            transactions,
        };
        block.hash = block.calculate_hash();
        (block, total)
    }

    /// Calculate the SHA-256 hash of the block.
    ///
    /// Covers index, timestamp, previous hash and nonce, followed by the
    /// index, sender, recipient, amount and signature of every transaction
    /// in order. Transaction timestamps and hashes are not covered.
    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_string().as_bytes());
        hasher.update(self.timestamp.to_string().as_bytes());
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.nonce.to_string().as_bytes());
        for tx in &self.transactions {
            hasher.update(tx.index.to_string().as_bytes());
            hasher.update(tx.sender.as_bytes());
            hasher.update(tx.recipient.as_bytes());
            hasher.update(format_amount(tx.amount).as_bytes());
            hasher.update(tx.signature.as_bytes());
        }
        let digest: [u8; 32] = hasher.finalize().into();
        format_hex(&digest)
    }

    /// Whether the stored hash matches the recomputed one.
    pub fn is_hash_valid(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    /// Find a transaction by its recomputed content hash.
    pub fn find_transaction(&self, hash: &str) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.calculate_hash() == hash)
    }
}
