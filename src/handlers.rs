//! Protocol entry points.
//!
//! Every handler reads one request line, delegates to the ledger, the
//! block assembler or the reconciliation helpers, and answers with one
//! line. Failures are answered as `error: <description>` and are never
//! retried here.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::BufReader;
use tracing::{debug, info, warn};

use crate::assembly::BlockAssembler;
use crate::identity::{KeyGenerator, SignatureVerifier, VerificationError};
use crate::ledger::{Ledger, LedgerError};
use crate::network::{
    read_line, write_line, BoxStream, NetworkError, StreamHandler, TcpHost, CREATE_ACCOUNT_PROTOCOL,
    CREATE_ACCOUNT_TOKEN, GET_BALANCE_PROTOCOL, GET_TRANS_PROTOCOL, MAX_REQUEST_LINE,
    SEND_BALANCE_PROTOCOL, SYNC_PROTOCOL, SYNC_REQUEST_TOKEN,
};
use crate::reconcile::{export_snapshot, ReconcileError};
use crate::storage::{Storage, StorageError, StoreAccess};
use crate::types::{format_amount, Block, Transaction, USER_KEY};

/// Reply to an accepted transfer.
pub const TRANSFER_ACCEPTED: &str = "transaction accepted";

/// Prefix of every error reply.
pub const ERROR_PREFIX: &str = "error: ";

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Ledger(#[from] LedgerError),
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Reconcile(#[from] ReconcileError),
    #[error("Verification failed: {0}")]
    Verification(#[from] VerificationError),
    #[error("Unexpected request: {0}")]
    UnexpectedRequest(String),
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("No handler for protocol {0}")]
    UnknownProtocol(String),
}

/// Scan every block of `store` for a transaction whose recomputed hash is
/// `hash`. Entries that do not decode as blocks are skipped.
pub fn find_transaction<S: Storage + ?Sized>(store: &S, hash: &str) -> Result<Option<Transaction>, StorageError> {
    for (key, value) in store.iterate_all()? {
        if key == USER_KEY {
            continue;
        }
        let block: Block = match serde_json::from_slice(&value) {
            Ok(block) => block,
            Err(e) => {
                debug!(%key, error = %e, "skipping undecodable entry");
                continue;
            }
        };
        if let Some(tx) = block.find_transaction(hash) {
            return Ok(Some(tx.clone().rehash()));
        }
    }
    Ok(None)
}

pub struct RequestHandlers<M, L> {
    ledger: Arc<Ledger<M, L>>,
    assembler: BlockAssembler,
    keys: Arc<dyn KeyGenerator>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl<M, L> RequestHandlers<M, L>
where
    M: StoreAccess + 'static,
    L: Storage + 'static,
{
    pub fn new(
        ledger: Arc<Ledger<M, L>>,
        assembler: BlockAssembler,
        keys: Arc<dyn KeyGenerator>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            ledger,
            assembler,
            keys,
            verifier,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger<M, L>> {
        &self.ledger
    }

    /// Register every protocol on `host`.
    pub async fn register(self: &Arc<Self>, host: &TcpHost) {
        for protocol in [
            CREATE_ACCOUNT_PROTOCOL,
            GET_BALANCE_PROTOCOL,
            SEND_BALANCE_PROTOCOL,
            GET_TRANS_PROTOCOL,
            SYNC_PROTOCOL,
        ] {
            host.on_stream(protocol, Arc::clone(self) as Arc<dyn StreamHandler>).await;
        }
    }

    /// Answer one request line received on `protocol`.
    pub async fn respond(&self, protocol: &str, payload: &str) -> Result<String, HandlerError> {
        match protocol {
            CREATE_ACCOUNT_PROTOCOL => self.create_account(payload).await,
            GET_BALANCE_PROTOCOL => self.get_balance(payload).await,
            SEND_BALANCE_PROTOCOL => self.send_balance(payload).await,
            GET_TRANS_PROTOCOL => self.get_transaction(payload),
            SYNC_PROTOCOL => self.sync(payload),
            other => Err(HandlerError::UnknownProtocol(other.to_string())),
        }
    }

    async fn create_account(&self, payload: &str) -> Result<String, HandlerError> {
        if payload != CREATE_ACCOUNT_TOKEN {
            return Err(HandlerError::UnexpectedRequest(payload.to_string()));
        }
        let key = self.keys.generate();
        let account = self
            .ledger
            .create_account(&key.address, &key.public_key_hex, 0)
            .await?;
        Ok(serde_json::to_string(&account)?)
    }

    async fn get_balance(&self, payload: &str) -> Result<String, HandlerError> {
        let balance = self.ledger.get_balance(payload).await?;
        Ok(format_amount(balance))
    }

    async fn send_balance(&self, payload: &str) -> Result<String, HandlerError> {
        let tx: Transaction = serde_json::from_str(payload)?;
        let tx = tx.rehash();
        self.verifier.verify(&tx)?;

        let hash = tx.hash.clone();
        let placement = self.ledger.commit_transfer(tx, &self.assembler).await?;
        info!(%hash, block = placement.block_index(), "transfer accepted");
        Ok(TRANSFER_ACCEPTED.to_string())
    }

    fn get_transaction(&self, payload: &str) -> Result<String, HandlerError> {
        let tx = find_transaction(self.ledger.local().as_ref(), payload)?
            .ok_or_else(|| HandlerError::TransactionNotFound(payload.to_string()))?;
        Ok(serde_json::to_string(&tx)?)
    }

    fn sync(&self, payload: &str) -> Result<String, HandlerError> {
        if payload != SYNC_REQUEST_TOKEN {
            return Err(HandlerError::UnexpectedRequest(payload.to_string()));
        }
        let snapshot = export_snapshot(self.ledger.local().as_ref())?;
        debug!(entries = snapshot.len(), "serving sync snapshot");
        Ok(serde_json::to_string(&snapshot)?)
    }

    async fn serve(&self, protocol: &str, stream: BoxStream) -> Result<(), NetworkError> {
        let mut stream = BufReader::new(stream);
        let payload = read_line(&mut stream, MAX_REQUEST_LINE).await?;
        let response = match self.respond(protocol, &payload).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%protocol, error = %e, "request failed");
                format!("{ERROR_PREFIX}{e}")
            }
        };
        write_line(stream.get_mut(), &response).await
    }
}

#[async_trait]
impl<M, L> StreamHandler for RequestHandlers<M, L>
where
    M: StoreAccess + 'static,
    L: Storage + 'static,
{
    async fn handle(&self, protocol: &str, stream: BoxStream) {
        if let Err(e) = self.serve(protocol, stream).await {
            debug!(%protocol, error = %e, "stream closed early");
        }
    }
}
