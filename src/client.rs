use rust_decimal::Decimal;
use thiserror::Error;

use crate::handlers::{ERROR_PREFIX, TRANSFER_ACCEPTED};
use crate::network::{
    request, NetworkError, PeerHost, CREATE_ACCOUNT_PROTOCOL, CREATE_ACCOUNT_TOKEN, GET_BALANCE_PROTOCOL,
    GET_TRANS_PROTOCOL, SEND_BALANCE_PROTOCOL, SYNC_PROTOCOL, SYNC_REQUEST_TOKEN,
};
use crate::reconcile::Snapshot;
use crate::types::{Account, Transaction};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Peer answered with an error: {0}")]
    Remote(String),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Issues requests to one peer.
pub struct LedgerClient<'a, H: ?Sized> {
    host: &'a H,
    peer: String,
}

impl<'a, H: PeerHost + ?Sized> LedgerClient<'a, H> {
    pub fn new(host: &'a H, peer: impl Into<String>) -> Self {
        Self {
            host,
            peer: peer.into(),
        }
    }

    async fn call(&self, protocol: &str, payload: &str) -> Result<String, ClientError> {
        let response = request(self.host, &self.peer, protocol, payload).await?;
        match response.strip_prefix(ERROR_PREFIX) {
            Some(reason) => Err(ClientError::Remote(reason.to_string())),
            None => Ok(response),
        }
    }

    pub async fn create_account(&self) -> Result<Account, ClientError> {
        let response = self.call(CREATE_ACCOUNT_PROTOCOL, CREATE_ACCOUNT_TOKEN).await?;
        Ok(serde_json::from_str(&response)?)
    }

    pub async fn balance(&self, address: &str) -> Result<Decimal, ClientError> {
        let response = self.call(GET_BALANCE_PROTOCOL, address).await?;
        response
            .parse()
            .map_err(|_| ClientError::UnexpectedResponse(response))
    }

    pub async fn send(&self, tx: &Transaction) -> Result<(), ClientError> {
        let payload = serde_json::to_string(tx)?;
        let response = self.call(SEND_BALANCE_PROTOCOL, &payload).await?;
        if response != TRANSFER_ACCEPTED {
            return Err(ClientError::UnexpectedResponse(response));
        }
        Ok(())
    }

    pub async fn transaction(&self, hash: &str) -> Result<Transaction, ClientError> {
        let response = self.call(GET_TRANS_PROTOCOL, hash).await?;
        Ok(serde_json::from_str(&response)?)
    }

    pub async fn snapshot(&self) -> Result<Snapshot, ClientError> {
        let response = self.call(SYNC_PROTOCOL, SYNC_REQUEST_TOKEN).await?;
        Ok(serde_json::from_str(&response)?)
    }
}
