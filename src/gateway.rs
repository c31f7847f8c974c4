//! HTTP gateway in front of one ledger node.
//!
//! Each route is forwarded as a single stream request to the node picked at
//! startup. Replies from the node that start with the error prefix become
//! `400`; failing to reach the node becomes `502`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rand::seq::SliceRandom;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::client::{ClientError, LedgerClient};
use crate::network::PeerHost;
use crate::seeds::{active_peers, SeedRegistry};
use crate::types::{format_amount, Transaction};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No reachable node among {0} registered seeds")]
    NoActivePeer(usize),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub struct GatewayState {
    host: Arc<dyn PeerHost>,
    peer: String,
}

impl GatewayState {
    pub fn new(host: Arc<dyn PeerHost>, peer: impl Into<String>) -> Self {
        Self {
            host,
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn client(&self) -> LedgerClient<'_, dyn PeerHost> {
        LedgerClient::new(self.host.as_ref(), self.peer.clone())
    }
}

pub type AppState = Arc<GatewayState>;

/// Pick a random reachable node from the seed registry.
pub async fn choose_peer<H: PeerHost + ?Sized>(host: &H, seeds: &SeedRegistry) -> Result<String, GatewayError> {
    let candidates = seeds.load()?;
    let active = active_peers(host, &candidates, "").await;
    let chosen = active.choose(&mut rand::thread_rng()).cloned();
    chosen.ok_or(GatewayError::NoActivePeer(candidates.len()))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub address: String,
    pub balance: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub hash: String,
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendQuery {
    pub sender: String,
    pub recipient: String,
    pub amount: Decimal,
    pub private_key: String,
}

#[derive(Debug, Deserialize)]
pub struct TransactionQuery {
    pub hash: String,
}

fn failure(err: ClientError) -> Response {
    let status = match err {
        ClientError::Remote(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    error!(%status, error = %err, "gateway request failed");
    (status, Json(ErrorResponse { error: err.to_string() })).into_response()
}

/// POST /create_account
async fn create_account(State(gateway): State<AppState>) -> Response {
    debug!("API /create_account");
    match gateway.client().create_account().await {
        Ok(account) => (StatusCode::OK, Json(account)).into_response(),
        Err(e) => failure(e),
    }
}

/// GET /get_balance?address=
async fn get_balance(State(gateway): State<AppState>, Query(query): Query<BalanceQuery>) -> Response {
    debug!(address = %query.address, "API /get_balance");
    match gateway.client().balance(&query.address).await {
        Ok(balance) => Json(BalanceResponse {
            address: query.address,
            balance: format_amount(balance),
        })
        .into_response(),
        Err(e) => failure(e),
    }
}

/// POST /send_balance?sender=&recipient=&amount=&privateKey=
async fn send_balance(State(gateway): State<AppState>, Query(query): Query<SendQuery>) -> Response {
    debug!(sender = %query.sender, recipient = %query.recipient, amount = %query.amount, "API /send_balance");
    let tx = Transaction::new(query.sender, query.recipient, query.amount, query.private_key);
    match gateway.client().send(&tx).await {
        Ok(()) => Json(SendResponse { hash: tx.hash }).into_response(),
        Err(e) => failure(e),
    }
}

/// GET /get_transaction?hash=
async fn get_transaction(State(gateway): State<AppState>, Query(query): Query<TransactionQuery>) -> Response {
    debug!(hash = %query.hash, "API /get_transaction");
    match gateway.client().transaction(&query.hash).await {
        Ok(tx) => Json(tx).into_response(),
        Err(e) => failure(e),
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/create_account", post(create_account))
        .route("/get_balance", get(get_balance))
        .route("/send_balance", post(send_balance))
        .route("/get_transaction", get(get_transaction))
        .with_state(state)
}

/// Serve the gateway on `addr` until the listener fails.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), GatewayError> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, peer = %state.peer(), "gateway listening");
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
