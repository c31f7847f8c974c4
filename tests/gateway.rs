use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tower::ServiceExt;

use peerledger::assembly::BlockAssembler;
use peerledger::gateway::{choose_peer, create_router, BalanceResponse, ErrorResponse, GatewayError, GatewayState, SendResponse};
use peerledger::handlers::RequestHandlers;
use peerledger::identity::{Ed25519KeyGenerator, GeneratedKey, SenderSecretVerifier};
use peerledger::ledger::Ledger;
use peerledger::network::TcpHost;
use peerledger::node::bootstrap_master;
use peerledger::reconcile::full_copy;
use peerledger::seeds::SeedRegistry;
use peerledger::storage::{SharedStore, SledStorage};
use peerledger::types::{Account, Transaction};

/// A node serving the stream protocols on an ephemeral port.
async fn spawn_node() -> (String, GeneratedKey) {
    let master = SledStorage::temporary().unwrap();
    let funded = bootstrap_master(&master, &Ed25519KeyGenerator).unwrap().unwrap();
    let local = Arc::new(SledStorage::temporary().unwrap());
    full_copy(&master, local.as_ref()).unwrap();

    let host = Arc::new(TcpHost::new(Duration::from_secs(2)));
    let handlers = Arc::new(RequestHandlers::new(
        Arc::new(Ledger::new(SharedStore::new(master), local)),
        BlockAssembler::default(),
        Arc::new(Ed25519KeyGenerator),
        Arc::new(SenderSecretVerifier),
    ));
    handlers.register(&host).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(Arc::clone(&host).serve(listener));
    (addr, funded)
}

fn gateway(peer: &str) -> Router {
    let host = Arc::new(TcpHost::new(Duration::from_secs(2)));
    create_router(Arc::new(GatewayState::new(host, peer)))
}

async fn call<T: DeserializeOwned>(router: &Router, method: &str, uri: &str) -> (StatusCode, T) {
    let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_gateway_routes() {
    let (peer, funded) = spawn_node().await;
    let router = gateway(&peer);

    let (status, account): (_, Account) = call(&router, "POST", "/create_account").await;
    assert_eq!(status, StatusCode::OK);

    let (status, sent): (_, SendResponse) = call(
        &router,
        "POST",
        &format!(
            "/send_balance?sender={}&recipient={}&amount=12.5&privateKey={}",
            funded.address, account.address, funded.secret_hex
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, balance): (_, BalanceResponse) =
        call(&router, "GET", &format!("/get_balance?address={}", account.address)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(balance.balance, "12.5");
    let (_, funded_balance): (_, BalanceResponse) =
        call(&router, "GET", &format!("/get_balance?address={}", funded.address)).await;
    assert_eq!(funded_balance.balance, "4999987.5");

    let (status, tx): (_, Transaction) = call(&router, "GET", &format!("/get_transaction?hash={}", sent.hash)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tx.hash, sent.hash);
    assert_eq!(tx.recipient, account.address);
}

#[tokio::test]
async fn test_gateway_reports_node_errors() {
    let (peer, funded) = spawn_node().await;
    let router = gateway(&peer);

    let (status, err): (_, ErrorResponse) = call(&router, "GET", "/get_balance?address=nobody").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err.error.contains("nobody"), "{}", err.error);

    let (status, _): (_, ErrorResponse) = call(
        &router,
        "POST",
        &format!(
            "/send_balance?sender={}&recipient={}&amount=1&privateKey=00",
            funded.address, funded.address
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_gateway_rejects_bad_amount() {
    let (peer, funded) = spawn_node().await;
    let router = gateway(&peer);

    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/send_balance?sender={}&recipient=x&amount=lots&privateKey={}",
            funded.address, funded.secret_hex
        ))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_gateway_unreachable_node() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gone = closed.local_addr().unwrap().to_string();
    drop(closed);

    let (status, _): (_, ErrorResponse) = call(&gateway(&gone), "POST", "/create_account").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_choose_peer_from_seed_registry() {
    let (peer, _) = spawn_node().await;
    let host = TcpHost::new(Duration::from_secs(2));
    let dir = tempfile::tempdir().unwrap();
    let seeds = SeedRegistry::new(dir.path().join("seeds.txt"), 20);

    assert!(matches!(
        choose_peer(&host, &seeds).await,
        Err(GatewayError::NoActivePeer(0))
    ));

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gone = closed.local_addr().unwrap().to_string();
    drop(closed);
    seeds.register(&gone).unwrap();
    seeds.register(&peer).unwrap();

    assert_eq!(choose_peer(&host, &seeds).await.unwrap(), peer);
}
