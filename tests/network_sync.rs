use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::net::TcpListener;

use peerledger::assembly::BlockAssembler;
use peerledger::client::{ClientError, LedgerClient};
use peerledger::handlers::RequestHandlers;
use peerledger::identity::{Ed25519KeyGenerator, GeneratedKey, SenderSecretVerifier};
use peerledger::ledger::Ledger;
use peerledger::network::TcpHost;
use peerledger::node::bootstrap_master;
use peerledger::reconcile::full_copy;
use peerledger::seeds::active_peers;
use peerledger::storage::{SharedStore, SledStorage, Storage};
use peerledger::sync::{sync_local_store, SyncError, SyncOutcome};
use peerledger::types::Transaction;

struct Peer {
    host: Arc<TcpHost>,
    addr: String,
    local: Arc<SledStorage>,
}

async fn spawn_peer(master: &SharedStore<SledStorage>) -> Peer {
    let local = Arc::new(SledStorage::temporary().unwrap());
    full_copy(master.handle().as_ref(), local.as_ref()).unwrap();

    let host = Arc::new(TcpHost::new(Duration::from_secs(2)));
    let handlers = Arc::new(RequestHandlers::new(
        Arc::new(Ledger::new(master.clone(), Arc::clone(&local))),
        BlockAssembler::default(),
        Arc::new(Ed25519KeyGenerator),
        Arc::new(SenderSecretVerifier),
    ));
    handlers.register(&host).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(Arc::clone(&host).serve(listener));
    Peer { host, addr, local }
}

fn bootstrapped_master() -> (SharedStore<SledStorage>, GeneratedKey) {
    let master = SledStorage::temporary().unwrap();
    let funded = bootstrap_master(&master, &Ed25519KeyGenerator).unwrap().unwrap();
    (SharedStore::new(master), funded)
}

#[tokio::test]
async fn test_client_round_trip_over_tcp() {
    let (master, funded) = bootstrapped_master();
    let peer = spawn_peer(&master).await;
    let client = LedgerClient::new(peer.host.as_ref(), peer.addr.clone());

    let account = client.create_account().await.unwrap();
    assert_eq!(client.balance(&account.address).await.unwrap(), Decimal::ZERO);

    let tx = Transaction::new(&funded.address, &account.address, 250, &funded.secret_hex);
    client.send(&tx).await.unwrap();
    assert_eq!(client.balance(&account.address).await.unwrap(), Decimal::from(250));

    let found = client.transaction(&tx.hash).await.unwrap();
    assert_eq!(found.hash, tx.hash);

    let stolen = Transaction::new(&funded.address, &account.address, 1, "not-the-secret");
    assert!(matches!(client.send(&stolen).await, Err(ClientError::Remote(_))));
    assert!(matches!(client.balance("nobody").await, Err(ClientError::Remote(_))));
}

#[tokio::test]
async fn test_new_node_syncs_from_active_peer() {
    let (master, funded) = bootstrapped_master();
    let peer = spawn_peer(&master).await;
    let client = LedgerClient::new(peer.host.as_ref(), peer.addr.clone());
    let account = client.create_account().await.unwrap();
    client
        .send(&Transaction::new(&funded.address, &account.address, 9, &funded.secret_hex))
        .await
        .unwrap();

    let host = TcpHost::new(Duration::from_secs(2));
    let candidates = vec![peer.addr.clone(), "127.0.0.1:1".to_string()];
    let active = active_peers(&host, &candidates, "127.0.0.1:1").await;
    assert_eq!(active, vec![peer.addr.clone()]);

    let local = SledStorage::temporary().unwrap();
    let outcome = sync_local_store(&host, &active, &master, &local).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::FromPeer {
            peer: peer.addr.clone(),
            entries: 3
        }
    );
    assert_eq!(local.get_accounts().unwrap(), peer.local.get_accounts().unwrap());
    for index in 0..=1 {
        assert_eq!(local.get_block(index).unwrap(), peer.local.get_block(index).unwrap());
    }
}

#[tokio::test]
async fn test_sync_falls_back_to_master_without_peers() {
    let (master, _) = bootstrapped_master();
    let host = TcpHost::new(Duration::from_secs(2));
    let local = SledStorage::temporary().unwrap();
    local.put("stale", b"\"kept\"").unwrap();

    let outcome = sync_local_store(&host, &[], &master, &local).await.unwrap();
    assert_eq!(outcome, SyncOutcome::FromMaster { entries: 2 });
    assert!(local.get_block(0).unwrap().is_some());
    assert_eq!(local.get_accounts().unwrap().len(), 1);
    assert!(local.get("stale").unwrap().is_some());
}

#[tokio::test]
async fn test_sync_reports_unreachable_peer() {
    let (master, _) = bootstrapped_master();
    let host = TcpHost::new(Duration::from_secs(2));
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gone = closed.local_addr().unwrap().to_string();
    drop(closed);

    let local = SledStorage::temporary().unwrap();
    let err = sync_local_store(&host, &[gone.clone()], &master, &local).await.unwrap_err();
    assert!(matches!(err, SyncError::PeerFailed { peer, .. } if peer == gone));
    assert!(local.is_empty().unwrap());
}
