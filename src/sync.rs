use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::info;

use crate::client::{ClientError, LedgerClient};
use crate::network::PeerHost;
use crate::reconcile::{apply_snapshot, full_copy, ReconcileError};
use crate::storage::{Storage, StorageError, StoreAccess};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Peer {peer} failed to serve a snapshot: {source}")]
    PeerFailed {
        peer: String,
        #[source]
        source: ClientError,
    },
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("{0}")]
    Reconcile(#[from] ReconcileError),
}

/// How the local store was brought up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    FromPeer { peer: String, entries: usize },
    FromMaster { entries: usize },
}

/// Pull a full snapshot from `peer` and write it over `local`.
pub async fn sync_from_peer<H, L>(host: &H, peer: &str, local: &L) -> Result<usize, SyncError>
where
    H: PeerHost + ?Sized,
    L: Storage + ?Sized,
{
    let snapshot = LedgerClient::new(host, peer)
        .snapshot()
        .await
        .map_err(|source| SyncError::PeerFailed {
            peer: peer.to_string(),
            source,
        })?;
    Ok(apply_snapshot(local, snapshot)?)
}

/// Bring `local` up to date: from a random active peer when there is
/// one, otherwise by copying the master wholesale.
pub async fn sync_local_store<H, M, L>(
    host: &H,
    active_peers: &[String],
    master: &M,
    local: &L,
) -> Result<SyncOutcome, SyncError>
where
    H: PeerHost + ?Sized,
    M: StoreAccess,
    L: Storage + ?Sized,
{
    let chosen = active_peers.choose(&mut rand::thread_rng()).cloned();
    match chosen {
        Some(peer) => {
            info!(%peer, "synchronizing with active peer");
            let entries = sync_from_peer(host, &peer, local).await?;
            Ok(SyncOutcome::FromPeer { peer, entries })
        }
        None => {
            info!("no active peers, synchronizing with master store");
            let lease = master.acquire().await?;
            let entries = full_copy(&*lease, local)?;
            Ok(SyncOutcome::FromMaster { entries })
        }
    }
}
