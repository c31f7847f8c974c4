use std::fs;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::assembly::BlockAssembler;
use crate::config::NodeConfig;
use crate::handlers::RequestHandlers;
use crate::identity::{AcceptAll, Ed25519KeyGenerator, GeneratedKey, KeyGenerator, SenderSecretVerifier, SignatureVerifier};
use crate::ledger::Ledger;
use crate::network::{NetworkError, TcpHost};
use crate::reconcile::{full_copy, ReconcileError};
use crate::seeds::{active_peers, SeedRegistry};
use crate::storage::{open_with_retry, PathStore, SledStorage, Storage, StorageBatch, StorageError, StoreAccess};
use crate::sync::sync_local_store;
use crate::types::{Account, Block};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
    #[error("{0}")]
    Reconcile(#[from] ReconcileError),
}

/// Seed an empty master store with the genesis block and one account
/// holding everything genesis issues.
///
/// Returns the funded account's key when the store was seeded, `None` when
/// it already held data.
pub fn bootstrap_master<S>(store: &S, keys: &dyn KeyGenerator) -> Result<Option<GeneratedKey>, StorageError>
where
    S: Storage + ?Sized,
{
    if !store.is_empty()? {
        return Ok(None);
    }
    let (genesis, issued) = Block::genesis();
    let key = keys.generate();

    let mut batch = StorageBatch::default();
    batch.put_block(&genesis)?;
    batch.put_accounts(&[Account::new(&key.address, &key.public_key_hex, issued)])?;
    store.apply_batch(batch)?;

    info!(hash = %genesis.hash, funded = %key.address, %issued, "master store bootstrapped");
    Ok(Some(key))
}

type NodeHandlers = RequestHandlers<PathStore, SledStorage>;

/// A running participant: serves the request protocols over TCP and keeps a
/// local copy of the master store.
pub struct Node {
    config: NodeConfig,
    addr: SocketAddr,
    node_id: String,
    local_path: PathBuf,
    listener: Option<TcpListener>,
    host: Arc<TcpHost>,
    handlers: Arc<NodeHandlers>,
    seeds: SeedRegistry,
    funded: Option<GeneratedKey>,
}

impl Node {
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let addr = listener.local_addr()?;
        let keys: Arc<dyn KeyGenerator> = Arc::new(Ed25519KeyGenerator);

        let master = PathStore::new(&config.master_path, config.store_retry_interval);
        let funded = {
            let lease = master.acquire().await?;
            bootstrap_master(&*lease, keys.as_ref())?
        };

        let node_id = keys.generate().address;
        fs::create_dir_all(&config.data_dir)?;
        let local_path = config.data_dir.join(&node_id);
        let local = Arc::new(open_with_retry(&local_path, config.store_retry_interval).await?);
        info!(%node_id, %addr, local = %local_path.display(), "node starting");

        let seeds = SeedRegistry::new(&config.seed_file, config.max_seed_nodes);
        let candidates = seeds.load()?;
        if !seeds.register(&addr.to_string())? {
            warn!(%addr, "seed registry full or already listing this node");
        }

        let host = Arc::new(TcpHost::new(config.connect_timeout));
        let peers = active_peers(host.as_ref(), &candidates, &addr.to_string()).await;
        match sync_local_store(host.as_ref(), &peers, &master, local.as_ref()).await {
            Ok(outcome) => info!(?outcome, "local store synchronized"),
            Err(e) => warn!(error = %e, "startup synchronization failed, continuing"),
        }

        let verifier: Arc<dyn SignatureVerifier> = if config.verify_sender_secret {
            Arc::new(SenderSecretVerifier)
        } else {
            Arc::new(AcceptAll)
        };
        let handlers = Arc::new(RequestHandlers::new(
            Arc::new(Ledger::new(master, local)),
            BlockAssembler::new(config.block_capacity),
            keys,
            verifier,
        ));
        handlers.register(&host).await;

        Ok(Node {
            config,
            addr,
            node_id,
            local_path,
            listener: Some(listener),
            host,
            handlers,
            seeds,
            funded,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Key of the account funded at genesis, if this node bootstrapped the
    /// master store.
    pub fn funded_account(&self) -> Option<&GeneratedKey> {
        self.funded.as_ref()
    }

    /// Serve until `shutdown` resolves or the listener fails, then shut down.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), NodeError>
    where
        F: Future<Output = ()>,
    {
        if let Some(listener) = self.listener.take() {
            let serve = Arc::clone(&self.host).serve(listener);
            tokio::select! {
                result = serve => {
                    if let Err(e) = result {
                        error!(error = %e, "listener failed");
                    }
                }
                _ = shutdown => info!("shutdown requested"),
            }
        }
        self.shutdown().await
    }

    /// Leave the seed registry, refresh the local store from master one last
    /// time and remove it unless configured to keep it.
    async fn shutdown(self) -> Result<(), NodeError> {
        if let Err(e) = self.seeds.unregister(&self.addr.to_string()) {
            warn!(error = %e, "failed to leave seed registry");
        }

        let ledger = Arc::clone(self.handlers.ledger());
        {
            let lease = ledger.master().acquire().await?;
            full_copy(&*lease, ledger.local().as_ref())?;
        }
        drop(ledger);
        drop(self.handlers);
        drop(self.host);

        if !self.config.keep_local_store {
            fs::remove_dir_all(&self.local_path)?;
            info!(path = %self.local_path.display(), "local store removed");
        }
        info!(node_id = %self.node_id, "node stopped");
        Ok(())
    }
}
