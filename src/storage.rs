use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::types::{block_key, Account, Block, USER_KEY};

/// Interval between attempts to open a store held by someone else.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),
    #[error("Store unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: sled::Error,
    },
    #[error("Failed to open store at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: sled::Error,
    },
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Key is not valid UTF-8")]
    InvalidKey,
}

/// A durable ordered key/value store.
///
/// Every write is durable and visible to subsequent reads on the same
/// handle once it returns.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
    /// Every entry, in key order.
    fn iterate_all(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
    /// Apply all operations of `batch` atomically.
    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError>;
    fn is_empty(&self) -> Result<bool, StorageError>;

    fn get_block(&self, index: i64) -> Result<Option<Block>, StorageError> {
        let encoded = self.get(&block_key(index))?;
        Ok(encoded.map(|e| serde_json::from_slice(&e)).transpose()?)
    }

    fn put_block(&self, block: &Block) -> Result<(), StorageError> {
        self.put(&block_key(block.index), &serde_json::to_vec(block)?)
    }

    /// The `USER` account list; an absent key reads as an empty list.
    fn get_accounts(&self) -> Result<Vec<Account>, StorageError> {
        match self.get(USER_KEY)? {
            Some(encoded) => Ok(serde_json::from_slice(&encoded)?),
            None => Ok(Vec::new()),
        }
    }

    fn put_accounts(&self, accounts: &[Account]) -> Result<(), StorageError> {
        self.put(USER_KEY, &serde_json::to_vec(accounts)?)
    }
}

#[derive(Debug, Default)]
pub struct StorageBatch {
    pub ops: Vec<StorageOperation>,
}

#[derive(Debug)]
pub enum StorageOperation {
    Put(String, Vec<u8>),
    Delete(String),
}

impl StorageBatch {
    pub fn put_block(&mut self, block: &Block) -> Result<(), StorageError> {
        self.ops
            .push(StorageOperation::Put(block_key(block.index), serde_json::to_vec(block)?));
        Ok(())
    }

    pub fn put_accounts(&mut self, accounts: &[Account]) -> Result<(), StorageError> {
        self.ops
            .push(StorageOperation::Put(USER_KEY.to_string(), serde_json::to_vec(accounts)?));
        Ok(())
    }
}

pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    /// Open the store at `path`. Fails with [`StorageError::Unavailable`]
    /// while another process holds the store's lock, and with
    /// [`StorageError::OpenFailed`] for anything else.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|source| {
            let path = path.to_path_buf();
            if is_lock_contention(&source) {
                StorageError::Unavailable { path, source }
            } else {
                StorageError::OpenFailed { path, source }
            }
        })?;
        Ok(Self { db })
    }

    /// An in-memory store removed on drop.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl Storage for SledStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        self.db.flush()?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.db.remove(key)?;
        self.db.flush()?;
        Ok(())
    }

    fn iterate_all(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let mut entries = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec()).map_err(|_| StorageError::InvalidKey)?;
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }

    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError> {
        let mut tree_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                StorageOperation::Put(key, value) => {
                    tree_batch.insert(key.as_bytes(), value);
                }
                StorageOperation::Delete(key) => {
                    tree_batch.remove(key.as_bytes());
                }
            }
        }
        self.db.apply_batch(tree_batch)?;
        self.db.flush()?;
        Ok(())
    }

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.db.is_empty())
    }
}

/// Whether `err` means another holder has the store's file lock.
///
/// sled reports a held lock either as the raw `WouldBlock` from the lock
/// call or wrapped in an `Other` error naming the lock.
fn is_lock_contention(err: &sled::Error) -> bool {
    match err {
        sled::Error::Io(io) => {
            io.kind() == std::io::ErrorKind::WouldBlock || io.to_string().contains("could not acquire lock")
        }
        _ => false,
    }
}

/// Open the store at `path`, retrying every `interval` while another
/// holder keeps it locked. Any other failure is returned at once.
///
/// There is no deadline: the caller is parked for as long as another
/// holder keeps the store locked.
pub async fn open_with_retry(path: impl AsRef<Path>, interval: Duration) -> Result<SledStorage, StorageError> {
    let path = path.as_ref();
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        match SledStorage::open(path) {
            Ok(store) => {
                if attempt > 1 {
                    info!(path = %path.display(), attempt, "store became available");
                }
                return Ok(store);
            }
            Err(e @ StorageError::OpenFailed { .. }) => return Err(e),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "waiting for store, retrying in {:?}",
                    interval
                );
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Exclusive, scoped access to a store.
///
/// Dropping the lease releases the store on every exit path.
pub struct StoreLease<S> {
    store: Arc<S>,
    _guard: OwnedMutexGuard<()>,
}

impl<S> Deref for StoreLease<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.store
    }
}

/// Something that hands out exclusive leases on one logical store.
#[async_trait]
pub trait StoreAccess: Send + Sync {
    type Store: Storage + 'static;

    async fn acquire(&self) -> Result<StoreLease<Self::Store>, StorageError>;
}

/// A store kept open for the life of the process, guarded by an
/// in-process mutex.
pub struct SharedStore<S> {
    store: Arc<S>,
    gate: Arc<Mutex<()>>,
}

impl<S> Clone for SharedStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<S: Storage> SharedStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Unguarded handle, for reads that do not take part in a critical
    /// section.
    pub fn handle(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl<S: Storage + 'static> StoreAccess for SharedStore<S> {
    type Store = S;

    async fn acquire(&self) -> Result<StoreLease<S>, StorageError> {
        let guard = Arc::clone(&self.gate).lock_owned().await;
        Ok(StoreLease {
            store: Arc::clone(&self.store),
            _guard: guard,
        })
    }
}

/// A store opened at `path` for each lease and closed when the lease ends.
///
/// Lets several processes share one on-disk store: the store's own file
/// lock excludes other processes, the mutex excludes other tasks here.
pub struct PathStore {
    path: PathBuf,
    retry_interval: Duration,
    gate: Arc<Mutex<()>>,
}

impl PathStore {
    pub fn new(path: impl Into<PathBuf>, retry_interval: Duration) -> Self {
        Self {
            path: path.into(),
            retry_interval,
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StoreAccess for PathStore {
    type Store = SledStorage;

    async fn acquire(&self) -> Result<StoreLease<SledStorage>, StorageError> {
        let guard = Arc::clone(&self.gate).lock_owned().await;
        let store = open_with_retry(&self.path, self.retry_interval).await?;
        debug!(path = %self.path.display(), "store lease acquired");
        Ok(StoreLease {
            store: Arc::new(store),
            _guard: guard,
        })
    }
}
