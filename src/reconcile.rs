//! Master/local store reconciliation.
//!
//! Three ways of pulling a local store toward the master:
//!
//! - [`full_copy`] overwrites local with every master entry, no diffing;
//! - [`sync_new_entries`] merges only the `USER` account list, master
//!   first, keeping accounts that exist only locally;
//! - [`apply_snapshot`] writes a peer-supplied snapshot (see
//!   [`crate::sync`]) over local.
//!
//! None of them ever writes to the master.

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storage, StorageError};
use crate::types::Account;

pub type Snapshot = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Value under key {key} is not JSON: {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Copy every master entry into local, overwriting what is there.
/// Returns the number of entries copied.
pub fn full_copy<M, L>(master: &M, local: &L) -> Result<usize, ReconcileError>
where
    M: Storage + ?Sized,
    L: Storage + ?Sized,
{
    let entries = master.iterate_all()?;
    let copied = entries.len();
    for (key, value) in entries {
        local.put(&key, &value)?;
    }
    info!(copied, "local store overwritten from master");
    Ok(copied)
}

/// Merge two account lists by address.
///
/// Master entries win; entries only present locally are kept. The result
/// holds each address once, in no particular order.
pub fn merge_account_lists(local: Vec<Account>, master: Vec<Account>) -> Vec<Account> {
    let mut by_address: HashMap<String, Account> = HashMap::with_capacity(master.len() + local.len());
    for account in master {
        by_address.insert(account.address.clone(), account);
    }
    for account in local {
        by_address.entry(account.address.clone()).or_insert(account);
    }
    by_address.into_values().collect()
}

/// Merge the master's `USER` list into local and write the result to
/// local only. Returns the size of the merged list.
pub fn sync_new_entries<M, L>(master: &M, local: &L) -> Result<usize, ReconcileError>
where
    M: Storage + ?Sized,
    L: Storage + ?Sized,
{
    let master_accounts = master.get_accounts()?;
    let local_accounts = local.get_accounts()?;
    let (from_master, from_local) = (master_accounts.len(), local_accounts.len());

    let merged = merge_account_lists(local_accounts, master_accounts);
    local.put_accounts(&merged)?;
    debug!(from_master, from_local, merged = merged.len(), "account lists merged into local");
    Ok(merged.len())
}

/// Every entry of `store` as one JSON object.
pub fn export_snapshot<S: Storage + ?Sized>(store: &S) -> Result<Snapshot, ReconcileError> {
    let mut snapshot = Map::new();
    for (key, value) in store.iterate_all()? {
        let value: Value = serde_json::from_slice(&value)
            .map_err(|source| ReconcileError::InvalidValue { key: key.clone(), source })?;
        snapshot.insert(key, value);
    }
    Ok(snapshot)
}

/// Write every snapshot entry into `local`, overwriting. Returns the
/// number of entries written.
pub fn apply_snapshot<L: Storage + ?Sized>(local: &L, snapshot: Snapshot) -> Result<usize, ReconcileError> {
    let written = snapshot.len();
    for (key, value) in snapshot {
        let encoded = serde_json::to_vec(&value).map_err(StorageError::from)?;
        local.put(&key, &encoded)?;
    }
    info!(written, "snapshot applied to local store");
    Ok(written)
}
