//! Block assembly: decides which block an accepted transaction lands in.
//!
//! The newest block stays open until it holds `capacity` transactions; the
//! next transaction then cuts a new block chained onto it. There is no
//! byte limit and no batching beyond this count.

use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storage, StorageError};
use crate::types::{Block, Transaction, USER_KEY};

/// Transactions per block before a new block is cut.
pub const BLOCK_CAPACITY: usize = 5;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Chain discontinuity: {0}")]
    ChainDiscontinuity(String),
    #[error("Invalid block key: {0}")]
    InvalidBlockKey(String),
}

/// Where a transaction was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Appended to the open block at `index`.
    Appended { index: i64, position: usize },
    /// Started a new block at `index`.
    Opened { index: i64 },
}

impl Placement {
    pub fn block_index(&self) -> i64 {
        match self {
            Placement::Appended { index, .. } | Placement::Opened { index } => *index,
        }
    }
}

/// Highest block index present in `store`.
pub fn latest_block_index<S: Storage + ?Sized>(store: &S) -> Result<i64, AssemblyError> {
    let mut latest: Option<i64> = None;
    for (key, _) in store.iterate_all()? {
        if key == USER_KEY {
            continue;
        }
        let index: i64 = key
            .parse()
            .map_err(|_| AssemblyError::InvalidBlockKey(key.clone()))?;
        latest = Some(latest.map_or(index, |l| l.max(index)));
    }
    latest.ok_or_else(|| AssemblyError::ChainDiscontinuity("no blocks in store".to_string()))
}

#[derive(Debug, Clone)]
pub struct BlockAssembler {
    capacity: usize,
}

impl Default for BlockAssembler {
    fn default() -> Self {
        Self::new(BLOCK_CAPACITY)
    }
}

impl BlockAssembler {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Compute the block `tx` belongs in, without writing anything.
    ///
    /// The caller must hold the store's lease until the returned block is
    /// persisted.
    pub fn place<S: Storage + ?Sized>(
        &self,
        store: &S,
        mut tx: Transaction,
    ) -> Result<(Block, Placement), AssemblyError> {
        let latest = latest_block_index(store)?;
        let mut block = store.get_block(latest)?.ok_or_else(|| {
            AssemblyError::ChainDiscontinuity(format!("block {} could not be loaded", latest))
        })?;

        if block.transactions.len() < self.capacity {
            let position = block.transactions.len();
            tx.index = position as i64;
            block.transactions.push(tx);
            block.hash = block.calculate_hash();
            debug!(index = latest, position, "transaction appended to open block");
            Ok((block, Placement::Appended { index: latest, position }))
        } else {
            let index = latest + 1;
            tx.index = 0;
            let next = Block::new(index, block.hash.clone(), vec![tx], index);
            info!(index, prev_hash = %next.prev_hash, "new block opened");
            Ok((next, Placement::Opened { index }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledStorage;

    fn seeded_store() -> SledStorage {
        let store = SledStorage::temporary().unwrap();
        let (genesis, _) = Block::genesis();
        store.put_block(&genesis).unwrap();
        store.put_accounts(&[]).unwrap();
        store
    }

    fn place_and_store(assembler: &BlockAssembler, store: &SledStorage, tx: Transaction) -> Placement {
        let (block, placement) = assembler.place(store, tx).unwrap();
        store.put_block(&block).unwrap();
        placement
    }

    #[test]
    fn test_latest_block_index_skips_user_key() {
        let store = SledStorage::temporary().unwrap();
        store.put_accounts(&[]).unwrap();
        assert!(matches!(
            latest_block_index(&store),
            Err(AssemblyError::ChainDiscontinuity(_))
        ));

        for i in [0, 2, 10] {
            store.put_block(&Block::new(i, "", vec![], i)).unwrap();
        }
        // "10" sorts before "2" lexically; the index must still win numerically.
        assert_eq!(latest_block_index(&store).unwrap(), 10);

        store.put("bogus", b"{}").unwrap();
        assert!(matches!(
            latest_block_index(&store),
            Err(AssemblyError::InvalidBlockKey(k)) if k == "bogus"
        ));
    }

    #[test]
    fn test_full_block_opens_next() {
        let store = seeded_store();
        let assembler = BlockAssembler::default();
        let genesis = store.get_block(0).unwrap().unwrap();

        let (block, placement) = assembler.place(&store, Transaction::new("a", "b", 1, "s")).unwrap();
        assert_eq!(placement, Placement::Opened { index: 1 });
        assert_eq!(block.index, 1);
        assert_eq!(block.prev_hash, genesis.hash);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.is_hash_valid());
        // Placing writes nothing.
        assert!(store.get_block(1).unwrap().is_none());
    }

    #[test]
    fn test_open_block_fills_to_capacity() {
        let store = seeded_store();
        let assembler = BlockAssembler::default();

        let placements: Vec<Placement> = (1..=BLOCK_CAPACITY as u64 + 1)
            .map(|amount| place_and_store(&assembler, &store, Transaction::new("a", "b", amount, "s")))
            .collect();

        assert_eq!(placements[0], Placement::Opened { index: 1 });
        for (i, p) in placements[1..BLOCK_CAPACITY].iter().enumerate() {
            assert_eq!(*p, Placement::Appended { index: 1, position: i + 1 });
        }
        assert_eq!(placements[BLOCK_CAPACITY], Placement::Opened { index: 2 });

        let first = store.get_block(1).unwrap().unwrap();
        let second = store.get_block(2).unwrap().unwrap();
        assert_eq!(first.transactions.len(), BLOCK_CAPACITY);
        assert!(first.is_hash_valid());
        assert_eq!(second.prev_hash, first.hash);
        let positions: Vec<i64> = first.transactions.iter().map(|tx| tx.index).collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_custom_capacity() {
        let store = seeded_store();
        let assembler = BlockAssembler::new(2);
        let placements: Vec<i64> = (0..5)
            .map(|_| place_and_store(&assembler, &store, Transaction::new("a", "b", 1, "s")).block_index())
            .collect();
        assert_eq!(placements, vec![1, 1, 2, 2, 3]);
    }

    #[test]
    fn test_missing_chain_is_reported() {
        let store = SledStorage::temporary().unwrap();
        let err = BlockAssembler::default()
            .place(&store, Transaction::new("a", "b", 1, "s"))
            .unwrap_err();
        assert!(matches!(err, AssemblyError::ChainDiscontinuity(_)));
        assert!(store.is_empty().unwrap());
    }
}
