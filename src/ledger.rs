use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::assembly::{AssemblyError, BlockAssembler, Placement};
use crate::storage::{Storage, StorageBatch, StorageError, StoreAccess};
use crate::types::{Account, Transaction};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Assembly error: {0}")]
    AssemblyError(#[from] AssemblyError),
    #[error("Account already exists: {0}")]
    DuplicateAddress(String),
    #[error("Account not found for address: {0}")]
    AccountNotFound(String),
    #[error("Sender not found: {0}")]
    SenderNotFound(String),
    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),
    #[error("Insufficient funds in {address}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        address: String,
        balance: Decimal,
        requested: Decimal,
    },
    #[error("Invalid amount: transfers must be positive and balances non-negative")]
    InvalidAmount,
    #[error("Cannot transfer to self: {0}")]
    SelfTransfer(String),
    #[error("Balance overflow for {0}")]
    BalanceOverflow(String),
}

/// In-memory view of the `USER` list, indexed by address.
///
/// Rehydrated from the store on every critical-section entry and flushed
/// back whole. The list order is kept as stored.
#[derive(Debug, Clone, Default)]
pub struct AccountBook {
    accounts: Vec<Account>,
    index: HashMap<String, usize>,
}

impl AccountBook {
    pub fn from_accounts(accounts: Vec<Account>) -> Self {
        let mut index = HashMap::with_capacity(accounts.len());
        for (i, account) in accounts.iter().enumerate() {
            index.entry(account.address.clone()).or_insert(i);
        }
        AccountBook { accounts, index }
    }

    pub fn load<S: Storage + ?Sized>(store: &S) -> Result<Self, StorageError> {
        Ok(Self::from_accounts(store.get_accounts()?))
    }

    pub fn get(&self, address: &str) -> Option<&Account> {
        self.index.get(address).map(|&i| &self.accounts[i])
    }

    pub fn balance(&self, address: &str) -> Option<Decimal> {
        self.get(address).map(|a| a.balance)
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn insert(&mut self, account: Account) -> Result<&Account, LedgerError> {
        if self.index.contains_key(&account.address) {
            return Err(LedgerError::DuplicateAddress(account.address));
        }
        let i = self.accounts.len();
        self.index.insert(account.address.clone(), i);
        self.accounts.push(account);
        Ok(&self.accounts[i])
    }

    /// Move `amount` from `sender` to `recipient`.
    ///
    /// Every check runs before either balance is touched, so a failed
    /// transfer leaves the book unchanged.
    pub fn transfer(&mut self, sender: &str, recipient: &str, amount: Decimal) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        let from = *self
            .index
            .get(sender)
            .ok_or_else(|| LedgerError::SenderNotFound(sender.to_string()))?;
        if sender == recipient {
            return Err(LedgerError::SelfTransfer(sender.to_string()));
        }
        let to = *self
            .index
            .get(recipient)
            .ok_or_else(|| LedgerError::RecipientNotFound(recipient.to_string()))?;

        let balance = self.accounts[from].balance;
        if balance < amount {
            return Err(LedgerError::InsufficientFunds {
                address: sender.to_string(),
                balance,
                requested: amount,
            });
        }
        let credited = self.accounts[to]
            .balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::BalanceOverflow(recipient.to_string()))?;

        self.accounts[from].balance = balance - amount;
        self.accounts[to].balance = credited;
        Ok(())
    }

    pub fn into_accounts(self) -> Vec<Account> {
        self.accounts
    }
}

/// Account balances held under `USER` in the master store.
///
/// Every mutation is a read-modify-write of the whole list performed while
/// holding the master lease, then mirrored into this node's local store.
///
/// This is the only safeguard against conflicting transfers. There is no
/// consensus: a master store that is tampered with or partitioned diverges
/// without anyone noticing.
pub struct Ledger<M, L> {
    master: M,
    local: Arc<L>,
}

impl<M: StoreAccess, L: Storage> Ledger<M, L> {
    pub fn new(master: M, local: Arc<L>) -> Self {
        Ledger { master, local }
    }

    pub fn master(&self) -> &M {
        &self.master
    }

    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    pub async fn create_account(
        &self,
        address: &str,
        public_key: &str,
        initial_balance: impl Into<Decimal>,
    ) -> Result<Account, LedgerError> {
        let initial_balance = initial_balance.into();
        if initial_balance.is_sign_negative() {
            return Err(LedgerError::InvalidAmount);
        }
        let lease = self.master.acquire().await?;
        let mut book = AccountBook::load(&*lease)?;
        let account = book
            .insert(Account::new(address, public_key, initial_balance))?
            .clone();
        lease.put_accounts(book.accounts())?;
        drop(lease);

        self.local.put_accounts(book.accounts())?;
        info!(address, %initial_balance, accounts = book.len(), "account created");
        Ok(account)
    }

    pub async fn get_balance(&self, address: &str) -> Result<Decimal, LedgerError> {
        let lease = self.master.acquire().await?;
        let book = AccountBook::load(&*lease)?;
        book.balance(address)
            .ok_or_else(|| LedgerError::AccountNotFound(address.to_string()))
    }

    /// Move funds between two accounts without recording a transaction.
    ///
    /// Request handling goes through [`Ledger::commit_transfer`]; this is the
    /// balance-only form for callers that keep their own record.
    pub async fn transfer(
        &self,
        sender: &str,
        recipient: &str,
        amount: impl Into<Decimal>,
    ) -> Result<(), LedgerError> {
        let amount = amount.into();
        let lease = self.master.acquire().await?;
        let mut book = AccountBook::load(&*lease)?;
        book.transfer(sender, recipient, amount)?;
        lease.put_accounts(book.accounts())?;
        drop(lease);

        self.local.put_accounts(book.accounts())?;
        debug!(sender, recipient, %amount, "transfer committed");
        Ok(())
    }

    /// Apply `tx` to the balances and place it in a block, as one unit.
    ///
    /// Both updates are computed under a single master lease and written in
    /// one batch, so a transfer that cannot be placed in the chain leaves
    /// the balances untouched.
    pub async fn commit_transfer(
        &self,
        tx: Transaction,
        assembler: &BlockAssembler,
    ) -> Result<Placement, LedgerError> {
        let lease = self.master.acquire().await?;
        let mut book = AccountBook::load(&*lease)?;
        book.transfer(&tx.sender, &tx.recipient, tx.amount)?;
        let (block, placement) = assembler.place(&*lease, tx)?;

        let mut batch = StorageBatch::default();
        batch.put_accounts(book.accounts())?;
        batch.put_block(&block)?;
        lease.apply_batch(batch)?;
        drop(lease);

        let mut mirror = StorageBatch::default();
        mirror.put_accounts(book.accounts())?;
        mirror.put_block(&block)?;
        if let Err(e) = self.local.apply_batch(mirror) {
            warn!(block = block.index, error = %e, "master committed but local mirror failed");
            return Err(e.into());
        }
        Ok(placement)
    }
}
