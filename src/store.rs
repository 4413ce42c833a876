//! Account store: balances, account status and the append-only ledger
//!
//! The store is the single authoritative data source. Balance changes happen only
//! through [`AccountStore::apply_balance_delta`], which compares the expected prior
//! balance, writes the new balance and appends the ledger entry in one critical
//! section.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    auth::Role,
    errors::{LedgerError, Result},
    Account, AccountStatus, Transaction, TransactionType,
};

/// Digest that anchors the first entry of every account chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Result of a conditional balance write
#[derive(Debug, Clone)]
pub enum DeltaOutcome {
    /// Balance written and entry appended; the entry carries `balance_after` and `entry_hash`
    Applied(Transaction),
    /// The balance moved since it was read
    Conflict { actual: Decimal },
    /// The actor's committed volume in the cap window leaves no room for this entry
    CapExceeded { committed: Decimal },
}

/// Ceiling on what one actor may commit in `[from, to)`, checked in the same
/// critical section as the balance write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorVolumeCap {
    pub actor_id: String,
    pub role: Role,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub limit: Decimal,
}

pub trait AccountStore: Send + Sync {
    fn get_account(&self, account_number: &str) -> Result<Account>;

    /// Atomically apply `delta` if the balance still equals `expected_prior`
    /// and the entry fits under `cap`.
    ///
    /// On success the store stamps `balance_after` and `entry_hash` on `entry`
    /// and appends it. Otherwise nothing is written.
    fn apply_balance_delta(
        &self,
        account_number: &str,
        delta: Decimal,
        expected_prior: Decimal,
        cap: Option<&ActorVolumeCap>,
        entry: Transaction,
    ) -> Result<DeltaOutcome>;

    /// Entries for one account with `timestamp >= since`, oldest first
    fn history(&self, account_number: &str, since: DateTime<Utc>) -> Result<Vec<Transaction>>;

    /// Every entry of one account in commit order
    fn ledger_entries(&self, account_number: &str) -> Result<Vec<Transaction>>;

    fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction>;

    /// Filtered listing, newest first
    fn query(&self, query: &TransactionQuery) -> Result<Vec<Transaction>>;

    /// Sum of amounts committed by one actor in `[from, to)`
    fn actor_volume_between(
        &self,
        actor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Decimal>;
}

/// Composable optional predicates for ledger listings
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    pub account_number: Option<String>,
    pub transaction_type: Option<TransactionType>,
    pub actor_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl TransactionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_account(mut self, account_number: &str) -> Self {
        self.account_number = Some(account_number.trim().to_string());
        self
    }

    pub fn of_type(mut self, transaction_type: TransactionType) -> Self {
        self.transaction_type = Some(transaction_type);
        self
    }

    pub fn by_actor(mut self, actor_id: &str) -> Self {
        self.actor_id = Some(actor_id.trim().to_string());
        self
    }

    pub fn since(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn until(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn amount_between(mut self, min: Option<Decimal>, max: Option<Decimal>) -> Self {
        self.min_amount = min;
        self.max_amount = max;
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        self.account_number
            .as_deref()
            .map_or(true, |number| tx.account_number == number)
            && self
                .transaction_type
                .map_or(true, |kind| tx.transaction_type == kind)
            && self.actor_id.as_deref().map_or(true, |actor| tx.actor_id == actor)
            && self.from.map_or(true, |from| tx.timestamp >= from)
            && self.to.map_or(true, |to| tx.timestamp <= to)
            && self.min_amount.map_or(true, |min| tx.amount >= min)
            && self.max_amount.map_or(true, |max| tx.amount <= max)
    }
}

/// Chained SHA-256 digest of a ledger entry
pub fn chain_digest(previous_hash: &str, entry: &Transaction) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(entry.transaction_id.as_bytes());
    hasher.update(entry.account_number.as_bytes());
    hasher.update(entry.transaction_type.code().as_bytes());
    hasher.update(entry.amount.normalize().to_string().as_bytes());
    hasher.update(entry.balance_after.normalize().to_string().as_bytes());
    hasher.update(entry.actor_id.as_bytes());
    hasher.update(entry.timestamp.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());

    hex::encode(hasher.finalize())
}

fn actor_volume(
    entries: &[Transaction],
    actor_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Decimal {
    entries
        .iter()
        .filter(|tx| tx.actor_id == actor_id && tx.timestamp >= from && tx.timestamp < to)
        .map(|tx| tx.amount)
        .sum()
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<String, AccountSlot>,
    entries: Vec<Transaction>,
    by_id: HashMap<Uuid, usize>,
}

#[derive(Debug)]
struct AccountSlot {
    account: Account,
    entry_indexes: Vec<usize>,
    last_hash: String,
}

/// Process-local store guarded by a single lock
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    state: RwLock<LedgerState>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account opened by the account-opening collaborator
    pub fn open_account(&self, mut account: Account) -> Result<()> {
        account.account_number = account.account_number.trim().to_string();
        account.current_balance = account.opening_balance;

        let mut state = self.write()?;
        if state.accounts.contains_key(&account.account_number) {
            return Err(LedgerError::StorageError {
                message: format!("Account already exists: {}", account.account_number),
            });
        }

        state.accounts.insert(
            account.account_number.clone(),
            AccountSlot {
                account,
                entry_indexes: Vec::new(),
                last_hash: GENESIS_HASH.to_string(),
            },
        );
        Ok(())
    }

    /// Accounts are deactivated, never deleted
    pub fn set_status(&self, account_number: &str, status: AccountStatus) -> Result<()> {
        let mut state = self.write()?;
        let slot = state
            .accounts
            .get_mut(account_number.trim())
            .ok_or_else(|| LedgerError::AccountNotFound {
                account_number: account_number.to_string(),
            })?;
        slot.account.status = status;
        Ok(())
    }

    pub fn account_numbers(&self) -> Result<Vec<String>> {
        let state = self.read()?;
        let mut numbers: Vec<String> = state.accounts.keys().cloned().collect();
        numbers.sort();
        Ok(numbers)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LedgerState>> {
        self.state.read().map_err(|_| LedgerError::StorageError {
            message: "ledger state lock poisoned".to_string(),
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LedgerState>> {
        self.state.write().map_err(|_| LedgerError::StorageError {
            message: "ledger state lock poisoned".to_string(),
        })
    }
}

impl AccountStore for InMemoryAccountStore {
    fn get_account(&self, account_number: &str) -> Result<Account> {
        let state = self.read()?;
        state
            .accounts
            .get(account_number.trim())
            .map(|slot| slot.account.clone())
            .ok_or_else(|| LedgerError::AccountNotFound {
                account_number: account_number.to_string(),
            })
    }

    fn apply_balance_delta(
        &self,
        account_number: &str,
        delta: Decimal,
        expected_prior: Decimal,
        cap: Option<&ActorVolumeCap>,
        mut entry: Transaction,
    ) -> Result<DeltaOutcome> {
        let mut state = self.write()?;
        let next_index = state.entries.len();

        if let Some(cap) = cap {
            let committed = actor_volume(&state.entries, cap.actor_id.trim(), cap.from, cap.to);
            if committed + entry.amount > cap.limit {
                return Ok(DeltaOutcome::CapExceeded { committed });
            }
        }

        let slot = state
            .accounts
            .get_mut(account_number.trim())
            .ok_or_else(|| LedgerError::AccountNotFound {
                account_number: account_number.to_string(),
            })?;

        if slot.account.current_balance != expected_prior {
            return Ok(DeltaOutcome::Conflict {
                actual: slot.account.current_balance,
            });
        }

        let new_balance = expected_prior + delta;
        entry.balance_after = new_balance;
        entry.entry_hash = chain_digest(&slot.last_hash, &entry);

        slot.account.current_balance = new_balance;
        slot.last_hash = entry.entry_hash.clone();
        slot.entry_indexes.push(next_index);

        state.by_id.insert(entry.transaction_id, next_index);
        state.entries.push(entry.clone());

        Ok(DeltaOutcome::Applied(entry))
    }

    fn history(&self, account_number: &str, since: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let state = self.read()?;
        let slot = state
            .accounts
            .get(account_number.trim())
            .ok_or_else(|| LedgerError::AccountNotFound {
                account_number: account_number.to_string(),
            })?;

        let mut history: Vec<Transaction> = slot
            .entry_indexes
            .iter()
            .map(|&index| &state.entries[index])
            .filter(|tx| tx.timestamp >= since)
            .cloned()
            .collect();
        history.sort_by_key(|tx| tx.timestamp);
        Ok(history)
    }

    fn ledger_entries(&self, account_number: &str) -> Result<Vec<Transaction>> {
        let state = self.read()?;
        let slot = state
            .accounts
            .get(account_number.trim())
            .ok_or_else(|| LedgerError::AccountNotFound {
                account_number: account_number.to_string(),
            })?;
        Ok(slot
            .entry_indexes
            .iter()
            .map(|&index| state.entries[index].clone())
            .collect())
    }

    fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction> {
        let state = self.read()?;
        state
            .by_id
            .get(&transaction_id)
            .map(|&index| state.entries[index].clone())
            .ok_or(LedgerError::TransactionNotFound { transaction_id })
    }

    fn query(&self, query: &TransactionQuery) -> Result<Vec<Transaction>> {
        let state = self.read()?;
        let mut matched: Vec<&Transaction> =
            state.entries.iter().filter(|tx| query.matches(tx)).collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn actor_volume_between(
        &self,
        actor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Decimal> {
        let state = self.read()?;
        Ok(actor_volume(&state.entries, actor_id.trim(), from, to))
    }
}
