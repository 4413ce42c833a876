//! Ledger mutation engine
//! The only writer of account balances. Each commit re-reads the account, re-checks
//! debit policy against the fresh balance and applies a compare-and-swap through the store.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::{
    config::LedgerConfig,
    errors::{LedgerError, LimitScope, Result},
    store::{chain_digest, AccountStore, DeltaOutcome, GENESIS_HASH},
    utils::mask_account,
    validator::{ensure_active, ensure_funds, TransactionDraft},
    Transaction, TransactionReceipt,
};

type HmacSha256 = Hmac<Sha256>;

/// Opening balance plus committed effects versus the stored balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconciliation {
    pub account_number: String,
    pub opening_balance: Decimal,
    pub net_committed: Decimal,
    pub current_balance: Decimal,
    pub entry_count: usize,
}

impl Reconciliation {
    pub fn is_balanced(&self) -> bool {
        self.opening_balance + self.net_committed == self.current_balance
    }
}

pub struct LedgerEngine {
    store: Arc<dyn AccountStore>,
    max_attempts: u32,
    receipt_secret: String,
}

impl LedgerEngine {
    pub fn new(config: &LedgerConfig, store: Arc<dyn AccountStore>) -> Self {
        Self {
            store,
            max_attempts: config.max_commit_attempts,
            receipt_secret: config.receipt_secret.clone(),
        }
    }

    /// Apply a validated draft. Any failure leaves balance and ledger untouched.
    pub fn commit(&self, draft: &TransactionDraft) -> Result<Transaction> {
        let delta = draft.transaction_type.signed(draft.amount);

        for attempt in 1..=self.max_attempts {
            let account = self.store.get_account(&draft.account_number)?;
            ensure_active(&account)?;
            if draft.transaction_type.is_debit() {
                ensure_funds(&account, draft.amount)?;
            }

            match self.store.apply_balance_delta(
                &account.account_number,
                delta,
                account.current_balance,
                draft.daily_cap.as_ref(),
                Transaction::from_draft(draft),
            )? {
                DeltaOutcome::Applied(transaction) => {
                    info!(
                        transaction_id = %transaction.transaction_id,
                        account = %mask_account(&transaction.account_number),
                        kind = ?transaction.transaction_type,
                        amount = %transaction.amount,
                        balance_after = %transaction.balance_after,
                        attempt,
                        "Transaction committed"
                    );
                    return Ok(transaction);
                }
                DeltaOutcome::Conflict { actual } => {
                    debug!(
                        account = %mask_account(&account.account_number),
                        expected = %account.current_balance,
                        actual = %actual,
                        attempt,
                        "Balance moved during commit, retrying"
                    );
                    std::thread::yield_now();
                }
                DeltaOutcome::CapExceeded { committed } => {
                    let Some(cap) = draft.daily_cap.as_ref() else {
                        return Err(LedgerError::StorageError {
                            message: "store enforced a volume cap that was not requested".to_string(),
                        });
                    };
                    warn!(
                        account = %mask_account(&draft.account_number),
                        actor = %cap.actor_id,
                        committed = %committed,
                        limit = %cap.limit,
                        "Daily limit reached during commit"
                    );
                    return Err(LedgerError::LimitExceeded {
                        role: cap.role,
                        scope: LimitScope::Daily,
                        amount: committed + draft.amount,
                        limit: cap.limit,
                    });
                }
            }
        }

        warn!(
            account = %mask_account(&draft.account_number),
            attempts = self.max_attempts,
            "Commit abandoned after repeated conflicts"
        );
        Err(LedgerError::LedgerConflict {
            account_number: draft.account_number.clone(),
            attempts: self.max_attempts,
        })
    }

    /// Customer-facing receipt; carries no fraud information
    pub fn receipt(&self, transaction: &Transaction) -> Result<TransactionReceipt> {
        Ok(TransactionReceipt {
            transaction_id: transaction.transaction_id,
            account_number: transaction.account_number.clone(),
            transaction_type: transaction.transaction_type,
            amount: transaction.amount,
            new_balance: transaction.balance_after,
            timestamp: transaction.timestamp,
            requires_review: transaction.requires_review,
            confirmation_code: self.confirmation_code(transaction)?,
        })
    }

    /// Check a confirmation code read back from a printed receipt
    pub fn verify_confirmation_code(&self, transaction: &Transaction, code: &str) -> Result<bool> {
        Ok(self.confirmation_code(transaction)? == code.trim().to_uppercase())
    }

    /// Recompute the account's hash chain in commit order
    pub fn verify_chain(&self, account_number: &str) -> Result<bool> {
        let entries = self.store.ledger_entries(account_number)?;
        let mut previous = GENESIS_HASH.to_string();
        for entry in &entries {
            if chain_digest(&previous, entry) != entry.entry_hash {
                warn!(
                    account = %mask_account(account_number),
                    transaction_id = %entry.transaction_id,
                    "Ledger hash chain broken"
                );
                return Ok(false);
            }
            previous = entry.entry_hash.clone();
        }
        Ok(true)
    }

    pub fn reconcile(&self, account_number: &str) -> Result<Reconciliation> {
        let account = self.store.get_account(account_number)?;
        let entries = self.store.ledger_entries(account_number)?;
        Ok(Reconciliation {
            account_number: account.account_number,
            opening_balance: account.opening_balance,
            net_committed: entries.iter().map(Transaction::signed_amount).sum(),
            current_balance: account.current_balance,
            entry_count: entries.len(),
        })
    }

    fn confirmation_code(&self, transaction: &Transaction) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.receipt_secret.as_bytes()).map_err(|e| {
            LedgerError::CryptographyError {
                message: format!("Invalid receipt key: {}", e),
            }
        })?;
        mac.update(transaction.transaction_id.as_bytes());
        mac.update(transaction.entry_hash.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        Ok(digest[..8].to_uppercase())
    }
}
