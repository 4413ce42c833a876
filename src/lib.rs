//! LedgerGuard - transaction ledger and fraud rule engine for retail banking
//!
//! Every money-movement request passes through:
//! - intake validation (account state, actor authorization, funds, role limits, OTP)
//! - an atomic balance mutation that appends an immutable, hash-chained ledger entry
//! - an asynchronous fraud scan whose alerts feed a live reviewer dashboard

pub mod alerts;
pub mod auth;
pub mod cache;
pub mod config;
pub mod errors;
pub mod fraud_detection;
pub mod ledger;
pub mod notify;
pub mod otp;
pub mod rules;
pub mod store;
pub mod utils;
pub mod validator;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    alerts::{AlertQuery, AlertSink, AlertStatus, DashboardSubscription, FraudAlert},
    auth::{Actor, ActorDirectory},
    config::LedgerConfig,
    errors::{LedgerError, Result},
    fraud_detection::{FraudScanner, FraudWorker, ScanQueue},
    ledger::{LedgerEngine, Reconciliation},
    notify::Notifier,
    otp::OtpManager,
    rules::{CachedRuleCatalog, FraudRule, RuleCatalog},
    store::{AccountStore, TransactionQuery},
    utils::mask_account,
    validator::{IntakeValidator, TransactionDraft},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Active,
    Inactive,
}

/// Customer account as seen by the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_number: String,
    pub customer_id: String,
    pub current_balance: Decimal,
    pub status: AccountStatus,
    /// Floor set by the account type
    pub minimum_balance: Decimal,
    pub opening_date: DateTime<Utc>,
    pub opening_balance: Decimal,
    /// Destination for OTP codes
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    FdOpen,
    FdClose,
    Interest,
}

impl TransactionType {
    /// Withdrawal-class types reduce the balance
    pub fn is_debit(&self) -> bool {
        matches!(self, TransactionType::Withdrawal | TransactionType::FdOpen)
    }

    pub fn signed(&self, amount: Decimal) -> Decimal {
        if self.is_debit() {
            -amount
        } else {
            amount
        }
    }

    /// Short code used in ledger digests and statements
    pub fn code(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "DEP",
            TransactionType::Withdrawal => "WIT",
            TransactionType::FdOpen => "FDO",
            TransactionType::FdClose => "FDC",
            TransactionType::Interest => "INT",
        }
    }
}

/// Committed ledger entry. Never modified after commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub transaction_type: TransactionType,
    pub account_number: String,
    pub amount: Decimal,
    pub actor_id: String,
    pub reference: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub balance_after: Decimal,
    /// Committed above the actor's approval threshold
    pub requires_review: bool,
    pub entry_hash: String,
}

impl Transaction {
    /// Unstamped entry; the store fills `balance_after` and `entry_hash`
    pub fn from_draft(draft: &TransactionDraft) -> Self {
        Self {
            transaction_id: draft.transaction_id,
            transaction_type: draft.transaction_type,
            account_number: draft.account_number.clone(),
            amount: draft.amount,
            actor_id: draft.actor_id.clone(),
            reference: draft.reference.clone(),
            timestamp: draft.timestamp,
            balance_after: Decimal::ZERO,
            requires_review: draft.requires_review,
            entry_hash: String::new(),
        }
    }

    pub fn signed_amount(&self) -> Decimal {
        self.transaction_type.signed(self.amount)
    }
}

/// Money-movement request as submitted at the counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub account_number: String,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub reference: Option<String>,
    /// Set when the front end already verified an OTP with the customer
    pub otp_verified: bool,
    /// Overrides the phone number on file for OTP lookups
    pub customer_phone: Option<String>,
}

impl TransactionRequest {
    pub fn new(account_number: &str, transaction_type: TransactionType, amount: Decimal) -> Self {
        Self {
            account_number: account_number.trim().to_string(),
            transaction_type,
            amount,
            reference: None,
            otp_verified: false,
            customer_phone: None,
        }
    }

    pub fn with_reference(mut self, reference: &str) -> Self {
        self.reference = Some(reference.to_string());
        self
    }

    pub fn with_otp_verified(mut self) -> Self {
        self.otp_verified = true;
        self
    }

    pub fn with_phone(mut self, phone: &str) -> Self {
        self.customer_phone = Some(phone.to_string());
        self
    }
}

/// What the customer receives. Never carries fraud information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_id: Uuid,
    pub account_number: String,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub new_balance: Decimal,
    pub timestamp: DateTime<Utc>,
    pub requires_review: bool,
    pub confirmation_code: String,
}

/// Outstanding OTP, as reported back to the teller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpChallenge {
    pub verification_id: Uuid,
    pub masked_phone: String,
    pub expires_at: DateTime<Utc>,
}

/// External systems LedgerGuard runs against
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn AccountStore>,
    pub directory: Arc<dyn ActorDirectory>,
    pub rules: Arc<dyn RuleCatalog>,
    pub notifier: Arc<dyn Notifier>,
}

/// Main LedgerGuard structure
pub struct LedgerGuard {
    config: Arc<LedgerConfig>,
    store: Arc<dyn AccountStore>,
    validator: IntakeValidator,
    ledger: LedgerEngine,
    rules: Arc<CachedRuleCatalog>,
    scanner: Arc<FraudScanner>,
    scan_queue: ScanQueue,
    alerts: Arc<AlertSink>,
    otp: Arc<OtpManager>,
    notifier: Arc<dyn Notifier>,
    worker: Option<JoinHandle<()>>,
    stats_ticker: Option<JoinHandle<()>>,
}

impl LedgerGuard {
    /// Wire the pipeline and spawn the fraud worker and stats ticker.
    /// Must be called from within a tokio runtime.
    pub fn start(config: LedgerConfig, collaborators: Collaborators) -> Result<Self> {
        config
            .validate()
            .map_err(|message| LedgerError::ConfigError { message })?;
        tokio::runtime::Handle::try_current().map_err(|e| LedgerError::ConfigError {
            message: format!("LedgerGuard needs a tokio runtime: {}", e),
        })?;

        let config = Arc::new(config);
        let Collaborators {
            store,
            directory,
            rules,
            notifier,
        } = collaborators;

        let rules = Arc::new(CachedRuleCatalog::new(
            rules,
            StdDuration::from_secs(config.rule_cache_ttl_seconds),
        ));
        let otp = Arc::new(OtpManager::new(&config));
        let alerts = Arc::new(AlertSink::new(&config));
        let scanner = Arc::new(FraudScanner::new(
            &config,
            store.clone(),
            rules.clone(),
            alerts.clone(),
        ));

        let (scan_queue, worker) = FraudWorker::new(scanner.clone(), config.scan_queue_capacity);
        let worker = worker.spawn();
        let stats_ticker = alerts
            .clone()
            .spawn_stats_ticker(StdDuration::from_secs(config.stats_interval_seconds.max(1)));

        info!(
            history_window_days = config.history_window_days,
            scan_queue_capacity = config.scan_queue_capacity,
            "LedgerGuard started"
        );

        Ok(Self {
            validator: IntakeValidator::new(
                config.clone(),
                store.clone(),
                directory,
                otp.clone(),
            ),
            ledger: LedgerEngine::new(&config, store.clone()),
            config,
            store,
            rules,
            scanner,
            scan_queue,
            alerts,
            otp,
            notifier,
            worker: Some(worker),
            stats_ticker: Some(stats_ticker),
        })
    }

    /// Validate, commit and queue a fraud scan
    pub fn process_transaction(
        &self,
        request: &TransactionRequest,
        actor: &Actor,
    ) -> Result<TransactionReceipt> {
        self.process_transaction_at(request, actor, Utc::now())
    }

    /// As [`Self::process_transaction`], stamped with `at`
    pub(crate) fn process_transaction_at(
        &self,
        request: &TransactionRequest,
        actor: &Actor,
        at: DateTime<Utc>,
    ) -> Result<TransactionReceipt> {
        let reject = |e: LedgerError| {
            warn!(
                account = %mask_account(&request.account_number),
                actor = %actor.employee_id,
                branch = actor.branch_id.as_deref().unwrap_or("-"),
                error = %e,
                severity = ?e.severity(),
                "Transaction rejected"
            );
            e
        };

        let draft = self.validator.validate_at(request, actor, at).map_err(reject)?;

        // A stored verification clears one transaction; concurrent requests race for it here
        let grant = match draft.otp_phone.as_deref() {
            Some(phone) => match self.otp.consume(phone, draft.amount)? {
                Some(grant) => Some(grant),
                None => {
                    return Err(reject(LedgerError::OtpRequired {
                        threshold: self.otp.threshold(),
                    }))
                }
            },
            None => None,
        };

        let transaction = match self.ledger.commit(&draft) {
            Ok(transaction) => transaction,
            Err(e) => {
                if let Some(grant) = grant {
                    self.otp.reinstate(grant);
                }
                return Err(e);
            }
        };
        let receipt = self.ledger.receipt(&transaction)?;

        if transaction.amount > self.config.large_transaction_threshold {
            self.notifier
                .notify_large_transaction(&transaction, self.config.large_transaction_threshold);
        }
        if transaction.requires_review {
            self.notifier.notify_review_required(&transaction);
        }

        self.scan_queue.enqueue(transaction);
        Ok(receipt)
    }

    /// Issue an OTP to the phone on file for a pending large transaction
    pub fn request_otp(&self, account_number: &str, amount: Decimal) -> Result<OtpChallenge> {
        let account = self.store.get_account(account_number)?;
        let phone = account
            .phone_number
            .as_deref()
            .ok_or_else(|| LedgerError::OtpInvalid {
                message: "no phone number on file".to_string(),
            })?;

        let issued = self.otp.issue(phone, amount)?;
        self.notifier.deliver_otp(&issued);
        Ok(OtpChallenge {
            verification_id: issued.verification_id,
            masked_phone: mask_account(&issued.phone_number),
            expires_at: issued.expires_at,
        })
    }

    pub fn verify_otp(&self, account_number: &str, code: &str) -> Result<Uuid> {
        let account = self.store.get_account(account_number)?;
        let phone = account
            .phone_number
            .as_deref()
            .ok_or_else(|| LedgerError::OtpInvalid {
                message: "no phone number on file".to_string(),
            })?;
        self.otp.verify(phone, code)
    }

    /// Re-run fraud rules on one stored transaction
    pub fn rescan(&self, transaction_id: Uuid) -> Result<Vec<FraudAlert>> {
        let transaction = self.store.get_transaction(transaction_id)?;
        self.scanner.scan(&transaction)
    }

    /// Re-run fraud rules over everything committed in the last `hours`
    pub fn rescan_recent(&self, hours: i64) -> Result<Vec<FraudAlert>> {
        let since = Duration::try_hours(hours)
            .filter(|_| hours >= 0)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or(LedgerError::InvalidWindow { hours })?;
        let mut transactions = self.store.query(&TransactionQuery::new().since(since))?;
        transactions.reverse();

        let mut created = Vec::new();
        for transaction in &transactions {
            match self.scanner.scan(transaction) {
                Ok(alerts) => created.extend(alerts),
                Err(e) => error!(
                    transaction_id = %transaction.transaction_id,
                    error = %e,
                    "Rescan failed"
                ),
            }
        }

        info!(
            scanned = transactions.len(),
            alerts = created.len(),
            hours,
            "Recent transactions rescanned"
        );
        Ok(created)
    }

    /// Wait until queued fraud scans have run
    pub async fn flush_scans(&self) {
        if !self.scan_queue.flush().await {
            warn!("Fraud worker is not running");
        }
    }

    pub fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction> {
        self.store.get_transaction(transaction_id)
    }

    pub fn transactions(&self, query: &TransactionQuery) -> Result<Vec<Transaction>> {
        self.store.query(query)
    }

    pub fn verify_chain(&self, account_number: &str) -> Result<bool> {
        self.ledger.verify_chain(account_number)
    }

    pub fn reconcile(&self, account_number: &str) -> Result<Reconciliation> {
        self.ledger.reconcile(account_number)
    }

    pub fn rules(&self) -> Result<Vec<FraudRule>> {
        self.rules.all_rules()
    }

    pub fn set_rule_active(&self, rule_id: u32, is_active: bool) -> Result<FraudRule> {
        self.rules.set_rule_active(rule_id, is_active)
    }

    pub fn alerts(&self) -> Arc<AlertSink> {
        self.alerts.clone()
    }

    pub fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<FraudAlert>> {
        self.alerts.list(query)
    }

    pub fn resolve_alert(
        &self,
        alert_id: Uuid,
        status: AlertStatus,
        reviewer: &Actor,
        notes: Option<String>,
    ) -> Result<FraudAlert> {
        self.alerts.resolve(alert_id, status, &reviewer.employee_id, notes)
    }

    pub fn subscribe_dashboard(&self) -> Result<DashboardSubscription> {
        self.alerts.subscribe()
    }

    /// Get fraud pipeline statistics for monitoring
    pub fn get_fraud_statistics(&self) -> HashMap<String, f64> {
        self.scanner.statistics().get_statistics()
    }

    /// Drain queued scans, then stop background tasks
    pub async fn shutdown(self) {
        let LedgerGuard {
            scan_queue,
            worker,
            stats_ticker,
            ..
        } = self;

        drop(scan_queue);
        if let Some(ticker) = stats_ticker {
            ticker.abort();
        }
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Fraud worker ended abnormally");
            }
        }
        info!("LedgerGuard stopped");
    }
}
