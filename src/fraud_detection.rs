//! Fraud detection for LedgerGuard
//! Rule evaluation against a committed transaction and its recent history, plus the
//! background worker that runs scans off the commit path

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    alerts::{AlertSink, FraudAlert},
    config::LedgerConfig,
    errors::Result,
    rules::{FraudRule, RuleCatalog, RuleKind, Severity},
    store::AccountStore,
    utils::{business_day_bounds, business_hour, is_weekend, mask_account},
    Account, Transaction, TransactionType,
};

/// Weight of the normalized signal on top of the severity base score
const SIGNAL_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base: f64,
    /// Normalized exceedance in [0, 1]
    pub signal: f64,
}

impl ScoreBreakdown {
    pub fn score(&self) -> f64 {
        (self.base + SIGNAL_WEIGHT * self.signal).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvidence {
    pub detected_value: Value,
    pub threshold_value: Value,
    pub transaction_amount: Decimal,
    pub transaction_type: TransactionType,
    pub score: ScoreBreakdown,
}

/// A rule hit not yet persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDraft {
    pub transaction_id: Uuid,
    pub account_number: String,
    pub rule_id: u32,
    pub rule_code: String,
    pub severity: Severity,
    pub fraud_score: f64,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub evidence: AlertEvidence,
}

#[derive(Debug)]
struct RuleHit {
    signal: f64,
    detected: Value,
    threshold: Value,
    description: String,
}

/// Pure rule evaluation
#[derive(Debug, Clone)]
pub struct FraudEngine {
    business_offset: FixedOffset,
}

impl FraudEngine {
    pub fn new(config: &LedgerConfig) -> Self {
        Self {
            business_offset: config.business_offset(),
        }
    }

    /// Evaluate every rule independently; each may contribute one draft.
    ///
    /// `history` holds the account's entries over the lookback window and may or may
    /// not contain `transaction` itself. Entries after `transaction.timestamp` are ignored.
    pub fn evaluate(
        &self,
        transaction: &Transaction,
        account: &Account,
        history: &[Transaction],
        rules: &[FraudRule],
    ) -> Vec<AlertDraft> {
        let timeline = timeline_until(transaction, history);
        let detected_at = Utc::now();

        rules
            .iter()
            .filter(|rule| rule.is_active)
            .filter_map(|rule| {
                let hit = self.evaluate_rule(rule, transaction, account, &timeline)?;
                let score = ScoreBreakdown {
                    base: rule.severity.base_score(),
                    signal: hit.signal.clamp(0.0, 1.0),
                };
                Some(AlertDraft {
                    transaction_id: transaction.transaction_id,
                    account_number: transaction.account_number.clone(),
                    rule_id: rule.rule_id,
                    rule_code: rule.code.clone(),
                    severity: rule.severity,
                    fraud_score: score.score(),
                    description: hit.description,
                    detected_at,
                    evidence: AlertEvidence {
                        detected_value: hit.detected,
                        threshold_value: hit.threshold,
                        transaction_amount: transaction.amount,
                        transaction_type: transaction.transaction_type,
                        score,
                    },
                })
            })
            .collect()
    }

    fn evaluate_rule(
        &self,
        rule: &FraudRule,
        tx: &Transaction,
        account: &Account,
        timeline: &[&Transaction],
    ) -> Option<RuleHit> {
        let params = &rule.params;
        match rule.kind {
            RuleKind::HighAmount => {
                let threshold = params.amount_threshold.unwrap_or(Decimal::from(1_000_000));
                (tx.amount >= threshold).then(|| RuleHit {
                    signal: exceedance(tx.amount, threshold),
                    detected: json!(tx.amount),
                    threshold: json!(threshold),
                    description: format!("Amount {} at or above {}", tx.amount, threshold),
                })
            }
            RuleKind::LargeWithdrawal => {
                let threshold = params.amount_threshold.unwrap_or(Decimal::from(500_000));
                (tx.transaction_type.is_debit() && tx.amount >= threshold).then(|| RuleHit {
                    signal: exceedance(tx.amount, threshold),
                    detected: json!(tx.amount),
                    threshold: json!(threshold),
                    description: format!("Debit of {} at or above {}", tx.amount, threshold),
                })
            }
            RuleKind::Velocity => {
                let window = Duration::minutes(params.time_window_minutes.unwrap_or(5));
                let min_count = params.transaction_count.unwrap_or(3).max(1);
                let threshold = params.amount_threshold.unwrap_or(Decimal::from(100_000));

                let in_window = window_ending_at(timeline, tx.timestamp, window);
                let count = in_window.len();
                let total: Decimal = in_window.iter().map(|entry| entry.amount).sum();

                (count >= min_count && total >= threshold).then(|| RuleHit {
                    signal: (count as f64 / min_count as f64 - 1.0)
                        .max(exceedance(total, threshold)),
                    detected: json!({ "count": count, "total": total }),
                    threshold: json!({ "count": min_count, "total": threshold, "window_minutes": window.num_minutes() }),
                    description: format!(
                        "{} transactions totalling {} within {} minutes",
                        count,
                        total,
                        window.num_minutes()
                    ),
                })
            }
            RuleKind::AlternatingPattern => {
                let window = Duration::minutes(params.pattern_window_minutes.unwrap_or(20));
                let [first, second, third] = last_three(timeline)?;
                let span = third.timestamp - first.timestamp;
                let alternates = first.transaction_type != second.transaction_type
                    && second.transaction_type != third.transaction_type;

                (alternates && span <= window).then(|| RuleHit {
                    signal: 1.0 - ratio(span.num_seconds(), window.num_seconds()),
                    detected: json!({
                        "types": [first.transaction_type, second.transaction_type, third.transaction_type],
                        "span_minutes": span.num_minutes(),
                    }),
                    threshold: json!({ "window_minutes": window.num_minutes() }),
                    description: format!(
                        "Alternating {:?}/{:?}/{:?} within {} minutes",
                        first.transaction_type,
                        second.transaction_type,
                        third.transaction_type,
                        span.num_minutes()
                    ),
                })
            }
            RuleKind::UnusualTime => {
                let start = params.business_hours_start.unwrap_or(9);
                let end = params.business_hours_end.unwrap_or(17);
                let hour = business_hour(tx.timestamp, self.business_offset);
                let off_hours = hour < start || hour > end;
                let weekend = params.weekend_check.unwrap_or(true)
                    && is_weekend(tx.timestamp, self.business_offset);

                (off_hours || weekend).then(|| RuleHit {
                    signal: if off_hours { 1.0 } else { 0.5 },
                    detected: json!({ "hour": hour, "weekend": weekend }),
                    threshold: json!({ "start": start, "end": end }),
                    description: if off_hours {
                        format!("Transaction at {:02}:00 outside business hours", hour)
                    } else {
                        "Transaction on a weekend".to_string()
                    },
                })
            }
            RuleKind::NewAccountLarge => {
                let max_age = params.account_age_days.unwrap_or(30);
                let threshold = params.amount_threshold.unwrap_or(Decimal::from(200_000));
                let age_days = (tx.timestamp - account.opening_date).num_days();

                (tx.amount >= threshold && age_days <= max_age).then(|| RuleHit {
                    signal: exceedance(tx.amount, threshold),
                    detected: json!({ "amount": tx.amount, "account_age_days": age_days }),
                    threshold: json!({ "amount": threshold, "account_age_days": max_age }),
                    description: format!(
                        "Amount {} on an account opened {} days ago",
                        tx.amount, age_days
                    ),
                })
            }
            RuleKind::DailyVelocity => {
                let limit = params.daily_limit.unwrap_or(10).max(1);
                let (day_start, _) = business_day_bounds(tx.timestamp, self.business_offset);
                let count = timeline
                    .iter()
                    .filter(|entry| entry.timestamp >= day_start)
                    .count();

                (count >= limit).then(|| RuleHit {
                    signal: count as f64 / limit as f64 - 1.0,
                    detected: json!(count),
                    threshold: json!(limit),
                    description: format!("{} transactions on this account today", count),
                })
            }
            RuleKind::BalanceAnomaly => {
                let overdraft = params.overdraft_limit.unwrap_or(Decimal::from(10_000));
                if !tx.transaction_type.is_debit() {
                    return None;
                }
                let observed = tx.balance_after.min(account.current_balance);

                (observed < -overdraft).then(|| RuleHit {
                    signal: exceedance(-observed, overdraft),
                    detected: json!(observed),
                    threshold: json!(-overdraft),
                    description: format!("Balance {} beyond overdraft limit {}", observed, overdraft),
                })
            }
        }
    }
}

/// Entries at or before `tx`, oldest first, with `tx` itself last
fn timeline_until<'a>(tx: &'a Transaction, history: &'a [Transaction]) -> Vec<&'a Transaction> {
    let mut timeline: Vec<&Transaction> = history
        .iter()
        .filter(|entry| {
            entry.transaction_id != tx.transaction_id
                && entry.account_number == tx.account_number
                && entry.timestamp <= tx.timestamp
        })
        .collect();
    timeline.sort_by_key(|entry| entry.timestamp);
    timeline.push(tx);
    timeline
}

/// Entries in `[end - window, end]` of an ordered timeline
fn window_ending_at<'a>(
    timeline: &[&'a Transaction],
    end: DateTime<Utc>,
    window: Duration,
) -> Vec<&'a Transaction> {
    let start = end - window;
    let right = timeline.partition_point(|entry| entry.timestamp <= end);
    let left = timeline[..right].partition_point(|entry| entry.timestamp < start);
    timeline[left..right].to_vec()
}

fn last_three<'a>(timeline: &[&'a Transaction]) -> Option<[&'a Transaction; 3]> {
    match timeline {
        [.., a, b, c] => Some([*a, *b, *c]),
        _ => None,
    }
}

fn exceedance(value: Decimal, threshold: Decimal) -> f64 {
    if threshold <= Decimal::ZERO {
        return 1.0;
    }
    ((value - threshold) / threshold)
        .to_f64()
        .unwrap_or(0.0)
        .clamp(0.0, 1.0)
}

fn ratio(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        return 1.0;
    }
    (part as f64 / whole as f64).clamp(0.0, 1.0)
}

/// Scan pipeline counters
#[derive(Debug, Default)]
pub struct ScanStatistics {
    pub scans_completed: AtomicU64,
    pub scans_failed: AtomicU64,
    pub scans_dropped: AtomicU64,
    pub alerts_raised: AtomicU64,
}

impl ScanStatistics {
    pub fn get_statistics(&self) -> HashMap<String, f64> {
        let mut stats = HashMap::new();
        let completed = self.scans_completed.load(Ordering::Relaxed);
        let alerts = self.alerts_raised.load(Ordering::Relaxed);

        stats.insert("scans_completed".to_string(), completed as f64);
        stats.insert(
            "scans_failed".to_string(),
            self.scans_failed.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "scans_dropped".to_string(),
            self.scans_dropped.load(Ordering::Relaxed) as f64,
        );
        stats.insert("alerts_raised".to_string(), alerts as f64);
        if completed > 0 {
            stats.insert("alerts_per_scan".to_string(), alerts as f64 / completed as f64);
        }
        stats
    }
}

/// Loads rules and history, evaluates, records alerts
pub struct FraudScanner {
    store: Arc<dyn AccountStore>,
    rules: Arc<dyn RuleCatalog>,
    alerts: Arc<AlertSink>,
    engine: FraudEngine,
    history_window: Duration,
    statistics: Arc<ScanStatistics>,
}

impl FraudScanner {
    pub fn new(
        config: &LedgerConfig,
        store: Arc<dyn AccountStore>,
        rules: Arc<dyn RuleCatalog>,
        alerts: Arc<AlertSink>,
    ) -> Self {
        Self {
            store,
            rules,
            alerts,
            engine: FraudEngine::new(config),
            history_window: Duration::days(i64::from(config.history_window_days)),
            statistics: Arc::new(ScanStatistics::default()),
        }
    }

    pub fn statistics(&self) -> Arc<ScanStatistics> {
        self.statistics.clone()
    }

    /// Scan one committed transaction; returns newly created alerts
    pub fn scan(&self, transaction: &Transaction) -> Result<Vec<FraudAlert>> {
        let result = self.try_scan(transaction);
        match &result {
            Ok(created) => {
                self.statistics.scans_completed.fetch_add(1, Ordering::Relaxed);
                self.statistics
                    .alerts_raised
                    .fetch_add(created.len() as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.statistics.scans_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn try_scan(&self, transaction: &Transaction) -> Result<Vec<FraudAlert>> {
        let rules = self.rules.active_rules()?;
        let account = self.store.get_account(&transaction.account_number)?;
        let history = self.store.history(
            &transaction.account_number,
            transaction.timestamp - self.history_window,
        )?;

        let drafts = self.engine.evaluate(transaction, &account, &history, &rules);
        debug!(
            transaction_id = %transaction.transaction_id,
            account = %mask_account(&transaction.account_number),
            rules = rules.len(),
            hits = drafts.len(),
            "Fraud scan evaluated"
        );
        self.alerts.record(drafts)
    }
}

#[derive(Debug)]
pub enum ScanJob {
    Scan(Transaction),
    /// Acknowledged once every job queued before it has been handled
    Flush(oneshot::Sender<()>),
}

/// Producer side of the scan queue
#[derive(Debug, Clone)]
pub struct ScanQueue {
    sender: mpsc::Sender<ScanJob>,
    statistics: Arc<ScanStatistics>,
}

impl ScanQueue {
    /// Enqueue without waiting; a full or closed queue drops the job
    pub fn enqueue(&self, transaction: Transaction) -> bool {
        let transaction_id = transaction.transaction_id;
        match self.sender.try_send(ScanJob::Scan(transaction)) {
            Ok(()) => true,
            Err(e) => {
                self.statistics.scans_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    transaction_id = %transaction_id,
                    error = %e,
                    "Fraud scan dropped"
                );
                false
            }
        }
    }

    /// Wait until every previously enqueued scan has run
    pub async fn flush(&self) -> bool {
        let (ack, done) = oneshot::channel();
        if self.sender.send(ScanJob::Flush(ack)).await.is_err() {
            return false;
        }
        done.await.is_ok()
    }
}

/// Background consumer of the scan queue
pub struct FraudWorker {
    receiver: mpsc::Receiver<ScanJob>,
    scanner: Arc<FraudScanner>,
}

impl FraudWorker {
    pub fn new(scanner: Arc<FraudScanner>, capacity: usize) -> (ScanQueue, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        let queue = ScanQueue {
            sender,
            statistics: scanner.statistics(),
        };
        (queue, Self { receiver, scanner })
    }

    /// Runs until every queue handle is dropped
    pub async fn run(mut self) {
        info!("Fraud worker started");
        while let Some(job) = self.receiver.recv().await {
            match job {
                ScanJob::Scan(transaction) => {
                    if let Err(e) = self.scanner.scan(&transaction) {
                        error!(
                            transaction_id = %transaction.transaction_id,
                            error = %e,
                            "Fraud scan failed"
                        );
                    }
                }
                ScanJob::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        info!("Fraud worker stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
