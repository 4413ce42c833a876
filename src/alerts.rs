//! Alert sink: idempotent persistence, live dashboard feed, reviewer workflow

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::LedgerConfig,
    errors::{LedgerError, Result},
    fraud_detection::{AlertDraft, AlertEvidence},
    rules::Severity,
    utils::{business_day_bounds, mask_account},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Investigating,
    Resolved,
    FalsePositive,
}

impl AlertStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::FalsePositive)
    }

    fn can_move_to(&self, next: AlertStatus) -> bool {
        match self {
            AlertStatus::Pending => next != AlertStatus::Pending,
            AlertStatus::Investigating => next.is_closed(),
            AlertStatus::Resolved | AlertStatus::FalsePositive => false,
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertStatus::Pending => write!(f, "pending"),
            AlertStatus::Investigating => write!(f, "investigating"),
            AlertStatus::Resolved => write!(f, "resolved"),
            AlertStatus::FalsePositive => write!(f, "false_positive"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudAlert {
    pub alert_id: Uuid,
    pub transaction_id: Uuid,
    pub account_number: String,
    pub rule_id: u32,
    pub rule_code: String,
    pub severity: Severity,
    pub fraud_score: f64,
    pub status: AlertStatus,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub evidence: AlertEvidence,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
}

impl FraudAlert {
    fn from_draft(draft: AlertDraft) -> Self {
        Self {
            alert_id: Uuid::new_v4(),
            transaction_id: draft.transaction_id,
            account_number: draft.account_number,
            rule_id: draft.rule_id,
            rule_code: draft.rule_code,
            severity: draft.severity,
            fraud_score: draft.fraud_score,
            status: AlertStatus::Pending,
            description: draft.description,
            detected_at: draft.detected_at,
            evidence: draft.evidence,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        }
    }
}

/// Dashboard counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStats {
    pub total: u64,
    pub pending: u64,
    pub investigating: u64,
    pub resolved: u64,
    pub false_positive: u64,
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    /// Alerts detected on the current business day
    pub today: u64,
    pub average_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    AlertCreated { alert: FraudAlert },
    StatsSnapshot { stats: AlertStats },
}

/// Stats as of subscription time plus the live feed from that point on
#[derive(Debug)]
pub struct DashboardSubscription {
    pub snapshot: AlertStats,
    pub events: broadcast::Receiver<DashboardEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    pub status: Option<AlertStatus>,
    pub severity: Option<Severity>,
    pub account_number: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl AlertQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: AlertStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn for_account(mut self, account_number: &str) -> Self {
        self.account_number = Some(account_number.trim().to_string());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    fn matches(&self, alert: &FraudAlert) -> bool {
        self.status.map_or(true, |status| alert.status == status)
            && self.severity.map_or(true, |severity| alert.severity == severity)
            && self
                .account_number
                .as_deref()
                .map_or(true, |number| alert.account_number == number)
            && self.since.map_or(true, |since| alert.detected_at >= since)
    }
}

#[derive(Debug, Default)]
struct AlertBook {
    alerts: Vec<FraudAlert>,
    by_id: HashMap<Uuid, usize>,
    by_rule_hit: HashMap<(Uuid, u32), usize>, // (transaction_id, rule_id)
}

pub struct AlertSink {
    book: RwLock<AlertBook>,
    events: broadcast::Sender<DashboardEvent>,
    business_offset: FixedOffset,
}

impl AlertSink {
    pub fn new(config: &LedgerConfig) -> Self {
        let (events, _) = broadcast::channel(config.alert_channel_capacity);
        Self {
            book: RwLock::new(AlertBook::default()),
            events,
            business_offset: config.business_offset(),
        }
    }

    /// Persist drafts, skipping (transaction, rule) pairs already recorded.
    /// Returns only the newly created alerts.
    pub fn record(&self, drafts: Vec<AlertDraft>) -> Result<Vec<FraudAlert>> {
        let mut created = Vec::new();
        {
            let mut book = self.write()?;
            for draft in drafts {
                let key = (draft.transaction_id, draft.rule_id);
                if book.by_rule_hit.contains_key(&key) {
                    debug!(
                        transaction_id = %draft.transaction_id,
                        rule = %draft.rule_code,
                        "Alert already recorded"
                    );
                    continue;
                }

                let alert = FraudAlert::from_draft(draft);
                let index = book.alerts.len();
                book.by_rule_hit.insert(key, index);
                book.by_id.insert(alert.alert_id, index);
                book.alerts.push(alert.clone());
                created.push(alert);
            }
        }

        for alert in &created {
            info!(
                alert_id = %alert.alert_id,
                transaction_id = %alert.transaction_id,
                account = %mask_account(&alert.account_number),
                rule = %alert.rule_code,
                severity = %alert.severity,
                score = alert.fraud_score,
                "Fraud alert raised"
            );
            if alert.severity >= Severity::High {
                // No subscribers is fine; the feed is best effort
                let _ = self.events.send(DashboardEvent::AlertCreated {
                    alert: alert.clone(),
                });
            }
        }

        Ok(created)
    }

    pub fn subscribe(&self) -> Result<DashboardSubscription> {
        let events = self.events.subscribe();
        Ok(DashboardSubscription {
            snapshot: self.stats()?,
            events,
        })
    }

    pub fn stats(&self) -> Result<AlertStats> {
        let book = self.read()?;
        let (day_start, day_end) = business_day_bounds(Utc::now(), self.business_offset);

        let mut stats = AlertStats::default();
        let mut score_sum = 0.0;
        for alert in &book.alerts {
            stats.total += 1;
            score_sum += alert.fraud_score;
            match alert.status {
                AlertStatus::Pending => stats.pending += 1,
                AlertStatus::Investigating => stats.investigating += 1,
                AlertStatus::Resolved => stats.resolved += 1,
                AlertStatus::FalsePositive => stats.false_positive += 1,
            }
            match alert.severity {
                Severity::Critical => stats.critical += 1,
                Severity::High => stats.high += 1,
                Severity::Medium => stats.medium += 1,
                Severity::Low => stats.low += 1,
            }
            if alert.detected_at >= day_start && alert.detected_at < day_end {
                stats.today += 1;
            }
        }
        if stats.total > 0 {
            stats.average_score = score_sum / stats.total as f64;
        }
        Ok(stats)
    }

    /// Push a stats snapshot to current subscribers
    pub fn publish_stats(&self) -> Result<()> {
        let stats = self.stats()?;
        let _ = self.events.send(DashboardEvent::StatsSnapshot { stats });
        Ok(())
    }

    /// Publish a stats snapshot every `period` until the handle is aborted
    pub fn spawn_stats_ticker(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.publish_stats() {
                    warn!(error = %e, "Failed to publish alert stats");
                }
            }
        })
    }

    /// Reviewer action on an alert
    pub fn resolve(
        &self,
        alert_id: Uuid,
        status: AlertStatus,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<FraudAlert> {
        let mut book = self.write()?;
        let index = *book
            .by_id
            .get(&alert_id)
            .ok_or(LedgerError::AlertNotFound { alert_id })?;
        let alert = &mut book.alerts[index];

        if !alert.status.can_move_to(status) {
            return Err(LedgerError::InvalidAlertTransition {
                alert_id,
                from: alert.status.to_string(),
                to: status.to_string(),
            });
        }

        alert.status = status;
        alert.resolved_by = Some(reviewer.to_string());
        if notes.is_some() {
            alert.resolution_notes = notes;
        }
        if status.is_closed() {
            alert.resolved_at = Some(Utc::now());
        }

        info!(
            alert_id = %alert_id,
            status = %status,
            reviewer,
            "Fraud alert updated"
        );
        Ok(alert.clone())
    }

    /// Filtered listing, newest first
    pub fn list(&self, query: &AlertQuery) -> Result<Vec<FraudAlert>> {
        let book = self.read()?;
        let mut matched: Vec<&FraudAlert> =
            book.alerts.iter().filter(|alert| query.matches(alert)).collect();
        matched.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));

        Ok(matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    pub fn for_transaction(&self, transaction_id: Uuid) -> Result<Vec<FraudAlert>> {
        let book = self.read()?;
        Ok(book
            .alerts
            .iter()
            .filter(|alert| alert.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, AlertBook>> {
        self.book.read().map_err(|_| LedgerError::StorageError {
            message: "alert book lock poisoned".to_string(),
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, AlertBook>> {
        self.book.write().map_err(|_| LedgerError::StorageError {
            message: "alert book lock poisoned".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fraud_detection::ScoreBreakdown;
    use crate::TransactionType;
    use rust_decimal::Decimal;

    fn draft(transaction_id: Uuid, rule_id: u32, severity: Severity) -> AlertDraft {
        AlertDraft {
            transaction_id,
            account_number: "ACC001".to_string(),
            rule_id,
            rule_code: format!("RULE_{}", rule_id),
            severity,
            fraud_score: severity.base_score(),
            description: "test".to_string(),
            detected_at: Utc::now(),
            evidence: AlertEvidence {
                detected_value: serde_json::json!(1),
                threshold_value: serde_json::json!(1),
                transaction_amount: Decimal::from(100),
                transaction_type: TransactionType::Deposit,
                score: ScoreBreakdown {
                    base: severity.base_score(),
                    signal: 0.0,
                },
            },
        }
    }

    #[tokio::test]
    async fn test_record_is_idempotent_and_broadcasts_once() {
        let sink = AlertSink::new(&LedgerConfig::default());
        let mut subscription = sink.subscribe().unwrap();
        assert_eq!(subscription.snapshot.total, 0);

        let tx = Uuid::new_v4();
        let created = sink.record(vec![draft(tx, 1, Severity::High)]).unwrap();
        assert_eq!(created.len(), 1);
        let created = sink
            .record(vec![draft(tx, 1, Severity::High), draft(tx, 3, Severity::Low)])
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].rule_id, 3);

        match subscription.events.recv().await.unwrap() {
            DashboardEvent::AlertCreated { alert } => assert_eq!(alert.rule_id, 1),
            other => panic!("unexpected event {:?}", other),
        }
        // The low-severity alert is not pushed to the dashboard
        assert!(subscription.events.try_recv().is_err());
        assert_eq!(sink.for_transaction(tx).unwrap().len(), 2);
    }

    #[test]
    fn test_stats_counts() {
        let sink = AlertSink::new(&LedgerConfig::default());
        let tx = Uuid::new_v4();
        sink.record(vec![
            draft(tx, 1, Severity::Critical),
            draft(tx, 2, Severity::Medium),
        ])
        .unwrap();

        let stats = sink.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.critical, 1);
        assert_eq!(stats.today, 2);
        assert!((stats.average_score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_resolve_workflow() {
        let sink = AlertSink::new(&LedgerConfig::default());
        let alert = sink
            .record(vec![draft(Uuid::new_v4(), 1, Severity::High)])
            .unwrap()
            .remove(0);

        let alert = sink
            .resolve(alert.alert_id, AlertStatus::Investigating, "MGR001", None)
            .unwrap();
        assert!(alert.resolved_at.is_none());

        let alert = sink
            .resolve(
                alert.alert_id,
                AlertStatus::FalsePositive,
                "MGR001",
                Some("customer confirmed".to_string()),
            )
            .unwrap();
        assert!(alert.resolved_at.is_some());
        assert_eq!(alert.resolution_notes.as_deref(), Some("customer confirmed"));

        assert!(matches!(
            sink.resolve(alert.alert_id, AlertStatus::Investigating, "MGR001", None),
            Err(LedgerError::InvalidAlertTransition { .. })
        ));
        assert!(matches!(
            sink.resolve(Uuid::new_v4(), AlertStatus::Resolved, "MGR001", None),
            Err(LedgerError::AlertNotFound { .. })
        ));
    }

    #[test]
    fn test_list_filters_and_pages() {
        let sink = AlertSink::new(&LedgerConfig::default());
        for rule_id in 1..=5 {
            let severity = if rule_id % 2 == 0 { Severity::High } else { Severity::Low };
            sink.record(vec![draft(Uuid::new_v4(), rule_id, severity)]).unwrap();
        }

        assert_eq!(sink.list(&AlertQuery::new().with_severity(Severity::High)).unwrap().len(), 2);
        assert_eq!(sink.list(&AlertQuery::new().page(2, 4)).unwrap().len(), 1);
        assert_eq!(
            sink.list(&AlertQuery::new().with_status(AlertStatus::Resolved))
                .unwrap()
                .len(),
            0
        );
    }

    #[test]
    fn test_dashboard_event_json_shape() {
        let event = DashboardEvent::StatsSnapshot {
            stats: AlertStats::default(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stats_snapshot");
        assert_eq!(json["stats"]["total"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_ticker_publishes_snapshots() {
        let sink = Arc::new(AlertSink::new(&LedgerConfig::default()));
        sink.record(vec![draft(Uuid::new_v4(), 1, Severity::Low)]).unwrap();
        let mut subscription = sink.subscribe().unwrap();

        let ticker = sink.clone().spawn_stats_ticker(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(6)).await;

        let stats = loop {
            match subscription.events.recv().await.unwrap() {
                DashboardEvent::StatsSnapshot { stats } => break stats,
                _ => continue,
            }
        };
        assert_eq!(stats.total, 1);
        assert_eq!(stats.low, 1);
        ticker.abort();
    }
}
