//! Fraud rule catalog
//! Rules are data: a kind selects the evaluator, the parameter bag tunes it

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::TtlCache;
use crate::errors::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Score floor for an alert of this severity
    pub fn base_score(&self) -> f64 {
        match self {
            Severity::Low => 0.4,
            Severity::Medium => 0.6,
            Severity::High => 0.8,
            Severity::Critical => 0.9,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    HighAmount,
    LargeWithdrawal,
    UnusualTime,
    Velocity,
    DailyVelocity,
    AlternatingPattern,
    NewAccountLarge,
    BalanceAnomaly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Transaction,
    Pattern,
    Account,
}

/// Tunables; a rule reads only the keys its kind understands
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleParams {
    pub amount_threshold: Option<Decimal>,
    pub time_window_minutes: Option<i64>,
    pub transaction_count: Option<usize>,
    pub business_hours_start: Option<u32>,
    pub business_hours_end: Option<u32>,
    pub weekend_check: Option<bool>,
    pub account_age_days: Option<i64>,
    pub daily_limit: Option<usize>,
    pub overdraft_limit: Option<Decimal>,
    pub pattern_window_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudRule {
    pub rule_id: u32,
    /// Stable machine name, e.g. `HIGH_VELOCITY`
    pub code: String,
    pub name: String,
    pub description: String,
    pub kind: RuleKind,
    pub category: RuleCategory,
    pub severity: Severity,
    pub params: RuleParams,
    pub is_active: bool,
}

impl FraudRule {
    pub fn new(
        rule_id: u32,
        code: &str,
        name: &str,
        kind: RuleKind,
        category: RuleCategory,
        severity: Severity,
        params: RuleParams,
    ) -> Self {
        Self {
            rule_id,
            code: code.to_string(),
            name: name.to_string(),
            description: String::new(),
            kind,
            category,
            severity,
            params,
            is_active: true,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// The production rule set
pub fn default_rules() -> Vec<FraudRule> {
    vec![
        FraudRule::new(
            1,
            "HIGH_AMOUNT",
            "High Amount Transaction",
            RuleKind::HighAmount,
            RuleCategory::Transaction,
            Severity::High,
            RuleParams {
                amount_threshold: Some(Decimal::from(1_000_000)),
                ..Default::default()
            },
        )
        .with_description("Single transaction at or above the amount threshold"),
        FraudRule::new(
            2,
            "HIGH_VELOCITY",
            "Rapid Successive Transactions",
            RuleKind::Velocity,
            RuleCategory::Pattern,
            Severity::Medium,
            RuleParams {
                amount_threshold: Some(Decimal::from(100_000)),
                transaction_count: Some(3),
                time_window_minutes: Some(5),
                ..Default::default()
            },
        )
        .with_description("Many transactions with a large combined value in a short window"),
        FraudRule::new(
            3,
            "UNUSUAL_TIME",
            "Unusual Time Transaction",
            RuleKind::UnusualTime,
            RuleCategory::Transaction,
            Severity::Low,
            RuleParams {
                business_hours_start: Some(9),
                business_hours_end: Some(17),
                weekend_check: Some(true),
                ..Default::default()
            },
        )
        .with_description("Transaction outside branch business hours or on a weekend"),
        FraudRule::new(
            4,
            "LARGE_WITHDRAWAL",
            "Large Withdrawal",
            RuleKind::LargeWithdrawal,
            RuleCategory::Transaction,
            Severity::High,
            RuleParams {
                amount_threshold: Some(Decimal::from(500_000)),
                ..Default::default()
            },
        )
        .with_description("Debit at or above the withdrawal threshold"),
        FraudRule::new(
            5,
            "NEW_ACCOUNT_LARGE",
            "New Account Large Transaction",
            RuleKind::NewAccountLarge,
            RuleCategory::Account,
            Severity::Medium,
            RuleParams {
                account_age_days: Some(30),
                amount_threshold: Some(Decimal::from(200_000)),
                ..Default::default()
            },
        )
        .with_description("Large transaction on a recently opened account"),
        FraudRule::new(
            6,
            "DAILY_VELOCITY",
            "Daily Transaction Count",
            RuleKind::DailyVelocity,
            RuleCategory::Pattern,
            Severity::Medium,
            RuleParams {
                daily_limit: Some(10),
                ..Default::default()
            },
        )
        .with_description("Too many transactions on one account in a business day"),
        FraudRule::new(
            7,
            "BALANCE_ANOMALY",
            "Balance Anomaly",
            RuleKind::BalanceAnomaly,
            RuleCategory::Account,
            Severity::High,
            RuleParams {
                overdraft_limit: Some(Decimal::from(10_000)),
                ..Default::default()
            },
        )
        .with_description("Balance below the tolerated overdraft after a debit"),
        FraudRule::new(
            8,
            "ALTERNATING_PATTERN",
            "Deposit/Withdrawal Alternation",
            RuleKind::AlternatingPattern,
            RuleCategory::Pattern,
            Severity::Medium,
            RuleParams {
                pattern_window_minutes: Some(20),
                ..Default::default()
            },
        )
        .with_description("Three strictly alternating transactions in a short window"),
    ]
}

pub trait RuleCatalog: Send + Sync {
    fn active_rules(&self) -> Result<Vec<FraudRule>>;

    fn all_rules(&self) -> Result<Vec<FraudRule>>;

    fn set_rule_active(&self, rule_id: u32, is_active: bool) -> Result<FraudRule>;
}

#[derive(Debug, Default)]
pub struct InMemoryRuleCatalog {
    rules: RwLock<BTreeMap<u32, FraudRule>>,
}

impl InMemoryRuleCatalog {
    pub fn new(rules: Vec<FraudRule>) -> Self {
        Self {
            rules: RwLock::new(rules.into_iter().map(|rule| (rule.rule_id, rule)).collect()),
        }
    }

    pub fn with_default_rules() -> Self {
        Self::new(default_rules())
    }

    fn snapshot(&self, active_only: bool) -> Result<Vec<FraudRule>> {
        let rules = self.rules.read().map_err(|_| LedgerError::StorageError {
            message: "rule catalog lock poisoned".to_string(),
        })?;
        Ok(rules
            .values()
            .filter(|rule| !active_only || rule.is_active)
            .cloned()
            .collect())
    }
}

impl RuleCatalog for InMemoryRuleCatalog {
    fn active_rules(&self) -> Result<Vec<FraudRule>> {
        self.snapshot(true)
    }

    fn all_rules(&self) -> Result<Vec<FraudRule>> {
        self.snapshot(false)
    }

    fn set_rule_active(&self, rule_id: u32, is_active: bool) -> Result<FraudRule> {
        let mut rules = self.rules.write().map_err(|_| LedgerError::StorageError {
            message: "rule catalog lock poisoned".to_string(),
        })?;
        let rule = rules
            .get_mut(&rule_id)
            .ok_or(LedgerError::RuleNotFound { rule_id })?;
        rule.is_active = is_active;
        Ok(rule.clone())
    }
}

const ACTIVE_RULES_KEY: &str = "rules:active";
const ALL_RULES_KEY: &str = "rules:all";

/// Read-through TTL cache over another catalog
pub struct CachedRuleCatalog {
    inner: Arc<dyn RuleCatalog>,
    cache: TtlCache<Vec<FraudRule>>,
}

impl CachedRuleCatalog {
    pub fn new(inner: Arc<dyn RuleCatalog>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: TtlCache::new(ttl),
        }
    }

    pub fn invalidate(&self) {
        self.cache.invalidate_matching("rules:");
    }

    fn cached(
        &self,
        key: &str,
        load: impl FnOnce(&dyn RuleCatalog) -> Result<Vec<FraudRule>>,
    ) -> Result<Vec<FraudRule>> {
        if let Some(rules) = self.cache.get(key) {
            return Ok(rules);
        }
        let rules = load(self.inner.as_ref())?;
        self.cache.insert(key, rules.clone());
        Ok(rules)
    }
}

impl RuleCatalog for CachedRuleCatalog {
    fn active_rules(&self) -> Result<Vec<FraudRule>> {
        self.cached(ACTIVE_RULES_KEY, |catalog| catalog.active_rules())
    }

    fn all_rules(&self) -> Result<Vec<FraudRule>> {
        self.cached(ALL_RULES_KEY, |catalog| catalog.all_rules())
    }

    fn set_rule_active(&self, rule_id: u32, is_active: bool) -> Result<FraudRule> {
        let rule = self.inner.set_rule_active(rule_id, is_active)?;
        self.invalidate();
        info!(rule_id, code = %rule.code, is_active, "Fraud rule toggled");
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_unique_codes() {
        let rules = default_rules();
        let mut codes: Vec<&str> = rules.iter().map(|rule| rule.code.as_str()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), rules.len());
        assert!(rules.iter().all(|rule| rule.is_active));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert_eq!(Severity::Low.base_score(), 0.4);
    }

    #[test]
    fn test_set_rule_active_unknown_rule() {
        let catalog = InMemoryRuleCatalog::with_default_rules();
        assert!(matches!(
            catalog.set_rule_active(99, false),
            Err(LedgerError::RuleNotFound { rule_id: 99 })
        ));
    }

    #[test]
    fn test_cached_catalog_invalidated_on_toggle() {
        let inner = Arc::new(InMemoryRuleCatalog::with_default_rules());
        let cached = CachedRuleCatalog::new(inner.clone(), Duration::from_secs(300));

        assert_eq!(cached.active_rules().unwrap().len(), 8);

        // Writes behind the cache's back stay invisible until the TTL lapses
        inner.set_rule_active(3, false).unwrap();
        assert_eq!(cached.active_rules().unwrap().len(), 8);

        cached.set_rule_active(4, false).unwrap();
        let active = cached.active_rules().unwrap();
        assert_eq!(active.len(), 6);
        assert!(active.iter().all(|rule| rule.rule_id != 3 && rule.rule_id != 4));
    }

    #[test]
    fn test_params_deserialize_from_json_bag() {
        let params: RuleParams =
            serde_json::from_str(r#"{"transaction_count": 3, "time_window_minutes": 10}"#).unwrap();
        assert_eq!(params.transaction_count, Some(3));
        assert!(params.amount_threshold.is_none());
    }
}
