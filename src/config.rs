//! Configuration module for the LedgerGuard core
//! Defaults mirror the branch-banking deployment: LKR amounts, Colombo business hours

use std::path::Path;

use chrono::Offset;
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::errors::{LedgerError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Amounts strictly above this need OTP verification
    pub otp_threshold: Decimal,
    pub otp_ttl_minutes: u32,
    pub otp_max_attempts: u32,

    /// Amounts strictly above this trigger a large-transaction notice
    pub large_transaction_threshold: Decimal,

    /// Bounded compare-and-swap retries before surfacing a ledger conflict
    pub max_commit_attempts: u32,

    /// History window handed to the fraud engine
    pub history_window_days: u32,

    /// Fraud pipeline sizing
    pub rule_cache_ttl_seconds: u64,
    pub scan_queue_capacity: usize,
    pub alert_channel_capacity: usize,
    pub stats_interval_seconds: u64,

    /// Offset of branch local time from UTC, used for business hours and calendar days
    pub business_utc_offset_minutes: i32,

    /// Key for receipt confirmation codes
    pub receipt_secret: String,
    pub local_currency: String,

    pub role_limits: RoleLimitTable,
    pub logging: LoggingConfig,
}

/// Per-role monetary ceilings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleLimits {
    pub single_transaction: Decimal,
    /// Amounts above this are committed but flagged for manager review
    pub requires_approval: Decimal,
    pub daily_limit: Decimal,
}

/// Roles missing from this table may not transact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleLimitTable {
    pub agent: Option<RoleLimits>,
    pub manager: Option<RoleLimits>,
    pub admin: Option<RoleLimits>,
}

impl RoleLimitTable {
    pub fn limits_for(&self, role: Role) -> Option<&RoleLimits> {
        match role {
            Role::Agent => self.agent.as_ref(),
            Role::Manager => self.manager.as_ref(),
            Role::Admin => self.admin.as_ref(),
        }
    }
}

impl Default for RoleLimitTable {
    fn default() -> Self {
        Self {
            agent: Some(RoleLimits {
                single_transaction: Decimal::from(10_000),
                requires_approval: Decimal::from(5_000),
                daily_limit: Decimal::from(50_000),
            }),
            manager: Some(RoleLimits {
                single_transaction: Decimal::from(500_000),
                requires_approval: Decimal::from(100_000),
                daily_limit: Decimal::from(1_000_000),
            }),
            admin: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    /// pretty or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            otp_threshold: Decimal::from(5_000),
            otp_ttl_minutes: 5,
            otp_max_attempts: 3,
            large_transaction_threshold: Decimal::from(50_000),
            max_commit_attempts: 5,
            history_window_days: 7,
            rule_cache_ttl_seconds: 300,
            scan_queue_capacity: 1024,
            alert_channel_capacity: 256,
            stats_interval_seconds: 5,
            business_utc_offset_minutes: 330, // Asia/Colombo
            receipt_secret: "change-me".to_string(),
            local_currency: "LKR".to_string(),
            role_limits: RoleLimitTable::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Load from a TOML file, then apply `LEDGERGUARD__*` environment overrides
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("LEDGERGUARD").separator("__"))
            .build()
            .map_err(|e| LedgerError::ConfigError {
                message: format!("Failed to build configuration: {}", e),
            })?;

        let config: LedgerConfig =
            settings
                .try_deserialize()
                .map_err(|e| LedgerError::ConfigError {
                    message: format!("Failed to deserialize configuration: {}", e),
                })?;

        config
            .validate()
            .map_err(|message| LedgerError::ConfigError { message })?;
        Ok(config)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.otp_threshold <= Decimal::ZERO {
            return Err("OTP threshold must be positive".to_string());
        }

        if self.large_transaction_threshold <= Decimal::ZERO {
            return Err("Large transaction threshold must be positive".to_string());
        }

        if self.max_commit_attempts == 0 {
            return Err("At least one commit attempt is required".to_string());
        }

        if self.scan_queue_capacity == 0 || self.alert_channel_capacity == 0 {
            return Err("Queue and channel capacities must be greater than 0".to_string());
        }

        if self.otp_ttl_minutes == 0 || self.otp_max_attempts == 0 {
            return Err("OTP TTL and max attempts must be greater than 0".to_string());
        }

        if self.business_utc_offset_minutes.abs() >= 24 * 60 {
            return Err("Business UTC offset must be less than 24 hours".to_string());
        }

        for role in [Role::Agent, Role::Manager, Role::Admin] {
            if let Some(limits) = self.role_limits.limits_for(role) {
                if limits.requires_approval > limits.single_transaction {
                    return Err(format!(
                        "{} approval threshold must not exceed the single transaction limit",
                        role
                    ));
                }
                if limits.single_transaction > limits.daily_limit {
                    return Err(format!(
                        "{} daily limit must be at least the single transaction limit",
                        role
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn business_offset(&self) -> chrono::FixedOffset {
        chrono::FixedOffset::east_opt(self.business_utc_offset_minutes * 60)
            .unwrap_or_else(|| chrono::Utc.fix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.otp_threshold, Decimal::from(5_000));
        assert!(config.role_limits.limits_for(Role::Admin).is_none());
    }

    #[test]
    fn test_invalid_role_limits() {
        let mut config = LedgerConfig::default();
        if let Some(agent) = config.role_limits.agent.as_mut() {
            agent.requires_approval = Decimal::from(20_000);
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_commit_attempts_rejected() {
        let mut config = LedgerConfig::default();
        config.max_commit_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let path = std::env::temp_dir().join(format!("ledgerguard-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "otp_threshold = 7500").unwrap();
        writeln!(file, "max_commit_attempts = 8").unwrap();
        writeln!(file, "[logging]").unwrap();
        writeln!(file, "level = \"debug\"").unwrap();
        writeln!(file, "format = \"json\"").unwrap();
        drop(file);

        let config = LedgerConfig::load_from_path(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.otp_threshold, Decimal::from(7_500));
        assert_eq!(config.max_commit_attempts, 8);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.history_window_days, 7);
    }
}
