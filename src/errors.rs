//! Error handling for the LedgerGuard core

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::auth::Role;

/// Which role ceiling a rejected amount ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    SingleTransaction,
    Daily,
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitScope::SingleTransaction => write!(f, "single transaction"),
            LimitScope::Daily => write!(f, "daily"),
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Transaction amount must be positive: {amount}")]
    InvalidAmount { amount: Decimal },

    #[error("Account not found: {account_number}")]
    AccountNotFound { account_number: String },

    #[error("Account is inactive: {account_number}")]
    AccountInactive { account_number: String },

    #[error("Access denied for {actor_id}: {reason}")]
    AccessDenied { actor_id: String, reason: String },

    #[error("Insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: Decimal, required: Decimal },

    #[error("Minimum balance violation: balance after {balance_after}, minimum {minimum}")]
    MinimumBalanceViolation { balance_after: Decimal, minimum: Decimal },

    #[error("OTP verification required for amounts over {threshold}")]
    OtpRequired { threshold: Decimal },

    #[error("{scope} limit exceeded for {role}: {amount} > {limit}")]
    LimitExceeded {
        role: Role,
        scope: LimitScope,
        amount: Decimal,
        limit: Decimal,
    },

    #[error("Ledger conflict on {account_number} after {attempts} attempts")]
    LedgerConflict { account_number: String, attempts: u32 },

    #[error("Transaction not found: {transaction_id}")]
    TransactionNotFound { transaction_id: Uuid },

    #[error("Fraud alert not found: {alert_id}")]
    AlertNotFound { alert_id: Uuid },

    #[error("Alert {alert_id} cannot move from {from} to {to}")]
    InvalidAlertTransition {
        alert_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Fraud rule not found: {rule_id}")]
    RuleNotFound { rule_id: u32 },

    #[error("OTP not required for amounts up to {threshold}")]
    OtpNotRequired { threshold: Decimal },

    #[error("OTP verification failed: {message}")]
    OtpInvalid { message: String },

    #[error("Storage error: {message}")]
    StorageError { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Encryption/Decryption error: {message}")]
    CryptographyError { message: String },

    #[error("Invalid lookback window: {hours} hours")]
    InvalidWindow { hours: i64 },
}

impl LedgerError {
    /// Convert error to a message the transacting party can act on
    pub fn to_user_message(&self) -> String {
        match self {
            LedgerError::InvalidAmount { .. } => {
                "Amount must be greater than zero.".to_string()
            }
            LedgerError::AccountNotFound { .. } => {
                "Account not found. Please check the account number.".to_string()
            }
            LedgerError::AccountInactive { .. } => {
                "This account is inactive. Please contact the branch.".to_string()
            }
            LedgerError::AccessDenied { .. } => {
                "You can only create transactions for customers assigned to you.".to_string()
            }
            LedgerError::InsufficientFunds { balance, .. } => {
                format!("Insufficient funds. Available balance: {:.2}", balance)
            }
            LedgerError::MinimumBalanceViolation { minimum, .. } => {
                format!("Withdrawal would violate the minimum balance of {:.2}", minimum)
            }
            LedgerError::OtpRequired { threshold } => {
                format!("OTP verification required for transactions over {:.2}", threshold)
            }
            LedgerError::LimitExceeded { scope, limit, .. } => {
                format!("Transaction exceeds your {} limit of {:.2}", scope, limit)
            }
            LedgerError::LedgerConflict { .. } => {
                "The account is busy. Please try again.".to_string()
            }
            LedgerError::OtpInvalid { .. } => {
                "Invalid or expired verification code.".to_string()
            }
            LedgerError::InvalidWindow { .. } => {
                "The lookback window is out of range.".to_string()
            }
            _ => "An error occurred. Please try again or contact support.".to_string(),
        }
    }

    /// Check if error is transient (caller may retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LedgerError::LedgerConflict { .. } | LedgerError::StorageError { .. }
        )
    }

    /// Validation rejections: deterministic, no side effects, never retried
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidAmount { .. }
                | LedgerError::AccountNotFound { .. }
                | LedgerError::AccountInactive { .. }
                | LedgerError::AccessDenied { .. }
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::MinimumBalanceViolation { .. }
                | LedgerError::OtpRequired { .. }
                | LedgerError::LimitExceeded { .. }
        )
    }

    /// Get severity level for logging
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            LedgerError::CryptographyError { .. } | LedgerError::StorageError { .. } => {
                ErrorSeverity::Critical
            }

            LedgerError::AccessDenied { .. }
            | LedgerError::LedgerConflict { .. }
            | LedgerError::LimitExceeded { .. } => ErrorSeverity::High,

            LedgerError::InsufficientFunds { .. }
            | LedgerError::MinimumBalanceViolation { .. }
            | LedgerError::OtpInvalid { .. } => ErrorSeverity::Medium,

            _ => ErrorSeverity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_user_messages() {
        let error = LedgerError::InsufficientFunds {
            balance: Decimal::new(1050, 2),
            required: Decimal::from(20),
        };
        assert!(error.to_user_message().contains("10.50"));

        let error = LedgerError::OtpRequired {
            threshold: Decimal::from(5000),
        };
        assert!(error.to_user_message().contains("5000.00"));
    }

    #[test]
    fn test_recoverable_errors() {
        let conflict = LedgerError::LedgerConflict {
            account_number: "ACC001".to_string(),
            attempts: 5,
        };
        assert!(conflict.is_recoverable());
        assert!(!conflict.is_validation());

        let inactive = LedgerError::AccountInactive {
            account_number: "ACC001".to_string(),
        };
        assert!(!inactive.is_recoverable());
        assert!(inactive.is_validation());
    }

    #[test]
    fn test_error_severity() {
        let denied = LedgerError::AccessDenied {
            actor_id: "AGT001".to_string(),
            reason: "not assigned".to_string(),
        };
        assert_eq!(denied.severity(), ErrorSeverity::High);

        let storage = LedgerError::StorageError {
            message: "lock poisoned".to_string(),
        };
        assert_eq!(storage.severity(), ErrorSeverity::Critical);
    }
}
