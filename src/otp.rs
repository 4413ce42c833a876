//! One-time passcodes for transactions above the disclosure threshold
//! Codes are six digits from the OS RNG; only their Argon2 hash is kept

use std::collections::HashMap;
use std::sync::RwLock;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Duration, Utc};
use rand_core::{OsRng, RngCore};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::errors::{LedgerError, Result};
use crate::utils::mask_account;

/// Read-only OTP query used by intake validation
pub trait OtpVerifier: Send + Sync {
    /// Whether `phone` holds an unexpired verification covering `amount`
    fn is_verified(&self, phone: &str, amount: Decimal) -> bool;
}

/// A freshly issued code, handed to the SMS collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedOtp {
    pub verification_id: Uuid,
    pub phone_number: String,
    pub code: String,
    pub amount: Decimal,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingCode {
    verification_id: Uuid,
    code_hash: String,
    amount: Decimal,
    expires_at: DateTime<Utc>,
    failed_attempts: u32,
}

#[derive(Debug, Clone, Copy)]
struct Verification {
    amount: Decimal,
    expires_at: DateTime<Utc>,
}

/// A verification taken for one transaction; handed back if the commit fails
#[derive(Debug, Clone)]
pub struct OtpGrant {
    phone: String,
    verification: Verification,
}

#[derive(Debug)]
pub struct OtpManager {
    threshold: Decimal,
    ttl: Duration,
    max_attempts: u32,
    pending: RwLock<HashMap<String, PendingCode>>,
    verified: RwLock<HashMap<String, Verification>>,
}

impl OtpManager {
    pub fn new(config: &LedgerConfig) -> Self {
        Self {
            threshold: config.otp_threshold,
            ttl: Duration::minutes(i64::from(config.otp_ttl_minutes)),
            max_attempts: config.otp_max_attempts,
            pending: RwLock::new(HashMap::new()),
            verified: RwLock::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    /// Issue a code for `phone`, replacing any outstanding one
    pub fn issue(&self, phone: &str, amount: Decimal) -> Result<IssuedOtp> {
        if amount <= self.threshold {
            return Err(LedgerError::OtpNotRequired {
                threshold: self.threshold,
            });
        }

        let phone = normalize_phone(phone);
        let code = generate_code();
        let code_hash = hash_code(&code)?;
        let issued = IssuedOtp {
            verification_id: Uuid::new_v4(),
            phone_number: phone.clone(),
            code,
            amount,
            expires_at: Utc::now() + self.ttl,
        };

        self.pending
            .write()
            .map_err(|_| lock_error("otp pending"))?
            .insert(
                phone.clone(),
                PendingCode {
                    verification_id: issued.verification_id,
                    code_hash,
                    amount,
                    expires_at: issued.expires_at,
                    failed_attempts: 0,
                },
            );

        info!(
            phone = %mask_account(&phone),
            verification_id = %issued.verification_id,
            "OTP issued"
        );
        Ok(issued)
    }

    /// Check a code; success consumes it and records a verification
    pub fn verify(&self, phone: &str, code: &str) -> Result<Uuid> {
        let phone = normalize_phone(phone);
        let now = Utc::now();

        let mut pending = self.pending.write().map_err(|_| lock_error("otp pending"))?;
        let entry = pending.get_mut(&phone).ok_or_else(|| LedgerError::OtpInvalid {
            message: "no code outstanding for this number".to_string(),
        })?;

        if entry.expires_at <= now {
            pending.remove(&phone);
            return Err(LedgerError::OtpInvalid {
                message: "code expired".to_string(),
            });
        }

        if !matches_hash(code.trim(), &entry.code_hash)? {
            entry.failed_attempts += 1;
            warn!(
                phone = %mask_account(&phone),
                failed_attempts = entry.failed_attempts,
                "OTP mismatch"
            );
            if entry.failed_attempts >= self.max_attempts {
                pending.remove(&phone);
                return Err(LedgerError::OtpInvalid {
                    message: "too many failed attempts".to_string(),
                });
            }
            return Err(LedgerError::OtpInvalid {
                message: "code does not match".to_string(),
            });
        }

        let Some(consumed) = pending.remove(&phone) else {
            return Err(lock_error("otp pending"));
        };
        drop(pending);

        self.verified
            .write()
            .map_err(|_| lock_error("otp verified"))?
            .insert(
                phone.clone(),
                Verification {
                    amount: consumed.amount,
                    expires_at: now + self.ttl,
                },
            );

        info!(
            phone = %mask_account(&phone),
            verification_id = %consumed.verification_id,
            "OTP verified"
        );
        Ok(consumed.verification_id)
    }

    /// Take the verification covering `amount` so it clears exactly one transaction
    pub fn consume(&self, phone: &str, amount: Decimal) -> Result<Option<OtpGrant>> {
        let phone = normalize_phone(phone);
        let mut verified = self.verified.write().map_err(|_| lock_error("otp verified"))?;

        let covers = verified
            .get(&phone)
            .is_some_and(|v| v.expires_at > Utc::now() && amount <= v.amount);
        if !covers {
            return Ok(None);
        }
        Ok(verified
            .remove(&phone)
            .map(|verification| OtpGrant { phone, verification }))
    }

    /// Put back a grant whose transaction did not commit. A newer verification wins.
    pub fn reinstate(&self, grant: OtpGrant) {
        if grant.verification.expires_at <= Utc::now() {
            return;
        }
        if let Ok(mut verified) = self.verified.write() {
            verified.entry(grant.phone).or_insert(grant.verification);
        }
    }
}

impl OtpVerifier for OtpManager {
    fn is_verified(&self, phone: &str, amount: Decimal) -> bool {
        let Ok(verified) = self.verified.read() else {
            return false;
        };
        verified
            .get(&normalize_phone(phone))
            .is_some_and(|v| v.expires_at > Utc::now() && amount <= v.amount)
    }
}

fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect()
}

fn generate_code() -> String {
    format!("{:06}", OsRng.next_u32() % 1_000_000)
}

fn hash_code(code: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(code.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| LedgerError::CryptographyError {
            message: format!("Failed to hash OTP: {}", e),
        })
}

fn matches_hash(code: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| LedgerError::CryptographyError {
        message: format!("Failed to parse hash: {}", e),
    })?;
    Ok(Argon2::default().verify_password(code.as_bytes(), &parsed).is_ok())
}

fn lock_error(what: &str) -> LedgerError {
    LedgerError::StorageError {
        message: format!("{} lock poisoned", what),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> OtpManager {
        OtpManager::new(&LedgerConfig::default())
    }

    #[test]
    fn test_issue_below_threshold_refused() {
        let otp = manager();
        assert!(matches!(
            otp.issue("+94771234567", Decimal::from(5_000)),
            Err(LedgerError::OtpNotRequired { .. })
        ));
    }

    #[test]
    fn test_verify_consumes_code() {
        let otp = manager();
        let issued = otp.issue("+94 77 123 4567", Decimal::from(6_000)).unwrap();
        assert_eq!(issued.code.len(), 6);
        assert!(!otp.is_verified("+94771234567", Decimal::from(6_000)));

        otp.verify("+94771234567", &issued.code).unwrap();
        assert!(otp.is_verified("+94771234567", Decimal::from(6_000)));
        assert!(otp.is_verified("+94771234567", Decimal::from(5_500)));
        assert!(!otp.is_verified("+94771234567", Decimal::from(7_000)));

        // Second use of the same code fails
        assert!(otp.verify("+94771234567", &issued.code).is_err());
    }

    #[test]
    fn test_max_attempts_discards_code() {
        let mut config = LedgerConfig::default();
        config.otp_max_attempts = 2;
        let otp = OtpManager::new(&config);
        let issued = otp.issue("0771234567", Decimal::from(9_000)).unwrap();
        let wrong = if issued.code == "000000" { "111111" } else { "000000" };

        assert!(otp.verify("0771234567", wrong).is_err());
        assert!(otp.verify("0771234567", wrong).is_err());
        assert!(otp.verify("0771234567", &issued.code).is_err());
        assert!(!otp.is_verified("0771234567", Decimal::from(9_000)));
    }

    #[test]
    fn test_consume_clears_one_transaction() {
        let otp = manager();
        let issued = otp.issue("0771234567", Decimal::from(7_000)).unwrap();
        otp.verify("0771234567", &issued.code).unwrap();

        assert!(otp.consume("0771234567", Decimal::from(8_000)).unwrap().is_none());
        let grant = otp.consume("077 123 4567", Decimal::from(7_000)).unwrap();
        assert!(grant.is_some());
        assert!(!otp.is_verified("0771234567", Decimal::from(7_000)));
        assert!(otp.consume("0771234567", Decimal::from(7_000)).unwrap().is_none());

        // A failed commit hands the verification back
        otp.reinstate(grant.unwrap());
        assert!(otp.is_verified("0771234567", Decimal::from(7_000)));
    }

    #[test]
    fn test_expired_code_rejected() {
        let otp = manager();
        let issued = otp.issue("0771234567", Decimal::from(9_000)).unwrap();
        if let Ok(mut pending) = otp.pending.write() {
            if let Some(entry) = pending.get_mut("0771234567") {
                entry.expires_at = Utc::now() - Duration::seconds(1);
            }
        }

        assert!(matches!(
            otp.verify("0771234567", &issued.code),
            Err(LedgerError::OtpInvalid { .. })
        ));
    }
}
