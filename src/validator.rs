//! Transaction intake validation
//! Pure gate in front of the ledger: reads state, never writes it

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::{Actor, ActorDirectory, Role},
    config::LedgerConfig,
    errors::{LedgerError, LimitScope, Result},
    otp::OtpVerifier,
    store::{AccountStore, ActorVolumeCap},
    utils::{business_day_bounds, mask_account},
    Account, AccountStatus, TransactionRequest, TransactionType,
};

/// A request that passed every intake check, ready to commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub transaction_id: Uuid,
    pub account_number: String,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub actor_id: String,
    pub reference: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub requires_review: bool,
    /// Phone whose stored OTP verification cleared this draft; used up on commit
    pub otp_phone: Option<String>,
    /// Daily role limit, enforced again inside the balance write
    pub daily_cap: Option<ActorVolumeCap>,
}

/// How a draft above the OTP threshold was cleared
enum OtpClearance {
    /// The front end verified the code with the customer
    Asserted,
    /// A verification on file for this phone
    OnFile(String),
}

pub struct IntakeValidator {
    config: Arc<LedgerConfig>,
    store: Arc<dyn AccountStore>,
    directory: Arc<dyn ActorDirectory>,
    otp: Arc<dyn OtpVerifier>,
}

impl IntakeValidator {
    pub fn new(
        config: Arc<LedgerConfig>,
        store: Arc<dyn AccountStore>,
        directory: Arc<dyn ActorDirectory>,
        otp: Arc<dyn OtpVerifier>,
    ) -> Self {
        Self {
            config,
            store,
            directory,
            otp,
        }
    }

    pub fn validate(&self, request: &TransactionRequest, actor: &Actor) -> Result<TransactionDraft> {
        self.validate_at(request, actor, Utc::now())
    }

    /// Validate as of `at`, which becomes the draft's timestamp
    pub fn validate_at(
        &self,
        request: &TransactionRequest,
        actor: &Actor,
        at: DateTime<Utc>,
    ) -> Result<TransactionDraft> {
        if request.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount {
                amount: request.amount,
            });
        }

        let account = self.store.get_account(&request.account_number)?;
        ensure_active(&account)?;

        self.authorize(actor, &account)?;

        if request.transaction_type.is_debit() {
            ensure_funds(&account, request.amount)?;
        }

        let (requires_review, daily_cap) = self.check_role_limits(actor, request.amount, at)?;

        let otp_phone = if request.amount > self.config.otp_threshold {
            match self.otp_clearance(request, &account) {
                Some(OtpClearance::Asserted) => None,
                Some(OtpClearance::OnFile(phone)) => Some(phone),
                None => {
                    return Err(LedgerError::OtpRequired {
                        threshold: self.config.otp_threshold,
                    })
                }
            }
        } else {
            None
        };

        debug!(
            account = %mask_account(&account.account_number),
            actor = %actor.employee_id,
            branch = actor.branch_id.as_deref().unwrap_or("-"),
            amount = %request.amount,
            requires_review,
            "Transaction passed intake validation"
        );

        Ok(TransactionDraft {
            transaction_id: Uuid::new_v4(),
            account_number: account.account_number,
            transaction_type: request.transaction_type,
            amount: request.amount,
            actor_id: actor.employee_id.clone(),
            reference: request.reference.clone(),
            timestamp: at,
            requires_review,
            otp_phone,
            daily_cap: Some(daily_cap),
        })
    }

    fn authorize(&self, actor: &Actor, account: &Account) -> Result<()> {
        if self.config.role_limits.limits_for(actor.role).is_none() {
            return Err(LedgerError::AccessDenied {
                actor_id: actor.employee_id.clone(),
                reason: format!("role {} may not create transactions", actor.role),
            });
        }

        if actor.role == Role::Agent
            && !self
                .directory
                .is_assigned(&actor.employee_id, &account.customer_id)?
        {
            return Err(LedgerError::AccessDenied {
                actor_id: actor.employee_id.clone(),
                reason: format!("customer {} is not assigned to this agent", account.customer_id),
            });
        }

        Ok(())
    }

    /// Returns whether the amount crosses the approval threshold, and the daily cap to enforce on commit
    fn check_role_limits(
        &self,
        actor: &Actor,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(bool, ActorVolumeCap)> {
        let Some(limits) = self.config.role_limits.limits_for(actor.role) else {
            return Err(LedgerError::AccessDenied {
                actor_id: actor.employee_id.clone(),
                reason: format!("role {} may not create transactions", actor.role),
            });
        };

        if amount > limits.single_transaction {
            return Err(LedgerError::LimitExceeded {
                role: actor.role,
                scope: LimitScope::SingleTransaction,
                amount,
                limit: limits.single_transaction,
            });
        }

        let (day_start, day_end) = business_day_bounds(at, self.config.business_offset());
        let committed_today =
            self.store
                .actor_volume_between(&actor.employee_id, day_start, day_end)?;
        if committed_today + amount > limits.daily_limit {
            return Err(LedgerError::LimitExceeded {
                role: actor.role,
                scope: LimitScope::Daily,
                amount: committed_today + amount,
                limit: limits.daily_limit,
            });
        }

        let cap = ActorVolumeCap {
            actor_id: actor.employee_id.clone(),
            role: actor.role,
            from: day_start,
            to: day_end,
            limit: limits.daily_limit,
        };
        Ok((amount > limits.requires_approval, cap))
    }

    fn otp_clearance(&self, request: &TransactionRequest, account: &Account) -> Option<OtpClearance> {
        if request.otp_verified {
            return Some(OtpClearance::Asserted);
        }
        request
            .customer_phone
            .as_deref()
            .or(account.phone_number.as_deref())
            .filter(|phone| self.otp.is_verified(phone, request.amount))
            .map(|phone| OtpClearance::OnFile(phone.to_string()))
    }
}

pub(crate) fn ensure_active(account: &Account) -> Result<()> {
    if account.status != AccountStatus::Active {
        return Err(LedgerError::AccountInactive {
            account_number: account.account_number.clone(),
        });
    }
    Ok(())
}

/// Funds and minimum-balance policy for a debit of `amount`
pub(crate) fn ensure_funds(account: &Account, amount: Decimal) -> Result<()> {
    if account.current_balance < amount {
        return Err(LedgerError::InsufficientFunds {
            balance: account.current_balance,
            required: amount,
        });
    }

    let balance_after = account.current_balance - amount;
    if balance_after < account.minimum_balance {
        return Err(LedgerError::MinimumBalanceViolation {
            balance_after,
            minimum: account.minimum_balance,
        });
    }

    Ok(())
}
