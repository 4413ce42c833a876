//! Outbound notices. Delivery is fire-and-forget: a notifier must never fail a transaction.

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::otp::IssuedOtp;
use crate::utils::{format_currency, mask_account};
use crate::Transaction;

pub trait Notifier: Send + Sync {
    /// Amount above the large-transaction threshold
    fn notify_large_transaction(&self, transaction: &Transaction, threshold: Decimal);

    /// Committed above the actor's approval threshold
    fn notify_review_required(&self, transaction: &Transaction);

    /// Hand an OTP to the SMS channel
    fn deliver_otp(&self, otp: &IssuedOtp);
}

/// Writes notices to the tracing pipeline
#[derive(Debug, Clone)]
pub struct TracingNotifier {
    currency: String,
}

impl TracingNotifier {
    pub fn new(currency: &str) -> Self {
        Self {
            currency: currency.to_string(),
        }
    }
}

impl Notifier for TracingNotifier {
    fn notify_large_transaction(&self, transaction: &Transaction, threshold: Decimal) {
        info!(
            transaction_id = %transaction.transaction_id,
            account = %mask_account(&transaction.account_number),
            amount = %format_currency(transaction.amount, &self.currency),
            threshold = %format_currency(threshold, &self.currency),
            "Large transaction notice"
        );
    }

    fn notify_review_required(&self, transaction: &Transaction) {
        warn!(
            transaction_id = %transaction.transaction_id,
            account = %mask_account(&transaction.account_number),
            actor = %transaction.actor_id,
            amount = %format_currency(transaction.amount, &self.currency),
            "Transaction committed above approval threshold; manager review requested"
        );
    }

    fn deliver_otp(&self, otp: &IssuedOtp) {
        info!(
            phone = %mask_account(&otp.phone_number),
            verification_id = %otp.verification_id,
            expires_at = %otp.expires_at,
            "OTP queued for SMS delivery"
        );
    }
}
