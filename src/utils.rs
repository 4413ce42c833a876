//! Utility functions for LedgerGuard
//! Currency display, log-safe account masking and branch-local calendar helpers

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use rust_decimal::Decimal;

/// Format currency amount for display on receipts and notices
pub fn format_currency(amount: Decimal, currency: &str) -> String {
    let amount = amount.round_dp(2);
    match currency.to_uppercase().as_str() {
        "LKR" => format!("Rs. {:.2}", amount),
        "USD" => format!("${:.2}", amount),
        "EUR" => format!("€{:.2}", amount),
        "INR" => format!("₹{:.2}", amount),
        _ => format!("{} {:.2}", currency, amount),
    }
}

/// Keep only the last four characters of an account number for logs
pub fn mask_account(account_number: &str) -> String {
    let chars: Vec<char> = account_number.trim().chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), visible)
}

pub fn to_business_time(timestamp: DateTime<Utc>, offset: FixedOffset) -> DateTime<FixedOffset> {
    timestamp.with_timezone(&offset)
}

/// Hour of day (0-23) in branch local time
pub fn business_hour(timestamp: DateTime<Utc>, offset: FixedOffset) -> u32 {
    to_business_time(timestamp, offset).hour()
}

pub fn is_weekend(timestamp: DateTime<Utc>, offset: FixedOffset) -> bool {
    matches!(
        to_business_time(timestamp, offset).weekday(),
        Weekday::Sat | Weekday::Sun
    )
}

/// UTC bounds `[start, end)` of the branch-local calendar day containing `timestamp`
pub fn business_day_bounds(
    timestamp: DateTime<Utc>,
    offset: FixedOffset,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_midnight = to_business_time(timestamp, offset)
        .date_naive()
        .and_time(NaiveTime::MIN);
    let start = offset
        .from_local_datetime(&local_midnight)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(timestamp);
    (start, start + Duration::days(1))
}
