//! Billing configuration surface consumed by the engine and worker.

use crate::Amount;
use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;

/// Reminder offsets in days before the due date, most distant first.
pub const DEFAULT_REMINDER_DAYS: [u32; 2] = [3, 1];

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Platform fee as a percentage of the gross amount.
    pub fee_percent: Decimal,
    /// Length of one billing period in months.
    pub billing_period_months: u32,
    /// Days past the due date before a subscription is forcibly expired.
    pub grace_period_days: i64,
    /// Days before the due date at which one-time reminders fire.
    pub reminder_days: Vec<u32>,
    /// Shared secret for webhook HMAC verification. When unset,
    /// verification is skipped entirely (development mode only).
    pub webhook_secret: Option<String>,
    /// Static API key authenticating worker trigger calls.
    pub worker_api_key: Option<String>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            fee_percent: dec!(2),
            billing_period_months: 1,
            grace_period_days: 7,
            reminder_days: DEFAULT_REMINDER_DAYS.to_vec(),
            webhook_secret: None,
            worker_api_key: None,
        }
    }
}

impl BillingConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Reads `PLATFORM_FEE_PERCENT`, `WEBHOOK_SECRET` and
    /// `WORKER_API_KEY`. A `.env` file is honored when present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        if let Ok(raw) = std::env::var("PLATFORM_FEE_PERCENT") {
            if let Ok(percent) = Decimal::from_str(&raw) {
                config.fee_percent = percent;
            }
        }
        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            if !secret.is_empty() {
                config.webhook_secret = Some(secret);
            }
        }
        if let Ok(key) = std::env::var("WORKER_API_KEY") {
            if !key.is_empty() {
                config.worker_api_key = Some(key);
            }
        }
        config
    }

    pub fn with_fee_percent(mut self, fee_percent: Decimal) -> Self {
        self.fee_percent = fee_percent;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_worker_api_key(mut self, key: impl Into<String>) -> Self {
        self.worker_api_key = Some(key.into());
        self
    }

    /// Advance a billing clock by one period.
    pub fn next_billing_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from.checked_add_months(Months::new(self.billing_period_months))
            .unwrap_or_else(|| from + Duration::days(30 * i64::from(self.billing_period_months)))
    }

    /// Split a gross amount into (platform fee, net credit).
    ///
    /// Computed once per transaction and stored; the stored fee stays
    /// authoritative even if `fee_percent` changes later.
    pub fn fee_split(&self, gross: Amount) -> (Amount, Amount) {
        let fee = gross.percentage(self.fee_percent);
        let net = gross.checked_sub(&fee).unwrap_or_else(Amount::zero);
        (fee, net)
    }
}
