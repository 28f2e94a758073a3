//! Scheduled renewal worker.
//!
//! One run walks four phases in order: send renewal reminders, create
//! pending renewal placeholders for due subscriptions (flipping them to
//! `past_due`), apply completed-but-unsettled renewal payments, and
//! expire subscriptions left unpaid past the grace period. Each row is
//! handled independently; a failing row is logged and skipped so the
//! rest of the run proceeds. Overlapping runs are skipped via an
//! advisory lock rather than queued.

use crate::config::BillingConfig;
use crate::model::{
    FeeKind, Notification, NotificationKind, PlatformEarning, Subscription, SubscriptionStatus,
    Transaction, TransactionKind,
};
use crate::notify::NotificationSink;
use crate::store::{LedgerOp, LedgerStore};
use crate::{BillingError, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Counters from one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub reminders_sent: usize,
    pub renewals_created: usize,
    pub renewals_applied: usize,
    pub subscriptions_expired: usize,
    pub rows_failed: usize,
    /// True when the run was skipped because another was in progress.
    pub skipped: bool,
}

pub struct RenewalWorker {
    store: Arc<dyn LedgerStore>,
    sink: Arc<dyn NotificationSink>,
    config: BillingConfig,
    running: tokio::sync::Mutex<()>,
}

impl RenewalWorker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sink: Arc<dyn NotificationSink>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            sink,
            config,
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Constant-time check of the presented trigger key. Fails closed
    /// when no key is configured.
    pub fn authorize_trigger(&self, presented: &str) -> Result<()> {
        let Some(expected) = &self.config.worker_api_key else {
            return Err(BillingError::Unauthorized);
        };
        if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
            Ok(())
        } else {
            Err(BillingError::Unauthorized)
        }
    }

    /// Authenticated manual trigger.
    pub async fn trigger(&self, presented_key: &str) -> Result<WorkerReport> {
        self.authorize_trigger(presented_key)?;
        self.run_once().await
    }

    pub async fn run_once(&self) -> Result<WorkerReport> {
        self.run_once_at(Utc::now()).await
    }

    /// Run all phases against an explicit clock.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<WorkerReport> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::info!("renewal run already in progress, skipping");
            return Ok(WorkerReport {
                skipped: true,
                ..Default::default()
            });
        };

        // Phases are independent: a scan failure in one must not stop
        // the others, the same way a failing row does not stop its phase.
        let mut report = WorkerReport::default();
        if let Err(e) = self.send_reminders(now, &mut report).await {
            report.rows_failed += 1;
            tracing::error!(error = %e, "reminder phase aborted");
        }
        if let Err(e) = self.create_due_renewals(now, &mut report).await {
            report.rows_failed += 1;
            tracing::error!(error = %e, "due-renewal phase aborted");
        }
        if let Err(e) = self.apply_completed_renewals(now, &mut report).await {
            report.rows_failed += 1;
            tracing::error!(error = %e, "renewal-application phase aborted");
        }
        if let Err(e) = self.expire_overdue(now, &mut report).await {
            report.rows_failed += 1;
            tracing::error!(error = %e, "expiry phase aborted");
        }

        tracing::info!(
            reminders = report.reminders_sent,
            created = report.renewals_created,
            applied = report.renewals_applied,
            expired = report.subscriptions_expired,
            failed = report.rows_failed,
            "renewal run finished"
        );
        Ok(report)
    }

    /// Spawn the periodic loop.
    pub fn start(self: Arc<Self>, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::error!(error = %e, "renewal run failed");
                }
            }
        })
    }

    async fn send_reminders(&self, now: DateTime<Utc>, report: &mut WorkerReport) -> Result<()> {
        for &days in &self.config.reminder_days {
            let target = (now + Duration::days(i64::from(days))).date_naive();
            for subscription in self.store.subscriptions_due_on(target).await? {
                match self.remind(&subscription, days).await {
                    Ok(true) => report.reminders_sent += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.rows_failed += 1;
                        tracing::warn!(
                            subscription = %subscription.id,
                            error = %e,
                            "reminder failed"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn remind(&self, subscription: &Subscription, days: u32) -> Result<bool> {
        if self
            .store
            .has_renewal_reminder(subscription.id, days)
            .await?
        {
            return Ok(false);
        }

        let unit = if days == 1 { "day" } else { "days" };
        let event = NotificationKind::RenewalReminder {
            subscription_id: subscription.id,
            creator_id: subscription.creator_id,
            amount: subscription.amount,
            days_until: days,
            next_billing_at: subscription.next_billing_at,
        };
        self.store
            .commit(vec![LedgerOp::InsertNotification(Notification::new(
                subscription.subscriber_id,
                "Renewal Reminder",
                format!(
                    "Your subscription renews in {} {} ({} XLM).",
                    days, unit, subscription.amount
                ),
                event.clone(),
            ))])
            .await?;
        self.push(subscription.subscriber_id, event).await;
        Ok(true)
    }

    async fn create_due_renewals(
        &self,
        now: DateTime<Utc>,
        report: &mut WorkerReport,
    ) -> Result<()> {
        for subscription in self.store.subscriptions_due_before(now).await? {
            match self.create_due_renewal(&subscription, now).await {
                Ok(true) => report.renewals_created += 1,
                Ok(false) => {}
                Err(e) => {
                    report.rows_failed += 1;
                    tracing::warn!(
                        subscription = %subscription.id,
                        error = %e,
                        "due-renewal creation failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn create_due_renewal(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let window = now - Duration::days(self.config.grace_period_days);
        if self
            .store
            .pending_renewal_since(subscription.id, window)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        let creator = self
            .store
            .creator(subscription.creator_id)
            .await?
            .ok_or(BillingError::UnknownCreator)?;

        let (fee, _) = self.config.fee_split(subscription.amount);
        let placeholder = Transaction::new(
            TransactionKind::Renewal,
            creator.user_id,
            subscription.amount,
            fee,
        )
        .with_sender(subscription.subscriber_id)
        .with_subscription(subscription.id);

        let mut past_due = subscription.clone();
        past_due.status = SubscriptionStatus::PastDue;
        past_due.updated_at = now;

        let event = NotificationKind::RenewalDue {
            subscription_id: subscription.id,
            transaction_id: placeholder.id,
            amount: subscription.amount,
        };
        self.store
            .commit(vec![
                LedgerOp::InsertTransaction(placeholder),
                LedgerOp::UpdateSubscription(past_due),
                LedgerOp::InsertNotification(Notification::new(
                    subscription.subscriber_id,
                    "Renewal Payment Due",
                    format!(
                        "Your subscription payment of {} XLM is due.",
                        subscription.amount
                    ),
                    event.clone(),
                )),
            ])
            .await?;

        tracing::info!(subscription = %subscription.id, "pending renewal created");
        self.push(subscription.subscriber_id, event).await;
        Ok(true)
    }

    /// Credit renewals that were paid and confirmed since the last run.
    /// `settled_at` guards the credit: a row is picked up once, ever.
    async fn apply_completed_renewals(
        &self,
        now: DateTime<Utc>,
        report: &mut WorkerReport,
    ) -> Result<()> {
        for (transaction, subscription) in self.store.unsettled_completed_renewals(now).await? {
            match self.apply_renewal(transaction, subscription, now).await {
                Ok(()) => report.renewals_applied += 1,
                Err(e) => {
                    report.rows_failed += 1;
                    tracing::warn!(error = %e, "renewal application failed");
                }
            }
        }
        Ok(())
    }

    async fn apply_renewal(
        &self,
        transaction: Transaction,
        subscription: Subscription,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let fee = transaction.platform_fee;
        let net = transaction.net_amount();

        let mut settled = transaction;
        settled.settled_at = Some(now);
        settled.updated_at = now;

        let mut renewed = subscription;
        renewed.status = SubscriptionStatus::Active;
        // Extend from the missed due date, not from the run time, so a
        // late payment does not shift the billing anchor.
        renewed.next_billing_at = self.config.next_billing_after(renewed.next_billing_at);
        renewed.updated_at = now;

        let mut ops = vec![
            LedgerOp::UpdateTransaction(settled.clone()),
            LedgerOp::UpdateSubscription(renewed.clone()),
            LedgerOp::AdjustCreator {
                creator_id: renewed.creator_id,
                subscriber_delta: 0,
                earnings_delta: net,
            },
        ];
        if fee.is_positive() {
            ops.push(LedgerOp::InsertEarning(PlatformEarning::collected(
                settled.id,
                fee,
                FeeKind::RenewalFee,
            )));
        }
        self.store.commit(ops).await?;

        tracing::info!(
            subscription = %renewed.id,
            next_billing_at = %renewed.next_billing_at,
            "completed renewal applied"
        );
        Ok(())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>, report: &mut WorkerReport) -> Result<()> {
        let cutoff = now - Duration::days(self.config.grace_period_days);
        for subscription in self.store.subscriptions_overdue(cutoff).await? {
            match self.expire(&subscription, now).await {
                Ok(()) => report.subscriptions_expired += 1,
                Err(e) => {
                    report.rows_failed += 1;
                    tracing::warn!(
                        subscription = %subscription.id,
                        error = %e,
                        "expiry failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn expire(&self, subscription: &Subscription, now: DateTime<Utc>) -> Result<()> {
        let creator = self
            .store
            .creator(subscription.creator_id)
            .await?
            .ok_or(BillingError::UnknownCreator)?;

        let mut expired = subscription.clone();
        expired.status = SubscriptionStatus::Expired;
        expired.updated_at = now;

        let event = NotificationKind::SubscriptionExpired {
            subscription_id: subscription.id,
            creator_id: subscription.creator_id,
        };
        self.store
            .commit(vec![
                LedgerOp::UpdateSubscription(expired),
                LedgerOp::AdjustCreator {
                    creator_id: creator.id,
                    subscriber_delta: -1,
                    earnings_delta: crate::Amount::zero(),
                },
                LedgerOp::InsertNotification(Notification::new(
                    subscription.subscriber_id,
                    "Subscription Expired",
                    "Your subscription has expired after the unpaid grace period.",
                    event.clone(),
                )),
            ])
            .await?;

        tracing::info!(subscription = %subscription.id, "subscription expired");
        self.push(subscription.subscriber_id, event.clone()).await;
        self.push(creator.user_id, event).await;
        Ok(())
    }

    async fn push(&self, user_id: crate::model::UserId, event: NotificationKind) {
        if let Err(e) = self.sink.notify(user_id, &event).await {
            tracing::warn!(user = %user_id, error = %e, "notification delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Creator, CreatorId, Notification, PlatformEarning, SubscriptionId, TransactionId, TxHash,
        User, UserId,
    };
    use crate::notify::NullSink;
    use crate::store::MemoryLedger;
    use crate::Amount;
    use chrono::NaiveDate;

    /// Store whose reminder scan always fails; everything else delegates.
    struct BrokenReminderScan {
        inner: MemoryLedger,
    }

    #[async_trait::async_trait]
    impl LedgerStore for BrokenReminderScan {
        async fn subscriptions_due_on(&self, _date: NaiveDate) -> Result<Vec<Subscription>> {
            Err(BillingError::storage("reminder scan unavailable"))
        }

        async fn user(&self, id: UserId) -> Result<Option<User>> {
            self.inner.user(id).await
        }
        async fn user_by_wallet(&self, wallet: &str) -> Result<Option<User>> {
            self.inner.user_by_wallet(wallet).await
        }
        async fn creator(&self, id: CreatorId) -> Result<Option<Creator>> {
            self.inner.creator(id).await
        }
        async fn creator_by_wallet(&self, wallet: &str) -> Result<Option<Creator>> {
            self.inner.creator_by_wallet(wallet).await
        }
        async fn subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
            self.inner.subscription(id).await
        }
        async fn live_subscription_for_pair(
            &self,
            subscriber_id: UserId,
            creator_id: CreatorId,
        ) -> Result<Option<Subscription>> {
            self.inner
                .live_subscription_for_pair(subscriber_id, creator_id)
                .await
        }
        async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
            self.inner.transaction(id).await
        }
        async fn transaction_by_hash(&self, tx_hash: &TxHash) -> Result<Option<Transaction>> {
            self.inner.transaction_by_hash(tx_hash).await
        }
        async fn transactions_for_subscription(
            &self,
            subscription_id: SubscriptionId,
        ) -> Result<Vec<Transaction>> {
            self.inner
                .transactions_for_subscription(subscription_id)
                .await
        }
        async fn subscriptions_for_creator(
            &self,
            creator_id: CreatorId,
        ) -> Result<Vec<Subscription>> {
            self.inner.subscriptions_for_creator(creator_id).await
        }
        async fn subscriptions_due_before(
            &self,
            at: DateTime<Utc>,
        ) -> Result<Vec<Subscription>> {
            self.inner.subscriptions_due_before(at).await
        }
        async fn subscriptions_overdue(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<Vec<Subscription>> {
            self.inner.subscriptions_overdue(cutoff).await
        }
        async fn has_renewal_reminder(
            &self,
            subscription_id: SubscriptionId,
            days_until: u32,
        ) -> Result<bool> {
            self.inner
                .has_renewal_reminder(subscription_id, days_until)
                .await
        }
        async fn pending_renewal_since(
            &self,
            subscription_id: SubscriptionId,
            since: DateTime<Utc>,
        ) -> Result<Option<Transaction>> {
            self.inner
                .pending_renewal_since(subscription_id, since)
                .await
        }
        async fn unsettled_completed_renewals(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<(Transaction, Subscription)>> {
            self.inner.unsettled_completed_renewals(now).await
        }
        async fn notifications_for(&self, user_id: UserId) -> Result<Vec<Notification>> {
            self.inner.notifications_for(user_id).await
        }
        async fn platform_earnings(&self) -> Result<Vec<PlatformEarning>> {
            self.inner.platform_earnings().await
        }
        async fn collected_balance(&self) -> Result<Amount> {
            self.inner.collected_balance().await
        }
        async fn commit(&self, ops: Vec<LedgerOp>) -> Result<()> {
            self.inner.commit(ops).await
        }
    }

    fn worker_with_key(key: Option<&str>) -> RenewalWorker {
        let mut config = BillingConfig::default();
        config.worker_api_key = key.map(str::to_string);
        RenewalWorker::new(Arc::new(MemoryLedger::new()), Arc::new(NullSink), config)
    }

    #[test]
    fn test_trigger_key_checked() {
        let worker = worker_with_key(Some("secret-key"));
        assert!(worker.authorize_trigger("secret-key").is_ok());
        assert!(matches!(
            worker.authorize_trigger("wrong"),
            Err(BillingError::Unauthorized)
        ));
    }

    #[test]
    fn test_trigger_fails_closed_without_key() {
        let worker = worker_with_key(None);
        assert!(matches!(
            worker.authorize_trigger("anything"),
            Err(BillingError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_empty_run_reports_zeroes() {
        let worker = worker_with_key(None);
        let report = worker.run_once().await.unwrap();
        assert_eq!(report, WorkerReport::default());
    }

    #[tokio::test]
    async fn test_failed_phase_does_not_stop_later_phases() {
        let inner = MemoryLedger::new();
        let subscriber = User::new("GSUBSCRIBER", "Sam");
        let creator_user = User::new("GCREATOR", "Casey");
        let creator = Creator::new(&creator_user);
        let now = Utc::now();
        let due = Subscription::new(
            subscriber.id,
            creator.id,
            None,
            Amount::from_xlm(10),
            now - Duration::hours(1),
        );
        inner
            .commit(vec![
                LedgerOp::InsertUser(subscriber),
                LedgerOp::InsertUser(creator_user),
                LedgerOp::InsertCreator(creator),
                LedgerOp::InsertSubscription(due.clone()),
            ])
            .await
            .unwrap();

        let store = Arc::new(BrokenReminderScan { inner });
        let worker = RenewalWorker::new(store.clone(), Arc::new(NullSink), BillingConfig::default());
        let report = worker.run_once_at(now).await.unwrap();

        // The reminder scan failed, but the due subscription was still
        // flipped to past_due with a pending renewal created.
        assert_eq!(report.rows_failed, 1);
        assert_eq!(report.renewals_created, 1);
        let reloaded = store.subscription(due.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, SubscriptionStatus::PastDue);
    }
}
