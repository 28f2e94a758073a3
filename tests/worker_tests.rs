//! Renewal worker scenarios: reminder scheduling and deduplication,
//! due-renewal placeholder creation, completed-renewal application, and
//! grace-period expiry, all driven through `run_once_at` with an
//! explicit clock.

mod common;

use chrono::{Duration, Utc};
use common::{hash, world, World};
use patronpay::{
    Amount, BillingError, LedgerStore, NotificationKind, SettledPayment, SubscriptionStatus,
    TransactionStatus,
};

async fn subscribe(w: &World) -> SettledPayment {
    w.engine
        .record_subscription_payment(
            w.subscriber.id,
            w.creator.id,
            None,
            Amount::from_xlm(10),
            hash('a'),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_reminders_fire_once_per_threshold() {
    let w = world().await;
    let settled = subscribe(&w).await;
    let due = settled.subscription.next_billing_at;

    // Three days out: exactly one reminder, days_until = 3
    let report = w.worker.run_once_at(due - Duration::days(3)).await.unwrap();
    assert_eq!(report.reminders_sent, 1);

    // Same day re-run: no second reminder
    let report = w
        .worker
        .run_once_at(due - Duration::days(3) + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(report.reminders_sent, 0);

    // Two days out: neither threshold matches
    let report = w.worker.run_once_at(due - Duration::days(2)).await.unwrap();
    assert_eq!(report.reminders_sent, 0);

    // One day out: the 1-day reminder
    let report = w.worker.run_once_at(due - Duration::days(1)).await.unwrap();
    assert_eq!(report.reminders_sent, 1);

    let reminders: Vec<_> = w
        .store
        .notifications_for(w.subscriber.id)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|n| match n.kind {
            NotificationKind::RenewalReminder { days_until, .. } => Some(days_until),
            _ => None,
        })
        .collect();
    assert_eq!(reminders, vec![3, 1]);
}

#[tokio::test]
async fn test_due_renewal_creates_placeholder_and_past_due() {
    let w = world().await;
    let settled = subscribe(&w).await;
    let sub_id = settled.subscription.id;
    let due = settled.subscription.next_billing_at;

    let report = w.worker.run_once_at(due + Duration::hours(1)).await.unwrap();
    assert_eq!(report.renewals_created, 1);
    assert_eq!(report.renewals_applied, 0);
    assert_eq!(report.subscriptions_expired, 0);

    let sub = w.store.subscription(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::PastDue);

    let placeholder = w
        .store
        .pending_renewal_since(sub_id, chrono::DateTime::<Utc>::MIN_UTC)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(placeholder.status, TransactionStatus::Pending);
    assert!(placeholder.tx_hash.is_none());
    assert_eq!(placeholder.platform_fee.to_string(), "0.2");

    assert!(w
        .store
        .notifications_for(w.subscriber.id)
        .await
        .unwrap()
        .iter()
        .any(|n| matches!(n.kind, NotificationKind::RenewalDue { .. })));

    // Re-run: the existing placeholder suppresses a second one
    let report = w.worker.run_once_at(due + Duration::hours(2)).await.unwrap();
    assert_eq!(report.renewals_created, 0);
}

#[tokio::test]
async fn test_completed_renewal_applied_once() {
    let w = world().await;
    let settled = subscribe(&w).await;
    let sub_id = settled.subscription.id;
    let due = settled.subscription.next_billing_at;
    let run_at = due + Duration::hours(1);

    // Worker creates the placeholder, client registers the paid hash,
    // webhook confirms it without touching the subscription.
    w.worker.run_once_at(run_at).await.unwrap();
    w.engine
        .register_renewal_hash(sub_id, w.subscriber.id, hash('b'))
        .await
        .unwrap();
    let (confirmed, was_pending) = w
        .engine
        .confirm_payment(&hash('b'), Some(Amount::from_xlm(10)))
        .await
        .unwrap()
        .unwrap();
    assert!(was_pending);
    assert!(confirmed.settled_at.is_none());

    // Billing clock not yet advanced; earnings not yet credited
    let sub = w.store.subscription(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.next_billing_at, due);
    let creator = w.store.creator(w.creator.id).await.unwrap().unwrap();
    assert_eq!(creator.total_earnings.to_string(), "9.8");

    // Apply phase reconciles: clock advanced from the missed due date,
    // earnings credited, row marked settled
    let report = w
        .worker
        .run_once_at(run_at + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.renewals_applied, 1);

    let sub = w.store.subscription(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(sub.next_billing_at > due);

    let creator = w.store.creator(w.creator.id).await.unwrap().unwrap();
    assert_eq!(creator.total_earnings.to_string(), "19.6");
    assert_eq!(
        w.store.collected_balance().await.unwrap().to_string(),
        "0.4"
    );
    let tx = w
        .store
        .transaction_by_hash(&hash('b'))
        .await
        .unwrap()
        .unwrap();
    assert!(tx.settled_at.is_some());

    // At-most-once crediting: re-running never re-applies
    let report = w
        .worker
        .run_once_at(run_at + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(report.renewals_applied, 0);
    let creator = w.store.creator(w.creator.id).await.unwrap().unwrap();
    assert_eq!(creator.total_earnings.to_string(), "19.6");
}

#[tokio::test]
async fn test_grace_period_expiry() {
    let w = world().await;
    let settled = subscribe(&w).await;
    let sub_id = settled.subscription.id;
    let due = settled.subscription.next_billing_at;

    // Eight days past due: beyond the seven-day grace period
    let report = w.worker.run_once_at(due + Duration::days(8)).await.unwrap();
    assert_eq!(report.subscriptions_expired, 1);

    let sub = w.store.subscription(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Expired);

    let creator = w.store.creator(w.creator.id).await.unwrap().unwrap();
    assert_eq!(creator.subscriber_count, 0);

    let expiry_rows = w
        .store
        .notifications_for(w.subscriber.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| matches!(n.kind, NotificationKind::SubscriptionExpired { .. }))
        .count();
    assert_eq!(expiry_rows, 1);
}

#[tokio::test]
async fn test_within_grace_period_not_expired() {
    let w = world().await;
    let settled = subscribe(&w).await;
    let due = settled.subscription.next_billing_at;

    let report = w.worker.run_once_at(due + Duration::days(6)).await.unwrap();
    assert_eq!(report.subscriptions_expired, 0);

    let sub = w
        .store
        .subscription(settled.subscription.id)
        .await
        .unwrap()
        .unwrap();
    // Due-renewal phase flipped it, expiry left it alone
    assert_eq!(sub.status, SubscriptionStatus::PastDue);
}

#[tokio::test]
async fn test_expired_is_terminal_for_worker_and_engine() {
    let w = world().await;
    let settled = subscribe(&w).await;
    let sub_id = settled.subscription.id;
    let due = settled.subscription.next_billing_at;

    w.worker.run_once_at(due + Duration::days(8)).await.unwrap();

    let err = w
        .engine
        .record_renewal_payment(sub_id, w.subscriber.id, hash('b'))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotActive));

    // Further runs leave it untouched
    let report = w.worker.run_once_at(due + Duration::days(9)).await.unwrap();
    assert_eq!(report.subscriptions_expired, 0);
    assert_eq!(report.renewals_created, 0);
    let sub = w.store.subscription(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Expired);
}

#[tokio::test]
async fn test_renewal_payment_clears_past_due() {
    let w = world().await;
    let settled = subscribe(&w).await;
    let sub_id = settled.subscription.id;
    let due = settled.subscription.next_billing_at;

    w.worker.run_once_at(due + Duration::hours(1)).await.unwrap();
    let sub = w.store.subscription(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::PastDue);

    // Synchronous renewal path completes the placeholder directly
    let renewed = w
        .engine
        .record_renewal_payment(sub_id, w.subscriber.id, hash('b'))
        .await
        .unwrap();
    assert_eq!(renewed.subscription.status, SubscriptionStatus::Active);
    assert!(renewed.transaction.settled_at.is_some());

    // The settled placeholder is invisible to the apply phase
    let report = w
        .worker
        .run_once_at(due + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(report.renewals_applied, 0);
    let creator = w.store.creator(w.creator.id).await.unwrap().unwrap();
    assert_eq!(creator.total_earnings.to_string(), "19.6");
}

#[tokio::test]
async fn test_renewal_payment_leaves_registered_hash_intact() {
    let w = world().await;
    let settled = subscribe(&w).await;
    let sub_id = settled.subscription.id;
    let due = settled.subscription.next_billing_at;

    // Worker creates the placeholder; the client registers a hash on it
    w.worker.run_once_at(due + Duration::hours(1)).await.unwrap();
    w.engine
        .register_renewal_hash(sub_id, w.subscriber.id, hash('b'))
        .await
        .unwrap();

    // A renewal paid with a different hash gets its own row instead of
    // overwriting the registered one
    let renewed = w
        .engine
        .record_renewal_payment(sub_id, w.subscriber.id, hash('c'))
        .await
        .unwrap();
    assert_eq!(renewed.transaction.tx_hash, Some(hash('c')));
    assert_eq!(renewed.subscription.status, SubscriptionStatus::Active);

    // The registered payment is still findable and still pending, so the
    // webhook can confirm it later
    let registered = w
        .store
        .transaction_by_hash(&hash('b'))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(registered.status, TransactionStatus::Pending);
    assert_eq!(registered.subscription_id, Some(sub_id));
    assert_ne!(registered.id, renewed.transaction.id);
}

#[tokio::test]
async fn test_authorized_trigger_runs() {
    let w = world().await;
    let worker = patronpay::RenewalWorker::new(
        w.store.clone(),
        std::sync::Arc::new(patronpay::NullSink),
        patronpay::BillingConfig::default().with_worker_api_key("cron-key"),
    );

    assert!(matches!(
        worker.trigger("wrong-key").await.unwrap_err(),
        BillingError::Unauthorized
    ));
    let report = worker.trigger("cron-key").await.unwrap();
    assert!(!report.skipped);
}
