//! The Ledger Store: single source of truth for billing state.
//!
//! All mutation flows through [`LedgerStore::commit`], which applies a
//! batch of [`LedgerOp`]s as one atomic unit: either every op is visible
//! or none are. The store is also the sole arbiter of `tx_hash`
//! uniqueness; concurrent attempts to record the same chain payment race
//! here, and the loser gets [`crate::BillingError::DuplicatePayment`],
//! which callers must interpret as "already handled".

use crate::model::{
    Creator, CreatorId, EarningId, EarningStatus, Notification, NotificationKind, PlatformEarning,
    Subscription, SubscriptionId, SubscriptionStatus, Transaction, TransactionId,
    TransactionKind, TransactionStatus, TxHash, User, UserId,
};
use crate::{Amount, BillingError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// One write in an atomic commit batch.
///
/// Ops are serializable so a durable store can journal whole batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LedgerOp {
    InsertUser(User),
    InsertCreator(Creator),
    InsertSubscription(Subscription),
    UpdateSubscription(Subscription),
    InsertTransaction(Transaction),
    UpdateTransaction(Transaction),
    InsertEarning(PlatformEarning),
    UpdateEarning(PlatformEarning),
    InsertNotification(Notification),
    /// Adjust a creator's denormalized aggregates in lockstep with the
    /// subscription/transaction rows changing in the same batch.
    AdjustCreator {
        creator_id: CreatorId,
        subscriber_delta: i64,
        earnings_delta: Amount,
    },
}

/// Storage trait for ledger state.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Lookups
    async fn user(&self, id: UserId) -> Result<Option<User>>;
    async fn user_by_wallet(&self, wallet: &str) -> Result<Option<User>>;
    async fn creator(&self, id: CreatorId) -> Result<Option<Creator>>;
    async fn creator_by_wallet(&self, wallet: &str) -> Result<Option<Creator>>;
    async fn subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>>;
    /// The live (active or past-due) subscription holding the
    /// (subscriber, creator) uniqueness slot, if any.
    async fn live_subscription_for_pair(
        &self,
        subscriber_id: UserId,
        creator_id: CreatorId,
    ) -> Result<Option<Subscription>>;
    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>>;
    async fn transaction_by_hash(&self, tx_hash: &TxHash) -> Result<Option<Transaction>>;
    async fn transactions_for_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<Transaction>>;
    async fn subscriptions_for_creator(&self, creator_id: CreatorId)
        -> Result<Vec<Subscription>>;

    // Worker scans
    /// Active subscriptions whose due date falls on the given calendar day.
    async fn subscriptions_due_on(&self, date: NaiveDate) -> Result<Vec<Subscription>>;
    /// Active subscriptions due at or before the given instant.
    async fn subscriptions_due_before(&self, at: DateTime<Utc>) -> Result<Vec<Subscription>>;
    /// Live subscriptions whose due date is strictly before the cutoff.
    async fn subscriptions_overdue(&self, cutoff: DateTime<Utc>) -> Result<Vec<Subscription>>;
    /// Whether a reminder for this (subscription, threshold) pair was
    /// already recorded. This is the reminder idempotency check.
    async fn has_renewal_reminder(
        &self,
        subscription_id: SubscriptionId,
        days_until: u32,
    ) -> Result<bool>;
    /// A pending renewal placeholder created after `since`, if any.
    async fn pending_renewal_since(
        &self,
        subscription_id: SubscriptionId,
        since: DateTime<Utc>,
    ) -> Result<Option<Transaction>>;
    /// Completed, hash-bearing renewal transactions whose earnings credit
    /// has not been applied and whose subscription is still due.
    async fn unsettled_completed_renewals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Transaction, Subscription)>>;

    // Reporting
    async fn notifications_for(&self, user_id: UserId) -> Result<Vec<Notification>>;
    async fn platform_earnings(&self) -> Result<Vec<PlatformEarning>>;
    /// Sum of `collected` earning rows: the platform's withdrawable balance.
    async fn collected_balance(&self) -> Result<Amount>;

    /// Apply a batch of ops atomically. On any violation the whole batch
    /// is discarded and the store is left untouched.
    async fn commit(&self, ops: Vec<LedgerOp>) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
struct Shelves {
    users: HashMap<UserId, User>,
    creators: HashMap<CreatorId, Creator>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    transactions: HashMap<TransactionId, Transaction>,
    hash_index: HashMap<TxHash, TransactionId>,
    earnings: HashMap<EarningId, PlatformEarning>,
    notifications: Vec<Notification>,
}

impl Shelves {
    fn index_hash(&mut self, tx: &Transaction) -> Result<()> {
        if let Some(hash) = &tx.tx_hash {
            if let Some(existing) = self.hash_index.get(hash) {
                if *existing != tx.id {
                    return Err(BillingError::DuplicatePayment(hash.clone()));
                }
            }
            self.hash_index.insert(hash.clone(), tx.id);
        }
        Ok(())
    }

    fn apply(&mut self, op: &LedgerOp) -> Result<()> {
        match op {
            LedgerOp::InsertUser(user) => {
                if self.users.contains_key(&user.id) {
                    return Err(BillingError::storage(format!(
                        "user {} already exists",
                        user.id
                    )));
                }
                self.users.insert(user.id, user.clone());
            }
            LedgerOp::InsertCreator(creator) => {
                if self.creators.contains_key(&creator.id) {
                    return Err(BillingError::storage(format!(
                        "creator {} already exists",
                        creator.id
                    )));
                }
                self.creators.insert(creator.id, creator.clone());
            }
            LedgerOp::InsertSubscription(sub) => {
                if self.subscriptions.contains_key(&sub.id) {
                    return Err(BillingError::storage(format!(
                        "subscription {} already exists",
                        sub.id
                    )));
                }
                self.subscriptions.insert(sub.id, sub.clone());
            }
            LedgerOp::UpdateSubscription(sub) => {
                if !self.subscriptions.contains_key(&sub.id) {
                    return Err(BillingError::NotFound(format!("subscription {}", sub.id)));
                }
                self.subscriptions.insert(sub.id, sub.clone());
            }
            LedgerOp::InsertTransaction(tx) => {
                if self.transactions.contains_key(&tx.id) {
                    return Err(BillingError::storage(format!(
                        "transaction {} already exists",
                        tx.id
                    )));
                }
                self.index_hash(tx)?;
                self.transactions.insert(tx.id, tx.clone());
            }
            LedgerOp::UpdateTransaction(tx) => {
                let previous = self
                    .transactions
                    .get(&tx.id)
                    .ok_or_else(|| BillingError::NotFound(format!("transaction {}", tx.id)))?;
                if let Some(old_hash) = &previous.tx_hash {
                    if previous.tx_hash != tx.tx_hash {
                        self.hash_index.remove(old_hash);
                    }
                }
                self.index_hash(tx)?;
                self.transactions.insert(tx.id, tx.clone());
            }
            LedgerOp::InsertEarning(earning) => {
                if self.earnings.contains_key(&earning.id) {
                    return Err(BillingError::storage(format!(
                        "earning {} already exists",
                        earning.id
                    )));
                }
                self.earnings.insert(earning.id, earning.clone());
            }
            LedgerOp::UpdateEarning(earning) => {
                if !self.earnings.contains_key(&earning.id) {
                    return Err(BillingError::NotFound(format!("earning {}", earning.id)));
                }
                self.earnings.insert(earning.id, earning.clone());
            }
            LedgerOp::InsertNotification(notification) => {
                self.notifications.push(notification.clone());
            }
            LedgerOp::AdjustCreator {
                creator_id,
                subscriber_delta,
                earnings_delta,
            } => {
                let creator = self
                    .creators
                    .get_mut(creator_id)
                    .ok_or_else(|| BillingError::NotFound(format!("creator {}", creator_id)))?;
                let count = creator.subscriber_count + subscriber_delta;
                if count < 0 {
                    return Err(BillingError::storage(format!(
                        "subscriber_count for creator {} would go negative",
                        creator_id
                    )));
                }
                creator.subscriber_count = count;
                creator.total_earnings = creator
                    .total_earnings
                    .checked_add(earnings_delta)
                    .ok_or(BillingError::Overflow)?;
            }
        }
        Ok(())
    }
}

/// In-memory ledger store.
///
/// A single mutex guards all shelves; `commit` stages the batch against a
/// copy and swaps it in, so a failing op can never leave partial state.
#[derive(Default)]
pub struct MemoryLedger {
    shelves: Mutex<Shelves>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shelves> {
        self.shelves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn user_by_wallet(&self, wallet: &str) -> Result<Option<User>> {
        Ok(self
            .lock()
            .users
            .values()
            .find(|u| u.wallet_address == wallet)
            .cloned())
    }

    async fn creator(&self, id: CreatorId) -> Result<Option<Creator>> {
        Ok(self.lock().creators.get(&id).cloned())
    }

    async fn creator_by_wallet(&self, wallet: &str) -> Result<Option<Creator>> {
        Ok(self
            .lock()
            .creators
            .values()
            .find(|c| c.wallet_address == wallet)
            .cloned())
    }

    async fn subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.lock().subscriptions.get(&id).cloned())
    }

    async fn live_subscription_for_pair(
        &self,
        subscriber_id: UserId,
        creator_id: CreatorId,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .find(|s| {
                s.subscriber_id == subscriber_id
                    && s.creator_id == creator_id
                    && s.status.is_live()
            })
            .cloned())
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        Ok(self.lock().transactions.get(&id).cloned())
    }

    async fn transaction_by_hash(&self, tx_hash: &TxHash) -> Result<Option<Transaction>> {
        let shelves = self.lock();
        Ok(shelves
            .hash_index
            .get(tx_hash)
            .and_then(|id| shelves.transactions.get(id))
            .cloned())
    }

    async fn transactions_for_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<Transaction>> {
        let mut txs: Vec<Transaction> = self
            .lock()
            .transactions
            .values()
            .filter(|t| t.subscription_id == Some(subscription_id))
            .cloned()
            .collect();
        txs.sort_by_key(|t| t.created_at);
        Ok(txs)
    }

    async fn subscriptions_for_creator(
        &self,
        creator_id: CreatorId,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.creator_id == creator_id)
            .cloned()
            .collect())
    }

    async fn subscriptions_due_on(&self, date: NaiveDate) -> Result<Vec<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Active && s.next_billing_at.date_naive() == date
            })
            .cloned()
            .collect())
    }

    async fn subscriptions_due_before(&self, at: DateTime<Utc>) -> Result<Vec<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.next_billing_at <= at)
            .cloned()
            .collect())
    }

    async fn subscriptions_overdue(&self, cutoff: DateTime<Utc>) -> Result<Vec<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.status.is_live() && s.next_billing_at < cutoff)
            .cloned()
            .collect())
    }

    async fn has_renewal_reminder(
        &self,
        subscription_id: SubscriptionId,
        days_until: u32,
    ) -> Result<bool> {
        Ok(self.lock().notifications.iter().any(|n| {
            matches!(
                &n.kind,
                NotificationKind::RenewalReminder {
                    subscription_id: sid,
                    days_until: days,
                    ..
                } if *sid == subscription_id && *days == days_until
            )
        }))
    }

    async fn pending_renewal_since(
        &self,
        subscription_id: SubscriptionId,
        since: DateTime<Utc>,
    ) -> Result<Option<Transaction>> {
        Ok(self
            .lock()
            .transactions
            .values()
            .find(|t| {
                t.subscription_id == Some(subscription_id)
                    && t.kind == TransactionKind::Renewal
                    && t.status == TransactionStatus::Pending
                    && t.created_at > since
            })
            .cloned())
    }

    async fn unsettled_completed_renewals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Transaction, Subscription)>> {
        let shelves = self.lock();
        let mut due = Vec::new();
        for tx in shelves.transactions.values() {
            if tx.kind != TransactionKind::Renewal
                || tx.status != TransactionStatus::Completed
                || tx.tx_hash.is_none()
                || tx.settled_at.is_some()
            {
                continue;
            }
            let Some(sub_id) = tx.subscription_id else {
                continue;
            };
            if let Some(sub) = shelves.subscriptions.get(&sub_id) {
                if sub.next_billing_at <= now && !sub.status.is_terminal() {
                    due.push((tx.clone(), sub.clone()));
                }
            }
        }
        Ok(due)
    }

    async fn notifications_for(&self, user_id: UserId) -> Result<Vec<Notification>> {
        Ok(self
            .lock()
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn platform_earnings(&self) -> Result<Vec<PlatformEarning>> {
        let mut earnings: Vec<PlatformEarning> = self.lock().earnings.values().cloned().collect();
        earnings.sort_by_key(|e| e.created_at);
        Ok(earnings)
    }

    async fn collected_balance(&self) -> Result<Amount> {
        Ok(self
            .lock()
            .earnings
            .values()
            .filter(|e| e.status == EarningStatus::Collected)
            .fold(Amount::zero(), |acc, e| acc.saturating_add(&e.amount)))
    }

    async fn commit(&self, ops: Vec<LedgerOp>) -> Result<()> {
        let mut shelves = self.lock();
        let mut staged = shelves.clone();
        for op in &ops {
            staged.apply(op)?;
        }
        *shelves = staged;
        Ok(())
    }
}
