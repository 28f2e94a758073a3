//! The Reconciliation API: the single choke point converting payments
//! into ledger mutations.
//!
//! Every operation executes as one atomic [`LedgerOp`] batch. Duplicate
//! `tx_hash` submissions resolve to the existing rows instead of erroring
//! so at-least-once delivery from the webhook is safe; when two calls
//! race, the commit loser observes the store's uniqueness violation and
//! fetches the winner's row.

use crate::config::BillingConfig;
use crate::model::{
    Creator, FeeKind, Notification, NotificationKind, PlatformEarning, Subscription,
    SubscriptionId, SubscriptionStatus, Transaction, TransactionKind, TransactionStatus, TxHash,
    UserId,
};
use crate::notify::NotificationSink;
use crate::store::{LedgerOp, LedgerStore};
use crate::verify::{ChainVerifier, Expected, Verification};
use crate::{Amount, BillingError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Result of settling a subscription or renewal payment.
///
/// `reused` is true when the hash had already been recorded and the
/// existing rows were returned (success-by-idempotence).
#[derive(Debug, Clone)]
pub struct SettledPayment {
    pub subscription: Subscription,
    pub transaction: Transaction,
    pub reused: bool,
}

/// Result of recording a tip.
///
/// `reused` is true when the hash had already been recorded and the
/// existing row was returned.
#[derive(Debug, Clone)]
pub struct TipReceipt {
    pub transaction: Transaction,
    pub reused: bool,
}

/// Result of a platform fee withdrawal.
#[derive(Debug, Clone)]
pub struct Withdrawal {
    /// Payout transaction, absent when no earning row fit the request.
    pub transaction: Option<Transaction>,
    pub amount: Amount,
    pub earnings: Vec<PlatformEarning>,
}

pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    sink: Arc<dyn NotificationSink>,
    verifier: Option<Arc<dyn ChainVerifier>>,
    config: BillingConfig,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sink: Arc<dyn NotificationSink>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            sink,
            verifier: None,
            config,
        }
    }

    /// Attach a chain verifier; client-submitted hashes are then checked
    /// against the expected recipient and amount before crediting.
    pub fn with_verifier(mut self, verifier: Arc<dyn ChainVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Advance a billing clock by one period.
    pub fn next_period(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        self.config.next_billing_after(from)
    }

    /// Record the first payment of a new subscription.
    pub async fn record_subscription_payment(
        &self,
        subscriber_id: UserId,
        creator_id: crate::model::CreatorId,
        tier_id: Option<crate::model::TierId>,
        gross: Amount,
        tx_hash: TxHash,
    ) -> Result<SettledPayment> {
        if !gross.is_positive() {
            return Err(BillingError::InvalidAmount(gross.to_string()));
        }
        let creator = self
            .store
            .creator(creator_id)
            .await?
            .ok_or(BillingError::UnknownCreator)?;
        if self.store.user(subscriber_id).await?.is_none() {
            return Err(BillingError::NotFound(format!("user {}", subscriber_id)));
        }

        if self.store.transaction_by_hash(&tx_hash).await?.is_some() {
            tracing::debug!(%tx_hash, "duplicate subscription payment resolved idempotently");
            return self.existing_settlement(&tx_hash).await;
        }

        if self
            .store
            .live_subscription_for_pair(subscriber_id, creator_id)
            .await?
            .is_some()
        {
            // The hash may have landed between the lookup above and this
            // check; a duplicate is still success-by-idempotence.
            if self.store.transaction_by_hash(&tx_hash).await?.is_some() {
                return self.existing_settlement(&tx_hash).await;
            }
            return Err(BillingError::AlreadySubscribed);
        }

        self.verify_on_chain(&tx_hash, &creator, gross).await?;

        let now = Utc::now();
        let (fee, net) = self.config.fee_split(gross);
        let subscription = Subscription::new(
            subscriber_id,
            creator_id,
            tier_id,
            gross,
            self.next_period(now),
        );
        let mut transaction = Transaction::new(
            TransactionKind::Subscription,
            creator.user_id,
            gross,
            fee,
        )
        .with_sender(subscriber_id)
        .with_subscription(subscription.id)
        .with_hash(tx_hash.clone())
        .completed();
        transaction.settled_at = Some(now);

        let mut ops = vec![
            LedgerOp::InsertSubscription(subscription.clone()),
            LedgerOp::InsertTransaction(transaction.clone()),
            LedgerOp::AdjustCreator {
                creator_id,
                subscriber_delta: 1,
                earnings_delta: net,
            },
        ];
        if fee.is_positive() {
            ops.push(LedgerOp::InsertEarning(PlatformEarning::collected(
                transaction.id,
                fee,
                FeeKind::SubscriptionFee,
            )));
        }
        ops.push(LedgerOp::InsertNotification(Notification::new(
            creator.user_id,
            "New Subscriber!",
            format!("You have a new subscriber! They paid {} XLM.", gross),
            NotificationKind::NewSubscriber {
                subscription_id: subscription.id,
                amount: gross,
            },
        )));

        match self.store.commit(ops).await {
            Ok(()) => {}
            Err(BillingError::DuplicatePayment(_)) => {
                // Lost the insert race; the winner's rows are authoritative.
                return self.existing_settlement(&tx_hash).await;
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            subscription = %subscription.id,
            creator = %creator_id,
            amount = %gross,
            "subscription created"
        );
        self.push(
            creator.user_id,
            NotificationKind::NewSubscriber {
                subscription_id: subscription.id,
                amount: gross,
            },
        )
        .await;

        Ok(SettledPayment {
            subscription,
            transaction,
            reused: false,
        })
    }

    /// Record a renewal payment, extending the billing clock by one
    /// period and clearing `past_due`.
    ///
    /// When the worker already created a pending renewal placeholder, the
    /// hash is attached to it and its stored fee stays authoritative;
    /// otherwise a fresh completed renewal row is inserted.
    pub async fn record_renewal_payment(
        &self,
        subscription_id: SubscriptionId,
        caller: UserId,
        tx_hash: TxHash,
    ) -> Result<SettledPayment> {
        let subscription = self
            .store
            .subscription(subscription_id)
            .await?
            .filter(|s| s.subscriber_id == caller)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))?;
        if subscription.status.is_terminal() {
            return Err(BillingError::NotActive);
        }
        let creator = self
            .store
            .creator(subscription.creator_id)
            .await?
            .ok_or(BillingError::UnknownCreator)?;

        if let Some(existing) = self.store.transaction_by_hash(&tx_hash).await? {
            if existing.subscription_id == Some(subscription_id) {
                tracing::debug!(%tx_hash, "duplicate renewal payment resolved idempotently");
                return Ok(SettledPayment {
                    subscription,
                    transaction: existing,
                    reused: true,
                });
            }
            return Err(BillingError::DuplicatePayment(tx_hash));
        }

        self.verify_on_chain(&tx_hash, &creator, subscription.amount)
            .await?;

        let now = Utc::now();
        // A placeholder already carrying a different client-registered
        // hash belongs to that payment; leave it for the webhook and
        // insert a fresh row instead of overwriting the hash.
        let pending = self
            .store
            .pending_renewal_since(subscription_id, DateTime::<Utc>::MIN_UTC)
            .await?
            .filter(|p| p.tx_hash.is_none() || p.tx_hash.as_ref() == Some(&tx_hash));

        let (transaction, transaction_op) = match pending {
            Some(mut placeholder) => {
                placeholder.tx_hash = Some(tx_hash.clone());
                placeholder.status = TransactionStatus::Completed;
                placeholder.settled_at = Some(now);
                placeholder.updated_at = now;
                (placeholder.clone(), LedgerOp::UpdateTransaction(placeholder))
            }
            None => {
                let (fee, _) = self.config.fee_split(subscription.amount);
                let mut tx = Transaction::new(
                    TransactionKind::Renewal,
                    creator.user_id,
                    subscription.amount,
                    fee,
                )
                .with_sender(caller)
                .with_subscription(subscription_id)
                .with_hash(tx_hash.clone())
                .completed();
                tx.settled_at = Some(now);
                (tx.clone(), LedgerOp::InsertTransaction(tx))
            }
        };
        let fee = transaction.platform_fee;
        let net = transaction.net_amount();

        let mut renewed = subscription.clone();
        renewed.status = SubscriptionStatus::Active;
        renewed.next_billing_at = self.next_period(now);
        renewed.updated_at = now;

        let mut ops = vec![
            LedgerOp::UpdateSubscription(renewed.clone()),
            transaction_op,
            LedgerOp::AdjustCreator {
                creator_id: creator.id,
                subscriber_delta: 0,
                earnings_delta: net,
            },
        ];
        if fee.is_positive() {
            ops.push(LedgerOp::InsertEarning(PlatformEarning::collected(
                transaction.id,
                fee,
                FeeKind::RenewalFee,
            )));
        }

        match self.store.commit(ops).await {
            Ok(()) => {}
            Err(BillingError::DuplicatePayment(_)) => {
                return self.existing_settlement(&tx_hash).await;
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            subscription = %subscription_id,
            next_billing_at = %renewed.next_billing_at,
            "subscription renewed"
        );
        Ok(SettledPayment {
            subscription: renewed,
            transaction,
            reused: false,
        })
    }

    /// Attach a client-submitted hash to the pending renewal placeholder
    /// without settling it.
    ///
    /// The transaction stays `pending` until the webhook confirms the
    /// hash on-chain; the worker's apply phase then advances the billing
    /// clock and credits earnings. This is the asynchronous counterpart
    /// of [`record_renewal_payment`](Self::record_renewal_payment).
    pub async fn register_renewal_hash(
        &self,
        subscription_id: SubscriptionId,
        caller: UserId,
        tx_hash: TxHash,
    ) -> Result<Transaction> {
        let subscription = self
            .store
            .subscription(subscription_id)
            .await?
            .filter(|s| s.subscriber_id == caller)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))?;
        if subscription.status.is_terminal() {
            return Err(BillingError::NotActive);
        }

        if let Some(existing) = self.store.transaction_by_hash(&tx_hash).await? {
            if existing.subscription_id == Some(subscription_id) {
                return Ok(existing);
            }
            return Err(BillingError::DuplicatePayment(tx_hash));
        }

        let mut placeholder = self
            .store
            .pending_renewal_since(subscription_id, DateTime::<Utc>::MIN_UTC)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "pending renewal for subscription {}",
                    subscription_id
                ))
            })?;
        placeholder.tx_hash = Some(tx_hash.clone());
        placeholder.updated_at = Utc::now();

        match self
            .store
            .commit(vec![LedgerOp::UpdateTransaction(placeholder.clone())])
            .await
        {
            Ok(()) => {}
            Err(BillingError::DuplicatePayment(_)) => {
                return self
                    .store
                    .transaction_by_hash(&tx_hash)
                    .await?
                    .filter(|t| t.subscription_id == Some(subscription_id))
                    .ok_or(BillingError::DuplicatePayment(tx_hash));
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            subscription = %subscription_id,
            %tx_hash,
            "renewal hash registered on pending transaction"
        );
        Ok(placeholder)
    }

    /// Record a one-off tip to a creator. A hash that was already
    /// processed returns the existing row with `reused` set.
    pub async fn record_tip(
        &self,
        sender_id: Option<UserId>,
        creator_id: crate::model::CreatorId,
        amount: Amount,
        tx_hash: TxHash,
        message: Option<String>,
    ) -> Result<TipReceipt> {
        if !amount.is_positive() {
            return Err(BillingError::InvalidAmount(amount.to_string()));
        }
        let creator = self
            .store
            .creator(creator_id)
            .await?
            .ok_or(BillingError::UnknownCreator)?;

        if let Some(existing) = self.store.transaction_by_hash(&tx_hash).await? {
            tracing::debug!(%tx_hash, "duplicate tip resolved idempotently");
            return Ok(TipReceipt {
                transaction: existing,
                reused: true,
            });
        }

        self.verify_on_chain(&tx_hash, &creator, amount).await?;

        let sender_name = match sender_id {
            Some(id) => self
                .store
                .user(id)
                .await?
                .map(|u| u.display_name)
                .unwrap_or_else(|| "Someone".to_string()),
            None => "Someone".to_string(),
        };

        let now = Utc::now();
        let (fee, net) = self.config.fee_split(amount);
        let mut transaction =
            Transaction::new(TransactionKind::Tip, creator.user_id, amount, fee)
                .with_hash(tx_hash.clone())
                .completed();
        if let Some(sender) = sender_id {
            transaction = transaction.with_sender(sender);
        }
        if let Some(ref text) = message {
            transaction = transaction.with_memo(text.clone());
        }
        transaction.settled_at = Some(now);

        let tip_event = NotificationKind::TipReceived {
            transaction_id: transaction.id,
            amount,
            message: message.clone(),
        };
        let mut ops = vec![
            LedgerOp::InsertTransaction(transaction.clone()),
            LedgerOp::AdjustCreator {
                creator_id,
                subscriber_delta: 0,
                earnings_delta: net,
            },
        ];
        if fee.is_positive() {
            ops.push(LedgerOp::InsertEarning(PlatformEarning::collected(
                transaction.id,
                fee,
                FeeKind::TipFee,
            )));
        }
        ops.push(LedgerOp::InsertNotification(Notification::new(
            creator.user_id,
            "Tip Received!",
            format!("{} sent you {} XLM tip!", sender_name, amount),
            tip_event.clone(),
        )));

        match self.store.commit(ops).await {
            Ok(()) => {}
            Err(BillingError::DuplicatePayment(_)) => {
                // Another path recorded this hash first; return its row.
                let existing = self
                    .store
                    .transaction_by_hash(&tx_hash)
                    .await?
                    .ok_or(BillingError::DuplicatePayment(tx_hash))?;
                return Ok(TipReceipt {
                    transaction: existing,
                    reused: true,
                });
            }
            Err(e) => return Err(e),
        }

        tracing::info!(creator = %creator_id, amount = %amount, "tip recorded");
        self.push(creator.user_id, tip_event).await;
        Ok(TipReceipt {
            transaction,
            reused: false,
        })
    }

    /// Cancel an active subscription. Terminal; nothing resurrects it.
    pub async fn cancel_subscription(
        &self,
        subscription_id: SubscriptionId,
        caller: UserId,
        reason: Option<String>,
    ) -> Result<Subscription> {
        let subscription = self
            .store
            .subscription(subscription_id)
            .await?
            .filter(|s| s.subscriber_id == caller)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))?;
        if subscription.status != SubscriptionStatus::Active {
            return Err(BillingError::NotActive);
        }
        let creator = self
            .store
            .creator(subscription.creator_id)
            .await?
            .ok_or(BillingError::UnknownCreator)?;

        let now = Utc::now();
        let mut cancelled = subscription;
        cancelled.status = SubscriptionStatus::Cancelled;
        cancelled.cancelled_at = Some(now);
        cancelled.updated_at = now;

        let event = NotificationKind::SubscriptionCancelled {
            subscription_id,
            reason: reason.clone(),
        };
        self.store
            .commit(vec![
                LedgerOp::UpdateSubscription(cancelled.clone()),
                LedgerOp::AdjustCreator {
                    creator_id: creator.id,
                    subscriber_delta: -1,
                    earnings_delta: Amount::zero(),
                },
                LedgerOp::InsertNotification(Notification::new(
                    creator.user_id,
                    "Subscription Cancelled",
                    "A subscriber has cancelled their subscription.",
                    event.clone(),
                )),
            ])
            .await?;

        tracing::info!(subscription = %subscription_id, "subscription cancelled");
        self.push(creator.user_id, event).await;
        Ok(cancelled)
    }

    /// Transition a pending transaction to completed once its hash is
    /// confirmed on-chain (webhook path).
    ///
    /// Returns `None` when no row carries the hash. Completing a renewal
    /// placeholder does NOT advance the subscription's billing clock;
    /// that reconciliation belongs to the worker's completed-renewal
    /// phase, which also credits the earnings.
    pub async fn confirm_payment(
        &self,
        tx_hash: &TxHash,
        observed_amount: Option<Amount>,
    ) -> Result<Option<(Transaction, bool)>> {
        let Some(transaction) = self.store.transaction_by_hash(tx_hash).await? else {
            return Ok(None);
        };

        if transaction.status != TransactionStatus::Pending {
            tracing::debug!(%tx_hash, "confirmation for non-pending transaction ignored");
            return Ok(Some((transaction, false)));
        }

        if let Some(observed) = observed_amount {
            if observed != transaction.amount {
                tracing::warn!(
                    %tx_hash,
                    expected = %transaction.amount,
                    observed = %observed,
                    "confirmed amount differs from pending row; stored amount kept"
                );
            }
        }

        let mut confirmed = transaction;
        confirmed.status = TransactionStatus::Completed;
        confirmed.updated_at = Utc::now();

        self.store
            .commit(vec![LedgerOp::UpdateTransaction(confirmed.clone())])
            .await?;
        tracing::info!(%tx_hash, transaction = %confirmed.id, "pending transaction confirmed");

        if let Some(sender) = confirmed.sender_id {
            self.push(
                sender,
                NotificationKind::TransactionConfirmed {
                    transaction_id: confirmed.id,
                    tx_hash: tx_hash.clone(),
                },
            )
            .await;
        }
        self.push(
            confirmed.recipient_id,
            NotificationKind::PaymentReceived {
                transaction_id: confirmed.id,
                amount: confirmed.amount,
                tx_hash: tx_hash.clone(),
            },
        )
        .await;

        Ok(Some((confirmed, true)))
    }

    /// Withdraw collected platform fees to an operator account.
    ///
    /// Earning rows are indivisible: the oldest collected rows are
    /// flipped while their running total stays within the request, and a
    /// payout transaction is recorded for the flipped total.
    pub async fn withdraw_platform_fees(
        &self,
        recipient: UserId,
        requested: Amount,
    ) -> Result<Withdrawal> {
        if !requested.is_positive() {
            return Err(BillingError::InvalidAmount(requested.to_string()));
        }
        let balance = self.store.collected_balance().await?;
        if balance < requested {
            return Err(BillingError::InsufficientBalance);
        }

        let mut selected = Vec::new();
        let mut total = Amount::zero();
        for earning in self.store.platform_earnings().await? {
            if earning.status != crate::model::EarningStatus::Collected {
                continue;
            }
            let Some(next) = total.checked_add(&earning.amount) else {
                break;
            };
            if next > requested {
                continue;
            }
            total = next;
            selected.push(earning);
        }

        if selected.is_empty() {
            return Ok(Withdrawal {
                transaction: None,
                amount: Amount::zero(),
                earnings: Vec::new(),
            });
        }

        let payout = Transaction::new(
            TransactionKind::Payout,
            recipient,
            total,
            Amount::zero(),
        )
        .with_memo("Platform fee withdrawal");

        let mut ops: Vec<LedgerOp> = selected
            .iter()
            .map(|e| {
                let mut withdrawn = e.clone();
                withdrawn.status = crate::model::EarningStatus::Withdrawn;
                LedgerOp::UpdateEarning(withdrawn)
            })
            .collect();
        ops.push(LedgerOp::InsertTransaction(payout.clone()));
        self.store.commit(ops).await?;

        tracing::info!(amount = %total, rows = selected.len(), "platform fees withdrawn");
        Ok(Withdrawal {
            transaction: Some(payout),
            amount: total,
            earnings: selected,
        })
    }

    async fn verify_on_chain(
        &self,
        tx_hash: &TxHash,
        creator: &Creator,
        amount: Amount,
    ) -> Result<()> {
        let Some(verifier) = &self.verifier else {
            return Ok(());
        };
        let expected = Expected::to_wallet(creator.wallet_address.clone()).with_amount(amount);
        match verifier.verify(tx_hash, &expected).await? {
            Verification::Valid(_) => Ok(()),
            Verification::Invalid { reason } => Err(BillingError::ChainRejected(reason)),
        }
    }

    /// Fetch the rows recorded by whichever call won the hash race.
    async fn existing_settlement(&self, tx_hash: &TxHash) -> Result<SettledPayment> {
        let transaction = self
            .store
            .transaction_by_hash(tx_hash)
            .await?
            .ok_or_else(|| BillingError::DuplicatePayment(tx_hash.clone()))?;
        let subscription = match transaction.subscription_id {
            Some(id) => self.store.subscription(id).await?,
            None => None,
        };
        match subscription {
            Some(subscription) => Ok(SettledPayment {
                subscription,
                transaction,
                reused: true,
            }),
            None => Err(BillingError::DuplicatePayment(tx_hash.clone())),
        }
    }

    async fn push(&self, user_id: UserId, event: NotificationKind) {
        if let Err(e) = self.sink.notify(user_id, &event).await {
            tracing::warn!(user = %user_id, error = %e, "notification delivery failed");
        }
    }
}
