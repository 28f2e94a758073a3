//! Domain records for the billing ledger.
//!
//! Everything here is a plain serializable value. Mutation happens only
//! through [`crate::store::LedgerStore::commit`], driven by the
//! reconciliation engine and the renewal worker.

use crate::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id!(UserId);
entity_id!(CreatorId);
entity_id!(TierId);
entity_id!(SubscriptionId);
entity_id!(TransactionId);
entity_id!(EarningId);
entity_id!(NotificationId);

/// Hash of a confirmed payment on the external ledger.
///
/// This is the system's idempotency key: the store enforces global
/// uniqueness, so two ingestion attempts for the same chain payment
/// collapse into one transaction row. Always 64 hex characters,
/// normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.len() != 64 {
            return Err(format!("expected 64 hex characters, got {}", s.len()));
        }
        if hex::decode(s).is_err() {
            return Err("not a valid hex string".to_string());
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TxHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A platform account holding a wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub wallet_address: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(wallet_address: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            wallet_address: wallet_address.into(),
            display_name: display_name.into(),
            created_at: Utc::now(),
        }
    }
}

/// A creator profile with denormalized aggregates.
///
/// `subscriber_count` and `total_earnings` must always equal the count of
/// active subscriptions referencing the creator and the sum of net credit
/// over completed transactions crediting them. They are adjusted only
/// inside the same ledger commit that changes the underlying rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creator {
    pub id: CreatorId,
    pub user_id: UserId,
    pub wallet_address: String,
    pub display_name: String,
    pub subscriber_count: i64,
    pub total_earnings: Amount,
    pub created_at: DateTime<Utc>,
}

impl Creator {
    pub fn new(user: &User) -> Self {
        Self {
            id: CreatorId::new(),
            user_id: user.id,
            wallet_address: user.wallet_address.clone(),
            display_name: user.display_name.clone(),
            subscriber_count: 0,
            total_earnings: Amount::zero(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// Live statuses hold the (subscriber, creator) uniqueness slot.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::PastDue)
    }

    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A recurring payment agreement between a subscriber and a creator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub subscriber_id: UserId,
    pub creator_id: CreatorId,
    pub tier_id: Option<TierId>,
    pub amount: Amount,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    pub next_billing_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        subscriber_id: UserId,
        creator_id: CreatorId,
        tier_id: Option<TierId>,
        amount: Amount,
        next_billing_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriptionId::new(),
            subscriber_id,
            creator_id,
            tier_id,
            amount,
            status: SubscriptionStatus::Active,
            started_at: now,
            next_billing_at,
            cancelled_at: None,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Subscription,
    Renewal,
    Tip,
    Refund,
    Payout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

/// One ledger movement, gross of the platform fee.
///
/// `tx_hash` is null only for worker-generated pending renewal
/// placeholders that have not been paid yet. `platform_fee` is computed
/// once when the row is created and is authoritative thereafter, even if
/// the configured fee percentage changes. `settled_at` marks that the
/// earnings credit for a completed renewal has been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub sender_id: Option<UserId>,
    pub recipient_id: UserId,
    pub subscription_id: Option<SubscriptionId>,
    pub kind: TransactionKind,
    pub amount: Amount,
    pub platform_fee: Amount,
    pub tx_hash: Option<TxHash>,
    pub status: TransactionStatus,
    pub memo: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        kind: TransactionKind,
        recipient_id: UserId,
        amount: Amount,
        platform_fee: Amount,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::new(),
            sender_id: None,
            recipient_id,
            subscription_id: None,
            kind,
            amount,
            platform_fee,
            tx_hash: None,
            status: TransactionStatus::Pending,
            memo: None,
            settled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_sender(mut self, sender_id: UserId) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    pub fn with_subscription(mut self, subscription_id: SubscriptionId) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    pub fn with_hash(mut self, tx_hash: TxHash) -> Self {
        self.tx_hash = Some(tx_hash);
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn completed(mut self) -> Self {
        self.status = TransactionStatus::Completed;
        self
    }

    /// Amount credited to the recipient: gross minus platform fee.
    pub fn net_amount(&self) -> Amount {
        self.amount
            .checked_sub(&self.platform_fee)
            .unwrap_or_else(Amount::zero)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeKind {
    SubscriptionFee,
    RenewalFee,
    TipFee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarningStatus {
    Collected,
    Withdrawn,
}

/// Platform fee collected from one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformEarning {
    pub id: EarningId,
    pub transaction_id: TransactionId,
    pub amount: Amount,
    pub fee_kind: FeeKind,
    pub status: EarningStatus,
    pub created_at: DateTime<Utc>,
}

impl PlatformEarning {
    pub fn collected(transaction_id: TransactionId, amount: Amount, fee_kind: FeeKind) -> Self {
        Self {
            id: EarningId::new(),
            transaction_id,
            amount,
            fee_kind,
            status: EarningStatus::Collected,
            created_at: Utc::now(),
        }
    }
}

/// Structured payload of a user-facing event.
///
/// Each variant carries exactly the fields its consumers inspect; the
/// reminder-deduplication lookup reads `subscription_id` and `days_until`
/// from `RenewalReminder` without touching untyped JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    NewSubscriber {
        subscription_id: SubscriptionId,
        amount: Amount,
    },
    RenewalReminder {
        subscription_id: SubscriptionId,
        creator_id: CreatorId,
        amount: Amount,
        days_until: u32,
        next_billing_at: DateTime<Utc>,
    },
    RenewalDue {
        subscription_id: SubscriptionId,
        transaction_id: TransactionId,
        amount: Amount,
    },
    SubscriptionExpired {
        subscription_id: SubscriptionId,
        creator_id: CreatorId,
    },
    SubscriptionCancelled {
        subscription_id: SubscriptionId,
        reason: Option<String>,
    },
    TipReceived {
        transaction_id: TransactionId,
        amount: Amount,
        message: Option<String>,
    },
    TransactionConfirmed {
        transaction_id: TransactionId,
        tx_hash: TxHash,
    },
    PaymentReceived {
        transaction_id: TransactionId,
        amount: Amount,
        tx_hash: TxHash,
    },
}

/// Append-only record of a user-facing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: UserId,
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationKind,
    ) -> Self {
        Self {
            id: NotificationId::new(),
            user_id,
            title: title.into(),
            message: message.into(),
            kind,
            created_at: Utc::now(),
        }
    }
}
