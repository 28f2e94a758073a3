//! # patronpay: Billing Reconciliation Engine
//!
//! Reconciles an external, append-only chain payment ledger with an
//! internal relational model of subscriptions, billing cycles, and
//! creator earnings. Every on-chain payment is credited exactly once:
//! the `tx_hash` uniqueness constraint in the [`store::LedgerStore`] is
//! the system-wide idempotency key, and every mutation is one atomic
//! commit batch.
//!
//! Payments reach the ledger through exactly one choke point, the
//! [`engine::ReconciliationEngine`], whether they arrive as a signed
//! webhook event ([`ingest`]), a client-submitted hash, or a
//! worker-generated renewal ([`worker`]). Time-driven transitions with no
//! corresponding payment (reminders, grace-period expiry) belong to the
//! [`worker::RenewalWorker`].

pub mod amount;
pub mod config;
pub mod engine;
pub mod ingest;
pub mod journal;
pub mod model;
pub mod notify;
pub mod store;
pub mod verify;
pub mod worker;

pub use amount::Amount;
pub use config::BillingConfig;
pub use engine::{ReconciliationEngine, SettledPayment, TipReceipt, Withdrawal};
pub use ingest::{IngestOutcome, PaymentEvent, PaymentIngest};
pub use journal::JournalLedger;
pub use model::{
    Creator, CreatorId, EarningStatus, FeeKind, Notification, NotificationKind, PlatformEarning,
    Subscription, SubscriptionId, SubscriptionStatus, TierId, Transaction, TransactionId,
    TransactionKind, TransactionStatus, TxHash, User, UserId,
};
pub use notify::{ConnectionRegistry, NotificationSink, NullSink};
pub use store::{LedgerOp, LedgerStore, MemoryLedger};
pub use verify::{ChainVerifier, Expected, PaymentDetails, Verification};
pub use worker::{RenewalWorker, WorkerReport};

pub type Result<T, E = BillingError> = std::result::Result<T, E>;

/// Error taxonomy of the reconciliation engine.
///
/// Each variant carries a stable machine-readable kind (see
/// [`BillingError::kind`]) so callers can surface structured errors
/// without string matching.
#[derive(thiserror::Error, Debug)]
pub enum BillingError {
    #[error("already subscribed to this creator")]
    AlreadySubscribed,
    #[error("transaction already processed: {0}")]
    DuplicatePayment(model::TxHash),
    #[error("subscription is not active")]
    NotActive,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("recipient is not a registered creator")]
    UnknownCreator,
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("invalid transaction hash: {0}")]
    InvalidTxHash(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("chain verification failed: {0}")]
    ChainRejected(String),
    #[error("insufficient platform balance")]
    InsufficientBalance,
    #[error("arithmetic overflow")]
    Overflow,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl BillingError {
    pub(crate) fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(anyhow::anyhow!(msg.into()))
    }

    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadySubscribed => "already_subscribed",
            Self::DuplicatePayment(_) => "duplicate_payment",
            Self::NotActive => "not_active",
            Self::NotFound(_) => "not_found",
            Self::UnknownCreator => "unknown_creator",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidTxHash(_) => "invalid_tx_hash",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Unauthorized => "unauthorized",
            Self::ChainRejected(_) => "chain_rejected",
            Self::InsufficientBalance => "insufficient_balance",
            Self::Overflow => "overflow",
            Self::Storage(_) => "storage",
        }
    }
}
