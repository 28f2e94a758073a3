//! Durable ledger store backed by an append-only batch journal.
//!
//! Each committed batch is one JSON line, written under an `fs2`
//! exclusive file lock and replayed on open. Writing whole batches keeps
//! the on-disk history atomic at the same granularity as
//! [`LedgerStore::commit`]: a batch is either fully journaled or absent.

use crate::model::{
    Creator, CreatorId, Notification, PlatformEarning, Subscription, SubscriptionId, Transaction,
    TransactionId, TxHash, User, UserId,
};
use crate::store::{LedgerOp, LedgerStore, MemoryLedger};
use crate::{Amount, BillingError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct JournalLedger {
    inner: MemoryLedger,
    path: PathBuf,
    file: Mutex<File>,
}

impl JournalLedger {
    /// Open (or create) a journal at `path` and replay its batches.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BillingError::storage(format!("create journal dir: {}", e)))?;
        }

        let inner = MemoryLedger::new();
        if path.exists() {
            let file = File::open(&path)
                .map_err(|e| BillingError::storage(format!("open journal: {}", e)))?;
            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line =
                    line.map_err(|e| BillingError::storage(format!("read journal: {}", e)))?;
                if line.trim().is_empty() {
                    continue;
                }
                let ops: Vec<LedgerOp> = serde_json::from_str(&line).map_err(|e| {
                    BillingError::storage(format!("journal line {} corrupt: {}", line_no + 1, e))
                })?;
                inner.commit(ops).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BillingError::storage(format!("open journal for append: {}", e)))?;

        Ok(Self {
            inner,
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.lock_exclusive()
            .map_err(|e| BillingError::storage(format!("lock journal: {}", e)))?;
        let written = file
            .write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_data());
        file.unlock()
            .map_err(|e| BillingError::storage(format!("unlock journal: {}", e)))?;
        written.map_err(|e| BillingError::storage(format!("append journal: {}", e)))
    }
}

#[async_trait]
impl LedgerStore for JournalLedger {
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

    async fn subscriptions_due_on(&self, date: NaiveDate) -> Result<Vec<Subscription>> {
        self.inner.subscriptions_due_on(date).await
    }

    async fn subscriptions_due_before(&self, at: DateTime<Utc>) -> Result<Vec<Subscription>> {
        self.inner.subscriptions_due_before(at).await
    }

    async fn subscriptions_overdue(&self, cutoff: DateTime<Utc>) -> Result<Vec<Subscription>> {
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
        let line = serde_json::to_string(&ops)
            .map_err(|e| BillingError::storage(format!("serialize batch: {}", e)))?;

        // Validate against memory first so a rejected batch never reaches
        // the journal; replay must only ever see applicable batches.
        self.inner.commit(ops).await?;

        if let Err(e) = self.append(&line) {
            tracing::error!(path = %self.path.display(), error = %e, "journal append failed; on-disk history is behind memory");
            return Err(e);
        }
        Ok(())
    }
}
