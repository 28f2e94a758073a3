//! Webhook ingestion of confirmed chain payments.
//!
//! A chain watcher POSTs payment events signed with HMAC-SHA256 over the
//! raw body. Verification happens before parsing; a mis-signed body is
//! rejected without touching the ledger (when no secret is configured,
//! verification is skipped with a warning, for development only). Only
//! successful native-asset payments are processed. Events whose hash
//! matches a pending transaction confirm it; payments to a creator
//! wallet with no matching row are recorded as tips; everything else is
//! acknowledged and ignored so the watcher never retries unprocessable
//! events forever.

use crate::engine::ReconciliationEngine;
use crate::model::{Transaction, TxHash};
use crate::{Amount, BillingError, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Payment event as delivered by the chain watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub transaction_successful: bool,
    pub source_account: String,
    pub asset_type: String,
    pub from: String,
    pub to: String,
    pub amount: String,
    pub transaction_hash: String,
}

/// What ingestion did with an event.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// A pending transaction matched the hash and was completed.
    Confirmed(Transaction),
    /// No row matched; the payment was recorded as a tip to the creator
    /// owning the destination wallet.
    TipRecorded(Transaction),
    /// The hash was already settled; redelivery acknowledged.
    AlreadyProcessed(Transaction),
    /// Valid event with nothing for us in it.
    Ignored { reason: String },
}

pub struct PaymentIngest {
    engine: Arc<ReconciliationEngine>,
}

impl PaymentIngest {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self { engine }
    }

    /// Check the watcher's HMAC-SHA256 signature (hex) over the raw body.
    /// With no webhook secret configured the check is skipped entirely
    /// (development mode).
    pub fn verify_signature(&self, body: &[u8], signature_hex: Option<&str>) -> Result<()> {
        let Some(secret) = &self.engine.config().webhook_secret else {
            tracing::warn!("no webhook secret configured; signature verification skipped");
            return Ok(());
        };
        let signature = signature_hex.ok_or(BillingError::Unauthorized)?;
        let sig = hex::decode(signature).map_err(|_| BillingError::Unauthorized)?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| BillingError::Unauthorized)?;
        mac.update(body);
        mac.verify_slice(&sig).map_err(|_| BillingError::Unauthorized)
    }

    /// Verify, parse, and apply one webhook delivery.
    pub async fn ingest(&self, body: &[u8], signature_hex: Option<&str>) -> Result<IngestOutcome> {
        self.verify_signature(body, signature_hex)?;

        let event: PaymentEvent = serde_json::from_slice(body)
            .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;
        self.apply(event).await
    }

    /// Apply an already-authenticated event.
    pub async fn apply(&self, event: PaymentEvent) -> Result<IngestOutcome> {
        if !event.transaction_successful || event.asset_type != "native" {
            return Ok(IngestOutcome::Ignored {
                reason: "not a successful native-asset payment".to_string(),
            });
        }

        let tx_hash =
            TxHash::parse(&event.transaction_hash).map_err(BillingError::InvalidTxHash)?;
        let amount = Amount::from_str_checked(&event.amount)
            .map_err(BillingError::InvalidPayload)?;

        if let Some((transaction, was_pending)) =
            self.engine.confirm_payment(&tx_hash, Some(amount)).await?
        {
            return Ok(if was_pending {
                IngestOutcome::Confirmed(transaction)
            } else {
                IngestOutcome::AlreadyProcessed(transaction)
            });
        }

        // Unmatched payment: only destinations we know as creators get a
        // tip row, anything else is not ours to account for.
        let store = self.engine.store();
        let Some(creator) = store.creator_by_wallet(&event.to).await? else {
            tracing::debug!(to = %event.to, %tx_hash, "payment to unknown wallet ignored");
            return Ok(IngestOutcome::Ignored {
                reason: "recipient is not a registered creator".to_string(),
            });
        };
        let sender_id = store.user_by_wallet(&event.from).await?.map(|u| u.id);

        let receipt = self
            .engine
            .record_tip(sender_id, creator.id, amount, tx_hash, None)
            .await?;
        Ok(if receipt.reused {
            IngestOutcome::AlreadyProcessed(receipt.transaction)
        } else {
            IngestOutcome::TipRecorded(receipt.transaction)
        })
    }
}

/// Hex HMAC-SHA256 signature for a body, as the watcher computes it.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BillingConfig;
    use crate::model::{Creator, User};
    use crate::notify::NullSink;
    use crate::store::{LedgerOp, LedgerStore, MemoryLedger};

    const SECRET: &str = "watcher-secret";

    async fn ingest_with_secret(secret: Option<&str>) -> (PaymentIngest, User) {
        let store = Arc::new(MemoryLedger::new());
        let user = User::new("GCREATOR", "Creator");
        let creator = Creator::new(&user);
        store
            .commit(vec![
                LedgerOp::InsertUser(user.clone()),
                LedgerOp::InsertCreator(creator),
            ])
            .await
            .unwrap();

        let mut config = BillingConfig::default();
        config.webhook_secret = secret.map(str::to_string);
        let engine = Arc::new(ReconciliationEngine::new(store, Arc::new(NullSink), config));
        (PaymentIngest::new(engine), user)
    }

    async fn ingest_with_creator() -> (PaymentIngest, User) {
        ingest_with_secret(Some(SECRET)).await
    }

    fn event(to: &str, hash_char: char) -> PaymentEvent {
        PaymentEvent {
            id: "evt-1".to_string(),
            event_type: "payment".to_string(),
            transaction_successful: true,
            source_account: "GSOMEONE".to_string(),
            asset_type: "native".to_string(),
            from: "GSOMEONE".to_string(),
            to: to.to_string(),
            amount: "5".to_string(),
            transaction_hash: hash_char.to_string().repeat(64),
        }
    }

    fn event_body(to: &str, hash_char: char) -> Vec<u8> {
        serde_json::to_vec(&event(to, hash_char)).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_missing_signature() {
        let (ingest, _) = ingest_with_creator().await;
        let body = event_body("GCREATOR", 'a');
        let err = ingest.ingest(&body, None).await.unwrap_err();
        assert!(matches!(err, BillingError::Unauthorized));
    }

    #[tokio::test]
    async fn test_rejects_bad_signature() {
        let (ingest, _) = ingest_with_creator().await;
        let body = event_body("GCREATOR", 'a');
        let wrong = sign_payload("other-secret", &body);
        let err = ingest.ingest(&body, Some(&wrong)).await.unwrap_err();
        assert!(matches!(err, BillingError::Unauthorized));
    }

    #[tokio::test]
    async fn test_signature_binds_body() {
        let (ingest, _) = ingest_with_creator().await;
        let body = event_body("GCREATOR", 'a');
        let sig = sign_payload(SECRET, &body);
        let tampered = event_body("GCREATOR", 'b');
        let err = ingest.ingest(&tampered, Some(&sig)).await.unwrap_err();
        assert!(matches!(err, BillingError::Unauthorized));
    }

    #[tokio::test]
    async fn test_no_secret_skips_verification() {
        let (ingest, _) = ingest_with_secret(None).await;
        let body = event_body("GCREATOR", 'a');
        let outcome = ingest.ingest(&body, None).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::TipRecorded(_)));
    }

    #[tokio::test]
    async fn test_unmatched_payment_becomes_tip() {
        let (ingest, user) = ingest_with_creator().await;
        let body = event_body("GCREATOR", 'a');
        let sig = sign_payload(SECRET, &body);

        let outcome = ingest.ingest(&body, Some(&sig)).await.unwrap();
        let IngestOutcome::TipRecorded(tx) = outcome else {
            panic!("expected tip, got {:?}", outcome);
        };
        assert_eq!(tx.recipient_id, user.id);
        assert_eq!(tx.amount, Amount::from_xlm(5));
        // 2% default fee
        assert_eq!(tx.platform_fee.to_string(), "0.1");
    }

    #[tokio::test]
    async fn test_payment_to_unknown_wallet_ignored() {
        let (ingest, _) = ingest_with_creator().await;
        let body = event_body("GSTRANGER", 'a');
        let sig = sign_payload(SECRET, &body);

        let outcome = ingest.ingest(&body, Some(&sig)).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Ignored { .. }));
    }

    #[tokio::test]
    async fn test_failed_chain_transaction_ignored() {
        let (ingest, _) = ingest_with_creator().await;
        let mut failed = event("GCREATOR", 'a');
        failed.transaction_successful = false;

        let outcome = ingest.apply(failed).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Ignored { .. }));

        // Nothing was credited
        let store = ingest.engine.store();
        assert!(store
            .transaction_by_hash(&TxHash::parse(&"a".repeat(64)).unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_non_native_asset_ignored() {
        let (ingest, _) = ingest_with_creator().await;
        let mut usdc = event("GCREATOR", 'c');
        usdc.asset_type = "credit_alphanum4".to_string();

        let outcome = ingest.apply(usdc).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Ignored { .. }));
    }

    #[tokio::test]
    async fn test_redelivery_reports_already_processed() {
        let (ingest, _) = ingest_with_creator().await;
        let body = event_body("GCREATOR", 'a');
        let sig = sign_payload(SECRET, &body);

        let first = ingest.ingest(&body, Some(&sig)).await.unwrap();
        assert!(matches!(first, IngestOutcome::TipRecorded(_)));

        let second = ingest.ingest(&body, Some(&sig)).await.unwrap();
        assert!(matches!(second, IngestOutcome::AlreadyProcessed(_)));
    }

    #[tokio::test]
    async fn test_invalid_hash_rejected() {
        let (ingest, _) = ingest_with_creator().await;
        let mut bad = event("GCREATOR", 'a');
        bad.transaction_hash = "nope".to_string();
        let body = serde_json::to_vec(&bad).unwrap();
        let sig = sign_payload(SECRET, &body);

        let err = ingest.ingest(&body, Some(&sig)).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidTxHash(_)));
    }
}
