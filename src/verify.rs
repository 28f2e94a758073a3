//! Chain verification adapter interface.
//!
//! The core never synthesizes trust in a payment on its own: it either
//! receives a signed webhook event or asks an implementation of
//! [`ChainVerifier`] to check a transaction hash against the expected
//! sender, receiver, and amount. Chain access itself lives outside this
//! crate.

use crate::model::TxHash;
use crate::{Amount, Result};
use async_trait::async_trait;

/// Constraints a payment must satisfy to be accepted. Unset fields match
/// anything.
#[derive(Debug, Clone, Default)]
pub struct Expected {
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: Option<Amount>,
}

impl Expected {
    pub fn to_wallet(wallet: impl Into<String>) -> Self {
        Self {
            to: Some(wallet.into()),
            ..Default::default()
        }
    }

    pub fn with_amount(mut self, amount: Amount) -> Self {
        self.amount = Some(amount);
        self
    }
}

/// The successful native-asset payment found for a hash.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentDetails {
    pub from: String,
    pub to: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    Valid(PaymentDetails),
    Invalid { reason: String },
}

/// External collaborator that can validate a transaction hash on the
/// payment network.
#[async_trait]
pub trait ChainVerifier: Send + Sync {
    async fn verify(&self, tx_hash: &TxHash, expected: &Expected) -> Result<Verification>;
}
