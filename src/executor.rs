//! Disbursement executor
//!
//! Submits exactly one ERC-20 transfer per call and waits for a fixed number
//! of confirmations. There is no retry here: a failure is reported to the
//! processor, which records it, and the inbound funds stay at the relayer.
//!
//! Only a rejected submission or a reverted receipt is a definite failure.
//! Once a transfer may have been broadcast, anything short of a receipt is
//! [`RelayerError::Unconfirmed`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{Address, H256, TransactionReceipt, U64};
use tracing::{info, warn};

use crate::contracts::{Erc20Token, SignerClient};
use crate::error::{RelayerError, Result, with_deadline};
use crate::types::{Asset, Disbursement};

#[async_trait]
pub trait Disburser: Send + Sync {
    /// Execute `disbursement` and return the confirmed outbound transaction hash.
    async fn disburse(&self, disbursement: &Disbursement) -> Result<H256>;
}

pub struct TokenDisburser<M = SignerClient> {
    v1: Erc20Token<M>,
    v2: Erc20Token<M>,
    confirmations: usize,
    submit_timeout: Duration,
    confirmation_timeout: Duration,
}

impl<M: Middleware + 'static> TokenDisburser<M> {
    pub fn new(
        client: Arc<M>,
        v1_token: Address,
        v2_token: Address,
        confirmations: usize,
        submit_timeout: Duration,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            v1: Erc20Token::new(v1_token, client.clone()),
            v2: Erc20Token::new(v2_token, client),
            confirmations,
            submit_timeout,
            confirmation_timeout,
        }
    }

    fn token(&self, asset: Asset) -> &Erc20Token<M> {
        match asset {
            Asset::V1 => &self.v1,
            Asset::V2 => &self.v2,
        }
    }
}

/// Map a failed submission. A timeout may still have reached the mempool.
fn submission_error(error: RelayerError) -> RelayerError {
    match error {
        RelayerError::Timeout { .. } => RelayerError::Unconfirmed {
            tx_hash: None,
            reason: error.to_string(),
        },
        other => other,
    }
}

/// Map any error seen while waiting for confirmations after `tx_hash` was
/// submitted. The transfer can still land, so the outcome is unknown.
fn confirmation_error(tx_hash: H256, error: RelayerError) -> RelayerError {
    let reason = match error {
        RelayerError::Disbursement(reason) => reason,
        other => other.to_string(),
    };
    RelayerError::Unconfirmed {
        tx_hash: Some(tx_hash),
        reason,
    }
}

/// Interpret the receipt returned by the confirmation wait.
fn settle_receipt(tx_hash: H256, receipt: Option<TransactionReceipt>) -> Result<H256> {
    let Some(receipt) = receipt else {
        return Err(RelayerError::Unconfirmed {
            tx_hash: Some(tx_hash),
            reason: "transaction dropped from mempool".to_string(),
        });
    };

    if receipt.status != Some(U64::from(1)) {
        return Err(RelayerError::Disbursement(format!(
            "transaction {tx_hash:?} reverted"
        )));
    }

    Ok(tx_hash)
}

#[async_trait]
impl<M: Middleware + 'static> Disburser for TokenDisburser<M> {
    async fn disburse(&self, disbursement: &Disbursement) -> Result<H256> {
        let call = self
            .token(disbursement.asset)
            .transfer(disbursement.recipient, disbursement.amount);

        let pending = with_deadline("transfer submission", self.submit_timeout, async {
            call.send().await.map_err(|e| {
                RelayerError::Disbursement(format!(
                    "{} transfer to {:?} rejected: {e}",
                    disbursement.asset, disbursement.recipient
                ))
            })
        })
        .await
        .map_err(submission_error)?;

        let tx_hash = pending.tx_hash();
        info!(
            tx_hash = ?tx_hash,
            asset = %disbursement.asset,
            recipient = ?disbursement.recipient,
            amount = %disbursement.amount,
            "Transfer submitted, waiting for confirmation"
        );

        let receipt = with_deadline("transfer confirmation", self.confirmation_timeout, async {
            pending
                .confirmations(self.confirmations)
                .await
                .map_err(|e| RelayerError::Disbursement(format!("receipt for {tx_hash:?}: {e}")))
        })
        .await
        .map_err(|e| {
            warn!(tx_hash = ?tx_hash, error = %e, "Confirmation wait did not complete");
            confirmation_error(tx_hash, e)
        })?;

        settle_receipt(tx_hash, receipt)
    }
}
