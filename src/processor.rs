//! Event processor
//!
//! Decision state machine for one inbound transfer:
//! dedup -> allocation read -> remaining -> decision -> claim -> disburse -> record.
//!
//! Events must be fed one at a time in block order. The remaining-allocation
//! check reads the ledger's running total on every event, so earlier relays
//! in the same batch (or before a restart) are always accounted for.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{H256, U256};
use tracing::{debug, error, info, warn};

use crate::chain::ChainClient;
use crate::error::{RelayerError, Result, with_deadline};
use crate::executor::Disburser;
use crate::ledger::LedgerStore;
use crate::oracle::AllocationOracle;
use crate::types::{
    Allocation, Asset, Clock, Disbursement, InboundTransfer, ProcessOutcome, RelayRecord,
    RelayStatus, RelayUpdate, ReturnReason,
};

/// What to do with an inbound transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    SendV2,
    Return(ReturnReason),
}

/// Pure allocation check. `remaining` saturates at zero.
pub fn evaluate(amount: U256, allocation: &Allocation, already_relayed: U256) -> Option<ReturnReason> {
    if allocation.allocation.is_zero() {
        return Some(ReturnReason::NotWhitelisted);
    }
    let remaining = allocation
        .allocation
        .saturating_sub(allocation.claimed)
        .saturating_sub(already_relayed);
    if amount > remaining {
        return Some(ReturnReason::OverAllocation);
    }
    None
}

pub struct EventProcessor {
    chain: Arc<dyn ChainClient>,
    oracle: Arc<dyn AllocationOracle>,
    ledger: Arc<dyn LedgerStore>,
    disburser: Arc<dyn Disburser>,
    clock: Arc<dyn Clock>,
    rpc_timeout: Duration,
}

impl EventProcessor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        oracle: Arc<dyn AllocationOracle>,
        ledger: Arc<dyn LedgerStore>,
        disburser: Arc<dyn Disburser>,
        clock: Arc<dyn Clock>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            oracle,
            ledger,
            disburser,
            clock,
            rpc_timeout,
        }
    }

    /// Run one inbound transfer to a terminal ledger state.
    ///
    /// Per-event failures (allocation or balance reads, disbursement) are
    /// recorded as `failed` rows and reported as [`ProcessOutcome::Failed`].
    /// A transfer whose outcome is unknown keeps its `pending` row and its
    /// claim on the sender's allocation.
    /// A ledger error before any on-chain action is returned to the caller,
    /// which fails the whole poll.
    pub async fn process(&self, event: &InboundTransfer) -> Result<ProcessOutcome> {
        if let Some(existing) = self.ledger.find(event.tx_hash).await? {
            if existing.log_index != event.log_index {
                warn!(
                    tx_hash = ?event.tx_hash,
                    log_index = event.log_index,
                    recorded_log_index = existing.log_index,
                    sender = ?event.sender,
                    amount = %event.amount,
                    "Additional Transfer log in an already recorded transaction, funds held at relayer"
                );
            } else {
                debug!(
                    tx_hash = ?event.tx_hash,
                    status = %existing.status,
                    "Inbound transfer already recorded, skipping"
                );
            }
            return Ok(ProcessOutcome::Skipped);
        }

        let decision = match self.decide(event).await {
            Ok(decision) => decision,
            Err(e @ RelayerError::Ledger(_)) => return Err(e),
            Err(e) => return self.record_failure(event, e).await,
        };

        // 1:1 in either direction; only the asset differs
        let (asset, reason) = match decision {
            Decision::SendV2 => (Asset::V2, None),
            Decision::Return(reason) => (Asset::V1, Some(reason)),
        };
        let disbursement = Disbursement {
            recipient: event.sender,
            amount: event.amount,
            asset,
        };

        let claim = RelayRecord::pending(event, &disbursement, reason, self.clock.now());
        if !self.ledger.insert_if_absent(&claim).await? {
            debug!(tx_hash = ?event.tx_hash, "Lost claim race, skipping");
            return Ok(ProcessOutcome::Skipped);
        }

        info!(
            tx_hash = ?event.tx_hash,
            sender = ?event.sender,
            amount = %event.amount,
            block = event.block_number,
            asset = %disbursement.asset,
            reason = reason.map(|r| r.as_str()).unwrap_or("valid"),
            "Disbursing"
        );

        match self.disburser.disburse(&disbursement).await {
            Ok(tx_hash_out) => {
                let status = match decision {
                    Decision::SendV2 => RelayStatus::Sent,
                    Decision::Return(_) => RelayStatus::Returned,
                };
                self.finalize(event, status, Some(tx_hash_out), None).await;
                info!(
                    tx_hash = ?event.tx_hash,
                    tx_hash_out = ?tx_hash_out,
                    status = %status,
                    "Inbound transfer settled"
                );
                Ok(match decision {
                    Decision::SendV2 => ProcessOutcome::Sent,
                    Decision::Return(reason) => ProcessOutcome::Returned(reason),
                })
            }
            Err(RelayerError::Unconfirmed { tx_hash, reason }) => {
                let message = RelayerError::Unconfirmed { tx_hash, reason }.to_string();
                error!(
                    tx_hash = ?event.tx_hash,
                    tx_hash_out = ?tx_hash,
                    sender = ?event.sender,
                    error = %message,
                    "Disbursement outcome unknown, row left pending"
                );
                self.finalize(event, RelayStatus::Pending, tx_hash, Some(message.clone()))
                    .await;
                Ok(ProcessOutcome::Unconfirmed(message))
            }
            Err(e) => {
                error!(
                    tx_hash = ?event.tx_hash,
                    sender = ?event.sender,
                    error = %e,
                    "Disbursement failed, funds held at relayer"
                );
                let message = e.to_string();
                self.finalize(event, RelayStatus::Failed, None, Some(message.clone()))
                    .await;
                Ok(ProcessOutcome::Failed(message))
            }
        }
    }

    async fn decide(&self, event: &InboundTransfer) -> Result<Decision> {
        let allocation = with_deadline(
            "allocation read",
            self.rpc_timeout,
            self.oracle.allocation_of(event.sender),
        )
        .await?;
        let already_relayed = self.ledger.sum_sent_amount(event.sender).await?;

        if let Some(reason) = evaluate(event.amount, &allocation, already_relayed) {
            debug!(
                sender = ?event.sender,
                allocation = %allocation.allocation,
                claimed = %allocation.claimed,
                already_relayed = %already_relayed,
                reason = %reason,
                "Sender not eligible for V2"
            );
            return Ok(Decision::Return(reason));
        }

        let balance =
            with_deadline("V2 balance read", self.rpc_timeout, self.chain.v2_balance()).await?;
        if balance < event.amount {
            warn!(
                balance = %balance,
                amount = %event.amount,
                "Relayer V2 balance too low, returning V1"
            );
            return Ok(Decision::Return(ReturnReason::InsufficientV2));
        }

        Ok(Decision::SendV2)
    }

    async fn record_failure(
        &self,
        event: &InboundTransfer,
        err: RelayerError,
    ) -> Result<ProcessOutcome> {
        error!(
            tx_hash = ?event.tx_hash,
            sender = ?event.sender,
            error = %err,
            "Failed to evaluate inbound transfer"
        );
        let message = err.to_string();
        let record = RelayRecord::failed(event, message.clone(), self.clock.now());
        self.ledger.insert_if_absent(&record).await?;
        Ok(ProcessOutcome::Failed(message))
    }

    /// Ledger write after an on-chain action. Errors are logged and
    /// swallowed; the pending row remains for reconciliation.
    async fn finalize(
        &self,
        event: &InboundTransfer,
        status: RelayStatus,
        tx_hash_out: Option<H256>,
        error: Option<String>,
    ) {
        let update = RelayUpdate {
            status,
            tx_hash_out,
            error,
            processed_at: self.clock.now(),
        };
        match self.ledger.finalize(event.tx_hash, &update).await {
            Ok(true) => {}
            Ok(false) => warn!(
                tx_hash = ?event.tx_hash,
                status = %status,
                "No pending ledger row to finalize"
            ),
            Err(e) => error!(
                tx_hash = ?event.tx_hash,
                tx_hash_out = ?tx_hash_out,
                status = %status,
                error = %e,
                "Ledger write failed after on-chain action, row left pending"
            ),
        }
    }
}
