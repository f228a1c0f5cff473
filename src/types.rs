use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::Serialize;

use crate::error::RelayerError;

/// Lifecycle state of a relay record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStatus {
    /// Outbound transfer is being submitted; outcome not yet known
    Pending,
    /// V2 was sent to the sender
    Sent,
    /// The inbound V1 amount was returned to the sender
    Returned,
    /// Processing failed; funds remain at the relayer address
    Failed,
}

impl RelayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayStatus::Pending => "pending",
            RelayStatus::Sent => "sent",
            RelayStatus::Returned => "returned",
            RelayStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RelayStatus::Pending)
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RelayStatus::Pending),
            "sent" => Ok(RelayStatus::Sent),
            "returned" => Ok(RelayStatus::Returned),
            "failed" => Ok(RelayStatus::Failed),
            other => Err(RelayerError::Ledger(format!("unknown relay status: {other}"))),
        }
    }
}

/// Why an inbound transfer was returned instead of relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnReason {
    NotWhitelisted,
    OverAllocation,
    InsufficientV2,
}

impl ReturnReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnReason::NotWhitelisted => "not_whitelisted",
            ReturnReason::OverAllocation => "over_allocation",
            ReturnReason::InsufficientV2 => "insufficient_v2",
        }
    }
}

impl fmt::Display for ReturnReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReturnReason {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_whitelisted" => Ok(ReturnReason::NotWhitelisted),
            "over_allocation" => Ok(ReturnReason::OverAllocation),
            "insufficient_v2" => Ok(ReturnReason::InsufficientV2),
            other => Err(RelayerError::Ledger(format!("unknown return reason: {other}"))),
        }
    }
}

/// Token the relayer disburses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Asset {
    V1,
    V2,
}

impl Asset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::V1 => "v1",
            Asset::V2 => "v2",
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Asset {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" => Ok(Asset::V1),
            "v2" => Ok(Asset::V2),
            other => Err(RelayerError::Ledger(format!("unknown asset: {other}"))),
        }
    }
}

/// A V1 `Transfer` log whose recipient is the relayer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTransfer {
    pub tx_hash: H256,
    pub sender: Address,
    pub amount: U256,
    pub block_number: u64,
    pub log_index: u64,
}

/// Entitlement read from the migration contract
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allocation {
    pub allocation: U256,
    pub claimed: U256,
}

/// One outbound transfer to be executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disbursement {
    pub recipient: Address,
    pub amount: U256,
    pub asset: Asset,
}

/// Ledger row, one per inbound transfer ever observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayRecord {
    pub tx_hash_in: H256,
    pub sender: Address,
    pub v1_amount_in: U256,
    pub status: RelayStatus,
    pub outbound_asset: Option<Asset>,
    pub v2_amount_sent: Option<U256>,
    pub tx_hash_out: Option<H256>,
    pub block_number: u64,
    /// Log index of the `Transfer` that created the row. Other `Transfer`
    /// logs in the same transaction are not relayed.
    pub log_index: u64,
    pub reason: Option<ReturnReason>,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl RelayRecord {
    /// Pending claim written right before an outbound transfer is submitted.
    pub fn pending(
        event: &InboundTransfer,
        disbursement: &Disbursement,
        reason: Option<ReturnReason>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tx_hash_in: event.tx_hash,
            sender: event.sender,
            v1_amount_in: event.amount,
            status: RelayStatus::Pending,
            outbound_asset: Some(disbursement.asset),
            v2_amount_sent: (disbursement.asset == Asset::V2).then_some(disbursement.amount),
            tx_hash_out: None,
            block_number: event.block_number,
            log_index: event.log_index,
            reason,
            error: None,
            processed_at: now,
        }
    }

    /// Terminal failure recorded before any disbursement was attempted.
    pub fn failed(event: &InboundTransfer, error: String, now: DateTime<Utc>) -> Self {
        Self {
            tx_hash_in: event.tx_hash,
            sender: event.sender,
            v1_amount_in: event.amount,
            status: RelayStatus::Failed,
            outbound_asset: None,
            v2_amount_sent: None,
            tx_hash_out: None,
            block_number: event.block_number,
            log_index: event.log_index,
            reason: None,
            error: Some(error),
            processed_at: now,
        }
    }

    /// Whether this row counts against the sender's allocation
    pub fn counts_against_allocation(&self) -> bool {
        match self.status {
            RelayStatus::Sent => true,
            RelayStatus::Pending => self.outbound_asset == Some(Asset::V2),
            RelayStatus::Returned | RelayStatus::Failed => false,
        }
    }
}

/// Transition applied to a pending record. An update that keeps the status
/// `Pending` only annotates the row with the submitted hash and error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayUpdate {
    pub status: RelayStatus,
    pub tx_hash_out: Option<H256>,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Result of running one inbound transfer through the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Already recorded; nothing was done
    Skipped,
    Sent,
    Returned(ReturnReason),
    /// Recorded as `failed`; carries the error text
    Failed(String),
    /// Submitted but never observed on chain. The row stays `pending` and
    /// keeps counting against the sender's allocation.
    Unconfirmed(String),
}

/// Summary of a single poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub from_block: u64,
    pub to_block: u64,
    pub events: usize,
    pub sent: usize,
    pub returned: usize,
    /// Failed or unconfirmed disbursements
    pub failed: usize,
    pub skipped: usize,
}

/// Snapshot of the relayer's in-memory state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayerStatus {
    pub running: bool,
    pub watermark: Option<u64>,
    pub relay_count: u64,
    pub return_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Typed runtime configuration for the relayer service
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    /// Hot wallet address receiving V1 and disbursing V1/V2
    pub relayer_address: Address,
    pub v1_token: Address,
    pub v2_token: Address,
    pub migration_contract: Address,
    /// Delay between the end of one poll and the start of the next
    pub poll_interval: Duration,
    /// Blocks required atop a block before its events are acted on
    pub confirmations: u64,
    /// How far behind the head the watermark starts
    pub lookback_blocks: u64,
    /// Upper bound on the block range scanned per poll
    pub max_blocks_per_poll: u64,
    /// Explicit first block to scan, overrides the lookback window
    pub start_block: Option<u64>,
    /// Confirmations to wait for on each outbound transfer
    pub disbursement_confirmations: usize,
    pub rpc_timeout: Duration,
    pub confirmation_timeout: Duration,
}

/// Source of wall-clock time, injectable for tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
