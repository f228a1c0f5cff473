//! Ledger Store
//!
//! Durable, idempotent record of every relay decision, keyed by the inbound
//! transaction hash. The ledger is the only source of "already relayed"
//! amounts; nothing about past relays is cached in memory.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};

use crate::error::Result;
use crate::types::{RelayRecord, RelayStatus, RelayUpdate};

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Look up the record for an inbound transaction
    async fn find(&self, tx_hash_in: H256) -> Result<Option<RelayRecord>>;

    /// Persist `record` unless a row with the same `tx_hash_in` exists.
    /// Returns true if the row was inserted.
    async fn insert_if_absent(&self, record: &RelayRecord) -> Result<bool>;

    /// Sum of V2 committed to `sender`: `sent` rows plus `pending` V2 rows
    async fn sum_sent_amount(&self, sender: Address) -> Result<U256>;

    /// Apply `update` to a `pending` row: a terminal status closes it, a
    /// `Pending` status only records the submitted hash and error. Returns
    /// false if no pending row matched.
    async fn finalize(&self, tx_hash_in: H256, update: &RelayUpdate) -> Result<bool>;

    /// Records with `status`, oldest first, for operator reconciliation
    async fn list_by_status(&self, status: RelayStatus, limit: usize) -> Result<Vec<RelayRecord>>;
}

/// Apply an update to a record in place. Only a `failed` row gives its V2
/// amount back to the sender's allocation.
pub(crate) fn apply_update(record: &mut RelayRecord, update: &RelayUpdate) {
    record.status = update.status;
    record.tx_hash_out = update.tx_hash_out;
    record.error = update.error.clone();
    record.processed_at = update.processed_at;
    if update.status == RelayStatus::Failed {
        record.v2_amount_sent = None;
    }
}
