use std::collections::HashMap;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use tokio::sync::RwLock;

use super::{LedgerStore, apply_update};
use crate::error::{RelayerError, Result};
use crate::types::{RelayRecord, RelayStatus, RelayUpdate};

/// In-process ledger for tests and dry runs
pub struct MemoryLedger {
    /// Insertion order of inbound hashes
    order: RwLock<Vec<H256>>,
    /// Map of all records by inbound hash
    records: RwLock<HashMap<H256, RelayRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            order: RwLock::new(Vec::new()),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records held
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// All records in insertion order
    pub async fn records(&self) -> Vec<RelayRecord> {
        let order = self.order.read().await;
        let records = self.records.read().await;
        order.iter().filter_map(|h| records.get(h).cloned()).collect()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn find(&self, tx_hash_in: H256) -> Result<Option<RelayRecord>> {
        Ok(self.records.read().await.get(&tx_hash_in).cloned())
    }

    async fn insert_if_absent(&self, record: &RelayRecord) -> Result<bool> {
        let mut order = self.order.write().await;
        let mut records = self.records.write().await;

        if records.contains_key(&record.tx_hash_in) {
            return Ok(false);
        }
        order.push(record.tx_hash_in);
        records.insert(record.tx_hash_in, record.clone());
        Ok(true)
    }

    async fn sum_sent_amount(&self, sender: Address) -> Result<U256> {
        let records = self.records.read().await;
        records
            .values()
            .filter(|r| r.sender == sender && r.counts_against_allocation())
            .filter_map(|r| r.v2_amount_sent)
            .try_fold(U256::zero(), |acc, amount| acc.checked_add(amount))
            .ok_or_else(|| RelayerError::Ledger(format!("sent amount overflow for {sender:?}")))
    }

    async fn finalize(&self, tx_hash_in: H256, update: &RelayUpdate) -> Result<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(&tx_hash_in) {
            Some(record) if record.status == RelayStatus::Pending => {
                apply_update(record, update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_status(&self, status: RelayStatus, limit: usize) -> Result<Vec<RelayRecord>> {
        let order = self.order.read().await;
        let records = self.records.read().await;
        Ok(order
            .iter()
            .filter_map(|h| records.get(h))
            .filter(|r| r.status == status)
            .take(limit)
            .cloned()
            .collect())
    }
}
