use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::Address;

use crate::contracts::{MigrationContract, SignerClient};
use crate::error::{RelayerError, Result};
use crate::types::Allocation;

/// Read-only view of per-sender migration entitlement
#[async_trait]
pub trait AllocationOracle: Send + Sync {
    async fn allocation_of(&self, account: Address) -> Result<Allocation>;
}

/// Reads `allocation(address)` and `claimed(address)` from the migration contract
pub struct ContractOracle {
    contract: MigrationContract<SignerClient>,
}

impl ContractOracle {
    pub fn new(client: Arc<SignerClient>, migration_contract: Address) -> Self {
        Self {
            contract: MigrationContract::new(migration_contract, client),
        }
    }
}

#[async_trait]
impl AllocationOracle for ContractOracle {
    async fn allocation_of(&self, account: Address) -> Result<Allocation> {
        let allocation = self
            .contract
            .allocation(account)
            .call()
            .await
            .map_err(|e| RelayerError::Rpc(format!("allocation({account:?}) failed: {e}")))?;
        let claimed = self
            .contract
            .claimed(account)
            .call()
            .await
            .map_err(|e| RelayerError::Rpc(format!("claimed({account:?}) failed: {e}")))?;

        Ok(Allocation {
            allocation,
            claimed,
        })
    }
}
