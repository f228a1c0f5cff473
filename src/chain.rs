use std::sync::Arc;

use async_trait::async_trait;
use ethers::contract::LogMeta;
use ethers::providers::Middleware;
use ethers::types::{Address, H256, U256};

use crate::contracts::{Erc20Token, SignerClient, TransferFilter};
use crate::error::{RelayerError, Result};
use crate::types::InboundTransfer;

/// Read access to the chain the relayer watches
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Latest block number known to the provider
    async fn block_number(&self) -> Result<u64>;

    /// V1 `Transfer` logs addressed to the relayer in `[from_block, to_block]`.
    /// No ordering is guaranteed.
    async fn inbound_transfers(&self, from_block: u64, to_block: u64)
    -> Result<Vec<InboundTransfer>>;

    /// The relayer's own V2 balance
    async fn v2_balance(&self) -> Result<U256>;
}

pub struct EthersChain<M = SignerClient> {
    client: Arc<M>,
    v1: Erc20Token<M>,
    v2: Erc20Token<M>,
    relayer: Address,
}

impl<M: Middleware + 'static> EthersChain<M> {
    pub fn new(client: Arc<M>, v1_token: Address, v2_token: Address, relayer: Address) -> Self {
        Self {
            v1: Erc20Token::new(v1_token, client.clone()),
            v2: Erc20Token::new(v2_token, client.clone()),
            client,
            relayer,
        }
    }
}

fn to_inbound(event: TransferFilter, meta: LogMeta) -> InboundTransfer {
    InboundTransfer {
        tx_hash: meta.transaction_hash,
        sender: event.from,
        amount: event.value,
        block_number: meta.block_number.as_u64(),
        log_index: meta.log_index.low_u64(),
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainClient for EthersChain<M> {
    async fn block_number(&self) -> Result<u64> {
        let height = self
            .client
            .get_block_number()
            .await
            .map_err(|e| RelayerError::Rpc(format!("eth_blockNumber failed: {e}")))?;
        Ok(height.as_u64())
    }

    async fn inbound_transfers(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<InboundTransfer>> {
        let logs = self
            .v1
            .transfer_filter()
            .topic2(H256::from(self.relayer))
            .from_block(from_block)
            .to_block(to_block)
            .query_with_meta()
            .await
            .map_err(|e| {
                RelayerError::Rpc(format!(
                    "Transfer query {from_block}..={to_block} failed: {e}"
                ))
            })?;

        Ok(logs
            .into_iter()
            .map(|(event, meta)| to_inbound(event, meta))
            .collect())
    }

    async fn v2_balance(&self) -> Result<U256> {
        self.v2
            .balance_of(self.relayer)
            .call()
            .await
            .map_err(|e| RelayerError::Rpc(format!("V2 balanceOf failed: {e}")))
    }
}
