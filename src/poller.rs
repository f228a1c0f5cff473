use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::chain::ChainClient;
use crate::error::{Result, with_deadline};
use crate::types::{InboundTransfer, RelayerConfig};

/// Inclusive block range selected for one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

/// Scans confirmed blocks for V1 transfers to the relayer, gap-free,
/// behind a monotonically advancing watermark.
pub struct ChainPoller {
    chain: Arc<dyn ChainClient>,
    confirmations: u64,
    lookback_blocks: u64,
    max_blocks_per_poll: u64,
    start_block: Option<u64>,
    rpc_timeout: Duration,
    watermark: Option<u64>,
}

impl ChainPoller {
    pub fn new(chain: Arc<dyn ChainClient>, config: &RelayerConfig) -> Self {
        Self {
            chain,
            confirmations: config.confirmations,
            lookback_blocks: config.lookback_blocks,
            max_blocks_per_poll: config.max_blocks_per_poll.max(1),
            start_block: config.start_block,
            rpc_timeout: config.rpc_timeout,
            watermark: None,
        }
    }

    /// Last fully processed block, if initialized
    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    /// Place the watermark relative to `current_block`. History before the
    /// lookback window is never replayed.
    pub fn initialize(&mut self, current_block: u64) -> u64 {
        let watermark = match self.start_block {
            Some(start) => start.saturating_sub(1),
            None => current_block.saturating_sub(self.lookback_blocks),
        };
        info!(
            current_block,
            watermark,
            lookback = self.lookback_blocks,
            "Poller watermark initialized"
        );
        self.watermark = Some(watermark);
        watermark
    }

    /// Next range to scan given the chain head, or None if nothing is
    /// confirmed past the watermark yet.
    pub fn next_range(&self, current_block: u64) -> Option<BlockRange> {
        let watermark = self.watermark?;

        if current_block < watermark {
            warn!(
                current_block,
                watermark, "Chain head is behind watermark, skipping poll"
            );
            return None;
        }

        let safe_block = current_block.saturating_sub(self.confirmations);
        if safe_block <= watermark {
            debug!(safe_block, watermark, "No new confirmed blocks");
            return None;
        }

        let to = safe_block.min(watermark.saturating_add(self.max_blocks_per_poll));
        Some(BlockRange {
            from: watermark + 1,
            to,
        })
    }

    /// Latest block number, bounded by the RPC deadline
    pub async fn current_block(&self) -> Result<u64> {
        with_deadline("eth_blockNumber", self.rpc_timeout, self.chain.block_number()).await
    }

    /// Inbound transfers in `range`, sorted by block then log index
    pub async fn fetch(&self, range: BlockRange) -> Result<Vec<InboundTransfer>> {
        let mut events = with_deadline(
            "Transfer log query",
            self.rpc_timeout,
            self.chain.inbound_transfers(range.from, range.to),
        )
        .await?;

        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    /// Mark everything up to `to_block` as processed. Never moves backwards.
    pub fn advance(&mut self, to_block: u64) {
        if self.watermark.is_none_or(|w| to_block > w) {
            self.watermark = Some(to_block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChain, test_config, transfer};
    use ethers::types::Address;

    fn poller(chain: Arc<FakeChain>) -> ChainPoller {
        ChainPoller::new(chain, &test_config())
    }

    #[test]
    fn test_initialize_uses_lookback_window() {
        let mut p = poller(Arc::new(FakeChain::new(0)));
        assert_eq!(p.initialize(10_000), 10_000 - 1_000);

        let mut p = poller(Arc::new(FakeChain::new(0)));
        assert_eq!(p.initialize(50), 0);
    }

    #[test]
    fn test_initialize_honours_start_block() {
        let mut config = test_config();
        config.start_block = Some(500);
        let mut p = ChainPoller::new(Arc::new(FakeChain::new(0)), &config);
        assert_eq!(p.initialize(10_000), 499);
    }

    #[test]
    fn test_next_range_respects_confirmations_and_cap() {
        let mut p = poller(Arc::new(FakeChain::new(0)));
        p.initialize(1_100); // watermark 100, confirmations 2, cap 50

        assert_eq!(p.next_range(101), None);
        assert_eq!(p.next_range(102), None);
        assert_eq!(p.next_range(103), Some(BlockRange { from: 101, to: 101 }));
        assert_eq!(p.next_range(140), Some(BlockRange { from: 101, to: 138 }));
        assert_eq!(p.next_range(10_000), Some(BlockRange { from: 101, to: 150 }));
    }

    #[test]
    fn test_next_range_skips_when_head_behind_watermark() {
        let mut p = poller(Arc::new(FakeChain::new(0)));
        p.initialize(1_100);
        assert_eq!(p.next_range(40), None);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut p = poller(Arc::new(FakeChain::new(0)));
        p.initialize(1_100);
        p.advance(120);
        assert_eq!(p.watermark(), Some(120));
        p.advance(110);
        assert_eq!(p.watermark(), Some(120));
    }

    #[tokio::test]
    async fn test_fetch_sorts_by_block_and_log_index() {
        let chain = Arc::new(FakeChain::new(200));
        let sender = Address::repeat_byte(1);
        chain.push_transfer(transfer(1, sender, 10, 101));
        chain.push_transfer(transfer(3, sender, 10, 103));
        chain.push_transfer(transfer(2, sender, 10, 102));
        let mut late = transfer(4, sender, 10, 101);
        late.log_index = 5;
        chain.push_transfer(late);

        let p = poller(chain);
        let events = p.fetch(BlockRange { from: 101, to: 103 }).await.unwrap();
        let order: Vec<(u64, u64)> = events.iter().map(|e| (e.block_number, e.log_index)).collect();
        assert_eq!(order, vec![(101, 0), (101, 5), (102, 0), (103, 0)]);
    }
}
