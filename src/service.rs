use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::chain::ChainClient;
use crate::error::{RelayerError, Result};
use crate::executor::Disburser;
use crate::ledger::LedgerStore;
use crate::oracle::AllocationOracle;
use crate::poller::ChainPoller;
use crate::processor::EventProcessor;
use crate::types::{Clock, PollSummary, ProcessOutcome, RelayerConfig, RelayerStatus};

/// Poller and processor, only ever driven by one poll at a time
struct PollState {
    poller: ChainPoller,
    processor: EventProcessor,
}

/// Handle on the background polling loop
struct LoopHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
    /// Set by `stop`; the loop exits once its in-flight poll finishes
    stopping: bool,
}

impl LoopHandle {
    async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Polling loop panicked: {}", e);
        }
    }
}

/// Lifecycle controller for the migration relayer
pub struct RelayerService {
    config: RelayerConfig,

    /// Poll state; the mutex keeps polls from overlapping
    state: Arc<Mutex<PollState>>,

    /// In-memory runtime status
    status: Arc<RwLock<RelayerStatus>>,

    clock: Arc<dyn Clock>,

    handle: Mutex<Option<LoopHandle>>,
}

impl RelayerService {
    /// Create a new relayer service from injected collaborators
    pub fn new(
        config: RelayerConfig,
        chain: Arc<dyn ChainClient>,
        oracle: Arc<dyn AllocationOracle>,
        ledger: Arc<dyn LedgerStore>,
        disburser: Arc<dyn Disburser>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let poller = ChainPoller::new(chain.clone(), &config);
        let processor = EventProcessor::new(
            chain,
            oracle,
            ledger,
            disburser,
            clock.clone(),
            config.rpc_timeout,
        );

        Self {
            config,
            state: Arc::new(Mutex::new(PollState { poller, processor })),
            status: Arc::new(RwLock::new(RelayerStatus::default())),
            clock,
            handle: Mutex::new(None),
        }
    }

    /// Start the relayer: place the watermark, poll once, then keep polling
    /// with a fixed delay after each completed poll.
    pub async fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.stopping) {
            return Err(RelayerError::AlreadyRunning);
        }
        // A stopped loop may still be finishing its last poll
        if let Some(previous) = handle.take() {
            previous.join().await;
        }

        let watermark = {
            let mut state = self.state.lock().await;
            let current = state.poller.current_block().await?;
            state.poller.initialize(current)
        };

        {
            let mut status = self.status.write().await;
            *status = RelayerStatus {
                running: true,
                watermark: Some(watermark),
                started_at: Some(self.clock.now()),
                ..RelayerStatus::default()
            };
        }

        info!(
            relayer = ?self.config.relayer_address,
            watermark,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting migration relayer"
        );

        // Errors are recorded in status; the loop retries on the next tick.
        let _ = Self::poll_cycle(&self.state, &self.status, self.clock.as_ref()).await;

        let shutdown = Arc::new(Notify::new());
        let task = {
            let shutdown = shutdown.clone();
            let state = self.state.clone();
            let status = self.status.clone();
            let clock = self.clock.clone();
            let interval = self.config.poll_interval;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = sleep(interval) => {}
                    }
                    let _ = Self::poll_cycle(&state, &status, clock.as_ref()).await;
                }
                debug!("Polling loop exited");
            })
        };

        *handle = Some(LoopHandle {
            shutdown,
            task,
            stopping: false,
        });
        Ok(())
    }

    /// Stop scheduling polls. An in-flight poll is allowed to finish.
    pub async fn stop(&self) {
        let mut guard = self.handle.lock().await;
        let Some(handle) = guard.as_mut().filter(|h| !h.stopping) else {
            return;
        };
        info!("Stopping migration relayer");
        handle.stopping = true;
        handle.shutdown.notify_one();
        self.status.write().await.running = false;
    }

    /// Wait for the polling loop to exit. Stops the service first if
    /// [`stop`](Self::stop) was not called.
    pub async fn stopped(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if !handle.stopping {
                handle.shutdown.notify_one();
            }
            self.status.write().await.running = false;
            handle.join().await;
        }
    }

    /// Snapshot of the runtime status
    pub async fn status(&self) -> RelayerStatus {
        self.status.read().await.clone()
    }

    /// Run one poll cycle now. Initializes the watermark if the service has
    /// never been started.
    pub async fn poll_once(&self) -> Result<Option<PollSummary>> {
        Self::poll_cycle(&self.state, &self.status, self.clock.as_ref()).await
    }

    async fn poll_cycle(
        state: &Mutex<PollState>,
        status: &RwLock<RelayerStatus>,
        clock: &dyn Clock,
    ) -> Result<Option<PollSummary>> {
        let mut state = state.lock().await;
        let result = Self::poll(&mut state, status).await;

        let mut status = status.write().await;
        status.last_poll_at = Some(clock.now());
        status.watermark = state.poller.watermark();
        if let Err(e) = &result {
            warn!(error = %e, transient = e.is_transient(), "Poll failed, watermark not advanced");
            status.last_error = Some(e.to_string());
        }
        result
    }

    async fn poll(
        state: &mut PollState,
        status: &RwLock<RelayerStatus>,
    ) -> Result<Option<PollSummary>> {
        let current = state.poller.current_block().await?;
        if state.poller.watermark().is_none() {
            state.poller.initialize(current);
        }

        let Some(range) = state.poller.next_range(current) else {
            return Ok(None);
        };

        let events = state.poller.fetch(range).await?;
        let mut summary = PollSummary {
            from_block: range.from,
            to_block: range.to,
            events: events.len(),
            ..PollSummary::default()
        };

        info!(
            from_block = range.from,
            to_block = range.to,
            events = events.len(),
            "Polled inbound transfers"
        );

        for event in &events {
            let outcome = state.processor.process(event).await?;

            let mut status = status.write().await;
            match outcome {
                ProcessOutcome::Sent => {
                    summary.sent += 1;
                    status.relay_count += 1;
                }
                ProcessOutcome::Returned(_) => {
                    summary.returned += 1;
                    status.return_count += 1;
                }
                ProcessOutcome::Failed(message) | ProcessOutcome::Unconfirmed(message) => {
                    summary.failed += 1;
                    status.failure_count += 1;
                    status.last_error = Some(message);
                }
                ProcessOutcome::Skipped => summary.skipped += 1,
            }
        }

        state.poller.advance(range.to);
        Ok(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerStore, MemoryLedger};
    use crate::testing::{FakeChain, FakeDisburser, FakeOracle, FixedClock, test_config, transfer};
    use crate::types::{Asset, RelayStatus, ReturnReason};
    use ethers::types::{Address, U256};
    use std::time::Duration;

    struct Harness {
        service: RelayerService,
        chain: Arc<FakeChain>,
        oracle: Arc<FakeOracle>,
        ledger: Arc<MemoryLedger>,
        disburser: Arc<FakeDisburser>,
    }

    /// Head 1_100 -> watermark 100; confirmations 2; cap 50 blocks per poll
    fn harness(head: u64) -> Harness {
        let chain = Arc::new(FakeChain::new(head));
        chain.set_v2_balance(1_000_000);
        let oracle = Arc::new(FakeOracle::default());
        let ledger = Arc::new(MemoryLedger::new());
        let disburser = Arc::new(FakeDisburser::default());
        let mut config = test_config();
        config.poll_interval = Duration::from_secs(3600);

        let service = RelayerService::new(
            config,
            chain.clone(),
            oracle.clone(),
            ledger.clone(),
            disburser.clone(),
            Arc::new(FixedClock::default()),
        );
        Harness {
            service,
            chain,
            oracle,
            ledger,
            disburser,
        }
    }

    #[tokio::test]
    async fn test_events_processed_in_block_order() {
        let h = harness(1_100);
        let sender = Address::repeat_byte(1);
        h.oracle.set(sender, 10_000, 0);
        h.chain.push_transfer(transfer(1, sender, 101, 101));
        h.chain.push_transfer(transfer(3, sender, 103, 103));
        h.chain.push_transfer(transfer(2, sender, 102, 102));

        h.service.start().await.unwrap();

        let amounts: Vec<U256> = h.disburser.calls().iter().map(|c| c.amount).collect();
        assert_eq!(
            amounts,
            vec![U256::from(101), U256::from(102), U256::from(103)]
        );
        let blocks: Vec<u64> = h.ledger.records().await.iter().map(|r| r.block_number).collect();
        assert_eq!(blocks, vec![101, 102, 103]);

        h.service.stop().await;
        h.service.stopped().await;
    }

    #[tokio::test]
    async fn test_watermark_advances_past_failed_events() {
        let h = harness(1_100);
        let sender = Address::repeat_byte(2);
        h.oracle.set(sender, 10_000, 0);
        h.chain.push_transfer(transfer(1, sender, 10, 110));
        h.chain.push_transfer(transfer(2, sender, 10, 120));
        h.disburser.fail_nth(0);

        h.service.start().await.unwrap();
        h.service.stop().await;
        h.service.stopped().await;

        // watermark 100, head 1_100 -> first range is 101..=150
        let status = h.service.status().await;
        assert_eq!(status.watermark, Some(150));
        assert_eq!(status.relay_count, 1);
        assert_eq!(status.failure_count, 1);
        assert!(!status.running);

        let failed = h.ledger.list_by_status(RelayStatus::Failed, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].block_number, 110);
    }

    #[tokio::test]
    async fn test_failed_event_is_not_retried_on_next_poll() {
        let h = harness(1_100);
        let sender = Address::repeat_byte(3);
        h.oracle.set(sender, 10_000, 0);
        h.chain.push_transfer(transfer(1, sender, 10, 110));
        h.disburser.fail_with("nonce too low");

        let first = h.service.poll_once().await.unwrap().unwrap();
        assert_eq!(first.failed, 1);

        let second = h.service.poll_once().await.unwrap().unwrap();
        assert_eq!((second.from_block, second.to_block), (151, 200));
        assert_eq!(second.events, 0);
        assert_eq!(h.disburser.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_error_keeps_watermark() {
        let h = harness(1_100);
        h.service.start().await.unwrap();
        h.service.stop().await;
        h.service.stopped().await;
        let before = h.service.status().await.watermark;
        assert_eq!(before, Some(150));

        h.chain.set_failure(Some("connection refused"));
        let err = h.service.poll_once().await.unwrap_err();
        assert!(err.is_transient());

        let status = h.service.status().await;
        assert_eq!(status.watermark, before);
        assert!(status.last_error.unwrap().contains("connection refused"));

        h.chain.set_failure(None);
        let summary = h.service.poll_once().await.unwrap().unwrap();
        assert_eq!(summary.from_block, 151);
    }

    #[tokio::test]
    async fn test_no_poll_until_blocks_confirmed() {
        let h = harness(1_100);
        h.service.poll_once().await.unwrap();
        let watermark = h.service.status().await.watermark.unwrap();

        h.chain.set_head(watermark + 2);
        assert_eq!(h.service.poll_once().await.unwrap(), None);

        h.chain.set_head(watermark + 3);
        let summary = h.service.poll_once().await.unwrap().unwrap();
        assert_eq!((summary.from_block, summary.to_block), (watermark + 1, watermark + 1));
    }

    #[tokio::test]
    async fn test_restart_does_not_double_spend_allocation() {
        let h = harness(1_100);
        let sender = Address::repeat_byte(4);
        h.oracle.set(sender, 500, 100);
        h.chain.push_transfer(transfer(1, sender, 300, 105));
        h.chain.push_transfer(transfer(2, sender, 200, 106));

        h.service.start().await.unwrap();
        h.service.stop().await;
        h.service.stopped().await;

        // Same ledger, fresh service instance replaying the same window
        let mut config = test_config();
        config.poll_interval = Duration::from_secs(3600);
        let restarted = RelayerService::new(
            config,
            h.chain.clone(),
            h.oracle.clone(),
            h.ledger.clone(),
            h.disburser.clone(),
            Arc::new(FixedClock::default()),
        );
        h.chain.push_transfer(transfer(3, sender, 100, 107));
        restarted.start().await.unwrap();
        restarted.stop().await;
        restarted.stopped().await;

        let calls = h.disburser.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].asset, Asset::V2);
        assert_eq!(calls[1].asset, Asset::V1);
        assert_eq!(calls[2].asset, Asset::V2);

        let relayed = h.ledger.sum_sent_amount(sender).await.unwrap();
        assert_eq!(relayed, U256::from(400));
        assert!(relayed + U256::from(100) <= U256::from(500));

        let returned = h.ledger.find(transfer(2, sender, 0, 0).tx_hash).await.unwrap().unwrap();
        assert_eq!(returned.reason, Some(ReturnReason::OverAllocation));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let h = harness(1_100);
        h.service.start().await.unwrap();
        assert!(matches!(
            h.service.start().await,
            Err(RelayerError::AlreadyRunning)
        ));
        h.service.stop().await;
        h.service.stopped().await;
    }

    #[tokio::test]
    async fn test_start_after_stop_resumes_polling() {
        let h = harness(1_100);
        let sender = Address::repeat_byte(5);
        h.oracle.set(sender, 10_000, 0);
        h.chain.push_transfer(transfer(1, sender, 10, 110));

        h.service.start().await.unwrap();
        h.service.stop().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.service.start().await.unwrap();
        assert!(h.service.status().await.running);

        // The rescanned window is deduplicated by the ledger
        assert_eq!(h.disburser.calls().len(), 1);

        h.service.stop().await;
        h.service.stopped().await;
        assert!(!h.service.status().await.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_rpc_times_out_and_keeps_watermark() {
        let h = harness(1_100);
        h.service.poll_once().await.unwrap();
        let before = h.service.status().await.watermark;
        assert_eq!(before, Some(150));

        h.chain.set_hang(true);
        let err = h.service.poll_once().await.unwrap_err();
        assert!(matches!(err, RelayerError::Timeout { .. }));
        assert!(err.is_transient());

        let status = h.service.status().await;
        assert_eq!(status.watermark, before);
        assert!(status.last_error.unwrap().starts_with("Timeout waiting for"));

        h.chain.set_hang(false);
        let summary = h.service.poll_once().await.unwrap().unwrap();
        assert_eq!(summary.from_block, 151);
    }

    #[tokio::test]
    async fn test_event_failure_reports_error_text() {
        let h = harness(1_100);
        let sender = Address::repeat_byte(6);
        h.oracle.set(sender, 10_000, 0);
        h.chain.push_transfer(transfer(1, sender, 10, 110));
        h.disburser.fail_with("replacement transaction underpriced");

        h.service.poll_once().await.unwrap();

        let status = h.service.status().await;
        assert_eq!(status.failure_count, 1);
        assert!(
            status
                .last_error
                .unwrap()
                .contains("replacement transaction underpriced")
        );
    }

    #[tokio::test]
    async fn test_status_reports_lifecycle() {
        let h = harness(1_100);
        assert_eq!(h.service.status().await, RelayerStatus::default());

        h.service.start().await.unwrap();
        let status = h.service.status().await;
        assert!(status.running);
        assert_eq!(status.started_at, Some(FixedClock::default().0));
        assert!(status.last_poll_at.is_some());

        h.service.stop().await;
        assert!(!h.service.status().await.running);
        h.service.stopped().await;
    }

    #[tokio::test]
    async fn test_background_loop_keeps_polling() {
        let chain = Arc::new(FakeChain::new(1_100));
        let service = RelayerService::new(
            test_config(),
            chain.clone(),
            Arc::new(FakeOracle::default()),
            Arc::new(MemoryLedger::new()),
            Arc::new(FakeDisburser::default()),
            Arc::new(FixedClock::default()),
        );

        service.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        service.stop().await;
        service.stopped().await;

        // 20ms interval: several 50-block windows past the initial one
        let queries = chain.queries();
        assert!(queries.len() >= 2, "expected repeated polls, got {queries:?}");
        for pair in queries.windows(2) {
            assert_eq!(pair[1].0, pair[0].1 + 1);
        }
    }
}
