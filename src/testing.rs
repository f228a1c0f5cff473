//! In-process fakes for the chain, oracle and disbursement seams.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::types::{Address, H256, U256};

use crate::chain::ChainClient;
use crate::error::{RelayerError, Result};
use crate::executor::Disburser;
use crate::oracle::AllocationOracle;
use crate::types::{Allocation, Clock, Disbursement, InboundTransfer, RelayerConfig};

pub fn test_config() -> RelayerConfig {
    RelayerConfig {
        relayer_address: Address::repeat_byte(0xee),
        v1_token: Address::repeat_byte(0x01),
        v2_token: Address::repeat_byte(0x02),
        migration_contract: Address::repeat_byte(0x03),
        poll_interval: Duration::from_millis(20),
        confirmations: 2,
        lookback_blocks: 1_000,
        max_blocks_per_poll: 50,
        start_block: None,
        disbursement_confirmations: 1,
        rpc_timeout: Duration::from_secs(5),
        confirmation_timeout: Duration::from_secs(5),
    }
}

pub fn transfer(n: u64, sender: Address, amount: u64, block: u64) -> InboundTransfer {
    InboundTransfer {
        tx_hash: H256::from_low_u64_be(n),
        sender,
        amount: U256::from(amount),
        block_number: block,
        log_index: 0,
    }
}

pub struct FakeChain {
    head: AtomicU64,
    v2_balance: Mutex<U256>,
    transfers: Mutex<Vec<InboundTransfer>>,
    fail: Mutex<Option<String>>,
    hang: AtomicBool,
    queries: Mutex<Vec<(u64, u64)>>,
}

impl FakeChain {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            v2_balance: Mutex::new(U256::zero()),
            transfers: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
            hang: AtomicBool::new(false),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn set_v2_balance(&self, balance: u64) {
        *self.v2_balance.lock().unwrap() = U256::from(balance);
    }

    pub fn push_transfer(&self, transfer: InboundTransfer) {
        self.transfers.lock().unwrap().push(transfer);
    }

    /// Make every RPC call fail until cleared with `None`
    pub fn set_failure(&self, message: Option<&str>) {
        *self.fail.lock().unwrap() = message.map(str::to_string);
    }

    /// Make block and log queries never resolve
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Ranges passed to `inbound_transfers`, in call order
    pub fn queries(&self) -> Vec<(u64, u64)> {
        self.queries.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        match self.fail.lock().unwrap().as_ref() {
            Some(msg) => Err(RelayerError::Rpc(msg.clone())),
            None => Ok(()),
        }
    }

    async fn stall(&self) {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn block_number(&self) -> Result<u64> {
        self.stall().await;
        self.check()?;
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn inbound_transfers(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<InboundTransfer>> {
        self.stall().await;
        self.check()?;
        self.queries.lock().unwrap().push((from_block, to_block));
        Ok(self
            .transfers
            .lock()
            .unwrap()
            .iter()
            .filter(|t| (from_block..=to_block).contains(&t.block_number))
            .cloned()
            .collect())
    }

    async fn v2_balance(&self) -> Result<U256> {
        self.check()?;
        Ok(*self.v2_balance.lock().unwrap())
    }
}

#[derive(Default)]
pub struct FakeOracle {
    allocations: Mutex<HashMap<Address, Allocation>>,
    fail: Mutex<Option<String>>,
    reads: AtomicUsize,
}

impl FakeOracle {
    pub fn set(&self, account: Address, allocation: u64, claimed: u64) {
        self.allocations.lock().unwrap().insert(
            account,
            Allocation {
                allocation: U256::from(allocation),
                claimed: U256::from(claimed),
            },
        );
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail.lock().unwrap() = Some(message.to_string());
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AllocationOracle for FakeOracle {
    async fn allocation_of(&self, account: Address) -> Result<Allocation> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.fail.lock().unwrap().as_ref() {
            return Err(RelayerError::Rpc(msg.clone()));
        }
        Ok(self
            .allocations
            .lock()
            .unwrap()
            .get(&account)
            .copied()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeDisburser {
    calls: Mutex<Vec<Disbursement>>,
    fail: Mutex<Option<String>>,
    /// Fail only the nth call (0-based)
    fail_call: Mutex<Option<usize>>,
    /// Submit the nth call but never see it confirmed
    unconfirmed_call: Mutex<Option<usize>>,
}

impl FakeDisburser {
    pub fn fail_with(&self, message: &str) {
        *self.fail.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_nth(&self, n: usize) {
        *self.fail_call.lock().unwrap() = Some(n);
    }

    pub fn unconfirm_nth(&self, n: usize) {
        *self.unconfirmed_call.lock().unwrap() = Some(n);
    }

    pub fn calls(&self) -> Vec<Disbursement> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Disburser for FakeDisburser {
    async fn disburse(&self, disbursement: &Disbursement) -> Result<H256> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(*disbursement);
            calls.len() - 1
        };
        if let Some(msg) = self.fail.lock().unwrap().as_ref() {
            return Err(RelayerError::Disbursement(msg.clone()));
        }
        if *self.fail_call.lock().unwrap() == Some(index) {
            return Err(RelayerError::Disbursement(format!("call {index} rejected")));
        }
        let tx_hash = H256::from_low_u64_be(0xd00d_0000 + index as u64);
        if *self.unconfirmed_call.lock().unwrap() == Some(index) {
            return Err(RelayerError::Unconfirmed {
                tx_hash: Some(tx_hash),
                reason: "Timeout waiting for transfer confirmation after 5 seconds".to_string(),
            });
        }
        Ok(tx_hash)
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl Default for FixedClock {
    fn default() -> Self {
        Self(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
