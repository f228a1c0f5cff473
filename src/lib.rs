pub mod chain;
pub mod config;
pub mod contracts;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod logging;
pub mod oracle;
pub mod poller;
pub mod processor;
pub mod service;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use chain::{ChainClient, EthersChain};
pub use config::RelayerSettings;
pub use error::*;
pub use executor::{Disburser, TokenDisburser};
pub use ledger::{LedgerStore, MemoryLedger, PgLedger};
pub use oracle::{AllocationOracle, ContractOracle};
pub use service::RelayerService;
pub use types::*;
