use ethers::types::H256;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Disbursement failed: {0}")]
    Disbursement(String),

    /// A transfer that may have been broadcast but whose outcome was never
    /// observed. The allocation it claims stays held.
    #[error("Transfer outcome unknown (submitted {tx_hash:?}): {reason}")]
    Unconfirmed {
        tx_hash: Option<H256>,
        reason: String,
    },

    #[error("Timeout waiting for {operation} after {seconds} seconds")]
    Timeout {
        operation: String,
        seconds: u64,
    },

    #[error("Relayer already running")]
    AlreadyRunning,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for RelayerError {
    fn from(e: sqlx::Error) -> Self {
        RelayerError::Ledger(e.to_string())
    }
}

impl RelayerError {
    /// Errors that fail a whole poll and are retried on the next tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayerError::Rpc(_) | RelayerError::Timeout { .. } | RelayerError::Ledger(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayerError>;

/// Bound an RPC future by `limit`, mapping expiry to [`RelayerError::Timeout`].
pub async fn with_deadline<T, F>(operation: &str, limit: std::time::Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayerError::Timeout {
            operation: operation.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}
