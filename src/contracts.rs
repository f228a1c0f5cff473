//! Contract bindings and the signing client shared by the ethers-backed
//! chain, oracle and disbursement implementations.

use std::sync::Arc;

use ethers::contract::abigen;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::middleware::SignerMiddleware;
use tracing::info;

use crate::error::{RelayerError, Result};

abigen!(
    Erc20Token,
    r#"[
        function balanceOf(address account) external view returns (uint256)
        function transfer(address to, uint256 amount) external returns (bool)
        event Transfer(address indexed from, address indexed to, uint256 value)
    ]"#
);

abigen!(
    MigrationContract,
    r#"[
        function allocation(address account) external view returns (uint256)
        function claimed(address account) external view returns (uint256)
    ]"#
);

pub type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Connect to `rpc_url` and bind `wallet` to the remote chain id.
pub async fn connect(rpc_url: &str, wallet: LocalWallet) -> Result<Arc<SignerClient>> {
    let provider = Provider::<Http>::try_from(rpc_url)
        .map_err(|e| RelayerError::Configuration(format!("Invalid RPC URL {rpc_url}: {e}")))?;

    let address = wallet.address();
    let client = SignerMiddleware::new_with_provider_chain(provider, wallet)
        .await
        .map_err(|e| RelayerError::Rpc(format!("Failed to fetch chain id: {e}")))?;

    info!(
        relayer = %address,
        chain_id = client.signer().chain_id(),
        "Connected signing client"
    );

    Ok(Arc::new(client))
}
