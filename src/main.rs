use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use migration_relayer::config::RelayerSettings;
use migration_relayer::contracts;
use migration_relayer::logging::init_logging;
use migration_relayer::{
    ContractOracle, EthersChain, LedgerStore, PgLedger, RelayStatus, RelayerService,
    SystemClock, TokenDisburser,
};

#[derive(Parser, Debug)]
#[command(name = "migration-relayer", about = "V1 -> V2 token migration relayer")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "RELAYER_CONFIG", default_value = "config/relayer.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relayer until Ctrl-C
    Run,
    /// Print ledger rows awaiting operator action as JSON
    List {
        #[arg(long, value_enum, default_value_t = ListStatus::Failed)]
        status: ListStatus,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Create the ledger table
    Migrate,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ListStatus {
    Failed,
    Pending,
}

impl From<ListStatus> for RelayStatus {
    fn from(s: ListStatus) -> Self {
        match s {
            ListStatus::Failed => RelayStatus::Failed,
            ListStatus::Pending => RelayStatus::Pending,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = RelayerSettings::from_file(&cli.config)?;
    init_logging(&settings.logging);

    let ledger = Arc::new(
        PgLedger::connect(&settings.database_url)
            .await
            .context("connecting to ledger database")?,
    );

    match cli.command {
        Command::Migrate => {
            ledger.migrate().await?;
        }
        Command::List { status, limit } => {
            let records = ledger.list_by_status(status.into(), limit).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Run => {
            let (config, wallet) = settings.validate()?;
            ledger.migrate().await?;

            let client = contracts::connect(&settings.rpc_url, wallet).await?;
            let chain = Arc::new(EthersChain::new(
                client.clone(),
                config.v1_token,
                config.v2_token,
                config.relayer_address,
            ));
            let oracle = Arc::new(ContractOracle::new(client.clone(), config.migration_contract));
            let disburser = Arc::new(TokenDisburser::new(
                client,
                config.v1_token,
                config.v2_token,
                config.disbursement_confirmations,
                config.rpc_timeout,
                config.confirmation_timeout,
            ));

            let service = RelayerService::new(
                config,
                chain,
                oracle,
                ledger,
                disburser,
                Arc::new(SystemClock),
            );
            service.start().await?;

            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;

            service.stop().await;
            service.stopped().await;
            let status = service.status().await;
            info!(
                relays = status.relay_count,
                returns = status.return_count,
                failures = status.failure_count,
                watermark = ?status.watermark,
                "Relayer stopped"
            );
        }
    }

    Ok(())
}
