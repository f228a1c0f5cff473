//! PostgreSQL ledger
//!
//! One append-only table keyed by the inbound transaction hash. Amounts are
//! `NUMERIC(78,0)` so any `uint256` fits; they cross the driver boundary as
//! decimal text.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;

use super::LedgerStore;
use crate::error::{RelayerError, Result};
use crate::types::{Asset, RelayRecord, RelayStatus, RelayUpdate, ReturnReason};

const SELECT_COLUMNS: &str = r#"
    SELECT tx_hash_in, sender, v1_amount_in::text AS v1_amount_in, status, outbound_asset,
           v2_amount_sent::text AS v2_amount_sent, tx_hash_out, block_number, log_index, reason,
           error, processed_at
    FROM migration_relays
"#;

pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a small pool
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the relay table and its sender index if absent
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migration_relays (
                tx_hash_in      TEXT PRIMARY KEY,
                sender          TEXT NOT NULL,
                v1_amount_in    NUMERIC(78, 0) NOT NULL,
                status          TEXT NOT NULL,
                outbound_asset  TEXT,
                v2_amount_sent  NUMERIC(78, 0),
                tx_hash_out     TEXT,
                block_number    BIGINT NOT NULL,
                log_index       BIGINT NOT NULL,
                reason          TEXT,
                error           TEXT,
                processed_at    TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS migration_relays_sender_status_idx \
             ON migration_relays (sender, status)",
        )
        .execute(&self.pool)
        .await?;

        info!("migration_relays table ready");
        Ok(())
    }
}

fn hex(value: impl std::fmt::LowerHex) -> String {
    format!("{value:#x}")
}

fn parse_hash(column: &str, raw: &str) -> Result<H256> {
    H256::from_str(raw).map_err(|e| RelayerError::Ledger(format!("bad {column} {raw}: {e}")))
}

fn parse_amount(column: &str, raw: &str) -> Result<U256> {
    U256::from_dec_str(raw).map_err(|e| RelayerError::Ledger(format!("bad {column} {raw}: {e}")))
}

fn row_to_record(row: &PgRow) -> Result<RelayRecord> {
    let sender: String = row.try_get("sender")?;
    let v1_amount_in: String = row.try_get("v1_amount_in")?;
    let status: String = row.try_get("status")?;
    let outbound_asset: Option<String> = row.try_get("outbound_asset")?;
    let v2_amount_sent: Option<String> = row.try_get("v2_amount_sent")?;
    let tx_hash_in: String = row.try_get("tx_hash_in")?;
    let tx_hash_out: Option<String> = row.try_get("tx_hash_out")?;
    let block_number: i64 = row.try_get("block_number")?;
    let log_index: i64 = row.try_get("log_index")?;
    let reason: Option<String> = row.try_get("reason")?;
    let processed_at: DateTime<Utc> = row.try_get("processed_at")?;

    Ok(RelayRecord {
        tx_hash_in: parse_hash("tx_hash_in", &tx_hash_in)?,
        sender: Address::from_str(&sender)
            .map_err(|e| RelayerError::Ledger(format!("bad sender {sender}: {e}")))?,
        v1_amount_in: parse_amount("v1_amount_in", &v1_amount_in)?,
        status: status.parse()?,
        outbound_asset: outbound_asset.as_deref().map(Asset::from_str).transpose()?,
        v2_amount_sent: v2_amount_sent
            .as_deref()
            .map(|v| parse_amount("v2_amount_sent", v))
            .transpose()?,
        tx_hash_out: tx_hash_out
            .as_deref()
            .map(|h| parse_hash("tx_hash_out", h))
            .transpose()?,
        block_number: block_number as u64,
        log_index: log_index as u64,
        reason: reason.as_deref().map(ReturnReason::from_str).transpose()?,
        error: row.try_get("error")?,
        processed_at,
    })
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn find(&self, tx_hash_in: H256) -> Result<Option<RelayRecord>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE tx_hash_in = $1"))
            .bind(hex(tx_hash_in))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn insert_if_absent(&self, record: &RelayRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO migration_relays
                (tx_hash_in, sender, v1_amount_in, status, outbound_asset, v2_amount_sent,
                 tx_hash_out, block_number, log_index, reason, error, processed_at)
            VALUES ($1, $2, $3::numeric, $4, $5, $6::numeric, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (tx_hash_in) DO NOTHING
            "#,
        )
        .bind(hex(record.tx_hash_in))
        .bind(hex(record.sender))
        .bind(record.v1_amount_in.to_string())
        .bind(record.status.as_str())
        .bind(record.outbound_asset.map(|a| a.as_str()))
        .bind(record.v2_amount_sent.map(|a| a.to_string()))
        .bind(record.tx_hash_out.map(hex))
        .bind(record.block_number as i64)
        .bind(record.log_index as i64)
        .bind(record.reason.map(|r| r.as_str()))
        .bind(&record.error)
        .bind(record.processed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn sum_sent_amount(&self, sender: Address) -> Result<U256> {
        let total: String = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(v2_amount_sent), 0)::text
            FROM migration_relays
            WHERE sender = $1
              AND (status = 'sent' OR (status = 'pending' AND outbound_asset = 'v2'))
            "#,
        )
        .bind(hex(sender))
        .fetch_one(&self.pool)
        .await?;

        parse_amount("sum(v2_amount_sent)", &total)
    }

    async fn finalize(&self, tx_hash_in: H256, update: &RelayUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE migration_relays
            SET status = $1,
                tx_hash_out = $2,
                error = $3,
                processed_at = $4,
                v2_amount_sent = CASE WHEN $1 = 'failed' THEN NULL ELSE v2_amount_sent END
            WHERE tx_hash_in = $5 AND status = 'pending'
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.tx_hash_out.map(hex))
        .bind(&update.error)
        .bind(update.processed_at)
        .bind(hex(tx_hash_in))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_status(&self, status: RelayStatus, limit: usize) -> Result<Vec<RelayRecord>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status = $1 ORDER BY block_number, processed_at LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}
