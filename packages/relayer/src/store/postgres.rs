use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use super::HeaderStore;
use crate::types::SourceBlockHeader;

/// Postgres-backed store
pub struct PgStore {
    pool: PgPool,
    /// Source chain name; one database may serve several source chains
    chain: String,
}

impl PgStore {
    /// Connect and apply pending migrations
    pub async fn connect(database_url: &str, chain: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .wrap_err("Failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .wrap_err("Failed to run database migrations")?;

        Ok(Self {
            pool,
            chain: chain.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_bytes32(bytes: Vec<u8>, column: &str) -> Result<[u8; 32]> {
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| eyre::eyre!("{} has {} bytes, expected 32", column, bytes.len()))
}

fn header_from_row(row: &sqlx::postgres::PgRow) -> Result<SourceBlockHeader> {
    let height: i64 = row.try_get("height")?;
    Ok(SourceBlockHeader {
        height: u64::try_from(height).wrap_err("negative header height")?,
        hash: to_bytes32(row.try_get("hash")?, "hash")?,
        parent_hash: to_bytes32(row.try_get("parent_hash")?, "parent_hash")?,
        raw: row.try_get("raw_header")?,
    })
}

#[async_trait]
impl HeaderStore for PgStore {
    async fn header_by_hash(&self, hash: &[u8; 32]) -> Result<Option<SourceBlockHeader>> {
        let row = sqlx::query(
            r#"
            SELECT height, hash, parent_hash, raw_header
            FROM source_headers
            WHERE chain = $1 AND hash = $2
            "#,
        )
        .bind(&self.chain)
        .bind(hash.as_slice())
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get header by hash")?;

        row.as_ref().map(header_from_row).transpose()
    }

    async fn header_by_height(&self, height: u64) -> Result<Option<SourceBlockHeader>> {
        let row = sqlx::query(
            r#"
            SELECT height, hash, parent_hash, raw_header
            FROM source_headers
            WHERE chain = $1 AND height = $2
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(&self.chain)
        .bind(height as i64)
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get header by height")?;

        row.as_ref().map(header_from_row).transpose()
    }

    async fn save_header(&self, header: &SourceBlockHeader) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_headers (chain, hash, height, parent_hash, raw_header)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (chain, hash) DO UPDATE
                SET height = $3, parent_hash = $4, raw_header = $5, updated_at = NOW()
            "#,
        )
        .bind(&self.chain)
        .bind(header.hash.as_slice())
        .bind(header.height as i64)
        .bind(header.parent_hash.as_slice())
        .bind(&header.raw)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to save header at height {}", header.height))?;

        Ok(())
    }

    async fn evict_header(&self, hash: &[u8; 32]) -> Result<()> {
        sqlx::query(r#"DELETE FROM source_headers WHERE chain = $1 AND hash = $2"#)
            .bind(&self.chain)
            .bind(hash.as_slice())
            .execute(&self.pool)
            .await
            .wrap_err("Failed to evict header")?;
        Ok(())
    }

    async fn cursor(&self, listener: &str, contract: Address) -> Result<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT last_processed FROM listener_cursors
            WHERE listener = $1 AND contract_address = $2
            "#,
        )
        .bind(listener)
        .bind(contract.to_string())
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get listener cursor")?;

        Ok(row.map(|r| r.0.max(0) as u64))
    }

    async fn set_cursor(&self, listener: &str, contract: Address, value: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO listener_cursors (listener, contract_address, last_processed)
            VALUES ($1, $2, $3)
            ON CONFLICT (listener, contract_address)
                DO UPDATE SET last_processed = $3, updated_at = NOW()
            "#,
        )
        .bind(listener)
        .bind(contract.to_string())
        .bind(value as i64)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to update {} cursor", listener))?;

        Ok(())
    }
}
