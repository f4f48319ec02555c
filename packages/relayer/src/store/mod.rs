//! Local persisted state: a source header cache and per-listener cursors
//!
//! Postgres when a database URL is configured, otherwise a bounded
//! in-memory store. Reads always reflect the last successful write.

mod memory;
mod postgres;

use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::Result;

use crate::types::SourceBlockHeader;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Cursor names
pub const RELAY_LISTENER: &str = "relay";
pub const TRANSPORT_LISTENER: &str = "transport";

#[async_trait]
pub trait HeaderStore: Send + Sync {
    async fn header_by_hash(&self, hash: &[u8; 32]) -> Result<Option<SourceBlockHeader>>;

    async fn header_by_height(&self, height: u64) -> Result<Option<SourceBlockHeader>>;

    /// Insert or replace a header
    async fn save_header(&self, header: &SourceBlockHeader) -> Result<()>;

    /// Drop a cached header that turned out to be stale
    async fn evict_header(&self, hash: &[u8; 32]) -> Result<()>;

    async fn cursor(&self, listener: &str, contract: Address) -> Result<Option<u64>>;

    async fn set_cursor(&self, listener: &str, contract: Address, value: u64) -> Result<()>;
}
