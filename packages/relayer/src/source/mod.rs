//! Source chain access
//!
//! Engines only see [`SourceChainAdapter`]; each supported chain provides
//! one implementation.

pub mod bitcoin;

use async_trait::async_trait;

use crate::error::ChainResult;
use crate::types::SourceBlockHeader;

pub use bitcoin::{BitcoinRpcAdapter, SourceNetwork};

/// Block selector for header lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Height(u64),
    Hash([u8; 32]),
}

/// Transaction root and ordered transaction ids of a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxList {
    pub root: [u8; 32],
    pub txids: Vec<[u8; 32]>,
}

impl TxList {
    pub fn position(&self, txid: &[u8; 32]) -> Option<usize> {
        self.txids.iter().position(|t| t == txid)
    }
}

/// Lookup result for a raw transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTxLookup {
    Found(Vec<u8>),
    /// Node does not know the transaction; carries the node's reason
    Missing(String),
}

/// Where a transaction was recorded and how deep it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxInclusion {
    pub block_hash: [u8; 32],
    pub confirmations: u64,
}

/// Uniform capability set over a source chain
#[async_trait]
pub trait SourceChainAdapter: Send + Sync {
    /// Human readable chain name for logs
    fn name(&self) -> &str;

    /// Height of the best block
    async fn top_height(&self) -> ChainResult<u64>;

    async fn block_header(&self, at: BlockRef) -> ChainResult<SourceBlockHeader>;

    async fn tx_list(&self, block_hash: &[u8; 32]) -> ChainResult<TxList>;

    async fn raw_tx(&self, txid: &[u8; 32]) -> ChainResult<RawTxLookup>;

    /// Broadcast a raw transaction. `Ok(false)` means the node refused it.
    async fn send_raw_tx(&self, txid: &[u8; 32], raw: &[u8]) -> ChainResult<bool>;

    /// Block until the transaction is in a block. `None` when the node does
    /// not know the transaction at all.
    async fn wait_tx_recorded(&self, txid: &[u8; 32]) -> ChainResult<Option<TxInclusion>>;

    /// Block until `count` blocks past the current top exist
    async fn wait_new_blocks(&self, count: u64) -> ChainResult<bool>;
}
