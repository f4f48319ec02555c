use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ChainError, ChainResult};
use crate::hash::{bytes32_to_hex, double_sha256, reverse32, txid_display};
use crate::merkle::{compute_root, DisplayOrderSha256d};
use crate::source::{BlockRef, RawTxLookup, SourceChainAdapter, TxInclusion, TxList};
use crate::types::SourceBlockHeader;

/// Regtest-style difficulty bits
const REGTEST_BITS: u32 = 0x207f_ffff;

#[derive(Debug, Clone)]
pub struct MockBlock {
    pub header: SourceBlockHeader,
    pub txids: Vec<[u8; 32]>,
    pub root: [u8; 32],
}

struct ChainState {
    blocks: Vec<MockBlock>,
    mempool: Vec<[u8; 32]>,
    txs: HashMap<[u8; 32], Vec<u8>>,
    tx_height: HashMap<[u8; 32], u64>,
    refused: HashSet<[u8; 32]>,
    failures_remaining: u32,
    calls: u64,
}

/// In-memory Bitcoin-like chain producing real 80-byte headers
pub struct MockSourceChain {
    state: Mutex<ChainState>,
    auto_mine: bool,
    poll_interval: Duration,
}

impl Default for MockSourceChain {
    fn default() -> Self {
        Self::new()
    }
}

fn build_header(height: u64, parent: [u8; 32], root: [u8; 32]) -> SourceBlockHeader {
    let mut raw = Vec::with_capacity(80);
    raw.extend_from_slice(&1u32.to_le_bytes());
    raw.extend_from_slice(&reverse32(&parent));
    raw.extend_from_slice(&reverse32(&root));
    raw.extend_from_slice(&(1_700_000_000u32 + height as u32 * 600).to_le_bytes());
    raw.extend_from_slice(&REGTEST_BITS.to_le_bytes());
    raw.extend_from_slice(&(height as u32).to_le_bytes());

    SourceBlockHeader {
        height,
        hash: reverse32(&double_sha256(&raw)),
        parent_hash: parent,
        raw,
    }
}

fn coinbase(height: u64) -> Vec<u8> {
    let mut raw = b"coinbase".to_vec();
    raw.extend_from_slice(&height.to_le_bytes());
    raw
}

impl ChainState {
    fn mine_one(&mut self) -> SourceBlockHeader {
        let height = self.blocks.len() as u64;
        let parent = self
            .blocks
            .last()
            .map(|b| b.header.hash)
            .unwrap_or([0u8; 32]);

        let cb = coinbase(height);
        let cb_id = txid_display(&cb);
        self.txs.insert(cb_id, cb);

        let mut txids = vec![cb_id];
        txids.append(&mut self.mempool);
        for txid in &txids {
            self.tx_height.insert(*txid, height);
        }

        // Leaves are never empty: the coinbase is always present
        let root = compute_root::<DisplayOrderSha256d>(&txids).unwrap_or([0u8; 32]);
        let header = build_header(height, parent, root);
        self.blocks.push(MockBlock {
            header: header.clone(),
            txids,
            root,
        });
        header
    }

    fn top(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }
}

impl MockSourceChain {
    /// Chain holding only a genesis block, mining on demand while waiting
    pub fn new() -> Self {
        let mut state = ChainState {
            blocks: Vec::new(),
            mempool: Vec::new(),
            txs: HashMap::new(),
            tx_height: HashMap::new(),
            refused: HashSet::new(),
            failures_remaining: 0,
            calls: 0,
        };
        state.mine_one();
        Self {
            state: Mutex::new(state),
            auto_mine: true,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Disable on-demand mining; waits then poll until blocks are mined externally
    pub fn without_auto_mine(mut self) -> Self {
        self.auto_mine = false;
        self
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a call and fail it if failures were injected
    fn enter(&self) -> ChainResult<()> {
        let mut state = self.state();
        state.calls += 1;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(ChainError::Transport("injected connection failure".to_string()));
        }
        Ok(())
    }

    pub fn mine(&self, count: u64) -> Vec<SourceBlockHeader> {
        let mut state = self.state();
        (0..count).map(|_| state.mine_one()).collect()
    }

    /// Put a transaction in the mempool as if broadcast by its owner
    pub fn submit_tx(&self, raw: Vec<u8>) -> [u8; 32] {
        let txid = txid_display(&raw);
        let mut state = self.state();
        if state.txs.insert(txid, raw).is_none() {
            state.mempool.push(txid);
        }
        txid
    }

    /// Make the node refuse to broadcast this transaction
    pub fn refuse_tx(&self, txid: [u8; 32]) {
        self.state().refused.insert(txid);
    }

    pub fn fail_next_calls(&self, count: u32) {
        self.state().failures_remaining = count;
    }

    pub fn calls(&self) -> u64 {
        self.state().calls
    }

    pub fn height(&self) -> u64 {
        self.state().top()
    }

    pub fn block(&self, height: u64) -> Option<MockBlock> {
        self.state().blocks.get(height as usize).cloned()
    }

    pub fn header(&self, height: u64) -> Option<SourceBlockHeader> {
        self.block(height).map(|b| b.header)
    }

    pub fn tx_height(&self, txid: &[u8; 32]) -> Option<u64> {
        self.state().tx_height.get(txid).copied()
    }
}

#[async_trait]
impl SourceChainAdapter for MockSourceChain {
    fn name(&self) -> &str {
        "mock-bitcoin"
    }

    async fn top_height(&self) -> ChainResult<u64> {
        self.enter()?;
        Ok(self.state().top())
    }

    async fn block_header(&self, at: BlockRef) -> ChainResult<SourceBlockHeader> {
        self.enter()?;
        let state = self.state();
        let block = match at {
            BlockRef::Height(h) => state.blocks.get(h as usize),
            BlockRef::Hash(hash) => state.blocks.iter().find(|b| b.header.hash == hash),
        };
        block
            .map(|b| b.header.clone())
            .ok_or_else(|| ChainError::NotFound(format!("block {:?}", at)))
    }

    async fn tx_list(&self, block_hash: &[u8; 32]) -> ChainResult<TxList> {
        self.enter()?;
        let state = self.state();
        state
            .blocks
            .iter()
            .find(|b| &b.header.hash == block_hash)
            .map(|b| TxList {
                root: b.root,
                txids: b.txids.clone(),
            })
            .ok_or_else(|| ChainError::NotFound(format!("block {}", bytes32_to_hex(block_hash))))
    }

    async fn raw_tx(&self, txid: &[u8; 32]) -> ChainResult<RawTxLookup> {
        self.enter()?;
        Ok(match self.state().txs.get(txid) {
            Some(raw) => RawTxLookup::Found(raw.clone()),
            None => RawTxLookup::Missing("No such mempool or blockchain transaction".to_string()),
        })
    }

    async fn send_raw_tx(&self, txid: &[u8; 32], raw: &[u8]) -> ChainResult<bool> {
        self.enter()?;
        if txid_display(raw) != *txid || self.state().refused.contains(txid) {
            return Ok(false);
        }
        self.submit_tx(raw.to_vec());
        Ok(true)
    }

    async fn wait_tx_recorded(&self, txid: &[u8; 32]) -> ChainResult<Option<TxInclusion>> {
        self.enter()?;
        loop {
            {
                let mut state = self.state();
                if let Some(height) = state.tx_height.get(txid).copied() {
                    return Ok(Some(TxInclusion {
                        block_hash: state.blocks[height as usize].header.hash,
                        confirmations: state.top() - height + 1,
                    }));
                }
                if !state.txs.contains_key(txid) {
                    return Ok(None);
                }
                if self.auto_mine {
                    state.mine_one();
                    continue;
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_new_blocks(&self, count: u64) -> ChainResult<bool> {
        self.enter()?;
        if self.auto_mine {
            self.mine(count);
            return Ok(true);
        }
        let target = self.state().top() + count;
        while self.state().top() < target {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::bitcoin::parse_header;
    use crate::testing::user_tx;

    #[test]
    fn test_headers_link_and_parse() {
        let chain = MockSourceChain::new();
        chain.mine(3);
        for h in 1..=3 {
            let header = chain.header(h).unwrap();
            let parent = chain.header(h - 1).unwrap();
            assert!(header.links_to(&parent.hash));

            let fields = parse_header(&header.raw).unwrap();
            assert_eq!(fields.hash, header.hash);
            assert_eq!(fields.parent_hash, parent.hash);
            assert_eq!(fields.merkle_root, chain.block(h).unwrap().root);
        }
    }

    #[tokio::test]
    async fn test_mempool_tx_is_mined() {
        let chain = MockSourceChain::new();
        let txid = chain.submit_tx(user_tx(1));
        let inclusion = chain.wait_tx_recorded(&txid).await.unwrap().unwrap();
        assert_eq!(chain.tx_height(&txid), Some(1));
        assert_eq!(inclusion.block_hash, chain.header(1).unwrap().hash);
        assert_eq!(inclusion.confirmations, 1);

        let list = chain.tx_list(&inclusion.block_hash).await.unwrap();
        assert_eq!(list.txids.len(), 2);
        assert_eq!(list.position(&txid), Some(1));
    }

    #[tokio::test]
    async fn test_unknown_tx_and_refusal() {
        let chain = MockSourceChain::new();
        assert_eq!(chain.wait_tx_recorded(&[9u8; 32]).await.unwrap(), None);

        let raw = user_tx(2);
        let txid = txid_display(&raw);
        chain.refuse_tx(txid);
        assert!(!chain.send_raw_tx(&txid, &raw).await.unwrap());
        assert!(!chain.send_raw_tx(&[0u8; 32], &user_tx(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let chain = MockSourceChain::new();
        chain.fail_next_calls(1);
        assert!(chain.top_height().await.is_err());
        assert_eq!(chain.top_height().await.unwrap(), 0);
    }
}
