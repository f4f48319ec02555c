//! Hub chain access
//!
//! [`LedgerClient`] is the call layer over the relay and transport
//! contracts. Reads return snapshots; writes return only the receipt
//! status, so callers re-read state before acting on a write.

pub mod contracts;
pub mod evm;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use crate::error::ChainResult;
use crate::types::{CommitState, TaskRecord, TxOutcome};

pub use evm::EvmLedgerClient;

/// Relay contract lifecycle value meaning "operating"
pub const RELAY_STATE_ACTIVE: u64 = 2;

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Address this client signs with
    fn relayer_address(&self) -> Address;

    /// Relay contract this client talks to
    fn relay_contract(&self) -> Address;

    // Relay contract

    async fn relay_is_active(&self) -> ChainResult<bool>;

    async fn genesis_key(&self) -> ChainResult<[u8; 32]>;

    async fn top_shadow_key(&self) -> ChainResult<[u8; 32]>;

    async fn shadow_height(&self) -> ChainResult<u64>;

    async fn commit_state(
        &self,
        candidate_key: [u8; 32],
        parent_key: [u8; 32],
    ) -> ChainResult<CommitState>;

    async fn submit_shadow_update(
        &self,
        prev_raw_header: &[u8],
        candidate_key: [u8; 32],
        commitment: [u8; 32],
    ) -> ChainResult<TxOutcome>;

    async fn required_stake(&self) -> ChainResult<U256>;

    async fn my_stake(&self) -> ChainResult<U256>;

    async fn stake(&self, amount: U256) -> ChainResult<TxOutcome>;

    // Transport contract

    /// Relay contract the transport contract verifies proofs against
    async fn transport_relay_binding(&self) -> ChainResult<Address>;

    /// Transport contract is bound to our relay contract
    async fn is_registered_relay(&self) -> ChainResult<bool> {
        Ok(self.transport_relay_binding().await? == self.relay_contract())
    }

    /// Multichain manager the transport contract is registered with
    async fn transport_manager_binding(&self) -> ChainResult<Address>;

    async fn task_count(&self) -> ChainResult<u64>;

    async fn task_hash_by_index(&self, index: u64) -> ChainResult<[u8; 32]>;

    async fn task_by_hash(&self, task_hash: [u8; 32]) -> ChainResult<TaskRecord>;

    async fn create_task(&self, raw_tx: &[u8]) -> ChainResult<TxOutcome>;

    async fn accept_task(&self, task_hash: [u8; 32]) -> ChainResult<TxOutcome>;

    async fn re_accept_task(&self, task_hash: [u8; 32]) -> ChainResult<TxOutcome>;

    async fn finish_task(
        &self,
        task_hash: [u8; 32],
        proof: &[u8],
        anchor_key: [u8; 32],
    ) -> ChainResult<TxOutcome>;

    /// Hub chain clock in seconds, the reference for task timeouts
    async fn now(&self) -> ChainResult<u64>;
}
