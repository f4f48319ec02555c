//! Alloy-backed hub chain client
//!
//! Providers are built per call. Write providers use
//! `with_recommended_fillers()` so nonce and fees are populated; an explicit
//! gas limit keeps a reverting write observable as a failed receipt instead
//! of a failed estimate.

use std::str::FromStr;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, FixedBytes, U256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use reqwest::Url;
use tracing::{debug, info};

use super::contracts::{RelayContract, TransportContract};
use super::{LedgerClient, RELAY_STATE_ACTIVE};
use crate::error::{ChainError, ChainResult};
use crate::types::{CommitState, TaskRecord, TaskState, TxOutcome};

/// Gas limit attached to every ledger write
pub const WRITE_GAS_LIMIT: u64 = 1_000_000;

macro_rules! send_and_confirm {
    ($call:expr, $what:expr) => {{
        let pending = $call
            .gas(WRITE_GAS_LIMIT)
            .send()
            .await
            .map_err(|e| ChainError::Contract(format!("failed to send {}: {}", $what, e)))?;
        let tx_hash = *pending.tx_hash();
        debug!(tx_hash = %tx_hash, method = $what, "Hub transaction sent");

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| ChainError::Contract(format!("failed to get {} receipt: {}", $what, e)))?;

        TxOutcome {
            tx_hash: tx_hash.0,
            success: receipt.status(),
        }
    }};
}

fn call_err(method: &'static str) -> impl Fn(alloy::contract::Error) -> ChainError {
    move |e| ChainError::Contract(format!("{} call failed: {}", method, e))
}

fn to_u64(value: U256, what: &str) -> ChainResult<u64> {
    u64::try_from(value).map_err(|_| ChainError::Decode(format!("{} out of range: {}", what, value)))
}

/// Hub chain client signing with a local private key
pub struct EvmLedgerClient {
    rpc_url: Url,
    relay_address: Address,
    transport_address: Option<Address>,
    signer: PrivateKeySigner,
}

impl EvmLedgerClient {
    pub fn new(
        rpc_url: &str,
        relay_address: &str,
        transport_address: Option<&str>,
        private_key: &str,
    ) -> Result<Self> {
        let rpc_url = Url::parse(rpc_url).wrap_err("Invalid hub RPC URL")?;
        let relay_address =
            Address::from_str(relay_address).wrap_err("Invalid relay contract address")?;
        let transport_address = transport_address
            .map(|a| Address::from_str(a).wrap_err("Invalid transport contract address"))
            .transpose()?;
        let signer: PrivateKeySigner = private_key.parse().wrap_err("Invalid private key")?;

        info!(
            relayer = %signer.address(),
            relay = %relay_address,
            transport = ?transport_address,
            "Hub client initialized"
        );

        Ok(Self {
            rpc_url,
            relay_address,
            transport_address,
            signer,
        })
    }

    fn transport_address(&self) -> ChainResult<Address> {
        self.transport_address.ok_or_else(|| {
            ChainError::Contract("transport contract address not configured".to_string())
        })
    }
}

#[async_trait]
impl LedgerClient for EvmLedgerClient {
    fn relayer_address(&self) -> Address {
        self.signer.address()
    }

    fn relay_contract(&self) -> Address {
        self.relay_address
    }

    async fn relay_is_active(&self) -> ChainResult<bool> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = RelayContract::new(self.relay_address, &provider);
        let state = contract
            .getContractState()
            .call()
            .await
            .map_err(call_err("getContractState"))?
            .state;
        Ok(state == U256::from(RELAY_STATE_ACTIVE))
    }

    async fn genesis_key(&self) -> ChainResult<[u8; 32]> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = RelayContract::new(self.relay_address, &provider);
        Ok(contract
            .getGenesisHash()
            .call()
            .await
            .map_err(call_err("getGenesisHash"))?
            .genesisKey
            .0)
    }

    async fn top_shadow_key(&self) -> ChainResult<[u8; 32]> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = RelayContract::new(self.relay_address, &provider);
        Ok(contract
            .getTopKeyFromShadowLedger()
            .call()
            .await
            .map_err(call_err("getTopKeyFromShadowLedger"))?
            .topKey
            .0)
    }

    async fn shadow_height(&self) -> ChainResult<u64> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = RelayContract::new(self.relay_address, &provider);
        let height = contract
            .getTopHeight()
            .call()
            .await
            .map_err(call_err("getTopHeight"))?
            .height;
        to_u64(height, "shadow height")
    }

    async fn commit_state(
        &self,
        candidate_key: [u8; 32],
        parent_key: [u8; 32],
    ) -> ChainResult<CommitState> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = RelayContract::new(self.relay_address, &provider);
        let state = contract
            .getCommitState(FixedBytes::from(candidate_key), FixedBytes::from(parent_key))
            .call()
            .await
            .map_err(call_err("getCommitState"))?
            .commitState;
        Ok(CommitState(state))
    }

    async fn submit_shadow_update(
        &self,
        prev_raw_header: &[u8],
        candidate_key: [u8; 32],
        commitment: [u8; 32],
    ) -> ChainResult<TxOutcome> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());
        let contract = RelayContract::new(self.relay_address, &provider);

        let call = contract.updateShadowLedgerByRelayer(
            Bytes::copy_from_slice(prev_raw_header),
            FixedBytes::from(candidate_key),
            FixedBytes::from(commitment),
        );
        Ok(send_and_confirm!(call, "updateShadowLedgerByRelayer"))
    }

    async fn required_stake(&self) -> ChainResult<U256> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = RelayContract::new(self.relay_address, &provider);
        Ok(contract
            .getRequireStake()
            .call()
            .await
            .map_err(call_err("getRequireStake"))?
            .requiredStake)
    }

    async fn my_stake(&self) -> ChainResult<U256> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = RelayContract::new(self.relay_address, &provider);
        // getMyStake reads msg.sender
        Ok(contract
            .getMyStake()
            .from(self.signer.address())
            .call()
            .await
            .map_err(call_err("getMyStake"))?
            .stake)
    }

    async fn stake(&self, amount: U256) -> ChainResult<TxOutcome> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());
        let contract = RelayContract::new(self.relay_address, &provider);

        let call = contract.becomeRelayer().value(amount);
        Ok(send_and_confirm!(call, "becomeRelayer"))
    }

    async fn transport_relay_binding(&self) -> ChainResult<Address> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = TransportContract::new(self.transport_address()?, &provider);
        Ok(contract
            .getRelayContract()
            .call()
            .await
            .map_err(call_err("getRelayContract"))?
            .relay)
    }

    async fn transport_manager_binding(&self) -> ChainResult<Address> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = TransportContract::new(self.transport_address()?, &provider);
        Ok(contract
            .getMultiChain()
            .call()
            .await
            .map_err(call_err("getMultiChain"))?
            .manager)
    }

    async fn task_count(&self) -> ChainResult<u64> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = TransportContract::new(self.transport_address()?, &provider);
        let count = contract
            .getTaskNum()
            .call()
            .await
            .map_err(call_err("getTaskNum"))?
            .count;
        to_u64(count, "task count")
    }

    async fn task_hash_by_index(&self, index: u64) -> ChainResult<[u8; 32]> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = TransportContract::new(self.transport_address()?, &provider);
        Ok(contract
            .getTaskHashByNum(U256::from(index))
            .call()
            .await
            .map_err(call_err("getTaskHashByNum"))?
            .taskHash
            .0)
    }

    async fn task_by_hash(&self, task_hash: [u8; 32]) -> ChainResult<TaskRecord> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = TransportContract::new(self.transport_address()?, &provider);
        let task = contract
            .getTaskByHash(FixedBytes::from(task_hash))
            .call()
            .await
            .map_err(call_err("getTaskByHash"))?;

        let code = to_u64(task.state, "task state")?;
        let state = u8::try_from(code)
            .ok()
            .and_then(TaskState::from_u8)
            .ok_or_else(|| ChainError::Decode(format!("unknown task state {}", code)))?;

        Ok(TaskRecord {
            user: task.user,
            relayer: task.relayer,
            raw_tx: task.rawTx.to_vec(),
            state,
            last_change: to_u64(task.timestamp, "task timestamp")?,
        })
    }

    async fn create_task(&self, raw_tx: &[u8]) -> ChainResult<TxOutcome> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());
        let contract = TransportContract::new(self.transport_address()?, &provider);

        let call = contract.createTask(Bytes::copy_from_slice(raw_tx));
        Ok(send_and_confirm!(call, "createTask"))
    }

    async fn accept_task(&self, task_hash: [u8; 32]) -> ChainResult<TxOutcome> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());
        let contract = TransportContract::new(self.transport_address()?, &provider);

        let call = contract.acceptTask(FixedBytes::from(task_hash));
        Ok(send_and_confirm!(call, "acceptTask"))
    }

    async fn re_accept_task(&self, task_hash: [u8; 32]) -> ChainResult<TxOutcome> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());
        let contract = TransportContract::new(self.transport_address()?, &provider);

        let call = contract.reAcceptTask(FixedBytes::from(task_hash));
        Ok(send_and_confirm!(call, "reAcceptTask"))
    }

    async fn finish_task(
        &self,
        task_hash: [u8; 32],
        proof: &[u8],
        anchor_key: [u8; 32],
    ) -> ChainResult<TxOutcome> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());
        let contract = TransportContract::new(self.transport_address()?, &provider);

        let call = contract.finishTask(
            FixedBytes::from(task_hash),
            Bytes::copy_from_slice(proof),
            Bytes::copy_from_slice(&anchor_key),
        );
        Ok(send_and_confirm!(call, "finishTask"))
    }

    async fn now(&self) -> ChainResult<u64> {
        // Task timestamps come from block time, which tracks wall clock
        Ok(chrono::Utc::now().timestamp().max(0) as u64)
    }
}
