use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use crate::error::{ChainError, ChainResult};
use crate::hash::{header_commitment, keccak256, txid_display};
use crate::hub::LedgerClient;
use crate::merkle::{DisplayOrderSha256d, MerkleProof};
use crate::source::bitcoin::parse_header;
use crate::types::{
    CommitState, EntryState, ShadowLedgerEntry, SourceBlockHeader, TaskRecord, TaskState,
    TxOutcome,
};

/// Wall-clock start of the simulated hub clock
const BASE_TIME: u64 = 1_700_000_000;

/// One accepted `updateShadowLedgerByRelayer` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowSubmission {
    pub relayer: Address,
    pub candidate: [u8; 32],
    pub parent: [u8; 32],
}

/// Scripted contract reaction to the next `finishTask` on one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishHook {
    /// Contract fails the task instead of settling it
    Fail,
    /// `relayer` re-accepts the task just before the finish lands
    ReacceptFirst(Address),
}

#[derive(Debug, Clone)]
struct Commit {
    committer: Address,
    commitment: [u8; 32],
}

#[derive(Debug, Clone)]
struct Entry {
    parent: [u8; 32],
    height: u64,
    raw: Vec<u8>,
    committer: Address,
    commitment: [u8; 32],
}

struct HubState {
    active: bool,
    genesis: [u8; 32],
    top: [u8; 32],
    entries: HashMap<[u8; 32], Entry>,
    /// Keyed by (candidate, parent)
    commits: HashMap<([u8; 32], [u8; 32]), Commit>,
    accepted: Vec<ShadowSubmission>,
    rejected_submissions: u64,

    required_stake: U256,
    stakes: HashMap<Address, U256>,
    frozen_stakers: Vec<Address>,
    stake_calls: Vec<(Address, U256)>,

    relay_binding: Address,
    manager_binding: Address,
    timeout_secs: u64,
    task_hashes: Vec<[u8; 32]>,
    tasks: HashMap<[u8; 32], TaskRecord>,
    finish_hooks: HashMap<[u8; 32], FinishHook>,

    failures_remaining: u32,
    /// Signed writes fail with this node error while the count lasts
    write_rejections: Option<(u32, String)>,
    tx_counter: u64,
}

/// Relay and transport contracts shared by any number of relayer handles
pub struct SimulatedHub {
    state: Mutex<HubState>,
    origin: tokio::time::Instant,
    relay_address: Address,
    transport_address: Address,
    manager_address: Address,
}

impl SimulatedHub {
    /// Hub whose shadow ledger starts at `genesis`
    pub fn new(genesis: &SourceBlockHeader, task_timeout: Duration) -> Arc<Self> {
        let relay_address = Address::repeat_byte(0x5e);
        let manager_address = Address::repeat_byte(0x4d);
        let mut entries = HashMap::new();
        entries.insert(
            genesis.hash,
            Entry {
                parent: genesis.parent_hash,
                height: genesis.height,
                raw: genesis.raw.clone(),
                committer: Address::ZERO,
                commitment: [0u8; 32],
            },
        );

        Arc::new(Self {
            state: Mutex::new(HubState {
                active: true,
                genesis: genesis.hash,
                top: genesis.hash,
                entries,
                commits: HashMap::new(),
                accepted: Vec::new(),
                rejected_submissions: 0,
                required_stake: U256::from(100u64),
                stakes: HashMap::new(),
                frozen_stakers: Vec::new(),
                stake_calls: Vec::new(),
                relay_binding: relay_address,
                manager_binding: manager_address,
                timeout_secs: task_timeout.as_secs(),
                task_hashes: Vec::new(),
                tasks: HashMap::new(),
                finish_hooks: HashMap::new(),
                failures_remaining: 0,
                write_rejections: None,
                tx_counter: 0,
            }),
            origin: tokio::time::Instant::now(),
            relay_address,
            transport_address: Address::repeat_byte(0x7a),
            manager_address,
        })
    }

    /// Client for `relayer`
    pub fn handle(self: &Arc<Self>, relayer: Address) -> HubHandle {
        HubHandle {
            hub: self.clone(),
            relayer,
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> u64 {
        BASE_TIME + self.origin.elapsed().as_secs()
    }

    pub fn transport_address(&self) -> Address {
        self.transport_address
    }

    /// Manager the transport contract registers with at deployment
    pub fn manager_address(&self) -> Address {
        self.manager_address
    }

    pub fn set_manager_binding(&self, manager: Address) {
        self.state().manager_binding = manager;
    }

    pub fn set_active(&self, active: bool) {
        self.state().active = active;
    }

    pub fn set_relay_binding(&self, relay: Address) {
        self.state().relay_binding = relay;
    }

    pub fn set_required_stake(&self, amount: U256) {
        self.state().required_stake = amount;
    }

    pub fn set_stake(&self, relayer: Address, amount: U256) {
        self.state().stakes.insert(relayer, amount);
    }

    pub fn stake_of(&self, relayer: Address) -> U256 {
        self.state().stakes.get(&relayer).copied().unwrap_or_default()
    }

    /// Stake top-ups from `relayer` revert from now on
    pub fn freeze_stake(&self, relayer: Address) {
        self.state().frozen_stakers.push(relayer);
    }

    pub fn stake_calls(&self) -> Vec<(Address, U256)> {
        self.state().stake_calls.clone()
    }

    pub fn fail_next_calls(&self, count: u32) {
        self.state().failures_remaining = count;
    }

    /// The next `count` signed writes fail to send with node error `message`
    pub fn reject_next_writes(&self, count: u32, message: &str) {
        self.state().write_rejections = Some((count, message.to_string()));
    }

    pub fn on_next_finish(&self, hash: [u8; 32], hook: FinishHook) {
        self.state().finish_hooks.insert(hash, hook);
    }

    /// Append a task index whose hash has no record behind it
    pub fn index_unknown_task(&self, hash: [u8; 32]) {
        self.state().task_hashes.push(hash);
    }

    pub fn top_key(&self) -> [u8; 32] {
        self.state().top
    }

    pub fn top_height(&self) -> u64 {
        let state = self.state();
        state.entries[&state.top].height
    }

    pub fn accepted_submissions(&self) -> Vec<ShadowSubmission> {
        self.state().accepted.clone()
    }

    pub fn rejected_submissions(&self) -> u64 {
        self.state().rejected_submissions
    }

    pub fn has_commit(&self, candidate: [u8; 32], parent: [u8; 32]) -> bool {
        self.state().commits.contains_key(&(candidate, parent))
    }

    /// Revealed entries from genesis to top
    pub fn ledger(&self) -> Vec<ShadowLedgerEntry> {
        let state = self.state();
        let mut chain = Vec::new();
        let mut key = state.top;
        loop {
            let entry = &state.entries[&key];
            chain.push(ShadowLedgerEntry {
                key,
                parent_key: entry.parent,
                raw_header: entry.raw.clone(),
                committer: entry.committer,
                commit_value: entry.commitment,
                state: if key == state.genesis {
                    EntryState::Final
                } else {
                    EntryState::Committed
                },
            });
            if key == state.genesis {
                break;
            }
            key = entry.parent;
        }
        chain.reverse();
        chain
    }

    pub fn task(&self, hash: [u8; 32]) -> TaskRecord {
        self.state()
            .tasks
            .get(&hash)
            .cloned()
            .unwrap_or_else(TaskRecord::nonexistent)
    }

    /// User withdraws an open task
    pub fn withdraw_task(&self, hash: [u8; 32]) -> bool {
        let now = self.now();
        let mut state = self.state();
        match state.tasks.get_mut(&hash) {
            Some(rec) if matches!(rec.state, TaskState::Created | TaskState::Accepted) => {
                rec.state = TaskState::Withdrawn;
                rec.last_change = now;
                true
            }
            _ => false,
        }
    }

    fn next_tx(state: &mut HubState, success: bool) -> TxOutcome {
        state.tx_counter += 1;
        TxOutcome {
            tx_hash: keccak256(&state.tx_counter.to_be_bytes()),
            success,
        }
    }

    fn apply_shadow_update(
        state: &mut HubState,
        relayer: Address,
        prev_raw: &[u8],
        candidate: [u8; 32],
        commitment: [u8; 32],
    ) -> bool {
        if !state.active {
            return false;
        }
        if state.stakes.get(&relayer).copied().unwrap_or_default() < state.required_stake {
            return false;
        }
        let Some(prev) = parse_header(prev_raw) else {
            return false;
        };

        // Either re-reveal the current top, or reveal the pending child of top
        let mut reveal = None;
        let parent = if prev.hash == state.top {
            state.top
        } else if let Some(commit) = state.commits.get(&(prev.hash, state.top)) {
            if header_commitment(prev_raw, &commit.committer.into_array()) != commit.commitment {
                return false;
            }
            if prev.parent_hash != state.top {
                return false;
            }
            reveal = Some(Entry {
                parent: state.top,
                height: state.entries[&state.top].height + 1,
                raw: prev_raw.to_vec(),
                committer: commit.committer,
                commitment: commit.commitment,
            });
            prev.hash
        } else {
            return false;
        };

        if state.commits.contains_key(&(candidate, parent)) {
            return false;
        }

        if let Some(entry) = reveal {
            state.entries.insert(prev.hash, entry);
            state.top = prev.hash;
        }
        state.commits.insert(
            (candidate, parent),
            Commit {
                committer: relayer,
                commitment,
            },
        );
        state.accepted.push(ShadowSubmission {
            relayer,
            candidate,
            parent,
        });
        true
    }

    fn apply_finish(
        state: &mut HubState,
        relayer: Address,
        now: u64,
        hash: [u8; 32],
        proof: &[u8],
        anchor: [u8; 32],
    ) -> bool {
        let root = match state
            .entries
            .get(&anchor)
            .and_then(|e| parse_header(&e.raw))
        {
            Some(fields) => fields.merkle_root,
            None => return false,
        };
        let hook = state.finish_hooks.remove(&hash);
        let Some(rec) = state.tasks.get_mut(&hash) else {
            return false;
        };
        match hook {
            Some(FinishHook::ReacceptFirst(other)) if rec.state == TaskState::Accepted => {
                rec.relayer = other;
                rec.last_change = now;
            }
            Some(FinishHook::Fail) if rec.state == TaskState::Accepted && rec.relayer == relayer => {
                rec.state = TaskState::Failed;
                rec.last_change = now;
                return true;
            }
            _ => {}
        }
        if rec.state != TaskState::Accepted || rec.relayer != relayer {
            return false;
        }
        let valid = MerkleProof::decode(proof, root)
            .map(|p| p.verify::<DisplayOrderSha256d>(&hash, &root))
            .unwrap_or(false);
        if valid {
            rec.state = TaskState::Finished;
            rec.last_change = now;
        }
        valid
    }
}

/// One relayer's view of a [`SimulatedHub`]
#[derive(Clone)]
pub struct HubHandle {
    hub: Arc<SimulatedHub>,
    relayer: Address,
}

impl HubHandle {
    pub fn hub(&self) -> &Arc<SimulatedHub> {
        &self.hub
    }

    /// Yield so concurrent relayers interleave, then apply injected failures
    async fn enter(&self) -> ChainResult<MutexGuard<'_, HubState>> {
        tokio::task::yield_now().await;
        let mut state = self.hub.state();
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(ChainError::Transport("injected connection failure".to_string()));
        }
        Ok(state)
    }

    /// Like `enter`, for calls that sign and send a transaction
    async fn enter_write(&self) -> ChainResult<MutexGuard<'_, HubState>> {
        let mut state = self.enter().await?;
        if let Some((remaining, message)) = state.write_rejections.take() {
            if remaining > 1 {
                state.write_rejections = Some((remaining - 1, message.clone()));
            }
            return Err(ChainError::Rpc {
                code: -32000,
                message,
            });
        }
        Ok(state)
    }
}

#[async_trait]
impl LedgerClient for HubHandle {
    fn relayer_address(&self) -> Address {
        self.relayer
    }

    fn relay_contract(&self) -> Address {
        self.hub.relay_address
    }

    async fn relay_is_active(&self) -> ChainResult<bool> {
        Ok(self.enter().await?.active)
    }

    async fn genesis_key(&self) -> ChainResult<[u8; 32]> {
        Ok(self.enter().await?.genesis)
    }

    async fn top_shadow_key(&self) -> ChainResult<[u8; 32]> {
        Ok(self.enter().await?.top)
    }

    async fn shadow_height(&self) -> ChainResult<u64> {
        let state = self.enter().await?;
        Ok(state.entries[&state.top].height)
    }

    async fn commit_state(
        &self,
        candidate_key: [u8; 32],
        parent_key: [u8; 32],
    ) -> ChainResult<CommitState> {
        let state = self.enter().await?;
        Ok(match state.commits.get(&(candidate_key, parent_key)) {
            // Opaque non-zero value; here the committer's address
            Some(c) => CommitState(U256::from_be_slice(c.committer.as_slice())),
            None => CommitState::UNCLAIMED,
        })
    }

    async fn submit_shadow_update(
        &self,
        prev_raw_header: &[u8],
        candidate_key: [u8; 32],
        commitment: [u8; 32],
    ) -> ChainResult<TxOutcome> {
        let mut state = self.enter_write().await?;
        let ok = SimulatedHub::apply_shadow_update(
            &mut state,
            self.relayer,
            prev_raw_header,
            candidate_key,
            commitment,
        );
        if !ok {
            state.rejected_submissions += 1;
        }
        Ok(SimulatedHub::next_tx(&mut state, ok))
    }

    async fn required_stake(&self) -> ChainResult<U256> {
        Ok(self.enter().await?.required_stake)
    }

    async fn my_stake(&self) -> ChainResult<U256> {
        let state = self.enter().await?;
        Ok(state.stakes.get(&self.relayer).copied().unwrap_or_default())
    }

    async fn stake(&self, amount: U256) -> ChainResult<TxOutcome> {
        let mut state = self.enter_write().await?;
        state.stake_calls.push((self.relayer, amount));
        let ok = !state.frozen_stakers.contains(&self.relayer);
        if ok {
            let entry = state.stakes.entry(self.relayer).or_default();
            *entry = entry.saturating_add(amount);
        }
        Ok(SimulatedHub::next_tx(&mut state, ok))
    }

    async fn transport_relay_binding(&self) -> ChainResult<Address> {
        Ok(self.enter().await?.relay_binding)
    }

    async fn transport_manager_binding(&self) -> ChainResult<Address> {
        Ok(self.enter().await?.manager_binding)
    }

    async fn task_count(&self) -> ChainResult<u64> {
        Ok(self.enter().await?.task_hashes.len() as u64)
    }

    async fn task_hash_by_index(&self, index: u64) -> ChainResult<[u8; 32]> {
        let state = self.enter().await?;
        state
            .task_hashes
            .get(index as usize)
            .copied()
            .ok_or_else(|| ChainError::Contract(format!("task index {} out of range", index)))
    }

    async fn task_by_hash(&self, task_hash: [u8; 32]) -> ChainResult<TaskRecord> {
        let state = self.enter().await?;
        Ok(state
            .tasks
            .get(&task_hash)
            .cloned()
            .unwrap_or_else(TaskRecord::nonexistent))
    }

    async fn create_task(&self, raw_tx: &[u8]) -> ChainResult<TxOutcome> {
        let now = self.hub.now();
        let mut state = self.enter_write().await?;
        let hash = txid_display(raw_tx);
        let ok = !state.tasks.contains_key(&hash);
        if ok {
            state.task_hashes.push(hash);
            state.tasks.insert(
                hash,
                TaskRecord {
                    user: self.relayer,
                    relayer: Address::ZERO,
                    raw_tx: raw_tx.to_vec(),
                    state: TaskState::Created,
                    last_change: now,
                },
            );
        }
        Ok(SimulatedHub::next_tx(&mut state, ok))
    }

    async fn accept_task(&self, task_hash: [u8; 32]) -> ChainResult<TxOutcome> {
        let now = self.hub.now();
        let mut state = self.enter_write().await?;
        let ok = match state.tasks.get_mut(&task_hash) {
            Some(rec) if rec.state == TaskState::Created => {
                rec.state = TaskState::Accepted;
                rec.relayer = self.relayer;
                rec.last_change = now;
                true
            }
            _ => false,
        };
        Ok(SimulatedHub::next_tx(&mut state, ok))
    }

    async fn re_accept_task(&self, task_hash: [u8; 32]) -> ChainResult<TxOutcome> {
        let now = self.hub.now();
        let mut state = self.enter_write().await?;
        let timeout = state.timeout_secs;
        let ok = match state.tasks.get_mut(&task_hash) {
            Some(rec)
                if rec.state == TaskState::Accepted
                    && now.saturating_sub(rec.last_change) > timeout =>
            {
                rec.relayer = self.relayer;
                rec.last_change = now;
                true
            }
            _ => false,
        };
        Ok(SimulatedHub::next_tx(&mut state, ok))
    }

    async fn finish_task(
        &self,
        task_hash: [u8; 32],
        proof: &[u8],
        anchor_key: [u8; 32],
    ) -> ChainResult<TxOutcome> {
        let now = self.hub.now();
        let mut state = self.enter_write().await?;
        let ok = SimulatedHub::apply_finish(
            &mut state,
            self.relayer,
            now,
            task_hash,
            proof,
            anchor_key,
        );
        Ok(SimulatedHub::next_tx(&mut state, ok))
    }

    async fn now(&self) -> ChainResult<u64> {
        self.enter().await?;
        Ok(self.hub.now())
    }
}
