//! Core data model shared by the relay and transport engines

use std::fmt;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::hash::bytes32_to_hex;

/// Block header fetched from the source chain. Hashes are in the byte
/// order the source node displays them, which is also the shadow ledger key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlockHeader {
    pub height: u64,
    pub hash: [u8; 32],
    pub parent_hash: [u8; 32],
    pub raw: Vec<u8>,
}

impl SourceBlockHeader {
    pub fn links_to(&self, parent_key: &[u8; 32]) -> bool {
        &self.parent_hash == parent_key
    }
}

/// Lifecycle of a shadow ledger entry on the hub chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Committed,
    Challenged,
    Final,
}

/// Hub-resident mirror of a source header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowLedgerEntry {
    pub key: [u8; 32],
    pub parent_key: [u8; 32],
    pub raw_header: Vec<u8>,
    pub committer: Address,
    pub commit_value: [u8; 32],
    pub state: EntryState,
}

/// Opaque answer of the relay contract's commit-state query.
///
/// Only the distinction between zero (nobody committed the slot) and
/// anything else is relied upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitState(pub U256);

impl CommitState {
    pub const UNCLAIMED: CommitState = CommitState(U256::ZERO);

    pub fn is_unclaimed(&self) -> bool {
        self.0.is_zero()
    }
}

/// Stake multiplier a relayer keeps above the contract minimum
pub const STAKE_MULTIPLIER: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayerStake {
    pub address: Address,
    pub staked: U256,
}

impl RelayerStake {
    pub fn threshold(required: U256) -> U256 {
        required.saturating_mul(U256::from(STAKE_MULTIPLIER))
    }

    pub fn is_eligible(&self, required: U256) -> bool {
        self.staked >= Self::threshold(required)
    }

    /// Amount needed to reach the eligibility threshold
    pub fn deficit(&self, required: U256) -> U256 {
        Self::threshold(required).saturating_sub(self.staked)
    }
}

/// Transport task state as stored by the transport contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskState {
    NonExistent = 0,
    Created = 1,
    Accepted = 2,
    Withdrawn = 3,
    Finished = 4,
    Failed = 5,
}

impl TaskState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TaskState::NonExistent),
            1 => Some(TaskState::Created),
            2 => Some(TaskState::Accepted),
            3 => Some(TaskState::Withdrawn),
            4 => Some(TaskState::Finished),
            5 => Some(TaskState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Withdrawn | TaskState::Finished | TaskState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::NonExistent => "non_existent",
            TaskState::Created => "created",
            TaskState::Accepted => "accepted",
            TaskState::Withdrawn => "withdrawn",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// On-chain fields of a task as returned by `getTaskByHash`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub user: Address,
    pub relayer: Address,
    pub raw_tx: Vec<u8>,
    pub state: TaskState,
    /// Hub-chain timestamp (seconds) of the last state change
    pub last_change: u64,
}

impl TaskRecord {
    pub fn nonexistent() -> Self {
        Self {
            user: Address::ZERO,
            relayer: Address::ZERO,
            raw_tx: Vec::new(),
            state: TaskState::NonExistent,
            last_change: 0,
        }
    }
}

/// How a task not held by us may be approached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Unclaimed
    Acceptable,
    /// Claimed, but the holder's window has expired
    Reacceptable,
    /// Claimed by someone still inside their window
    Busy { remaining: Duration },
    Ended,
    /// Indexed by the contract but no record behind the hash
    Missing,
}

/// Snapshot of a transport task. `index` and `hash` never change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTask {
    pub index: u64,
    pub hash: [u8; 32],
    pub record: TaskRecord,
}

impl TransportTask {
    pub fn new(index: u64, hash: [u8; 32], record: TaskRecord) -> Self {
        Self {
            index,
            hash,
            record,
        }
    }

    pub fn hash_hex(&self) -> String {
        bytes32_to_hex(&self.hash)
    }

    pub fn state(&self) -> TaskState {
        self.record.state
    }

    pub fn is_ended(&self) -> bool {
        self.record.state.is_terminal()
    }

    pub fn is_claimed_by(&self, relayer: Address) -> bool {
        self.record.state == TaskState::Accepted && self.record.relayer == relayer
    }

    /// Seconds left in the current holder's window, clamped at zero
    pub fn remaining_window(&self, now: u64, timeout: Duration) -> Duration {
        let deadline = self.record.last_change.saturating_add(timeout.as_secs());
        Duration::from_secs(deadline.saturating_sub(now))
    }

    pub fn availability(&self, now: u64, timeout: Duration) -> Availability {
        match self.record.state {
            TaskState::Created => Availability::Acceptable,
            TaskState::Accepted => {
                if now.saturating_sub(self.record.last_change) > timeout.as_secs() {
                    Availability::Reacceptable
                } else {
                    Availability::Busy {
                        remaining: self.remaining_window(now, timeout),
                    }
                }
            }
            TaskState::Withdrawn | TaskState::Finished | TaskState::Failed => {
                Availability::Ended
            }
            TaskState::NonExistent => Availability::Missing,
        }
    }
}

/// Result of a signed hub-chain write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutcome {
    pub tx_hash: [u8; 32],
    /// Receipt status; says nothing about the resulting contract state
    pub success: bool,
}
