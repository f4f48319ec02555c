//! In-memory source chain and hub contract simulators
//!
//! Several relayer handles can share one [`SimulatedHub`], which enforces
//! the contract rules the engines depend on: parent linkage and one
//! commitment per shadow ledger slot, stake accounting, task state
//! transitions with timeouts, and Merkle verification against the anchored
//! header. The hub clock follows `tokio::time`, so paused-time tests drive
//! timeouts deterministically.

mod hub;
mod source;

pub use hub::{FinishHook, HubHandle, ShadowSubmission, SimulatedHub};
pub use source::{MockBlock, MockSourceChain};

/// Deterministic raw transaction bytes for tests
pub fn user_tx(seed: u64) -> Vec<u8> {
    let mut raw = b"user-transfer".to_vec();
    raw.extend_from_slice(&seed.to_le_bytes());
    raw
}
