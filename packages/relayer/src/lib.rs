//! Hub chain relayer
//!
//! Mirrors a source chain's headers into the hub chain's shadow ledger and
//! finalizes cross-chain transport tasks with Merkle inclusion proofs.
//!
//! - [`consensus`]: shadow ledger extension with commit-reveal submissions
//! - [`transport`]: task discovery, competitive acceptance and proofs
//! - [`eligibility`]: stake gate run before any ledger submission
//! - [`merkle`]: Bitcoin-style transaction Merkle proofs
//! - [`source`], [`hub`]: chain access behind [`source::SourceChainAdapter`]
//!   and [`hub::LedgerClient`]
//! - [`store`], [`history`]: header cache, cursors and ended-task history

pub mod api;
pub mod config;
pub mod consensus;
pub mod eligibility;
pub mod error;
pub mod hash;
pub mod history;
pub mod hub;
pub mod merkle;
pub mod metrics;
pub mod retry;
pub mod source;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
