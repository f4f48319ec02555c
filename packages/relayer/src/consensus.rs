//! Shadow ledger extension
//!
//! Each cycle reads the ledger top, resolves it to a source header and tries
//! to push the ledger one block forward. Commitments bind the candidate
//! header to this relayer's address:
//!
//! ```text
//! commitment = keccak256(candidate_raw_header || relayer_address)
//! ```
//!
//! A submission `(prev_raw, candidate_key, commitment)` reveals the pending
//! entry `prev` and commits `candidate` on top of it. Races between relayers
//! are settled by the relay contract; losing one only shows up as
//! [`StepOutcome::AlreadyClaimed`] or [`StepOutcome::Reverted`].

use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::eligibility::RelayEligibilityManager;
use crate::hash::{bytes32_to_hex, header_commitment};
use crate::hub::LedgerClient;
use crate::metrics;
use crate::retry::RetryConfig;
use crate::source::{BlockRef, SourceChainAdapter};
use crate::store::{HeaderStore, RELAY_LISTENER};
use crate::types::SourceBlockHeader;

/// Timing knobs for the relay loop
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Delay between cycles that made progress
    pub poll_interval: Duration,
    /// Delay after a failed cycle; doubles per consecutive failure
    pub retry_delay: Duration,
    /// Ceiling for the failed-cycle delay
    pub max_retry_delay: Duration,
    /// Delay when the source chain has nothing new
    pub no_new_block_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            retry_delay: Duration::from_millis(5000),
            max_retry_delay: Duration::from_millis(60_000),
            no_new_block_delay: Duration::from_millis(30_000),
        }
    }
}

/// Result of one attempt to extend the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Shadow update mined successfully
    Submitted { tx_hash: [u8; 32] },
    /// A peer already committed this slot
    AlreadyClaimed,
    /// The source chain has no block beyond the candidate yet
    SourceBehind,
    /// Source headers do not link to the ledger top
    ParentMismatch,
    /// Stake gate failed
    NotEligible,
    /// The relay contract rejected the submission
    Reverted,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Submitted { .. } => "submitted",
            StepOutcome::AlreadyClaimed => "already_claimed",
            StepOutcome::SourceBehind => "source_behind",
            StepOutcome::ParentMismatch => "parent_mismatch",
            StepOutcome::NotEligible => "not_eligible",
            StepOutcome::Reverted => "reverted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStep {
    /// Height of the already accepted header the step builds on
    pub height: u64,
    pub outcome: StepOutcome,
}

/// What a cycle saw and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub top_height: u64,
    /// True when this relayer found the slot above the top unclaimed
    pub first_committer: bool,
    pub steps: Vec<RelayStep>,
}

impl CycleReport {
    pub fn submitted(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Submitted { .. }))
            .count()
    }

    pub fn source_behind(&self) -> bool {
        self.steps
            .last()
            .map(|s| s.outcome == StepOutcome::SourceBehind)
            .unwrap_or(false)
    }

    fn result_label(&self) -> &'static str {
        match self.steps.last() {
            _ if self.submitted() > 0 => "progress",
            Some(step) => step.outcome.as_str(),
            None => "idle",
        }
    }
}

pub struct RelayConsensusEngine {
    source: Arc<dyn SourceChainAdapter>,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn HeaderStore>,
    eligibility: RelayEligibilityManager,
    config: RelayConfig,
    /// Re-armed after anything that suggests our view of the slot is stale
    needs_slot_check: bool,
    /// Stake gate result, cached for the current cycle
    eligible: Option<bool>,
    /// Failed cycles since the last good one
    failures: u32,
}

impl RelayConsensusEngine {
    pub fn new(
        source: Arc<dyn SourceChainAdapter>,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn HeaderStore>,
        config: RelayConfig,
    ) -> Self {
        Self {
            eligibility: RelayEligibilityManager::new(ledger.clone()),
            source,
            ledger,
            store,
            config,
            needs_slot_check: true,
            eligible: None,
            failures: 0,
        }
    }

    /// Relay contract must be operating and have a genesis entry
    pub async fn preflight(&self) -> Result<()> {
        let active = self
            .ledger
            .relay_is_active()
            .await
            .wrap_err("Failed to read relay contract state")?;
        if !active {
            return Err(eyre!("Relay contract is not active"));
        }

        let genesis = self
            .ledger
            .genesis_key()
            .await
            .wrap_err("Failed to read genesis key")?;
        if genesis == [0u8; 32] {
            return Err(eyre!("Relay contract has no genesis entry"));
        }

        info!(
            relayer = %self.ledger.relayer_address(),
            relay = %self.ledger.relay_contract(),
            source = self.source.name(),
            genesis = %bytes32_to_hex(&genesis),
            "Relay preflight passed"
        );
        Ok(())
    }

    /// Backoff after the current run of failed cycles
    fn error_delay(&self) -> Duration {
        RetryConfig::exponential(self.config.retry_delay, self.config.max_retry_delay, u32::MAX)
            .delay_after(self.failures)
    }

    /// Main run loop
    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        self.preflight().await?;
        info!("Relay consensus engine starting");

        loop {
            let delay = match self.run_cycle().await {
                Ok(report) => {
                    self.failures = 0;
                    metrics::RELAY_CYCLES
                        .with_label_values(&[report.result_label()])
                        .inc();
                    if report.source_behind() && report.submitted() == 0 {
                        debug!(top_height = report.top_height, "No new source block");
                        self.config.no_new_block_delay
                    } else if report
                        .steps
                        .iter()
                        .any(|s| s.outcome == StepOutcome::NotEligible)
                    {
                        self.config.retry_delay
                    } else {
                        self.config.poll_interval
                    }
                }
                Err(e) => {
                    metrics::RELAY_CYCLES.with_label_values(&["error"]).inc();
                    metrics::ERRORS
                        .with_label_values(&["relay", "cycle"])
                        .inc();
                    self.failures += 1;
                    let delay = self.error_delay();
                    error!(error = %e, failures = self.failures, ?delay, "Relay cycle failed");
                    self.needs_slot_check = true;
                    delay
                }
            };

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Relay consensus engine stopped");
        Ok(())
    }

    /// One pass: read the top, commit the slot above it if nobody has, then
    /// reveal and extend.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.eligible = None;

        let top_key = self
            .ledger
            .top_shadow_key()
            .await
            .wrap_err("Failed to read shadow ledger top")?;
        let top = self.resolve_header(&top_key).await?;
        metrics::SHADOW_TOP_HEIGHT.set(top.height as f64);

        let mut report = CycleReport {
            top_height: top.height,
            ..Default::default()
        };

        if self.needs_slot_check {
            let source_top = self.source_top().await?;
            if source_top > top.height {
                let next = self.header_at(top.height + 1).await?;
                let state = self
                    .ledger
                    .commit_state(next.hash, top_key)
                    .await
                    .wrap_err("Failed to read commit state")?;
                self.needs_slot_check = false;

                if state.is_unclaimed() {
                    info!(
                        height = next.height,
                        candidate = %bytes32_to_hex(&next.hash),
                        "Slot above top is unclaimed, committing first"
                    );
                    report.first_committer = true;
                    let outcome = self.relay_new_block(&top_key, top.height).await?;
                    report.steps.push(RelayStep {
                        height: top.height,
                        outcome,
                    });
                } else {
                    debug!(height = next.height, "Slot above top already committed");
                }
            }
        }

        let outcome = self.relay_new_block(&top_key, top.height + 1).await?;
        report.steps.push(RelayStep {
            height: top.height + 1,
            outcome,
        });

        Ok(report)
    }

    /// Submit `(header(height).raw, header(height + 1).hash, commitment)`
    /// after checking both headers link back to `top_key`.
    pub async fn relay_new_block(
        &mut self,
        top_key: &[u8; 32],
        height: u64,
    ) -> Result<StepOutcome> {
        let source_top = self.source_top().await?;
        if source_top < height + 1 {
            debug!(height, source_top, "Source chain behind candidate");
            return Ok(self.step(StepOutcome::SourceBehind));
        }

        let mut prev = self.header_at(height).await?;
        let mut candidate = self.header_at(height + 1).await?;

        if !links_to_top(&prev, &candidate, top_key) {
            warn!(
                height,
                prev = %bytes32_to_hex(&prev.hash),
                candidate = %bytes32_to_hex(&candidate.hash),
                "Cached headers do not link to ledger top, refetching"
            );
            self.store.evict_header(&prev.hash).await?;
            self.store.evict_header(&candidate.hash).await?;
            prev = self.fetch_header(BlockRef::Height(height)).await?;
            candidate = self.fetch_header(BlockRef::Height(height + 1)).await?;

            if !links_to_top(&prev, &candidate, top_key) {
                warn!(
                    height,
                    top = %bytes32_to_hex(top_key),
                    "Source headers do not link to ledger top, skipping"
                );
                self.needs_slot_check = true;
                return Ok(self.step(StepOutcome::ParentMismatch));
            }
        }

        let state = self
            .ledger
            .commit_state(candidate.hash, prev.hash)
            .await
            .wrap_err("Failed to read commit state")?;
        if !state.is_unclaimed() {
            debug!(height = candidate.height, "Candidate slot already committed");
            return Ok(self.step(StepOutcome::AlreadyClaimed));
        }

        if !self.check_eligible().await? {
            return Ok(self.step(StepOutcome::NotEligible));
        }

        let relayer = self.ledger.relayer_address();
        let commitment = header_commitment(&candidate.raw, &relayer.into_array());
        debug!(
            height = candidate.height,
            candidate = %bytes32_to_hex(&candidate.hash),
            commitment = %bytes32_to_hex(&commitment),
            "Submitting shadow ledger update"
        );

        let outcome = self
            .ledger
            .submit_shadow_update(&prev.raw, candidate.hash, commitment)
            .await
            .wrap_err("Failed to submit shadow ledger update")?;

        if !outcome.success {
            warn!(
                height = candidate.height,
                tx_hash = %bytes32_to_hex(&outcome.tx_hash),
                "Shadow ledger update reverted"
            );
            self.needs_slot_check = true;
            return Ok(self.step(StepOutcome::Reverted));
        }

        info!(
            height = candidate.height,
            candidate = %bytes32_to_hex(&candidate.hash),
            tx_hash = %bytes32_to_hex(&outcome.tx_hash),
            "Shadow ledger extended"
        );
        self.store
            .set_cursor(RELAY_LISTENER, self.ledger.relay_contract(), candidate.height)
            .await?;

        Ok(self.step(StepOutcome::Submitted {
            tx_hash: outcome.tx_hash,
        }))
    }

    /// Cache, then source by hash. Fetched headers are saved.
    pub async fn resolve_header(&self, key: &[u8; 32]) -> Result<SourceBlockHeader> {
        if let Some(header) = self.store.header_by_hash(key).await? {
            return Ok(header);
        }
        self.fetch_header(BlockRef::Hash(*key))
            .await
            .wrap_err_with(|| format!("Failed to resolve ledger key {}", bytes32_to_hex(key)))
    }

    async fn header_at(&self, height: u64) -> Result<SourceBlockHeader> {
        if let Some(header) = self.store.header_by_height(height).await? {
            return Ok(header);
        }
        self.fetch_header(BlockRef::Height(height)).await
    }

    async fn fetch_header(&self, at: BlockRef) -> Result<SourceBlockHeader> {
        let header = self
            .source
            .block_header(at)
            .await
            .wrap_err_with(|| format!("Failed to fetch source header {:?}", at))?;
        self.store.save_header(&header).await?;
        Ok(header)
    }

    async fn source_top(&self) -> Result<u64> {
        let top = self
            .source
            .top_height()
            .await
            .wrap_err("Failed to read source chain height")?;
        metrics::SOURCE_TOP_HEIGHT
            .with_label_values(&[self.source.name()])
            .set(top as f64);
        Ok(top)
    }

    async fn check_eligible(&mut self) -> Result<bool> {
        if let Some(eligible) = self.eligible {
            return Ok(eligible);
        }
        let eligible = self.eligibility.check_eligible().await?.is_eligible();
        if !eligible {
            warn!(relayer = %self.ledger.relayer_address(), "Relayer not eligible to submit");
        }
        self.eligible = Some(eligible);
        Ok(eligible)
    }

    fn step(&self, outcome: StepOutcome) -> StepOutcome {
        metrics::RELAY_STEPS
            .with_label_values(&[outcome.as_str()])
            .inc();
        outcome
    }
}

/// `prev` is the top itself or its pending child, and `candidate` follows it
fn links_to_top(prev: &SourceBlockHeader, candidate: &SourceBlockHeader, top_key: &[u8; 32]) -> bool {
    (prev.hash == *top_key || prev.links_to(top_key)) && candidate.links_to(&prev.hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, U256};

    use crate::store::MemoryStore;
    use crate::testing::{MockSourceChain, SimulatedHub};
    use crate::types::EntryState;

    const R1: Address = Address::repeat_byte(0x11);
    const R2: Address = Address::repeat_byte(0x22);
    const TIMEOUT: Duration = Duration::from_secs(7200);

    struct Fixture {
        source: Arc<MockSourceChain>,
        hub: Arc<SimulatedHub>,
    }

    fn fixture(blocks: u64) -> Fixture {
        let source = Arc::new(MockSourceChain::new().without_auto_mine());
        source.mine(blocks);
        let hub = SimulatedHub::new(&source.header(0).unwrap(), TIMEOUT);
        hub.set_stake(R1, U256::from(200u64));
        hub.set_stake(R2, U256::from(200u64));
        Fixture { source, hub }
    }

    fn engine(f: &Fixture, relayer: Address) -> (RelayConsensusEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let engine = RelayConsensusEngine::new(
            f.source.clone(),
            Arc::new(f.hub.handle(relayer)),
            store.clone(),
            RelayConfig::default(),
        );
        (engine, store)
    }

    #[tokio::test]
    async fn test_error_delay_doubles_and_caps() {
        let f = fixture(1);
        let (mut e1, _) = engine(&f, R1);
        let delays: Vec<u64> = (1..=6)
            .map(|n| {
                e1.failures = n;
                e1.error_delay().as_secs()
            })
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[tokio::test]
    async fn test_first_cycle_extends_from_genesis() {
        let f = fixture(3);
        let (mut e1, store) = engine(&f, R1);

        let report = e1.run_cycle().await.unwrap();
        assert!(report.first_committer);
        assert_eq!(report.top_height, 0);
        assert_eq!(report.submitted(), 2);

        let h1 = f.source.header(1).unwrap();
        assert_eq!(f.hub.top_key(), h1.hash);

        let ledger = f.hub.ledger();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].state, EntryState::Final);
        assert_eq!(ledger[1].key, h1.hash);
        assert_eq!(ledger[1].committer, R1);
        assert_eq!(
            ledger[1].commit_value,
            header_commitment(&h1.raw, &R1.into_array())
        );

        // Slot above the new top is committed but not revealed yet
        let h2 = f.source.header(2).unwrap();
        assert!(f.hub.has_commit(h2.hash, h1.hash));
        assert_eq!(
            store.cursor(RELAY_LISTENER, f.hub.handle(R1).relay_contract()).await.unwrap(),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_genesis_monotonicity() {
        let f = fixture(8);
        let (mut e1, _) = engine(&f, R1);
        let (mut e2, _) = engine(&f, R2);

        for _ in 0..4 {
            e1.run_cycle().await.unwrap();
            e2.run_cycle().await.unwrap();
        }

        let ledger = f.hub.ledger();
        assert!(ledger.len() > 2);
        for pair in ledger.windows(2) {
            assert_eq!(pair[1].parent_key, pair[0].key);
        }
        for (height, entry) in ledger.iter().enumerate() {
            assert_eq!(entry.key, f.source.header(height as u64).unwrap().hash);
        }
    }

    #[tokio::test]
    async fn test_second_relayer_does_not_double_submit() {
        let f = fixture(4);
        let (mut e1, _) = engine(&f, R1);
        let (mut e2, _) = engine(&f, R2);

        e1.run_cycle().await.unwrap();
        let report = e2.run_cycle().await.unwrap();

        // Slot (2, 1) belongs to R1; R2 only extends beyond it
        assert!(!report.first_committer);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].height, 2);
        assert!(matches!(report.steps[0].outcome, StepOutcome::Submitted { .. }));
        assert_eq!(f.hub.rejected_submissions(), 0);

        let submissions = f.hub.accepted_submissions();
        let mut slots: Vec<_> = submissions.iter().map(|s| (s.candidate, s.parent)).collect();
        slots.sort();
        slots.dedup();
        assert_eq!(slots.len(), submissions.len());

        // R1's commitment for block 2 was revealed by R2's submission
        let ledger = f.hub.ledger();
        assert_eq!(ledger[2].committer, R1);
    }

    #[tokio::test]
    async fn test_racing_relayers_commit_each_slot_once() {
        let f = fixture(6);
        let (mut e1, _) = engine(&f, R1);
        let (mut e2, _) = engine(&f, R2);

        for _ in 0..3 {
            let (a, b) = tokio::join!(e1.run_cycle(), e2.run_cycle());
            a.unwrap();
            b.unwrap();
        }

        let submissions = f.hub.accepted_submissions();
        let mut slots: Vec<_> = submissions.iter().map(|s| (s.candidate, s.parent)).collect();
        slots.sort();
        slots.dedup();
        assert_eq!(slots.len(), submissions.len());

        let ledger = f.hub.ledger();
        for pair in ledger.windows(2) {
            assert_eq!(pair[1].parent_key, pair[0].key);
        }
    }

    #[tokio::test]
    async fn test_source_behind_skips_submission() {
        let f = fixture(0);
        let (mut e1, _) = engine(&f, R1);

        let report = e1.run_cycle().await.unwrap();
        assert!(!report.first_committer);
        assert_eq!(
            report.steps,
            vec![RelayStep {
                height: 1,
                outcome: StepOutcome::SourceBehind
            }]
        );
        assert!(report.source_behind());
        assert!(f.hub.accepted_submissions().is_empty());
    }

    #[tokio::test]
    async fn test_poisoned_cache_is_refetched() {
        let f = fixture(3);
        let (mut e1, store) = engine(&f, R1);

        let mut bogus = f.source.header(1).unwrap();
        bogus.hash = [0xbb; 32];
        bogus.parent_hash = [0xcc; 32];
        store.save_header(&bogus).await.unwrap();

        let report = e1.run_cycle().await.unwrap();
        assert_eq!(report.submitted(), 2);
        assert_eq!(f.hub.top_key(), f.source.header(1).unwrap().hash);
        assert!(store.header_by_hash(&[0xbb; 32]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_foreign_ledger_never_submits() {
        let f = fixture(3);

        // Hub ledger rooted in a fork the source does not know
        let other = MockSourceChain::new();
        other.submit_tx(crate::testing::user_tx(7));
        other.mine(1);
        let foreign = other.header(1).unwrap();
        let hub = SimulatedHub::new(&foreign, TIMEOUT);
        hub.set_stake(R1, U256::from(200u64));

        let store = Arc::new(MemoryStore::default());
        store.save_header(&foreign).await.unwrap();
        let mut e1 = RelayConsensusEngine::new(
            f.source.clone(),
            Arc::new(hub.handle(R1)),
            store,
            RelayConfig::default(),
        );

        let report = e1.run_cycle().await.unwrap();
        assert!(report
            .steps
            .iter()
            .all(|s| s.outcome == StepOutcome::ParentMismatch));
        assert!(hub.accepted_submissions().is_empty());
        assert!(e1.needs_slot_check);
    }

    #[tokio::test]
    async fn test_not_eligible_blocks_submission() {
        let f = fixture(3);
        f.hub.set_stake(R1, U256::ZERO);
        f.hub.freeze_stake(R1);
        let (mut e1, _) = engine(&f, R1);

        let report = e1.run_cycle().await.unwrap();
        assert!(report
            .steps
            .iter()
            .all(|s| s.outcome == StepOutcome::NotEligible));
        assert!(f.hub.accepted_submissions().is_empty());
        // Gate runs once per cycle
        assert_eq!(f.hub.stake_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_error_surfaces() {
        let f = fixture(3);
        let (mut e1, _) = engine(&f, R1);
        f.hub.fail_next_calls(1);
        assert!(e1.run_cycle().await.is_err());
        assert_eq!(e1.run_cycle().await.unwrap().submitted(), 2);
    }

    #[tokio::test]
    async fn test_preflight() {
        let f = fixture(1);
        let (e1, _) = engine(&f, R1);
        e1.preflight().await.unwrap();

        f.hub.set_active(false);
        assert!(e1.preflight().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let f = fixture(3);
        let (mut e1, _) = engine(&f, R1);
        let (tx, rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move { e1.run(rx).await });
        tokio::time::sleep(Duration::from_secs(600)).await;
        tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();

        // Block 3 is committed; revealing it needs block 4
        assert_eq!(f.hub.top_height(), 2);
        assert!(f
            .hub
            .has_commit(f.source.header(3).unwrap().hash, f.hub.top_key()));
    }
}
