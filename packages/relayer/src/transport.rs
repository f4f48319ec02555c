//! Transport task engine
//!
//! Discovers tasks on the transport contract and drives each one to a
//! terminal state: validate the source transaction, compete for the task,
//! then prove inclusion against a block the shadow ledger already holds.
//!
//! Every write is followed by a re-read. A receipt never counts as a state
//! transition; only the contract's task record does.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::hash::{bytes32_to_hex, txid_display};
use crate::history::TaskHistoryStore;
use crate::hub::LedgerClient;
use crate::merkle::{build_proof, DisplayOrderSha256d};
use crate::metrics;
use crate::retry::{ErrorClass, RetryAction, RetryConfig, RetryTracker};
use crate::source::{RawTxLookup, SourceChainAdapter};
use crate::store::{HeaderStore, TRANSPORT_LISTENER};
use crate::types::{Availability, TaskState, TransportTask};

/// Added to every competitor window so we never act on its last second
const WAIT_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Window a holder has before others may re-accept
    pub task_timeout: Duration,
    /// Confirmations required before submitting a proof
    pub confirmation_depth: u64,
    /// Delay between discovery passes
    pub task_poll_interval: Duration,
    /// Backoff for writes whose effect could not be confirmed
    pub retry: RetryConfig,
    /// Workers allowed to talk to the chains at once
    pub max_workers: usize,
    /// Rejected proofs tolerated per task before giving up for this run
    pub max_proof_attempts: u32,
    /// Multichain manager the transport contract must be registered with
    pub manager_contract: Option<Address>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(7200),
            confirmation_depth: 6,
            task_poll_interval: Duration::from_millis(60_000),
            retry: RetryConfig::exponential(
                Duration::from_millis(5000),
                Duration::from_millis(60_000),
                5,
            ),
            max_workers: 16,
            max_proof_attempts: 3,
            manager_contract: None,
        }
    }
}

/// Task state after an accept or re-accept attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Mine,
    Other,
    Ended(TaskState),
    /// Nothing observable changed; `cause` classifies the send failure if any
    Unconfirmed { cause: ErrorClass },
}

/// Task state after a proof submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Finished,
    Failed,
    Withdrawn,
    /// Another relayer re-accepted the task
    Superseded,
    /// Still ours with the same timestamp: the proof was not accepted
    Rejected,
    Unconfirmed { cause: ErrorClass },
}

/// Final word of a worker on one task for this run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskVerdict {
    /// Terminal on chain; recorded in history
    Ended(TaskState),
    Superseded,
    /// Source transaction could not be found or broadcast
    Invalid,
    /// Source node does not know the transaction
    NotRecorded,
    /// Proof kept being rejected
    GaveUp,
}

impl TaskVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskVerdict::Ended(TaskState::Finished) => "finished",
            TaskVerdict::Ended(TaskState::Failed) => "failed",
            TaskVerdict::Ended(TaskState::Withdrawn) => "withdrawn",
            TaskVerdict::Ended(_) => "ended",
            TaskVerdict::Superseded => "superseded",
            TaskVerdict::Invalid => "invalid",
            TaskVerdict::NotRecorded => "not_recorded",
            TaskVerdict::GaveUp => "gave_up",
        }
    }
}

/// Result of [`create_transport_task`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { task_hash: [u8; 32] },
    AlreadyExists { state: TaskState },
    /// Write went through but the task is not ours on re-read
    NotConfirmed,
}

/// Submit a new task for `raw_tx` on behalf of the client's signer
pub async fn create_transport_task(
    ledger: &dyn LedgerClient,
    raw_tx: &[u8],
) -> Result<CreateOutcome> {
    let task_hash = txid_display(raw_tx);
    let existing = ledger
        .task_by_hash(task_hash)
        .await
        .wrap_err("Failed to read task")?;
    if existing.state != TaskState::NonExistent {
        return Ok(CreateOutcome::AlreadyExists {
            state: existing.state,
        });
    }

    let outcome = ledger
        .create_task(raw_tx)
        .await
        .wrap_err("Failed to submit createTask")?;
    debug!(
        task_hash = %bytes32_to_hex(&task_hash),
        tx_hash = %bytes32_to_hex(&outcome.tx_hash),
        success = outcome.success,
        "createTask sent"
    );

    let after = ledger
        .task_by_hash(task_hash)
        .await
        .wrap_err("Failed to re-read task")?;
    if after.state == TaskState::Created && after.user == ledger.relayer_address() {
        info!(task_hash = %bytes32_to_hex(&task_hash), "Transport task created");
        Ok(CreateOutcome::Created { task_hash })
    } else {
        Ok(CreateOutcome::NotConfirmed)
    }
}

/// Removes a task index from the in-flight set when its worker ends
struct InFlightGuard {
    set: Arc<Mutex<HashSet<u64>>>,
    index: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.index);
    }
}

/// A worker's seat in the pool. Counted as active while held.
struct PoolSlot {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        metrics::ACTIVE_TASK_WORKERS.dec();
    }
}

pub struct TransportTaskEngine {
    source: Arc<dyn SourceChainAdapter>,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn HeaderStore>,
    history: Arc<TaskHistoryStore>,
    config: TransportConfig,
    /// Seats for workers that are talking to the chains. Workers sitting
    /// out a competitor's window give theirs back.
    pool: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<u64>>>,
    active_workers: Arc<AtomicUsize>,
    peak_workers: Arc<AtomicUsize>,
}

impl TransportTaskEngine {
    pub fn new(
        source: Arc<dyn SourceChainAdapter>,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn HeaderStore>,
        history: Arc<TaskHistoryStore>,
        config: TransportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            ledger,
            store,
            history,
            pool: Arc::new(Semaphore::new(config.max_workers)),
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            active_workers: Arc::new(AtomicUsize::new(0)),
            peak_workers: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Highest number of workers that ever ran at once
    pub fn peak_workers(&self) -> usize {
        self.peak_workers.load(Ordering::SeqCst)
    }

    async fn enter_pool(&self) -> Result<PoolSlot> {
        let permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| eyre!("Task worker pool closed"))?;
        let now = self.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_workers.fetch_max(now, Ordering::SeqCst);
        metrics::ACTIVE_TASK_WORKERS.inc();
        Ok(PoolSlot {
            _permit: permit,
            active: self.active_workers.clone(),
        })
    }

    /// Give the slot back for `wait`, then queue for one again
    async fn idle(&self, slot: PoolSlot, wait: Duration) -> Result<PoolSlot> {
        drop(slot);
        tokio::time::sleep(wait).await;
        self.enter_pool().await
    }

    /// Transport must verify against our relay contract, and the shadow
    /// ledger must be close enough to the source tip to anchor proofs.
    pub async fn preflight(&self) -> Result<()> {
        let registered = self
            .ledger
            .is_registered_relay()
            .await
            .wrap_err("Failed to read transport relay binding")?;
        if !registered {
            return Err(eyre!(
                "Transport contract is not bound to relay contract {}",
                self.ledger.relay_contract()
            ));
        }

        match self.config.manager_contract {
            Some(manager) => {
                let bound = self
                    .ledger
                    .transport_manager_binding()
                    .await
                    .wrap_err("Failed to read transport manager binding")?;
                if bound != manager {
                    return Err(eyre!(
                        "Transport contract is registered with manager {}, expected {}",
                        bound,
                        manager
                    ));
                }
            }
            None => warn!("No multichain manager configured, skipping registration check"),
        }

        let source_top = self
            .source
            .top_height()
            .await
            .wrap_err("Failed to read source chain height")?;
        let shadow_height = self
            .ledger
            .shadow_height()
            .await
            .wrap_err("Failed to read shadow ledger height")?;
        let lag = source_top.abs_diff(shadow_height);
        if lag > self.config.confirmation_depth {
            return Err(eyre!(
                "Shadow ledger at {} is {} blocks from source top {}",
                shadow_height,
                lag,
                source_top
            ));
        }

        info!(
            relayer = %self.ledger.relayer_address(),
            source_top,
            shadow_height,
            "Transport preflight passed"
        );
        Ok(())
    }

    /// Discovery loop. Workers are aborted on shutdown; their tasks are
    /// picked up again from chain state on the next start.
    pub async fn run(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        self.preflight().await?;
        let known_ended = self.history.len().await;
        info!(
            max_workers = self.config.max_workers,
            known_ended,
            "Transport task engine starting"
        );

        let mut workers = JoinSet::new();

        loop {
            match self.clone().dispatch_new_tasks(&mut workers).await {
                Ok(0) => debug!("No new transport tasks"),
                Ok(count) => info!(count, "Dispatched transport tasks"),
                Err(e) => {
                    metrics::ERRORS
                        .with_label_values(&["transport", "discovery"])
                        .inc();
                    error!(error = %e, "Task discovery failed");
                }
            }

            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Task worker panicked");
                }
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = tokio::time::sleep(self.config.task_poll_interval) => {}
            }
        }

        workers.abort_all();
        info!("Transport task engine stopped");
        Ok(())
    }

    /// Spawn a worker for every task index not ended and not in flight.
    /// Returns the number spawned.
    pub async fn dispatch_new_tasks(self: Arc<Self>, workers: &mut JoinSet<()>) -> Result<usize> {
        let count = self
            .ledger
            .task_count()
            .await
            .wrap_err("Failed to read task count")?;
        metrics::KNOWN_TASKS.set(count as f64);

        let mut dispatched = 0;
        for index in 0..count {
            if self.history.contains(index).await {
                continue;
            }
            let claimed = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(index);
            if !claimed {
                continue;
            }

            let guard = InFlightGuard {
                set: self.in_flight.clone(),
                index,
            };
            let engine = self.clone();
            workers.spawn(async move {
                let _guard = guard;
                engine.work(index).await;
            });
            dispatched += 1;
        }

        if count > 0 {
            self.store
                .set_cursor(
                    TRANSPORT_LISTENER,
                    self.history.transport_address(),
                    count - 1,
                )
                .await?;
        }
        Ok(dispatched)
    }

    /// Run one task and record it if it ended
    async fn work(&self, index: u64) -> Option<TaskVerdict> {
        match self.process_task(index).await {
            Ok(verdict) => {
                metrics::TASK_VERDICTS
                    .with_label_values(&[verdict.as_str()])
                    .inc();
                if let TaskVerdict::Ended(state) = verdict {
                    if let Err(e) = self.history.record(index).await {
                        error!(index, error = %e, "Failed to record ended task");
                    }
                    info!(index, state = %state, "Transport task ended");
                } else {
                    info!(index, verdict = verdict.as_str(), "Transport task left open");
                }
                Some(verdict)
            }
            Err(e) => {
                metrics::ERRORS
                    .with_label_values(&["transport", "task"])
                    .inc();
                error!(index, error = %e, "Transport task failed");
                None
            }
        }
    }

    async fn read_task(&self, index: u64, hash: [u8; 32]) -> Result<TransportTask> {
        let record = self
            .ledger
            .task_by_hash(hash)
            .await
            .wrap_err_with(|| format!("Failed to read task {}", bytes32_to_hex(&hash)))?;
        Ok(TransportTask::new(index, hash, record))
    }

    /// Drive task `index` until it ends or this relayer has nothing left to do.
    /// Holds a pool slot except while waiting out another relayer's window.
    pub async fn process_task(&self, index: u64) -> Result<TaskVerdict> {
        let mut slot = self.enter_pool().await?;
        let hash = self
            .ledger
            .task_hash_by_index(index)
            .await
            .wrap_err_with(|| format!("Failed to read hash of task {}", index))?;
        let me = self.ledger.relayer_address();
        let timeout = self.config.task_timeout;
        let mut retry = RetryTracker::new(self.config.retry.clone());

        loop {
            let task = self.read_task(index, hash).await?;
            if task.is_ended() {
                return Ok(TaskVerdict::Ended(task.state()));
            }
            if task.is_claimed_by(me) {
                return self.finish_my_task(&task).await;
            }

            let now = self.ledger.now().await?;
            let reaccept = match task.availability(now, timeout) {
                Availability::Ended => return Ok(TaskVerdict::Ended(task.state())),
                Availability::Missing => match retry.fail(ErrorClass::Unknown) {
                    RetryAction::RetryAfter(delay) => {
                        debug!(index, task_hash = %task.hash_hex(), "Task record not visible yet");
                        slot = self.idle(slot, delay).await?;
                        continue;
                    }
                    RetryAction::GiveUp => {
                        return Err(eyre!(
                            "Task {} has no record on the transport contract after {} reads",
                            index,
                            retry.failures()
                        ))
                    }
                },
                Availability::Busy { remaining } => {
                    debug!(
                        index,
                        holder = %task.record.relayer,
                        remaining_secs = remaining.as_secs(),
                        "Task busy, waiting out holder's window"
                    );
                    slot = self.idle(slot, remaining + WAIT_MARGIN).await?;
                    continue;
                }
                Availability::Acceptable => false,
                Availability::Reacceptable => true,
            };

            if !self.check_task_valid(&task).await? {
                warn!(index, task_hash = %task.hash_hex(), "Task source transaction invalid");
                return Ok(TaskVerdict::Invalid);
            }

            let (outcome, after) = self.accept(&task, reaccept).await?;
            match outcome {
                AcceptOutcome::Mine => return self.finish_my_task(&after).await,
                AcceptOutcome::Ended(state) => return Ok(TaskVerdict::Ended(state)),
                AcceptOutcome::Other => {
                    let now = self.ledger.now().await?;
                    let wait = after.remaining_window(now, timeout) + WAIT_MARGIN;
                    debug!(
                        index,
                        holder = %after.record.relayer,
                        wait_secs = wait.as_secs(),
                        "Task taken by another relayer"
                    );
                    slot = self.idle(slot, wait).await?;
                }
                AcceptOutcome::Unconfirmed { cause } => match retry.fail(cause) {
                    RetryAction::RetryAfter(delay) => tokio::time::sleep(delay).await,
                    RetryAction::GiveUp => {
                        return Err(eyre!(
                            "Accept of task {} unconfirmed after {} attempts ({} error)",
                            index,
                            retry.failures(),
                            cause.as_str()
                        ))
                    }
                },
            }
        }
    }

    /// The task's transaction is known to the source node, or the node
    /// accepts it when we broadcast it.
    pub async fn check_task_valid(&self, task: &TransportTask) -> Result<bool> {
        let raw = &task.record.raw_tx;
        let txid = txid_display(raw);
        if txid != task.hash {
            warn!(task_hash = %task.hash_hex(), "Raw transaction does not hash to task key");
            return Ok(false);
        }

        match self
            .source
            .raw_tx(&txid)
            .await
            .wrap_err("Failed to look up source transaction")?
        {
            RawTxLookup::Found(_) => Ok(true),
            RawTxLookup::Missing(reason) => {
                debug!(task_hash = %task.hash_hex(), reason = %reason, "Broadcasting task transaction");
                self.source
                    .send_raw_tx(&txid, raw)
                    .await
                    .wrap_err("Failed to broadcast source transaction")
            }
        }
    }

    async fn accept(
        &self,
        task: &TransportTask,
        reaccept: bool,
    ) -> Result<(AcceptOutcome, TransportTask)> {
        let action = if reaccept { "reaccept" } else { "accept" };
        let sent = if reaccept {
            self.ledger.re_accept_task(task.hash).await
        } else {
            self.ledger.accept_task(task.hash).await
        };
        let cause = match &sent {
            Ok(tx) => {
                let result = if tx.success { "success" } else { "reverted" };
                metrics::TASK_ACTIONS.with_label_values(&[action, result]).inc();
                ErrorClass::Unknown
            }
            Err(e) => {
                metrics::TASK_ACTIONS.with_label_values(&[action, "error"]).inc();
                let class = ErrorClass::of(e);
                warn!(
                    task_hash = %task.hash_hex(),
                    error = %e,
                    class = class.as_str(),
                    "Accept transaction failed to send"
                );
                class
            }
        };

        let after = self.read_task(task.index, task.hash).await?;
        let me = self.ledger.relayer_address();
        let outcome = if after.is_ended() {
            AcceptOutcome::Ended(after.state())
        } else if after.is_claimed_by(me)
            && (!reaccept || after.record.last_change > task.record.last_change)
        {
            AcceptOutcome::Mine
        } else if after.state() == TaskState::Accepted && after.record.relayer != me {
            AcceptOutcome::Other
        } else {
            AcceptOutcome::Unconfirmed { cause }
        };

        debug!(task_hash = %task.hash_hex(), action, outcome = ?outcome, "Accept attempt");
        Ok((outcome, after))
    }

    /// Prove inclusion of the task's transaction and finalize it
    pub async fn finish_my_task(&self, task: &TransportTask) -> Result<TaskVerdict> {
        let mut rejected = 0u32;
        let mut retry = RetryTracker::new(self.config.retry.clone());
        let depth = self.config.confirmation_depth;

        loop {
            let Some(inclusion) = self
                .source
                .wait_tx_recorded(&task.hash)
                .await
                .wrap_err("Failed waiting for source transaction")?
            else {
                warn!(task_hash = %task.hash_hex(), "Source node does not know task transaction");
                return Ok(TaskVerdict::NotRecorded);
            };

            let list = self
                .source
                .tx_list(&inclusion.block_hash)
                .await
                .wrap_err("Failed to fetch block transactions")?;
            let position = list.position(&task.hash).ok_or_else(|| {
                eyre!(
                    "Transaction {} missing from block {}",
                    task.hash_hex(),
                    bytes32_to_hex(&inclusion.block_hash)
                )
            })?;
            let proof = build_proof::<DisplayOrderSha256d>(&list.txids, position)?;
            if !proof.verify::<DisplayOrderSha256d>(&task.hash, &list.root) {
                return Err(eyre!(
                    "Proof for {} does not match block root",
                    task.hash_hex()
                ));
            }

            if inclusion.confirmations <= depth {
                let missing = depth - inclusion.confirmations;
                if missing > 0 {
                    debug!(
                        task_hash = %task.hash_hex(),
                        confirmations = inclusion.confirmations,
                        missing,
                        "Waiting for confirmations"
                    );
                    self.source
                        .wait_new_blocks(missing)
                        .await
                        .wrap_err("Failed waiting for new source blocks")?;
                }
            }

            let sent = self
                .ledger
                .finish_task(task.hash, &proof.encode(), inclusion.block_hash)
                .await;
            let send_error = match &sent {
                Ok(tx) => {
                    let result = if tx.success { "success" } else { "reverted" };
                    metrics::TASK_ACTIONS.with_label_values(&["finish", result]).inc();
                    None
                }
                Err(e) => {
                    metrics::TASK_ACTIONS.with_label_values(&["finish", "error"]).inc();
                    let class = ErrorClass::of(e);
                    warn!(
                        task_hash = %task.hash_hex(),
                        error = %e,
                        class = class.as_str(),
                        "Finish transaction failed to send"
                    );
                    Some(class)
                }
            };
            let after = self.read_task(task.index, task.hash).await?;
            let outcome = match (self.classify_finish(task, &after), send_error) {
                // Nothing was sent, so a standing task says nothing about the proof
                (FinishOutcome::Rejected | FinishOutcome::Unconfirmed { .. }, Some(cause)) => {
                    FinishOutcome::Unconfirmed { cause }
                }
                (outcome, _) => outcome,
            };
            debug!(
                task_hash = %task.hash_hex(),
                anchor = %bytes32_to_hex(&inclusion.block_hash),
                outcome = ?outcome,
                "Proof submitted"
            );

            match outcome {
                FinishOutcome::Finished => return Ok(TaskVerdict::Ended(TaskState::Finished)),
                FinishOutcome::Failed => return Ok(TaskVerdict::Ended(TaskState::Failed)),
                FinishOutcome::Withdrawn => return Ok(TaskVerdict::Ended(TaskState::Withdrawn)),
                FinishOutcome::Superseded => return Ok(TaskVerdict::Superseded),
                FinishOutcome::Rejected => {
                    rejected += 1;
                    if rejected >= self.config.max_proof_attempts {
                        warn!(task_hash = %task.hash_hex(), rejected, "Giving up on task proof");
                        return Ok(TaskVerdict::GaveUp);
                    }
                    // The anchor may not be on the shadow ledger yet
                    self.source
                        .wait_new_blocks(1)
                        .await
                        .wrap_err("Failed waiting for new source blocks")?;
                }
                FinishOutcome::Unconfirmed { cause } => match retry.fail(cause) {
                    RetryAction::RetryAfter(delay) => tokio::time::sleep(delay).await,
                    RetryAction::GiveUp => {
                        return Err(eyre!(
                            "Finish of {} unconfirmed after {} attempts ({} error)",
                            task.hash_hex(),
                            retry.failures(),
                            cause.as_str()
                        ))
                    }
                },
            }
        }
    }

    fn classify_finish(&self, before: &TransportTask, after: &TransportTask) -> FinishOutcome {
        match after.state() {
            TaskState::Finished => FinishOutcome::Finished,
            TaskState::Failed => FinishOutcome::Failed,
            TaskState::Withdrawn => FinishOutcome::Withdrawn,
            TaskState::Accepted
                if after.record.relayer != self.ledger.relayer_address()
                    || after.record.last_change > before.record.last_change =>
            {
                FinishOutcome::Superseded
            }
            TaskState::Accepted => FinishOutcome::Rejected,
            TaskState::Created | TaskState::NonExistent => FinishOutcome::Unconfirmed {
                cause: ErrorClass::Unknown,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, U256};
    use tempfile::TempDir;

    use crate::consensus::{RelayConfig, RelayConsensusEngine};
    use crate::merkle::MerkleProof;
    use crate::store::MemoryStore;
    use crate::testing::{user_tx, FinishHook, MockSourceChain, SimulatedHub};

    const R1: Address = Address::repeat_byte(0x11);
    const R2: Address = Address::repeat_byte(0x22);
    const RELAY_BOT: Address = Address::repeat_byte(0x99);
    const USER: Address = Address::repeat_byte(0x55);

    struct Fixture {
        source: Arc<MockSourceChain>,
        hub: Arc<SimulatedHub>,
        dir: TempDir,
    }

    fn fixture(timeout: Duration) -> Fixture {
        fixture_on(MockSourceChain::new(), timeout)
    }

    fn fixture_on(source: MockSourceChain, timeout: Duration) -> Fixture {
        let source = Arc::new(source);
        let hub = SimulatedHub::new(&source.header(0).unwrap(), timeout);
        hub.set_stake(RELAY_BOT, U256::from(200u64));
        Fixture {
            source,
            hub,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn config(timeout: Duration) -> TransportConfig {
        TransportConfig {
            task_timeout: timeout,
            retry: RetryConfig::fixed(Duration::from_secs(1), 3),
            ..Default::default()
        }
    }

    async fn engine_with(f: &Fixture, relayer: Address, config: TransportConfig) -> Arc<TransportTaskEngine> {
        let history = TaskHistoryStore::open(
            f.dir.path().join("history.json"),
            f.hub.transport_address(),
        )
        .await
        .unwrap();
        TransportTaskEngine::new(
            f.source.clone(),
            Arc::new(f.hub.handle(relayer)),
            Arc::new(MemoryStore::default()),
            Arc::new(history),
            config,
        )
    }

    async fn engine(f: &Fixture, relayer: Address) -> Arc<TransportTaskEngine> {
        engine_with(f, relayer, config(Duration::from_secs(7200))).await
    }

    /// User broadcasts a transfer, it is mined into block 1, and the task is
    /// created on the hub
    async fn create_task(f: &Fixture, seed: u64) -> [u8; 32] {
        let raw = user_tx(seed);
        f.source.submit_tx(raw.clone());
        f.source.mine(1);
        let handle = f.hub.handle(USER);
        match create_transport_task(&handle, &raw).await.unwrap() {
            CreateOutcome::Created { task_hash } => task_hash,
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Extend the shadow ledger until it holds `height`
    async fn relay_up_to(f: &Fixture, height: u64) {
        if f.source.height() < height + 1 {
            f.source.mine(height + 1 - f.source.height());
        }
        let mut relay = RelayConsensusEngine::new(
            f.source.clone(),
            Arc::new(f.hub.handle(RELAY_BOT)),
            Arc::new(MemoryStore::default()),
            RelayConfig::default(),
        );
        while f.hub.top_height() < height {
            relay.run_cycle().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_end_to_end_task_finished() {
        let f = fixture(Duration::from_secs(7200));
        let task_hash = create_task(&f, 1).await;
        assert_eq!(f.source.tx_height(&task_hash), Some(1));
        relay_up_to(&f, 1).await;
        assert_eq!(f.hub.top_key(), f.source.header(1).unwrap().hash);

        let e1 = engine(&f, R1).await;
        let verdict = e1.process_task(0).await.unwrap();
        assert_eq!(verdict, TaskVerdict::Ended(TaskState::Finished));

        let record = f.hub.task(task_hash);
        assert_eq!(record.state, TaskState::Finished);
        assert_eq!(record.relayer, R1);
    }

    #[tokio::test]
    async fn test_proof_against_parent_anchor_rejected() {
        let f = fixture(Duration::from_secs(7200));
        let task_hash = create_task(&f, 2).await;
        relay_up_to(&f, 1).await;

        let handle = f.hub.handle(R1);
        assert!(handle.accept_task(task_hash).await.unwrap().success);

        let block = f.source.block(1).unwrap();
        let position = block.txids.iter().position(|t| *t == task_hash).unwrap();
        let proof = build_proof::<DisplayOrderSha256d>(&block.txids, position).unwrap();
        let h0 = f.source.header(0).unwrap();

        let outcome = handle
            .finish_task(task_hash, &proof.encode(), h0.hash)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(f.hub.task(task_hash).state, TaskState::Accepted);

        let decoded = MerkleProof::decode(&proof.encode(), block.root).unwrap();
        assert!(decoded.verify::<DisplayOrderSha256d>(&task_hash, &block.root));
        let outcome = handle
            .finish_task(task_hash, &proof.encode(), block.header.hash)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(f.hub.task(task_hash).state, TaskState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_state_machine() {
        let timeout = Duration::from_secs(100);
        let f = fixture(timeout);
        let task_hash = create_task(&f, 3).await;
        let a = f.hub.handle(R1);
        let b = f.hub.handle(R2);

        assert!(a.accept_task(task_hash).await.unwrap().success);
        let held = f.hub.task(task_hash);
        assert_eq!(held.state, TaskState::Accepted);
        assert_eq!(held.relayer, R1);

        assert!(!b.accept_task(task_hash).await.unwrap().success);
        assert!(!b.re_accept_task(task_hash).await.unwrap().success);
        assert_eq!(f.hub.task(task_hash), held);

        tokio::time::sleep(timeout + Duration::from_secs(1)).await;
        assert!(b.re_accept_task(task_hash).await.unwrap().success);
        let taken = f.hub.task(task_hash);
        assert_eq!(taken.relayer, R2);
        assert!(taken.last_change > held.last_change);
    }

    #[tokio::test]
    async fn test_accept_lost_to_other() {
        let f = fixture(Duration::from_secs(7200));
        let task_hash = create_task(&f, 4).await;
        let e1 = engine(&f, R1).await;

        let stale = e1.read_task(0, task_hash).await.unwrap();
        assert!(f.hub.handle(R2).accept_task(task_hash).await.unwrap().success);

        let (outcome, after) = e1.accept(&stale, false).await.unwrap();
        assert_eq!(outcome, AcceptOutcome::Other);
        assert_eq!(after.record.relayer, R2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaccept_after_holder_times_out() {
        let timeout = Duration::from_secs(100);
        let f = fixture(timeout);
        let task_hash = create_task(&f, 5).await;
        relay_up_to(&f, 1).await;

        assert!(f.hub.handle(R2).accept_task(task_hash).await.unwrap().success);
        let held = f.hub.task(task_hash);

        let e1 = engine_with(&f, R1, config(timeout)).await;
        let verdict = e1.process_task(0).await.unwrap();
        assert_eq!(verdict, TaskVerdict::Ended(TaskState::Finished));

        let record = f.hub.task(task_hash);
        assert_eq!(record.relayer, R1);
        assert!(record.last_change > held.last_change + timeout.as_secs());
    }

    #[tokio::test]
    async fn test_withdrawn_task_ends() {
        let f = fixture(Duration::from_secs(7200));
        let task_hash = create_task(&f, 6).await;
        assert!(f.hub.withdraw_task(task_hash));

        let e1 = engine(&f, R1).await;
        assert_eq!(
            e1.process_task(0).await.unwrap(),
            TaskVerdict::Ended(TaskState::Withdrawn)
        );
    }

    #[tokio::test]
    async fn test_invalid_task_not_accepted() {
        let f = fixture(Duration::from_secs(7200));
        let raw = user_tx(7);
        let txid = txid_display(&raw);
        f.source.refuse_tx(txid);
        let user = f.hub.handle(USER);
        assert!(matches!(
            create_transport_task(&user, &raw).await.unwrap(),
            CreateOutcome::Created { .. }
        ));

        let e1 = engine(&f, R1).await;
        assert_eq!(e1.process_task(0).await.unwrap(), TaskVerdict::Invalid);

        let record = f.hub.task(txid);
        assert_eq!(record.state, TaskState::Created);
        assert_eq!(record.relayer, Address::ZERO);
    }

    #[tokio::test]
    async fn test_broadcasts_unknown_transaction() {
        let f = fixture(Duration::from_secs(7200));
        let raw = user_tx(8);
        let user = f.hub.handle(USER);
        create_transport_task(&user, &raw).await.unwrap();

        let e1 = engine(&f, R1).await;
        let task = e1.read_task(0, txid_display(&raw)).await.unwrap();
        assert!(e1.check_task_valid(&task).await.unwrap());
        assert!(matches!(
            f.source.raw_tx(&task.hash).await.unwrap(),
            RawTxLookup::Found(_)
        ));
    }

    #[tokio::test]
    async fn test_unanchored_proof_gives_up() {
        let f = fixture(Duration::from_secs(7200));
        let task_hash = create_task(&f, 9).await;

        // Shadow ledger never gets past genesis
        let e1 = engine(&f, R1).await;
        assert_eq!(e1.process_task(0).await.unwrap(), TaskVerdict::GaveUp);
        let record = f.hub.task(task_hash);
        assert_eq!(record.state, TaskState::Accepted);
        assert_eq!(record.relayer, R1);
    }

    #[tokio::test]
    async fn test_create_refuses_existing_task() {
        let f = fixture(Duration::from_secs(7200));
        let raw = user_tx(10);
        let user = f.hub.handle(USER);
        create_transport_task(&user, &raw).await.unwrap();
        assert_eq!(
            create_transport_task(&user, &raw).await.unwrap(),
            CreateOutcome::AlreadyExists {
                state: TaskState::Created
            }
        );
    }

    #[tokio::test]
    async fn test_restart_skips_recorded_tasks() {
        let f = fixture(Duration::from_secs(7200));
        create_task(&f, 11).await;
        relay_up_to(&f, 1).await;

        let e1 = engine(&f, R1).await;
        let mut workers = JoinSet::new();
        assert_eq!(e1.clone().dispatch_new_tasks(&mut workers).await.unwrap(), 1);
        while workers.join_next().await.is_some() {}
        assert!(e1.history.contains(0).await);

        // Fresh process over the same history file
        let restarted = engine(&f, R1).await;
        let mut workers = JoinSet::new();
        assert_eq!(
            restarted.clone().dispatch_new_tasks(&mut workers).await.unwrap(),
            0
        );
        assert!(workers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_is_bounded() {
        // Transactions stay in the mempool, so each accepted task blocks on
        // confirmations while holding its slot
        let f = fixture_on(MockSourceChain::new().without_auto_mine(), Duration::from_secs(7200));
        let user = f.hub.handle(USER);
        let mut hashes = Vec::new();
        for seed in 20..26 {
            let raw = user_tx(seed);
            f.source.submit_tx(raw.clone());
            match create_transport_task(&user, &raw).await.unwrap() {
                CreateOutcome::Created { task_hash } => hashes.push(task_hash),
                other => panic!("unexpected {:?}", other),
            }
        }

        let cfg = TransportConfig {
            max_workers: 2,
            ..config(Duration::from_secs(7200))
        };
        let e1 = engine_with(&f, R1, cfg).await;
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(e1.clone().run(rx));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(e1.active_workers(), 2);
        assert_eq!(e1.peak_workers(), 2);
        let accepted = hashes
            .iter()
            .filter(|h| f.hub.task(**h).state == TaskState::Accepted)
            .count();
        assert_eq!(accepted, 2);

        tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_worker_frees_its_slot() {
        let f = fixture(Duration::from_secs(7200));
        let held = create_task(&f, 30).await;
        assert!(f.hub.handle(R2).accept_task(held).await.unwrap().success);
        let free = create_task(&f, 31).await;
        relay_up_to(&f, f.source.tx_height(&free).unwrap()).await;

        let cfg = TransportConfig {
            max_workers: 1,
            task_poll_interval: Duration::from_secs(30),
            ..config(Duration::from_secs(7200))
        };
        let e1 = engine_with(&f, R1, cfg).await;
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(e1.clone().run(rx));

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        assert_eq!(f.hub.task(free).state, TaskState::Finished);
        assert_eq!(f.hub.task(free).relayer, R1);
        assert_eq!(f.hub.task(held).relayer, R2);
        assert_eq!(e1.peak_workers(), 1);

        tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_superseded_during_finish_not_recorded() {
        let f = fixture(Duration::from_secs(7200));
        let task_hash = create_task(&f, 32).await;
        relay_up_to(&f, 1).await;
        f.hub.on_next_finish(task_hash, FinishHook::ReacceptFirst(R2));

        let e1 = engine(&f, R1).await;
        assert_eq!(e1.work(0).await, Some(TaskVerdict::Superseded));
        assert_eq!(f.hub.task(task_hash).relayer, R2);
        assert_eq!(f.hub.task(task_hash).state, TaskState::Accepted);
        assert!(!e1.history.contains(0).await);
    }

    #[tokio::test]
    async fn test_failed_task_recorded() {
        let f = fixture(Duration::from_secs(7200));
        let task_hash = create_task(&f, 33).await;
        relay_up_to(&f, 1).await;
        f.hub.on_next_finish(task_hash, FinishHook::Fail);

        let e1 = engine(&f, R1).await;
        assert_eq!(
            e1.work(0).await,
            Some(TaskVerdict::Ended(TaskState::Failed))
        );
        assert_eq!(f.hub.task(task_hash).state, TaskState::Failed);
        assert!(e1.history.contains(0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_send_errors_are_retried() {
        let f = fixture(Duration::from_secs(7200));
        let task_hash = create_task(&f, 34).await;
        relay_up_to(&f, 1).await;
        f.hub.reject_next_writes(2, "connection reset by peer");

        let e1 = engine(&f, R1).await;
        assert_eq!(
            e1.process_task(0).await.unwrap(),
            TaskVerdict::Ended(TaskState::Finished)
        );
        assert_eq!(f.hub.task(task_hash).relayer, R1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_send_error_stops_retrying() {
        let f = fixture(Duration::from_secs(7200));
        let task_hash = create_task(&f, 35).await;
        f.hub.reject_next_writes(10, "insufficient funds for gas * price + value");

        let e1 = engine(&f, R1).await;
        let started = tokio::time::Instant::now();
        let err = e1.process_task(0).await.unwrap_err();
        assert!(err.to_string().contains("permanent"));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(f.hub.task(task_hash).state, TaskState::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_task_record_gives_up() {
        let f = fixture(Duration::from_secs(7200));
        f.hub.index_unknown_task([0xab; 32]);

        let e1 = engine(&f, R1).await;
        let err = e1.process_task(0).await.unwrap_err();
        assert!(err.to_string().contains("no record"));
        assert_eq!(e1.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_preflight() {
        let f = fixture(Duration::from_secs(7200));
        let e1 = engine(&f, R1).await;
        e1.preflight().await.unwrap();

        f.source.mine(7);
        assert!(e1.preflight().await.is_err());

        relay_up_to(&f, 3).await;
        e1.preflight().await.unwrap();

        f.hub.set_relay_binding(Address::repeat_byte(0x01));
        assert!(e1.preflight().await.is_err());
    }

    #[tokio::test]
    async fn test_preflight_checks_manager_registration() {
        let f = fixture(Duration::from_secs(7200));
        let cfg = TransportConfig {
            manager_contract: Some(f.hub.manager_address()),
            ..config(Duration::from_secs(7200))
        };
        let e1 = engine_with(&f, R1, cfg).await;
        e1.preflight().await.unwrap();

        f.hub.set_manager_binding(Address::repeat_byte(0x02));
        let err = e1.preflight().await.unwrap_err();
        assert!(err.to_string().contains("manager"));
    }
}
