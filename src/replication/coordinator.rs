//! Catch-up coordinator.
//!
//! A timer-driven state machine that keeps the local store in step with a
//! peer. Each tick either pulls transactions (`TX_PULLING`) or replaces the
//! local store with a copy (`STORE_COPYING`). Retryable failures leave the
//! state as it is for the next tick; anything else is a panic, which poisons
//! the database health and parks the coordinator in `FAULTED` for good.

use crate::config::CatchupConfig;
use crate::core::store::{GraphStore, StorageEngine};
use crate::error::{KiteError, Result};
use crate::metrics::{CatchupCounters, CatchupMetrics, CatchupPosition};
use crate::replication::applier::BatchingTxApplier;
use crate::replication::client::{
  unexpected_response, CatchUpClient, CatchupTransport, Dispatch, ResponseDispatcher,
};
use crate::replication::health::DatabaseHealth;
use crate::replication::local_database::LocalDatabase;
use crate::replication::peer::PeerSelector;
use crate::replication::protocol::{
  CatchupErrorKind, CatchupRequest, CatchupResponse, CoordinatorState, PullRequest,
};
use crate::replication::scheduler::{RepeatingTask, TaskControl};
use crate::replication::store_copy::StoreCopyProcess;
use crate::types::{StoreId, TxId};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const WORKER_NAME: &str = "kitedb-catchup";

// ============================================================================
// Up-to-date signal
// ============================================================================

#[derive(Debug, Default)]
struct UpToDateInner {
  outcome: Mutex<Option<std::result::Result<bool, String>>>,
  done: Condvar,
}

/// Resolves once: `true` the first time the coordinator reaches the end of
/// the upstream stream, or an error if the coordinator panics first.
#[derive(Debug, Clone, Default)]
pub struct UpToDateFuture {
  inner: Arc<UpToDateInner>,
}

impl UpToDateFuture {
  fn resolve(&self, outcome: std::result::Result<bool, String>) -> bool {
    let mut slot = self.inner.outcome.lock();
    if slot.is_some() {
      return false;
    }
    *slot = Some(outcome);
    self.inner.done.notify_all();
    true
  }

  pub fn is_done(&self) -> bool {
    self.inner.outcome.lock().is_some()
  }

  /// Current outcome without waiting.
  pub fn get(&self) -> Option<Result<bool>> {
    self
      .inner
      .outcome
      .lock()
      .clone()
      .map(|outcome| outcome.map_err(KiteError::DatabasePanicked))
  }

  pub fn wait(&self, timeout: Duration) -> Option<Result<bool>> {
    let deadline = Instant::now() + timeout;
    let mut slot = self.inner.outcome.lock();
    while slot.is_none() {
      if self.inner.done.wait_until(&mut slot, deadline).timed_out() {
        break;
      }
    }
    slot
      .clone()
      .map(|outcome| outcome.map_err(KiteError::DatabasePanicked))
  }
}

// ============================================================================
// Pull dispatch
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullOutcome {
  EndOfBatch { latest_tx_id: TxId },
  EndOfStream { latest_tx_id: TxId },
  Pruned { requested_tx_id: TxId, log_floor_tx_id: TxId },
  StoreIdMismatch { remote: StoreId },
}

struct TxPullDispatcher<'a, S: StorageEngine> {
  applier: &'a BatchingTxApplier<S>,
  expected_store_id: StoreId,
}

impl<S: StorageEngine> ResponseDispatcher for TxPullDispatcher<'_, S> {
  type Output = PullOutcome;

  fn on_response(&mut self, response: CatchupResponse) -> Result<Dispatch<PullOutcome>> {
    match response {
      CatchupResponse::Transaction { store_id, tx } => {
        if store_id != self.expected_store_id {
          return Err(KiteError::ProtocolViolation(format!(
            "pulled transaction {} from store {store_id}",
            tx.tx_id
          )));
        }
        self.applier.queue(tx)?;
        Ok(Dispatch::Continue)
      }
      CatchupResponse::EndOfBatch { latest_tx_id } => {
        Ok(Dispatch::Complete(PullOutcome::EndOfBatch { latest_tx_id }))
      }
      CatchupResponse::EndOfStream { latest_tx_id } => {
        Ok(Dispatch::Complete(PullOutcome::EndOfStream { latest_tx_id }))
      }
      CatchupResponse::Pruned {
        requested_tx_id,
        log_floor_tx_id,
      } => Ok(Dispatch::Complete(PullOutcome::Pruned {
        requested_tx_id,
        log_floor_tx_id,
      })),
      CatchupResponse::Error {
        kind: CatchupErrorKind::StoreIdMismatch { remote },
        ..
      } => Ok(Dispatch::Complete(PullOutcome::StoreIdMismatch { remote })),
      CatchupResponse::Error { kind, message } => Err(KiteError::Network(format!(
        "peer refused pull ({kind}): {message}"
      ))),
      CatchupResponse::FileHeader { .. }
      | CatchupResponse::FileChunk { .. }
      | CatchupResponse::StoreCopyFinished { .. }
      | CatchupResponse::StoreIdReply { .. } => unexpected_response(&response),
    }
  }
}

// ============================================================================
// Coordinator
// ============================================================================

struct CoordinatorInner<S: StorageEngine> {
  state: AtomicU8,
  tick_lock: Mutex<()>,
  local_db: Arc<LocalDatabase<S>>,
  applier: Arc<BatchingTxApplier<S>>,
  client: Arc<CatchUpClient>,
  selector: Arc<dyn PeerSelector>,
  store_copy: StoreCopyProcess<S>,
  health: Arc<DatabaseHealth>,
  up_to_date: UpToDateFuture,
  upstream_tx_id: AtomicU64,
  counters: CatchupCounters,
}

pub struct CatchupCoordinator<S: StorageEngine = GraphStore> {
  config: CatchupConfig,
  inner: Arc<CoordinatorInner<S>>,
  worker: Mutex<Option<RepeatingTask>>,
}

impl<S: StorageEngine> std::fmt::Debug for CatchupCoordinator<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CatchupCoordinator")
      .field("state", &self.state())
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

impl<S: StorageEngine> CatchupCoordinator<S> {
  pub fn new(
    config: CatchupConfig,
    local_db: Arc<LocalDatabase<S>>,
    selector: Arc<dyn PeerSelector>,
    transport: Arc<dyn CatchupTransport>,
  ) -> Result<Self> {
    config.validate()?;
    let client = Arc::new(CatchUpClient::new(
      transport,
      config.request_timeout_duration(),
    ));
    let applier = Arc::new(BatchingTxApplier::new(
      Arc::clone(&local_db),
      config.tx_apply_policy,
    ));
    let store_copy = StoreCopyProcess::new(Arc::clone(&local_db), Arc::clone(&client));
    let health = Arc::clone(local_db.health());

    Ok(Self {
      config,
      inner: Arc::new(CoordinatorInner {
        state: AtomicU8::new(CoordinatorState::TxPulling as u8),
        tick_lock: Mutex::new(()),
        local_db,
        applier,
        client,
        selector,
        store_copy,
        health,
        up_to_date: UpToDateFuture::default(),
        upstream_tx_id: AtomicU64::new(0),
        counters: CatchupCounters::new(),
      }),
      worker: Mutex::new(None),
    })
  }

  /// Position the applier at the local store and start ticking. A second
  /// call while running does nothing.
  pub fn start(&self) -> Result<()> {
    let mut worker = self.worker.lock();
    if worker.as_ref().is_some_and(RepeatingTask::is_running) {
      return Ok(());
    }
    if self.state() == CoordinatorState::Faulted {
      return Err(KiteError::IllegalState(
        "catch-up coordinator is faulted".to_string(),
      ));
    }

    self.inner.applier.start()?;
    let inner = Arc::clone(&self.inner);
    *worker = Some(RepeatingTask::spawn(
      WORKER_NAME,
      self.config.tick_interval_duration(),
      self.config.tick_jitter_duration(),
      move || inner.on_timeout(),
    )?);
    info!(
      interval_ms = self.config.tick_interval_ms,
      jitter_ms = self.config.tick_jitter_ms,
      "catch-up coordinator started"
    );
    Ok(())
  }

  /// Cancel ticking and wait for any tick in flight. No tick body runs after
  /// this returns.
  pub fn stop(&self) {
    let task = self.worker.lock().take();
    if let Some(mut task) = task {
      task.stop();
      info!("catch-up coordinator stopped");
    }
    drop(self.inner.tick_lock.lock());
  }

  pub fn is_running(&self) -> bool {
    self
      .worker
      .lock()
      .as_ref()
      .is_some_and(RepeatingTask::is_running)
  }

  pub fn state(&self) -> CoordinatorState {
    self.inner.state()
  }

  /// Run one tick on the calling thread. Ticks never overlap.
  pub fn on_timeout(&self) {
    self.inner.on_timeout();
  }

  pub fn panic(&self, error: KiteError) {
    self.inner.panic(error);
  }

  pub fn up_to_date_future(&self) -> UpToDateFuture {
    self.inner.up_to_date.clone()
  }

  /// Status line such as `TX_PULLING (120 of 500)`: last applied id of the
  /// latest upstream id seen.
  pub fn describe_state(&self) -> String {
    let applied = self.inner.applier.last_applied_tx_id();
    let upstream = self.inner.upstream_tx_id.load(Ordering::Acquire).max(applied);
    format!("{} ({applied} of {upstream})", self.state())
  }

  pub fn applier(&self) -> &Arc<BatchingTxApplier<S>> {
    &self.inner.applier
  }

  pub fn local_database(&self) -> &Arc<LocalDatabase<S>> {
    &self.inner.local_db
  }

  pub fn config(&self) -> &CatchupConfig {
    &self.config
  }

  pub fn metrics(&self) -> CatchupMetrics {
    let inner = &self.inner;
    CatchupMetrics::collect(
      &inner.counters,
      CatchupPosition {
        state: inner.state(),
        last_applied_tx_id: inner.applier.last_applied_tx_id(),
        last_queued_tx_id: inner.applier.last_queued_tx_id(),
        upstream_tx_id: inner.upstream_tx_id.load(Ordering::Acquire),
        transactions_applied: inner.applier.stats().transactions_applied,
        up_to_date: matches!(inner.up_to_date.get(), Some(Ok(true))),
        healthy: inner.health.is_healthy(),
      },
    )
  }
}

impl<S: StorageEngine> Drop for CatchupCoordinator<S> {
  fn drop(&mut self) {
    self.stop();
  }
}

impl<S: StorageEngine> CoordinatorInner<S> {
  fn state(&self) -> CoordinatorState {
    CoordinatorState::from_u8(self.state.load(Ordering::Acquire))
      .unwrap_or(CoordinatorState::Faulted)
  }

  /// Move to `to` unless the coordinator is faulted.
  fn transition(&self, to: CoordinatorState) {
    let faulted = CoordinatorState::Faulted as u8;
    let result = self
      .state
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        (current != faulted).then_some(to as u8)
      });
    if let Ok(previous) = result {
      if previous != to as u8 {
        info!(
          from = %CoordinatorState::from_u8(previous).unwrap_or(CoordinatorState::Faulted),
          to = %to,
          "catch-up state transition"
        );
      }
    }
  }

  fn on_timeout(&self) -> TaskControl {
    let _tick = self.tick_lock.lock();
    let result = match self.state() {
      CoordinatorState::TxPulling => {
        self.counters.record_tick();
        self.pull_transactions()
      }
      CoordinatorState::StoreCopying => {
        self.counters.record_tick();
        self.copy_store()
      }
      CoordinatorState::Faulted => {
        debug!("tick ignored: catch-up coordinator is faulted");
        return TaskControl::Stop;
      }
    };

    if let Err(error) = result {
      self.panic(error);
    }
    if self.state() == CoordinatorState::Faulted {
      TaskControl::Stop
    } else {
      TaskControl::Continue
    }
  }

  fn panic(&self, error: KiteError) {
    error!(error = %error, state = %self.state(), "catch-up panic");
    self.health.panic(&error);
    self.up_to_date.resolve(Err(error.to_string()));
    let previous = self
      .state
      .swap(CoordinatorState::Faulted as u8, Ordering::AcqRel);
    if previous != CoordinatorState::Faulted as u8 {
      self.counters.record_panic();
      info!(to = %CoordinatorState::Faulted, "catch-up state transition");
    }
  }

  fn retry_later(&self, action: &str, error: KiteError) -> Result<()> {
    warn!(error = %error, state = %self.state(), "{action} failed; retrying next tick");
    self.counters.record_retryable_failure();
    Ok(())
  }

  fn record_upstream(&self, latest_tx_id: TxId) {
    self.upstream_tx_id.fetch_max(latest_tx_id, Ordering::AcqRel);
  }

  fn pull_transactions(&self) -> Result<()> {
    let peer = match self.selector.select_catchup_source() {
      Ok(peer) => peer,
      Err(error) => return self.retry_later("catch-up peer selection", error),
    };
    let local_store_id = self.local_db.store_id()?;

    let mut batches = 0u64;
    loop {
      let previous_tx_id = self.applier.last_queued_tx_id();
      self.counters.record_pull_request();
      let mut dispatcher = TxPullDispatcher {
        applier: &self.applier,
        expected_store_id: local_store_id,
      };
      let request = CatchupRequest::TxPull(PullRequest {
        previous_tx_id,
        expected_store_id: local_store_id,
      });

      let outcome = match self
        .client
        .make_blocking_request(&peer, request, &mut dispatcher)
      {
        Ok(outcome) => outcome,
        Err(error) if error.is_retryable() => {
          self.applier.discard_pending();
          return self.retry_later("transaction pull", error);
        }
        Err(error) => return Err(error),
      };

      match outcome {
        PullOutcome::EndOfBatch { latest_tx_id } => {
          let applied = self.applier.apply_batch()?;
          self.record_upstream(latest_tx_id);
          self.counters.record_batch();
          batches += 1;
          debug!(peer = %peer, batch = batches, applied, latest_tx_id, "pulled batch");
        }
        PullOutcome::EndOfStream { latest_tx_id } => {
          let applied = self.applier.apply_batch()?;
          self.record_upstream(latest_tx_id);
          self.counters.record_batch();
          debug!(peer = %peer, batches = batches + 1, applied, latest_tx_id, "pulled to end of stream");
          if self.up_to_date.resolve(Ok(true)) {
            info!(peer = %peer, last_applied_tx_id = self.applier.last_applied_tx_id(), "caught up");
          }
          return Ok(());
        }
        PullOutcome::Pruned {
          requested_tx_id,
          log_floor_tx_id,
        } => {
          let discarded = self.applier.discard_pending();
          info!(
            peer = %peer,
            requested_tx_id,
            log_floor_tx_id,
            discarded,
            "transactions pruned upstream; store copy required"
          );
          self.transition(CoordinatorState::StoreCopying);
          return Ok(());
        }
        PullOutcome::StoreIdMismatch { remote } => {
          self.applier.discard_pending();
          if self.local_db.is_empty()? {
            info!(peer = %peer, remote = %remote, "empty store has no lineage; copying peer store");
            self.transition(CoordinatorState::StoreCopying);
            return Ok(());
          }
          return Err(KiteError::StoreIdMismatch {
            local: local_store_id,
            remote,
          });
        }
      }
    }
  }

  fn copy_store(&self) -> Result<()> {
    let peer = match self.selector.select_catchup_source() {
      Ok(peer) => peer,
      Err(error) => return self.retry_later("store copy peer selection", error),
    };
    let local_store_id = self.local_db.store_id()?;

    self.counters.record_store_copy_started();
    match self.store_copy.replace_with_store_from(&peer, local_store_id) {
      Ok(outcome) => {
        self.counters.record_store_copy_result(true);
        self.applier.refresh_from_new_store()?;
        self.record_upstream(outcome.upstream_tx_id);
        self.transition(CoordinatorState::TxPulling);
        info!(
          peer = %peer,
          store_id = %outcome.store_id,
          last_committed_tx_id = outcome.last_committed_tx_id,
          files = outcome.files,
          transactions = outcome.transactions,
          "store replaced from peer"
        );
        Ok(())
      }
      Err(error) if error.is_retryable() => {
        self.counters.record_store_copy_result(false);
        self.retry_later("store copy", error)
      }
      Err(error) => {
        self.counters.record_store_copy_result(false);
        Err(error)
      }
    }
  }
}
