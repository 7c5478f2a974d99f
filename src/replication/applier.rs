//! Batching transaction applier.
//!
//! Pulled transactions are queued in id order and applied to the local
//! database in batches. The applier tracks two positions: the highest id it
//! has queued and the highest id it has applied.

use crate::config::TxApplyPolicy;
use crate::core::store::{GraphStore, StorageEngine};
use crate::error::{KiteError, Result};
use crate::replication::local_database::LocalDatabase;
use crate::types::{CommittedTransaction, TxId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
  Queued,
  /// The id was at or below the last queued id and was ignored.
  AlreadyQueued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplierStats {
  /// Every `apply_batch` call, including ones with nothing pending
  pub apply_calls: u64,
  pub transactions_applied: u64,
  pub transactions_discarded: u64,
  pub gaps_tolerated: u64,
}

#[derive(Debug, Default)]
struct ApplierState {
  pending: Vec<CommittedTransaction>,
  last_queued_tx_id: TxId,
  last_applied_tx_id: TxId,
}

#[derive(Debug)]
pub struct BatchingTxApplier<S: StorageEngine = GraphStore> {
  local_db: Arc<LocalDatabase<S>>,
  policy: TxApplyPolicy,
  state: Mutex<ApplierState>,
  apply_calls: AtomicU64,
  transactions_applied: AtomicU64,
  transactions_discarded: AtomicU64,
  gaps_tolerated: AtomicU64,
}

impl<S: StorageEngine> BatchingTxApplier<S> {
  pub fn new(local_db: Arc<LocalDatabase<S>>, policy: TxApplyPolicy) -> Self {
    Self {
      local_db,
      policy,
      state: Mutex::new(ApplierState::default()),
      apply_calls: AtomicU64::new(0),
      transactions_applied: AtomicU64::new(0),
      transactions_discarded: AtomicU64::new(0),
      gaps_tolerated: AtomicU64::new(0),
    }
  }

  /// Position both counters at the local store's last committed id.
  pub fn start(&self) -> Result<()> {
    let last_committed = self.local_db.last_committed_tx_id()?;
    self.reset_to(last_committed);
    debug!(last_committed, "transaction applier started");
    Ok(())
  }

  /// Re-read the position after the store was replaced by a copy.
  pub fn refresh_from_new_store(&self) -> Result<()> {
    let last_committed = self.local_db.last_committed_tx_id()?;
    let discarded = self.reset_to(last_committed);
    if discarded > 0 {
      self
        .transactions_discarded
        .fetch_add(discarded as u64, Ordering::Relaxed);
    }
    debug!(last_committed, "transaction applier refreshed from new store");
    Ok(())
  }

  fn reset_to(&self, tx_id: TxId) -> usize {
    let mut state = self.state.lock();
    let discarded = state.pending.len();
    state.pending.clear();
    state.last_queued_tx_id = tx_id;
    state.last_applied_tx_id = tx_id;
    discarded
  }

  pub fn last_queued_tx_id(&self) -> TxId {
    self.state.lock().last_queued_tx_id
  }

  pub fn last_applied_tx_id(&self) -> TxId {
    self.state.lock().last_applied_tx_id
  }

  pub fn pending_len(&self) -> usize {
    self.state.lock().pending.len()
  }

  /// Queue one pulled transaction.
  ///
  /// Ids at or below the last queued id are ignored. A jump past the next
  /// expected id is a `TxIdGap` error under the strict policy and is accepted
  /// with a warning when gaps are tolerated.
  pub fn queue(&self, tx: CommittedTransaction) -> Result<QueueOutcome> {
    let mut state = self.state.lock();
    if tx.tx_id <= state.last_queued_tx_id {
      return Ok(QueueOutcome::AlreadyQueued);
    }

    let expected = state.last_queued_tx_id + 1;
    if tx.tx_id != expected {
      match self.policy {
        TxApplyPolicy::Strict => {
          return Err(KiteError::TxIdGap {
            expected,
            actual: tx.tx_id,
          });
        }
        TxApplyPolicy::TolerateGaps => {
          warn!(expected, actual = tx.tx_id, "skipping transaction id gap");
          self.gaps_tolerated.fetch_add(1, Ordering::Relaxed);
        }
      }
    }

    state.last_queued_tx_id = tx.tx_id;
    state.pending.push(tx);
    Ok(QueueOutcome::Queued)
  }

  /// Apply everything queued since the last batch. Returns how many
  /// transactions were handed to the local database.
  pub fn apply_batch(&self) -> Result<usize> {
    self.apply_calls.fetch_add(1, Ordering::Relaxed);
    let mut state = self.state.lock();
    let Some(last) = state.pending.last().map(|tx| tx.tx_id) else {
      return Ok(0);
    };

    self.local_db.apply_transactions(&state.pending)?;
    let count = state.pending.len();
    state.pending.clear();
    state.last_applied_tx_id = last;
    self
      .transactions_applied
      .fetch_add(count as u64, Ordering::Relaxed);
    debug!(count, last_applied = last, "applied transaction batch");
    Ok(count)
  }

  /// Drop queued work after a failed pull; the queued position falls back
  /// to the applied one so the next pull resumes from there.
  pub fn discard_pending(&self) -> usize {
    let mut state = self.state.lock();
    let discarded = state.pending.len();
    state.pending.clear();
    state.last_queued_tx_id = state.last_applied_tx_id;
    if discarded > 0 {
      self
        .transactions_discarded
        .fetch_add(discarded as u64, Ordering::Relaxed);
    }
    discarded
  }

  pub fn stats(&self) -> ApplierStats {
    ApplierStats {
      apply_calls: self.apply_calls.load(Ordering::Relaxed),
      transactions_applied: self.transactions_applied.load(Ordering::Relaxed),
      transactions_discarded: self.transactions_discarded.load(Ordering::Relaxed),
      gaps_tolerated: self.gaps_tolerated.load(Ordering::Relaxed),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{BatchingTxApplier, QueueOutcome};
  use crate::config::TxApplyPolicy;
  use crate::core::store::GraphStore;
  use crate::error::KiteError;
  use crate::replication::availability::AvailabilityGuard;
  use crate::replication::health::DatabaseHealth;
  use crate::replication::local_database::LocalDatabase;
  use crate::types::{CommittedTransaction, GraphCommand};
  use std::sync::Arc;

  fn create(tx_id: u64) -> CommittedTransaction {
    CommittedTransaction::new(
      tx_id,
      vec![GraphCommand::CreateNode {
        node_id: tx_id,
        key: None,
      }],
    )
  }

  fn started_db(dir: &std::path::Path) -> Arc<LocalDatabase<GraphStore>> {
    let db = Arc::new(LocalDatabase::new(
      dir.join("graph.db"),
      Arc::new(AvailabilityGuard::new()),
      Arc::new(DatabaseHealth::new()),
    ));
    db.start().expect("start");
    db
  }

  #[test]
  fn batches_apply_in_order_and_move_positions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = started_db(dir.path());
    let applier = BatchingTxApplier::new(Arc::clone(&db), TxApplyPolicy::Strict);
    applier.start().expect("start applier");

    applier.queue(create(1)).expect("queue 1");
    applier.queue(create(2)).expect("queue 2");
    assert_eq!(applier.last_queued_tx_id(), 2);
    assert_eq!(applier.last_applied_tx_id(), 0);

    assert_eq!(applier.apply_batch().expect("apply"), 2);
    assert_eq!(applier.last_applied_tx_id(), 2);
    assert_eq!(applier.apply_batch().expect("empty apply"), 0);
    assert_eq!(db.last_committed_tx_id().expect("last"), 2);

    let stats = applier.stats();
    assert_eq!(stats.apply_calls, 2);
    assert_eq!(stats.transactions_applied, 2);
  }

  #[test]
  fn duplicates_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = started_db(dir.path());
    let applier = BatchingTxApplier::new(db, TxApplyPolicy::Strict);
    applier.start().expect("start applier");

    assert_eq!(applier.queue(create(1)).expect("queue"), QueueOutcome::Queued);
    assert_eq!(
      applier.queue(create(1)).expect("requeue"),
      QueueOutcome::AlreadyQueued
    );
    assert_eq!(applier.pending_len(), 1);
  }

  #[test]
  fn strict_policy_rejects_gaps() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = started_db(dir.path());
    let applier = BatchingTxApplier::new(db, TxApplyPolicy::Strict);
    applier.start().expect("start applier");

    applier.queue(create(1)).expect("queue 1");
    let err = applier.queue(create(3)).expect_err("gap");
    assert!(matches!(
      err,
      KiteError::TxIdGap {
        expected: 2,
        actual: 3
      }
    ));
    assert_eq!(applier.last_queued_tx_id(), 1);
  }

  #[test]
  fn tolerant_policy_fast_forwards() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = started_db(dir.path());
    let applier = BatchingTxApplier::new(db, TxApplyPolicy::TolerateGaps);
    applier.start().expect("start applier");

    applier.queue(create(1)).expect("queue 1");
    applier.queue(create(3)).expect("queue 3");
    assert_eq!(applier.last_queued_tx_id(), 3);
    assert_eq!(applier.stats().gaps_tolerated, 1);
  }

  #[test]
  fn discard_rewinds_queue_position() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = started_db(dir.path());
    let applier = BatchingTxApplier::new(db, TxApplyPolicy::Strict);
    applier.start().expect("start applier");

    applier.queue(create(1)).expect("queue 1");
    applier.apply_batch().expect("apply");
    applier.queue(create(2)).expect("queue 2");

    assert_eq!(applier.discard_pending(), 1);
    assert_eq!(applier.last_queued_tx_id(), 1);
    assert_eq!(applier.stats().transactions_discarded, 1);
  }
}
