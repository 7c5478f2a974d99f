//! Lifecycle of the local store as seen by replication.
//!
//! The local database owns the store's files while started. Stopping always
//! raises the availability guard before the store is closed, so readers see
//! the database as unavailable before its resources disappear.

use crate::core::graph::GraphState;
use crate::core::store::{GraphStore, StorageEngine};
use crate::error::{KiteError, Result};
use crate::replication::availability::{AvailabilityGuard, AvailabilityRequirement};
use crate::replication::health::DatabaseHealth;
use crate::types::{CommittedTransaction, StoreId, TxId};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const STOPPED_REASON: &str = "database is stopped";
pub const STOPPED_FOR_STORE_COPY_REASON: &str = "database is stopped to copy store";

#[derive(Debug)]
struct LocalDatabaseState<S> {
  store: Option<S>,
  current_requirement: Option<AvailabilityRequirement>,
}

#[derive(Debug)]
pub struct LocalDatabase<S: StorageEngine = GraphStore> {
  store_dir: PathBuf,
  guard: Arc<AvailabilityGuard>,
  health: Arc<DatabaseHealth>,
  stopped: AvailabilityRequirement,
  stopped_for_store_copy: AvailabilityRequirement,
  state: Mutex<LocalDatabaseState<S>>,
}

impl<S: StorageEngine> LocalDatabase<S> {
  /// Create a stopped local database. The guard is raised immediately so the
  /// database never looks available before `start` succeeds.
  pub fn new(
    store_dir: impl Into<PathBuf>,
    guard: Arc<AvailabilityGuard>,
    health: Arc<DatabaseHealth>,
  ) -> Self {
    let stopped = AvailabilityRequirement::new(STOPPED_REASON);
    let stopped_for_store_copy = AvailabilityRequirement::new(STOPPED_FOR_STORE_COPY_REASON);
    guard.require(&stopped);
    Self {
      store_dir: store_dir.into(),
      guard,
      health,
      state: Mutex::new(LocalDatabaseState {
        store: None,
        current_requirement: Some(stopped.clone()),
      }),
      stopped,
      stopped_for_store_copy,
    }
  }

  pub fn store_dir(&self) -> &Path {
    &self.store_dir
  }

  pub fn availability_guard(&self) -> &Arc<AvailabilityGuard> {
    &self.guard
  }

  pub fn health(&self) -> &Arc<DatabaseHealth> {
    &self.health
  }

  pub fn is_started(&self) -> bool {
    self.state.lock().store.is_some()
  }

  /// Open the store, then lower whichever requirement this database holds.
  pub fn start(&self) -> Result<()> {
    self.health.assert_healthy()?;
    let mut state = self.state.lock();
    if state.store.is_none() {
      state.store = Some(S::open(&self.store_dir)?);
    }
    if let Some(requirement) = state.current_requirement.take() {
      self.guard.fulfill(&requirement);
      info!(store = %self.store_dir.display(), "local database started");
    }
    Ok(())
  }

  pub fn stop(&self) -> Result<()> {
    self.stop_with(&self.stopped)
  }

  pub fn stop_for_store_copy(&self) -> Result<()> {
    self.stop_with(&self.stopped_for_store_copy)
  }

  fn stop_with(&self, requirement: &AvailabilityRequirement) -> Result<()> {
    let mut state = self.state.lock();

    self.guard.require(requirement);
    if let Some(previous) = state.current_requirement.replace(requirement.clone()) {
      if previous != *requirement {
        self.guard.fulfill(&previous);
      }
    }

    if let Some(store) = state.store.take() {
      store.close()?;
      info!(store = %self.store_dir.display(), reason = %requirement, "local database stopped");
    }
    Ok(())
  }

  pub fn is_empty(&self) -> Result<bool> {
    let state = self.state.lock();
    if let Some(store) = state.store.as_ref() {
      return Ok(store.is_empty());
    }
    Ok(
      S::inspect(&self.store_dir)?
        .map(|info| info.is_empty())
        .unwrap_or(true),
    )
  }

  pub fn store_id(&self) -> Result<StoreId> {
    let state = self.state.lock();
    if let Some(store) = state.store.as_ref() {
      return Ok(store.store_id());
    }
    S::inspect(&self.store_dir)?
      .map(|info| info.store_id)
      .ok_or_else(|| {
        KiteError::InvalidReplication(format!(
          "no store at {}",
          self.store_dir.display()
        ))
      })
  }

  pub fn last_committed_tx_id(&self) -> Result<TxId> {
    let state = self.state.lock();
    if let Some(store) = state.store.as_ref() {
      return Ok(store.last_committed_tx_id());
    }
    Ok(
      S::inspect(&self.store_dir)?
        .map(|info| info.last_committed_tx_id)
        .unwrap_or_default(),
    )
  }

  /// Apply transactions in order. Already-applied ids are skipped by the
  /// store; returns how many changed it.
  pub fn apply_transactions(&self, transactions: &[CommittedTransaction]) -> Result<usize> {
    self.health.assert_healthy()?;
    let mut state = self.state.lock();
    let store = state.store.as_mut().ok_or_else(|| {
      KiteError::Unavailable(format!(
        "cannot apply transactions: {}",
        self.guard.describe_who_is_blocking()
      ))
    })?;

    let mut applied = 0usize;
    for tx in transactions {
      if store.apply_transaction(tx)? {
        applied += 1;
      }
    }
    Ok(applied)
  }

  /// Run `read` against the current graph if the database may be used.
  pub fn read<T>(&self, read: impl FnOnce(&GraphState) -> T) -> Result<T> {
    self.health.assert_healthy()?;
    if !self.guard.is_available() {
      return Err(KiteError::Unavailable(
        self.guard.describe_who_is_blocking(),
      ));
    }
    let state = self.state.lock();
    let store = state
      .store
      .as_ref()
      .ok_or_else(|| KiteError::Unavailable(STOPPED_REASON.to_string()))?;
    Ok(read(store.graph()))
  }
}

#[cfg(test)]
mod tests {
  use super::{LocalDatabase, STOPPED_FOR_STORE_COPY_REASON, STOPPED_REASON};
  use crate::core::store::GraphStore;
  use crate::error::KiteError;
  use crate::replication::availability::AvailabilityGuard;
  use crate::replication::health::DatabaseHealth;
  use crate::types::{CommittedTransaction, GraphCommand};
  use std::sync::Arc;

  fn local_database(dir: &std::path::Path) -> (LocalDatabase<GraphStore>, Arc<AvailabilityGuard>) {
    let guard = Arc::new(AvailabilityGuard::new());
    let db = LocalDatabase::new(
      dir.join("graph.db"),
      Arc::clone(&guard),
      Arc::new(DatabaseHealth::new()),
    );
    (db, guard)
  }

  #[test]
  fn unavailable_until_started() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (db, guard) = local_database(dir.path());

    assert!(!guard.is_available());
    assert_eq!(guard.describe_who_is_blocking(), STOPPED_REASON);
    assert!(db.read(|graph| graph.count_nodes()).is_err());

    db.start().expect("start");
    assert!(guard.is_available());
    assert_eq!(db.read(|graph| graph.count_nodes()).expect("read"), 0);
  }

  #[test]
  fn stop_for_store_copy_uses_distinct_reason() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (db, guard) = local_database(dir.path());
    db.start().expect("start");

    db.stop_for_store_copy().expect("stop for copy");
    assert_eq!(guard.describe_who_is_blocking(), STOPPED_FOR_STORE_COPY_REASON);
    db.stop_for_store_copy().expect("repeat stop for copy");

    db.start().expect("restart");
    assert!(guard.is_available());
  }

  #[test]
  fn databases_sharing_a_guard_block_independently() {
    let dir = tempfile::tempdir().expect("tempdir");
    let guard = Arc::new(AvailabilityGuard::new());
    let health = Arc::new(DatabaseHealth::new());
    let first: LocalDatabase<GraphStore> =
      LocalDatabase::new(dir.path().join("first"), Arc::clone(&guard), Arc::clone(&health));
    let second: LocalDatabase<GraphStore> =
      LocalDatabase::new(dir.path().join("second"), Arc::clone(&guard), health);

    first.start().expect("start first");
    assert!(!second.is_started());
    assert!(!guard.is_available(), "second database is still stopped");
    assert_eq!(guard.describe_who_is_blocking(), STOPPED_REASON);

    second.start().expect("start second");
    assert!(guard.is_available());

    first.stop_for_store_copy().expect("stop first for copy");
    second.stop().expect("stop second");
    second.start().expect("restart second");
    assert_eq!(guard.describe_who_is_blocking(), STOPPED_FOR_STORE_COPY_REASON);
  }

  #[test]
  fn stopped_database_still_reports_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (db, _guard) = local_database(dir.path());
    db.start().expect("start");
    let store_id = db.store_id().expect("store id");
    db.apply_transactions(&[CommittedTransaction::new(
      1,
      vec![GraphCommand::CreateNode {
        node_id: 1,
        key: None,
      }],
    )])
    .expect("apply");
    db.stop().expect("stop");

    assert_eq!(db.store_id().expect("store id while stopped"), store_id);
    assert_eq!(db.last_committed_tx_id().expect("last tx"), 1);
    assert!(!db.is_empty().expect("is empty"));
  }

  #[test]
  fn poisoned_health_refuses_start_and_reads() {
    let dir = tempfile::tempdir().expect("tempdir");
    let guard = Arc::new(AvailabilityGuard::new());
    let health = Arc::new(DatabaseHealth::new());
    let db: LocalDatabase<GraphStore> =
      LocalDatabase::new(dir.path().join("graph.db"), guard, Arc::clone(&health));
    db.start().expect("start");

    health.panic(&KiteError::IllegalState("test".to_string()));
    assert!(matches!(
      db.read(|graph| graph.count_nodes()),
      Err(KiteError::DatabasePanicked(_))
    ));
    db.stop().expect("stop");
    assert!(db.start().is_err());
  }
}
