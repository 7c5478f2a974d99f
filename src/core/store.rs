//! File-backed graph store.
//!
//! Layout of a store directory:
//!
//! - `store-meta.json`: store identity (written once at genesis)
//! - `graph.snapshot`: one checksummed frame holding the graph at the
//!   snapshot transaction id (the frame id)
//! - `tx.rlog`: transactions committed after (and possibly before) the snapshot
//! - `store.lock`: held exclusively while the store is open
//!
//! Opening a store loads the snapshot and replays the log frames that follow
//! it, which is also how a freshly copied store is recovered.

use crate::constants::{
  SNAPSHOT_FILE, STORE_LOCK_FILE, STORE_META_FILE, TX_LOG_FILE, VERSION_STORE_FORMAT,
  VERSION_STORE_META,
};
use crate::core::graph::GraphState;
use crate::core::tx_log::{rewrite_log, LogFrame, TxLogStore};
use crate::error::{KiteError, Result};
use crate::types::{CommittedTransaction, GraphCommand, StoreId, TxId, BASE_TX_ID};
use crate::util::write_file_atomic;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// Storage engine contract
// ============================================================================

/// What a store directory contains, read without opening (or locking) it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreInfo {
  pub store_id: StoreId,
  pub last_committed_tx_id: TxId,
}

impl StoreInfo {
  pub fn is_empty(&self) -> bool {
    self.last_committed_tx_id == BASE_TX_ID
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
  pub store_id: StoreId,
  pub last_committed_tx_id: TxId,
  pub replayed_transactions: usize,
}

/// Storage collaborator used by the replication layer.
///
/// Implementations own their files exclusively between `open` and `close`.
pub trait StorageEngine: Send + Sized + 'static {
  /// Open the store at `path`, creating a new lineage if none exists there.
  fn open(path: &Path) -> Result<Self>;

  /// Bring the store at `path` to a self-consistent state, as after an
  /// unclean shutdown. Fails if `path` does not hold a store.
  fn recover(path: &Path) -> Result<RecoveryOutcome>;

  /// Identity and position of the store at `path`, `None` if there is none.
  fn inspect(path: &Path) -> Result<Option<StoreInfo>>;

  /// Apply a committed transaction. Returns `false` when `tx` was already
  /// applied, in which case nothing changes.
  fn apply_transaction(&mut self, tx: &CommittedTransaction) -> Result<bool>;

  fn close(self) -> Result<()>;

  fn store_id(&self) -> StoreId;

  fn last_committed_tx_id(&self) -> TxId;

  fn is_empty(&self) -> bool {
    self.last_committed_tx_id() == BASE_TX_ID
  }

  fn graph(&self) -> &GraphState;
}

// ============================================================================
// Graph store
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
  pub version: u32,
  pub store_id: StoreId,
}

#[derive(Debug)]
pub struct GraphStore {
  dir: PathBuf,
  meta: StoreMetadata,
  graph: GraphState,
  log: TxLogStore,
  snapshot_tx_id: TxId,
  log_floor_tx_id: TxId,
  last_committed_tx_id: TxId,
  lock_file: File,
}

impl GraphStore {
  /// Open the store at `dir`, creating a new store lineage if the directory
  /// holds none.
  pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
    Self::open_internal(dir.as_ref(), true)
  }

  /// Open an existing store; fails when `dir` holds no store metadata.
  pub fn open_existing(dir: impl AsRef<Path>) -> Result<Self> {
    Self::open_internal(dir.as_ref(), false)
  }

  fn open_internal(dir: &Path, create_if_missing: bool) -> Result<Self> {
    std::fs::create_dir_all(dir)?;
    let lock_file = acquire_store_lock(dir)?;

    let meta = match read_metadata(dir)? {
      Some(meta) => meta,
      None if create_if_missing => initialize_store(dir)?,
      None => {
        return Err(KiteError::RecoveryFailed(format!(
          "no store metadata in {}",
          dir.display()
        )))
      }
    };
    if meta.version != VERSION_STORE_META {
      return Err(KiteError::VersionMismatch {
        required: meta.version,
        current: VERSION_STORE_META,
      });
    }

    let (snapshot_tx_id, mut graph) = read_snapshot(dir)?;
    let log_path = dir.join(TX_LOG_FILE);
    let frames = if log_path.exists() {
      TxLogStore::open(&log_path)?.read_all()?
    } else {
      Vec::new()
    };

    let log_floor_tx_id = frames
      .first()
      .map(|frame| frame.id.min(snapshot_tx_id + 1))
      .unwrap_or(snapshot_tx_id + 1);

    let mut last_committed_tx_id = snapshot_tx_id;
    for frame in frames.iter().filter(|frame| frame.id > snapshot_tx_id) {
      if frame.id <= last_committed_tx_id {
        return Err(KiteError::InvalidWal(format!(
          "transaction log out of order in {}: tx {} after {last_committed_tx_id}",
          dir.display(),
          frame.id
        )));
      }
      if frame.id != last_committed_tx_id + 1 {
        warn!(
          store = %dir.display(),
          after = last_committed_tx_id,
          tx_id = frame.id,
          "transaction log skips ids"
        );
      }
      let commands = decode_commands(&frame.payload)?;
      graph.apply_all(&commands)?;
      last_committed_tx_id = frame.id;
    }

    debug!(
      store = %dir.display(),
      snapshot_tx_id,
      last_committed_tx_id,
      "opened graph store"
    );

    Ok(Self {
      dir: dir.to_path_buf(),
      meta,
      graph,
      log: TxLogStore::open_or_create_append(&log_path)?,
      snapshot_tx_id,
      log_floor_tx_id,
      last_committed_tx_id,
      lock_file,
    })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn snapshot_tx_id(&self) -> TxId {
    self.snapshot_tx_id
  }

  /// Lowest transaction id still present in the log.
  pub fn log_floor_tx_id(&self) -> TxId {
    self.log_floor_tx_id
  }

  /// Commit a new transaction on top of this store (primary side).
  pub fn commit(&mut self, commands: Vec<GraphCommand>) -> Result<TxId> {
    let tx = CommittedTransaction::new(self.last_committed_tx_id + 1, commands);
    self.apply_transaction(&tx)?;
    Ok(tx.tx_id)
  }

  /// Persist the current graph as the new snapshot.
  pub fn checkpoint(&mut self) -> Result<TxId> {
    write_snapshot(&self.dir, self.last_committed_tx_id, &self.graph)?;
    self.snapshot_tx_id = self.last_committed_tx_id;
    debug!(store = %self.dir.display(), snapshot_tx_id = self.snapshot_tx_id, "checkpoint");
    Ok(self.snapshot_tx_id)
  }

  /// Drop logged transactions below `tx_id`. The log never loses anything
  /// newer than the snapshot. Returns the new log floor.
  pub fn prune_log_before(&mut self, tx_id: TxId) -> Result<TxId> {
    let floor = tx_id.min(self.snapshot_tx_id + 1);
    if floor <= self.log_floor_tx_id {
      return Ok(self.log_floor_tx_id);
    }

    self.log.sync()?;
    let log_path = self.dir.join(TX_LOG_FILE);
    let kept = self.log.read_filtered(|frame| frame.id >= floor, 0)?;
    rewrite_log(&log_path, &kept)?;
    self.log = TxLogStore::open_or_create_append(&log_path)?;
    self.log_floor_tx_id = floor;

    info!(store = %self.dir.display(), log_floor_tx_id = floor, "pruned transaction log");
    Ok(floor)
  }

  /// Logged transactions with ids greater than `tx_id`, at most `max` when non-zero.
  pub fn transactions_after(&self, tx_id: TxId, max: usize) -> Result<Vec<CommittedTransaction>> {
    self
      .log
      .read_filtered(|frame| frame.id > tx_id, max)?
      .into_iter()
      .map(|frame| {
        Ok(CommittedTransaction::new(
          frame.id,
          decode_commands(&frame.payload)?,
        ))
      })
      .collect()
  }

  fn append_to_log(&mut self, tx: &CommittedTransaction) -> Result<()> {
    self.log.append(&transaction_frame(tx)?)?;
    self.log.sync()
  }
}

impl StorageEngine for GraphStore {
  fn open(path: &Path) -> Result<Self> {
    GraphStore::open(path)
  }

  fn recover(path: &Path) -> Result<RecoveryOutcome> {
    let outcome = (|| -> Result<RecoveryOutcome> {
      let mut store = GraphStore::open_existing(path)?;
      let replayed = store
        .last_committed_tx_id
        .saturating_sub(store.snapshot_tx_id) as usize;
      store.checkpoint()?;
      let outcome = RecoveryOutcome {
        store_id: store.meta.store_id,
        last_committed_tx_id: store.last_committed_tx_id,
        replayed_transactions: replayed,
      };
      StorageEngine::close(store)?;
      Ok(outcome)
    })();

    outcome.map_err(|error| match error {
      KiteError::RecoveryFailed(_) => error,
      other => KiteError::RecoveryFailed(format!("{}: {other}", path.display())),
    })
  }

  fn inspect(path: &Path) -> Result<Option<StoreInfo>> {
    let Some(meta) = read_metadata(path)? else {
      return Ok(None);
    };
    let (snapshot_tx_id, _) = read_snapshot(path)?;
    let log_path = path.join(TX_LOG_FILE);
    let last_logged = if log_path.exists() {
      TxLogStore::open(&log_path)?
        .read_all()?
        .last()
        .map(|frame| frame.id)
        .unwrap_or(BASE_TX_ID)
    } else {
      BASE_TX_ID
    };

    Ok(Some(StoreInfo {
      store_id: meta.store_id,
      last_committed_tx_id: snapshot_tx_id.max(last_logged),
    }))
  }

  fn apply_transaction(&mut self, tx: &CommittedTransaction) -> Result<bool> {
    if tx.tx_id <= self.last_committed_tx_id {
      return Ok(false);
    }

    let next = self.graph.with_applied(&tx.commands)?;
    self.append_to_log(tx)?;
    self.graph = next;
    self.last_committed_tx_id = tx.tx_id;
    Ok(true)
  }

  fn close(mut self) -> Result<()> {
    self.log.sync()?;
    self.lock_file.unlock()?;
    Ok(())
  }

  fn store_id(&self) -> StoreId {
    self.meta.store_id
  }

  fn last_committed_tx_id(&self) -> TxId {
    self.last_committed_tx_id
  }

  fn graph(&self) -> &GraphState {
    &self.graph
  }
}

// ============================================================================
// File helpers
// ============================================================================

pub fn read_metadata(dir: &Path) -> Result<Option<StoreMetadata>> {
  let path = dir.join(STORE_META_FILE);
  if !path.exists() {
    return Ok(None);
  }

  let bytes = std::fs::read(&path)?;
  let meta: StoreMetadata = serde_json::from_slice(&bytes).map_err(|error| {
    KiteError::Serialization(format!("decode store metadata failed: {error}"))
  })?;
  Ok(Some(meta))
}

fn write_metadata(dir: &Path, meta: &StoreMetadata) -> Result<()> {
  let bytes = serde_json::to_vec(meta).map_err(|error| {
    KiteError::Serialization(format!("encode store metadata failed: {error}"))
  })?;
  write_file_atomic(&dir.join(STORE_META_FILE), &bytes)
}

fn initialize_store(dir: &Path) -> Result<StoreMetadata> {
  let meta = StoreMetadata {
    version: VERSION_STORE_META,
    store_id: StoreId::generate(VERSION_STORE_FORMAT),
  };
  write_snapshot(dir, BASE_TX_ID, &GraphState::new())?;
  write_metadata(dir, &meta)?;
  info!(store = %dir.display(), store_id = %meta.store_id, "created new store");
  Ok(meta)
}

fn read_snapshot(dir: &Path) -> Result<(TxId, GraphState)> {
  let path = dir.join(SNAPSHOT_FILE);
  if !path.exists() {
    return Err(KiteError::RecoveryFailed(format!(
      "missing snapshot {}",
      path.display()
    )));
  }

  let frames = TxLogStore::open(&path)?.read_all()?;
  match frames.as_slice() {
    [frame] => Ok((frame.id, GraphState::from_bytes(&frame.payload)?)),
    _ => Err(KiteError::InvalidWal(format!(
      "snapshot {} must hold exactly one frame, found {}",
      path.display(),
      frames.len()
    ))),
  }
}

fn write_snapshot(dir: &Path, tx_id: TxId, graph: &GraphState) -> Result<()> {
  let path = dir.join(SNAPSHOT_FILE);
  let tmp_path = path.with_extension("snapshot.tmp");
  {
    let mut store = TxLogStore::create(&tmp_path)?;
    store.append(&LogFrame::new(tx_id, graph.to_bytes()?))?;
    store.sync()?;
  }
  std::fs::rename(&tmp_path, &path)?;
  crate::util::sync_parent_dir(Some(dir))
}

fn acquire_store_lock(dir: &Path) -> Result<File> {
  let path = dir.join(STORE_LOCK_FILE);
  let file = OpenOptions::new()
    .create(true)
    .truncate(false)
    .read(true)
    .write(true)
    .open(&path)?;
  file.try_lock_exclusive().map_err(|error| {
    KiteError::LockFailed(format!(
      "store {} is already open: {error}",
      dir.display()
    ))
  })?;
  Ok(file)
}

/// Encode a transaction as a log frame in the on-disk log format. Store copy
/// uses this to stage transactions that arrive after the snapshot.
pub fn transaction_frame(tx: &CommittedTransaction) -> Result<LogFrame> {
  Ok(LogFrame::new(tx.tx_id, encode_commands(&tx.commands)?))
}

fn encode_commands(commands: &[GraphCommand]) -> Result<Vec<u8>> {
  serde_json::to_vec(commands)
    .map_err(|error| KiteError::Serialization(format!("encode transaction failed: {error}")))
}

fn decode_commands(payload: &[u8]) -> Result<Vec<GraphCommand>> {
  serde_json::from_slice(payload)
    .map_err(|error| KiteError::Serialization(format!("decode transaction failed: {error}")))
}
