//! Replacing the local store with a copy streamed from a peer.
//!
//! The copy is staged in a temporary directory next to the store, recovered
//! there, and only then swapped in. Until the swap, the original store is
//! left untouched on disk.

use crate::constants::{STAGING_DIR_PREFIX, TX_LOG_FILE};
use crate::core::store::{transaction_frame, GraphStore, StorageEngine};
use crate::core::tx_log::TxLogStore;
use crate::error::{KiteError, Result};
use crate::replication::client::{unexpected_response, CatchUpClient, Dispatch, ResponseDispatcher};
use crate::replication::local_database::LocalDatabase;
use crate::replication::protocol::{
  CatchupErrorKind, CatchupRequest, CatchupResponse, PeerId, StoreCopyRequest,
};
use crate::types::{CommittedTransaction, StoreId, TxId};
use crate::util::sync_parent_dir;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the staged store inside the staging directory
const STAGED_STORE_DIR: &str = "store";
/// Where the replaced store is parked until the staging directory is removed
const PREVIOUS_STORE_DIR: &str = "previous";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCopyOutcome {
  pub store_id: StoreId,
  /// Latest transaction the peer had when the copy finished
  pub upstream_tx_id: TxId,
  /// Last transaction in the recovered copy
  pub last_committed_tx_id: TxId,
  pub files: usize,
  pub transactions: usize,
}

#[derive(Debug)]
pub struct StoreCopyProcess<S: StorageEngine = GraphStore> {
  local_db: Arc<LocalDatabase<S>>,
  client: Arc<CatchUpClient>,
}

impl<S: StorageEngine> StoreCopyProcess<S> {
  pub fn new(local_db: Arc<LocalDatabase<S>>, client: Arc<CatchUpClient>) -> Self {
    Self { local_db, client }
  }

  /// Replace the local store with `peer`'s.
  ///
  /// A non-empty local store is only replaced by a store of the same
  /// lineage. Transport and staging failures are `StoreCopyFailed` (or
  /// another retryable error) and leave the local database stopped with its
  /// original files. A staged copy that cannot be recovered is fatal.
  pub fn replace_with_store_from(
    &self,
    peer: &PeerId,
    expected_store_id: StoreId,
  ) -> Result<StoreCopyOutcome> {
    let remote_store_id =
      self
        .client
        .make_blocking_request(peer, CatchupRequest::GetStoreId, &mut StoreIdDispatcher)?;
    if !self.local_db.is_empty()? && remote_store_id != expected_store_id {
      return Err(KiteError::StoreIdMismatch {
        local: expected_store_id,
        remote: remote_store_id,
      });
    }

    self.local_db.stop_for_store_copy()?;

    let store_dir = self.local_db.store_dir().to_path_buf();
    let parent = match store_dir.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
      _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(staging_failed)?;
    let staging = tempfile::Builder::new()
      .prefix(STAGING_DIR_PREFIX)
      .tempdir_in(&parent)
      .map_err(staging_failed)?;
    let staged_store = staging.path().join(STAGED_STORE_DIR);
    fs::create_dir(&staged_store).map_err(staging_failed)?;

    info!(peer = %peer, store_id = %remote_store_id, staging = %staging.path().display(), "copying store");
    let mut dispatcher = StoreCopyDispatcher::new(&staged_store, remote_store_id);
    let summary = self
      .client
      .make_blocking_request(
        peer,
        CatchupRequest::StoreCopy(StoreCopyRequest {
          expected_store_id: remote_store_id,
        }),
        &mut dispatcher,
      )
      .map_err(wrap_io)?;

    let recovered = S::recover(&staged_store).map_err(|error| match error {
      KiteError::RecoveryFailed(_) => error,
      other => KiteError::RecoveryFailed(other.to_string()),
    })?;
    if recovered.store_id != remote_store_id {
      return Err(KiteError::RecoveryFailed(format!(
        "copied store has id {}, expected {remote_store_id}",
        recovered.store_id
      )));
    }
    if recovered.last_committed_tx_id < summary.last_tx_id {
      return Err(KiteError::RecoveryFailed(format!(
        "copied store ends at {} but the peer finished at {}",
        recovered.last_committed_tx_id, summary.last_tx_id
      )));
    }

    swap_store_directories(&staged_store, &store_dir, staging.path()).map_err(wrap_io)?;
    drop(staging);

    self.local_db.start()?;
    info!(
      peer = %peer,
      store_id = %remote_store_id,
      last_committed_tx_id = recovered.last_committed_tx_id,
      replayed = recovered.replayed_transactions,
      "store copy complete"
    );

    Ok(StoreCopyOutcome {
      store_id: remote_store_id,
      upstream_tx_id: summary.last_tx_id,
      last_committed_tx_id: recovered.last_committed_tx_id,
      files: summary.files,
      transactions: summary.transactions,
    })
  }
}

/// Move the current store aside into `scratch` and the staged one into its
/// place. If the second rename fails the original is moved back.
fn swap_store_directories(staged: &Path, store_dir: &Path, scratch: &Path) -> Result<()> {
  let previous = scratch.join(PREVIOUS_STORE_DIR);
  let had_previous = store_dir.exists();
  if had_previous {
    fs::rename(store_dir, &previous)?;
  }
  if let Err(error) = fs::rename(staged, store_dir) {
    if had_previous {
      if let Err(restore_error) = fs::rename(&previous, store_dir) {
        warn!(error = %restore_error, store = %store_dir.display(), "failed to restore original store");
      }
    }
    return Err(error.into());
  }
  sync_parent_dir(store_dir.parent())
}

fn staging_failed(error: std::io::Error) -> KiteError {
  KiteError::StoreCopyFailed(format!("staging failed: {error}"))
}

fn wrap_io(error: KiteError) -> KiteError {
  match error {
    KiteError::Io(error) => KiteError::StoreCopyFailed(error.to_string()),
    other => other,
  }
}

struct StoreIdDispatcher;

impl ResponseDispatcher for StoreIdDispatcher {
  type Output = StoreId;

  fn on_response(&mut self, response: CatchupResponse) -> Result<Dispatch<StoreId>> {
    match response {
      CatchupResponse::StoreIdReply { store_id } => Ok(Dispatch::Complete(store_id)),
      CatchupResponse::Error { kind, message } => Err(KiteError::Network(format!(
        "peer refused store id request ({kind}): {message}"
      ))),
      CatchupResponse::Transaction { .. }
      | CatchupResponse::EndOfBatch { .. }
      | CatchupResponse::EndOfStream { .. }
      | CatchupResponse::Pruned { .. }
      | CatchupResponse::FileHeader { .. }
      | CatchupResponse::FileChunk { .. }
      | CatchupResponse::StoreCopyFinished { .. } => unexpected_response(&response),
    }
  }
}

#[derive(Debug)]
struct CopySummary {
  last_tx_id: TxId,
  files: usize,
  transactions: usize,
}

struct IncomingFile {
  name: String,
  file: File,
  expected: u64,
  written: u64,
}

/// Writes a streamed store copy into the staging directory.
struct StoreCopyDispatcher {
  dir: PathBuf,
  store_id: StoreId,
  current: Option<IncomingFile>,
  log: Option<TxLogStore>,
  last_logged_tx_id: Option<TxId>,
  files: usize,
  transactions: usize,
}

impl StoreCopyDispatcher {
  fn new(dir: &Path, store_id: StoreId) -> Self {
    Self {
      dir: dir.to_path_buf(),
      store_id,
      current: None,
      log: None,
      last_logged_tx_id: None,
      files: 0,
      transactions: 0,
    }
  }

  fn begin_file(&mut self, name: String, length: u64) -> Result<()> {
    if let Some(current) = &self.current {
      return Err(KiteError::ProtocolViolation(format!(
        "file {name} started before {} finished",
        current.name
      )));
    }
    if !is_plain_file_name(&name) {
      return Err(KiteError::ProtocolViolation(format!(
        "refusing to stage file {name:?}"
      )));
    }
    let file = File::create(self.dir.join(&name))?;
    self.current = Some(IncomingFile {
      name,
      file,
      expected: length,
      written: 0,
    });
    Ok(())
  }

  fn write_chunk(&mut self, data: &[u8], last: bool) -> Result<()> {
    let Some(current) = self.current.as_mut() else {
      return Err(KiteError::ProtocolViolation(
        "file chunk without a file header".to_string(),
      ));
    };
    current.file.write_all(data)?;
    current.written += data.len() as u64;
    if current.written > current.expected || (last && current.written != current.expected) {
      return Err(KiteError::ProtocolViolation(format!(
        "file {} sent {} of {} bytes",
        current.name, current.written, current.expected
      )));
    }
    if last {
      current.file.sync_all()?;
      self.current = None;
      self.files += 1;
    }
    Ok(())
  }

  fn log_transaction(&mut self, store_id: StoreId, tx: &CommittedTransaction) -> Result<()> {
    if self.current.is_some() {
      return Err(KiteError::ProtocolViolation(
        "transaction arrived inside a file transfer".to_string(),
      ));
    }
    if store_id != self.store_id {
      return Err(KiteError::ProtocolViolation(format!(
        "transaction from store {store_id} during copy of {}",
        self.store_id
      )));
    }
    if let Some(last) = self.last_logged_tx_id {
      if tx.tx_id <= last {
        return Err(KiteError::ProtocolViolation(format!(
          "transaction {} arrived after {last}",
          tx.tx_id
        )));
      }
    }
    if self.log.is_none() {
      self.log = Some(TxLogStore::create(self.dir.join(TX_LOG_FILE))?);
    }
    if let Some(log) = self.log.as_mut() {
      log.append(&transaction_frame(tx)?)?;
    }
    self.last_logged_tx_id = Some(tx.tx_id);
    self.transactions += 1;
    Ok(())
  }

  fn finish(&mut self, last_tx_id: TxId) -> Result<CopySummary> {
    if let Some(current) = &self.current {
      return Err(KiteError::ProtocolViolation(format!(
        "store copy finished during file {}",
        current.name
      )));
    }
    if let Some(log) = self.log.as_mut() {
      log.sync()?;
    }
    Ok(CopySummary {
      last_tx_id,
      files: self.files,
      transactions: self.transactions,
    })
  }
}

impl ResponseDispatcher for StoreCopyDispatcher {
  type Output = CopySummary;

  fn on_response(&mut self, response: CatchupResponse) -> Result<Dispatch<CopySummary>> {
    match response {
      CatchupResponse::FileHeader { file_name, length } => {
        self.begin_file(file_name, length)?;
        Ok(Dispatch::Continue)
      }
      CatchupResponse::FileChunk { data, last } => {
        self.write_chunk(&data, last)?;
        Ok(Dispatch::Continue)
      }
      CatchupResponse::Transaction { store_id, tx } => {
        self.log_transaction(store_id, &tx)?;
        Ok(Dispatch::Continue)
      }
      CatchupResponse::StoreCopyFinished { last_tx_id } => {
        Ok(Dispatch::Complete(self.finish(last_tx_id)?))
      }
      CatchupResponse::Error { kind, message } => {
        let reason = match kind {
          CatchupErrorKind::StoreIdMismatch { remote } => {
            format!("peer store changed to {remote}: {message}")
          }
          CatchupErrorKind::InvalidRequest | CatchupErrorKind::Internal => {
            format!("peer refused store copy ({kind}): {message}")
          }
        };
        Err(KiteError::StoreCopyFailed(reason))
      }
      CatchupResponse::EndOfBatch { .. }
      | CatchupResponse::EndOfStream { .. }
      | CatchupResponse::Pruned { .. }
      | CatchupResponse::StoreIdReply { .. } => unexpected_response(&response),
    }
  }
}

fn is_plain_file_name(name: &str) -> bool {
  let mut components = Path::new(name).components();
  matches!(
    (components.next(), components.next()),
    (Some(Component::Normal(_)), None)
  )
}
