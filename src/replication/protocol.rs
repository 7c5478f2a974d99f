//! Catch-up protocol messages.
//!
//! A request produces a stream of responses. Every response kind is a variant
//! of [`CatchupResponse`], so a dispatcher that matches it exhaustively must
//! decide what to do with responses that belong to other request kinds.

use crate::types::{CommittedTransaction, StoreId, TxId};
use std::fmt;

/// Identity of a peer that can serve catch-up requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for PeerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for PeerId {
  fn from(id: &str) -> Self {
    Self::new(id)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullRequest {
  /// Last transaction the requester already has
  pub previous_tx_id: TxId,
  pub expected_store_id: StoreId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCopyRequest {
  pub expected_store_id: StoreId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupRequest {
  TxPull(PullRequest),
  StoreCopy(StoreCopyRequest),
  GetStoreId,
}

impl CatchupRequest {
  pub fn kind(&self) -> &'static str {
    match self {
      CatchupRequest::TxPull(_) => "tx_pull",
      CatchupRequest::StoreCopy(_) => "store_copy",
      CatchupRequest::GetStoreId => "get_store_id",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupErrorKind {
  /// The serving peer's store is not the one the requester expected.
  StoreIdMismatch { remote: StoreId },
  /// The request cannot be served from the peer's current position.
  InvalidRequest,
  Internal,
}

impl fmt::Display for CatchupErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CatchupErrorKind::StoreIdMismatch { .. } => f.write_str("store_id_mismatch"),
      CatchupErrorKind::InvalidRequest => f.write_str("invalid_request"),
      CatchupErrorKind::Internal => f.write_str("internal"),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatchupResponse {
  /// One committed transaction from the serving store
  Transaction {
    store_id: StoreId,
    tx: CommittedTransaction,
  },
  /// The batch limit was reached; more transactions may follow in a new pull.
  EndOfBatch { latest_tx_id: TxId },
  /// The requester is caught up with `latest_tx_id`.
  EndOfStream { latest_tx_id: TxId },
  /// The next transaction the requester needs is no longer in the log.
  Pruned {
    requested_tx_id: TxId,
    log_floor_tx_id: TxId,
  },
  Error {
    kind: CatchupErrorKind,
    message: String,
  },
  FileHeader { file_name: String, length: u64 },
  FileChunk { data: Vec<u8>, last: bool },
  StoreCopyFinished { last_tx_id: TxId },
  StoreIdReply { store_id: StoreId },
}

impl CatchupResponse {
  pub fn kind(&self) -> &'static str {
    match self {
      CatchupResponse::Transaction { .. } => "transaction",
      CatchupResponse::EndOfBatch { .. } => "end_of_batch",
      CatchupResponse::EndOfStream { .. } => "end_of_stream",
      CatchupResponse::Pruned { .. } => "pruned",
      CatchupResponse::Error { .. } => "error",
      CatchupResponse::FileHeader { .. } => "file_header",
      CatchupResponse::FileChunk { .. } => "file_chunk",
      CatchupResponse::StoreCopyFinished { .. } => "store_copy_finished",
      CatchupResponse::StoreIdReply { .. } => "store_id_reply",
    }
  }
}

/// Coordinator position in the catch-up state machine.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
  TxPulling = 0,
  StoreCopying = 1,
  Faulted = 2,
}

impl CoordinatorState {
  pub fn from_u8(value: u8) -> Option<Self> {
    match value {
      0 => Some(CoordinatorState::TxPulling),
      1 => Some(CoordinatorState::StoreCopying),
      2 => Some(CoordinatorState::Faulted),
      _ => None,
    }
  }
}

impl fmt::Display for CoordinatorState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CoordinatorState::TxPulling => f.write_str("TX_PULLING"),
      CoordinatorState::StoreCopying => f.write_str("STORE_COPYING"),
      CoordinatorState::Faulted => f.write_str("FAULTED"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{CoordinatorState, PeerId};

  #[test]
  fn state_round_trips_through_its_discriminant() {
    for state in [
      CoordinatorState::TxPulling,
      CoordinatorState::StoreCopying,
      CoordinatorState::Faulted,
    ] {
      assert_eq!(CoordinatorState::from_u8(state as u8), Some(state));
    }
    assert_eq!(CoordinatorState::from_u8(9), None);
    assert_eq!(CoordinatorState::StoreCopying.to_string(), "STORE_COPYING");
  }

  #[test]
  fn peer_id_displays_raw_id() {
    assert_eq!(PeerId::from("core-2").to_string(), "core-2");
  }
}
