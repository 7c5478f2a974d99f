//! Error types for KiteDB catch-up replication

use thiserror::Error;

use crate::types::{NodeId, StoreId, TxId};

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, KiteError>;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum KiteError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Serialization error: {0}")]
  Serialization(String),

  #[error("CRC mismatch: stored=0x{stored:08X}, computed=0x{computed:08X}")]
  CrcMismatch { stored: u32, computed: u32 },

  #[error("Invalid transaction log: {0}")]
  InvalidWal(String),

  #[error("Version mismatch: requires {required}, current {current}")]
  VersionMismatch { required: u32, current: u32 },

  #[error("Failed to acquire lock: {0}")]
  LockFailed(String),

  #[error("Node not found: {0}")]
  NodeNotFound(NodeId),

  #[error("Invalid replication state: {0}")]
  InvalidReplication(String),

  #[error("Store id mismatch: local {local}, remote {remote}")]
  StoreIdMismatch { local: StoreId, remote: StoreId },

  #[error("Transaction id gap: expected {expected}, received {actual}")]
  TxIdGap { expected: TxId, actual: TxId },

  #[error("Database unavailable: {0}")]
  Unavailable(String),

  #[error("Database has panicked: {0}")]
  DatabasePanicked(String),

  #[error("No catch-up source available: {0}")]
  PeerUnavailable(String),

  #[error("Network error: {0}")]
  Network(String),

  #[error("Request timed out after {0} ms")]
  Timeout(u64),

  #[error("Protocol violation: {0}")]
  ProtocolViolation(String),

  #[error("Store copy failed: {0}")]
  StoreCopyFailed(String),

  #[error("Store recovery failed: {0}")]
  RecoveryFailed(String),

  #[error("Illegal state: {0}")]
  IllegalState(String),

  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),
}

impl KiteError {
  /// Whether the catch-up coordinator may retry on a later tick.
  ///
  /// Retryable failures leave no partially committed state behind: peer
  /// selection, transport and protocol failures, and store-copy I/O before
  /// the swap. Everything else poisons the database.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      KiteError::PeerUnavailable(_)
        | KiteError::Network(_)
        | KiteError::Timeout(_)
        | KiteError::ProtocolViolation(_)
        | KiteError::StoreCopyFailed(_)
    )
  }
}
