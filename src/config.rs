//! Catch-up configuration

use crate::constants::{
  DEFAULT_FILE_CHUNK_BYTES, DEFAULT_MAX_TRANSACTIONS_PER_BATCH, DEFAULT_REQUEST_TIMEOUT_MS,
  DEFAULT_TICK_INTERVAL_MS, DEFAULT_TICK_JITTER_MS,
};
use crate::error::{KiteError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What the batching applier does with a transaction id that does not
/// directly follow the last queued one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxApplyPolicy {
  /// Reject the transaction; the gap is a fatal error.
  #[default]
  Strict,
  /// Accept the transaction and fast-forward past the gap.
  TolerateGaps,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatchupConfig {
  /// Delay between coordinator ticks
  pub tick_interval_ms: u64,
  /// Upper bound of the random delay added to each tick interval
  pub tick_jitter_ms: u64,
  /// Longest wait for the next message of a response stream
  pub request_timeout_ms: u64,
  pub tx_apply_policy: TxApplyPolicy,
  /// Transactions a serving peer sends before ending a batch
  pub max_transactions_per_batch: usize,
  /// Size of the chunks a serving peer splits store files into
  pub file_chunk_bytes: usize,
}

impl Default for CatchupConfig {
  fn default() -> Self {
    Self {
      tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
      tick_jitter_ms: DEFAULT_TICK_JITTER_MS,
      request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
      tx_apply_policy: TxApplyPolicy::default(),
      max_transactions_per_batch: DEFAULT_MAX_TRANSACTIONS_PER_BATCH,
      file_chunk_bytes: DEFAULT_FILE_CHUNK_BYTES,
    }
  }
}

impl CatchupConfig {
  pub fn new() -> Self {
    Self::default()
  }

  /// Load a JSON config file; missing fields take their defaults.
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let config: CatchupConfig = serde_json::from_slice(&bytes).map_err(|error| {
      KiteError::InvalidConfig(format!("{}: {error}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.tick_interval_ms == 0 {
      return Err(KiteError::InvalidConfig(
        "tick_interval_ms must be > 0".to_string(),
      ));
    }
    if self.request_timeout_ms == 0 {
      return Err(KiteError::InvalidConfig(
        "request_timeout_ms must be > 0".to_string(),
      ));
    }
    if self.max_transactions_per_batch == 0 {
      return Err(KiteError::InvalidConfig(
        "max_transactions_per_batch must be > 0".to_string(),
      ));
    }
    if self.file_chunk_bytes == 0 {
      return Err(KiteError::InvalidConfig(
        "file_chunk_bytes must be > 0".to_string(),
      ));
    }
    Ok(())
  }

  pub fn tick_interval(mut self, interval: Duration) -> Self {
    self.tick_interval_ms = interval.as_millis() as u64;
    self
  }

  pub fn tick_jitter(mut self, jitter: Duration) -> Self {
    self.tick_jitter_ms = jitter.as_millis() as u64;
    self
  }

  pub fn request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout_ms = timeout.as_millis() as u64;
    self
  }

  pub fn tx_apply_policy(mut self, policy: TxApplyPolicy) -> Self {
    self.tx_apply_policy = policy;
    self
  }

  pub fn max_transactions_per_batch(mut self, max: usize) -> Self {
    self.max_transactions_per_batch = max;
    self
  }

  pub fn file_chunk_bytes(mut self, bytes: usize) -> Self {
    self.file_chunk_bytes = bytes;
    self
  }

  pub fn tick_interval_duration(&self) -> Duration {
    Duration::from_millis(self.tick_interval_ms)
  }

  pub fn tick_jitter_duration(&self) -> Duration {
    Duration::from_millis(self.tick_jitter_ms)
  }

  pub fn request_timeout_duration(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }
}
