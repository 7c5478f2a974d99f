//! Database health: the poison signal raised by a replication panic.

use crate::error::{KiteError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

#[derive(Debug)]
pub struct DatabaseHealth {
  healthy: AtomicBool,
  cause: Mutex<Option<String>>,
}

impl Default for DatabaseHealth {
  fn default() -> Self {
    Self {
      healthy: AtomicBool::new(true),
      cause: Mutex::new(None),
    }
  }
}

impl DatabaseHealth {
  pub fn new() -> Self {
    Self::default()
  }

  /// Poison the database. Only the first cause is kept.
  pub fn panic(&self, cause: &KiteError) {
    let mut stored = self.cause.lock();
    if stored.is_none() {
      *stored = Some(cause.to_string());
    }
    self.healthy.store(false, Ordering::Release);
    error!(error = %cause, "database panic: refusing further work");
  }

  pub fn is_healthy(&self) -> bool {
    self.healthy.load(Ordering::Acquire)
  }

  pub fn cause(&self) -> Option<String> {
    self.cause.lock().clone()
  }

  pub fn assert_healthy(&self) -> Result<()> {
    if self.is_healthy() {
      return Ok(());
    }
    Err(KiteError::DatabasePanicked(
      self
        .cause()
        .unwrap_or_else(|| "unknown cause".to_string()),
    ))
  }
}
