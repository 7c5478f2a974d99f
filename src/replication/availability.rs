//! Process-wide database availability gate.
//!
//! Any number of components may block availability at once, each with its own
//! requirement. The database is available only while no requirement is held.
//! Requirements are keyed by identity: raising one that is already held is a
//! no-op, and lowering one only clears that caller's block.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

static NEXT_REQUIREMENT_ID: AtomicU64 = AtomicU64::new(1);

/// A reason for the database being unavailable, owned by one caller.
///
/// Every `new` call yields a distinct identity; clones share it. Two callers
/// using the same description still block independently.
#[derive(Debug, Clone)]
pub struct AvailabilityRequirement {
  id: u64,
  description: String,
}

impl AvailabilityRequirement {
  pub fn new(description: impl Into<String>) -> Self {
    Self {
      id: NEXT_REQUIREMENT_ID.fetch_add(1, Ordering::Relaxed),
      description: description.into(),
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn description(&self) -> &str {
    &self.description
  }
}

impl PartialEq for AvailabilityRequirement {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
  }
}

impl Eq for AvailabilityRequirement {}

impl Hash for AvailabilityRequirement {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.id.hash(state);
  }
}

impl fmt::Display for AvailabilityRequirement {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description)
  }
}

#[derive(Debug, Default)]
pub struct AvailabilityGuard {
  blockers: Mutex<Vec<AvailabilityRequirement>>,
  changed: Condvar,
}

impl AvailabilityGuard {
  pub fn new() -> Self {
    Self::default()
  }

  /// Block availability for `requirement`. Returns `false` if it was already held.
  pub fn require(&self, requirement: &AvailabilityRequirement) -> bool {
    let mut blockers = self.blockers.lock();
    if blockers.contains(requirement) {
      return false;
    }
    blockers.push(requirement.clone());
    debug!(requirement = %requirement, blockers = blockers.len(), "availability raised");
    true
  }

  /// Release `requirement`. Returns `false` if it was not held.
  pub fn fulfill(&self, requirement: &AvailabilityRequirement) -> bool {
    let mut blockers = self.blockers.lock();
    let Some(position) = blockers.iter().position(|held| held == requirement) else {
      return false;
    };
    blockers.remove(position);
    debug!(requirement = %requirement, blockers = blockers.len(), "availability lowered");
    if blockers.is_empty() {
      self.changed.notify_all();
    }
    true
  }

  pub fn is_available(&self) -> bool {
    self.blockers.lock().is_empty()
  }

  pub fn is_blocked_by(&self, requirement: &AvailabilityRequirement) -> bool {
    self.blockers.lock().contains(requirement)
  }

  pub fn blockers(&self) -> Vec<AvailabilityRequirement> {
    self.blockers.lock().clone()
  }

  /// Human-readable list of the current blockers, empty when available.
  pub fn describe_who_is_blocking(&self) -> String {
    let blockers = self.blockers.lock();
    blockers
      .iter()
      .map(|requirement| requirement.description())
      .collect::<Vec<_>>()
      .join(", ")
  }

  /// Wait up to `timeout` for the database to become available.
  pub fn await_available(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut blockers = self.blockers.lock();
    while !blockers.is_empty() {
      if self.changed.wait_until(&mut blockers, deadline).timed_out() {
        return blockers.is_empty();
      }
    }
    true
  }
}
