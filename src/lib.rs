//! KiteDB catch-up - keeps a secondary graph store in step with a primary
//!
//! A replica pulls committed transactions from a peer and applies them in
//! order. When the history it needs has been pruned upstream it copies the
//! peer's whole store instead, then resumes pulling.
//!
//! # Architecture
//!
//! - **Storage**: a directory holding a snapshot, a framed transaction log
//!   and store metadata, opened behind an exclusive file lock
//! - **Availability guard**: process-wide gate readers consult before using
//!   the local store
//! - **Coordinator**: timer-driven state machine (`TX_PULLING`,
//!   `STORE_COPYING`, `FAULTED`) driving the applier and store copy
//!
//! # Features
//!
//! - Ordered, idempotent transaction application in batches
//! - Staged store copy with recovery and atomic directory swap
//! - Sticky panic that poisons database health on fatal errors
//! - In-process transport and server for embedding and testing

#![deny(clippy::all)]

// Core modules
pub mod config;
pub mod constants;
pub mod error;
pub mod types;
pub mod util;

// Storage layer
pub mod core;

// Catch-up replication
pub mod replication;

// Status reporting
pub mod metrics;

// Re-export commonly used items
pub use config::{CatchupConfig, TxApplyPolicy};
pub use error::{KiteError, Result};
pub use types::{CommittedTransaction, GraphCommand, PropValue, StoreId, TxId};

pub use crate::core::{GraphState, GraphStore, StorageEngine};
pub use replication::{
  AvailabilityGuard, CatchupCoordinator, CatchupServer, CoordinatorState, DatabaseHealth,
  InProcessTransport, LocalDatabase, PeerId, StaticPeerSelector,
};

/// Crate version
pub fn version() -> String {
  env!("CARGO_PKG_VERSION").to_string()
}
