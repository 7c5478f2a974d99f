//! Storage layer: transaction log, graph state and the file-backed store

pub mod graph;
pub mod store;
pub mod tx_log;

pub use graph::GraphState;
pub use store::{GraphStore, RecoveryOutcome, StorageEngine, StoreInfo};
