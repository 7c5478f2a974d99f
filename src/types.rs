//! Core type definitions shared by the store and replication layers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Identifiers
// ============================================================================

/// Node ID (monotonic, never reused)
pub type NodeId = u64;

/// Edge type ID
pub type ETypeId = u32;

/// Label ID
pub type LabelId = u32;

/// Property key ID
pub type PropKeyId = u32;

/// Transaction ID. Zero means "nothing committed yet".
pub type TxId = u64;

/// Transaction id of a store that has never committed anything.
pub const BASE_TX_ID: TxId = 0;

/// Identity of a store lineage.
///
/// Created once at store genesis and compared, never mutated. Two stores can
/// only exchange transactions when their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
  pub creation_time_ms: u64,
  pub random_id: u64,
  pub format_version: u32,
}

impl StoreId {
  pub fn new(creation_time_ms: u64, random_id: u64, format_version: u32) -> Self {
    Self {
      creation_time_ms,
      random_id,
      format_version,
    }
  }

  /// Generate the identity of a brand new store lineage.
  pub fn generate(format_version: u32) -> Self {
    let creation_time_ms = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_millis() as u64;
    Self::new(creation_time_ms, rand::random::<u64>(), format_version)
  }
}

impl fmt::Display for StoreId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Store{{creation={}, random={:016x}, version={}}}",
      self.creation_time_ms, self.random_id, self.format_version
    )
  }
}

// ============================================================================
// Property values
// ============================================================================

/// Property value stored on nodes and edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropValue {
  Null,
  Bool(bool),
  I64(i64),
  F64(f64),
  String(String),
}

// ============================================================================
// Transactions
// ============================================================================

/// A single logical graph mutation carried by a transaction.
///
/// Every command is applied idempotently: replaying a command whose effect is
/// already visible leaves the graph unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GraphCommand {
  CreateNode {
    node_id: NodeId,
    key: Option<String>,
  },
  DeleteNode {
    node_id: NodeId,
  },
  AddEdge {
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
  },
  DeleteEdge {
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
  },
  SetNodeProp {
    node_id: NodeId,
    key_id: PropKeyId,
    value: PropValue,
  },
  DelNodeProp {
    node_id: NodeId,
    key_id: PropKeyId,
  },
  SetEdgeProp {
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
    key_id: PropKeyId,
    value: PropValue,
  },
  DelEdgeProp {
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
    key_id: PropKeyId,
  },
  AddNodeLabel {
    node_id: NodeId,
    label_id: LabelId,
  },
  RemoveNodeLabel {
    node_id: NodeId,
    label_id: LabelId,
  },
}

/// A transaction as committed upstream: its id and the commands it applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedTransaction {
  pub tx_id: TxId,
  pub commands: Vec<GraphCommand>,
}

impl CommittedTransaction {
  pub fn new(tx_id: TxId, commands: Vec<GraphCommand>) -> Self {
    Self { tx_id, commands }
  }
}
