//! In-memory graph state and idempotent command application.
//!
//! This is the logical content of a store: nodes with keys, labels and
//! properties, and typed edges with properties. Commands are replayed from
//! the transaction log on open and applied by replication on replicas, so
//! every command must be safe to apply twice.

use crate::error::{KiteError, Result};
use crate::types::{ETypeId, GraphCommand, LabelId, NodeId, PropKeyId, PropValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type EdgeKey = (NodeId, ETypeId, NodeId);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
  pub key: Option<String>,
  #[serde(default)]
  pub labels: BTreeSet<LabelId>,
  #[serde(default)]
  pub props: BTreeMap<PropKeyId, PropValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphState {
  nodes: BTreeMap<NodeId, NodeRecord>,
  edges: BTreeMap<EdgeKey, BTreeMap<PropKeyId, PropValue>>,
}

#[derive(Serialize, Deserialize)]
struct EdgeEntry {
  src: NodeId,
  etype: ETypeId,
  dst: NodeId,
  #[serde(default)]
  props: BTreeMap<PropKeyId, PropValue>,
}

#[derive(Serialize, Deserialize)]
struct GraphImage {
  nodes: BTreeMap<NodeId, NodeRecord>,
  edges: Vec<EdgeEntry>,
}

impl GraphState {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn count_nodes(&self) -> usize {
    self.nodes.len()
  }

  pub fn count_edges(&self) -> usize {
    self.edges.len()
  }

  pub fn node_exists(&self, node_id: NodeId) -> bool {
    self.nodes.contains_key(&node_id)
  }

  pub fn node(&self, node_id: NodeId) -> Option<&NodeRecord> {
    self.nodes.get(&node_id)
  }

  pub fn node_key(&self, node_id: NodeId) -> Option<&str> {
    self.nodes.get(&node_id).and_then(|node| node.key.as_deref())
  }

  pub fn node_prop(&self, node_id: NodeId, key_id: PropKeyId) -> Option<&PropValue> {
    self
      .nodes
      .get(&node_id)
      .and_then(|node| node.props.get(&key_id))
  }

  pub fn node_has_label(&self, node_id: NodeId, label_id: LabelId) -> bool {
    self
      .nodes
      .get(&node_id)
      .map(|node| node.labels.contains(&label_id))
      .unwrap_or(false)
  }

  pub fn edge_exists(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> bool {
    self.edges.contains_key(&(src, etype, dst))
  }

  pub fn edge_prop(
    &self,
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
    key_id: PropKeyId,
  ) -> Option<&PropValue> {
    self
      .edges
      .get(&(src, etype, dst))
      .and_then(|props| props.get(&key_id))
  }

  pub fn list_nodes(&self) -> Vec<NodeId> {
    self.nodes.keys().copied().collect()
  }

  pub fn list_edges(&self) -> Vec<EdgeKey> {
    self.edges.keys().copied().collect()
  }

  /// Apply one command. Commands whose effect is already visible are no-ops.
  pub fn apply(&mut self, command: &GraphCommand) -> Result<()> {
    match command {
      GraphCommand::CreateNode { node_id, key } => {
        if let Some(existing) = self.nodes.get(node_id) {
          if existing.key == *key {
            return Ok(());
          }
          return Err(KiteError::InvalidReplication(format!(
            "create-node replay key mismatch for node {node_id}"
          )));
        }
        self.nodes.insert(
          *node_id,
          NodeRecord {
            key: key.clone(),
            ..NodeRecord::default()
          },
        );
        Ok(())
      }
      GraphCommand::DeleteNode { node_id } => {
        if self.nodes.remove(node_id).is_some() {
          self
            .edges
            .retain(|(src, _, dst), _| src != node_id && dst != node_id);
        }
        Ok(())
      }
      GraphCommand::AddEdge { src, etype, dst } => {
        self.require_node(*src)?;
        self.require_node(*dst)?;
        self.edges.entry((*src, *etype, *dst)).or_default();
        Ok(())
      }
      GraphCommand::DeleteEdge { src, etype, dst } => {
        self.edges.remove(&(*src, *etype, *dst));
        Ok(())
      }
      GraphCommand::SetNodeProp {
        node_id,
        key_id,
        value,
      } => {
        let node = self
          .nodes
          .get_mut(node_id)
          .ok_or(KiteError::NodeNotFound(*node_id))?;
        node.props.insert(*key_id, value.clone());
        Ok(())
      }
      GraphCommand::DelNodeProp { node_id, key_id } => {
        if let Some(node) = self.nodes.get_mut(node_id) {
          node.props.remove(key_id);
        }
        Ok(())
      }
      GraphCommand::SetEdgeProp {
        src,
        etype,
        dst,
        key_id,
        value,
      } => {
        let props = self.edges.get_mut(&(*src, *etype, *dst)).ok_or_else(|| {
          KiteError::InvalidReplication(format!("edge {src}-[{etype}]->{dst} does not exist"))
        })?;
        props.insert(*key_id, value.clone());
        Ok(())
      }
      GraphCommand::DelEdgeProp {
        src,
        etype,
        dst,
        key_id,
      } => {
        if let Some(props) = self.edges.get_mut(&(*src, *etype, *dst)) {
          props.remove(key_id);
        }
        Ok(())
      }
      GraphCommand::AddNodeLabel { node_id, label_id } => {
        let node = self
          .nodes
          .get_mut(node_id)
          .ok_or(KiteError::NodeNotFound(*node_id))?;
        node.labels.insert(*label_id);
        Ok(())
      }
      GraphCommand::RemoveNodeLabel { node_id, label_id } => {
        if let Some(node) = self.nodes.get_mut(node_id) {
          node.labels.remove(label_id);
        }
        Ok(())
      }
    }
  }

  /// Apply all commands of a transaction, or none of them.
  pub fn apply_all(&mut self, commands: &[GraphCommand]) -> Result<()> {
    *self = self.with_applied(commands)?;
    Ok(())
  }

  /// The state this graph would have after `commands`, leaving `self` as is.
  pub fn with_applied(&self, commands: &[GraphCommand]) -> Result<GraphState> {
    let mut next = self.clone();
    for command in commands {
      next.apply(command)?;
    }
    Ok(next)
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    let image = GraphImage {
      nodes: self.nodes.clone(),
      edges: self
        .edges
        .iter()
        .map(|(&(src, etype, dst), props)| EdgeEntry {
          src,
          etype,
          dst,
          props: props.clone(),
        })
        .collect(),
    };
    serde_json::to_vec(&image)
      .map_err(|error| KiteError::Serialization(format!("encode graph image failed: {error}")))
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    let image: GraphImage = serde_json::from_slice(bytes)
      .map_err(|error| KiteError::Serialization(format!("decode graph image failed: {error}")))?;
    Ok(Self {
      nodes: image.nodes,
      edges: image
        .edges
        .into_iter()
        .map(|edge| ((edge.src, edge.etype, edge.dst), edge.props))
        .collect(),
    })
  }

  fn require_node(&self, node_id: NodeId) -> Result<()> {
    if self.nodes.contains_key(&node_id) {
      Ok(())
    } else {
      Err(KiteError::NodeNotFound(node_id))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::GraphState;
  use crate::types::{GraphCommand, PropValue};

  fn create(node_id: u64, key: &str) -> GraphCommand {
    GraphCommand::CreateNode {
      node_id,
      key: Some(key.to_string()),
    }
  }

  #[test]
  fn replaying_commands_is_idempotent() {
    let commands = vec![
      create(1, "alice"),
      create(2, "bob"),
      GraphCommand::AddEdge {
        src: 1,
        etype: 7,
        dst: 2,
      },
      GraphCommand::SetNodeProp {
        node_id: 1,
        key_id: 3,
        value: PropValue::I64(42),
      },
      GraphCommand::AddNodeLabel {
        node_id: 2,
        label_id: 9,
      },
    ];

    let mut graph = GraphState::new();
    graph.apply_all(&commands).expect("first apply");
    let once = graph.clone();
    graph.apply_all(&commands).expect("replay");

    assert_eq!(graph, once);
    assert_eq!(graph.count_nodes(), 2);
    assert_eq!(graph.count_edges(), 1);
    assert_eq!(graph.node_prop(1, 3), Some(&PropValue::I64(42)));
    assert!(graph.node_has_label(2, 9));
  }

  #[test]
  fn create_node_with_different_key_is_rejected() {
    let mut graph = GraphState::new();
    graph.apply(&create(1, "alice")).expect("create");
    assert!(graph.apply(&create(1, "mallory")).is_err());
  }

  #[test]
  fn failed_transaction_leaves_graph_untouched() {
    let mut graph = GraphState::new();
    graph.apply(&create(1, "alice")).expect("create");

    let result = graph.apply_all(&[
      create(2, "bob"),
      GraphCommand::AddEdge {
        src: 2,
        etype: 1,
        dst: 99,
      },
    ]);

    assert!(result.is_err());
    assert_eq!(graph.list_nodes(), vec![1]);
  }

  #[test]
  fn delete_node_drops_incident_edges() {
    let mut graph = GraphState::new();
    graph
      .apply_all(&[
        create(1, "a"),
        create(2, "b"),
        GraphCommand::AddEdge {
          src: 1,
          etype: 1,
          dst: 2,
        },
        GraphCommand::DeleteNode { node_id: 2 },
      ])
      .expect("apply");
    assert_eq!(graph.count_edges(), 0);
  }

  #[test]
  fn image_survives_encoding() {
    let mut graph = GraphState::new();
    graph
      .apply_all(&[
        create(1, "a"),
        create(2, "b"),
        GraphCommand::AddEdge {
          src: 1,
          etype: 4,
          dst: 2,
        },
        GraphCommand::SetEdgeProp {
          src: 1,
          etype: 4,
          dst: 2,
          key_id: 1,
          value: PropValue::String("since-2020".to_string()),
        },
      ])
      .expect("apply");

    let decoded = GraphState::from_bytes(&graph.to_bytes().expect("encode")).expect("decode");
    assert_eq!(decoded, graph);
  }
}
