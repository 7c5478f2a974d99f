//! Choosing which peer to catch up from.

use crate::error::{KiteError, Result};
use crate::replication::protocol::PeerId;
use std::sync::atomic::{AtomicUsize, Ordering};

pub trait PeerSelector: Send + Sync {
  fn select_catchup_source(&self) -> Result<PeerId>;
}

/// Round robin over a fixed peer list.
#[derive(Debug)]
pub struct StaticPeerSelector {
  peers: Vec<PeerId>,
  next: AtomicUsize,
}

impl StaticPeerSelector {
  pub fn new(peers: impl IntoIterator<Item = PeerId>) -> Self {
    Self {
      peers: peers.into_iter().collect(),
      next: AtomicUsize::new(0),
    }
  }

  pub fn peers(&self) -> &[PeerId] {
    &self.peers
  }
}

impl PeerSelector for StaticPeerSelector {
  fn select_catchup_source(&self) -> Result<PeerId> {
    if self.peers.is_empty() {
      return Err(KiteError::PeerUnavailable(
        "no catch-up peers configured".to_string(),
      ));
    }
    let index = self.next.fetch_add(1, Ordering::Relaxed) % self.peers.len();
    Ok(self.peers[index].clone())
  }
}
