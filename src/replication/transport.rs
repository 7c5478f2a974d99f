//! In-process transport: routes requests straight to registered
//! [`CatchupServer`]s. Used by embedders that run several stores in one
//! process and by the integration tests, which drive its fault hooks.

use crate::error::{KiteError, Result};
use crate::replication::client::{CatchupTransport, ResponseStream};
use crate::replication::peer::PeerSelector;
use crate::replication::protocol::{CatchupRequest, CatchupResponse, PeerId};
use crate::replication::server::CatchupServer;
use crossbeam_channel::unbounded;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
struct PeerFaults {
  unreachable: bool,
  /// Cut the next store copy after this many file chunks.
  fail_store_copy_after_chunks: Option<usize>,
}

#[derive(Debug, Default)]
pub struct InProcessTransport {
  peers: RwLock<BTreeMap<PeerId, Arc<CatchupServer>>>,
  faults: Mutex<BTreeMap<PeerId, PeerFaults>>,
}

impl InProcessTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, peer: PeerId, server: Arc<CatchupServer>) {
    debug!(peer = %peer, "registered in-process catch-up peer");
    self.peers.write().insert(peer, server);
  }

  pub fn deregister(&self, peer: &PeerId) -> Option<Arc<CatchupServer>> {
    self.faults.lock().remove(peer);
    self.peers.write().remove(peer)
  }

  pub fn peers(&self) -> Vec<PeerId> {
    self.peers.read().keys().cloned().collect()
  }

  pub fn set_unreachable_for_testing(&self, peer: &PeerId, unreachable: bool) {
    self
      .faults
      .lock()
      .entry(peer.clone())
      .or_default()
      .unreachable = unreachable;
  }

  pub fn fail_next_store_copy_after_chunks_for_testing(&self, peer: &PeerId, chunks: usize) {
    self
      .faults
      .lock()
      .entry(peer.clone())
      .or_default()
      .fail_store_copy_after_chunks = Some(chunks);
  }

  fn is_unreachable(&self, peer: &PeerId) -> bool {
    self
      .faults
      .lock()
      .get(peer)
      .map(|faults| faults.unreachable)
      .unwrap_or(false)
  }

  fn take_store_copy_fault(&self, peer: &PeerId) -> Option<usize> {
    self
      .faults
      .lock()
      .get_mut(peer)
      .and_then(|faults| faults.fail_store_copy_after_chunks.take())
  }
}

impl CatchupTransport for InProcessTransport {
  fn send(&self, peer: &PeerId, request: CatchupRequest) -> Result<ResponseStream> {
    if self.is_unreachable(peer) {
      return Err(KiteError::Network(format!("{peer} is unreachable")));
    }
    let server = self
      .peers
      .read()
      .get(peer)
      .cloned()
      .ok_or_else(|| KiteError::Network(format!("unknown peer {peer}")))?;

    let cut_after = match request {
      CatchupRequest::StoreCopy(_) => self.take_store_copy_fault(peer),
      CatchupRequest::TxPull(_) | CatchupRequest::GetStoreId => None,
    };

    let (tx, rx) = unbounded();
    let Some(cut_after) = cut_after else {
      if let Err(error) = server.handle(request, &tx) {
        let _ = tx.send(Err(error));
      }
      return Ok(rx);
    };

    let (inner_tx, inner_rx) = unbounded();
    let served = server.handle(request, &inner_tx);
    drop(inner_tx);

    let mut chunks = 0usize;
    for item in inner_rx {
      if matches!(item, Ok(CatchupResponse::FileChunk { .. })) {
        if chunks == cut_after {
          debug!(peer = %peer, chunks, "injected store copy failure");
          let _ = tx.send(Err(KiteError::Network(format!(
            "connection to {peer} reset during store copy"
          ))));
          return Ok(rx);
        }
        chunks += 1;
      }
      let _ = tx.send(item);
    }
    if let Err(error) = served {
      let _ = tx.send(Err(error));
    }
    Ok(rx)
  }
}

impl PeerSelector for InProcessTransport {
  /// First registered peer that is currently reachable.
  fn select_catchup_source(&self) -> Result<PeerId> {
    let peers = self.peers.read();
    peers
      .keys()
      .find(|peer| !self.is_unreachable(peer))
      .cloned()
      .ok_or_else(|| KiteError::PeerUnavailable("no reachable in-process peer".to_string()))
  }
}
