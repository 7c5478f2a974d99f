//! Serving side of catch-up: answers pull, store copy and store id requests
//! from a local [`GraphStore`].

use crate::config::CatchupConfig;
use crate::constants::STORE_COPY_FILES;
use crate::core::store::{GraphStore, StorageEngine};
use crate::error::{KiteError, Result};
use crate::replication::protocol::{
  CatchupErrorKind, CatchupRequest, CatchupResponse, PullRequest, StoreCopyRequest,
};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info};

pub type ResponseSink = Sender<Result<CatchupResponse>>;

#[derive(Debug)]
pub struct CatchupServer {
  store: Arc<Mutex<GraphStore>>,
  max_transactions_per_batch: usize,
  file_chunk_bytes: usize,
}

impl CatchupServer {
  pub fn new(store: Arc<Mutex<GraphStore>>, config: &CatchupConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      store,
      max_transactions_per_batch: config.max_transactions_per_batch,
      file_chunk_bytes: config.file_chunk_bytes,
    })
  }

  pub fn store(&self) -> &Arc<Mutex<GraphStore>> {
    &self.store
  }

  /// Write every response for `request` into `sink`. Fails only when the
  /// requester has gone away or the store cannot be read.
  pub fn handle(&self, request: CatchupRequest, sink: &ResponseSink) -> Result<()> {
    match request {
      CatchupRequest::TxPull(pull) => self.serve_pull(pull, sink),
      CatchupRequest::StoreCopy(copy) => self.serve_store_copy(copy, sink),
      CatchupRequest::GetStoreId => {
        let store_id = self.store.lock().store_id();
        send(sink, CatchupResponse::StoreIdReply { store_id })
      }
    }
  }

  fn serve_pull(&self, request: PullRequest, sink: &ResponseSink) -> Result<()> {
    let store = self.store.lock();
    let latest_tx_id = store.last_committed_tx_id();
    let requested_tx_id = request.previous_tx_id + 1;

    if request.previous_tx_id < latest_tx_id && requested_tx_id < store.log_floor_tx_id() {
      debug!(
        requested_tx_id,
        log_floor = store.log_floor_tx_id(),
        "pull request below log floor"
      );
      return send(
        sink,
        CatchupResponse::Pruned {
          requested_tx_id,
          log_floor_tx_id: store.log_floor_tx_id(),
        },
      );
    }

    let store_id = store.store_id();
    if store_id != request.expected_store_id {
      return send(
        sink,
        CatchupResponse::Error {
          kind: CatchupErrorKind::StoreIdMismatch { remote: store_id },
          message: format!(
            "requested {}, serving {store_id}",
            request.expected_store_id
          ),
        },
      );
    }

    if request.previous_tx_id > latest_tx_id {
      return send(
        sink,
        CatchupResponse::Error {
          kind: CatchupErrorKind::InvalidRequest,
          message: format!(
            "requester is at {} but this peer is at {latest_tx_id}",
            request.previous_tx_id
          ),
        },
      );
    }

    let transactions =
      store.transactions_after(request.previous_tx_id, self.max_transactions_per_batch)?;
    let full_batch = transactions.len() == self.max_transactions_per_batch;
    for tx in transactions {
      send(sink, CatchupResponse::Transaction { store_id, tx })?;
    }

    if full_batch {
      send(sink, CatchupResponse::EndOfBatch { latest_tx_id })
    } else {
      send(sink, CatchupResponse::EndOfStream { latest_tx_id })
    }
  }

  fn serve_store_copy(&self, request: StoreCopyRequest, sink: &ResponseSink) -> Result<()> {
    // Held for the whole copy so files and trailing transactions agree.
    let store = self.store.lock();
    let store_id = store.store_id();
    if store_id != request.expected_store_id {
      return send(
        sink,
        CatchupResponse::Error {
          kind: CatchupErrorKind::StoreIdMismatch { remote: store_id },
          message: format!("store changed to {store_id} before copy"),
        },
      );
    }

    for name in STORE_COPY_FILES {
      self.send_file(&store, name, sink)?;
    }

    let trailing = store.transactions_after(store.snapshot_tx_id(), 0)?;
    let trailing_count = trailing.len();
    for tx in trailing {
      send(sink, CatchupResponse::Transaction { store_id, tx })?;
    }

    let last_tx_id = store.last_committed_tx_id();
    info!(
      store_id = %store_id,
      snapshot_tx_id = store.snapshot_tx_id(),
      trailing_count,
      last_tx_id,
      "served store copy"
    );
    send(sink, CatchupResponse::StoreCopyFinished { last_tx_id })
  }

  fn send_file(&self, store: &GraphStore, name: &str, sink: &ResponseSink) -> Result<()> {
    let path = store.dir().join(name);
    let mut file = File::open(&path)?;
    let length = file.metadata()?.len();
    send(
      sink,
      CatchupResponse::FileHeader {
        file_name: name.to_string(),
        length,
      },
    )?;

    let mut remaining = length;
    loop {
      let chunk_len = remaining.min(self.file_chunk_bytes as u64) as usize;
      let mut data = vec![0u8; chunk_len];
      file.read_exact(&mut data)?;
      remaining -= chunk_len as u64;
      let last = remaining == 0;
      send(sink, CatchupResponse::FileChunk { data, last })?;
      if last {
        return Ok(());
      }
    }
  }
}

fn send(sink: &ResponseSink, response: CatchupResponse) -> Result<()> {
  sink
    .send(Ok(response))
    .map_err(|_| KiteError::Network("requester closed the response stream".to_string()))
}
