//! Catch-up client: sends one request to a peer and feeds the response stream
//! into a dispatcher until the dispatcher reports completion.

use crate::error::{KiteError, Result};
use crate::replication::protocol::{CatchupRequest, CatchupResponse, PeerId};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Responses for one request, in the order the peer produced them. An `Err`
/// item ends the stream with a failure on the peer's side.
pub type ResponseStream = Receiver<Result<CatchupResponse>>;

/// Delivery of catch-up requests to peers.
pub trait CatchupTransport: Send + Sync {
  fn send(&self, peer: &PeerId, request: CatchupRequest) -> Result<ResponseStream>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch<T> {
  Continue,
  Complete(T),
}

/// Per-request handling of the response stream.
pub trait ResponseDispatcher {
  type Output;

  fn on_response(&mut self, response: CatchupResponse) -> Result<Dispatch<Self::Output>>;
}

/// Error for a response that does not belong to the request in flight.
pub fn unexpected_response<T>(response: &CatchupResponse) -> Result<T> {
  Err(KiteError::ProtocolViolation(format!(
    "unexpected {} response",
    response.kind()
  )))
}

/// Failures raised by the peer say nothing about the local store, so they
/// are reported as network errors the caller may retry.
fn remote_failure(peer: &PeerId, error: KiteError) -> KiteError {
  if error.is_retryable() {
    return error;
  }
  KiteError::Network(format!("{peer}: {error}"))
}

pub struct CatchUpClient {
  transport: Arc<dyn CatchupTransport>,
  timeout: Duration,
}

impl std::fmt::Debug for CatchUpClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CatchUpClient")
      .field("timeout", &self.timeout)
      .finish_non_exhaustive()
  }
}

impl CatchUpClient {
  pub fn new(transport: Arc<dyn CatchupTransport>, timeout: Duration) -> Self {
    Self { transport, timeout }
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// Send `request` to `peer` and block until `dispatcher` completes. Each
  /// message must arrive within the client timeout.
  pub fn make_blocking_request<D: ResponseDispatcher>(
    &self,
    peer: &PeerId,
    request: CatchupRequest,
    dispatcher: &mut D,
  ) -> Result<D::Output> {
    let kind = request.kind();
    let stream = self.transport.send(peer, request)?;
    loop {
      match stream.recv_timeout(self.timeout) {
        Ok(Ok(response)) => {
          trace!(peer = %peer, request = kind, response = response.kind(), "catch-up response");
          if let Dispatch::Complete(output) = dispatcher.on_response(response)? {
            return Ok(output);
          }
        }
        Ok(Err(error)) => return Err(remote_failure(peer, error)),
        Err(RecvTimeoutError::Timeout) => {
          return Err(KiteError::Timeout(self.timeout.as_millis() as u64));
        }
        Err(RecvTimeoutError::Disconnected) => {
          return Err(KiteError::Network(format!(
            "{peer} closed the {kind} response stream early"
          )));
        }
      }
    }
  }
}
