//! Repeating background task with a fixed interval plus random jitter.

use crate::error::Result;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use rand::Rng;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
  Continue,
  Stop,
}

#[derive(Debug)]
pub struct RepeatingTask {
  name: String,
  shutdown: Option<Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl RepeatingTask {
  /// Run `handler` on a named worker thread every `interval` plus up to
  /// `jitter`, until it returns [`TaskControl::Stop`] or the task is stopped.
  pub fn spawn<F>(name: &str, interval: Duration, jitter: Duration, mut handler: F) -> Result<Self>
  where
    F: FnMut() -> TaskControl + Send + 'static,
  {
    let (shutdown, shutdown_rx) = bounded::<()>(1);
    let thread_name = name.to_string();
    let handle = thread::Builder::new().name(thread_name.clone()).spawn(move || {
      let mut rng = rand::thread_rng();
      loop {
        let delay = if jitter.is_zero() {
          interval
        } else {
          interval + Duration::from_millis(rng.gen_range(0..=jitter.as_millis() as u64))
        };
        match shutdown_rx.recv_timeout(delay) {
          Err(RecvTimeoutError::Timeout) => {
            if handler() == TaskControl::Stop {
              debug!(task = %thread_name, "repeating task finished");
              return;
            }
          }
          Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
      }
    })?;

    Ok(Self {
      name: name.to_string(),
      shutdown: Some(shutdown),
      handle: Some(handle),
    })
  }

  pub fn is_running(&self) -> bool {
    self
      .handle
      .as_ref()
      .map(|handle| !handle.is_finished())
      .unwrap_or(false)
  }

  /// Signal the worker and wait for its current run to end. Calling this
  /// from the worker itself only signals.
  pub fn stop(&mut self) {
    if let Some(shutdown) = self.shutdown.take() {
      let _ = shutdown.try_send(());
    }
    let Some(handle) = self.handle.take() else {
      return;
    };
    if handle.thread().id() == thread::current().id() {
      return;
    }
    if handle.join().is_err() {
      error!(task = %self.name, "repeating task panicked");
    }
  }
}

impl Drop for RepeatingTask {
  fn drop(&mut self) {
    self.stop();
  }
}
