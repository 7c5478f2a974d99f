//! Catch-up metrics and health checks.
//!
//! Counters are bumped by the coordinator as it works; a [`CatchupMetrics`]
//! snapshot can be rendered as Prometheus text or JSON for status endpoints.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::replication::protocol::CoordinatorState;

/// Live counters owned by a coordinator.
#[derive(Debug, Default)]
pub struct CatchupCounters {
  ticks: AtomicU64,
  pull_requests: AtomicU64,
  batches_received: AtomicU64,
  retryable_failures: AtomicU64,
  store_copies_started: AtomicU64,
  store_copies_succeeded: AtomicU64,
  store_copies_failed: AtomicU64,
  panics: AtomicU64,
}

impl CatchupCounters {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_tick(&self) {
    self.ticks.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_pull_request(&self) {
    self.pull_requests.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_batch(&self) {
    self.batches_received.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_retryable_failure(&self) {
    self.retryable_failures.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_store_copy_started(&self) {
    self.store_copies_started.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_store_copy_result(&self, succeeded: bool) {
    if succeeded {
      self.store_copies_succeeded.fetch_add(1, Ordering::Relaxed);
    } else {
      self.store_copies_failed.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn record_panic(&self) {
    self.panics.fetch_add(1, Ordering::Relaxed);
  }
}

/// Point-in-time view of a coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CatchupMetrics {
  pub state: CoordinatorState,
  pub last_applied_tx_id: u64,
  pub last_queued_tx_id: u64,
  pub upstream_tx_id: u64,
  pub up_to_date: bool,
  pub ticks: u64,
  pub pull_requests: u64,
  pub batches_received: u64,
  pub transactions_applied: u64,
  pub retryable_failures: u64,
  pub store_copies_started: u64,
  pub store_copies_succeeded: u64,
  pub store_copies_failed: u64,
  pub panics: u64,
  pub healthy: bool,
  pub collected_at_ms: i64,
}

/// Coordinator-side values that are not counters.
#[derive(Debug, Clone, Copy)]
pub struct CatchupPosition {
  pub state: CoordinatorState,
  pub last_applied_tx_id: u64,
  pub last_queued_tx_id: u64,
  pub upstream_tx_id: u64,
  pub transactions_applied: u64,
  pub up_to_date: bool,
  pub healthy: bool,
}

impl CatchupMetrics {
  pub fn collect(counters: &CatchupCounters, position: CatchupPosition) -> Self {
    Self {
      state: position.state,
      last_applied_tx_id: position.last_applied_tx_id,
      last_queued_tx_id: position.last_queued_tx_id,
      upstream_tx_id: position.upstream_tx_id,
      up_to_date: position.up_to_date,
      ticks: counters.ticks.load(Ordering::Relaxed),
      pull_requests: counters.pull_requests.load(Ordering::Relaxed),
      batches_received: counters.batches_received.load(Ordering::Relaxed),
      transactions_applied: position.transactions_applied,
      retryable_failures: counters.retryable_failures.load(Ordering::Relaxed),
      store_copies_started: counters.store_copies_started.load(Ordering::Relaxed),
      store_copies_succeeded: counters.store_copies_succeeded.load(Ordering::Relaxed),
      store_copies_failed: counters.store_copies_failed.load(Ordering::Relaxed),
      panics: counters.panics.load(Ordering::Relaxed),
      healthy: position.healthy,
      collected_at_ms: system_time_to_millis(SystemTime::now()),
    }
  }

  pub fn lag(&self) -> u64 {
    self.upstream_tx_id.saturating_sub(self.last_applied_tx_id)
  }
}

/// Health check result
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
  pub healthy: bool,
  pub checks: Vec<HealthCheckEntry>,
}

/// Health check entry
#[derive(Debug, Clone)]
pub struct HealthCheckEntry {
  pub name: String,
  pub passed: bool,
  pub message: String,
}

pub fn health_check(metrics: &CatchupMetrics) -> HealthCheckResult {
  let not_faulted = metrics.state != CoordinatorState::Faulted;
  let checks = vec![
    HealthCheckEntry {
      name: "database_healthy".to_string(),
      passed: metrics.healthy,
      message: if metrics.healthy {
        "Database has not panicked".to_string()
      } else {
        "Database panicked; restart required".to_string()
      },
    },
    HealthCheckEntry {
      name: "catchup_running".to_string(),
      passed: not_faulted,
      message: format!("Catch-up state is {}", metrics.state),
    },
    HealthCheckEntry {
      name: "catchup_up_to_date".to_string(),
      passed: metrics.up_to_date,
      message: if metrics.up_to_date {
        format!("Caught up at transaction {}", metrics.last_applied_tx_id)
      } else {
        format!(
          "Behind upstream by {} transactions (applied {}, upstream {})",
          metrics.lag(),
          metrics.last_applied_tx_id,
          metrics.upstream_tx_id
        )
      },
    },
  ];

  HealthCheckResult {
    healthy: checks.iter().all(|check| check.passed),
    checks,
  }
}

pub fn render_catchup_metrics_prometheus(metrics: &CatchupMetrics) -> String {
  let mut lines = Vec::new();
  let state = metrics.state.to_string();

  push_prometheus_help(
    &mut lines,
    "kitedb_catchup_state",
    "gauge",
    "Current catch-up state (1 for the active state).",
  );
  push_prometheus_sample(&mut lines, "kitedb_catchup_state", 1, &[("state", &state)]);

  let gauges: [(&str, u64, &str); 4] = [
    (
      "kitedb_catchup_last_applied_tx_id",
      metrics.last_applied_tx_id,
      "Last transaction applied to the local store.",
    ),
    (
      "kitedb_catchup_upstream_tx_id",
      metrics.upstream_tx_id,
      "Latest transaction reported by the serving peer.",
    ),
    (
      "kitedb_catchup_lag",
      metrics.lag(),
      "Transactions between upstream and the local store.",
    ),
    (
      "kitedb_catchup_up_to_date",
      u64::from(metrics.up_to_date),
      "Whether the local store has caught up once (1 yes, 0 no).",
    ),
  ];
  for (name, value, help) in gauges {
    push_prometheus_help(&mut lines, name, "gauge", help);
    push_prometheus_sample(&mut lines, name, value as i64, &[]);
  }

  let counters: [(&str, u64, &str); 8] = [
    (
      "kitedb_catchup_ticks_total",
      metrics.ticks,
      "Coordinator ticks run.",
    ),
    (
      "kitedb_catchup_pull_requests_total",
      metrics.pull_requests,
      "Pull requests sent to peers.",
    ),
    (
      "kitedb_catchup_batches_total",
      metrics.batches_received,
      "Transaction batches received.",
    ),
    (
      "kitedb_catchup_transactions_applied_total",
      metrics.transactions_applied,
      "Transactions applied to the local store.",
    ),
    (
      "kitedb_catchup_retryable_failures_total",
      metrics.retryable_failures,
      "Ticks that failed with a retryable error.",
    ),
    (
      "kitedb_catchup_store_copies_started_total",
      metrics.store_copies_started,
      "Store copies attempted.",
    ),
    (
      "kitedb_catchup_store_copies_succeeded_total",
      metrics.store_copies_succeeded,
      "Store copies that replaced the local store.",
    ),
    (
      "kitedb_catchup_store_copies_failed_total",
      metrics.store_copies_failed,
      "Store copies that failed and will be retried.",
    ),
  ];
  for (name, value, help) in counters {
    push_prometheus_help(&mut lines, name, "counter", help);
    push_prometheus_sample(&mut lines, name, value as i64, &[]);
  }

  push_prometheus_help(
    &mut lines,
    "kitedb_catchup_panics_total",
    "counter",
    "Fatal catch-up errors.",
  );
  push_prometheus_sample(
    &mut lines,
    "kitedb_catchup_panics_total",
    metrics.panics as i64,
    &[],
  );

  let mut text = lines.join("\n");
  text.push('\n');
  text
}

pub fn render_catchup_metrics_json(metrics: &CatchupMetrics) -> String {
  json!({
    "state": metrics.state.to_string(),
    "healthy": metrics.healthy,
    "upToDate": metrics.up_to_date,
    "lastAppliedTxId": metrics.last_applied_tx_id,
    "lastQueuedTxId": metrics.last_queued_tx_id,
    "upstreamTxId": metrics.upstream_tx_id,
    "lag": metrics.lag(),
    "counters": {
      "ticks": metrics.ticks,
      "pullRequests": metrics.pull_requests,
      "batchesReceived": metrics.batches_received,
      "transactionsApplied": metrics.transactions_applied,
      "retryableFailures": metrics.retryable_failures,
      "storeCopiesStarted": metrics.store_copies_started,
      "storeCopiesSucceeded": metrics.store_copies_succeeded,
      "storeCopiesFailed": metrics.store_copies_failed,
      "panics": metrics.panics,
    },
    "collectedAtMs": metrics.collected_at_ms,
  })
  .to_string()
}

fn system_time_to_millis(time: SystemTime) -> i64 {
  time
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as i64
}

fn escape_prometheus_label_value(value: &str) -> String {
  value
    .replace('\\', "\\\\")
    .replace('"', "\\\"")
    .replace('\n', "\\n")
}

fn format_prometheus_labels(labels: &[(&str, &str)]) -> String {
  if labels.is_empty() {
    return String::new();
  }

  let rendered = labels
    .iter()
    .map(|(key, value)| format!("{key}=\"{}\"", escape_prometheus_label_value(value)))
    .collect::<Vec<_>>()
    .join(",");
  format!("{{{rendered}}}")
}

fn push_prometheus_help(lines: &mut Vec<String>, metric: &str, metric_type: &str, help: &str) {
  lines.push(format!("# HELP {metric} {help}"));
  lines.push(format!("# TYPE {metric} {metric_type}"));
}

fn push_prometheus_sample(
  lines: &mut Vec<String>,
  metric: &str,
  value: i64,
  labels: &[(&str, &str)],
) {
  lines.push(format!(
    "{metric}{} {value}",
    format_prometheus_labels(labels)
  ));
}

#[cfg(test)]
mod tests {
  use super::{
    health_check, render_catchup_metrics_json, render_catchup_metrics_prometheus, CatchupCounters,
    CatchupMetrics, CatchupPosition,
  };
  use crate::replication::protocol::CoordinatorState;

  fn sample(state: CoordinatorState, up_to_date: bool) -> CatchupMetrics {
    let counters = CatchupCounters::new();
    counters.record_tick();
    counters.record_tick();
    counters.record_store_copy_started();
    counters.record_store_copy_result(false);
    CatchupMetrics::collect(
      &counters,
      CatchupPosition {
        state,
        last_applied_tx_id: 120,
        last_queued_tx_id: 120,
        upstream_tx_id: 500,
        transactions_applied: 120,
        up_to_date,
        healthy: state != CoordinatorState::Faulted,
      },
    )
  }

  #[test]
  fn prometheus_text_has_state_label_and_counters() {
    let text = render_catchup_metrics_prometheus(&sample(CoordinatorState::TxPulling, false));
    assert!(text.contains("kitedb_catchup_state{state=\"TX_PULLING\"} 1"));
    assert!(text.contains("kitedb_catchup_ticks_total 2"));
    assert!(text.contains("kitedb_catchup_lag 380"));
    assert!(text.contains("kitedb_catchup_store_copies_failed_total 1"));
  }

  #[test]
  fn json_snapshot_parses() {
    let text = render_catchup_metrics_json(&sample(CoordinatorState::StoreCopying, false));
    let value: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(value["state"], "STORE_COPYING");
    assert_eq!(value["counters"]["storeCopiesStarted"], 1);
  }

  #[test]
  fn faulted_coordinator_fails_health_check() {
    let result = health_check(&sample(CoordinatorState::Faulted, false));
    assert!(!result.healthy);
    assert!(result
      .checks
      .iter()
      .any(|check| check.name == "catchup_running" && !check.passed));
  }
}
