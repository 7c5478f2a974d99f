use kitedb_catchup::constants::{STAGING_DIR_PREFIX, STORE_COPY_FILES};
use kitedb_catchup::replication::client::{CatchupTransport, ResponseStream};
use kitedb_catchup::replication::protocol::CatchupRequest;
use kitedb_catchup::replication::store_copy::StoreCopyProcess;
use kitedb_catchup::replication::CatchUpClient;
use kitedb_catchup::{
  AvailabilityGuard, CatchupConfig, CatchupCoordinator, CatchupServer, CoordinatorState,
  DatabaseHealth, GraphCommand, GraphStore, InProcessTransport, KiteError, LocalDatabase, PeerId,
  StorageEngine,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const PRIMARY: &str = "core-1";

fn create_node(node_id: u64) -> Vec<GraphCommand> {
  vec![
    GraphCommand::CreateNode {
      node_id,
      key: Some(format!("n{node_id}")),
    },
    GraphCommand::AddNodeLabel {
      node_id,
      label_id: 1,
    },
  ]
}

fn open_primary(path: &Path, commits: u64) -> Arc<Mutex<GraphStore>> {
  let mut store = GraphStore::open(path).expect("open primary");
  for node_id in 1..=commits {
    store.commit(create_node(node_id)).expect("commit");
  }
  Arc::new(Mutex::new(store))
}

/// Checkpoint the primary and drop every logged transaction.
fn prune_all(primary: &Arc<Mutex<GraphStore>>) {
  let mut store = primary.lock();
  let snapshot = store.checkpoint().expect("checkpoint");
  store.prune_log_before(snapshot + 1).expect("prune");
}

/// Seed `to` with the files of `from` so both stores share a lineage.
fn clone_store_files(from: &Path, to: &Path) {
  std::fs::create_dir_all(to).expect("create replica dir");
  for name in STORE_COPY_FILES {
    std::fs::copy(from.join(name), to.join(name)).expect("copy store file");
  }
}

fn local_database(path: &Path) -> Arc<LocalDatabase> {
  Arc::new(LocalDatabase::new(
    path,
    Arc::new(AvailabilityGuard::new()),
    Arc::new(DatabaseHealth::new()),
  ))
}

fn transport_for(primary: &Arc<Mutex<GraphStore>>, config: &CatchupConfig) -> Arc<InProcessTransport> {
  let transport = Arc::new(InProcessTransport::new());
  transport.register(
    PeerId::from(PRIMARY),
    Arc::new(CatchupServer::new(Arc::clone(primary), config).expect("server")),
  );
  transport
}

fn coordinator(
  config: CatchupConfig,
  local_db: &Arc<LocalDatabase>,
  transport: Arc<dyn CatchupTransport>,
  selector: Arc<InProcessTransport>,
) -> CatchupCoordinator {
  CatchupCoordinator::new(config, Arc::clone(local_db), selector, transport).expect("coordinator")
}

fn staging_leftovers(parent: &Path) -> Vec<PathBuf> {
  std::fs::read_dir(parent)
    .expect("read parent")
    .map(|entry| entry.expect("entry").path())
    .filter(|path| {
      path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(STAGING_DIR_PREFIX))
    })
    .collect()
}

fn snapshot_dir(path: &Path) -> BTreeMap<String, Vec<u8>> {
  std::fs::read_dir(path)
    .expect("read store dir")
    .map(|entry| {
      let entry = entry.expect("entry");
      (
        entry.file_name().to_string_lossy().into_owned(),
        std::fs::read(entry.path()).expect("read store file"),
      )
    })
    .collect()
}

/// Wraps a transport and records the watermark of every pull request.
struct RecordingTransport {
  inner: Arc<InProcessTransport>,
  pulls: Mutex<Vec<u64>>,
}

impl CatchupTransport for RecordingTransport {
  fn send(&self, peer: &PeerId, request: CatchupRequest) -> kitedb_catchup::Result<ResponseStream> {
    if let CatchupRequest::TxPull(pull) = &request {
      self.pulls.lock().push(pull.previous_tx_id);
    }
    self.inner.send(peer, request)
  }
}

#[test]
fn empty_replica_copies_pruned_primary_then_catches_up() {
  let dir = tempfile::tempdir().expect("tempdir");
  let config = CatchupConfig::default().file_chunk_bytes(256);
  let primary = open_primary(&dir.path().join("primary"), 100);
  prune_all(&primary);
  let transport = transport_for(&primary, &config);

  let local_db = local_database(&dir.path().join("replica"));
  local_db.start().expect("start replica");
  assert!(local_db.is_empty().expect("is empty"));

  let coordinator = coordinator(
    config,
    &local_db,
    transport.clone(),
    transport.clone(),
  );
  let up_to_date = coordinator.up_to_date_future();

  coordinator.on_timeout();
  assert_eq!(coordinator.state(), CoordinatorState::StoreCopying);
  assert!(!up_to_date.is_done());

  coordinator.on_timeout();
  assert_eq!(coordinator.state(), CoordinatorState::TxPulling);
  assert_eq!(coordinator.applier().last_applied_tx_id(), 100);
  assert_eq!(
    local_db.store_id().expect("replica store id"),
    primary.lock().store_id()
  );

  coordinator.on_timeout();
  assert!(matches!(up_to_date.get(), Some(Ok(true))));
  assert_eq!(coordinator.describe_state(), "TX_PULLING (100 of 100)");
  assert_eq!(
    local_db.read(|graph| graph.count_nodes()).expect("read"),
    100
  );
  assert!(staging_leftovers(dir.path()).is_empty());

  let metrics = coordinator.metrics();
  assert_eq!(metrics.store_copies_started, 1);
  assert_eq!(metrics.store_copies_succeeded, 1);
  assert_eq!(metrics.panics, 0);
}

#[test]
fn batches_are_pulled_and_applied_one_at_a_time() {
  let dir = tempfile::tempdir().expect("tempdir");
  let config = CatchupConfig::default().max_transactions_per_batch(1);
  let primary_path = dir.path().join("primary");
  let replica_path = dir.path().join("replica");
  let primary = open_primary(&primary_path, 0);
  clone_store_files(&primary_path, &replica_path);
  {
    let mut store = primary.lock();
    for node_id in 1..=3 {
      store.commit(create_node(node_id)).expect("commit");
    }
  }

  let in_process = transport_for(&primary, &config);
  let recording = Arc::new(RecordingTransport {
    inner: in_process.clone(),
    pulls: Mutex::new(Vec::new()),
  });
  let local_db = local_database(&replica_path);
  local_db.start().expect("start replica");

  let coordinator = coordinator(config, &local_db, recording.clone(), in_process);
  coordinator.applier().start().expect("position applier");
  coordinator.on_timeout();

  assert_eq!(*recording.pulls.lock(), vec![0, 1, 2, 3]);
  assert_eq!(coordinator.applier().last_queued_tx_id(), 3);
  let stats = coordinator.applier().stats();
  assert_eq!(stats.apply_calls, 4);
  assert_eq!(stats.transactions_applied, 3);
  assert!(matches!(
    coordinator.up_to_date_future().get(),
    Some(Ok(true))
  ));
  assert_eq!(local_db.last_committed_tx_id().expect("last"), 3);
}

#[test]
fn foreign_store_on_non_empty_replica_faults_the_coordinator() {
  let dir = tempfile::tempdir().expect("tempdir");
  let config = CatchupConfig::default();
  let primary = open_primary(&dir.path().join("primary"), 5);
  prune_all(&primary);
  let transport = transport_for(&primary, &config);

  let replica_path = dir.path().join("replica");
  {
    let mut replica = GraphStore::open(&replica_path).expect("open replica");
    replica.commit(create_node(1)).expect("commit");
    replica.commit(create_node(2)).expect("commit");
    StorageEngine::close(replica).expect("close replica");
  }
  let local_db = local_database(&replica_path);
  local_db.start().expect("start replica");

  let coordinator = coordinator(config, &local_db, transport.clone(), transport);
  coordinator.applier().start().expect("position applier");
  let up_to_date = coordinator.up_to_date_future();

  coordinator.on_timeout();
  assert_eq!(coordinator.state(), CoordinatorState::StoreCopying);

  coordinator.on_timeout();
  assert_eq!(coordinator.state(), CoordinatorState::Faulted);
  assert!(matches!(up_to_date.get(), Some(Err(_))));
  assert!(!local_db.health().is_healthy());
  assert!(local_db
    .health()
    .cause()
    .expect("cause")
    .contains("Store id mismatch"));

  let ticks = coordinator.metrics().ticks;
  coordinator.on_timeout();
  coordinator.on_timeout();
  assert_eq!(coordinator.state(), CoordinatorState::Faulted);
  assert_eq!(coordinator.metrics().ticks, ticks);
  assert!(matches!(
    local_db.read(|graph| graph.count_nodes()),
    Err(KiteError::DatabasePanicked(_))
  ));
}

#[test]
fn replace_with_foreign_store_is_a_configuration_error() {
  let dir = tempfile::tempdir().expect("tempdir");
  let config = CatchupConfig::default();
  let primary = open_primary(&dir.path().join("primary"), 3);
  let transport = transport_for(&primary, &config);

  let replica_path = dir.path().join("replica");
  let local_db = local_database(&replica_path);
  local_db.start().expect("start replica");
  local_db
    .apply_transactions(&[kitedb_catchup::CommittedTransaction::new(1, create_node(1))])
    .expect("apply");
  let local_store_id = local_db.store_id().expect("store id");

  let client = Arc::new(CatchUpClient::new(transport, Duration::from_secs(5)));
  let process = StoreCopyProcess::new(Arc::clone(&local_db), client);
  let err = process
    .replace_with_store_from(&PeerId::from(PRIMARY), local_store_id)
    .expect_err("foreign store must be refused");

  assert!(matches!(err, KiteError::StoreIdMismatch { .. }));
  assert!(!err.is_retryable());
  assert!(local_db.is_started(), "refusal happens before the stop");
}

#[test]
fn interrupted_copy_leaves_replica_untouched_and_retries() {
  let dir = tempfile::tempdir().expect("tempdir");
  let config = CatchupConfig::default().file_chunk_bytes(8);
  let primary = open_primary(&dir.path().join("primary"), 5);
  prune_all(&primary);
  let transport = transport_for(&primary, &config);
  let peer = PeerId::from(PRIMARY);

  let replica_path = dir.path().join("replica");
  let local_db = local_database(&replica_path);
  local_db.start().expect("start replica");

  let coordinator = coordinator(config, &local_db, transport.clone(), transport.clone());
  coordinator.on_timeout();
  assert_eq!(coordinator.state(), CoordinatorState::StoreCopying);

  let before = snapshot_dir(&replica_path);
  transport.fail_next_store_copy_after_chunks_for_testing(&peer, 2);
  coordinator.on_timeout();

  assert_eq!(coordinator.state(), CoordinatorState::StoreCopying);
  assert_eq!(snapshot_dir(&replica_path), before);
  assert!(staging_leftovers(dir.path()).is_empty());
  assert!(local_db.health().is_healthy());
  assert_eq!(coordinator.metrics().store_copies_failed, 1);
  assert_eq!(
    local_db.availability_guard().describe_who_is_blocking(),
    "database is stopped to copy store"
  );

  coordinator.on_timeout();
  assert_eq!(coordinator.state(), CoordinatorState::TxPulling);
  assert!(local_db.availability_guard().is_available());

  coordinator.on_timeout();
  assert!(matches!(
    coordinator.up_to_date_future().get(),
    Some(Ok(true))
  ));
  assert_eq!(local_db.read(|graph| graph.count_nodes()).expect("read"), 5);
}
