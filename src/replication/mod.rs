//! Catch-up replication: keeps a local store synchronized with a peer by
//! pulling transactions, falling back to a full store copy when the needed
//! history has been pruned upstream.

pub mod applier;
pub mod availability;
pub mod client;
pub mod coordinator;
pub mod health;
pub mod local_database;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod store_copy;
pub mod transport;

pub use applier::{ApplierStats, BatchingTxApplier, QueueOutcome};
pub use availability::{AvailabilityGuard, AvailabilityRequirement};
pub use client::{CatchUpClient, CatchupTransport, Dispatch, ResponseDispatcher, ResponseStream};
pub use coordinator::{CatchupCoordinator, UpToDateFuture};
pub use health::DatabaseHealth;
pub use local_database::LocalDatabase;
pub use peer::{PeerSelector, StaticPeerSelector};
pub use protocol::{CatchupRequest, CatchupResponse, CoordinatorState, PeerId};
pub use server::CatchupServer;
pub use store_copy::{StoreCopyOutcome, StoreCopyProcess};
pub use transport::InProcessTransport;
