//! Magic numbers, file names and defaults for KiteDB catch-up

// ============================================================================
// Magic bytes (little-endian u32)
// ============================================================================

/// Transaction log frame magic: "TXLG"
pub const MAGIC_TX_FRAME: u32 = 0x474C_5854;

// ============================================================================
// Current versions
// ============================================================================

pub const VERSION_TX_FRAME: u16 = 1;
pub const VERSION_STORE_META: u32 = 1;
pub const VERSION_STORE_FORMAT: u32 = 1;

// ============================================================================
// Store directory layout
// ============================================================================

pub const STORE_META_FILE: &str = "store-meta.json";
pub const SNAPSHOT_FILE: &str = "graph.snapshot";
pub const TX_LOG_FILE: &str = "tx.rlog";
pub const STORE_LOCK_FILE: &str = "store.lock";

/// Files a peer ships during a store copy. The transaction log is never
/// shipped as a file: transactions after the snapshot travel as messages.
pub const STORE_COPY_FILES: [&str; 2] = [STORE_META_FILE, SNAPSHOT_FILE];

/// Prefix of the staging directory created next to the store during a copy
pub const STAGING_DIR_PREFIX: &str = ".store-copy-";

// ============================================================================
// Limits
// ============================================================================

/// Largest payload a single transaction log frame may carry
pub const MAX_FRAME_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

// ============================================================================
// Catch-up defaults
// ============================================================================

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_TICK_JITTER_MS: u64 = 0;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_TRANSACTIONS_PER_BATCH: usize = 64;
pub const DEFAULT_FILE_CHUNK_BYTES: usize = 64 * 1024;
