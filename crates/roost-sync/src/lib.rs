//! NIP-65 event synchronization engine.
//!
//! Given a pubkey and a set of target relays drawn from the user's NIP-65
//! relay list, this crate walks the user's history backward in bounded
//! batches and republishes each event to exactly the target relays that
//! have not yet been seen with it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   SyncEngine    │  backward-paginating state machine, pacing, resume
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  BatchFetcher   │  one bounded fetch: collect until EOSE or timeout
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    RelayPool    │  transport set + sighting index (event id → relays)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ RelayTransport  │  one websocket per relay, NIP-01 framing
//! └─────────────────┘
//! ```
//!
//! The engine runs as one logical task; parallelism exists only inside the
//! pool (one reader task per relay transport). The sighting index is the
//! only shared mutable state and is append-only per event, so a stale read
//! at worst causes a redundant publish that the relay simply acks again.

pub mod engine;
pub mod error;
pub mod fetch;
pub mod filters;
pub mod pool;
pub mod progress;
pub mod transport;

pub use engine::{SyncEngine, SyncOptions, SyncReport};
pub use error::{Result, SyncError};
pub use fetch::fetch_batch;
pub use filters::{read_filter, write_filter};
pub use pool::{BatchSubscription, PoolNotification, RelayPool, SubscribeOptions};
pub use progress::{ProgressSender, SyncPhase, SyncProgress};
pub use transport::{PublishOutcome, RelayTransport, SubscriptionMessage, TransportConfig};

use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// Policy constants
// ═══════════════════════════════════════════════════════════════════════════

/// Maximum events processed per backward-pagination batch.
pub const BATCH_SIZE: usize = 20;

/// Wall-clock budget for one batch fetch across the target set.
pub const BATCH_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Per-event publish acknowledgment budget.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Pause between publishing consecutive events. Relay anti-spam policies
/// reject tighter pacing, and a rejection halts the engine.
pub const INTER_EVENT_DELAY: Duration = Duration::from_millis(10_000);

/// Pause between consecutive batches.
pub const INTER_BATCH_DELAY: Duration = Duration::from_millis(10_000);

/// Advisory cap on write relays, enforced by the orchestration layer.
pub const MAX_WRITE_RELAYS: usize = 5;

/// Advisory cap on read relays, enforced by the orchestration layer.
pub const MAX_READ_RELAYS: usize = 5;
