//! Error types for the sync engine.
//!
//! The engine is strict-halt: the only locally recovered condition is a
//! publish rejection where every target reports a deletion. Everything else
//! aborts the run with the cursor preserved so a later run can resume.

use nostr::{EventId, RelayUrl};
use std::collections::BTreeMap;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can abort a sync run.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A relay refused the websocket handshake.
    #[error("Unable to connect {url}: {reason}")]
    ConnectFailed { url: RelayUrl, reason: String },

    /// The batch fetch hit its wall-clock deadline before aggregate EOSE.
    #[error("Batch fetch timed out")]
    FetchTimeout,

    /// A relay or transport closed the subscription without the caller
    /// asking for it. Keys are relay URLs.
    #[error("Subscription closed unexpectedly: {}", format_reasons(.reasons))]
    FetchClosedUnexpectedly { reasons: BTreeMap<String, String> },

    /// Too few relays acknowledged a publication. Keys are relay URLs.
    #[error("Publish rejected for event {event_id}: {}", format_reasons(.errors))]
    PublishRejected {
        event_id: EventId,
        errors: BTreeMap<String, String>,
    },

    /// A target relay was no longer connected at the pre-batch health check.
    #[error("Unable to connect {url}")]
    Disconnected { url: RelayUrl },

    /// The target set was empty.
    #[error("No relays")]
    NoRelays,

    /// The run was cancelled from outside.
    #[error("Cancelled")]
    Cancelled,

    /// Anything the taxonomy does not name.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl SyncError {
    /// True when every per-relay publish rejection reports a deletion,
    /// meaning the relay has processed a deletion request for the event.
    /// This is the one rejection the engine tolerates.
    pub fn is_all_deletion(&self) -> bool {
        match self {
            Self::PublishRejected { errors, .. } => {
                !errors.is_empty() && errors.values().all(|reason| reason.contains("deletion"))
            }
            _ => false,
        }
    }
}

fn format_reasons(reasons: &BTreeMap<String, String>) -> String {
    reasons
        .iter()
        .map(|(url, reason)| format!("{}: {}", url, reason))
        .collect::<Vec<_>>()
        .join("; ")
}
