//! Progress reporting for sync runs.
//!
//! The engine emits a [`SyncProgress`] record at every meaningful
//! transition through a one-way channel. Observers subscribe without
//! influencing sync: emission never blocks, and a dropped receiver is
//! silently ignored.

use nostr::{EventId, Timestamp};
use tokio::sync::mpsc;

/// Phase of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No run active.
    Idle,
    /// Fetching the NIP-65 relay list document.
    FetchingRelays,
    /// A bounded batch fetch is in flight.
    FetchingBatch,
    /// An individual event is being reconciled.
    SyncingEvent,
    /// A batch finished; the cursor advanced.
    BatchComplete,
    /// The run failed; `error_details` and the cursor enable resume.
    Error,
    /// The run finished.
    Complete,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::FetchingRelays => "fetching-relays",
            Self::FetchingBatch => "fetching-batch",
            Self::SyncingEvent => "syncing-event",
            Self::BatchComplete => "batch-complete",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }
}

/// One progress record.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub message: String,
    /// Current upper timestamp bound for backward pagination.
    pub cursor_until: Timestamp,
    /// Lower cutoff of the run, if one was set.
    pub floor_until: Option<Timestamp>,
    /// Event being reconciled, for `SyncingEvent` and publish failures.
    pub current_event_id: Option<EventId>,
    /// Structured failure detail for the `Error` phase.
    pub error_details: Option<String>,
}

/// One-way sender side of the progress channel.
///
/// Cloneable and cheap; a disabled sender drops every record.
#[derive(Clone, Default)]
pub struct ProgressSender {
    tx: Option<mpsc::UnboundedSender<SyncProgress>>,
}

impl ProgressSender {
    /// Create a connected sender/receiver pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that discards every record.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit one record. Never blocks; a closed or absent receiver is fine.
    pub fn emit(&self, progress: SyncProgress) {
        tracing::debug!(
            phase = progress.phase.as_str(),
            cursor = progress.cursor_until.as_u64(),
            "{}",
            progress.message
        );
        if let Some(tx) = &self.tx {
            let _ = tx.send(progress);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(phase: SyncPhase) -> SyncProgress {
        SyncProgress {
            phase,
            message: "test".to_string(),
            cursor_until: Timestamp::from(1_700_000_000),
            floor_until: None,
            current_event_id: None,
            error_details: None,
        }
    }

    #[tokio::test]
    async fn test_emit_delivers_records_in_order() {
        let (sender, mut rx) = ProgressSender::channel();
        sender.emit(record(SyncPhase::FetchingBatch));
        sender.emit(record(SyncPhase::Complete));

        assert_eq!(rx.recv().await.unwrap().phase, SyncPhase::FetchingBatch);
        assert_eq!(rx.recv().await.unwrap().phase, SyncPhase::Complete);
    }

    #[test]
    fn test_emit_survives_dropped_receiver() {
        let (sender, rx) = ProgressSender::channel();
        drop(rx);
        sender.emit(record(SyncPhase::SyncingEvent));
    }

    #[test]
    fn test_disabled_sender_discards() {
        ProgressSender::disabled().emit(record(SyncPhase::Idle));
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(SyncPhase::FetchingBatch.as_str(), "fetching-batch");
        assert_eq!(SyncPhase::BatchComplete.as_str(), "batch-complete");
        assert_eq!(SyncPhase::Error.as_str(), "error");
    }
}
