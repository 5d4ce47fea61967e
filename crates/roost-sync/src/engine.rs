//! The backward-paginating sync state machine.
//!
//! A run walks from `initial_until` toward older times in bounded batches.
//! For every event in a batch it computes the set of target relays with no
//! recorded sighting of that event and republishes to exactly those,
//! requiring every one of them to acknowledge. Processing is strictly
//! newest-first, one event at a time, with pacing sleeps between events and
//! between batches.
//!
//! The engine is strict-halt: any failure aborts the run with the cursor
//! preserved, so a later run can resume from where this one stopped. The
//! single tolerated condition is a publish rejection where every target
//! reports a deletion: the relay has processed a deletion request for that
//! id, and pushing the event back would fight the user.

use crate::error::{Result, SyncError};
use crate::fetch::fetch_batch;
use crate::pool::RelayPool;
use crate::progress::{ProgressSender, SyncPhase, SyncProgress};
use crate::{BATCH_SIZE, BATCH_TIMEOUT, INTER_BATCH_DELAY, INTER_EVENT_DELAY, PUBLISH_TIMEOUT};
use metrics::{counter, gauge, histogram};
use nostr::{Event, EventId, Filter, RelayUrl, Timestamp};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Engine knobs, defaulting to the crate's policy constants.
///
/// Tests compress the pacing delays; production uses the defaults.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub publish_timeout: Duration,
    pub inter_event_delay: Duration,
    pub inter_batch_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            batch_timeout: BATCH_TIMEOUT,
            publish_timeout: PUBLISH_TIMEOUT,
            inter_event_delay: INTER_EVENT_DELAY,
            inter_batch_delay: INTER_BATCH_DELAY,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy)]
pub struct SyncReport {
    /// Events that reached full target-set coverage during this run.
    pub total_synced: usize,
    /// The cursor at completion.
    pub final_cursor: Timestamp,
}

/// The sync engine. One logical task; all parallelism lives in the pool.
pub struct SyncEngine {
    pool: Arc<RelayPool>,
    options: SyncOptions,
    running: AtomicBool,
}

impl SyncEngine {
    pub fn new(pool: Arc<RelayPool>) -> Self {
        Self::with_options(pool, SyncOptions::default())
    }

    pub fn with_options(pool: Arc<RelayPool>, options: SyncOptions) -> Self {
        Self {
            pool,
            options,
            running: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    /// Cancel the active run. The engine notices at its next suspension
    /// point, closes what it opened, and fails with `Cancelled`, cursor
    /// preserved.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run one sync over `targets` with the given filter.
    ///
    /// `initial_until` is the newest timestamp considered; `stop_at` is an
    /// optional inclusive floor at which the run ends early. Progress is
    /// emitted on every transition; on failure, the final `Error` record
    /// carries the cursor to resume from.
    pub async fn sync(
        &self,
        targets: &[RelayUrl],
        filter: &Filter,
        initial_until: Timestamp,
        stop_at: Option<Timestamp>,
        progress: &ProgressSender,
    ) -> Result<SyncReport> {
        self.running.store(true, Ordering::SeqCst);
        counter!("sync_runs_total").increment(1);
        gauge!("sync_in_progress").set(1.0);

        let mut cursor = initial_until;
        let mut total_synced = 0usize;

        let result = self
            .run_loop(targets, filter, stop_at, &mut cursor, &mut total_synced, progress)
            .await;

        gauge!("sync_in_progress").set(0.0);

        match result {
            Ok(()) => {
                tracing::info!(
                    "Sync complete: {} events at full coverage, cursor {}",
                    total_synced,
                    cursor
                );
                Ok(SyncReport {
                    total_synced,
                    final_cursor: cursor,
                })
            }
            Err(e) => {
                counter!("sync_failures_total").increment(1);
                let current_event_id = match &e {
                    SyncError::PublishRejected { event_id, .. } => Some(*event_id),
                    _ => None,
                };
                progress.emit(SyncProgress {
                    phase: SyncPhase::Error,
                    message: format!("Sync failed, resume from {}: {}", cursor, e),
                    cursor_until: cursor,
                    floor_until: stop_at,
                    current_event_id,
                    error_details: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    async fn run_loop(
        &self,
        targets: &[RelayUrl],
        filter: &Filter,
        stop_at: Option<Timestamp>,
        cursor: &mut Timestamp,
        total_synced: &mut usize,
        progress: &ProgressSender,
    ) -> Result<()> {
        if targets.is_empty() {
            return Err(SyncError::NoRelays);
        }

        if let Some(stop) = stop_at
            && stop > *cursor
        {
            progress.emit(record(
                SyncPhase::Complete,
                "Nothing to fetch: stop-at is newer than the starting cursor".to_string(),
                *cursor,
                stop_at,
                None,
            ));
            return Ok(());
        }

        loop {
            self.check_cancelled(*cursor)?;

            progress.emit(record(
                SyncPhase::FetchingBatch,
                format!(
                    "Fetching up to {} events until {}",
                    self.options.batch_size, cursor
                ),
                *cursor,
                stop_at,
                None,
            ));

            let batch_filter = filter.clone().until(*cursor);
            let started = Instant::now();
            let batch = fetch_batch(
                &self.pool,
                targets,
                batch_filter,
                self.options.batch_size,
                self.options.batch_timeout,
            )
            .await?;
            histogram!("sync_batch_duration_seconds").record(started.elapsed().as_secs_f64());
            counter!("sync_batches_total").increment(1);

            // Every target must still be up before acting on the batch.
            if let Some(url) = self.pool.disconnected_targets(targets).into_iter().next() {
                return Err(SyncError::Disconnected { url });
            }

            if batch.is_empty() {
                let message = if stop_at.is_some() {
                    "Reached the end of the requested range".to_string()
                } else {
                    "Reached the end of history".to_string()
                };
                progress.emit(record(SyncPhase::Complete, message, *cursor, stop_at, None));
                return Ok(());
            }

            // Relays honor `limit` differently; the union can exceed the
            // batch size. Keep the newest slice; the next cursor is derived
            // from its oldest entry, so nothing newer than that is skipped.
            let slice = plan_slice(batch, self.options.batch_size);
            let oldest = slice
                .last()
                .expect("slice of a non-empty batch")
                .created_at;

            for event in &slice {
                if !self.running.load(Ordering::SeqCst) {
                    *cursor = event.created_at;
                    return Err(SyncError::Cancelled);
                }

                if let Some(stop) = stop_at
                    && event.created_at < stop
                {
                    tracing::debug!(
                        "Event {} is older than the stop-at floor, ending batch",
                        event.id
                    );
                    break;
                }

                progress.emit(record(
                    SyncPhase::SyncingEvent,
                    format!("Syncing event {}", event.id),
                    *cursor,
                    stop_at,
                    Some(event.id),
                ));

                let sightings = self.pool.sighting_lookup(&event.id);
                let missing: Vec<RelayUrl> = targets
                    .iter()
                    .filter(|url| !sightings.contains(*url))
                    .cloned()
                    .collect();

                if missing.is_empty() {
                    *total_synced += 1;
                    counter!("sync_events_covered_total").increment(1);
                    continue;
                }

                tracing::debug!(
                    "Event {} missing from {} of {} targets",
                    event.id,
                    missing.len(),
                    targets.len()
                );

                match self
                    .pool
                    .publish(&missing, event, self.options.publish_timeout, missing.len())
                    .await
                {
                    Ok(()) => {
                        *total_synced += 1;
                        counter!("sync_events_published_total").increment(1);
                    }
                    Err(e) if e.is_all_deletion() => {
                        tracing::info!(
                            "Skipping event {}: every target reports a deletion",
                            event.id
                        );
                        counter!("sync_deletion_skips_total").increment(1);
                    }
                    Err(e) => {
                        // Resume from the failing event, not the batch top.
                        *cursor = event.created_at;
                        return Err(e);
                    }
                }

                if let Err(e) = self.pace(self.options.inter_event_delay).await {
                    *cursor = event.created_at;
                    return Err(e);
                }
            }

            *cursor = Timestamp::from(oldest.as_u64().saturating_sub(1));
            gauge!("sync_cursor_unix").set(cursor.as_u64() as f64);

            if let Some(stop) = stop_at
                && oldest <= stop
            {
                progress.emit(record(
                    SyncPhase::Complete,
                    "Reached the stop-at floor".to_string(),
                    *cursor,
                    stop_at,
                    None,
                ));
                return Ok(());
            }

            progress.emit(record(
                SyncPhase::BatchComplete,
                format!("Batch complete, cursor now {}", cursor),
                *cursor,
                stop_at,
                None,
            ));

            self.pace(self.options.inter_batch_delay).await?;
        }
    }

    fn check_cancelled(&self, cursor: Timestamp) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            tracing::info!("Sync cancelled, cursor preserved at {}", cursor);
            Err(SyncError::Cancelled)
        }
    }

    /// Pacing sleep that observes cancellation in one-second slices.
    async fn pace(&self, delay: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled);
            }
            let elapsed = start.elapsed();
            if elapsed >= delay {
                return Ok(());
            }
            let remaining = delay - elapsed;
            tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
        }
    }
}

/// Sort newest-first and keep the first `batch_size` events.
///
/// The sort is stable, so events sharing a `created_at` keep their arrival
/// order and the boundary choice is deterministic.
fn plan_slice(mut events: Vec<Event>, batch_size: usize) -> Vec<Event> {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    events.truncate(batch_size);
    events
}

fn record(
    phase: SyncPhase,
    message: String,
    cursor: Timestamp,
    floor: Option<Timestamp>,
    current_event_id: Option<EventId>,
) -> SyncProgress {
    SyncProgress {
        phase,
        message,
        cursor_until: cursor,
        floor_until: floor,
        current_event_id,
        error_details: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportConfig;
    use nostr::{EventBuilder, Keys, Kind};

    fn event_at(keys: &Keys, created_at: u64, content: &str) -> Event {
        EventBuilder::new(Kind::TextNote, content)
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(keys)
            .expect("Failed to sign event")
    }

    // =========================================================================
    // plan_slice
    // =========================================================================

    #[test]
    fn test_plan_slice_sorts_newest_first() {
        let keys = Keys::generate();
        let events = vec![
            event_at(&keys, 100, "a"),
            event_at(&keys, 300, "b"),
            event_at(&keys, 200, "c"),
        ];

        let slice = plan_slice(events, 20);
        let times: Vec<u64> = slice.iter().map(|e| e.created_at.as_u64()).collect();
        assert_eq!(times, vec![300, 200, 100]);
    }

    #[test]
    fn test_plan_slice_truncates_to_batch_size() {
        let keys = Keys::generate();
        let events = (0..30)
            .map(|i| event_at(&keys, 1000 + i, "x"))
            .collect::<Vec<_>>();

        let slice = plan_slice(events, 20);
        assert_eq!(slice.len(), 20);
        // Oldest kept entry is 1010: nothing newer than the next cursor
        // (1009) was dropped.
        assert_eq!(slice.last().unwrap().created_at.as_u64(), 1010);
    }

    #[test]
    fn test_plan_slice_tie_break_is_stable() {
        let keys = Keys::generate();
        let events = vec![
            event_at(&keys, 100, "first"),
            event_at(&keys, 100, "second"),
            event_at(&keys, 100, "third"),
        ];

        let slice = plan_slice(events, 2);
        assert_eq!(slice[0].content, "first");
        assert_eq!(slice[1].content, "second");
    }

    #[test]
    fn test_plan_slice_tolerates_events_newer_than_cursor() {
        // A misbehaving relay returning events above `until` must not panic
        // or change the slicing rule.
        let keys = Keys::generate();
        let events = vec![event_at(&keys, 5000, "future"), event_at(&keys, 100, "past")];

        let slice = plan_slice(events, 20);
        assert_eq!(slice[0].created_at.as_u64(), 5000);
        assert_eq!(slice.last().unwrap().created_at.as_u64(), 100);
    }

    // =========================================================================
    // Options and boundary behavior
    // =========================================================================

    #[test]
    fn test_options_default_to_policy_constants() {
        let options = SyncOptions::default();
        assert_eq!(options.batch_size, BATCH_SIZE);
        assert_eq!(options.batch_timeout, BATCH_TIMEOUT);
        assert_eq!(options.publish_timeout, PUBLISH_TIMEOUT);
        assert_eq!(options.inter_event_delay, INTER_EVENT_DELAY);
        assert_eq!(options.inter_batch_delay, INTER_BATCH_DELAY);
    }

    #[tokio::test]
    async fn test_empty_target_set_is_an_error() {
        let pool = Arc::new(RelayPool::new(TransportConfig::default()));
        let engine = SyncEngine::new(pool);
        let filter = Filter::new();

        let result = engine
            .sync(
                &[],
                &filter,
                Timestamp::from(1000),
                None,
                &ProgressSender::disabled(),
            )
            .await;

        assert!(matches!(result, Err(SyncError::NoRelays)));
    }

    #[tokio::test]
    async fn test_stop_at_newer_than_cursor_completes_without_fetching() {
        // No transports exist, so any fetch attempt would fail loudly;
        // completing proves the engine never fetched.
        let pool = Arc::new(RelayPool::new(TransportConfig::default()));
        let engine = SyncEngine::new(pool);
        let filter = Filter::new();
        let (progress, mut rx) = ProgressSender::channel();

        let url = RelayUrl::parse("wss://relay.example.com").unwrap();
        let report = engine
            .sync(
                &[url],
                &filter,
                Timestamp::from(1000),
                Some(Timestamp::from(2000)),
                &progress,
            )
            .await
            .unwrap();

        assert_eq!(report.total_synced, 0);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.phase, SyncPhase::Complete);
    }
}
