//! One bounded fetch across a relay set.
//!
//! A single call opens a pool subscription, accumulates deliveries until
//! every target reports EOSE, and returns the collected list (possibly
//! empty). The deadline is split: the subscription gets the wall-clock
//! budget minus a fixed slack so a timed-out subscription can still be
//! closed cooperatively within the budget.
//!
//! The fetcher never consults the sighting index: the engine needs every
//! sighting, and the pool records one for every delivery from every relay.

use crate::error::{Result, SyncError};
use crate::pool::{PoolNotification, RelayPool, SubscribeOptions};
use nostr::{Event, Filter, RelayUrl};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Slack reserved for cooperatively closing a subscription that ran out of
/// time.
const CLOSE_SLACK: Duration = Duration::from_secs(3);

/// Run one bounded fetch.
///
/// `filter` should carry the engine's `until` bound; the per-batch `limit`
/// is applied here. Fails with [`SyncError::FetchTimeout`] when the deadline
/// fires before aggregate EOSE, and with
/// [`SyncError::FetchClosedUnexpectedly`] when a relay or transport closes
/// the subscription without being asked.
pub async fn fetch_batch(
    pool: &RelayPool,
    urls: &[RelayUrl],
    filter: Filter,
    limit: usize,
    wall_timeout: Duration,
) -> Result<Vec<Event>> {
    let filter = filter.limit(limit);

    // Leave closing slack when the budget allows it; degenerate budgets
    // (shorter than the slack itself) are spent entirely on the subscription.
    let sub_timeout = if wall_timeout > CLOSE_SLACK {
        wall_timeout - CLOSE_SLACK
    } else {
        wall_timeout
    };

    let mut sub = pool
        .subscribe(urls, &filter, SubscribeOptions::default())
        .await?;
    let deadline = Instant::now() + sub_timeout;

    let mut events: Vec<Event> = Vec::new();

    loop {
        match tokio::time::timeout_at(deadline, sub.recv()).await {
            Err(_) => {
                tracing::debug!(
                    "Batch fetch timed out with {} events collected",
                    events.len()
                );
                sub.close().await;
                return Err(SyncError::FetchTimeout);
            }
            Ok(None) => {
                sub.close().await;
                return Err(SyncError::Unexpected(
                    "subscription stream ended without EOSE".to_string(),
                ));
            }
            Ok(Some(PoolNotification::Event { event, .. })) => {
                events.push(*event);
            }
            Ok(Some(PoolNotification::Eose)) => {
                sub.close().await;
                tracing::debug!("Batch fetch complete: {} events", events.len());
                return Ok(events);
            }
            Ok(Some(PoolNotification::Closed { relay_url, reason })) => {
                sub.close().await;
                return Err(SyncError::FetchClosedUnexpectedly {
                    reasons: BTreeMap::from([(relay_url.to_string(), reason)]),
                });
            }
            Ok(Some(PoolNotification::TransportClosed { relay_url, reason })) => {
                sub.close().await;
                return Err(SyncError::FetchClosedUnexpectedly {
                    reasons: BTreeMap::from([(relay_url.to_string(), reason)]),
                });
            }
        }
    }
}
