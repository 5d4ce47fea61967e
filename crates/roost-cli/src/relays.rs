//! NIP-65 relay list retrieval.
//!
//! The engine consumes only the parsed relay descriptors; locating the
//! newest kind:10002 document for the user is glue, done here with the same
//! pool and fetcher machinery the engine uses.

use anyhow::{Context, Result, bail};
use nostr::{Filter, Kind, PublicKey, RelayUrl, Timestamp};
use roost_core::{RelayDescriptor, parse_relay_list};
use roost_sync::progress::{ProgressSender, SyncPhase, SyncProgress};
use roost_sync::{BATCH_TIMEOUT, RelayPool, fetch_batch};

/// Fetch and parse the user's newest relay list document.
///
/// Bootstrap relays are dialed individually; any subset reaching the
/// document is enough. Different relays may hold different revisions of a
/// replaceable event, so the newest `created_at` wins.
pub async fn fetch_relay_list(
    pool: &RelayPool,
    bootstrap: &[RelayUrl],
    pubkey: PublicKey,
    progress: &ProgressSender,
) -> Result<Vec<RelayDescriptor>> {
    if bootstrap.is_empty() {
        bail!("no bootstrap relays configured");
    }

    for url in bootstrap {
        if let Err(e) = pool.connect(std::slice::from_ref(url)).await {
            tracing::warn!("Skipping bootstrap relay {}: {}", url, e);
        }
    }

    let reachable: Vec<RelayUrl> = bootstrap
        .iter()
        .filter(|url| pool.is_connected(url))
        .cloned()
        .collect();
    if reachable.is_empty() {
        bail!("no bootstrap relay is reachable");
    }

    progress.emit(SyncProgress {
        phase: SyncPhase::FetchingRelays,
        message: format!("Fetching relay list from {} bootstrap relays", reachable.len()),
        cursor_until: Timestamp::now(),
        floor_until: None,
        current_event_id: None,
        error_details: None,
    });

    let filter = Filter::new().author(pubkey).kind(Kind::RelayList);
    let documents = fetch_batch(pool, &reachable, filter, 1, BATCH_TIMEOUT)
        .await
        .context("failed to fetch the relay list document")?;

    let newest = documents
        .into_iter()
        .max_by_key(|event| event.created_at)
        .context("no relay list (kind 10002) found for this pubkey")?;

    tracing::info!(
        "Found relay list published at {} with {} tags",
        newest.created_at,
        newest.tags.len()
    );

    let descriptors = parse_relay_list(&newest);
    if descriptors.is_empty() {
        bail!("the relay list contains no usable relay URLs");
    }

    Ok(descriptors)
}

/// Apply the advisory relay cap for one role.
pub fn cap_targets(mut urls: Vec<RelayUrl>, cap: usize, label: &str) -> Vec<RelayUrl> {
    if urls.len() > cap {
        tracing::warn!(
            "Declared {} {} relays, limiting to the first {}",
            urls.len(),
            label,
            cap
        );
        urls.truncate(cap);
    }
    urls
}
