//! Relay pool: a set of transports addressed as one logical relay.
//!
//! The pool owns one [`RelayTransport`] per normalized URL and two kinds of
//! set operations: a multiplexed subscription that merges per-relay streams
//! into one (with an aggregate EOSE once every target has finished), and a
//! concurrent publish that succeeds when enough relays acknowledge.
//!
//! It also maintains the **sighting index**: `event id → set of relay URLs`
//! known to have that event, fed by subscription deliveries and publish
//! acknowledgments. The index only ever grows within a run; consumers read
//! snapshots. A stale snapshot at worst causes a redundant publish, which
//! the relay acks like any other.

use crate::error::{Result, SyncError};
use crate::transport::{PublishOutcome, RelayTransport, SubscriptionMessage, TransportConfig};
use nostr::{Event, EventId, Filter, RelayUrl};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type SightingIndex = Arc<Mutex<HashMap<EventId, HashSet<RelayUrl>>>>;

/// Options for a pool subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Hard deadline after which [`BatchSubscription::recv`] returns `None`.
    pub max_wait: Option<Duration>,
    /// Small delay before issuing the REQs, coalescing near-simultaneous
    /// subscribe calls.
    pub group_delay: Option<Duration>,
}

/// What a pool subscription consumer receives.
#[derive(Debug)]
pub enum PoolNotification {
    /// A deduplicated event. Every delivery still records a sighting; the
    /// same id arriving from a second relay is not surfaced again.
    Event {
        relay_url: RelayUrl,
        event: Box<Event>,
    },
    /// Every target has either sent EOSE or closed.
    Eose,
    /// A relay closed the subscription without being asked.
    Closed { relay_url: RelayUrl, reason: String },
    /// A relay's connection went away mid-subscription.
    TransportClosed { relay_url: RelayUrl, reason: String },
}

/// Owns the transports and the sighting index.
pub struct RelayPool {
    transports: RwLock<HashMap<RelayUrl, Arc<RelayTransport>>>,
    sightings: SightingIndex,
    transport_config: TransportConfig,
    sub_counter: AtomicU64,
}

impl RelayPool {
    pub fn new(transport_config: TransportConfig) -> Self {
        Self {
            transports: RwLock::new(HashMap::new()),
            sightings: Arc::new(Mutex::new(HashMap::new())),
            transport_config,
            sub_counter: AtomicU64::new(0),
        }
    }

    /// Dial every URL not already connected. Strict: the first failure
    /// aborts with `ConnectFailed`.
    pub async fn connect(&self, urls: &[RelayUrl]) -> Result<()> {
        for url in urls {
            if self.transports.read().contains_key(url) {
                continue;
            }
            let transport =
                RelayTransport::connect(url.clone(), self.transport_config.clone()).await?;
            self.transports
                .write()
                .insert(url.clone(), Arc::new(transport));
        }
        Ok(())
    }

    /// Whether a transport for this URL exists and its connection is up.
    pub fn is_connected(&self, url: &RelayUrl) -> bool {
        self.transports
            .read()
            .get(url)
            .is_some_and(|t| t.is_connected())
    }

    /// Targets whose transport is missing or down.
    pub fn disconnected_targets(&self, urls: &[RelayUrl]) -> Vec<RelayUrl> {
        urls.iter()
            .filter(|url| !self.is_connected(url))
            .cloned()
            .collect()
    }

    /// Open the same subscription on every target and merge the streams.
    pub async fn subscribe(
        &self,
        urls: &[RelayUrl],
        filter: &Filter,
        options: SubscribeOptions,
    ) -> Result<BatchSubscription> {
        if urls.is_empty() {
            return Err(SyncError::NoRelays);
        }

        if let Some(delay) = options.group_delay {
            tokio::time::sleep(delay).await;
        }

        let sub_id = format!("roost-{}", self.sub_counter.fetch_add(1, Ordering::Relaxed));
        let (merged_tx, merged_rx) = mpsc::unbounded_channel();

        let mut participants: Vec<Arc<RelayTransport>> = Vec::with_capacity(urls.len());
        let mut forwarders: Vec<JoinHandle<()>> = Vec::with_capacity(urls.len());

        for url in urls {
            let transport = self.transports.read().get(url).cloned();
            let transport = match transport {
                Some(t) => t,
                None => {
                    close_partial(&participants, &sub_id).await;
                    return Err(SyncError::Disconnected { url: url.clone() });
                }
            };

            let rx = match transport.subscribe(&sub_id, filter).await {
                Ok(rx) => rx,
                Err(e) => {
                    close_partial(&participants, &sub_id).await;
                    return Err(e);
                }
            };

            let tx = merged_tx.clone();
            let relay_url = url.clone();
            forwarders.push(tokio::spawn(async move {
                let mut rx = rx;
                while let Some(msg) = rx.recv().await {
                    if tx.send((relay_url.clone(), msg)).is_err() {
                        break;
                    }
                }
            }));
            participants.push(transport);
        }

        tracing::debug!(
            "Opened subscription {} across {} relays",
            sub_id,
            participants.len()
        );

        Ok(BatchSubscription {
            id: sub_id,
            rx: merged_rx,
            pending_eose: urls.iter().cloned().collect(),
            eose_emitted: false,
            seen: HashSet::new(),
            sightings: Arc::clone(&self.sightings),
            participants,
            forwarders,
            deadline: options.max_wait.map(|d| tokio::time::Instant::now() + d),
        })
    }

    /// Publish an event concurrently to every target.
    ///
    /// Resolves `Ok` once `min_success` relays acknowledge; otherwise yields
    /// [`SyncError::PublishRejected`] enumerating per-relay reasons. Every
    /// acknowledgment records a sighting before this returns.
    pub async fn publish(
        &self,
        urls: &[RelayUrl],
        event: &Event,
        ack_timeout: Duration,
        min_success: usize,
    ) -> Result<()> {
        let mut publishes = Vec::with_capacity(urls.len());
        for url in urls {
            let transport = self.transports.read().get(url).cloned();
            let relay_url = url.clone();
            publishes.push(async move {
                let outcome = match transport {
                    Some(t) => t.publish(event, ack_timeout).await,
                    None => PublishOutcome::Rejected("not connected".to_string()),
                };
                (relay_url, outcome)
            });
        }

        let mut acks = 0usize;
        let mut errors: BTreeMap<String, String> = BTreeMap::new();

        for (url, outcome) in futures_util::future::join_all(publishes).await {
            match outcome {
                PublishOutcome::Accepted => {
                    self.record_sighting(event.id, url);
                    acks += 1;
                }
                PublishOutcome::Rejected(reason) => {
                    errors.insert(url.to_string(), reason);
                }
                PublishOutcome::Timeout => {
                    errors.insert(url.to_string(), "timeout".to_string());
                }
            }
        }

        if acks >= min_success {
            if !errors.is_empty() {
                tracing::debug!(
                    "Publish of {} reached quorum with {} stragglers",
                    event.id,
                    errors.len()
                );
            }
            Ok(())
        } else {
            Err(SyncError::PublishRejected {
                event_id: event.id,
                errors,
            })
        }
    }

    /// Snapshot of the relays known to have this event.
    pub fn sighting_lookup(&self, event_id: &EventId) -> HashSet<RelayUrl> {
        self.sightings
            .lock()
            .get(event_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of distinct event ids in the sighting index.
    pub fn sighting_count(&self) -> usize {
        self.sightings.lock().len()
    }

    /// Drain and terminate every transport.
    pub async fn close_all(&self) {
        let transports: Vec<_> = self
            .transports
            .write()
            .drain()
            .map(|(_, t)| t)
            .collect();
        for transport in transports {
            transport.disconnect().await;
        }
    }

    fn record_sighting(&self, event_id: EventId, url: RelayUrl) {
        self.sightings.lock().entry(event_id).or_default().insert(url);
    }
}

async fn close_partial(participants: &[Arc<RelayTransport>], sub_id: &str) {
    for transport in participants {
        transport.close(sub_id).await;
    }
}

/// Handle for one multiplexed subscription.
pub struct BatchSubscription {
    id: String,
    rx: mpsc::UnboundedReceiver<(RelayUrl, SubscriptionMessage)>,
    /// Targets that have not yet sent EOSE or closed.
    pending_eose: HashSet<RelayUrl>,
    eose_emitted: bool,
    /// Event ids already surfaced to the consumer.
    seen: HashSet<EventId>,
    sightings: SightingIndex,
    participants: Vec<Arc<RelayTransport>>,
    forwarders: Vec<JoinHandle<()>>,
    deadline: Option<tokio::time::Instant>,
}

impl BatchSubscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next notification. Returns `None` when `max_wait` expires or every
    /// stream has ended.
    pub async fn recv(&mut self) -> Option<PoolNotification> {
        loop {
            if !self.eose_emitted && self.pending_eose.is_empty() {
                self.eose_emitted = true;
                return Some(PoolNotification::Eose);
            }

            let next = match self.deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                        Ok(msg) => msg,
                        Err(_) => return None,
                    }
                }
                None => self.rx.recv().await,
            };

            let (relay_url, msg) = next?;

            match msg {
                SubscriptionMessage::Event(event) => {
                    self.sightings
                        .lock()
                        .entry(event.id)
                        .or_default()
                        .insert(relay_url.clone());
                    if self.seen.insert(event.id) {
                        return Some(PoolNotification::Event { relay_url, event });
                    }
                }
                SubscriptionMessage::Eose => {
                    self.pending_eose.remove(&relay_url);
                }
                SubscriptionMessage::ClosedByRelay(reason) => {
                    self.pending_eose.remove(&relay_url);
                    return Some(PoolNotification::Closed { relay_url, reason });
                }
                SubscriptionMessage::TransportClosed(reason) => {
                    self.pending_eose.remove(&relay_url);
                    return Some(PoolNotification::TransportClosed { relay_url, reason });
                }
            }
        }
    }

    /// Cooperatively close the subscription on every participant.
    pub async fn close(self) {
        for transport in &self.participants {
            transport.close(&self.id).await;
        }
    }
}

impl Drop for BatchSubscription {
    fn drop(&mut self) {
        for handle in &self.forwarders {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind};

    fn test_pool() -> RelayPool {
        RelayPool::new(TransportConfig::default())
    }

    fn test_event() -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::TextNote, "test")
            .sign_with_keys(&keys)
            .unwrap()
    }

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    #[test]
    fn test_sighting_index_grows_monotonically() {
        let pool = test_pool();
        let event = test_event();
        let a = url("wss://a.example.com");
        let b = url("wss://b.example.com");

        assert!(pool.sighting_lookup(&event.id).is_empty());

        pool.record_sighting(event.id, a.clone());
        assert_eq!(pool.sighting_lookup(&event.id), HashSet::from([a.clone()]));

        // Re-recording the same relay is a no-op; a second relay adds
        pool.record_sighting(event.id, a.clone());
        pool.record_sighting(event.id, b.clone());
        assert_eq!(pool.sighting_lookup(&event.id), HashSet::from([a, b]));
        assert_eq!(pool.sighting_count(), 1);
    }

    #[test]
    fn test_sighting_lookup_is_a_snapshot() {
        let pool = test_pool();
        let event = test_event();
        let a = url("wss://a.example.com");

        pool.record_sighting(event.id, a.clone());
        let snapshot = pool.sighting_lookup(&event.id);

        pool.record_sighting(event.id, url("wss://b.example.com"));
        assert_eq!(snapshot, HashSet::from([a]));
        assert_eq!(pool.sighting_lookup(&event.id).len(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_empty_targets_errors() {
        let pool = test_pool();
        let filter = Filter::new();
        match pool.subscribe(&[], &filter, SubscribeOptions::default()).await {
            Err(SyncError::NoRelays) => {}
            other => panic!("Expected NoRelays, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_subscribe_unknown_relay_errors() {
        let pool = test_pool();
        let filter = Filter::new();
        let target = url("wss://never-connected.example.com");
        match pool
            .subscribe(&[target.clone()], &filter, SubscribeOptions::default())
            .await
        {
            Err(SyncError::Disconnected { url }) => assert_eq!(url, target),
            other => panic!("Expected Disconnected, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_publish_without_transport_collects_reasons() {
        let pool = test_pool();
        let event = test_event();
        let a = url("wss://a.example.com");

        let result = pool
            .publish(&[a.clone()], &event, Duration::from_millis(100), 1)
            .await;

        match result {
            Err(SyncError::PublishRejected { event_id, errors }) => {
                assert_eq!(event_id, event.id);
                assert_eq!(errors.len(), 1);
                assert!(errors.values().next().unwrap().contains("not connected"));
            }
            other => panic!("Expected PublishRejected, got {:?}", other),
        }
        assert!(pool.sighting_lookup(&event.id).is_empty());
    }

    #[test]
    fn test_disconnected_targets_without_transports() {
        let pool = test_pool();
        let a = url("wss://a.example.com");
        let b = url("wss://b.example.com");
        assert_eq!(
            pool.disconnected_targets(&[a.clone(), b.clone()]),
            vec![a, b]
        );
    }
}
