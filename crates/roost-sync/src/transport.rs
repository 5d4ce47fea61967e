//! Single relay connection management.
//!
//! One websocket per relay URL, speaking the standard NIP-01 framing:
//! `REQ`/`CLOSE` out, `EVENT`/`EOSE`/`CLOSED`/`OK`/`NOTICE`/`AUTH` in,
//! `EVENT` out for publications. A background reader task owns the receive
//! half and routes messages: subscription traffic to per-subscription
//! channels, publish acknowledgments to pending oneshot slots correlated by
//! event id, AUTH challenges to the configured policy and signer.
//!
//! A close initiated through [`RelayTransport::close`] is expected; any
//! other close reason is surfaced to the subscriber as
//! [`SubscriptionMessage::ClosedByRelay`] or
//! [`SubscriptionMessage::TransportClosed`].

use crate::error::{Result, SyncError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use nostr::{Event, EventBuilder, EventId, Filter, RelayUrl};
use parking_lot::Mutex;
use roost_core::signer::{AuthPolicy, SignerDelegate, auth_never};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// What a subscription consumer receives.
#[derive(Debug)]
pub enum SubscriptionMessage {
    /// The relay delivered an event for this subscription.
    Event(Box<Event>),
    /// The relay finished delivering stored events.
    Eose,
    /// The relay closed the subscription unilaterally.
    ClosedByRelay(String),
    /// The underlying connection went away.
    TransportClosed(String),
}

/// Outcome of a single publication to a single relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    Rejected(String),
    Timeout,
}

/// Transport configuration.
#[derive(Clone)]
pub struct TransportConfig {
    /// Websocket handshake budget.
    pub connect_timeout: Duration,
    /// Consulted when a relay issues a NIP-42 challenge.
    pub auth_policy: AuthPolicy,
    /// Signs auth events when the policy approves a challenge.
    pub signer: Option<Arc<dyn SignerDelegate>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            auth_policy: auth_never(),
            signer: None,
        }
    }
}

/// A relay message parsed from the wire.
#[derive(Debug)]
enum RelayIncoming {
    /// `["EVENT", sub_id, event]`
    Event { sub_id: String, event: Box<Event> },
    /// `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", sub_id]`
    Eose { sub_id: String },
    /// `["CLOSED", sub_id, message]`
    Closed { sub_id: String, message: String },
    /// `["NOTICE", message]`
    Notice(String),
    /// `["AUTH", challenge]`
    Auth { challenge: String },
}

/// State shared between the caller-facing handle and the reader task.
struct Shared {
    url: RelayUrl,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    connected: Arc<AtomicBool>,
    /// Open subscriptions by id.
    subs: Mutex<HashMap<String, mpsc::UnboundedSender<SubscriptionMessage>>>,
    /// Publications awaiting their OK, correlated by event id.
    pending_oks: Mutex<HashMap<EventId, oneshot::Sender<(bool, String)>>>,
    /// Subscription ids we closed ourselves; a CLOSED for these is expected.
    locally_closed: Mutex<HashSet<String>>,
    auth_policy: AuthPolicy,
    signer: Option<Arc<dyn SignerDelegate>>,
}

/// One logical connection to a relay.
pub struct RelayTransport {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl RelayTransport {
    /// Open a connection to the relay.
    ///
    /// Fails with [`SyncError::ConnectFailed`] on refusal, TLS failure, or
    /// handshake timeout.
    pub async fn connect(url: RelayUrl, config: TransportConfig) -> Result<Self> {
        tracing::debug!("Connecting to relay {}", url);

        let ws = match timeout(config.connect_timeout, connect_async(url.to_string())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                counter!("relay_connect_failures_total").increment(1);
                return Err(SyncError::ConnectFailed {
                    url,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                counter!("relay_connect_failures_total").increment(1);
                return Err(SyncError::ConnectFailed {
                    reason: format!("handshake timeout after {:?}", config.connect_timeout),
                    url,
                });
            }
        };

        counter!("relay_connects_total").increment(1);
        tracing::debug!("Connected to relay {}", url);

        let (sink, stream) = ws.split();

        let shared = Arc::new(Shared {
            url,
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            connected: Arc::new(AtomicBool::new(true)),
            subs: Mutex::new(HashMap::new()),
            pending_oks: Mutex::new(HashMap::new()),
            locally_closed: Mutex::new(HashSet::new()),
            auth_policy: config.auth_policy,
            signer: config.signer,
        });

        let reader = tokio::spawn(reader_loop(Arc::clone(&shared), stream));

        Ok(Self { shared, reader })
    }

    /// The relay URL this transport is bound to.
    pub fn url(&self) -> &RelayUrl {
        &self.shared.url
    }

    /// Whether the underlying connection is still up.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Open a subscription. The returned channel yields deliveries until
    /// EOSE and beyond, ending with a close notification if the relay or
    /// the connection terminates it.
    pub async fn subscribe(
        &self,
        sub_id: &str,
        filter: &Filter,
    ) -> Result<mpsc::UnboundedReceiver<SubscriptionMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subs.lock().insert(sub_id.to_string(), tx);

        let msg = json!(["REQ", sub_id, filter]);
        if let Err(e) = send_json(&self.shared.sink, &msg).await {
            self.shared.subs.lock().remove(sub_id);
            return Err(SyncError::Unexpected(format!(
                "failed to send REQ to {}: {}",
                self.shared.url, e
            )));
        }

        Ok(rx)
    }

    /// Cooperatively close a subscription. Best effort: a transport that is
    /// already gone has nothing left to close.
    pub async fn close(&self, sub_id: &str) {
        self.shared.locally_closed.lock().insert(sub_id.to_string());
        self.shared.subs.lock().remove(sub_id);

        let msg = json!(["CLOSE", sub_id]);
        if let Err(e) = send_json(&self.shared.sink, &msg).await {
            tracing::debug!("Failed to send CLOSE to {}: {}", self.shared.url, e);
        }
    }

    /// Publish an event and await the relay's acknowledgment for it.
    pub async fn publish(&self, event: &Event, ack_timeout: Duration) -> PublishOutcome {
        let (tx, rx) = oneshot::channel();
        self.shared.pending_oks.lock().insert(event.id, tx);

        let msg = json!(["EVENT", event]);
        if let Err(e) = send_json(&self.shared.sink, &msg).await {
            self.shared.pending_oks.lock().remove(&event.id);
            return PublishOutcome::Rejected(format!("send failed: {}", e));
        }

        match timeout(ack_timeout, rx).await {
            Ok(Ok((true, _message))) => {
                counter!("relay_publish_acks_total").increment(1);
                PublishOutcome::Accepted
            }
            Ok(Ok((false, message))) => {
                counter!("relay_publish_rejects_total").increment(1);
                PublishOutcome::Rejected(message)
            }
            // Reader dropped the pending slot: connection went away.
            Ok(Err(_)) => {
                PublishOutcome::Rejected("connection closed before acknowledgment".to_string())
            }
            Err(_) => {
                self.shared.pending_oks.lock().remove(&event.id);
                PublishOutcome::Timeout
            }
        }
    }

    /// Close the connection.
    pub async fn disconnect(&self) {
        if !self.shared.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Disconnecting from relay {}", self.shared.url);
        let mut sink = self.shared.sink.lock().await;
        let _ = sink.close().await;
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Send a JSON frame over the shared sink.
async fn send_json(
    sink: &Arc<tokio::sync::Mutex<WsSink>>,
    value: &Value,
) -> std::result::Result<(), String> {
    let text = value.to_string();
    let mut sink = sink.lock().await;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| e.to_string())
}

/// Receive loop: runs until the connection drops, then fans the close
/// reason out to every open subscription and pending publication.
async fn reader_loop(shared: Arc<Shared>, mut stream: WsStream) {
    let close_reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Some(incoming) = parse_relay_message(text.as_str()) {
                    handle_incoming(&shared, incoming).await;
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let mut sink = shared.sink.lock().await;
                let _ = sink.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "connection closed by relay".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "connection closed".to_string(),
        }
    };

    tracing::debug!("Relay {} reader finished: {}", shared.url, close_reason);
    shared.connected.store(false, Ordering::SeqCst);

    let senders: Vec<_> = shared.subs.lock().drain().collect();
    for (_, tx) in senders {
        let _ = tx.send(SubscriptionMessage::TransportClosed(close_reason.clone()));
    }

    // Dropping the slots wakes waiting publishers with a closed channel.
    shared.pending_oks.lock().clear();
}

/// Route one parsed relay message.
async fn handle_incoming(shared: &Arc<Shared>, incoming: RelayIncoming) {
    match incoming {
        RelayIncoming::Event { sub_id, event } => {
            counter!("relay_events_received_total").increment(1);
            let subs = shared.subs.lock();
            if let Some(tx) = subs.get(&sub_id) {
                let _ = tx.send(SubscriptionMessage::Event(event));
            } else {
                tracing::debug!(
                    "Relay {} delivered event for unknown subscription {}",
                    shared.url,
                    sub_id
                );
            }
        }
        RelayIncoming::Eose { sub_id } => {
            let subs = shared.subs.lock();
            if let Some(tx) = subs.get(&sub_id) {
                let _ = tx.send(SubscriptionMessage::Eose);
            }
        }
        RelayIncoming::Closed { sub_id, message } => {
            let was_local = shared.locally_closed.lock().remove(&sub_id);
            let tx = shared.subs.lock().remove(&sub_id);
            if was_local {
                tracing::debug!("Relay {} confirmed close of {}", shared.url, sub_id);
            } else if let Some(tx) = tx {
                let _ = tx.send(SubscriptionMessage::ClosedByRelay(message));
            }
        }
        RelayIncoming::Ok {
            event_id,
            accepted,
            message,
        } => {
            let slot = EventId::from_hex(&event_id)
                .ok()
                .and_then(|id| shared.pending_oks.lock().remove(&id));
            match slot {
                Some(tx) => {
                    let _ = tx.send((accepted, message));
                }
                None => {
                    tracing::debug!(
                        "Relay {} acknowledged unknown event {}: accepted={}",
                        shared.url,
                        event_id,
                        accepted
                    );
                }
            }
        }
        RelayIncoming::Notice(message) => {
            tracing::debug!("Relay {} notice: {}", shared.url, message);
        }
        RelayIncoming::Auth { challenge } => {
            answer_challenge(shared, &challenge).await;
        }
    }
}

/// Respond to a NIP-42 challenge if the policy approves and a signer is
/// available. Failure to authenticate never aborts anything by itself;
/// whatever the relay does next surfaces through the normal paths.
async fn answer_challenge(shared: &Arc<Shared>, challenge: &str) {
    counter!("relay_auth_challenges_total").increment(1);

    if !(shared.auth_policy)(&shared.url, challenge) {
        tracing::debug!("Declining auth challenge from {}", shared.url);
        return;
    }

    let Some(signer) = &shared.signer else {
        tracing::warn!(
            "Relay {} requested auth but no signer is configured",
            shared.url
        );
        return;
    };

    let unsigned =
        EventBuilder::auth(challenge, shared.url.clone()).build(signer.public_key());

    match signer.sign(unsigned) {
        Ok(event) => {
            let msg = json!(["AUTH", event]);
            if let Err(e) = send_json(&shared.sink, &msg).await {
                tracing::warn!("Failed to send AUTH to {}: {}", shared.url, e);
            } else {
                tracing::debug!("Answered auth challenge from {}", shared.url);
            }
        }
        Err(e) => {
            tracing::warn!("Failed to sign auth event for {}: {}", shared.url, e);
        }
    }
}

/// Parse one relay frame. Unknown or malformed frames yield `None`.
fn parse_relay_message(text: &str) -> Option<RelayIncoming> {
    let value: Value = serde_json::from_str(text).ok()?;
    let arr = value.as_array()?;
    let msg_type = arr.first()?.as_str()?;

    match msg_type {
        "EVENT" => {
            if arr.len() < 3 {
                return None;
            }
            let sub_id = arr[1].as_str()?.to_string();
            let event: Event = match serde_json::from_value(arr[2].clone()) {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!("Dropping undecodable event: {}", e);
                    return None;
                }
            };
            Some(RelayIncoming::Event {
                sub_id,
                event: Box::new(event),
            })
        }
        "OK" => {
            if arr.len() < 4 {
                return None;
            }
            Some(RelayIncoming::Ok {
                event_id: arr[1].as_str()?.to_string(),
                accepted: arr[2].as_bool()?,
                message: arr[3].as_str().unwrap_or("").to_string(),
            })
        }
        "EOSE" => Some(RelayIncoming::Eose {
            sub_id: arr.get(1)?.as_str()?.to_string(),
        }),
        "CLOSED" => Some(RelayIncoming::Closed {
            sub_id: arr.get(1)?.as_str()?.to_string(),
            message: arr
                .get(2)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        }),
        "NOTICE" => Some(RelayIncoming::Notice(
            arr.get(1)?.as_str().unwrap_or("").to_string(),
        )),
        "AUTH" => Some(RelayIncoming::Auth {
            challenge: arr.get(1)?.as_str()?.to_string(),
        }),
        other => {
            tracing::debug!("Unknown message type from relay: {}", other);
            None
        }
    }
}
