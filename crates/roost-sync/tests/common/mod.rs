//! Mock Nostr relay implementing enough NIP-01 for engine tests.
//!
//! Handles:
//! - `["REQ", sub_id, filter]` - serve stored events matching the filter
//!   (until/since/limit honored, newest first), then `["EOSE", sub_id]`
//! - `["EVENT", event]` - configurable: accept with OK, reject with a
//!   reason, or stay silent to provoke publish timeouts
//! - `["CLOSE", sub_id]` - accepted silently
//! - `["AUTH", event]` - recorded for assertions
//!
//! Behavior toggles let a test simulate misbehaving relays: closing
//! subscriptions with a reason, or never sending EOSE.

// Each integration test binary compiles its own copy of this module and
// uses a different subset of it.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use nostr::Event;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// How the relay answers an `EVENT` publication.
#[derive(Debug, Clone)]
pub enum PublishBehavior {
    /// Store the event and acknowledge with `["OK", id, true, ""]`.
    Accept,
    /// Refuse with `["OK", id, false, reason]`.
    Reject(String),
    /// Never acknowledge. The publisher's timeout fires.
    Silent,
}

/// How the relay answers a `REQ`.
#[derive(Debug, Clone)]
pub enum ReqBehavior {
    /// Serve matching stored events, then EOSE.
    Serve,
    /// Immediately close the subscription with `["CLOSED", sub, reason]`.
    CloseWith(String),
    /// Accept the subscription but never deliver anything, not even EOSE.
    Silent,
}

struct RelayState {
    /// Events the relay will serve, as raw JSON.
    stored: RwLock<Vec<Value>>,
    /// Ids of accepted publications, in order of receipt.
    accepted: RwLock<Vec<String>>,
    /// Every EVENT frame received, accepted or not.
    publish_attempts: AtomicUsize,
    /// Client AUTH responses received.
    auths: RwLock<Vec<Value>>,
    publish_behavior: RwLock<PublishBehavior>,
    req_behavior: RwLock<ReqBehavior>,
    /// Challenge sent to every new connection, when set.
    auth_challenge: RwLock<Option<String>>,
}

pub struct MockRelay {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
    state: Arc<RelayState>,
}

impl MockRelay {
    /// Start a new mock relay on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

        let state = Arc::new(RelayState {
            stored: RwLock::new(Vec::new()),
            accepted: RwLock::new(Vec::new()),
            publish_attempts: AtomicUsize::new(0),
            auths: RwLock::new(Vec::new()),
            publish_behavior: RwLock::new(PublishBehavior::Accept),
            req_behavior: RwLock::new(ReqBehavior::Serve),
            auth_challenge: RwLock::new(None),
        });

        let accept_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        if let Ok((stream, _)) = result {
                            tokio::spawn(handle_connection(stream, Arc::clone(&accept_state)));
                        }
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            handle,
            state,
        }
    }

    /// The relay URL (ws://127.0.0.1:port).
    pub fn url(&self) -> nostr::RelayUrl {
        nostr::RelayUrl::parse(&format!("ws://{}", self.addr)).unwrap()
    }

    /// Preload an event the relay will serve.
    pub fn seed(&self, event: &Event) {
        let value = serde_json::to_value(event).unwrap();
        self.state.stored.write().push(value);
    }

    pub fn set_publish_behavior(&self, behavior: PublishBehavior) {
        *self.state.publish_behavior.write() = behavior;
    }

    pub fn set_req_behavior(&self, behavior: ReqBehavior) {
        *self.state.req_behavior.write() = behavior;
    }

    /// Send this challenge to every new connection.
    pub fn set_auth_challenge(&self, challenge: &str) {
        *self.state.auth_challenge.write() = Some(challenge.to_string());
    }

    /// Ids of accepted publications, in order of receipt.
    pub fn accepted_ids(&self) -> Vec<String> {
        self.state.accepted.read().clone()
    }

    /// Every EVENT frame received, accepted or not.
    pub fn publish_attempts(&self) -> usize {
        self.state.publish_attempts.load(Ordering::SeqCst)
    }

    /// Client AUTH responses received.
    pub fn auth_events(&self) -> Vec<Value> {
        self.state.auths.read().clone()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, state: Arc<RelayState>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };

    let (mut write, mut read) = ws_stream.split();

    let challenge = state.auth_challenge.read().clone();
    if let Some(challenge) = challenge {
        let frame = json!(["AUTH", challenge]).to_string();
        let _ = write.send(Message::Text(frame.into())).await;
    }

    while let Some(result) = read.next().await {
        match result {
            Ok(Message::Text(text)) => {
                for response in process_message(text.as_str(), &state) {
                    let _ = write.send(Message::Text(response.into())).await;
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

fn process_message(message: &str, state: &RelayState) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<Value>(message) else {
        return Vec::new();
    };
    let Some(array) = value.as_array() else {
        return Vec::new();
    };
    let Some(msg_type) = array.first().and_then(|v| v.as_str()) else {
        return Vec::new();
    };

    match msg_type {
        "EVENT" => {
            let Some(event) = array.get(1) else {
                return Vec::new();
            };
            state.publish_attempts.fetch_add(1, Ordering::SeqCst);
            let event_id = event["id"].as_str().unwrap_or("unknown").to_string();

            match state.publish_behavior.read().clone() {
                PublishBehavior::Accept => {
                    state.accepted.write().push(event_id.clone());
                    state.stored.write().push(event.clone());
                    vec![json!(["OK", event_id, true, ""]).to_string()]
                }
                PublishBehavior::Reject(reason) => {
                    vec![json!(["OK", event_id, false, reason]).to_string()]
                }
                PublishBehavior::Silent => Vec::new(),
            }
        }
        "REQ" => {
            let Some(sub_id) = array.get(1).and_then(|v| v.as_str()) else {
                return Vec::new();
            };

            match state.req_behavior.read().clone() {
                ReqBehavior::Serve => {
                    let filter = array.get(2).cloned().unwrap_or_else(|| json!({}));
                    let mut matching: Vec<Value> = state
                        .stored
                        .read()
                        .iter()
                        .filter(|event| matches_filter(event, &filter))
                        .cloned()
                        .collect();

                    // Newest first, like a real relay's stored-events reply
                    matching.sort_by_key(|e| std::cmp::Reverse(e["created_at"].as_u64()));

                    if let Some(limit) = filter["limit"].as_u64() {
                        matching.truncate(limit as usize);
                    }

                    let mut responses: Vec<String> = matching
                        .into_iter()
                        .map(|event| json!(["EVENT", sub_id, event]).to_string())
                        .collect();
                    responses.push(json!(["EOSE", sub_id]).to_string());
                    responses
                }
                ReqBehavior::CloseWith(reason) => {
                    vec![json!(["CLOSED", sub_id, reason]).to_string()]
                }
                ReqBehavior::Silent => Vec::new(),
            }
        }
        "CLOSE" => Vec::new(),
        "AUTH" => {
            if let Some(event) = array.get(1) {
                state.auths.write().push(event.clone());
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn matches_filter(event: &Value, filter: &Value) -> bool {
    let created_at = event["created_at"].as_u64().unwrap_or(0);

    if let Some(until) = filter["until"].as_u64()
        && created_at > until
    {
        return false;
    }

    if let Some(since) = filter["since"].as_u64()
        && created_at < since
    {
        return false;
    }

    if let Some(authors) = filter["authors"].as_array() {
        let pubkey = event["pubkey"].as_str().unwrap_or("");
        if !authors.iter().any(|a| a.as_str() == Some(pubkey)) {
            return false;
        }
    }

    if let Some(kinds) = filter["kinds"].as_array() {
        let kind = event["kind"].as_u64().unwrap_or(u64::MAX);
        if !kinds.iter().any(|k| k.as_u64() == Some(kind)) {
            return false;
        }
    }

    true
}
