//! Messaging Fan-out: the WebSocket thread server (§4.7).
//!
//! Each accepted socket runs two concurrent tasks sharing one outbound sink: a Receiver
//! that validates and republishes inbound frames through the [`crate::broadcaster`], and a
//! Sender that applies the per-recipient visibility rule to everything the thread's
//! channel publishes. Either task finishing tears down the other.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::auth;
use crate::broadcaster::{Broadcaster, BroadcastMessage};
use crate::identity::{IdentityCache, UserIdentity, UserStore};

const POLICY_VIOLATION: u16 = 1003;

fn policy_violation_frame(reason: &'static str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: POLICY_VIOLATION,
        reason: Cow::Borrowed(reason),
    }))
}

fn thread_channel(thread_id: &str) -> String {
    format!("thread:{thread_id}")
}

/// Checked before a socket is registered under a thread id (§4.7 item 2).
#[async_trait]
pub trait ThreadAccess: Send + Sync {
    async fn check_access(&self, thread_id: &str, user: &UserIdentity) -> bool;
}

/// Tracks which sockets are currently registered under which thread, for introspection
/// (e.g. active-connection counts); delivery itself flows through the Broadcaster, not
/// this registry.
#[derive(Default)]
pub struct SocketRegistry {
    sockets_by_thread: DashMap<String, DashMap<String, ()>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, thread_id: &str, socket_id: &str) {
        self.sockets_by_thread
            .entry(thread_id.to_string())
            .or_default()
            .insert(socket_id.to_string(), ());
    }

    pub fn deregister(&self, thread_id: &str, socket_id: &str) {
        if let Some(sockets) = self.sockets_by_thread.get(thread_id) {
            sockets.remove(socket_id);
        }
    }

    pub fn connection_count(&self, thread_id: &str) -> usize {
        self.sockets_by_thread.get(thread_id).map(|s| s.len()).unwrap_or(0)
    }
}

/// An event en route through the Broadcaster: a JSON `body` plus the three visibility
/// fields stripped before the Sender forwards the payload to a socket (§4.6, §4.7).
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub body: Value,
    pub from_user: Option<String>,
    pub include_self: bool,
    pub self_only: Option<String>,
}

impl Envelope {
    /// Serializes into a [`BroadcastMessage`] with the three spec-named visibility keys
    /// (`from_user`, `include_self`, `self_only`) embedded directly, so any subscriber can
    /// pop them back off via [`Envelope::from_wire`] (§4.6).
    fn to_wire(&self) -> BroadcastMessage {
        let mut wire = self.body.clone();
        if let Value::Object(map) = &mut wire {
            map.insert("from_user".to_string(), json_opt_string(&self.from_user));
            map.insert("include_self".to_string(), Value::Bool(self.include_self));
            map.insert("self_only".to_string(), json_opt_string(&self.self_only));
        }
        BroadcastMessage { payload: wire.to_string() }
    }

    fn from_wire(message: &BroadcastMessage) -> Option<Envelope> {
        let mut value: Value = serde_json::from_str(&message.payload).ok()?;
        let (from_user, include_self, self_only) = if let Value::Object(map) = &mut value {
            let from_user = map.remove("from_user").and_then(|v| v.as_str().map(str::to_string));
            let include_self = map.remove("include_self").and_then(|v| v.as_bool()).unwrap_or(false);
            let self_only = map.remove("self_only").and_then(|v| v.as_str().map(str::to_string));
            (from_user, include_self, self_only)
        } else {
            (None, false, None)
        };
        Some(Envelope { body: value, from_user, include_self, self_only })
    }
}

fn json_opt_string(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

/// Applies §4.7's Sender visibility rule: deliver when `self_only` names this recipient,
/// or when `include_self` is set and the recipient is the sender, or when the recipient
/// is not the sender and the message isn't restricted to anyone in particular.
fn visible_to(envelope: &Envelope, recipient_id: &str) -> bool {
    if envelope.self_only.as_deref() == Some(recipient_id) {
        return true;
    }
    if envelope.include_self && envelope.from_user.as_deref() == Some(recipient_id) {
        return true;
    }
    envelope.from_user.as_deref() != Some(recipient_id) && envelope.self_only.is_none()
}

pub struct MessagingState {
    pub identity_cache: IdentityCache,
    pub user_store: Arc<dyn UserStore>,
    pub jwt_secret: String,
    pub anonymous_domain: String,
    pub broadcaster: Arc<Broadcaster>,
    pub thread_access: Arc<dyn ThreadAccess>,
    pub registry: Arc<SocketRegistry>,
}

/// Axum handler: upgrades the connection, then runs the full accept/auth/thread-access/
/// fan-out lifecycle inside the upgraded socket.
pub async fn thread_socket_handler(
    Path(thread_id): Path<String>,
    headers: HeaderMap,
    Query(query_params): Query<HashMap<String, String>>,
    State(state): State<Arc<MessagingState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ws.on_upgrade(move |socket| handle_socket(socket, state, thread_id, auth_header, query_params))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<MessagingState>,
    thread_id: String,
    auth_header: Option<String>,
    query_params: HashMap<String, String>,
) {
    let (sink, stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));

    let identity = match auth::validate(
        auth_header.as_deref(),
        &query_params,
        &state.jwt_secret,
        &state.identity_cache,
        state.user_store.as_ref(),
        &state.anonymous_domain,
    )
    .await
    {
        Ok(identity) => identity,
        Err(_) => {
            let error_frame =
                serde_json::json!({"event": "error", "message": "Invalid Token / User"}).to_string();
            let mut guard = sink.lock().await;
            let _ = guard.send(WsMessage::Text(error_frame)).await;
            let _ = guard.send(policy_violation_frame("authentication failed")).await;
            return;
        }
    };

    if !state.thread_access.check_access(&thread_id, &identity).await {
        let error_frame =
            serde_json::json!({"event": "error", "message": "thread access denied"}).to_string();
        let mut guard = sink.lock().await;
        let _ = guard.send(WsMessage::Text(error_frame)).await;
        let _ = guard.send(policy_violation_frame("thread access denied")).await;
        return;
    }

    let socket_id = format!("{:x}", md5_like_id(&thread_id, &identity.id));
    state.registry.register(&thread_id, &socket_id);

    let subscription = match state.broadcaster.subscribe(&thread_channel(&thread_id)).await {
        Ok(sub) => sub,
        Err(_) => {
            state.registry.deregister(&thread_id, &socket_id);
            return;
        }
    };

    tokio::select! {
        _ = receiver_task(stream, state.clone(), thread_id.clone(), identity.clone(), sink.clone()) => {}
        _ = sender_task(sink.clone(), subscription, identity.id.clone()) => {}
    }

    state.registry.deregister(&thread_id, &socket_id);
}

/// Deterministic per-connection id; not cryptographic, only used to key the registry.
fn md5_like_id(thread_id: &str, user_id: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    thread_id.hash(&mut hasher);
    user_id.hash(&mut hasher);
    std::time::Instant::now().elapsed().as_nanos().hash(&mut hasher);
    hasher.finish()
}

async fn receiver_task(
    mut stream: SplitStream<WebSocket>,
    state: Arc<MessagingState>,
    thread_id: String,
    identity: UserIdentity,
    sink: Arc<Mutex<SplitSink<WebSocket, WsMessage>>>,
) {
    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let mut value: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => {
                let err =
                    serde_json::json!({"event": "error", "message": "Invalid JSON format"}).to_string();
                let mut guard = sink.lock().await;
                let _ = guard.send(WsMessage::Text(err)).await;
                let _ = guard.send(policy_violation_frame("malformed frame")).await;
                break;
            }
        };

        let kind = value.get("event").and_then(Value::as_str).unwrap_or("").to_string();

        if kind == "ping" {
            let pong = serde_json::json!({"event": "pong"}).to_string();
            if sink.lock().await.send(WsMessage::Text(pong)).await.is_err() {
                break;
            }
            continue;
        }

        if kind == "block" {
            if let Value::Object(map) = &mut value {
                map.insert("source".to_string(), Value::String(identity.id.clone()));
            }
        }

        let envelope = Envelope {
            body: value,
            from_user: Some(identity.id.clone()),
            include_self: true,
            self_only: None,
        };

        if state.broadcaster.publish(&thread_channel(&thread_id), &envelope.to_wire()).await.is_err() {
            break;
        }
    }
}

async fn sender_task(
    sink: Arc<Mutex<SplitSink<WebSocket, WsMessage>>>,
    mut subscription: crate::broadcaster::Subscription,
    recipient_id: String,
) {
    loop {
        let Some(message) = subscription.next().await else {
            break;
        };
        let Some(envelope) = Envelope::from_wire(&message) else {
            continue;
        };
        if !visible_to(&envelope, &recipient_id) {
            continue;
        }
        let payload = envelope.body.to_string();
        if sink.lock().await.send(WsMessage::Text(payload)).await.is_err() {
            break;
        }
    }
    subscription.unsubscribe().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(from_user: Option<&str>, include_self: bool, self_only: Option<&str>) -> Envelope {
        Envelope {
            body: serde_json::json!({"type": "message", "text": "hi"}),
            from_user: from_user.map(str::to_string),
            include_self,
            self_only: self_only.map(str::to_string),
        }
    }

    #[test]
    fn sender_sees_own_message_only_when_include_self() {
        let env = envelope(Some("u1"), true, None);
        assert!(visible_to(&env, "u1"));
    }

    #[test]
    fn sender_does_not_see_own_message_without_include_self() {
        let env = envelope(Some("u1"), false, None);
        assert!(!visible_to(&env, "u1"));
    }

    #[test]
    fn other_recipients_see_broadcast_messages() {
        let env = envelope(Some("u1"), false, None);
        assert!(visible_to(&env, "u2"));
    }

    #[test]
    fn self_only_restricts_delivery_to_the_named_recipient() {
        let env = envelope(Some("u1"), false, Some("u2"));
        assert!(visible_to(&env, "u2"));
        assert!(!visible_to(&env, "u3"));
        assert!(!visible_to(&env, "u1"));
    }

    #[test]
    fn wire_round_trip_preserves_visibility_fields() {
        let env = envelope(Some("u1"), true, Some("u2"));
        let wire = env.to_wire();
        let decoded = Envelope::from_wire(&wire).unwrap();
        assert_eq!(decoded.from_user.as_deref(), Some("u1"));
        assert!(decoded.include_self);
        assert_eq!(decoded.self_only.as_deref(), Some("u2"));
        assert_eq!(decoded.body["type"], "message");
    }

    #[test]
    fn socket_registry_tracks_connection_counts() {
        let registry = SocketRegistry::new();
        registry.register("thread-1", "sock-a");
        registry.register("thread-1", "sock-b");
        assert_eq!(registry.connection_count("thread-1"), 2);
        registry.deregister("thread-1", "sock-a");
        assert_eq!(registry.connection_count("thread-1"), 1);
    }
}
