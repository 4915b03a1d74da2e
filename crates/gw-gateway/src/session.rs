//! The per-connection runtime, per §4.H.
//!
//! `session_state::SessionState` holds the pure transition table; this
//! module is the concurrent machine that drives it: one reader task
//! (this function, run on the task the listener spawned) and one
//! writer task, talking over the outbound buffer and a small close
//! signal. Grounded in the teacher's two-task-per-connection shape
//! from `sr-api`'s request/response handlers, generalized from
//! request/response to a long-lived duplex socket.

use crate::outbound::{EnqueueOutcome, OutboundBuffer};
use crate::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use gw_domain::device_context::DeviceContext;
use gw_domain::errors::{AuthorizationError, OperationError};
use gw_domain::session_state::CloseReason;
use gw_domain::wire::{MessageType, WireMessage};
use gw_domain::rate_limit::RateLimiter;
use gw_ports::{
    AuthzOp, ConnectionRegistry, DeliverCallback, DeviceSummary, MetricsSink, NatsAdapter,
    TokenValidator, WireDirection,
};
use serde_json::json;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tracing::{info, instrument, warn};

/// Per-`clientId` eviction channel. A second successful auth for the
/// same device fires the signal held by the first session; an admin
/// eviction fires it directly. Lives alongside, not inside, the
/// `ConnectionRegistry` port: the registry tracks device summaries for
/// `/devices`, this tracks live session teardown, which is a
/// gateway-runtime concern rather than a port contract.
#[derive(Clone)]
pub struct EvictionSignal {
    notify: Arc<Notify>,
    reason: Arc<Mutex<CloseReason>>,
}

impl EvictionSignal {
    fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            reason: Arc::new(Mutex::new(CloseReason::Superseded)),
        }
    }

    async fn fire(&self, reason: CloseReason) {
        *self.reason.lock().await = reason;
        self.notify.notify_one();
    }

    async fn wait(&self) -> CloseReason {
        self.notify.notified().await;
        self.reason.lock().await.clone()
    }
}

#[derive(Default, Clone)]
pub struct SupersedeDirectory {
    inner: Arc<RwLock<HashMap<String, EvictionSignal>>>,
}

impl SupersedeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client_id`'s new session, evicting whatever session
    /// was previously registered for the same id.
    pub async fn register(&self, client_id: &str) -> EvictionSignal {
        let signal = EvictionSignal::new();
        let mut map = self.inner.write().await;
        if let Some(previous) = map.insert(client_id.to_string(), signal.clone()) {
            previous.fire(CloseReason::Superseded).await;
        }
        signal
    }

    /// Clears the directory entry for `client_id`, but only if it
    /// still points at `expected` — an already-superseded session must
    /// not clobber its successor's entry during its own teardown.
    pub async fn remove(&self, client_id: &str, expected: &EvictionSignal) {
        let mut map = self.inner.write().await;
        if let Some(current) = map.get(client_id) {
            if Arc::ptr_eq(&current.notify, &expected.notify) {
                map.remove(client_id);
            }
        }
    }

    /// Fires the live session's eviction signal for `client_id`, used
    /// by the admin disconnect endpoint. Returns `false` if no session
    /// is registered for that id.
    pub async fn evict(&self, client_id: &str, reason: CloseReason) -> bool {
        let map = self.inner.read().await;
        match map.get(client_id) {
            Some(signal) => {
                signal.fire(reason).await;
                true
            }
            None => false,
        }
    }
}

struct SessionRuntime {
    client_id: String,
    ctx: DeviceContext,
    rate_limiter: RateLimiter,
    subs: HashMap<String, gw_ports::SubscriptionHandle>,
    outbound: OutboundBuffer,
    last_inbound_at: Instant,
    ping_pending: bool,
}

/// Drives one accepted WebSocket connection from upgrade to close.
/// `pre_auth` carries a `DeviceContext` already validated from the
/// `Authorization` header by the listener; when absent, the session
/// waits for an `Auth` frame instead.
#[instrument(skip(socket, state, pre_auth))]
pub async fn run_session(socket: WebSocket, pre_auth: Option<DeviceContext>, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    state.metrics.connection_opened();

    let ctx = match authenticate(&mut receiver, &state, pre_auth).await {
        Ok(ctx) => ctx,
        Err(reason) => {
            state.metrics.auth_attempt(false);
            send_auth_response(&mut sender, &state, false, None, None, Some(reason_message(&reason)))
                .await;
            close_socket(&mut sender, &reason).await;
            state.metrics.connection_closed(reason_label(&reason));
            return;
        }
    };
    state.metrics.auth_attempt(true);
    info!(client_id = %ctx.client_id, "device authenticated");

    let client_id = ctx.client_id.clone();
    let signal = state.supersede.register(&client_id).await;
    let (_, registration_token) = state
        .registry
        .register(DeviceSummary {
            client_id: client_id.clone(),
            role: ctx.role.0.clone(),
            connected_at: Utc::now(),
        })
        .await;

    send_auth_response(
        &mut sender,
        &state,
        true,
        Some(client_id.clone()),
        Some(ctx.role.0.clone()),
        None,
    )
    .await;

    let (outbound, outbound_rx) = OutboundBuffer::bounded(state.config.outgoing_buffer_size);
    let (close_tx, close_rx) = oneshot::channel::<CloseReason>();

    let writer = tokio::spawn(run_writer(sender, outbound_rx, close_rx, state.codec.clone()));

    let mut runtime = SessionRuntime {
        client_id: client_id.clone(),
        ctx,
        rate_limiter: RateLimiter::new(state.config.message_rate_limit_per_second),
        subs: HashMap::new(),
        outbound: outbound.clone(),
        last_inbound_at: Instant::now(),
        ping_pending: false,
    };

    let close_reason = run_reader(&mut receiver, &mut runtime, &state, &signal).await;
    info!(client_id = %client_id, reason = %reason_label(&close_reason), "session closing");

    for (_, handle) in runtime.subs.drain() {
        let _ = state.nats.unsubscribe(&handle).await;
    }
    outbound.close();
    let _ = close_tx.send(close_reason.clone());
    let _ = writer.await;

    state.registry.remove(&client_id, &registration_token).await;
    state.supersede.remove(&client_id, &signal).await;
    state.metrics.connection_closed(reason_label(&close_reason));
}

async fn authenticate(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    pre_auth: Option<DeviceContext>,
) -> Result<DeviceContext, CloseReason> {
    if let Some(ctx) = pre_auth {
        return Ok(ctx);
    }

    let frame = match tokio::time::timeout(state.config.authentication_timeout, receiver.next())
        .await
    {
        Err(_) => return Err(CloseReason::AuthTimeout),
        Ok(None) => return Err(CloseReason::AuthTimeout),
        Ok(Some(Err(_))) => return Err(CloseReason::AuthTimeout),
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(_))) => return Err(CloseReason::MalformedAuthFrame),
    };

    let decoded = state
        .codec
        .decode(&frame)
        .map_err(|_| CloseReason::MalformedAuthFrame)?;
    if decoded.message_type != MessageType::Auth {
        return Err(CloseReason::MalformedAuthFrame);
    }

    let token = decoded
        .payload
        .as_ref()
        .and_then(|p| p.get("token"))
        .and_then(|v| v.as_str())
        .ok_or(CloseReason::MalformedAuthFrame)?;

    state
        .token_validator
        .validate(token)
        .await
        .map_err(|e| CloseReason::AuthValidatorFailed(e.to_string()))
}

async fn run_reader(
    receiver: &mut SplitStream<WebSocket>,
    rt: &mut SessionRuntime,
    state: &AppState,
    signal: &EvictionSignal,
) -> CloseReason {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            biased;

            reason = signal.wait() => return reason,

            _ = ticker.tick() => {
                let elapsed = rt.last_inbound_at.elapsed();
                if elapsed >= state.config.ping_interval + state.config.ping_timeout {
                    return CloseReason::HeartbeatTimeout;
                } else if elapsed >= state.config.ping_interval && !rt.ping_pending {
                    rt.outbound.enqueue(WireMessage::new(MessageType::Ping));
                    rt.ping_pending = true;
                }
            }

            maybe_msg = receiver.next() => {
                match maybe_msg {
                    None => return CloseReason::PeerClosed,
                    Some(Err(_)) => return CloseReason::WriteError,
                    Some(Ok(Message::Close(_))) => return CloseReason::PeerClosed,
                    Some(Ok(Message::Text(text))) => {
                        rt.last_inbound_at = Instant::now();
                        rt.ping_pending = false;
                        if let Some(reason) = handle_text_frame(&text, rt, state).await {
                            return reason;
                        }
                    }
                    Some(Ok(_)) => {
                        rt.last_inbound_at = Instant::now();
                    }
                }
            }
        }
    }
}

async fn handle_text_frame(
    text: &str,
    rt: &mut SessionRuntime,
    state: &AppState,
) -> Option<CloseReason> {
    let decoded = match state.codec.decode(text) {
        Ok(m) => m,
        Err(e) => {
            state.metrics.error(e.kind());
            enqueue_error(rt, state, e.to_string());
            return None;
        }
    };
    state
        .metrics
        .message(WireDirection::Received, message_type_label(decoded.message_type));

    let clock_skew = chrono::Duration::from_std(state.config.jwt.clock_skew).unwrap_or_default();
    if rt.ctx.is_expired(Utc::now(), clock_skew) {
        enqueue_error(rt, state, "token expired");
        return Some(CloseReason::TokenExpired);
    }

    if !rt.rate_limiter.try_acquire(&rt.client_id) {
        state.metrics.rate_limit_rejection();
        let err = OperationError::RateLimited;
        state.metrics.error(err.kind());
        enqueue_error(rt, state, err.to_string());
        return None;
    }

    match decoded.message_type {
        MessageType::Publish => handle_publish(decoded, rt, state).await,
        MessageType::Subscribe => handle_subscribe(decoded, rt, state).await,
        MessageType::Unsubscribe => handle_unsubscribe(decoded, rt, state).await,
        MessageType::Ping => {
            handle_ping(decoded, rt);
            None
        }
        MessageType::Pong => None,
        _ => {
            enqueue_error(rt, state, "unsupported message type from device");
            None
        }
    }
}

async fn handle_publish(message: WireMessage, rt: &mut SessionRuntime, state: &AppState) -> Option<CloseReason> {
    let subject = message.subject.clone().unwrap_or_default();

    if gw_domain::subject::validate_subject(&subject).is_err() {
        state.metrics.error(gw_domain::errors::ErrorKind::Protocol);
        enqueue_error(rt, state, "Invalid subject format");
        return None;
    }

    let allowed = rt
        .ctx
        .pub_patterns
        .iter()
        .any(|pattern| gw_domain::subject::matches(pattern, &subject));
    state.metrics.authorization_check(AuthzOp::Publish, allowed);
    if !allowed {
        let err = AuthorizationError::PublishDenied { subject: subject.clone() };
        state.metrics.error(err.kind());
        enqueue_error(rt, state, err.to_string());
        return None;
    }

    let stamped = state.codec.stamp_outbound(message, &rt.client_id);
    let correlation_id = stamped.correlation_id.clone();
    let encoded = match state.codec.encode(stamped) {
        Ok(text) => text,
        Err(e) => {
            enqueue_error(rt, state, e.to_string());
            return None;
        }
    };

    let started = Instant::now();
    match state.nats.publish(&subject, encoded.as_bytes()).await {
        Ok(_ack) => {
            state.metrics.publish_result(true);
            state.metrics.nats_latency("publish", started.elapsed());
        }
        Err(e) => {
            state.metrics.publish_result(false);
            let mut error = WireMessage::error(format!("publish failed: {e}"));
            if let Some(id) = correlation_id {
                error = error.with_correlation_id(id);
            }
            enqueue(rt, state, error);
        }
    }
    None
}

async fn handle_subscribe(message: WireMessage, rt: &mut SessionRuntime, state: &AppState) -> Option<CloseReason> {
    let pattern = message.subject.clone().unwrap_or_default();

    if gw_domain::subject::validate_subject(&pattern).is_err() {
        enqueue_error(rt, state, "Invalid subject format");
        return None;
    }

    if let Some(existing) = rt.subs.get(&pattern) {
        let subscription_id = existing.subscription_id.clone();
        enqueue_ack(rt, state, subscription_id, message.correlation_id);
        return None;
    }

    let allowed = rt
        .ctx
        .sub_patterns
        .iter()
        .any(|p| gw_domain::subject::matches(p, &pattern));
    state.metrics.authorization_check(AuthzOp::Subscribe, allowed);
    if !allowed {
        let err = AuthorizationError::SubscribeDenied { pattern: pattern.clone() };
        state.metrics.error(err.kind());
        enqueue_error(rt, state, err.to_string());
        return None;
    }

    let deliver = make_deliver_callback(rt.outbound.clone(), state.nats.clone());
    match state.nats.subscribe_device(&rt.client_id, &pattern, deliver).await {
        Ok(handle) => {
            let subscription_id = handle.subscription_id.clone();
            rt.subs.insert(pattern, handle);
            enqueue_ack(rt, state, subscription_id, message.correlation_id);
        }
        Err(e) => enqueue_error(rt, state, format!("subscribe failed: {e}")),
    }
    None
}

async fn handle_unsubscribe(message: WireMessage, rt: &mut SessionRuntime, state: &AppState) -> Option<CloseReason> {
    let pattern = message.subject.clone().unwrap_or_default();
    match rt.subs.remove(&pattern) {
        Some(handle) => {
            if let Err(e) = state.nats.unsubscribe(&handle).await {
                warn!(error = %e, pattern = %pattern, "unsubscribe failed");
            }
            enqueue_ack(rt, state, handle.subscription_id, message.correlation_id);
        }
        None => {
            let err = OperationError::NotSubscribed { pattern: pattern.clone() };
            state.metrics.error(err.kind());
            enqueue_error(rt, state, err.to_string());
        }
    }
    None
}

fn handle_ping(message: WireMessage, rt: &mut SessionRuntime) {
    let mut pong = WireMessage::new(MessageType::Pong);
    if let Some(id) = message.correlation_id {
        pong = pong.with_correlation_id(id);
    }
    rt.outbound.enqueue(pong);
}

/// Wraps one JetStream-delivered message into the wire envelope the
/// device expects, using the message's own subject/payload rather
/// than re-parsing the stored bytes as a full `WireMessage` — the
/// publisher that wrote this message had no reason to wrap its
/// payload in one, so treating the bytes as a JSON `payload` value is
/// the only format that doesn't silently drop every delivery.
fn make_deliver_callback(outbound: OutboundBuffer, nats: Arc<gw_adapters::JetStreamAdapter>) -> DeliverCallback {
    Arc::new(move |delivered| {
        let outbound = outbound.clone();
        let nats = nats.clone();
        Box::pin(async move {
            match serde_json::from_slice::<serde_json::Value>(&delivered.payload) {
                Ok(payload) => {
                    let message = WireMessage::new(MessageType::Message)
                        .with_subject(delivered.subject.clone())
                        .with_payload(payload);
                    outbound.enqueue(message);
                    if let Err(e) = nats.ack(delivered.ack_token).await {
                        warn!(error = %e, "ack failed");
                    }
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        subject = %delivered.subject,
                        "delivered message payload is not valid JSON, nak'ing for redelivery"
                    );
                    if let Err(e) = nats.nak(delivered.ack_token).await {
                        warn!(error = %e, "nak failed");
                    }
                }
            }
        })
    })
}

fn enqueue(rt: &mut SessionRuntime, state: &AppState, message: WireMessage) {
    let message_type = message.message_type;
    match rt.outbound.enqueue(message) {
        EnqueueOutcome::Enqueued => {
            state.metrics.buffer_enqueue();
            state.metrics.message(WireDirection::Sent, message_type_label(message_type));
        }
        EnqueueOutcome::Dropped => state.metrics.buffer_overflow(),
        EnqueueOutcome::Closed => {}
    }
}

fn enqueue_error(rt: &mut SessionRuntime, state: &AppState, message: impl Into<String>) {
    enqueue(rt, state, WireMessage::error(message));
}

fn enqueue_ack(rt: &mut SessionRuntime, state: &AppState, subscription_id: String, correlation_id: Option<String>) {
    let mut ack = WireMessage::new(MessageType::Ack).with_payload(json!({ "subscriptionId": subscription_id }));
    if let Some(id) = correlation_id {
        ack = ack.with_correlation_id(id);
    }
    enqueue(rt, state, ack);
}

async fn run_writer(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound_rx: tokio::sync::mpsc::Receiver<WireMessage>,
    mut close_rx: oneshot::Receiver<CloseReason>,
    codec: gw_domain::wire::ProtocolCodec,
) {
    loop {
        tokio::select! {
            biased;

            reason = &mut close_rx => {
                let reason = reason.unwrap_or(CloseReason::WriteError);
                drain_remaining(&mut outbound_rx, &mut sender, &codec).await;
                close_socket(&mut sender, &reason).await;
                return;
            }

            maybe = outbound_rx.recv() => {
                match maybe {
                    Some(message) => {
                        if send_one(&mut sender, &codec, message).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

/// Best-effort drain of whatever is still queued, bounded to 200ms
/// total so a stalled peer can't hold the writer task open forever.
async fn drain_remaining(
    outbound_rx: &mut tokio::sync::mpsc::Receiver<WireMessage>,
    sender: &mut SplitSink<WebSocket, Message>,
    codec: &gw_domain::wire::ProtocolCodec,
) {
    let deadline = Instant::now() + Duration::from_millis(200);
    while Instant::now() < deadline {
        match outbound_rx.try_recv() {
            Ok(message) => {
                if send_one(sender, codec, message).await.is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

async fn send_one(
    sender: &mut SplitSink<WebSocket, Message>,
    codec: &gw_domain::wire::ProtocolCodec,
    message: WireMessage,
) -> Result<(), ()> {
    match codec.encode(message) {
        Ok(text) => sender.send(Message::Text(text)).await.map_err(|_| ()),
        Err(_) => Ok(()),
    }
}

async fn send_auth_response(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
    success: bool,
    client_id: Option<String>,
    role: Option<String>,
    error: Option<String>,
) {
    let mut payload = json!({ "success": success });
    if let Some(id) = client_id {
        payload["clientId"] = json!(id);
    }
    if let Some(role) = role {
        payload["role"] = json!(role);
    }
    if let Some(error) = error {
        payload["error"] = json!(error);
    }
    let response = WireMessage::new(MessageType::Auth).with_payload(payload);
    let _ = send_one(sender, &state.codec, response).await;
}

async fn close_socket(sender: &mut SplitSink<WebSocket, Message>, reason: &CloseReason) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: reason.close_code() as u16,
            reason: Cow::from(reason_label(reason)),
        })))
        .await;
}

fn message_type_label(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Publish => "publish",
        MessageType::Subscribe => "subscribe",
        MessageType::Unsubscribe => "unsubscribe",
        MessageType::Message => "message",
        MessageType::Request => "request",
        MessageType::Reply => "reply",
        MessageType::Ack => "ack",
        MessageType::Error => "error",
        MessageType::Auth => "auth",
        MessageType::Ping => "ping",
        MessageType::Pong => "pong",
    }
}

fn reason_label(reason: &CloseReason) -> &'static str {
    use CloseReason::*;
    match reason {
        AuthTimeout => "auth_timeout",
        MalformedAuthFrame => "malformed_auth_frame",
        AuthValidatorFailed(_) => "auth_validator_failed",
        PeerClosed => "peer_closed",
        WriteError => "write_error",
        TokenExpired => "token_expired",
        Superseded => "superseded",
        ProtocolFatal(_) => "protocol_fatal",
        HeartbeatTimeout => "heartbeat_timeout",
        AdminEvicted => "admin_evicted",
    }
}

fn reason_message(reason: &CloseReason) -> String {
    use CloseReason::*;
    match reason {
        AuthTimeout => "authentication timeout".to_string(),
        MalformedAuthFrame => "malformed auth frame".to_string(),
        AuthValidatorFailed(detail) => format!("authentication failed: {detail}"),
        PeerClosed => "peer closed".to_string(),
        WriteError => "write error".to_string(),
        TokenExpired => "token expired".to_string(),
        Superseded => "superseded by a new session".to_string(),
        ProtocolFatal(detail) => format!("protocol error: {detail}"),
        HeartbeatTimeout => "heartbeat timeout".to_string(),
        AdminEvicted => "disconnected by administrator".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_register_fires_first_signal_as_superseded() {
        let directory = SupersedeDirectory::new();
        let first = directory.register("dev-1").await;
        let _second = directory.register("dev-1").await;
        let reason = tokio::time::timeout(Duration::from_millis(50), first.wait())
            .await
            .expect("signal should fire promptly");
        assert_eq!(reason, CloseReason::Superseded);
    }

    #[tokio::test]
    async fn remove_is_a_no_op_for_a_stale_signal() {
        let directory = SupersedeDirectory::new();
        let first = directory.register("dev-1").await;
        let second = directory.register("dev-1").await;
        directory.remove("dev-1", &first).await;
        // second's entry must still be present, since `first` was stale.
        assert!(directory.evict("dev-1", CloseReason::AdminEvicted).await);
        let reason = tokio::time::timeout(Duration::from_millis(50), second.wait())
            .await
            .expect("second signal should fire");
        assert_eq!(reason, CloseReason::AdminEvicted);
    }

    #[tokio::test]
    async fn evict_on_unknown_client_returns_false() {
        let directory = SupersedeDirectory::new();
        assert!(!directory.evict("ghost", CloseReason::AdminEvicted).await);
    }
}
