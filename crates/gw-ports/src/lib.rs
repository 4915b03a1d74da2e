//! Port trait interfaces the device gateway's adapters implement.
//!
//! No concrete I/O lives here — only the contracts, grounded in the
//! teacher's `sr-ports` crate (`EventStore`, `MessageBus`,
//! `IdentityProvider`, ...), generalized to this gateway's ports:
//! `TokenValidator`, `NatsAdapter`, `ConnectionRegistry`, `MetricsSink`.

use gw_domain::device_context::DeviceContext;
use gw_domain::errors::AuthTokenError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Token Validator (§4.A)
// ============================================================================

/// Verifies a bearer token and extracts a `DeviceContext`.
pub trait TokenValidator: Send + Sync {
    fn validate(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<DeviceContext, AuthTokenError>> + Send;
}

// ============================================================================
// NATS Adapter (§4.F)
// ============================================================================

/// Result of a successful publish: the stream sequence JetStream
/// assigned the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub sequence: u64,
}

/// A durable consumer bound to one (session, subject-pattern), per the
/// `SubscriptionHandle` entity in §3.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub subscription_id: String,
    pub consumer_name: String,
    pub stream_name: String,
    pub filter_subject: String,
}

/// One delivered message, carrying the bytes and an opaque ack token
/// the adapter uses to ack/nak/term it without the caller needing to
/// understand JetStream's internal message representation.
pub struct DeliveredMessage {
    pub subscription_id: String,
    pub subject: String,
    pub payload: Vec<u8>,
    pub delivery_count: u64,
    pub stream_sequence: u64,
    pub ack_token: AckToken,
}

/// Opaque handle passed back into `NatsAdapter::ack` to acknowledge
/// (or not) one delivered message.
pub struct AckToken(pub Box<dyn AckTokenImpl>);

pub trait AckTokenImpl: Send + Sync {
    fn subscription_id(&self) -> &str;

    /// Acknowledges the underlying delivered message. Boxed-future
    /// return rather than an async fn: `AckTokenImpl` is used behind
    /// `dyn`, which native `async fn`-in-traits doesn't support.
    fn ack(&self) -> Pin<Box<dyn Future<Output = Result<(), NatsError>> + Send + '_>>;

    /// Negatively acknowledges the delivered message, asking JetStream
    /// to redeliver it. Used when a message can't be forwarded to the
    /// device (e.g. its payload isn't valid JSON) but isn't yet past
    /// `maxDeliver`.
    fn nak(&self) -> Pin<Box<dyn Future<Output = Result<(), NatsError>> + Send + '_>>;
}

/// Callback invoked once per delivered message. Implementations
/// enqueue into the session's outbound buffer and then ack.
pub type DeliverCallback =
    Arc<dyn Fn(DeliveredMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Publishes to JetStream streams and manages per-session durable
/// push consumers with explicit-ack semantics.
pub trait NatsAdapter: Send + Sync {
    /// Publishes `payload` to `subject`. Retries transient errors with
    /// the configured backoff; a final failure surfaces `PublishFailed`.
    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<PublishAck, NatsError>> + Send;

    /// Resolves `subject_pattern` to a stream and creates (or attaches
    /// to) a durable consumer named `gw-<clientId>-<hash(pattern)>`.
    /// Idempotent: a second call for the same `(client_id, pattern)`
    /// returns the existing handle rather than creating a second
    /// consumer.
    fn subscribe_device(
        &self,
        client_id: &str,
        subject_pattern: &str,
        deliver: DeliverCallback,
    ) -> impl Future<Output = Result<SubscriptionHandle, NatsError>> + Send;

    /// Explicitly acknowledges one delivered message.
    fn ack(&self, token: AckToken) -> impl Future<Output = Result<(), NatsError>> + Send;

    /// Negatively acknowledges one delivered message, asking JetStream
    /// to redeliver it rather than consider it handled.
    fn nak(&self, token: AckToken) -> impl Future<Output = Result<(), NatsError>> + Send;

    /// Detaches the push consumer and deletes the durable if this
    /// session created it.
    fn unsubscribe(
        &self,
        handle: &SubscriptionHandle,
    ) -> impl Future<Output = Result<(), NatsError>> + Send;
}

#[derive(Debug, Error)]
pub enum NatsError {
    #[error("connection error: {message}")]
    ConnectionError { message: String },

    #[error("publish failed after retries: {message}")]
    PublishFailed { message: String },

    #[error("stream not found for subject {subject}")]
    NoMatchingStream { subject: String },

    #[error("ack error: {message}")]
    AckError { message: String },
}

// ============================================================================
// Connection Registry (§4.G)
// ============================================================================

/// Summary of one live device connection, used by the `/devices`
/// admin endpoint.
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub client_id: String,
    pub role: String,
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of registering a session: whether an existing session for
/// the same `clientId` was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    SupersededPrevious,
}

/// Opaque proof of one specific registration, handed back by
/// `register` and presented back to `remove`. Mirrors the
/// `Arc::ptr_eq`-based identity check `gw-gateway::session::
/// SupersedeDirectory` already uses for the same race: a superseded
/// session's delayed teardown must not remove the entry its successor
/// already registered in its place.
#[derive(Clone)]
pub struct RegistrationToken(Arc<()>);

impl RegistrationToken {
    pub fn new() -> Self {
        Self(Arc::new(()))
    }

    pub fn matches(&self, other: &RegistrationToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for RegistrationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks live device→connection bindings. At most one live session
/// per `clientId`; thread-safe for concurrent mutation.
pub trait ConnectionRegistry: Send + Sync {
    fn register(
        &self,
        summary: DeviceSummary,
    ) -> impl Future<Output = (RegisterOutcome, RegistrationToken)> + Send;

    /// Removes `client_id`'s entry only if it's still the one `token`
    /// was issued for. Returns whether the removal actually happened;
    /// `false` means a later session has already superseded this one
    /// and the caller's own teardown must not clobber it.
    fn remove(
        &self,
        client_id: &str,
        token: &RegistrationToken,
    ) -> impl Future<Output = bool> + Send;

    fn lookup(
        &self,
        client_id: &str,
    ) -> impl Future<Output = Option<DeviceSummary>> + Send;

    fn count(&self) -> impl Future<Output = usize> + Send;

    fn snapshot(&self) -> impl Future<Output = Vec<DeviceSummary>> + Send;
}

// ============================================================================
// Metrics / Event Sink (§4.I)
// ============================================================================

/// Inbound/outbound message kind, for per-type counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireDirection {
    Received,
    Sent,
}

/// Authorization operation kind, for the authorization-check counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzOp {
    Publish,
    Subscribe,
}

/// Narrow, strictly non-blocking interface all components emit
/// observable events through. Implementations that do I/O must buffer
/// internally; the default `NoopMetricsSink` and
/// `AggregatingMetricsSink` live in `gw-adapters`.
pub trait MetricsSink: Send + Sync {
    fn connection_opened(&self) {}
    fn connection_closed(&self, _reason: &str) {}
    fn auth_attempt(&self, _success: bool) {}
    fn message(&self, _direction: WireDirection, _message_type: &str) {}
    fn publish_result(&self, _success: bool) {}
    fn nats_latency(&self, _operation: &str, _duration: std::time::Duration) {}
    fn buffer_enqueue(&self) {}
    fn buffer_overflow(&self) {}
    fn rate_limit_rejection(&self) {}
    fn authorization_check(&self, _op: AuthzOp, _allowed: bool) {}
    fn error(&self, _kind: gw_domain::errors::ErrorKind) {}
    fn message_dead_lettered(&self, _subject: &str) {}
}
