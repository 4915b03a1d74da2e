//! Domain error taxonomy for the device gateway core.

use thiserror::Error;

/// The six error kinds from the error handling design: each concrete
/// error below maps onto exactly one of these for metrics tagging and
/// close-code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Authentication,
    Authorization,
    Protocol,
    Operation,
    Internal,
}

/// Failures from validating a bearer token into a `DeviceContext`.
#[derive(Debug, Error)]
pub enum AuthTokenError {
    #[error("missing token")]
    MissingToken,

    #[error("malformed token: {reason}")]
    MalformedToken { reason: String },

    #[error("bad signature")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("wrong issuer")]
    WrongIssuer,

    #[error("wrong audience")]
    WrongAudience,

    #[error("missing required claim: {claim}")]
    MissingSubject { claim: String },
}

impl AuthTokenError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Authentication
    }
}

/// Subject validation / matching failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubjectError {
    #[error("invalid subject format")]
    InvalidSubject,
}

impl SubjectError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

/// Wire envelope encode/decode failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown message type: {value}")]
    InvalidMessageType { value: i64 },

    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("malformed json: {reason}")]
    MalformedJson { reason: String },
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

/// Authorization check outcomes surfaced as errors (publish/subscribe denial).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("not authorized to publish to {subject}")]
    PublishDenied { subject: String },

    #[error("not authorized to subscribe to {pattern}")]
    SubscribeDenied { pattern: String },
}

impl AuthorizationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Authorization
    }
}

/// Errors from session-level operations (subscribe lookups, etc).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("not subscribed to {pattern}")]
    NotSubscribed { pattern: String },

    #[error("rate limit exceeded")]
    RateLimited,
}

impl OperationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Operation
    }
}
