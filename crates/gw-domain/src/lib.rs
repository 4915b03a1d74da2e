//! Pure domain types and algorithms for the WebSocket-to-NATS device
//! gateway core: no socket I/O, no NATS client, no HTTP framework.
//!
//! Adapters (`gw-adapters`) and the runtime (`gw-gateway`) depend on
//! this crate; this crate depends on neither.

pub mod config;
pub mod device_context;
pub mod errors;
pub mod rate_limit;
pub mod session_state;
pub mod subject;
pub mod wire;

pub use config::GatewayConfig;
pub use device_context::DeviceContext;
pub use errors::ErrorKind;
pub use rate_limit::RateLimiter;
pub use session_state::{CloseCode, CloseReason, SessionEvent, SessionState};
pub use wire::{MessageType, ProtocolCodec, WireMessage};
