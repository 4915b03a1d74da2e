//! Concrete adapter implementations of the `gw-ports` traits.

pub mod jwt;
pub mod metrics;
pub mod nats;
pub mod registry;

pub use jwt::JwtTokenValidator;
pub use metrics::{AggregatingMetricsSink, MetricsSnapshot, NoopMetricsSink};
pub use nats::JetStreamAdapter;
pub use registry::InMemoryRegistry;
