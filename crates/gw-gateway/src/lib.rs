//! Shared runtime state and module wiring for the device gateway.

pub mod http;
pub mod listener;
pub mod outbound;
pub mod session;

use gw_adapters::{AggregatingMetricsSink, JetStreamAdapter, JwtTokenValidator};
use gw_domain::config::GatewayConfig;
use gw_domain::wire::ProtocolCodec;
use session::SupersedeDirectory;
use std::sync::Arc;

/// Handed to every axum handler and session task via `Arc`'s sharing,
/// not behind `axum::extract::State`'s own `Arc` wrapping twice over.
///
/// Every adapter field holds a concrete type rather than `Arc<dyn
/// Trait>`: exactly one implementation of each port is ever wired per
/// deployment, so there is no runtime polymorphism to pay for, and the
/// metrics sink in particular needs its own `render_prometheus`
/// method, which isn't part of the `MetricsSink` trait surface `dyn`
/// would restrict it to.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub codec: ProtocolCodec,
    pub token_validator: Arc<JwtTokenValidator>,
    pub nats: Arc<JetStreamAdapter>,
    pub registry: Arc<gw_adapters::InMemoryRegistry>,
    pub metrics: Arc<AggregatingMetricsSink>,
    pub supersede: SupersedeDirectory,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        token_validator: JwtTokenValidator,
        nats: JetStreamAdapter,
        registry: gw_adapters::InMemoryRegistry,
        metrics: Arc<AggregatingMetricsSink>,
    ) -> Self {
        let codec = ProtocolCodec::new(config.max_message_size);
        Self {
            config: Arc::new(config),
            codec,
            token_validator: Arc::new(token_validator),
            nats: Arc::new(nats),
            registry: Arc::new(registry),
            metrics,
            supersede: SupersedeDirectory::new(),
        }
    }
}
