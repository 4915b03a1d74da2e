//! JetStream message bus adapter, per §4.F.
//!
//! Grounded in the teacher's `sr-adapters::nats::NatsMessageBus`:
//! stream reconciliation at connect time, durable push consumers with
//! explicit ack, and the same ack/nak vocabulary. Generalized from a
//! fixed events/commands stream pair to the declarative
//! `streams[]`/`consumers[]` configuration of §3/§6, and from a pull
//! consumer to a push consumer feeding a per-device delivery callback.

use async_nats::jetstream::{
    self,
    consumer::{push::Config as PushConsumerConfig, AckPolicy, DeliverPolicy, ReplayPolicy},
    stream::{Config as JsStreamConfig, DiscardPolicy, RetentionPolicy, StorageType},
    AckKind, Context as JetStreamContext, Message as JsMessage,
};
use async_nats::Client as NatsClient;
use futures::StreamExt;
use gw_domain::config::{Discard, GatewayConfig, Retention, Storage};
use gw_ports::{
    AckToken, AckTokenImpl, DeliverCallback, DeliveredMessage, MetricsSink, NatsAdapter,
    NatsError, PublishAck, SubscriptionHandle,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Connects to NATS, reconciling the declared streams, and hands out
/// per-device push consumers. `async-nats` handles reconnection
/// (`reconnect_delay`/`max_reconnect_attempts`) and transparently
/// restores existing subscriptions underneath us.
pub struct JetStreamAdapter {
    #[allow(dead_code)]
    client: NatsClient,
    jetstream: JetStreamContext,
    config: GatewayConfig,
    metrics: Arc<dyn MetricsSink>,
    /// Serializes subscription creation per `(client_id, pattern)` so a
    /// racing double-SUBSCRIBE can't create two consumers.
    subscribe_lock: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    handles: Mutex<HashMap<String, SubscriptionHandle>>,
    /// The delivery loop `tokio::spawn`ed per subscription, kept so
    /// `unsubscribe` can abort it instead of leaking a task that would
    /// otherwise keep polling a consumer we've just deleted.
    delivery_tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl JetStreamAdapter {
    pub async fn connect(
        config: GatewayConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, NatsError> {
        info!(url = %config.nats.url, "connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(config.nats.connection_timeout)
            .reconnect_delay_callback(move |_attempts| config.nats.reconnect_delay)
            .max_reconnects(config.nats.max_reconnect_attempts as usize)
            .connect(&config.nats.url)
            .await
            .map_err(|e| NatsError::ConnectionError {
                message: e.to_string(),
            })?;

        let jetstream = jetstream::new(client.clone());

        let adapter = Self {
            client,
            jetstream,
            config,
            metrics,
            subscribe_lock: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            delivery_tasks: Mutex::new(HashMap::new()),
        };

        if adapter.config.nats.use_jetstream {
            adapter.reconcile_streams().await?;
        } else {
            debug!("nats.use_jetstream is false, skipping stream reconciliation");
        }
        Ok(adapter)
    }

    /// Startup reconciliation: a declared stream is created if absent;
    /// an existing stream with an incompatible config is logged and
    /// left alone unless `allow_reconcile` is set.
    async fn reconcile_streams(&self) -> Result<(), NatsError> {
        for declared in &self.config.streams {
            let js_config = to_js_stream_config(declared);
            match self.jetstream.get_stream(&declared.name).await {
                Ok(_) if !declared.allow_reconcile => {
                    debug!(stream = %declared.name, "stream exists, leaving as-is");
                }
                Ok(_) => {
                    self.jetstream
                        .update_stream(js_config)
                        .await
                        .map_err(|e| NatsError::ConnectionError {
                            message: format!("failed to update stream {}: {e}", declared.name),
                        })?;
                }
                Err(_) => {
                    info!(stream = %declared.name, "creating stream");
                    self.jetstream.create_stream(js_config).await.map_err(|e| {
                        NatsError::ConnectionError {
                            message: format!("failed to create stream {}: {e}", declared.name),
                        }
                    })?;
                }
            }
        }
        Ok(())
    }

    fn stream_for_subject(&self, subject: &str) -> Option<&str> {
        self.config
            .streams
            .iter()
            .find(|s| s.subjects.iter().any(|p| gw_domain::subject::matches(p, subject)))
            .map(|s| s.name.as_str())
    }

    async fn lock_for(&self, client_id: &str, pattern: &str) -> Arc<Mutex<()>> {
        let mut map = self.subscribe_lock.lock().await;
        map.entry((client_id.to_string(), pattern.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl NatsAdapter for JetStreamAdapter {
    #[instrument(skip(self, payload), fields(subject = %subject))]
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<PublishAck, NatsError> {
        let policy = &self.config.publish_retry_policy;
        let mut delay = policy.initial_delay;
        let mut attempt = 0;

        loop {
            let started = std::time::Instant::now();
            match self
                .jetstream
                .publish(subject.to_string(), payload.to_vec().into())
                .await
            {
                Ok(ack_future) => match ack_future.await {
                    Ok(ack) => {
                        debug!(subject = %subject, latency_ms = %started.elapsed().as_millis(), "published");
                        return Ok(PublishAck { sequence: ack.sequence });
                    }
                    Err(e) => {
                        if attempt >= policy.max_retries {
                            return Err(NatsError::PublishFailed {
                                message: e.to_string(),
                            });
                        }
                    }
                },
                Err(e) => {
                    if attempt >= policy.max_retries {
                        return Err(NatsError::PublishFailed {
                            message: e.to_string(),
                        });
                    }
                }
            }

            attempt += 1;
            let jittered = if policy.add_jitter {
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2 + 1);
                delay + Duration::from_millis(jitter_ms)
            } else {
                delay
            };
            tokio::time::sleep(jittered.min(policy.max_delay)).await;
            delay = Duration::from_secs_f64(delay.as_secs_f64() * policy.backoff_multiplier)
                .min(policy.max_delay);
        }
    }

    #[instrument(skip(self, deliver), fields(client_id = %client_id, pattern = %subject_pattern))]
    async fn subscribe_device(
        &self,
        client_id: &str,
        subject_pattern: &str,
        deliver: DeliverCallback,
    ) -> Result<SubscriptionHandle, NatsError> {
        let lock = self.lock_for(client_id, subject_pattern).await;
        let _guard = lock.lock().await;

        let subscription_id = subscription_id_for(client_id, subject_pattern);
        {
            let handles = self.handles.lock().await;
            if let Some(existing) = handles.get(&subscription_id) {
                return Ok(existing.clone());
            }
        }

        let stream_name = self
            .stream_for_subject(subject_pattern)
            .ok_or_else(|| NatsError::NoMatchingStream {
                subject: subject_pattern.to_string(),
            })?
            .to_string();

        let consumer_name = format!("gw-{client_id}-{}", hash_pattern(subject_pattern));
        let deliver_subject = format!("_INBOX.gw.{consumer_name}");

        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|e| NatsError::ConnectionError {
                message: e.to_string(),
            })?;

        let consumer_template = self
            .config
            .consumers
            .first()
            .cloned()
            .unwrap_or(gw_domain::config::ConsumerConfig {
                durable_name: consumer_name.clone(),
                filter_subject: subject_pattern.to_string(),
                delivery_policy: gw_domain::config::DeliveryPolicy::New,
                ack_wait: Duration::from_secs(30),
                max_deliver: 5,
                max_ack_pending: 1000,
                replay_policy: gw_domain::config::ReplayPolicy::Instant,
            });

        let push_config = PushConsumerConfig {
            durable_name: Some(consumer_name.clone()),
            filter_subject: subject_pattern.to_string(),
            deliver_subject,
            ack_policy: AckPolicy::Explicit,
            ack_wait: consumer_template.ack_wait,
            max_deliver: consumer_template.max_deliver,
            max_ack_pending: consumer_template.max_ack_pending as i64,
            deliver_policy: match consumer_template.delivery_policy {
                gw_domain::config::DeliveryPolicy::All => DeliverPolicy::All,
                gw_domain::config::DeliveryPolicy::New => DeliverPolicy::New,
                gw_domain::config::DeliveryPolicy::Last => DeliverPolicy::Last,
            },
            replay_policy: match consumer_template.replay_policy {
                gw_domain::config::ReplayPolicy::Instant => ReplayPolicy::Instant,
                gw_domain::config::ReplayPolicy::Original => ReplayPolicy::Original,
            },
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&consumer_name, push_config)
            .await
            .map_err(|e| NatsError::ConnectionError {
                message: e.to_string(),
            })?;

        let handle = SubscriptionHandle {
            subscription_id: subscription_id.clone(),
            consumer_name,
            stream_name,
            filter_subject: subject_pattern.to_string(),
        };

        self.handles
            .lock()
            .await
            .insert(subscription_id.clone(), handle.clone());

        let sub_id_for_task = subscription_id.clone();
        let max_deliver = consumer_template.max_deliver;
        let metrics = self.metrics.clone();
        let task = tokio::spawn(async move {
            let mut messages = match consumer.messages().await {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "failed to open consumer message stream");
                    return;
                }
            };
            while let Some(Ok(msg)) = messages.next().await {
                let delivered = to_delivered_message(&sub_id_for_task, &msg);
                // JetStream itself stops redelivering once `max_deliver`
                // is reached; this is the "logged + counter" half of
                // dead-lettering the spec requires on top of that. The
                // message is acked (not forwarded) so it doesn't sit
                // pending forever once we've given up on it.
                if max_deliver > 0 && delivered.delivery_count as i64 >= max_deliver {
                    metrics.message_dead_lettered(&delivered.subject);
                    if let Err(e) = delivered.ack_token.0.ack().await {
                        warn!(error = %e, "failed to ack dead-lettered message");
                    }
                    continue;
                }
                deliver(delivered).await;
            }
        });
        self.delivery_tasks
            .lock()
            .await
            .insert(subscription_id.clone(), task);

        Ok(handle)
    }

    async fn ack(&self, token: AckToken) -> Result<(), NatsError> {
        token.0.ack().await
    }

    async fn nak(&self, token: AckToken) -> Result<(), NatsError> {
        token.0.nak().await
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), NatsError> {
        self.handles.lock().await.remove(&handle.subscription_id);
        if let Some(task) = self
            .delivery_tasks
            .lock()
            .await
            .remove(&handle.subscription_id)
        {
            task.abort();
        }
        let stream = self
            .jetstream
            .get_stream(&handle.stream_name)
            .await
            .map_err(|e| NatsError::ConnectionError {
                message: e.to_string(),
            })?;
        stream
            .delete_consumer(&handle.consumer_name)
            .await
            .map_err(|e| NatsError::ConnectionError {
                message: e.to_string(),
            })?;
        Ok(())
    }
}

fn subscription_id_for(client_id: &str, pattern: &str) -> String {
    format!("sub-{client_id}-{}", hash_pattern(pattern))
}

/// A short, stable hash of the pattern for the durable consumer name.
/// Not cryptographic — only needs to be collision-resistant enough to
/// distinguish two patterns for the same device.
fn hash_pattern(pattern: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    pattern.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn to_delivered_message(subscription_id: &str, msg: &JsMessage) -> DeliveredMessage {
    let info = msg.info().ok();
    DeliveredMessage {
        subscription_id: subscription_id.to_string(),
        subject: msg.subject.to_string(),
        payload: msg.payload.to_vec(),
        delivery_count: info.map(|i| i.delivered).unwrap_or(1),
        stream_sequence: info.map(|i| i.stream_sequence).unwrap_or(0),
        ack_token: AckToken(Box::new(JsAckToken {
            subscription_id: subscription_id.to_string(),
            message: msg.clone(),
        })),
    }
}

struct JsAckToken {
    subscription_id: String,
    message: JsMessage,
}

impl AckTokenImpl for JsAckToken {
    fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    fn ack(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), NatsError>> + Send + '_>> {
        Box::pin(async move {
            self.message
                .ack()
                .await
                .map_err(|e| NatsError::AckError {
                    message: e.to_string(),
                })
        })
    }

    fn nak(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), NatsError>> + Send + '_>> {
        Box::pin(async move {
            self.message
                .ack_with(AckKind::Nak(None))
                .await
                .map_err(|e| NatsError::AckError {
                    message: e.to_string(),
                })
        })
    }
}

fn to_js_stream_config(declared: &gw_domain::config::StreamConfig) -> JsStreamConfig {
    JsStreamConfig {
        name: declared.name.clone(),
        subjects: declared.subjects.clone(),
        retention: match declared.retention {
            Retention::Limits => RetentionPolicy::Limits,
            Retention::Interest => RetentionPolicy::Interest,
            Retention::WorkQueue => RetentionPolicy::WorkQueue,
        },
        storage: match declared.storage {
            Storage::Memory => StorageType::Memory,
            Storage::File => StorageType::File,
        },
        max_age: declared.max_age.unwrap_or_default(),
        max_messages: declared.max_msgs.unwrap_or(-1),
        max_bytes: declared.max_bytes.unwrap_or(-1),
        max_message_size: declared.max_msg_size.unwrap_or(-1),
        num_replicas: declared.replicas,
        discard: match declared.discard {
            Discard::Old => DiscardPolicy::Old,
            Discard::New => DiscardPolicy::New,
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_pattern_is_stable_and_distinguishes_patterns() {
        assert_eq!(hash_pattern("a.b.>"), hash_pattern("a.b.>"));
        assert_ne!(hash_pattern("a.b.>"), hash_pattern("a.c.>"));
    }

    #[test]
    fn consumer_name_derivation_matches_spec_shape() {
        let id = subscription_id_for("dev-1", "commands.dev-1.>");
        assert!(id.starts_with("sub-dev-1-"));
    }
}
