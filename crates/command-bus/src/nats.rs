//! NATS JetStream transport.
//!
//! One stream per namespace captures `<namespace>.>`. Every subscription is
//! a durable pull consumer with explicit acks and a single delivery attempt:
//! the bus acknowledges on receipt and relies on the message store, not on
//! redelivery, for at-most-once processing.

use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::error::{BusError, Result};
use crate::topic::Topic;
use crate::transport::{Acknowledger, ConsumerSpec, DeliverPolicy, Delivery, DeliveryStream, Transport};

/// JetStream-backed [`Transport`].
#[derive(Clone)]
pub struct NatsTransport {
    jetstream: jetstream::Context,
    stream_name: String,
}

impl NatsTransport {
    /// Connects to `url` and ensures the namespace stream exists.
    pub async fn connect(url: &str, namespace: &str, max_age: Duration) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Self::new(client, namespace, max_age).await
    }

    /// Wraps an existing client and ensures the namespace stream exists.
    ///
    /// Messages older than `max_age` are dropped by the broker.
    pub async fn new(client: async_nats::Client, namespace: &str, max_age: Duration) -> Result<Self> {
        let jetstream = jetstream::new(client);
        let config = stream_config(namespace, max_age);
        let stream_name = config.name.clone();

        jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| BusError::Connection(format!("failed to ensure stream {stream_name}: {e}")))?;

        tracing::info!(stream = %stream_name, ?max_age, "JetStream stream ready");

        Ok(Self {
            jetstream,
            stream_name,
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }
}

/// Limits retention keeps each message for every durable consumer (commands
/// and the runner's event wildcard overlap); `max_age` bounds the stream.
fn stream_config(namespace: &str, max_age: Duration) -> stream::Config {
    stream::Config {
        name: stream_name(namespace),
        description: Some(format!("Commands and events for {namespace}")),
        subjects: vec![Topic::namespace_wildcard(namespace)],
        retention: stream::RetentionPolicy::Limits,
        max_age,
        storage: stream::StorageType::File,
        num_replicas: 1,
        ..Default::default()
    }
}

/// Stream names may not contain `.`; they are conventionally upper case.
fn stream_name(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| match c {
            '.' | '-' | ' ' | '*' | '>' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

struct JetStreamAck(jetstream::Message);

#[async_trait]
impl Acknowledger for JetStreamAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0.ack().await.map_err(|e| BusError::Ack(e.to_string()))
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, subject: String, payload: Vec<u8>) -> Result<()> {
        self.jetstream
            .publish(subject, payload.into())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, spec: ConsumerSpec) -> Result<DeliveryStream> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                &spec.durable_name,
                consumer::pull::Config {
                    durable_name: Some(spec.durable_name.clone()),
                    filter_subject: spec.filter_subject.clone(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    max_deliver: 1,
                    deliver_policy: match spec.deliver_policy {
                        DeliverPolicy::All => consumer::DeliverPolicy::All,
                        DeliverPolicy::Last => consumer::DeliverPolicy::Last,
                    },
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("consumer {}: {e}", spec.durable_name)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        tracing::debug!(
            consumer = %spec.durable_name,
            filter = %spec.filter_subject,
            "Pull consumer bound"
        );

        let deliveries = messages.map(|received| match received {
            Ok(message) => {
                let subject = message.subject.to_string();
                let payload = message.payload.to_vec();
                Ok(Delivery::new(subject, payload, Some(Box::new(JetStreamAck(message)))))
            }
            Err(e) => Err(BusError::Subscribe(e.to_string())),
        });

        Ok(Box::pin(deliveries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name() {
        assert_eq!(stream_name("orchestration"), "ORCHESTRATION");
        assert_eq!(stream_name("quant.backtest-v2"), "QUANT_BACKTEST_V2");
    }

    #[test]
    fn test_stream_config_is_bounded_by_age() {
        let config = stream_config("quant", Duration::from_secs(3600));

        assert_eq!(config.name, "QUANT");
        assert_eq!(config.subjects, vec!["quant.>".to_string()]);
        assert_eq!(config.max_age, Duration::from_secs(3600));
        assert!(matches!(config.retention, stream::RetentionPolicy::Limits));
    }
}
