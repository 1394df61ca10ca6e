//! Broker abstraction underneath the command bus.

use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};

/// Where a new durable consumer starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliverPolicy {
    /// Everything still retained by the stream.
    #[default]
    All,
    /// Only the most recent message, then new ones.
    Last,
}

impl FromStr for DeliverPolicy {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(DeliverPolicy::All),
            "last" => Ok(DeliverPolicy::Last),
            other => Err(BusError::Subscribe(format!("unknown deliver policy: {other}"))),
        }
    }
}

/// Durable consumer to bind a subscription to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub durable_name: String,
    pub filter_subject: String,
    pub deliver_policy: DeliverPolicy,
}

/// Acknowledges a single delivery back to the broker.
#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// One message received from the broker.
pub struct Delivery {
    pub subject: String,
    pub payload: Vec<u8>,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(subject: String, payload: Vec<u8>, acker: Option<Box<dyn Acknowledger>>) -> Self {
        Self {
            subject,
            payload,
            acker,
        }
    }

    /// Acknowledges the delivery. Later calls are no-ops.
    pub async fn ack(&mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("acked", &self.acker.is_none())
            .finish()
    }
}

/// Stream of deliveries for one subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// A publish/subscribe broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publishes `payload` on `subject`, returning once the broker has it.
    async fn publish(&self, subject: String, payload: Vec<u8>) -> Result<()>;

    /// Binds to a durable consumer and streams its deliveries.
    async fn subscribe(&self, consumer: ConsumerSpec) -> Result<DeliveryStream>;
}
