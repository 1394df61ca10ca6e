//! In-process transport using tokio broadcast channels.
//!
//! Every subscription receives every publish and filters by subject on its
//! own side. Nothing is retained: a subscription only sees what is published
//! after it was bound, whatever its deliver policy. Published subjects are
//! recorded so tests can assert on traffic.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

use crate::error::Result;
use crate::topic::subject_matches;
use crate::transport::{ConsumerSpec, Delivery, DeliveryStream, Transport};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

type Envelope = Arc<(String, Vec<u8>)>;

/// Broadcast-channel [`Transport`] for standalone mode and tests.
#[derive(Clone)]
pub struct ChannelTransport {
    sender: broadcast::Sender<Envelope>,
    published: Arc<Mutex<Vec<String>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subjects published so far, oldest first.
    pub async fn published_subjects(&self) -> Vec<String> {
        self.published.lock().await.clone()
    }

    /// Number of publishes whose subject matches `pattern`.
    pub async fn published_count(&self, pattern: &str) -> usize {
        self.published
            .lock()
            .await
            .iter()
            .filter(|subject| subject_matches(pattern, subject))
            .count()
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn publish(&self, subject: String, payload: Vec<u8>) -> Result<()> {
        self.published.lock().await.push(subject.clone());

        // No receivers is not an error; nothing is listening yet.
        match self.sender.send(Arc::new((subject.clone(), payload))) {
            Ok(receivers) => debug!(%subject, receivers, "Published via channel"),
            Err(_) => debug!(%subject, "Published via channel with no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(&self, spec: ConsumerSpec) -> Result<DeliveryStream> {
        let receiver = self.sender.subscribe();
        let filter = spec.filter_subject;

        let deliveries = futures_util::stream::unfold(
            (receiver, filter),
            |(mut receiver, filter)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(envelope) => {
                            let (subject, payload) = envelope.as_ref();
                            if !subject_matches(&filter, subject) {
                                continue;
                            }
                            let delivery = Delivery::new(subject.clone(), payload.clone(), None);
                            return Some((Ok(delivery), (receiver, filter)));
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, %filter, "Channel subscriber lagged, skipped messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(Box::pin(deliveries))
    }
}
