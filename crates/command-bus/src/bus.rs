//! The command bus: routes persisted messages through the broker to their
//! handlers and reports completion as events.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use message_store::{Message, MessageRepository, MessageRepositoryExt, MessageStatus};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{BusError, Result};
use crate::handler::{CommandHandler, EventHandler};
use crate::registry::Dependencies;
use crate::topic::{Topic, durable_name};
use crate::transport::{ConsumerSpec, DeliverPolicy, Delivery, DeliveryStream, Transport};

/// Where the bus publishes and which commands it consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// First subject token; one broker stream per namespace.
    pub namespace: String,
    /// Module whose commands this process handles.
    pub module: String,
    pub deliver_policy: DeliverPolicy,
}

impl BusConfig {
    pub fn new(namespace: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            module: module.into(),
            deliver_policy: DeliverPolicy::default(),
        }
    }

    pub fn with_deliver_policy(mut self, deliver_policy: DeliverPolicy) -> Self {
        self.deliver_policy = deliver_policy;
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new("orchestration", "orchestration")
    }
}

struct Subscription {
    subject: String,
    task: JoinHandle<()>,
}

/// Publishes commands and runs handlers for the ones this module owns.
///
/// Message state lives in the repository; the broker only carries a hint
/// of which message to look at. Every delivery is checked against the
/// stored status, so a redelivered or duplicated command is dropped.
pub struct CommandBus<R, T> {
    config: BusConfig,
    repository: R,
    transport: Arc<T>,
    dependencies: Dependencies,
    shutdown: watch::Sender<bool>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl<R, T> CommandBus<R, T>
where
    R: MessageRepository + Clone + 'static,
    T: Transport,
{
    pub fn new(config: BusConfig, repository: R, transport: T, dependencies: Dependencies) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            repository,
            transport: Arc::new(transport),
            dependencies,
            shutdown,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    /// Marks a persisted message PUBLISHED and sends it to its command topic.
    #[tracing::instrument(skip(self, message), fields(message_id))]
    pub async fn publish(&self, message: &Message) -> Result<()> {
        let id = message.id.ok_or(BusError::MissingIdentity)?;
        tracing::Span::current().record("message_id", tracing::field::display(id));

        self.repository
            .update_message_status(id, MessageStatus::Published, None)
            .await?;
        self.send(message).await
    }

    /// Sends a persisted message to its command topic without touching its
    /// status. Used for messages the repository already claimed as PUBLISHED.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let id = message.id.ok_or(BusError::MissingIdentity)?;
        let topic = Topic::command(
            &self.config.namespace,
            &message.module,
            &message.component,
            &message.method,
        );

        self.transport
            .publish(topic.to_string(), message.to_wire()?)
            .await?;

        metrics::counter!("bus_messages_published_total", "kind" => "command").increment(1);
        debug!(message_id = %id, %topic, "Command sent");
        Ok(())
    }

    /// Publishes a completion event for `message` on its event topic.
    pub async fn publish_event(&self, message: &Message) -> Result<()> {
        publish_completion(self.transport.as_ref(), &self.config.namespace, message).await
    }

    /// Handles `<namespace>.<module>.<component>.<method>.command`.
    #[tracing::instrument(skip(self, handler))]
    pub async fn command_subscriber<H>(&self, component: &str, method: &str, handler: H) -> Result<()>
    where
        H: CommandHandler,
    {
        let topic = Topic::command(&self.config.namespace, &self.config.module, component, method);
        let deliveries = self
            .transport
            .subscribe(ConsumerSpec {
                durable_name: topic.durable_name(),
                filter_subject: topic.to_string(),
                deliver_policy: self.config.deliver_policy,
            })
            .await?;

        let receiver = Arc::new(CommandReceiver {
            namespace: self.config.namespace.clone(),
            repository: self.repository.clone(),
            transport: Arc::clone(&self.transport),
            dependencies: self.dependencies.clone(),
            handler: Arc::new(handler),
        });

        self.spawn_consumer(topic.to_string(), deliveries, move |delivery| {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move { receiver.receive(delivery).await });
        })
        .await;

        info!(%topic, "Command subscriber started");
        Ok(())
    }

    /// Handles every event whose subject matches `pattern`.
    ///
    /// Events carry no status guard: each delivery reaches the handler.
    #[tracing::instrument(skip(self, handler))]
    pub async fn event_subscriber<H>(&self, pattern: &str, handler: H) -> Result<()>
    where
        H: EventHandler,
    {
        let deliveries = self
            .transport
            .subscribe(ConsumerSpec {
                durable_name: durable_name(pattern),
                filter_subject: pattern.to_string(),
                deliver_policy: self.config.deliver_policy,
            })
            .await?;

        let handler = Arc::new(handler);
        self.spawn_consumer(pattern.to_string(), deliveries, move |delivery| {
            let handler = Arc::clone(&handler);
            tokio::spawn(receive_event(handler, delivery));
        })
        .await;

        info!(%pattern, "Event subscriber started");
        Ok(())
    }

    /// Stops every subscription and waits for their consumer loops to end.
    ///
    /// Handlers already running are left to finish. Safe to call with no
    /// subscriptions, or more than once.
    pub async fn unsubscribe(&self) -> Result<()> {
        let subscriptions: Vec<Subscription> = self.subscriptions.lock().await.drain(..).collect();
        self.shutdown.send_replace(true);

        for subscription in subscriptions {
            if let Err(e) = subscription.task.await {
                warn!(subject = %subscription.subject, error = %e, "Subscription ended abnormally");
            }
        }

        self.shutdown.send_replace(false);
        info!("Bus unsubscribed");
        Ok(())
    }

    /// Number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    async fn spawn_consumer<F>(&self, subject: String, mut deliveries: DeliveryStream, on_delivery: F)
    where
        F: Fn(Delivery) + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let loop_subject = subject.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => on_delivery(delivery),
                        Some(Err(e)) => warn!(subject = %loop_subject, error = %e, "Delivery failed"),
                        None => {
                            debug!(subject = %loop_subject, "Delivery stream ended");
                            break;
                        }
                    }
                }
            }
            debug!(subject = %loop_subject, "Subscription stopped");
        });

        self.subscriptions.lock().await.push(Subscription { subject, task });
    }
}

/// Everything a command delivery needs, shared by the per-delivery tasks.
struct CommandReceiver<R, T> {
    namespace: String,
    repository: R,
    transport: Arc<T>,
    dependencies: Dependencies,
    handler: Arc<dyn CommandHandler>,
}

impl<R, T> CommandReceiver<R, T>
where
    R: MessageRepository + 'static,
    T: Transport,
{
    async fn receive(&self, mut delivery: Delivery) {
        // Acknowledged up front; the status guard below makes redelivery moot.
        if let Err(e) = delivery.ack().await {
            warn!(subject = %delivery.subject, error = %e, "Acknowledge failed");
        }

        if let Err(e) = self.process(&delivery.payload).await {
            error!(subject = %delivery.subject, error = %e, "Command processing abandoned");
        }
    }

    async fn process(&self, payload: &[u8]) -> Result<()> {
        let hint = Message::from_wire(payload)?;
        let id = hint.id.ok_or(BusError::MissingIdentity)?;

        // Claiming RECEIVED is the guard: concurrent copies of one command
        // race here and only the winner runs the handler.
        if !self.repository.mark_received(id).await? {
            let reason = match self.repository.get_message(id).await? {
                None => {
                    warn!(message_id = %id, "Command for unknown message discarded");
                    "unknown"
                }
                Some(message) => {
                    debug!(message_id = %id, status = ?message.status(), "Duplicate delivery discarded");
                    "duplicate"
                }
            };
            metrics::counter!("bus_deliveries_discarded_total", "reason" => reason).increment(1);
            return Ok(());
        }

        let message = self.repository.require_message(id).await?;

        let started = Instant::now();
        let failure = run_handler(Arc::clone(&self.handler), message, self.dependencies.clone()).await;
        metrics::histogram!("bus_handler_duration_seconds").record(started.elapsed().as_secs_f64());

        match &failure {
            Some(reason) => warn!(message_id = %id, error = %reason, "Command completed with error"),
            None => debug!(message_id = %id, "Command completed"),
        }

        self.repository
            .update_message_status(id, MessageStatus::Complete, failure.as_deref())
            .await?;

        let completed = self.repository.require_message(id).await?;
        publish_completion(self.transport.as_ref(), &self.namespace, &completed).await
    }
}

/// Runs the handler on its own task; returns the error text, if any.
async fn run_handler(
    handler: Arc<dyn CommandHandler>,
    message: Message,
    dependencies: Dependencies,
) -> Option<String> {
    match tokio::spawn(async move { handler.handle(message, dependencies).await }).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) if e.is_panic() => Some(format!("handler panicked: {}", panic_text(e.into_panic()))),
        Err(e) => Some(format!("handler task failed: {e}")),
    }
}

fn panic_text(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn receive_event<H: EventHandler>(handler: Arc<H>, mut delivery: Delivery) {
    if let Err(e) = delivery.ack().await {
        warn!(subject = %delivery.subject, error = %e, "Acknowledge failed");
    }

    let message = match Message::from_wire(&delivery.payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(subject = %delivery.subject, error = %e, "Malformed event discarded");
            return;
        }
    };

    if let Err(e) = handler.handle(message).await {
        error!(subject = %delivery.subject, error = %e, "Event handler failed");
    }
}

async fn publish_completion<T: Transport + ?Sized>(
    transport: &T,
    namespace: &str,
    message: &Message,
) -> Result<()> {
    let topic = Topic::event(namespace, &message.module, &message.component, &message.method);
    transport.publish(topic.to_string(), message.to_wire()?).await?;

    metrics::counter!("bus_messages_published_total", "kind" => "event").increment(1);
    debug!(message_id = ?message.id, %topic, "Completion event published");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelTransport;
    use crate::error::HandlerError;
    use message_store::InMemoryMessageRepository;

    fn bus() -> CommandBus<InMemoryMessageRepository, ChannelTransport> {
        CommandBus::new(
            BusConfig::new("test", "engine"),
            InMemoryMessageRepository::new(),
            ChannelTransport::new(),
            Dependencies::new(),
        )
    }

    #[tokio::test]
    async fn test_publish_requires_identity() {
        let bus = bus();
        let message = Message::new("engine", "runner", "start", &serde_json::json!({})).unwrap();

        assert!(matches!(bus.publish(&message).await, Err(BusError::MissingIdentity)));
        assert!(matches!(bus.send(&message).await, Err(BusError::MissingIdentity)));
        assert!(bus.transport().published_subjects().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_marks_published_and_sends() {
        let bus = bus();
        let mut message = Message::new("engine", "runner", "start", &serde_json::json!({})).unwrap();
        message.id = Some(bus.repository().create_message(&message).await.unwrap());

        bus.publish(&message).await.unwrap();

        let stored = bus.repository().require_message(message.id.unwrap()).await.unwrap();
        assert_eq!(stored.status(), Some(MessageStatus::Published));
        assert_eq!(
            bus.transport().published_subjects().await,
            vec!["test.engine.runner.start.command"]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_without_subscriptions() {
        let bus = bus();
        bus.unsubscribe().await.unwrap();
        bus.unsubscribe().await.unwrap();
        assert_eq!(bus.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_consumers() {
        let bus = bus();
        bus.command_subscriber("runner", "start", |_: Message, _: Dependencies| async {
            Ok::<_, HandlerError>(())
        })
        .await
        .unwrap();
        bus.event_subscriber("test.*.*.*.event", |_: Message| async { Ok::<_, HandlerError>(()) })
            .await
            .unwrap();
        assert_eq!(bus.subscription_count().await, 2);

        bus.unsubscribe().await.unwrap();
        assert_eq!(bus.subscription_count().await, 0);
    }

    #[test]
    fn test_panic_text() {
        assert_eq!(panic_text(Box::new("boom")), "boom");
        assert_eq!(panic_text(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_text(Box::new(7u8)), "unknown panic");
    }
}
