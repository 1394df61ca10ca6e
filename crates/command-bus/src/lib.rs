//! Command bus for the saga orchestration engine.
//!
//! Commands are persisted in the message store first and only then put on
//! the broker. A subscriber reloads each delivery from the store, runs its
//! handler with the [`Dependencies`] registry, records the outcome and
//! publishes a completion event that the orchestration runner listens to.
//!
//! # Example
//!
//! ```ignore
//! let bus = CommandBus::new(config, repository, transport, dependencies);
//! bus.command_subscriber("quotes", "fetch", |message: Message, deps: Dependencies| async move {
//!     let storage = deps.storage();
//!     storage.put("quotes", "latest", message.raw_payload().to_vec()).await?;
//!     Ok(())
//! })
//! .await?;
//! ```

pub mod bus;
pub mod channel;
pub mod collaborators;
pub mod error;
pub mod handler;
pub mod nats;
pub mod registry;
pub mod topic;
pub mod transport;

pub use bus::{BusConfig, CommandBus};
pub use channel::ChannelTransport;
pub use collaborators::{ContainerEngine, InMemoryContainerEngine, InMemoryStorage, Storage};
pub use error::{BoxError, BusError, CollaboratorError, HandlerError, RegistryError, Result};
pub use handler::{CommandHandler, EventHandler};
pub use nats::NatsTransport;
pub use registry::{Dependencies, DependencyKey};
pub use topic::{Topic, TopicKind, subject_matches};
pub use transport::{ConsumerSpec, DeliverPolicy, Delivery, DeliveryStream, Transport};
