//! External collaborators handed to command handlers through the registry.
//!
//! The bus never calls these itself; they are what handlers reach for
//! when the work they do touches the outside world.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CollaboratorError;

/// Object storage, addressed by bucket and key.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Lists the keys in a bucket that start with `prefix`.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, CollaboratorError>;

    /// Reads an object.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CollaboratorError>;

    /// Writes an object, replacing any previous content.
    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<(), CollaboratorError>;
}

/// Container runtime used to launch workloads.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Starts a container from `image` and returns its ID.
    async fn start(&self, image: &str, name: &str) -> Result<String, CollaboratorError>;

    /// Stops a running container.
    async fn stop(&self, container_id: &str) -> Result<(), CollaboratorError>;

    /// Returns true while the container is up and passing its health check.
    async fn is_healthy(&self, container_id: &str) -> Result<bool, CollaboratorError>;
}

/// In-memory storage for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    objects: Arc<RwLock<BTreeMap<(String, String), Vec<u8>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects across all buckets.
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, CollaboratorError> {
        let objects = self.objects.read().await;
        Ok(objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CollaboratorError> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("{bucket}/{key}")))
    }

    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<(), CollaboratorError> {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), data);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ContainerState {
    running: HashMap<String, String>,
    next_id: u32,
    fail_on_start: bool,
}

/// In-memory container engine for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryContainerEngine {
    state: Arc<RwLock<ContainerState>>,
}

impl InMemoryContainerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `start` fail.
    pub async fn set_fail_on_start(&self, fail: bool) {
        self.state.write().await.fail_on_start = fail;
    }

    pub async fn running_count(&self) -> usize {
        self.state.read().await.running.len()
    }
}

#[async_trait]
impl ContainerEngine for InMemoryContainerEngine {
    async fn start(&self, image: &str, name: &str) -> Result<String, CollaboratorError> {
        let mut state = self.state.write().await;
        if state.fail_on_start {
            return Err(CollaboratorError::Unavailable(format!(
                "cannot start {name} from {image}"
            )));
        }

        state.next_id += 1;
        let id = format!("ctr-{:04}", state.next_id);
        state.running.insert(id.clone(), image.to_string());
        Ok(id)
    }

    async fn stop(&self, container_id: &str) -> Result<(), CollaboratorError> {
        self.state
            .write()
            .await
            .running
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| CollaboratorError::NotFound(container_id.to_string()))
    }

    async fn is_healthy(&self, container_id: &str) -> Result<bool, CollaboratorError> {
        Ok(self.state.read().await.running.contains_key(container_id))
    }
}
