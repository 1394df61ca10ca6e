//! Dependency registry shared with command handlers.
//!
//! Holds two kinds of entries under a closed set of keys: singletons (a
//! value cloned out on every lookup) and methods (an async factory invoked
//! on demand). The registry is populated during wiring and then cloned into
//! every subscription; clones made before a later registration do not see it.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::collaborators::{ContainerEngine, Storage};
use crate::error::{BoxError, RegistryError};

/// Keys under which dependencies are registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKey {
    /// Database handle.
    Db,
    /// Object storage client.
    Storage,
    /// Container runtime client.
    ContainerEngine,
    /// Factory producing a compute engine handle.
    GetEngine,
}

impl DependencyKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKey::Db => "db",
            DependencyKey::Storage => "storage",
            DependencyKey::ContainerEngine => "container-engine",
            DependencyKey::GetEngine => "get-engine",
        }
    }
}

impl std::fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type Singleton = Arc<dyn Any + Send + Sync>;
type Method = Arc<dyn Fn() -> BoxFuture<'static, Result<Box<dyn Any + Send>, BoxError>> + Send + Sync>;

#[derive(Clone, Default)]
struct Entries {
    singletons: HashMap<DependencyKey, Singleton>,
    methods: HashMap<DependencyKey, Method>,
}

/// Registry of singletons and factory methods.
#[derive(Clone, Default)]
pub struct Dependencies {
    entries: Arc<Entries>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a singleton, replacing any previous value under `key`.
    pub fn add_singleton<T>(&mut self, key: DependencyKey, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.entries)
            .singletons
            .insert(key, Arc::new(value));
    }

    /// Registers an async factory, replacing any previous one under `key`.
    pub fn add_method<F, Fut, T>(&mut self, key: DependencyKey, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
        T: Send + 'static,
    {
        let method: Method = Arc::new(move || {
            let produced = factory();
            Box::pin(async move { produced.await.map(|value| Box::new(value) as Box<dyn Any + Send>) })
        });
        Arc::make_mut(&mut self.entries).methods.insert(key, method);
    }

    /// Returns a clone of the singleton under `key`, if it exists and is a `T`.
    pub fn get<T>(&self, key: DependencyKey) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entries
            .singletons
            .get(&key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Returns the singleton under `key`.
    ///
    /// # Panics
    ///
    /// Panics if nothing is registered under `key` or the value is not a `T`.
    /// Handlers call this for dependencies wiring always provides; the panic
    /// is contained by the bus and recorded as the command's error.
    pub fn must_get<T>(&self, key: DependencyKey) -> T
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.get(key) {
            Some(value) => value,
            None => panic!("dependency `{key}` is not registered as {}", type_name::<T>()),
        }
    }

    /// Invokes the factory under `key` on its own task.
    ///
    /// Factory errors and panics come back as [`RegistryError`].
    pub async fn call<T>(&self, key: DependencyKey) -> Result<T, RegistryError>
    where
        T: Send + 'static,
    {
        let method = self
            .entries
            .methods
            .get(&key)
            .cloned()
            .ok_or(RegistryError::MethodNotRegistered(key))?;

        let produced = tokio::spawn(method())
            .await
            .map_err(|e| {
                if e.is_panic() {
                    RegistryError::MethodPanicked(key)
                } else {
                    RegistryError::MethodFailed {
                        key,
                        reason: e.to_string(),
                    }
                }
            })?
            .map_err(|e| RegistryError::MethodFailed {
                key,
                reason: e.to_string(),
            })?;

        produced
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| RegistryError::TypeMismatch {
                key,
                expected: type_name::<T>(),
            })
    }

    /// Returns true if a singleton is registered under `key`.
    pub fn contains(&self, key: DependencyKey) -> bool {
        self.entries.singletons.contains_key(&key)
    }

    pub fn add_storage(&mut self, storage: impl Storage + 'static) {
        self.add_singleton::<Arc<dyn Storage>>(DependencyKey::Storage, Arc::new(storage));
    }

    pub fn add_container_engine(&mut self, engine: impl ContainerEngine + 'static) {
        self.add_singleton::<Arc<dyn ContainerEngine>>(DependencyKey::ContainerEngine, Arc::new(engine));
    }

    /// Registered storage client; panics like [`Dependencies::must_get`].
    pub fn storage(&self) -> Arc<dyn Storage> {
        self.must_get(DependencyKey::Storage)
    }

    /// Registered container engine; panics like [`Dependencies::must_get`].
    pub fn container_engine(&self) -> Arc<dyn ContainerEngine> {
        self.must_get(DependencyKey::ContainerEngine)
    }
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("singletons", &self.entries.singletons.keys().collect::<Vec<_>>())
            .field("methods", &self.entries.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}
