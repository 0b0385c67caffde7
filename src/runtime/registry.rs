//! Service Registry
//!
//! Well-known services (broker, review orchestrator, pending queue) register
//! their [`Addr`] under a [`ServiceKey`] so any component can reach them
//! without threading references through every layer. A process normally uses
//! [`ServiceRegistry::global`]; tests build their own instance to stay
//! isolated from each other.

use crate::runtime::Addr;
use crate::types::TopicId;
use once_cell::sync::Lazy;
use ractor::{ActorId, Message};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Name a service is registered under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey(String);

impl ServiceKey {
    pub const BROKER: &'static str = "broker";
    pub const REVIEW_ORCHESTRATOR: &'static str = "review-orchestrator";
    pub const PENDING_QUEUE: &'static str = "pending-queue";

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn broker() -> Self {
        Self::new(Self::BROKER)
    }

    pub fn review_orchestrator() -> Self {
        Self::new(Self::REVIEW_ORCHESTRATOR)
    }

    pub fn pending_queue() -> Self {
        Self::new(Self::PENDING_QUEUE)
    }

    /// Dedicated broker for one hot topic
    pub fn topic_broker(topic: &TopicId) -> Self {
        Self(format!("{}/topic/{}", Self::BROKER, topic))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct Registration {
    actor_id: ActorId,
    addr: Box<dyn Any + Send + Sync>,
}

static GLOBAL: Lazy<ServiceRegistry> = Lazy::new(ServiceRegistry::new);

/// Service key -> actor address map
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<RwLock<HashMap<ServiceKey, Registration>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Register (or replace) the address for a key
    pub async fn register<M: Message>(&self, key: ServiceKey, addr: Addr<M>) {
        tracing::debug!("Registering service {} -> {}", key, addr.id());
        self.services.write().await.insert(
            key,
            Registration {
                actor_id: addr.id(),
                addr: Box::new(addr),
            },
        );
    }

    /// Look up a live service; stopped actors and type mismatches yield `None`
    pub async fn lookup<M: Message>(&self, key: &ServiceKey) -> Option<Addr<M>> {
        let services = self.services.read().await;
        let addr = services.get(key)?.addr.downcast_ref::<Addr<M>>()?;
        if addr.is_alive() {
            Some(addr.clone())
        } else {
            None
        }
    }

    /// Remove a key, but only if it still points at `actor_id`
    pub async fn unregister_if(&self, key: &ServiceKey, actor_id: ActorId) -> bool {
        let mut services = self.services.write().await;
        match services.get(key) {
            Some(registration) if registration.actor_id == actor_id => {
                services.remove(key);
                true
            }
            _ => false,
        }
    }

    pub async fn unregister(&self, key: &ServiceKey) -> bool {
        self.services.write().await.remove(key).is_some()
    }

    pub async fn keys(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = self.services.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
