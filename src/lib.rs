//! Hermes - Actor-Based Coordination Core for Multi-Agent Systems
//!
//! Hermes lets independent agents talk to each other and review each other's
//! work without sharing mutable state:
//! - Durable topic log with per-topic offsets and replay-on-reconnect
//! - Structured code review through a closed state machine, carried out by
//!   sandboxed reviewer sub-actors
//! - A pending operation queue that replays commands issued while offline
//!
//! # Architecture
//!
//! The system is organized into several layers:
//! - **Runtime**: addresses, monitored mailboxes, service registry and supervision
//! - **Storage**: a single pooled SQLite database, written only by owning actors
//! - **Services**: broker, review orchestrator and pending queue actors
//! - **Engine**: wires the services together under one supervisor
//!
//! # Example
//!
//! ```ignore
//! use hermes_core::{CoordinationEngine, HermesConfig, ServiceRegistry, Store};
//! use hermes_core::broker::{AgentProfile, PublishRequest, TopicSpec};
//!
//! #[tokio::main]
//! async fn main() -> hermes_core::Result<()> {
//!     let config = HermesConfig::default();
//!     let store = Store::open(&config.storage).await?;
//!     let engine = CoordinationEngine::start(config, store, ServiceRegistry::global()).await?;
//!
//!     let broker = engine.broker();
//!     broker.register_agent(AgentProfile::named("alice")).await?;
//!     broker.create_topic(TopicSpec::broadcast("builds")).await?;
//!     broker
//!         .publish(PublishRequest::new("builds", "alice", "build 42", "green"))
//!         .await?;
//!
//!     engine.stop().await
//! }
//! ```

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod queue;
pub mod review;
pub mod runtime;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use broker::{BrokerClient, Message, PublishReceipt, PublishRequest, Session, TopicSpec};
pub use config::HermesConfig;
pub use engine::{CoordinationEngine, SweepReport};
pub use error::{ErrorKind, HermesError, Result};
pub use queue::{EnqueueRequest, OperationPayload, OperationStatus, PendingOperation, QueueClient};
pub use review::{CreateReviewRequest, ReviewClient, ReviewState, ReviewType};
pub use runtime::registry::ServiceRegistry;
pub use storage::Store;
pub use types::{AgentId, IssueId, LogOffset, OperationId, Priority, ReviewId, TopicId};
