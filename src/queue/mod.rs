//! Pending Operation Queue
//!
//! Commands issued while an agent is disconnected are stored here with an
//! idempotency key and a TTL, then replayed in order when the agent comes
//! back. See [`delivery::deliver_pending`].

pub mod actor;
pub mod client;
pub mod delivery;
pub mod operation;

pub use actor::{QueueActor, QueueArgs, QueueMessage};
pub use client::QueueClient;
pub use delivery::deliver_pending;
pub use operation::{
    DeliveryReport, EnqueueRequest, OperationPayload, OperationStatus, PendingOperation,
};
