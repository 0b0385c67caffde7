//! Mailbox accounting
//!
//! ractor mailboxes are unbounded. A [`MailboxGauge`] sits in front of one
//! actor's mailbox and counts messages that have been sent but not yet
//! handled, so senders can be refused (or made to wait) once the configured
//! bound is reached.

use crate::error::{HermesError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Bound and monitoring threshold for one mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxPolicy {
    /// Hard bound; `None` never rejects
    pub capacity: Option<usize>,

    /// Depth at which a warning is logged
    pub warn_depth: usize,
}

impl Default for MailboxPolicy {
    fn default() -> Self {
        Self {
            capacity: None,
            warn_depth: 1024,
        }
    }
}

impl MailboxPolicy {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            warn_depth: capacity.saturating_mul(3) / 4,
        }
    }
}

struct GaugeInner {
    label: String,
    policy: MailboxPolicy,
    depth: AtomicUsize,
    high_water: AtomicUsize,
    warned: AtomicBool,
    drained: Notify,
}

/// Shared depth counter for one actor's mailbox
#[derive(Clone)]
pub struct MailboxGauge {
    inner: Arc<GaugeInner>,
}

impl std::fmt::Debug for MailboxGauge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxGauge")
            .field("label", &self.inner.label)
            .field("depth", &self.depth())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl MailboxGauge {
    pub fn new(label: impl Into<String>, policy: MailboxPolicy) -> Self {
        Self {
            inner: Arc::new(GaugeInner {
                label: label.into(),
                policy,
                depth: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                warned: AtomicBool::new(false),
                drained: Notify::new(),
            }),
        }
    }

    /// Claim a slot, failing immediately when the mailbox is at capacity
    pub fn try_reserve(&self) -> Result<usize> {
        let capacity = self.inner.policy.capacity;
        let reserved = self
            .inner
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| match capacity {
                Some(cap) if depth >= cap => None,
                _ => Some(depth + 1),
            });

        match reserved {
            Ok(previous) => {
                let depth = previous + 1;
                self.inner.high_water.fetch_max(depth, Ordering::Relaxed);
                if depth >= self.inner.policy.warn_depth
                    && !self.inner.warned.swap(true, Ordering::Relaxed)
                {
                    tracing::warn!(
                        "Mailbox for {} reached {} queued messages",
                        self.inner.label,
                        depth
                    );
                }
                Ok(depth)
            }
            Err(depth) => Err(HermesError::MailboxFull {
                actor: self.inner.label.clone(),
                depth,
            }),
        }
    }

    /// Claim a slot, waiting for the actor to make room
    pub async fn reserve(&self) -> usize {
        loop {
            let notified = self.inner.drained.notified();
            if let Ok(depth) = self.try_reserve() {
                return depth;
            }
            notified.await;
        }
    }

    /// Give a slot back: the message was handled or never enqueued
    pub fn release(&self) {
        let previous = self
            .inner
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                Some(depth.saturating_sub(1))
            })
            .unwrap_or(0);

        if previous <= self.inner.policy.warn_depth / 2 {
            self.inner.warned.store(false, Ordering::Relaxed);
        }
        self.inner.drained.notify_one();
    }

    pub fn depth(&self) -> usize {
        self.inner.depth.load(Ordering::Acquire)
    }

    pub fn high_water(&self) -> usize {
        self.inner.high_water.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn policy(&self) -> MailboxPolicy {
        self.inner.policy
    }
}
