//! Supervision
//!
//! Service actors are linked to a [`RootSupervisor`] which restarts them on
//! failure according to their [`RestartPolicy`] and re-registers the new
//! address. A graceful stop is never restarted.
//!
//! Reviewer sub-actors are not supervised here: the review orchestrator links
//! them to itself and applies stop-on-failure semantics directly.

use crate::error::Result;
use crate::runtime::registry::ServiceKey;
use ractor::{Actor, ActorCell, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What to do when a supervised actor fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    /// Restart, unless `max_restarts` restarts already happened within `window`
    Restart { max_restarts: usize, window: Duration },
    /// Leave it stopped
    Stop,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::Restart {
            max_restarts: 3,
            window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window restart counter
#[derive(Debug, Default)]
pub struct RestartTracker {
    history: VecDeque<Instant>,
}

impl RestartTracker {
    /// Record a failure at `now` and decide whether a restart is allowed
    pub fn permit(&mut self, policy: &RestartPolicy, now: Instant) -> bool {
        match policy {
            RestartPolicy::Stop => false,
            RestartPolicy::Restart {
                max_restarts,
                window,
            } => {
                while let Some(oldest) = self.history.front() {
                    if now.duration_since(*oldest) > *window {
                        self.history.pop_front();
                    } else {
                        break;
                    }
                }
                if self.history.len() >= *max_restarts {
                    return false;
                }
                self.history.push_back(now);
                true
            }
        }
    }

    pub fn restarts(&self) -> usize {
        self.history.len()
    }
}

pub type StartFuture = Pin<Box<dyn Future<Output = Result<ActorCell>> + Send>>;

/// Spawns the child linked to the given supervisor cell and registers it
pub type StartFn = Arc<dyn Fn(ActorCell) -> StartFuture + Send + Sync>;

/// How to (re)start one supervised service
#[derive(Clone)]
pub struct ChildSpec {
    pub key: ServiceKey,
    pub policy: RestartPolicy,
    pub start: StartFn,
}

impl ChildSpec {
    pub fn new<F, Fut>(key: ServiceKey, policy: RestartPolicy, start: F) -> Self
    where
        F: Fn(ActorCell) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActorCell>> + Send + 'static,
    {
        Self {
            key,
            policy,
            start: Arc::new(move |supervisor| Box::pin(start(supervisor))),
        }
    }
}

/// Snapshot of one supervised child
#[derive(Debug, Clone)]
pub struct ChildStatus {
    pub key: ServiceKey,
    pub actor_id: ActorId,
    pub restarts: usize,
}

pub enum SupervisorMessage {
    /// Start a child and supervise it
    StartChild {
        spec: ChildSpec,
        reply: RpcReplyPort<Result<ActorId>>,
    },

    /// List supervised children
    Children(RpcReplyPort<Vec<ChildStatus>>),
}

struct SupervisedChild {
    spec: ChildSpec,
    tracker: RestartTracker,
}

pub struct RootSupervisorState {
    children: HashMap<ActorId, SupervisedChild>,
}

/// Top of the supervision tree
pub struct RootSupervisor;

impl RootSupervisor {
    async fn start_child(
        myself: &ActorRef<SupervisorMessage>,
        state: &mut RootSupervisorState,
        spec: ChildSpec,
        tracker: RestartTracker,
    ) -> Result<ActorId> {
        let cell = (spec.start)(myself.get_cell()).await?;
        let id = cell.get_id();
        tracing::info!("Supervising {} as {}", spec.key, id);
        state
            .children
            .insert(id, SupervisedChild { spec, tracker });
        Ok(id)
    }
}

#[ractor::async_trait]
impl Actor for RootSupervisor {
    type Msg = SupervisorMessage;
    type State = RootSupervisorState;
    type Arguments = ();

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        _args: Self::Arguments,
    ) -> std::result::Result<Self::State, ActorProcessingErr> {
        tracing::info!("Root supervisor starting");
        Ok(RootSupervisorState {
            children: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::StartChild { spec, reply } => {
                let result =
                    Self::start_child(&myself, state, spec, RestartTracker::default()).await;
                let _ = reply.send(result);
            }
            SupervisorMessage::Children(reply) => {
                let mut children: Vec<ChildStatus> = state
                    .children
                    .iter()
                    .map(|(id, child)| ChildStatus {
                        key: child.spec.key.clone(),
                        actor_id: *id,
                        restarts: child.tracker.restarts(),
                    })
                    .collect();
                children.sort_by(|a, b| a.key.cmp(&b.key));
                let _ = reply.send(children);
            }
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        event: SupervisionEvent,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        match event {
            SupervisionEvent::ActorFailed(cell, err) => {
                let Some(mut child) = state.children.remove(&cell.get_id()) else {
                    return Ok(());
                };
                tracing::warn!("Service {} failed: {}", child.spec.key, err);

                if child.tracker.permit(&child.spec.policy, Instant::now()) {
                    let spec = child.spec.clone();
                    if let Err(e) = Self::start_child(&myself, state, spec, child.tracker).await {
                        tracing::error!("Failed to restart {}: {}", child.spec.key, e);
                    }
                } else {
                    tracing::error!(
                        "Service {} exceeded its restart budget, leaving it stopped",
                        child.spec.key
                    );
                }
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                if let Some(child) = state.children.remove(&cell.get_id()) {
                    tracing::info!("Service {} stopped: {:?}", child.spec.key, reason);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        tracing::info!("Root supervisor stopped");
        Ok(())
    }
}
