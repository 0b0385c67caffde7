//! Coordination Engine
//!
//! Wires the services together: a root supervisor owning the broker, the
//! review orchestrator and the pending operation queue, each registered in
//! the service registry, plus a background sweep that expires queued
//! operations and prunes messages past retention.

use crate::broker::{BrokerActor, BrokerArgs, BrokerClient, BrokerMessage, Session};
use crate::config::HermesConfig;
use crate::error::{HermesError, Result};
use crate::queue::{
    deliver_pending, DeliveryReport, QueueActor, QueueArgs, QueueClient, QueueMessage,
};
use crate::review::{
    CommandReviewModel, DiffSource, GitCliDiffSource, OrchestratorActor, OrchestratorArgs,
    OrchestratorMessage, ReviewClient, ReviewModel,
};
use crate::runtime::mailbox::MailboxGauge;
use crate::runtime::registry::{ServiceKey, ServiceRegistry};
use crate::runtime::supervision::{ChildSpec, RootSupervisor, SupervisorMessage};
use crate::runtime::{spawn, spawn_linked, spawn_with_gauge, Addr};
use crate::storage::Store;
use crate::types::{AgentId, TopicId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one expiry and retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_operations: usize,
    pub pruned_messages: usize,
}

/// Run one sweep against the registered services
pub async fn sweep_once(queue: &QueueClient, broker: &BrokerClient) -> Result<SweepReport> {
    let expired_operations = queue.purge_expired().await?;
    let pruned_messages = broker.prune_retention().await?;
    Ok(SweepReport {
        expired_operations,
        pruned_messages,
    })
}

/// Handle to the periodic sweep task
pub struct SweepTaskHandle {
    shutdown_tx: broadcast::Sender<()>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SweepTaskHandle {
    pub fn spawn(queue: QueueClient, broker: BrokerClient, period: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task_handle = tokio::spawn(run_sweep_loop(queue, broker, period, shutdown_rx));

        Self {
            shutdown_tx,
            task_handle: Some(task_handle),
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.task_handle.take() {
            handle
                .await
                .map_err(|e| HermesError::Other(format!("Failed to stop sweep task: {}", e)))?;
        }

        tracing::info!("Sweep task stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

async fn run_sweep_loop(
    queue: QueueClient,
    broker: BrokerClient,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut timer = interval(period);
    tracing::info!("Starting sweep task with {:?} interval", period);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match sweep_once(&queue, &broker).await {
                    Ok(report) if report != SweepReport::default() => {
                        tracing::info!(
                            "Sweep expired {} operations and pruned {} messages",
                            report.expired_operations,
                            report.pruned_messages
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Sweep failed: {}", e),
                }
            }

            _ = shutdown_rx.recv() => {
                tracing::info!("Sweep task received shutdown signal");
                break;
            }
        }
    }
}

/// Running coordination core
pub struct CoordinationEngine {
    config: HermesConfig,
    store: Store,
    registry: ServiceRegistry,
    supervisor: Addr<SupervisorMessage>,
    broker: BrokerClient,
    reviews: ReviewClient,
    queue: QueueClient,
    sweeper: Option<SweepTaskHandle>,
}

impl CoordinationEngine {
    /// Start with the configured review command and git diffs
    pub async fn start(
        config: HermesConfig,
        store: Store,
        registry: ServiceRegistry,
    ) -> Result<Self> {
        let model = Arc::new(CommandReviewModel::new(config.review.command.clone())?);
        Self::start_with_reviewer(config, store, registry, model, Arc::new(GitCliDiffSource))
            .await
    }

    /// Start with an explicit review model and diff source
    pub async fn start_with_reviewer(
        config: HermesConfig,
        store: Store,
        registry: ServiceRegistry,
        model: Arc<dyn ReviewModel>,
        diff_source: Arc<dyn DiffSource>,
    ) -> Result<Self> {
        config.validate()?;
        let timeout = config.runtime.request_timeout();
        let mailbox = config.runtime.mailbox_policy();

        let (supervisor, _handle) = spawn(None, RootSupervisor, (), mailbox).await?;

        let broker = BrokerClient::new(
            registry.clone(),
            store.clone(),
            config.broker.clone(),
            timeout,
        );
        let reviews = ReviewClient::new(registry.clone(), store.clone(), timeout);
        let queue = QueueClient::new(registry.clone(), store.clone(), timeout);

        let mut engine = Self {
            config,
            store,
            registry,
            supervisor,
            broker,
            reviews,
            queue,
            sweeper: None,
        };

        engine.supervise(engine.broker_spec(None)).await?;
        engine
            .supervise(engine.orchestrator_spec(model, diff_source))
            .await?;
        engine.supervise(engine.queue_spec()).await?;

        engine.sweeper = Some(SweepTaskHandle::spawn(
            engine.queue.clone(),
            engine.broker.clone(),
            Duration::from_secs(engine.config.queue.sweep_interval_secs),
        ));

        tracing::info!("Coordination engine started");
        Ok(engine)
    }

    async fn supervise(&self, spec: ChildSpec) -> Result<()> {
        let key = spec.key.clone();
        self.supervisor
            .request(
                |reply| SupervisorMessage::StartChild { spec, reply },
                self.config.runtime.request_timeout(),
            )
            .await??;
        tracing::debug!("Started service {}", key);
        Ok(())
    }

    fn broker_spec(&self, scope: Option<TopicId>) -> ChildSpec {
        let key = match &scope {
            Some(topic) => ServiceKey::topic_broker(topic),
            None => ServiceKey::broker(),
        };
        let args = BrokerArgs {
            store: self.store.clone(),
            settings: self.config.broker.clone(),
            session_mailbox: self.config.runtime.mailbox_policy(),
            scope,
        };
        let registry = self.registry.clone();
        let mailbox = self.config.runtime.mailbox_policy();
        let service = key.clone();

        ChildSpec::new(key, self.config.runtime.restart_policy(), move |supervisor| {
            let (args, registry, service) = (args.clone(), registry.clone(), service.clone());
            async move {
                let (addr, _handle) =
                    spawn_linked(None, BrokerActor, args, mailbox, supervisor).await?;
                registry.register(service, addr.clone()).await;
                Ok(addr.cell())
            }
        })
    }

    fn orchestrator_spec(
        &self,
        model: Arc<dyn ReviewModel>,
        diff_source: Arc<dyn DiffSource>,
    ) -> ChildSpec {
        let store = self.store.clone();
        let settings = self.config.review.clone();
        let notifier = settings.notify_requester.then(|| self.broker.clone());
        let registry = self.registry.clone();
        let mailbox = self.config.runtime.mailbox_policy();

        ChildSpec::new(
            ServiceKey::review_orchestrator(),
            self.config.runtime.restart_policy(),
            move |supervisor| {
                let gauge = MailboxGauge::new(ServiceKey::REVIEW_ORCHESTRATOR, mailbox);
                let args = OrchestratorArgs {
                    store: store.clone(),
                    settings: settings.clone(),
                    model: model.clone(),
                    diff_source: diff_source.clone(),
                    notifier: notifier.clone(),
                    gauge: gauge.clone(),
                    reviewer_mailbox: mailbox,
                };
                let registry = registry.clone();
                async move {
                    let (addr, _handle) =
                        spawn_with_gauge(None, OrchestratorActor, args, gauge, Some(supervisor))
                            .await?;
                    registry
                        .register(ServiceKey::review_orchestrator(), addr.clone())
                        .await;
                    Ok(addr.cell())
                }
            },
        )
    }

    fn queue_spec(&self) -> ChildSpec {
        let args = QueueArgs {
            store: self.store.clone(),
            settings: self.config.queue.clone(),
        };
        let registry = self.registry.clone();
        let mailbox = self.config.runtime.mailbox_policy();

        ChildSpec::new(
            ServiceKey::pending_queue(),
            self.config.runtime.restart_policy(),
            move |supervisor| {
                let (args, registry) = (args.clone(), registry.clone());
                async move {
                    let (addr, _handle) =
                        spawn_linked(None, QueueActor, args, mailbox, supervisor).await?;
                    registry
                        .register(ServiceKey::pending_queue(), addr.clone())
                        .await;
                    Ok(addr.cell())
                }
            },
        )
    }

    /// Give a hot topic its own broker; later calls for the topic are no-ops
    pub async fn spawn_topic_broker(&self, topic: &TopicId) -> Result<()> {
        let key = ServiceKey::topic_broker(topic);
        if self.registry.lookup::<BrokerMessage>(&key).await.is_some() {
            return Ok(());
        }
        // Fails with UnknownTopic before a broker is dedicated to nothing
        self.broker.topic(topic).await?;
        self.supervise(self.broker_spec(Some(topic.clone()))).await?;
        tracing::info!("Dedicated broker serving {}", topic);
        Ok(())
    }

    /// Replay the agent's queued operations, then open a live session
    pub async fn reconnect(&self, agent: &AgentId) -> Result<(DeliveryReport, Session)> {
        let report = deliver_pending(&self.queue, &self.broker, &self.reviews, agent).await?;
        let session = self.broker.connect(agent).await?;
        Ok((report, session))
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        sweep_once(&self.queue, &self.broker).await
    }

    pub fn broker(&self) -> &BrokerClient {
        &self.broker
    }

    pub fn reviews(&self) -> &ReviewClient {
        &self.reviews
    }

    pub fn queue(&self) -> &QueueClient {
        &self.queue
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &HermesConfig {
        &self.config
    }

    async fn stop_service<M: ractor::Message>(&self, key: ServiceKey) {
        if let Some(addr) = self.registry.lookup::<M>(&key).await {
            if let Err(e) = addr
                .stop_and_wait(Some("engine stopping".to_string()), STOP_TIMEOUT)
                .await
            {
                tracing::warn!("Service {} did not stop cleanly: {}", key, e);
            }
            self.registry.unregister_if(&key, addr.id()).await;
        }
    }

    /// Stop the sweep task and every service, queue first and broker last
    pub async fn stop(mut self) -> Result<()> {
        if let Some(mut sweeper) = self.sweeper.take() {
            sweeper.stop().await?;
        }

        self.stop_service::<QueueMessage>(ServiceKey::pending_queue())
            .await;
        self.stop_service::<OrchestratorMessage>(ServiceKey::review_orchestrator())
            .await;

        let prefix = format!("{}/topic/", ServiceKey::BROKER);
        for key in self.registry.keys().await {
            if key.as_str().starts_with(&prefix) {
                self.stop_service::<BrokerMessage>(key).await;
            }
        }
        self.stop_service::<BrokerMessage>(ServiceKey::broker()).await;

        self.supervisor
            .stop_and_wait(Some("engine stopped".to_string()), STOP_TIMEOUT)
            .await?;
        tracing::info!("Coordination engine stopped");
        Ok(())
    }
}
