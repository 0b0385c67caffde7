//! Broker client
//!
//! Resolves the broker through the service registry on every call, so it
//! keeps working across broker restarts. Topic operations go to the topic's
//! dedicated broker when one is registered, otherwise to the default broker.
//! Read-only queries (replay, offsets, inbox, search) go straight to storage.

use super::model::{
    Agent, AgentProfile, InboxEntry, InboxFilter, Message, PublishReceipt, PublishRequest,
    RecipientState, Topic, TopicSpec,
};
use super::replay::ReplayStream;
use super::subscriber::Session;
use super::BrokerMessage;
use crate::config::BrokerSettings;
use crate::error::{HermesError, Result};
use crate::runtime::registry::{ServiceKey, ServiceRegistry};
use crate::runtime::Addr;
use crate::storage::{broker as db, Store};
use crate::types::{AgentId, LogOffset, MessageId, Priority, TopicId};
use ractor::RpcReplyPort;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

#[derive(Clone)]
pub struct BrokerClient {
    registry: ServiceRegistry,
    store: Store,
    settings: BrokerSettings,
    timeout: Duration,
}

impl BrokerClient {
    pub fn new(
        registry: ServiceRegistry,
        store: Store,
        settings: BrokerSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            settings,
            timeout,
        }
    }

    pub fn long_poll_limit(&self) -> Duration {
        Duration::from_secs(self.settings.long_poll_max_secs)
    }

    async fn default_broker(&self) -> Result<Addr<BrokerMessage>> {
        self.registry
            .lookup(&ServiceKey::broker())
            .await
            .ok_or_else(|| HermesError::ActorUnavailable(ServiceKey::BROKER.to_string()))
    }

    async fn broker_for(&self, topic: &TopicId) -> Result<Addr<BrokerMessage>> {
        match self.registry.lookup(&ServiceKey::topic_broker(topic)).await {
            Some(addr) => Ok(addr),
            None => self.default_broker().await,
        }
    }

    /// Dedicated brokers with the topic each one owns
    async fn topic_brokers(&self) -> Vec<(TopicId, Addr<BrokerMessage>)> {
        let prefix = format!("{}/topic/", ServiceKey::BROKER);
        let mut brokers = Vec::new();
        for key in self.registry.keys().await {
            let Some(topic) = key.as_str().strip_prefix(&prefix) else {
                continue;
            };
            if let Some(addr) = self.registry.lookup(&key).await {
                brokers.push((TopicId::new(topic), addr));
            }
        }
        brokers
    }

    async fn all_brokers(&self) -> Result<Vec<Addr<BrokerMessage>>> {
        let mut brokers = vec![self.default_broker().await?];
        brokers.extend(self.topic_brokers().await.into_iter().map(|(_, addr)| addr));
        Ok(brokers)
    }

    async fn call<T, F>(&self, broker: Addr<BrokerMessage>, build: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<Result<T>>) -> BrokerMessage,
    {
        broker.request(build, self.timeout).await?
    }

    pub async fn register_agent(&self, profile: AgentProfile) -> Result<Agent> {
        let broker = self.default_broker().await?;
        self.call(broker, |reply| BrokerMessage::RegisterAgent { profile, reply })
            .await
    }

    pub async fn create_topic(&self, spec: TopicSpec) -> Result<Topic> {
        let broker = self.broker_for(&spec.name).await?;
        self.call(broker, |reply| BrokerMessage::CreateTopic { spec, reply })
            .await
    }

    /// Idempotent; returns true when the subscription is new
    pub async fn subscribe(&self, agent: &AgentId, topic: &TopicId) -> Result<bool> {
        let broker = self.broker_for(topic).await?;
        let (agent, topic) = (agent.clone(), topic.clone());
        self.call(broker, |reply| BrokerMessage::Subscribe {
            agent,
            topic,
            reply,
        })
        .await
    }

    /// Idempotent; returns true when a subscription was removed
    pub async fn unsubscribe(&self, agent: &AgentId, topic: &TopicId) -> Result<bool> {
        let broker = self.broker_for(topic).await?;
        let (agent, topic) = (agent.clone(), topic.clone());
        self.call(broker, |reply| BrokerMessage::Unsubscribe {
            agent,
            topic,
            reply,
        })
        .await
    }

    pub async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt> {
        let broker = self.broker_for(&request.topic).await?;
        self.call(broker, |reply| BrokerMessage::Publish {
            request,
            reply: Some(reply),
        })
        .await
    }

    /// Fire-and-forget publish; failures are only logged by the broker
    pub async fn publish_detached(&self, request: PublishRequest) -> Result<()> {
        let broker = self.broker_for(&request.topic).await?;
        broker.send(BrokerMessage::Publish {
            request,
            reply: None,
        })
    }

    /// 1:1 mail: one message in each recipient's inbox, pushed directly
    pub async fn send_mail(
        &self,
        sender: &AgentId,
        recipients: &[AgentId],
        subject: &str,
        body: &str,
        thread_id: Option<&str>,
        priority: Priority,
        idempotency_key: Option<&str>,
    ) -> Result<Vec<PublishReceipt>> {
        if recipients.is_empty() {
            return Err(HermesError::InvalidRequest(
                "mail needs at least one recipient".to_string(),
            ));
        }

        let mut receipts = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let mut request =
                PublishRequest::new(TopicId::inbox(recipient), sender.clone(), subject, body)
                    .to([recipient.clone()])
                    .with_priority(priority);
            if let Some(thread_id) = thread_id {
                request = request.in_thread(thread_id);
            }
            if let Some(key) = idempotency_key {
                request = request.with_idempotency_key(format!("{}:{}", key, recipient));
            }
            receipts.push(self.publish(request).await?);
        }
        Ok(receipts)
    }

    /// Push a persisted message to one agent's live session, if any
    pub async fn notify_agent(&self, agent: &AgentId, message: Message) -> Result<()> {
        let broker = self.broker_for(&message.topic).await?;
        broker.send(BrokerMessage::NotifyAgent {
            agent: agent.clone(),
            message,
        })
    }

    /// Push a persisted message to the listed agents that are connected
    pub async fn notify_topic(
        &self,
        topic: &TopicId,
        agents: Vec<AgentId>,
        message: Message,
    ) -> Result<()> {
        let broker = self.broker_for(topic).await?;
        broker.send(BrokerMessage::NotifyTopic {
            topic: topic.clone(),
            agents,
            message,
        })
    }

    /// Messages after `from` in `topic` that `agent` may see, fetched lazily.
    ///
    /// Broadcast topics replay the whole log; direct and queue topics only the
    /// messages addressed to `agent`.
    pub async fn replay(
        &self,
        agent: &AgentId,
        topic: &TopicId,
        from: LogOffset,
    ) -> Result<ReplayStream> {
        let (a, t) = (agent.clone(), topic.clone());
        let (known_agent, found) = self
            .store
            .read(move |conn| Ok((db::get_agent(conn, &a)?, db::get_topic(conn, &t)?)))
            .await?;

        if known_agent.is_none() {
            return Err(HermesError::UnknownAgent(agent.to_string()));
        }
        let Some(found) = found else {
            return Err(HermesError::UnknownTopic(topic.to_string()));
        };

        let recipient = found.kind.requires_targets().then(|| agent.clone());
        Ok(ReplayStream::open(
            self.store.clone(),
            found.name,
            recipient,
            from,
            found.last_offset,
            self.settings.replay_page_size,
        ))
    }

    pub async fn replay_all(
        &self,
        agent: &AgentId,
        topic: &TopicId,
        from: LogOffset,
    ) -> Result<Vec<Message>> {
        let mut stream = self.replay(agent, topic, from).await?;
        let mut messages = Vec::new();
        while let Some(message) = stream.next().await {
            messages.push(message?);
        }
        Ok(messages)
    }

    /// Monotonic; a lower offset leaves the stored value unchanged
    pub async fn advance_offset(
        &self,
        agent: &AgentId,
        topic: &TopicId,
        offset: LogOffset,
    ) -> Result<LogOffset> {
        let broker = self.broker_for(topic).await?;
        let (agent, topic) = (agent.clone(), topic.clone());
        self.call(broker, |reply| BrokerMessage::AdvanceOffset {
            agent,
            topic,
            offset,
            reply,
        })
        .await
    }

    pub async fn consumer_offset(&self, agent: &AgentId, topic: &TopicId) -> Result<LogOffset> {
        let (agent, topic) = (agent.clone(), topic.clone());
        self.store
            .read(move |conn| db::consumer_offset(conn, &agent, &topic))
            .await
    }

    pub async fn set_recipient_state(
        &self,
        message: MessageId,
        agent: &AgentId,
        state: RecipientState,
    ) -> Result<()> {
        let broker = self.default_broker().await?;
        let agent = agent.clone();
        self.call(broker, |reply| BrokerMessage::SetRecipientState {
            message,
            agent,
            state,
            reply,
        })
        .await
    }

    pub async fn acknowledge(&self, message: MessageId, agent: &AgentId) -> Result<()> {
        let broker = self.default_broker().await?;
        let agent = agent.clone();
        self.call(broker, |reply| BrokerMessage::Acknowledge {
            message,
            agent,
            reply,
        })
        .await
    }

    pub async fn inbox(&self, agent: &AgentId, filter: InboxFilter) -> Result<Vec<InboxEntry>> {
        let agent = agent.clone();
        self.store
            .read(move |conn| db::inbox(conn, &agent, &filter))
            .await
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<Message>> {
        let query = query.to_string();
        self.store
            .read(move |conn| db::search_messages(conn, &query, limit))
            .await
    }

    pub async fn topic(&self, name: &TopicId) -> Result<Topic> {
        let lookup = name.clone();
        self.store
            .read(move |conn| db::get_topic(conn, &lookup))
            .await?
            .ok_or_else(|| HermesError::UnknownTopic(name.to_string()))
    }

    pub async fn topics(&self) -> Result<Vec<Topic>> {
        self.store.read(db::list_topics).await
    }

    pub async fn agents(&self) -> Result<Vec<Agent>> {
        self.store.read(db::list_agents).await
    }

    pub async fn subscriptions(&self, agent: &AgentId) -> Result<Vec<TopicId>> {
        let agent = agent.clone();
        self.store
            .read(move |conn| db::subscriptions_for_agent(conn, &agent))
            .await
    }

    /// Open a live session attached to every broker
    pub async fn connect(&self, agent: &AgentId) -> Result<Session> {
        let (outbound, receiver) = mpsc::channel(self.settings.session_buffer);
        let mut attachments = Vec::new();

        for broker in self.all_brokers().await? {
            let (a, tx) = (agent.clone(), outbound.clone());
            let session = self
                .call(broker.clone(), |reply| BrokerMessage::Connect {
                    agent: a,
                    outbound: tx,
                    reply,
                })
                .await?;
            attachments.push((broker, session));
        }

        Ok(Session::new(agent.clone(), attachments, receiver, self.clone()))
    }

    pub async fn connected_agents(&self) -> Result<Vec<AgentId>> {
        let broker = self.default_broker().await?;
        broker
            .request(BrokerMessage::ConnectedAgents, self.timeout)
            .await
    }

    /// Each broker prunes the topics it owns
    pub async fn prune_retention(&self) -> Result<usize> {
        let dedicated = self.topic_brokers().await;
        let skip: Vec<TopicId> = dedicated.iter().map(|(topic, _)| topic.clone()).collect();

        let default = self.default_broker().await?;
        let mut removed = self
            .call(default, |reply| BrokerMessage::PruneRetention { skip, reply })
            .await?;
        for (_, broker) in dedicated {
            removed += self
                .call(broker, |reply| BrokerMessage::PruneRetention {
                    skip: Vec::new(),
                    reply,
                })
                .await?;
        }
        Ok(removed)
    }
}
