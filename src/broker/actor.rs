//! Broker Actor
//!
//! Responsibilities:
//! - Agent registration and inbox topics
//! - Topic creation, subscriptions and consumer offsets
//! - Publishing: idempotency, recipient resolution, offset minting
//! - Live push to connected subscriber sessions
//!
//! Offsets are minted inside the publishing write transaction, so a topic's
//! log stays strictly increasing even when a dedicated topic broker takes the
//! topic over from the default broker.

use super::model::{
    Agent, AgentProfile, Message, PublishReceipt, PublishRequest, RecipientState, Topic,
    TopicKind, TopicSpec,
};
use super::subscriber::{SubscriberActor, SubscriberArgs, SubscriberMessage};
use crate::config::{BrokerSettings, NotifyMode};
use crate::error::{HermesError, Result};
use crate::runtime::mailbox::MailboxPolicy;
use crate::runtime::{spawn_linked, Addr};
use crate::storage::{broker as db, Store};
use crate::types::{AgentId, LogOffset, MessageId, SessionId, TopicId};
use chrono::Utc;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::mpsc;

/// Sender used for system notifications such as review verdicts
pub const SYSTEM_AGENT: &str = "hermes";

pub enum BrokerMessage {
    /// Register or refresh an agent; creates and subscribes its inbox
    RegisterAgent {
        profile: AgentProfile,
        reply: RpcReplyPort<Result<Agent>>,
    },

    /// Create a topic (idempotent for an identical kind)
    CreateTopic {
        spec: TopicSpec,
        reply: RpcReplyPort<Result<Topic>>,
    },

    /// Subscribe; replies true when the subscription is new
    Subscribe {
        agent: AgentId,
        topic: TopicId,
        reply: RpcReplyPort<Result<bool>>,
    },

    /// Unsubscribe; replies true when a subscription was removed
    Unsubscribe {
        agent: AgentId,
        topic: TopicId,
        reply: RpcReplyPort<Result<bool>>,
    },

    /// Publish a message; `reply` is optional for fire-and-forget notices
    Publish {
        request: PublishRequest,
        reply: Option<RpcReplyPort<Result<PublishReceipt>>>,
    },

    /// Push an already-persisted message to one agent's live session
    NotifyAgent { agent: AgentId, message: Message },

    /// Push to each listed agent that holds a live session
    NotifyTopic {
        topic: TopicId,
        agents: Vec<AgentId>,
        message: Message,
    },

    /// Move a consumer offset forward (never backward)
    AdvanceOffset {
        agent: AgentId,
        topic: TopicId,
        offset: LogOffset,
        reply: RpcReplyPort<Result<LogOffset>>,
    },

    SetRecipientState {
        message: MessageId,
        agent: AgentId,
        state: RecipientState,
        reply: RpcReplyPort<Result<()>>,
    },

    Acknowledge {
        message: MessageId,
        agent: AgentId,
        reply: RpcReplyPort<Result<()>>,
    },

    /// Attach a live session; a newer session replaces the older one
    Connect {
        agent: AgentId,
        outbound: mpsc::Sender<Message>,
        reply: RpcReplyPort<Result<SessionId>>,
    },

    /// Detach a live session if it is still the current one
    Disconnect { agent: AgentId, session: SessionId },

    /// Agents holding a live session
    ConnectedAgents(RpcReplyPort<Vec<AgentId>>),

    /// Delete messages past their retention window in the topics this
    /// broker owns; a default broker leaves `skip` to their dedicated brokers
    PruneRetention {
        skip: Vec<TopicId>,
        reply: RpcReplyPort<Result<usize>>,
    },
}

/// Startup arguments
#[derive(Clone)]
pub struct BrokerArgs {
    pub store: Store,
    pub settings: BrokerSettings,
    /// Mailbox policy for spawned subscriber actors
    pub session_mailbox: MailboxPolicy,
    /// Restrict this broker to one topic
    pub scope: Option<TopicId>,
}

struct LiveSession {
    session: SessionId,
    addr: Addr<SubscriberMessage>,
}

/// Broker actor state
pub struct BrokerState {
    store: Store,
    settings: BrokerSettings,
    session_mailbox: MailboxPolicy,
    scope: Option<TopicId>,

    /// Known agents (refreshed from storage on a miss)
    agents: HashSet<AgentId>,

    /// Known topics (refreshed from storage on a miss)
    topics: HashMap<TopicId, Topic>,

    /// Live sessions by agent
    sessions: HashMap<AgentId, LiveSession>,

    /// Subscriber actor -> owning agent, for supervision events
    session_actors: HashMap<ActorId, AgentId>,
}

impl BrokerState {
    fn label(&self) -> String {
        match &self.scope {
            Some(topic) => format!("broker[{}]", topic),
            None => "broker".to_string(),
        }
    }
}

/// Broker actor implementation
pub struct BrokerActor;

impl BrokerActor {
    fn check_scope(state: &BrokerState, topic: &TopicId) -> Result<()> {
        match &state.scope {
            Some(scope) if scope != topic => Err(HermesError::InvalidRequest(format!(
                "{} cannot serve topic {}",
                state.label(),
                topic
            ))),
            _ => Ok(()),
        }
    }

    async fn known_agent(state: &mut BrokerState, agent: &AgentId) -> Result<()> {
        if state.agents.contains(agent) {
            return Ok(());
        }
        let name = agent.clone();
        let found = state.store.read(move |conn| db::get_agent(conn, &name)).await?;
        match found {
            Some(agent) => {
                state.agents.insert(agent.name);
                Ok(())
            }
            None => Err(HermesError::UnknownAgent(agent.to_string())),
        }
    }

    async fn known_topic(state: &mut BrokerState, topic: &TopicId) -> Result<Topic> {
        Self::check_scope(state, topic)?;
        if let Some(found) = state.topics.get(topic) {
            return Ok(found.clone());
        }
        let name = topic.clone();
        let found = state.store.read(move |conn| db::get_topic(conn, &name)).await?;
        match found {
            Some(found) => {
                state.topics.insert(found.name.clone(), found.clone());
                Ok(found)
            }
            None => Err(HermesError::UnknownTopic(topic.to_string())),
        }
    }

    async fn register_agent(state: &mut BrokerState, profile: AgentProfile) -> Result<Agent> {
        if profile.name.as_str().trim().is_empty() || profile.name.as_str().contains(':') {
            return Err(HermesError::InvalidRequest(format!(
                "invalid agent name '{}'",
                profile.name
            )));
        }

        let now = Utc::now();
        let (agent, inbox) = state
            .store
            .write(move |conn| {
                let agent = db::upsert_agent(conn, &profile, now)?;
                let inbox_name = TopicId::inbox(&agent.name);
                let inbox = db::ensure_topic(conn, &inbox_name, TopicKind::Direct, None, now)?;
                db::insert_subscription(conn, &agent.name, &inbox_name, now)?;
                Ok((agent, inbox))
            })
            .await?;

        tracing::info!("Registered agent {}", agent.name);
        state.agents.insert(agent.name.clone());
        state.topics.insert(inbox.name.clone(), inbox);
        Ok(agent)
    }

    async fn create_topic(state: &mut BrokerState, spec: TopicSpec) -> Result<Topic> {
        Self::check_scope(state, &spec.name)?;
        if spec.name.as_str().trim().is_empty() {
            return Err(HermesError::InvalidRequest("topic name is empty".to_string()));
        }
        if spec.name.inbox_owner().is_some() {
            return Err(HermesError::InvalidRequest(format!(
                "{} is reserved for agent inboxes",
                spec.name
            )));
        }

        let now = Utc::now();
        let request = spec.clone();
        let topic = state
            .store
            .write(move |conn| {
                db::ensure_topic(conn, &request.name, request.kind, request.retention_secs, now)
            })
            .await?;

        if topic.kind != spec.kind {
            return Err(HermesError::InvalidRequest(format!(
                "topic {} already exists as {}",
                topic.name, topic.kind
            )));
        }

        tracing::info!("Topic ready: {} ({})", topic.name, topic.kind);
        state.topics.insert(topic.name.clone(), topic.clone());
        Ok(topic)
    }

    async fn subscribe(state: &mut BrokerState, agent: AgentId, topic: TopicId) -> Result<bool> {
        Self::known_agent(state, &agent).await?;
        Self::known_topic(state, &topic).await?;
        if let Some(owner) = topic.inbox_owner() {
            if owner != agent {
                return Err(HermesError::InvalidRequest(format!(
                    "{} may not subscribe to {}",
                    agent, topic
                )));
            }
        }

        let now = Utc::now();
        let (a, t) = (agent.clone(), topic.clone());
        let created = state
            .store
            .write(move |conn| db::insert_subscription(conn, &a, &t, now))
            .await?;

        if created {
            tracing::debug!("{} subscribed to {}", agent, topic);
        }
        Ok(created)
    }

    async fn unsubscribe(state: &mut BrokerState, agent: AgentId, topic: TopicId) -> Result<bool> {
        Self::known_agent(state, &agent).await?;
        Self::known_topic(state, &topic).await?;

        let (a, t) = (agent.clone(), topic.clone());
        let removed = state
            .store
            .write(move |conn| db::delete_subscription(conn, &a, &t))
            .await?;

        if removed {
            tracing::debug!("{} unsubscribed from {}", agent, topic);
        }
        Ok(removed)
    }

    /// Validate and normalise the explicit target list for a topic
    async fn resolve_targets(
        state: &mut BrokerState,
        topic: &Topic,
        targets: Vec<AgentId>,
    ) -> Result<Vec<AgentId>> {
        if !topic.kind.requires_targets() {
            if !targets.is_empty() {
                return Err(HermesError::InvalidRequest(format!(
                    "broadcast topic {} does not take explicit targets",
                    topic.name
                )));
            }
            return Ok(Vec::new());
        }

        let targets = match topic.name.inbox_owner() {
            Some(owner) if targets.is_empty() => vec![owner],
            Some(owner) => {
                if targets.iter().any(|t| *t != owner) {
                    return Err(HermesError::InvalidRequest(format!(
                        "inbox {} only delivers to {}",
                        topic.name, owner
                    )));
                }
                vec![owner]
            }
            None => targets,
        };

        if targets.is_empty() {
            return Err(HermesError::InvalidRequest(format!(
                "{} topic {} requires at least one target",
                topic.kind, topic.name
            )));
        }

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(targets.len());
        for target in targets {
            if seen.insert(target.clone()) {
                Self::known_agent(state, &target).await?;
                unique.push(target);
            }
        }
        Ok(unique)
    }

    async fn publish(state: &mut BrokerState, request: PublishRequest) -> Result<PublishReceipt> {
        let topic = Self::known_topic(state, &request.topic).await?;
        Self::known_agent(state, &request.sender).await?;

        let targets = Self::resolve_targets(state, &topic, request.targets.clone()).await?;
        let broadcast = !topic.kind.requires_targets();
        let created_at = Utc::now();

        // The key lookup shares the insert's transaction so that two brokers
        // racing on one key both see the first message
        let (message, recipients, deduplicated) = state
            .store
            .write(move |conn| {
                if let Some(key) = &request.idempotency_key {
                    if let Some((message, recipients)) = db::find_message_by_key(conn, key)? {
                        return Ok((message, recipients, true));
                    }
                }

                let offset = db::next_offset(conn, &request.topic)?;
                let recipients = if broadcast {
                    db::topic_subscribers(conn, &request.topic)?
                } else {
                    targets.clone()
                };

                let message = Message {
                    id: MessageId::new(),
                    topic: request.topic.clone(),
                    offset,
                    sender: request.sender.clone(),
                    thread_id: request.thread_id.clone(),
                    priority: request.priority,
                    subject: request.subject.clone(),
                    body: request.body.clone(),
                    idempotency_key: request.idempotency_key.clone(),
                    created_at,
                };
                db::append_message(conn, &message, &recipients)?;
                Ok((message, recipients, false))
            })
            .await?;

        if deduplicated {
            tracing::debug!(
                "Duplicate publish for key {:?}, returning offset {}",
                message.idempotency_key,
                message.offset
            );
            return Ok(PublishReceipt {
                message_id: message.id,
                topic: message.topic,
                offset: message.offset,
                recipients,
                pushed: 0,
                deduplicated: true,
            });
        }

        if let Some(cached) = state.topics.get_mut(&message.topic) {
            cached.last_offset = cached.last_offset.max(message.offset);
        }

        let indexed = message.clone();
        if let Err(e) = state
            .store
            .write(move |conn| db::index_message(conn, &indexed))
            .await
        {
            tracing::warn!("Failed to index message {}: {}", message.id, e);
        }

        let pushed = match message.topic.inbox_owner() {
            Some(owner) => usize::from(Self::notify_agent(state, &owner, &message)),
            None => {
                let audience = match state.settings.notify_mode {
                    NotifyMode::Targeted => recipients.clone(),
                    NotifyMode::AllSubscribers => {
                        let name = message.topic.clone();
                        state
                            .store
                            .read(move |conn| db::topic_subscribers(conn, &name))
                            .await?
                    }
                };
                Self::notify_topic(state, &audience, &message)
            }
        };

        tracing::debug!(
            "Published {} to {} at offset {} ({} recipients, {} pushed)",
            message.id,
            message.topic,
            message.offset,
            recipients.len(),
            pushed
        );

        Ok(PublishReceipt {
            message_id: message.id,
            topic: message.topic,
            offset: message.offset,
            recipients,
            pushed,
            deduplicated: false,
        })
    }

    /// Push to one agent's live session. A failed push drops the session;
    /// the message stays durable and the agent recovers it by replay.
    fn notify_agent(state: &mut BrokerState, agent: &AgentId, message: &Message) -> bool {
        let Some(live) = state.sessions.get(agent) else {
            return false;
        };

        match live.addr.send(SubscriberMessage::Deliver(message.clone())) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "Dropping session {} for {} after failed push: {}",
                    live.session,
                    agent,
                    e
                );
                Self::drop_session(state, agent);
                false
            }
        }
    }

    /// Push to every listed agent that is connected; returns pushes made
    fn notify_topic(state: &mut BrokerState, agents: &[AgentId], message: &Message) -> usize {
        let connected: BTreeSet<AgentId> = agents
            .iter()
            .filter(|agent| state.sessions.contains_key(*agent))
            .cloned()
            .collect();

        connected
            .iter()
            .filter(|agent| Self::notify_agent(state, agent, message))
            .count()
    }

    async fn advance_offset(
        state: &mut BrokerState,
        agent: AgentId,
        topic: TopicId,
        offset: LogOffset,
    ) -> Result<LogOffset> {
        Self::known_agent(state, &agent).await?;
        Self::known_topic(state, &topic).await?;

        let now = Utc::now();
        state
            .store
            .write(move |conn| {
                let high_water = db::next_offset(conn, &topic)? - 1;
                if offset > high_water {
                    return Err(HermesError::InvalidRequest(format!(
                        "offset {} is beyond the end of {} ({})",
                        offset, topic, high_water
                    )));
                }
                db::advance_consumer_offset(conn, &agent, &topic, offset, now)
            })
            .await
    }

    async fn set_recipient_state(
        state: &mut BrokerState,
        message: MessageId,
        agent: AgentId,
        recipient_state: RecipientState,
    ) -> Result<()> {
        let now = Utc::now();
        let (m, a) = (message, agent.clone());
        let updated = state
            .store
            .write(move |conn| db::set_recipient_state(conn, &m, &a, recipient_state, now))
            .await?;
        if !updated {
            return Err(HermesError::InvalidRequest(format!(
                "message {} is not addressed to {}",
                message, agent
            )));
        }
        Ok(())
    }

    async fn acknowledge(state: &mut BrokerState, message: MessageId, agent: AgentId) -> Result<()> {
        let now = Utc::now();
        let (m, a) = (message, agent.clone());
        let updated = state
            .store
            .write(move |conn| db::acknowledge(conn, &m, &a, now))
            .await?;
        if !updated {
            return Err(HermesError::InvalidRequest(format!(
                "message {} is not addressed to {}",
                message, agent
            )));
        }
        Ok(())
    }

    async fn connect(
        myself: &ActorRef<BrokerMessage>,
        state: &mut BrokerState,
        agent: AgentId,
        outbound: mpsc::Sender<Message>,
    ) -> Result<SessionId> {
        Self::known_agent(state, &agent).await?;

        if state.sessions.contains_key(&agent) {
            tracing::info!("Replacing live session for {}", agent);
            Self::drop_session(state, &agent);
        }

        let session = SessionId::new();
        let (addr, _handle) = spawn_linked(
            None,
            SubscriberActor,
            SubscriberArgs {
                agent: agent.clone(),
                session,
                outbound,
            },
            state.session_mailbox,
            myself.get_cell(),
        )
        .await?;

        tracing::info!("{} connected session {} to {}", agent, session, state.label());
        state.session_actors.insert(addr.id(), agent.clone());
        state.sessions.insert(agent, LiveSession { session, addr });
        Ok(session)
    }

    fn drop_session(state: &mut BrokerState, agent: &AgentId) {
        if let Some(live) = state.sessions.remove(agent) {
            state.session_actors.remove(&live.addr.id());
            live.addr.stop(Some("session dropped".to_string()));
        }
    }

    fn session_ended(state: &mut BrokerState, actor: ActorId, reason: &str) {
        let Some(agent) = state.session_actors.remove(&actor) else {
            return;
        };
        let current = state
            .sessions
            .get(&agent)
            .map(|live| live.addr.id() == actor)
            .unwrap_or(false);
        if current {
            state.sessions.remove(&agent);
            tracing::info!("Session for {} ended: {}", agent, reason);
        }
    }
}

#[ractor::async_trait]
impl Actor for BrokerActor {
    type Msg = BrokerMessage;
    type State = BrokerState;
    type Arguments = BrokerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> std::result::Result<Self::State, ActorProcessingErr> {
        let now = Utc::now();
        let (agents, topics) = args
            .store
            .write(move |conn| {
                db::upsert_agent(conn, &AgentProfile::named(SYSTEM_AGENT), now)?;
                Ok((db::list_agents(conn)?, db::list_topics(conn)?))
            })
            .await
            .map_err(|e| ActorProcessingErr::from(e.to_string()))?;

        let state = BrokerState {
            store: args.store,
            settings: args.settings,
            session_mailbox: args.session_mailbox,
            scope: args.scope,
            agents: agents.into_iter().map(|a| a.name).collect(),
            topics: topics.into_iter().map(|t| (t.name.clone(), t)).collect(),
            sessions: HashMap::new(),
            session_actors: HashMap::new(),
        };

        tracing::info!(
            "{} starting ({} agents, {} topics)",
            state.label(),
            state.agents.len(),
            state.topics.len()
        );
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        match message {
            BrokerMessage::RegisterAgent { profile, reply } => {
                let _ = reply.send(Self::register_agent(state, profile).await);
            }
            BrokerMessage::CreateTopic { spec, reply } => {
                let _ = reply.send(Self::create_topic(state, spec).await);
            }
            BrokerMessage::Subscribe {
                agent,
                topic,
                reply,
            } => {
                let _ = reply.send(Self::subscribe(state, agent, topic).await);
            }
            BrokerMessage::Unsubscribe {
                agent,
                topic,
                reply,
            } => {
                let _ = reply.send(Self::unsubscribe(state, agent, topic).await);
            }
            BrokerMessage::Publish { request, reply } => {
                let result = Self::publish(state, request).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!("Fire-and-forget publish failed: {}", e);
                        }
                    }
                }
            }
            BrokerMessage::NotifyAgent { agent, message } => {
                Self::notify_agent(state, &agent, &message);
            }
            BrokerMessage::NotifyTopic {
                topic,
                agents,
                message,
            } => {
                if Self::check_scope(state, &topic).is_ok() {
                    Self::notify_topic(state, &agents, &message);
                }
            }
            BrokerMessage::AdvanceOffset {
                agent,
                topic,
                offset,
                reply,
            } => {
                let _ = reply.send(Self::advance_offset(state, agent, topic, offset).await);
            }
            BrokerMessage::SetRecipientState {
                message,
                agent,
                state: recipient_state,
                reply,
            } => {
                let _ = reply.send(
                    Self::set_recipient_state(state, message, agent, recipient_state).await,
                );
            }
            BrokerMessage::Acknowledge {
                message,
                agent,
                reply,
            } => {
                let _ = reply.send(Self::acknowledge(state, message, agent).await);
            }
            BrokerMessage::Connect {
                agent,
                outbound,
                reply,
            } => {
                let _ = reply.send(Self::connect(&myself, state, agent, outbound).await);
            }
            BrokerMessage::Disconnect { agent, session } => {
                let current = state
                    .sessions
                    .get(&agent)
                    .map(|live| live.session == session)
                    .unwrap_or(false);
                if current {
                    tracing::info!("{} disconnected session {}", agent, session);
                    Self::drop_session(state, &agent);
                }
            }
            BrokerMessage::ConnectedAgents(reply) => {
                let mut agents: Vec<AgentId> = state.sessions.keys().cloned().collect();
                agents.sort();
                let _ = reply.send(agents);
            }
            BrokerMessage::PruneRetention { skip, reply } => {
                let now = Utc::now();
                let scope = state.scope.clone();
                let result = state
                    .store
                    .write(move |conn| {
                        db::prune_expired_messages(conn, scope.as_ref(), &skip, now)
                    })
                    .await;
                if let Ok(removed) = &result {
                    if *removed > 0 {
                        tracing::info!("Pruned {} messages past retention", removed);
                    }
                }
                let _ = reply.send(result);
            }
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        event: SupervisionEvent,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        match event {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                let reason = reason.unwrap_or_else(|| "stopped".to_string());
                Self::session_ended(state, cell.get_id(), &reason);
            }
            SupervisionEvent::ActorFailed(cell, err) => {
                Self::session_ended(state, cell.get_id(), &err.to_string());
            }
            _ => {}
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        for (_, live) in state.sessions.drain() {
            live.addr.stop(Some("broker stopped".to_string()));
        }
        tracing::info!("{} stopped", state.label());
        Ok(())
    }
}
