//! Live subscriber sessions
//!
//! A [`SubscriberActor`] is spawned per connected agent, linked to the broker
//! that owns it, and forwards pushed messages into the session's channel.
//! It stops itself when the client drops the [`Session`] or stops draining
//! it; the broker then forgets the session.
//!
//! A session is a hint, not a guarantee: after reconnecting, an agent
//! replays from its stored offset before trusting live pushes.

use super::client::BrokerClient;
use super::model::Message;
use super::BrokerMessage;
use crate::error::Result;
use crate::runtime::Addr;
use crate::types::{AgentId, LogOffset, SessionId, TopicId};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub enum SubscriberMessage {
    /// Forward a message to the client
    Deliver(Message),
}

pub struct SubscriberArgs {
    pub agent: AgentId,
    pub session: SessionId,
    pub outbound: mpsc::Sender<Message>,
}

pub struct SubscriberState {
    agent: AgentId,
    session: SessionId,
    outbound: mpsc::Sender<Message>,
    watcher: Option<JoinHandle<()>>,
}

pub struct SubscriberActor;

#[ractor::async_trait]
impl Actor for SubscriberActor {
    type Msg = SubscriberMessage;
    type State = SubscriberState;
    type Arguments = SubscriberArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> std::result::Result<Self::State, ActorProcessingErr> {
        Ok(SubscriberState {
            agent: args.agent,
            session: args.session,
            outbound: args.outbound,
            watcher: None,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        let outbound = state.outbound.clone();
        state.watcher = Some(tokio::spawn(async move {
            outbound.closed().await;
            myself.stop(Some("session closed by client".to_string()));
        }));
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        match message {
            SubscriberMessage::Deliver(message) => match state.outbound.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    tracing::warn!(
                        "Session {} for {} is not draining, dropping it at offset {} of {}",
                        state.session,
                        state.agent,
                        message.offset,
                        message.topic
                    );
                    myself.stop(Some("session buffer full".to_string()));
                }
                Err(TrySendError::Closed(_)) => {
                    myself.stop(Some("session closed by client".to_string()));
                }
            },
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        if let Some(watcher) = state.watcher.take() {
            watcher.abort();
        }
        tracing::debug!("Subscriber {} for {} stopped", state.session, state.agent);
        Ok(())
    }
}

/// Client side of a live connection
pub struct Session {
    agent: AgentId,
    attachments: Vec<(Addr<BrokerMessage>, SessionId)>,
    receiver: mpsc::Receiver<Message>,
    /// Live messages set aside by `wait_for` while waiting on another topic
    parked: VecDeque<Message>,
    client: BrokerClient,
}

impl Session {
    pub(crate) fn new(
        agent: AgentId,
        attachments: Vec<(Addr<BrokerMessage>, SessionId)>,
        receiver: mpsc::Receiver<Message>,
        client: BrokerClient,
    ) -> Self {
        Self {
            agent,
            attachments,
            receiver,
            parked: VecDeque::new(),
            client,
        }
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Next live message; `None` once every broker has dropped the session
    pub async fn recv(&mut self) -> Option<Message> {
        if let Some(message) = self.parked.pop_front() {
            return Some(message);
        }
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.parked
            .pop_front()
            .or_else(|| self.receiver.try_recv().ok())
    }

    /// Replay everything after the agent's stored offset for `topic`
    pub async fn catch_up(&self, topic: &TopicId) -> Result<Vec<Message>> {
        let from = self.client.consumer_offset(&self.agent, topic).await?;
        self.client.replay_all(&self.agent, topic, from).await
    }

    /// Advance the agent's stored offset for `topic`
    pub async fn ack(&self, topic: &TopicId, offset: LogOffset) -> Result<LogOffset> {
        self.client.advance_offset(&self.agent, topic, offset).await
    }

    /// Long-poll: return unconsumed messages for `topic`, waiting up to
    /// `timeout` (capped by the broker's long-poll limit) for one to arrive.
    /// Returns an empty list on timeout or cancellation.
    pub async fn wait_for(
        &mut self,
        topic: &TopicId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let backlog = self.catch_up(topic).await?;
        if !backlog.is_empty() {
            self.parked.retain(|m| m.topic != *topic);
            return Ok(backlog);
        }
        let from = self.client.consumer_offset(&self.agent, topic).await?;

        let timeout = timeout.min(self.client.long_poll_limit());
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                received = self.receiver.recv() => {
                    let Some(message) = received else {
                        return Ok(Vec::new());
                    };
                    if message.topic == *topic && message.offset > from {
                        return Ok(vec![message]);
                    }
                    self.parked.push_back(message);
                }
                _ = &mut deadline => return Ok(Vec::new()),
                _ = cancel.cancelled() => return Ok(Vec::new()),
            }
        }
    }

    /// Detach from every broker
    pub fn close(self) {}
}

impl Drop for Session {
    fn drop(&mut self) {
        for (broker, session) in self.attachments.drain(..) {
            let _ = broker.send(BrokerMessage::Disconnect {
                agent: self.agent.clone(),
                session,
            });
        }
    }
}
