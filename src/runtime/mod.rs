//! Actor runtime
//!
//! Thin layer over ractor that every service actor is spawned through:
//! - [`Addr`]: comparable, location-transparent handle with mailbox accounting
//! - [`spawn`] / [`spawn_linked`]: start an actor behind a [`MailboxGauge`]
//! - [`registry::ServiceRegistry`]: well-known service lookup
//! - [`supervision`]: restart policies and the root supervisor
//!
//! Messages from a single sender to a single actor are processed in send
//! order because each actor drains one ractor mailbox sequentially.

pub mod mailbox;
pub mod registry;
pub mod supervision;

use crate::error::{HermesError, Result};
use mailbox::{MailboxGauge, MailboxPolicy};
use ractor::{
    Actor, ActorCell, ActorId, ActorProcessingErr, ActorRef, ActorStatus, Message, RpcReplyPort,
    SupervisionEvent,
};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to a running actor
pub struct Addr<M: Message> {
    actor: ActorRef<M>,
    mailbox: MailboxGauge,
}

impl<M: Message> Clone for Addr<M> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<M: Message> PartialEq for Addr<M> {
    fn eq(&self, other: &Self) -> bool {
        self.actor.get_id() == other.actor.get_id()
    }
}

impl<M: Message> Eq for Addr<M> {}

impl<M: Message> std::hash::Hash for Addr<M> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.actor.get_id().hash(state);
    }
}

impl<M: Message> std::fmt::Debug for Addr<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Addr")
            .field("id", &self.actor.get_id())
            .field("mailbox", &self.mailbox)
            .finish()
    }
}

impl<M: Message> Addr<M> {
    /// Rebuild a handle from an actor ref and the gauge it was spawned with
    pub fn from_parts(actor: ActorRef<M>, mailbox: MailboxGauge) -> Self {
        Self { actor, mailbox }
    }

    pub fn id(&self) -> ActorId {
        self.actor.get_id()
    }

    pub fn actor_ref(&self) -> &ActorRef<M> {
        &self.actor
    }

    pub fn cell(&self) -> ActorCell {
        self.actor.get_cell()
    }

    pub fn mailbox(&self) -> &MailboxGauge {
        &self.mailbox
    }

    pub fn is_alive(&self) -> bool {
        !matches!(
            self.actor.get_status(),
            ActorStatus::Stopping | ActorStatus::Stopped
        )
    }

    /// Fire-and-forget send; refused with `MailboxFull` at the mailbox bound
    pub fn send(&self, msg: M) -> Result<()> {
        self.mailbox.try_reserve()?;
        self.cast_reserved(msg)
    }

    /// Send, waiting for mailbox capacity instead of failing
    pub async fn send_when_ready(&self, msg: M) -> Result<()> {
        if !self.is_alive() {
            return Err(self.unavailable());
        }
        self.mailbox.reserve().await;
        self.cast_reserved(msg)
    }

    /// Send a request and await the correlated reply.
    ///
    /// A timeout only abandons the wait; the actor still processes the request.
    pub async fn request<R, F>(&self, build: F, timeout: Duration) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(RpcReplyPort<R>) -> M,
    {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.send(build(tx.into()))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(self.unavailable()),
            Err(_) => Err(HermesError::Timeout(timeout)),
        }
    }

    /// Stop after the current message; queued messages are discarded
    pub fn stop(&self, reason: Option<String>) {
        self.actor.stop(reason);
    }

    /// Stop once every message already queued has been handled
    pub fn drain(&self) -> Result<()> {
        self.actor.drain().map_err(|_| self.unavailable())
    }

    /// Terminate immediately, abandoning the message in flight
    pub fn kill(&self) {
        self.actor.kill();
    }

    pub async fn stop_and_wait(&self, reason: Option<String>, timeout: Duration) -> Result<()> {
        self.actor
            .stop_and_wait(reason, Some(timeout))
            .await
            .map_err(|_| HermesError::Timeout(timeout))
    }

    fn cast_reserved(&self, msg: M) -> Result<()> {
        self.actor.cast(msg).map_err(|_| {
            self.mailbox.release();
            self.unavailable()
        })
    }

    fn unavailable(&self) -> HermesError {
        HermesError::ActorUnavailable(self.mailbox.label().to_string())
    }
}

/// Wraps an actor so each handled message frees its mailbox slot
pub struct Monitored<A> {
    inner: A,
    gauge: MailboxGauge,
}

#[ractor::async_trait]
impl<A> Actor for Monitored<A>
where
    A: Actor,
{
    type Msg = A::Msg;
    type State = A::State;
    type Arguments = A::Arguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> std::result::Result<Self::State, ActorProcessingErr> {
        self.inner.pre_start(myself, args).await
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        self.inner.post_start(myself, state).await
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        self.gauge.release();
        self.inner.handle(myself, message, state).await
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        event: SupervisionEvent,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        self.inner.handle_supervisor_evt(myself, event, state).await
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        self.inner.post_stop(myself, state).await
    }
}

/// Spawn an actor behind an existing gauge, optionally linked to a supervisor.
///
/// Actors that need their own [`Addr`] receive a clone of `gauge` in their
/// arguments and rebuild it with [`Addr::from_parts`].
pub async fn spawn_with_gauge<A>(
    name: Option<String>,
    actor: A,
    args: A::Arguments,
    gauge: MailboxGauge,
    supervisor: Option<ActorCell>,
) -> Result<(Addr<A::Msg>, JoinHandle<()>)>
where
    A: Actor,
{
    let wrapped = Monitored {
        inner: actor,
        gauge: gauge.clone(),
    };

    let spawned = match supervisor {
        Some(supervisor) => Actor::spawn_linked(name, wrapped, args, supervisor).await,
        None => Actor::spawn(name, wrapped, args).await,
    };

    let (actor_ref, handle) = spawned.map_err(|e| {
        HermesError::ActorUnavailable(format!("failed to spawn {}: {}", gauge.label(), e))
    })?;

    tracing::debug!("Spawned actor {} ({})", gauge.label(), actor_ref.get_id());
    Ok((Addr::from_parts(actor_ref, gauge), handle))
}

pub async fn spawn<A>(
    name: Option<String>,
    actor: A,
    args: A::Arguments,
    policy: MailboxPolicy,
) -> Result<(Addr<A::Msg>, JoinHandle<()>)>
where
    A: Actor,
{
    let gauge = MailboxGauge::new(actor_label::<A>(&name), policy);
    spawn_with_gauge(name, actor, args, gauge, None).await
}

pub async fn spawn_linked<A>(
    name: Option<String>,
    actor: A,
    args: A::Arguments,
    policy: MailboxPolicy,
    supervisor: ActorCell,
) -> Result<(Addr<A::Msg>, JoinHandle<()>)>
where
    A: Actor,
{
    let gauge = MailboxGauge::new(actor_label::<A>(&name), policy);
    spawn_with_gauge(name, actor, args, gauge, Some(supervisor)).await
}

pub(crate) fn actor_label<A>(name: &Option<String>) -> String {
    name.clone().unwrap_or_else(|| {
        std::any::type_name::<A>()
            .rsplit("::")
            .next()
            .unwrap_or("actor")
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts messages; `Block` parks the actor until the gate opens
    struct Counter;

    enum CounterMessage {
        Increment,
        Block(std::sync::Arc<tokio::sync::Notify>),
        Get(RpcReplyPort<u64>),
    }

    #[ractor::async_trait]
    impl Actor for Counter {
        type Msg = CounterMessage;
        type State = u64;
        type Arguments = ();

        async fn pre_start(
            &self,
            _myself: ActorRef<Self::Msg>,
            _args: Self::Arguments,
        ) -> std::result::Result<Self::State, ActorProcessingErr> {
            Ok(0)
        }

        async fn handle(
            &self,
            _myself: ActorRef<Self::Msg>,
            message: Self::Msg,
            state: &mut Self::State,
        ) -> std::result::Result<(), ActorProcessingErr> {
            match message {
                CounterMessage::Increment => *state += 1,
                CounterMessage::Block(gate) => gate.notified().await,
                CounterMessage::Get(reply) => {
                    let _ = reply.send(*state);
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_and_request_preserve_order() {
        let (addr, _handle) = spawn(None, Counter, (), MailboxPolicy::default())
            .await
            .unwrap();

        for _ in 0..10 {
            addr.send(CounterMessage::Increment).unwrap();
        }
        let count = addr
            .request(CounterMessage::Get, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(count, 10);

        addr.stop(None);
    }

    #[tokio::test]
    async fn test_bounded_mailbox_back_pressures_sender() {
        let (addr, _handle) = spawn(None, Counter, (), MailboxPolicy::bounded(2))
            .await
            .unwrap();

        let gate = std::sync::Arc::new(tokio::sync::Notify::new());
        addr.send(CounterMessage::Block(gate.clone())).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        addr.send(CounterMessage::Increment).unwrap();
        addr.send(CounterMessage::Increment).unwrap();
        let err = addr.send(CounterMessage::Increment).unwrap_err();
        assert!(matches!(err, HermesError::MailboxFull { .. }));

        gate.notify_one();
        addr.send_when_ready(CounterMessage::Increment).await.unwrap();
        let count = addr
            .request(CounterMessage::Get, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(count, 3);

        addr.stop(None);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (addr, _handle) = spawn(None, Counter, (), MailboxPolicy::default())
            .await
            .unwrap();

        let gate = std::sync::Arc::new(tokio::sync::Notify::new());
        addr.send(CounterMessage::Block(gate.clone())).unwrap();

        let err = addr
            .request(CounterMessage::Get, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HermesError::Timeout(_)));

        gate.notify_one();
        addr.stop(None);
    }

    #[tokio::test]
    async fn test_send_to_stopped_actor_fails() {
        let (addr, handle) = spawn(None, Counter, (), MailboxPolicy::default())
            .await
            .unwrap();
        let other = addr.clone();
        assert_eq!(addr, other);

        addr.stop(None);
        handle.await.unwrap();

        assert!(!addr.is_alive());
        let err = addr.send(CounterMessage::Increment).unwrap_err();
        assert!(matches!(err, HermesError::ActorUnavailable(_)));
        assert_eq!(addr.mailbox().depth(), 0);
    }
}
