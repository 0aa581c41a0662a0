//! Connection lifecycle: `Disconnected -> Connecting -> Connected` and back.
//!
//! [`ConnectionManager`] is the only component that installs or drops the
//! active transport handle. Every successful connect starts an inbound task
//! that answers remote-initiated messages with the configured automatic
//! reply, approves subscription requests, and moves the state back to
//! `Disconnected` when the transport reports the connection gone. Connects
//! are never retried automatically.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use xmppchat_core::event::{EventBus, EventPayload, EventSource, emit};
use xmppchat_core::strip_markup;
use xmppchat_xmpp::{
    ChatTransport, ConnectionConfig, ConnectionError, InboundMessage, TransportEvent,
    TransportEvents, TransportOwner, TransportSlot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Lifecycle<T> {
    state: ConnectionState,
    /// Bumped on every connect and close; inbound tasks of older
    /// generations may no longer touch the state.
    generation: u64,
    owner: TransportOwner<T>,
}

type SharedLifecycle<T> = Arc<Mutex<Lifecycle<T>>>;

fn lock<T>(lifecycle: &SharedLifecycle<T>) -> MutexGuard<'_, Lifecycle<T>> {
    lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ConnectionManager<T> {
    lifecycle: SharedLifecycle<T>,
    slot: TransportSlot<T>,
    /// Serializes start, stop and reload; holds the running inbound task.
    inbound: AsyncMutex<Option<JoinHandle<()>>>,
    auto_reply: Arc<RwLock<String>>,
    event_bus: Arc<dyn EventBus>,
}

impl<T> ConnectionManager<T>
where
    T: ChatTransport,
{
    pub fn new(auto_reply: impl Into<String>, event_bus: Arc<dyn EventBus>) -> Self {
        let (owner, slot) = TransportSlot::new();
        Self {
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: ConnectionState::Disconnected,
                generation: 0,
                owner,
            })),
            slot,
            inbound: AsyncMutex::new(None),
            auto_reply: Arc::new(RwLock::new(auto_reply.into())),
            event_bus,
        }
    }

    /// Read handle on the active transport for routers and trackers.
    pub fn slot(&self) -> TransportSlot<T> {
        self.slot.clone()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.lifecycle).state
    }

    pub fn set_auto_reply(&self, text: impl Into<String>) {
        *self
            .auto_reply
            .write()
            .unwrap_or_else(PoisonError::into_inner) = text.into();
    }

    pub async fn start(&self, config: &ConnectionConfig) -> Result<(), ConnectionError> {
        let mut inbound = self.inbound.lock().await;
        if self.state() == ConnectionState::Connected {
            debug!("already connected");
            return Ok(());
        }
        self.connect(&mut inbound, config).await
    }

    /// Disconnect. Calling this while disconnected is not an error.
    pub async fn stop(&self) -> Result<(), ConnectionError> {
        let mut inbound = self.inbound.lock().await;
        match self.close(&mut inbound).await {
            Err(ConnectionError::NotConnected) => Ok(()),
            other => other,
        }
    }

    /// Close the current connection, if any, and connect again with `config`.
    pub async fn reload(&self, config: &ConnectionConfig) -> Result<(), ConnectionError> {
        let mut inbound = self.inbound.lock().await;
        match self.close(&mut inbound).await {
            Ok(()) | Err(ConnectionError::NotConnected) => {}
            Err(error) => warn!(%error, "failed to close previous connection"),
        }
        self.connect(&mut inbound, config).await
    }

    async fn connect(
        &self,
        inbound: &mut Option<JoinHandle<()>>,
        config: &ConnectionConfig,
    ) -> Result<(), ConnectionError> {
        let generation = {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.generation += 1;
            lifecycle.state = ConnectionState::Connecting;
            lifecycle.generation
        };
        let account = config.account();
        info!(%account, "connecting");

        let (transport, events) = match T::connect(config).await {
            Ok(connected) => connected,
            Err(error) => return Err(self.connect_failed(&account, error)),
        };
        let transport = Arc::new(transport);

        if let Err(error) = transport.publish_presence(&config.status).await {
            if let Err(close_error) = transport.disconnect().await {
                debug!(error = %close_error, "failed to close half-open connection");
            }
            return Err(self.connect_failed(&account, error));
        }

        {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.owner.install(Arc::clone(&transport));
            lifecycle.state = ConnectionState::Connected;
        }

        let handler = InboundHandler {
            transport,
            generation,
            lifecycle: Arc::clone(&self.lifecycle),
            auto_reply: Arc::clone(&self.auto_reply),
            event_bus: Arc::clone(&self.event_bus),
        };
        *inbound = Some(tokio::spawn(run_inbound(handler, events)));

        info!(%account, "connected");
        emit(
            self.event_bus.as_ref(),
            "system.connection.established",
            EventSource::System("connection".into()),
            EventPayload::ConnectionEstablished { account },
        );
        Ok(())
    }

    fn connect_failed(&self, account: &str, error: ConnectionError) -> ConnectionError {
        lock(&self.lifecycle).state = ConnectionState::Disconnected;
        error!(%account, %error, "failed to connect");
        emit(
            self.event_bus.as_ref(),
            "system.error.occurred",
            EventSource::System("connection".into()),
            EventPayload::ErrorOccurred {
                component: "connection".to_string(),
                message: error.to_string(),
                recoverable: false,
            },
        );
        error
    }

    async fn close(&self, inbound: &mut Option<JoinHandle<()>>) -> Result<(), ConnectionError> {
        if let Some(task) = inbound.take() {
            task.abort();
        }

        let transport = {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.generation += 1;
            lifecycle.state = ConnectionState::Disconnected;
            lifecycle.owner.take()
        };
        let Some(transport) = transport else {
            return Err(ConnectionError::NotConnected);
        };

        transport.disconnect().await?;
        info!("disconnected");
        Ok(())
    }
}

impl<T> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        if let Some(task) = self.inbound.get_mut().take() {
            task.abort();
        }
    }
}

struct InboundHandler<T> {
    transport: Arc<T>,
    generation: u64,
    lifecycle: SharedLifecycle<T>,
    auto_reply: Arc<RwLock<String>>,
    event_bus: Arc<dyn EventBus>,
}

async fn run_inbound<T: ChatTransport>(handler: InboundHandler<T>, mut events: TransportEvents) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(message) => handler.auto_reply(message).await,
            TransportEvent::SubscriptionRequested { from } => handler.approve(&from).await,
            TransportEvent::ConnectionLost { reason } => {
                handler.connection_lost(reason);
                return;
            }
        }
    }
    handler.connection_lost("event stream closed".to_string());
}

impl<T: ChatTransport> InboundHandler<T> {
    async fn auto_reply(&self, message: InboundMessage) {
        if !message.remote_initiated {
            return;
        }
        if message.body.as_deref().is_none_or(str::is_empty) {
            debug!(conversation = %message.conversation, "ignoring message without body");
            return;
        }

        let text = {
            let reply = self.auto_reply.read().unwrap_or_else(PoisonError::into_inner);
            strip_markup(&reply).into_owned()
        };
        let peer = message.conversation.peer().to_string();

        match self
            .transport
            .send_on_conversation(&message.conversation, &text)
            .await
        {
            Ok(()) => {
                debug!(%peer, "automatic reply sent");
                emit(
                    self.event_bus.as_ref(),
                    "xmpp.autoreply.sent",
                    EventSource::System("connection".into()),
                    EventPayload::AutoReplySent { to: peer },
                );
            }
            Err(error) => error!(%peer, %error, "failed to send automatic reply"),
        }
    }

    async fn approve(&self, jid: &str) {
        match self.transport.approve_subscription(jid).await {
            Ok(()) => {
                info!(%jid, "subscription approved");
                emit(
                    self.event_bus.as_ref(),
                    "xmpp.subscription.approved",
                    EventSource::Xmpp,
                    EventPayload::SubscriptionApproved {
                        jid: jid.to_string(),
                    },
                );
            }
            Err(error) => warn!(%jid, %error, "failed to approve subscription"),
        }
    }

    fn connection_lost(&self, reason: String) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.generation != self.generation {
                debug!(%reason, "ignoring loss of a replaced connection");
                return;
            }
            lifecycle.state = ConnectionState::Disconnected;
            lifecycle.owner.take();
        }

        warn!(%reason, "connection lost");
        emit(
            self.event_bus.as_ref(),
            "system.connection.lost",
            EventSource::System("connection".into()),
            EventPayload::ConnectionLost { reason },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tracing_test::traced_test;
    use xmppchat_core::event::{BroadcastEventBus, EventSubscription};
    use xmppchat_test_support::{ALICE, MockServer, MockTransport, TransportCall, eventually};
    use xmppchat_xmpp::ConversationId;

    const BOT: &str = "Ich bin ein Bot.";

    fn manager() -> (ConnectionManager<MockTransport>, Arc<dyn EventBus>) {
        let bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new(16));
        (ConnectionManager::new(BOT, Arc::clone(&bus)), bus)
    }

    fn inbound(peer: &str, remote_initiated: bool, body: Option<&str>) -> TransportEvent {
        TransportEvent::Message(InboundMessage {
            conversation: ConversationId::new(peer, "thread-1"),
            remote_initiated,
            body: body.map(str::to_string),
        })
    }

    async fn next_payload(events: &mut EventSubscription) -> EventPayload {
        tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("failed to receive event")
            .payload
    }

    #[tokio::test]
    async fn start_connects_and_publishes_presence() {
        let server = MockServer::register("lifecycle-start");
        let (manager, bus) = manager();
        let mut events = bus.subscribe("system.connection.*").unwrap();

        manager.start(&server.config()).await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.slot().current().is_some());
        assert_eq!(
            server.calls(),
            vec![
                TransportCall::Connect,
                TransportCall::PublishPresence {
                    status: "Ich bin hier.".to_string()
                },
            ]
        );
        assert_matches!(
            next_payload(&mut events).await,
            EventPayload::ConnectionEstablished { account } if account == "bot@lifecycle-start"
        );
    }

    #[tokio::test]
    async fn second_start_keeps_existing_connection() {
        let server = MockServer::register("lifecycle-double-start");
        let (manager, _bus) = manager();

        manager.start(&server.config()).await.unwrap();
        manager.start(&server.config()).await.unwrap();

        assert_eq!(server.count(|call| *call == TransportCall::Connect), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_connect_returns_to_disconnected() {
        let server = MockServer::register("lifecycle-auth-failure");
        server.fail_connect(ConnectionError::AuthenticationFailed("bad password".into()));
        let (manager, _bus) = manager();

        let result = manager.start(&server.config()).await;

        assert_matches!(result, Err(ConnectionError::AuthenticationFailed(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.slot().current().is_none());
        assert_eq!(server.count(|call| *call == TransportCall::Connect), 1);
        assert!(logs_contain("failed to connect"));
    }

    #[tokio::test]
    async fn failed_presence_closes_connection() {
        let server = MockServer::register("lifecycle-presence-failure");
        server.fail_presence();
        let (manager, _bus) = manager();

        let result = manager.start(&server.config()).await;

        assert_matches!(result, Err(ConnectionError::StreamError(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!server.is_connected());
        assert!(manager.slot().current().is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let server = MockServer::register("lifecycle-stop");
        let (manager, _bus) = manager();

        manager.stop().await.unwrap();
        manager.start(&server.config()).await.unwrap();
        manager.stop().await.unwrap();
        manager.stop().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!server.is_connected());
        assert_eq!(server.count(|call| *call == TransportCall::Disconnect), 1);
    }

    #[tokio::test]
    async fn reload_always_reconnects() {
        let server = MockServer::register("lifecycle-reload");
        let (manager, _bus) = manager();
        manager.start(&server.config()).await.unwrap();
        server.clear_calls();

        manager.reload(&server.config()).await.unwrap();

        let calls = server.calls();
        assert_eq!(calls[0], TransportCall::Disconnect);
        assert_eq!(calls[1], TransportCall::Connect);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn reload_while_disconnected_connects() {
        let server = MockServer::register("lifecycle-reload-cold");
        let (manager, _bus) = manager();

        manager.reload(&server.config()).await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(server.count(|call| *call == TransportCall::Disconnect), 0);
    }

    #[tokio::test]
    async fn replies_to_remote_initiated_messages() {
        let server = MockServer::register("lifecycle-auto-reply");
        let (manager, bus) = manager();
        let mut events = bus.subscribe("xmpp.autoreply.*").unwrap();
        manager.start(&server.config()).await.unwrap();

        assert!(server.inject(inbound(ALICE, true, Some("hallo?"))));

        eventually(|| !server.sent_messages().is_empty()).await;
        assert_eq!(
            server.sent_messages(),
            vec![(ALICE.to_string(), BOT.to_string())]
        );
        assert_matches!(
            next_payload(&mut events).await,
            EventPayload::AutoReplySent { to } if to == ALICE
        );
    }

    #[tokio::test]
    async fn ignores_local_conversations_and_empty_bodies() {
        let server = MockServer::register("lifecycle-auto-reply-filter");
        let (manager, _bus) = manager();
        manager.start(&server.config()).await.unwrap();

        server.inject(inbound("local@example.org", false, Some("re: hi")));
        server.inject(inbound("empty@example.org", true, Some("")));
        server.inject(inbound("absent@example.org", true, None));
        server.inject(inbound(ALICE, true, Some("hallo?")));

        eventually(|| !server.sent_messages().is_empty()).await;
        assert_eq!(
            server.sent_messages(),
            vec![(ALICE.to_string(), BOT.to_string())]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn auto_reply_failure_is_logged_only() {
        let server = MockServer::register("lifecycle-auto-reply-failure");
        server.fail_send_to(ALICE);
        let (manager, _bus) = manager();
        manager.start(&server.config()).await.unwrap();

        server.inject(inbound(ALICE, true, Some("hallo?")));

        eventually(|| logs_contain("failed to send automatic reply")).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn updated_auto_reply_is_used() {
        let server = MockServer::register("lifecycle-auto-reply-update");
        let (manager, _bus) = manager();
        manager.start(&server.config()).await.unwrap();

        manager.set_auto_reply("§aNeu");
        server.inject(inbound(ALICE, true, Some("hallo?")));

        eventually(|| !server.sent_messages().is_empty()).await;
        assert_eq!(server.sent_messages()[0].1, "Neu");
    }

    #[tokio::test]
    async fn approves_subscription_requests() {
        let server = MockServer::register("lifecycle-subscription");
        let (manager, bus) = manager();
        let mut events = bus.subscribe("xmpp.subscription.*").unwrap();
        manager.start(&server.config()).await.unwrap();

        server.inject(TransportEvent::SubscriptionRequested {
            from: ALICE.to_string(),
        });

        assert_matches!(
            next_payload(&mut events).await,
            EventPayload::SubscriptionApproved { jid } if jid == ALICE
        );
        assert_eq!(
            server.count(|call| matches!(call, TransportCall::ApproveSubscription { jid } if jid == ALICE)),
            1
        );
    }

    #[tokio::test]
    async fn connection_loss_moves_to_disconnected() {
        let server = MockServer::register("lifecycle-lost");
        let (manager, bus) = manager();
        manager.start(&server.config()).await.unwrap();
        let mut events = bus.subscribe("system.connection.lost").unwrap();

        server.inject(TransportEvent::ConnectionLost {
            reason: "stream closed by peer".to_string(),
        });

        assert_matches!(
            next_payload(&mut events).await,
            EventPayload::ConnectionLost { reason } if reason == "stream closed by peer"
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.slot().current().is_none());

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn closed_event_stream_counts_as_loss() {
        let server = MockServer::register("lifecycle-stream-closed");
        let (manager, _bus) = manager();
        manager.start(&server.config()).await.unwrap();

        server.drop_events();

        eventually(|| manager.state() == ConnectionState::Disconnected).await;
        assert!(manager.slot().current().is_none());
    }

    #[test]
    fn state_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connected).unwrap(),
            "\"connected\""
        );
    }
}
