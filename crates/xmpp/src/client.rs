use std::collections::{BTreeSet, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;
use xmpp_parsers::{
    iq::Iq,
    jid::Jid,
    message::{Message, MessageType},
    minidom::Element,
    ns,
    presence::{Presence, Type as PresenceType},
    roster::{Roster, Subscription},
};

use crate::error::ConnectionError;
use crate::stanza::{self, Stanza};
use crate::transport::{
    ChatTransport, ConnectionConfig, ConversationId, InboundMessage, PresenceMode, RosterEntry,
    TransportEvent, TransportEvents, XmppStream,
};

const OUTBOUND_BUFFER: usize = 64;
const MIN_TIMEOUT_SECONDS: u64 = 1;

type IqReply = Result<Option<Element>, ConnectionError>;

enum Outbound {
    Frame {
        bytes: Vec<u8>,
        ack: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Close {
        ack: oneshot::Sender<Result<(), ConnectionError>>,
    },
}

enum SessionStep {
    Outbound(Option<Outbound>),
    Inbound(Result<Vec<u8>, ConnectionError>),
}

#[derive(Debug, Clone, Copy)]
struct ResourcePresence {
    mode: PresenceMode,
    priority: i8,
}

fn availability_rank(mode: PresenceMode) -> u8 {
    match mode {
        PresenceMode::Chat => 4,
        PresenceMode::Available => 3,
        PresenceMode::Away => 2,
        PresenceMode::Xa => 1,
        PresenceMode::Dnd => 0,
    }
}

/// Roster, presence, and conversation bookkeeping shared between the
/// transport handle and its session task.
struct SessionState {
    /// Bare account address; roster pushes from anyone else are refused.
    account: String,
    roster: RwLock<BTreeSet<String>>,
    presence: RwLock<HashMap<String, HashMap<String, ResourcePresence>>>,
    conversations: RwLock<HashMap<String, HashSet<String>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<IqReply>>>,
}

impl SessionState {
    fn new(account: String) -> Self {
        Self {
            account,
            roster: RwLock::default(),
            presence: RwLock::default(),
            conversations: RwLock::default(),
            pending: Mutex::default(),
        }
    }

    fn replace_roster(&self, jids: impl IntoIterator<Item = String>) {
        let mut roster = self.roster.write().unwrap_or_else(PoisonError::into_inner);
        *roster = jids.into_iter().collect();
    }

    fn roster_insert(&self, jid: String) {
        self.roster
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(jid);
    }

    fn roster_remove(&self, jid: &str) {
        self.roster
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(jid);
    }

    fn best_presence(&self, jid: &str) -> Option<PresenceMode> {
        let presence = self.presence.read().unwrap_or_else(PoisonError::into_inner);
        presence
            .get(jid)?
            .values()
            .max_by_key(|p| (p.priority, availability_rank(p.mode)))
            .map(|p| p.mode)
    }

    fn snapshot(&self) -> Vec<RosterEntry> {
        let roster = self.roster.read().unwrap_or_else(PoisonError::into_inner);
        roster
            .iter()
            .map(|jid| RosterEntry {
                jid: jid.clone(),
                presence: self.best_presence(jid),
            })
            .collect()
    }

    fn set_resource_presence(&self, jid: String, resource: String, update: ResourcePresence) {
        self.presence
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(jid)
            .or_default()
            .insert(resource, update);
    }

    fn clear_resource_presence(&self, jid: &str, resource: &str) {
        let mut presence = self.presence.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(resources) = presence.get_mut(jid) {
            resources.remove(resource);
            if resources.is_empty() {
                presence.remove(jid);
            }
        }
    }

    fn open_conversation(&self, peer: &str, id: &str) {
        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(peer.to_string())
            .or_default()
            .insert(id.to_string());
    }

    fn close_conversation(&self, peer: &str, id: &str) {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(ids) = conversations.get_mut(peer) {
            ids.remove(id);
            if ids.is_empty() {
                conversations.remove(peer);
            }
        }
    }

    /// A push is ours when it has no sender or comes from the account itself.
    fn accepts_roster_push(&self, from: Option<&Jid>) -> bool {
        from.is_none_or(|from| from.to_bare().to_string() == self.account)
    }

    fn has_local_conversation(&self, peer: &str) -> bool {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(peer)
    }

    fn register_request(&self, id: String, reply: oneshot::Sender<IqReply>) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, reply);
    }

    fn forget_request(&self, id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn resolve_request(&self, id: &str, reply: IqReply) {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match sender {
            Some(sender) => {
                let _ = sender.send(reply);
            }
            None => debug!(id, "IQ response without pending request"),
        }
    }

    /// Drop waiting requests and presence once the stream is gone.
    fn end_session(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.presence
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// [`ChatTransport`] speaking XMPP stanzas over an [`XmppStream`].
///
/// A session task owns the stream. It serializes outbound frames, answers
/// roster pushes, correlates IQ responses by id, and keeps the roster and
/// per-resource presence current.
pub struct XmppChatTransport<S> {
    outbound: mpsc::Sender<Outbound>,
    state: Arc<SessionState>,
    request_timeout: Duration,
    _stream: PhantomData<fn() -> S>,
}

impl<S> XmppChatTransport<S>
where
    S: XmppStream,
{
    async fn send_stanza(&self, stanza: Stanza) -> Result<(), ConnectionError> {
        let bytes = stanza.to_bytes()?;
        let (ack, written) = oneshot::channel();
        self.outbound
            .send(Outbound::Frame { bytes, ack })
            .await
            .map_err(|_| ConnectionError::NotConnected)?;
        written.await.map_err(|_| ConnectionError::NotConnected)?
    }

    async fn request(&self, id: String, stanza: Stanza) -> IqReply {
        let (reply, response) = oneshot::channel();
        self.state.register_request(id.clone(), reply);

        if let Err(error) = self.send_stanza(stanza).await {
            self.state.forget_request(&id);
            return Err(error);
        }

        match tokio::time::timeout(self.request_timeout, response).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ConnectionError::NotConnected),
            Err(_) => {
                self.state.forget_request(&id);
                Err(ConnectionError::Timeout)
            }
        }
    }

    async fn load_roster(&self) -> Result<(), ConnectionError> {
        let id = Uuid::new_v4().to_string();
        let payload = self.request(id.clone(), stanza::roster_get(&id)).await?;
        let Some(payload) = payload else {
            self.state.replace_roster(Vec::new());
            return Ok(());
        };

        let roster = Roster::try_from(payload).map_err(|error| {
            ConnectionError::StreamError(format!("invalid roster result: {error}"))
        })?;
        debug!(count = roster.items.len(), "roster loaded");
        self.state
            .replace_roster(roster.items.into_iter().map(|item| item.jid.to_string()));
        Ok(())
    }

    async fn roster_request(
        &self,
        jid: &str,
        subscription: Subscription,
    ) -> Result<(), ConnectionError> {
        let id = Uuid::new_v4().to_string();
        let stanza = stanza::roster_set(&id, jid, subscription)?;
        self.request(id, stanza).await.map(|_| ())
    }
}

impl<S> ChatTransport for XmppChatTransport<S>
where
    S: XmppStream,
{
    async fn connect(
        config: &ConnectionConfig,
    ) -> Result<(Self, TransportEvents), ConnectionError> {
        let account = stanza::parse_bare_jid(&config.account())?.to_string();
        let stream = S::connect(config).await?;

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (events, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SessionState::new(account));
        tokio::spawn(run_session(stream, outbound_rx, events, Arc::clone(&state)));

        let transport = Self {
            outbound,
            state,
            request_timeout: Duration::from_secs(
                u64::from(config.timeout_seconds).max(MIN_TIMEOUT_SECONDS),
            ),
            _stream: PhantomData,
        };
        transport.load_roster().await?;

        info!(account = %config.account(), "XMPP session established");
        Ok((transport, events_rx))
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        let (ack, closed) = oneshot::channel();
        self.outbound
            .send(Outbound::Close { ack })
            .await
            .map_err(|_| ConnectionError::NotConnected)?;
        closed.await.map_err(|_| ConnectionError::NotConnected)?
    }

    async fn publish_presence(&self, status: &str) -> Result<(), ConnectionError> {
        self.send_stanza(stanza::available_presence(status)).await
    }

    async fn roster_snapshot(&self) -> Result<Vec<RosterEntry>, ConnectionError> {
        if self.outbound.is_closed() {
            return Err(ConnectionError::NotConnected);
        }
        Ok(self.state.snapshot())
    }

    async fn add_roster_entry(&self, jid: &str) -> Result<(), ConnectionError> {
        let bare = stanza::parse_bare_jid(jid)?.to_string();
        self.roster_request(&bare, Subscription::None).await?;
        self.state.roster_insert(bare.clone());
        self.send_stanza(stanza::subscription_presence(
            &bare,
            PresenceType::Subscribe,
        )?)
        .await
    }

    async fn remove_roster_entry(&self, jid: &str) -> Result<(), ConnectionError> {
        let bare = stanza::parse_bare_jid(jid)?.to_string();
        self.roster_request(&bare, Subscription::Remove).await?;
        self.state.roster_remove(&bare);
        Ok(())
    }

    async fn approve_subscription(&self, jid: &str) -> Result<(), ConnectionError> {
        self.send_stanza(stanza::subscription_presence(
            jid,
            PresenceType::Subscribed,
        )?)
        .await
    }

    async fn open_conversation(&self, jid: &str) -> Result<ConversationId, ConnectionError> {
        if self.outbound.is_closed() {
            return Err(ConnectionError::NotConnected);
        }
        let peer = stanza::parse_bare_jid(jid)?.to_string();
        let conversation = ConversationId::new(peer, Uuid::new_v4().to_string());
        self.state
            .open_conversation(conversation.peer(), conversation.id());
        Ok(conversation)
    }

    async fn send_on_conversation(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> Result<(), ConnectionError> {
        self.send_stanza(stanza::chat_message(conversation.peer(), text)?)
            .await
    }

    async fn close_conversation(&self, conversation: &ConversationId) -> Result<(), ConnectionError> {
        self.state
            .close_conversation(conversation.peer(), conversation.id());
        Ok(())
    }
}

async fn run_session<S>(
    mut stream: S,
    mut outbound: mpsc::Receiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<SessionState>,
) where
    S: XmppStream,
{
    loop {
        let step = tokio::select! {
            command = outbound.recv() => SessionStep::Outbound(command),
            frame = stream.recv() => SessionStep::Inbound(frame),
        };

        match step {
            SessionStep::Outbound(Some(Outbound::Frame { bytes, ack })) => {
                let result = stream.send(&bytes).await;
                let failure = result.as_ref().err().map(ToString::to_string);
                let _ = ack.send(result);
                if let Some(reason) = failure {
                    connection_lost(&events, &state, reason);
                    return;
                }
            }
            SessionStep::Outbound(Some(Outbound::Close { ack })) => {
                if let Ok(bytes) = stanza::unavailable_presence().to_bytes() {
                    let _ = stream.send(&bytes).await;
                }
                let result = stream.close().await;
                state.end_session();
                info!("XMPP session closed");
                let _ = ack.send(result);
                return;
            }
            SessionStep::Outbound(None) => {
                let _ = stream.close().await;
                state.end_session();
                return;
            }
            SessionStep::Inbound(Ok(frame)) => {
                if let Some(reply) = handle_frame(&frame, &state, &events) {
                    match reply.to_bytes() {
                        Ok(bytes) => {
                            if let Err(error) = stream.send(&bytes).await {
                                connection_lost(&events, &state, error.to_string());
                                return;
                            }
                        }
                        Err(error) => warn!(%error, "failed to serialize reply"),
                    }
                }
            }
            SessionStep::Inbound(Err(error)) => {
                connection_lost(&events, &state, error.to_string());
                return;
            }
        }
    }
}

fn connection_lost(
    events: &mpsc::UnboundedSender<TransportEvent>,
    state: &SessionState,
    reason: String,
) {
    warn!(%reason, "XMPP session lost");
    state.end_session();
    let _ = events.send(TransportEvent::ConnectionLost { reason });
}

/// Apply one inbound stanza, returning a stanza to send back if required.
fn handle_frame(
    frame: &[u8],
    state: &SessionState,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> Option<Stanza> {
    let stanza = stanza::parse_element(frame).and_then(|element| {
        let priority = stanza::presence_priority(&element);
        Stanza::try_from(element).map(|stanza| (stanza, priority))
    });
    let (stanza, priority) = match stanza {
        Ok(parsed) => parsed,
        Err(error) => {
            debug!(%error, "ignoring unparseable frame");
            return None;
        }
    };

    match stanza {
        Stanza::Message(message) => {
            handle_message(*message, state, events);
            None
        }
        Stanza::Presence(presence) => {
            handle_presence(*presence, priority, state, events);
            None
        }
        Stanza::Iq(iq) => handle_iq(*iq, state),
    }
}

fn handle_message(
    message: Message,
    state: &SessionState,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    // Group chat, headlines and errors never open a one-to-one conversation.
    if !matches!(message.type_, MessageType::Chat | MessageType::Normal) {
        return;
    }
    let Some(from) = message.from.as_ref() else {
        return;
    };

    let peer = from.to_bare().to_string();
    let body = message
        .bodies
        .get("")
        .or_else(|| message.bodies.values().next())
        .cloned();
    let id = message
        .id
        .as_ref()
        .map_or_else(|| Uuid::new_v4().to_string(), |id| id.0.clone());

    let _ = events.send(TransportEvent::Message(InboundMessage {
        remote_initiated: !state.has_local_conversation(&peer),
        conversation: ConversationId::new(peer, id),
        body,
    }));
}

fn handle_presence(
    presence: Presence,
    priority: i8,
    state: &SessionState,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let Some(from) = presence.from.as_ref() else {
        return;
    };
    let peer = from.to_bare().to_string();
    let resource = from
        .resource()
        .map(|resource| resource.to_string())
        .unwrap_or_default();

    match presence.type_ {
        PresenceType::None => state.set_resource_presence(
            peer,
            resource,
            ResourcePresence {
                mode: stanza::presence_mode(presence.show.as_ref()),
                priority,
            },
        ),
        PresenceType::Unavailable => state.clear_resource_presence(&peer, &resource),
        PresenceType::Subscribe => {
            let _ = events.send(TransportEvent::SubscriptionRequested { from: peer });
        }
        _ => {}
    }
}

fn handle_iq(iq: Iq, state: &SessionState) -> Option<Stanza> {
    match iq {
        Iq::Result { id, payload, .. } => {
            state.resolve_request(&id, Ok(payload));
            None
        }
        Iq::Error { id, error, .. } => {
            state.resolve_request(
                &id,
                Err(ConnectionError::Rejected(format!(
                    "{:?}",
                    error.defined_condition
                ))),
            );
            None
        }
        Iq::Set {
            from, id, payload, ..
        } if payload.is("query", ns::ROSTER) => {
            if !state.accepts_roster_push(from.as_ref()) {
                warn!(from = ?from, "ignoring roster push from foreign sender");
                return Some(stanza::iq_service_unavailable(&id, from));
            }
            match Roster::try_from(payload) {
                Ok(roster) => {
                    for item in roster.items {
                        if item.subscription == Subscription::Remove {
                            state.roster_remove(&item.jid.to_string());
                        } else {
                            state.roster_insert(item.jid.to_string());
                        }
                    }
                }
                Err(error) => warn!(%error, "failed to parse roster push"),
            }
            Some(stanza::iq_result(&id, None))
        }
        Iq::Get {
            from, id, payload, ..
        } if payload.is("ping", ns::PING) => {
            debug!(%id, "answering ping");
            Some(stanza::iq_result(&id, from))
        }
        Iq::Get { from, id, .. } | Iq::Set { from, id, .. } => {
            debug!(%id, "refusing unsupported IQ request");
            Some(stanza::iq_service_unavailable(&id, from))
        }
    }
}
