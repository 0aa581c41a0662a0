use std::fmt;

use tokio::sync::mpsc;
use xmppchat_core::config::XmppConfig;

use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub server: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub resource: String,
    pub status: String,
    pub timeout_seconds: u32,
}

impl ConnectionConfig {
    /// Bare account address, `username@server`.
    pub fn account(&self) -> String {
        format!("{}@{}", self.username, self.server)
    }
}

impl From<&XmppConfig> for ConnectionConfig {
    fn from(config: &XmppConfig) -> Self {
        Self {
            server: config.server.clone(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
            resource: config.resource.clone(),
            status: config.status.clone(),
            timeout_seconds: config.timeout_seconds,
        }
    }
}

/// Raw availability signal a peer publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceMode {
    Available,
    Chat,
    Away,
    Xa,
    Dnd,
}

/// One subscription record, with the peer's current best presence if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub jid: String,
    pub presence: Option<PresenceMode>,
}

/// Handle for a one-to-one conversation with a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationId {
    peer: String,
    id: String,
}

impl ConversationId {
    pub fn new(peer: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            id: id.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub conversation: ConversationId,
    /// `false` when the local side has a conversation open with the sender.
    pub remote_initiated: bool,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(InboundMessage),
    SubscriptionRequested { from: String },
    ConnectionLost { reason: String },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Chat-level capability the bridge drives.
///
/// `connect` covers connect, authenticate, and session setup; the returned
/// receiver yields inbound events until the connection ends.
pub trait ChatTransport: Send + Sync + 'static {
    fn connect(
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<(Self, TransportEvents), ConnectionError>> + Send
    where
        Self: Sized;

    fn disconnect(&self) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn publish_presence(
        &self,
        status: &str,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn roster_snapshot(
        &self,
    ) -> impl Future<Output = Result<Vec<RosterEntry>, ConnectionError>> + Send;

    fn add_roster_entry(&self, jid: &str)
    -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn remove_roster_entry(
        &self,
        jid: &str,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn approve_subscription(
        &self,
        jid: &str,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn open_conversation(
        &self,
        jid: &str,
    ) -> impl Future<Output = Result<ConversationId, ConnectionError>> + Send;

    fn send_on_conversation(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn close_conversation(
        &self,
        conversation: &ConversationId,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Byte-level XMPP stream.
///
/// Implementations own TCP/TLS, SASL and resource binding. `recv` yields one
/// complete top-level stanza per call.
pub trait XmppStream: Send + 'static {
    fn connect(
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Self, ConnectionError>> + Send
    where
        Self: Sized;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Must be cancel-safe. The session polls it inside `select!` and drops
    /// the future whenever an outbound frame wins, so partially read bytes
    /// have to stay buffered on `self` for the next call.
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, ConnectionError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}
