pub mod client;
pub mod error;
#[cfg(feature = "native")]
pub mod native;
#[cfg(feature = "native")]
mod sasl;
pub mod slot;
pub mod stanza;
pub mod transport;

pub use client::XmppChatTransport;
pub use error::{ConnectionError, StanzaError};
#[cfg(feature = "native")]
pub use native::{NativeChatTransport, TcpXmppStream};
pub use slot::{TransportOwner, TransportSlot};
pub use stanza::Stanza;
pub use transport::{
    ChatTransport, ConnectionConfig, ConversationId, InboundMessage, PresenceMode, RosterEntry,
    TransportEvent, TransportEvents, XmppStream,
};
