//! Command-facing entry point of the XMPP chat bridge.
//!
//! The host loads a [`xmppchat_core::Config`], builds a [`ChatBridge`] and
//! drives it with enable, reload and disable plus the contact and send
//! operations its commands map to.

mod chat;
pub mod connection;
mod error;

pub use chat::{ChatBridge, ContactStatus};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::BridgeError;

/// Bridge wired to a real server over TCP/STARTTLS.
pub type XmppChatBridge = ChatBridge<xmppchat_xmpp::NativeChatTransport>;

pub use xmppchat_directory::Contact;
pub use xmppchat_messaging::DeliveryReport;
pub use xmppchat_presence::PresenceStatus;
pub use xmppchat_roster::RosterSyncSummary;
