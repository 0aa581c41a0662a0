use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, info};

use xmppchat_core::event::{EventBus, EventPayload, EventSource, emit};
use xmppchat_core::{Template, strip_markup};
use xmppchat_directory::SharedDirectory;
use xmppchat_presence::{PresenceStatus, PresenceTracker};
use xmppchat_xmpp::{ChatTransport, ConnectionError, TransportSlot};

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("unknown alias {0}")]
    UnknownAlias(String),

    #[error("{0} is offline")]
    RecipientOffline(String),

    #[error("failed to send message to {jid}: {source}")]
    SendFailed {
        jid: String,
        #[source]
        source: ConnectionError,
    },

    #[error("cannot send messages while disconnected")]
    NotConnected,
}

/// Outcome of a successful [`MessageRouter::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub alias: String,
    pub delivered: Vec<String>,
    pub skipped_offline: Vec<String>,
}

impl DeliveryReport {
    /// The confirmation line shown to the sender, e.g. `(An al) hi`.
    pub fn echo(&self, send_to: &Template, body: &str) -> String {
        strip_markup(&format!("{}{body}", send_to.render(&self.alias))).into_owned()
    }
}

/// Resolves aliases, gates on presence and delivers one-shot messages.
pub struct MessageRouter<T> {
    directory: SharedDirectory,
    presence: PresenceTracker<T>,
    slot: TransportSlot<T>,
    send_from: RwLock<Template>,
    event_bus: Arc<dyn EventBus>,
}

impl<T> MessageRouter<T>
where
    T: ChatTransport,
{
    pub fn new(
        directory: SharedDirectory,
        slot: TransportSlot<T>,
        send_from: Template,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            directory,
            presence: PresenceTracker::new(slot.clone()),
            slot,
            send_from: RwLock::new(send_from),
            event_bus,
        }
    }

    pub fn set_send_from(&self, send_from: Template) {
        *self.send_from.write().unwrap_or_else(PoisonError::into_inner) = send_from;
    }

    /// Deliver `body` to every identifier bound to `alias`.
    ///
    /// Stops at the first failed send; targets after it are not attempted.
    pub async fn send(
        &self,
        alias: &str,
        sender_display: &str,
        body: &str,
        notify_offline: bool,
    ) -> Result<DeliveryReport, MessagingError> {
        let targets = self
            .directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .targets_of(alias)
            .map_err(|_| MessagingError::UnknownAlias(alias.to_string()))?;

        let transport = self.slot.current().ok_or(MessagingError::NotConnected)?;

        let mut recipients = Vec::with_capacity(targets.len());
        let mut skipped_offline = Vec::new();
        for jid in &targets {
            let status = self.presence.status_of(jid).await;
            if status == PresenceStatus::Offline && !notify_offline {
                if targets.len() == 1 {
                    debug!(%alias, %jid, "recipient offline, not sending");
                    return Err(MessagingError::RecipientOffline(alias.to_string()));
                }
                debug!(%alias, %jid, "skipping offline recipient");
                skipped_offline.push(jid.clone());
                continue;
            }
            recipients.push(jid.clone());
        }

        let prefix = self
            .send_from
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .render(sender_display);
        let text = strip_markup(&format!("{prefix}{body}")).into_owned();

        let mut delivered = Vec::with_capacity(recipients.len());
        for jid in recipients {
            if let Err(source) = deliver(transport.as_ref(), &jid, &text).await {
                error!(%alias, %jid, error = %source, "failed to send message");
                return Err(MessagingError::SendFailed { jid, source });
            }

            info!(%alias, %jid, "message delivered");
            emit(
                self.event_bus.as_ref(),
                "xmpp.message.delivered",
                EventSource::System("router".into()),
                EventPayload::MessageDelivered {
                    alias: alias.to_string(),
                    to: jid.clone(),
                },
            );
            delivered.push(jid);
        }

        Ok(DeliveryReport {
            alias: alias.to_string(),
            delivered,
            skipped_offline,
        })
    }
}

/// Open a conversation, send once and close it again, also after a failed
/// send.
async fn deliver<T: ChatTransport>(
    transport: &T,
    jid: &str,
    text: &str,
) -> Result<(), ConnectionError> {
    let conversation = transport.open_conversation(jid).await?;
    let sent = transport.send_on_conversation(&conversation, text).await;
    if let Err(close_error) = transport.close_conversation(&conversation).await {
        debug!(%conversation, error = %close_error, "failed to close conversation");
    }
    sent
}
