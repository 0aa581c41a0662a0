use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use xmppchat_core::{Config, Template};
use xmppchat_core::event::{BroadcastEventBus, EventBus, EventPayload, EventSource, emit};
use xmppchat_directory::{Contact, ContactDirectory, DirectoryError, SharedDirectory};
use xmppchat_messaging::{DeliveryReport, MessageRouter};
use xmppchat_presence::{PresenceStatus, PresenceTracker};
use xmppchat_roster::{RosterSyncSummary, RosterSynchronizer};
use xmppchat_xmpp::{ChatTransport, ConnectionConfig};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::BridgeError;

/// A directory entry together with its live presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactStatus {
    pub id: String,
    pub aliases: Vec<String>,
    pub status: PresenceStatus,
}

struct Settings {
    connection: ConnectionConfig,
    notify_offline: bool,
    manage_buddy_list: bool,
    send_to: Template,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            connection: ConnectionConfig::from(&config.xmpp),
            notify_offline: config.settings.notify_offline,
            manage_buddy_list: config.settings.manage_buddy_list,
            send_to: Template::new(config.messages.send_to.clone()),
        }
    }
}

fn directory_from(config: &Config) -> Result<ContactDirectory, DirectoryError> {
    ContactDirectory::from_entries(
        config
            .contacts
            .iter()
            .map(|(id, aliases)| (id.clone(), aliases.clone())),
    )
}

/// Everything the command layer calls into: lifecycle, contacts, sending.
pub struct ChatBridge<T> {
    settings: RwLock<Settings>,
    directory: SharedDirectory,
    /// Serializes directory mutations and the roster synchronization that
    /// follows each of them.
    mutations: AsyncMutex<()>,
    connection: ConnectionManager<T>,
    presence: PresenceTracker<T>,
    roster: RosterSynchronizer<T>,
    router: MessageRouter<T>,
    event_bus: Arc<dyn EventBus>,
}

impl<T> ChatBridge<T>
where
    T: ChatTransport,
{
    pub fn new(config: &Config, event_bus: Arc<dyn EventBus>) -> Result<Self, BridgeError> {
        let directory = directory_from(config)?.into_shared();
        let connection =
            ConnectionManager::new(config.messages.bot_response.clone(), Arc::clone(&event_bus));
        let slot = connection.slot();

        Ok(Self {
            settings: RwLock::new(Settings::from(config)),
            presence: PresenceTracker::new(slot.clone()),
            roster: RosterSynchronizer::new(slot.clone(), Arc::clone(&event_bus)),
            router: MessageRouter::new(
                Arc::clone(&directory),
                slot,
                Template::new(config.messages.send_from.clone()),
                Arc::clone(&event_bus),
            ),
            directory,
            mutations: AsyncMutex::new(()),
            connection,
            event_bus,
        })
    }

    /// Build a bridge with its own event bus sized from `config.event_bus`.
    pub fn from_config(config: &Config) -> Result<Self, BridgeError> {
        let event_bus = Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));
        Self::new(config, event_bus)
    }

    pub fn event_bus(&self) -> Arc<dyn EventBus> {
        Arc::clone(&self.event_bus)
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Connect, publish presence, and synchronize the roster.
    ///
    /// Only a failed connect is an error; roster problems are logged.
    pub async fn enable(&self) -> Result<(), BridgeError> {
        let connection = self.connection_config();
        self.connection.start(&connection).await?;
        self.synchronize_logged().await;
        Ok(())
    }

    /// Replace the contact directory and settings with `config`, then
    /// reconnect.
    ///
    /// An invalid contact list is rejected before anything changes.
    pub async fn reload(&self, config: &Config) -> Result<(), BridgeError> {
        let directory = directory_from(config)?;
        {
            let _mutation = self.mutations.lock().await;
            self.directory
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .replace_all(directory);
        }

        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = Settings::from(config);
        self.router
            .set_send_from(Template::new(config.messages.send_from.clone()));
        self.connection
            .set_auto_reply(config.messages.bot_response.clone());

        self.connection
            .reload(&ConnectionConfig::from(&config.xmpp))
            .await?;
        self.synchronize_logged().await;
        info!("configuration reloaded");
        Ok(())
    }

    pub async fn disable(&self) -> Result<(), BridgeError> {
        self.connection.stop().await?;
        Ok(())
    }

    pub async fn add_contact(&self, id: &str, aliases: Vec<String>) -> Result<(), BridgeError> {
        let _mutation = self.mutations.lock().await;
        self.directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_contact(id, aliases)?;
        info!(%id, "contact added");
        self.synchronize_if_connected().await;
        Ok(())
    }

    pub async fn remove_contact(&self, id: &str) -> Result<Contact, BridgeError> {
        let _mutation = self.mutations.lock().await;
        let removed = self
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_contact(id)?;
        info!(%id, "contact removed");
        self.synchronize_if_connected().await;
        Ok(removed)
    }

    /// Directory contents in insertion order.
    pub fn contacts(&self) -> Vec<Contact> {
        self.directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .all()
            .to_vec()
    }

    /// Every contact with its aliases and live status, for listing.
    pub async fn contact_listing(&self) -> Vec<ContactStatus> {
        let contacts = self.contacts();
        let mut listing = Vec::with_capacity(contacts.len());
        for contact in contacts {
            let status = self.presence.status_of(&contact.id).await;
            listing.push(ContactStatus {
                id: contact.id,
                aliases: contact.aliases,
                status,
            });
        }
        listing
    }

    pub async fn status_of(&self, id: &str) -> PresenceStatus {
        self.presence.status_of(id).await
    }

    pub async fn send_message(
        &self,
        alias: &str,
        sender_display: &str,
        body: &str,
    ) -> Result<DeliveryReport, BridgeError> {
        let notify_offline = self.read_settings(|settings| settings.notify_offline);
        Ok(self
            .router
            .send(alias, sender_display, body, notify_offline)
            .await?)
    }

    /// The `send_to` confirmation line for a successful send.
    pub fn echo(&self, report: &DeliveryReport, body: &str) -> String {
        self.read_settings(|settings| report.echo(&settings.send_to, body))
    }

    /// Reconcile the roster with the full directory now.
    pub async fn synchronize_roster(&self) -> Result<RosterSyncSummary, BridgeError> {
        let _mutation = self.mutations.lock().await;
        self.synchronize().await
    }

    async fn synchronize(&self) -> Result<RosterSyncSummary, BridgeError> {
        let desired = self
            .directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .desired_ids();
        let remove_extra = self.read_settings(|settings| settings.manage_buddy_list);
        Ok(self.roster.synchronize(&desired, remove_extra).await?)
    }

    async fn synchronize_logged(&self) {
        let _mutation = self.mutations.lock().await;
        self.report_sync(self.synchronize().await);
    }

    /// Caller must hold `mutations`.
    async fn synchronize_if_connected(&self) {
        if self.state() != ConnectionState::Connected {
            debug!("not connected, roster synchronization deferred");
            return;
        }
        self.report_sync(self.synchronize().await);
    }

    fn report_sync(&self, result: Result<RosterSyncSummary, BridgeError>) {
        if let Err(error) = result {
            warn!(%error, "roster synchronization incomplete");
            emit(
                self.event_bus.as_ref(),
                "system.error.occurred",
                EventSource::System("roster".into()),
                EventPayload::ErrorOccurred {
                    component: "roster".to_string(),
                    message: error.to_string(),
                    recoverable: true,
                },
            );
        }
    }

    fn connection_config(&self) -> ConnectionConfig {
        self.read_settings(|settings| settings.connection.clone())
    }

    fn read_settings<R>(&self, read: impl FnOnce(&Settings) -> R) -> R {
        read(&self.settings.read().unwrap_or_else(PoisonError::into_inner))
    }
}
