use serde::Serialize;
use tracing::warn;

use xmppchat_xmpp::{ChatTransport, PresenceMode, TransportSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceStatus {
    Present,
    Away,
    Offline,
}

/// Collapse a peer's raw presence mode into the status used for delivery
/// gating.
///
/// "away" maps to [`PresenceStatus::Offline`], not `Away`. Extended away and
/// do-not-disturb are the modes reported as `Away`.
pub fn status_from_mode(mode: Option<PresenceMode>) -> PresenceStatus {
    match mode {
        Some(PresenceMode::Available | PresenceMode::Chat) => PresenceStatus::Present,
        Some(PresenceMode::Away) => PresenceStatus::Offline,
        Some(PresenceMode::Xa | PresenceMode::Dnd) => PresenceStatus::Away,
        None => PresenceStatus::Offline,
    }
}

/// Answers presence queries against whichever transport is active at the
/// time of the call. Nothing is cached.
pub struct PresenceTracker<T> {
    slot: TransportSlot<T>,
}

impl<T> Clone for PresenceTracker<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> PresenceTracker<T>
where
    T: ChatTransport,
{
    pub fn new(slot: TransportSlot<T>) -> Self {
        Self { slot }
    }

    pub async fn status_of(&self, id: &str) -> PresenceStatus {
        let Some(transport) = self.slot.current() else {
            return PresenceStatus::Offline;
        };

        match transport.roster_snapshot().await {
            Ok(entries) => status_from_mode(
                entries
                    .into_iter()
                    .find(|entry| entry.jid == id)
                    .and_then(|entry| entry.presence),
            ),
            Err(error) => {
                warn!(%id, %error, "roster snapshot failed, treating contact as offline");
                PresenceStatus::Offline
            }
        }
    }
}
