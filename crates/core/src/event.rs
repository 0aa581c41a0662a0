use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;

/// Hierarchical channel name, e.g. `system.connection.lost`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Lowercase dot-separated segments, rooted in a known domain.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        matches!(name.split('.').next(), Some("system" | "xmpp"))
    }

    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The envelope every diagnostics event travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

/// Component that emitted an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Bridge component, named (`connection`, `router`, `roster`, ...)
    System(String),
    /// Transport layer
    Xmpp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Connection lifecycle ───────────────────────────────────────
    ConnectionEstablished {
        account: String,
    },
    ConnectionLost {
        reason: String,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Roster ─────────────────────────────────────────────────────
    RosterSynchronized {
        added: Vec<String>,
        removed: Vec<String>,
        failed: Vec<String>,
    },
    SubscriptionApproved {
        jid: String,
    },

    // ── Messaging ──────────────────────────────────────────────────
    MessageDelivered {
        alias: String,
        to: String,
    },
    AutoReplySent {
        to: String,
    },
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

/// Publish `payload` on `channel_name`, dropping the event if the name is
/// invalid or nobody listens. Diagnostics never fail the caller.
pub fn emit(bus: &dyn EventBus, channel_name: &str, source: EventSource, payload: EventPayload) {
    let Ok(channel) = Channel::new(channel_name) else {
        return;
    };
    let _ = bus.publish(Event::new(channel, source, payload));
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    xmpp_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (xmpp_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            xmpp_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "xmpp" => Some(&self.xmpp_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(&self, pattern: &str) -> Result<DomainReceivers, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                xmpp: Some(self.xmpp_sender.subscribe()),
            });
        }

        match first_segment {
            "system" => Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                xmpp: None,
            }),
            "xmpp" => Ok(DomainReceivers {
                system: None,
                xmpp: Some(self.xmpp_sender.subscribe()),
            }),
            _ => Err(EventBusError::InvalidPattern(pattern.to_string())),
        }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        // No receivers is not an error.
        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    xmpp: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let received = tokio::select! {
                result = recv_from_domain(self.receivers.system.as_mut()) => result,
                result = recv_from_domain(self.receivers.xmpp.as_mut()) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', ']', '{', '}', '!'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn make_event(channel: &str, payload: EventPayload) -> Event {
        Event::new(
            Channel::new(channel).unwrap(),
            EventSource::System("test".into()),
            payload,
        )
    }

    fn lost(reason: &str) -> EventPayload {
        EventPayload::ConnectionLost {
            reason: reason.to_string(),
        }
    }

    #[test]
    fn channel_validation() {
        assert!(Channel::is_valid("system.connection.lost"));
        assert!(Channel::is_valid("xmpp.roster.synchronized"));

        assert!(!Channel::is_valid("ui.theme.changed"));
        assert!(!Channel::is_valid("system..double.dot"));
        assert!(!Channel::is_valid(".starts.with.dot"));
        assert!(!Channel::is_valid("xmpp.ends.with.dot."));
        assert!(!Channel::is_valid("System.Upper"));
        assert!(!Channel::is_valid("xmpp.with-hyphen"));
        assert!(!Channel::is_valid(""));
    }

    #[test]
    fn channel_domain_and_display() {
        let channel = Channel::new("xmpp.message.delivered").unwrap();
        assert_eq!(channel.domain(), "xmpp");
        assert_eq!(channel.to_string(), "xmpp.message.delivered");
    }

    #[test]
    fn events_get_unique_ids() {
        let first = make_event("system.connection.lost", lost("a"));
        let second = make_event("system.connection.lost", lost("a"));
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn payload_serializes_camel_case_with_tag() {
        let payload = EventPayload::MessageDelivered {
            alias: "al".to_string(),
            to: "alice@example.org".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "messageDelivered");
        assert_eq!(json["data"]["to"], "alice@example.org");
    }

    #[tokio::test]
    async fn subscriber_receives_matching_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("system.**").unwrap();

        bus.publish(make_event("system.connection.lost", lost("eof")))
            .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "system.connection.lost");
    }

    #[tokio::test]
    async fn other_domain_is_not_delivered() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("system.**").unwrap();

        bus.publish(make_event(
            "xmpp.autoreply.sent",
            EventPayload::AutoReplySent {
                to: "alice@example.org".into(),
            },
        ))
        .unwrap();

        let result = timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(result.is_err(), "system subscriber must not see xmpp events");
    }

    #[tokio::test]
    async fn pattern_filters_within_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("system.connection.*").unwrap();

        bus.publish(make_event(
            "system.error.occurred",
            EventPayload::ErrorOccurred {
                component: "router".into(),
                message: "boom".into(),
                recoverable: true,
            },
        ))
        .unwrap();
        bus.publish(make_event("system.connection.lost", lost("eof")))
            .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "system.connection.lost");
    }

    #[tokio::test]
    async fn wildcard_domain_receives_everything() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("*.**").unwrap();

        bus.publish(make_event(
            "xmpp.subscription.approved",
            EventPayload::SubscriptionApproved {
                jid: "bob@example.org".into(),
            },
        ))
        .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.domain(), "xmpp");
    }

    #[test]
    fn publish_without_subscribers_succeeds() {
        let bus = BroadcastEventBus::default();
        assert!(
            bus.publish(make_event("system.connection.lost", lost("eof")))
                .is_ok()
        );
    }

    #[test]
    fn subscribe_rejects_unknown_domain() {
        let bus = BroadcastEventBus::default();
        assert!(matches!(
            bus.subscribe("ui.**"),
            Err(EventBusError::InvalidPattern(_))
        ));
        assert!(matches!(
            bus.subscribe(""),
            Err(EventBusError::InvalidPattern(_))
        ));
    }

    #[test]
    fn emit_ignores_invalid_channel_names() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("system.**").unwrap();
        emit(&bus, "Not Valid", EventSource::Xmpp, lost("x"));
        assert!(matches!(
            sub.receivers.system.as_mut().unwrap().try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
