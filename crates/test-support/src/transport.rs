//! In-memory [`ChatTransport`] for exercising the bridge without a server.
//!
//! Tests register a [`MockServer`] under a unique server name, shape its
//! roster and failure behaviour, and then connect through
//! [`MockTransport::connect`] with a config naming that server. Every call
//! the bridge makes is recorded as a [`TransportCall`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::mpsc;
use xmppchat_xmpp::{
    ChatTransport, ConnectionConfig, ConnectionError, ConversationId, PresenceMode, RosterEntry,
    TransportEvent, TransportEvents,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect,
    Disconnect,
    PublishPresence { status: String },
    RosterSnapshot,
    AddRosterEntry { jid: String },
    RemoveRosterEntry { jid: String },
    ApproveSubscription { jid: String },
    OpenConversation { jid: String },
    Send { to: String, text: String },
    CloseConversation { peer: String },
}

#[derive(Default)]
struct MockState {
    calls: Vec<TransportCall>,
    roster: BTreeMap<String, Option<PresenceMode>>,
    connected: bool,
    next_conversation: u64,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    fail_connect: Option<ConnectionError>,
    fail_presence: bool,
    fail_snapshot: bool,
    fail_send_to: HashSet<String>,
    fail_add: HashSet<String>,
    fail_remove: HashSet<String>,
    fail_approve: bool,
}

type SharedState = Arc<Mutex<MockState>>;

fn registry() -> &'static Mutex<HashMap<String, SharedState>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, SharedState>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test-side control handle for one mock server.
#[derive(Clone)]
pub struct MockServer {
    name: String,
    state: SharedState,
}

impl MockServer {
    /// Register a fresh server under `name`, replacing any earlier one.
    pub fn register(name: &str) -> Self {
        let state = SharedState::default();
        lock(registry()).insert(name.to_string(), Arc::clone(&state));
        Self {
            name: name.to_string(),
            state,
        }
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            server: self.name.clone(),
            port: None,
            username: "bot".to_string(),
            password: "secret".to_string(),
            resource: "xmppchat".to_string(),
            status: "Ich bin hier.".to_string(),
            timeout_seconds: 1,
        }
    }

    /// Seed roster entries with no presence.
    pub fn with_roster(self, jids: &[&str]) -> Self {
        {
            let mut state = lock(&self.state);
            for jid in jids {
                state.roster.insert(jid.to_string(), None);
            }
        }
        self
    }

    /// Set the presence reported for `jid`, adding it to the roster.
    pub fn set_presence(&self, jid: &str, mode: Option<PresenceMode>) {
        lock(&self.state).roster.insert(jid.to_string(), mode);
    }

    pub fn fail_connect(&self, error: ConnectionError) {
        lock(&self.state).fail_connect = Some(error);
    }

    pub fn fail_presence(&self) {
        lock(&self.state).fail_presence = true;
    }

    pub fn fail_snapshot(&self) {
        lock(&self.state).fail_snapshot = true;
    }

    pub fn fail_send_to(&self, jid: &str) {
        lock(&self.state).fail_send_to.insert(jid.to_string());
    }

    pub fn fail_add(&self, jid: &str) {
        lock(&self.state).fail_add.insert(jid.to_string());
    }

    pub fn fail_remove(&self, jid: &str) {
        lock(&self.state).fail_remove.insert(jid.to_string());
    }

    pub fn fail_approve(&self) {
        lock(&self.state).fail_approve = true;
    }

    /// Deliver `event` on the most recent connection's event stream.
    pub fn inject(&self, event: TransportEvent) -> bool {
        lock(&self.state)
            .events
            .as_ref()
            .is_some_and(|events| events.send(event).is_ok())
    }

    /// Close the most recent connection's event stream.
    pub fn drop_events(&self) {
        lock(&self.state).events = None;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|call| predicate(call)).count()
    }

    /// `(recipient, text)` for every send attempt, failed ones included.
    pub fn sent_messages(&self) -> Vec<(String, String)> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Send { to, text } => Some((to.clone(), text.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn roster(&self) -> Vec<String> {
        lock(&self.state).roster.keys().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

/// One connection to a [`MockServer`].
pub struct MockTransport {
    state: SharedState,
}

impl MockTransport {
    fn record(&self, call: TransportCall) -> MutexGuard<'_, MockState> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state
    }
}

impl ChatTransport for MockTransport {
    async fn connect(config: &ConnectionConfig) -> Result<(Self, TransportEvents), ConnectionError> {
        let state = lock(registry())
            .get(&config.server)
            .cloned()
            .ok_or_else(|| ConnectionError::DnsResolutionFailed(config.server.clone()))?;

        let (events, events_rx) = mpsc::unbounded_channel();
        {
            let mut guard = lock(&state);
            guard.calls.push(TransportCall::Connect);
            if let Some(error) = guard.fail_connect.clone() {
                return Err(error);
            }
            guard.connected = true;
            guard.events = Some(events);
        }

        Ok((Self { state }, events_rx))
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        let mut state = self.record(TransportCall::Disconnect);
        if !state.connected {
            return Err(ConnectionError::NotConnected);
        }
        state.connected = false;
        state.events = None;
        Ok(())
    }

    async fn publish_presence(&self, status: &str) -> Result<(), ConnectionError> {
        let state = self.record(TransportCall::PublishPresence {
            status: status.to_string(),
        });
        if state.fail_presence {
            return Err(ConnectionError::StreamError("presence refused".to_string()));
        }
        Ok(())
    }

    async fn roster_snapshot(&self) -> Result<Vec<RosterEntry>, ConnectionError> {
        let state = self.record(TransportCall::RosterSnapshot);
        if state.fail_snapshot {
            return Err(ConnectionError::Timeout);
        }
        Ok(state
            .roster
            .iter()
            .map(|(jid, presence)| RosterEntry {
                jid: jid.clone(),
                presence: *presence,
            })
            .collect())
    }

    async fn add_roster_entry(&self, jid: &str) -> Result<(), ConnectionError> {
        let mut state = self.record(TransportCall::AddRosterEntry {
            jid: jid.to_string(),
        });
        if state.fail_add.contains(jid) {
            return Err(ConnectionError::Rejected(format!("cannot add {jid}")));
        }
        state.roster.entry(jid.to_string()).or_insert(None);
        Ok(())
    }

    async fn remove_roster_entry(&self, jid: &str) -> Result<(), ConnectionError> {
        let mut state = self.record(TransportCall::RemoveRosterEntry {
            jid: jid.to_string(),
        });
        if state.fail_remove.contains(jid) {
            return Err(ConnectionError::Rejected(format!("cannot remove {jid}")));
        }
        state.roster.remove(jid);
        Ok(())
    }

    async fn approve_subscription(&self, jid: &str) -> Result<(), ConnectionError> {
        let state = self.record(TransportCall::ApproveSubscription {
            jid: jid.to_string(),
        });
        if state.fail_approve {
            return Err(ConnectionError::Rejected(format!("cannot approve {jid}")));
        }
        Ok(())
    }

    async fn open_conversation(&self, jid: &str) -> Result<ConversationId, ConnectionError> {
        let mut state = self.record(TransportCall::OpenConversation {
            jid: jid.to_string(),
        });
        state.next_conversation += 1;
        Ok(ConversationId::new(
            jid,
            format!("mock-{}", state.next_conversation),
        ))
    }

    async fn send_on_conversation(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> Result<(), ConnectionError> {
        let state = self.record(TransportCall::Send {
            to: conversation.peer().to_string(),
            text: text.to_string(),
        });
        if state.fail_send_to.contains(conversation.peer()) {
            return Err(ConnectionError::TransportError(format!(
                "send to {} refused",
                conversation.peer()
            )));
        }
        Ok(())
    }

    async fn close_conversation(&self, conversation: &ConversationId) -> Result<(), ConnectionError> {
        self.record(TransportCall::CloseConversation {
            peer: conversation.peer().to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_and_tracks_roster() {
        let server = MockServer::register("mock-self-test").with_roster(&["a@example.org"]);
        let (transport, _events) = MockTransport::connect(&server.config()).await.unwrap();

        transport.add_roster_entry("b@example.org").await.unwrap();
        transport.remove_roster_entry("a@example.org").await.unwrap();

        assert_eq!(server.roster(), vec!["b@example.org"]);
        assert_eq!(
            server.calls(),
            vec![
                TransportCall::Connect,
                TransportCall::AddRosterEntry {
                    jid: "b@example.org".to_string()
                },
                TransportCall::RemoveRosterEntry {
                    jid: "a@example.org".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn injected_events_reach_latest_connection() {
        let server = MockServer::register("mock-inject");
        let (_transport, mut events) = MockTransport::connect(&server.config()).await.unwrap();

        assert!(server.inject(TransportEvent::SubscriptionRequested {
            from: "c@example.org".to_string()
        }));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::SubscriptionRequested {
                from: "c@example.org".to_string()
            })
        );
    }

    #[tokio::test]
    async fn second_disconnect_reports_not_connected() {
        let server = MockServer::register("mock-disconnect");
        let (transport, _events) = MockTransport::connect(&server.config()).await.unwrap();

        assert!(transport.disconnect().await.is_ok());
        assert!(matches!(
            transport.disconnect().await,
            Err(ConnectionError::NotConnected)
        ));
    }
}
