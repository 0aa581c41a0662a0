use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use xmppchat_core::event::{EventBus, EventPayload, EventSource, emit};
use xmppchat_xmpp::{ChatTransport, ConnectionError, TransportSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    Add,
    Remove,
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOperation::Add => f.write_str("add"),
            SyncOperation::Remove => f.write_str("remove"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub jid: String,
    pub operation: SyncOperation,
    pub cause: ConnectionError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterSyncSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RosterSyncError {
    #[error("cannot synchronize roster while disconnected")]
    NotConnected,

    #[error("failed to read roster: {0}")]
    Snapshot(#[source] ConnectionError),

    #[error("{} roster operation(s) failed", .failures.len())]
    Partial {
        summary: RosterSyncSummary,
        failures: Vec<SyncFailure>,
    },
}

impl RosterSyncError {
    /// Identifiers whose add or remove request failed.
    pub fn failed_ids(&self) -> Vec<&str> {
        match self {
            RosterSyncError::Partial { failures, .. } => {
                failures.iter().map(|failure| failure.jid.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Brings the transport's roster in line with the full desired identifier
/// set.
///
/// Not transactional: entries that were changed stay changed when a later
/// request fails, and running it again is safe. Subscription requests sent
/// back by added peers are approved by the connection lifecycle.
pub struct RosterSynchronizer<T> {
    slot: TransportSlot<T>,
    event_bus: Arc<dyn EventBus>,
}

impl<T> RosterSynchronizer<T>
where
    T: ChatTransport,
{
    pub fn new(slot: TransportSlot<T>, event_bus: Arc<dyn EventBus>) -> Self {
        Self { slot, event_bus }
    }

    pub async fn synchronize(
        &self,
        desired: &BTreeSet<String>,
        remove_extra: bool,
    ) -> Result<RosterSyncSummary, RosterSyncError> {
        let transport = self.slot.current().ok_or(RosterSyncError::NotConnected)?;
        let current: BTreeSet<String> = transport
            .roster_snapshot()
            .await
            .map_err(RosterSyncError::Snapshot)?
            .into_iter()
            .map(|entry| entry.jid)
            .collect();

        let mut summary = RosterSyncSummary::default();
        let mut failures = Vec::new();

        if remove_extra {
            for jid in current.difference(desired) {
                match transport.remove_roster_entry(jid).await {
                    Ok(()) => summary.removed.push(jid.clone()),
                    Err(cause) => {
                        warn!(%jid, %cause, "failed to remove roster entry");
                        failures.push(SyncFailure {
                            jid: jid.clone(),
                            operation: SyncOperation::Remove,
                            cause,
                        });
                    }
                }
            }
        }

        for jid in desired.difference(&current) {
            match transport.add_roster_entry(jid).await {
                Ok(()) => summary.added.push(jid.clone()),
                Err(cause) => {
                    warn!(%jid, %cause, "failed to add roster entry");
                    failures.push(SyncFailure {
                        jid: jid.clone(),
                        operation: SyncOperation::Add,
                        cause,
                    });
                }
            }
        }

        self.emit_synchronized(&summary, &failures);

        if failures.is_empty() {
            if summary.added.is_empty() && summary.removed.is_empty() {
                debug!("roster already in sync");
            } else {
                info!(
                    added = summary.added.len(),
                    removed = summary.removed.len(),
                    "roster synchronized"
                );
            }
            Ok(summary)
        } else {
            Err(RosterSyncError::Partial { summary, failures })
        }
    }

    fn emit_synchronized(&self, summary: &RosterSyncSummary, failures: &[SyncFailure]) {
        emit(
            self.event_bus.as_ref(),
            "xmpp.roster.synchronized",
            EventSource::System("roster".into()),
            EventPayload::RosterSynchronized {
                added: summary.added.clone(),
                removed: summary.removed.clone(),
                failed: failures.iter().map(|failure| failure.jid.clone()).collect(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tracing_test::traced_test;
    use xmppchat_core::event::BroadcastEventBus;
    use xmppchat_test_support::{MockServer, MockTransport, TransportCall};

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    async fn synchronizer(
        server: &MockServer,
    ) -> (RosterSynchronizer<MockTransport>, Arc<dyn EventBus>) {
        let (transport, _events) = MockTransport::connect(&server.config()).await.unwrap();
        let (owner, slot) = TransportSlot::new();
        owner.install(Arc::new(transport));
        let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new(16));
        (
            RosterSynchronizer::new(slot, Arc::clone(&event_bus)),
            event_bus,
        )
    }

    #[tokio::test]
    async fn removes_extra_and_adds_missing() {
        let server = MockServer::register("roster-reconcile").with_roster(&["a", "b", "c"]);
        let (sync, _bus) = synchronizer(&server).await;

        let summary = sync.synchronize(&ids(&["b", "d"]), true).await.unwrap();

        assert_eq!(summary.removed, vec!["a", "c"]);
        assert_eq!(summary.added, vec!["d"]);
        assert_eq!(server.roster(), vec!["b", "d"]);
        assert_eq!(
            server.count(|call| matches!(call, TransportCall::AddRosterEntry { jid } if jid == "b")
                || matches!(call, TransportCall::RemoveRosterEntry { jid } if jid == "b")),
            0
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn removal_failure_does_not_stop_additions() {
        let server = MockServer::register("roster-partial").with_roster(&["a", "b", "c"]);
        server.fail_remove("a");
        let (sync, _bus) = synchronizer(&server).await;

        let error = sync
            .synchronize(&ids(&["b", "d"]), true)
            .await
            .unwrap_err();

        assert_eq!(error.failed_ids(), vec!["a"]);
        assert_matches!(&error, RosterSyncError::Partial { summary, failures } => {
            assert_eq!(summary.removed, vec!["c"]);
            assert_eq!(summary.added, vec!["d"]);
            assert_eq!(failures[0].operation, SyncOperation::Remove);
            assert_matches!(failures[0].cause, ConnectionError::Rejected(_));
        });
        assert_eq!(server.roster(), vec!["a", "b", "d"]);
        assert!(logs_contain("failed to remove roster entry"));
    }

    #[tokio::test]
    async fn keeps_extra_entries_unless_asked() {
        let server = MockServer::register("roster-keep").with_roster(&["a", "b"]);
        let (sync, _bus) = synchronizer(&server).await;

        let summary = sync.synchronize(&ids(&["b", "d"]), false).await.unwrap();

        assert!(summary.removed.is_empty());
        assert_eq!(summary.added, vec!["d"]);
        assert_eq!(server.roster(), vec!["a", "b", "d"]);
    }

    #[tokio::test]
    async fn every_failed_addition_is_reported() {
        let server = MockServer::register("roster-add-failures");
        server.fail_add("x");
        server.fail_add("z");
        let (sync, _bus) = synchronizer(&server).await;

        let error = sync
            .synchronize(&ids(&["x", "y", "z"]), false)
            .await
            .unwrap_err();

        assert_eq!(error.failed_ids(), vec!["x", "z"]);
        assert_eq!(server.roster(), vec!["y"]);
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let server = MockServer::register("roster-idempotent").with_roster(&["a"]);
        let (sync, _bus) = synchronizer(&server).await;

        sync.synchronize(&ids(&["b"]), true).await.unwrap();
        server.clear_calls();
        let summary = sync.synchronize(&ids(&["b"]), true).await.unwrap();

        assert_eq!(summary, RosterSyncSummary::default());
        assert_eq!(server.calls(), vec![TransportCall::RosterSnapshot]);
    }

    #[tokio::test]
    async fn disconnected_synchronizer_reports_not_connected() {
        let (_owner, slot) = TransportSlot::<MockTransport>::new();
        let sync = RosterSynchronizer::new(slot, Arc::new(BroadcastEventBus::new(4)));

        let result = sync.synchronize(&ids(&["a"]), true).await;
        assert_matches!(result, Err(RosterSyncError::NotConnected));
    }

    #[tokio::test]
    async fn snapshot_failure_is_surfaced() {
        let server = MockServer::register("roster-snapshot-failure");
        server.fail_snapshot();
        let (sync, _bus) = synchronizer(&server).await;

        let result = sync.synchronize(&ids(&["a"]), true).await;
        assert_matches!(result, Err(RosterSyncError::Snapshot(ConnectionError::Timeout)));
    }

    #[tokio::test]
    async fn publishes_synchronized_event() {
        let server = MockServer::register("roster-event").with_roster(&["a"]);
        server.fail_add("c");
        let (sync, bus) = synchronizer(&server).await;
        let mut events = bus.subscribe("xmpp.roster.*").unwrap();

        let _ = sync.synchronize(&ids(&["b", "c"]), true).await;

        let event = tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .expect("timed out waiting for roster event")
            .expect("failed to receive roster event");
        assert_matches!(
            event.payload,
            EventPayload::RosterSynchronized { added, removed, failed } => {
                assert_eq!(added, vec!["b"]);
                assert_eq!(removed, vec!["a"]);
                assert_eq!(failed, vec!["c"]);
            }
        );
    }
}
