use xmppchat_directory::DirectoryError;
use xmppchat_messaging::MessagingError;
use xmppchat_roster::RosterSyncError;
use xmppchat_xmpp::ConnectionError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("roster synchronization failed: {0}")]
    RosterSync(#[from] RosterSyncError),
}
