mod session;

pub use session::PeerSession;

use std::path::PathBuf;

/// Notifications from a peer's background control receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A fetched file was downloaded from another peer
    Downloaded {
        fname: String,
        path: PathBuf,
        bytes: u64,
    },
    /// A fetch resolved, but the transfer itself failed
    DownloadFailed { fname: String, reason: String },
    /// No other peer publishes the requested name
    NotFound { fname: String, message: String },
    /// The index server rejected one of our messages
    ServerError(String),
    /// The control connection to the index server is gone
    Disconnected,
}
