//! Direct peer-to-peer file transfer.
//!
//! The listener side answers `ping` and `download` requests from other
//! peers; the connector side issues them.

mod connector;
mod listener;
mod shared;

pub use connector::{download, ping, DownloadOutcome};
pub use listener::TransferListener;
pub(crate) use listener::ACCEPT_BACKOFF;
pub use shared::SharedFiles;
