//! Peer-to-peer file sharing brokered by a central index server.
//!
//! Peers keep a control connection to the [`server::IndexServer`], publish
//! files under public names and fetch names published by others. Fetches
//! resolve to peer addresses; file bytes then flow directly between peers
//! over [`transfer`] connections.

pub mod cli;
pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transfer;
