mod peer_registry;

pub use peer_registry::{PeerRegistry, Resolution};

use crate::protocol::Candidate;
use serde::Serialize;
use std::net::SocketAddr;

/// Connection status of a registered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
}

/// A file a peer has made available
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedFile {
    /// Name of the file on the owning peer's disk
    pub local_name: String,
    /// Name advertised to other peers
    pub published_name: String,
}

/// Registry entry for one control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Remote address of the control connection
    pub address: SocketAddr,
    /// Where the peer serves transfers, known once the hostname is set
    pub listen_addr: Option<SocketAddr>,
    pub hostname: Option<String>,
    pub status: PeerStatus,
    pub files: Vec<PublishedFile>,
}

impl PeerRecord {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            listen_addr: None,
            hostname: None,
            status: PeerStatus::Online,
            files: Vec::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == PeerStatus::Online
    }

    /// Address other peers connect to for downloads. A peer that has not
    /// set its hostname serves nothing.
    pub fn transfer_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn find_file(&self, published_name: &str) -> Option<&PublishedFile> {
        self.files.iter().find(|f| f.published_name == published_name)
    }

    fn as_candidate(&self) -> Option<Candidate> {
        Some(Candidate {
            hostname: self.hostname.clone(),
            address: self.transfer_addr()?,
        })
    }
}

/// Files published under one host, as reported by `discover`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFiles {
    pub address: SocketAddr,
    pub listen_addr: SocketAddr,
    pub files: Vec<PublishedFile>,
}

/// Hostnames must be non-empty and free of whitespace
pub fn validate_hostname(hostname: &str) -> bool {
    !hostname.is_empty() && !hostname.chars().any(char::is_whitespace)
}
