use super::{validate_hostname, HostFiles, PeerRecord, PeerStatus, PublishedFile};
use crate::error::{Result, ShareError};
use crate::protocol::Candidate;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Outcome of resolving a published name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// First matching publisher, by lowest control address
    pub source: Candidate,
    /// Name of the file on the source peer's disk
    pub local_name: String,
    /// Every online publisher of the name except the requester, source first
    pub candidates: Vec<Candidate>,
}

/// In-memory table of peers connected to the index server.
///
/// All state lives behind one mutex that is held only for the duration of a
/// single operation, never across socket I/O.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<BTreeMap<SocketAddr, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record for a freshly accepted control connection
    pub async fn register(&self, address: SocketAddr) {
        let mut peers = self.peers.lock().await;
        peers.insert(address, PeerRecord::new(address));
        debug!("Registered peer {} ({} connected)", address, peers.len());
    }

    /// Assign a hostname and transfer address to a peer. The hostname must
    /// be unique among online peers and can be set only once.
    pub async fn set_hostname(
        &self,
        address: SocketAddr,
        hostname: &str,
        listen_addr: SocketAddr,
    ) -> Result<()> {
        if !validate_hostname(hostname) {
            return Err(ShareError::InvalidHostname(hostname.to_string()));
        }

        let mut peers = self.peers.lock().await;

        let taken = peers.values().any(|p| {
            p.address != address && p.is_online() && p.hostname.as_deref() == Some(hostname)
        });

        let record = peers
            .get_mut(&address)
            .ok_or(ShareError::UnknownPeer(address))?;

        if let Some(existing) = &record.hostname {
            return Err(ShareError::HostnameAlreadySet(existing.clone()));
        }
        if taken {
            return Err(ShareError::DuplicateHostname(hostname.to_string()));
        }

        record.hostname = Some(hostname.to_string());
        record.listen_addr = Some(listen_addr);

        info!("Hostname '{}' set for {} (serving on {})", hostname, address, listen_addr);
        Ok(())
    }

    /// Record a file published by a peer. A peer may not reuse either name.
    pub async fn publish(
        &self,
        address: SocketAddr,
        local_name: &str,
        published_name: &str,
    ) -> Result<()> {
        let mut peers = self.peers.lock().await;
        let record = peers
            .get_mut(&address)
            .ok_or(ShareError::UnknownPeer(address))?;

        let duplicate = record
            .files
            .iter()
            .any(|f| f.local_name == local_name || f.published_name == published_name);
        if duplicate {
            return Err(ShareError::AlreadyPublished {
                local_name: local_name.to_string(),
                published_name: published_name.to_string(),
            });
        }

        record.files.push(PublishedFile {
            local_name: local_name.to_string(),
            published_name: published_name.to_string(),
        });

        info!(
            "File '{}' published by {} with local name '{}'",
            published_name, address, local_name
        );
        Ok(())
    }

    /// Find online peers publishing `published_name`, never including
    /// `excluding`. Peers without a transfer address are skipped.
    pub async fn resolve(&self, published_name: &str, excluding: SocketAddr) -> Result<Resolution> {
        let peers = self.peers.lock().await;

        let mut matches = peers.values().filter_map(|p| {
            if p.address == excluding || !p.is_online() {
                return None;
            }
            let file = p.find_file(published_name)?;
            Some((p.as_candidate()?, file))
        });

        let (source, file) = matches
            .next()
            .ok_or_else(|| ShareError::NotFound(published_name.to_string()))?;
        let local_name = file.local_name.clone();

        let mut candidates = vec![source.clone()];
        candidates.extend(matches.map(|(candidate, _)| candidate));

        Ok(Resolution {
            source,
            local_name,
            candidates,
        })
    }

    pub async fn mark_offline(&self, address: SocketAddr) -> bool {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(&address) {
            Some(record) => {
                record.status = PeerStatus::Offline;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, address: SocketAddr) -> Option<PeerRecord> {
        let removed = self.peers.lock().await.remove(&address);
        if removed.is_some() {
            debug!("Removed peer {}", address);
        }
        removed
    }

    /// Control addresses of every peer with this hostname
    pub async fn find_by_hostname(&self, hostname: &str) -> Vec<SocketAddr> {
        let peers = self.peers.lock().await;
        peers
            .values()
            .filter(|p| p.hostname.as_deref() == Some(hostname))
            .map(|p| p.address)
            .collect()
    }

    /// Published files of every peer with this hostname
    pub async fn discover(&self, hostname: &str) -> Vec<HostFiles> {
        let peers = self.peers.lock().await;
        peers
            .values()
            .filter(|p| p.hostname.as_deref() == Some(hostname))
            .filter_map(|p| {
                Some(HostFiles {
                    address: p.address,
                    listen_addr: p.transfer_addr()?,
                    files: p.files.clone(),
                })
            })
            .collect()
    }

    pub async fn get(&self, address: SocketAddr) -> Option<PeerRecord> {
        self.peers.lock().await.get(&address).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }
}
