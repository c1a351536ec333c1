//! The index server: tracks connected peers and their published files,
//! and answers operator queries about them.

mod connection;

use crate::config::IndexConfig;
use crate::error::Result;
use crate::registry::{HostFiles, PeerRegistry};
use crate::transfer::{self, ACCEPT_BACKOFF};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Result of pinging one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    Alive(Duration),
    NotAlive(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingReport {
    pub addr: SocketAddr,
    pub outcome: PingOutcome,
}

impl fmt::Display for PingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            PingOutcome::Alive(rtt) => write!(
                f,
                "Ping response from {}: pong in {:.1} ms",
                self.addr,
                rtt.as_secs_f64() * 1000.0
            ),
            PingOutcome::NotAlive(reason) => {
                write!(f, "{} is not alive: {}", self.addr, reason)
            }
        }
    }
}

/// The listening index server
pub struct IndexServer {
    listener: TcpListener,
    handle: ServerHandle,
    shutdown_rx: broadcast::Receiver<()>,
}

impl IndexServer {
    /// Bind the listening socket. Failure here is fatal to the server role.
    pub async fn bind(config: IndexConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = ServerHandle {
            registry: Arc::new(PeerRegistry::new()),
            running: Arc::new(AtomicBool::new(true)),
            shutdown_tx,
            ping_timeout: config.ping_timeout(),
        };

        Ok(Self {
            listener,
            handle,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Operator handle, usable while `run` is in progress
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accept control connections until shutdown, one task per connection.
    /// The listening socket is released when this returns.
    pub async fn run(mut self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Server listening on {}", addr),
            Err(e) => warn!("Server listening on unknown address: {}", e),
        }

        while self.handle.is_running() {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, address)) => {
                            let Some(shutdown) = self.handle.admit() else { break };
                            let registry = self.handle.registry.clone();
                            tokio::spawn(connection::serve_peer(stream, address, registry, shutdown));
                        }
                        Err(e) => {
                            warn!("Error accepting connection: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => break,
            }
        }

        info!("Server stopped accepting connections");
    }
}

/// Operator interface to a running index server
#[derive(Clone)]
pub struct ServerHandle {
    registry: Arc<PeerRegistry>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    ping_timeout: Duration,
}

impl ServerHandle {
    /// Files published by every peer with this hostname
    pub async fn discover(&self, hostname: &str) -> Vec<HostFiles> {
        self.registry.discover(hostname).await
    }

    /// Ping the transfer listener of every peer with this hostname
    pub async fn ping(&self, hostname: &str) -> Vec<PingReport> {
        let addresses = self.registry.find_by_hostname(hostname).await;
        let mut reports = Vec::with_capacity(addresses.len());

        for address in addresses {
            // The peer may have left since the lookup
            let Some(listen_addr) = self
                .registry
                .get(address)
                .await
                .and_then(|record| record.transfer_addr())
            else {
                continue;
            };

            let outcome = match transfer::ping(listen_addr, self.ping_timeout).await {
                Ok(rtt) => PingOutcome::Alive(rtt),
                Err(e) => PingOutcome::NotAlive(e.to_string()),
            };
            reports.push(PingReport {
                addr: listen_addr,
                outcome,
            });
        }

        reports
    }

    /// Stop accepting connections and close every control connection.
    /// Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Shutting down the server...");
            // Receivers may already be gone if the accept loop exited
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Shutdown receiver for a newly accepted connection, or `None` once
    /// the server is stopping. Subscribing before reading the flag means a
    /// concurrent `shutdown` is either seen here or delivered to the receiver.
    fn admit(&self) -> Option<broadcast::Receiver<()>> {
        let shutdown = self.shutdown_tx.subscribe();
        self.is_running().then_some(shutdown)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }
}
