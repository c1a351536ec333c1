use crate::error::{Result, ShareError};
use crate::protocol::{ControlReader, ControlWriter, FetchReply, Message, Refusal, SetHostReply};
use crate::registry::PeerRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Why a control connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Closed,
    Quit,
    Shutdown,
    Failed,
}

/// One peer's control connection on the index server
struct ControlConnection {
    address: SocketAddr,
    registry: Arc<PeerRegistry>,
    reader: ControlReader<OwnedReadHalf>,
    writer: ControlWriter<OwnedWriteHalf>,
}

/// Serve a control connection until the peer quits, disconnects, or the
/// server shuts down. The peer's registry entry lives exactly as long.
pub(super) async fn serve_peer(
    stream: TcpStream,
    address: SocketAddr,
    registry: Arc<PeerRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) {
    registry.register(address).await;
    info!("New connection from {}", address);

    let (read_half, write_half) = stream.into_split();
    let mut conn = ControlConnection {
        address,
        registry: registry.clone(),
        reader: ControlReader::new(read_half),
        writer: ControlWriter::new(write_half),
    };

    let ending = tokio::select! {
        ending = conn.run() => ending,
        _ = shutdown.recv() => Ending::Shutdown,
    };

    registry.mark_offline(address).await;
    registry.remove(address).await;

    match ending {
        Ending::Quit => info!("The client {} has quit", address),
        other => info!("Connection from {} closed ({:?})", address, other),
    }
}

impl ControlConnection {
    async fn run(&mut self) -> Ending {
        loop {
            match self.reader.recv().await {
                Ok(None) => return Ending::Closed,
                Ok(Some(Message::Quit)) => return Ending::Quit,
                Ok(Some(message)) => {
                    if let Err(e) = self.dispatch(message).await {
                        warn!("Error handling client {}: {}", self.address, e);
                        if e.is_disconnect() {
                            return Ending::Closed;
                        }
                        return Ending::Failed;
                    }
                }
                Err(ShareError::Protocol(reason)) => {
                    warn!("Rejected message from {}: {}", self.address, reason);
                    if let Err(e) = self.writer.send(&Message::error(reason)).await {
                        warn!("Error replying to {}: {}", self.address, e);
                        return Ending::Failed;
                    }
                }
                Err(e) if e.is_disconnect() => return Ending::Closed,
                Err(e) => {
                    warn!("Error reading from {}: {}", self.address, e);
                    return Ending::Failed;
                }
            }
        }
    }

    async fn dispatch(&mut self, message: Message) -> Result<()> {
        debug!("{} -> {}", self.address, message.header());

        match message {
            Message::SetHost(request) => {
                let port = request.port.unwrap_or(self.address.port());
                let listen_addr = SocketAddr::new(self.address.ip(), port);

                let reply = match self
                    .registry
                    .set_hostname(self.address, &request.hostname, listen_addr)
                    .await
                {
                    Ok(()) => SetHostReply {
                        success: true,
                        message: format!(
                            "Hostname '{}' set for {}",
                            request.hostname, self.address
                        ),
                        hostname: Some(request.hostname),
                        address: Some(listen_addr),
                        reason: None,
                    },
                    Err(e) => {
                        info!("Hostname request from {} refused: {}", self.address, e);
                        SetHostReply {
                            success: false,
                            message: e.to_string(),
                            hostname: None,
                            address: None,
                            reason: Refusal::of(&e),
                        }
                    }
                };
                self.writer.send(&Message::SetHostReply(reply)).await
            }
            Message::Publish(request) => {
                if let Err(e) = self
                    .registry
                    .publish(self.address, &request.lname, &request.fname)
                    .await
                {
                    warn!("Publish from {} refused: {}", self.address, e);
                }
                Ok(())
            }
            Message::Fetch(request) => {
                let reply = match self.registry.resolve(&request.fname, self.address).await {
                    Ok(resolution) => FetchReply {
                        success: true,
                        message: format!(
                            "'{}' is available from {}",
                            request.fname, resolution.source.address
                        ),
                        fname: request.fname,
                        available_clients: resolution.candidates,
                    },
                    Err(e) => FetchReply {
                        success: false,
                        message: e.to_string(),
                        fname: request.fname,
                        available_clients: Vec::new(),
                    },
                };
                self.writer.send(&Message::FetchReply(reply)).await
            }
            Message::Ping => self.writer.send(&Message::pong()).await,
            Message::Quit => Ok(()),
            other => {
                let reason = format!("Unexpected '{}' message on control connection", other.header());
                warn!("{} from {}", reason, self.address);
                self.writer.send(&Message::error(reason)).await
            }
        }
    }
}
