use super::SessionEvent;
use crate::config::PeerConfig;
use crate::error::{Result, ShareError};
use crate::protocol::{ControlReader, ControlWriter, FetchReply, Message, Refusal, SetHostReply};
use crate::registry::validate_hostname;
use crate::transfer::{self, SharedFiles, TransferListener};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// A peer's control session with the index server.
///
/// While the session is open, a background receiver reacts to fetch
/// replies by downloading from the first candidate, and a transfer listener
/// serves this peer's published files to others.
pub struct PeerSession {
    hostname: String,
    listen_addr: SocketAddr,
    writer: Mutex<ControlWriter<OwnedWriteHalf>>,
    files: SharedFiles,
    stop_tx: broadcast::Sender<()>,
    stopped: Arc<AtomicBool>,
    events: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
}

impl PeerSession {
    /// Connect to the index server and claim `config.hostname`.
    ///
    /// The transfer listener is bound first so its port can be advertised;
    /// it only starts serving once the server accepts the hostname.
    pub async fn connect(config: PeerConfig) -> Result<Self> {
        if !validate_hostname(&config.hostname) {
            return Err(ShareError::InvalidHostname(config.hostname));
        }

        let files = SharedFiles::new();
        let listener = TransferListener::bind(config.listen_addr, files.clone()).await?;
        let listen_port = listener.local_addr()?.port();

        let stream = TcpStream::connect(config.server_addr)
            .await
            .map_err(|source| ShareError::ConnectionRefused {
                addr: config.server_addr,
                source,
            })?;
        info!("Connected to index server at {}", config.server_addr);

        let (read_half, write_half) = stream.into_split();
        let mut reader = ControlReader::new(read_half);
        let mut writer = ControlWriter::new(write_half);

        writer
            .send(&Message::sethost(config.hostname.as_str(), Some(listen_port)))
            .await?;

        let listen_addr = match reader.recv().await? {
            Some(Message::SetHostReply(SetHostReply {
                success: true,
                address: Some(address),
                message,
                ..
            })) => {
                info!("{}", message);
                address
            }
            Some(Message::SetHostReply(reply)) => {
                warn!("Hostname rejected: {}", reply.message);
                return Err(refusal_error(reply, &config.hostname));
            }
            Some(Message::Error(ack)) => return Err(ShareError::Rejected(ack.message)),
            Some(other) => {
                return Err(ShareError::Protocol(format!(
                    "Expected sethost reply, got '{}'",
                    other.header()
                )))
            }
            None => return Err(ShareError::ConnectionClosed),
        };

        let (stop_tx, _) = broadcast::channel(1);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let stopped = Arc::new(AtomicBool::new(false));

        tokio::spawn(listener.run(stop_tx.subscribe()));

        let receiver = ControlReceiver {
            reader,
            download_dir: config.download_dir,
            events: event_tx,
            stopped: stopped.clone(),
        };
        tokio::spawn(receiver.run(stop_tx.subscribe()));

        Ok(Self {
            hostname: config.hostname,
            listen_addr,
            writer: Mutex::new(writer),
            files,
            stop_tx,
            stopped,
            events: Mutex::new(Some(event_rx)),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Address the index server hands out for this peer's transfers
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn shared_files(&self) -> &SharedFiles {
        &self.files
    }

    /// Take the event receiver. Only the first caller gets it.
    pub async fn events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.lock().await.take()
    }

    /// Publish the file at `local_name` under `published_name`.
    /// Fails if the file is missing or either name is already published here.
    pub async fn publish(&self, local_name: &str, published_name: &str) -> Result<()> {
        match tokio::fs::metadata(local_name).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => return Err(ShareError::FileNotFound(local_name.to_string())),
        }

        self.files.insert(local_name, published_name).await?;

        if let Err(e) = self.send(&Message::publish(local_name, published_name)).await {
            self.files.remove(published_name).await;
            return Err(e);
        }

        info!("Published '{}' as '{}'", local_name, published_name);
        Ok(())
    }

    /// Ask the index server for `published_name`. The reply is handled in
    /// the background and reported through `events`.
    pub async fn fetch(&self, published_name: &str) -> Result<()> {
        self.send(&Message::fetch(published_name)).await
    }

    /// Leave the network: tell the index server, stop the background tasks
    /// and close both sockets.
    pub async fn quit(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(&Message::Quit).await {
            warn!("Error sending quit to server: {}", e);
        }
        // Receivers are gone if both background tasks already ended
        let _ = self.stop_tx.send(());
        if let Err(e) = writer.shutdown().await {
            debug!("Control socket already closed: {}", e);
        }

        info!("Client connection closed");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &Message) -> Result<()> {
        if self.is_stopped() {
            return Err(ShareError::ConnectionClosed);
        }
        self.writer.lock().await.send(message).await
    }
}

/// Turn a failed `sethost` reply into the matching error
fn refusal_error(reply: SetHostReply, hostname: &str) -> ShareError {
    match reply.reason {
        Some(Refusal::DuplicateHostname) => ShareError::DuplicateHostname(hostname.to_string()),
        Some(Refusal::InvalidHostname) => ShareError::InvalidHostname(hostname.to_string()),
        Some(Refusal::HostnameAlreadySet) => ShareError::HostnameAlreadySet(hostname.to_string()),
        Some(Refusal::UnknownPeer) | None => ShareError::Rejected(reply.message),
    }
}

/// Background reader of the control connection
struct ControlReceiver {
    reader: ControlReader<OwnedReadHalf>,
    download_dir: PathBuf,
    events: mpsc::Sender<SessionEvent>,
    stopped: Arc<AtomicBool>,
}

impl ControlReceiver {
    async fn run(mut self, mut stop: broadcast::Receiver<()>) {
        loop {
            let next = tokio::select! {
                next = self.reader.recv() => next,
                _ = stop.recv() => break,
            };

            match next {
                Ok(Some(Message::FetchReply(reply))) => self.handle_fetch_reply(reply),
                Ok(Some(Message::Error(ack))) => {
                    warn!("Server error: {}", ack.message);
                    self.emit(SessionEvent::ServerError(ack.message));
                }
                Ok(Some(Message::Pong(_))) => debug!("Pong from server"),
                Ok(Some(other)) => warn!("Unexpected '{}' message from server", other.header()),
                Ok(None) => {
                    if !self.stopped.load(Ordering::SeqCst) {
                        info!("Connection closed by the server.");
                        self.emit(SessionEvent::Disconnected);
                    }
                    break;
                }
                Err(ShareError::Protocol(reason)) => {
                    warn!("Malformed message from server: {}", reason);
                }
                Err(e) => {
                    if !self.stopped.load(Ordering::SeqCst) {
                        warn!("Error receiving messages: {}", e);
                        self.emit(SessionEvent::Disconnected);
                    }
                    break;
                }
            }
        }
        debug!("Control receiver stopped");
    }

    fn handle_fetch_reply(&self, reply: FetchReply) {
        let source = match reply.available_clients.first() {
            Some(candidate) if reply.success => candidate.clone(),
            _ => {
                info!("'{}' not found: {}", reply.fname, reply.message);
                self.emit(SessionEvent::NotFound {
                    fname: reply.fname,
                    message: reply.message,
                });
                return;
            }
        };

        let fname = reply.fname;
        let dir = self.download_dir.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = fetch_from(source.address, fname, &dir).await;
            if events.try_send(event).is_err() {
                debug!("Session event dropped; no listener");
            }
        });
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.try_send(event).is_err() {
            debug!("Session event dropped; no listener");
        }
    }
}

async fn fetch_from(addr: SocketAddr, fname: String, dir: &Path) -> SessionEvent {
    match transfer::download(addr, &fname, dir).await {
        Ok(outcome) => {
            info!("Fetch of '{}' from {} succeeded", fname, addr);
            SessionEvent::Downloaded {
                fname,
                path: outcome.path,
                bytes: outcome.bytes,
            }
        }
        Err(e) => {
            warn!("Fetch of '{}' from {} failed: {}", fname, addr, e);
            SessionEvent::DownloadFailed {
                fname,
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::server::{IndexServer, ServerHandle};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn start_server() -> (SocketAddr, ServerHandle) {
        let config = IndexConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ping_timeout_secs: 2,
        };
        let server = IndexServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        tokio::spawn(server.run());
        (addr, handle)
    }

    fn peer_config(server: SocketAddr, hostname: &str, dir: &TempDir) -> PeerConfig {
        PeerConfig {
            server_addr: server,
            hostname: hostname.to_string(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            download_dir: dir.path().join("downloads"),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no session event")
            .expect("event channel closed")
    }

    async fn wait_for_publish(handle: &ServerHandle, hostname: &str, count: usize) {
        for _ in 0..100 {
            let hosts = handle.discover(hostname).await;
            if hosts.iter().map(|h| h.files.len()).sum::<usize>() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never published {} files", hostname, count);
    }

    #[tokio::test]
    async fn test_publish_then_fetch_downloads_identical_file() {
        let (server, handle) = start_server().await;
        let x_dir = tempfile::tempdir().unwrap();
        let y_dir = tempfile::tempdir().unwrap();

        let source = x_dir.path().join("a.txt");
        let contents: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(&source, &contents).unwrap();

        let x = PeerSession::connect(peer_config(server, "x", &x_dir)).await.unwrap();
        let y = PeerSession::connect(peer_config(server, "y", &y_dir)).await.unwrap();
        let mut y_events = y.events().await.unwrap();
        assert!(y.events().await.is_none());

        x.publish(source.to_str().unwrap(), "report").await.unwrap();
        wait_for_publish(&handle, "x", 1).await;

        y.fetch("report").await.unwrap();
        match next_event(&mut y_events).await {
            SessionEvent::Downloaded { fname, path, bytes } => {
                assert_eq!(fname, "report");
                assert_eq!(bytes, contents.len() as u64);
                assert_eq!(path, y_dir.path().join("downloads").join("report"));
                assert_eq!(std::fs::read(&path).unwrap(), contents);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        x.quit().await.unwrap();
        y.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_unpublished_name_reports_not_found() {
        let (server, _handle) = start_server().await;
        let dir = tempfile::tempdir().unwrap();
        let y = PeerSession::connect(peer_config(server, "y", &dir)).await.unwrap();
        let mut events = y.events().await.unwrap();

        y.fetch("report").await.unwrap();
        match next_event(&mut events).await {
            SessionEvent::NotFound { fname, .. } => assert_eq!(fname, "report"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!dir.path().join("downloads").join("report").exists());
    }

    #[tokio::test]
    async fn test_own_file_is_not_a_candidate() {
        let (server, handle) = start_server().await;
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("mine.txt");
        std::fs::write(&source, b"mine").unwrap();

        let x = PeerSession::connect(peer_config(server, "x", &dir)).await.unwrap();
        let mut events = x.events().await.unwrap();
        x.publish(source.to_str().unwrap(), "mine").await.unwrap();
        wait_for_publish(&handle, "x", 1).await;

        x.fetch("mine").await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_hostname_refused_without_serving() {
        let (server, _handle) = start_server().await;
        let dir = tempfile::tempdir().unwrap();

        let _first = PeerSession::connect(peer_config(server, "alice", &dir)).await.unwrap();
        let err = PeerSession::connect(peer_config(server, "alice", &dir))
            .await
            .err()
            .unwrap();
        match err {
            ShareError::DuplicateHostname(hostname) => assert_eq!(hostname, "alice"),
            other => panic!("unexpected error: {:?}", other),
        }

        let err = PeerSession::connect(peer_config(server, "has space", &dir))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ShareError::InvalidHostname(_)));
    }

    #[tokio::test]
    async fn test_publish_validation() {
        let (server, _handle) = start_server().await;
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, b"data").unwrap();
        let x = PeerSession::connect(peer_config(server, "x", &dir)).await.unwrap();

        let missing = dir.path().join("missing.txt");
        assert!(matches!(
            x.publish(missing.to_str().unwrap(), "m").await,
            Err(ShareError::FileNotFound(_))
        ));
        assert!(matches!(
            x.publish(dir.path().to_str().unwrap(), "d").await,
            Err(ShareError::FileNotFound(_))
        ));

        x.publish(source.to_str().unwrap(), "report").await.unwrap();
        assert!(matches!(
            x.publish(source.to_str().unwrap(), "again").await,
            Err(ShareError::AlreadyPublished { .. })
        ));
        assert_eq!(x.shared_files().list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_quit_releases_hostname_and_listener() {
        let (server, handle) = start_server().await;
        let dir = tempfile::tempdir().unwrap();

        let x = PeerSession::connect(peer_config(server, "x", &dir)).await.unwrap();
        let listen_addr = x.listen_addr();
        assert_eq!(listen_addr.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert!(transfer::ping(listen_addr, Duration::from_secs(2)).await.is_ok());

        x.quit().await.unwrap();
        x.quit().await.unwrap();
        assert!(x.is_stopped());
        assert!(matches!(x.fetch("anything").await, Err(ShareError::ConnectionClosed)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        for _ in 0..100 {
            if handle.registry().len().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.registry().len().await, 0);
        assert!(transfer::ping(listen_addr, Duration::from_secs(2)).await.is_err());

        let again = PeerSession::connect(peer_config(server, "x", &dir)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_server_error_reply_becomes_event() {
        // Minimal index server that accepts the hostname, then sends an error
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, w) = stream.into_split();
            let mut reader = ControlReader::new(r);
            let mut writer = ControlWriter::new(w);

            let port = match reader.recv().await.unwrap() {
                Some(Message::SetHost(request)) => request.port.unwrap(),
                other => panic!("unexpected message: {:?}", other),
            };
            let reply = SetHostReply {
                success: true,
                message: "ok".to_string(),
                hostname: Some("x".to_string()),
                address: Some(SocketAddr::from(([127, 0, 0, 1], port))),
                reason: None,
            };
            writer.send(&Message::SetHostReply(reply)).await.unwrap();
            writer.send(&Message::error("storage offline")).await.unwrap();

            // Hold the connection until the peer leaves
            while let Ok(Some(_)) = reader.recv().await {}
        });

        let dir = tempfile::tempdir().unwrap();
        let x = PeerSession::connect(peer_config(server, "x", &dir)).await.unwrap();
        let mut events = x.events().await.unwrap();

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::ServerError("storage offline".to_string())
        );
        x.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_shutdown_reports_disconnect() {
        let (server, handle) = start_server().await;
        let dir = tempfile::tempdir().unwrap();
        let x = PeerSession::connect(peer_config(server, "x", &dir)).await.unwrap();
        let mut events = x.events().await.unwrap();

        handle.shutdown();
        assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    }
}
