use super::SharedFiles;
use crate::error::{Result, ShareError};
use crate::protocol::{write_frame, ControlReader, ControlWriter, Message, TransferHeader, CHUNK_SIZE};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Pause after a failed accept so fd exhaustion does not spin the loop
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serves ping and download requests from other peers
pub struct TransferListener {
    listener: TcpListener,
    files: SharedFiles,
}

impl TransferListener {
    pub async fn bind(addr: SocketAddr, files: SharedFiles) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Transfer listener bound on {}", listener.local_addr()?);
        Ok(Self { listener, files })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the stop signal fires, one task per
    /// connection. Accept errors are logged and retried. The socket is
    /// closed when this returns.
    pub async fn run(self, mut stop: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let files = self.files.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, remote, files).await {
                                    warn!("Transfer connection from {} failed: {}", remote, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Error accepting transfer connection: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
                _ = stop.recv() => {
                    info!("Stop signal, closing transfer listener");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, remote: SocketAddr, files: SharedFiles) -> Result<()> {
    debug!("Transfer connection from {}", remote);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = ControlReader::new(read_half);

    match reader.recv().await? {
        None => Ok(()),
        Some(Message::Ping) => {
            let mut writer = ControlWriter::new(write_half);
            writer.send(&Message::pong()).await?;
            writer.shutdown().await
        }
        Some(Message::Download(request)) => {
            match files.lookup(&request.fname).await {
                Some(path) => serve_file(&mut write_half, &path, &request.fname).await?,
                None => {
                    info!("{} requested unpublished file '{}'", remote, request.fname);
                    let header = TransferHeader::unavailable(format!(
                        "File '{}' is not available",
                        request.fname
                    ));
                    write_frame(&mut write_half, &header).await?;
                }
            }
            write_half.shutdown().await?;
            Ok(())
        }
        Some(other) => {
            let mut writer = ControlWriter::new(write_half);
            writer
                .send(&Message::error(format!(
                    "Unexpected '{}' request on transfer connection",
                    other.header()
                )))
                .await
        }
    }
}

/// Send the length header followed by exactly that many bytes of the file
async fn serve_file<W: AsyncWrite + Unpin>(writer: &mut W, path: &Path, fname: &str) -> Result<()> {
    let opened = match File::open(path).await {
        Ok(file) => file.metadata().await.map(|m| (file, m)),
        Err(e) => Err(e),
    };

    let (mut file, metadata) = match opened {
        Ok((file, metadata)) if metadata.is_file() => (file, metadata),
        _ => {
            warn!("Published file {} is missing from disk", path.display());
            let header = TransferHeader::unavailable(format!("File '{}' is not available", fname));
            return write_frame(writer, &header).await;
        }
    };

    let length = metadata.len();
    write_frame(writer, &TransferHeader::available(length)).await?;

    let mut buf = [0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < length {
        let want = std::cmp::min(CHUNK_SIZE as u64, length - sent) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ShareError::PrematureEof {
                received: sent,
                expected: length,
            });
        }
        writer.write_all(&buf[..n]).await?;
        sent += n as u64;
    }
    writer.flush().await?;

    info!("Sent '{}' ({} bytes)", fname, length);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::read_frame;

    async fn start(files: SharedFiles) -> (SocketAddr, broadcast::Sender<()>) {
        let listener = TransferListener::bind("127.0.0.1:0".parse().unwrap(), files)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = broadcast::channel(1);
        tokio::spawn(listener.run(stop_rx));
        (addr, stop_tx)
    }

    async fn request_header(addr: SocketAddr, fname: &str) -> TransferHeader {
        let (mut r, w) = TcpStream::connect(addr).await.unwrap().into_split();
        ControlWriter::new(w).send(&Message::download(fname)).await.unwrap();
        read_frame(&mut r).await.unwrap()
    }

    #[tokio::test]
    async fn test_published_file_removed_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        std::fs::write(&path, b"soon gone").unwrap();

        let files = SharedFiles::new();
        files.insert(path.to_str().unwrap(), "gone").await.unwrap();
        let (addr, _stop) = start(files).await;

        assert_eq!(request_header(addr, "gone").await, TransferHeader::available(9));

        std::fs::remove_file(&path).unwrap();
        let header = request_header(addr, "gone").await;
        assert!(!header.success);
        assert_eq!(header.length, 0);
        assert!(header.message.contains("gone"));
    }

    #[tokio::test]
    async fn test_unpublished_name_is_unavailable() {
        let (addr, _stop) = start(SharedFiles::new()).await;
        let header = request_header(addr, "nothing").await;
        assert!(!header.success);
    }

    #[tokio::test]
    async fn test_non_transfer_request_gets_error() {
        let (addr, _stop) = start(SharedFiles::new()).await;
        let (r, w) = TcpStream::connect(addr).await.unwrap().into_split();
        ControlWriter::new(w).send(&Message::fetch("x")).await.unwrap();
        match ControlReader::new(r).recv().await.unwrap() {
            Some(Message::Error(ack)) => assert!(ack.message.contains("fetch")),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
