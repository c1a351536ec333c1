use crate::error::{Result, ShareError};
use crate::protocol::{read_frame, ControlReader, ControlWriter, Message, TransferHeader, CHUNK_SIZE};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// A completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub bytes: u64,
}

async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    TcpStream::connect(addr)
        .await
        .map_err(|source| ShareError::ConnectionRefused { addr, source })
}

/// Download `fname` from the peer listening on `addr` into `dest_dir`.
///
/// No file is created if the peer refuses; a partially written file is
/// removed if the stream ends early.
pub async fn download(addr: SocketAddr, fname: &str, dest_dir: &Path) -> Result<DownloadOutcome> {
    let file_name = Path::new(fname)
        .file_name()
        .ok_or_else(|| ShareError::Protocol(format!("Invalid file name '{}'", fname)))?;

    info!("Requesting '{}' from {}", fname, addr);
    let stream = connect(addr).await?;
    let (mut read_half, write_half) = stream.into_split();

    let mut writer = ControlWriter::new(write_half);
    writer.send(&Message::download(fname)).await?;

    let header: TransferHeader = read_frame(&mut read_half).await?;
    if !header.success {
        warn!("{} cannot serve '{}': {}", addr, fname, header.message);
        return Err(ShareError::FileNotFound(fname.to_string()));
    }

    fs::create_dir_all(dest_dir).await?;
    let (path, mut file) = create_destination(dest_dir, &file_name.to_string_lossy()).await?;

    match receive_body(&mut read_half, &mut file, header.length).await {
        Ok(bytes) => {
            info!("Downloaded '{}' to {} ({} bytes)", fname, path.display(), bytes);
            Ok(DownloadOutcome { path, bytes })
        }
        Err(e) => {
            drop(file);
            if let Err(remove_err) = fs::remove_file(&path).await {
                warn!("Could not remove partial file {}: {}", path.display(), remove_err);
            }
            Err(e)
        }
    }
}

/// Create `name` in `dir`, or `name.1`, `name.2`, ... if it already exists
async fn create_destination(dir: &Path, name: &str) -> Result<(PathBuf, File)> {
    let mut suffix = 0u32;
    loop {
        let path = if suffix == 0 {
            dir.join(name)
        } else {
            dir.join(format!("{}.{}", name, suffix))
        };

        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Copy exactly `length` bytes from the socket in bounded chunks
async fn receive_body<R, W>(reader: &mut R, writer: &mut W, length: u64) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];
    let mut received = 0u64;
    let mut next_report = 10u64;

    while received < length {
        let want = std::cmp::min(CHUNK_SIZE as u64, length - received) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ShareError::PrematureEof {
                received,
                expected: length,
            });
        }
        writer.write_all(&buf[..n]).await?;
        received += n as u64;

        let percent = received * 100 / length;
        if percent >= next_report {
            debug!("Received {}/{} bytes ({}%)", received, length, percent);
            next_report = (percent / 10 + 1) * 10;
        }
    }

    writer.flush().await?;
    Ok(received)
}

/// Send a ping to a peer's transfer listener and measure the round trip
pub async fn ping(addr: SocketAddr, timeout: Duration) -> Result<Duration> {
    let started = Instant::now();

    match tokio::time::timeout(timeout, ping_exchange(addr)).await {
        Ok(result) => result.map(|()| started.elapsed()),
        Err(_) => Err(ShareError::Io(std::io::Error::new(
            ErrorKind::TimedOut,
            format!("no pong within {:?}", timeout),
        ))),
    }
}

async fn ping_exchange(addr: SocketAddr) -> Result<()> {
    let stream = connect(addr).await?;
    let (read_half, write_half) = stream.into_split();
    ControlWriter::new(write_half).send(&Message::Ping).await?;

    match ControlReader::new(read_half).recv().await? {
        Some(Message::Pong(_)) => Ok(()),
        Some(other) => Err(ShareError::Protocol(format!(
            "Expected pong, got '{}'",
            other.header()
        ))),
        None => Err(ShareError::ConnectionClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;
    use crate::transfer::{SharedFiles, TransferListener};
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    async fn start_listener(files: SharedFiles) -> (SocketAddr, broadcast::Sender<()>) {
        let listener = TransferListener::bind("127.0.0.1:0".parse().unwrap(), files)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = broadcast::channel(1);
        tokio::spawn(listener.run(stop_rx));
        (addr, stop_tx)
    }

    fn sample_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_round_trip_byte_for_byte() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        for (name, len) in [("empty", 0usize), ("exact", 2048), ("ragged", 5000)] {
            let source_path = src.path().join(format!("{}.bin", name));
            let contents = sample_bytes(len);
            std::fs::write(&source_path, &contents).unwrap();

            let files = SharedFiles::new();
            files.insert(source_path.to_str().unwrap(), name).await.unwrap();
            let (addr, _stop) = start_listener(files).await;

            let outcome = download(addr, name, dest.path()).await.unwrap();
            assert_eq!(outcome.bytes, len as u64);
            assert_eq!(outcome.path, dest.path().join(name));
            assert_eq!(std::fs::read(&outcome.path).unwrap(), contents);
        }
    }

    #[tokio::test]
    async fn test_existing_destination_gets_suffix() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let source_path = src.path().join("a.txt");
        std::fs::write(&source_path, b"fresh").unwrap();
        std::fs::write(dest.path().join("report"), b"old").unwrap();

        let files = SharedFiles::new();
        files.insert(source_path.to_str().unwrap(), "report").await.unwrap();
        let (addr, _stop) = start_listener(files).await;

        let first = download(addr, "report", dest.path()).await.unwrap();
        let second = download(addr, "report", dest.path()).await.unwrap();
        assert_eq!(first.path, dest.path().join("report.1"));
        assert_eq!(second.path, dest.path().join("report.2"));
        assert_eq!(std::fs::read(dest.path().join("report")).unwrap(), b"old");
        assert_eq!(std::fs::read(&first.path).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_unpublished_file_creates_nothing() {
        let dest = tempfile::tempdir().unwrap();
        let (addr, _stop) = start_listener(SharedFiles::new()).await;

        let err = download(addr, "ghost", dest.path()).await.unwrap_err();
        assert!(matches!(err, ShareError::FileNotFound(_)));
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_premature_close_removes_partial_file() {
        let dest = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Declares 4096 bytes but hangs up after 1000
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 256];
            let _ = stream.read(&mut request).await.unwrap();
            stream
                .write_all(&encode_frame(&TransferHeader::available(4096)).unwrap())
                .await
                .unwrap();
            stream.write_all(&[7u8; 1000]).await.unwrap();
        });

        let err = download(addr, "big", dest.path()).await.unwrap_err();
        match err {
            ShareError::PrematureEof { received, expected } => {
                assert_eq!(received, 1000);
                assert_eq!(expected, 4096);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!dest.path().join("big").exists());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dest = tempfile::tempdir().unwrap();
        let err = download(addr, "x", dest.path()).await.unwrap_err();
        assert!(matches!(err, ShareError::ConnectionRefused { .. }));
    }

    #[tokio::test]
    async fn test_path_traversal_name_rejected() {
        let dest = tempfile::tempdir().unwrap();
        let err = download("127.0.0.1:9".parse().unwrap(), "..", dest.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (addr, _stop) = start_listener(SharedFiles::new()).await;
        let rtt = ping(addr, Duration::from_secs(8)).await.unwrap();
        assert!(rtt < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_ping_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = ping(addr, Duration::from_millis(200)).await.unwrap_err();
        match err {
            ShareError::Io(e) => assert_eq!(e.kind(), ErrorKind::TimedOut),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stopped_listener_refuses() {
        let (addr, stop) = start_listener(SharedFiles::new()).await;
        stop.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = ping(addr, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ShareError::ConnectionRefused { .. }));
    }
}
