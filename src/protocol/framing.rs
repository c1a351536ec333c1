use super::Message;
use crate::error::{Result, ShareError};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Length prefix size for transfer metadata frames
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Largest metadata frame we accept: 16 MB
pub const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Largest unterminated control message we buffer: 64 KB
const MAX_CONTROL_SIZE: usize = 64 * 1024;

/// Serialize a value as an 8-byte big-endian length prefix followed by JSON
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() as u64 > MAX_FRAME_SIZE {
        return Err(ShareError::Protocol(format!(
            "Frame too large: {} bytes",
            payload.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u64(payload.len() as u64);
    buf.put_slice(&payload);
    Ok(buf.to_vec())
}

/// Deserialize a complete length-prefixed frame
pub fn decode_frame<T: DeserializeOwned>(mut data: &[u8]) -> Result<T> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ShareError::Protocol("Frame too short".to_string()));
    }

    let length = data.get_u64();
    if length > MAX_FRAME_SIZE {
        return Err(ShareError::Protocol(format!("Frame too large: {} bytes", length)));
    }
    if data.len() as u64 != length {
        return Err(ShareError::Protocol(format!(
            "Frame length mismatch: prefix says {}, got {}",
            length,
            data.len()
        )));
    }

    Ok(serde_json::from_slice(data)?)
}

/// Write one length-prefixed frame
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_frame(value)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut length_buf = [0u8; LENGTH_PREFIX_SIZE];
    read_exact_or_closed(reader, &mut length_buf).await?;

    let length = u64::from_be_bytes(length_buf);
    if length > MAX_FRAME_SIZE {
        return Err(ShareError::Protocol(format!("Frame too large: {} bytes", length)));
    }

    let mut payload = vec![0u8; length as usize];
    read_exact_or_closed(reader, &mut payload).await?;

    Ok(serde_json::from_slice(&payload)?)
}

async fn read_exact_or_closed<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ShareError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}

/// Reads unprefixed JSON control messages from a byte stream.
///
/// Messages are parsed incrementally, so several messages arriving in one
/// read or one message split across reads both decode correctly.
pub struct ControlReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> ControlReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Receive the next message. `Ok(None)` means the remote side closed
    /// the connection cleanly between messages.
    ///
    /// A well-formed JSON value that is not a valid message is consumed and
    /// reported as `ShareError::Protocol`, leaving the stream usable.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(value) = self.next_value()? {
                let message = serde_json::from_value::<Message>(value)
                    .map_err(|e| ShareError::Protocol(e.to_string()))?;
                debug!("Received {} message", message.header());
                return Ok(Some(message));
            }

            if self.buf.len() > MAX_CONTROL_SIZE {
                return Err(ShareError::Protocol(format!(
                    "Control message exceeds {} bytes",
                    MAX_CONTROL_SIZE
                )));
            }

            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                return if self.buf.iter().all(u8::is_ascii_whitespace) {
                    Ok(None)
                } else {
                    Err(ShareError::ConnectionClosed)
                };
            }
        }
    }

    /// Split off the next complete JSON value, if the buffer holds one
    fn next_value(&mut self) -> Result<Option<serde_json::Value>> {
        let (next, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<serde_json::Value>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            Some(Ok(value)) => {
                self.buf.advance(consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => {
                self.buf.clear();
                Err(ShareError::Protocol(format!("Malformed control message: {}", e)))
            }
            None => {
                // Only whitespace buffered
                self.buf.clear();
                Ok(None)
            }
        }
    }
}

/// Writes unprefixed JSON control messages, one write per message
pub struct ControlWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> ControlWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let bytes = serde_json::to_vec(message)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        debug!("Sent {} message ({} bytes)", message.header(), bytes.len());
        Ok(())
    }

    /// Close the write direction
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
