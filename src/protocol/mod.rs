//! Wire protocol shared by the index server and peers.
//!
//! Control messages are plain JSON objects with no length prefix. Transfer
//! metadata uses an 8-byte big-endian length prefix followed by JSON, and is
//! followed on success by the raw file body.

mod framing;
mod message;

pub use framing::{
    decode_frame, encode_frame, read_frame, write_frame, ControlReader, ControlWriter,
    LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE,
};
pub use message::{
    Ack, Candidate, DownloadRequest, FetchReply, FetchRequest, Message, MessageKind,
    PublishRequest, Refusal, SetHostReply, SetHostRequest, TransferHeader,
};

/// Transfer body chunk size
pub const CHUNK_SIZE: usize = 1024;
