use crate::error::ShareError;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::net::SocketAddr;

/// Direction of a control message, carried in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
}

impl MessageKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetHostRequest {
    pub hostname: String,
    /// Port of the peer's transfer listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Why the index server refused a hostname
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Refusal {
    DuplicateHostname,
    InvalidHostname,
    HostnameAlreadySet,
    UnknownPeer,
}

impl Refusal {
    pub fn of(error: &ShareError) -> Option<Self> {
        match error {
            ShareError::DuplicateHostname(_) => Some(Self::DuplicateHostname),
            ShareError::InvalidHostname(_) => Some(Self::InvalidHostname),
            ShareError::HostnameAlreadySet(_) => Some(Self::HostnameAlreadySet),
            ShareError::UnknownPeer(_) => Some(Self::UnknownPeer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetHostReply {
    pub success: bool,
    pub message: String,
    pub hostname: Option<String>,
    /// Address other peers use to reach this peer's transfer listener
    pub address: Option<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Refusal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub lname: String,
    pub fname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub fname: String,
}

/// A peer that can serve a fetched file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub hostname: Option<String>,
    pub address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReply {
    pub success: bool,
    pub message: String,
    pub fname: String,
    pub available_clients: Vec<Candidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub fname: String,
}

/// Generic `{success, message}` payload used by pong and error replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

/// Length-prefixed reply to a download request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub length: u64,
}

impl TransferHeader {
    pub fn available(length: u64) -> Self {
        Self {
            success: true,
            message: "available".to_string(),
            length,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            length: 0,
        }
    }
}

#[derive(Serialize)]
struct Empty {}

/// Raw wire shape of every control message
#[derive(Debug, Deserialize)]
pub struct Envelope {
    header: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Control-plane messages exchanged with the index server and between peers.
/// Wire form: `{"header": <tag>, "type": 0|1, "payload": {...}}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Envelope")]
pub enum Message {
    SetHost(SetHostRequest),
    SetHostReply(SetHostReply),
    Publish(PublishRequest),
    Fetch(FetchRequest),
    FetchReply(FetchReply),
    Quit,
    Ping,
    Pong(Ack),
    Download(DownloadRequest),
    /// Rejection of a request the receiver does not understand
    Error(Ack),
}

impl Message {
    pub const SETHOST: &'static str = "sethost";
    pub const PUBLISH: &'static str = "publish";
    pub const FETCH: &'static str = "fetch";
    pub const QUIT: &'static str = "quit";
    pub const PING: &'static str = "ping";
    pub const DOWNLOAD: &'static str = "download";
    pub const ERROR: &'static str = "error";

    pub fn header(&self) -> &'static str {
        match self {
            Message::SetHost(_) | Message::SetHostReply(_) => Self::SETHOST,
            Message::Publish(_) => Self::PUBLISH,
            Message::Fetch(_) | Message::FetchReply(_) => Self::FETCH,
            Message::Quit => Self::QUIT,
            Message::Ping | Message::Pong(_) => Self::PING,
            Message::Download(_) => Self::DOWNLOAD,
            Message::Error(_) => Self::ERROR,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::SetHostReply(_)
            | Message::FetchReply(_)
            | Message::Pong(_)
            | Message::Error(_) => MessageKind::Response,
            _ => MessageKind::Request,
        }
    }

    pub fn pong() -> Self {
        Message::Pong(Ack {
            success: true,
            message: "pong".to_string(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Message::Error(Ack {
            success: false,
            message: message.into(),
        })
    }

    pub fn sethost(hostname: impl Into<String>, port: Option<u16>) -> Self {
        Message::SetHost(SetHostRequest {
            hostname: hostname.into(),
            port,
        })
    }

    pub fn publish(lname: impl Into<String>, fname: impl Into<String>) -> Self {
        Message::Publish(PublishRequest {
            lname: lname.into(),
            fname: fname.into(),
        })
    }

    pub fn fetch(fname: impl Into<String>) -> Self {
        Message::Fetch(FetchRequest {
            fname: fname.into(),
        })
    }

    pub fn download(fname: impl Into<String>) -> Self {
        Message::Download(DownloadRequest {
            fname: fname.into(),
        })
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Message", 3)?;
        state.serialize_field("header", self.header())?;
        state.serialize_field("type", &(self.kind() as u8))?;
        match self {
            Message::SetHost(p) => state.serialize_field("payload", p)?,
            Message::SetHostReply(p) => state.serialize_field("payload", p)?,
            Message::Publish(p) => state.serialize_field("payload", p)?,
            Message::Fetch(p) => state.serialize_field("payload", p)?,
            Message::FetchReply(p) => state.serialize_field("payload", p)?,
            Message::Download(p) => state.serialize_field("payload", p)?,
            Message::Pong(p) | Message::Error(p) => state.serialize_field("payload", p)?,
            Message::Quit | Message::Ping => state.serialize_field("payload", &Empty {})?,
        }
        state.end()
    }
}

impl TryFrom<Envelope> for Message {
    type Error = ShareError;

    fn try_from(envelope: Envelope) -> Result<Self, ShareError> {
        let kind = MessageKind::from_u8(envelope.kind).ok_or_else(|| {
            ShareError::Protocol(format!("Unknown message type: {}", envelope.kind))
        })?;
        let payload = envelope.payload;

        let message = match (envelope.header.as_str(), kind) {
            (Self::SETHOST, MessageKind::Request) => {
                Message::SetHost(serde_json::from_value(payload)?)
            }
            (Self::SETHOST, MessageKind::Response) => {
                Message::SetHostReply(serde_json::from_value(payload)?)
            }
            (Self::PUBLISH, MessageKind::Request) => {
                Message::Publish(serde_json::from_value(payload)?)
            }
            (Self::FETCH, MessageKind::Request) => Message::Fetch(serde_json::from_value(payload)?),
            (Self::FETCH, MessageKind::Response) => {
                Message::FetchReply(serde_json::from_value(payload)?)
            }
            (Self::QUIT, MessageKind::Request) => Message::Quit,
            (Self::PING, MessageKind::Request) => Message::Ping,
            (Self::PING, MessageKind::Response) => Message::Pong(serde_json::from_value(payload)?),
            (Self::DOWNLOAD, MessageKind::Request) => {
                Message::Download(serde_json::from_value(payload)?)
            }
            (Self::ERROR, MessageKind::Response) => {
                Message::Error(serde_json::from_value(payload)?)
            }
            (header, kind) => {
                return Err(ShareError::Protocol(format!(
                    "Unrecognized message: header '{}' with type {:?}",
                    header, kind
                )))
            }
        };

        Ok(message)
    }
}
