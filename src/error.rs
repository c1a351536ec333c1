use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShareError {
    #[error("Hostname '{0}' is already in use")]
    DuplicateHostname(String),

    #[error("Invalid hostname '{0}': must be non-empty and contain no whitespace")]
    InvalidHostname(String),

    #[error("Hostname already set to '{0}' for this connection")]
    HostnameAlreadySet(String),

    #[error("Index server refused the request: {0}")]
    Rejected(String),

    #[error("Unknown peer {0}")]
    UnknownPeer(std::net::SocketAddr),

    #[error("File '{local_name}' or name '{published_name}' is already published")]
    AlreadyPublished {
        local_name: String,
        published_name: String,
    },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("No peer has published '{0}'")]
    NotFound(String),

    #[error("Connection closed by remote side")]
    ConnectionClosed,

    #[error("Connection to {addr} refused: {source}")]
    ConnectionRefused {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer ended early: received {received} of {expected} bytes")]
    PrematureEof { received: u64, expected: u64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ShareError {
    /// Connection-level failures that end a control loop rather than a single request
    pub fn is_disconnect(&self) -> bool {
        match self {
            ShareError::ConnectionClosed => true,
            ShareError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShareError>;
