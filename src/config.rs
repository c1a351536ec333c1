use crate::error::{Result, ShareError};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_INDEX_PORT: u16 = 55555;

/// Configuration for the index server
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub bind_addr: SocketAddr,
    /// How long an admin ping waits for a pong
    pub ping_timeout_secs: u64,
}

impl IndexConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_INDEX_PORT)),
            ping_timeout_secs: 8,
        }
    }
}

/// Configuration for a peer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub server_addr: SocketAddr,
    pub hostname: String,
    /// Where the transfer listener binds; port 0 picks an ephemeral port
    pub listen_addr: SocketAddr,
    pub download_dir: PathBuf,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_INDEX_PORT)),
            hostname: String::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            download_dir: PathBuf::from("./downloads"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    index: Option<IndexConfig>,
    #[serde(default)]
    peer: Option<PeerConfig>,
}

impl ConfigFile {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ShareError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(toml::from_str(&text)?)
    }
}

/// Load the `[index]` table of a TOML file, falling back to defaults
pub fn load_index_config(path: Option<&Path>) -> Result<IndexConfig> {
    match path {
        Some(path) => Ok(ConfigFile::load(path)?.index.unwrap_or_default()),
        None => Ok(IndexConfig::default()),
    }
}

/// Load the `[peer]` table of a TOML file, falling back to defaults
pub fn load_peer_config(path: Option<&Path>) -> Result<PeerConfig> {
    match path {
        Some(path) => Ok(ConfigFile::load(path)?.peer.unwrap_or_default()),
        None => Ok(PeerConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let index = IndexConfig::default();
        assert_eq!(index.bind_addr.port(), DEFAULT_INDEX_PORT);
        assert_eq!(index.ping_timeout(), Duration::from_secs(8));

        let peer = PeerConfig::default();
        assert_eq!(peer.listen_addr.port(), 0);
        assert_eq!(peer.download_dir, PathBuf::from("./downloads"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[peer]\nhostname = \"alice\"\nserver_addr = \"10.0.0.1:6000\"\n\n[index]\nping_timeout_secs = 2"
        )
        .unwrap();

        let peer = load_peer_config(Some(file.path())).unwrap();
        assert_eq!(peer.hostname, "alice");
        assert_eq!(peer.server_addr, "10.0.0.1:6000".parse().unwrap());
        assert_eq!(peer.download_dir, PathBuf::from("./downloads"));

        let index = load_index_config(Some(file.path())).unwrap();
        assert_eq!(index.ping_timeout_secs, 2);
        assert_eq!(index.bind_addr.port(), DEFAULT_INDEX_PORT);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_peer_config(Some(Path::new("/nonexistent/peershare.toml"))).unwrap_err();
        assert!(matches!(err, ShareError::Config(_)));
    }
}
