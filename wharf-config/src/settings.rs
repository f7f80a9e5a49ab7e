use serde::{Deserialize, Serialize};
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_WEB_ROOT: &str = "www";
pub const DEFAULT_DATA_DIR: &str = "data";

/// One immutable snapshot of the server settings.
///
/// Snapshots are never mutated after construction; a reload produces a new
/// value that replaces the old one as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub http_port: u16,
    pub https_port: u16,
    pub host: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Static content directory, relative to `data_dir` unless absolute.
    pub web_root: PathBuf,
    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            host: DEFAULT_HOST.to_string(),
            tls_cert: None,
            tls_key: None,
            web_root: PathBuf::from(DEFAULT_WEB_ROOT),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

impl Settings {
    /// Certificate and key paths, only when both are configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        let cert = self.tls_cert.as_deref().filter(|p| !p.as_os_str().is_empty())?;
        let key = self.tls_key.as_deref().filter(|p| !p.as_os_str().is_empty())?;
        Some((cert, key))
    }

    /// Directory static files are served from.
    pub fn web_dir(&self) -> PathBuf {
        self.data_dir.join(&self.web_root)
    }

    pub fn http_addr(&self) -> Result<SocketAddr, AddrParseError> {
        self.socket_addr(self.http_port)
    }

    pub fn https_addr(&self) -> Result<SocketAddr, AddrParseError> {
        self.socket_addr(self.https_port)
    }

    fn socket_addr(&self, port: u16) -> Result<SocketAddr, AddrParseError> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        host.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, port))
    }
}
