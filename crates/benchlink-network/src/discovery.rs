//! Discovery artifact for locating a running broker.
//!
//! The broker writes its endpoint to a small text file when it starts and
//! deletes it on clean shutdown. Clients read the file once per connect;
//! it is the only way they find the broker.
//!
//! ```text
//! 50123        <- port
//! 127.0.0.1    <- host (optional)
//! ```
//!
//! The file is written to a temporary file in the same directory and then
//! renamed over the target, so a reader never sees a half-written port.

use benchlink_core::constants::{DEFAULT_HOST, DISCOVERY_FILE_NAME};
use benchlink_core::{Error, Result};
use std::fmt;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Host and port a broker is listening on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host a client should connect to.
    ///
    /// An empty host or an unspecified bind address (`0.0.0.0`, `::`)
    /// resolves to loopback.
    pub fn connect_host(&self) -> &str {
        let host = self.host.trim();
        if host.is_empty() {
            return DEFAULT_HOST;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => DEFAULT_HOST,
            _ => host,
        }
    }

    /// Parse the contents of a discovery file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Discovery` if the first line is not a port number.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let port_line = lines.next().unwrap_or("").trim();
        let port = port_line
            .parse::<u16>()
            .map_err(|_| Error::Discovery(format!("invalid port {port_line:?}")))?;
        let host = lines.next().unwrap_or("").trim();
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.port)?;
        writeln!(f, "{}", self.host)
    }
}

/// Location of the discovery artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFile {
    path: PathBuf,
}

impl DiscoveryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<system temp dir>/benchlink_server_port.txt`
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(DISCOVERY_FILE_NAME)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically write `endpoint` to the artifact.
    ///
    /// # Errors
    ///
    /// Returns `Error::Discovery` if the directory is not writable.
    pub fn publish(&self, endpoint: &Endpoint) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let mut file = NamedTempFile::new_in(dir).map_err(|e| self.error("create", &e))?;
        file.write_all(endpoint.to_string().as_bytes())
            .and_then(|()| file.as_file().sync_all())
            .map_err(|e| self.error("write", &e))?;
        file.persist(&self.path)
            .map_err(|e| self.error("rename", &e.error))?;

        info!(path = %self.path.display(), port = endpoint.port, host = %endpoint.host, "Discovery file published");
        Ok(())
    }

    /// Read the endpoint of the running broker.
    ///
    /// # Errors
    ///
    /// Returns `Error::Discovery` if no broker has published an endpoint,
    /// or the file is unreadable.
    pub fn resolve(&self) -> Result<Endpoint> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::Discovery(format!(
                "no broker running: {} not found",
                self.path.display()
            )),
            _ => self.error("read", &e),
        })?;
        let endpoint = Endpoint::parse(&text)?;
        debug!(path = %self.path.display(), port = endpoint.port, "Discovery file resolved");
        Ok(endpoint)
    }

    /// Delete the artifact. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns `Error::Discovery` if the file exists but cannot be removed.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Discovery file removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error("remove", &e)),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn error(&self, action: &str, e: &io::Error) -> Error {
        Error::Discovery(format!("cannot {action} {}: {e}", self.path.display()))
    }
}

impl Default for DiscoveryFile {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}
