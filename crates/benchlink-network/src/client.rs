//! Client stub for talking to a running broker.
//!
//! A [`BrokerClient`] is bound to one instrument address. Constructing it
//! resolves the broker through the discovery artifact, connects, and
//! issues OPEN before handing back a ready client. Every later operation
//! is one request and one reply.
//!
//! # Example Usage
//!
//! ```no_run
//! use benchlink_core::Address;
//! use benchlink_network::{BrokerClient, ClientConfig};
//!
//! # async fn example() -> benchlink_core::Result<()> {
//! let address = Address::new("GPIB0::1::INSTR")?;
//! let mut dmm = BrokerClient::connect(address, ClientConfig::default()).await?;
//!
//! println!("{}", dmm.idn().await?);
//! dmm.write("CONF:VOLT:DC 10").await?;
//! let volts = dmm.query("READ?").await?;
//! println!("{volts}");
//!
//! dmm.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Errors from the broker
//!
//! An `ERROR` reply comes back as `Error::Remote` carrying the broker's
//! fault kind and description unchanged. Local transport problems
//! (discovery, connect, timeout, dropped connection) are ordinary
//! transport errors.
//!
//! # Timeout Handling
//!
//! Every round trip is bounded by [`ClientConfig::timeout`] (default 30 s).
//! The broker itself never times a request out.

use crate::discovery::DiscoveryFile;
use benchlink_core::constants::{DEFAULT_CLIENT_TIMEOUT, IDN_QUERY};
use benchlink_core::{Address, Error, Result, Settings};
use benchlink_protocol::{RecordCodec, Reply, Request, Verb};
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

/// Configuration for the client stub
///
/// # Example
///
/// ```
/// use benchlink_network::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     timeout: Duration::from_secs(5),
///     ..ClientConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Discovery artifact published by the broker
    pub discovery_path: PathBuf,

    /// Timeout for connect and for each round trip
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery_path: DiscoveryFile::default_path(),
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }
}

/// Connection to the broker for one instrument address.
pub struct BrokerClient {
    address: Address,
    framed: Option<Framed<TcpStream, RecordCodec>>,
    timeout: Duration,
}

impl BrokerClient {
    /// Connect to the broker and open `address`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Discovery` if no broker is published, a transport
    /// error if the broker cannot be reached, or `Error::Remote` if the
    /// broker rejects the OPEN.
    pub async fn connect(address: Address, config: ClientConfig) -> Result<Self> {
        Self::open(address, config, None).await
    }

    /// Connect and open `address`, applying `settings` as part of the OPEN.
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect); a rejected setting fails the OPEN.
    pub async fn connect_with_settings(
        address: Address,
        config: ClientConfig,
        settings: &Settings,
    ) -> Result<Self> {
        Self::open(address, config, Some(settings)).await
    }

    async fn open(address: Address, config: ClientConfig, settings: Option<&Settings>) -> Result<Self> {
        let endpoint = DiscoveryFile::new(&config.discovery_path).resolve()?;
        let host = endpoint.connect_host();
        info!(address = %address, host, port = endpoint.port, "Connecting to broker");

        let stream = match tokio::time::timeout(
            config.timeout,
            TcpStream::connect((host, endpoint.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(host, port = endpoint.port, error = %e, "Connection failed");
                return Err(e.into());
            }
            Err(_) => return Err(Error::Timeout(millis(config.timeout))),
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut client = Self {
            framed: Some(Framed::new(stream, RecordCodec::new())),
            timeout: config.timeout,
            address,
        };

        let request = match settings {
            Some(settings) => Request::open_with_settings(client.address.clone(), settings)?,
            None => Request::open(client.address.clone()),
        };
        if let Err(e) = client.round_trip(request).await {
            client.disconnect().await;
            return Err(e);
        }

        debug!(address = %client.address, "Session open");
        Ok(client)
    }

    /// Address this client is bound to.
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    /// Send command text to the instrument.
    ///
    /// # Errors
    ///
    /// Returns `Error::Remote` for a broker-side fault, or a transport error.
    pub async fn write(&mut self, text: &str) -> Result<()> {
        let request = Request::write(self.address.clone(), text);
        self.round_trip(request).await.map(|_| ())
    }

    /// Read one response, then disconnect.
    ///
    /// The client is unusable afterwards; the broker-side session keeps
    /// its reference until the connection is reaped.
    ///
    /// # Errors
    ///
    /// Returns `Error::Remote` for a broker-side fault, or a transport error.
    pub async fn read(&mut self) -> Result<String> {
        let request = Request::read(self.address.clone());
        let result = self.round_trip(request).await;
        self.disconnect().await;
        result.map(Option::unwrap_or_default)
    }

    /// Write `text` and read the response as one exchange.
    ///
    /// # Errors
    ///
    /// Returns `Error::Remote` for a broker-side fault, or a transport error.
    pub async fn query(&mut self, text: &str) -> Result<String> {
        let request = Request::query(self.address.clone(), text);
        self.round_trip(request)
            .await
            .map(Option::unwrap_or_default)
    }

    /// Apply settings to the shared session.
    ///
    /// # Errors
    ///
    /// Returns `Error::Remote` for a broker-side fault, or a transport error.
    pub async fn configure(&mut self, settings: &Settings) -> Result<()> {
        let request = Request::conf(self.address.clone(), settings)?;
        self.round_trip(request).await.map(|_| ())
    }

    /// Query the instrument identity (`*IDN?`).
    ///
    /// # Errors
    ///
    /// As [`query`](Self::query).
    pub async fn idn(&mut self) -> Result<String> {
        self.query(IDN_QUERY).await
    }

    /// Release this client's reference to the session and disconnect.
    ///
    /// # Errors
    ///
    /// Returns `Error::Remote` if the broker rejects the CLOSE; the
    /// connection is dropped either way.
    pub async fn close(&mut self) -> Result<()> {
        let request = Request::close(self.address.clone());
        let result = self.round_trip(request).await;
        self.disconnect().await;
        result.map(|_| ())
    }

    /// Drop the connection without sending CLOSE. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        if let Some(mut framed) = self.framed.take() {
            debug!(address = %self.address, "Disconnecting from broker");

            let flush_timeout = Duration::from_millis(500);
            match tokio::time::timeout(flush_timeout, framed.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Error flushing during close: {}", e),
                Err(_) => warn!("Flush timeout during close ({}ms)", flush_timeout.as_millis()),
            }

            let mut stream = framed.into_inner();
            let shutdown_timeout = Duration::from_millis(500);
            match tokio::time::timeout(shutdown_timeout, stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Error during shutdown: {}", e),
                Err(_) => warn!(
                    "Shutdown timeout during close ({}ms)",
                    shutdown_timeout.as_millis()
                ),
            }
        }
    }

    /// Send one request and wait for its reply.
    ///
    /// A transport failure mid-exchange leaves the connection unusable, so
    /// it is dropped. A request too large to frame is rejected before
    /// anything is written and the connection stays open.
    async fn round_trip(&mut self, request: Request) -> Result<Option<String>> {
        let verb = request.verb;
        let record = request.to_string();

        let framed = self.framed.as_ref().ok_or(Error::NotConnected)?;
        let max_size = framed.codec().max_frame_size();
        if record.len() > max_size {
            return Err(Error::FrameTooLarge {
                size: record.len(),
                max_size,
            });
        }
        trace!(record = %record, "Sending request");

        let reply = match self.exchange(record, verb).await {
            Ok(reply) => reply,
            Err(e) => {
                self.framed = None;
                return Err(e);
            }
        };

        trace!(reply = %reply, "Received reply");
        reply.into_result()
    }

    async fn exchange(&mut self, record: String, verb: Verb) -> Result<Reply> {
        let framed = self.framed.as_mut().ok_or(Error::NotConnected)?;
        let timeout_ms = millis(self.timeout);

        tokio::time::timeout(self.timeout, framed.send(record))
            .await
            .map_err(|_| Error::Timeout(timeout_ms))??;

        let record = match tokio::time::timeout(self.timeout, framed.next()).await {
            Ok(Some(Ok(record))) => record,
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => return Err(Error::ConnectionClosed),
            Err(_) => return Err(Error::Timeout(timeout_ms)),
        };

        Reply::parse(&record, verb)
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        if self.framed.is_some() {
            debug!(address = %self.address, "BrokerClient dropped while connected - connection will be closed");
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.discovery_path.ends_with("benchlink_server_port.txt"));
    }

    #[tokio::test]
    async fn test_connect_without_broker() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig {
            discovery_path: dir.path().join("missing.txt"),
            timeout: Duration::from_millis(200),
        };

        let address = Address::new("GPIB0::1::INSTR").unwrap();
        let err = BrokerClient::connect(address, config).await.err().unwrap();
        assert!(matches!(err, Error::Discovery(_)));
    }

    #[tokio::test]
    async fn test_connect_to_stale_endpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("port.txt");

        // Bind then drop to get a port nothing listens on.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        std::fs::write(&path, format!("{port}\n127.0.0.1\n")).unwrap();

        let config = ClientConfig {
            discovery_path: path,
            timeout: Duration::from_millis(500),
        };
        let address = Address::new("GPIB0::1::INSTR").unwrap();
        let err = BrokerClient::connect(address, config).await.err().unwrap();
        assert!(err.is_transport());
    }
}
