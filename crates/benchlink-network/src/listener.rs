//! Connection listener: accepts clients and manages their handlers.
//!
//! The listener binds a TCP endpoint, publishes it through the discovery
//! artifact, and spawns one [`ClientHandler`] task per accepted
//! connection. Finished handlers report their id on a channel; the
//! listener reaps them (joins the task and drops its record) between
//! accepts.
//!
//! # Architecture
//!
//! ```text
//! client A ─┐                      ┌─► handler 0 ─┐
//! client B ─┼─► ConnectionListener ├─► handler 1 ─┼─► Arc<ResourceRegistry>
//! client C ─┘        ▲             └─► handler 2 ─┘
//!                    └──── finished ids (mpsc) ◄──┘
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use benchlink_hardware::{ResourceRegistry, mock::MockBackend};
//! use benchlink_network::{ConnectionListener, ListenerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> benchlink_core::Result<()> {
//! let registry = Arc::new(ResourceRegistry::new(MockBackend::new().0));
//! let listener = ConnectionListener::new(ListenerConfig::default(), registry);
//!
//! // Stop from elsewhere with listener.cancellation_token().cancel()
//! listener.serve().await?;
//! # Ok(())
//! # }
//! ```

use crate::discovery::{DiscoveryFile, Endpoint};
use crate::handler::{ClientHandler, HandlerId};
use benchlink_core::constants::DEFAULT_MAX_CONNECTIONS;
use benchlink_core::{Error, Result};
use benchlink_hardware::ResourceRegistry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for the connection listener
///
/// # Example
///
/// ```
/// use benchlink_network::ListenerConfig;
///
/// let config = ListenerConfig {
///     bind_addr: "0.0.0.0:5025".parse().unwrap(),
///     max_connections: 16,
///     ..ListenerConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind; port 0 lets the OS pick one
    pub bind_addr: SocketAddr,

    /// Where to publish the bound endpoint
    pub discovery_path: PathBuf,

    /// Maximum number of simultaneous connections
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            discovery_path: DiscoveryFile::default_path(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Snapshot of one running handler.
#[derive(Debug, Clone)]
pub struct HandlerInfo {
    pub id: HandlerId,

    /// Remote client address
    pub peer_addr: SocketAddr,

    /// When the connection was accepted
    pub accepted_at: DateTime<Utc>,
}

impl HandlerInfo {
    /// How long the connection has been active
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.accepted_at
    }
}

struct RunningHandler {
    info: HandlerInfo,
    task: JoinHandle<()>,
}

/// Accepts connections and owns the set of running handlers.
pub struct ConnectionListener {
    config: ListenerConfig,
    registry: Arc<ResourceRegistry>,
    discovery: DiscoveryFile,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    next_id: u64,
    running: HashMap<HandlerId, RunningHandler>,
    finished_tx: mpsc::UnboundedSender<HandlerId>,
    finished_rx: mpsc::UnboundedReceiver<HandlerId>,
    cancel: CancellationToken,
}

impl ConnectionListener {
    /// Create a listener over a shared registry. Nothing is bound yet.
    pub fn new(config: ListenerConfig, registry: Arc<ResourceRegistry>) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            discovery: DiscoveryFile::new(config.discovery_path.clone()),
            config,
            registry,
            listener: None,
            local_addr: None,
            next_id: 0,
            running: HashMap::new(),
            finished_tx,
            finished_rx,
            cancel: CancellationToken::new(),
        }
    }

    /// Bind the endpoint and publish it to the discovery artifact.
    ///
    /// Calling it again returns the bound address without rebinding.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the address cannot be bound, or
    /// `Error::Discovery` if the artifact cannot be written.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        self.discovery
            .publish(&Endpoint::new(addr.ip().to_string(), addr.port()))?;

        info!(
            addr = %addr,
            max_connections = self.config.max_connections,
            discovery = %self.discovery.path().display(),
            "Broker listening"
        );

        self.listener = Some(listener);
        self.local_addr = Some(addr);
        Ok(addr)
    }

    /// Wait for the next connection and spawn its handler.
    ///
    /// Connections beyond `max_connections` are dropped and the wait
    /// continues.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotStarted` before [`start`](Self::start), or
    /// `Error::Io` if the listening socket fails.
    pub async fn accept(&mut self) -> Result<HandlerId> {
        loop {
            let listener = self.listener.as_ref().ok_or(Error::NotStarted)?;
            let (stream, peer_addr) = listener.accept().await?;
            if let Some(id) = self.spawn_handler(stream, peer_addr).await {
                return Ok(id);
            }
        }
    }

    /// Join and forget every handler that has reported completion.
    ///
    /// Never waits for a handler that is still serving.
    pub async fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Ok(id) = self.finished_rx.try_recv() {
            self.join_handler(id).await;
            reaped += 1;
        }
        reaped
    }

    /// Accept and reap until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotStarted` before [`start`](Self::start).
    pub async fn run(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();

        loop {
            let listener = self.listener.as_ref().ok_or(Error::NotStarted)?;

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(id) = self.finished_rx.recv() => {
                    self.join_handler(id).await;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        self.spawn_handler(stream, peer_addr).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }

            self.reap().await;
        }

        debug!("Accept loop stopped");
        Ok(())
    }

    /// Stop accepting, join every handler, then release shared state.
    ///
    /// Handlers finish the request they are serving before they stop. Once
    /// all are joined the discovery artifact is deleted and any backend
    /// sessions still open are closed.
    ///
    /// # Errors
    ///
    /// Returns the first failure from removing the artifact or closing
    /// sessions; every step runs regardless.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!(running = self.running.len(), "Shutting down broker");
        self.cancel.cancel();
        self.listener = None;

        let ids: Vec<HandlerId> = self.running.keys().copied().collect();
        for id in ids {
            self.join_handler(id).await;
        }
        while self.finished_rx.try_recv().is_ok() {}

        let mut result = Ok(());
        if self.local_addr.take().is_some() {
            if let Err(e) = self.discovery.remove() {
                error!(error = %e, "Failed to remove discovery file");
                result = Err(e);
            }
        }

        if let Err(e) = self.registry.close_all().await {
            error!(error = %e, "Failed to close backend sessions");
            if result.is_ok() {
                result = Err(e);
            }
        }

        info!("Broker stopped");
        result
    }

    /// Start, run until cancelled, then shut down.
    ///
    /// # Errors
    ///
    /// Returns the first error from any phase. Shutdown runs even if the
    /// accept loop fails.
    pub async fn serve(mut self) -> Result<()> {
        self.start().await?;
        let run_result = self.run().await;
        let shutdown_result = self.shutdown().await;
        run_result.and(shutdown_result)
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of handlers not yet reaped.
    pub fn handler_count(&self) -> usize {
        self.running.len()
    }

    /// Snapshot of running handlers, ordered by id.
    pub fn handlers(&self) -> Vec<HandlerInfo> {
        let mut handlers: Vec<HandlerInfo> =
            self.running.values().map(|h| h.info.clone()).collect();
        handlers.sort_by_key(|h| h.id);
        handlers
    }

    /// Token that stops [`run`](Self::run) and every handler when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn discovery(&self) -> &DiscoveryFile {
        &self.discovery
    }

    /// Spawn a handler, or drop the connection when at capacity.
    async fn spawn_handler(&mut self, stream: TcpStream, peer_addr: SocketAddr) -> Option<HandlerId> {
        if self.running.len() >= self.config.max_connections {
            self.reap().await;
        }
        if self.running.len() >= self.config.max_connections {
            error!(
                peer = %peer_addr,
                max_connections = self.config.max_connections,
                current_connections = self.running.len(),
                "Connection rejected: maximum connections reached"
            );
            drop(stream);
            return None;
        }

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let id = HandlerId(self.next_id);
        self.next_id += 1;

        let handler = ClientHandler::new(
            id,
            stream,
            peer_addr,
            Arc::clone(&self.registry),
            self.finished_tx.clone(),
            self.cancel.child_token(),
        );
        let task = tokio::spawn(handler.run());

        self.running.insert(
            id,
            RunningHandler {
                info: HandlerInfo {
                    id,
                    peer_addr,
                    accepted_at: Utc::now(),
                },
                task,
            },
        );

        info!(handler_id = %id, peer = %peer_addr, running = self.running.len(), "Connection accepted");
        Some(id)
    }

    async fn join_handler(&mut self, id: HandlerId) {
        let Some(handler) = self.running.remove(&id) else {
            return;
        };

        match handler.task.await {
            Ok(()) => debug!(handler_id = %id, "Handler reaped"),
            Err(e) if e.is_panic() => error!(handler_id = %id, "Handler panicked"),
            Err(e) => warn!(handler_id = %id, error = %e, "Handler task failed"),
        }
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        if self.local_addr.is_some() {
            debug!("ConnectionListener dropped without shutdown - discovery file left in place");
        }
    }
}
