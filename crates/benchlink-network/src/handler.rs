//! Per-connection request/reply loop.
//!
//! One [`ClientHandler`] runs for each accepted connection. It reads one
//! request record, dispatches it to the shared [`ResourceRegistry`], and
//! writes exactly one reply, until the peer hangs up, the transport fails,
//! or the listener asks it to stop.
//!
//! ```text
//! RUNNING ──(EOF | transport fault | cancel)──► CLOSING ──► CLOSED
//! ```
//!
//! A request that fails (unknown verb, unopened address, backend fault)
//! becomes an `ERROR` reply and the loop continues. So does a reply too
//! large for one frame. Cancellation is only observed while waiting for the
//! next request, so a request that has been read always gets its reply.
//!
//! Whatever ends the loop, including a panic unwinding the task, the
//! handler reports its id on the listener's finished channel exactly once.

use benchlink_core::{Error, Result};
use benchlink_hardware::ResourceRegistry;
use benchlink_protocol::{RecordCodec, Reply, Request, Verb, decode_settings};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Identifier of one accepted connection, unique per listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler {}", self.0)
    }
}

/// Lifecycle state of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Serving requests.
    Running,
    /// Loop has ended; the connection is being closed.
    Closing,
    /// Connection closed and completion reported.
    Closed,
}

/// Why the request loop ended.
#[derive(Debug)]
enum LoopExit {
    PeerClosed,
    Cancelled,
    Transport(Error),
}

/// Sends the handler id to the listener once, on completion or unwind.
struct FinishGuard {
    id: HandlerId,
    finished_tx: Option<mpsc::UnboundedSender<HandlerId>>,
}

impl FinishGuard {
    fn notify(&mut self) {
        if let Some(tx) = self.finished_tx.take() {
            // The listener may already be gone during process exit.
            let _ = tx.send(self.id);
        }
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if self.finished_tx.is_some() {
            warn!(handler_id = %self.id, "Handler exited abnormally");
        }
        self.notify();
    }
}

/// Worker serving one client connection.
pub struct ClientHandler {
    id: HandlerId,
    peer_addr: SocketAddr,
    framed: Framed<TcpStream, RecordCodec>,
    registry: Arc<ResourceRegistry>,
    cancel: CancellationToken,
    finish: FinishGuard,
    state: HandlerState,
}

impl ClientHandler {
    pub fn new(
        id: HandlerId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        registry: Arc<ResourceRegistry>,
        finished_tx: mpsc::UnboundedSender<HandlerId>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer_addr,
            framed: Framed::new(stream, RecordCodec::new()),
            registry,
            cancel,
            finish: FinishGuard {
                id,
                finished_tx: Some(finished_tx),
            },
            state: HandlerState::Running,
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Serve the connection until it ends, then report completion.
    pub async fn run(mut self) {
        debug!(handler_id = %self.id, peer = %self.peer_addr, "Handler started");

        match self.serve().await {
            LoopExit::PeerClosed => {
                debug!(handler_id = %self.id, "Peer closed connection");
            }
            LoopExit::Cancelled => {
                debug!(handler_id = %self.id, "Handler cancelled");
            }
            LoopExit::Transport(e) => {
                warn!(handler_id = %self.id, peer = %self.peer_addr, error = %e, "Connection failed");
            }
        }

        self.state = HandlerState::Closing;
        self.close().await;
        self.state = HandlerState::Closed;

        info!(handler_id = %self.id, peer = %self.peer_addr, "Handler finished");
        self.finish.notify();
    }

    async fn serve(&mut self) -> LoopExit {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return LoopExit::Cancelled,
                next = self.framed.next() => next,
            };

            let record = match next {
                Some(Ok(record)) => record,
                Some(Err(e)) => return LoopExit::Transport(e),
                None => return LoopExit::PeerClosed,
            };

            let reply = self.fit_frame(self.dispatch(&record).await.to_string());
            if let Err(e) = self.framed.send(reply).await {
                return LoopExit::Transport(e);
            }
        }
    }

    /// Turn one request record into exactly one reply.
    async fn dispatch(&self, record: &str) -> Reply {
        trace!(handler_id = %self.id, record, "Request");

        let outcome = match Request::parse(record) {
            Ok(request) => {
                let verb = request.verb;
                execute(&self.registry, request)
                    .await
                    .map(|data| Reply::success(verb, data))
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(reply) => reply,
            Err(e) => {
                debug!(handler_id = %self.id, kind = %e.kind(), error = %e, "Request failed");
                Reply::failure(&e)
            }
        }
    }

    /// Replace a reply that cannot be framed with an `ERROR` reply.
    fn fit_frame(&self, reply: String) -> String {
        let max_size = self.framed.codec().max_frame_size();
        if reply.len() <= max_size {
            return reply;
        }

        let error = Error::FrameTooLarge {
            size: reply.len(),
            max_size,
        };
        warn!(handler_id = %self.id, error = %error, "Reply does not fit in one frame");
        Reply::failure(&error).to_string()
    }

    async fn close(&mut self) {
        let timeout = Duration::from_millis(500);
        match tokio::time::timeout(timeout, self.framed.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(handler_id = %self.id, error = %e, "Error flushing during close"),
            Err(_) => debug!(handler_id = %self.id, "Flush timeout during close"),
        }
        match tokio::time::timeout(timeout, self.framed.get_mut().shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(handler_id = %self.id, error = %e, "Error during shutdown"),
            Err(_) => debug!(handler_id = %self.id, "Shutdown timeout during close"),
        }
    }
}

impl fmt::Debug for ClientHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandler")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Run one parsed request against the registry.
///
/// Returns the response text for READ and QUERY, `None` otherwise.
pub async fn execute(registry: &ResourceRegistry, request: Request) -> Result<Option<String>> {
    let address = &request.address;
    match request.verb {
        Verb::Open => {
            let settings = match request.payload() {
                Some(payload) if !payload.trim().is_empty() => Some(decode_settings(payload)?),
                _ => None,
            };
            registry.open(address, settings.as_ref()).await?;
            Ok(None)
        }
        Verb::Close => {
            registry.close(address).await?;
            Ok(None)
        }
        Verb::Write => {
            registry.write(address, request.required_payload()?).await?;
            Ok(None)
        }
        Verb::Read => registry.read(address).await.map(Some),
        Verb::Query => registry
            .query(address, request.required_payload()?)
            .await
            .map(Some),
        Verb::Conf => {
            let settings = decode_settings(request.required_payload()?)?;
            registry.configure(address, &settings).await?;
            Ok(None)
        }
    }
}
