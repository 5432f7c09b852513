//! Network layer for benchlink
//!
//! This crate carries the wire protocol over TCP: the broker side that
//! accepts clients and serves their requests against a shared
//! `ResourceRegistry`, and the client stub that talks to it.
//!
//! # Components
//!
//! - **ConnectionListener**: binds, publishes the discovery artifact, and
//!   spawns/reaps one handler per connection
//! - **ClientHandler**: request/reply loop for one connection
//! - **BrokerClient**: client stub bound to one instrument address
//! - **DiscoveryFile**: the artifact through which clients find the broker
//!
//! # Example
//!
//! ```no_run
//! use benchlink_core::Address;
//! use benchlink_hardware::{ResourceRegistry, mock::MockBackend};
//! use benchlink_network::{BrokerClient, ClientConfig, ConnectionListener, ListenerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> benchlink_core::Result<()> {
//! let registry = Arc::new(ResourceRegistry::new(MockBackend::new().0));
//! let mut listener = ConnectionListener::new(ListenerConfig::default(), registry);
//! listener.start().await?;
//! let stop = listener.cancellation_token();
//! let server = tokio::spawn(async move {
//!     listener.run().await?;
//!     listener.shutdown().await
//! });
//!
//! let mut client = BrokerClient::connect(Address::new("GPIB0::1::INSTR")?, ClientConfig::default()).await?;
//! println!("{}", client.idn().await?);
//! client.close().await?;
//!
//! stop.cancel();
//! server.await.expect("server task panicked")?;
//! # Ok(())
//! # }
//! ```

mod client;
mod discovery;
mod handler;
mod listener;

pub use client::{BrokerClient, ClientConfig};
pub use discovery::{DiscoveryFile, Endpoint};
pub use handler::{ClientHandler, HandlerId, HandlerState, execute};
pub use listener::{ConnectionListener, HandlerInfo, ListenerConfig};
