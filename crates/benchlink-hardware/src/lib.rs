//! Device backends and the shared session registry for benchlink.
//!
//! This crate owns everything below the wire protocol: the trait interface
//! a device layer implements, the concrete backends, and the
//! [`ResourceRegistry`] that shares backend sessions between clients.
//!
//! # Design Philosophy
//!
//! - **Async-first**: All I/O operations are asynchronous using native `async fn`
//!   in traits (Rust 1.90 + Edition 2024 RPITIT).
//! - **Enum dispatch**: [`AnyBackend`] and [`AnySession`] give the registry
//!   concrete types, with one variant per backend.
//! - **Opaque backends**: command text, responses, and settings pass through
//!   uninterpreted; backend faults surface unchanged as
//!   `benchlink_core::Error::Backend`.
//! - **One serialization point**: every backend call on every address goes
//!   through the registry's single mutex.
//!
//! # Backends
//!
//! - [`mock::MockBackend`]: in-memory instrument simulator with hooks that
//!   detect overlapping or interleaved I/O.
//! - [`serial::SerialBackend`] (feature `hardware-serial`, on by default):
//!   serial instruments through the `serialport` crate.
//!
//! # Examples
//!
//! ```
//! use benchlink_core::Address;
//! use benchlink_hardware::{ResourceRegistry, mock::MockBackend};
//!
//! #[tokio::main]
//! async fn main() -> benchlink_core::Result<()> {
//!     let (backend, _handle) = MockBackend::new();
//!     let registry = ResourceRegistry::new(backend);
//!     let address = Address::new("ASRL1::INSTR")?;
//!
//!     registry.open(&address, None).await?;
//!     registry.write(&address, "*RST").await?;
//!     registry.close(&address).await
//! }
//! ```

pub mod backends;
pub mod error;
pub mod mock;
pub mod registry;
#[cfg(feature = "hardware-serial")]
pub mod serial;
pub mod traits;

pub use backends::{AnyBackend, AnySession};
pub use error::{HardwareError, Result};
pub use registry::ResourceRegistry;
pub use traits::{DeviceBackend, DeviceSession};
