//! Device backend trait definitions.
//!
//! A [`DeviceBackend`] opens sessions by address; a [`DeviceSession`] is
//! one opened instrument. The broker never interprets what flows through
//! them: command text goes in, response text comes out.
//!
//! All traits use native `async fn` methods (Rust 1.90 + Edition 2024 RPITIT).
//! Because these are not object-safe, the registry dispatches through the
//! concrete enums in [`crate::backends`].

#![allow(async_fn_in_trait)]

use crate::error::Result;
use benchlink_core::{Address, Settings};
use std::time::Duration;

/// Opens device sessions for addresses.
///
/// # Examples
///
/// ```
/// use benchlink_core::Address;
/// use benchlink_hardware::mock::MockBackend;
/// use benchlink_hardware::traits::{DeviceBackend, DeviceSession};
///
/// #[tokio::main]
/// async fn main() -> benchlink_hardware::Result<()> {
///     let (mut backend, _handle) = MockBackend::new();
///     let address = Address::new("GPIB0::1::INSTR").unwrap();
///
///     let mut session = backend.open(&address).await?;
///     let identity = session.query("*IDN?").await?;
///     assert!(identity.starts_with("BENCHLINK"));
///     session.close().await
/// }
/// ```
pub trait DeviceBackend: Send + Sync {
    /// Session type produced by [`open`](Self::open).
    type Session: DeviceSession;

    /// Short backend name used in logs (e.g. `mock`, `serial`).
    fn name(&self) -> &'static str;

    /// Open a new session for `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource does not exist or cannot be opened.
    async fn open(&mut self, address: &Address) -> Result<Self::Session>;
}

/// One opened device session.
///
/// Sessions are driven by one caller at a time; the registry guarantees
/// that no two calls on any session ever overlap.
pub trait DeviceSession: Send + Sized {
    /// Send command text to the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is disconnected or the write fails.
    async fn write(&mut self, text: &str) -> Result<()>;

    /// Read one response from the device.
    ///
    /// # Errors
    ///
    /// Returns an error if no response arrives within the session timeout
    /// or the device is disconnected.
    async fn read(&mut self) -> Result<String>;

    /// Write `text` then read one response.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by either half of the exchange.
    async fn query(&mut self, text: &str) -> Result<String>;

    /// Apply key/value settings to the session.
    ///
    /// # Errors
    ///
    /// Returns an error if a setting is unknown or has an invalid value.
    async fn configure(&mut self, settings: &Settings) -> Result<()>;

    /// Take an exclusive lock on the underlying resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired within `timeout`.
    async fn lock(&mut self, timeout: Duration) -> Result<()>;

    /// Release a lock taken with [`lock`](Self::lock).
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not locked.
    async fn unlock(&mut self) -> Result<()>;

    /// Discard pending input and output.
    ///
    /// # Errors
    ///
    /// Returns an error if the device rejects the clear.
    async fn clear(&mut self) -> Result<()>;

    /// Close the session and release the resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the device reports a fault while closing. The
    /// session is released either way.
    async fn close(self) -> Result<()>;
}
