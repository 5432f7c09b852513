//! Enum wrappers for backend dispatch.
//!
//! Native `async fn` in traits is not object-safe, so the registry cannot
//! hold a `Box<dyn DeviceBackend>`. These enums give it one concrete type
//! per role instead, with one variant per backend and feature-gated
//! variants for real hardware. Being concrete also keeps the futures of
//! every call `Send`, which the handler tasks require.
//!
//! # Examples
//!
//! ```
//! use benchlink_hardware::backends::AnyBackend;
//! use benchlink_hardware::mock::MockBackend;
//! use benchlink_hardware::traits::DeviceBackend;
//!
//! let (backend, _handle) = MockBackend::new();
//! let backend = AnyBackend::Mock(backend);
//! assert_eq!(backend.name(), "mock");
//! ```

use crate::Result;
use crate::mock::{MockBackend, MockSession};
#[cfg(feature = "hardware-serial")]
use crate::serial::{SerialBackend, SerialSession};
use crate::traits::{DeviceBackend, DeviceSession};
use benchlink_core::{Address, Settings};
use std::time::Duration;

/// Enum wrapper for backend dispatch.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnyBackend {
    /// In-memory instrument simulator.
    Mock(MockBackend),
    /// Serial (ASRL) instruments.
    #[cfg(feature = "hardware-serial")]
    Serial(SerialBackend),
}

impl From<MockBackend> for AnyBackend {
    fn from(backend: MockBackend) -> Self {
        Self::Mock(backend)
    }
}

#[cfg(feature = "hardware-serial")]
impl From<SerialBackend> for AnyBackend {
    fn from(backend: SerialBackend) -> Self {
        Self::Serial(backend)
    }
}

impl DeviceBackend for AnyBackend {
    type Session = AnySession;

    fn name(&self) -> &'static str {
        match self {
            Self::Mock(backend) => backend.name(),
            #[cfg(feature = "hardware-serial")]
            Self::Serial(backend) => backend.name(),
        }
    }

    async fn open(&mut self, address: &Address) -> Result<AnySession> {
        match self {
            Self::Mock(backend) => backend.open(address).await.map(AnySession::Mock),
            #[cfg(feature = "hardware-serial")]
            Self::Serial(backend) => backend.open(address).await.map(AnySession::Serial),
        }
    }
}

/// Enum wrapper for session dispatch.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnySession {
    /// Session on the mock backend.
    Mock(MockSession),
    /// Session on a serial port.
    #[cfg(feature = "hardware-serial")]
    Serial(SerialSession),
}

impl DeviceSession for AnySession {
    async fn write(&mut self, text: &str) -> Result<()> {
        match self {
            Self::Mock(session) => session.write(text).await,
            #[cfg(feature = "hardware-serial")]
            Self::Serial(session) => session.write(text).await,
        }
    }

    async fn read(&mut self) -> Result<String> {
        match self {
            Self::Mock(session) => session.read().await,
            #[cfg(feature = "hardware-serial")]
            Self::Serial(session) => session.read().await,
        }
    }

    async fn query(&mut self, text: &str) -> Result<String> {
        match self {
            Self::Mock(session) => session.query(text).await,
            #[cfg(feature = "hardware-serial")]
            Self::Serial(session) => session.query(text).await,
        }
    }

    async fn configure(&mut self, settings: &Settings) -> Result<()> {
        match self {
            Self::Mock(session) => session.configure(settings).await,
            #[cfg(feature = "hardware-serial")]
            Self::Serial(session) => session.configure(settings).await,
        }
    }

    async fn lock(&mut self, timeout: Duration) -> Result<()> {
        match self {
            Self::Mock(session) => session.lock(timeout).await,
            #[cfg(feature = "hardware-serial")]
            Self::Serial(session) => session.lock(timeout).await,
        }
    }

    async fn unlock(&mut self) -> Result<()> {
        match self {
            Self::Mock(session) => session.unlock().await,
            #[cfg(feature = "hardware-serial")]
            Self::Serial(session) => session.unlock().await,
        }
    }

    async fn clear(&mut self) -> Result<()> {
        match self {
            Self::Mock(session) => session.clear().await,
            #[cfg(feature = "hardware-serial")]
            Self::Serial(session) => session.clear().await,
        }
    }

    async fn close(self) -> Result<()> {
        match self {
            Self::Mock(session) => session.close().await,
            #[cfg(feature = "hardware-serial")]
            Self::Serial(session) => session.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_any_backend_opens_any_session() {
        let (backend, handle) = MockBackend::new();
        let mut backend = AnyBackend::from(backend);
        let address = Address::new("GPIB0::1::INSTR").unwrap();

        let mut session = backend.open(&address).await.unwrap();
        assert!(matches!(session, AnySession::Mock(_)));
        assert_eq!(handle.live_sessions(&address), 1);

        session.write("*CLS").await.unwrap();
        assert_eq!(session.query("*IDN?").await.unwrap(), crate::mock::DEFAULT_IDENTITY);

        session.close().await.unwrap();
        assert_eq!(handle.live_sessions(&address), 0);
    }
}
