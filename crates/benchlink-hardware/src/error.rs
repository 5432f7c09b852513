//! Errors raised by device backends.
//!
//! Backend faults are opaque to the broker. When they cross into the
//! registry they become `benchlink_core::Error::Backend` with the display
//! text unchanged, so a stub sees exactly what the device layer reported.

pub type Result<T> = std::result::Result<T, HardwareError>;

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    /// The backend could not open a session for the address.
    #[error("Failed to open {address}: {message}")]
    OpenFailed { address: String, message: String },

    /// The address does not name a resource this backend can reach.
    #[error("Cannot use address {address}: {reason}")]
    UnusableAddress { address: String, reason: String },

    /// No response arrived within the session's read timeout.
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// A setting was rejected by the session.
    #[error("Invalid setting: {message}")]
    InvalidSetting { message: String },

    /// UNLOCK without a matching LOCK.
    #[error("{address} is not locked")]
    NotLocked { address: String },

    /// The session lost its port, e.g. after a failed blocking call.
    #[error("Port for {address} is gone")]
    PortGone { address: String },

    /// The device link failed mid-operation.
    #[error("Communication error: {message}")]
    Communication { message: String },

    /// The device answered with bytes that are not a text response.
    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    /// A blocking worker task panicked or was cancelled.
    #[error("Backend worker failed: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HardwareError {
    pub fn open_failed(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OpenFailed {
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn unusable_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnusableAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    pub fn invalid_setting(message: impl Into<String>) -> Self {
        Self::InvalidSetting {
            message: message.into(),
        }
    }

    pub fn not_locked(address: impl Into<String>) -> Self {
        Self::NotLocked {
            address: address.into(),
        }
    }

    pub fn port_gone(address: impl Into<String>) -> Self {
        Self::PortGone {
            address: address.into(),
        }
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }
}

impl From<HardwareError> for benchlink_core::Error {
    fn from(error: HardwareError) -> Self {
        benchlink_core::Error::Backend(error.to_string())
    }
}
