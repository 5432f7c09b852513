use crate::types::FaultKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Not connected to server")]
    NotConnected,

    #[error("Listener has not been started")]
    NotStarted,

    #[error("Frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("Invalid frame encoding: {0}")]
    InvalidEncoding(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Protocol errors
    #[error("Unknown verb: {0}")]
    UnknownVerb(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid settings payload: {0}")]
    InvalidSettings(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    // Registry errors
    #[error("address {0} is not open")]
    NotOpen(String),

    // Backend errors
    #[error("{0}")]
    Backend(String),

    // Fault re-raised from an ERROR reply
    #[error("{kind} {description}")]
    Remote { kind: FaultKind, description: String },
}

impl Error {
    /// Wire category of this error.
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::ConnectionClosed
            | Self::NotConnected
            | Self::NotStarted
            | Self::FrameTooLarge { .. }
            | Self::InvalidEncoding(_)
            | Self::Discovery(_)
            | Self::Timeout(_)
            | Self::Io(_) => FaultKind::Transport,
            Self::UnknownVerb(_)
            | Self::MissingField(_)
            | Self::InvalidAddress(_)
            | Self::InvalidSettings(_)
            | Self::UnexpectedReply(_) => FaultKind::Protocol,
            Self::NotOpen(_) => FaultKind::Registry,
            Self::Backend(_) => FaultKind::Backend,
            Self::Remote { kind, .. } => *kind,
        }
    }

    /// Text placed after the fault kind in an `ERROR` reply.
    ///
    /// A re-raised remote fault yields its original description so that
    /// relaying it again does not stack kind prefixes.
    pub fn description(&self) -> String {
        match self {
            Self::Remote { description, .. } => description.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this error ends the connection it occurred on.
    pub fn is_transport(&self) -> bool {
        self.kind() == FaultKind::Transport
    }
}

pub type Result<T> = std::result::Result<T, Error>;
