use crate::{Result, error::Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Resource address of one backend session (e.g. `GPIB0::1::INSTR`).
///
/// The broker treats it as an opaque key. It must be non-empty and contain
/// no whitespace so it survives the space-separated record grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Create a new address with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidAddress` if the address is empty or contains
    /// whitespace.
    pub fn new(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        if address.is_empty() {
            return Err(Error::InvalidAddress("address is empty".to_string()));
        }
        if address.chars().any(char::is_whitespace) {
            return Err(Error::InvalidAddress(format!(
                "address contains whitespace: {address:?}"
            )));
        }
        Ok(Address(address))
    }

    /// Borrow the address text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Address::new(s)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque key/value settings for one backend session.
///
/// The broker never interprets them. Sharers of an address see each
/// other's settings; the last CONF wins.
pub type Settings = BTreeMap<String, serde_json::Value>;

/// Category of a fault as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// Connection drop, bad framing, discovery failure, stub timeout.
    Transport,
    /// Unknown verb, missing field, undecodable payload, unexpected reply.
    Protocol,
    /// Operation on an address the registry does not hold.
    Registry,
    /// Fault raised by the device backend, passed through unchanged.
    Backend,
}

impl FaultKind {
    /// Wire token for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "TransportFault",
            Self::Protocol => "ProtocolFault",
            Self::Registry => "RegistryFault",
            Self::Backend => "BackendFault",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TransportFault" => Ok(Self::Transport),
            "ProtocolFault" => Ok(Self::Protocol),
            "RegistryFault" => Ok(Self::Registry),
            "BackendFault" => Ok(Self::Backend),
            other => Err(Error::UnexpectedReply(format!("unknown fault kind {other}"))),
        }
    }
}

/// Error record carried by an `ERROR` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub description: String,
}

impl Fault {
    pub fn new(kind: FaultKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.description)
    }
}

impl From<&Error> for Fault {
    fn from(error: &Error) -> Self {
        Fault::new(error.kind(), error.description())
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Error::Remote {
            kind: fault.kind,
            description: fault.description,
        }
    }
}
