//! Core constants for the broker wire protocol.
//!
//! Every request and reply is a single text record:
//!
//! ```text
//! VERB SP ADDRESS [SP PAYLOAD]        (request)
//! VERB SP "OK"                        (success without data)
//! "READ" SP PAYLOAD                   (success with data)
//! "ERROR" SP FAULT-KIND SP TEXT       (failure)
//! ```
//!
//! Records travel inside length-prefixed frames so the payload can hold
//! any character, including line breaks returned by instruments.

use std::time::Duration;

// ============================================================================
// Record Grammar
// ============================================================================

/// Separator between the verb, the address and the payload.
pub const FIELD_SEPARATOR: char = ' ';

/// Token that follows the verb in a data-less success reply.
pub const REPLY_OK: &str = "OK";

/// Leading token of a data-carrying success reply (READ and QUERY).
pub const REPLY_DATA: &str = "READ";

/// Leading token of a failure reply.
pub const REPLY_ERROR: &str = "ERROR";

// ============================================================================
// Framing
// ============================================================================

/// Size of the big-endian length prefix in front of every record.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default maximum record size in bytes (64 KB).
///
/// Instrument replies are small; larger frames are rejected before the
/// body is buffered.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

// ============================================================================
// Discovery
// ============================================================================

/// File name of the discovery artifact inside the system temp directory.
pub const DISCOVERY_FILE_NAME: &str = "benchlink_server_port.txt";

/// Host a stub connects to when the artifact names no usable host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

// ============================================================================
// Timeouts & Limits
// ============================================================================

/// Default stub-side I/O timeout for one round trip.
///
/// The broker itself never times out a backend call, so this only bounds
/// how long a client waits behind other clients' traffic.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound on simultaneously running handlers.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Command sent by `idn()` helpers.
pub const IDN_QUERY: &str = "*IDN?";
