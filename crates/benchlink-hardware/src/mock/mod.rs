//! Mock backend implementation for testing and development.
//!
//! This module provides a simulated instrument backend that can be controlled
//! programmatically without requiring physical hardware.

pub mod backend;

pub use backend::{DEFAULT_IDENTITY, MockBackend, MockBackendHandle, MockEvent, MockSession};
