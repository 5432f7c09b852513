//! Reference-counted registry of open device sessions.
//!
//! The registry is the single owner of every backend session. Each address
//! maps to one session plus a reference count: the first OPEN creates the
//! session, later OPENs share it, and the CLOSE that brings the count to
//! zero closes it and removes the entry.
//!
//! # Serialization
//!
//! One `tokio::sync::Mutex` guards the session map *and* every backend call
//! on every address. At most one backend call is in flight system-wide, and
//! a QUERY's write and read happen inside one critical section, so no other
//! request can slip between them. A slow device stalls all clients; that is
//! the price of never colliding on non-reentrant bus I/O.
//!
//! ```text
//! handler 0 ──┐
//! handler 1 ──┼──► Mutex<RegistryState> ──► AnyBackend / AnySession
//! handler N ──┘       (one at a time)
//! ```
//!
//! # Examples
//!
//! ```
//! use benchlink_core::Address;
//! use benchlink_hardware::mock::MockBackend;
//! use benchlink_hardware::registry::ResourceRegistry;
//!
//! #[tokio::main]
//! async fn main() -> benchlink_core::Result<()> {
//!     let (backend, _handle) = MockBackend::new();
//!     let registry = ResourceRegistry::new(backend);
//!     let address = Address::new("GPIB0::1::INSTR")?;
//!
//!     registry.open(&address, None).await?;
//!     registry.open(&address, None).await?;
//!     assert_eq!(registry.ref_count(&address).await, Some(2));
//!
//!     let identity = registry.query(&address, "*IDN?").await?;
//!     println!("{identity}");
//!
//!     registry.close(&address).await?;
//!     registry.close(&address).await?;
//!     assert!(registry.is_empty().await);
//!     Ok(())
//! }
//! ```

use crate::backends::{AnyBackend, AnySession};
use crate::traits::{DeviceBackend, DeviceSession};
use benchlink_core::{Address, Error, Result, Settings};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// One shared backend session and the number of OPENs holding it.
#[derive(Debug)]
struct RefCountedSession {
    session: AnySession,
    ref_count: usize,
}

#[derive(Debug)]
struct RegistryState {
    backend: AnyBackend,
    sessions: HashMap<Address, RefCountedSession>,
}

/// Serializing owner of every backend session.
///
/// Share it between handlers as `Arc<ResourceRegistry>`.
#[derive(Debug)]
pub struct ResourceRegistry {
    state: Mutex<RegistryState>,
}

impl ResourceRegistry {
    /// Create an empty registry over `backend`.
    pub fn new(backend: impl Into<AnyBackend>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                backend: backend.into(),
                sessions: HashMap::new(),
            }),
        }
    }

    /// Open `address`, or take another reference to its existing session.
    ///
    /// When `settings` are given they are applied to the session. If that
    /// fails, the open is undone (the count is restored and a session
    /// created by this call is closed again) and the fault is returned.
    ///
    /// # Errors
    ///
    /// Returns `Error::Backend` if the backend cannot open the address or
    /// rejects the settings.
    pub async fn open(&self, address: &Address, settings: Option<&Settings>) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let created = match state.sessions.get_mut(address) {
            Some(entry) => {
                entry.ref_count += 1;
                debug!(address = %address, ref_count = entry.ref_count, "Session shared");
                false
            }
            None => {
                let session = state.backend.open(address).await?;
                state.sessions.insert(
                    address.clone(),
                    RefCountedSession {
                        session,
                        ref_count: 1,
                    },
                );
                info!(address = %address, backend = state.backend.name(), "Session opened");
                true
            }
        };

        let Some(settings) = settings else {
            return Ok(());
        };

        let applied = match state.sessions.get_mut(address) {
            Some(entry) => entry.session.configure(settings).await.map_err(Error::from),
            None => Err(Error::NotOpen(address.to_string())),
        };

        if let Err(e) = applied {
            warn!(address = %address, error = %e, created, "Settings rejected on open, rolling back");
            if let Err(close_err) = release(&mut state.sessions, address).await {
                warn!(address = %address, error = %close_err, "Rollback close failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Apply settings to the open session for `address`.
    ///
    /// Every sharer of the address sees the new settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotOpen` if the address has no session, or
    /// `Error::Backend` if the session rejects a setting.
    pub async fn configure(&self, address: &Address, settings: &Settings) -> Result<()> {
        let mut state = self.state.lock().await;
        let session = session_mut(&mut state.sessions, address)?;
        session.configure(settings).await?;
        debug!(address = %address, keys = settings.len(), "Session configured");
        Ok(())
    }

    /// Write command text to the session for `address`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotOpen` if the address has no session, or
    /// `Error::Backend` if the write fails.
    pub async fn write(&self, address: &Address, text: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let session = session_mut(&mut state.sessions, address)?;
        trace!(address = %address, text, "Write");
        session.write(text).await?;
        Ok(())
    }

    /// Read one response from the session for `address`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotOpen` if the address has no session, or
    /// `Error::Backend` if the read fails.
    pub async fn read(&self, address: &Address) -> Result<String> {
        let mut state = self.state.lock().await;
        let session = session_mut(&mut state.sessions, address)?;
        let response = session.read().await?;
        trace!(address = %address, response = %response, "Read");
        Ok(response)
    }

    /// Write `text` and read the response as one critical section.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotOpen` if the address has no session, or
    /// `Error::Backend` if either half of the exchange fails.
    pub async fn query(&self, address: &Address, text: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        let session = session_mut(&mut state.sessions, address)?;
        let response = session.query(text).await?;
        trace!(address = %address, text, response = %response, "Query");
        Ok(response)
    }

    /// Drop one reference to `address`, closing the session at zero.
    ///
    /// The entry is removed even when the backend close faults.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotOpen` if the address has no session, or
    /// `Error::Backend` if the backend close fails.
    pub async fn close(&self, address: &Address) -> Result<()> {
        let mut state = self.state.lock().await;
        release(&mut state.sessions, address).await?;
        Ok(())
    }

    /// Close every open session and clear the map.
    ///
    /// Every session is released even if some closes fail.
    ///
    /// # Errors
    ///
    /// Returns the first backend close fault, after all sessions are gone.
    pub async fn close_all(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut first_error = None;

        for (address, entry) in state.sessions.drain() {
            info!(address = %address, ref_count = entry.ref_count, "Closing session at shutdown");
            if let Err(e) = entry.session.close().await {
                warn!(address = %address, error = %e, "Session close failed");
                first_error.get_or_insert(Error::from(e));
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Current reference count for `address`, if it is open.
    pub async fn ref_count(&self, address: &Address) -> Option<usize> {
        let state = self.state.lock().await;
        state.sessions.get(address).map(|entry| entry.ref_count)
    }

    /// Addresses with an open session, sorted.
    pub async fn addresses(&self) -> Vec<Address> {
        let state = self.state.lock().await;
        let mut addresses: Vec<Address> = state.sessions.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Number of open sessions.
    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Check if no session is open.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.sessions.is_empty()
    }
}

fn session_mut<'a>(
    sessions: &'a mut HashMap<Address, RefCountedSession>,
    address: &Address,
) -> Result<&'a mut AnySession> {
    sessions
        .get_mut(address)
        .map(|entry| &mut entry.session)
        .ok_or_else(|| Error::NotOpen(address.to_string()))
}

/// Drop one reference; close and remove the session when none remain.
async fn release(
    sessions: &mut HashMap<Address, RefCountedSession>,
    address: &Address,
) -> Result<usize> {
    let entry = sessions
        .get_mut(address)
        .ok_or_else(|| Error::NotOpen(address.to_string()))?;

    entry.ref_count -= 1;
    if entry.ref_count > 0 {
        debug!(address = %address, ref_count = entry.ref_count, "Session released");
        return Ok(entry.ref_count);
    }

    if let Some(entry) = sessions.remove(address) {
        entry.session.close().await?;
        info!(address = %address, "Session closed");
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockBackendHandle};
    use benchlink_core::FaultKind;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    const DMM: &str = "GPIB0::1::INSTR";

    fn registry() -> (ResourceRegistry, MockBackendHandle) {
        let (backend, handle) = MockBackend::new();
        (ResourceRegistry::new(backend), handle)
    }

    fn address(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_shared_session_lifecycle() {
        let (registry, handle) = registry();
        let dmm = address(DMM);

        registry.open(&dmm, None).await.unwrap();
        registry.open(&dmm, None).await.unwrap();
        assert_eq!(registry.ref_count(&dmm).await, Some(2));
        assert_eq!(handle.live_sessions(&dmm), 1);

        let identity = registry.query(&dmm, "*IDN?").await.unwrap();
        assert_eq!(identity, crate::mock::DEFAULT_IDENTITY);

        registry.close(&dmm).await.unwrap();
        assert_eq!(registry.ref_count(&dmm).await, Some(1));
        assert_eq!(handle.live_sessions(&dmm), 1);

        registry.close(&dmm).await.unwrap();
        assert_eq!(registry.ref_count(&dmm).await, None);
        assert_eq!(handle.live_sessions(&dmm), 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_third_close_is_registry_fault() {
        let (registry, _handle) = registry();
        let dmm = address(DMM);

        registry.open(&dmm, None).await.unwrap();
        registry.open(&dmm, None).await.unwrap();
        registry.close(&dmm).await.unwrap();
        registry.close(&dmm).await.unwrap();

        let err = registry.close(&dmm).await.unwrap_err();
        assert!(matches!(err, Error::NotOpen(_)));
        assert_eq!(err.kind(), FaultKind::Registry);
    }

    #[tokio::test]
    async fn test_io_on_unopened_address_is_registry_fault() {
        let (registry, _handle) = registry();
        let dmm = address(DMM);

        let results = [
            registry.write(&dmm, "*RST").await.err(),
            registry.read(&dmm).await.err(),
            registry.query(&dmm, "*IDN?").await.err(),
            registry.configure(&dmm, &Settings::new()).await.err(),
        ];
        for err in results {
            assert!(matches!(err, Some(Error::NotOpen(_))));
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (registry, handle) = registry();
        let dmm = address(DMM);
        handle.set_response("MEAS:VOLT:DC?", "+4.999E+00");

        registry.open(&dmm, None).await.unwrap();
        registry.write(&dmm, "MEAS:VOLT:DC?").await.unwrap();
        assert_eq!(registry.read(&dmm).await.unwrap(), "+4.999E+00");
    }

    #[tokio::test]
    async fn test_backend_fault_passes_through() {
        let (registry, _handle) = registry();
        let dmm = address(DMM);

        registry.open(&dmm, None).await.unwrap();
        let err = registry.read(&dmm).await.unwrap_err();
        assert_eq!(err.kind(), FaultKind::Backend);
        assert_eq!(err.description(), "Operation timeout after 2000ms");
    }

    #[tokio::test]
    async fn test_failed_open_leaves_no_entry() {
        let (registry, handle) = registry();
        handle.fail_open("GPIB0::9::INSTR");
        let missing = address("GPIB0::9::INSTR");

        let err = registry.open(&missing, None).await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert_eq!(registry.ref_count(&missing).await, None);
    }

    #[tokio::test]
    async fn test_open_with_settings() {
        let (registry, handle) = registry();
        let dmm = address(DMM);
        let mut settings = Settings::new();
        settings.insert("timeout".to_string(), json!(750));

        registry.open(&dmm, Some(&settings)).await.unwrap();
        assert_eq!(handle.settings(&dmm).unwrap()["timeout"], json!(750));

        let err = registry.read(&dmm).await.unwrap_err();
        assert_eq!(err.description(), "Operation timeout after 750ms");
    }

    #[tokio::test]
    async fn test_open_with_bad_settings_rolls_back_new_session() {
        let (registry, handle) = registry();
        let dmm = address(DMM);
        let mut settings = Settings::new();
        settings.insert("timeout".to_string(), json!("later"));

        let err = registry.open(&dmm, Some(&settings)).await.unwrap_err();
        assert_eq!(err.kind(), FaultKind::Backend);
        assert_eq!(registry.ref_count(&dmm).await, None);
        assert_eq!(handle.live_sessions(&dmm), 0);
    }

    #[tokio::test]
    async fn test_open_with_bad_settings_rolls_back_shared_reference() {
        let (registry, handle) = registry();
        let dmm = address(DMM);
        let mut settings = Settings::new();
        settings.insert("timeout".to_string(), json!(-1));

        registry.open(&dmm, None).await.unwrap();
        assert!(registry.open(&dmm, Some(&settings)).await.is_err());
        assert_eq!(registry.ref_count(&dmm).await, Some(1));
        assert_eq!(handle.live_sessions(&dmm), 1);
    }

    #[tokio::test]
    async fn test_configure_is_shared_last_writer_wins() {
        let (registry, handle) = registry();
        let dmm = address(DMM);
        registry.open(&dmm, None).await.unwrap();
        registry.open(&dmm, None).await.unwrap();

        let mut first = Settings::new();
        first.insert("timeout".to_string(), json!(100));
        first.insert("read_termination".to_string(), json!("\n"));
        let mut second = Settings::new();
        second.insert("timeout".to_string(), json!(900));

        registry.configure(&dmm, &first).await.unwrap();
        registry.configure(&dmm, &second).await.unwrap();

        let applied = handle.settings(&dmm).unwrap();
        assert_eq!(applied["timeout"], json!(900));
        assert_eq!(applied["read_termination"], json!("\n"));
    }

    #[tokio::test]
    async fn test_addresses_and_close_all() {
        let (registry, handle) = registry();
        for a in ["GPIB0::2::INSTR", "ASRL1::INSTR", "GPIB0::1::INSTR"] {
            registry.open(&address(a), None).await.unwrap();
        }
        registry.open(&address("ASRL1::INSTR"), None).await.unwrap();

        assert_eq!(registry.len().await, 3);
        assert_eq!(
            registry.addresses().await,
            vec![
                address("ASRL1::INSTR"),
                address("GPIB0::1::INSTR"),
                address("GPIB0::2::INSTR"),
            ]
        );

        registry.close_all().await.unwrap();
        assert!(registry.is_empty().await);
        assert_eq!(handle.total_live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_ref_count_tracks_opens_minus_closes() {
        let (registry, _handle) = registry();
        let dmm = address(DMM);
        let ops = [true, true, false, true, false, false, true, true, false];
        let mut expected = 0usize;

        for open in ops {
            if open {
                registry.open(&dmm, None).await.unwrap();
                expected += 1;
            } else {
                registry.close(&dmm).await.unwrap();
                expected -= 1;
            }
            let observed = registry.ref_count(&dmm).await.unwrap_or(0);
            assert_eq!(observed, expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_queries_are_serialized() {
        let (backend, handle) = MockBackend::new();
        handle.set_latency(Duration::from_millis(2));
        let registry = Arc::new(ResourceRegistry::new(backend));

        let addresses: Vec<Address> = (1..=4)
            .map(|n| address(&format!("GPIB0::{n}::INSTR")))
            .collect();
        for a in &addresses {
            registry.open(a, None).await.unwrap();
        }

        let mut tasks = tokio::task::JoinSet::new();
        for (i, a) in addresses.iter().cycle().take(16).enumerate() {
            let registry = Arc::clone(&registry);
            let a = a.clone();
            tasks.spawn(async move {
                let command = format!("MEAS{i}?");
                let response = registry.query(&a, &command).await.unwrap();
                assert_eq!(response, command);
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        assert_eq!(handle.max_concurrent_calls(), 1);
        assert_eq!(handle.overlap_count(), 0);
        assert_eq!(handle.interleaving_count(), 0);
    }
}
