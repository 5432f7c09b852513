//! Mock instrument backend for testing and development.
//!
//! This module provides a simulated instrument backend that can be
//! controlled programmatically for testing without requiring physical
//! hardware. Query-style writes (ending in `?`) queue a response that the
//! next `read` returns.
//!
//! The backend also watches how it is driven. Every call records whether
//! another call was in flight at the same time, and every read records
//! whether another session wrote between this session's query and its
//! read. Tests use these counters to prove the broker serializes I/O.

use crate::{
    HardwareError, Result,
    traits::{DeviceBackend, DeviceSession},
};
use benchlink_core::{Address, Settings, constants::IDN_QUERY};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

/// Identity string returned for `*IDN?` unless overridden.
pub const DEFAULT_IDENTITY: &str = "BENCHLINK,MockInstrument,0,1.0";

/// Session read timeout used when nothing is queued.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 2000;

/// Something the mock backend observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// A session was opened.
    Opened(Address),
    /// Command text was written.
    Wrote(Address, String),
    /// A response was read.
    Read(Address, String),
    /// Settings were applied.
    Configured(Address),
    /// The session was locked.
    Locked(Address),
    /// The session was unlocked.
    Unlocked(Address),
    /// Pending output was discarded.
    Cleared(Address),
    /// A session was closed.
    Closed(Address),
}

#[derive(Debug, Default)]
struct MockState {
    identity: Mutex<String>,
    latency_ms: AtomicU64,
    next_session_id: AtomicU64,
    responses: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    live: Mutex<HashMap<Address, usize>>,
    settings: Mutex<HashMap<Address, Settings>>,
    events: Mutex<Vec<MockEvent>>,
    active_calls: AtomicUsize,
    max_active_calls: AtomicUsize,
    overlaps: AtomicUsize,
    last_writer: Mutex<Option<u64>>,
    interleavings: AtomicUsize,
}

/// Lock a state mutex, recovering the data if a test thread panicked.
fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockState {
    fn record(&self, event: MockEvent) {
        trace!(?event, "Mock backend event");
        guard(&self.events).push(event);
    }

    fn enter(self: &Arc<Self>) -> CallGuard {
        let active = self.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_calls.fetch_max(active, Ordering::SeqCst);
        if active > 1 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        CallGuard {
            state: Arc::clone(self),
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn response_for(&self, command: &str) -> String {
        if let Some(response) = guard(&self.responses).get(command) {
            return response.clone();
        }
        if command.eq_ignore_ascii_case(IDN_QUERY) {
            return guard(&self.identity).clone();
        }
        command.to_string()
    }
}

/// Marks one backend call as in flight for its lifetime.
struct CallGuard {
    state: Arc<MockState>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.state.active_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock instrument backend.
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
///     let (mut backend, handle) = MockBackend::new();
///     handle.set_response("MEAS:VOLT?", "+1.250E+00");
///
///     let address = Address::new("GPIB0::8::INSTR").unwrap();
///     let mut session = backend.open(&address).await?;
///     assert_eq!(session.query("MEAS:VOLT?").await?, "+1.250E+00");
///     session.close().await?;
///
///     assert_eq!(handle.live_sessions(&address), 0);
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    /// Create a new mock backend with the default identity.
    ///
    /// Returns a tuple of (MockBackend, MockBackendHandle) where the handle
    /// scripts responses and inspects what the backend observed.
    pub fn new() -> (Self, MockBackendHandle) {
        Self::with_identity(DEFAULT_IDENTITY)
    }

    /// Create a new mock backend answering `*IDN?` with `identity`.
    pub fn with_identity(identity: impl Into<String>) -> (Self, MockBackendHandle) {
        let state = Arc::new(MockState {
            identity: Mutex::new(identity.into()),
            ..MockState::default()
        });

        let backend = Self {
            state: Arc::clone(&state),
        };
        let handle = MockBackendHandle { state };

        (backend, handle)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new().0
    }
}

impl DeviceBackend for MockBackend {
    type Session = MockSession;

    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(&mut self, address: &Address) -> Result<MockSession> {
        let _call = self.state.enter();
        self.state.simulate_latency().await;

        if guard(&self.state.failing).contains(address.as_str()) {
            return Err(HardwareError::open_failed(
                address.as_str(),
                "resource not found",
            ));
        }

        *guard(&self.state.live).entry(address.clone()).or_insert(0) += 1;
        self.state.record(MockEvent::Opened(address.clone()));

        Ok(MockSession {
            id: self.state.next_session_id.fetch_add(1, Ordering::SeqCst),
            address: address.clone(),
            output: VecDeque::new(),
            awaiting_reply: false,
            locked: false,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            state: Arc::clone(&self.state),
        })
    }
}

/// One open session on the mock backend.
#[derive(Debug)]
pub struct MockSession {
    id: u64,
    address: Address,
    output: VecDeque<String>,
    awaiting_reply: bool,
    locked: bool,
    read_timeout_ms: u64,
    state: Arc<MockState>,
}

impl MockSession {
    /// Address this session was opened for.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Check if the session currently holds a lock.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Number of responses waiting to be read.
    pub fn pending_responses(&self) -> usize {
        self.output.len()
    }
}

impl DeviceSession for MockSession {
    async fn write(&mut self, text: &str) -> Result<()> {
        let _call = self.state.enter();
        self.state.simulate_latency().await;

        *guard(&self.state.last_writer) = Some(self.id);
        self.state
            .record(MockEvent::Wrote(self.address.clone(), text.to_string()));

        let command = text.trim();
        if command.ends_with('?') {
            self.output.push_back(self.state.response_for(command));
            self.awaiting_reply = true;
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<String> {
        let _call = self.state.enter();
        self.state.simulate_latency().await;

        if self.awaiting_reply && *guard(&self.state.last_writer) != Some(self.id) {
            self.state.interleavings.fetch_add(1, Ordering::SeqCst);
        }

        let response = self
            .output
            .pop_front()
            .ok_or_else(|| HardwareError::timeout(self.read_timeout_ms))?;
        self.awaiting_reply = !self.output.is_empty();
        self.state
            .record(MockEvent::Read(self.address.clone(), response.clone()));
        Ok(response)
    }

    async fn query(&mut self, text: &str) -> Result<String> {
        self.write(text).await?;
        self.read().await
    }

    async fn configure(&mut self, settings: &Settings) -> Result<()> {
        let _call = self.state.enter();
        self.state.simulate_latency().await;

        if let Some(value) = settings.get("timeout") {
            self.read_timeout_ms = value.as_u64().ok_or_else(|| {
                HardwareError::invalid_setting(format!(
                    "timeout must be a whole number of milliseconds, got {value}"
                ))
            })?;
        }

        guard(&self.state.settings)
            .entry(self.address.clone())
            .or_default()
            .extend(settings.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.state.record(MockEvent::Configured(self.address.clone()));
        Ok(())
    }

    async fn lock(&mut self, _timeout: Duration) -> Result<()> {
        let _call = self.state.enter();
        self.locked = true;
        self.state.record(MockEvent::Locked(self.address.clone()));
        Ok(())
    }

    async fn unlock(&mut self) -> Result<()> {
        let _call = self.state.enter();
        if !self.locked {
            return Err(HardwareError::not_locked(self.address.as_str()));
        }
        self.locked = false;
        self.state.record(MockEvent::Unlocked(self.address.clone()));
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        let _call = self.state.enter();
        self.output.clear();
        self.awaiting_reply = false;
        self.state.record(MockEvent::Cleared(self.address.clone()));
        Ok(())
    }

    async fn close(mut self) -> Result<()> {
        if self.locked {
            self.clear().await?;
            self.unlock().await?;
        }

        let _call = self.state.enter();
        self.state.simulate_latency().await;

        let mut live = guard(&self.state.live);
        if let Some(count) = live.get_mut(&self.address) {
            *count -= 1;
            if *count == 0 {
                live.remove(&self.address);
            }
        }
        drop(live);

        self.state.record(MockEvent::Closed(self.address.clone()));
        Ok(())
    }
}

/// Handle for scripting and inspecting a mock backend.
///
/// It can be cloned and shared across tasks.
#[derive(Debug, Clone)]
pub struct MockBackendHandle {
    state: Arc<MockState>,
}

impl MockBackendHandle {
    /// Answer `command` with `response` on every session.
    pub fn set_response(&self, command: impl Into<String>, response: impl Into<String>) {
        guard(&self.state.responses).insert(command.into(), response.into());
    }

    /// Make every later `open` of `address` fail.
    pub fn fail_open(&self, address: impl Into<String>) {
        guard(&self.state.failing).insert(address.into());
    }

    /// Delay every backend call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.state.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of sessions currently open for `address`.
    pub fn live_sessions(&self, address: &Address) -> usize {
        guard(&self.state.live).get(address).copied().unwrap_or(0)
    }

    /// Number of sessions currently open across all addresses.
    pub fn total_live_sessions(&self) -> usize {
        guard(&self.state.live).values().sum()
    }

    /// Accumulated settings applied to `address`, if any.
    pub fn settings(&self, address: &Address) -> Option<Settings> {
        guard(&self.state.settings).get(address).cloned()
    }

    /// Every event observed so far, in order.
    pub fn events(&self) -> Vec<MockEvent> {
        guard(&self.state.events).clone()
    }

    /// Command text written to `address`, in order.
    pub fn writes(&self, address: &Address) -> Vec<String> {
        guard(&self.state.events)
            .iter()
            .filter_map(|event| match event {
                MockEvent::Wrote(a, text) if a == address => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Highest number of backend calls ever in flight at once.
    pub fn max_concurrent_calls(&self) -> usize {
        self.state.max_active_calls.load(Ordering::SeqCst)
    }

    /// Number of calls that started while another was in flight.
    pub fn overlap_count(&self) -> usize {
        self.state.overlaps.load(Ordering::SeqCst)
    }

    /// Number of reads whose query was interrupted by another session's write.
    pub fn interleaving_count(&self) -> usize {
        self.state.interleavings.load(Ordering::SeqCst)
    }
}
