//! Serial (ASRL) instrument backend.
//!
//! Opens `ASRL<n>::INSTR`, `ASRL<path>::INSTR`, or a raw device path
//! through the `serialport` crate. Port I/O is blocking, so every call
//! moves the port onto `spawn_blocking` and takes it back afterwards.
//!
//! Supported settings:
//!
//! | Key | Value |
//! |-----|-------|
//! | `baud_rate` | integer |
//! | `timeout` | integer, milliseconds |
//! | `read_termination` | string, stripped from responses |
//! | `write_termination` | string, appended to commands |

use crate::{
    HardwareError, Result,
    traits::{DeviceBackend, DeviceSession},
};
use benchlink_core::{Address, Settings};
use serialport::{ClearBuffer, SerialPort};
use std::fmt;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, info};

/// Default baud rate for newly opened ports.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default read timeout for newly opened ports.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default termination for both directions.
pub const DEFAULT_TERMINATION: &str = "\n";

/// Resolve a resource address to an OS serial device path.
///
/// `ASRL1::INSTR` maps to the first serial port (`COM1` on Windows,
/// `/dev/ttyS0` elsewhere). `ASRL/dev/ttyUSB0::INSTR` and bare paths are
/// used as given.
///
/// # Errors
///
/// Returns `HardwareError::UnusableAddress` if no path can be derived.
pub fn port_path(address: &Address) -> Result<String> {
    let text = address.as_str();
    let inner = match text.strip_prefix("ASRL") {
        Some(rest) => rest.strip_suffix("::INSTR").unwrap_or(rest),
        None => text,
    };

    if inner.is_empty() {
        return Err(HardwareError::unusable_address(text, "no serial port named"));
    }

    if inner.bytes().all(|b| b.is_ascii_digit()) {
        let number: u32 = inner
            .parse()
            .map_err(|_| HardwareError::unusable_address(text, "bad port number"))?;
        if number == 0 {
            return Err(HardwareError::unusable_address(
                text,
                "serial port numbers start at 1",
            ));
        }
        return Ok(if cfg!(windows) {
            format!("COM{number}")
        } else {
            format!("/dev/ttyS{}", number - 1)
        });
    }

    Ok(inner.to_string())
}

/// Backend opening serial ports.
#[derive(Debug, Clone)]
pub struct SerialBackend {
    baud_rate: u32,
    timeout: Duration,
}

impl SerialBackend {
    /// Create a backend with default port parameters.
    pub fn new() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the baud rate used for newly opened ports.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the read timeout used for newly opened ports.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for SerialBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for SerialBackend {
    type Session = SerialSession;

    fn name(&self) -> &'static str {
        "serial"
    }

    async fn open(&mut self, address: &Address) -> Result<SerialSession> {
        let path = port_path(address)?;
        let (baud_rate, timeout) = (self.baud_rate, self.timeout);

        let open_path = path.clone();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(open_path, baud_rate).timeout(timeout).open()
        })
        .await
        .map_err(|e| HardwareError::Worker(e.to_string()))?
        .map_err(|e| HardwareError::open_failed(address.as_str(), e.to_string()))?;

        info!(address = %address, path = %path, baud_rate, "Serial port opened");

        Ok(SerialSession {
            address: address.clone(),
            path,
            port: Some(port),
            timeout,
            read_termination: DEFAULT_TERMINATION.to_string(),
            write_termination: DEFAULT_TERMINATION.to_string(),
            locked: false,
        })
    }
}

/// One open serial port.
pub struct SerialSession {
    address: Address,
    path: String,
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
    read_termination: String,
    write_termination: String,
    locked: bool,
}

impl fmt::Debug for SerialSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialSession")
            .field("address", &self.address)
            .field("path", &self.path)
            .field("open", &self.port.is_some())
            .field("timeout", &self.timeout)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl SerialSession {
    /// OS device path of this port.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run blocking port I/O off the runtime workers.
    async fn with_port<T, F>(&mut self, op: F) -> Result<T>
    where
        F: FnOnce(&mut dyn SerialPort) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut port = self
            .port
            .take()
            .ok_or_else(|| HardwareError::port_gone(self.address.as_str()))?;

        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = op(port.as_mut());
            (port, result)
        })
        .await
        .map_err(|e| HardwareError::Worker(e.to_string()))?;

        self.port = Some(port);
        result
    }
}

/// Read bytes until `termination` arrives, or until the port times out.
fn read_response(port: &mut dyn SerialPort, termination: &[u8], timeout_ms: u64) -> Result<String> {
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        match port.read(&mut byte) {
            Ok(0) => return Err(HardwareError::communication("serial port closed")),
            Ok(_) => {
                buffer.push(byte[0]);
                if !termination.is_empty() && buffer.ends_with(termination) {
                    buffer.truncate(buffer.len() - termination.len());
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                // Without a terminator, a quiet line ends the response.
                if termination.is_empty() && !buffer.is_empty() {
                    break;
                }
                return Err(HardwareError::timeout(timeout_ms));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    String::from_utf8(buffer)
        .map_err(|e| HardwareError::invalid_response(format!("not UTF-8: {e}")))
}

fn setting_u64(settings: &Settings, key: &str) -> Result<Option<u64>> {
    settings
        .get(key)
        .map(|value| {
            value.as_u64().ok_or_else(|| {
                HardwareError::invalid_setting(format!("{key} must be a whole number, got {value}"))
            })
        })
        .transpose()
}

fn setting_str(settings: &Settings, key: &str) -> Result<Option<String>> {
    settings
        .get(key)
        .map(|value| {
            value.as_str().map(str::to_string).ok_or_else(|| {
                HardwareError::invalid_setting(format!("{key} must be a string, got {value}"))
            })
        })
        .transpose()
}

/// A settings mapping checked in full before any of it is applied.
#[derive(Debug, Default, PartialEq, Eq)]
struct SettingsUpdate {
    baud_rate: Option<u32>,
    timeout: Option<Duration>,
    read_termination: Option<String>,
    write_termination: Option<String>,
}

impl SettingsUpdate {
    fn parse(settings: &Settings) -> Result<Self> {
        for key in settings.keys() {
            if !matches!(
                key.as_str(),
                "baud_rate" | "timeout" | "read_termination" | "write_termination"
            ) {
                return Err(HardwareError::invalid_setting(format!(
                    "unsupported setting {key}"
                )));
            }
        }

        let baud_rate = setting_u64(settings, "baud_rate")?
            .map(|rate| {
                u32::try_from(rate).map_err(|_| {
                    HardwareError::invalid_setting(format!("baud_rate out of range: {rate}"))
                })
            })
            .transpose()?;

        Ok(Self {
            baud_rate,
            timeout: setting_u64(settings, "timeout")?.map(Duration::from_millis),
            read_termination: setting_str(settings, "read_termination")?,
            write_termination: setting_str(settings, "write_termination")?,
        })
    }
}

impl DeviceSession for SerialSession {
    async fn write(&mut self, text: &str) -> Result<()> {
        let data = format!("{text}{}", self.write_termination);
        self.with_port(move |port| {
            port.write_all(data.as_bytes())?;
            port.flush()?;
            Ok(())
        })
        .await
    }

    async fn read(&mut self) -> Result<String> {
        let termination = self.read_termination.clone().into_bytes();
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        self.with_port(move |port| read_response(port, &termination, timeout_ms))
            .await
    }

    async fn query(&mut self, text: &str) -> Result<String> {
        self.write(text).await?;
        self.read().await
    }

    async fn configure(&mut self, settings: &Settings) -> Result<()> {
        let update = SettingsUpdate::parse(settings)?;
        let SettingsUpdate {
            baud_rate,
            timeout,
            read_termination,
            write_termination,
        } = update;

        if baud_rate.is_some() || timeout.is_some() {
            self.with_port(move |port| {
                if let Some(rate) = baud_rate {
                    port.set_baud_rate(rate)
                        .map_err(|e| HardwareError::invalid_setting(e.to_string()))?;
                }
                if let Some(timeout) = timeout {
                    port.set_timeout(timeout)
                        .map_err(|e| HardwareError::invalid_setting(e.to_string()))?;
                }
                Ok(())
            })
            .await?;
        }

        if let Some(timeout) = timeout {
            self.timeout = timeout;
        }
        if let Some(termination) = read_termination {
            self.read_termination = termination;
        }
        if let Some(termination) = write_termination {
            self.write_termination = termination;
        }

        debug!(address = %self.address, ?baud_rate, ?timeout, "Serial port configured");
        Ok(())
    }

    // Serial ports are opened exclusively; the lock only tracks intent.
    async fn lock(&mut self, _timeout: Duration) -> Result<()> {
        self.locked = true;
        Ok(())
    }

    async fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Err(HardwareError::not_locked(self.address.as_str()));
        }
        self.locked = false;
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        self.with_port(|port| {
            port.clear(ClearBuffer::All)
                .map_err(|e| HardwareError::communication(e.to_string()))
        })
        .await
    }

    async fn close(mut self) -> Result<()> {
        if self.locked {
            self.clear().await?;
            self.unlock().await?;
        }
        drop(self.port.take());
        info!(address = %self.address, path = %self.path, "Serial port closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ASRL/dev/ttyUSB0::INSTR", "/dev/ttyUSB0")]
    #[case("/dev/ttyACM1", "/dev/ttyACM1")]
    #[case("ASRLCOM3::INSTR", "COM3")]
    fn test_port_path_explicit(#[case] address: &str, #[case] expected: &str) {
        let address = Address::new(address).unwrap();
        assert_eq!(port_path(&address).unwrap(), expected);
    }

    #[test]
    fn test_port_path_numbered() {
        let address = Address::new("ASRL1::INSTR").unwrap();
        let expected = if cfg!(windows) { "COM1" } else { "/dev/ttyS0" };
        assert_eq!(port_path(&address).unwrap(), expected);
    }

    #[rstest]
    #[case("ASRL::INSTR")]
    #[case("ASRL0::INSTR")]
    fn test_port_path_rejected(#[case] address: &str) {
        let address = Address::new(address).unwrap();
        assert!(matches!(
            port_path(&address),
            Err(HardwareError::UnusableAddress { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let mut backend = SerialBackend::new().with_timeout(Duration::from_millis(50));
        let address = Address::new("ASRL/dev/benchlink-no-such-port::INSTR").unwrap();

        let err = backend.open(&address).await.unwrap_err();
        assert!(matches!(err, HardwareError::OpenFailed { .. }));
    }

    #[test]
    fn test_setting_helpers() {
        let mut settings = Settings::new();
        settings.insert("baud_rate".to_string(), 115_200.into());
        settings.insert("read_termination".to_string(), "\r\n".into());
        settings.insert("timeout".to_string(), "fast".into());

        assert_eq!(setting_u64(&settings, "baud_rate").unwrap(), Some(115_200));
        assert_eq!(
            setting_str(&settings, "read_termination").unwrap().as_deref(),
            Some("\r\n")
        );
        assert!(setting_u64(&settings, "timeout").is_err());
        assert_eq!(setting_u64(&settings, "missing").unwrap(), None);
    }

    fn detached_session() -> SerialSession {
        SerialSession {
            address: Address::new("ASRL1::INSTR").unwrap(),
            path: "/dev/ttyS0".to_string(),
            port: None,
            timeout: DEFAULT_TIMEOUT,
            read_termination: "\n".to_string(),
            write_termination: "\n".to_string(),
            locked: false,
        }
    }

    #[test]
    fn test_settings_update_parse() {
        let mut settings = Settings::new();
        settings.insert("baud_rate".to_string(), 115_200.into());
        settings.insert("timeout".to_string(), 250.into());
        settings.insert("write_termination".to_string(), "\r".into());

        let update = SettingsUpdate::parse(&settings).unwrap();
        assert_eq!(
            update,
            SettingsUpdate {
                baud_rate: Some(115_200),
                timeout: Some(Duration::from_millis(250)),
                read_termination: None,
                write_termination: Some("\r".to_string()),
            }
        );
    }

    #[rstest]
    #[case("parity", serde_json::json!("even"))]
    #[case("write_termination", serde_json::json!(13))]
    #[case("baud_rate", serde_json::json!(u64::MAX))]
    #[tokio::test]
    async fn test_rejected_mapping_changes_nothing(
        #[case] key: &str,
        #[case] value: serde_json::Value,
    ) {
        let mut session = detached_session();
        let mut settings = Settings::new();
        settings.insert("read_termination".to_string(), "\r\n".into());
        settings.insert(key.to_string(), value);

        let err = session.configure(&settings).await.unwrap_err();
        assert!(matches!(err, HardwareError::InvalidSetting { .. }));
        assert_eq!(session.read_termination, "\n");
        assert_eq!(session.write_termination, "\n");
    }

    #[tokio::test]
    async fn test_port_failure_leaves_terminations() {
        let mut session = detached_session();
        let mut settings = Settings::new();
        settings.insert("read_termination".to_string(), "\r\n".into());
        settings.insert("baud_rate".to_string(), 19_200.into());

        let err = session.configure(&settings).await.unwrap_err();
        assert!(matches!(err, HardwareError::PortGone { .. }));
        assert_eq!(session.read_termination, "\n");
    }

    #[tokio::test]
    async fn test_terminations_apply_without_port_call() {
        let mut session = detached_session();
        let mut settings = Settings::new();
        settings.insert("read_termination".to_string(), "\r\n".into());
        settings.insert("write_termination".to_string(), "\r".into());

        session.configure(&settings).await.unwrap();
        assert_eq!(session.read_termination, "\r\n");
        assert_eq!(session.write_termination, "\r");
    }
}
