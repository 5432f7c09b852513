//! Session settings carried by CONF (and optionally OPEN).
//!
//! Settings are an opaque key/value mapping. The broker never interprets
//! them; they travel from the stub to the backend session unchanged. On the
//! wire the mapping is compact JSON, hex-encoded so the payload never holds
//! whitespace or line breaks.
//!
//! ```
//! use benchlink_protocol::{Settings, decode_settings, encode_settings};
//!
//! let mut settings = Settings::new();
//! settings.insert("timeout".to_string(), 2000.into());
//!
//! let payload = encode_settings(&settings).unwrap();
//! assert_eq!(decode_settings(&payload).unwrap(), settings);
//! ```

use benchlink_core::{Error, Result};

pub use benchlink_core::Settings;

/// Encode settings as a CONF payload.
pub fn encode_settings(settings: &Settings) -> Result<String> {
    let json = serde_json::to_vec(settings).map_err(|e| Error::InvalidSettings(e.to_string()))?;
    Ok(hex::encode(json))
}

/// Decode a CONF payload back into settings.
///
/// # Errors
///
/// Returns `Error::InvalidSettings` if the payload is not hex, or the
/// decoded bytes are not a JSON object.
pub fn decode_settings(payload: &str) -> Result<Settings> {
    let json = hex::decode(payload.trim())
        .map_err(|e| Error::InvalidSettings(format!("not hex encoded: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| Error::InvalidSettings(format!("not a settings object: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_is_lowercase_hex() {
        let mut settings = Settings::new();
        settings.insert("baud_rate".to_string(), json!(9600));
        let payload = encode_settings(&settings).unwrap();
        assert_eq!(payload, hex::encode(r#"{"baud_rate":9600}"#));
        assert!(payload.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_empty_settings() {
        let payload = encode_settings(&Settings::new()).unwrap();
        assert_eq!(payload, hex::encode("{}"));
        assert!(decode_settings(&payload).unwrap().is_empty());
    }

    #[test]
    fn test_decode_mixed_values() {
        let payload = hex::encode(r#"{"timeout":5000,"read_termination":"\n","send_end":true}"#);
        let settings = decode_settings(&payload).unwrap();
        assert_eq!(settings["timeout"], json!(5000));
        assert_eq!(settings["read_termination"], json!("\n"));
        assert_eq!(settings["send_end"], json!(true));
    }

    #[test]
    fn test_decode_rejects_non_hex() {
        let result = decode_settings("timeout=5000");
        assert!(matches!(result, Err(Error::InvalidSettings(_))));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        let result = decode_settings(&hex::encode("[1,2,3]"));
        assert!(matches!(result, Err(Error::InvalidSettings(_))));
    }
}
