//! Request records.
//!
//! # Grammar
//!
//! ```text
//! request = VERB SP ADDRESS [SP PAYLOAD]
//! ```
//!
//! The payload is everything after the second separator, kept byte for
//! byte: command text may itself contain spaces (`WRITE ASRL1::INSTR
//! FREQ 1 KHZ`).
//!
//! ```
//! use benchlink_protocol::{Request, Verb};
//!
//! let request = Request::parse("WRITE GPIB0::8::INSTR VOLT 1.5; OUTP ON").unwrap();
//! assert_eq!(request.verb, Verb::Write);
//! assert_eq!(request.address.as_str(), "GPIB0::8::INSTR");
//! assert_eq!(request.payload(), Some("VOLT 1.5; OUTP ON"));
//! ```

use crate::settings::{Settings, encode_settings};
use crate::verb::Verb;
use benchlink_core::constants::FIELD_SEPARATOR;
use benchlink_core::{Address, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Parsed request record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub verb: Verb,
    pub address: Address,
    pub payload: Option<String>,
}

impl Request {
    pub fn new(verb: Verb, address: Address, payload: Option<String>) -> Self {
        Request {
            verb,
            address,
            payload,
        }
    }

    pub fn open(address: Address) -> Self {
        Self::new(Verb::Open, address, None)
    }

    /// OPEN that applies `settings` to the session once it is open.
    pub fn open_with_settings(address: Address, settings: &Settings) -> Result<Self> {
        Ok(Self::new(
            Verb::Open,
            address,
            Some(encode_settings(settings)?),
        ))
    }

    pub fn close(address: Address) -> Self {
        Self::new(Verb::Close, address, None)
    }

    pub fn write(address: Address, text: impl Into<String>) -> Self {
        Self::new(Verb::Write, address, Some(text.into()))
    }

    pub fn read(address: Address) -> Self {
        Self::new(Verb::Read, address, None)
    }

    pub fn query(address: Address, text: impl Into<String>) -> Self {
        Self::new(Verb::Query, address, Some(text.into()))
    }

    pub fn conf(address: Address, settings: &Settings) -> Result<Self> {
        Ok(Self::new(
            Verb::Conf,
            address,
            Some(encode_settings(settings)?),
        ))
    }

    /// Parse a request record.
    ///
    /// # Errors
    ///
    /// - `Error::MissingField` if the verb, address or a required payload is absent
    /// - `Error::UnknownVerb` for an unrecognised verb
    /// - `Error::InvalidAddress` if the address token is not a valid address
    pub fn parse(record: &str) -> Result<Self> {
        if record.is_empty() {
            return Err(Error::MissingField("verb".to_string()));
        }

        let (verb_token, rest) = match record.split_once(FIELD_SEPARATOR) {
            Some((verb, rest)) => (verb, Some(rest)),
            None => (record, None),
        };
        let verb = Verb::parse(verb_token)?;

        let rest = rest.ok_or_else(|| Error::MissingField("address".to_string()))?;
        let (address_token, payload) = match rest.split_once(FIELD_SEPARATOR) {
            Some((address, payload)) => (address, Some(payload.to_string())),
            None => (rest, None),
        };
        if address_token.is_empty() {
            return Err(Error::MissingField("address".to_string()));
        }
        let address = Address::new(address_token)?;

        if verb.requires_payload() && payload.is_none() {
            return Err(Error::MissingField(format!("payload for {verb}")));
        }

        Ok(Request::new(verb, address, payload))
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// Get the payload or fail with `MissingField`.
    pub fn required_payload(&self) -> Result<&str> {
        self.payload()
            .ok_or_else(|| Error::MissingField(format!("payload for {}", self.verb)))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.verb, FIELD_SEPARATOR, self.address)?;
        if let Some(payload) = &self.payload {
            write!(f, "{FIELD_SEPARATOR}{payload}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[test]
    fn test_parse_open() {
        let request = Request::parse("OPEN GPIB0::1::INSTR").unwrap();
        assert_eq!(request.verb, Verb::Open);
        assert_eq!(request.address, addr("GPIB0::1::INSTR"));
        assert_eq!(request.payload(), None);
    }

    #[test]
    fn test_parse_lowercase_verb() {
        let request = Request::parse("close GPIB0::1::INSTR").unwrap();
        assert_eq!(request.verb, Verb::Close);
    }

    #[test]
    fn test_payload_keeps_inner_spaces() {
        let request = Request::parse("QUERY ASRL3::INSTR MEAS:VOLT:DC?  AUTO").unwrap();
        assert_eq!(request.payload(), Some("MEAS:VOLT:DC?  AUTO"));
    }

    #[test]
    fn test_payload_keeps_line_breaks() {
        let request = Request::parse("WRITE ASRL3::INSTR *RST\n*CLS").unwrap();
        assert_eq!(request.payload(), Some("*RST\n*CLS"));
    }

    #[test]
    fn test_empty_payload_after_separator_is_present() {
        let request = Request::parse("WRITE ASRL3::INSTR ").unwrap();
        assert_eq!(request.payload(), Some(""));
    }

    #[test]
    fn test_read_ignores_payload() {
        let request = Request::parse("READ GPIB0::1::INSTR extra").unwrap();
        assert_eq!(request.verb, Verb::Read);
        assert_eq!(request.payload(), Some("extra"));
    }

    #[rstest]
    #[case("", "verb")]
    #[case("OPEN", "address")]
    #[case("OPEN ", "address")]
    #[case("WRITE GPIB0::1::INSTR", "payload for WRITE")]
    #[case("QUERY GPIB0::1::INSTR", "payload for QUERY")]
    #[case("CONF GPIB0::1::INSTR", "payload for CONF")]
    fn test_missing_fields(#[case] record: &str, #[case] field: &str) {
        match Request::parse(record) {
            Err(Error::MissingField(name)) => assert_eq!(name, field),
            other => panic!("expected MissingField({field}), got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_verb() {
        let result = Request::parse("LOCK GPIB0::1::INSTR 5000");
        assert!(matches!(result, Err(Error::UnknownVerb(v)) if v == "LOCK"));
    }

    #[test]
    fn test_address_with_tab_rejected() {
        let result = Request::parse("OPEN GPIB0::1\t::INSTR");
        assert!(matches!(result, Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Request::open(addr("GPIB0::1::INSTR")).to_string(),
            "OPEN GPIB0::1::INSTR"
        );
        assert_eq!(
            Request::query(addr("GPIB0::1::INSTR"), "*IDN?").to_string(),
            "QUERY GPIB0::1::INSTR *IDN?"
        );
        assert_eq!(
            Request::read(addr("ASRL1::INSTR")).to_string(),
            "READ ASRL1::INSTR"
        );
    }

    #[test]
    fn test_conf_payload_has_no_whitespace() {
        let mut settings = Settings::new();
        settings.insert("read_termination".to_string(), "\r\n".into());
        settings.insert("timeout".to_string(), 5000.into());

        let request = Request::conf(addr("ASRL1::INSTR"), &settings).unwrap();
        let payload = request.required_payload().unwrap();
        assert!(!payload.chars().any(char::is_whitespace));

        let parsed = Request::parse(&request.to_string()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_required_payload_missing() {
        let request = Request::close(addr("ASRL1::INSTR"));
        assert!(matches!(
            request.required_payload(),
            Err(Error::MissingField(_))
        ));
    }
}
