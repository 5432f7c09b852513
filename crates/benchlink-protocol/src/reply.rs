//! Reply records.
//!
//! ```text
//! reply = VERB SP "OK"                   ; OPEN, CLOSE, WRITE, CONF
//!       / "READ" SP DATA                 ; READ, QUERY
//!       / "ERROR" SP FAULT-KIND SP TEXT  ; any failure
//! ```
//!
//! A data reply can legitimately read `READ OK` when the instrument answers
//! "OK", so replies are parsed against the verb of the request they answer.

use crate::verb::Verb;
use benchlink_core::constants::{FIELD_SEPARATOR, REPLY_DATA, REPLY_ERROR, REPLY_OK};
use benchlink_core::{Error, Fault, FaultKind, Result};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `<VERB> OK`
    Ok(Verb),
    /// `READ <data>`
    Data(String),
    /// `ERROR <kind> <description>`
    Error(Fault),
}

impl Reply {
    /// Success reply for `verb`, carrying `data` when the verb returns data.
    pub fn success(verb: Verb, data: Option<String>) -> Self {
        if verb.returns_data() {
            Reply::Data(data.unwrap_or_default())
        } else {
            Reply::Ok(verb)
        }
    }

    /// Failure reply describing `error`.
    pub fn failure(error: &Error) -> Self {
        Reply::Error(Fault::from(error))
    }

    /// Parse the reply to a request made with `expected`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnexpectedReply` when the record is neither an
    /// `ERROR` record nor the success shape `expected` calls for.
    pub fn parse(record: &str, expected: Verb) -> Result<Self> {
        if let Some(rest) = strip_token(record, REPLY_ERROR) {
            let (kind, description) = rest.split_once(FIELD_SEPARATOR).unwrap_or((rest, ""));
            let kind: FaultKind = kind
                .parse()
                .map_err(|_| Error::UnexpectedReply(record.to_string()))?;
            return Ok(Reply::Error(Fault::new(kind, description)));
        }

        if expected.returns_data() {
            return strip_token(record, REPLY_DATA)
                .map(|data| Reply::Data(data.to_string()))
                .ok_or_else(|| Error::UnexpectedReply(record.to_string()));
        }

        match record.split_once(FIELD_SEPARATOR) {
            Some((verb, REPLY_OK)) if verb == expected.as_str() => Ok(Reply::Ok(expected)),
            _ => Err(Error::UnexpectedReply(record.to_string())),
        }
    }

    /// Turn an `ERROR` reply into `Error::Remote`, keeping kind and text.
    pub fn into_result(self) -> Result<Option<String>> {
        match self {
            Reply::Ok(_) => Ok(None),
            Reply::Data(data) => Ok(Some(data)),
            Reply::Error(fault) => Err(fault.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

/// Strip a leading token, accepting both `TOKEN` and `TOKEN SP rest`.
fn strip_token<'a>(record: &'a str, token: &str) -> Option<&'a str> {
    let rest = record.strip_prefix(token)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix(FIELD_SEPARATOR)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok(verb) => write!(f, "{verb}{FIELD_SEPARATOR}{REPLY_OK}"),
            Reply::Data(data) => write!(f, "{REPLY_DATA}{FIELD_SEPARATOR}{data}"),
            Reply::Error(fault) => write!(
                f,
                "{REPLY_ERROR}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}",
                fault.kind, fault.description
            ),
        }
    }
}
