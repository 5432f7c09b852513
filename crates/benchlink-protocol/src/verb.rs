//! Request verbs.
//!
//! Every request starts with one of six verbs. The verb decides whether a
//! payload is required and which success reply the handler sends back:
//!
//! | Verb  | Payload               | Success reply     |
//! |-------|-----------------------|-------------------|
//! | OPEN  | optional settings     | `OPEN OK`         |
//! | CLOSE | ignored               | `CLOSE OK`        |
//! | WRITE | command text          | `WRITE OK`        |
//! | READ  | ignored               | `READ <data>`     |
//! | QUERY | command text          | `READ <data>`     |
//! | CONF  | encoded settings      | `CONF OK`         |
//!
//! ```
//! use benchlink_protocol::Verb;
//!
//! let verb = Verb::parse("query").unwrap();
//! assert_eq!(verb, Verb::Query);
//! assert_eq!(verb.as_str(), "QUERY");
//! assert!(verb.returns_data());
//! ```

use benchlink_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Open,
    Close,
    Write,
    Read,
    Query,
    Conf,
}

impl Verb {
    /// All verbs, in wire-table order.
    pub const ALL: [Verb; 6] = [
        Verb::Open,
        Verb::Close,
        Verb::Write,
        Verb::Read,
        Verb::Query,
        Verb::Conf,
    ];

    /// Parse a verb token. Matching is case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownVerb` for anything outside the six verbs.
    pub fn parse(token: &str) -> Result<Self> {
        match token.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(Self::Open),
            "CLOSE" => Ok(Self::Close),
            "WRITE" => Ok(Self::Write),
            "READ" => Ok(Self::Read),
            "QUERY" => Ok(Self::Query),
            "CONF" => Ok(Self::Conf),
            _ => Err(Error::UnknownVerb(token.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::Write => "WRITE",
            Self::Read => "READ",
            Self::Query => "QUERY",
            Self::Conf => "CONF",
        }
    }

    /// Whether a request with this verb is malformed without a payload.
    pub fn requires_payload(&self) -> bool {
        matches!(self, Self::Write | Self::Query | Self::Conf)
    }

    /// Whether success carries data (`READ <data>`) instead of `<VERB> OK`.
    pub fn returns_data(&self) -> bool {
        matches!(self, Self::Read | Self::Query)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("OPEN", Verb::Open)]
    #[case("close", Verb::Close)]
    #[case("Write", Verb::Write)]
    #[case("READ", Verb::Read)]
    #[case("qUeRy", Verb::Query)]
    #[case("conf", Verb::Conf)]
    fn test_parse_case_insensitive(#[case] token: &str, #[case] expected: Verb) {
        assert_eq!(Verb::parse(token).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("LOCK")]
    #[case("OPENX")]
    #[case("ERROR")]
    fn test_parse_unknown(#[case] token: &str) {
        assert!(matches!(Verb::parse(token), Err(Error::UnknownVerb(_))));
    }

    #[test]
    fn test_as_str_matches_parse() {
        for verb in Verb::ALL {
            assert_eq!(Verb::parse(verb.as_str()).unwrap(), verb);
            assert_eq!(verb.to_string(), verb.as_str());
        }
    }

    #[test]
    fn test_payload_requirements() {
        assert!(Verb::Write.requires_payload());
        assert!(Verb::Query.requires_payload());
        assert!(Verb::Conf.requires_payload());
        assert!(!Verb::Open.requires_payload());
        assert!(!Verb::Read.requires_payload());
        assert!(!Verb::Close.requires_payload());
    }

    #[test]
    fn test_returns_data() {
        let data_verbs: Vec<Verb> = Verb::ALL.into_iter().filter(Verb::returns_data).collect();
        assert_eq!(data_verbs, vec![Verb::Read, Verb::Query]);
    }
}
