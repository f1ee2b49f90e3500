//! SASL mechanisms offered to connecting clients.
//!
//! The mechanisms here are pure protocol state: they never touch storage. Callers fetch
//! credentials (usually on a worker thread) and feed them back into the state machine.

pub mod digest;
pub mod encoding;
pub mod nonce;
pub mod plain;

pub use digest::{DigestMd5, DigestResponse, DigestState, MAX_FAILURES};
pub use plain::PlainCredentials;

/// XML namespace of SASL negotiation elements.
pub const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// Mechanism names advertised in stream features, strongest first.
pub const OFFERED_MECHANISMS: [&str; 2] = ["DIGEST-MD5", "PLAIN"];

/// Mechanism selected by an `<auth/>` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// RFC 4616 single-shot cleartext credentials.
    Plain,
    /// RFC 2831 challenge/response.
    DigestMd5,
}

impl Mechanism {
    /// Resolves an advertised mechanism name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "PLAIN" => Some(Self::Plain),
            "DIGEST-MD5" => Some(Self::DigestMd5),
            _ => None,
        }
    }

    /// Canonical mechanism name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::DigestMd5 => "DIGEST-MD5",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Mechanism, OFFERED_MECHANISMS};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn every_offered_mechanism_resolves() {
        for name in OFFERED_MECHANISMS {
            let mechanism = Mechanism::from_name(name).expect("offered mechanism must resolve");
            assert_that!(mechanism.name(), eq(name));
        }
    }

    #[rstest]
    #[case("plain")]
    #[case("SCRAM-SHA-1")]
    #[case("")]
    fn unknown_mechanism_names_do_not_resolve(#[case] name: &str) {
        assert_that!(Mechanism::from_name(name), eq(None));
    }
}
