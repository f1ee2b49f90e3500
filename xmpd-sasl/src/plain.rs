//! PLAIN mechanism (RFC 4616): `authzid NUL authcid NUL passwd`.

use xmpd_common::error::SaslError;

use crate::encoding::decode_strict;

/// Credentials carried by one PLAIN `<auth/>` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    /// Requested authorization identity, empty when the client did not ask for one.
    pub authzid: String,
    /// Authentication identity (local username).
    pub username: String,
    /// Cleartext password.
    pub password: String,
}

impl PlainCredentials {
    /// Decodes and splits the base64 payload.
    ///
    /// # Errors
    ///
    /// Returns `SaslError::IncorrectEncoding` when the payload is empty, not strict base64, not
    /// UTF-8, or does not contain exactly three NUL separated fields. Surrounding whitespace
    /// is not stripped and counts as outside the alphabet.
    pub fn decode(encoded: &str) -> Result<Self, SaslError> {
        if encoded.is_empty() {
            return Err(SaslError::IncorrectEncoding);
        }
        let raw = decode_strict(encoded)?;
        let text = String::from_utf8(raw).map_err(|_| SaslError::IncorrectEncoding)?;
        let mut fields = text.split('\0');
        let (Some(authzid), Some(username), Some(password), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(SaslError::IncorrectEncoding);
        };
        if username.is_empty() {
            return Err(SaslError::IncorrectEncoding);
        }
        Ok(Self {
            authzid: authzid.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }

    /// Checks that the requested authorization identity is the user's own bare jid.
    ///
    /// # Errors
    ///
    /// Returns `SaslError::InvalidAuthzid` when a foreign identity was requested.
    pub fn check_authzid(&self, hostname: &str) -> Result<(), SaslError> {
        if self.authzid.is_empty() || self.authzid == self.bare_jid(hostname) {
            return Ok(());
        }
        Err(SaslError::InvalidAuthzid)
    }

    /// Bare jid assigned after successful authentication.
    #[must_use]
    pub fn bare_jid(&self, hostname: &str) -> String {
        format!("{}@{hostname}", self.username)
    }
}
