//! DIGEST-MD5 mechanism (RFC 2831), server side.
//!
//! One [`DigestMd5`] lives in the connection's SASL state from the `<auth/>` element until the
//! exchange succeeds or the connection closes. The exchange has three states:
//!
//! - `Init`: the next step issues a fresh nonce in the first challenge.
//! - `Challenge1Sent`: the client's digest response is parsed and checked, then verified
//!   against the stored password. Success sends `rspauth` in the second challenge.
//! - `Challenge2Sent`: an empty `<response/>` acknowledges `rspauth` and completes the
//!   exchange.
//!
//! Any step taken in the wrong state, or with bad input, counts as one failure. Once failures
//! exceed [`MAX_FAILURES`] the counter and the state both go back to their initial values.

use hashbrown::HashMap;
use md5::{Digest, Md5};
use tracing::debug;
use xmpd_common::error::SaslError;

use crate::encoding::{decode_strict, encode};
use crate::nonce::generate_id;

/// Failures tolerated before the exchange is reset.
pub const MAX_FAILURES: u32 = 2;

const QOP_AUTH: &str = "auth";

/// Position of one exchange in the challenge/response sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestState {
    /// No challenge outstanding.
    Init,
    /// First challenge (realm, nonce, qop) sent; waiting for the digest response.
    Challenge1Sent,
    /// Second challenge (`rspauth`) sent; waiting for the empty acknowledgement.
    Challenge2Sent,
}

/// Directives of a client digest response that passed structural checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestResponse {
    /// Authentication identity.
    pub username: String,
    /// Realm echoed back by the client.
    pub realm: String,
    /// Server nonce echoed back by the client.
    pub nonce: String,
    /// Client nonce.
    pub cnonce: String,
    /// Nonce count exactly as sent (eight hex digits).
    pub nc: String,
    /// Requested quality-of-protection values, in client order.
    pub qop: Vec<String>,
    /// Digest URI (`xmpp/<host>`).
    pub digest_uri: String,
    /// Client-computed response digest.
    pub response: String,
    /// Requested authorization identity, if any.
    pub authzid: Option<String>,
}

/// Per-connection DIGEST-MD5 state.
#[derive(Debug, Clone)]
pub struct DigestMd5 {
    realm: String,
    nonce: Option<String>,
    nonce_count: u32,
    username: Option<String>,
    failures: u32,
    state: DigestState,
}

impl DigestMd5 {
    /// Creates an exchange for one realm (the served hostname).
    #[must_use]
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            nonce: None,
            nonce_count: 0,
            username: None,
            failures: 0,
            state: DigestState::Init,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> DigestState {
        self.state
    }

    /// Failures counted since the last reset.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Nonce of the outstanding first challenge.
    #[must_use]
    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    /// Nonce count accepted with the last valid response.
    #[must_use]
    pub const fn nonce_count(&self) -> u32 {
        self.nonce_count
    }

    /// Realm offered in challenges.
    #[must_use]
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Issues the first challenge with a fresh nonce.
    ///
    /// Returns the base64 payload of the `<challenge/>` element.
    ///
    /// # Errors
    ///
    /// Returns `SaslError::NotAuthorized` (counted) when a challenge is already outstanding.
    pub fn challenge(&mut self) -> Result<String, SaslError> {
        self.challenge_with_nonce(generate_id())
    }

    fn challenge_with_nonce(&mut self, nonce: String) -> Result<String, SaslError> {
        if self.state != DigestState::Init {
            return Err(self.fail(SaslError::NotAuthorized));
        }
        let text = format!(
            "realm=\"{}\",qop=\"{QOP_AUTH}\",nonce=\"{nonce}\",charset=utf-8,algorithm=md5-sess",
            self.realm
        );
        self.nonce = Some(nonce);
        self.state = DigestState::Challenge1Sent;
        Ok(encode(text.as_bytes()))
    }

    /// Parses and checks the client's response to the first challenge.
    ///
    /// The returned response still has to be verified against the stored password with
    /// [`DigestMd5::verify`]. Nonce, realm, nonce count and qop are checked here, so a bad
    /// nonce count never reaches digest comparison.
    ///
    /// # Errors
    ///
    /// Every error is counted as a failure:
    /// - `SaslError::IncorrectEncoding` for malformed base64 or directive syntax
    /// - `SaslError::NotAuthorized` for a wrong state, missing directives, or mismatched values
    pub fn accept_response(&mut self, encoded: &str) -> Result<DigestResponse, SaslError> {
        if self.state != DigestState::Challenge1Sent || encoded.is_empty() {
            return Err(self.fail(SaslError::NotAuthorized));
        }
        let directives = match decode_strict(encoded)
            .and_then(|raw| String::from_utf8(raw).map_err(|_| SaslError::IncorrectEncoding))
            .and_then(|text| parse_directives(&text))
        {
            Ok(directives) => directives,
            Err(error) => return Err(self.fail(error)),
        };
        let Some(response) = DigestResponse::from_directives(directives) else {
            return Err(self.fail(SaslError::NotAuthorized));
        };
        self.username = Some(response.username.clone());

        let nonce_count = u32::from_str_radix(&response.nc, 16).ok();
        let matches_issued = self.nonce.as_deref() == Some(response.nonce.as_str())
            && response.realm == self.realm;
        let qop_is_auth = response.qop.first().map(String::as_str) == Some(QOP_AUTH);
        if !matches_issued
            || nonce_count != Some(1)
            || !qop_is_auth
            || response.response.is_empty()
            || response.digest_uri.is_empty()
        {
            debug!(
                username = %response.username,
                nc = %response.nc,
                "digest response rejected before verification"
            );
            return Err(self.fail(SaslError::NotAuthorized));
        }
        self.nonce_count = 1;
        Ok(response)
    }

    /// Verifies a checked response against the user's stored password.
    ///
    /// `password` is `None` when the user does not exist. Returns the base64 payload of the
    /// second challenge carrying `rspauth`.
    ///
    /// # Errors
    ///
    /// Returns `SaslError::NotAuthorized` (counted) for an unknown user, a digest mismatch, or a
    /// wrong state.
    pub fn verify(
        &mut self,
        response: &DigestResponse,
        password: Option<&str>,
    ) -> Result<String, SaslError> {
        if self.state != DigestState::Challenge1Sent {
            return Err(self.fail(SaslError::NotAuthorized));
        }
        let Some(password) = password else {
            return Err(self.fail(SaslError::NotAuthorized));
        };

        let expected = response_digest(response, password, "AUTHENTICATE");
        if expected != response.response {
            return Err(self.fail(SaslError::NotAuthorized));
        }

        let rspauth = response_digest(response, password, "");
        self.state = DigestState::Challenge2Sent;
        Ok(encode(format!("rspauth={rspauth}").as_bytes()))
    }

    /// Completes the exchange on the client's acknowledgement of `rspauth`.
    ///
    /// `empty_response` tells whether the client sent an empty `<response/>`. Returns the
    /// authenticated username.
    ///
    /// # Errors
    ///
    /// Returns `SaslError::NotAuthorized` (counted) for anything but an empty acknowledgement
    /// in `Challenge2Sent`.
    pub fn acknowledge(&mut self, empty_response: bool) -> Result<String, SaslError> {
        if self.state != DigestState::Challenge2Sent || !empty_response {
            return Err(self.fail(SaslError::NotAuthorized));
        }
        let Some(username) = self.username.clone() else {
            return Err(self.fail(SaslError::NotAuthorized));
        };
        self.state = DigestState::Init;
        self.nonce = None;
        Ok(username)
    }

    fn fail(&mut self, error: SaslError) -> SaslError {
        self.failures += 1;
        if self.failures > MAX_FAILURES {
            debug!(realm = %self.realm, "digest exchange reset after repeated failures");
            self.failures = 0;
            self.state = DigestState::Init;
        }
        error
    }
}

impl DigestResponse {
    fn from_directives(mut directives: HashMap<String, String>) -> Option<Self> {
        let mut take = |key: &str| directives.remove(key);
        let username = take("username")?;
        let nonce = take("nonce")?;
        let realm = take("realm")?;
        let cnonce = take("cnonce")?;
        let nc = take("nc")?;
        let qop = take("qop")?;
        let response = take("response")?;
        let digest_uri = take("digest-uri")?;
        let authzid = take("authzid");
        Some(Self {
            username,
            realm,
            nonce,
            cnonce,
            nc,
            qop: qop.split(',').map(|value| value.trim().to_owned()).collect(),
            digest_uri,
            response,
            authzid,
        })
    }
}

/// Splits a `key=value,key="quoted,value"` directive list.
///
/// Commas inside quoted values do not separate directives.
fn parse_directives(text: &str) -> Result<HashMap<String, String>, SaslError> {
    let mut directives = HashMap::new();
    let mut rest = text;
    loop {
        let Some(equals) = rest.find('=') else {
            return Err(SaslError::IncorrectEncoding);
        };
        let name = rest[..equals].trim();
        if name.is_empty() {
            return Err(SaslError::IncorrectEncoding);
        }
        let after = &rest[equals + 1..];

        let (value, next) = if let Some(quoted) = after.strip_prefix('"') {
            let Some(end) = quoted.find('"') else {
                return Err(SaslError::IncorrectEncoding);
            };
            let tail = &quoted[end + 1..];
            (&quoted[..end], tail.find(',').map(|comma| &tail[comma + 1..]))
        } else {
            match after.find(',') {
                Some(comma) => (after[..comma].trim_end(), Some(&after[comma + 1..])),
                None => (after.trim_end(), None),
            }
        };
        let _ = directives.insert(name.to_owned(), value.to_owned());

        match next {
            Some(next) => rest = next,
            None => return Ok(directives),
        }
    }
}

/// `HEX(KD(HEX(H(A1)), nonce:nc:cnonce:qop:HEX(H(A2))))` with `A2 = method:digest-uri`.
///
/// `method` is `AUTHENTICATE` for the client's `response` directive and empty for the
/// server's `rspauth`.
#[must_use]
pub fn response_digest(response: &DigestResponse, password: &str, method: &str) -> String {
    let mut a1 = h(format!("{}:{}:{password}", response.username, response.realm).as_bytes());
    a1.extend_from_slice(format!(":{}:{}", response.nonce, response.cnonce).as_bytes());
    if let Some(authzid) = response.authzid.as_deref() {
        a1.extend_from_slice(format!(":{authzid}").as_bytes());
    }
    let a2 = format!("{method}:{}", response.digest_uri);
    let digest = kd(
        &hex::encode(h(&a1)),
        &format!(
            "{}:{}:{}:{QOP_AUTH}:{}",
            response.nonce,
            response.nc,
            response.cnonce,
            hex::encode(h(a2.as_bytes()))
        ),
    );
    hex::encode(digest)
}

fn h(data: &[u8]) -> Vec<u8> {
    Md5::digest(data).to_vec()
}

fn kd(key: &str, data: &str) -> Vec<u8> {
    h(format!("{key}:{data}").as_bytes())
}
