//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `xmpd`.
pub type XmpdResult<T> = Result<T, XmpdError>;

/// High-level error categories.
///
/// Handler failures travel through the chain executor as values, so every variant is cheap to
/// clone and comparable in tests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XmpdError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Client payload is malformed or semantically invalid.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket or filesystem I/O failed.
    #[error("io error: {0}")]
    Io(String),

    /// Storage backend rejected or failed a query.
    #[error("storage error: {0}")]
    Storage(String),

    /// A job offloaded to the worker pool failed or never ran.
    #[error("worker job failed: {0}")]
    Job(String),

    /// A handler failed outside of the protocol error families.
    #[error("handler error: {0}")]
    Handler(String),

    /// Authentication failed with a protocol-visible condition.
    #[error("sasl failure: {0}")]
    Sasl(#[from] SaslError),
}

impl XmpdError {
    /// Returns the SASL condition carried by this error, if any.
    #[must_use]
    pub fn as_sasl(&self) -> Option<SaslError> {
        match self {
            Self::Sasl(error) => Some(*error),
            _ => None,
        }
    }
}

/// Closed set of authentication failures, one per `<failure/>` condition element.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaslError {
    /// Payload was not valid base64 or not shaped like the mechanism expects.
    #[error("incorrect encoding")]
    IncorrectEncoding,
    /// Authorization identity cannot be used by the authenticated user.
    #[error("invalid authzid")]
    InvalidAuthzid,
    /// Requested mechanism is not offered by this server.
    #[error("invalid mechanism")]
    InvalidMechanism,
    /// Requested mechanism is weaker than server policy allows.
    #[error("mechanism too weak")]
    MechanismTooWeak,
    /// Credentials did not verify.
    #[error("not authorized")]
    NotAuthorized,
    /// Verification could not complete because of a transient backend fault.
    #[error("temporary auth failure")]
    TemporaryAuthFailure,
}

impl SaslError {
    /// Returns the condition element name sent inside `<failure/>`.
    #[must_use]
    pub const fn condition(self) -> &'static str {
        match self {
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::InvalidAuthzid => "invalid-authzid",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::MechanismTooWeak => "mechanism-too-weak",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }
}
