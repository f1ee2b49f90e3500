//! Per-connection session state shared by the protocol handlers.

use std::sync::Arc;

use xmpd_common::ids::ConnectionId;
use xmpd_core::handler::ChainConnection;
use xmpd_facade::connection::StreamReader;
use xmpd_sasl::{DigestMd5, Mechanism};
use xmpd_storage::Storage;

/// Stream-level flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    /// `true` between the peer's stream header and its stream close.
    pub in_stream: bool,
    /// Id sent in the last stream header.
    pub id: Option<String>,
}

/// SASL negotiation state.
#[derive(Debug, Clone, Default)]
pub struct SaslState {
    /// Mechanism chosen by the last `<auth/>`.
    pub mechanism: Option<Mechanism>,
    /// DIGEST-MD5 exchange, present once that mechanism was selected.
    pub digest: Option<DigestMd5>,
    /// `true` once authentication succeeded.
    pub complete: bool,
}

/// Identity assigned to the authenticated user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserState {
    /// Bare jid (`user@host`).
    pub jid: Option<String>,
    /// Bound resource.
    pub resource: Option<String>,
    /// `true` once session establishment was accepted.
    pub in_session: bool,
}

/// Logical client connection.
///
/// Handlers reach the stream reader, authentication state and storage through this type.
/// Outbound text accumulates here until the reactor moves it into the socket write buffer.
#[derive(Debug)]
pub struct ClientSession {
    id: ConnectionId,
    hostname: Arc<str>,
    storage: Arc<dyn Storage>,
    /// Stream framing state.
    pub reader: StreamReader,
    /// Stream flags.
    pub stream: StreamState,
    /// SASL negotiation.
    pub sasl: SaslState,
    /// Authenticated identity.
    pub user: UserState,
    outbound: String,
    closing: bool,
}

impl ClientSession {
    /// Creates a session for a freshly accepted connection.
    #[must_use]
    pub fn new(id: ConnectionId, hostname: Arc<str>, storage: Arc<dyn Storage>) -> Self {
        Self {
            id,
            hostname,
            storage,
            reader: StreamReader::new(),
            stream: StreamState::default(),
            sasl: SaslState::default(),
            user: UserState::default(),
            outbound: String::new(),
            closing: false,
        }
    }

    /// Storage handle to clone into worker jobs.
    #[must_use]
    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// Full jid when a resource is bound, otherwise the bare jid.
    #[must_use]
    pub fn full_jid(&self) -> Option<String> {
        let jid = self.user.jid.as_deref()?;
        Some(match self.user.resource.as_deref() {
            Some(resource) => format!("{jid}/{resource}"),
            None => jid.to_owned(),
        })
    }

    /// Records a successful authentication and restarts stream parsing.
    pub fn authenticate(&mut self, username: &str) {
        self.sasl.complete = true;
        self.user.jid = Some(format!("{username}@{}", self.hostname));
        self.reader.reset();
    }

    /// Takes everything queued for the peer.
    pub fn take_outbound(&mut self) -> String {
        std::mem::take(&mut self.outbound)
    }

    /// Asks the reactor to close the connection once queued output is written.
    pub fn mark_closing(&mut self) {
        self.closing = true;
    }

    /// Returns `true` once the session asked to be closed.
    #[must_use]
    pub const fn is_closing(&self) -> bool {
        self.closing
    }
}

impl ChainConnection for ClientSession {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn send(&mut self, data: &str) {
        self.outbound.push_str(data);
    }
}
