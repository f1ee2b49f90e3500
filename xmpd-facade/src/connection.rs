//! Connection-scoped stream state.

use xmpd_common::error::{XmpdError, XmpdResult};

use crate::protocol::{NamespaceScope, ParseStatus, StreamEvent, parse_next_event};

/// Largest amount of unread input tolerated while waiting for a stanza to complete.
pub const MAX_PENDING_BYTES: usize = 1 << 20;

/// Per-socket reader that turns network chunks into stream events.
///
/// Unread bytes stay buffered until a complete header, stanza or stream close is available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamReader {
    read_buffer: Vec<u8>,
    scope: NamespaceScope,
    header_seen: bool,
}

impl StreamReader {
    /// Creates a reader expecting a stream header.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly received network bytes.
    pub fn feed_bytes(&mut self, bytes: &[u8]) {
        self.read_buffer.extend_from_slice(bytes);
    }

    /// Tries to frame one event from buffered bytes.
    ///
    /// Returns `Ok(None)` when more bytes are required.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Protocol` for malformed XML, for a stanza before the stream header,
    /// and when unread input exceeds [`MAX_PENDING_BYTES`].
    pub fn try_pop_event(&mut self) -> XmpdResult<Option<StreamEvent>> {
        match parse_next_event(&self.read_buffer, &mut self.scope)? {
            ParseStatus::Incomplete => {
                if self.read_buffer.len() > MAX_PENDING_BYTES {
                    return Err(XmpdError::Protocol(format!(
                        "incomplete stanza exceeds {MAX_PENDING_BYTES} bytes"
                    )));
                }
                Ok(None)
            }
            ParseStatus::Complete { event, consumed } => {
                let _ = self.read_buffer.drain(..consumed);
                match &event {
                    StreamEvent::StreamOpen(_) => self.header_seen = true,
                    StreamEvent::Stanza(stanza) if !self.header_seen => {
                        return Err(XmpdError::Protocol(format!(
                            "<{}> received before stream header",
                            stanza.name()
                        )));
                    }
                    StreamEvent::Stanza(_) | StreamEvent::StreamClose => {}
                }
                Ok(Some(event))
            }
        }
    }

    /// Forgets the current stream header so the peer can open a new stream.
    ///
    /// Unread bytes are kept; a client may pipeline the new header right after the stanza
    /// that triggered the restart.
    pub fn reset(&mut self) {
        self.scope = NamespaceScope::default();
        self.header_seen = false;
    }

    /// Returns `true` once a stream header has been framed since the last reset.
    #[must_use]
    pub const fn header_seen(&self) -> bool {
        self.header_seen
    }

    /// Number of bytes still waiting to be framed.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.read_buffer.len()
    }
}
