//! Shared connection ingress for the reactor and handler-level tests.

use xmpd_common::error::{XmpdError, XmpdResult};
use xmpd_core::handler::ChainConnection;
use xmpd_facade::connection::MAX_PENDING_BYTES;

use crate::app::ServerApp;
use crate::session::ClientSession;

const STREAMS_NS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Feeds raw network bytes into one session and dispatches every complete stream event.
///
/// Replies accumulate in the session's outbound buffer.
///
/// # Errors
///
/// Returns protocol errors when the bytes violate stream framing or when unread input grows
/// past [`MAX_PENDING_BYTES`].
pub(crate) fn ingress_connection_bytes(
    app: &mut ServerApp,
    session: &mut ClientSession,
    bytes: &[u8],
) -> XmpdResult<()> {
    session.reader.feed_bytes(bytes);
    let pending = session.reader.pending_bytes();
    if pending > MAX_PENDING_BYTES {
        return Err(XmpdError::Protocol(format!(
            "{pending} unread bytes exceed {MAX_PENDING_BYTES}"
        )));
    }
    drain_session_events(app, session)
}

/// Dispatches buffered events until input runs out, a chain suspends or the session closes.
///
/// Events stay buffered while one of the session's chains is suspended, so replies go out in
/// request order. The reactor calls this again after resuming the session's chain.
///
/// # Errors
///
/// Returns protocol errors when buffered bytes violate stream framing.
pub(crate) fn drain_session_events(
    app: &mut ServerApp,
    session: &mut ClientSession,
) -> XmpdResult<()> {
    let id = session.connection_id();
    while !session.is_closing() && app.bridge.pending_for(id) == 0 {
        let Some(event) = session.reader.try_pop_event()? else {
            break;
        };
        app.dispatch_event(session, event);
    }
    Ok(())
}

/// Stream error sent before a connection is dropped for bad input.
#[must_use]
pub(crate) fn stream_error_reply(error: &XmpdError) -> String {
    let condition = match error {
        XmpdError::Protocol(_) => "not-well-formed",
        _ => "internal-server-error",
    };
    format!("<stream:error><{condition} xmlns='{STREAMS_NS}'/></stream:error></stream:stream>")
}

#[cfg(test)]
mod tests {
    use super::stream_error_reply;
    use googletest::prelude::*;
    use rstest::rstest;
    use xmpd_common::error::XmpdError;

    #[rstest]
    #[case(XmpdError::Protocol("bad".to_owned()), "not-well-formed")]
    #[case(XmpdError::Io("gone".to_owned()), "internal-server-error")]
    fn stream_error_names_condition(#[case] error: XmpdError, #[case] condition: &str) {
        let reply = stream_error_reply(&error);
        assert_that!(reply.as_str(), contains_substring(condition));
        assert_that!(reply.as_str(), ends_with("</stream:stream>"));
    }
}
