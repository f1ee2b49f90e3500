//! Stream open and close handlers.

use tracing::debug;
use xmpd_common::error::XmpdResult;
use xmpd_core::chain::ChainControl;
use xmpd_core::handler::{ChainConnection, SyncHandler};
use xmpd_core::tree::{Element, escape};
use xmpd_core::value::{Payload, ReturnValue};
use xmpd_facade::protocol::STREAM_NS;
use xmpd_sasl::nonce::generate_id;
use xmpd_sasl::{OFFERED_MECHANISMS, SASL_NS};

use crate::session::ClientSession;

/// Default namespace of client streams.
pub(super) const CLIENT_NS: &str = "jabber:client";
/// Resource binding namespace.
pub(super) const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";
/// Session establishment namespace.
pub(super) const SESSION_NS: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// Answers the peer's stream header with ours and the features of the current stage.
#[derive(Debug, Default)]
pub(super) struct StreamStartHandler;

impl SyncHandler<ClientSession> for StreamStartHandler {
    fn handle(
        &mut self,
        _stanza: &Element,
        _chain: &mut ChainControl<ClientSession>,
        session: &mut ClientSession,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        let id = generate_id();
        let header = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{CLIENT_NS}' xmlns:stream='{STREAM_NS}' \
             from='{}' id='{id}' version='1.0'>",
            escape(session.hostname(), true)
        );
        debug!(connection = %session.connection_id(), stream = %id, "stream opened");
        session.stream.in_stream = true;
        session.stream.id = Some(id);
        Ok(last
            .chained(Payload::Text(header))
            .chained(stream_features(session)))
    }
}

/// SASL mechanisms before authentication, bind and session afterwards.
pub(super) fn stream_features(session: &ClientSession) -> Element {
    let features = Element::new("stream:features");
    if session.sasl.complete {
        return features
            .with_child(Element::with_namespace("bind", BIND_NS))
            .with_child(Element::with_namespace("session", SESSION_NS));
    }
    let mechanisms = OFFERED_MECHANISMS.iter().fold(
        Element::with_namespace("mechanisms", SASL_NS),
        |mechanisms, name| mechanisms.with_child(Element::new("mechanism").with_text(*name)),
    );
    features.with_child(mechanisms)
}

/// Closes our side of the stream and asks the reactor to drop the connection.
#[derive(Debug, Default)]
pub(super) struct StreamEndHandler;

impl SyncHandler<ClientSession> for StreamEndHandler {
    fn handle(
        &mut self,
        _stanza: &Element,
        _chain: &mut ChainControl<ClientSession>,
        session: &mut ClientSession,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        debug!(
            connection = %session.connection_id(),
            stream = session.stream.id.as_deref().unwrap_or("-"),
            "stream closed by peer"
        );
        session.stream.in_stream = false;
        session.mark_closing();
        Ok(last.chained(Payload::Text("</stream:stream>".to_owned())))
    }
}
