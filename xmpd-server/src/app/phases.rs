//! Handler registry and the two phase tables served by this process.

use xmpd_common::error::XmpdResult;
use xmpd_core::dispatch::{
    DEFAULT_PHASE, HandlerDescriptor, HandlerRegistry, Phase, PhaseDispatcher, PhaseTable,
};
use xmpd_core::handler::Handler;
use xmpd_core::write::{WRITE_HANDLER, WriteHandler};

use super::iq::{IqBindHandler, IqNotImplementedHandler, IqRosterGetHandler, IqSessionHandler};
use super::sasl::{SaslAuthHandler, SaslErrorHandler, SaslResponseHandler};
use super::stream::{StreamEndHandler, StreamStartHandler};
use super::{STREAM_END_PHASE, STREAM_START_PHASE};
use crate::session::ClientSession;

const SASL_AUTH_MATCH: &str = "{urn:ietf:params:xml:ns:xmpp-sasl}auth";
const SASL_RESPONSE_MATCH: &str = "{urn:ietf:params:xml:ns:xmpp-sasl}response";
const IQ_BIND_MATCH: &str =
    "{jabber:client}iq[@type='set']/{urn:ietf:params:xml:ns:xmpp-bind}bind";
const IQ_SESSION_MATCH: &str =
    "{jabber:client}iq[@type='set']/{urn:ietf:params:xml:ns:xmpp-session}session";
const IQ_ROSTER_GET_MATCH: &str = "{jabber:client}iq[@type='get']/{jabber:iq:roster}query";
const IQ_MATCH: &str = "{jabber:client}iq";

/// Every handler the phase tables may name.
pub(super) fn handler_registry() -> HandlerRegistry<ClientSession> {
    let descriptors: [HandlerDescriptor<ClientSession>; 10] = [
        HandlerDescriptor {
            name: WRITE_HANDLER,
            description: "queues chain output for sending to the connection",
            build: || Handler::sync(WriteHandler),
        },
        HandlerDescriptor {
            name: "stream-start",
            description: "answers a stream header with ours and the stream features",
            build: || Handler::sync(StreamStartHandler),
        },
        HandlerDescriptor {
            name: "stream-end",
            description: "closes the stream and the connection",
            build: || Handler::sync(StreamEndHandler),
        },
        HandlerDescriptor {
            name: "sasl-auth",
            description: "starts SASL authentication for PLAIN or DIGEST-MD5",
            build: || Handler::suspending(SaslAuthHandler::default()),
        },
        HandlerDescriptor {
            name: "sasl-response",
            description: "continues a DIGEST-MD5 exchange",
            build: || Handler::suspending(SaslResponseHandler::default()),
        },
        HandlerDescriptor {
            name: "sasl-error",
            description: "renders SASL failures",
            build: || Handler::sync(SaslErrorHandler),
        },
        HandlerDescriptor {
            name: "iq-bind",
            description: "binds a resource to the session",
            build: || Handler::sync(IqBindHandler),
        },
        HandlerDescriptor {
            name: "iq-session",
            description: "establishes the session",
            build: || Handler::sync(IqSessionHandler),
        },
        HandlerDescriptor {
            name: "iq-roster-get",
            description: "returns the user's roster",
            build: || Handler::suspending(IqRosterGetHandler::default()),
        },
        HandlerDescriptor {
            name: "iq-not-implemented",
            description: "replies to unsupported iq requests with an error",
            build: || Handler::sync(IqNotImplementedHandler),
        },
    ];
    let mut registry = HandlerRegistry::new();
    for descriptor in descriptors {
        registry.register(descriptor);
    }
    registry
}

fn stream_control_phases(table: PhaseTable) -> XmpdResult<PhaseTable> {
    table
        .with_phase(Phase::new(STREAM_START_PHASE).with_handlers(&["stream-start", WRITE_HANDLER]))?
        .with_phase(Phase::new(STREAM_END_PHASE).with_handlers(&["stream-end", WRITE_HANDLER]))
}

/// Phases consulted until SASL completes.
pub(super) fn stream_phases() -> XmpdResult<PhaseTable> {
    stream_control_phases(PhaseTable::new("stream"))?
        .with_phase(
            Phase::new("sasl-auth")
                .matching(SASL_AUTH_MATCH)?
                .with_handlers(&["sasl-auth", WRITE_HANDLER])
                .with_error_handlers(&["sasl-error"]),
        )?
        .with_phase(
            Phase::new("sasl-response")
                .matching(SASL_RESPONSE_MATCH)?
                .with_handlers(&["sasl-response", WRITE_HANDLER])
                .with_error_handlers(&["sasl-error"]),
        )?
        .with_phase(Phase::new(DEFAULT_PHASE))
}

/// Phases consulted once the session is authenticated.
pub(super) fn stanza_phases() -> XmpdResult<PhaseTable> {
    stream_control_phases(PhaseTable::new("stanza"))?
        .with_phase(
            Phase::new("iq-bind")
                .matching(IQ_BIND_MATCH)?
                .with_handlers(&["iq-bind", WRITE_HANDLER]),
        )?
        .with_phase(
            Phase::new("iq-session")
                .matching(IQ_SESSION_MATCH)?
                .with_handlers(&["iq-session", WRITE_HANDLER]),
        )?
        .with_phase(
            Phase::new("iq-roster-get")
                .matching(IQ_ROSTER_GET_MATCH)?
                .with_handlers(&["iq-roster-get", WRITE_HANDLER]),
        )?
        .with_phase(
            Phase::new("iq-unknown")
                .matching(IQ_MATCH)?
                .with_handlers(&["iq-not-implemented", WRITE_HANDLER]),
        )?
        .with_phase(Phase::new(DEFAULT_PHASE))
}

/// Builds the dispatcher from the registry and both tables.
///
/// # Errors
///
/// Returns `XmpdError::InvalidConfig` when a matcher does not compile or a phase names an
/// unregistered handler.
pub(super) fn build_dispatcher() -> XmpdResult<PhaseDispatcher<ClientSession>> {
    PhaseDispatcher::new(handler_registry(), stream_phases()?, stanza_phases()?)
}

#[cfg(test)]
mod tests {
    use super::{build_dispatcher, handler_registry, stanza_phases, stream_phases};
    use googletest::prelude::*;
    use rstest::rstest;
    use xmpd_core::tree::Element;

    #[rstest]
    fn every_registered_handler_has_a_description() {
        let registry = handler_registry();
        assert_that!(registry.len(), eq(10_usize));
        for descriptor in registry.descriptors() {
            assert_that!(descriptor.description.is_empty(), eq(false));
        }
        assert_that!(build_dispatcher().is_ok(), eq(true));
    }

    fn iq(kind: &str, child: Element) -> Element {
        Element::with_namespace("iq", "jabber:client")
            .with_attr("type", kind)
            .with_attr("id", "q1")
            .with_child(child)
    }

    #[rstest]
    #[case(iq("set", Element::with_namespace("bind", "urn:ietf:params:xml:ns:xmpp-bind")), "iq-bind")]
    #[case(
        iq("set", Element::with_namespace("session", "urn:ietf:params:xml:ns:xmpp-session")),
        "iq-session"
    )]
    #[case(iq("get", Element::with_namespace("query", "jabber:iq:roster")), "iq-roster-get")]
    #[case(iq("set", Element::with_namespace("query", "jabber:iq:roster")), "iq-unknown")]
    #[case(iq("get", Element::with_namespace("query", "jabber:iq:version")), "iq-unknown")]
    #[case(Element::with_namespace("presence", "jabber:client"), "default")]
    fn stanza_table_routes_by_shape(#[case] stanza: Element, #[case] phase: &str) {
        let table = stanza_phases().expect("stanza table builds");
        let selected = table.select(&stanza, None).expect("a phase is selected");
        assert_that!(selected.name(), eq(phase));
    }

    #[rstest]
    #[case(Element::with_namespace("auth", "urn:ietf:params:xml:ns:xmpp-sasl"), "sasl-auth")]
    #[case(
        Element::with_namespace("response", "urn:ietf:params:xml:ns:xmpp-sasl"),
        "sasl-response"
    )]
    #[case(iq("set", Element::with_namespace("bind", "urn:ietf:params:xml:ns:xmpp-bind")), "default")]
    fn stream_table_only_routes_sasl(#[case] stanza: Element, #[case] phase: &str) {
        let table = stream_phases().expect("stream table builds");
        let selected = table.select(&stanza, None).expect("a phase is selected");
        assert_that!(selected.name(), eq(phase));
    }
}
