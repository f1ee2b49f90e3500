//! Info/query handlers available after authentication.

use tracing::{debug, warn};
use xmpd_common::error::{XmpdError, XmpdResult};
use xmpd_core::chain::ChainControl;
use xmpd_core::handler::{ChainConnection, Offload, SuspendingHandler, Suspension, SyncHandler};
use xmpd_core::tree::Element;
use xmpd_core::value::ReturnValue;
use xmpd_sasl::nonce::generate_id;
use xmpd_storage::{RosterItem, load_roster};

use super::stream::BIND_NS;
use crate::session::ClientSession;

/// Roster namespace.
pub(super) const ROSTER_NS: &str = "jabber:iq:roster";
/// Stanza error condition namespace.
pub(super) const STANZAS_NS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

const BIND_RESOURCE_PATH: &str =
    "{urn:ietf:params:xml:ns:xmpp-bind}bind/{urn:ietf:params:xml:ns:xmpp-bind}resource";
pub(super) const GENERATED_RESOURCE_LEN: usize = 6;

fn result_iq(id: &str) -> Element {
    Element::new("iq")
        .with_attr("type", "result")
        .with_attr("id", id)
}

fn generated_resource() -> String {
    let mut resource = generate_id();
    resource.truncate(GENERATED_RESOURCE_LEN);
    resource
}

/// Binds the client's resource, or a generated one when the client asked for none.
#[derive(Debug, Default)]
pub(super) struct IqBindHandler;

impl SyncHandler<ClientSession> for IqBindHandler {
    fn handle(
        &mut self,
        stanza: &Element,
        _chain: &mut ChainControl<ClientSession>,
        session: &mut ClientSession,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        let Some(id) = stanza.get("id") else {
            warn!(connection = %session.connection_id(), "bind request without id ignored");
            return Ok(last.clone());
        };
        let Some(jid) = session.user.jid.clone() else {
            return Err(XmpdError::InvalidState("resource bind before authentication"));
        };
        let resource = stanza
            .find(BIND_RESOURCE_PATH)
            .map(|element| element.text().trim())
            .filter(|resource| !resource.is_empty())
            .map_or_else(generated_resource, str::to_owned);

        let full_jid = format!("{jid}/{resource}");
        debug!(connection = %session.connection_id(), jid = %full_jid, "resource bound");
        session.user.resource = Some(resource);

        let bind = Element::with_namespace("bind", BIND_NS)
            .with_child(Element::new("jid").with_text(full_jid));
        Ok(last.chained(result_iq(id).with_child(bind)))
    }
}

/// Accepts session establishment.
#[derive(Debug, Default)]
pub(super) struct IqSessionHandler;

impl SyncHandler<ClientSession> for IqSessionHandler {
    fn handle(
        &mut self,
        stanza: &Element,
        _chain: &mut ChainControl<ClientSession>,
        session: &mut ClientSession,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        session.user.in_session = true;
        let Some(id) = stanza.get("id") else {
            debug!(connection = %session.connection_id(), "session request without id");
            return Ok(last.clone());
        };
        let reply = result_iq(id).with_attr("from", session.hostname());
        Ok(last.chained(reply))
    }
}

/// Loads the roster on a worker and answers with a `jabber:iq:roster` result.
#[derive(Debug, Default)]
pub(super) struct IqRosterGetHandler {
    id: Option<String>,
    lookup: Offload<Vec<RosterItem>>,
}

impl SuspendingHandler<ClientSession> for IqRosterGetHandler {
    fn handle(
        &mut self,
        stanza: &Element,
        _chain: &mut ChainControl<ClientSession>,
        session: &mut ClientSession,
        _last: &ReturnValue,
    ) -> XmpdResult<Suspension> {
        let Some(id) = stanza.get("id") else {
            debug!(connection = %session.connection_id(), "roster request without id ignored");
            return Ok(Suspension::immediate());
        };
        let Some(jid) = session.user.jid.clone() else {
            return Err(XmpdError::InvalidState("roster requested before authentication"));
        };
        self.id = Some(id.to_owned());
        let storage = session.storage();
        self.lookup
            .start("roster-load", move || load_roster(storage.as_ref(), &jid))
    }

    fn resume(
        &mut self,
        _chain: &mut ChainControl<ClientSession>,
        session: &mut ClientSession,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        let Some(id) = self.id.take() else {
            return Ok(last.clone());
        };
        let items = self.lookup.finish()?;
        let query = items.iter().fold(
            Element::with_namespace("query", ROSTER_NS),
            |query, item| query.with_child(roster_item(item)),
        );
        let mut reply = result_iq(&id);
        if let Some(to) = session.full_jid() {
            reply.set_attr("to", to);
        }
        Ok(last.chained(reply.with_child(query)))
    }
}

fn roster_item(item: &RosterItem) -> Element {
    let mut element = Element::new("item")
        .with_attr("jid", item.jid.as_str())
        .with_attr("subscription", item.subscription.as_str());
    if let Some(name) = item.name.as_deref() {
        element.set_attr("name", name);
    }
    item.groups.iter().fold(element, |element, group| {
        element.with_child(Element::new("group").with_text(group.as_str()))
    })
}

/// Answers iq requests nobody else handles with `service-unavailable`.
#[derive(Debug, Default)]
pub(super) struct IqNotImplementedHandler;

impl SyncHandler<ClientSession> for IqNotImplementedHandler {
    fn handle(
        &mut self,
        stanza: &Element,
        _chain: &mut ChainControl<ClientSession>,
        session: &mut ClientSession,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        let Some(id) = stanza.get("id") else {
            debug!(connection = %session.connection_id(), "iq without id ignored");
            return Ok(last.clone());
        };
        // Replies are never answered.
        if matches!(stanza.get("type"), Some("result" | "error")) {
            return Ok(last.clone());
        }

        let mut reply = Element::new("iq")
            .with_attr("type", "error")
            .with_attr("id", id);
        for child in stanza.children() {
            reply.push_child(child.clone());
        }
        // Unsupported payload namespace, RFC 6120 section 8.3.3.19.
        let error = Element::new("error")
            .with_attr("type", "cancel")
            .with_child(Element::with_namespace("service-unavailable", STANZAS_NS));
        Ok(last.chained(reply.with_child(error)))
    }
}
