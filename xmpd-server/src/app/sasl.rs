//! SASL negotiation handlers.
//!
//! Mechanism state lives in the session; these handlers only move it along. Credential and
//! password lookups run on the worker pool, everything else on the reactor thread.

use tracing::{debug, info, warn};
use xmpd_common::error::{SaslError, XmpdError, XmpdResult};
use xmpd_core::chain::ChainControl;
use xmpd_core::handler::{ChainConnection, Offload, SuspendingHandler, Suspension, SyncHandler};
use xmpd_core::tree::Element;
use xmpd_core::value::{Payload, ReturnValue};
use xmpd_sasl::{DigestMd5, DigestResponse, DigestState, Mechanism, PlainCredentials, SASL_NS};
use xmpd_storage::StorageQuery;

use crate::session::ClientSession;

#[derive(Debug, Default)]
enum AuthStep {
    #[default]
    Idle,
    PlainLookup {
        username: String,
        lookup: Offload<bool>,
    },
    Challenge(String),
}

/// Handles `<auth mechanism='...'>`.
#[derive(Debug, Default)]
pub(super) struct SaslAuthHandler {
    step: AuthStep,
}

impl SuspendingHandler<ClientSession> for SaslAuthHandler {
    fn handle(
        &mut self,
        stanza: &Element,
        _chain: &mut ChainControl<ClientSession>,
        session: &mut ClientSession,
        _last: &ReturnValue,
    ) -> XmpdResult<Suspension> {
        let requested = stanza.get("mechanism").unwrap_or_default();
        let Some(mechanism) = Mechanism::from_name(requested) else {
            warn!(
                connection = %session.connection_id(),
                mechanism = requested,
                "mechanism not implemented"
            );
            return Err(SaslError::InvalidMechanism.into());
        };
        session.sasl.mechanism = Some(mechanism);

        match mechanism {
            Mechanism::Plain => {
                session.sasl.digest = None;
                let credentials = PlainCredentials::decode(stanza.text())?;
                credentials.check_authzid(session.hostname())?;
                let storage = session.storage();
                let query = StorageQuery::UserByCredentials {
                    username: credentials.username.clone(),
                    password: credentials.password,
                };
                let mut lookup = Offload::default();
                let suspension = lookup.start(query.label(), move || {
                    Ok(!storage.query(&query)?.is_empty())
                })?;
                self.step = AuthStep::PlainLookup {
                    username: credentials.username,
                    lookup,
                };
                Ok(suspension)
            }
            Mechanism::DigestMd5 => {
                let realm = session.hostname().to_owned();
                let digest = session.sasl.digest.insert(DigestMd5::new(realm));
                self.step = AuthStep::Challenge(digest.challenge()?);
                Ok(Suspension::immediate())
            }
        }
    }

    fn resume(
        &mut self,
        chain: &mut ChainControl<ClientSession>,
        session: &mut ClientSession,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        match std::mem::take(&mut self.step) {
            AuthStep::PlainLookup {
                username,
                mut lookup,
            } => {
                let found = lookup.finish().map_err(temporary_failure)?;
                if !found {
                    debug!(
                        connection = %session.connection_id(),
                        %username,
                        "PLAIN credentials rejected"
                    );
                    return Err(SaslError::NotAuthorized.into());
                }
                complete(chain, session, &username);
                Ok(last.clone())
            }
            AuthStep::Challenge(payload) => Ok(last.chained(challenge(payload))),
            AuthStep::Idle => Err(XmpdError::InvalidState("sasl-auth resumed without a step")),
        }
    }
}

#[derive(Debug, Default)]
enum ResponseStep {
    #[default]
    Idle,
    Verify {
        response: DigestResponse,
        lookup: Offload<Option<String>>,
    },
    Acknowledged(String),
}

/// Handles `<response>` during a DIGEST-MD5 exchange.
#[derive(Debug, Default)]
pub(super) struct SaslResponseHandler {
    step: ResponseStep,
}

impl SuspendingHandler<ClientSession> for SaslResponseHandler {
    fn handle(
        &mut self,
        stanza: &Element,
        _chain: &mut ChainControl<ClientSession>,
        session: &mut ClientSession,
        _last: &ReturnValue,
    ) -> XmpdResult<Suspension> {
        let connection = session.connection_id();
        let storage = session.storage();
        let Some(digest) = session.sasl.digest.as_mut() else {
            warn!(%connection, "sasl response without a DIGEST-MD5 exchange");
            return Err(SaslError::NotAuthorized.into());
        };
        let text = stanza.text();

        if digest.state() == DigestState::Challenge2Sent {
            let username = digest.acknowledge(text.is_empty())?;
            self.step = ResponseStep::Acknowledged(username);
            return Ok(Suspension::immediate());
        }

        let response = digest.accept_response(text)?;
        let query = StorageQuery::PasswordForUser {
            username: response.username.clone(),
        };
        let mut lookup = Offload::default();
        let suspension = lookup.start(query.label(), move || {
            Ok(storage
                .query(&query)?
                .first()
                .and_then(|row| row.get_str("password"))
                .map(str::to_owned))
        })?;
        self.step = ResponseStep::Verify { response, lookup };
        Ok(suspension)
    }

    fn resume(
        &mut self,
        chain: &mut ChainControl<ClientSession>,
        session: &mut ClientSession,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        match std::mem::take(&mut self.step) {
            ResponseStep::Verify {
                response,
                mut lookup,
            } => {
                let password = lookup.finish().map_err(temporary_failure)?;
                let Some(digest) = session.sasl.digest.as_mut() else {
                    return Err(SaslError::NotAuthorized.into());
                };
                let payload = digest.verify(&response, password.as_deref())?;
                Ok(last.chained(challenge(payload)))
            }
            ResponseStep::Acknowledged(username) => {
                complete(chain, session, &username);
                Ok(last.clone())
            }
            ResponseStep::Idle => Err(XmpdError::InvalidState(
                "sasl-response resumed without a step",
            )),
        }
    }
}

/// Renders a SASL failure as `<failure><condition/></failure>`.
#[derive(Debug, Default)]
pub(super) struct SaslErrorHandler;

impl SyncHandler<ClientSession> for SaslErrorHandler {
    fn handle(
        &mut self,
        _stanza: &Element,
        _chain: &mut ChainControl<ClientSession>,
        session: &mut ClientSession,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        let Some(condition) = last.error().and_then(XmpdError::as_sasl) else {
            warn!(
                connection = %session.connection_id(),
                error = ?last.error(),
                "sasl-error was passed a non-SASL error"
            );
            return Err(XmpdError::Handler(
                "sasl-error cannot handle a non-SASL error".to_owned(),
            ));
        };
        debug!(
            connection = %session.connection_id(),
            condition = condition.condition(),
            "sasl failure"
        );
        let failure = Element::with_namespace("failure", SASL_NS)
            .with_child(Element::new(condition.condition()));
        Ok(ReturnValue::Value(Payload::Element(failure)))
    }
}

fn challenge(payload: String) -> Element {
    Element::with_namespace("challenge", SASL_NS).with_text(payload)
}

fn temporary_failure(error: XmpdError) -> XmpdError {
    warn!(%error, "credential lookup failed");
    SaslError::TemporaryAuthFailure.into()
}

fn complete(chain: &mut ChainControl<ClientSession>, session: &mut ClientSession, username: &str) {
    session.authenticate(username);
    chain.add_text_output(&Element::with_namespace("success", SASL_NS).to_xml());
    info!(
        connection = %session.connection_id(),
        jid = session.user.jid.as_deref().unwrap_or_default(),
        mechanism = session.sasl.mechanism.map_or("-", Mechanism::name),
        "client authenticated"
    );
}
