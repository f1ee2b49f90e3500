//! Process composition root for `xmpd-server`.

mod bootstrap;
mod iq;
mod phases;
mod sasl;
mod stream;

use std::sync::Arc;

use tracing::info;
use xmpd_common::config::ServerConfig;
use xmpd_common::error::XmpdResult;
use xmpd_common::ids::ConnectionId;
use xmpd_core::bridge::SuspendBridge;
use xmpd_core::dispatch::PhaseDispatcher;
use xmpd_core::handler::ChainConnection;
use xmpd_core::runtime::{WakeSignal, WorkerPool};
use xmpd_core::tree::Element;
use xmpd_facade::FacadeModule;
use xmpd_facade::protocol::{STREAM_NS, StreamEvent};
use xmpd_storage::Storage;

use crate::session::ClientSession;

pub(crate) use bootstrap::run_server as run;

/// Known phase that receives the peer's stream header.
pub(crate) const STREAM_START_PHASE: &str = "stream-start";
/// Known phase that receives the peer's stream close.
pub(crate) const STREAM_END_PHASE: &str = "stream-end";

/// Long-lived server state owned by the reactor thread.
#[derive(Debug)]
pub struct ServerApp {
    /// Runtime configuration.
    pub config: ServerConfig,
    /// Listener model.
    pub facade: FacadeModule,
    /// Backend every session's jobs query.
    pub storage: Arc<dyn Storage>,
    /// Phase tables plus handler registry.
    pub dispatcher: PhaseDispatcher<ClientSession>,
    /// Suspended chains and the pool running their jobs.
    pub bridge: SuspendBridge<ClientSession>,
    hostname: Arc<str>,
}

impl ServerApp {
    /// Wires the dispatcher and the worker pool.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::InvalidConfig` when the phase tables are inconsistent, or
    /// `XmpdError::Io` when worker threads cannot be spawned.
    pub fn new(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        wake: Arc<dyn WakeSignal>,
    ) -> XmpdResult<Self> {
        let dispatcher = phases::build_dispatcher()?;
        let pool = WorkerPool::new(config.worker_threads, wake)?;
        Ok(Self {
            facade: FacadeModule::from_config(&config),
            hostname: Arc::from(config.hostname.as_str()),
            config,
            storage,
            dispatcher,
            bridge: SuspendBridge::new(pool),
        })
    }

    /// Creates the logical state for an accepted socket.
    #[must_use]
    pub fn new_session(&self, id: ConnectionId) -> ClientSession {
        ClientSession::new(id, Arc::clone(&self.hostname), Arc::clone(&self.storage))
    }

    /// Routes one stream event to its phase.
    ///
    /// The stream table applies until the session authenticates, the stanza table afterwards.
    pub fn dispatch_event(&mut self, session: &mut ClientSession, event: StreamEvent) {
        let (stanza, known_phase) = match event {
            StreamEvent::StreamOpen(header) => (header, Some(STREAM_START_PHASE)),
            StreamEvent::Stanza(stanza) => (stanza, None),
            StreamEvent::StreamClose => (
                Element::with_namespace("stream", STREAM_NS),
                Some(STREAM_END_PHASE),
            ),
        };
        if session.sasl.complete {
            self.dispatcher
                .dispatch_stanza(&mut self.bridge, stanza, session, known_phase);
        } else {
            self.dispatcher
                .dispatch_stream(&mut self.bridge, stanza, session, known_phase);
        }
    }

    /// Forgets a closed connection and drops its suspended chains.
    ///
    /// Jobs already handed to workers still run; their results are never picked up.
    pub fn disconnect_session(&mut self, session: &ClientSession) {
        let discarded = self.bridge.discard_connection(session.connection_id());
        info!(
            connection = %session.connection_id(),
            jid = session.user.jid.as_deref().unwrap_or("-"),
            in_stream = session.stream.in_stream,
            in_session = session.user.in_session,
            discarded,
            "connection closed"
        );
    }

    /// One-line description logged at startup.
    #[must_use]
    pub fn startup_summary(&self) -> String {
        format!(
            "xmpd serving {} on {} (workers={}, storage={}, handlers={})",
            self.config.hostname,
            self.facade.listen_address(),
            self.bridge.pool().size().get(),
            self.storage.backend(),
            self.dispatcher.registry().len()
        )
    }
}
