//! Phase selection and chain construction.
//!
//! A server holds two phase tables: one consulted before authentication completes (stream
//! phases) and one afterwards (stanza phases). Each phase names the handlers that make up its
//! chain. Dispatch picks a phase for the incoming stanza, instantiates fresh handlers from the
//! registry and hands the resulting [`StanzaContext`] to the suspend bridge.

use std::sync::Arc;

use tracing::{debug, warn};
use xmpd_common::error::{XmpdError, XmpdResult};

use crate::bridge::SuspendBridge;
use crate::chain::{ChainControl, StanzaContext};
use crate::handler::ChainConnection;
use crate::tree::Element;

#[path = "dispatch/descriptor.rs"]
mod descriptor;
#[path = "dispatch/phase.rs"]
mod phase;
#[path = "dispatch/registry.rs"]
mod registry;

pub use descriptor::HandlerDescriptor;
pub use phase::{DEFAULT_PHASE, Phase, PhaseTable};
pub use registry::HandlerRegistry;

/// Routes stanzas to the chains configured for their phase.
pub struct PhaseDispatcher<C> {
    registry: Arc<HandlerRegistry<C>>,
    stream_phases: PhaseTable,
    stanza_phases: PhaseTable,
}

impl<C> std::fmt::Debug for PhaseDispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseDispatcher")
            .field("registry", &self.registry)
            .field("stream_phases", &self.stream_phases)
            .field("stanza_phases", &self.stanza_phases)
            .finish()
    }
}

impl<C: ChainConnection> PhaseDispatcher<C> {
    /// Builds a dispatcher after checking that every phase names registered handlers.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::InvalidConfig` naming the first unknown handler.
    pub fn new(
        registry: HandlerRegistry<C>,
        stream_phases: PhaseTable,
        stanza_phases: PhaseTable,
    ) -> XmpdResult<Self> {
        for table in [&stream_phases, &stanza_phases] {
            for phase in table.phases() {
                let unknown = phase
                    .handlers()
                    .iter()
                    .chain(phase.error_handlers())
                    .find(|name| !registry.contains(name));
                if let Some(name) = unknown {
                    return Err(XmpdError::InvalidConfig(format!(
                        "{} phase '{}' names unknown handler '{name}'",
                        table.name(),
                        phase.name()
                    )));
                }
            }
        }
        Ok(Self {
            registry: Arc::new(registry),
            stream_phases,
            stanza_phases,
        })
    }

    /// Handler registry shared by every chain.
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry<C> {
        &self.registry
    }

    /// Phases consulted before authentication completes.
    #[must_use]
    pub const fn stream_phases(&self) -> &PhaseTable {
        &self.stream_phases
    }

    /// Phases consulted after authentication completes.
    #[must_use]
    pub const fn stanza_phases(&self) -> &PhaseTable {
        &self.stanza_phases
    }

    /// Dispatches through the stream phase table.
    pub fn dispatch_stream(
        &self,
        bridge: &mut SuspendBridge<C>,
        stanza: Element,
        connection: &mut C,
        known_phase: Option<&str>,
    ) {
        self.dispatch(&self.stream_phases, bridge, stanza, connection, known_phase);
    }

    /// Dispatches through the stanza phase table.
    pub fn dispatch_stanza(
        &self,
        bridge: &mut SuspendBridge<C>,
        stanza: Element,
        connection: &mut C,
        known_phase: Option<&str>,
    ) {
        self.dispatch(&self.stanza_phases, bridge, stanza, connection, known_phase);
    }

    /// Builds the chain for `stanza` without running it.
    ///
    /// Returns `None` when no phase applies or the selected phase has no handlers.
    #[must_use]
    pub fn build_context(
        &self,
        table: &PhaseTable,
        stanza: Element,
        known_phase: Option<&str>,
    ) -> Option<StanzaContext<C>> {
        let Some(phase) = table.select(&stanza, known_phase) else {
            debug!(table = table.name(), stanza = stanza.name(), "no phase matched");
            return None;
        };
        if phase.handlers().is_empty() {
            debug!(table = table.name(), phase = phase.name(), "phase has no handlers");
            return None;
        }
        match ChainControl::for_phase(Arc::clone(&self.registry), phase) {
            Ok(control) => Some(StanzaContext::new(stanza, control)),
            Err(error) => {
                warn!(table = table.name(), phase = phase.name(), %error, "chain construction failed");
                None
            }
        }
    }

    fn dispatch(
        &self,
        table: &PhaseTable,
        bridge: &mut SuspendBridge<C>,
        stanza: Element,
        connection: &mut C,
        known_phase: Option<&str>,
    ) {
        let Some(context) = self.build_context(table, stanza, known_phase) else {
            return;
        };
        debug!(
            connection = %connection.connection_id(),
            phase = context.control().phase(),
            "dispatching stanza"
        );
        bridge.drive(context, connection);
    }
}
