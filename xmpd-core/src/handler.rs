//! Handler contract.
//!
//! A handler is either synchronous (returns its value immediately) or suspending (hands a
//! blocking job to the worker pool and produces its value later from `resume`). Handlers are
//! generic over the connection type `C` they mutate.

use xmpd_common::error::{XmpdError, XmpdResult};
use xmpd_common::ids::ConnectionId;

use crate::chain::ChainControl;
use crate::runtime::{JobTicket, WorkRequest};
use crate::tree::Element;
use crate::value::ReturnValue;

/// Connection surface handlers and the executor rely on.
pub trait ChainConnection {
    /// Reactor-assigned id, used to find the connection again when a chain resumes.
    fn connection_id(&self) -> ConnectionId;

    /// Domain served by this connection's server.
    fn hostname(&self) -> &str;

    /// Queues text for delivery to the peer.
    fn send(&mut self, data: &str);
}

/// Handler that completes within one call.
pub trait SyncHandler<C> {
    /// Handles one stanza.
    ///
    /// `last` is the value produced by the previous pair (or the error being handled when this
    /// handler runs as an error handler).
    ///
    /// # Errors
    ///
    /// Any error switches the current pair to its error path.
    fn handle(
        &mut self,
        stanza: &Element,
        chain: &mut ChainControl<C>,
        connection: &mut C,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue>;
}

/// Handler that suspends the chain until blocking work completes.
pub trait SuspendingHandler<C> {
    /// Starts handling one stanza and describes what the chain waits for.
    ///
    /// # Errors
    ///
    /// An error returned here is treated like a synchronous failure; `resume` is not called.
    fn handle(
        &mut self,
        stanza: &Element,
        chain: &mut ChainControl<C>,
        connection: &mut C,
        last: &ReturnValue,
    ) -> XmpdResult<Suspension>;

    /// Produces the handler's value once the suspension is ready. Called exactly once.
    ///
    /// # Errors
    ///
    /// Any error switches the current pair to its error path.
    fn resume(
        &mut self,
        chain: &mut ChainControl<C>,
        connection: &mut C,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue>;
}

/// One handler instance in a chain.
pub enum Handler<C> {
    /// Completes within one call.
    Sync(Box<dyn SyncHandler<C>>),
    /// Suspends until blocking work completes.
    Suspending(Box<dyn SuspendingHandler<C>>),
}

impl<C> Handler<C> {
    /// Boxes a synchronous handler.
    #[must_use]
    pub fn sync(handler: impl SyncHandler<C> + 'static) -> Self {
        Self::Sync(Box::new(handler))
    }

    /// Boxes a suspending handler.
    #[must_use]
    pub fn suspending(handler: impl SuspendingHandler<C> + 'static) -> Self {
        Self::Suspending(Box::new(handler))
    }
}

/// Handler instance tagged with the registry name it was built from.
pub struct ChainLink<C> {
    /// Registry name, used in logs.
    pub name: &'static str,
    /// Fresh handler instance.
    pub handler: Handler<C>,
}

impl<C> std::fmt::Debug for ChainLink<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.handler {
            Handler::Sync(_) => "sync",
            Handler::Suspending(_) => "suspending",
        };
        f.debug_struct("ChainLink")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

/// Predicate the reactor polls to learn that a suspended chain can resume.
pub trait ReadyCheck {
    /// Returns `true` once the awaited work has completed.
    fn is_ready(&self) -> bool;
}

impl<T> ReadyCheck for JobTicket<T> {
    fn is_ready(&self) -> bool {
        self.is_complete()
    }
}

struct AlwaysReady;

impl ReadyCheck for AlwaysReady {
    fn is_ready(&self) -> bool {
        true
    }
}

/// What a suspending handler waits for: a poll predicate plus an optional job to start.
pub struct Suspension {
    ready: Box<dyn ReadyCheck>,
    start: Option<WorkRequest>,
}

impl std::fmt::Debug for Suspension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Suspension")
            .field("ready", &self.ready.is_ready())
            .field("start", &self.start)
            .finish()
    }
}

impl Suspension {
    /// Waits for `ticket` after submitting `request` to the worker pool.
    #[must_use]
    pub fn offload<T: 'static>(request: WorkRequest, ticket: &JobTicket<T>) -> Self {
        Self {
            ready: Box::new(ticket.clone()),
            start: Some(request),
        }
    }

    /// Resumes on the next poll without starting any job.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            ready: Box::new(AlwaysReady),
            start: None,
        }
    }

    /// Polls the predicate.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    /// Takes the start action. Only the first call returns it.
    pub fn take_start(&mut self) -> Option<WorkRequest> {
        self.start.take()
    }
}

/// Lifecycle of one offloaded job inside a suspending handler.
///
/// `start` moves `NotStarted` to `Pending`; `finish` moves `Pending` to `Done` and yields the
/// job result. Every other transition is an `XmpdError::InvalidState`, which is what keeps resume
/// exactly-once.
#[derive(Debug)]
pub enum Offload<T> {
    /// No job submitted yet.
    NotStarted,
    /// Job submitted; the ticket completes when a worker ran it.
    Pending(JobTicket<T>),
    /// Result already taken.
    Done,
}

impl<T> Default for Offload<T> {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl<T: Send + 'static> Offload<T> {
    /// Wraps `job` and returns the suspension that starts it.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::InvalidState` when a job was already started.
    pub fn start<F>(&mut self, label: &'static str, job: F) -> XmpdResult<Suspension>
    where
        F: FnOnce() -> XmpdResult<T> + Send + 'static,
    {
        if !matches!(self, Self::NotStarted) {
            return Err(XmpdError::InvalidState("offloaded job was already started"));
        }
        let (request, ticket) = WorkRequest::new(label, job);
        let suspension = Suspension::offload(request, &ticket);
        *self = Self::Pending(ticket);
        Ok(suspension)
    }

    /// Takes the job result.
    ///
    /// # Errors
    ///
    /// Returns the job's own error, or `XmpdError::InvalidState` when called before completion
    /// or a second time.
    pub fn finish(&mut self) -> XmpdResult<T> {
        let Self::Pending(ticket) = self else {
            return Err(XmpdError::InvalidState("offloaded job is not pending"));
        };
        let Some(result) = ticket.take() else {
            return Err(XmpdError::InvalidState("offloaded job has not completed"));
        };
        *self = Self::Done;
        result
    }
}
