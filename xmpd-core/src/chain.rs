//! Handler chain executor.
//!
//! One [`StanzaContext`] carries one stanza through the handler chain of its phase. Handlers run
//! in pairs: the next normal handler together with the next error handler. A pair's error
//! handler runs only when the pair's normal handler failed. The executor keeps enough state to
//! stop in the middle of a pair when a handler suspends and to continue exactly there on
//! resume.
//!
//! Value flow between pairs:
//! - a handler's value becomes the `last` value seen by the next handler;
//! - a failure is threaded as `ReturnValue::Error` into the paired error handler;
//! - a failure without an error handler is logged, the pair is dropped and the value from
//!   before the failure is restored;
//! - a failing error handler leaves its error in place, so the next pair runs its error path.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, warn};
use xmpd_common::error::{XmpdError, XmpdResult};

use crate::dispatch::{HandlerRegistry, Phase};
use crate::handler::{ChainConnection, ChainLink, Handler, Suspension};
use crate::tree::Element;
use crate::value::ReturnValue;

/// Mutable chain surface handed to every handler invocation.
pub struct ChainControl<C> {
    registry: Arc<HandlerRegistry<C>>,
    phase: String,
    handlers: VecDeque<ChainLink<C>>,
    error_handlers: VecDeque<ChainLink<C>>,
    output: String,
    stopped: bool,
}

impl<C> std::fmt::Debug for ChainControl<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainControl")
            .field("phase", &self.phase)
            .field("handlers", &self.handlers)
            .field("error_handlers", &self.error_handlers)
            .field("output", &self.output)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl<C> ChainControl<C> {
    /// Creates an empty chain for `phase`.
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry<C>>, phase: impl Into<String>) -> Self {
        Self {
            registry,
            phase: phase.into(),
            handlers: VecDeque::new(),
            error_handlers: VecDeque::new(),
            output: String::new(),
            stopped: false,
        }
    }

    /// Creates a chain with fresh handler instances for every descriptor of `phase`.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::InvalidConfig` when the phase names an unregistered handler.
    pub fn for_phase(registry: Arc<HandlerRegistry<C>>, phase: &Phase) -> XmpdResult<Self> {
        let mut control = Self::new(registry, phase.name());
        for name in phase.handlers() {
            let link = control.instantiate(name)?;
            control.handlers.push_back(link);
        }
        for name in phase.error_handlers() {
            let link = control.instantiate(name)?;
            control.error_handlers.push_back(link);
        }
        Ok(control)
    }

    /// Phase this chain was built for.
    #[must_use]
    pub fn phase(&self) -> &str {
        &self.phase
    }

    /// Appends raw text to the output buffer flushed by the write handler.
    pub fn add_text_output(&mut self, text: &str) {
        self.output.push_str(text);
    }

    /// Buffered output.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Takes and clears the buffered output.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Inserts a handler (and optionally an error handler) at the head of the queues.
    ///
    /// The inserted handler runs as the very next pair. The error queue is only touched when
    /// `error_name` is given, so pairing with later handlers shifts accordingly.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Handler` when either name is not registered. Nothing is inserted in
    /// that case.
    pub fn set_next_handler(&mut self, name: &str, error_name: Option<&str>) -> XmpdResult<()> {
        let link = self.instantiate(name).map_err(|_| {
            warn!(phase = %self.phase, handler = name, "cannot insert unknown handler");
            XmpdError::Handler(format!("unknown handler '{name}'"))
        })?;
        let error_link = match error_name {
            Some(error_name) => Some(self.instantiate(error_name).map_err(|_| {
                warn!(phase = %self.phase, handler = error_name, "cannot insert unknown error handler");
                XmpdError::Handler(format!("unknown handler '{error_name}'"))
            })?),
            None => None,
        };
        self.handlers.push_front(link);
        if let Some(error_link) = error_link {
            self.error_handlers.push_front(error_link);
        }
        Ok(())
    }

    /// Stops the chain once the running pair completes.
    pub fn stop_chain(&mut self) {
        self.stopped = true;
    }

    /// Returns `true` after [`ChainControl::stop_chain`].
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Names of the normal handlers still queued, head first.
    #[must_use]
    pub fn queued_handlers(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|link| link.name).collect()
    }

    /// Names of the error handlers still queued, head first.
    #[must_use]
    pub fn queued_error_handlers(&self) -> Vec<&'static str> {
        self.error_handlers.iter().map(|link| link.name).collect()
    }

    fn instantiate(&self, name: &str) -> XmpdResult<ChainLink<C>> {
        self.registry.instantiate(name).ok_or_else(|| {
            XmpdError::InvalidConfig(format!(
                "phase '{}' names unknown handler '{name}'",
                self.phase
            ))
        })
    }
}

/// Outcome of [`StanzaContext::process`] and [`StanzaContext::resume`].
#[derive(Debug)]
pub enum ChainProgress {
    /// Queues exhausted or chain stopped.
    Finished,
    /// A handler suspended; resume once the suspension is ready.
    Suspended(Suspension),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Normal,
    Error,
}

struct RunningPair<C> {
    handler: ChainLink<C>,
    error_handler: Option<ChainLink<C>>,
}

impl<C> std::fmt::Debug for RunningPair<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningPair")
            .field("handler", &self.handler)
            .field("error_handler", &self.error_handler)
            .finish()
    }
}

enum Invocation {
    Value(ReturnValue),
    Failed(XmpdError),
    Suspended(Suspension),
}

/// Processing state of one stanza.
pub struct StanzaContext<C> {
    stanza: Element,
    control: ChainControl<C>,
    running: Option<RunningPair<C>>,
    suspended: Option<Side>,
    last_in_pair: bool,
    last_value: ReturnValue,
    pre_failure: ReturnValue,
}

impl<C> std::fmt::Debug for StanzaContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StanzaContext")
            .field("stanza", &self.stanza.name())
            .field("control", &self.control)
            .field("running", &self.running)
            .field("suspended", &self.suspended)
            .field("last_value", &self.last_value)
            .finish_non_exhaustive()
    }
}

impl<C: ChainConnection> StanzaContext<C> {
    /// Binds a stanza to its chain.
    #[must_use]
    pub fn new(stanza: Element, control: ChainControl<C>) -> Self {
        Self {
            stanza,
            control,
            running: None,
            suspended: None,
            last_in_pair: false,
            last_value: ReturnValue::Absent,
            pre_failure: ReturnValue::Absent,
        }
    }

    /// Stanza being processed.
    #[must_use]
    pub fn stanza(&self) -> &Element {
        &self.stanza
    }

    /// Chain surface (queues, output buffer, stop flag).
    #[must_use]
    pub fn control(&self) -> &ChainControl<C> {
        &self.control
    }

    /// Value the next handler will see.
    #[must_use]
    pub fn last_value(&self) -> &ReturnValue {
        &self.last_value
    }

    /// Returns `true` while the last value is an error awaiting its error handler.
    #[must_use]
    pub fn got_exception(&self) -> bool {
        self.last_value.is_error()
    }

    /// Returns `true` between a suspension and its resume.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }

    /// Runs pairs until the queues are exhausted, the chain is stopped, or a handler suspends.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::InvalidState` when called while suspended.
    pub fn process(&mut self, connection: &mut C) -> XmpdResult<ChainProgress> {
        if self.suspended.is_some() {
            return Err(XmpdError::InvalidState("chain is suspended"));
        }
        loop {
            if self.control.stopped {
                debug!(phase = %self.control.phase, "chain stopped by handler");
                return Ok(ChainProgress::Finished);
            }
            if self.running.is_none() {
                let Some(handler) = self.control.handlers.pop_front() else {
                    return Ok(ChainProgress::Finished);
                };
                let error_handler = self.control.error_handlers.pop_front();
                self.running = Some(RunningPair {
                    handler,
                    error_handler,
                });
                self.last_in_pair = false;
            }

            if let Some(suspension) = self.step(connection) {
                return Ok(ChainProgress::Suspended(suspension));
            }
            if self.last_in_pair {
                self.running = None;
            }
        }
    }

    /// Delivers the suspended handler's value and continues the chain.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::InvalidState` when the chain is not suspended.
    pub fn resume(&mut self, connection: &mut C) -> XmpdResult<ChainProgress> {
        let Some(side) = self.suspended.take() else {
            return Err(XmpdError::InvalidState("chain is not suspended"));
        };
        let Some(pair) = self.running.as_mut() else {
            return Err(XmpdError::InvalidState("suspended chain has no running pair"));
        };
        let link = match side {
            Side::Normal => Some(&mut pair.handler),
            Side::Error => pair.error_handler.as_mut(),
        };
        let outcome = match link {
            Some(link) => {
                debug!(phase = %self.control.phase, handler = link.name, "resuming handler");
                resume_link(link, &mut self.control, connection, &self.last_value)
            }
            None => Err(XmpdError::InvalidState("suspended handler is missing")),
        };

        match (side, outcome) {
            (_, Ok(value)) => {
                self.last_value = value;
                self.last_in_pair = true;
            }
            (Side::Normal, Err(error)) => {
                self.pre_failure = std::mem::replace(&mut self.last_value, ReturnValue::Error(error));
                self.last_in_pair = false;
            }
            (Side::Error, Err(error)) => {
                self.last_value = ReturnValue::Error(error);
                self.last_in_pair = true;
            }
        }
        if self.last_in_pair {
            self.running = None;
        }
        self.process(connection)
    }

    fn step(&mut self, connection: &mut C) -> Option<Suspension> {
        let pair = self.running.as_mut()?;

        if self.last_value.is_error() {
            let Some(link) = pair.error_handler.as_mut() else {
                if let ReturnValue::Error(error) = &self.last_value {
                    warn!(
                        phase = %self.control.phase,
                        handler = pair.handler.name,
                        %error,
                        "handler error has no error handler, dropping pair"
                    );
                }
                self.last_value = std::mem::take(&mut self.pre_failure);
                self.last_in_pair = true;
                return None;
            };
            debug!(phase = %self.control.phase, handler = link.name, "running error handler");
            match invoke(link, &self.stanza, &mut self.control, connection, &self.last_value) {
                Invocation::Value(value) => self.last_value = value,
                Invocation::Failed(error) => self.last_value = ReturnValue::Error(error),
                Invocation::Suspended(suspension) => {
                    self.suspended = Some(Side::Error);
                    return Some(suspension);
                }
            }
            self.last_in_pair = true;
            return None;
        }

        let link = &mut pair.handler;
        debug!(phase = %self.control.phase, handler = link.name, "running handler");
        match invoke(link, &self.stanza, &mut self.control, connection, &self.last_value) {
            Invocation::Value(value) => {
                self.last_value = value;
                self.last_in_pair = true;
            }
            Invocation::Failed(error) => {
                debug!(phase = %self.control.phase, %error, "handler failed");
                self.pre_failure = std::mem::replace(&mut self.last_value, ReturnValue::Error(error));
            }
            Invocation::Suspended(suspension) => {
                self.suspended = Some(Side::Normal);
                return Some(suspension);
            }
        }
        None
    }
}

fn invoke<C>(
    link: &mut ChainLink<C>,
    stanza: &Element,
    control: &mut ChainControl<C>,
    connection: &mut C,
    last: &ReturnValue,
) -> Invocation {
    let name = link.name;
    let outcome = catch_unwind(AssertUnwindSafe(|| match &mut link.handler {
        Handler::Sync(handler) => handler
            .handle(stanza, control, connection, last)
            .map(Invocation::Value),
        Handler::Suspending(handler) => handler
            .handle(stanza, control, connection, last)
            .map(Invocation::Suspended),
    }));
    match outcome {
        Ok(Ok(Invocation::Value(ReturnValue::Error(error))) | Err(error)) => {
            Invocation::Failed(error)
        }
        Ok(Ok(invocation)) => invocation,
        Err(_) => {
            warn!(handler = name, "handler panicked");
            Invocation::Failed(XmpdError::Handler(format!("{name} panicked")))
        }
    }
}

fn resume_link<C>(
    link: &mut ChainLink<C>,
    control: &mut ChainControl<C>,
    connection: &mut C,
    last: &ReturnValue,
) -> XmpdResult<ReturnValue> {
    let name = link.name;
    let Handler::Suspending(handler) = &mut link.handler else {
        return Err(XmpdError::InvalidState("only suspending handlers resume"));
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| handler.resume(control, connection, last)));
    match outcome {
        Ok(Ok(ReturnValue::Error(error)) | Err(error)) => Err(error),
        Ok(Ok(value)) => Ok(value),
        Err(_) => {
            warn!(handler = name, "handler panicked on resume");
            Err(XmpdError::Handler(format!("{name} panicked")))
        }
    }
}
