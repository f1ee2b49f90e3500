//! Handlers and a connection double shared by the executor, dispatcher and bridge tests.

use std::sync::Arc;

use xmpd_common::error::{XmpdError, XmpdResult};
use xmpd_common::ids::ConnectionId;

use crate::chain::{ChainControl, StanzaContext};
use crate::dispatch::{HandlerDescriptor, HandlerRegistry};
use crate::handler::{ChainConnection, Handler, Offload, SuspendingHandler, Suspension, SyncHandler};
use crate::tree::Element;
use crate::value::{Payload, ReturnValue};
use crate::write::WriteHandler;

/// Connection double recording handler activity.
#[derive(Debug, Default)]
pub struct TraceConnection {
    pub id: u64,
    pub trace: Vec<String>,
    pub sent: Vec<String>,
}

impl TraceConnection {
    pub fn with_id(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

impl ChainConnection for TraceConnection {
    fn connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.id)
    }

    fn hostname(&self) -> &str {
        "localhost"
    }

    fn send(&mut self, data: &str) {
        self.sent.push(data.to_owned());
    }
}

/// Records `tag:<last>` and appends `tag` to the value.
struct Emit(&'static str);

impl SyncHandler<TraceConnection> for Emit {
    fn handle(
        &mut self,
        _stanza: &Element,
        _chain: &mut ChainControl<TraceConnection>,
        connection: &mut TraceConnection,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        connection.trace.push(format!("{}:{}", self.0, last.render()));
        Ok(last.chained(Payload::Text(self.0.to_owned())))
    }
}

/// Records its tag and fails with `Handler(tag)`.
struct Fail(&'static str);

impl SyncHandler<TraceConnection> for Fail {
    fn handle(
        &mut self,
        _stanza: &Element,
        _chain: &mut ChainControl<TraceConnection>,
        connection: &mut TraceConnection,
        _last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        connection.trace.push(self.0.to_owned());
        Err(XmpdError::Handler(self.0.to_owned()))
    }
}

/// Error handler recording the error it received.
struct Recover;

impl SyncHandler<TraceConnection> for Recover {
    fn handle(
        &mut self,
        _stanza: &Element,
        _chain: &mut ChainControl<TraceConnection>,
        connection: &mut TraceConnection,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        let error = last.error().map(ToString::to_string).unwrap_or_default();
        connection.trace.push(format!("recover:{error}"));
        Ok(ReturnValue::Value(Payload::Text("recovered".to_owned())))
    }
}

struct Stopper;

impl SyncHandler<TraceConnection> for Stopper {
    fn handle(
        &mut self,
        _stanza: &Element,
        chain: &mut ChainControl<TraceConnection>,
        connection: &mut TraceConnection,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        connection.trace.push("stop".to_owned());
        chain.stop_chain();
        Ok(last.clone())
    }
}

/// Inserts `b` paired with `recover` at the head of the chain.
struct Inserter;

impl SyncHandler<TraceConnection> for Inserter {
    fn handle(
        &mut self,
        _stanza: &Element,
        chain: &mut ChainControl<TraceConnection>,
        connection: &mut TraceConnection,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        connection.trace.push("insert".to_owned());
        chain.set_next_handler("b", Some("recover"))?;
        Ok(last.clone())
    }
}

struct Panics;

impl SyncHandler<TraceConnection> for Panics {
    fn handle(
        &mut self,
        _stanza: &Element,
        _chain: &mut ChainControl<TraceConnection>,
        _connection: &mut TraceConnection,
        _last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        panic!("handler exploded")
    }
}

/// Buffers raw output for the write handler.
struct Buffer;

impl SyncHandler<TraceConnection> for Buffer {
    fn handle(
        &mut self,
        _stanza: &Element,
        chain: &mut ChainControl<TraceConnection>,
        _connection: &mut TraceConnection,
        _last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        chain.add_text_output("<raw/>");
        Ok(ReturnValue::Value(Payload::Element(Element::new("reply"))))
    }
}

/// Offloads a job producing `slow` (or failing) and appends its result on resume.
struct Slow {
    fail: bool,
    offload: Offload<String>,
}

impl SuspendingHandler<TraceConnection> for Slow {
    fn handle(
        &mut self,
        _stanza: &Element,
        _chain: &mut ChainControl<TraceConnection>,
        connection: &mut TraceConnection,
        _last: &ReturnValue,
    ) -> XmpdResult<Suspension> {
        connection.trace.push("slow-start".to_owned());
        let fail = self.fail;
        self.offload.start("slow", move || {
            if fail {
                Err(XmpdError::Storage("backend down".to_owned()))
            } else {
                Ok("slow".to_owned())
            }
        })
    }

    fn resume(
        &mut self,
        _chain: &mut ChainControl<TraceConnection>,
        connection: &mut TraceConnection,
        last: &ReturnValue,
    ) -> XmpdResult<ReturnValue> {
        let value = self.offload.finish()?;
        connection.trace.push(format!("slow-resume:{}", last.render()));
        Ok(last.chained(Payload::Text(value)))
    }
}

fn descriptor(
    name: &'static str,
    build: fn() -> Handler<TraceConnection>,
) -> HandlerDescriptor<TraceConnection> {
    HandlerDescriptor {
        name,
        description: "test handler",
        build,
    }
}

/// Shared registry holding every test handler.
pub fn registry() -> Arc<HandlerRegistry<TraceConnection>> {
    Arc::new(handler_registry())
}

/// Registry holding every test handler.
pub fn handler_registry() -> HandlerRegistry<TraceConnection> {
    let mut registry = HandlerRegistry::new();
    registry.register(descriptor("a", || Handler::sync(Emit("a"))));
    registry.register(descriptor("b", || Handler::sync(Emit("b"))));
    registry.register(descriptor("c", || Handler::sync(Emit("c"))));
    registry.register(descriptor("fail", || Handler::sync(Fail("fail"))));
    registry.register(descriptor("fail-e", || Handler::sync(Fail("fail-e"))));
    registry.register(descriptor("recover", || Handler::sync(Recover)));
    registry.register(descriptor("stop", || Handler::sync(Stopper)));
    registry.register(descriptor("insert", || Handler::sync(Inserter)));
    registry.register(descriptor("panic", || Handler::sync(Panics)));
    registry.register(descriptor("buffer", || Handler::sync(Buffer)));
    registry.register(descriptor("write", || Handler::sync(WriteHandler)));
    registry.register(descriptor("slow", || {
        Handler::suspending(Slow {
            fail: false,
            offload: Offload::default(),
        })
    }));
    registry.register(descriptor("slow-fail", || {
        Handler::suspending(Slow {
            fail: true,
            offload: Offload::default(),
        })
    }));
    registry
}

/// Context for a `<ping/>` stanza with the given handler queues.
pub fn context(handlers: &[&str], error_handlers: &[&str]) -> StanzaContext<TraceConnection> {
    let phase = crate::dispatch::Phase::new("test")
        .with_handlers(handlers)
        .with_error_handlers(error_handlers);
    let control = ChainControl::for_phase(registry(), &phase).expect("test handlers are registered");
    StanzaContext::new(Element::new("ping"), control)
}
