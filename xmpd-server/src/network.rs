//! Reactor-style network event loop for client streams.
//!
//! One `mio::Poll` owns the client listener, every accepted socket and a `Waker` that worker
//! threads trigger when a job completes. Socket I/O, parsing and handler chains all run on the
//! polling thread; after each readiness pass the suspend bridge resumes chains whose jobs are
//! done.

mod outbound;

use std::io::{ErrorKind, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, warn};
use xmpd_common::error::{XmpdError, XmpdResult};
use xmpd_common::ids::ConnectionId;
use xmpd_core::bridge::ConnectionLookup;
use xmpd_core::containers::HotMap;
use xmpd_core::handler::ChainConnection;
use xmpd_core::runtime::WakeSignal;

use crate::app::ServerApp;
use crate::ingress::{drain_session_events, ingress_connection_bytes, stream_error_reply};
use crate::session::ClientSession;
use outbound::{FlushOutcome, OutboundQueue, Watermarks};

const LISTENER: Token = Token(0);
const JOBS_DONE: Token = Token(1);
const FIRST_CLIENT_TOKEN: usize = 2;
const READ_BUFFER_BYTES: usize = 4096;
const MIN_EVENT_CAPACITY: usize = 64;

/// Reactor tuning. Zero values fall back to built-in minimums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ServerReactorConfig {
    pub(crate) max_events: usize,
    pub(crate) write_high_watermark_bytes: usize,
    pub(crate) write_low_watermark_bytes: usize,
}

impl ServerReactorConfig {
    #[must_use]
    pub(crate) fn event_capacity(self) -> usize {
        self.max_events.max(MIN_EVENT_CAPACITY)
    }

    #[must_use]
    pub(crate) fn watermarks(self) -> Watermarks {
        Watermarks::new(self.write_high_watermark_bytes, self.write_low_watermark_bytes)
    }
}

/// Wakes the reactor from worker threads.
#[derive(Debug)]
struct ReactorWake(Arc<Waker>);

impl WakeSignal for ReactorWake {
    fn wake(&self) {
        if let Err(error) = self.0.wake() {
            warn!(%error, "reactor wake failed");
        }
    }
}

/// Readiness of one token, copied out of `Events` so links can be mutated while iterating.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    hung_up: bool,
}

impl Readiness {
    fn of(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            hung_up: event.is_read_closed() || event.is_write_closed() || event.is_error(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Open,
    /// No more input is read; the socket drops once queued output is written.
    Flushing,
    /// Dropped at the end of the current pass without flushing.
    Dead,
}

/// One accepted socket and the session it carries.
#[derive(Debug)]
struct ClientLink {
    socket: TcpStream,
    session: ClientSession,
    outbound: OutboundQueue,
    state: LinkState,
    registered: Interest,
}

impl ClientLink {
    fn new(socket: TcpStream, session: ClientSession, watermarks: Watermarks) -> Self {
        Self {
            socket,
            session,
            outbound: OutboundQueue::new(watermarks),
            state: LinkState::Open,
            registered: Interest::READABLE,
        }
    }

    fn id(&self) -> ConnectionId {
        self.session.connection_id()
    }

    fn wants_input(&self) -> bool {
        self.state == LinkState::Open && !self.outbound.is_throttled()
    }

    fn finish(&mut self) {
        if self.state == LinkState::Open {
            self.state = LinkState::Flushing;
        }
    }

    fn is_done(&self) -> bool {
        match self.state {
            LinkState::Open => false,
            LinkState::Flushing => self.outbound.is_empty(),
            LinkState::Dead => true,
        }
    }

    fn desired_interest(&self) -> Interest {
        match (self.wants_input(), self.outbound.is_empty()) {
            (true, true) => Interest::READABLE,
            (true, false) => Interest::READABLE | Interest::WRITABLE,
            (false, _) => Interest::WRITABLE,
        }
    }

    /// Queues whatever handlers sent and honours a close requested by the session.
    fn pull_session_output(&mut self) {
        let text = self.session.take_outbound();
        if !text.is_empty() {
            self.outbound.push(&text);
        }
        if self.session.is_closing() {
            self.finish();
        }
    }

    fn reject_input(&mut self, error: &XmpdError) {
        warn!(connection = %self.id(), %error, "closing stream on bad input");
        self.session.send(&stream_error_reply(error));
        self.session.mark_closing();
        self.pull_session_output();
    }

    /// Reads until the socket would block, the peer hangs up, output backs up or a chain
    /// suspends.
    ///
    /// Bytes left unread stay in kernel buffers until the peer drains our output or the
    /// suspended chain resumes.
    fn read_input(&mut self, app: &mut ServerApp) {
        let mut buffer = [0_u8; READ_BUFFER_BYTES];
        while self.wants_input() && app.bridge.pending_for(self.id()) == 0 {
            let read = match self.socket.read(&mut buffer) {
                Ok(0) => {
                    debug!(connection = %self.id(), "peer closed its side");
                    self.finish();
                    return;
                }
                Ok(read) => read,
                Err(error) if error.kind() == ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    debug!(connection = %self.id(), %error, "client read failed");
                    self.state = LinkState::Dead;
                    return;
                }
            };
            if let Err(error) = ingress_connection_bytes(app, &mut self.session, &buffer[..read]) {
                self.reject_input(&error);
                return;
            }
            self.pull_session_output();
        }
    }

    fn flush(&mut self) {
        if self.outbound.flush_into(&mut self.socket) == FlushOutcome::Failed {
            self.state = LinkState::Dead;
        }
    }

    /// Continues a session after one of its suspended chains finished.
    ///
    /// Reading stopped while the chain was parked and edge-triggered readiness will not fire
    /// again for bytes already waiting, so the socket is read here as well.
    fn after_resume(&mut self, app: &mut ServerApp) {
        if self.state == LinkState::Open
            && let Err(error) = drain_session_events(app, &mut self.session)
        {
            self.reject_input(&error);
        }
        self.pull_session_output();
        self.read_input(app);
        self.flush();
    }
}

fn connection_id(token: Token) -> ConnectionId {
    ConnectionId::new(token.0 as u64)
}

fn token_for(id: ConnectionId) -> Token {
    Token(usize::try_from(id.get()).unwrap_or(usize::MAX))
}

/// Live sessions as seen by the suspend bridge.
struct LiveSessions<'a>(&'a mut HotMap<Token, ClientLink>);

impl ConnectionLookup<ClientSession> for LiveSessions<'_> {
    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut ClientSession> {
        self.0
            .get_mut(&token_for(id))
            .filter(|link| link.state != LinkState::Dead)
            .map(|link| &mut link.session)
    }
}

/// Reactor managing the client listener and every accepted connection.
#[derive(Debug)]
pub(crate) struct ServerReactor {
    poll: Poll,
    events: Events,
    ready: Vec<Readiness>,
    listener: TcpListener,
    waker: Arc<Waker>,
    links: HotMap<Token, ClientLink>,
    next_token: usize,
    watermarks: Watermarks,
}

impl ServerReactor {
    /// Binds the client listener and registers it together with the wake token.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Io` if the listener, the waker or poll registration fails.
    pub(crate) fn bind(addr: SocketAddr, config: ServerReactorConfig) -> XmpdResult<Self> {
        let poll =
            Poll::new().map_err(|error| XmpdError::Io(format!("create poll failed: {error}")))?;
        let mut listener = TcpListener::bind(addr)
            .map_err(|error| XmpdError::Io(format!("bind client listener failed: {error}")))?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|error| {
                XmpdError::Io(format!("register client listener in poll failed: {error}"))
            })?;
        let waker = Waker::new(poll.registry(), JOBS_DONE)
            .map_err(|error| XmpdError::Io(format!("create reactor waker failed: {error}")))?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity()),
            ready: Vec::new(),
            listener,
            waker: Arc::new(waker),
            links: HotMap::new(),
            next_token: FIRST_CLIENT_TOKEN,
            watermarks: config.watermarks(),
        })
    }

    /// Wake signal handed to the worker pool.
    pub(crate) fn wake_signal(&self) -> Arc<dyn WakeSignal> {
        Arc::new(ReactorWake(Arc::clone(&self.waker)))
    }

    /// Runs one readiness pass followed by one suspend-bridge poll.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Io` if polling, accepting or socket registration fails.
    pub(crate) fn poll_once(
        &mut self,
        app: &mut ServerApp,
        timeout: Option<Duration>,
    ) -> XmpdResult<usize> {
        self.poll
            .poll(&mut self.events, timeout)
            .map_err(|error| XmpdError::Io(format!("poll wait failed: {error}")))?;
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(self.events.iter().map(Readiness::of));

        for readiness in &ready {
            match readiness.token {
                LISTENER => self.accept_clients(app)?,
                // Completed jobs are picked up by the bridge poll below.
                JOBS_DONE => {}
                _ => self.service_link(app, *readiness)?,
            }
        }
        let count = ready.len();
        self.ready = ready;

        self.resume_suspended_chains(app)?;
        Ok(count)
    }

    pub(crate) fn local_addr(&self) -> XmpdResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|error| XmpdError::Io(format!("query local address failed: {error}")))
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.links.len()
    }

    fn accept_clients(&mut self, app: &ServerApp) -> XmpdResult<()> {
        loop {
            let (mut socket, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(error) => {
                    return Err(XmpdError::Io(format!("accept connection failed: {error}")));
                }
            };
            let token = Token(self.next_token);
            self.next_token = self.next_token.saturating_add(1);
            self.poll
                .registry()
                .register(&mut socket, token, Interest::READABLE)
                .map_err(|error| {
                    XmpdError::Io(format!("register accepted connection failed: {error}"))
                })?;
            let _ = socket.set_nodelay(true);

            let id = connection_id(token);
            info!(connection = %id, %peer, "connection accepted");
            let link = ClientLink::new(socket, app.new_session(id), self.watermarks);
            let _ = self.links.insert(token, link);
        }
    }

    fn service_link(&mut self, app: &mut ServerApp, readiness: Readiness) -> XmpdResult<()> {
        let Some(mut link) = self.links.remove(&readiness.token) else {
            return Ok(());
        };
        if readiness.readable {
            link.read_input(app);
        }
        if readiness.hung_up {
            link.finish();
        }
        if readiness.readable || readiness.writable {
            link.flush();
        }
        self.park(app, readiness.token, link)
    }

    /// Resumes ready chains, then handles whatever their sessions produced.
    fn resume_suspended_chains(&mut self, app: &mut ServerApp) -> XmpdResult<()> {
        if app.bridge.pending() == 0 {
            return Ok(());
        }
        let mut resumed = app.bridge.poll_ready(&mut LiveSessions(&mut self.links));
        resumed.dedup();
        for id in resumed {
            let token = token_for(id);
            let Some(mut link) = self.links.remove(&token) else {
                continue;
            };
            link.after_resume(app);
            self.park(app, token, link)?;
        }
        Ok(())
    }

    /// Returns a link to the table with fresh poll interest, or drops it when it is done.
    fn park(&mut self, app: &mut ServerApp, token: Token, mut link: ClientLink) -> XmpdResult<()> {
        if link.is_done() {
            self.drop_link(app, link);
            return Ok(());
        }
        let interest = link.desired_interest();
        if interest != link.registered {
            self.poll
                .registry()
                .reregister(&mut link.socket, token, interest)
                .map_err(|error| {
                    XmpdError::Io(format!("refresh connection poll interest failed: {error}"))
                })?;
            link.registered = interest;
        }
        let _ = self.links.insert(token, link);
        Ok(())
    }

    fn drop_link(&self, app: &mut ServerApp, mut link: ClientLink) {
        if let Err(error) = self.poll.registry().deregister(&mut link.socket) {
            warn!(connection = %link.id(), %error, "deregister closed connection failed");
        }
        app.disconnect_session(&link.session);
    }
}
