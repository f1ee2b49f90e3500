//! Suspend/resume bridge between the reactor and the worker pool.
//!
//! When a chain suspends, the bridge submits the suspension's start action to the pool and
//! parks the context in a watch list. After every reactor poll cycle, [`SuspendBridge::poll_ready`]
//! evaluates each watch's readiness predicate and resumes the chains whose work has completed.
//! Resumption always happens on the reactor thread, so connection state is never shared with
//! workers.

use tracing::{debug, warn};
use xmpd_common::error::XmpdResult;
use xmpd_common::ids::ConnectionId;

use crate::chain::{ChainProgress, StanzaContext};
use crate::handler::{ChainConnection, Suspension};
use crate::runtime::WorkerPool;

/// Resolves a connection id back to live connection state.
pub trait ConnectionLookup<C> {
    /// Returns the connection if it is still open.
    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut C>;
}

struct Watch<C> {
    connection: ConnectionId,
    context: StanzaContext<C>,
    suspension: Suspension,
}

/// Watch list of suspended chains plus the pool executing their jobs.
pub struct SuspendBridge<C> {
    pool: WorkerPool,
    watches: Vec<Watch<C>>,
}

impl<C> std::fmt::Debug for SuspendBridge<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendBridge")
            .field("pool", &self.pool)
            .field("watches", &self.watches.len())
            .finish()
    }
}

impl<C: ChainConnection> SuspendBridge<C> {
    /// Creates a bridge submitting jobs to `pool`.
    #[must_use]
    pub const fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            watches: Vec::new(),
        }
    }

    /// Worker pool used for start actions.
    #[must_use]
    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Number of suspended chains.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.watches.len()
    }

    /// Number of suspended chains owned by one connection.
    #[must_use]
    pub fn pending_for(&self, id: ConnectionId) -> usize {
        self.watches
            .iter()
            .filter(|watch| watch.connection == id)
            .count()
    }

    /// Runs a fresh chain until it finishes or suspends.
    pub fn drive(&mut self, mut context: StanzaContext<C>, connection: &mut C) {
        let progress = context.process(connection);
        self.settle(context, connection, progress);
    }

    /// Resumes every suspended chain whose predicate is now true.
    ///
    /// Watches are evaluated in suspension order and each resumes at most once per call.
    /// Chains whose connection has closed are discarded. Returns the ids of connections that
    /// had a chain resumed, in resume order.
    pub fn poll_ready<L>(&mut self, connections: &mut L) -> Vec<ConnectionId>
    where
        L: ConnectionLookup<C> + ?Sized,
    {
        let watches = std::mem::take(&mut self.watches);
        let mut waiting = Vec::with_capacity(watches.len());
        let mut resumed = Vec::new();

        for watch in watches {
            if !watch.suspension.is_ready() {
                waiting.push(watch);
                continue;
            }
            let Watch {
                connection: id,
                mut context,
                suspension: _,
            } = watch;
            let Some(connection) = connections.connection_mut(id) else {
                debug!(
                    connection = %id,
                    phase = context.control().phase(),
                    "connection closed while chain was suspended, discarding result"
                );
                continue;
            };
            let progress = context.resume(connection);
            self.settle(context, connection, progress);
            resumed.push(id);
        }

        // Chains that suspended again while resuming were pushed onto `self.watches`.
        waiting.append(&mut self.watches);
        self.watches = waiting;
        resumed
    }

    /// Drops every suspended chain owned by `id`.
    pub fn discard_connection(&mut self, id: ConnectionId) -> usize {
        let before = self.watches.len();
        self.watches.retain(|watch| watch.connection != id);
        before - self.watches.len()
    }

    fn settle(
        &mut self,
        mut context: StanzaContext<C>,
        connection: &mut C,
        mut progress: XmpdResult<ChainProgress>,
    ) {
        loop {
            match progress {
                Ok(ChainProgress::Finished) => return,
                Err(error) => {
                    warn!(
                        connection = %connection.connection_id(),
                        phase = context.control().phase(),
                        %error,
                        "chain aborted"
                    );
                    return;
                }
                Ok(ChainProgress::Suspended(mut suspension)) => {
                    if let Some(request) = suspension.take_start() {
                        let label = request.label();
                        // A rejected request is dropped, which completes its ticket with an error.
                        if let Err(error) = self.pool.submit(request) {
                            warn!(job = label, %error, "job submission failed");
                        }
                    }
                    if suspension.is_ready() {
                        progress = context.resume(connection);
                        continue;
                    }
                    self.watches.push(Watch {
                        connection: connection.connection_id(),
                        context,
                        suspension,
                    });
                    return;
                }
            }
        }
    }
}
