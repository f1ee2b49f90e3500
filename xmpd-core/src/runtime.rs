//! Worker pool for blocking handler jobs.
//!
//! Handlers never block the reactor thread. A handler that needs storage or other slow work
//! wraps it in a [`WorkRequest`], keeps the matching [`JobTicket`], and suspends. Workers run
//! the job, publish the result into the ticket and wake the reactor, which polls the ticket on
//! its own thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, warn};
use xmpd_common::error::{XmpdError, XmpdResult};
use xmpd_common::ids::WorkerCount;

/// Cross-thread signal that interrupts the reactor's readiness wait.
pub trait WakeSignal: Send + Sync {
    /// Wakes the reactor. Must not block.
    fn wake(&self);
}

/// Wake signal for pools whose owner polls on its own schedule.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWake;

impl WakeSignal for NoopWake {
    fn wake(&self) {}
}

struct TicketSlot<T> {
    complete: AtomicBool,
    result: Mutex<Option<XmpdResult<T>>>,
}

impl<T> TicketSlot<T> {
    fn publish(&self, result: XmpdResult<T>) {
        let mut guard = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(result);
        drop(guard);
        self.complete.store(true, Ordering::Release);
    }
}

/// Completion handle for one submitted job.
///
/// The result is published exactly once, by the worker that ran the job or by the drop of a
/// request that never ran.
pub struct JobTicket<T> {
    slot: Arc<TicketSlot<T>>,
}

impl<T> Clone for JobTicket<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> std::fmt::Debug for JobTicket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTicket")
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl<T> JobTicket<T> {
    /// Returns `true` once the job's result is available.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slot.complete.load(Ordering::Acquire)
    }

    /// Takes the published result.
    ///
    /// Returns `None` before completion and after the result was already taken.
    #[must_use]
    pub fn take(&self) -> Option<XmpdResult<T>> {
        if !self.is_complete() {
            return None;
        }
        self.slot
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

trait ErasedJob: Send {
    fn run(self: Box<Self>);
    fn abandon(self: Box<Self>);
}

struct TypedJob<T, F> {
    label: &'static str,
    job: F,
    slot: Arc<TicketSlot<T>>,
}

impl<T, F> ErasedJob for TypedJob<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> XmpdResult<T> + Send + 'static,
{
    fn run(self: Box<Self>) {
        let Self { label, job, slot } = *self;
        let result = catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
            warn!(job = label, "worker job panicked");
            Err(XmpdError::Job(format!("{label} panicked")))
        });
        slot.publish(result);
    }

    fn abandon(self: Box<Self>) {
        self.slot
            .publish(Err(XmpdError::Job(format!("{} was never executed", self.label))));
    }
}

/// Blocking job handed to the [`WorkerPool`].
///
/// Owned by the pool until executed. Dropping a request that never ran publishes a
/// `XmpdError::Job` result, so a waiting ticket always completes.
pub struct WorkRequest {
    label: &'static str,
    job: Option<Box<dyn ErasedJob>>,
}

impl std::fmt::Debug for WorkRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRequest")
            .field("label", &self.label)
            .field("pending", &self.job.is_some())
            .finish()
    }
}

impl WorkRequest {
    /// Wraps a blocking job and returns it with its completion ticket.
    #[must_use]
    pub fn new<T, F>(label: &'static str, job: F) -> (Self, JobTicket<T>)
    where
        T: Send + 'static,
        F: FnOnce() -> XmpdResult<T> + Send + 'static,
    {
        let slot = Arc::new(TicketSlot {
            complete: AtomicBool::new(false),
            result: Mutex::new(None),
        });
        let request = Self {
            label,
            job: Some(Box::new(TypedJob {
                label,
                job,
                slot: Arc::clone(&slot),
            })),
        };
        (request, JobTicket { slot })
    }

    /// Diagnostic label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        self.label
    }

    /// Runs the job on the calling thread and publishes its result.
    pub fn run(mut self) {
        if let Some(job) = self.job.take() {
            job.run();
        }
    }
}

impl Drop for WorkRequest {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            job.abandon();
        }
    }
}

/// Fixed-size pool of threads executing [`WorkRequest`]s.
pub struct WorkerPool {
    size: WorkerCount,
    sender: Option<Sender<WorkRequest>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl WorkerPool {
    /// Starts `size` worker threads sharing one job queue.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Io` when a worker thread cannot be spawned.
    pub fn new(size: WorkerCount, wake: Arc<dyn WakeSignal>) -> XmpdResult<Self> {
        let (sender, receiver) = channel::unbounded::<WorkRequest>();
        let mut workers = Vec::with_capacity(usize::from(size.get()));
        for index in 0..size.get() {
            let receiver = receiver.clone();
            let wake = Arc::clone(&wake);
            let handle = thread::Builder::new()
                .name(format!("xmpd-worker-{index}"))
                .spawn(move || worker_loop(&receiver, wake.as_ref()))
                .map_err(|error| XmpdError::Io(format!("spawn worker thread failed: {error}")))?;
            workers.push(handle);
        }
        debug!(workers = size.get(), "worker pool started");
        Ok(Self {
            size,
            sender: Some(sender),
            workers,
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn size(&self) -> WorkerCount {
        self.size
    }

    /// Queues one request.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::InvalidState` when the queue is closed. The rejected request is
    /// dropped, which completes its ticket with an error.
    pub fn submit(&self, request: WorkRequest) -> XmpdResult<()> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(XmpdError::InvalidState("worker queue is closed"));
        };
        sender
            .send(request)
            .map_err(|_| XmpdError::InvalidState("worker queue is closed"))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the only sender ends every worker loop once the queue drains.
        self.sender = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(receiver: &Receiver<WorkRequest>, wake: &dyn WakeSignal) {
    for request in receiver {
        let label = request.label();
        request.run();
        debug!(job = label, "worker job finished");
        wake.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::{NoopWake, WakeSignal, WorkRequest, WorkerPool};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use xmpd_common::error::XmpdError;
    use xmpd_common::ids::WorkerCount;

    #[derive(Default)]
    struct CountingWake(AtomicUsize);

    impl WakeSignal for CountingWake {
        fn wake(&self) {
            let _ = self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(size: u16, wake: Arc<dyn WakeSignal>) -> WorkerPool {
        WorkerPool::new(WorkerCount::new(size).expect("valid worker count"), wake)
            .expect("pool should start")
    }

    fn wait_until(deadline: Duration, mut ready: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + deadline;
        while Instant::now() < deadline {
            if ready() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        ready()
    }

    #[rstest]
    fn job_result_is_published_and_reactor_woken() {
        let wake = Arc::new(CountingWake::default());
        let workers = pool(2, wake.clone());
        let (request, ticket) = WorkRequest::new("answer", || Ok(42_u32));

        workers.submit(request).expect("submit should succeed");

        assert_that!(
            wait_until(Duration::from_millis(500), || ticket.is_complete()),
            eq(true)
        );
        assert_that!(&ticket.take(), eq(&Some(Ok(42_u32))));
        assert_that!(&ticket.take(), eq(&None));
        assert_that!(
            wait_until(Duration::from_millis(500), || wake.0.load(Ordering::SeqCst) == 1),
            eq(true)
        );
    }

    #[rstest]
    fn ticket_is_pending_before_execution() {
        let (request, ticket) = WorkRequest::new("pending", || Ok(()));
        assert_that!(ticket.is_complete(), eq(false));
        assert_that!(&ticket.take(), eq(&None));
        request.run();
        assert_that!(&ticket.take(), eq(&Some(Ok(()))));
    }

    #[rstest]
    fn job_error_is_delivered_through_ticket() {
        let (request, ticket) =
            WorkRequest::new("lookup", || Err::<(), _>(XmpdError::Storage("db down".to_owned())));
        request.run();
        assert_that!(
            &ticket.take(),
            eq(&Some(Err(XmpdError::Storage("db down".to_owned()))))
        );
    }

    #[rstest]
    fn panicking_job_becomes_job_error() {
        let workers = pool(1, Arc::new(NoopWake));
        let (request, ticket) = WorkRequest::new("explode", || -> Result<u8, XmpdError> {
            panic!("job exploded")
        });

        workers.submit(request).expect("submit should succeed");

        assert_that!(
            wait_until(Duration::from_millis(500), || ticket.is_complete()),
            eq(true)
        );
        assert_that!(
            &ticket.take(),
            eq(&Some(Err(XmpdError::Job("explode panicked".to_owned()))))
        );

        let (request, ticket) = WorkRequest::new("after", || Ok(7_u8));
        workers.submit(request).expect("pool should survive a panicking job");
        assert_that!(
            wait_until(Duration::from_millis(500), || ticket.is_complete()),
            eq(true)
        );
    }

    #[rstest]
    fn dropped_request_completes_ticket_with_error() {
        let (request, ticket) = WorkRequest::new("dropped", || Ok(1_u8));
        drop(request);
        assert_that!(
            &ticket.take(),
            eq(&Some(Err(XmpdError::Job("dropped was never executed".to_owned()))))
        );
    }

    #[rstest]
    fn drop_joins_workers_after_draining_queue() {
        let workers = pool(2, Arc::new(NoopWake));
        let tickets = (0..16_u32)
            .map(|value| {
                let (request, ticket) = WorkRequest::new("batch", move || Ok(value * 2));
                workers.submit(request).expect("submit should succeed");
                ticket
            })
            .collect::<Vec<_>>();

        drop(workers);

        for (value, ticket) in (0..16_u32).zip(tickets) {
            assert_that!(&ticket.take(), eq(&Some(Ok(value * 2))));
        }
    }
}
