//! Shared state between callers, the scheduler thread and the processing stack.
//!
//! The context owns the pending list producers push into, the prepared queue
//! the scheduler sorts, the list of requests the stack finished, and the pool
//! of link requests that keep external requests alive. It also owns the wake
//! signal of the scheduler thread; the thread state lives under the same lock
//! so a resume or stop can never slip in between the state check and the wait.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::StreamerResult;
use crate::request::{
    Command, FileRequest, FileRequestHandle, LinkData, RequestId, RequestStatus,
};
use crate::statistics::SchedulerMetrics;

/// Run state of the scheduler thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    /// No thread is running.
    Stopped,
    /// The thread is processing requests.
    Running,
    /// The thread is alive but does not start new work.
    Suspended,
    /// The thread was asked to drain and exit.
    Stopping,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadState::Stopped => write!(f, "Stopped"),
            ThreadState::Running => write!(f, "Running"),
            ThreadState::Suspended => write!(f, "Suspended"),
            ThreadState::Stopping => write!(f, "Stopping"),
        }
    }
}

struct SignalState {
    thread_state: ThreadState,
    wake_requested: bool,
}

/// Shared request bookkeeping for one scheduler.
pub struct StreamerContext {
    next_id: AtomicU64,
    pending: Mutex<Vec<FileRequestHandle>>,
    // Only the scheduler thread touches this; the lock is never contended.
    prepared: Mutex<VecDeque<FileRequestHandle>>,
    completed: Mutex<Vec<FileRequestHandle>>,
    links: DashMap<RequestId, FileRequestHandle>,
    signal: Mutex<SignalState>,
    wake: Condvar,
    metrics: Arc<SchedulerMetrics>,
}

impl StreamerContext {
    /// Creates an empty context with its own metrics.
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(SchedulerMetrics::new()))
    }

    /// Creates an empty context that records into `metrics`.
    pub fn with_metrics(metrics: Arc<SchedulerMetrics>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(Vec::new()),
            prepared: Mutex::new(VecDeque::new()),
            completed: Mutex::new(Vec::new()),
            links: DashMap::new(),
            signal: Mutex::new(SignalState {
                thread_state: ThreadState::Stopped,
                wake_requested: false,
            }),
            wake: Condvar::new(),
            metrics,
        }
    }

    /// Returns the metrics this context records into.
    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.metrics
    }

    fn next_request_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a new external request.
    pub fn create_request(&self) -> FileRequestHandle {
        Arc::new(FileRequest::new_external(self.next_request_id()))
    }

    /// Creates `count` external requests with consecutive ids.
    pub fn create_request_batch(&self, count: usize) -> Vec<FileRequestHandle> {
        (0..count).map(|_| self.create_request()).collect()
    }

    /// Creates an internal request, optionally as a child of `parent`.
    ///
    /// The parent does not retire before all of its children have.
    pub fn new_internal_request(
        &self,
        parent: Option<&FileRequestHandle>,
        command: Command,
    ) -> StreamerResult<FileRequestHandle> {
        let request = FileRequest::new_internal(self.next_request_id(), parent, command)?;
        trace!(
            "Created internal request {} ({}), parent={:?}",
            request.id(),
            request.command().name(),
            parent.map(|p| p.id())
        );
        Ok(Arc::new(request))
    }

    /// Parks a link request that owns `external` until it retires.
    ///
    /// The link only holds the scheduler's reference. The external handle
    /// itself is what the stack prepares, so stack entries see the caller's
    /// command directly and links never enter the prepared queue.
    pub(crate) fn link_external(&self, external: &FileRequestHandle) -> StreamerResult<()> {
        let link = self.new_internal_request(
            None,
            Command::Link(LinkData {
                external: Arc::clone(external),
            }),
        )?;
        link.set_status(RequestStatus::Queued);
        if self.links.insert(external.id(), link).is_some() {
            warn!("Request {} was linked twice", external.id());
        }
        Ok(())
    }

    /// Number of external requests currently owned by the scheduler.
    pub fn active_links(&self) -> usize {
        self.links.len()
    }

    /// Appends submitted requests to the pending list. Returns how many were added.
    pub(crate) fn queue_pending<I>(&self, requests: I) -> usize
    where
        I: IntoIterator<Item = FileRequestHandle>,
    {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.extend(requests);
        pending.len() - before
    }

    /// Moves all pending requests into `out`, which must be empty.
    pub(crate) fn swap_pending(&self, out: &mut Vec<FileRequestHandle>) {
        debug_assert!(out.is_empty());
        std::mem::swap(&mut *self.pending.lock(), out);
    }

    /// Number of submitted requests not yet pulled in by the scheduler.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Adds a request to the prepared queue. Called by the processing stack
    /// while it prepares a request.
    pub fn push_prepared_request(&self, request: FileRequestHandle) {
        request.set_status(RequestStatus::Queued);
        trace!(
            "Prepared request {} ({})",
            request.id(),
            request.command().name()
        );
        self.prepared.lock().push_back(request);
    }

    /// Prepared requests in dispatch order, most urgent first.
    pub(crate) fn prepared(&self) -> MutexGuard<'_, VecDeque<FileRequestHandle>> {
        self.prepared.lock()
    }

    /// Number of requests waiting in the prepared queue.
    pub fn prepared_count(&self) -> usize {
        self.prepared.lock().len()
    }

    /// Hands a finished request back for retirement.
    ///
    /// A request that is not terminal yet is marked `Completed`. May be called
    /// from any thread; the request retires on the scheduler thread during the
    /// next finalize pass.
    pub fn mark_request_as_completed(&self, request: FileRequestHandle) {
        if !request.status().is_terminal() {
            request.set_status(RequestStatus::Completed);
        }
        self.completed.lock().push(request);
        self.wake_up_scheduling_thread();
    }

    /// Number of finished requests waiting to be retired.
    pub fn completed_count(&self) -> usize {
        self.completed.lock().len()
    }

    /// Retires every request handed back through [`Self::mark_request_as_completed`].
    ///
    /// Returns true if anything was retired.
    pub fn finalize_completed_requests(&self) -> bool {
        let completed = std::mem::take(&mut *self.completed.lock());
        if completed.is_empty() {
            return false;
        }
        for request in completed {
            self.retire(request);
        }
        true
    }

    fn retire(&self, request: FileRequestHandle) {
        let mut next = Some(request);
        while let Some(request) = next.take() {
            if !request.mark_retired() {
                warn!("Request {} was retired more than once", request.id());
                continue;
            }
            if !request.status().is_terminal() {
                request.set_status(RequestStatus::Completed);
            }
            let status = request.status();
            trace!("Retired request {} as {}", request.id(), status);

            if request.is_external() {
                self.release_external(&request, status);
            }

            if let Some(parent) = request.parent() {
                if parent.child_retired(status) {
                    parent.set_status(parent.resolved_child_status());
                    next = Some(Arc::clone(parent));
                }
            }
        }
    }

    fn release_external(&self, request: &FileRequestHandle, status: RequestStatus) {
        let allocator = match &mut *request.command() {
            Command::ReadRequest(read) if read.allocator_locked => {
                read.allocator_locked = false;
                read.allocator.clone()
            }
            _ => None,
        };
        if let Some(allocator) = allocator {
            allocator.unlock_allocator();
        }

        match status {
            RequestStatus::Completed => self.metrics.record_completed(),
            RequestStatus::Failed => self.metrics.record_failed(),
            RequestStatus::Canceled => self.metrics.record_canceled(),
            _ => {}
        }

        if let Some(callback) = request.take_callback() {
            callback(request);
        }

        if let Some((_, link)) = self.links.remove(&request.id()) {
            link.set_status(RequestStatus::Completed);
            link.mark_retired();
            // Drop the link's reference even if someone else still holds the link.
            *link.command() = Command::None;
        }
        debug!("External request {} finished as {}", request.id(), status);
    }

    /// Current run state of the scheduler thread.
    pub fn thread_state(&self) -> ThreadState {
        self.signal.lock().thread_state
    }

    /// Returns true while a scheduler thread is alive and accepting work.
    pub fn is_running(&self) -> bool {
        matches!(
            self.thread_state(),
            ThreadState::Running | ThreadState::Suspended
        )
    }

    /// Wakes the scheduler thread if it is waiting for work.
    pub fn wake_up_scheduling_thread(&self) {
        let mut signal = self.signal.lock();
        signal.wake_requested = true;
        self.wake.notify_one();
    }

    /// Blocks the calling thread until woken or asked to stop.
    pub(crate) fn wait_for_work(&self) {
        let mut signal = self.signal.lock();
        while !signal.wake_requested && signal.thread_state != ThreadState::Stopping {
            self.wake.wait(&mut signal);
        }
        signal.wake_requested = false;
    }

    /// Returns true when new work may be started.
    pub(crate) fn should_process(&self) -> bool {
        self.signal.lock().thread_state == ThreadState::Running
    }

    /// Returns true once a stop was requested.
    pub(crate) fn is_stopping(&self) -> bool {
        self.signal.lock().thread_state == ThreadState::Stopping
    }

    /// Moves from `Stopped` to `Running`. Returns false if a thread is already alive.
    pub(crate) fn begin_running(&self) -> bool {
        let mut signal = self.signal.lock();
        if signal.thread_state != ThreadState::Stopped {
            return false;
        }
        signal.thread_state = ThreadState::Running;
        signal.wake_requested = true;
        true
    }

    /// Asks the thread to drain and exit. Returns false if no thread is alive.
    pub(crate) fn request_stop(&self) -> bool {
        let mut signal = self.signal.lock();
        match signal.thread_state {
            ThreadState::Running | ThreadState::Suspended => {
                signal.thread_state = ThreadState::Stopping;
                self.wake.notify_all();
                true
            }
            ThreadState::Stopping | ThreadState::Stopped => false,
        }
    }

    pub(crate) fn mark_stopped(&self) {
        let mut signal = self.signal.lock();
        signal.thread_state = ThreadState::Stopped;
        signal.wake_requested = false;
    }

    /// Moves from `Running` to `Suspended`.
    pub(crate) fn suspend(&self) -> bool {
        let mut signal = self.signal.lock();
        if signal.thread_state != ThreadState::Running {
            return false;
        }
        signal.thread_state = ThreadState::Suspended;
        true
    }

    /// Moves from `Suspended` to `Running` and wakes the thread.
    pub(crate) fn resume(&self) -> bool {
        let mut signal = self.signal.lock();
        if signal.thread_state != ThreadState::Suspended {
            return false;
        }
        signal.thread_state = ThreadState::Running;
        signal.wake_requested = true;
        self.wake.notify_one();
        true
    }
}

impl Default for StreamerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamerContext")
            .field("thread_state", &self.thread_state())
            .field("pending", &self.pending_count())
            .field("prepared", &self.prepared_count())
            .field("completed", &self.completed_count())
            .field("links", &self.links.len())
            .finish()
    }
}
