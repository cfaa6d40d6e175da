//! Processing stack interface and a scripted in-memory stack for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::StreamerContext;
use crate::request::{Command, FileRequestHandle, ReadData, RequestId, RequestStatus};
use crate::statistics::Statistic;

/// Load reported by the processing stack.
///
/// Each entry in a stack folds its own state into the status it is handed:
/// `is_idle` is and-ed and `num_available_slots` takes the minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackStatus {
    /// True when no entry has outstanding work.
    pub is_idle: bool,
    /// Number of additional requests the stack accepts right now.
    pub num_available_slots: i32,
}

impl Default for StackStatus {
    fn default() -> Self {
        Self {
            is_idle: true,
            num_available_slots: i32::MAX,
        }
    }
}

impl StackStatus {
    /// Folds the state of one entry into this status.
    pub fn merge(&mut self, is_idle: bool, num_available_slots: i32) {
        self.is_idle &= is_idle;
        self.num_available_slots = self.num_available_slots.min(num_available_slots);
    }
}

/// An entry in the processing stack the scheduler feeds.
///
/// All calls come from the scheduler thread, except `collect_statistics` which
/// runs on whichever thread asks the scheduler for statistics.
pub trait StreamStackEntry: Send {
    /// Name used in statistics and logs.
    fn name(&self) -> &str;

    /// Hands the entry the context it pushes prepared requests into and
    /// reports finished requests to.
    fn set_context(&mut self, context: Arc<StreamerContext>);

    /// Admits a newly submitted request. The entry pushes the requests it
    /// wants scheduled into the prepared queue.
    fn prepare_request(&mut self, request: FileRequestHandle);

    /// Takes over a request the scheduler dispatched.
    fn queue_request(&mut self, request: FileRequestHandle);

    /// Performs one unit of work. Returns true if anything progressed.
    fn execute_requests(&mut self) -> bool;

    /// Folds the entry's load into `status`.
    fn update_status(&self, status: &mut StackStatus);

    /// Writes completion estimates for queued work and the prepared requests.
    ///
    /// `internal_pending` collects requests entries above this one still hold;
    /// `prepared` is in dispatch order.
    fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &mut Vec<FileRequestHandle>,
        prepared: &[FileRequestHandle],
    );

    /// Appends the entry's statistics.
    fn collect_statistics(&self, statistics: &mut Vec<Statistic>);
}

fn root_id(request: &FileRequestHandle) -> RequestId {
    request
        .ancestors()
        .last()
        .map(|ancestor| ancestor.id())
        .unwrap_or_else(|| request.id())
}

/// What the mock stack has seen so far.
#[derive(Debug, Clone, Default)]
pub struct MockStackLog {
    /// Root request id of every dispatched request, in dispatch order.
    pub dispatched: Vec<RequestId>,
    /// Number of requests handed to `prepare_request`.
    pub prepared: usize,
    /// Requests currently held in flight.
    pub in_flight: usize,
    /// Largest number of requests held in flight at once.
    pub max_in_flight: usize,
    /// Number of `execute_requests` calls.
    pub executes: u64,
}

#[derive(Default)]
struct MockShared {
    held: AtomicBool,
    log: Mutex<MockStackLog>,
    context: Mutex<Option<Arc<StreamerContext>>>,
}

/// Observes and steers a [`MockStreamStack`] after it was handed to a scheduler.
#[derive(Clone)]
pub struct MockStackProbe {
    shared: Arc<MockShared>,
}

impl MockStackProbe {
    /// Stops completing in-flight reads until [`Self::release`] is called.
    pub fn hold(&self) {
        self.shared.held.store(true, Ordering::SeqCst);
    }

    /// Resumes completing reads and wakes the scheduler.
    pub fn release(&self) {
        self.shared.held.store(false, Ordering::SeqCst);
        if let Some(context) = self.shared.context.lock().as_ref() {
            context.wake_up_scheduling_thread();
        }
    }

    /// Copy of the log.
    pub fn log(&self) -> MockStackLog {
        self.shared.log.lock().clone()
    }

    /// Root ids of dispatched requests in dispatch order.
    pub fn dispatched(&self) -> Vec<RequestId> {
        self.shared.log.lock().dispatched.clone()
    }
}

/// Scripted stack that keeps reads in flight until executed.
///
/// Reads are split into `split_reads` child reads on prepare. Each
/// `execute_requests` call completes the oldest in-flight read unless the
/// stack is held. Other commands complete as soon as they are dispatched.
pub struct MockStreamStack {
    max_in_flight: usize,
    split_reads: u64,
    latency: Duration,
    context: Option<Arc<StreamerContext>>,
    in_flight: VecDeque<FileRequestHandle>,
    shared: Arc<MockShared>,
}

impl MockStreamStack {
    /// Creates a mock that accepts `max_in_flight` reads at once.
    pub fn new(max_in_flight: usize) -> (Self, MockStackProbe) {
        let shared = Arc::new(MockShared::default());
        let stack = Self {
            max_in_flight,
            split_reads: 1,
            latency: Duration::from_millis(1),
            context: None,
            in_flight: VecDeque::new(),
            shared: Arc::clone(&shared),
        };
        (stack, MockStackProbe { shared })
    }

    /// Splits every read into `parts` child reads.
    pub fn with_split_reads(mut self, parts: u64) -> Self {
        self.split_reads = parts.max(1);
        self
    }

    fn complete(&self, request: FileRequestHandle) {
        match &self.context {
            Some(context) => context.mark_request_as_completed(request),
            None => warn!("Mock stack completed request {} without a context", request.id()),
        }
    }

    fn update_in_flight_log(&self) {
        let mut log = self.shared.log.lock();
        log.in_flight = self.in_flight.len();
        log.max_in_flight = log.max_in_flight.max(self.in_flight.len());
    }
}

impl StreamStackEntry for MockStreamStack {
    fn name(&self) -> &str {
        "MockStack"
    }

    fn set_context(&mut self, context: Arc<StreamerContext>) {
        *self.shared.context.lock() = Some(Arc::clone(&context));
        self.context = Some(context);
    }

    fn prepare_request(&mut self, request: FileRequestHandle) {
        let Some(context) = self.context.clone() else {
            warn!("Mock stack has no context, dropping request {}", request.id());
            return;
        };
        self.shared.log.lock().prepared += 1;

        let read = match &*request.command() {
            Command::ReadRequest(read) => Some((read.path.clone(), read.offset, read.size)),
            _ => None,
        };
        let Some((path, offset, size)) = read else {
            context.push_prepared_request(request);
            return;
        };

        let chunk = size.div_ceil(self.split_reads).max(1);
        let mut output_offset = 0;
        while output_offset < size.max(1) {
            let part = chunk.min(size - output_offset);
            let command = Command::Read(ReadData {
                path: path.clone(),
                offset: offset.saturating_add(output_offset),
                size: part,
                output_offset,
            });
            match context.new_internal_request(Some(&request), command) {
                Ok(child) => context.push_prepared_request(child),
                Err(e) => {
                    warn!("Mock stack failed to split request {}: {}", request.id(), e);
                    request.set_status(RequestStatus::Failed);
                    context.mark_request_as_completed(request);
                    return;
                }
            }
            if size == 0 {
                break;
            }
            output_offset += part;
        }
    }

    fn queue_request(&mut self, request: FileRequestHandle) {
        self.shared.log.lock().dispatched.push(root_id(&request));
        let (is_read, cancel_target) = match &*request.command() {
            Command::Read(_) | Command::CompressedRead(_) => (true, None),
            Command::Cancel(cancel) => (false, Some(cancel.target)),
            _ => (false, None),
        };
        if is_read {
            self.in_flight.push_back(request);
            self.update_in_flight_log();
            return;
        }

        if let Some(target) = cancel_target {
            let mut kept = VecDeque::with_capacity(self.in_flight.len());
            for queued in self.in_flight.drain(..) {
                if queued.targets(target) {
                    queued.set_status(RequestStatus::Canceled);
                    if let Some(context) = &self.context {
                        context.mark_request_as_completed(queued);
                    }
                } else {
                    kept.push_back(queued);
                }
            }
            self.in_flight = kept;
            self.update_in_flight_log();
        }
        self.complete(request);
    }

    fn execute_requests(&mut self) -> bool {
        self.shared.log.lock().executes += 1;
        if self.shared.held.load(Ordering::SeqCst) {
            return false;
        }
        let Some(request) = self.in_flight.pop_front() else {
            return false;
        };
        debug!("Mock stack completed request {}", request.id());
        self.complete(request);
        self.update_in_flight_log();
        true
    }

    fn update_status(&self, status: &mut StackStatus) {
        let available = self.max_in_flight.saturating_sub(self.in_flight.len());
        status.merge(
            self.in_flight.is_empty(),
            i32::try_from(available).unwrap_or(i32::MAX),
        );
    }

    fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &mut Vec<FileRequestHandle>,
        prepared: &[FileRequestHandle],
    ) {
        let mut at = now;
        for request in self
            .in_flight
            .iter()
            .chain(internal_pending.iter())
            .chain(prepared.iter())
        {
            at += self.latency;
            request.set_estimated_completion(at);
        }
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        statistics.push(Statistic::integer(
            self.name(),
            "In flight",
            self.in_flight.len() as i64,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ReadRequestData;

    #[test]
    fn test_status_default_and_merge() {
        let mut status = StackStatus::default();
        assert!(status.is_idle);
        assert_eq!(status.num_available_slots, i32::MAX);

        status.merge(true, 4);
        status.merge(false, 7);
        assert!(!status.is_idle);
        assert_eq!(status.num_available_slots, 4);
    }

    #[test]
    fn test_mock_splits_reads() {
        let context = Arc::new(StreamerContext::new());
        let (stack, probe) = MockStreamStack::new(4);
        let mut stack = stack.with_split_reads(3);
        stack.set_context(Arc::clone(&context));

        let request = context.create_request();
        request.create_read(ReadRequestData::new("/tmp/a", 10, 100));
        stack.prepare_request(Arc::clone(&request));

        assert_eq!(context.prepared_count(), 3);
        assert_eq!(request.outstanding_children(), 3);
        assert_eq!(probe.log().prepared, 1);

        let sizes: Vec<u64> = context
            .prepared()
            .iter()
            .map(|child| match &*child.command() {
                Command::Read(read) => read.size,
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, vec![34, 34, 32]);
    }

    #[test]
    fn test_mock_slots_and_execute() {
        let context = Arc::new(StreamerContext::new());
        let (mut stack, probe) = MockStreamStack::new(2);
        stack.set_context(Arc::clone(&context));

        let request = context.create_request();
        request.create_read(ReadRequestData::new("/tmp/a", 0, 8));
        stack.prepare_request(Arc::clone(&request));
        let child = context.prepared().pop_front().unwrap();
        stack.queue_request(child);

        let mut status = StackStatus::default();
        stack.update_status(&mut status);
        assert_eq!(status.num_available_slots, 1);
        assert!(!status.is_idle);

        probe.hold();
        assert!(!stack.execute_requests());
        probe.release();
        assert!(stack.execute_requests());
        assert_eq!(context.completed_count(), 1);
        assert_eq!(probe.dispatched(), vec![request.id()]);
    }
}
