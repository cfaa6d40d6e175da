//! The scheduler: one background thread that pulls submitted requests in,
//! orders them and feeds them to the processing stack.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::context::{StreamerContext, ThreadState};
use crate::error::{StreamerError, StreamerResult};
use crate::ordering::{compare_for_dispatch, LocalityState, RequestSnapshot};
use crate::recommendations::{
    AlignedGranularityPolicy, MemorySizePolicy, RecommendationLimits, Recommendations,
};
use crate::request::{Command, FileRequestHandle, RequestId, RequestStatus, RescheduleData};
use crate::stack::{StackStatus, StreamStackEntry};
use crate::statistics::{SchedulerMetrics, Statistic};

/// Processing stack shared between the scheduler thread and the statistics calls.
pub type SharedStack = Arc<Mutex<Box<dyn StreamStackEntry>>>;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Required alignment of output buffer addresses. Must be a power of two.
    pub memory_alignment: u64,
    /// Required alignment of read sizes. Must be a power of two.
    pub size_alignment: u64,
    /// Block size reads are grouped into.
    pub granularity: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            memory_alignment: 4096,
            size_alignment: 4096,
            granularity: 2 * 1024 * 1024,
        }
    }
}

/// Settings for the scheduler thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Thread name shown in debuggers and panics.
    pub name: String,
    /// Stack size in bytes. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name: "claudefs-streamer".to_string(),
            stack_size: None,
        }
    }
}

/// Asynchronous file I/O scheduler.
pub struct Scheduler {
    context: Arc<StreamerContext>,
    stack: SharedStack,
    recommendations: Recommendations,
    metrics: Arc<SchedulerMetrics>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates a scheduler in front of `stack` using the default size policy.
    pub fn new(stack: Box<dyn StreamStackEntry>, config: SchedulerConfig) -> StreamerResult<Self> {
        Self::with_policy(stack, config, Arc::new(AlignedGranularityPolicy))
    }

    /// Creates a scheduler with a custom buffer size policy.
    ///
    /// Fails if an alignment is not a power of two or the stack is busy.
    pub fn with_policy(
        mut stack: Box<dyn StreamStackEntry>,
        config: SchedulerConfig,
        policy: Arc<dyn MemorySizePolicy>,
    ) -> StreamerResult<Self> {
        let limits = RecommendationLimits {
            memory_alignment: config.memory_alignment,
            size_alignment: config.size_alignment,
            granularity: config.granularity,
        };

        let mut status = StackStatus::default();
        stack.update_status(&mut status);
        if !status.is_idle {
            return Err(StreamerError::StackNotIdle);
        }
        let max_concurrent_requests = usize::try_from(status.num_available_slots.max(0)).unwrap_or(0);
        let recommendations = Recommendations::new(limits, max_concurrent_requests, policy)?;

        let metrics = Arc::new(SchedulerMetrics::new());
        let context = Arc::new(StreamerContext::with_metrics(Arc::clone(&metrics)));
        stack.set_context(Arc::clone(&context));

        info!(
            "Scheduler created: stack={}, max_concurrent_requests={}, memory_alignment={}, size_alignment={}, granularity={}",
            stack.name(),
            max_concurrent_requests,
            config.memory_alignment,
            config.size_alignment,
            config.granularity
        );

        Ok(Self {
            context,
            stack: Arc::new(Mutex::new(stack)),
            recommendations,
            metrics,
            thread: Mutex::new(None),
        })
    }

    /// Returns the recommendations derived from the stack and configuration.
    pub fn recommendations(&self) -> &Recommendations {
        &self.recommendations
    }

    /// Returns the shared context.
    pub fn context(&self) -> &Arc<StreamerContext> {
        &self.context
    }

    /// Returns the scheduler counters.
    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.metrics
    }

    /// Creates a new external request.
    pub fn create_request(&self) -> FileRequestHandle {
        self.context.create_request()
    }

    /// Creates `count` new external requests.
    pub fn create_request_batch(&self, count: usize) -> Vec<FileRequestHandle> {
        self.context.create_request_batch(count)
    }

    /// Submits a request.
    pub fn queue_request(&self, request: &FileRequestHandle) -> StreamerResult<()> {
        self.queue_request_batch_owned(vec![Arc::clone(request)])
    }

    /// Submits a batch of requests. The batch stays contiguous.
    pub fn queue_request_batch(&self, requests: &[FileRequestHandle]) -> StreamerResult<()> {
        self.queue_request_batch_owned(requests.to_vec())
    }

    /// Submits a batch of requests, taking ownership of the handles.
    pub fn queue_request_batch_owned(&self, requests: Vec<FileRequestHandle>) -> StreamerResult<()> {
        if !self.context.is_running() {
            return Err(StreamerError::NotRunning);
        }
        if requests.is_empty() {
            return Ok(());
        }

        let submitted: Vec<FileRequestHandle> = requests.iter().map(Arc::clone).collect();
        let count = self.context.queue_pending(requests);
        for request in &submitted {
            request.set_status(RequestStatus::Queued);
        }
        self.metrics.record_queued(count as u64);
        trace!("Queued {} request(s)", count);
        self.context.wake_up_scheduling_thread();
        Ok(())
    }

    /// Starts the scheduler thread. Does nothing if it is already running.
    pub fn start(&self, config: ThreadConfig) -> StreamerResult<()> {
        let mut slot = self.thread.lock();
        if !self.context.begin_running() {
            debug!("Scheduler thread already running");
            return Ok(());
        }

        let mut worker = SchedulerThread::new(
            Arc::clone(&self.context),
            Arc::clone(&self.stack),
            self.recommendations.clone(),
            Arc::clone(&self.metrics),
        );
        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        match builder.spawn(move || worker.run()) {
            Ok(handle) => {
                *slot = Some(handle);
                info!("Scheduler thread '{}' started", config.name);
                Ok(())
            }
            Err(e) => {
                self.context.mark_stopped();
                error!("Failed to spawn scheduler thread '{}': {}", config.name, e);
                Err(StreamerError::ThreadSpawn(e))
            }
        }
    }

    /// Stops the scheduler thread after the stack drained. Does nothing if it
    /// is not running.
    ///
    /// Requests that were not dispatched yet stay queued for the next start.
    pub fn stop(&self) {
        let mut slot = self.thread.lock();
        self.context.request_stop();
        if let Some(handle) = slot.take() {
            if handle.join().is_err() {
                error!("Scheduler thread panicked");
            }
            info!("Scheduler thread stopped");
        }
        self.context.mark_stopped();
    }

    /// Returns true while the scheduler thread is alive.
    pub fn is_running(&self) -> bool {
        self.context.is_running()
    }

    /// Stops starting new work until [`Self::resume_processing`] is called.
    pub fn suspend_processing(&self) {
        if self.context.suspend() {
            debug!("Scheduler suspended");
        }
    }

    /// Resumes a suspended scheduler.
    pub fn resume_processing(&self) {
        if self.context.resume() {
            debug!("Scheduler resumed");
        }
    }

    /// Returns true while processing is suspended.
    pub fn is_suspended(&self) -> bool {
        self.context.thread_state() == ThreadState::Suspended
    }

    /// Appends scheduler and stack statistics.
    pub fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        const OWNER: &str = "Scheduler";
        self.metrics.collect(OWNER, statistics);
        statistics.push(Statistic::integer(
            OWNER,
            "Pending requests",
            self.context.pending_count() as i64,
        ));
        statistics.push(Statistic::integer(
            OWNER,
            "Prepared requests",
            self.context.prepared_count() as i64,
        ));
        self.stack.lock().collect_statistics(statistics);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Dispatch {
    Read { compressed: bool },
    Cancel(RequestId),
    Reschedule(RescheduleData),
    Flush,
    Forward,
}

/// State owned by the scheduler thread.
struct SchedulerThread {
    context: Arc<StreamerContext>,
    stack: SharedStack,
    recommendations: Recommendations,
    metrics: Arc<SchedulerMetrics>,
    locality: LocalityState,
    pending: Vec<FileRequestHandle>,
    internal_pending: Vec<FileRequestHandle>,
}

impl SchedulerThread {
    fn new(
        context: Arc<StreamerContext>,
        stack: SharedStack,
        recommendations: Recommendations,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        Self {
            context,
            stack,
            recommendations,
            metrics,
            locality: LocalityState::default(),
            pending: Vec::new(),
            internal_pending: Vec::new(),
        }
    }

    fn run(&mut self) {
        debug!("Scheduler thread entering main loop");
        loop {
            self.context.wait_for_work();
            if self.context.is_stopping() {
                break;
            }
            self.process();
        }
        self.drain_stack();
        debug!("Scheduler thread left main loop");
    }

    fn process(&mut self) {
        while self.context.should_process() {
            self.schedule_requests();
            loop {
                if !self.context.should_process() {
                    return;
                }
                loop {
                    self.queue_ready_requests();
                    if !self.context.finalize_completed_requests() {
                        break;
                    }
                }
                if !self.execute_requests() {
                    break;
                }
            }
            if !self.prepare_pending_requests() {
                break;
            }
        }
    }

    fn stack_status(&self) -> StackStatus {
        let mut status = StackStatus::default();
        self.stack.lock().update_status(&mut status);
        status
    }

    fn execute_requests(&self) -> bool {
        self.stack.lock().execute_requests()
    }

    /// Runs the stack until it has no outstanding work.
    fn drain_stack(&self) {
        loop {
            let progressed = self.execute_requests();
            let finalized = self.context.finalize_completed_requests();
            if self.stack_status().is_idle {
                self.context.finalize_completed_requests();
                return;
            }
            if !progressed && !finalized {
                thread::yield_now();
            }
        }
    }

    fn schedule_requests(&mut self) {
        let started = Instant::now();
        let mut prepared = std::mem::take(&mut *self.context.prepared());

        self.internal_pending.clear();
        self.stack.lock().update_completion_estimates(
            started,
            &mut self.internal_pending,
            prepared.make_contiguous(),
        );

        if prepared.len() > 1 {
            let mut entries: Vec<(RequestSnapshot, FileRequestHandle)> = prepared
                .drain(..)
                .map(|request| (RequestSnapshot::capture(&request), request))
                .collect();
            let locality = &self.locality;
            entries.sort_by(|(first, _), (second, _)| compare_for_dispatch(first, second, locality));
            prepared.extend(entries.into_iter().map(|(_, request)| request));
        }

        let depth = prepared.len();
        {
            let mut queue = self.context.prepared();
            let late = std::mem::replace(&mut *queue, prepared);
            queue.extend(late);
        }
        self.metrics.record_schedule_pass(started.elapsed(), depth);
        trace!("Scheduled {} prepared request(s)", depth);
    }

    fn queue_ready_requests(&mut self) {
        loop {
            let status = self.stack_status();
            if status.num_available_slots <= 0 {
                break;
            }
            let Some(request) = self.context.prepared().pop_front() else {
                break;
            };
            let in_flight = self
                .recommendations
                .max_concurrent_requests()
                .saturating_sub(usize::try_from(status.num_available_slots).unwrap_or(usize::MAX));
            self.metrics.record_in_flight(in_flight + 1);
            self.dispatch(request);
        }
    }

    fn dispatch(&mut self, request: FileRequestHandle) {
        request.set_status(RequestStatus::Processing);
        self.metrics.record_dispatched();

        let dispatch = match &*request.command() {
            Command::Read(_) => Dispatch::Read { compressed: false },
            Command::CompressedRead(_) => Dispatch::Read { compressed: true },
            Command::Cancel(cancel) => Dispatch::Cancel(cancel.target),
            Command::Reschedule(reschedule) => Dispatch::Reschedule(*reschedule),
            Command::Flush(_) | Command::FlushAll => Dispatch::Flush,
            Command::None | Command::Link(_) | Command::ReadRequest(_) => Dispatch::Forward,
        };

        match dispatch {
            Dispatch::Read { compressed } => self.dispatch_read(request, compressed),
            Dispatch::Cancel(target) => {
                self.metrics.record_cancel();
                self.cancel_prepared(target);
                self.forward(request);
            }
            Dispatch::Reschedule(reschedule) => {
                self.metrics.record_reschedule();
                self.reschedule_prepared(&reschedule);
                self.retire_now(request);
            }
            Dispatch::Flush => {
                self.metrics.record_flush();
                self.drain_stack();
                self.forward(request);
            }
            Dispatch::Forward => self.forward(request),
        }
    }

    fn forward(&self, request: FileRequestHandle) {
        trace!("Dispatching request {} to the stack", request.id());
        self.stack.lock().queue_request(request);
    }

    fn retire_now(&self, request: FileRequestHandle) {
        self.context.mark_request_as_completed(request);
        self.context.finalize_completed_requests();
    }

    fn fail(&self, request: FileRequestHandle) {
        request.set_status(RequestStatus::Failed);
        self.retire_now(request);
    }

    fn dispatch_read(&mut self, request: FileRequestHandle, compressed: bool) {
        let Some(parent) = request.find_read_request() else {
            error!(
                "Read request {} has no read request ancestor, failing it",
                request.id()
            );
            self.fail(request);
            return;
        };

        if !self.ensure_output_buffer(&parent, compressed) {
            self.metrics.record_allocation_failure();
            warn!(
                "No output buffer for read {} of request {}, failing it",
                request.id(),
                parent.id()
            );
            self.fail(request);
            return;
        }

        self.locality.record_dispatch(&request.command());
        self.forward(request);
    }

    /// Makes sure the read request has an output buffer, allocating one if needed.
    fn ensure_output_buffer(&self, parent: &FileRequestHandle, compressed: bool) -> bool {
        let mut command = parent.command();
        let Command::ReadRequest(read) = &mut *command else {
            return false;
        };
        if read.output.is_some() {
            return true;
        }
        let Some(allocator) = read.allocator.clone() else {
            warn!(
                "Read request {} has neither an output buffer nor an allocator",
                parent.id()
            );
            return false;
        };

        let recommended = if compressed {
            Some(read.size)
        } else {
            self.recommendations
                .calculate_recommended_memory_size(read.size, read.offset)
        };
        let Some(recommended) = recommended else {
            warn!(
                "Read request {} of {} bytes at {} has no representable buffer size",
                parent.id(),
                read.size,
                read.offset
            );
            return false;
        };
        match allocator.allocate(read.size, recommended, self.recommendations.memory_alignment()) {
            Some(allocation)
                if allocation.size >= read.size && allocation.buffer.len() as u64 >= read.size =>
            {
                trace!(
                    "Allocated {} bytes for request {} (recommended {})",
                    allocation.size,
                    parent.id(),
                    recommended
                );
                read.output_size = allocation.size;
                read.memory_type = allocation.memory_type;
                read.output = Some(allocation.buffer);
                true
            }
            Some(allocation) => {
                warn!(
                    "Allocator returned {} bytes for request {}, needed {}",
                    allocation.size,
                    parent.id(),
                    read.size
                );
                false
            }
            None => false,
        }
    }

    fn cancel_prepared(&self, target: RequestId) {
        let mut canceled = Vec::new();
        self.context.prepared().retain(|request| {
            if request.targets(target) {
                canceled.push(Arc::clone(request));
                false
            } else {
                true
            }
        });
        if canceled.is_empty() {
            debug!("Cancel of request {} found nothing prepared", target);
            return;
        }
        debug!(
            "Canceling {} prepared request(s) of request {}",
            canceled.len(),
            target
        );
        for request in canceled {
            request.set_status(RequestStatus::Canceled);
            self.context.mark_request_as_completed(request);
        }
        self.context.finalize_completed_requests();
    }

    fn reschedule_prepared(&self, reschedule: &RescheduleData) {
        let targets: Vec<FileRequestHandle> = self
            .context
            .prepared()
            .iter()
            .filter(|request| request.targets(reschedule.target))
            .cloned()
            .collect();
        let mut updated = 0;
        for request in targets {
            let Some(parent) = request.find_read_request() else {
                continue;
            };
            let mut command = parent.command();
            if let Command::ReadRequest(read) = &mut *command {
                read.deadline = reschedule.new_deadline;
                read.priority = reschedule.new_priority;
                updated += 1;
            }
        }
        debug!(
            "Rescheduled {} prepared request(s) of request {} to priority {}",
            updated, reschedule.target, reschedule.new_priority.0
        );
    }

    fn prepare_pending_requests(&mut self) -> bool {
        let mut pulled = std::mem::take(&mut self.pending);
        self.context.swap_pending(&mut pulled);
        if pulled.is_empty() {
            self.pending = pulled;
            return false;
        }
        self.metrics.record_prepared(pulled.len() as u64);
        trace!("Preparing {} request(s)", pulled.len());

        for request in pulled.drain(..) {
            let allocator = match &mut *request.command() {
                Command::ReadRequest(read)
                    if read.output.is_none() && read.allocator.is_some() && !read.allocator_locked =>
                {
                    read.allocator_locked = true;
                    read.allocator.clone()
                }
                _ => None,
            };
            if let Some(allocator) = allocator {
                allocator.lock_allocator();
            }

            if let Err(e) = self.context.link_external(&request) {
                error!("Failed to link request {}: {}", request.id(), e);
                self.fail(request);
                continue;
            }
            request.set_status(RequestStatus::Queued);
            self.stack.lock().prepare_request(request);
        }
        self.pending = pulled;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HeapAllocator;
    use crate::request::ReadRequestData;
    use crate::stack::MockStreamStack;
    use std::time::Duration;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn read_request(scheduler: &Scheduler, path: &str, offset: u64, size: u64) -> FileRequestHandle {
        let request = scheduler.create_request();
        request.create_read(
            ReadRequestData::new(path, offset, size).with_allocator(Arc::new(HeapAllocator::new())),
        );
        request
    }

    #[test]
    fn test_config_defaults_and_serde() {
        let config = SchedulerConfig::default();
        assert_eq!(config.memory_alignment, 4096);
        assert_eq!(config.size_alignment, 4096);
        assert_eq!(config.granularity, 2 * 1024 * 1024);

        let json = serde_json::to_string(&ThreadConfig::default()).unwrap();
        let back: ThreadConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "claudefs-streamer");
        assert_eq!(back.stack_size, None);
    }

    #[test]
    fn test_new_rejects_bad_alignment() {
        let (stack, _probe) = MockStreamStack::new(4);
        let config = SchedulerConfig {
            memory_alignment: 1000,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            Scheduler::new(Box::new(stack), config),
            Err(StreamerError::InvalidAlignment { .. })
        ));
    }

    #[test]
    fn test_new_rejects_busy_stack() {
        struct BusyStack;
        impl StreamStackEntry for BusyStack {
            fn name(&self) -> &str {
                "Busy"
            }
            fn set_context(&mut self, _context: Arc<StreamerContext>) {}
            fn prepare_request(&mut self, _request: FileRequestHandle) {}
            fn queue_request(&mut self, _request: FileRequestHandle) {}
            fn execute_requests(&mut self) -> bool {
                false
            }
            fn update_status(&self, status: &mut StackStatus) {
                status.merge(false, 1);
            }
            fn update_completion_estimates(
                &mut self,
                _now: Instant,
                _internal_pending: &mut Vec<FileRequestHandle>,
                _prepared: &[FileRequestHandle],
            ) {
            }
            fn collect_statistics(&self, _statistics: &mut Vec<Statistic>) {}
        }

        assert!(matches!(
            Scheduler::new(Box::new(BusyStack), SchedulerConfig::default()),
            Err(StreamerError::StackNotIdle)
        ));
    }

    #[test]
    fn test_recommendations_from_stack() {
        let (stack, _probe) = MockStreamStack::new(6);
        let scheduler = Scheduler::new(Box::new(stack), SchedulerConfig::default()).unwrap();
        let recs = scheduler.recommendations();
        assert_eq!(recs.max_concurrent_requests(), 6);
        assert_eq!(recs.memory_alignment(), 4096);
        assert_eq!(recs.calculate_recommended_memory_size(1, 0), Some(4096));
    }

    #[test]
    fn test_queue_requires_running() {
        let (stack, _probe) = MockStreamStack::new(1);
        let scheduler = Scheduler::new(Box::new(stack), SchedulerConfig::default()).unwrap();
        let request = read_request(&scheduler, "/a", 0, 16);
        assert!(matches!(
            scheduler.queue_request(&request),
            Err(StreamerError::NotRunning)
        ));
        assert_eq!(request.status(), RequestStatus::Pending);
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let (stack, _probe) = MockStreamStack::new(1);
        let scheduler = Scheduler::new(Box::new(stack), SchedulerConfig::default()).unwrap();
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_read_completes_with_allocated_buffer() {
        let (stack, probe) = MockStreamStack::new(2);
        let scheduler = Scheduler::new(Box::new(stack), SchedulerConfig::default()).unwrap();
        scheduler.start(ThreadConfig::default()).unwrap();

        let request = read_request(&scheduler, "/a", 100, 5000);
        scheduler.queue_request(&request).unwrap();
        assert!(wait_until(
            || request.is_retired() && scheduler.context().active_links() == 0
        ));

        assert_eq!(request.status(), RequestStatus::Completed);
        let output = request.take_read_output().unwrap();
        assert_eq!(output.size, 5000);
        // 100 leading bytes plus 5000 bytes spans two 4 KiB blocks.
        assert_eq!(output.buffer.len(), 8192);
        assert_eq!(probe.dispatched(), vec![request.id()]);
        scheduler.stop();
    }

    #[test]
    fn test_suspend_blocks_dispatch() {
        let (stack, probe) = MockStreamStack::new(4);
        let scheduler = Scheduler::new(Box::new(stack), SchedulerConfig::default()).unwrap();
        scheduler.start(ThreadConfig::default()).unwrap();
        scheduler.suspend_processing();
        assert!(scheduler.is_suspended());

        let request = read_request(&scheduler, "/a", 0, 16);
        scheduler.queue_request(&request).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(probe.dispatched().is_empty());
        assert_eq!(request.status(), RequestStatus::Queued);

        scheduler.resume_processing();
        assert!(!scheduler.is_suspended());
        assert!(wait_until(|| request.is_retired()));
        assert_eq!(request.status(), RequestStatus::Completed);
    }

    #[test]
    fn test_collect_statistics_includes_stack() {
        let (stack, _probe) = MockStreamStack::new(4);
        let scheduler = Scheduler::new(Box::new(stack), SchedulerConfig::default()).unwrap();
        let mut statistics = Vec::new();
        scheduler.collect_statistics(&mut statistics);
        assert!(crate::statistics::find(&statistics, "Scheduler", "Pending requests").is_some());
        assert!(crate::statistics::find(&statistics, "MockStack", "In flight").is_some());
    }
}
