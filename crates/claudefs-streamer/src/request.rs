//! File requests: the unit of work that flows through the streamer.
//!
//! A [`FileRequest`] carries exactly one [`Command`]. External requests are
//! created for callers and shared as [`FileRequestHandle`]s; internal requests
//! are created by the scheduler and the processing stack, usually as children
//! of an external request. A child stores its complete ancestor list when it is
//! built, so lookups like [`FileRequest::find_read_request`] never walk a
//! mutable pointer chain and ancestors never point back at their children.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{trace, warn};

use crate::allocator::{MemoryAllocator, MemoryType};
use crate::error::{StreamerError, StreamerResult};

/// Maximum number of ancestors a request may have.
pub const MAX_CHAIN_DEPTH: usize = 8;

/// Shared handle to a request.
pub type FileRequestHandle = Arc<FileRequest>;

/// Callback invoked once when an external request retires.
pub type CompletionCallback = Box<dyn FnOnce(&FileRequest) + Send + 'static>;

/// Monotonically increasing request identifier, also the final scheduling tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a request. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Created but not yet submitted.
    #[default]
    Pending,
    /// Submitted and waiting to be dispatched.
    Queued,
    /// Handed to the processing stack.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Removed before it could finish.
    Canceled,
}

impl RequestStatus {
    /// Returns true for `Completed`, `Failed` and `Canceled`.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Canceled
        )
    }

    fn stage(&self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Queued => 1,
            RequestStatus::Processing => 2,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Canceled => 3,
        }
    }

    /// Returns true if moving from `self` to `next` goes forward in the lifecycle.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        !self.is_terminal() && next.stage() > self.stage()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "Pending"),
            RequestStatus::Queued => write!(f, "Queued"),
            RequestStatus::Processing => write!(f, "Processing"),
            RequestStatus::Completed => write!(f, "Completed"),
            RequestStatus::Failed => write!(f, "Failed"),
            RequestStatus::Canceled => write!(f, "Canceled"),
        }
    }
}

/// Read priority. Lower values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    /// Most urgent priority.
    pub const HIGHEST: Priority = Priority(0);
    /// Above normal.
    pub const HIGH: Priority = Priority(64);
    /// Default priority for reads.
    pub const NORMAL: Priority = Priority(128);
    /// Below normal.
    pub const LOW: Priority = Priority(192);
    /// Least urgent priority.
    pub const LOWEST: Priority = Priority(255);

    /// Returns true if `self` should be served before `other`.
    #[inline]
    pub fn is_more_urgent_than(&self, other: Priority) -> bool {
        self.0 < other.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// Static scheduling class of a command. Higher classes are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OrderPriority {
    /// Placeholders without work.
    Idle = 0,
    /// Background maintenance.
    Low = 1,
    /// Reads.
    Medium = 2,
    /// Flushes of a single file.
    High = 3,
    /// Commands that change other requests.
    Highest = 4,
}

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOrigin {
    /// Created for a caller of the scheduler.
    External,
    /// Created by the scheduler or the processing stack.
    Internal,
}

/// Describes where a file lives inside an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionInfo {
    /// The archive that contains the file.
    pub archive_path: PathBuf,
    /// Byte offset of the entry within the archive.
    pub offset: u64,
    /// Size of the entry as stored in the archive.
    pub compressed_size: u64,
    /// Size of the file once extracted.
    pub uncompressed_size: u64,
    /// False when the entry is stored without compression.
    pub is_compressed: bool,
}

/// Top-level read submitted by a caller.
pub struct ReadRequestData {
    /// File to read from.
    pub path: PathBuf,
    /// Byte offset within the file.
    pub offset: u64,
    /// Number of bytes to read.
    pub size: u64,
    /// Output buffer, either supplied by the caller or allocated at dispatch.
    pub output: Option<Vec<u8>>,
    /// Usable size of the output buffer.
    pub output_size: u64,
    /// Kind of memory the output buffer lives in.
    pub memory_type: MemoryType,
    /// Allocator used when no output buffer was supplied.
    pub allocator: Option<Arc<dyn MemoryAllocator>>,
    /// Point in time the data is needed by. `None` means no deadline.
    pub deadline: Option<Instant>,
    /// Urgency relative to other reads.
    pub priority: Priority,
    pub(crate) allocator_locked: bool,
}

impl ReadRequestData {
    /// Creates a read of `size` bytes at `offset` in `path` with normal priority and no deadline.
    pub fn new(path: impl Into<PathBuf>, offset: u64, size: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            size,
            output: None,
            output_size: 0,
            memory_type: MemoryType::ReadWrite,
            allocator: None,
            deadline: None,
            priority: Priority::NORMAL,
            allocator_locked: false,
        }
    }

    /// Reads into a caller-supplied buffer.
    pub fn with_output(mut self, buffer: Vec<u8>) -> Self {
        self.output_size = buffer.len() as u64;
        self.output = Some(buffer);
        self
    }

    /// Lets the scheduler allocate the output buffer right before dispatch.
    pub fn with_allocator(mut self, allocator: Arc<dyn MemoryAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Sets the deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Returns true if an output buffer is present.
    #[inline]
    pub fn has_output_buffer(&self) -> bool {
        self.output.is_some()
    }

    /// Returns true if the read is expected to finish after its deadline.
    pub fn is_in_panic(&self, estimated_completion: Option<Instant>) -> bool {
        match (self.deadline, estimated_completion) {
            (Some(deadline), Some(estimate)) => estimate > deadline,
            _ => false,
        }
    }
}

impl fmt::Debug for ReadRequestData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRequestData")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("has_output", &self.output.is_some())
            .field("output_size", &self.output_size)
            .field("memory_type", &self.memory_type)
            .field("has_allocator", &self.allocator.is_some())
            .field("deadline", &self.deadline)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Stack-facing read of (part of) a file into the parent's output buffer.
#[derive(Debug, Clone)]
pub struct ReadData {
    /// File to read from.
    pub path: PathBuf,
    /// Byte offset within the file.
    pub offset: u64,
    /// Number of bytes to read.
    pub size: u64,
    /// Where in the parent's output buffer the data lands.
    pub output_offset: u64,
}

/// Stack-facing read of a file stored inside an archive.
#[derive(Debug, Clone)]
pub struct CompressedReadData {
    /// Location of the entry.
    pub compression_info: CompressionInfo,
    /// Offset within the uncompressed entry.
    pub read_offset: u64,
    /// Number of uncompressed bytes to produce.
    pub read_size: u64,
    /// Where in the parent's output buffer the data lands.
    pub output_offset: u64,
}

/// Cancels every unfinished request derived from `target`.
#[derive(Debug, Clone, Copy)]
pub struct CancelData {
    /// Request to cancel.
    pub target: RequestId,
}

/// Changes the deadline and priority of a queued read.
#[derive(Debug, Clone, Copy)]
pub struct RescheduleData {
    /// Request to update.
    pub target: RequestId,
    /// New deadline. `None` removes the deadline.
    pub new_deadline: Option<Instant>,
    /// New priority.
    pub new_priority: Priority,
}

/// Drops any cached state for a single file.
#[derive(Debug, Clone)]
pub struct FlushData {
    /// File to flush.
    pub path: PathBuf,
}

/// Keeps an external request alive while the scheduler works on it.
#[derive(Clone)]
pub struct LinkData {
    /// The external request owned by the link.
    pub external: FileRequestHandle,
}

impl fmt::Debug for LinkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkData")
            .field("external", &self.external.id())
            .finish()
    }
}

/// The work a request describes.
#[derive(Debug, Default)]
pub enum Command {
    /// No work.
    #[default]
    None,
    /// Internal placeholder owning an external request.
    Link(LinkData),
    /// Public top-level read.
    ReadRequest(ReadRequestData),
    /// Stack-facing read.
    Read(ReadData),
    /// Stack-facing read from an archive.
    CompressedRead(CompressedReadData),
    /// Cancel another request.
    Cancel(CancelData),
    /// Update deadline and priority of another request.
    Reschedule(RescheduleData),
    /// Flush a single file.
    Flush(FlushData),
    /// Flush everything.
    FlushAll,
}

impl Command {
    /// Static scheduling class of this command.
    pub fn order_priority(&self) -> OrderPriority {
        match self {
            Command::None | Command::Link(_) => OrderPriority::Idle,
            Command::ReadRequest(_) | Command::Read(_) | Command::CompressedRead(_) => {
                OrderPriority::Medium
            }
            Command::Cancel(_) | Command::Reschedule(_) => OrderPriority::Highest,
            Command::Flush(_) => OrderPriority::High,
            Command::FlushAll => OrderPriority::Low,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::None => "None",
            Command::Link(_) => "Link",
            Command::ReadRequest(_) => "ReadRequest",
            Command::Read(_) => "Read",
            Command::CompressedRead(_) => "CompressedRead",
            Command::Cancel(_) => "Cancel",
            Command::Reschedule(_) => "Reschedule",
            Command::Flush(_) => "Flush",
            Command::FlushAll => "FlushAll",
        }
    }

    /// File and offset the command reads from, if it reads at all.
    pub fn read_location(&self) -> Option<(&Path, u64)> {
        match self {
            Command::ReadRequest(read) => Some((read.path.as_path(), read.offset)),
            Command::Read(read) => Some((read.path.as_path(), read.offset)),
            Command::CompressedRead(read) => Some((
                read.compression_info.archive_path.as_path(),
                read.compression_info.offset,
            )),
            _ => None,
        }
    }
}

/// Output of a finished read.
#[derive(Debug)]
pub struct ReadOutput {
    /// The filled buffer.
    pub buffer: Vec<u8>,
    /// Number of bytes requested.
    pub size: u64,
    /// Kind of memory the buffer lives in.
    pub memory_type: MemoryType,
}

/// A unit of work for the scheduler.
pub struct FileRequest {
    id: RequestId,
    origin: RequestOrigin,
    ancestors: Box<[FileRequestHandle]>,
    command: Mutex<Command>,
    status: watch::Sender<RequestStatus>,
    estimated_completion: Mutex<Option<Instant>>,
    outstanding_children: AtomicUsize,
    child_status: Mutex<Option<RequestStatus>>,
    callback: Mutex<Option<CompletionCallback>>,
    retired: AtomicBool,
}

impl FileRequest {
    pub(crate) fn new_external(id: RequestId) -> Self {
        Self::build(id, RequestOrigin::External, Box::default(), Command::None)
    }

    pub(crate) fn new_internal(
        id: RequestId,
        parent: Option<&FileRequestHandle>,
        command: Command,
    ) -> StreamerResult<Self> {
        let ancestors: Box<[FileRequestHandle]> = match parent {
            Some(parent) => {
                let depth = parent.ancestors.len() + 1;
                if depth > MAX_CHAIN_DEPTH {
                    return Err(StreamerError::ChainTooDeep { depth });
                }
                let mut ancestors = Vec::with_capacity(depth);
                ancestors.push(Arc::clone(parent));
                ancestors.extend(parent.ancestors.iter().cloned());
                parent.outstanding_children.fetch_add(1, Ordering::AcqRel);
                ancestors.into_boxed_slice()
            }
            None => Box::default(),
        };
        Ok(Self::build(id, RequestOrigin::Internal, ancestors, command))
    }

    fn build(
        id: RequestId,
        origin: RequestOrigin,
        ancestors: Box<[FileRequestHandle]>,
        command: Command,
    ) -> Self {
        let (status, _) = watch::channel(RequestStatus::Pending);
        Self {
            id,
            origin,
            ancestors,
            command: Mutex::new(command),
            status,
            estimated_completion: Mutex::new(None),
            outstanding_children: AtomicUsize::new(0),
            child_status: Mutex::new(None),
            callback: Mutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    /// Returns the request id.
    #[inline]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Returns where the request came from.
    #[inline]
    pub fn origin(&self) -> RequestOrigin {
        self.origin
    }

    /// Returns true for requests created for callers.
    #[inline]
    pub fn is_external(&self) -> bool {
        self.origin == RequestOrigin::External
    }

    /// Returns the direct parent, if any.
    #[inline]
    pub fn parent(&self) -> Option<&FileRequestHandle> {
        self.ancestors.first()
    }

    /// Returns all ancestors, nearest first.
    #[inline]
    pub fn ancestors(&self) -> &[FileRequestHandle] {
        &self.ancestors
    }

    /// Locks and returns the command.
    pub fn command(&self) -> MutexGuard<'_, Command> {
        self.command.lock()
    }

    /// Replaces the command of a request that has not been submitted yet.
    pub fn set_command(&self, command: Command) {
        let status = self.status();
        if status != RequestStatus::Pending {
            warn!(
                "Ignoring {} command for request {} in state {}",
                command.name(),
                self.id,
                status
            );
            return;
        }
        *self.command.lock() = command;
    }

    /// Turns this request into a read.
    pub fn create_read(&self, read: ReadRequestData) {
        self.set_command(Command::ReadRequest(read));
    }

    /// Turns this request into a cancel of `target`.
    pub fn create_cancel(&self, target: &FileRequest) {
        self.set_command(Command::Cancel(CancelData { target: target.id() }));
    }

    /// Turns this request into a reschedule of `target`.
    pub fn create_reschedule(
        &self,
        target: &FileRequest,
        new_deadline: Option<Instant>,
        new_priority: Priority,
    ) {
        self.set_command(Command::Reschedule(RescheduleData {
            target: target.id(),
            new_deadline,
            new_priority,
        }));
    }

    /// Turns this request into a flush of `path`.
    pub fn create_flush(&self, path: impl Into<PathBuf>) {
        self.set_command(Command::Flush(FlushData { path: path.into() }));
    }

    /// Turns this request into a flush of everything.
    pub fn create_flush_all(&self) {
        self.set_command(Command::FlushAll);
    }

    /// Returns the current status.
    #[inline]
    pub fn status(&self) -> RequestStatus {
        *self.status.borrow()
    }

    /// Moves the request forward in its lifecycle.
    ///
    /// Returns false and leaves the status untouched when `status` would move
    /// backwards or the request already reached a terminal state.
    pub fn set_status(&self, status: RequestStatus) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if current.can_transition_to(status) {
                *current = status;
                true
            } else {
                false
            }
        });
        if !changed {
            trace!(
                "Rejected status change of request {} to {} (currently {})",
                self.id,
                status,
                self.status()
            );
        }
        changed
    }

    /// Returns a receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<RequestStatus> {
        self.status.subscribe()
    }

    /// Waits until the request reaches a terminal status and returns it.
    pub async fn wait_for_completion(&self) -> RequestStatus {
        let mut receiver = self.status.subscribe();
        let result = receiver.wait_for(|status| status.is_terminal()).await;
        match result {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    /// Returns the completion estimate last written by the processing stack.
    pub fn estimated_completion(&self) -> Option<Instant> {
        *self.estimated_completion.lock()
    }

    /// Stores a completion estimate.
    pub fn set_estimated_completion(&self, at: Instant) {
        *self.estimated_completion.lock() = Some(at);
    }

    /// Registers a callback that runs once on the scheduler thread when the request retires.
    pub fn set_completion_callback<F>(&self, callback: F)
    where
        F: FnOnce(&FileRequest) + Send + 'static,
    {
        *self.callback.lock() = Some(Box::new(callback));
    }

    /// Iterates over this request followed by its ancestors.
    pub fn lineage(self: &Arc<Self>) -> impl Iterator<Item = &FileRequestHandle> + '_ {
        std::iter::once(self).chain(self.ancestors.iter())
    }

    /// Finds the top-level read this request belongs to, if any.
    pub fn find_read_request(self: &Arc<Self>) -> Option<FileRequestHandle> {
        self.lineage()
            .find(|request| matches!(*request.command(), Command::ReadRequest(_)))
            .cloned()
    }

    /// Returns true if this request is `target` or was derived from it.
    pub fn targets(&self, target: RequestId) -> bool {
        self.id == target || self.ancestors.iter().any(|ancestor| ancestor.id == target)
    }

    /// Takes the output buffer of a finished read.
    pub fn take_read_output(&self) -> Option<ReadOutput> {
        if self.status() != RequestStatus::Completed {
            return None;
        }
        let mut command = self.command.lock();
        match &mut *command {
            Command::ReadRequest(read) => read.output.take().map(|buffer| ReadOutput {
                buffer,
                size: read.size,
                memory_type: read.memory_type,
            }),
            _ => None,
        }
    }

    /// Returns true once the request has been retired.
    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Flags the request as retired. Returns false if it already was.
    pub(crate) fn mark_retired(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }

    /// Number of children that have not retired yet.
    #[inline]
    pub fn outstanding_children(&self) -> usize {
        self.outstanding_children.load(Ordering::Acquire)
    }

    /// Records a retired child. Returns true when it was the last outstanding one.
    pub(crate) fn child_retired(&self, status: RequestStatus) -> bool {
        if status != RequestStatus::Completed {
            let mut child_status = self.child_status.lock();
            if child_status.is_none() {
                *child_status = Some(status);
            }
        }
        let previous = self.outstanding_children.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            warn!("Request {} had a child retire without outstanding children", self.id);
            self.outstanding_children.store(0, Ordering::Release);
            return false;
        }
        previous == 1
    }

    /// Terminal status a parent adopts once all of its children retired.
    pub(crate) fn resolved_child_status(&self) -> RequestStatus {
        self.child_status.lock().unwrap_or(RequestStatus::Completed)
    }

    pub(crate) fn take_callback(&self) -> Option<CompletionCallback> {
        self.callback.lock().take()
    }
}

impl fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRequest")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("status", &self.status())
            .field("command", &self.command.lock().name())
            .field("depth", &self.ancestors.len())
            .finish()
    }
}
