#![warn(missing_docs)]

//! ClaudeFS streamer subsystem: asynchronous file I/O scheduling
//!
//! Callers create file requests, submit them from any thread and observe
//! their status. A single scheduler thread pulls submitted requests in, orders
//! them by command class, deadline pressure and file locality, allocates
//! output buffers just in time and feeds them to a processing stack that
//! performs the actual I/O.

pub mod allocator;
pub mod context;
pub mod drive;
pub mod error;
pub mod ordering;
pub mod recommendations;
pub mod request;
pub mod scheduler;
pub mod stack;
pub mod statistics;
pub mod telemetry;

pub use allocator::{Allocation, HeapAllocator, HeapAllocatorStats, MemoryAllocator, MemoryType};
pub use context::{StreamerContext, ThreadState};
pub use drive::{FileDrive, FileDriveConfig, FileDriveStats};
pub use error::{StreamerError, StreamerResult};
pub use ordering::{compare_for_dispatch, prioritize_requests, LocalityState, Order, RequestSnapshot};
pub use recommendations::{AlignedGranularityPolicy, MemorySizePolicy, RecommendationLimits, Recommendations};
pub use request::{
    Command, CompressionInfo, FileRequest, FileRequestHandle, OrderPriority, Priority, ReadOutput,
    ReadRequestData, RequestId, RequestOrigin, RequestStatus, MAX_CHAIN_DEPTH,
};
pub use scheduler::{Scheduler, SchedulerConfig, ThreadConfig};
pub use stack::{MockStackLog, MockStackProbe, MockStreamStack, StackStatus, StreamStackEntry};
pub use statistics::{SchedulerMetrics, SchedulerMetricsSnapshot, Statistic, StatisticValue};
pub use telemetry::{init_tracing, TracingFormat};
