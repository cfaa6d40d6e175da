//! Processing stack entry that serves reads from the local filesystem.
//!
//! Reads are executed one at a time on the scheduler thread through a small
//! LRU cache of open file handles. Files registered as archive entries are
//! read from their archive; entries stored without compression are read raw.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::context::StreamerContext;
use crate::error::{StreamerError, StreamerResult};
use crate::request::{
    Command, CompressedReadData, CompressionInfo, FileRequestHandle, ReadData, RequestId,
    RequestStatus,
};
use crate::stack::{StackStatus, StreamStackEntry};
use crate::statistics::{Statistic, StatisticValue};

/// Configuration for [`FileDrive`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDriveConfig {
    /// Name reported in statistics.
    pub name: String,
    /// Number of reads the drive accepts at once.
    pub max_concurrent_reads: usize,
    /// Number of file handles kept open.
    pub max_file_handles: usize,
    /// Throughput assumed for estimates until the first read was measured.
    pub assumed_read_bytes_per_sec: u64,
    /// Cost of opening a file that is not cached, in microseconds.
    pub file_open_cost_us: u64,
    /// Cost of moving to a different offset, in microseconds.
    pub seek_cost_us: u64,
}

impl Default for FileDriveConfig {
    fn default() -> Self {
        Self {
            name: "FileDrive".to_string(),
            max_concurrent_reads: 8,
            max_file_handles: 32,
            assumed_read_bytes_per_sec: 100 * 1024 * 1024,
            file_open_cost_us: 1000,
            seek_cost_us: 100,
        }
    }
}

/// Counters kept by the drive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileDriveStats {
    /// Reads that finished successfully.
    pub reads_completed: u64,
    /// Reads that failed.
    pub reads_failed: u64,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Time spent in successful reads.
    pub read_time: Duration,
    /// Files opened.
    pub files_opened: u64,
    /// Time spent opening files.
    pub open_time: Duration,
    /// Reads that targeted a different file than the previous read.
    pub file_switches: u64,
    /// Reads that did not continue where the previous read ended.
    pub seeks: u64,
}

impl FileDriveStats {
    fn record_read(&mut self, bytes: u64, elapsed: Duration) {
        self.reads_completed += 1;
        self.bytes_read += bytes;
        self.read_time += elapsed;
    }

    fn record_open(&mut self, elapsed: Duration) {
        self.files_opened += 1;
        self.open_time += elapsed;
    }

    fn record_failure(&mut self) {
        self.reads_failed += 1;
    }
}

struct CachedFile {
    path: PathBuf,
    file: File,
}

/// Where a queued read lands on disk.
struct ReadExtent {
    path: PathBuf,
    offset: u64,
    size: u64,
}

// Cap for a single transfer estimate.
const MAX_ESTIMATE: Duration = Duration::from_secs(365 * 24 * 3600);

fn advance(at: &mut Instant, by: Duration) {
    if let Some(later) = at.checked_add(by) {
        *at = later;
    }
}

fn read_extent(request: &FileRequestHandle) -> Option<ReadExtent> {
    match &*request.command() {
        Command::Read(read) => Some(ReadExtent {
            path: read.path.clone(),
            offset: read.offset,
            size: read.size,
        }),
        Command::CompressedRead(read) => Some(ReadExtent {
            path: read.compression_info.archive_path.clone(),
            offset: read.compression_info.offset.saturating_add(read.read_offset),
            size: read.read_size,
        }),
        _ => None,
    }
}

/// Bottom-of-stack entry reading from the local filesystem.
pub struct FileDrive {
    config: FileDriveConfig,
    context: Option<Arc<StreamerContext>>,
    archive_entries: HashMap<PathBuf, CompressionInfo>,
    queue: VecDeque<FileRequestHandle>,
    // Least recently used first.
    handles: VecDeque<CachedFile>,
    active_file: Option<PathBuf>,
    active_offset: u64,
    stats: FileDriveStats,
}

impl FileDrive {
    /// Creates a drive.
    pub fn new(config: FileDriveConfig) -> Self {
        Self {
            config,
            context: None,
            archive_entries: HashMap::new(),
            queue: VecDeque::new(),
            handles: VecDeque::new(),
            active_file: None,
            active_offset: 0,
            stats: FileDriveStats::default(),
        }
    }

    /// Serves reads of `path` from an entry inside an archive.
    pub fn register_archive_entry(&mut self, path: impl Into<PathBuf>, info: CompressionInfo) {
        let path = path.into();
        debug!(
            "Registered {} as entry of {} at offset {}",
            path.display(),
            info.archive_path.display(),
            info.offset
        );
        self.archive_entries.insert(path, info);
    }

    /// Returns the drive counters.
    pub fn stats(&self) -> &FileDriveStats {
        &self.stats
    }

    /// Number of open file handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn available_slots(&self) -> i32 {
        let available = self.config.max_concurrent_reads as i64 - self.queue.len() as i64;
        i32::try_from(available).unwrap_or(if available < 0 { i32::MIN } else { i32::MAX })
    }

    fn complete(&self, request: FileRequestHandle) {
        match &self.context {
            Some(context) => context.mark_request_as_completed(request),
            None => warn!(
                "{} finished request {} without a context",
                self.config.name,
                request.id()
            ),
        }
    }

    fn fail(&self, request: FileRequestHandle) {
        request.set_status(RequestStatus::Failed);
        self.complete(request);
    }

    fn read_bytes_per_sec(&self) -> f64 {
        let seconds = self.stats.read_time.as_secs_f64();
        if self.stats.bytes_read > 0 && seconds > 0.0 {
            self.stats.bytes_read as f64 / seconds
        } else {
            self.config.assumed_read_bytes_per_sec.max(1) as f64
        }
    }

    fn file_open_cost(&self) -> Duration {
        if self.stats.files_opened > 0 {
            let nanos = self.stats.open_time.as_nanos() / u128::from(self.stats.files_opened);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        } else {
            Duration::from_micros(self.config.file_open_cost_us)
        }
    }

    fn is_cached(&self, path: &Path) -> bool {
        self.handles.iter().any(|cached| cached.path == path)
    }

    /// Returns an open handle for `path`, opening and caching it if needed.
    fn open(&mut self, path: &Path) -> StreamerResult<&mut File> {
        if let Some(index) = self.handles.iter().position(|cached| cached.path == path) {
            if let Some(cached) = self.handles.remove(index) {
                self.handles.push_back(cached);
            }
        } else {
            let started = Instant::now();
            let file = File::open(path)?;
            self.stats.record_open(started.elapsed());
            while self.handles.len() >= self.config.max_file_handles.max(1) {
                if let Some(evicted) = self.handles.pop_front() {
                    trace!("Closing {}", evicted.path.display());
                }
            }
            self.handles.push_back(CachedFile {
                path: path.to_path_buf(),
                file,
            });
        }
        match self.handles.back_mut() {
            Some(cached) => Ok(&mut cached.file),
            None => Err(StreamerError::InvalidRequest(format!(
                "no file handle for {}",
                path.display()
            ))),
        }
    }

    fn close(&mut self, path: &Path) {
        self.handles.retain(|cached| cached.path != path);
        if self.active_file.as_deref() == Some(path) {
            self.active_file = None;
        }
    }

    fn close_all(&mut self) {
        self.handles.clear();
        self.active_file = None;
    }

    fn prepare_read(&self, context: &StreamerContext, request: &FileRequestHandle) -> StreamerResult<()> {
        let (path, offset, size) = match &*request.command() {
            Command::ReadRequest(read) => (read.path.clone(), read.offset, read.size),
            _ => return Ok(()),
        };
        offset.checked_add(size).ok_or_else(|| {
            StreamerError::InvalidRequest(format!("read of {} bytes at {} overflows", size, offset))
        })?;

        let command = match self.archive_entries.get(&path) {
            Some(info) => {
                if offset + size > info.uncompressed_size {
                    return Err(StreamerError::InvalidRequest(format!(
                        "read past the end of {} ({} > {})",
                        path.display(),
                        offset + size,
                        info.uncompressed_size
                    )));
                }
                Command::CompressedRead(CompressedReadData {
                    compression_info: info.clone(),
                    read_offset: offset,
                    read_size: size,
                    output_offset: 0,
                })
            }
            None => Command::Read(ReadData {
                path,
                offset,
                size,
                output_offset: 0,
            }),
        };
        let child = context.new_internal_request(Some(request), command)?;
        context.push_prepared_request(child);
        Ok(())
    }

    /// Performs one read into the output buffer of its read request.
    fn read(&mut self, request: &FileRequestHandle) -> StreamerResult<u64> {
        let (path, offset, size, output_offset) = match &*request.command() {
            Command::Read(read) => (read.path.clone(), read.offset, read.size, read.output_offset),
            Command::CompressedRead(read) => {
                if read.compression_info.is_compressed {
                    return Err(StreamerError::InvalidRequest(format!(
                        "{} holds a compressed entry, decompression is not supported",
                        read.compression_info.archive_path.display()
                    )));
                }
                let offset = read
                    .compression_info
                    .offset
                    .checked_add(read.read_offset)
                    .ok_or_else(|| {
                        StreamerError::InvalidRequest(format!(
                            "entry offset {} in {} overflows",
                            read.read_offset,
                            read.compression_info.archive_path.display()
                        ))
                    })?;
                (
                    read.compression_info.archive_path.clone(),
                    offset,
                    read.read_size,
                    read.output_offset,
                )
            }
            other => {
                return Err(StreamerError::InvalidRequest(format!(
                    "{} is not a read",
                    other.name()
                )))
            }
        };
        let parent = request.find_read_request().ok_or_else(|| {
            StreamerError::InvalidRequest(format!("read {} has no read request", request.id()))
        })?;

        if self.active_file.as_deref() != Some(path.as_path()) {
            self.stats.file_switches += 1;
        } else if self.active_offset != offset {
            self.stats.seeks += 1;
        }

        let started = Instant::now();
        let file = self.open(&path)?;
        let mut command = parent.command();
        let Command::ReadRequest(read) = &mut *command else {
            return Err(StreamerError::InvalidRequest(format!(
                "request {} is not a read request",
                parent.id()
            )));
        };
        let buffer = read.output.as_mut().ok_or_else(|| {
            StreamerError::InvalidRequest(format!("request {} has no output buffer", parent.id()))
        })?;
        let start = usize::try_from(output_offset)
            .map_err(|_| StreamerError::InvalidRequest("output offset too large".to_string()))?;
        let end = usize::try_from(size)
            .ok()
            .and_then(|size| start.checked_add(size))
            .filter(|end| *end <= buffer.len())
            .ok_or_else(|| {
                StreamerError::InvalidRequest(format!(
                    "output buffer of {} bytes is too small for {} bytes at {}",
                    buffer.len(),
                    size,
                    output_offset
                ))
            })?;

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buffer[start..end])?;
        drop(command);

        self.stats.record_read(size, started.elapsed());
        self.active_file = Some(path);
        self.active_offset = offset.saturating_add(size);
        Ok(size)
    }

    /// Adds the estimated duration of `request` to `at`.
    fn estimate(
        &self,
        request: &FileRequestHandle,
        at: &mut Instant,
        active_file: &mut Option<PathBuf>,
        active_offset: &mut u64,
        bytes_per_sec: f64,
    ) {
        if let Some(extent) = read_extent(request) {
            if extent.size > 0 {
                if active_file.as_deref() != Some(extent.path.as_path()) {
                    if !self.is_cached(&extent.path) {
                        advance(at, self.file_open_cost());
                    }
                    *active_offset = u64::MAX;
                    *active_file = Some(extent.path);
                }
                if *active_offset != extent.offset {
                    advance(at, Duration::from_micros(self.config.seek_cost_us));
                }
                let transfer = Duration::from_nanos((extent.size as f64 * 1e9 / bytes_per_sec) as u64);
                advance(at, transfer.min(MAX_ESTIMATE));
                *active_offset = extent.offset.saturating_add(extent.size);
            }
        }
        request.set_estimated_completion(*at);
    }
}

impl StreamStackEntry for FileDrive {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn set_context(&mut self, context: Arc<StreamerContext>) {
        self.context = Some(context);
    }

    fn prepare_request(&mut self, request: FileRequestHandle) {
        let Some(context) = self.context.clone() else {
            warn!("{} has no context, dropping request {}", self.config.name, request.id());
            return;
        };
        let is_read = matches!(*request.command(), Command::ReadRequest(_));
        if !is_read {
            context.push_prepared_request(request);
            return;
        }
        if let Err(e) = self.prepare_read(&context, &request) {
            warn!("{} rejected request {}: {}", self.config.name, request.id(), e);
            self.fail(request);
        }
    }

    fn queue_request(&mut self, request: FileRequestHandle) {
        enum Action {
            Read,
            Cancel(RequestId),
            Flush(PathBuf),
            FlushAll,
            Complete,
        }
        let action = match &*request.command() {
            Command::Read(_) | Command::CompressedRead(_) => Action::Read,
            Command::Cancel(cancel) => Action::Cancel(cancel.target),
            Command::Flush(flush) => Action::Flush(flush.path.clone()),
            Command::FlushAll => Action::FlushAll,
            _ => Action::Complete,
        };

        match action {
            Action::Read => {
                self.queue.push_back(request);
                return;
            }
            Action::Cancel(target) => {
                let (canceled, kept): (Vec<_>, Vec<_>) =
                    self.queue.drain(..).partition(|queued| queued.targets(target));
                self.queue = kept.into();
                for queued in canceled {
                    queued.set_status(RequestStatus::Canceled);
                    self.complete(queued);
                }
            }
            Action::Flush(path) => {
                debug!("{} flushing {}", self.config.name, path.display());
                self.close(&path);
            }
            Action::FlushAll => {
                debug!("{} flushing all {} handle(s)", self.config.name, self.handles.len());
                self.close_all();
            }
            Action::Complete => {}
        }
        self.complete(request);
    }

    fn execute_requests(&mut self) -> bool {
        let Some(request) = self.queue.pop_front() else {
            return false;
        };
        match self.read(&request) {
            Ok(bytes) => {
                trace!("{} read {} bytes for request {}", self.config.name, bytes, request.id());
                self.complete(request);
            }
            Err(e) => {
                warn!("{} failed read {}: {}", self.config.name, request.id(), e);
                self.stats.record_failure();
                self.fail(request);
            }
        }
        true
    }

    fn update_status(&self, status: &mut StackStatus) {
        status.merge(self.queue.is_empty(), self.available_slots());
    }

    fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &mut Vec<FileRequestHandle>,
        prepared: &[FileRequestHandle],
    ) {
        let bytes_per_sec = self.read_bytes_per_sec();
        let mut at = now;
        let mut active_file = self.active_file.clone();
        let mut active_offset = self.active_offset;

        for request in &self.queue {
            self.estimate(request, &mut at, &mut active_file, &mut active_offset, bytes_per_sec);
        }
        // Entries above push in top-down order, work happens bottom-up.
        for request in internal_pending.iter().rev() {
            self.estimate(request, &mut at, &mut active_file, &mut active_offset, bytes_per_sec);
        }
        for request in prepared {
            self.estimate(request, &mut at, &mut active_file, &mut active_offset, bytes_per_sec);
        }
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        let name = self.config.name.as_str();
        statistics.push(Statistic::new(
            name,
            "Read speed",
            StatisticValue::BytesPerSecond(self.read_bytes_per_sec()),
        ));
        statistics.push(Statistic::new(
            name,
            "Bytes read",
            StatisticValue::ByteSize(self.stats.bytes_read),
        ));
        statistics.push(Statistic::new(
            name,
            "File open",
            StatisticValue::Duration(self.file_open_cost()),
        ));
        let reads = self.stats.reads_completed + self.stats.reads_failed;
        statistics.push(Statistic::percentage(name, "File switches", self.stats.file_switches, reads));
        statistics.push(Statistic::percentage(name, "Seeks", self.stats.seeks, reads));
        statistics.push(Statistic::integer(name, "Available slots", self.available_slots() as i64));
        statistics.push(Statistic::integer(name, "Open handles", self.handles.len() as i64));
        statistics.push(Statistic::integer(name, "Failed reads", self.stats.reads_failed as i64));
    }
}
