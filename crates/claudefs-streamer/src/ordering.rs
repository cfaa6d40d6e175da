//! Dispatch order of prepared requests.
//!
//! Requests are compared in this precedence: command class, deadline panic,
//! file locality. Ties fall back to the request id. Every schedule pass takes
//! a fresh [`RequestSnapshot`] of each prepared request so the values the sort
//! sees cannot change halfway through it.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::request::{Command, FileRequestHandle, OrderPriority, Priority, RequestId};

/// Outcome of comparing two requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// The first request should be dispatched first.
    FirstRequest,
    /// The second request should be dispatched first.
    SecondRequest,
    /// No preference.
    Equal,
}

/// File and end offset of the last dispatched read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalityState {
    /// File of the last read, if any read was dispatched yet.
    pub file: Option<PathBuf>,
    /// Offset right after the last read.
    pub offset: u64,
}

impl LocalityState {
    /// Records a dispatched read ending at `end_offset` in `file`.
    pub fn record(&mut self, file: &Path, end_offset: u64) {
        if self.file.as_deref() != Some(file) {
            self.file = Some(file.to_path_buf());
        }
        self.offset = end_offset;
    }

    /// Records where the drive head ends up after `command` is dispatched.
    ///
    /// Compressed reads always consume their whole archive entry, so the
    /// position is the end of the entry in the archive.
    pub fn record_dispatch(&mut self, command: &Command) {
        match command {
            Command::Read(read) => self.record(&read.path, read.offset.saturating_add(read.size)),
            Command::CompressedRead(read) => {
                let info = &read.compression_info;
                self.record(&info.archive_path, info.offset.saturating_add(info.compressed_size));
            }
            _ => {}
        }
    }

    fn seek_distance(&self, file: &Path, offset: u64) -> Option<u64> {
        match &self.file {
            Some(current) if current.as_path() == file => Some(self.offset.abs_diff(offset)),
            _ => None,
        }
    }
}

/// Read related values of a request, taken from its read request ancestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSnapshot {
    /// Estimated completion is past the deadline.
    pub in_panic: bool,
    /// Priority of the read request.
    pub priority: Priority,
    /// Deadline of the read request.
    pub deadline: Option<Instant>,
    /// File and offset this request reads from.
    pub location: Option<(PathBuf, u64)>,
}

/// Values of a prepared request the comparator looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSnapshot {
    /// Request id, the final tie-break.
    pub id: RequestId,
    /// Class of the request's command.
    pub order_priority: OrderPriority,
    /// Present for reads that belong to a read request.
    pub read: Option<ReadSnapshot>,
}

impl RequestSnapshot {
    /// Captures the current values of `request`.
    pub fn capture(request: &FileRequestHandle) -> Self {
        let (order_priority, location) = {
            let command = request.command();
            (
                command.order_priority(),
                command
                    .read_location()
                    .map(|(path, offset)| (path.to_path_buf(), offset)),
            )
        };

        // Only reads carry read information so every other class stays ordered by id.
        let read = if order_priority == OrderPriority::Medium {
            request.find_read_request().and_then(|parent| {
                let estimate = request.estimated_completion();
                let snapshot = match &*parent.command() {
                    Command::ReadRequest(read) => Some(ReadSnapshot {
                        in_panic: read.is_in_panic(estimate),
                        priority: read.priority,
                        deadline: read.deadline,
                        location,
                    }),
                    _ => None,
                };
                snapshot
            })
        } else {
            None
        };

        Self {
            id: request.id(),
            order_priority,
            read,
        }
    }
}

/// Decides which of two requests should be dispatched first.
pub fn prioritize_requests(
    first: &RequestSnapshot,
    second: &RequestSnapshot,
    locality: &LocalityState,
) -> Order {
    match first.order_priority.cmp(&second.order_priority) {
        Ordering::Greater => return Order::FirstRequest,
        Ordering::Less => return Order::SecondRequest,
        Ordering::Equal => {}
    }

    let (Some(first_read), Some(second_read)) = (&first.read, &second.read) else {
        return Order::Equal;
    };

    match (first_read.in_panic, second_read.in_panic) {
        (true, true) => {
            if first_read.priority.is_more_urgent_than(second_read.priority) {
                return Order::FirstRequest;
            }
            if second_read.priority.is_more_urgent_than(first_read.priority) {
                return Order::SecondRequest;
            }
            return by_smaller(first_read.deadline, second_read.deadline);
        }
        (true, false) => return Order::FirstRequest,
        (false, true) => return Order::SecondRequest,
        (false, false) => {}
    }

    let distance = |read: &ReadSnapshot| {
        read.location
            .as_ref()
            .and_then(|(path, offset)| locality.seek_distance(path, *offset))
    };
    match (distance(first_read), distance(second_read)) {
        (Some(first_distance), Some(second_distance)) => by_smaller(first_distance, second_distance),
        (Some(_), None) => Order::FirstRequest,
        (None, Some(_)) => Order::SecondRequest,
        (None, None) => Order::Equal,
    }
}

fn by_smaller<T: Ord>(first: T, second: T) -> Order {
    match first.cmp(&second) {
        Ordering::Less => Order::FirstRequest,
        Ordering::Greater => Order::SecondRequest,
        Ordering::Equal => Order::Equal,
    }
}

/// Total order used to sort the prepared queue, most urgent first.
///
/// Falls back to reads before requests without read information, then to the
/// lower id. Returns `Equal` only when a snapshot is compared with itself.
pub fn compare_for_dispatch(
    first: &RequestSnapshot,
    second: &RequestSnapshot,
    locality: &LocalityState,
) -> Ordering {
    match prioritize_requests(first, second, locality) {
        Order::FirstRequest => Ordering::Less,
        Order::SecondRequest => Ordering::Greater,
        Order::Equal => second
            .read
            .is_some()
            .cmp(&first.read.is_some())
            .then_with(|| first.id.cmp(&second.id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CompressedReadData, CompressionInfo, ReadData};
    use std::time::Duration;

    fn read(id: u64, path: &str, offset: u64) -> RequestSnapshot {
        RequestSnapshot {
            id: RequestId(id),
            order_priority: OrderPriority::Medium,
            read: Some(ReadSnapshot {
                in_panic: false,
                priority: Priority::NORMAL,
                deadline: None,
                location: Some((PathBuf::from(path), offset)),
            }),
        }
    }

    fn panicking(mut snapshot: RequestSnapshot, priority: Priority, deadline: Instant) -> RequestSnapshot {
        if let Some(read) = snapshot.read.as_mut() {
            read.in_panic = true;
            read.priority = priority;
            read.deadline = Some(deadline);
        }
        snapshot
    }

    fn command(id: u64, order_priority: OrderPriority) -> RequestSnapshot {
        RequestSnapshot {
            id: RequestId(id),
            order_priority,
            read: None,
        }
    }

    #[test]
    fn test_class_priority_wins() {
        let locality = LocalityState::default();
        let cancel = command(5, OrderPriority::Highest);
        let deadline = Instant::now();
        let urgent_read = panicking(read(1, "/a", 0), Priority::HIGHEST, deadline);
        assert_eq!(
            prioritize_requests(&cancel, &urgent_read, &locality),
            Order::FirstRequest
        );
        assert_eq!(
            prioritize_requests(&command(1, OrderPriority::Idle), &command(2, OrderPriority::Low), &locality),
            Order::SecondRequest
        );
    }

    #[test]
    fn test_panic_beats_priority_and_locality() {
        let locality = LocalityState {
            file: Some(PathBuf::from("/a")),
            offset: 0,
        };
        let calm = RequestSnapshot {
            read: Some(ReadSnapshot {
                priority: Priority::HIGHEST,
                ..read(1, "/a", 0).read.unwrap()
            }),
            ..read(1, "/a", 0)
        };
        let late = panicking(read(2, "/b", 9000), Priority::LOWEST, Instant::now());
        assert_eq!(prioritize_requests(&late, &calm, &locality), Order::FirstRequest);
        assert_eq!(prioritize_requests(&calm, &late, &locality), Order::SecondRequest);
    }

    #[test]
    fn test_both_panicking_uses_priority_then_deadline() {
        let locality = LocalityState::default();
        let now = Instant::now();
        let a = panicking(read(1, "/a", 0), Priority(10), now);
        let b = panicking(read(2, "/a", 0), Priority(5), now + Duration::from_secs(1));
        assert_eq!(prioritize_requests(&a, &b, &locality), Order::SecondRequest);

        let c = panicking(read(3, "/a", 0), Priority(5), now);
        assert_eq!(prioritize_requests(&b, &c, &locality), Order::SecondRequest);

        let d = panicking(read(4, "/b", 0), Priority(5), now);
        assert_eq!(prioritize_requests(&c, &d, &locality), Order::Equal);
    }

    #[test]
    fn test_locality_prefers_smaller_seek() {
        let locality = LocalityState {
            file: Some(PathBuf::from("/a")),
            offset: 1000,
        };
        let near = read(2, "/a", 1100);
        let far = read(1, "/a", 5000);
        let other = read(0, "/b", 1000);
        assert_eq!(prioritize_requests(&near, &far, &locality), Order::FirstRequest);
        assert_eq!(prioritize_requests(&other, &far, &locality), Order::SecondRequest);
        assert_eq!(
            prioritize_requests(&other, &read(7, "/c", 0), &locality),
            Order::Equal
        );
        // Seeking backwards counts the same as seeking forward.
        assert_eq!(
            prioritize_requests(&read(3, "/a", 900), &read(4, "/a", 1100), &locality),
            Order::Equal
        );
    }

    #[test]
    fn test_no_locality_without_previous_read() {
        let locality = LocalityState::default();
        assert_eq!(
            prioritize_requests(&read(1, "/a", 0), &read(2, "/a", 100), &locality),
            Order::Equal
        );
    }

    #[test]
    fn test_missing_read_info_is_equal() {
        let locality = LocalityState::default();
        let orphan = command(1, OrderPriority::Medium);
        let late = panicking(read(2, "/a", 0), Priority::HIGHEST, Instant::now());
        assert_eq!(prioritize_requests(&orphan, &late, &locality), Order::Equal);
        // The tie-break still sorts reads with read information first.
        assert_eq!(compare_for_dispatch(&orphan, &late, &locality), Ordering::Greater);
    }

    #[test]
    fn test_tie_break_by_id() {
        let locality = LocalityState::default();
        let a = command(1, OrderPriority::High);
        let b = command(2, OrderPriority::High);
        assert_eq!(compare_for_dispatch(&a, &b, &locality), Ordering::Less);
        assert_eq!(compare_for_dispatch(&b, &a, &locality), Ordering::Greater);
        assert_eq!(compare_for_dispatch(&a, &a, &locality), Ordering::Equal);
    }

    #[test]
    fn test_sort_dispatch_order() {
        let locality = LocalityState {
            file: Some(PathBuf::from("/a")),
            offset: 100,
        };
        let now = Instant::now();
        let mut snapshots = vec![
            read(1, "/b", 0),
            read(2, "/a", 5000),
            command(3, OrderPriority::Low),
            read(4, "/a", 200),
            command(5, OrderPriority::Highest),
            panicking(read(6, "/c", 0), Priority::NORMAL, now),
        ];
        snapshots.sort_by(|a, b| compare_for_dispatch(a, b, &locality));
        let ids: Vec<u64> = snapshots.iter().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![5, 6, 4, 2, 1, 3]);
    }

    #[test]
    fn test_locality_record() {
        let mut locality = LocalityState::default();
        locality.record(Path::new("/a"), 4096);
        assert_eq!(locality.file.as_deref(), Some(Path::new("/a")));
        assert_eq!(locality.offset, 4096);
        locality.record(Path::new("/b"), 10);
        assert_eq!(locality.file.as_deref(), Some(Path::new("/b")));
        assert_eq!(locality.offset, 10);
    }

    #[test]
    fn test_locality_after_dispatch() {
        let mut locality = LocalityState::default();
        locality.record_dispatch(&Command::Read(ReadData {
            path: PathBuf::from("/a"),
            offset: 100,
            size: 50,
            output_offset: 0,
        }));
        assert_eq!(locality.offset, 150);

        locality.record_dispatch(&Command::CompressedRead(CompressedReadData {
            compression_info: CompressionInfo {
                archive_path: PathBuf::from("/pack.arc"),
                offset: 8192,
                compressed_size: 700,
                uncompressed_size: 4000,
                is_compressed: true,
            },
            read_offset: 1000,
            read_size: 2000,
            output_offset: 0,
        }));
        assert_eq!(locality.file.as_deref(), Some(Path::new("/pack.arc")));
        assert_eq!(locality.offset, 8892);

        // Commands that do not read leave the position alone.
        locality.record_dispatch(&Command::FlushAll);
        assert_eq!(locality.offset, 8892);

        locality.record_dispatch(&Command::Read(ReadData {
            path: PathBuf::from("/a"),
            offset: u64::MAX - 1,
            size: 10,
            output_offset: 0,
        }));
        assert_eq!(locality.offset, u64::MAX);
    }
}
