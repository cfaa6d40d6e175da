//! Output buffer allocation for read requests.
//!
//! Reads that are queued without a caller-supplied buffer carry a
//! [`MemoryAllocator`]. The scheduler locks the allocator when it pulls such a
//! read in, asks it for a buffer right before the read is handed to the
//! processing stack, and unlocks it once the read retires.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Kind of memory a read buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryType {
    /// Regular cached memory the CPU reads and writes.
    #[default]
    ReadWrite,
    /// Write-combined memory, fast to fill but slow for the CPU to read back.
    WriteCombined,
}

/// A buffer handed out by a [`MemoryAllocator`].
#[derive(Debug)]
pub struct Allocation {
    /// The buffer itself. Its length is at least the requested minimum size.
    pub buffer: Vec<u8>,
    /// Usable size in bytes as reported by the allocator.
    pub size: u64,
    /// Kind of memory the buffer lives in.
    pub memory_type: MemoryType,
}

/// Allocator interface used to obtain output buffers for reads.
pub trait MemoryAllocator: Send + Sync {
    /// Called when a read that depends on this allocator enters the scheduler.
    fn lock_allocator(&self);

    /// Called when a read that depends on this allocator retires.
    fn unlock_allocator(&self);

    /// Allocate a buffer of at least `min_size` bytes.
    ///
    /// `recommended_size` is a hint that reduces re-reads and fragmentation;
    /// allocators are free to ignore it. Returning `None` or a buffer smaller
    /// than `min_size` fails the read.
    fn allocate(&self, min_size: u64, recommended_size: u64, alignment: u64) -> Option<Allocation>;
}

/// Statistics for the heap allocator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeapAllocatorStats {
    /// Number of successful allocations.
    pub allocations: u64,
    /// Total bytes handed out.
    pub bytes_allocated: u64,
    /// Number of allocations that were refused.
    pub failures: u64,
}

/// Allocator backed by the global heap.
///
/// Buffers are zero-filled `Vec<u8>`s sized to the recommended size. The
/// alignment argument is recorded but not enforced since `Vec<u8>` storage is
/// byte aligned.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    max_allocation: Option<u64>,
    active_locks: AtomicU64,
    stats: Mutex<HeapAllocatorStats>,
}

impl HeapAllocator {
    /// Create a heap allocator without a size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a heap allocator that refuses any allocation above `max_allocation` bytes.
    pub fn with_limit(max_allocation: u64) -> Self {
        Self {
            max_allocation: Some(max_allocation),
            ..Self::default()
        }
    }

    /// Number of reads currently holding a lock on this allocator.
    pub fn active_locks(&self) -> u64 {
        self.active_locks.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the allocator statistics.
    pub fn stats(&self) -> HeapAllocatorStats {
        self.stats.lock().clone()
    }
}

impl MemoryAllocator for HeapAllocator {
    fn lock_allocator(&self) {
        self.active_locks.fetch_add(1, Ordering::AcqRel);
    }

    fn unlock_allocator(&self) {
        let previous = self.active_locks.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            warn!("Heap allocator unlocked more often than it was locked");
            self.active_locks.store(0, Ordering::Release);
        }
    }

    fn allocate(&self, min_size: u64, recommended_size: u64, alignment: u64) -> Option<Allocation> {
        let mut size = recommended_size.max(min_size);
        if let Some(max) = self.max_allocation {
            // Trim the recommendation to the limit but never below the minimum.
            size = size.min(max.max(min_size));
        }
        let refused = self.max_allocation.is_some_and(|max| min_size > max);
        let len = match usize::try_from(size) {
            Ok(len) if !refused => len,
            _ => {
                self.stats.lock().failures += 1;
                debug!(
                    "Heap allocation refused: min_size={}, recommended_size={}, limit={:?}",
                    min_size, recommended_size, self.max_allocation
                );
                return None;
            }
        };

        let mut buffer = Vec::new();
        if let Err(e) = buffer.try_reserve_exact(len) {
            self.stats.lock().failures += 1;
            warn!("Heap allocation of {} bytes failed: {}", size, e);
            return None;
        }
        buffer.resize(len, 0);

        {
            let mut stats = self.stats.lock();
            stats.allocations += 1;
            stats.bytes_allocated = stats.bytes_allocated.saturating_add(size);
        }

        debug!(
            "Heap allocation: size={}, min_size={}, alignment={}",
            size, min_size, alignment
        );
        Some(Allocation {
            buffer,
            size,
            memory_type: MemoryType::ReadWrite,
        })
    }
}
