//! Buffer size and concurrency recommendations derived from the processing stack.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{StreamerError, StreamerResult};

/// Rounds `value` up to a multiple of `alignment`. `alignment` must be a power of two.
///
/// Returns `None` when the result does not fit in a `u64`.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|value| value & !(alignment - 1))
}

/// Rounds `value` down to a multiple of `alignment`. `alignment` must be a power of two.
#[inline]
pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Policy that turns a requested read into a recommended buffer size.
///
/// Implementations must be monotonic in `size` for a fixed `offset`, never
/// return less than `size`, and always return a multiple of the size alignment.
pub trait MemorySizePolicy: Send + Sync {
    /// Recommended buffer size for a read of `size` bytes at `offset`, or
    /// `None` if no such buffer size can be represented.
    fn recommended_size(&self, size: u64, offset: u64, limits: &RecommendationLimits) -> Option<u64>;
}

/// Default policy: cover the aligned read window, then round large reads up to
/// whole granularity blocks so buffers can be recycled between reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlignedGranularityPolicy;

impl MemorySizePolicy for AlignedGranularityPolicy {
    fn recommended_size(&self, size: u64, offset: u64, limits: &RecommendationLimits) -> Option<u64> {
        let size_alignment = limits.size_alignment;
        let leading = offset - align_down(offset, size_alignment);
        let aligned = align_up(size.checked_add(leading)?, size_alignment)?;
        let granularity = align_up(limits.granularity.max(1), size_alignment)?;
        if aligned <= granularity {
            Some(aligned)
        } else {
            aligned.div_ceil(granularity).checked_mul(granularity)
        }
    }
}

/// Alignment and granularity values the recommendations are computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationLimits {
    /// Required alignment of output buffer addresses.
    pub memory_alignment: u64,
    /// Required alignment of read sizes.
    pub size_alignment: u64,
    /// Block size reads are grouped into.
    pub granularity: u64,
}

/// Immutable recommendations published by the scheduler.
#[derive(Clone)]
pub struct Recommendations {
    limits: RecommendationLimits,
    max_concurrent_requests: usize,
    policy: Arc<dyn MemorySizePolicy>,
}

impl Recommendations {
    /// Builds recommendations, rejecting alignments that are not powers of two.
    pub fn new(
        limits: RecommendationLimits,
        max_concurrent_requests: usize,
        policy: Arc<dyn MemorySizePolicy>,
    ) -> StreamerResult<Self> {
        if !limits.memory_alignment.is_power_of_two() {
            return Err(StreamerError::InvalidAlignment {
                name: "memory alignment",
                value: limits.memory_alignment,
            });
        }
        if !limits.size_alignment.is_power_of_two() {
            return Err(StreamerError::InvalidAlignment {
                name: "size alignment",
                value: limits.size_alignment,
            });
        }
        Ok(Self {
            limits,
            max_concurrent_requests,
            policy,
        })
    }

    /// Required alignment of output buffer addresses.
    #[inline]
    pub fn memory_alignment(&self) -> u64 {
        self.limits.memory_alignment
    }

    /// Required alignment of read sizes.
    #[inline]
    pub fn size_alignment(&self) -> u64 {
        self.limits.size_alignment
    }

    /// Block size reads are grouped into.
    #[inline]
    pub fn granularity(&self) -> u64 {
        self.limits.granularity
    }

    /// Number of requests the processing stack accepts at once.
    #[inline]
    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    /// Returns the raw limits.
    #[inline]
    pub fn limits(&self) -> &RecommendationLimits {
        &self.limits
    }

    /// Recommended output buffer size for a read of `size` bytes at `offset`.
    ///
    /// Returns `None` when the aligned window around the read does not fit in
    /// a `u64`.
    pub fn calculate_recommended_memory_size(&self, size: u64, offset: u64) -> Option<u64> {
        if size == 0 {
            return Some(0);
        }
        let recommended = self.policy.recommended_size(size, offset, &self.limits)?;
        // Keep the contract even for sloppy custom policies.
        align_up(recommended.max(size), self.limits.size_alignment)
    }
}

impl fmt::Debug for Recommendations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recommendations")
            .field("memory_alignment", &self.limits.memory_alignment)
            .field("size_alignment", &self.limits.size_alignment)
            .field("granularity", &self.limits.granularity)
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .finish()
    }
}
