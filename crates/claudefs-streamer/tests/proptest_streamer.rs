//! Property-based tests for claudefs-streamer using proptest.
//!
//! These cover the dispatch comparator, which must be a total order for the
//! prepared queue sort, and the buffer size recommendations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use claudefs_streamer::{
    compare_for_dispatch, prioritize_requests,
    ordering::ReadSnapshot,
    AlignedGranularityPolicy, LocalityState, Order, OrderPriority, Priority, RecommendationLimits,
    Recommendations, RequestId, RequestSnapshot,
};
use proptest::prelude::*;
use std::cmp::Ordering;

fn any_order_priority() -> impl Strategy<Value = OrderPriority> {
    prop_oneof![
        Just(OrderPriority::Idle),
        Just(OrderPriority::Low),
        Just(OrderPriority::Medium),
        Just(OrderPriority::High),
        Just(OrderPriority::Highest),
    ]
}

fn any_path() -> impl Strategy<Value = PathBuf> {
    prop_oneof![
        Just(PathBuf::from("/data/a.bin")),
        Just(PathBuf::from("/data/b.bin")),
        Just(PathBuf::from("/data/c.bin")),
    ]
}

/// Read info with a small value range so ties show up often.
fn any_read(base: Instant) -> impl Strategy<Value = ReadSnapshot> {
    (
        any::<bool>(),
        0u8..4,
        proptest::option::of(0u64..4),
        proptest::option::of((any_path(), 0u64..4)),
    )
        .prop_map(move |(in_panic, priority, deadline, location)| ReadSnapshot {
            in_panic,
            priority: Priority(priority),
            // Panicking reads always have a deadline.
            deadline: match (in_panic, deadline) {
                (true, None) => Some(base),
                (_, deadline) => deadline.map(|ms| base + Duration::from_millis(ms)),
            },
            location: location.map(|(path, offset)| (path, offset * 1024)),
        })
}

fn any_snapshots(base: Instant) -> impl Strategy<Value = Vec<RequestSnapshot>> {
    proptest::collection::vec(
        (any_order_priority(), proptest::option::of(any_read(base))),
        1..24,
    )
    .prop_map(|entries| {
        entries
            .into_iter()
            .enumerate()
            .map(|(index, (order_priority, read))| RequestSnapshot {
                id: RequestId(index as u64 + 1),
                order_priority,
                // Only reads carry read information.
                read: if order_priority == OrderPriority::Medium { read } else { None },
            })
            .collect()
    })
}

fn any_locality() -> impl Strategy<Value = LocalityState> {
    proptest::option::of((any_path(), 0u64..4)).prop_map(|state| match state {
        Some((file, offset)) => LocalityState {
            file: Some(file),
            offset: offset * 1024,
        },
        None => LocalityState::default(),
    })
}

proptest! {
    /// Comparing A with B and B with A always gives opposite answers, and a
    /// request is never ordered before itself.
    #[test]
    fn test_comparator_antisymmetric(
        snapshots in any_snapshots(Instant::now()),
        locality in any_locality(),
    ) {
        for a in &snapshots {
            prop_assert_eq!(compare_for_dispatch(a, a, &locality), Ordering::Equal);
            prop_assert_eq!(prioritize_requests(a, a, &locality), Order::Equal);
            for b in &snapshots {
                if a.id == b.id {
                    continue;
                }
                let forward = compare_for_dispatch(a, b, &locality);
                let backward = compare_for_dispatch(b, a, &locality);
                prop_assert_ne!(forward, Ordering::Equal);
                prop_assert_eq!(forward, backward.reverse());
            }
        }
    }

    /// The order is transitive, so sorting yields a sequence where every
    /// element precedes all later ones.
    #[test]
    fn test_comparator_transitive(
        snapshots in any_snapshots(Instant::now()),
        locality in any_locality(),
    ) {
        let mut sorted = snapshots.clone();
        sorted.sort_by(|a, b| compare_for_dispatch(a, b, &locality));
        for (i, earlier) in sorted.iter().enumerate() {
            for later in &sorted[i + 1..] {
                prop_assert_eq!(compare_for_dispatch(earlier, later, &locality), Ordering::Less);
            }
        }
    }

    /// Sorting is deterministic regardless of the input order.
    #[test]
    fn test_sort_independent_of_input_order(
        snapshots in any_snapshots(Instant::now()),
        locality in any_locality(),
    ) {
        let mut forward = snapshots.clone();
        forward.sort_by(|a, b| compare_for_dispatch(a, b, &locality));
        let mut backward: Vec<_> = snapshots.into_iter().rev().collect();
        backward.sort_by(|a, b| compare_for_dispatch(a, b, &locality));
        let forward_ids: Vec<RequestId> = forward.iter().map(|s| s.id).collect();
        let backward_ids: Vec<RequestId> = backward.iter().map(|s| s.id).collect();
        prop_assert_eq!(forward_ids, backward_ids);
    }

    /// Higher command classes are always dispatched first.
    #[test]
    fn test_class_dominates(
        snapshots in any_snapshots(Instant::now()),
        locality in any_locality(),
    ) {
        let mut sorted = snapshots;
        sorted.sort_by(|a, b| compare_for_dispatch(a, b, &locality));
        for pair in sorted.windows(2) {
            prop_assert!(pair[0].order_priority >= pair[1].order_priority);
        }
    }

    /// Recommended sizes cover the request, respect the size alignment and
    /// never shrink when the request grows.
    #[test]
    fn test_recommended_size_monotonic_and_aligned(
        alignment_shift in 0u32..14,
        granularity in 1u64..(8 * 1024 * 1024),
        offset in 0u64..(1 << 30),
        size in 1u64..(64 * 1024 * 1024),
        extra in 0u64..(4 * 1024 * 1024),
    ) {
        let size_alignment = 1u64 << alignment_shift;
        let recs = Recommendations::new(
            RecommendationLimits {
                memory_alignment: 4096,
                size_alignment,
                granularity,
            },
            8,
            Arc::new(AlignedGranularityPolicy),
        )
        .unwrap();

        let small = recs.calculate_recommended_memory_size(size, offset).unwrap();
        let large = recs.calculate_recommended_memory_size(size + extra, offset).unwrap();
        prop_assert!(small >= size);
        prop_assert_eq!(small % size_alignment, 0);
        prop_assert_eq!(large % size_alignment, 0);
        prop_assert!(large >= small);
    }
}
