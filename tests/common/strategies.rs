use std::time::Duration;

use dlq_reprocessor::classifier::FailureKind;
use dlq_reprocessor::scheduler::BackoffPolicy;
use proptest::prelude::*;

/// Strategy for backoff policies with realistic bounds
pub fn backoff_policy_strategy() -> impl Strategy<Value = BackoffPolicy> {
    (1u64..5_000, 1u64..600_000, 1.0f64..5.0, 0.0f64..=1.0).prop_map(
        |(base_ms, max_ms, multiplier, jitter)| {
            BackoffPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
                multiplier,
                jitter,
            )
        },
    )
}

/// Failure kinds the scheduler redelivers or quarantines
pub fn failure_kind_strategy() -> impl Strategy<Value = FailureKind> {
    prop_oneof![
        Just(FailureKind::Transient),
        Just(FailureKind::Unknown),
        Just(FailureKind::Poison),
    ]
}

/// After each mainline delivery, how many stale or repeated deliveries follow
pub fn duplicate_pattern_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..4, 1..12)
}
