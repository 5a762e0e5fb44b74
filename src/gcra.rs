//! Leaky bucket decision kernel, GCRA-style.
//!
//! A bucket's entire persistent state is one timestamp: the theoretical
//! arrival time (TAT), the earliest moment at which the bucket would be full
//! again if no further requests arrived. A TAT at or before "now" is a full
//! bucket; every unit of cost pushes the TAT one emission interval further
//! into the future, up to `burst` intervals ahead of now.

use std::time::Duration;

use crate::limits::Limit;

/// Result of evaluating a spend or refund against a single bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// True if the bucket possessed enough capacity to allow the request
    /// given the cost.
    pub allowed: bool,

    /// Number of requests the client may make before being rate limited.
    pub remaining: i64,

    /// Duration the client must wait before a request of this cost would be
    /// allowed. Zero whenever `allowed` is true.
    pub retry_in: Duration,

    /// Duration until the bucket refills to its maximum capacity, assuming
    /// no further requests are made.
    pub reset_in: Duration,

    /// The TAT that would be persisted if this decision were committed, in
    /// nanoseconds since the UNIX epoch. Never more than
    /// `burst * emission_interval` in the future.
    pub(crate) new_tat: i64,
}

impl Decision {
    /// The synthetic allowed decision returned for a disabled limit.
    pub(crate) fn disabled() -> Self {
        Self {
            allowed: true,
            remaining: 0,
            retry_in: Duration::ZERO,
            reset_in: Duration::ZERO,
            new_tat: 0,
        }
    }
}

/// Evaluate a spend of `cost` against the bucket state `stored_tat`.
///
/// Callers must have rejected `cost > limit.burst()` already; a zero cost is
/// a pure capacity check and always allows.
pub(crate) fn maybe_spend(limit: &Limit, stored_tat: i64, now: i64, cost: i64) -> Decision {
    let increment = cost.saturating_mul(limit.emission_interval());
    let effective_tat = stored_tat.max(now);
    let candidate_tat = effective_tat.saturating_add(increment);
    let threshold_tat = now.saturating_add(limit.burst_offset());

    if candidate_tat > threshold_tat {
        // Not enough capacity has accrued. The stored TAT is left untouched.
        return Decision {
            allowed: false,
            remaining: remaining_capacity(limit, threshold_tat, effective_tat),
            retry_in: duration_from_nanos(candidate_tat.saturating_sub(threshold_tat)),
            reset_in: duration_from_nanos(effective_tat.saturating_sub(now)),
            new_tat: stored_tat,
        };
    }

    Decision {
        allowed: true,
        remaining: remaining_capacity(limit, threshold_tat, candidate_tat),
        retry_in: Duration::ZERO,
        reset_in: duration_from_nanos(candidate_tat.saturating_sub(now)),
        new_tat: candidate_tat,
    }
}

/// Evaluate a refund of up to `cost` against the bucket state `stored_tat`.
///
/// The refund cannot push the TAT below now, so a bucket never exceeds its
/// maximum capacity; partial refunds are allowed and count as successful.
pub(crate) fn maybe_refund(limit: &Limit, stored_tat: i64, now: i64, cost: i64) -> Decision {
    let threshold_tat = now.saturating_add(limit.burst_offset());

    if stored_tat <= now {
        // Already at maximum capacity, nothing to return.
        return Decision {
            allowed: false,
            remaining: remaining_capacity(limit, threshold_tat, now),
            retry_in: Duration::ZERO,
            reset_in: Duration::ZERO,
            new_tat: stored_tat,
        };
    }

    let refund = cost.saturating_mul(limit.emission_interval());
    let candidate_tat = now.max(stored_tat.saturating_sub(refund));

    Decision {
        allowed: true,
        remaining: remaining_capacity(limit, threshold_tat, candidate_tat),
        retry_in: Duration::ZERO,
        reset_in: duration_from_nanos(candidate_tat.saturating_sub(now)),
        new_tat: candidate_tat,
    }
}

fn remaining_capacity(limit: &Limit, threshold_tat: i64, tat: i64) -> i64 {
    let headroom = threshold_tat.saturating_sub(tat);
    (headroom / limit.emission_interval()).clamp(0, limit.burst())
}

fn duration_from_nanos(nanos: i64) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}
