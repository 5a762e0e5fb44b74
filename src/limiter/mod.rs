use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::bucket::{Bucket, BucketWithCost};
use crate::clock::{Clock, SystemClock};
use crate::errors::{LimiterError, Result};
use crate::gcra::{maybe_refund, maybe_spend, Decision};
use crate::limits::{Limit, Limits, Name};
use crate::metrics;
use crate::source::{Source, SourceError};

/// High-level interface for rate limiting requests with a leaky bucket-style
/// approach over shared storage.
///
/// The limiter itself is stateless beyond its immutable limit registries;
/// all mutable state lives in the source, which must be safe for concurrent
/// use. Many request handlers may call one limiter concurrently.
pub struct Limiter<S: Source + 'static> {
    /// Default limits by limit name.
    defaults: Limits,

    /// Override limits by bucket key (`"<name>:<id>"`).
    overrides: Limits,

    source: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: Source + 'static> Limiter<S> {
    pub fn new(source: Arc<S>, defaults: Limits, overrides: Limits) -> Self {
        Self::with_clock(source, defaults, overrides, Arc::new(SystemClock))
    }

    /// Construct a limiter reading time from the provided clock. Tests use
    /// this with a fake clock to exercise refill behavior without sleeping.
    pub fn with_clock(
        source: Arc<S>,
        defaults: Limits,
        overrides: Limits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            defaults,
            overrides,
            source,
            clock,
        }
    }

    /// Check whether the bucket could satisfy the cost WITHOUT deducting it.
    ///
    /// The returned decision represents the hypothetical state of the bucket
    /// if the cost were spent. No bucket is created and no state is written.
    pub async fn check(&self, txn: &BucketWithCost) -> Result<Decision> {
        if txn.cost() < 0 {
            return Err(LimiterError::InvalidCheckCost);
        }

        let Some(limit) = self.resolve_limit(txn.name(), txn.key()) else {
            return Ok(Decision::disabled());
        };
        if txn.cost() > limit.burst() {
            return Err(LimiterError::CostOverLimit);
        }
        let limit = limit.clone();

        let stored_tat = match self.fetch(txn.key()).await {
            Ok(tat) => Some(tat),
            Err(SourceError::NotFound) => None,
            Err(err) => return Err(err.into()),
        };

        let now = self.clock.now_nanos();
        // A missing bucket is a full bucket; a TAT of now is equivalent.
        Ok(maybe_spend(&limit, stored_tat.unwrap_or(now), now, txn.cost()))
    }

    /// Deduct the cost from the bucket's capacity and persist the new state.
    ///
    /// If no bucket exists it is created with the cost folded into its
    /// initial state, so the first request from a subject always succeeds
    /// provided the cost fits within the burst. A denial writes nothing.
    pub async fn spend(&self, txn: &BucketWithCost) -> Result<Decision> {
        if txn.cost() <= 0 {
            return Err(LimiterError::InvalidCost);
        }

        let Some(limit) = self.resolve_limit(txn.name(), txn.key()) else {
            return Ok(Decision::disabled());
        };
        if txn.cost() > limit.burst() {
            return Err(LimiterError::CostOverLimit);
        }
        let limit = limit.clone();

        let start = Instant::now();
        let result = self.spend_inner(&limit, txn).await;
        metrics::record_spend_latency(
            txn.name().as_str(),
            decision_label(&result),
            start.elapsed(),
        );
        result
    }

    async fn spend_inner(&self, limit: &Limit, txn: &BucketWithCost) -> Result<Decision> {
        let stored_tat = match self.fetch(txn.key()).await {
            Ok(tat) => Some(tat),
            Err(SourceError::NotFound) => None,
            Err(err) => return Err(err.into()),
        };

        let now = self.clock.now_nanos();
        let Some(stored_tat) = stored_tat else {
            // First request from this subject.
            let d = maybe_spend(limit, now, now, txn.cost());
            self.persist(txn.key(), d.new_tat).await?;
            return Ok(d);
        };

        let d = maybe_spend(limit, stored_tat, now, txn.cost());

        if limit.is_override() {
            let utilization = (limit.burst() - d.remaining) as f64 / limit.burst() as f64;
            metrics::set_override_utilization(txn.name().as_str(), txn.key(), utilization);
        }

        if !d.allowed {
            debug!(key = txn.key(), cost = txn.cost(), "rate limit exceeded");
            return Ok(d);
        }

        self.persist(txn.key(), d.new_tat).await?;
        Ok(d)
    }

    /// Deduct each bucket's cost in a single round trip per direction.
    ///
    /// The consolidated decision is allowed only if every evaluated bucket
    /// allowed; `remaining` is the minimum and the durations are the maxima
    /// across buckets. State is persisted only on unanimous allow: if any
    /// bucket would be denied, no bucket in the batch is written.
    pub async fn batch_spend(&self, txns: &[BucketWithCost]) -> Result<Decision> {
        if txns.is_empty() {
            return Err(LimiterError::EmptyBatch);
        }
        let mut keys = Vec::with_capacity(txns.len());
        for txn in txns {
            if txn.cost() <= 0 {
                return Err(LimiterError::InvalidCost);
            }
            keys.push(txn.key().to_string());
        }

        let start = Instant::now();
        let source = Arc::clone(&self.source);
        let tats = detached(async move { source.batch_get(&keys).await }).await?;

        // One "now" for the whole batch, so buckets are judged consistently.
        let now = self.clock.now_nanos();
        let mut names = BTreeSet::new();
        let mut new_tats: HashMap<String, i64> = HashMap::new();
        let mut consolidated = Consolidated::new(true);

        for txn in txns {
            let Some(limit) = self.resolve_limit(txn.name(), txn.key()) else {
                continue;
            };
            if txn.cost() > limit.burst() {
                return Err(LimiterError::CostOverLimit);
            }
            names.insert(txn.name().as_str());

            // Missing and zero-valued TATs both mean a full bucket.
            let stored_tat = match tats.get(txn.key()) {
                Some(&tat) if tat != 0 => tat,
                _ => now,
            };
            let d = maybe_spend(limit, stored_tat, now, txn.cost());
            if d.allowed {
                new_tats.insert(txn.key().to_string(), d.new_tat);
            }

            if limit.is_override() {
                let utilization = (limit.burst() - d.remaining) as f64 / limit.burst() as f64;
                metrics::set_override_utilization(txn.name().as_str(), txn.key(), utilization);
            }

            consolidated.all_allowed(&d);
        }

        let result = async {
            if consolidated.allowed && !new_tats.is_empty() {
                let source = Arc::clone(&self.source);
                detached(async move { source.batch_set(&new_tats).await }).await?;
            }
            Ok(consolidated.into_decision())
        }
        .await;

        let label = names.into_iter().collect::<Vec<_>>().join(",");
        metrics::record_spend_latency(&label, decision_label(&result), start.elapsed());
        result
    }

    /// Return up to `cost` of quota to the bucket.
    ///
    /// The refund cannot push the bucket past its maximum capacity; partial
    /// refunds are successful. A missing bucket is equivalent to a full one
    /// and is skipped without error or write.
    pub async fn refund(&self, txn: &BucketWithCost) -> Result<Decision> {
        if txn.cost() <= 0 {
            return Err(LimiterError::InvalidCost);
        }

        let Some(limit) = self.resolve_limit(txn.name(), txn.key()) else {
            return Ok(Decision::disabled());
        };
        let limit = limit.clone();

        let stored_tat = match self.fetch(txn.key()).await {
            Ok(tat) => tat,
            Err(SourceError::NotFound) => {
                // Nothing to refund to; report the bucket as already full.
                let now = self.clock.now_nanos();
                return Ok(maybe_refund(&limit, now, now, txn.cost()));
            }
            Err(err) => return Err(err.into()),
        };

        let now = self.clock.now_nanos();
        let d = maybe_refund(&limit, stored_tat, now, txn.cost());
        if !d.allowed {
            // Already at maximum capacity.
            return Ok(d);
        }

        self.persist(txn.key(), d.new_tat).await?;
        Ok(d)
    }

    /// Refund each bucket in a single round trip per direction.
    ///
    /// Unlike `batch_spend`, the consolidated decision is allowed if AT
    /// LEAST ONE refund succeeded, and every successful refund is persisted
    /// regardless of the others. Missing buckets are skipped.
    pub async fn batch_refund(&self, txns: &[BucketWithCost]) -> Result<Decision> {
        if txns.is_empty() {
            return Err(LimiterError::EmptyBatch);
        }
        let mut keys = Vec::with_capacity(txns.len());
        for txn in txns {
            if txn.cost() <= 0 {
                return Err(LimiterError::InvalidCost);
            }
            keys.push(txn.key().to_string());
        }

        let source = Arc::clone(&self.source);
        let tats = detached(async move { source.batch_get(&keys).await }).await?;

        let now = self.clock.now_nanos();
        let mut new_tats: HashMap<String, i64> = HashMap::new();
        let mut consolidated = Consolidated::new(false);

        for txn in txns {
            let Some(limit) = self.resolve_limit(txn.name(), txn.key()) else {
                continue;
            };

            // A missing bucket is already full; skip it.
            let stored_tat = match tats.get(txn.key()) {
                Some(&tat) if tat != 0 => tat,
                _ => continue,
            };
            let d = maybe_refund(limit, stored_tat, now, txn.cost());
            if d.allowed {
                new_tats.insert(txn.key().to_string(), d.new_tat);
            }

            consolidated.any_allowed(&d);
        }

        if !new_tats.is_empty() {
            let source = Arc::clone(&self.source);
            detached(async move { source.batch_set(&new_tats).await }).await?;
        }

        Ok(consolidated.into_decision())
    }

    /// Restore the bucket to its maximum capacity by deleting its state.
    pub async fn reset(&self, bucket: &Bucket) -> Result<()> {
        let source = Arc::clone(&self.source);
        let key = bucket.key().to_string();
        detached(async move { source.delete(&key).await })
            .await
            .map_err(Into::into)
    }

    /// Effective limit for `(name, bucket_key)`: the bucket key's override
    /// if one exists, else the default for the name, else `None` (disabled).
    fn resolve_limit(&self, name: Name, bucket_key: &str) -> Option<&Limit> {
        if !bucket_key.is_empty() {
            if let Some(limit) = self.overrides.get(bucket_key) {
                return Some(limit);
            }
        }
        self.defaults.get(name.as_str())
    }

    async fn fetch(&self, key: &str) -> std::result::Result<i64, SourceError> {
        let source = Arc::clone(&self.source);
        let key = key.to_string();
        detached(async move { source.get(&key).await }).await
    }

    async fn persist(&self, key: &str, tat: i64) -> Result<()> {
        let source = Arc::clone(&self.source);
        let key = key.to_string();
        detached(async move { source.set(&key, tat).await })
            .await
            .map_err(Into::into)
    }
}

/// Run a source operation to completion regardless of caller cancellation.
///
/// Dropping an async caller mid-await would otherwise abort an in-flight
/// write whose decision was already committed in memory, granting the
/// subject free capacity. Spawning the operation detaches it from the
/// caller's lifetime; the source's own per-command timeout still bounds it.
async fn detached<T, F>(op: F) -> std::result::Result<T, SourceError>
where
    F: Future<Output = std::result::Result<T, SourceError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(op).await {
        Ok(result) => result,
        Err(err) => Err(SourceError::Unknown(format!("source task failed: {err}"))),
    }
}

fn decision_label(result: &Result<Decision>) -> &'static str {
    match result {
        Ok(d) if d.allowed => metrics::ALLOWED,
        _ => metrics::DENIED,
    }
}

/// Running aggregation of per-bucket decisions into a batch decision.
struct Consolidated {
    allowed: bool,
    min_remaining: i64,
    max_retry_in: Duration,
    max_reset_in: Duration,
    max_new_tat: i64,
}

impl Consolidated {
    fn new(allowed: bool) -> Self {
        Self {
            allowed,
            min_remaining: i64::MAX,
            max_retry_in: Duration::ZERO,
            max_reset_in: Duration::ZERO,
            max_new_tat: 0,
        }
    }

    /// Fold for batch spends: every bucket must allow.
    fn all_allowed(&mut self, d: &Decision) {
        self.allowed = self.allowed && d.allowed;
        self.fold(d);
    }

    /// Fold for batch refunds: one success is enough.
    fn any_allowed(&mut self, d: &Decision) {
        self.allowed = self.allowed || d.allowed;
        self.fold(d);
    }

    fn fold(&mut self, d: &Decision) {
        self.min_remaining = self.min_remaining.min(d.remaining);
        self.max_retry_in = self.max_retry_in.max(d.retry_in);
        self.max_reset_in = self.max_reset_in.max(d.reset_in);
        self.max_new_tat = self.max_new_tat.max(d.new_tat);
    }

    fn into_decision(self) -> Decision {
        Decision {
            allowed: self.allowed,
            remaining: self.min_remaining,
            retry_in: self.max_retry_in,
            reset_in: self.max_reset_in,
            new_tat: self.max_new_tat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::source::memory::InMemorySource;

    const SECOND: i64 = 1_000_000_000;

    /// An arbitrary nonzero wall-clock origin, so tests never confuse a real
    /// TAT with the zero sentinel.
    const EPOCH: i64 = 1_700_000_000 * SECOND;

    struct Harness {
        limiter: Limiter<InMemorySource>,
        source: Arc<InMemorySource>,
        clock: Arc<FakeClock>,
    }

    /// A limiter over a fresh in-memory source with one default limit:
    /// burst 10, refilling one unit per second.
    fn harness() -> Harness {
        harness_with(Limits::from([(
            Name::NewOrdersPerAccount.as_str().to_string(),
            per_second_limit(10),
        )]))
    }

    fn harness_with(defaults: Limits) -> Harness {
        let source = Arc::new(InMemorySource::new());
        let clock = Arc::new(FakeClock::new(EPOCH));
        let limiter = Limiter::with_clock(
            Arc::clone(&source),
            defaults,
            Limits::new(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        Harness {
            limiter,
            source,
            clock,
        }
    }

    fn per_second_limit(burst: i64) -> Limit {
        Limit::new(burst, 1, Duration::from_secs(1)).unwrap()
    }

    fn orders_bucket(account_id: i64, cost: i64) -> BucketWithCost {
        Bucket::new_orders_per_account(account_id)
            .unwrap()
            .with_cost(cost)
    }

    #[tokio::test]
    async fn first_spend_initializes_the_bucket() {
        let h = harness();
        let txn = orders_bucket(1, 3);

        let d = h.limiter.spend(&txn).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 7);
        assert_eq!(d.retry_in, Duration::ZERO);

        let stored = h.source.get(txn.key()).await.unwrap();
        assert_eq!(stored, EPOCH + 3 * SECOND);
    }

    #[tokio::test]
    async fn denied_spend_leaves_the_bucket_untouched() {
        let h = harness();
        let txn = orders_bucket(1, 3);
        h.limiter.spend(&txn).await.unwrap();

        let d = h.limiter.spend(&orders_bucket(1, 8)).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.remaining, 7);
        assert_eq!(d.retry_in, Duration::from_secs(1));

        let stored = h.source.get(txn.key()).await.unwrap();
        assert_eq!(stored, EPOCH + 3 * SECOND);
    }

    #[tokio::test]
    async fn capacity_refills_over_time() {
        let h = harness();
        h.limiter.spend(&orders_bucket(1, 3)).await.unwrap();

        h.clock.advance(Duration::from_secs(5));
        let d = h.limiter.spend(&orders_bucket(1, 5)).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 5);

        let stored = h.source.get("new_orders_per_account:1").await.unwrap();
        assert_eq!(stored, EPOCH + 10 * SECOND);
    }

    #[tokio::test]
    async fn refund_is_clamped_at_full() {
        let h = harness();
        let txn = orders_bucket(1, 3);
        h.limiter.spend(&txn).await.unwrap();

        let d = h.limiter.refund(&orders_bucket(1, 100)).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 10);

        let stored = h.source.get(txn.key()).await.unwrap();
        assert_eq!(stored, EPOCH);
    }

    #[tokio::test]
    async fn refund_of_missing_bucket_is_a_no_op() {
        let h = harness();
        let txn = orders_bucket(1, 5);

        let d = h.limiter.refund(&txn).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.remaining, 10);
        assert!(matches!(
            h.source.get(txn.key()).await,
            Err(SourceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn check_is_pure() {
        let h = harness();
        let txn = orders_bucket(1, 3);

        let first = h.limiter.check(&txn).await.unwrap();
        let second = h.limiter.check(&txn).await.unwrap();
        assert_eq!(first, second);
        assert!(first.allowed);
        assert_eq!(first.remaining, 7);

        // Still no bucket: check never creates one.
        assert!(matches!(
            h.source.get(txn.key()).await,
            Err(SourceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn zero_cost_check_reports_current_capacity() {
        let h = harness();
        h.limiter.spend(&orders_bucket(1, 4)).await.unwrap();

        let d = h.limiter.check(&orders_bucket(1, 0)).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 6);
    }

    #[tokio::test]
    async fn cost_preconditions_are_enforced() {
        let h = harness();

        assert!(matches!(
            h.limiter.spend(&orders_bucket(1, 0)).await,
            Err(LimiterError::InvalidCost)
        ));
        assert!(matches!(
            h.limiter.refund(&orders_bucket(1, -1)).await,
            Err(LimiterError::InvalidCost)
        ));
        assert!(matches!(
            h.limiter.check(&orders_bucket(1, -1)).await,
            Err(LimiterError::InvalidCheckCost)
        ));
        assert!(matches!(
            h.limiter.spend(&orders_bucket(1, 11)).await,
            Err(LimiterError::CostOverLimit)
        ));
        assert!(matches!(
            h.limiter.check(&orders_bucket(1, 11)).await,
            Err(LimiterError::CostOverLimit)
        ));
        assert!(matches!(
            h.limiter.batch_spend(&[]).await,
            Err(LimiterError::EmptyBatch)
        ));
        assert!(matches!(
            h.limiter.batch_refund(&[]).await,
            Err(LimiterError::EmptyBatch)
        ));
    }

    #[tokio::test]
    async fn disabled_limit_allows_synthetically() {
        let h = harness_with(Limits::new());
        let txn = orders_bucket(1, 5);

        let d = h.limiter.spend(&txn).await.unwrap();
        assert_eq!(d, Decision::disabled());

        // Nothing was created for the disabled limit.
        assert!(matches!(
            h.source.get(txn.key()).await,
            Err(SourceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn override_limit_wins_over_default() {
        let source = Arc::new(InMemorySource::new());
        let clock = Arc::new(FakeClock::new(EPOCH));
        let defaults = Limits::from([(
            Name::NewOrdersPerAccount.as_str().to_string(),
            per_second_limit(10),
        )]);
        let overrides = Limits::from([(
            "new_orders_per_account:1".to_string(),
            Limit::new(2, 1, Duration::from_secs(1))
                .unwrap()
                .into_override(),
        )]);
        let limiter = Limiter::with_clock(
            Arc::clone(&source),
            defaults,
            overrides,
            clock as Arc<dyn Clock>,
        );

        // Account 1 is capped by its override burst of 2.
        assert!(matches!(
            limiter.spend(&orders_bucket(1, 5)).await,
            Err(LimiterError::CostOverLimit)
        ));
        let d = limiter.spend(&orders_bucket(1, 2)).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);

        // Other accounts still get the default.
        let d = limiter.spend(&orders_bucket(2, 5)).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 5);
    }

    #[tokio::test]
    async fn batch_spend_is_all_or_nothing() {
        let h = harness();
        let a = orders_bucket(1, 5);
        let b = orders_bucket(2, 5);

        // Bucket A has one unit left; B does not exist.
        h.source.set(a.key(), EPOCH + 9 * SECOND).await.unwrap();

        let d = h
            .limiter
            .batch_spend(&[a.clone(), b.clone()])
            .await
            .unwrap();
        assert!(!d.allowed);
        assert_eq!(d.remaining, 1);
        assert_eq!(d.retry_in, Duration::from_secs(4));

        // A keeps its TAT, and B was not created.
        assert_eq!(h.source.get(a.key()).await.unwrap(), EPOCH + 9 * SECOND);
        assert!(matches!(
            h.source.get(b.key()).await,
            Err(SourceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn batch_spend_persists_on_unanimous_allow() {
        let h = harness();
        let a = orders_bucket(1, 3);
        let b = orders_bucket(2, 4);

        let d = h
            .limiter
            .batch_spend(&[a.clone(), b.clone()])
            .await
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 6, "remaining is the minimum across buckets");
        assert_eq!(d.reset_in, Duration::from_secs(4));

        assert_eq!(h.source.get(a.key()).await.unwrap(), EPOCH + 3 * SECOND);
        assert_eq!(h.source.get(b.key()).await.unwrap(), EPOCH + 4 * SECOND);
    }

    #[tokio::test]
    async fn batch_refund_is_permissive() {
        let h = harness();
        let a = orders_bucket(1, 5);
        let b = orders_bucket(2, 5);

        // A can absorb a refund; B does not exist.
        h.source.set(a.key(), EPOCH + 9 * SECOND).await.unwrap();

        let d = h
            .limiter
            .batch_refund(&[a.clone(), b.clone()])
            .await
            .unwrap();
        assert!(d.allowed, "one successful refund is enough");

        assert_eq!(h.source.get(a.key()).await.unwrap(), EPOCH + 4 * SECOND);
        assert!(matches!(
            h.source.get(b.key()).await,
            Err(SourceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn batch_refund_of_full_buckets_is_denied() {
        let h = harness();
        let a = orders_bucket(1, 5);

        // Stored TAT in the past: already full.
        h.source.set(a.key(), EPOCH - SECOND).await.unwrap();

        let d = h.limiter.batch_refund(&[a]).await.unwrap();
        assert!(!d.allowed);
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let h = harness();
        let bucket = Bucket::new_orders_per_account(1).unwrap();
        h.limiter
            .spend(&bucket.clone().with_cost(5))
            .await
            .unwrap();

        h.limiter.reset(&bucket).await.unwrap();
        assert!(matches!(
            h.source.get(bucket.key()).await,
            Err(SourceError::NotFound)
        ));

        // Resetting an absent bucket still succeeds.
        h.limiter.reset(&bucket).await.unwrap();

        // The next spend starts from a full bucket again.
        let d = h.limiter.spend(&bucket.clone().with_cost(1)).await.unwrap();
        assert_eq!(d.remaining, 9);
    }

    #[tokio::test]
    async fn spend_remains_within_capacity_bounds() {
        let h = harness();

        for _ in 0..20 {
            let d = h.limiter.spend(&orders_bucket(1, 1)).await.unwrap();
            assert!(d.remaining >= 0 && d.remaining <= 10);
            h.clock.advance(Duration::from_millis(300));
        }
    }
}
