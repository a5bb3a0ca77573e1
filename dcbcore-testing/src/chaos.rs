//! Controlled failure injection for event stores.
//!
//! Wrap a store in a [`ChaosEventStore`] and attach [`FailurePolicy`]s. Each
//! store call is matched against the policies: latency policies delay it,
//! failure policies roll against their probability and, on a hit, return an
//! error instead of reaching the wrapped store.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = ChaosEventStore::new(InMemoryEventStore::new())
//!     .with_policy(FailurePolicy::random_errors(0.1, FailureType::Unavailable))
//!     .with_policy(FailurePolicy::latency_injection(Duration::from_millis(5), None));
//! ```

use async_trait::async_trait;
use dcbcore::errors::{EventStoreError, EventStoreResult};
use dcbcore::store::{EventStore, TagLatest, TagWriteResult};
use dcbcore::{Event, SortableUniqueId, TagKey};
use nutype::nutype;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Failure probability percentage (0.0 to 100.0).
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 100.0),
    default = 0.0,
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)
)]
pub struct FailureProbability(f64);

impl FailureProbability {
    /// A probability given as a fraction, clamped to `0.0..=1.0`.
    pub fn from_fraction(fraction: f64) -> Self {
        Self::try_new((fraction * 100.0).clamp(0.0, 100.0)).unwrap_or_default()
    }
}

/// Injected latency in milliseconds.
#[nutype(
    validate(less_or_equal = 60_000),
    default = 0,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct LatencyMs(u64);

impl LatencyMs {
    /// Converts a duration, saturating at one minute.
    pub fn saturating_from(duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self::try_new(millis.min(60_000)).unwrap_or_default()
    }
}

impl From<LatencyMs> for Duration {
    fn from(latency: LatencyMs) -> Self {
        Self::from_millis(latency.into_inner())
    }
}

/// What a policy does when it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureType {
    /// The store cannot be reached.
    Unavailable,
    /// The store refuses the write.
    WriteRejected,
    /// The store fails the read.
    ReadFailed,
    /// Delay only, never fails.
    LatencyInjection,
}

impl FailureType {
    /// The error injected for this failure, if it is one.
    pub fn to_error(self) -> Option<EventStoreError> {
        match self {
            Self::Unavailable => Some(EventStoreError::Unavailable(
                "chaos: store temporarily unavailable".into(),
            )),
            Self::WriteRejected => Some(EventStoreError::WriteRejected(
                "chaos: simulated write rejection".into(),
            )),
            Self::ReadFailed => Some(EventStoreError::ReadFailed(
                "chaos: simulated read failure".into(),
            )),
            Self::LatencyInjection => None,
        }
    }
}

/// A store call being made.
#[derive(Debug, Clone)]
pub enum Operation {
    /// A batch write touching these tags.
    Write {
        /// Tags in `group:content` form.
        tags: Vec<String>,
    },
    /// A per-tag read.
    ReadByTag {
        /// The tag.
        tag: TagKey,
    },
    /// A global read.
    ReadAll,
    /// A per-tag position lookup.
    LatestTag {
        /// The tag.
        tag: TagKey,
    },
}

/// Which calls a policy applies to.
#[derive(Clone)]
pub enum TargetOperations {
    /// Every call.
    All,
    /// Reads and position lookups.
    Reads,
    /// Writes.
    Writes,
    /// Calls touching any of these tags.
    Tags(Vec<TagKey>),
    /// Calls matching a predicate.
    Custom {
        /// Name for debugging.
        name: String,
        /// The predicate.
        predicate: Arc<dyn Fn(&Operation) -> bool + Send + Sync>,
    },
}

impl std::fmt::Debug for TargetOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Reads => write!(f, "Reads"),
            Self::Writes => write!(f, "Writes"),
            Self::Tags(tags) => f.debug_tuple("Tags").field(tags).finish(),
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

/// A failure injection policy.
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    /// Name of the policy for debugging.
    pub name: String,
    /// What to inject.
    pub failure_type: FailureType,
    /// Chance that an applicable call is hit.
    pub probability: FailureProbability,
    /// Which calls the policy applies to.
    pub target_operations: TargetOperations,
    /// Delay for latency policies.
    pub latency: Option<(LatencyMs, Option<LatencyMs>)>,
}

impl FailurePolicy {
    /// Fails any call with the given probability (a fraction).
    pub fn random_errors(probability: f64, failure_type: FailureType) -> Self {
        Self::targeted(
            format!("random {failure_type:?} ({}%)", probability * 100.0),
            failure_type,
            probability,
            TargetOperations::All,
        )
    }

    /// Fails every applicable call.
    pub fn always(failure_type: FailureType, target: TargetOperations) -> Self {
        Self::targeted(format!("always {failure_type:?}"), failure_type, 1.0, target)
    }

    /// Delays every call by `base` plus up to `jitter`.
    pub fn latency_injection(base: Duration, jitter: Option<Duration>) -> Self {
        Self {
            name: format!("latency injection ({base:?})"),
            failure_type: FailureType::LatencyInjection,
            probability: FailureProbability::from_fraction(1.0),
            target_operations: TargetOperations::All,
            latency: Some((
                LatencyMs::saturating_from(base),
                jitter.map(LatencyMs::saturating_from),
            )),
        }
    }

    /// A policy for the given calls.
    pub fn targeted(
        name: impl Into<String>,
        failure_type: FailureType,
        probability: f64,
        target: TargetOperations,
    ) -> Self {
        Self {
            name: name.into(),
            failure_type,
            probability: FailureProbability::from_fraction(probability),
            target_operations: target,
            latency: None,
        }
    }

    fn should_apply(&self, operation: &Operation) -> bool {
        match &self.target_operations {
            TargetOperations::All => true,
            TargetOperations::Reads => !matches!(operation, Operation::Write { .. }),
            TargetOperations::Writes => matches!(operation, Operation::Write { .. }),
            TargetOperations::Tags(targets) => match operation {
                Operation::Write { tags } => targets
                    .iter()
                    .any(|target| tags.contains(&target.tag_id())),
                Operation::ReadByTag { tag } | Operation::LatestTag { tag } => {
                    targets.contains(tag)
                }
                Operation::ReadAll => false,
            },
            TargetOperations::Custom { predicate, .. } => predicate(operation),
        }
    }

    fn should_fail(&self) -> bool {
        let roll: f64 = rand::rng().random_range(0.0..100.0);
        roll < self.probability.into_inner()
    }
}

/// Statistics about chaos injection.
#[derive(Debug, Clone, Default)]
pub struct ChaosStats {
    /// Calls seen while enabled.
    pub total_operations: u64,
    /// Calls answered with an injected error.
    pub failed_operations: u64,
    /// Calls delayed by a latency policy.
    pub delayed_operations: u64,
    /// Injected failures by policy name.
    pub failure_breakdown: HashMap<String, u64>,
}

/// Event store wrapper that injects chaos.
pub struct ChaosEventStore<S: EventStore> {
    inner: S,
    policies: Mutex<Vec<FailurePolicy>>,
    stats: Mutex<ChaosStats>,
    enabled: AtomicBool,
}

impl<S: EventStore> ChaosEventStore<S> {
    /// Wraps `inner` with no policies.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            policies: Mutex::new(Vec::new()),
            stats: Mutex::new(ChaosStats::default()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Adds a policy.
    #[must_use]
    pub fn with_policy(self, policy: FailurePolicy) -> Self {
        self.policies.lock().push(policy);
        self
    }

    /// Adds a policy to a store already in use.
    pub fn add_policy(&self, policy: FailurePolicy) {
        self.policies.lock().push(policy);
    }

    /// Removes every policy.
    pub fn clear_policies(&self) {
        self.policies.lock().clear();
    }

    /// Enables or disables injection.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Current statistics.
    pub fn stats(&self) -> ChaosStats {
        self.stats.lock().clone()
    }

    /// The wrapped store.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    async fn apply_chaos<T>(
        &self,
        operation: Operation,
        action: impl std::future::Future<Output = EventStoreResult<T>> + Send,
    ) -> EventStoreResult<T> {
        if !self.enabled.load(Ordering::SeqCst) {
            return action.await;
        }
        self.stats.lock().total_operations += 1;

        let applicable: Vec<FailurePolicy> = self
            .policies
            .lock()
            .iter()
            .filter(|p| p.should_apply(&operation))
            .cloned()
            .collect();

        for policy in &applicable {
            if let Some((base, jitter)) = policy.latency {
                let mut delay = Duration::from(base);
                if let Some(jitter) = jitter.filter(|j| j.into_inner() > 0) {
                    delay += Duration::from_millis(rand::rng().random_range(0..jitter.into_inner()));
                }
                debug!(?delay, ?operation, "chaos: injecting latency");
                sleep(delay).await;
                self.stats.lock().delayed_operations += 1;
            }
        }

        for policy in &applicable {
            let Some(error) = policy.failure_type.to_error() else {
                continue;
            };
            if policy.should_fail() {
                warn!(policy = %policy.name, %error, ?operation, "chaos: injecting failure");
                let mut stats = self.stats.lock();
                stats.failed_operations += 1;
                *stats
                    .failure_breakdown
                    .entry(policy.name.clone())
                    .or_insert(0) += 1;
                return Err(error);
            }
        }

        action.await
    }
}

#[async_trait]
impl<S: EventStore> EventStore for ChaosEventStore<S> {
    async fn write_events(
        &self,
        events: Vec<Event>,
    ) -> EventStoreResult<(Vec<Event>, Vec<TagWriteResult>)> {
        let mut tags: Vec<String> = events.iter().flat_map(|e| e.tags.clone()).collect();
        tags.sort();
        tags.dedup();
        self.apply_chaos(Operation::Write { tags }, self.inner.write_events(events))
            .await
    }

    async fn read_events_by_tag(
        &self,
        tag: &TagKey,
        since: Option<&SortableUniqueId>,
    ) -> EventStoreResult<Vec<Event>> {
        self.apply_chaos(
            Operation::ReadByTag { tag: tag.clone() },
            self.inner.read_events_by_tag(tag, since),
        )
        .await
    }

    async fn read_all_events(
        &self,
        since: Option<&SortableUniqueId>,
    ) -> EventStoreResult<Vec<Event>> {
        self.apply_chaos(Operation::ReadAll, self.inner.read_all_events(since))
            .await
    }

    async fn latest_tag(&self, tag: &TagKey) -> EventStoreResult<Option<TagLatest>> {
        self.apply_chaos(
            Operation::LatestTag { tag: tag.clone() },
            self.inner.latest_tag(tag),
        )
        .await
    }
}
