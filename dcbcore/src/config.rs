//! Actor and executor configuration.
//!
//! Bounded parameters are `nutype` newtypes so an out-of-range option cannot
//! be constructed. Every options struct has a `Default` matching production
//! defaults and `with_*` builders, and is `serde` (de)serializable so hosts
//! can load it from their own configuration files.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long a granted tag reservation stays valid, in milliseconds.
#[nutype(
    validate(greater = 0),
    default = 30_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct CancellationWindowMs(u64);

impl CancellationWindowMs {
    /// The window as a `Duration`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Smoothing factor of the observed-lag moving average.
#[nutype(
    validate(finite, greater_or_equal = 0.01, less_or_equal = 1.0),
    default = 0.3,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Display,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct LagEmaAlpha(f64);

impl LagEmaAlpha {
    /// Clamps `alpha` into the accepted range.
    pub fn clamped(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() { alpha } else { 0.3 };
        Self::try_new(alpha.clamp(0.01, 1.0)).expect("clamped alpha is always valid")
    }
}

/// Per-second multiplicative decay applied to tracked lag values.
#[nutype(
    validate(finite, greater = 0.0, less_or_equal = 1.0),
    default = 0.98,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Display,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct LagDecayPerSecond(f64);

impl LagDecayPerSecond {
    /// Clamps `decay` into the accepted range.
    pub fn clamped(decay: f64) -> Self {
        let decay = if decay.is_finite() { decay } else { 0.98 };
        Self::try_new(decay.clamp(f64::MIN_POSITIVE, 1.0)).expect("clamped decay is always valid")
    }
}

/// Options for tag reservation actors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagConsistentActorOptions {
    /// Lifetime of a reservation that is neither confirmed nor cancelled.
    pub cancellation_window: CancellationWindowMs,
}

impl TagConsistentActorOptions {
    /// Sets the reservation lifetime.
    #[must_use]
    pub const fn with_cancellation_window(mut self, window: CancellationWindowMs) -> Self {
        self.cancellation_window = window;
        self
    }

    /// Sets the reservation lifetime from a `Duration`. Zero durations keep
    /// the current window.
    #[must_use]
    pub fn with_cancellation_duration(self, window: Duration) -> Self {
        let millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        match CancellationWindowMs::try_new(millis) {
            Ok(window) => self.with_cancellation_window(window),
            Err(_) => self,
        }
    }
}

/// Options for multi-projection actors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultiProjectionActorOptions {
    /// Base age after which an event is considered final.
    pub safe_window_ms: u64,
    /// Widen the window by the observed delivery lag.
    pub enable_dynamic_safe_window: bool,
    /// Upper bound on the lag-driven widening.
    pub max_extra_safe_window_ms: u64,
    /// Smoothing of the observed lag.
    pub lag_ema_alpha: LagEmaAlpha,
    /// Decay of tracked lag per elapsed second.
    pub lag_decay_per_second: LagDecayPerSecond,
    /// Cap on a serialized snapshot. Zero disables the cap.
    pub max_snapshot_serialized_size_bytes: usize,
    /// Gzip snapshot payloads.
    pub compress_snapshots: bool,
}

impl Default for MultiProjectionActorOptions {
    fn default() -> Self {
        Self {
            safe_window_ms: 20_000,
            enable_dynamic_safe_window: false,
            max_extra_safe_window_ms: 30_000,
            lag_ema_alpha: LagEmaAlpha::default(),
            lag_decay_per_second: LagDecayPerSecond::default(),
            max_snapshot_serialized_size_bytes: 0,
            compress_snapshots: true,
        }
    }
}

impl MultiProjectionActorOptions {
    /// Sets the base safe window.
    #[must_use]
    pub const fn with_safe_window_ms(mut self, millis: u64) -> Self {
        self.safe_window_ms = millis;
        self
    }

    /// Enables lag-driven widening bounded by `max_extra_ms`.
    #[must_use]
    pub const fn with_dynamic_safe_window(mut self, max_extra_ms: u64) -> Self {
        self.enable_dynamic_safe_window = true;
        self.max_extra_safe_window_ms = max_extra_ms;
        self
    }

    /// Sets the lag smoothing factor.
    #[must_use]
    pub const fn with_lag_ema_alpha(mut self, alpha: LagEmaAlpha) -> Self {
        self.lag_ema_alpha = alpha;
        self
    }

    /// Sets the lag decay.
    #[must_use]
    pub const fn with_lag_decay_per_second(mut self, decay: LagDecayPerSecond) -> Self {
        self.lag_decay_per_second = decay;
        self
    }

    /// Caps serialized snapshots. Zero disables the cap.
    #[must_use]
    pub const fn with_max_snapshot_size(mut self, bytes: usize) -> Self {
        self.max_snapshot_serialized_size_bytes = bytes;
        self
    }

    /// Turns snapshot compression on or off.
    #[must_use]
    pub const fn with_compression(mut self, enabled: bool) -> Self {
        self.compress_snapshots = enabled;
        self
    }
}

/// Options for the command executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorOptions {
    /// Recorded as `executed_by` in event metadata.
    pub executor_name: String,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            executor_name: "dcbcore-executor".to_string(),
        }
    }
}

impl ExecutorOptions {
    /// Sets the executor name.
    #[must_use]
    pub fn with_executor_name(mut self, name: impl Into<String>) -> Self {
        self.executor_name = name.into();
        self
    }
}
