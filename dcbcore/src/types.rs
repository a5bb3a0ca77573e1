//! Core value types for the consistency core.
//!
//! Identifiers use smart constructors so a value that exists is a value that
//! is valid. The central type is [`SortableUniqueId`], the ordinal-comparable
//! position of an event: 19 digits of 100-nanosecond ticks since
//! `0001-01-01T00:00:00Z` followed by an 11 digit random tiebreaker. Plain
//! string comparison of two ids therefore orders them by creation time.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const TICK_DIGITS: usize = 19;
const TIEBREAK_DIGITS: usize = 11;
const TIEBREAK_MODULUS: u64 = 100_000_000_000;
const MAX_TIEBREAK: u64 = TIEBREAK_MODULUS - 1;
const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: i64 = 100;
/// Ticks between `0001-01-01T00:00:00Z` and the Unix epoch.
const TICKS_AT_UNIX_EPOCH: i64 = 621_355_968_000_000_000;
const MAX_TICKS: i64 = i64::MAX;

/// A globally unique event identifier using UUIDv7 format.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new `EventId` from the current time.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() always yields a v7 UUID")
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Time-ordered, ordinal-comparable event position.
///
/// Always exactly 30 ASCII digits. Two ids compare the same way as the
/// instants they encode; ids created within the same tick are ordered by
/// their random tiebreaker.
#[nutype(
    validate(predicate = |s: &str| {
        s.len() == TICK_DIGITS + TIEBREAK_DIGITS && s.bytes().all(|b| b.is_ascii_digit())
    }),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct SortableUniqueId(String);

impl SortableUniqueId {
    /// Generates an id for the current instant with a random tiebreaker.
    pub fn generate() -> Self {
        Self::from_datetime(Utc::now(), rand::random::<u64>())
    }

    /// Generates an id strictly greater than `previous`. Used to give the
    /// events of one batch increasing positions even within a single tick.
    pub fn generate_after(previous: Option<&Self>) -> Self {
        let candidate = Self::generate();
        match previous {
            Some(previous) if candidate <= *previous => Self::from_datetime(
                previous.datetime() + chrono::TimeDelta::nanoseconds(NANOS_PER_TICK),
                rand::random::<u64>(),
            ),
            _ => candidate,
        }
    }

    /// Encodes an instant and a tiebreaker. The tiebreaker is reduced to its
    /// low 11 decimal digits.
    pub fn from_datetime(at: DateTime<Utc>, tiebreak: u64) -> Self {
        let ticks = ticks_of(at);
        Self::try_new(format!(
            "{ticks:0width$}{tie:0tie_width$}",
            width = TICK_DIGITS,
            tie = tiebreak % TIEBREAK_MODULUS,
            tie_width = TIEBREAK_DIGITS
        ))
        .expect("formatted ticks and tiebreak are always 30 digits")
    }

    /// The largest id at `at`: every real event created at or before `at`
    /// compares less than or equal to it, every later event compares greater.
    pub fn threshold_at(at: DateTime<Utc>) -> Self {
        Self::from_datetime(at, MAX_TIEBREAK)
    }

    /// An id greater than or equal to every other id.
    pub fn max() -> Self {
        Self::try_new("9".repeat(TICK_DIGITS + TIEBREAK_DIGITS))
            .expect("thirty nines are a valid sortable id")
    }

    /// An id less than or equal to every other id.
    pub fn min() -> Self {
        Self::try_new("0".repeat(TICK_DIGITS + TIEBREAK_DIGITS))
            .expect("thirty zeros are a valid sortable id")
    }

    /// The instant encoded in the id.
    pub fn datetime(&self) -> DateTime<Utc> {
        let text: &str = self.as_ref();
        let ticks: i64 = text[..TICK_DIGITS].parse().unwrap_or(MAX_TICKS);
        let unix_ticks = ticks - TICKS_AT_UNIX_EPOCH;
        let secs = unix_ticks.div_euclid(TICKS_PER_SECOND);
        let nanos = unix_ticks.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK;
        DateTime::from_timestamp(secs, nanos as u32).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Ordinal `<=` comparison.
    pub fn is_earlier_than_or_equal(&self, other: &Self) -> bool {
        self <= other
    }

    /// Borrows the textual form.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

fn ticks_of(at: DateTime<Utc>) -> i64 {
    at.timestamp()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(i64::from(at.timestamp_subsec_nanos()) / NANOS_PER_TICK)
        .saturating_add(TICKS_AT_UNIX_EPOCH)
        .max(0)
}

/// A random code identifying one granted tag write reservation.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRef,
    Display,
    Serialize,
    Deserialize
))]
pub struct ReservationCode(Uuid);

impl ReservationCode {
    /// Draws a fresh random code.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// A timestamp for when something happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    #[test]
    fn generated_ids_are_thirty_digits() {
        let id = SortableUniqueId::generate();
        assert_eq!(id.as_str().len(), 30);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn unix_epoch_encodes_known_tick_count() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        let id = SortableUniqueId::from_datetime(epoch, 42);
        assert_eq!(id.as_str(), "062135596800000000000000000042");
        assert_eq!(id.datetime(), epoch);
    }

    #[test]
    fn threshold_is_after_every_event_in_the_same_tick() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let threshold = SortableUniqueId::threshold_at(at);
        let same_tick = SortableUniqueId::from_datetime(at, 99_999_999_998);
        let next_tick = SortableUniqueId::from_datetime(at + Duration::microseconds(1), 0);

        assert!(same_tick < threshold);
        assert!(threshold < next_tick);
    }

    #[test]
    fn generate_after_is_strictly_increasing() {
        let future = SortableUniqueId::from_datetime(Utc::now() + Duration::hours(1), 5);
        let next = SortableUniqueId::generate_after(Some(&future));
        assert!(next > future);

        let mut previous: Option<SortableUniqueId> = None;
        for _ in 0..100 {
            let id = SortableUniqueId::generate_after(previous.as_ref());
            if let Some(previous) = &previous {
                assert!(id > *previous);
            }
            previous = Some(id);
        }
    }

    #[test]
    fn max_and_min_bound_generated_ids() {
        let id = SortableUniqueId::generate();
        assert!(SortableUniqueId::min() < id);
        assert!(id < SortableUniqueId::max());
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(SortableUniqueId::try_new("").is_err());
        assert!(SortableUniqueId::try_new("12345").is_err());
        assert!(SortableUniqueId::try_new("06213559680000000000000000004x").is_err());
    }

    proptest! {
        #[test]
        fn string_order_follows_time_order(
            a in 0i64..4_000_000_000_000,
            b in 0i64..4_000_000_000_000,
            tie_a in any::<u64>(),
            tie_b in any::<u64>(),
        ) {
            let at_a = Utc.timestamp_millis_opt(a).unwrap();
            let at_b = Utc.timestamp_millis_opt(b).unwrap();
            let id_a = SortableUniqueId::from_datetime(at_a, tie_a);
            let id_b = SortableUniqueId::from_datetime(at_b, tie_b);
            if a < b {
                prop_assert!(id_a < id_b);
            }
            prop_assert_eq!(id_a.datetime(), at_a);
        }

        #[test]
        fn serialization_preserves_value(millis in 0i64..4_000_000_000_000, tie in any::<u64>()) {
            let id = SortableUniqueId::from_datetime(Utc.timestamp_millis_opt(millis).unwrap(), tie);
            let json = serde_json::to_string(&id).unwrap();
            let back: SortableUniqueId = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(id, back);
        }
    }

    #[test]
    fn event_ids_are_v7() {
        let id = EventId::new();
        assert_eq!(id.get_version(), Some(uuid::Version::SortRand));
        assert!(EventId::try_new(Uuid::new_v4()).is_err());
    }
}
