//! Per-tag write reservations.
//!
//! One [`TagReservationActor`] guards one tag. A writer must hold the tag's
//! single active reservation before writing events under it, and may require
//! the tag to still be at the position it read (optimistic concurrency).
//! Abandoned reservations expire after the cancellation window and are
//! purged lazily by the next call that looks at them.

use crate::config::TagConsistentActorOptions;
use crate::errors::{ReservationError, ReservationResult};
use crate::store::EventStore;
use crate::tag::TagKey;
use crate::types::{ReservationCode, SortableUniqueId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// A granted right to write under one tag until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagWriteReservation {
    /// Unique per grant.
    pub code: ReservationCode,
    /// After this instant the reservation is void.
    pub expires_at: DateTime<Utc>,
    /// The reserved tag in `group:content` form.
    pub tag: String,
}

impl TagWriteReservation {
    /// Whether the reservation has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// The reservation capability of a tag actor.
#[async_trait]
pub trait TagConsistency: Send + Sync {
    /// The guarded tag in `group:content` form.
    fn tag_actor_id(&self) -> String;

    /// The latest known sortable id of the tag, `None` when the tag has no
    /// events yet.
    async fn latest_sortable_unique_id(&self) -> ReservationResult<Option<SortableUniqueId>>;

    /// Grants the tag's single reservation. With `expected`, the tag must
    /// still be at that position, unless its position is unknown.
    async fn make_reservation(
        &self,
        expected: Option<&SortableUniqueId>,
    ) -> ReservationResult<TagWriteReservation>;

    /// Releases a reservation after a successful write. Returns `false` for
    /// an unknown or expired reservation.
    async fn confirm_reservation(&self, reservation: &TagWriteReservation)
        -> ReservationResult<bool>;

    /// Releases a reservation without a write. Unknown reservations are
    /// ignored.
    async fn cancel_reservation(&self, reservation: &TagWriteReservation)
        -> ReservationResult<()>;

    /// Tells the actor that an event was written under its tag without a
    /// reservation, so the next read re-fetches the position.
    async fn notify_event_written(&self) -> ReservationResult<()>;
}

#[derive(Debug, Default)]
struct ReservationState {
    latest: Option<SortableUniqueId>,
    reservations: HashMap<ReservationCode, TagWriteReservation>,
    caught_up: bool,
}

impl ReservationState {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.reservations.retain(|_, r| !r.is_expired_at(now));
    }
}

/// In-process reservation actor for one tag.
pub struct TagReservationActor {
    tag: TagKey,
    store: Arc<dyn EventStore>,
    options: TagConsistentActorOptions,
    state: Mutex<ReservationState>,
    catch_up: tokio::sync::Mutex<()>,
}

impl TagReservationActor {
    /// Creates the actor. The tag position is fetched from `store` lazily,
    /// on first use.
    pub fn new(tag: TagKey, store: Arc<dyn EventStore>, options: TagConsistentActorOptions) -> Self {
        Self {
            tag,
            store,
            options,
            state: Mutex::new(ReservationState::default()),
            catch_up: tokio::sync::Mutex::new(()),
        }
    }

    /// The guarded tag.
    pub const fn tag(&self) -> &TagKey {
        &self.tag
    }

    /// Unexpired reservations.
    pub async fn active_reservations(&self) -> Vec<TagWriteReservation> {
        self.ensure_caught_up().await;
        let mut state = self.state.lock();
        state.purge_expired(Utc::now());
        state.reservations.values().cloned().collect()
    }

    async fn ensure_caught_up(&self) {
        if self.state.lock().caught_up {
            return;
        }
        let _guard = self.catch_up.lock().await;
        if self.state.lock().caught_up {
            return;
        }

        let fetched = match self.store.latest_tag(&self.tag).await {
            Ok(latest) => latest.map(|l| l.last_sortable_unique_id),
            Err(err) => {
                warn!(tag = %self.tag, error = %err, "tag catch-up failed, keeping cached position");
                None
            }
        };

        let mut state = self.state.lock();
        if let Some(latest) = fetched {
            debug!(tag = %self.tag, latest = %latest, "tag caught up");
            state.latest = Some(latest);
        }
        state.caught_up = true;
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.options.cancellation_window.as_duration())
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl TagConsistency for TagReservationActor {
    fn tag_actor_id(&self) -> String {
        self.tag.tag_id()
    }

    async fn latest_sortable_unique_id(&self) -> ReservationResult<Option<SortableUniqueId>> {
        self.ensure_caught_up().await;
        Ok(self.state.lock().latest.clone())
    }

    #[instrument(skip(self), fields(tag = %self.tag))]
    async fn make_reservation(
        &self,
        expected: Option<&SortableUniqueId>,
    ) -> ReservationResult<TagWriteReservation> {
        self.ensure_caught_up().await;

        let now = Utc::now();
        let mut state = self.state.lock();
        state.purge_expired(now);

        if !state.reservations.is_empty() {
            return Err(ReservationError::Conflict {
                tag: self.tag.tag_id(),
            });
        }

        if let Some(expected) = expected {
            if let Some(current) = state.latest.as_ref().filter(|c| *c != expected) {
                return Err(ReservationError::OptimisticConcurrencyViolation {
                    tag: self.tag.tag_id(),
                    expected: expected.clone(),
                    current: current.clone(),
                });
            }
            state.latest = Some(expected.clone());
        }

        let reservation = TagWriteReservation {
            code: ReservationCode::generate(),
            expires_at: self.expiry_from(now),
            tag: self.tag.tag_id(),
        };
        state
            .reservations
            .insert(reservation.code, reservation.clone());
        debug!(code = %reservation.code, "reservation granted");
        Ok(reservation)
    }

    async fn confirm_reservation(
        &self,
        reservation: &TagWriteReservation,
    ) -> ReservationResult<bool> {
        self.ensure_caught_up().await;

        let mut state = self.state.lock();
        state.purge_expired(Utc::now());
        if state.reservations.get(&reservation.code) != Some(reservation) {
            return Ok(false);
        }
        state.reservations.remove(&reservation.code);
        state.caught_up = false;
        Ok(true)
    }

    async fn cancel_reservation(&self, reservation: &TagWriteReservation) -> ReservationResult<()> {
        self.state.lock().reservations.remove(&reservation.code);
        Ok(())
    }

    async fn notify_event_written(&self) -> ReservationResult<()> {
        self.state.lock().caught_up = false;
        Ok(())
    }
}

impl std::fmt::Debug for TagReservationActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagReservationActor")
            .field("tag", &self.tag)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
