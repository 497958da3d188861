use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{self, outcome_label};

use super::calendar::{day_window, free_windows, now_ms, validate_range};
use super::coordinator::Plan;
use super::ledger::{validate_holder, validate_name};
use super::{Engine, EngineError};

/// Result of [`Engine::cancel_booking`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cancellation {
    Cancelled(Cancelled),
    AlreadyCancelled(Cancelled),
}

impl Cancellation {
    pub fn record(&self) -> &Cancelled {
        match self {
            Cancellation::Cancelled(c) | Cancellation::AlreadyCancelled(c) => c,
        }
    }

    pub fn was_already_cancelled(&self) -> bool {
        matches!(self, Cancellation::AlreadyCancelled(_))
    }
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub async fn create_venue(
        &self,
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        status: VenueStatus,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        let _catalog = self.catalog.lock().await;
        let _commit = self.store.begin_commit().await;
        if self.store.resource_count() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.store.contains(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::VenueCreated {
            id,
            name: name.clone(),
            capacity,
            status,
        };
        self.coordinator.persist(vec![event]).await?;
        self.store
            .insert_venue(VenueState::new(id, name, capacity, status));
        self.record_resource_gauge();
        debug!("venue {id} created ({status})");
        Ok(())
    }

    /// Existing bookings are kept when a venue leaves `Available`; only new
    /// requests are refused.
    pub async fn set_venue_status(
        &self,
        id: Ulid,
        status: VenueStatus,
    ) -> Result<VenueInfo, EngineError> {
        let _commit = self.store.begin_commit().await;
        let mut guard = self.lock_venue(id).await?;
        if guard.status != status {
            self.coordinator
                .apply_unkeyed(&mut *guard, vec![Event::VenueStatusChanged { id, status }])
                .await?;
            debug!("venue {id} is now {status}");
        }
        Ok(guard.info())
    }

    pub async fn delete_venue(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let _commit = self.store.begin_commit().await;
        let guard = self.lock_venue(id).await?;
        let confirmed = guard.confirmed_count();
        if confirmed > 0 {
            return Err(EngineError::HasBookings { resource_id: id, confirmed });
        }
        self.coordinator
            .persist(vec![Event::VenueDeleted { id }])
            .await?;
        self.store.remove_venue(&guard);
        self.record_resource_gauge();
        debug!("venue {id} deleted");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Reserve `[start, end)` on a venue for `requester`.
    ///
    /// Rejections are checked in a fixed order: malformed window, unknown
    /// venue, venue not bookable, overlap. A `TimeConflict` lists every
    /// confirmed booking the window overlaps. `booking_id` is the
    /// idempotency key.
    pub async fn create_booking(
        &self,
        booking_id: Ulid,
        resource_id: Ulid,
        requester: &HolderRef,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let result = self
            .try_create_booking(booking_id, resource_id, requester, start, end)
            .await;
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome_label(&result))
            .increment(1);
        match &result {
            Ok(b) => debug!("booking {} on {resource_id} [{}, {})", b.id, b.span.start, b.span.end),
            Err(e) => debug!("booking {booking_id} on {resource_id} rejected: {e}"),
        }
        result
    }

    async fn try_create_booking(
        &self,
        booking_id: Ulid,
        resource_id: Ulid,
        requester: &HolderRef,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let span = validate_range(start, end)?;
        validate_holder(requester)?;
        let _commit = self.store.begin_commit().await;
        let mut guard = self.lock_venue(resource_id).await?;

        let key = CommitKey::new(CommitOp::Book, booking_id);
        let committed = self
            .coordinator
            .run_atomic(key, &mut *guard, |venue: &VenueState| {
                if let Some(existing) = venue.booking(booking_id) {
                    let original = Booking {
                        status: BookingStatus::Confirmed,
                        cancelled_at: None,
                        ..existing.clone()
                    };
                    return Ok(Plan::already_applied(Outcome::Booked(original)));
                }
                if venue.status != VenueStatus::Available {
                    return Err(EngineError::ResourceUnavailable {
                        resource_id,
                        status: venue.status,
                    });
                }
                let conflicts: Vec<ConflictingBooking> = venue
                    .confirmed_overlapping(&span)
                    .map(|b| ConflictingBooking {
                        id: b.id,
                        start: b.span.start,
                        end: b.span.end,
                    })
                    .collect();
                if !conflicts.is_empty() {
                    return Err(EngineError::TimeConflict { resource_id, conflicts });
                }
                if venue.bookings.len() >= MAX_BOOKINGS_PER_VENUE {
                    return Err(EngineError::LimitExceeded("too many bookings on venue"));
                }
                let booking = Booking {
                    id: booking_id,
                    resource_id,
                    requester: requester.clone(),
                    span,
                    status: BookingStatus::Confirmed,
                    cancelled_at: None,
                };
                let steps = vec![Event::BookingConfirmed { booking: booking.clone() }];
                Ok(Plan::commit(steps, Outcome::Booked(booking)))
            })
            .await?;

        match committed.outcome {
            Outcome::Booked(booking) => Ok(booking),
            other => Err(EngineError::AtomicityFailure(format!(
                "commit produced unexpected outcome {other:?}"
            ))),
        }
    }

    /// Cancel a booking, freeing its window. Cancelling twice returns the
    /// first cancellation as [`Cancellation::AlreadyCancelled`].
    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<Cancellation, EngineError> {
        let result = self.try_cancel_booking(booking_id).await;
        let label = match &result {
            Ok(Cancellation::AlreadyCancelled(_)) => "already_cancelled",
            other => outcome_label(other),
        };
        metrics::counter!(observability::CANCELLATIONS_TOTAL, "outcome" => label).increment(1);
        if let Err(e) = &result {
            debug!("cancellation of {booking_id} rejected: {e}");
        }
        result
    }

    async fn try_cancel_booking(&self, booking_id: Ulid) -> Result<Cancellation, EngineError> {
        let resource_id = self
            .store
            .venue_for_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let _commit = self.store.begin_commit().await;
        let mut guard = self
            .lock_venue(resource_id)
            .await
            .map_err(|_| EngineError::BookingNotFound(booking_id))?;

        let cancelled_at = now_ms();
        let key = CommitKey::new(CommitOp::Cancel, booking_id);
        let committed = self
            .coordinator
            .run_atomic(key, &mut *guard, |venue: &VenueState| {
                let booking = venue
                    .booking(booking_id)
                    .ok_or(EngineError::BookingNotFound(booking_id))?;
                let record = |at| Cancelled {
                    booking_id,
                    resource_id,
                    cancelled_at: at,
                };
                if !booking.is_confirmed() {
                    let at = booking.cancelled_at.unwrap_or(cancelled_at);
                    return Ok(Plan::already_applied(Outcome::Cancelled(record(at))));
                }
                let steps = vec![Event::BookingCancelled {
                    booking_id,
                    resource_id,
                    cancelled_at,
                }];
                Ok(Plan::commit(steps, Outcome::Cancelled(record(cancelled_at))))
            })
            .await?;

        match committed.outcome {
            Outcome::Cancelled(c) if committed.replayed => Ok(Cancellation::AlreadyCancelled(c)),
            Outcome::Cancelled(c) => {
                debug!("booking {booking_id} on {resource_id} cancelled");
                Ok(Cancellation::Cancelled(c))
            }
            other => Err(EngineError::AtomicityFailure(format!(
                "commit produced unexpected outcome {other:?}"
            ))),
        }
    }

    // ── Queries ──────────────────────────────────────────────

    pub async fn get_venue(&self, id: Ulid) -> Result<VenueInfo, EngineError> {
        let shared = self
            .store
            .venue(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = shared.read().await;
        Ok(guard.info())
    }

    pub async fn list_venues(&self) -> Vec<VenueInfo> {
        let mut infos = Vec::new();
        for shared in self.store.venues() {
            infos.push(shared.read().await.info());
        }
        infos.sort_by_key(|v| v.id);
        infos
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let not_found = EngineError::BookingNotFound(booking_id);
        let shared = self
            .store
            .venue_for_booking(&booking_id)
            .and_then(|rid| self.store.venue(&rid))
            .ok_or_else(|| not_found.clone())?;
        let guard = shared.read().await;
        guard.booking(booking_id).cloned().ok_or(not_found)
    }

    /// Confirmed bookings intersecting the local calendar day, by start time.
    pub async fn bookings_for_resource_on_date(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, EngineError> {
        let window = day_window(date, self.config.utc_offset_minutes)?;
        let shared = self
            .store
            .venue(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = shared.read().await;
        Ok(guard.confirmed_overlapping(&window).cloned().collect())
    }

    /// Unbooked sub-windows of the day. Empty while the venue is not bookable.
    pub async fn free_windows_on_date(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        let window = day_window(date, self.config.utc_offset_minutes)?;
        let shared = self
            .store
            .venue(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = shared.read().await;
        if guard.status != VenueStatus::Available {
            return Ok(Vec::new());
        }
        Ok(free_windows(&guard, &window))
    }

    async fn lock_venue(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<VenueState>, EngineError> {
        let shared = self
            .store
            .venue(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = shared.clone().write_owned().await;
        match self.store.venue(&id) {
            Some(current) if Arc::ptr_eq(&current, &shared) => Ok(guard),
            _ => Err(EngineError::ResourceNotFound(id)),
        }
    }
}
