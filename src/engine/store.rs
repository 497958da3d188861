use std::io;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use ulid::Ulid;

use crate::journal::{Journal, WalJournal};
use crate::model::*;

use super::EngineError;
use super::coordinator::{Stepwise, apply_all};

pub type SharedInventory = Arc<RwLock<InventoryState>>;
pub type SharedVenue = Arc<RwLock<VenueState>>;

/// The engine's storage handle: resource state, lookup indexes, the applied
/// commit keys, and the journal they are persisted to.
///
/// Built once by the application and passed to [`Engine::new`](super::Engine::new).
pub struct Store {
    inventories: DashMap<Ulid, SharedInventory>,
    venues: DashMap<Ulid, SharedVenue>,
    /// claim id → inventory id
    claim_index: DashMap<Ulid, Ulid>,
    /// booking id → venue id
    booking_index: DashMap<Ulid, Ulid>,
    /// holder → every claim they ever opened
    holder_claims: DashMap<HolderRef, Vec<Ulid>>,
    pub(super) commits: DashMap<CommitKey, Outcome>,
    pub(super) journal: Arc<dyn Journal>,
    /// Commits hold it shared; compaction holds it exclusively so the
    /// snapshot and the log swap see no commit in between. Always taken
    /// before any resource lock.
    gate: RwLock<()>,
}

impl Store {
    /// Open the WAL at `path`, replay it and start its writer task.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (journal, records) = WalJournal::open(path)?;
        let store = Self::with_journal(Arc::new(journal), records);
        tracing::info!(
            "store opened: {} inventories, {} venues, {} commits",
            store.inventories.len(),
            store.venues.len(),
            store.commits.len()
        );
        Ok(store)
    }

    /// Build a store over any journal, replaying `records` first.
    pub fn with_journal(journal: Arc<dyn Journal>, records: Vec<WalRecord>) -> Self {
        let store = Self {
            inventories: DashMap::new(),
            venues: DashMap::new(),
            claim_index: DashMap::new(),
            booking_index: DashMap::new(),
            holder_claims: DashMap::new(),
            commits: DashMap::new(),
            journal,
            gate: RwLock::new(()),
        };
        for record in &records {
            store.replay(record);
        }
        store
    }

    pub(super) async fn begin_commit(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    pub(super) async fn begin_compaction(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.inventories.len() + self.venues.len()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.inventories.contains_key(id) || self.venues.contains_key(id)
    }

    pub fn inventory(&self, id: &Ulid) -> Option<SharedInventory> {
        self.inventories.get(id).map(|e| e.value().clone())
    }

    pub fn venue(&self, id: &Ulid) -> Option<SharedVenue> {
        self.venues.get(id).map(|e| e.value().clone())
    }

    pub fn inventories(&self) -> Vec<SharedInventory> {
        self.inventories.iter().map(|e| e.value().clone()).collect()
    }

    pub fn venues(&self) -> Vec<SharedVenue> {
        self.venues.iter().map(|e| e.value().clone()).collect()
    }

    pub(super) fn insert_inventory(&self, state: InventoryState) {
        self.inventories.insert(state.id, Arc::new(RwLock::new(state)));
    }

    pub(super) fn insert_venue(&self, state: VenueState) {
        self.venues.insert(state.id, Arc::new(RwLock::new(state)));
    }

    /// Drop an inventory and its claims from every index. Caller holds its write lock.
    pub(super) fn remove_inventory(&self, state: &InventoryState) {
        for claim in state.claims.values() {
            self.claim_index.remove(&claim.id);
            if let Some(mut ids) = self.holder_claims.get_mut(&claim.holder) {
                ids.retain(|c| c != &claim.id);
            }
        }
        self.holder_claims.retain(|_, ids| !ids.is_empty());
        self.inventories.remove(&state.id);
    }

    /// Drop a venue and its bookings from every index. Caller holds its write lock.
    pub(super) fn remove_venue(&self, state: &VenueState) {
        for booking in &state.bookings {
            self.booking_index.remove(&booking.id);
        }
        self.venues.remove(&state.id);
    }

    // ── Indexes ──────────────────────────────────────────────

    pub fn inventory_for_claim(&self, claim_id: &Ulid) -> Option<Ulid> {
        self.claim_index.get(claim_id).map(|e| *e.value())
    }

    pub fn venue_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    pub fn claims_of(&self, holder: &HolderRef) -> Vec<Ulid> {
        self.holder_claims
            .get(holder)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Record lookups for entities a committed step introduced.
    pub(super) fn index_step(&self, step: &Event) {
        match step {
            Event::ClaimOpened { claim } => {
                self.claim_index.insert(claim.id, claim.resource_id);
                let mut ids = self.holder_claims.entry(claim.holder.clone()).or_default();
                if !ids.contains(&claim.id) {
                    ids.push(claim.id);
                }
            }
            Event::BookingConfirmed { booking } => {
                self.booking_index.insert(booking.id, booking.resource_id);
            }
            _ => {}
        }
    }

    // ── Replay ───────────────────────────────────────────────

    /// Apply a recovered record in full or not at all. A record whose key is
    /// already applied is a duplicate and is skipped. Nothing else holds a lock
    /// yet, so the non-blocking lock attempts succeed; never block, this may run
    /// inside a runtime.
    fn replay(&self, record: &WalRecord) {
        if let Some(key) = record.key
            && self.commits.contains_key(&key)
        {
            tracing::warn!("replay: skipping duplicate record for commit {key}");
            return;
        }
        if let Err(e) = self.replay_steps(&record.steps) {
            tracing::warn!("replay: skipping record ({} steps): {e}", record.steps.len());
            return;
        }
        for step in &record.steps {
            self.index_step(step);
        }
        if let Some(key) = record.key {
            self.commits.insert(key, record.outcome.clone());
        }
    }

    fn replay_steps(&self, steps: &[Event]) -> Result<(), EngineError> {
        let Some(first) = steps.first() else {
            return Ok(());
        };
        let id = first.resource_id();
        if steps.iter().any(|s| s.resource_id() != id) {
            return Err(EngineError::AtomicityFailure(format!(
                "record for {id} touches other resources"
            )));
        }
        match first {
            Event::InventoryCreated { .. }
            | Event::VenueCreated { .. }
            | Event::InventoryDeleted { .. }
            | Event::VenueDeleted { .. } => match steps {
                [step] => self.replay_catalog(step),
                _ => Err(rejected(first, "catalog change shares a record")),
            },
            Event::InventoryTotalChanged { .. }
            | Event::ClaimOpened { .. }
            | Event::ClaimClosed { .. }
            | Event::AvailableAdjusted { .. } => {
                let shared = self.inventory(&id).ok_or(EngineError::ResourceNotFound(id))?;
                let mut guard = shared.try_write().map_err(contended)?;
                apply_all(&mut *guard, steps).map(drop)
            }
            Event::VenueStatusChanged { .. }
            | Event::BookingConfirmed { .. }
            | Event::BookingCancelled { .. } => {
                let shared = self.venue(&id).ok_or(EngineError::ResourceNotFound(id))?;
                let mut guard = shared.try_write().map_err(contended)?;
                apply_all(&mut *guard, steps).map(drop)
            }
        }
    }

    fn replay_catalog(&self, step: &Event) -> Result<(), EngineError> {
        match step {
            Event::InventoryCreated { id, name, total, available } => {
                if self.contains(id) {
                    return Err(rejected(step, "resource exists"));
                }
                let mut state = InventoryState::new(*id, name.clone(), *total);
                state.available = *available;
                self.insert_inventory(state);
                Ok(())
            }
            Event::VenueCreated { id, name, capacity, status } => {
                if self.contains(id) {
                    return Err(rejected(step, "resource exists"));
                }
                self.insert_venue(VenueState::new(*id, name.clone(), *capacity, *status));
                Ok(())
            }
            Event::InventoryDeleted { id } => {
                let shared = self.inventory(id).ok_or(EngineError::ResourceNotFound(*id))?;
                let guard = shared.try_read().map_err(contended)?;
                self.remove_inventory(&guard);
                Ok(())
            }
            Event::VenueDeleted { id } => {
                let shared = self.venue(id).ok_or(EngineError::ResourceNotFound(*id))?;
                let guard = shared.try_read().map_err(contended)?;
                self.remove_venue(&guard);
                Ok(())
            }
            other => Err(rejected(other, "not a catalog step")),
        }
    }

    // ── Compaction ───────────────────────────────────────────

    /// The minimal record sequence that recreates current state, commit keys included.
    /// Caller holds the compaction guard.
    pub(super) async fn snapshot_records(&self) -> Vec<WalRecord> {
        let mut records = Vec::new();

        for shared in self.inventories() {
            let inv = shared.read().await;
            records.push(unkeyed(Event::InventoryCreated {
                id: inv.id,
                name: inv.name.clone(),
                total: inv.total,
                available: inv.available,
            }));
            // Released claims first, so a holder's returned claim is closed
            // before their current one is opened.
            let mut claims: Vec<&Claim> = inv.claims.values().collect();
            claims.sort_by_key(|c| (c.is_active(), c.claimed_at, c.id));
            for claim in claims {
                let opened = Claim {
                    status: ClaimStatus::Active,
                    released_at: None,
                    ..claim.clone()
                };
                let key = CommitKey::new(CommitOp::Claim, claim.id);
                let outcome = self
                    .commits
                    .get(&key)
                    .map(|e| e.value().clone())
                    .unwrap_or_else(|| Outcome::Claimed(opened.clone()));
                records.push(WalRecord {
                    key: Some(key),
                    steps: vec![Event::ClaimOpened { claim: opened }],
                    outcome,
                });
                if let Some(released_at) = claim.released_at {
                    records.push(WalRecord {
                        key: Some(CommitKey::new(CommitOp::Release, claim.id)),
                        steps: vec![Event::ClaimClosed {
                            claim_id: claim.id,
                            resource_id: inv.id,
                            released_at,
                        }],
                        outcome: Outcome::Released(Released {
                            claim_id: claim.id,
                            resource_id: inv.id,
                            holder: claim.holder.clone(),
                            released_at,
                        }),
                    });
                }
            }
        }

        for shared in self.venues() {
            let venue = shared.read().await;
            records.push(unkeyed(Event::VenueCreated {
                id: venue.id,
                name: venue.name.clone(),
                capacity: venue.capacity,
                status: venue.status,
            }));
            // Cancelled bookings first: each is cancelled before the next is
            // confirmed, so none of them trips the overlap check on replay.
            let (cancelled, confirmed): (Vec<&Booking>, Vec<&Booking>) =
                venue.bookings.iter().partition(|b| !b.is_confirmed());
            for booking in cancelled.into_iter().chain(confirmed) {
                let original = Booking {
                    status: BookingStatus::Confirmed,
                    cancelled_at: None,
                    ..booking.clone()
                };
                records.push(WalRecord {
                    key: Some(CommitKey::new(CommitOp::Book, booking.id)),
                    steps: vec![Event::BookingConfirmed { booking: original.clone() }],
                    outcome: Outcome::Booked(original),
                });
                if let Some(cancelled_at) = booking.cancelled_at {
                    records.push(WalRecord {
                        key: Some(CommitKey::new(CommitOp::Cancel, booking.id)),
                        steps: vec![Event::BookingCancelled {
                            booking_id: booking.id,
                            resource_id: venue.id,
                            cancelled_at,
                        }],
                        outcome: Outcome::Cancelled(Cancelled {
                            booking_id: booking.id,
                            resource_id: venue.id,
                            cancelled_at,
                        }),
                    });
                }
            }
        }

        records
    }
}

fn contended(_: tokio::sync::TryLockError) -> EngineError {
    EngineError::AtomicityFailure("resource locked during replay".into())
}

fn unkeyed(step: Event) -> WalRecord {
    WalRecord {
        key: None,
        steps: vec![step],
        outcome: Outcome::Applied,
    }
}

// ── Step application ─────────────────────────────────────────────

fn rejected(step: &Event, why: impl std::fmt::Display) -> EngineError {
    EngineError::AtomicityFailure(format!("step on {} rejected: {why}", step.resource_id()))
}

pub(crate) enum InventoryUndo {
    RemoveClaim(Ulid),
    ReopenClaim(Ulid),
    SetAvailable(u32),
    SetCounts { total: u32, available: u32 },
}

impl Stepwise for InventoryState {
    type Undo = InventoryUndo;

    fn apply_step(&mut self, step: &Event) -> Result<InventoryUndo, EngineError> {
        if step.resource_id() != self.id {
            return Err(rejected(step, format!("addressed to inventory {}", self.id)));
        }
        match step {
            Event::ClaimOpened { claim } => {
                if self.claims.contains_key(&claim.id) {
                    return Err(rejected(step, format!("claim {} exists", claim.id)));
                }
                if claim.is_active() {
                    if let Some(existing) = self.active_by_holder.get(&claim.holder) {
                        return Err(rejected(step, format!("holder already has claim {existing}")));
                    }
                    self.active_by_holder.insert(claim.holder.clone(), claim.id);
                }
                self.claims.insert(claim.id, claim.clone());
                Ok(InventoryUndo::RemoveClaim(claim.id))
            }
            Event::ClaimClosed { claim_id, released_at, .. } => {
                let claim = self
                    .claims
                    .get_mut(claim_id)
                    .filter(|c| c.is_active())
                    .ok_or_else(|| rejected(step, format!("claim {claim_id} is not active")))?;
                claim.status = ClaimStatus::Released;
                claim.released_at = Some(*released_at);
                self.active_by_holder.remove(&claim.holder);
                Ok(InventoryUndo::ReopenClaim(*claim_id))
            }
            Event::AvailableAdjusted { delta, .. } => {
                let next = i64::from(self.available) + i64::from(*delta);
                if next < 0 || next > i64::from(self.total) {
                    return Err(rejected(
                        step,
                        format!("available {next} outside [0, {}]", self.total),
                    ));
                }
                let previous = self.available;
                self.available = next as u32;
                Ok(InventoryUndo::SetAvailable(previous))
            }
            Event::InventoryTotalChanged { total, .. } => {
                let active = self.active_count();
                if *total < active {
                    return Err(rejected(step, format!("total {total} below {active} active")));
                }
                let undo = InventoryUndo::SetCounts {
                    total: self.total,
                    available: self.available,
                };
                self.total = *total;
                self.available = total - active;
                Ok(undo)
            }
            other => Err(rejected(other, "not an inventory step")),
        }
    }

    fn undo_step(&mut self, undo: InventoryUndo) {
        match undo {
            InventoryUndo::RemoveClaim(id) => {
                if let Some(claim) = self.claims.remove(&id)
                    && self.active_by_holder.get(&claim.holder) == Some(&id)
                {
                    self.active_by_holder.remove(&claim.holder);
                }
            }
            InventoryUndo::ReopenClaim(id) => {
                if let Some(claim) = self.claims.get_mut(&id) {
                    claim.status = ClaimStatus::Active;
                    claim.released_at = None;
                    self.active_by_holder.insert(claim.holder.clone(), id);
                }
            }
            InventoryUndo::SetAvailable(available) => self.available = available,
            InventoryUndo::SetCounts { total, available } => {
                self.total = total;
                self.available = available;
            }
        }
    }
}

pub(crate) enum VenueUndo {
    RemoveBooking(Ulid),
    Reconfirm(Ulid),
    SetStatus(VenueStatus),
}

impl Stepwise for VenueState {
    type Undo = VenueUndo;

    fn apply_step(&mut self, step: &Event) -> Result<VenueUndo, EngineError> {
        if step.resource_id() != self.id {
            return Err(rejected(step, format!("addressed to venue {}", self.id)));
        }
        match step {
            Event::BookingConfirmed { booking } => {
                if self.booking(booking.id).is_some() {
                    return Err(rejected(step, format!("booking {} exists", booking.id)));
                }
                if booking.is_confirmed()
                    && let Some(other) = self.confirmed_overlapping(&booking.span).next()
                {
                    return Err(rejected(step, format!("overlaps booking {}", other.id)));
                }
                self.insert_booking(booking.clone());
                Ok(VenueUndo::RemoveBooking(booking.id))
            }
            Event::BookingCancelled { booking_id, cancelled_at, .. } => {
                let booking = self
                    .booking_mut(*booking_id)
                    .filter(|b| b.is_confirmed())
                    .ok_or_else(|| rejected(step, format!("booking {booking_id} not confirmed")))?;
                booking.status = BookingStatus::Cancelled;
                booking.cancelled_at = Some(*cancelled_at);
                Ok(VenueUndo::Reconfirm(*booking_id))
            }
            Event::VenueStatusChanged { status, .. } => {
                let previous = self.status;
                self.status = *status;
                Ok(VenueUndo::SetStatus(previous))
            }
            other => Err(rejected(other, "not a venue step")),
        }
    }

    fn undo_step(&mut self, undo: VenueUndo) {
        match undo {
            VenueUndo::RemoveBooking(id) => {
                self.remove_booking(id);
            }
            VenueUndo::Reconfirm(id) => {
                if let Some(b) = self.booking_mut(id) {
                    b.status = BookingStatus::Confirmed;
                    b.cancelled_at = None;
                }
            }
            VenueUndo::SetStatus(status) => self.status = status,
        }
    }
}
