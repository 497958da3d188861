use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Canonical reference to a holder: the directory's primary record id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HolderRef(pub String);

impl HolderRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Fungible resources (inventory) ───────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimStatus {
    Active,
    Released,
}

/// One holder's possession of one unit of an inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub holder: HolderRef,
    pub claimed_at: Ms,
    pub due_at: Ms,
    pub status: ClaimStatus,
    pub released_at: Option<Ms>,
}

impl Claim {
    pub fn is_active(&self) -> bool {
        self.status == ClaimStatus::Active
    }
}

/// Record of a completed release, returned on first release and on every replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Released {
    pub claim_id: Ulid,
    pub resource_id: Ulid,
    pub holder: HolderRef,
    pub released_at: Ms,
}

/// A resource type with `total` interchangeable units.
#[derive(Debug, Clone)]
pub struct InventoryState {
    pub id: Ulid,
    pub name: Option<String>,
    pub total: u32,
    /// Authoritative counter, updated in the same commit as the claim it accounts for.
    pub available: u32,
    /// Every claim ever recorded, active and released.
    pub claims: HashMap<Ulid, Claim>,
    /// holder → their active claim on this resource.
    pub active_by_holder: HashMap<HolderRef, Ulid>,
}

impl InventoryState {
    pub fn new(id: Ulid, name: Option<String>, total: u32) -> Self {
        Self {
            id,
            name,
            total,
            available: total,
            claims: HashMap::new(),
            active_by_holder: HashMap::new(),
        }
    }

    pub fn active_count(&self) -> u32 {
        self.active_by_holder.len() as u32
    }

    pub fn active_claim_of(&self, holder: &HolderRef) -> Option<&Claim> {
        self.active_by_holder
            .get(holder)
            .and_then(|id| self.claims.get(id))
    }

    /// `0 <= available <= total` and `available == total - active`.
    pub fn is_consistent(&self) -> bool {
        let active = self.claims.values().filter(|c| c.is_active()).count() as u32;
        self.available <= self.total
            && active == self.active_count()
            && self.total.checked_sub(active) == Some(self.available)
    }

    pub fn info(&self) -> InventoryInfo {
        InventoryInfo {
            id: self.id,
            name: self.name.clone(),
            total: self.total,
            available: self.available,
            active_claims: self.active_count(),
        }
    }
}

// ── Schedulable resources (venues) ───────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VenueStatus {
    Available,
    Maintenance,
    ReservedPermanently,
}

impl fmt::Display for VenueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueStatus::Available => f.write_str("available"),
            VenueStatus::Maintenance => f.write_str("maintenance"),
            VenueStatus::ReservedPermanently => f.write_str("reserved-permanently"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

/// One reserved time window on a venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester: HolderRef,
    pub span: Span,
    pub status: BookingStatus,
    pub cancelled_at: Option<Ms>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// Record of a completed cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancelled {
    pub booking_id: Ulid,
    pub resource_id: Ulid,
    pub cancelled_at: Ms,
}

#[derive(Debug, Clone)]
pub struct VenueState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Head-count of the venue. Informational: one booking occupies the whole venue.
    pub capacity: u32,
    pub status: VenueStatus,
    /// All bookings (confirmed and cancelled), sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl VenueState {
    pub fn new(id: Ulid, name: Option<String>, capacity: u32, status: VenueStatus) -> Self {
        Self {
            id,
            name,
            capacity,
            status,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Confirmed bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn confirmed_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.is_confirmed() && b.span.end > query.start)
    }

    pub fn confirmed_count(&self) -> usize {
        self.bookings.iter().filter(|b| b.is_confirmed()).count()
    }

    pub fn info(&self) -> VenueInfo {
        VenueInfo {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
            status: self.status,
            confirmed_bookings: self.confirmed_count(),
        }
    }
}

// ── Journal records ──────────────────────────────────────────────

/// A single state transition. A commit is an ordered list of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    InventoryCreated {
        id: Ulid,
        name: Option<String>,
        total: u32,
        available: u32,
    },
    InventoryTotalChanged {
        id: Ulid,
        total: u32,
    },
    InventoryDeleted {
        id: Ulid,
    },
    ClaimOpened {
        claim: Claim,
    },
    ClaimClosed {
        claim_id: Ulid,
        resource_id: Ulid,
        released_at: Ms,
    },
    AvailableAdjusted {
        resource_id: Ulid,
        delta: i32,
    },
    VenueCreated {
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        status: VenueStatus,
    },
    VenueStatusChanged {
        id: Ulid,
        status: VenueStatus,
    },
    VenueDeleted {
        id: Ulid,
    },
    BookingConfirmed {
        booking: Booking,
    },
    BookingCancelled {
        booking_id: Ulid,
        resource_id: Ulid,
        cancelled_at: Ms,
    },
}

impl Event {
    /// The resource this event mutates.
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::InventoryCreated { id, .. }
            | Event::InventoryTotalChanged { id, .. }
            | Event::InventoryDeleted { id }
            | Event::VenueCreated { id, .. }
            | Event::VenueStatusChanged { id, .. }
            | Event::VenueDeleted { id } => *id,
            Event::ClaimOpened { claim } => claim.resource_id,
            Event::BookingConfirmed { booking } => booking.resource_id,
            Event::ClaimClosed { resource_id, .. }
            | Event::AvailableAdjusted { resource_id, .. }
            | Event::BookingCancelled { resource_id, .. } => *resource_id,
        }
    }
}

/// Which operation a commit key belongs to. Keys for different operations on
/// the same entity (claim then release) never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitOp {
    Claim,
    Release,
    Book,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitKey {
    pub op: CommitOp,
    pub id: Ulid,
}

impl CommitKey {
    pub fn new(op: CommitOp, id: Ulid) -> Self {
        Self { op, id }
    }
}

impl fmt::Display for CommitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.op, self.id)
    }
}

/// What a keyed commit produced. Stored so that replays return it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Claimed(Claim),
    Released(Released),
    Booked(Booking),
    Cancelled(Cancelled),
    /// Catalog changes carry no result.
    Applied,
}

/// One journal entry. All steps of a commit share a single entry, so a
/// torn write drops the whole commit on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub key: Option<CommitKey>,
    pub steps: Vec<Event>,
    pub outcome: Outcome,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub total: u32,
    pub available: u32,
    pub active_claims: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub capacity: u32,
    pub status: VenueStatus,
    pub confirmed_bookings: usize,
}

/// A confirmed booking that blocked a request, reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingBooking {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
}
