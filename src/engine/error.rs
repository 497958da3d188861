use ulid::Ulid;

use crate::model::{ConflictingBooking, HolderRef, Ms, VenueStatus};

/// How a caller should treat an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Something the caller named does not exist. An expected negative result.
    NotFound,
    /// Contention or state outcome the caller can explain to an end user.
    Conflict,
    /// Rejected before any state was touched.
    InvalidInput,
    /// Storage or atomicity fault. Nothing was applied; safe to retry.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    ResourceNotFound(Ulid),
    ClaimNotFound(Ulid),
    BookingNotFound(Ulid),
    HolderNotFound(String),
    AlreadyExists(Ulid),
    OutOfStock {
        resource_id: Ulid,
        total: u32,
    },
    AlreadyClaimed {
        resource_id: Ulid,
        holder: HolderRef,
        existing: Ulid,
    },
    TimeConflict {
        resource_id: Ulid,
        conflicts: Vec<ConflictingBooking>,
    },
    ResourceUnavailable {
        resource_id: Ulid,
        status: VenueStatus,
    },
    HasActiveClaims {
        resource_id: Ulid,
        active: u32,
    },
    HasBookings {
        resource_id: Ulid,
        confirmed: usize,
    },
    InvalidRange {
        start: Ms,
        end: Ms,
    },
    InvalidTotal {
        total: u32,
        active: u32,
    },
    LimitExceeded(&'static str),
    AtomicityFailure(String),
    EngineUnavailable(String),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::ResourceNotFound(_)
            | EngineError::ClaimNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::HolderNotFound(_) => ErrorClass::NotFound,
            EngineError::AlreadyExists(_)
            | EngineError::OutOfStock { .. }
            | EngineError::AlreadyClaimed { .. }
            | EngineError::TimeConflict { .. }
            | EngineError::ResourceUnavailable { .. }
            | EngineError::HasActiveClaims { .. }
            | EngineError::HasBookings { .. } => ErrorClass::Conflict,
            EngineError::InvalidRange { .. }
            | EngineError::InvalidTotal { .. }
            | EngineError::LimitExceeded(_) => ErrorClass::InvalidInput,
            EngineError::AtomicityFailure(_) | EngineError::EngineUnavailable(_) => {
                ErrorClass::Unavailable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Unavailable
    }

    /// Text safe to show an end user. Storage faults are reported generically.
    pub fn user_message(&self) -> String {
        match self.class() {
            ErrorClass::Unavailable => {
                "the reservation service is temporarily unavailable, please retry".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::ResourceNotFound(_) => "resource_not_found",
            EngineError::ClaimNotFound(_) => "claim_not_found",
            EngineError::BookingNotFound(_) => "booking_not_found",
            EngineError::HolderNotFound(_) => "holder_not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::OutOfStock { .. } => "out_of_stock",
            EngineError::AlreadyClaimed { .. } => "already_claimed",
            EngineError::TimeConflict { .. } => "time_conflict",
            EngineError::ResourceUnavailable { .. } => "resource_unavailable",
            EngineError::HasActiveClaims { .. } => "has_active_claims",
            EngineError::HasBookings { .. } => "has_bookings",
            EngineError::InvalidRange { .. } => "invalid_range",
            EngineError::InvalidTotal { .. } => "invalid_total",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::AtomicityFailure(_) => "atomicity_failure",
            EngineError::EngineUnavailable(_) => "unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::ClaimNotFound(id) => write!(f, "claim not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::HolderNotFound(candidate) => {
                write!(f, "no holder matches identifier {candidate:?}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::OutOfStock { resource_id, total } => {
                write!(f, "all {total} units of {resource_id} are claimed")
            }
            EngineError::AlreadyClaimed {
                resource_id,
                holder,
                existing,
            } => write!(
                f,
                "holder {holder} already holds a unit of {resource_id} (claim {existing})"
            ),
            EngineError::TimeConflict {
                resource_id,
                conflicts,
            } => {
                write!(f, "requested window conflicts on {resource_id} with")?;
                for (i, c) in conflicts.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{sep}booking {} [{}, {})", c.id, c.start, c.end)?;
                }
                Ok(())
            }
            EngineError::ResourceUnavailable {
                resource_id,
                status,
            } => write!(f, "resource {resource_id} is not bookable: {status}"),
            EngineError::HasActiveClaims {
                resource_id,
                active,
            } => write!(f, "resource {resource_id} has {active} active claims"),
            EngineError::HasBookings {
                resource_id,
                confirmed,
            } => write!(f, "resource {resource_id} has {confirmed} confirmed bookings"),
            EngineError::InvalidRange { start, end } => {
                write!(f, "invalid range: start {start} must be before end {end}")
            }
            EngineError::InvalidTotal { total, active } => {
                write!(f, "total {total} is below the {active} units currently claimed")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::AtomicityFailure(e) => write!(f, "atomic commit rolled back: {e}"),
            EngineError::EngineUnavailable(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_faults_are_hidden_from_users() {
        let err = EngineError::EngineUnavailable("fsync: EIO on /data/reserva.wal".into());
        assert!(err.is_retryable());
        assert!(!err.user_message().contains("fsync"));
        assert!(err.to_string().contains("fsync"));
    }

    #[test]
    fn conflicts_name_the_blocking_bookings() {
        let a = Ulid::new();
        let b = Ulid::new();
        let err = EngineError::TimeConflict {
            resource_id: Ulid::new(),
            conflicts: vec![
                ConflictingBooking { id: a, start: 0, end: 10 },
                ConflictingBooking { id: b, start: 10, end: 20 },
            ],
        };
        assert_eq!(err.class(), ErrorClass::Conflict);
        let msg = err.user_message();
        assert!(msg.contains(&a.to_string()));
        assert!(msg.contains(&b.to_string()));
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = EngineError::HolderNotFound("CS-2041".into());
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert!(!err.is_retryable());
    }
}
