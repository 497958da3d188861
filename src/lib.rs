//! Campus resource reservation engine.
//!
//! Lendable stock (books, lab kits, laptops) is tracked as inventories of
//! interchangeable units that holders claim and release. Venues are booked
//! for non-overlapping time windows. Every mutation commits atomically to a
//! write-ahead log and is replay-safe under its caller-supplied id.

pub mod config;
pub mod engine;
pub mod identity;
pub mod journal;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sweeper;
pub mod wal;
