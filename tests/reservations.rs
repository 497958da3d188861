use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use reserva::config::{Config, EngineConfig};
use reserva::engine::{Engine, EngineError, ErrorClass, Store};
use reserva::identity::{Directory, HolderKey, HolderRecord, InMemoryDirectory};
use reserva::model::{HolderRef, Span, VenueStatus};
use reserva::sweeper;

const H: i64 = 3_600_000;
/// 2026-03-02T00:00:00Z
const DAY: i64 = 1_772_409_600_000;

// ── Test infrastructure ──────────────────────────────────────

fn test_config() -> Config {
    let dir = std::env::temp_dir().join(format!("reserva_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    Config {
        data_dir: dir,
        ..Config::default()
    }
}

fn campus_directory() -> Arc<InMemoryDirectory> {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.upsert(HolderRecord {
        id: HolderRef::new("person-1"),
        secondary_id: Some("21CS042".into()),
        account_id: Some("asha@campus".into()),
        active: true,
    });
    directory.upsert(HolderRecord {
        id: HolderRef::new("person-2"),
        secondary_id: Some("EMP-77".into()),
        account_id: None,
        active: true,
    });
    directory.upsert(HolderRecord {
        id: HolderRef::new("person-3"),
        secondary_id: Some("19ME001".into()),
        account_id: None,
        active: false,
    });
    directory
}

fn start_engine(config: &Config, directory: Arc<dyn Directory>) -> Engine {
    let store = Arc::new(Store::open(&config.wal_path()).unwrap());
    Engine::new(store, directory, config.engine.clone())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn library_loan_by_roll_number() {
    let config = test_config();
    let engine = start_engine(&config, campus_directory());
    let book = Ulid::new();
    engine
        .create_inventory(book, Some("Operating Systems, 10th ed.".into()), 2)
        .await
        .unwrap();

    let by_roll = engine.resolve_holder("21CS042").unwrap();
    let by_account = engine.resolve_holder("asha@campus").unwrap();
    assert_eq!(by_roll, by_account);

    let claim = engine.claim_unit(Ulid::new(), book, &by_roll).await.unwrap();
    assert_eq!(claim.holder, HolderRef::new("person-1"));

    // The same person under another identifier still holds that copy
    let err = engine
        .claim_unit(Ulid::new(), book, &by_account)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Conflict);

    let loans = engine.active_claims_for(&by_account).await;
    assert_eq!(loans.len(), 1);
    assert_eq!(loans[0].id, claim.id);
}

#[tokio::test]
async fn inactive_holder_is_not_resolved() {
    let config = test_config();
    let engine = start_engine(&config, campus_directory());
    let err = engine.resolve_holder("19ME001").unwrap_err();
    assert!(matches!(err, EngineError::HolderNotFound(_)));
    assert_eq!(err.class(), ErrorClass::NotFound);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn seminar_hall_day_schedule() {
    let config = test_config();
    let engine = start_engine(&config, campus_directory());
    let hall = Ulid::new();
    engine
        .create_venue(hall, Some("Seminar Hall B".into()), 180, VenueStatus::Available)
        .await
        .unwrap();
    let staff = engine.resolve_holder("EMP-77").unwrap();

    engine
        .create_booking(Ulid::new(), hall, &staff, DAY + 10 * H, DAY + 11 * H)
        .await
        .unwrap();
    let err = engine
        .create_booking(Ulid::new(), hall, &staff, DAY + 10 * H + H / 2, DAY + 11 * H + H / 2)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TimeConflict { .. }));
    assert!(err.user_message().contains("conflict"));

    engine
        .create_booking(Ulid::new(), hall, &staff, DAY + 11 * H, DAY + 12 * H)
        .await
        .unwrap();

    let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
    let booked = engine.bookings_for_resource_on_date(hall, date).await.unwrap();
    assert_eq!(booked.len(), 2);
    assert!(booked.windows(2).all(|w| w[0].span.start <= w[1].span.start));

    let free = engine.free_windows_on_date(hall, date).await.unwrap();
    assert_eq!(
        free,
        vec![Span::new(DAY, DAY + 10 * H), Span::new(DAY + 12 * H, DAY + 24 * H)]
    );
}

#[tokio::test]
async fn restart_keeps_loans_and_bookings() {
    let config = test_config();
    let book = Ulid::new();
    let hall = Ulid::new();
    let claim_id = Ulid::new();
    let booking_id = Ulid::new();
    {
        let engine = start_engine(&config, campus_directory());
        engine.create_inventory(book, None, 1).await.unwrap();
        engine
            .create_venue(hall, None, 50, VenueStatus::Available)
            .await
            .unwrap();
        let holder = engine.resolve_holder("person-1").unwrap();
        engine.claim_unit(claim_id, book, &holder).await.unwrap();
        engine
            .create_booking(booking_id, hall, &holder, DAY, DAY + H)
            .await
            .unwrap();
        engine.compact().await.unwrap();
        engine.cancel_booking(booking_id).await.unwrap();
    }

    let engine = start_engine(&config, campus_directory());
    assert_eq!(engine.get_inventory(book).await.unwrap().available, 0);
    assert!(engine.release_unit(claim_id).await.unwrap().record().claim_id == claim_id);
    assert_eq!(engine.get_inventory(book).await.unwrap().available, 1);
    assert!(engine.cancel_booking(booking_id).await.unwrap().was_already_cancelled());
}

#[tokio::test]
async fn overdue_loans_are_returned_by_sweeper() {
    let mut config = test_config();
    config.engine = EngineConfig {
        loan_period_ms: -H,
        ..EngineConfig::default()
    };
    let engine = start_engine(&config, campus_directory());
    let kit = Ulid::new();
    engine.create_inventory(kit, Some("Arduino kit".into()), 3).await.unwrap();
    let holder = engine.resolve_holder("21CS042").unwrap();
    engine.claim_unit(Ulid::new(), kit, &holder).await.unwrap();

    assert_eq!(sweeper::sweep_once(&engine, true).await, 1);
    assert_eq!(engine.get_inventory(kit).await.unwrap().available, 3);
    assert!(engine.active_claims_for(&holder).await.is_empty());
}

/// A directory backed by a plain map, as an external service adapter would be.
struct StaticDirectory(HashMap<(HolderKey, String), HolderRecord>);

impl Directory for StaticDirectory {
    fn find(&self, key: HolderKey, value: &str) -> Option<HolderRecord> {
        self.0.get(&(key, value.to_string())).cloned()
    }
}

#[tokio::test]
async fn custom_directory_plugs_in() {
    let record = HolderRecord {
        id: HolderRef::new("p-9"),
        secondary_id: Some("R-9".into()),
        account_id: None,
        active: true,
    };
    let mut entries = HashMap::new();
    entries.insert((HolderKey::Primary, "p-9".to_string()), record.clone());
    entries.insert((HolderKey::Secondary, "R-9".to_string()), record);

    let config = test_config();
    let engine = start_engine(&config, Arc::new(StaticDirectory(entries)));
    assert_eq!(
        engine.resolve_holder("R-9").unwrap(),
        engine.resolve_holder("p-9").unwrap()
    );
}
