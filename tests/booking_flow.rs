use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::future::join_all;
use ulid::Ulid;

use clinicsched::engine::{Engine, EngineError};
use clinicsched::model::*;
use clinicsched::notify::NotifyHub;

const H: Ms = 3_600_000;
const M: Ms = 60_000;

/// 2024-03-15T00:00:00Z
const DAY: Ms = 1_710_460_800_000;

// ── Test infrastructure ──────────────────────────────────────

fn start_engine() -> (Arc<Engine>, PathBuf) {
    let dir = std::env::temp_dir().join(format!("clinicsched_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("clinicsched.wal");
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
    (Arc::new(engine), path)
}

struct Clinic {
    location: Ulid,
    provider: Ulid,
    consult: Ulid,
    block: Ulid,
    slots: Vec<Ulid>,
}

/// A morning clinic: 09:00–12:00, six 30-minute slots, 15-minute consults.
async fn morning_clinic(engine: &Engine) -> Clinic {
    let consult = Ulid::new();
    engine
        .save_appointment_type(AppointmentType {
            id: consult,
            name: "Consult".into(),
            duration_minutes: Some(15),
            description: Some("Standard consultation".into()),
            retire_reason: None,
        })
        .await
        .unwrap();

    let location = Ulid::new();
    let provider = Ulid::new();
    let block = Ulid::new();
    engine
        .save_appointment_block(AppointmentBlock {
            id: block,
            span: Span::new(DAY + 9 * H, DAY + 12 * H),
            location_id: location,
            owner: BlockOwner::Provider(provider),
            appointment_types: vec![consult],
            void_reason: None,
        })
        .await
        .unwrap();
    let slots = engine.create_time_slots_for_block(block, 30).await.unwrap();

    Clinic {
        location,
        provider,
        consult,
        block,
        slots,
    }
}

fn request(slot: Ulid, appointment_type: Ulid) -> NewAppointment {
    NewAppointment {
        id: Ulid::new(),
        patient_id: Ulid::new(),
        time_slot_id: slot,
        visit_id: None,
        appointment_type_id: appointment_type,
        duration_minutes: None,
        reason: None,
    }
}

// ── Booking flow ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_across_slots() {
    let (engine, _) = start_engine();
    let clinic = morning_clinic(&engine).await;
    assert_eq!(clinic.slots.len(), 6);

    // Three requests per slot; only two 15-minute consults fit in 30 minutes.
    let futures = clinic.slots.iter().flat_map(|&slot| {
        let engine = engine.clone();
        let consult = clinic.consult;
        (0..3).map(move |_| {
            let engine = engine.clone();
            async move { engine.book_appointment(request(slot, consult), false).await }
        })
    });
    let results = join_all(futures).await;

    let booked = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(booked, 12);
    for r in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(r.is_retryable_with_overbook(), "unexpected error: {r}");
    }
    for slot in &clinic.slots {
        assert_eq!(engine.remaining_minutes(*slot).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn full_slot_prompts_overbook() {
    let (engine, _) = start_engine();
    let clinic = morning_clinic(&engine).await;
    let slot = clinic.slots[0];

    engine.book_appointment(request(slot, clinic.consult), false).await.unwrap();
    engine.book_appointment(request(slot, clinic.consult), false).await.unwrap();

    let req = request(slot, clinic.consult);
    let err = engine.book_appointment(req.clone(), false).await.unwrap_err();
    assert!(matches!(err, EngineError::TimeSlotFull { requested_minutes: 15, remaining_minutes: 0, .. }));
    assert_eq!(err.to_string(), format!("time slot {slot} is full: requested 15 min, 0 min remaining"));

    // Caller accepts the overbook prompt
    engine.book_appointment(req, true).await.unwrap();
    assert_eq!(engine.remaining_minutes(slot).await.unwrap(), -15);
}

#[tokio::test]
async fn day_of_clinic_then_reconcile() {
    let (engine, _) = start_engine();
    let clinic = morning_clinic(&engine).await;

    let seen = engine.book_appointment(request(clinic.slots[0], clinic.consult), false).await.unwrap();
    let no_show = engine.book_appointment(request(clinic.slots[1], clinic.consult), false).await.unwrap();
    let cancelled = engine.book_appointment(request(clinic.slots[2], clinic.consult), false).await.unwrap();

    let t = seen.history[0].start;
    engine
        .change_appointment_status_at(seen.id, AppointmentStatus::Waiting, t + M)
        .await
        .unwrap();
    engine
        .change_appointment_status_at(seen.id, AppointmentStatus::InConsultation, t + 10 * M)
        .await
        .unwrap();
    engine
        .change_appointment_status(cancelled.id, AppointmentStatus::Cancelled)
        .await
        .unwrap();

    // DAY is in the past, so everything still pending is past due.
    let run = t + 30 * M;
    let report = engine.reconcile_past_due(run).await;
    assert!(report.failed.is_empty());
    let mut updated: Vec<(Ulid, AppointmentStatus)> = report.updated.iter().map(|a| (a.id, a.status)).collect();
    updated.sort();
    let mut expected = vec![
        (seen.id, AppointmentStatus::Completed),
        (no_show.id, AppointmentStatus::Missed),
    ];
    expected.sort();
    assert_eq!(updated, expected);

    let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
    let daily = engine.list_daily_scheduled_blocks(clinic.location, date).await;
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].appointment_count(), 1);

    let waits = engine
        .get_average_duration(t, run, AppointmentStatus::Waiting, GroupBy::Provider)
        .await
        .unwrap();
    assert_eq!(waits.get(&clinic.provider).copied(), Some(9.0));
}

#[tokio::test]
async fn scheduled_block_serializes_for_ui() {
    let (engine, _) = start_engine();
    let clinic = morning_clinic(&engine).await;
    let appt = engine
        .book_appointment(request(clinic.slots[0], clinic.consult), false)
        .await
        .unwrap();

    let view = engine.build_scheduled_block(clinic.block).await.unwrap();
    let json = serde_json::to_value(&view).unwrap();

    assert_eq!(json["block"]["id"], clinic.block.to_string());
    assert_eq!(json["block"]["owner"]["Provider"], clinic.provider.to_string());
    assert_eq!(json["slots"].as_array().unwrap().len(), 6);
    assert_eq!(json["slots"][0]["unallocated_minutes"], 15);
    assert_eq!(json["slots"][1]["unallocated_minutes"], 30);
    assert_eq!(json["slots"][0]["appointments"][0]["id"], appt.id.to_string());
    assert_eq!(json["slots"][0]["appointments"][0]["status"], "Scheduled");
}

#[tokio::test]
async fn state_survives_restart() {
    let (engine, path) = start_engine();
    let clinic = morning_clinic(&engine).await;
    let appt = engine
        .book_appointment(request(clinic.slots[3], clinic.consult), false)
        .await
        .unwrap();
    engine
        .change_appointment_status(appt.id, AppointmentStatus::Waiting)
        .await
        .unwrap();
    drop(engine);

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let restored = engine.get_appointment(&appt.id).await.unwrap();
    assert_eq!(restored.status, AppointmentStatus::Waiting);
    assert_eq!(restored.history.len(), 2);
    assert_eq!(engine.get_time_slots_in_block(clinic.block).await.len(), 6);
    assert_eq!(engine.remaining_minutes(clinic.slots[3]).await.unwrap(), 15);
}
