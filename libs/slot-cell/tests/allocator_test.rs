// libs/slot-cell/tests/allocator_test.rs
use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shared_utils::test_utils::{MockStoreResponses, TestConfig};
use slot_cell::models::{SlotError, SlotStatus};
use slot_cell::services::allocator::SlotAllocatorService;

const TOKEN: &str = "test-token";

#[tokio::test]
async fn hold_wins_on_available_slot() {
    let server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&server.uri()).to_app_config();

    let slot_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();
    let expires = Utc::now() + Duration::seconds(120);

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/time_slots"))
        .and(query_param("id", format!("eq.{}", slot_id)))
        .and(query_param("status", "eq.available"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::held_slot(slot_id, doctor_id, patient_id, expires)
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let allocator = SlotAllocatorService::new(&config);
    let grant = allocator.hold(slot_id, patient_id, TOKEN).await.unwrap();

    assert_eq!(grant.slot_id, slot_id);
    assert!(grant.countdown_seconds > 0 && grant.countdown_seconds <= 120);
}

#[tokio::test]
async fn hold_loser_gets_already_held() {
    let server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&server.uri()).to_app_config();

    let slot_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();
    let winner = Uuid::new_v4();
    let loser = Uuid::new_v4();

    // Both the available write and the expired-hold takeover match nothing.
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/time_slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&server)
        .await;

    // Re-read shows the winner's live hold.
    Mock::given(method("GET"))
        .and(path("/rest/v1/time_slots"))
        .and(query_param("id", format!("eq.{}", slot_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::held_slot(slot_id, doctor_id, winner, Utc::now() + Duration::seconds(90))
        ])))
        .mount(&server)
        .await;

    let allocator = SlotAllocatorService::new(&config);
    let result = allocator.hold(slot_id, loser, TOKEN).await;

    assert_matches!(result, Err(SlotError::AlreadyHeld));
}

#[tokio::test]
async fn hold_takes_over_expired_hold_without_waiting_for_sweep() {
    let server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&server.uri()).to_app_config();

    let slot_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();

    // Not available any more.
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/time_slots"))
        .and(query_param("status", "eq.available"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    // The stale-deadline takeover write succeeds.
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/time_slots"))
        .and(query_param("status", "eq.hold"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::held_slot(slot_id, doctor_id, patient_id, Utc::now() + Duration::seconds(120))
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let allocator = SlotAllocatorService::new(&config);
    let grant = allocator.hold(slot_id, patient_id, TOKEN).await.unwrap();

    assert_eq!(grant.slot_id, slot_id);
}

#[tokio::test]
async fn hold_by_schedule_resolves_then_claims() {
    let server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&server.uri()).to_app_config();

    let slot_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/time_slots"))
        .and(query_param("doctor_id", format!("eq.{}", doctor_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::available_slot(slot_id, doctor_id)
        ])))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/time_slots"))
        .and(query_param("id", format!("eq.{}", slot_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::held_slot(slot_id, doctor_id, patient_id, Utc::now() + Duration::seconds(120))
        ])))
        .mount(&server)
        .await;

    let allocator = SlotAllocatorService::new(&config);
    let grant = allocator
        .hold_by_schedule(
            doctor_id,
            "2026-09-01".parse().unwrap(),
            "10:00:00".parse().unwrap(),
            patient_id,
            TOKEN,
        )
        .await
        .unwrap();

    assert_eq!(grant.slot_id, slot_id);
}

#[tokio::test]
async fn release_of_unowned_hold_is_a_successful_noop() {
    let server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&server.uri()).to_app_config();

    let slot_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/time_slots"))
        .and(query_param("held_by", format!("eq.{}", patient_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let allocator = SlotAllocatorService::new(&config);
    let released = allocator.release(slot_id, patient_id, TOKEN).await.unwrap();

    assert!(released);
}

#[tokio::test]
async fn commit_succeeds_from_own_unexpired_hold() {
    let server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&server.uri()).to_app_config();

    let slot_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/time_slots"))
        .and(query_param("held_by", format!("eq.{}", patient_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::booked_slot(slot_id, doctor_id, appointment_id)
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let allocator = SlotAllocatorService::new(&config);
    let slot = allocator.commit(slot_id, patient_id, appointment_id, TOKEN).await.unwrap();

    assert_eq!(slot.status, SlotStatus::Booked);
    assert_eq!(slot.appointment_id, Some(appointment_id));
}

#[tokio::test]
async fn commit_on_expired_hold_fails_and_frees_the_slot() {
    let server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&server.uri()).to_app_config();

    let slot_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();

    // Own-hold write, direct write and the expired-hold cleanup all PATCH the
    // same table; the first two match nothing, the cleanup runs last.
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/time_slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(3)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/time_slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::held_slot(slot_id, doctor_id, patient_id, Utc::now() - Duration::seconds(30))
        ])))
        .mount(&server)
        .await;

    let allocator = SlotAllocatorService::new(&config);
    let result = allocator.commit(slot_id, patient_id, appointment_id, TOKEN).await;

    assert_matches!(result, Err(SlotError::HoldExpired));
}

#[tokio::test]
async fn commit_denied_when_slot_is_held_by_someone_else() {
    let server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&server.uri()).to_app_config();

    let slot_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();
    let owner = Uuid::new_v4();
    let intruder = Uuid::new_v4();

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/time_slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/time_slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::held_slot(slot_id, doctor_id, owner, Utc::now() + Duration::seconds(90))
        ])))
        .mount(&server)
        .await;

    let allocator = SlotAllocatorService::new(&config);
    let result = allocator.commit(slot_id, intruder, Uuid::new_v4(), TOKEN).await;

    assert_matches!(result, Err(SlotError::HeldByOther));
}

#[tokio::test]
async fn mark_terminal_rejects_non_terminal_outcome() {
    let server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&server.uri()).to_app_config();

    let allocator = SlotAllocatorService::new(&config);
    let result = allocator.mark_terminal(Uuid::new_v4(), SlotStatus::Hold, TOKEN).await;

    assert_matches!(result, Err(SlotError::ValidationError(_)));
    // No store call is made for an invalid outcome.
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn mark_terminal_is_idempotent_for_repeated_outcome() {
    let server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&server.uri()).to_app_config();

    let slot_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/time_slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/time_slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::terminal_slot(slot_id, doctor_id, appointment_id, "cancelled")
        ])))
        .mount(&server)
        .await;

    let allocator = SlotAllocatorService::new(&config);
    let slot = allocator.mark_terminal(slot_id, SlotStatus::Cancelled, TOKEN).await.unwrap();

    assert_eq!(slot.status, SlotStatus::Cancelled);
}

#[tokio::test]
async fn reopen_is_idempotent_when_already_available() {
    let server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&server.uri()).to_app_config();

    let slot_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/time_slots"))
        .and(query_param("status", "in.(cancelled,no_show)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/time_slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::available_slot(slot_id, doctor_id)
        ])))
        .mount(&server)
        .await;

    let allocator = SlotAllocatorService::new(&config);
    let slot = allocator.reopen(slot_id, TOKEN).await.unwrap();

    assert_eq!(slot.status, SlotStatus::Available);
}

#[tokio::test]
async fn reopen_rejects_a_booked_slot() {
    let server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&server.uri()).to_app_config();

    let slot_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/time_slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/time_slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::booked_slot(slot_id, doctor_id, Uuid::new_v4())
        ])))
        .mount(&server)
        .await;

    let allocator = SlotAllocatorService::new(&config);
    let result = allocator.reopen(slot_id, TOKEN).await;

    assert_matches!(
        result,
        Err(SlotError::InvalidTransition(SlotStatus::Booked, SlotStatus::Available))
    );
}
