use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::AppState;

pub struct TestConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub default_doctor_id: Uuid,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            default_doctor_id: Uuid::new_v4(),
        }
    }
}

impl TestConfig {
    /// Point the store client at a wiremock server.
    pub fn with_mock_server(server_uri: &str) -> Self {
        Self {
            supabase_url: server_uri.to_string(),
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            default_doctor_id: self.default_doctor_id,
            hold_ttl_seconds: 120,
            reclaimer_interval_seconds: 60,
            reconciler_interval_seconds: 3600,
        }
    }

    pub fn to_state(&self) -> AppState {
        AppState::new(self.to_app_config())
    }
}

/// Canned PostgREST row payloads matching the time_slots / appointments /
/// doctors tables, in the shape the store returns them.
pub struct MockStoreResponses;

impl MockStoreResponses {
    pub fn available_slot(slot_id: Uuid, doctor_id: Uuid) -> serde_json::Value {
        json!({
            "id": slot_id,
            "doctor_id": doctor_id,
            "slot_date": "2026-09-01",
            "start_time": "10:00:00",
            "end_time": "10:30:00",
            "status": "available",
            "held_by": null,
            "hold_expires_at": null,
            "max_patients": 1,
            "appointment_id": null,
            "created_at": "2026-08-01T00:00:00Z",
            "updated_at": "2026-08-01T00:00:00Z"
        })
    }

    pub fn held_slot(slot_id: Uuid, doctor_id: Uuid, held_by: Uuid,
                     hold_expires_at: chrono::DateTime<Utc>) -> serde_json::Value {
        let mut slot = Self::available_slot(slot_id, doctor_id);
        slot["status"] = json!("hold");
        slot["held_by"] = json!(held_by);
        slot["hold_expires_at"] = json!(hold_expires_at.to_rfc3339());
        slot
    }

    pub fn booked_slot(slot_id: Uuid, doctor_id: Uuid, appointment_id: Uuid) -> serde_json::Value {
        let mut slot = Self::available_slot(slot_id, doctor_id);
        slot["status"] = json!("booked");
        slot["appointment_id"] = json!(appointment_id);
        slot
    }

    pub fn terminal_slot(slot_id: Uuid, doctor_id: Uuid, appointment_id: Uuid,
                         status: &str) -> serde_json::Value {
        let mut slot = Self::booked_slot(slot_id, doctor_id, appointment_id);
        slot["status"] = json!(status);
        slot
    }

    pub fn pending_appointment(appointment_id: Uuid, slot_id: Uuid,
                               patient_id: Uuid, doctor_id: Uuid) -> serde_json::Value {
        json!({
            "id": appointment_id,
            "slot_id": slot_id,
            "patient_id": patient_id,
            "doctor_id": doctor_id,
            "slot_date": "2026-09-01",
            "scheduled_start_time": "2026-09-01T10:00:00Z",
            "scheduled_end_time": "2026-09-01T10:30:00Z",
            "status": "pending",
            "reason": "checkup",
            "notes": null,
            "is_confirmed": false,
            "confirmed_by": null,
            "confirmed_at": null,
            "cancelled_by": null,
            "cancelled_at": null,
            "cancellation_reason": null,
            "checked_in_at": null,
            "completed_at": null,
            "created_at": "2026-08-01T00:00:00Z",
            "updated_at": "2026-08-01T00:00:00Z"
        })
    }

    pub fn appointment_with_status(appointment_id: Uuid, slot_id: Uuid,
                                   patient_id: Uuid, doctor_id: Uuid,
                                   status: &str) -> serde_json::Value {
        let mut appointment = Self::pending_appointment(appointment_id, slot_id, patient_id, doctor_id);
        appointment["status"] = json!(status);
        if status == "checked_in" || status == "in_progress" || status == "completed" {
            appointment["checked_in_at"] = json!("2026-09-01T09:55:00Z");
        }
        appointment
    }

    pub fn doctor(doctor_id: Uuid) -> serde_json::Value {
        json!({
            "id": doctor_id,
            "first_name": "Test",
            "last_name": "Doctor",
            "specialty": "General Practice",
            "is_available": true,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        })
    }

    pub fn repair_row(repair_id: Uuid, slot_id: Uuid, action: &str) -> serde_json::Value {
        json!({
            "id": repair_id,
            "slot_id": slot_id,
            "appointment_id": null,
            "action": action,
            "reason": "compensation retries exhausted",
            "resolved": false,
            "created_at": Utc::now().to_rfc3339()
        })
    }
}
