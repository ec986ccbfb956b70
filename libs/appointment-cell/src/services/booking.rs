// libs/appointment-cell/src/services/booking.rs
use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;
use slot_cell::models::{TimeSlot, SlotStatus};
use slot_cell::services::allocator::SlotAllocatorService;

use crate::models::{
    Appointment, AppointmentStatus, AppointmentError, BookAppointmentRequest,
    CancelAppointmentRequest, AppointmentSearchQuery, RepairAction,
};
use crate::services::lifecycle::AppointmentLifecycleService;

/// Orchestrates the appointment side of a booking and keeps it in lock-step
/// with the slot. Booking is a two-step saga - claim the slot, then insert
/// the appointment - with an explicit compensating rollback instead of a
/// cross-document transaction.
pub struct AppointmentBookingService {
    supabase: Arc<SupabaseClient>,
    allocator: SlotAllocatorService,
    lifecycle: AppointmentLifecycleService,
    default_doctor_id: Uuid,
    rollback_attempts: u32,
}

impl AppointmentBookingService {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_client(Arc::new(SupabaseClient::new(config)), config)
    }

    pub fn with_client(supabase: Arc<SupabaseClient>, config: &AppConfig) -> Self {
        Self {
            allocator: SlotAllocatorService::with_client(
                Arc::clone(&supabase),
                config.hold_ttl_seconds,
            ),
            lifecycle: AppointmentLifecycleService::new(),
            supabase,
            default_doctor_id: config.default_doctor_id,
            rollback_attempts: 3,
        }
    }

    /// Book a slot for a patient. Step 1 commits the slot to booked with the
    /// appointment id pre-attached (one conditional write); step 2 inserts
    /// the appointment with doctor/time fields denormalized from the slot at
    /// this instant. If step 2 fails the slot is rolled back to available;
    /// if the rollback itself keeps failing, an integrity repair is queued
    /// rather than surfacing an error for a half-applied operation.
    pub async fn book(
        &self,
        request: BookAppointmentRequest,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        info!("Booking slot {} for patient {}", request.slot_id, request.patient_id);

        let appointment_id = Uuid::new_v4();
        let slot = self.allocator
            .commit(request.slot_id, request.patient_id, appointment_id, auth_token)
            .await?;

        let doctor_id = self.resolve_doctor(&slot, auth_token).await;

        match self.insert_appointment(appointment_id, &slot, doctor_id, &request, auth_token).await {
            Ok(appointment) => {
                self.notify_transition(&appointment, None, auth_token).await;
                info!("Appointment {} booked on slot {}", appointment.id, slot.id);
                Ok(appointment)
            }
            Err(e) => {
                warn!("Appointment insert failed after slot commit, rolling back slot {}: {}",
                      slot.id, e);
                self.rollback_slot_commit(slot.id, appointment_id, auth_token).await;
                Err(e)
            }
        }
    }

    /// Record confirmation of a pending appointment. Confirmation is a
    /// sub-state flag, not a machine state; the status itself moves to
    /// confirmed only through `transition`.
    pub async fn confirm(
        &self,
        appointment_id: Uuid,
        confirmer_id: Uuid,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        let current = self.get_appointment(appointment_id, auth_token).await?;

        if current.is_confirmed {
            return Err(AppointmentError::AlreadyConfirmed);
        }
        if current.status != AppointmentStatus::Pending {
            return Err(AppointmentError::InvalidTransition {
                from: current.status,
                to: AppointmentStatus::Confirmed,
            });
        }

        let filters = format!("id=eq.{}&status=eq.pending&is_confirmed=eq.false", appointment_id);
        let changes = json!({
            "is_confirmed": true,
            "confirmed_by": confirmer_id,
            "confirmed_at": Utc::now().to_rfc3339(),
            "updated_at": Utc::now().to_rfc3339(),
        });

        let rows = self.supabase
            .conditional_update("appointments", &filters, changes, Some(auth_token))
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        let row = rows.into_iter().next().ok_or(AppointmentError::ConcurrentModification)?;
        info!("Appointment {} confirmed by {}", appointment_id, confirmer_id);
        self.parse_appointment(row)
    }

    /// Apply a status transition, validated against the rule table, then
    /// propagate the outcome to the slot. The appointment update is keyed on
    /// the expected current status, so a concurrent transition makes this one
    /// fail cleanly instead of double-applying.
    pub async fn transition(
        &self,
        appointment_id: Uuid,
        to_status: AppointmentStatus,
        actor_id: Uuid,
        reason: Option<String>,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        let current = self.get_appointment(appointment_id, auth_token).await?;
        self.lifecycle.validate_status_transition(current.status, to_status)?;

        let now = Utc::now();
        let mut changes = serde_json::Map::new();
        changes.insert("status".to_string(), json!(to_status));
        changes.insert("updated_at".to_string(), json!(now.to_rfc3339()));

        match to_status {
            AppointmentStatus::Confirmed => {
                changes.insert("is_confirmed".to_string(), json!(true));
                changes.insert("confirmed_by".to_string(), json!(actor_id));
                changes.insert("confirmed_at".to_string(), json!(now.to_rfc3339()));
            }
            AppointmentStatus::CheckedIn => {
                changes.insert("checked_in_at".to_string(), json!(now.to_rfc3339()));
            }
            AppointmentStatus::Completed => {
                changes.insert("completed_at".to_string(), json!(now.to_rfc3339()));
            }
            AppointmentStatus::Cancelled => {
                changes.insert("cancelled_by".to_string(), json!(actor_id));
                changes.insert("cancelled_at".to_string(), json!(now.to_rfc3339()));
                changes.insert(
                    "cancellation_reason".to_string(),
                    json!(reason.clone().unwrap_or_else(|| "unspecified".to_string())),
                );
            }
            _ => {}
        }

        let filters = format!("id=eq.{}&status=eq.{}", appointment_id, current.status);
        let rows = self.supabase
            .conditional_update("appointments", &filters, Value::Object(changes), Some(auth_token))
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        let row = rows.into_iter().next().ok_or(AppointmentError::ConcurrentModification)?;
        let updated = self.parse_appointment(row)?;

        info!("Appointment {} transitioned {} -> {}", appointment_id, current.status, to_status);

        self.apply_slot_outcome(&current, to_status, auth_token).await;
        self.notify_transition(&updated, Some(current.status), auth_token).await;

        Ok(updated)
    }

    /// Cancel on behalf of a patient, doctor or admin; same rule table as
    /// any other transition.
    pub async fn cancel(
        &self,
        appointment_id: Uuid,
        request: CancelAppointmentRequest,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        self.transition(
            appointment_id,
            AppointmentStatus::Cancelled,
            request.cancelled_by,
            Some(request.reason),
            auth_token,
        ).await
    }

    pub async fn get_appointment(
        &self,
        appointment_id: Uuid,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        debug!("Fetching appointment: {}", appointment_id);

        let path = format!("/rest/v1/appointments?id=eq.{}", appointment_id);
        let rows: Vec<Value> = self.supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        let row = rows.into_iter().next().ok_or(AppointmentError::NotFound)?;
        self.parse_appointment(row)
    }

    /// Query surface: appointments by patient or doctor, status and date
    /// range, newest first.
    pub async fn search_appointments(
        &self,
        query: AppointmentSearchQuery,
        auth_token: &str,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        debug!("Searching appointments with filters: {:?}", query);

        let mut query_parts = Vec::new();

        if let Some(patient_id) = query.patient_id {
            query_parts.push(format!("patient_id=eq.{}", patient_id));
        }
        if let Some(doctor_id) = query.doctor_id {
            query_parts.push(format!("doctor_id=eq.{}", doctor_id));
        }
        if let Some(status) = query.status {
            query_parts.push(format!("status=eq.{}", status));
        }
        if let Some(from_date) = query.from_date {
            let encoded = urlencoding::encode(&from_date.to_rfc3339()).into_owned();
            query_parts.push(format!("scheduled_start_time=gte.{}", encoded));
        }
        if let Some(to_date) = query.to_date {
            let encoded = urlencoding::encode(&to_date.to_rfc3339()).into_owned();
            query_parts.push(format!("scheduled_start_time=lte.{}", encoded));
        }

        query_parts.push("order=scheduled_start_time.desc".to_string());
        if let Some(limit) = query.limit {
            query_parts.push(format!("limit={}", limit));
        }
        if let Some(offset) = query.offset {
            query_parts.push(format!("offset={}", offset));
        }
        let path = format!("/rest/v1/appointments?{}", query_parts.join("&"));

        let rows: Vec<Value> = self.supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.parse_appointment(row)).collect()
    }

    /// Administrative delegate: return a cancelled/no-show slot to the pool.
    pub async fn reopen_slot(&self, slot_id: Uuid, auth_token: &str) -> Result<TimeSlot, AppointmentError> {
        Ok(self.allocator.reopen(slot_id, auth_token).await?)
    }

    // ==============================================================================
    // PRIVATE HELPERS
    // ==============================================================================

    /// The slot's doctor, or the configured default when the doctor has been
    /// deleted since the slot was generated. The fallback also corrects the
    /// slot's own doctor reference; both are logged as self-healing repairs,
    /// never silent.
    async fn resolve_doctor(&self, slot: &TimeSlot, auth_token: &str) -> Uuid {
        let path = format!("/rest/v1/doctors?id=eq.{}&select=id", slot.doctor_id);
        let rows: Result<Vec<Value>, _> = self.supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await;

        match rows {
            Ok(rows) if !rows.is_empty() => slot.doctor_id,
            Ok(_) => {
                warn!(
                    "Integrity repaired: doctor {} for slot {} no longer exists, reassigning to default doctor {}",
                    slot.doctor_id, slot.id, self.default_doctor_id,
                );
                let filters = format!("id=eq.{}", slot.id);
                let changes = json!({
                    "doctor_id": self.default_doctor_id,
                    "updated_at": Utc::now().to_rfc3339(),
                });
                if let Err(e) = self.supabase
                    .conditional_update("time_slots", &filters, changes, Some(auth_token))
                    .await
                {
                    warn!("Failed to correct doctor reference on slot {}: {}", slot.id, e);
                }
                self.default_doctor_id
            }
            Err(e) => {
                // Lookup failure must not block the booking; keep the
                // denormalized reference and let the reconciler revisit.
                warn!("Doctor lookup for slot {} failed: {}", slot.id, e);
                slot.doctor_id
            }
        }
    }

    async fn insert_appointment(
        &self,
        appointment_id: Uuid,
        slot: &TimeSlot,
        doctor_id: Uuid,
        request: &BookAppointmentRequest,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        let now = Utc::now();
        let row = json!({
            "id": appointment_id,
            "slot_id": slot.id,
            "patient_id": request.patient_id,
            "doctor_id": doctor_id,
            "slot_date": slot.slot_date,
            "scheduled_start_time": slot.scheduled_start().to_rfc3339(),
            "scheduled_end_time": slot.scheduled_end().to_rfc3339(),
            "status": AppointmentStatus::Pending,
            "reason": request.reason,
            "notes": request.notes,
            "is_confirmed": false,
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        });

        let rows = self.supabase
            .insert_returning("appointments", row, Some(auth_token))
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        let row = rows.into_iter().next()
            .ok_or_else(|| AppointmentError::DatabaseError("Failed to create appointment".to_string()))?;
        self.parse_appointment(row)
    }

    /// Compensating action for a failed appointment insert: put the slot back
    /// to available, conditional on it still carrying our appointment id. A
    /// bounded number of attempts, then escalation to the repair queue.
    async fn rollback_slot_commit(&self, slot_id: Uuid, appointment_id: Uuid, auth_token: &str) {
        let filters = format!(
            "id=eq.{}&status=eq.booked&appointment_id=eq.{}",
            slot_id, appointment_id,
        );

        for attempt in 1..=self.rollback_attempts {
            let changes = json!({
                "status": SlotStatus::Available,
                "held_by": null,
                "hold_expires_at": null,
                "appointment_id": null,
                "updated_at": Utc::now().to_rfc3339(),
            });

            match self.supabase
                .conditional_update("time_slots", &filters, changes, Some(auth_token))
                .await
            {
                Ok(rows) if !rows.is_empty() => {
                    info!("Slot {} rolled back to available after failed booking", slot_id);
                    return;
                }
                Ok(_) => {
                    // No row matched: someone else already moved the slot on,
                    // so there is nothing left to compensate.
                    debug!("Slot {} rollback found nothing to undo", slot_id);
                    return;
                }
                Err(e) => {
                    warn!("Slot {} rollback attempt {}/{} failed: {}",
                          slot_id, attempt, self.rollback_attempts, e);
                    tokio::time::sleep(tokio::time::Duration::from_millis(100 * attempt as u64)).await;
                }
            }
        }

        self.enqueue_repair(slot_id, Some(appointment_id), RepairAction::ReleaseSlot,
                            "slot rollback retries exhausted after failed appointment insert",
                            auth_token).await;
    }

    /// Hand a failed compensation to the reconciler instead of surfacing an
    /// error for an operation that partially succeeded.
    async fn enqueue_repair(
        &self,
        slot_id: Uuid,
        appointment_id: Option<Uuid>,
        action: RepairAction,
        reason: &str,
        auth_token: &str,
    ) {
        let row = json!({
            "id": Uuid::new_v4(),
            "slot_id": slot_id,
            "appointment_id": appointment_id,
            "action": action,
            "reason": reason,
            "resolved": false,
            "created_at": Utc::now().to_rfc3339(),
        });

        match self.supabase.insert_returning("integrity_repairs", row, Some(auth_token)).await {
            Ok(_) => warn!("Queued integrity repair {} for slot {}", action, slot_id),
            Err(e) => warn!("Failed to queue integrity repair for slot {}: {}", slot_id, e),
        }
    }

    /// Propagate an appointment transition to its slot. Failures here are
    /// logged and, when capacity should have been freed, escalated to the
    /// repair queue - they never roll back the appointment transition.
    async fn apply_slot_outcome(
        &self,
        before: &Appointment,
        to_status: AppointmentStatus,
        auth_token: &str,
    ) {
        let outcome = match to_status {
            AppointmentStatus::Completed => SlotStatus::Completed,
            AppointmentStatus::Cancelled => SlotStatus::Cancelled,
            AppointmentStatus::NoShow => SlotStatus::NoShow,
            _ => return,
        };

        if let Err(e) = self.allocator.mark_terminal(before.slot_id, outcome, auth_token).await {
            warn!("Failed to mark slot {} as {}: {}", before.slot_id, outcome, e);
        }

        // Cancellation before check-in frees capacity; no-show is only
        // reachable from confirmed, so it always does.
        let should_reopen = outcome.is_reopenable()
            && self.lifecycle.frees_slot_capacity(before.status);
        if !should_reopen {
            return;
        }

        if let Err(e) = self.allocator.reopen(before.slot_id, auth_token).await {
            warn!("Failed to reopen slot {} after {}: {}", before.slot_id, to_status, e);
            self.enqueue_repair(before.slot_id, Some(before.id), RepairAction::ReopenSlot,
                                "slot reopen failed after cancellation", auth_token).await;
        }
    }

    /// Fire-and-forget audit event for the notification sink. A failure here
    /// never rolls back the transition that triggered it.
    async fn notify_transition(
        &self,
        appointment: &Appointment,
        from: Option<AppointmentStatus>,
        auth_token: &str,
    ) {
        let event = json!({
            "appointment_id": appointment.id,
            "slot_id": appointment.slot_id,
            "from_status": from.map(|s| s.to_string()),
            "to_status": appointment.status.to_string(),
            "occurred_at": Utc::now().to_rfc3339(),
        });

        if let Err(e) = self.supabase
            .request::<Value>(Method::POST, "/rest/v1/appointment_events", Some(auth_token), Some(event))
            .await
        {
            warn!("Audit notification for appointment {} failed: {}", appointment.id, e);
        }
    }

    fn parse_appointment(&self, row: Value) -> Result<Appointment, AppointmentError> {
        serde_json::from_value(row)
            .map_err(|e| AppointmentError::DatabaseError(format!("Failed to parse appointment: {}", e)))
    }
}
