// libs/slot-cell/src/services/allocator.rs
use chrono::{DateTime, Utc, Duration as ChronoDuration};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::models::{TimeSlot, SlotStatus, HoldGrant, SlotSearchQuery, SlotError};

/// Owns every mutation of the time_slots table. Each transition is a single
/// conditional PATCH keyed on the expected prior status, so under concurrent
/// attempts exactly one caller observes a modified row; everyone else gets a
/// zero-length result and a specific denial after a re-read. No in-process
/// locking - correctness rests on the store applying the filtered update
/// atomically.
pub struct SlotAllocatorService {
    supabase: Arc<SupabaseClient>,
    hold_ttl: ChronoDuration,
}

impl SlotAllocatorService {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: Arc::new(SupabaseClient::new(config)),
            hold_ttl: ChronoDuration::seconds(config.hold_ttl_seconds),
        }
    }

    pub fn with_client(supabase: Arc<SupabaseClient>, hold_ttl_seconds: i64) -> Self {
        Self {
            supabase,
            hold_ttl: ChronoDuration::seconds(hold_ttl_seconds),
        }
    }

    /// Place a temporary claim on an available slot. Exactly one of N
    /// concurrent callers wins; the rest receive AlreadyHeld/AlreadyBooked.
    /// An expired hold left behind by an abandoned flow does not block a new
    /// claim - the takeover is itself a conditional write on the stale
    /// deadline, so two takeover attempts cannot both win either.
    pub async fn hold(
        &self,
        slot_id: Uuid,
        patient_id: Uuid,
        auth_token: &str,
    ) -> Result<HoldGrant, SlotError> {
        let now = Utc::now();
        let expires_at = now + self.hold_ttl;

        let changes = json!({
            "status": SlotStatus::Hold,
            "held_by": patient_id,
            "hold_expires_at": expires_at.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        });

        let filters = format!("id=eq.{}&status=eq.available", slot_id);
        let rows = self.supabase
            .conditional_update("time_slots", &filters, changes.clone(), Some(auth_token))
            .await
            .map_err(|e| SlotError::DatabaseError(e.to_string()))?;

        if !rows.is_empty() {
            info!("Slot {} held by patient {} until {}", slot_id, patient_id, expires_at);
            return Ok(self.grant(slot_id, expires_at, now));
        }

        // The slot was not available. A stale hold whose deadline has passed
        // can be taken over without waiting for the reclaimer sweep.
        let takeover_filters = format!(
            "id=eq.{}&status=eq.hold&hold_expires_at=lt.{}",
            slot_id,
            urlencoding::encode(&now.to_rfc3339()),
        );
        let rows = self.supabase
            .conditional_update("time_slots", &takeover_filters, changes, Some(auth_token))
            .await
            .map_err(|e| SlotError::DatabaseError(e.to_string()))?;

        if !rows.is_empty() {
            info!("Slot {} expired hold taken over by patient {}", slot_id, patient_id);
            return Ok(self.grant(slot_id, expires_at, now));
        }

        let slot = self.get_slot(slot_id, auth_token).await?;
        Err(self.classify_hold_denial(&slot))
    }

    /// External interface variant: resolve the unique (doctor, date, start)
    /// slot first, then claim it.
    pub async fn hold_by_schedule(
        &self,
        doctor_id: Uuid,
        date: chrono::NaiveDate,
        start_time: chrono::NaiveTime,
        patient_id: Uuid,
        auth_token: &str,
    ) -> Result<HoldGrant, SlotError> {
        let path = format!(
            "/rest/v1/time_slots?doctor_id=eq.{}&slot_date=eq.{}&start_time=eq.{}",
            doctor_id, date, start_time,
        );
        let rows: Vec<Value> = self.supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| SlotError::DatabaseError(e.to_string()))?;

        let slot = rows.first().ok_or(SlotError::NotFound)?;
        let slot: TimeSlot = serde_json::from_value(slot.clone())
            .map_err(|e| SlotError::DatabaseError(format!("Failed to parse slot: {}", e)))?;

        self.hold(slot.id, patient_id, auth_token).await
    }

    /// Undo a hold. Idempotent by design: releasing a hold you no longer own,
    /// or one that already expired or was never taken, is a successful no-op -
    /// there is simply nothing to undo.
    pub async fn release(
        &self,
        slot_id: Uuid,
        patient_id: Uuid,
        auth_token: &str,
    ) -> Result<bool, SlotError> {
        let filters = format!(
            "id=eq.{}&status=eq.hold&held_by=eq.{}",
            slot_id, patient_id,
        );

        let rows = self.supabase
            .conditional_update("time_slots", &filters, self.cleared_hold_fields(), Some(auth_token))
            .await
            .map_err(|e| SlotError::DatabaseError(e.to_string()))?;

        if rows.is_empty() {
            debug!("Release of slot {} by patient {} was a no-op", slot_id, patient_id);
        } else {
            info!("Slot {} released by patient {}", slot_id, patient_id);
        }
        Ok(true)
    }

    /// Convert a claim into a permanent booking and attach the forthcoming
    /// appointment reference. Succeeds from an unexpired hold owned by the
    /// patient, or directly from available (an implicit instantaneous hold).
    pub async fn commit(
        &self,
        slot_id: Uuid,
        patient_id: Uuid,
        appointment_id: Uuid,
        auth_token: &str,
    ) -> Result<TimeSlot, SlotError> {
        let now = Utc::now();
        let changes = json!({
            "status": SlotStatus::Booked,
            "held_by": null,
            "hold_expires_at": null,
            "appointment_id": appointment_id,
            "updated_at": now.to_rfc3339(),
        });

        // Own, unexpired hold.
        let filters = format!(
            "id=eq.{}&status=eq.hold&held_by=eq.{}&hold_expires_at=gt.{}",
            slot_id,
            patient_id,
            urlencoding::encode(&now.to_rfc3339()),
        );
        let rows = self.supabase
            .conditional_update("time_slots", &filters, changes.clone(), Some(auth_token))
            .await
            .map_err(|e| SlotError::DatabaseError(e.to_string()))?;

        if let Some(row) = rows.into_iter().next() {
            info!("Slot {} committed to booked for patient {}", slot_id, patient_id);
            return self.parse_slot(row);
        }

        // Direct booking without a prior hold.
        let direct_filters = format!("id=eq.{}&status=eq.available", slot_id);
        let rows = self.supabase
            .conditional_update("time_slots", &direct_filters, changes, Some(auth_token))
            .await
            .map_err(|e| SlotError::DatabaseError(e.to_string()))?;

        if let Some(row) = rows.into_iter().next() {
            info!("Slot {} booked directly by patient {}", slot_id, patient_id);
            return self.parse_slot(row);
        }

        // Neither write matched - classify, and free a stale hold of our own
        // so the next caller is not blocked by it.
        let slot = self.get_slot(slot_id, auth_token).await?;
        match slot.status {
            SlotStatus::Booked => Err(SlotError::AlreadyBooked),
            SlotStatus::Hold if slot.held_by == Some(patient_id) => {
                warn!("Commit of slot {} denied: hold by patient {} expired", slot_id, patient_id);
                // Only clear the hold when it really is past its deadline; a
                // refreshed deadline belongs to a newer flow.
                if slot.hold_is_expired(now) {
                    self.release_expired(slot_id, patient_id, auth_token).await?;
                }
                Err(SlotError::HoldExpired)
            }
            SlotStatus::Hold => Err(SlotError::HeldByOther),
            status => Err(SlotError::InvalidTransition(status, SlotStatus::Booked)),
        }
    }

    /// Close out a booked slot. Cancelled and no-show slots become eligible
    /// for `reopen`; completed slots stay terminal.
    pub async fn mark_terminal(
        &self,
        slot_id: Uuid,
        outcome: SlotStatus,
        auth_token: &str,
    ) -> Result<TimeSlot, SlotError> {
        if !outcome.is_terminal() {
            return Err(SlotError::ValidationError(
                format!("{} is not a terminal slot status", outcome)
            ));
        }

        let filters = format!("id=eq.{}&status=eq.booked", slot_id);
        let changes = json!({
            "status": outcome,
            "updated_at": Utc::now().to_rfc3339(),
        });

        let rows = self.supabase
            .conditional_update("time_slots", &filters, changes, Some(auth_token))
            .await
            .map_err(|e| SlotError::DatabaseError(e.to_string()))?;

        match rows.into_iter().next() {
            Some(row) => {
                info!("Slot {} marked {}", slot_id, outcome);
                self.parse_slot(row)
            }
            None => {
                let slot = self.get_slot(slot_id, auth_token).await?;
                if slot.status == outcome {
                    // Another writer already applied the same outcome.
                    return Ok(slot);
                }
                Err(SlotError::InvalidTransition(slot.status, outcome))
            }
        }
    }

    /// Return a cancelled/no-show slot to availability, clearing the
    /// appointment link. Used by cancellation and by administrative slot
    /// regeneration.
    pub async fn reopen(&self, slot_id: Uuid, auth_token: &str) -> Result<TimeSlot, SlotError> {
        let filters = format!("id=eq.{}&status=in.(cancelled,no_show)", slot_id);
        let changes = json!({
            "status": SlotStatus::Available,
            "held_by": null,
            "hold_expires_at": null,
            "appointment_id": null,
            "updated_at": Utc::now().to_rfc3339(),
        });

        let rows = self.supabase
            .conditional_update("time_slots", &filters, changes, Some(auth_token))
            .await
            .map_err(|e| SlotError::DatabaseError(e.to_string()))?;

        match rows.into_iter().next() {
            Some(row) => {
                info!("Slot {} reopened", slot_id);
                self.parse_slot(row)
            }
            None => {
                let slot = self.get_slot(slot_id, auth_token).await?;
                if slot.status == SlotStatus::Available {
                    return Ok(slot);
                }
                Err(SlotError::InvalidTransition(slot.status, SlotStatus::Available))
            }
        }
    }

    pub async fn get_slot(&self, slot_id: Uuid, auth_token: &str) -> Result<TimeSlot, SlotError> {
        let path = format!("/rest/v1/time_slots?id=eq.{}", slot_id);
        let rows: Vec<Value> = self.supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| SlotError::DatabaseError(e.to_string()))?;

        let row = rows.into_iter().next().ok_or(SlotError::NotFound)?;
        self.parse_slot(row)
    }

    /// Query surface: slots for one doctor on one day, optionally filtered by
    /// status, in start-time order.
    pub async fn list_slots(
        &self,
        query: SlotSearchQuery,
        auth_token: &str,
    ) -> Result<Vec<TimeSlot>, SlotError> {
        let mut path = format!(
            "/rest/v1/time_slots?doctor_id=eq.{}&slot_date=eq.{}",
            query.doctor_id, query.date,
        );
        if let Some(status) = query.status {
            path.push_str(&format!("&status=eq.{}", status));
        }
        path.push_str("&order=start_time.asc");

        let rows: Vec<Value> = self.supabase
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| SlotError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.parse_slot(row)).collect()
    }

    // ==============================================================================
    // PRIVATE HELPERS
    // ==============================================================================

    fn grant(&self, slot_id: Uuid, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> HoldGrant {
        HoldGrant {
            slot_id,
            expires_at,
            countdown_seconds: (expires_at - now).num_seconds(),
        }
    }

    fn cleared_hold_fields(&self) -> Value {
        json!({
            "status": SlotStatus::Available,
            "held_by": null,
            "hold_expires_at": null,
            "updated_at": Utc::now().to_rfc3339(),
        })
    }

    /// Free a hold we found expired during commit classification. Conditional
    /// on the owner so a fresh hold taken in the meantime is untouched.
    async fn release_expired(
        &self,
        slot_id: Uuid,
        patient_id: Uuid,
        auth_token: &str,
    ) -> Result<(), SlotError> {
        let filters = format!(
            "id=eq.{}&status=eq.hold&held_by=eq.{}",
            slot_id, patient_id,
        );
        self.supabase
            .conditional_update("time_slots", &filters, self.cleared_hold_fields(), Some(auth_token))
            .await
            .map_err(|e| SlotError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    fn classify_hold_denial(&self, slot: &TimeSlot) -> SlotError {
        match slot.status {
            SlotStatus::Hold => SlotError::AlreadyHeld,
            SlotStatus::Booked => SlotError::AlreadyBooked,
            SlotStatus::Available => {
                // Lost the race to a writer that has since released; the
                // caller can simply retry.
                SlotError::AlreadyHeld
            }
            status => SlotError::InvalidTransition(status, SlotStatus::Hold),
        }
    }

    fn parse_slot(&self, row: Value) -> Result<TimeSlot, SlotError> {
        serde_json::from_value(row)
            .map_err(|e| SlotError::DatabaseError(format!("Failed to parse slot: {}", e)))
    }
}
