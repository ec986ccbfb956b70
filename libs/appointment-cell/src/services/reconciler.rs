// libs/appointment-cell/src/services/reconciler.rs
use chrono::{DateTime, Utc, NaiveDate};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;
use slot_cell::models::{TimeSlot, SlotStatus};

use crate::models::{AppointmentError, IntegrityRepair, RepairAction, ReconcileReport};

/// Minimal projection of an appointment row for integrity passes. The full
/// model cannot represent the very corruption this job exists to repair
/// (missing schedule fields), so the reconciler reads a looser shape.
#[derive(Debug, Deserialize)]
struct AppointmentRow {
    id: Uuid,
    slot_id: Uuid,
    doctor_id: Uuid,
    slot_date: Option<NaiveDate>,
    scheduled_start_time: Option<DateTime<Utc>>,
    scheduled_end_time: Option<DateTime<Utc>>,
}

/// Periodic integrity sweep over slots and appointments. Everything it does
/// is idempotent and conditional, so overlapping runs or a run racing live
/// traffic cannot make matters worse; a record it cannot repair is logged
/// and skipped rather than aborting the pass.
pub struct IntegrityReconciler {
    supabase: Arc<SupabaseClient>,
    default_doctor_id: Uuid,
    interval: Duration,
}

impl IntegrityReconciler {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: Arc::new(SupabaseClient::new(config)),
            default_doctor_id: config.default_doctor_id,
            interval: Duration::from_secs(config.reconciler_interval_seconds),
        }
    }

    pub fn with_client(supabase: Arc<SupabaseClient>, default_doctor_id: Uuid, interval: Duration) -> Self {
        Self { supabase, default_doctor_id, interval }
    }

    /// Background loop spawned by the api binary.
    pub async fn run(self) {
        info!("Integrity reconciler started (interval {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match self.reconcile_once().await {
                Ok(report) => info!(
                    "Reconcile pass: {} appointments reassigned, {} slots reassigned, \
                     {} appointments backfilled, {} slots synthesized, {} repairs applied, {} skipped",
                    report.appointments_reassigned,
                    report.slots_reassigned,
                    report.appointments_backfilled,
                    report.slots_synthesized,
                    report.repairs_applied,
                    report.records_skipped,
                ),
                Err(e) => warn!("Reconcile pass failed, will retry next tick: {}", e),
            }
        }
    }

    /// One full pass: reassign records pointing at deleted doctors, repair
    /// appointments with missing schedule data or missing slots, then drain
    /// the repair queue left behind by failed saga compensations.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, AppointmentError> {
        let mut report = ReconcileReport::default();
        let doctors = self.fetch_doctor_ids().await?;

        if doctors.is_empty() {
            warn!("Reconciler found no doctors; skipping reassignment passes");
        } else if !doctors.contains(&self.default_doctor_id) {
            warn!("Default doctor {} does not exist; skipping reassignment passes", self.default_doctor_id);
        } else {
            self.reassign_orphaned_appointments(&doctors, &mut report).await;
            self.reassign_orphaned_slots(&doctors, &mut report).await;
        }

        self.repair_appointment_links(&mut report).await;
        self.drain_repair_queue(&mut report).await;

        Ok(report)
    }

    // ==============================================================================
    // REASSIGNMENT PASSES
    // ==============================================================================

    async fn fetch_doctor_ids(&self) -> Result<HashSet<Uuid>, AppointmentError> {
        let rows: Vec<Value> = self.supabase
            .request(Method::GET, "/rest/v1/doctors?select=id", None, None)
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        Ok(rows.iter()
            .filter_map(|row| row.get("id"))
            .filter_map(|id| serde_json::from_value(id.clone()).ok())
            .collect())
    }

    /// Point active appointments whose doctor has been deleted at the default
    /// doctor. The update is conditional on the stale reference, so a row
    /// corrected in the meantime is left alone.
    async fn reassign_orphaned_appointments(&self, doctors: &HashSet<Uuid>, report: &mut ReconcileReport) {
        let path = "/rest/v1/appointments\
                    ?status=in.(pending,confirmed,checked_in,in_progress)\
                    &select=id,slot_id,doctor_id,slot_date,scheduled_start_time,scheduled_end_time";
        let rows: Vec<AppointmentRow> = match self.supabase.request(Method::GET, path, None, None).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Reconciler could not list active appointments: {}", e);
                report.records_skipped += 1;
                return;
            }
        };

        for appointment in rows {
            if doctors.contains(&appointment.doctor_id) {
                continue;
            }

            warn!(
                "Integrity repaired: appointment {} references deleted doctor {}, reassigning to {}",
                appointment.id, appointment.doctor_id, self.default_doctor_id,
            );
            let filters = format!("id=eq.{}&doctor_id=eq.{}", appointment.id, appointment.doctor_id);
            let changes = json!({
                "doctor_id": self.default_doctor_id,
                "updated_at": Utc::now().to_rfc3339(),
            });

            match self.supabase.conditional_update("appointments", &filters, changes, None).await {
                Ok(rows) if !rows.is_empty() => report.appointments_reassigned += 1,
                Ok(_) => debug!("Appointment {} was corrected concurrently", appointment.id),
                Err(e) => {
                    warn!("Failed to reassign appointment {}: {}", appointment.id, e);
                    report.records_skipped += 1;
                }
            }
        }
    }

    /// Same repair for non-terminal slots.
    async fn reassign_orphaned_slots(&self, doctors: &HashSet<Uuid>, report: &mut ReconcileReport) {
        let path = "/rest/v1/time_slots?status=in.(available,hold,booked)";
        let rows: Vec<TimeSlot> = match self.supabase.request(Method::GET, path, None, None).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Reconciler could not list non-terminal slots: {}", e);
                report.records_skipped += 1;
                return;
            }
        };

        for slot in rows {
            if doctors.contains(&slot.doctor_id) {
                continue;
            }

            warn!(
                "Integrity repaired: slot {} references deleted doctor {}, reassigning to {}",
                slot.id, slot.doctor_id, self.default_doctor_id,
            );
            let filters = format!("id=eq.{}&doctor_id=eq.{}", slot.id, slot.doctor_id);
            let changes = json!({
                "doctor_id": self.default_doctor_id,
                "updated_at": Utc::now().to_rfc3339(),
            });

            match self.supabase.conditional_update("time_slots", &filters, changes, None).await {
                Ok(rows) if !rows.is_empty() => report.slots_reassigned += 1,
                Ok(_) => debug!("Slot {} was corrected concurrently", slot.id),
                Err(e) => {
                    warn!("Failed to reassign slot {}: {}", slot.id, e);
                    report.records_skipped += 1;
                }
            }
        }
    }

    // ==============================================================================
    // SLOT LINK REPAIR
    // ==============================================================================

    /// Two-way repair between active appointments and their slots: backfill
    /// schedule fields that were lost from the appointment, and synthesize a
    /// booked slot when the slot row itself has vanished from under an
    /// appointment that still has its denormalized copy.
    async fn repair_appointment_links(&self, report: &mut ReconcileReport) {
        let path = "/rest/v1/appointments\
                    ?status=in.(pending,confirmed,checked_in,in_progress)\
                    &select=id,slot_id,doctor_id,slot_date,scheduled_start_time,scheduled_end_time";
        let rows: Vec<AppointmentRow> = match self.supabase.request(Method::GET, path, None, None).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Reconciler could not list appointments for link repair: {}", e);
                report.records_skipped += 1;
                return;
            }
        };

        for appointment in rows {
            let slot = match self.fetch_slot(appointment.slot_id).await {
                Ok(slot) => slot,
                Err(e) => {
                    warn!("Reconciler could not read slot {}: {}", appointment.slot_id, e);
                    report.records_skipped += 1;
                    continue;
                }
            };

            match slot {
                Some(slot) => {
                    if appointment.scheduled_start_time.is_none() {
                        self.backfill_schedule(&appointment, &slot, report).await;
                    }
                }
                None => self.synthesize_slot(&appointment, report).await,
            }
        }
    }

    async fn backfill_schedule(&self, appointment: &AppointmentRow, slot: &TimeSlot, report: &mut ReconcileReport) {
        warn!(
            "Integrity repaired: appointment {} missing schedule fields, backfilling from slot {}",
            appointment.id, slot.id,
        );
        let filters = format!("id=eq.{}&scheduled_start_time=is.null", appointment.id);
        let changes = json!({
            "slot_date": slot.slot_date,
            "scheduled_start_time": slot.scheduled_start().to_rfc3339(),
            "scheduled_end_time": slot.scheduled_end().to_rfc3339(),
            "updated_at": Utc::now().to_rfc3339(),
        });

        match self.supabase.conditional_update("appointments", &filters, changes, None).await {
            Ok(rows) if !rows.is_empty() => report.appointments_backfilled += 1,
            Ok(_) => debug!("Appointment {} was backfilled concurrently", appointment.id),
            Err(e) => {
                warn!("Failed to backfill appointment {}: {}", appointment.id, e);
                report.records_skipped += 1;
            }
        }
    }

    /// Recreate a deleted slot row under an active appointment, in booked
    /// state and linked back to the appointment. Needs the appointment's
    /// denormalized schedule copy; without it there is nothing to rebuild
    /// from and the record is skipped for a human to look at.
    async fn synthesize_slot(&self, appointment: &AppointmentRow, report: &mut ReconcileReport) {
        let (Some(slot_date), Some(start), Some(end)) = (
            appointment.slot_date,
            appointment.scheduled_start_time,
            appointment.scheduled_end_time,
        ) else {
            warn!(
                "Appointment {} has neither a slot row nor schedule fields; cannot repair",
                appointment.id,
            );
            report.records_skipped += 1;
            return;
        };

        warn!(
            "Integrity repaired: slot {} missing under active appointment {}, synthesizing",
            appointment.slot_id, appointment.id,
        );
        let now = Utc::now();
        let row = json!({
            "id": appointment.slot_id,
            "doctor_id": appointment.doctor_id,
            "slot_date": slot_date,
            "start_time": start.time().format("%H:%M:%S").to_string(),
            "end_time": end.time().format("%H:%M:%S").to_string(),
            "status": SlotStatus::Booked,
            "held_by": null,
            "hold_expires_at": null,
            "max_patients": 1,
            "appointment_id": appointment.id,
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        });

        match self.supabase.insert_returning("time_slots", row, None).await {
            Ok(_) => report.slots_synthesized += 1,
            Err(e) => {
                warn!("Failed to synthesize slot {}: {}", appointment.slot_id, e);
                report.records_skipped += 1;
            }
        }
    }

    // ==============================================================================
    // REPAIR QUEUE
    // ==============================================================================

    /// Apply the compensating actions the saga could not complete online.
    /// Each action is the same conditional write the saga would have issued;
    /// a write that matches nothing means the slot has since moved on, which
    /// resolves the repair just as well.
    async fn drain_repair_queue(&self, report: &mut ReconcileReport) {
        let path = "/rest/v1/integrity_repairs?resolved=eq.false&order=created_at.asc";
        let rows: Vec<IntegrityRepair> = match self.supabase.request(Method::GET, path, None, None).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Reconciler could not list pending repairs: {}", e);
                report.records_skipped += 1;
                return;
            }
        };

        for repair in rows {
            if let Err(e) = self.apply_repair(&repair).await {
                warn!("Failed to apply repair {} for slot {}: {}", repair.id, repair.slot_id, e);
                report.records_skipped += 1;
                continue;
            }

            let filters = format!("id=eq.{}", repair.id);
            let changes = json!({ "resolved": true });
            match self.supabase.conditional_update("integrity_repairs", &filters, changes, None).await {
                Ok(_) => {
                    info!("Repair {} ({}) applied to slot {}", repair.id, repair.action, repair.slot_id);
                    report.repairs_applied += 1;
                }
                Err(e) => {
                    warn!("Failed to mark repair {} resolved: {}", repair.id, e);
                    report.records_skipped += 1;
                }
            }
        }
    }

    async fn apply_repair(&self, repair: &IntegrityRepair) -> Result<(), AppointmentError> {
        let filters = match repair.action {
            RepairAction::ReleaseSlot => match repair.appointment_id {
                Some(appointment_id) => format!(
                    "id=eq.{}&status=eq.booked&appointment_id=eq.{}",
                    repair.slot_id, appointment_id,
                ),
                None => format!("id=eq.{}&status=eq.booked", repair.slot_id),
            },
            RepairAction::ReopenSlot => {
                format!("id=eq.{}&status=in.(cancelled,no_show)", repair.slot_id)
            }
        };

        let changes = json!({
            "status": SlotStatus::Available,
            "held_by": null,
            "hold_expires_at": null,
            "appointment_id": null,
            "updated_at": Utc::now().to_rfc3339(),
        });

        let rows = self.supabase
            .conditional_update("time_slots", &filters, changes, None)
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        if rows.is_empty() {
            debug!("Repair {} matched nothing; slot {} already moved on", repair.id, repair.slot_id);
        }
        Ok(())
    }

    async fn fetch_slot(&self, slot_id: Uuid) -> Result<Option<TimeSlot>, AppointmentError> {
        let path = format!("/rest/v1/time_slots?id=eq.{}", slot_id);
        let rows: Vec<TimeSlot> = self.supabase
            .request(Method::GET, &path, None, None)
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().next())
    }
}
