// libs/appointment-cell/src/models.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc, NaiveDate};
use std::fmt;

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

/// One booking of one slot. Doctor and time fields are denormalized from the
/// slot at booking time so later slot mutation cannot corrupt appointment
/// history. Created only by the booking saga, immediately after the slot
/// commits to booked; never deleted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub slot_id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub slot_date: NaiveDate,
    pub scheduled_start_time: DateTime<Utc>,
    pub scheduled_end_time: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub is_confirmed: bool,
    pub confirmed_by: Option<Uuid>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<Uuid>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    CheckedIn,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentStatus::Pending => write!(f, "pending"),
            AppointmentStatus::Confirmed => write!(f, "confirmed"),
            AppointmentStatus::CheckedIn => write!(f, "checked_in"),
            AppointmentStatus::InProgress => write!(f, "in_progress"),
            AppointmentStatus::Completed => write!(f, "completed"),
            AppointmentStatus::Cancelled => write!(f, "cancelled"),
            AppointmentStatus::NoShow => write!(f, "no_show"),
        }
    }
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookAppointmentRequest {
    pub slot_id: Uuid,
    pub patient_id: Uuid,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmAppointmentRequest {
    pub confirmer_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionAppointmentRequest {
    pub to_status: AppointmentStatus,
    pub actor_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAppointmentRequest {
    pub reason: String,
    pub cancelled_by: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentSearchQuery {
    pub patient_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub status: Option<AppointmentStatus>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub limit: Option<i32>,
    pub offset: Option<i32>,
}

// ==============================================================================
// INTEGRITY REPAIR MODELS
// ==============================================================================

/// Escalation record for a compensating action that kept failing. The saga
/// writes one instead of surfacing an error for an operation that partially
/// succeeded; the reconciler drains them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityRepair {
    pub id: Uuid,
    pub slot_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub action: RepairAction,
    pub reason: String,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    ReleaseSlot,
    ReopenSlot,
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairAction::ReleaseSlot => write!(f, "release_slot"),
            RepairAction::ReopenSlot => write!(f, "reopen_slot"),
        }
    }
}

/// Summary of one reconciler pass, for logs and the admin surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub appointments_reassigned: u32,
    pub slots_reassigned: u32,
    pub appointments_backfilled: u32,
    pub slots_synthesized: u32,
    pub repairs_applied: u32,
    pub records_skipped: u32,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum AppointmentError {
    #[error("Appointment not found")]
    NotFound,

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: AppointmentStatus, to: AppointmentStatus },

    #[error("Appointment is already confirmed")]
    AlreadyConfirmed,

    #[error("Appointment was modified concurrently")]
    ConcurrentModification,

    #[error("Slot error: {0}")]
    Slot(#[from] slot_cell::models::SlotError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}
