// libs/slot-cell/src/models.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc, NaiveDate, NaiveTime};
use std::fmt;

// ==============================================================================
// CORE SLOT MODELS
// ==============================================================================

/// A bookable time window for one doctor. (doctor_id, slot_date, start_time)
/// is unique; slots are never hard-deleted - terminal statuses are retained
/// for audit and cancelled/no-show slots can cycle back to available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub slot_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: SlotStatus,
    pub held_by: Option<Uuid>,
    pub hold_expires_at: Option<DateTime<Utc>>,
    pub max_patients: i32,
    pub appointment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TimeSlot {
    pub fn scheduled_start(&self) -> DateTime<Utc> {
        self.slot_date.and_time(self.start_time).and_utc()
    }

    pub fn scheduled_end(&self) -> DateTime<Utc> {
        self.slot_date.and_time(self.end_time).and_utc()
    }

    /// A hold that has outlived its grace period no longer blocks anyone.
    pub fn hold_is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SlotStatus::Hold
            && self.hold_expires_at.map(|exp| exp <= now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    Hold,
    Booked,
    Completed,
    Cancelled,
    NoShow,
}

impl SlotStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SlotStatus::Completed | SlotStatus::Cancelled | SlotStatus::NoShow)
    }

    /// Cancelled and no-show slots may cycle back to available.
    pub fn is_reopenable(&self) -> bool {
        matches!(self, SlotStatus::Cancelled | SlotStatus::NoShow)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotStatus::Available => write!(f, "available"),
            SlotStatus::Hold => write!(f, "hold"),
            SlotStatus::Booked => write!(f, "booked"),
            SlotStatus::Completed => write!(f, "completed"),
            SlotStatus::Cancelled => write!(f, "cancelled"),
            SlotStatus::NoShow => write!(f, "no_show"),
        }
    }
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

/// Returned to the caller after a successful hold; the countdown is for
/// client display only, `commit` re-checks the expiry on the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldGrant {
    pub slot_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub countdown_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldSlotRequest {
    pub doctor_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub patient_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSlotRequest {
    pub patient_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotSearchQuery {
    pub doctor_id: Uuid,
    pub date: NaiveDate,
    pub status: Option<SlotStatus>,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum SlotError {
    #[error("Slot not found")]
    NotFound,

    #[error("Slot is already held by another patient")]
    AlreadyHeld,

    #[error("Slot is already booked")]
    AlreadyBooked,

    #[error("Slot is held by another patient")]
    HeldByOther,

    #[error("Hold expired before booking was completed")]
    HoldExpired,

    #[error("Slot cannot change from {0} to {1}")]
    InvalidTransition(SlotStatus, SlotStatus),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}
