// libs/appointment-cell/src/services/lifecycle.rs
use tracing::{debug, warn};

use crate::models::{AppointmentStatus, AppointmentError};

/// Pure rule table for the appointment state machine. Transition validation
/// never touches the store; violations are reported, not retried.
pub struct AppointmentLifecycleService;

impl AppointmentLifecycleService {
    pub fn new() -> Self {
        Self
    }

    /// Validate that a status transition is allowed.
    pub fn validate_status_transition(
        &self,
        current_status: AppointmentStatus,
        new_status: AppointmentStatus,
    ) -> Result<(), AppointmentError> {
        debug!("Validating status transition from {} to {}", current_status, new_status);

        if !self.valid_transitions(current_status).contains(&new_status) {
            warn!("Invalid status transition attempted: {} -> {}", current_status, new_status);
            return Err(AppointmentError::InvalidTransition {
                from: current_status,
                to: new_status,
            });
        }

        Ok(())
    }

    /// All valid next statuses for a given current status.
    pub fn valid_transitions(&self, current_status: AppointmentStatus) -> Vec<AppointmentStatus> {
        match current_status {
            AppointmentStatus::Pending => vec![
                AppointmentStatus::Confirmed,
                AppointmentStatus::Cancelled,
            ],
            AppointmentStatus::Confirmed => vec![
                AppointmentStatus::CheckedIn,
                AppointmentStatus::Cancelled,
                AppointmentStatus::NoShow,
            ],
            AppointmentStatus::CheckedIn => vec![
                AppointmentStatus::InProgress,
            ],
            AppointmentStatus::InProgress => vec![
                AppointmentStatus::Completed,
            ],
            // Terminal states - no transitions allowed
            AppointmentStatus::Completed => vec![],
            AppointmentStatus::Cancelled => vec![],
            AppointmentStatus::NoShow => vec![],
        }
    }

    /// Whether ending an appointment in `current_status` frees its slot.
    /// Cancelling before check-in returns capacity to the pool; once
    /// clinical work has begun, cancellation is a data correction and the
    /// slot stays closed.
    pub fn frees_slot_capacity(&self, current_status: AppointmentStatus) -> bool {
        matches!(
            current_status,
            AppointmentStatus::Pending | AppointmentStatus::Confirmed
        )
    }
}

impl Default for AppointmentLifecycleService {
    fn default() -> Self {
        Self::new()
    }
}
