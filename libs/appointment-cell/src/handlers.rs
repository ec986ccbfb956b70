// libs/appointment-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_database::AppState;
use shared_models::error::AppError;
use slot_cell::handlers::map_slot_error;

use crate::models::{
    AppointmentError, BookAppointmentRequest, ConfirmAppointmentRequest,
    TransitionAppointmentRequest, CancelAppointmentRequest, AppointmentSearchQuery,
};
use crate::services::booking::AppointmentBookingService;

fn booking_service(state: &AppState) -> AppointmentBookingService {
    AppointmentBookingService::with_client(Arc::clone(&state.supabase), &state.config)
}

/// Book a held (or still available) slot. On success the slot is booked and
/// the appointment is pending in one client-visible step.
#[axum::debug_handler]
pub async fn book_appointment(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<BookAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let booking = booking_service(&state);

    let appointment = booking.book(request, token).await.map_err(map_appointment_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
    })))
}

#[axum::debug_handler]
pub async fn confirm_appointment(
    State(state): State<AppState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<ConfirmAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let booking = booking_service(&state);

    let appointment = booking
        .confirm(appointment_id, request.confirmer_id, token)
        .await
        .map_err(map_appointment_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
    })))
}

/// Generic lifecycle transition (check-in, start, complete, no-show, cancel).
#[axum::debug_handler]
pub async fn transition_appointment(
    State(state): State<AppState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<TransitionAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let booking = booking_service(&state);

    let appointment = booking
        .transition(appointment_id, request.to_status, request.actor_id, request.reason, token)
        .await
        .map_err(map_appointment_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
    })))
}

#[axum::debug_handler]
pub async fn cancel_appointment(
    State(state): State<AppState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<CancelAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let booking = booking_service(&state);

    let appointment = booking
        .cancel(appointment_id, request, token)
        .await
        .map_err(map_appointment_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
    })))
}

#[axum::debug_handler]
pub async fn get_appointment(
    State(state): State<AppState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let booking = booking_service(&state);

    let appointment = booking
        .get_appointment(appointment_id, token)
        .await
        .map_err(map_appointment_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
    })))
}

#[axum::debug_handler]
pub async fn search_appointments(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Query(query): Query<AppointmentSearchQuery>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let booking = booking_service(&state);

    let appointments = booking
        .search_appointments(query, token)
        .await
        .map_err(map_appointment_error)?;

    Ok(Json(json!({
        "success": true,
        "count": appointments.len(),
        "appointments": appointments,
    })))
}

pub(crate) fn map_appointment_error(e: AppointmentError) -> AppError {
    match e {
        AppointmentError::NotFound => AppError::NotFound("Appointment not found".to_string()),
        AppointmentError::InvalidTransition { from, to } => {
            AppError::InvalidTransition(format!("Appointment cannot change from {} to {}", from, to))
        }
        AppointmentError::AlreadyConfirmed => {
            AppError::Conflict("Appointment is already confirmed".to_string())
        }
        AppointmentError::ConcurrentModification => {
            AppError::Conflict("Appointment was modified concurrently, please retry".to_string())
        }
        AppointmentError::Slot(e) => map_slot_error(e),
        AppointmentError::ValidationError(msg) => AppError::ValidationError(msg),
        AppointmentError::DatabaseError(msg) => AppError::Database(msg),
    }
}
