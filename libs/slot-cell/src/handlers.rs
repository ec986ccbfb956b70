// libs/slot-cell/src/handlers.rs
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

use crate::models::{HoldSlotRequest, ReleaseSlotRequest, SlotSearchQuery, SlotError};
use crate::services::allocator::SlotAllocatorService;

fn allocator(state: &AppState) -> SlotAllocatorService {
    SlotAllocatorService::with_client(Arc::clone(&state.supabase), state.config.hold_ttl_seconds)
}

/// Place a 2-minute hold on the unique (doctor, date, start_time) slot.
#[axum::debug_handler]
pub async fn hold_slot(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<HoldSlotRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();

    let grant = allocator(&state)
        .hold_by_schedule(request.doctor_id, request.date, request.start_time, request.patient_id, token)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "slot_id": grant.slot_id,
        "expires_at": grant.expires_at,
        "countdown_seconds": grant.countdown_seconds,
    })))
}

/// Cancel a hold. Always succeeds: releasing a hold you don't own, or one
/// that already expired, signals "nothing to undo", not an error.
#[axum::debug_handler]
pub async fn release_slot(
    State(state): State<AppState>,
    Path(slot_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<ReleaseSlotRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();

    allocator(&state)
        .release(slot_id, request.patient_id, token)
        .await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "message": "Slot released"
    })))
}

#[axum::debug_handler]
pub async fn list_slots(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Query(query): Query<SlotSearchQuery>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();

    let slots = allocator(&state).list_slots(query, token).await.map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "count": slots.len(),
        "slots": slots,
    })))
}

pub fn map_slot_error(e: SlotError) -> AppError {
    match e {
        SlotError::NotFound => AppError::NotFound("Slot not found".to_string()),
        SlotError::AlreadyHeld => AppError::Conflict("Slot is already held".to_string()),
        SlotError::AlreadyBooked => AppError::Conflict("Slot is already booked".to_string()),
        SlotError::HeldByOther => AppError::Conflict("Slot is held by another patient".to_string()),
        SlotError::HoldExpired => AppError::Conflict("Hold expired before booking completed".to_string()),
        SlotError::InvalidTransition(from, to) => {
            AppError::InvalidTransition(format!("Slot cannot change from {} to {}", from, to))
        }
        SlotError::ValidationError(msg) => AppError::ValidationError(msg),
        SlotError::DatabaseError(msg) => AppError::Database(msg),
    }
}
