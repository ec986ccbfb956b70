// libs/slot-cell/src/services/reclaimer.rs
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::models::{SlotStatus, SlotError};

/// Safety net for abandoned holds. The store's native expiry facility is the
/// fast path; this sweep guarantees a slot never stays in hold past its
/// deadline when that facility is delayed or absent in a deployment target.
/// Each reclaim is an independent conditional write, so concurrent sweeps
/// (or a sweep racing live traffic) are harmless.
pub struct HoldExpiryReclaimer {
    supabase: Arc<SupabaseClient>,
    interval: Duration,
}

impl HoldExpiryReclaimer {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: Arc::new(SupabaseClient::new(config)),
            interval: Duration::from_secs(config.reclaimer_interval_seconds),
        }
    }

    pub fn with_client(supabase: Arc<SupabaseClient>, interval: Duration) -> Self {
        Self { supabase, interval }
    }

    /// Background loop spawned by the api binary. A failed pass is logged and
    /// the next tick simply tries again.
    pub async fn run(self) {
        info!("Hold expiry reclaimer started (interval {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(0) => debug!("Reclaimer sweep found no expired holds"),
                Ok(count) => info!("Reclaimer returned {} expired holds to available", count),
                Err(e) => warn!("Reclaimer sweep failed, will retry next tick: {}", e),
            }
        }
    }

    /// Revert every slot whose hold outlived its deadline back to available.
    /// The status+deadline filter makes this safe to run concurrently with
    /// commit(): a hold that is being converted to booked no longer matches.
    pub async fn sweep_once(&self) -> Result<u32, SlotError> {
        let now = Utc::now();
        let filters = format!(
            "status=eq.hold&hold_expires_at=lt.{}",
            urlencoding::encode(&now.to_rfc3339()),
        );
        let changes = json!({
            "status": SlotStatus::Available,
            "held_by": null,
            "hold_expires_at": null,
            "updated_at": now.to_rfc3339(),
        });

        let rows = self.supabase
            .conditional_update("time_slots", &filters, changes, None)
            .await
            .map_err(|e| SlotError::DatabaseError(e.to_string()))?;

        Ok(rows.len() as u32)
    }
}
