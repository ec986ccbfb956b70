use std::env;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    /// Fallback doctor used when a slot or appointment references a doctor
    /// that no longer exists. Reassignments to it are always logged.
    pub default_doctor_id: Uuid,
    pub hold_ttl_seconds: i64,
    pub reclaimer_interval_seconds: u64,
    pub reconciler_interval_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            default_doctor_id: env::var("DEFAULT_DOCTOR_ID")
                .ok()
                .and_then(|v| Uuid::parse_str(&v).ok())
                .unwrap_or_else(|| {
                    warn!("DEFAULT_DOCTOR_ID not set or invalid, using nil doctor id");
                    Uuid::nil()
                }),
            hold_ttl_seconds: parse_env_or("HOLD_TTL_SECONDS", 120),
            reclaimer_interval_seconds: parse_env_or("RECLAIMER_INTERVAL_SECONDS", 60),
            reconciler_interval_seconds: parse_env_or("RECONCILER_INTERVAL_SECONDS", 3600),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }

    pub fn has_default_doctor(&self) -> bool {
        !self.default_doctor_id.is_nil()
    }
}

fn parse_env_or<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} is not a valid number, using default", key);
            default
        }),
        Err(_) => default,
    }
}
