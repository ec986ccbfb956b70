pub mod supabase;

pub use supabase::SupabaseClient;

use std::sync::Arc;

use shared_config::AppConfig;

/// Router state shared by every cell: the configuration plus one storage
/// client for the whole process, so reqwest's connection pool is reused
/// across requests instead of rebuilt per handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub supabase: Arc<SupabaseClient>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let supabase = Arc::new(SupabaseClient::new(&config));
        Self {
            config: Arc::new(config),
            supabase,
        }
    }
}
