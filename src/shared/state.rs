use std::sync::Arc;

use crate::config::AppConfig;
use crate::shared::utils::DbPool;
use crate::storage::BlobStorage;

/// Process-wide handles shared by the API, dispatcher and delivery tiers.
/// Everything bot-scoped is owned by the bot's controller instead.
pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub storage: Arc<dyn BlobStorage>,
    pub cache: Option<redis::Client>,
}

impl AppState {
    pub fn new(
        conn: DbPool,
        config: AppConfig,
        storage: Arc<dyn BlobStorage>,
    ) -> Arc<Self> {
        let cache = redis::Client::open(config.cache.redis_url.clone()).ok();
        Arc::new(Self {
            conn,
            config,
            storage,
            cache,
        })
    }
}
