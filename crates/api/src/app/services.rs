use std::sync::Arc;

use sizeflow_infra::{Config, SqliteStore, Store, StoreError};

/// Shared handles for request handlers.
pub struct AppServices {
    pub store: Arc<dyn Store>,
}

impl AppServices {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

/// Connect and migrate the configured database.
pub async fn build_services(config: &Config) -> Result<AppServices, StoreError> {
    let store = SqliteStore::connect(&config.database_url).await?;
    store.migrate().await?;
    Ok(AppServices::new(Arc::new(store)))
}
