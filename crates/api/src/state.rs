//! Application state

use std::sync::Arc;

use plume_credits::CreditsService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub credits: Arc<CreditsService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        // Webhook secret and price catalog come from the environment; the
        // webhook route cannot operate without them, so fail startup early.
        let credits = CreditsService::from_env(pool.clone())?;
        tracing::info!("Credits service initialized");

        Ok(Self {
            pool,
            config,
            credits: Arc::new(credits),
        })
    }
}
