pub mod alerts;
pub mod api;
pub mod config;
pub mod db;
pub mod dispatch_log;
pub mod eligibility;
pub mod error;
pub mod executor;
pub mod health;
pub mod model;
pub mod push;
pub mod ratelimit;
pub mod scheduler;
pub mod triggers;

use anyhow::Result;
use std::sync::Arc;

use crate::alerts::AlertNotifier;
use crate::config::Config;
use crate::db::Pool;
use crate::eligibility::EligibilityEvaluator;
use crate::executor::TriggerExecutor;
use crate::push::FcmClient;
use crate::ratelimit::RateLimiter;

/// Client handles built once by an entry point and passed down explicitly.
#[derive(Clone)]
pub struct Services {
    pub pool: Pool,
    pub executor: Arc<TriggerExecutor>,
    pub alerts: Option<Arc<AlertNotifier>>,
}

impl Services {
    /// Open the database, run migrations and construct every collaborator from config.
    pub async fn connect(cfg: &Config) -> Result<Self> {
        let pool = db::init_pool(&cfg.database_url()).await?;
        db::run_migrations(&pool).await?;

        let push = FcmClient::from_config(cfg)?;
        let limiter = RateLimiter::from_config(cfg)?;
        let evaluator = EligibilityEvaluator::new(pool.clone(), cfg.campaigns.clone());
        let executor = TriggerExecutor::new(pool.clone(), evaluator, limiter, Arc::new(push));
        let alerts = AlertNotifier::from_config(cfg)?.map(Arc::new);

        Ok(Self {
            pool,
            executor: Arc::new(executor),
            alerts,
        })
    }
}
